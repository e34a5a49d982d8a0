//! Motion coordination core: per-axis acceleration physics, extrusion
//! control and the tick-driven movement coordinator.

pub mod coordinator;
pub mod extrusion;
pub mod profile;

pub use coordinator::{
    CoordinatorError, FrameBatch, MotionSnapshot, MovementCoordinator, TickPlan, Waiting,
};
pub use extrusion::ExtrusionController;
pub use profile::AxisProfile;
