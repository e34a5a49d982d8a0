//! Minimal machine-command vocabulary and the rate-limited emitter.
//!
//! The core only ever speaks four commands: absolute linear moves, homing,
//! emergency stop and the absolute-extrusion mode switch sent once at session
//! start. Everything is formatted as newline-terminated ASCII lines for the
//! external machine sink.

pub mod emitter;

pub use emitter::{ChannelSink, CommandEmitter, CommandSink, EmitterError, SinkError};

/// One absolute linear move. Ephemeral: created per emission, formatted,
/// then discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionCommand {
    /// Target X in mm.
    pub x: f64,
    /// Target Y in mm.
    pub y: f64,
    /// Absolute E position in mm, included only when the tick produced a
    /// nonzero extrusion delta.
    pub e: Option<f64>,
    /// Feedrate in mm/min.
    pub feedrate: f64,
}

impl MotionCommand {
    pub fn format(&self) -> String {
        match self.e {
            Some(e) => format!(
                "G1 X{:.3} Y{:.3} E{:.4} F{:.0}",
                self.x, self.y, e, self.feedrate
            ),
            None => format!("G1 X{:.3} Y{:.3} F{:.0}", self.x, self.y, self.feedrate),
        }
    }
}

/// Non-motion commands. These bypass the emitter's rate limiter.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// Home the X and Y axes.
    Home,
    /// Immediate stop of all queued machine moves.
    EmergencyStop,
    /// Switch the machine to absolute extrusion mode.
    AbsoluteExtrusion,
    /// Move the pen/nozzle to a drawing or travel height.
    PenHeight { z: f64, feedrate: f64 },
}

impl ControlCommand {
    pub fn format(&self) -> String {
        match self {
            ControlCommand::Home => "G28 X Y".to_string(),
            ControlCommand::EmergencyStop => "M410".to_string(),
            ControlCommand::AbsoluteExtrusion => "M82".to_string(),
            ControlCommand::PenHeight { z, feedrate } => {
                format!("G1 Z{:.3} F{:.0}", z, feedrate)
            }
        }
    }
}
