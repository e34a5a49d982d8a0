//! Controller input pipeline: raw event source, normalization, buffering.
//!
//! Raw device events enter through an [`InputSource`], are folded into a
//! bounded analog snapshot by the [`InputNormalizer`] and handed to the
//! consumer loop through the thread-safe [`InputBuffer`].

pub mod buffer;
pub mod normalizer;
pub mod source;

pub use buffer::InputBuffer;
pub use normalizer::{AnalogFrame, ButtonSnapshot, InputNormalizer, MovementTier};
pub use source::{AxisId, ButtonId, GilrsSource, InputSource, RawInputEvent, SourceError};
