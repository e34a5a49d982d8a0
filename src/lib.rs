//! Live gamepad control for XY plotters and similar G-code machines.
//!
//! Translates analog controller input into bounded, acceleration-limited
//! absolute moves. The pipeline is a producer/consumer pair: the producer
//! polls the gamepad and pushes normalized analog frames into a shared
//! buffer, the consumer drains it on a fixed tick, integrates an
//! acceleration profile per axis and emits rate-limited command lines.

pub mod config;
pub mod gcode;
pub mod input;
pub mod motion;
pub mod session;
