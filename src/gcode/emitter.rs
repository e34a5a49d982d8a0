//! Command emitter: formats commands and paces dispatch to the machine sink.
//!
//! Move batches issued faster than the minimum spacing are not queued; a new
//! batch replaces the pending one, so a burst collapses to its latest state
//! and the receiving device's command buffer is never flooded. Control
//! commands (home, emergency stop, mode, pen height) bypass the limiter.

use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::gcode::{ControlCommand, MotionCommand};

/// Errors surfaced by a machine command sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to deliver commands to machine: {0}")]
    Delivery(String),
}

/// Errors raised while emitting commands.
#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
}

/// External machine-command sink: accepts newline-terminated ASCII lines.
pub trait CommandSink: Send {
    fn send(&mut self, lines: Vec<String>) -> Result<(), SinkError>;
}

/// Sink backed by a tokio channel, one line per message.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<String>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<String>) -> Self {
        Self { sender }
    }
}

impl CommandSink for ChannelSink {
    fn send(&mut self, lines: Vec<String>) -> Result<(), SinkError> {
        for line in lines {
            self.sender
                .try_send(line)
                .map_err(|e| SinkError::Delivery(e.to_string()))?;
        }
        Ok(())
    }
}

/// Minimum-interval gate between dispatches.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_interval: Duration,
    last_dispatch: Option<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval: Duration::from_millis(min_interval_ms),
            last_dispatch: None,
        }
    }

    pub fn set_interval(&mut self, min_interval_ms: u64) {
        self.min_interval = Duration::from_millis(min_interval_ms);
    }

    /// True when enough time has passed since the last accepted dispatch;
    /// accepting advances the window.
    pub fn should_process(&mut self) -> bool {
        let now = Instant::now();
        match self.last_dispatch {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_dispatch = Some(now);
                true
            }
        }
    }
}

/// Formats and paces command flow into the sink.
pub struct CommandEmitter {
    sink: Box<dyn CommandSink>,
    limiter: RateLimiter,
    /// Latest undispatched move batch; superseded by newer batches.
    pending: Option<Vec<MotionCommand>>,
}

impl CommandEmitter {
    pub fn new(sink: Box<dyn CommandSink>, min_command_spacing_ms: u64) -> Self {
        Self {
            sink,
            limiter: RateLimiter::new(min_command_spacing_ms),
            pending: None,
        }
    }

    pub fn set_spacing(&mut self, min_command_spacing_ms: u64) {
        self.limiter.set_interval(min_command_spacing_ms);
    }

    /// Sends the one-time session preamble: absolute extrusion mode.
    pub fn begin_session(&mut self) -> Result<(), EmitterError> {
        self.control(ControlCommand::AbsoluteExtrusion)
    }

    /// Dispatches a control command immediately, bypassing the rate limiter.
    pub fn control(&mut self, command: ControlCommand) -> Result<(), EmitterError> {
        let line = terminated(command.format());
        debug!("Dispatching control command: {}", line.trim_end());
        self.sink.send(vec![line])?;
        Ok(())
    }

    /// Submits one tick's move batch. Inside the spacing window the batch
    /// replaces any pending batch instead of queuing; outside it, it is
    /// dispatched at once.
    pub fn submit(&mut self, moves: Vec<MotionCommand>) -> Result<(), EmitterError> {
        if moves.is_empty() {
            return self.flush();
        }
        if self.limiter.should_process() {
            if self.pending.take().is_some() {
                debug!("Superseding pending move batch with newer one");
            }
            self.dispatch(moves)
        } else {
            if self.pending.is_some() {
                debug!("Dropping superseded move batch inside spacing window");
            }
            self.pending = Some(moves);
            Ok(())
        }
    }

    /// Retries the pending batch if the spacing window has elapsed. Called
    /// on ticks that produced no new motion.
    pub fn flush(&mut self) -> Result<(), EmitterError> {
        if self.pending.is_none() {
            return Ok(());
        }
        if self.limiter.should_process() {
            if let Some(moves) = self.pending.take() {
                return self.dispatch(moves);
            }
        }
        Ok(())
    }

    /// Drops any pending batch without dispatching. Used at deactivation so
    /// nothing leaves the emitter after shutdown is requested.
    pub fn reset(&mut self) {
        if self.pending.take().is_some() {
            warn!("Discarding pending move batch at emitter reset");
        }
    }

    fn dispatch(&mut self, moves: Vec<MotionCommand>) -> Result<(), EmitterError> {
        let lines: Vec<String> = moves
            .iter()
            .map(|command| terminated(command.format()))
            .collect();
        debug!("Dispatching {} move line(s)", lines.len());
        self.sink.send(lines)?;
        Ok(())
    }
}

fn terminated(mut line: String) -> String {
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingSink {
        lines: Arc<Mutex<Vec<String>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl RecordingSink {
        fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }

        fn set_failing(&self, failing: bool) {
            *self.fail.lock().unwrap() = failing;
        }
    }

    impl CommandSink for RecordingSink {
        fn send(&mut self, lines: Vec<String>) -> Result<(), SinkError> {
            if *self.fail.lock().unwrap() {
                return Err(SinkError::Delivery("sink offline".to_string()));
            }
            self.lines.lock().unwrap().extend(lines);
            Ok(())
        }
    }

    fn a_move(x: f64) -> MotionCommand {
        MotionCommand {
            x,
            y: 0.0,
            e: None,
            feedrate: 1500.0,
        }
    }

    #[test]
    fn lines_are_newline_terminated() {
        let sink = RecordingSink::default();
        let mut emitter = CommandEmitter::new(Box::new(sink.clone()), 0);
        emitter.begin_session().unwrap();
        emitter.submit(vec![a_move(1.0)]).unwrap();
        let lines = sink.lines();
        assert_eq!(lines[0], "M82\n");
        assert!(lines[1].starts_with("G1 ") && lines[1].ends_with('\n'));
    }

    #[test]
    fn zero_spacing_dispatches_every_batch() {
        let sink = RecordingSink::default();
        let mut emitter = CommandEmitter::new(Box::new(sink.clone()), 0);
        for i in 0..5 {
            emitter.submit(vec![a_move(i as f64)]).unwrap();
        }
        assert_eq!(sink.lines().len(), 5);
    }

    #[test]
    fn burst_inside_window_collapses_to_latest_batch() {
        let sink = RecordingSink::default();
        let mut emitter = CommandEmitter::new(Box::new(sink.clone()), 30);

        emitter.submit(vec![a_move(1.0)]).unwrap(); // dispatched
        emitter.submit(vec![a_move(2.0)]).unwrap(); // pending
        emitter.submit(vec![a_move(3.0)]).unwrap(); // supersedes 2.0
        assert_eq!(sink.lines().len(), 1);

        std::thread::sleep(Duration::from_millis(40));
        emitter.flush().unwrap();
        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("X3.000"));
    }

    #[test]
    fn control_commands_bypass_the_limiter() {
        let sink = RecordingSink::default();
        let mut emitter = CommandEmitter::new(Box::new(sink.clone()), 1000);
        emitter.submit(vec![a_move(1.0)]).unwrap();
        emitter.control(ControlCommand::EmergencyStop).unwrap();
        emitter.control(ControlCommand::Home).unwrap();
        let lines = sink.lines();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "M410\n");
        assert_eq!(lines[2], "G28 X Y\n");
    }

    #[test]
    fn reset_drops_pending_batch() {
        let sink = RecordingSink::default();
        let mut emitter = CommandEmitter::new(Box::new(sink.clone()), 1000);
        emitter.submit(vec![a_move(1.0)]).unwrap();
        emitter.submit(vec![a_move(2.0)]).unwrap(); // pending
        emitter.reset();
        std::thread::sleep(Duration::from_millis(1));
        emitter.flush().unwrap();
        assert_eq!(sink.lines().len(), 1);
    }

    #[test]
    fn sink_failures_surface_as_emitter_errors() {
        let sink = RecordingSink::default();
        sink.set_failing(true);
        let mut emitter = CommandEmitter::new(Box::new(sink.clone()), 0);
        assert!(emitter.submit(vec![a_move(1.0)]).is_err());
    }
}
