//! Movement coordinator: the consumer loop's per-tick decision unit.
//!
//! Implemented as a statum state machine cycling `Waiting -> Planning ->
//! Dispatching -> Waiting` once per tick:
//!
//! ```text
//! Waiting ──drain_input──► Planning(FrameBatch) ──plan──► Dispatching(TickPlan)
//!    ▲                                                          │
//!    └───────────────────────── dispatch ──────────────────────┘
//! ```
//!
//! Planning reduces the drained frames to one velocity intent, steps both
//! axis profiles by the measured wall-clock delta, clamps the candidate
//! position to the work envelope and subdivides long displacements into
//! bounded chunks. Position commits optimistically before dispatch: a failed
//! dispatch does not imply the head never moved, and replaying a stale
//! position would desync the machine.

use statum::{machine, state};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{MotionSettings, PenSettings, ReductionPolicy, Settings, WorkEnvelope};
use crate::gcode::{CommandEmitter, ControlCommand, EmitterError, MotionCommand};
use crate::input::{AnalogFrame, ButtonSnapshot, InputBuffer};
use crate::motion::extrusion::ExtrusionController;
use crate::motion::profile::AxisProfile;

/// Head position in mm, clamped to the work envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Read-only view of consumer-owned state, published once per tick so
/// external readers never touch the live fields.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotionSnapshot {
    pub x: f64,
    pub y: f64,
    pub e: f64,
    pub drawing: bool,
}

/// Frames drained from the input buffer for one tick.
#[derive(Debug, Clone, Default)]
pub struct FrameBatch {
    pub frames: Vec<AnalogFrame>,
}

/// Commands planned for one tick, controls ahead of moves.
#[derive(Debug, Clone, Default)]
pub struct TickPlan {
    pub controls: Vec<ControlCommand>,
    pub moves: Vec<MotionCommand>,
}

/// Fatal coordinator conditions reported through the session status.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Aborted after {0} consecutive dispatch failures")]
    TooManyFailures(u32),
}

#[state]
#[derive(Debug, Clone)]
pub enum CoordinatorState {
    Waiting,
    Planning(FrameBatch),
    Dispatching(TickPlan),
}

#[machine]
pub struct MovementCoordinator<S: CoordinatorState> {
    buffer: Arc<InputBuffer>,
    emitter: CommandEmitter,
    motion: MotionSettings,
    pen: PenSettings,
    envelope: WorkEnvelope,
    x_profile: AxisProfile,
    y_profile: AxisProfile,
    extrusion: ExtrusionController,
    position: Position,

    // Latest-frame blending memory across ticks.
    blended_x: f32,
    blended_y: f32,

    // Previous tick's button state for edge triggering.
    prev_buttons: ButtonSnapshot,
    drawing: bool,
    consecutive_errors: u32,
}

// Velocity intent reduced from one tick's frame batch.
struct VelocityIntent {
    x: f32,
    y: f32,
    extrude: f32,
    retract: f32,
}

impl<S: CoordinatorState> MovementCoordinator<S> {
    pub fn position(&self) -> Position {
        self.position
    }

    pub fn drawing(&self) -> bool {
        self.drawing
    }

    pub fn x_speed(&self) -> f64 {
        self.x_profile.current_speed()
    }

    pub fn y_speed(&self) -> f64 {
        self.y_profile.current_speed()
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// True once the consecutive failure limit is reached; the session loop
    /// terminates fatally instead of retrying forever.
    pub fn failure_limit_exceeded(&self) -> bool {
        self.consecutive_errors >= self.motion.max_consecutive_errors
    }

    pub fn snapshot(&self) -> MotionSnapshot {
        MotionSnapshot {
            x: self.position.x,
            y: self.position.y,
            e: self.extrusion.current_e(),
            drawing: self.drawing,
        }
    }

    /// Applies a validated settings object. Never called with partially
    /// valid data; `Settings::validate` gates every update path.
    pub fn update_settings(&mut self, settings: &Settings) {
        let max_speed =
            settings.motion.base_speed / 60.0 * settings.curve.max_multiplier as f64;
        self.x_profile
            .set_limits(settings.motion.acceleration, max_speed);
        self.y_profile
            .set_limits(settings.motion.acceleration, max_speed);
        self.extrusion.update_settings(settings.extrusion.clone());
        self.emitter
            .set_spacing(settings.emitter.min_command_spacing_ms);
        self.motion = settings.motion.clone();
        self.pen = settings.pen.clone();
        debug!("Coordinator settings updated");
    }

    /// Replaces the work envelope, pulling the current position back inside
    /// the new bounds if needed.
    pub fn set_envelope(&mut self, envelope: WorkEnvelope) {
        self.envelope = envelope;
        self.position.x = self.position.x.clamp(0.0, envelope.max_x);
        self.position.y = self.position.y.clamp(0.0, envelope.max_y);
        info!(
            "Work envelope updated: {} x {} mm",
            envelope.max_x, envelope.max_y
        );
    }

    /// Zeroes all session state so a later activation starts clean. No
    /// commands leave the emitter afterwards.
    pub fn reset(&mut self) {
        self.position = Position::default();
        self.x_profile.reset();
        self.y_profile.reset();
        self.extrusion.reset();
        self.emitter.reset();
        self.blended_x = 0.0;
        self.blended_y = 0.0;
        self.prev_buttons = ButtonSnapshot::default();
        self.drawing = false;
        self.consecutive_errors = 0;
        self.buffer.clear();
    }
}

impl MovementCoordinator<Waiting> {
    pub fn create(
        buffer: Arc<InputBuffer>,
        emitter: CommandEmitter,
        settings: &Settings,
        envelope: WorkEnvelope,
    ) -> Self {
        let max_speed =
            settings.motion.base_speed / 60.0 * settings.curve.max_multiplier as f64;
        info!(
            "Creating movement coordinator: envelope {} x {} mm, max speed {:.1} mm/s",
            envelope.max_x, envelope.max_y, max_speed
        );

        Self::new(
            buffer,
            emitter,
            settings.motion.clone(),
            settings.pen.clone(),
            envelope,
            AxisProfile::new(settings.motion.acceleration, max_speed),
            AxisProfile::new(settings.motion.acceleration, max_speed),
            ExtrusionController::new(settings.extrusion.clone()),
            Position::default(),
            0.0,   // blended_x
            0.0,   // blended_y
            ButtonSnapshot::default(),
            false, // drawing
            0,     // consecutive_errors
        )
    }

    /// Atomically takes everything from the input buffer and moves to the
    /// planning phase.
    pub fn drain_input(self) -> MovementCoordinator<Planning> {
        let frames = self.buffer.drain();
        if !frames.is_empty() {
            debug!("Drained {} frame(s) for this tick", frames.len());
        }
        self.transition_with(FrameBatch { frames })
    }
}

impl MovementCoordinator<Planning> {
    /// Runs the per-tick algorithm over the drained batch. `time_delta` is
    /// the measured wall-clock seconds since the previous tick, not the
    /// nominal interval, so scheduler jitter does not distort distances.
    pub fn plan(mut self, time_delta: f64) -> MovementCoordinator<Dispatching> {
        let batch = self.get_state_data().cloned().unwrap_or_default();
        let mut plan = TickPlan::default();

        // An empty batch skips the tick entirely; speed state persists.
        if !batch.frames.is_empty() {
            self.plan_tick(&batch.frames, time_delta, &mut plan);
        }

        self.transition_with(plan)
    }

    fn plan_tick(&mut self, frames: &[AnalogFrame], time_delta: f64, plan: &mut TickPlan) {
        let buttons = combined_buttons(frames);
        let skip_motion = self.handle_buttons(&buttons, plan);
        self.prev_buttons = buttons;
        if skip_motion {
            return;
        }

        let intent = self.reduce(frames);

        // The frames already carry the tiered signed speed fraction; no
        // re-tiering here, only scaling to physical units.
        let base_mm_s = self.motion.base_speed / 60.0;
        self.x_profile.set_target_speed(intent.x as f64 * base_mm_s);
        self.y_profile.set_target_speed(intent.y as f64 * base_mm_s);

        let dx = self.x_profile.step(time_delta);
        let dy = self.y_profile.step(time_delta);

        let candidate = Position {
            x: (self.position.x + dx).clamp(0.0, self.envelope.max_x),
            y: (self.position.y + dy).clamp(0.0, self.envelope.max_y),
        };
        let moved_x = candidate.x - self.position.x;
        let moved_y = candidate.y - self.position.y;
        let distance = (moved_x * moved_x + moved_y * moved_y).sqrt();

        let e_delta = self.extrusion.update(intent.extrude, intent.retract);

        if distance >= self.motion.min_movement && distance > 0.0 {
            let feedrate = if time_delta > 0.0 {
                (distance / time_delta) * 60.0
            } else {
                self.motion.base_speed
            };
            self.push_chunked_moves(plan, candidate, e_delta, feedrate);
            // Optimistic commit: position updates before dispatch.
            self.position = candidate;
        } else if e_delta != 0.0 {
            // No travel this tick, but filament still moves.
            plan.moves.push(MotionCommand {
                x: self.position.x,
                y: self.position.y,
                e: Some(self.extrusion.current_e()),
                feedrate: self.extrusion.feedrate_mm_min(),
            });
        }
    }

    /// Subdivides the straight segment to the candidate position into
    /// equal sub-moves no longer than `chunk_size`, all at one feedrate.
    fn push_chunked_moves(
        &mut self,
        plan: &mut TickPlan,
        candidate: Position,
        e_delta: f64,
        feedrate: f64,
    ) {
        let moved_x = candidate.x - self.position.x;
        let moved_y = candidate.y - self.position.y;
        let distance = (moved_x * moved_x + moved_y * moved_y).sqrt();
        let chunks = (distance / self.motion.chunk_size).ceil().max(1.0) as usize;
        let e_start = self.extrusion.current_e() - e_delta;

        for i in 1..=chunks {
            let t = i as f64 / chunks as f64;
            let e = if e_delta != 0.0 {
                Some(e_start + e_delta * t)
            } else {
                None
            };
            plan.moves.push(MotionCommand {
                x: self.position.x + moved_x * t,
                y: self.position.y + moved_y * t,
                e,
                feedrate,
            });
        }
    }

    /// Edge-triggered button actions. Returns true when the tick's motion
    /// planning must be skipped (homing or emergency stop fired).
    fn handle_buttons(&mut self, buttons: &ButtonSnapshot, plan: &mut TickPlan) -> bool {
        let mut skip_motion = false;

        if buttons.emergency_stop && !self.prev_buttons.emergency_stop {
            warn!("Emergency stop requested");
            // A batch parked in the emitter's spacing window carries
            // pre-stop coordinates; it must never reach the machine.
            self.emitter.reset();
            plan.controls.push(ControlCommand::EmergencyStop);
            self.x_profile.halt();
            self.y_profile.halt();
            skip_motion = true;
        }

        if buttons.home && !self.prev_buttons.home {
            info!("Homing XY axes");
            // Same as emergency stop: a parked pre-home batch would drive
            // the machine away from the origin the coordinator now tracks.
            self.emitter.reset();
            plan.controls.push(ControlCommand::Home);
            self.position = Position::default();
            self.x_profile.halt();
            self.y_profile.halt();
            skip_motion = true;
        }

        if buttons.pen_toggle && !self.prev_buttons.pen_toggle {
            self.drawing = !self.drawing;
            let z = if self.drawing {
                self.pen.z_drawing
            } else {
                self.pen.z_travel
            };
            info!(
                "Toggling pen: {} (Z{:.3})",
                if self.drawing { "drawing" } else { "travel" },
                z
            );
            plan.controls.push(ControlCommand::PenHeight {
                z,
                feedrate: self.pen.z_feedrate,
            });
        }

        self.extrusion
            .adjust_feedrate(buttons.feedrate_up, buttons.feedrate_down, Instant::now());

        skip_motion
    }

    /// Reduces the batch to one velocity intent per the configured policy.
    fn reduce(&mut self, frames: &[AnalogFrame]) -> VelocityIntent {
        match self.motion.reduction {
            ReductionPolicy::Average => {
                let n = frames.len() as f32;
                let mut intent = VelocityIntent {
                    x: 0.0,
                    y: 0.0,
                    extrude: 0.0,
                    retract: 0.0,
                };
                for frame in frames {
                    intent.x += frame.x_axis;
                    intent.y += frame.y_axis;
                    intent.extrude += frame.extrusion_pressure;
                    intent.retract += frame.retraction_pressure;
                }
                intent.x /= n;
                intent.y /= n;
                intent.extrude /= n;
                intent.retract /= n;
                self.blended_x = intent.x;
                self.blended_y = intent.y;
                intent
            }
            ReductionPolicy::LatestBlended => {
                // frames is nonempty here; plan_tick skips empty batches.
                let latest = &frames[frames.len() - 1];
                let w = self.motion.blend_factor;
                self.blended_x = w * self.blended_x + (1.0 - w) * latest.x_axis;
                self.blended_y = w * self.blended_y + (1.0 - w) * latest.y_axis;
                VelocityIntent {
                    x: self.blended_x,
                    y: self.blended_y,
                    extrude: latest.extrusion_pressure,
                    retract: latest.retraction_pressure,
                }
            }
        }
    }
}

impl MovementCoordinator<Dispatching> {
    /// Hands the tick's commands to the emitter, controls first. Dispatch
    /// errors abort the remainder of the tick and bump the consecutive
    /// failure counter; any successful tick resets it.
    pub fn dispatch(mut self) -> MovementCoordinator<Waiting> {
        let plan = self.get_state_data().cloned().unwrap_or_default();

        match self.try_dispatch(&plan) {
            Ok(()) => {
                self.consecutive_errors = 0;
            }
            Err(e) => {
                self.consecutive_errors += 1;
                error!(
                    "Tick dispatch failed ({} consecutive): {}",
                    self.consecutive_errors, e
                );
            }
        }

        self.transition()
    }

    fn try_dispatch(&mut self, plan: &TickPlan) -> Result<(), EmitterError> {
        for control in &plan.controls {
            self.emitter.control(control.clone())?;
        }
        self.emitter.submit(plan.moves.clone())
    }
}

// Button state for the tick: pressed if any frame in the batch saw it
// pressed, so short presses inside one window are not lost.
fn combined_buttons(frames: &[AnalogFrame]) -> ButtonSnapshot {
    let mut combined = ButtonSnapshot::default();
    for frame in frames {
        combined.pen_toggle |= frame.buttons.pen_toggle;
        combined.home |= frame.buttons.home;
        combined.emergency_stop |= frame.buttons.emergency_stop;
        combined.feedrate_up |= frame.buttons.feedrate_up;
        combined.feedrate_down |= frame.buttons.feedrate_down;
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcode::SinkError;
    use crate::input::AnalogFrame;
    use std::sync::Mutex;

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

    impl crate::gcode::CommandSink for RecordingSink {
        fn send(&mut self, lines: Vec<String>) -> Result<(), SinkError> {
            if *self.fail.lock().unwrap() {
                return Err(SinkError::Delivery("sink offline".to_string()));
            }
            self.lines.lock().unwrap().extend(lines);
            Ok(())
        }
    }

    fn fast_settings() -> Settings {
        let mut settings = Settings::default();
        // Effectively instant ramp so closed-form distances hold.
        settings.motion.acceleration = 1_000_000.0;
        settings.motion.reduction = ReductionPolicy::Average;
        settings.emitter.min_command_spacing_ms = 0;
        settings
    }

    fn rig(
        settings: &Settings,
        envelope: WorkEnvelope,
    ) -> (
        MovementCoordinator<Waiting>,
        Arc<InputBuffer>,
        RecordingSink,
    ) {
        let buffer = Arc::new(InputBuffer::new(settings.motion.buffer_capacity));
        let sink = RecordingSink::default();
        let emitter = CommandEmitter::new(
            Box::new(sink.clone()),
            settings.emitter.min_command_spacing_ms,
        );
        let coordinator =
            MovementCoordinator::create(buffer.clone(), emitter, settings, envelope);
        (coordinator, buffer, sink)
    }

    fn frame(x: f32, y: f32) -> AnalogFrame {
        AnalogFrame {
            x_axis: x,
            y_axis: y,
            ..AnalogFrame::idle()
        }
    }

    fn button_frame(set: impl Fn(&mut ButtonSnapshot)) -> AnalogFrame {
        let mut f = AnalogFrame::idle();
        set(&mut f.buttons);
        f
    }

    fn tick(
        coordinator: MovementCoordinator<Waiting>,
        dt: f64,
    ) -> MovementCoordinator<Waiting> {
        coordinator.drain_input().plan(dt).dispatch()
    }

    fn motion_lines(sink: &RecordingSink) -> Vec<String> {
        sink.lines()
            .into_iter()
            .filter(|l| l.starts_with("G1 X"))
            .collect()
    }

    #[test]
    fn empty_buffer_skips_the_tick() {
        let settings = fast_settings();
        let (coordinator, _buffer, sink) = rig(&settings, WorkEnvelope::default());
        let coordinator = tick(coordinator, 0.025);
        assert!(sink.lines().is_empty());
        assert_eq!(coordinator.position(), Position::default());
    }

    #[test]
    fn half_deflection_moves_expected_distance() {
        // 0.5 x 3000 mm/min over 25 ms is 0.625 mm.
        let settings = fast_settings();
        let (coordinator, buffer, sink) = rig(&settings, WorkEnvelope::default());
        for _ in 0..3 {
            buffer.push(frame(0.5, 0.0));
        }
        let coordinator = tick(coordinator, 0.025);

        let moves = motion_lines(&sink);
        assert_eq!(moves.len(), 1);
        assert!(
            (coordinator.position().x - 0.625).abs() < 0.01,
            "got {}",
            coordinator.position().x
        );
        assert_eq!(coordinator.position().y, 0.0);
        assert!(moves[0].contains("Y0.000"));
    }

    #[test]
    fn position_is_clamped_to_envelope() {
        let settings = fast_settings();
        let envelope = WorkEnvelope {
            max_x: 5.0,
            max_y: 5.0,
        };
        let (mut coordinator, buffer, _sink) = rig(&settings, envelope);
        for _ in 0..30 {
            buffer.push(frame(1.0, 0.0));
            coordinator = tick(coordinator, 0.1);
        }
        assert!(coordinator.position().x <= 5.0);
        assert!((coordinator.position().x - 5.0).abs() < 1e-9);

        // Driving backwards pins at the origin.
        for _ in 0..30 {
            buffer.push(frame(-1.0, -1.0));
            coordinator = tick(coordinator, 0.1);
        }
        assert_eq!(coordinator.position().x, 0.0);
        assert_eq!(coordinator.position().y, 0.0);
    }

    #[test]
    fn long_displacement_is_chunked() {
        let mut settings = fast_settings();
        settings.motion.chunk_size = 0.2;
        let (coordinator, buffer, sink) = rig(&settings, WorkEnvelope::default());
        buffer.push(frame(1.0, 0.0));
        // Full deflection at 50 mm/s over 50 ms is just under 2.5 mm.
        let coordinator = tick(coordinator, 0.05);

        let moves = motion_lines(&sink);
        let distance = coordinator.position().x;
        let expected = (distance / 0.2).ceil() as usize;
        assert_eq!(moves.len(), expected);
        assert_eq!(expected, 13);

        // Endpoints sum to the displacement and no chunk exceeds the bound.
        let mut last_x = 0.0;
        for line in &moves {
            let x: f64 = line
                .split_whitespace()
                .find(|p| p.starts_with('X'))
                .and_then(|p| p[1..].parse().ok())
                .unwrap();
            assert!(x - last_x <= 0.2 + 1e-6);
            last_x = x;
        }
        assert!((last_x - distance).abs() < 1e-3);
    }

    #[test]
    fn sub_threshold_movement_keeps_speed_state() {
        let mut settings = fast_settings();
        settings.motion.min_movement = 5.0;
        let (coordinator, buffer, sink) = rig(&settings, WorkEnvelope::default());
        buffer.push(frame(0.5, 0.0));
        let coordinator = tick(coordinator, 0.025);

        assert!(motion_lines(&sink).is_empty());
        assert_eq!(coordinator.position(), Position::default());
        // Acceleration state survives the skipped tick.
        assert!(coordinator.x_speed() > 0.0);
    }

    #[test]
    fn pen_toggle_is_edge_triggered_across_held_ticks() {
        let settings = fast_settings();
        let (mut coordinator, buffer, sink) = rig(&settings, WorkEnvelope::default());
        for _ in 0..5 {
            buffer.push(button_frame(|b| b.pen_toggle = true));
            coordinator = tick(coordinator, 0.025);
        }
        let z_moves: Vec<String> = sink
            .lines()
            .into_iter()
            .filter(|l| l.starts_with("G1 Z"))
            .collect();
        assert_eq!(z_moves.len(), 1);
        assert!(coordinator.drawing());
        assert!(z_moves[0].contains("Z0.200"));

        // Release and press again: toggles back to travel height.
        buffer.push(frame(0.0, 0.0));
        coordinator = tick(coordinator, 0.025);
        buffer.push(button_frame(|b| b.pen_toggle = true));
        let coordinator = tick(coordinator, 0.025);
        assert!(!coordinator.drawing());
    }

    #[test]
    fn homing_twice_is_idempotent() {
        let settings = fast_settings();
        let (mut coordinator, buffer, sink) = rig(&settings, WorkEnvelope::default());

        // Get away from the origin first.
        buffer.push(frame(1.0, 1.0));
        coordinator = tick(coordinator, 0.1);
        assert!(coordinator.position().x > 0.0);
        let moves_before = motion_lines(&sink).len();

        buffer.push(button_frame(|b| b.home = true));
        coordinator = tick(coordinator, 0.025);
        assert_eq!(coordinator.position(), Position::default());

        buffer.push(frame(0.0, 0.0)); // release
        coordinator = tick(coordinator, 0.025);
        buffer.push(button_frame(|b| b.home = true));
        let coordinator = tick(coordinator, 0.025);
        assert_eq!(coordinator.position(), Position::default());

        let homes = sink.lines().iter().filter(|l| *l == "G28 X Y\n").count();
        assert_eq!(homes, 2);
        // No motion commands between or after the two homing commands.
        assert_eq!(motion_lines(&sink).len(), moves_before);
    }

    #[test]
    fn emergency_stop_precedes_motion_and_zeroes_speeds() {
        let settings = fast_settings();
        let (mut coordinator, buffer, sink) = rig(&settings, WorkEnvelope::default());
        buffer.push(frame(1.0, 0.0));
        coordinator = tick(coordinator, 0.05);
        assert!(coordinator.x_speed() > 0.0);

        buffer.push(button_frame(|b| b.emergency_stop = true));
        let coordinator = tick(coordinator, 0.025);

        assert_eq!(coordinator.x_speed(), 0.0);
        assert_eq!(coordinator.y_speed(), 0.0);
        let lines = sink.lines();
        assert_eq!(lines.last().map(String::as_str), Some("M410\n"));
    }

    #[test]
    fn extrusion_only_tick_emits_filament_move() {
        let settings = fast_settings();
        let (coordinator, buffer, sink) = rig(&settings, WorkEnvelope::default());
        let mut f = AnalogFrame::idle();
        f.extrusion_pressure = 1.0;
        buffer.push(f);
        let coordinator = tick(coordinator, 0.025);

        assert_eq!(coordinator.position(), Position::default());
        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("E0.2000"), "got {}", lines[0]);
        // Extrusion feedrate: 2 mm/s is 120 mm/min.
        assert!(lines[0].contains("F120"), "got {}", lines[0]);
    }

    #[test]
    fn dispatch_failures_count_and_reset_on_success() {
        let mut settings = fast_settings();
        settings.motion.max_consecutive_errors = 3;
        let (mut coordinator, buffer, sink) = rig(&settings, WorkEnvelope::default());

        sink.set_failing(true);
        for _ in 0..2 {
            buffer.push(frame(1.0, 0.0));
            coordinator = tick(coordinator, 0.05);
        }
        assert_eq!(coordinator.consecutive_errors(), 2);
        assert!(!coordinator.failure_limit_exceeded());

        sink.set_failing(false);
        buffer.push(frame(1.0, 0.0));
        coordinator = tick(coordinator, 0.05);
        assert_eq!(coordinator.consecutive_errors(), 0);

        sink.set_failing(true);
        for _ in 0..3 {
            buffer.push(frame(1.0, 0.0));
            coordinator = tick(coordinator, 0.05);
        }
        assert!(coordinator.failure_limit_exceeded());
    }

    #[test]
    fn home_and_estop_discard_parked_move_batches() {
        use std::time::Duration;

        let mut settings = fast_settings();
        settings.emitter.min_command_spacing_ms = 30;
        let (mut coordinator, buffer, sink) = rig(&settings, WorkEnvelope::default());

        buffer.push(frame(1.0, 0.0));
        coordinator = tick(coordinator, 0.05); // dispatched
        buffer.push(frame(1.0, 0.0));
        coordinator = tick(coordinator, 0.05); // parked inside spacing window
        let dispatched = motion_lines(&sink).len();
        assert!(dispatched > 0);

        buffer.push(button_frame(|b| b.home = true));
        coordinator = tick(coordinator, 0.025);
        assert_eq!(coordinator.position(), Position::default());

        // Let the spacing window elapse; a quiet tick must not revive the
        // parked pre-home batch.
        std::thread::sleep(Duration::from_millis(40));
        buffer.push(frame(0.0, 0.0));
        coordinator = tick(coordinator, 0.025);
        assert_eq!(motion_lines(&sink).len(), dispatched);
        assert_eq!(sink.lines().last().map(String::as_str), Some("G28 X Y\n"));

        // Same guarantee for emergency stop.
        buffer.push(frame(1.0, 0.0));
        coordinator = tick(coordinator, 0.05); // dispatched
        buffer.push(frame(1.0, 0.0));
        coordinator = tick(coordinator, 0.05); // parked
        let dispatched = motion_lines(&sink).len();

        buffer.push(button_frame(|b| b.emergency_stop = true));
        coordinator = tick(coordinator, 0.025);
        std::thread::sleep(Duration::from_millis(40));
        buffer.push(frame(0.0, 0.0));
        let _ = tick(coordinator, 0.025);
        assert_eq!(motion_lines(&sink).len(), dispatched);
        assert_eq!(sink.lines().last().map(String::as_str), Some("M410\n"));
    }

    #[test]
    fn reset_zeroes_all_session_state() {
        let settings = fast_settings();
        let (mut coordinator, buffer, _sink) = rig(&settings, WorkEnvelope::default());
        buffer.push(frame(1.0, 1.0));
        coordinator = tick(coordinator, 0.1);
        buffer.push(button_frame(|b| b.pen_toggle = true));
        let mut coordinator = tick(coordinator, 0.025);

        coordinator.reset();
        assert_eq!(coordinator.position(), Position::default());
        assert_eq!(coordinator.x_speed(), 0.0);
        assert!(!coordinator.drawing());
        assert_eq!(coordinator.snapshot(), MotionSnapshot::default());
    }

    #[test]
    fn envelope_update_pulls_position_inside() {
        let settings = fast_settings();
        let (mut coordinator, buffer, _sink) = rig(&settings, WorkEnvelope::default());
        for _ in 0..10 {
            buffer.push(frame(1.0, 0.0));
            coordinator = tick(coordinator, 0.1);
        }
        let before = coordinator.position().x;
        assert!(before > 10.0);
        coordinator.set_envelope(WorkEnvelope {
            max_x: 10.0,
            max_y: 10.0,
        });
        assert_eq!(coordinator.position().x, 10.0);
    }
}
