//! Turns raw device events into bounded analog state snapshots.
//!
//! The normalizer keeps a mutable controller-state record: raw axis values are
//! divided by the device maximum, pushed through a deadzone and a three-tier
//! walk/run/max speed curve, then blended with the previous frame's value by
//! an exponential filter. Each producer poll cycle folds its event batch into
//! the record and takes one [`AnalogFrame`] snapshot.

use chrono::{DateTime, Local};
use tracing::debug;

use crate::config::CurveSettings;
use crate::input::source::{AxisId, ButtonId, RawInputEvent, AXIS_MAX};

/// Momentary button state carried along with each frame so the consumer loop
/// can edge-trigger actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ButtonSnapshot {
    pub pen_toggle: bool,
    pub home: bool,
    pub emergency_stop: bool,
    pub feedrate_up: bool,
    pub feedrate_down: bool,
}

/// One timestamped analog state snapshot.
///
/// Axis fields carry the already-tiered, smoothed signed speed fraction in
/// [-1, 1]; trigger pressures are clamped to [0, 1]. Frames are immutable
/// after creation and owned by whichever buffer slot holds them.
#[derive(Debug, Clone)]
pub struct AnalogFrame {
    pub x_axis: f32,
    pub y_axis: f32,
    pub extrusion_pressure: f32,
    pub retraction_pressure: f32,
    pub buttons: ButtonSnapshot,
    pub timestamp: DateTime<Local>,
}

impl AnalogFrame {
    /// A neutral frame: sticks centered, triggers released, no buttons.
    pub fn idle() -> Self {
        Self {
            x_axis: 0.0,
            y_axis: 0.0,
            extrusion_pressure: 0.0,
            retraction_pressure: 0.0,
            buttons: ButtonSnapshot::default(),
            timestamp: Local::now(),
        }
    }
}

/// Speed band the current input magnitude falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementTier {
    Idle,
    Walk,
    Run,
    Max,
}

/// Mutable controller-state record fed by raw events.
#[derive(Debug)]
pub struct InputNormalizer {
    settings: CurveSettings,

    // Normalized raw stick position, before curve and smoothing.
    raw_x: f32,
    raw_y: f32,

    // Smoothed curve outputs from the previous snapshot.
    speed_x: f32,
    speed_y: f32,

    extrusion: f32,
    retraction: f32,
    buttons: ButtonSnapshot,
    tier: MovementTier,
}

impl InputNormalizer {
    pub fn new(settings: CurveSettings) -> Self {
        Self {
            settings,
            raw_x: 0.0,
            raw_y: 0.0,
            speed_x: 0.0,
            speed_y: 0.0,
            extrusion: 0.0,
            retraction: 0.0,
            buttons: ButtonSnapshot::default(),
            tier: MovementTier::Idle,
        }
    }

    pub fn update_settings(&mut self, settings: CurveSettings) {
        self.settings = settings;
    }

    pub fn tier(&self) -> MovementTier {
        self.tier
    }

    /// Folds one raw event into the state record. Side effect only; unknown
    /// event codes never reach this point (the source filters them).
    pub fn apply(&mut self, event: RawInputEvent) {
        match event {
            RawInputEvent::Axis { axis, value } => {
                let normalized = (value as f32 / AXIS_MAX as f32).clamp(-1.0, 1.0);
                match axis {
                    AxisId::StickX => self.raw_x = normalized,
                    // Device Y grows downward; machine Y grows away from home.
                    AxisId::StickY => self.raw_y = -normalized,
                    AxisId::ExtrudeTrigger => self.extrusion = normalized.clamp(0.0, 1.0),
                    AxisId::RetractTrigger => self.retraction = normalized.clamp(0.0, 1.0),
                }
            }
            RawInputEvent::Button { button, pressed } => {
                debug!("Button {:?} pressed={}", button, pressed);
                match button {
                    ButtonId::PenToggle => self.buttons.pen_toggle = pressed,
                    ButtonId::Home => self.buttons.home = pressed,
                    ButtonId::EmergencyStop => self.buttons.emergency_stop = pressed,
                    ButtonId::FeedrateUp => self.buttons.feedrate_up = pressed,
                    ButtonId::FeedrateDown => self.buttons.feedrate_down = pressed,
                }
            }
        }
    }

    /// Folds a whole poll batch. An empty batch is a successful no-op.
    pub fn apply_batch(&mut self, events: &[RawInputEvent]) {
        for event in events {
            self.apply(*event);
        }
    }

    /// Runs the speed curve and smoothing once and returns the frame for this
    /// poll cycle.
    pub fn snapshot(&mut self) -> AnalogFrame {
        let (curved_x, scale_x) = curve_axis(self.raw_x, &self.settings);
        let (curved_y, scale_y) = curve_axis(self.raw_y, &self.settings);

        self.speed_x = smooth(self.speed_x, curved_x, &self.settings);
        self.speed_y = smooth(self.speed_y, curved_y, &self.settings);
        self.tier = tier_of(scale_x.max(scale_y), &self.settings);

        AnalogFrame {
            x_axis: self.speed_x,
            y_axis: self.speed_y,
            extrusion_pressure: self.extrusion,
            retraction_pressure: self.retraction,
            buttons: self.buttons,
            timestamp: Local::now(),
        }
    }

    /// Clears the whole record back to the neutral position.
    pub fn reset(&mut self) {
        self.raw_x = 0.0;
        self.raw_y = 0.0;
        self.speed_x = 0.0;
        self.speed_y = 0.0;
        self.extrusion = 0.0;
        self.retraction = 0.0;
        self.buttons = ButtonSnapshot::default();
        self.tier = MovementTier::Idle;
    }
}

/// Applies deadzone and the tier curve to one normalized axis value.
///
/// Returns the signed speed fraction and the rescaled magnitude `s` used for
/// tier classification.
fn curve_axis(normalized: f32, settings: &CurveSettings) -> (f32, f32) {
    let magnitude = normalized.abs();
    if magnitude < settings.deadzone {
        return (0.0, 0.0);
    }

    let s = ((magnitude - settings.deadzone) / (1.0 - settings.deadzone)).clamp(0.0, 1.0);
    let multiplier = speed_multiplier(s, settings);
    (normalized.signum() * s * multiplier, s)
}

/// Piecewise-linear multiplier through (0, 0), (walk_threshold, walk),
/// (run_threshold, run) and (1, max). Continuous at both thresholds and
/// monotone for walk <= run <= max.
fn speed_multiplier(s: f32, settings: &CurveSettings) -> f32 {
    if s <= settings.walk_threshold {
        lerp(0.0, settings.walk_multiplier, s / settings.walk_threshold)
    } else if s <= settings.run_threshold {
        let t = (s - settings.walk_threshold) / (settings.run_threshold - settings.walk_threshold);
        lerp(settings.walk_multiplier, settings.run_multiplier, t)
    } else {
        let t = (s - settings.run_threshold) / (1.0 - settings.run_threshold);
        lerp(settings.run_multiplier, settings.max_multiplier, t)
    }
}

fn tier_of(s: f32, settings: &CurveSettings) -> MovementTier {
    if s <= 0.0 {
        MovementTier::Idle
    } else if s <= settings.walk_threshold {
        MovementTier::Walk
    } else if s <= settings.run_threshold {
        MovementTier::Run
    } else {
        MovementTier::Max
    }
}

// Exponential blend with asymmetric weights: less smoothing (more
// responsiveness) while the magnitude is rising.
fn smooth(previous: f32, next: f32, settings: &CurveSettings) -> f32 {
    let weight = if next.abs() >= previous.abs() {
        settings.accel_smoothing
    } else {
        settings.decel_smoothing
    };
    weight * previous + (1.0 - weight) * next
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(value: f32) -> i32 {
        (value * AXIS_MAX as f32) as i32
    }

    fn no_smoothing() -> CurveSettings {
        CurveSettings {
            accel_smoothing: 0.0,
            decel_smoothing: 0.0,
            ..CurveSettings::default()
        }
    }

    #[test]
    fn deadzone_maps_to_exact_zero_and_idle() {
        let settings = no_smoothing();
        let mut normalizer = InputNormalizer::new(settings.clone());
        for value in [-0.09, -0.05, 0.0, 0.05, 0.099] {
            normalizer.apply(RawInputEvent::Axis {
                axis: AxisId::StickX,
                value: raw(value),
            });
            let frame = normalizer.snapshot();
            assert_eq!(frame.x_axis, 0.0, "value {} escaped deadzone", value);
            assert_eq!(normalizer.tier(), MovementTier::Idle);
        }
    }

    #[test]
    fn multiplier_is_monotone() {
        let settings = CurveSettings::default();
        let mut last = 0.0;
        for i in 0..=100 {
            let s = i as f32 / 100.0;
            let m = speed_multiplier(s, &settings);
            assert!(m >= last - 1e-6, "multiplier dipped at s={}", s);
            last = m;
        }
    }

    #[test]
    fn multiplier_is_continuous_at_band_boundaries() {
        let settings = CurveSettings::default();
        for boundary in [settings.walk_threshold, settings.run_threshold] {
            let below = speed_multiplier(boundary - 1e-4, &settings);
            let above = speed_multiplier(boundary + 1e-4, &settings);
            assert!(
                (below - above).abs() < 1e-3,
                "jump at boundary {}: {} vs {}",
                boundary,
                below,
                above
            );
        }
    }

    #[test]
    fn full_deflection_hits_max_multiplier() {
        let settings = no_smoothing();
        let mut normalizer = InputNormalizer::new(settings.clone());
        normalizer.apply(RawInputEvent::Axis {
            axis: AxisId::StickX,
            value: AXIS_MAX,
        });
        let frame = normalizer.snapshot();
        assert!((frame.x_axis - settings.max_multiplier).abs() < 1e-3);
        assert_eq!(normalizer.tier(), MovementTier::Max);
    }

    #[test]
    fn output_sign_follows_input_sign() {
        let mut normalizer = InputNormalizer::new(no_smoothing());
        normalizer.apply(RawInputEvent::Axis {
            axis: AxisId::StickX,
            value: raw(-0.9),
        });
        let frame = normalizer.snapshot();
        assert!(frame.x_axis < 0.0);
    }

    #[test]
    fn stick_y_is_inverted() {
        let mut normalizer = InputNormalizer::new(no_smoothing());
        normalizer.apply(RawInputEvent::Axis {
            axis: AxisId::StickY,
            value: raw(0.9),
        });
        let frame = normalizer.snapshot();
        assert!(frame.y_axis < 0.0);
    }

    #[test]
    fn smoothing_is_asymmetric() {
        let settings = CurveSettings {
            accel_smoothing: 0.0,
            decel_smoothing: 0.5,
            ..CurveSettings::default()
        };
        let mut normalizer = InputNormalizer::new(settings);

        normalizer.apply(RawInputEvent::Axis {
            axis: AxisId::StickX,
            value: AXIS_MAX,
        });
        let rising = normalizer.snapshot().x_axis;
        assert!(rising > 0.9, "rising edge should be unsmoothed");

        normalizer.apply(RawInputEvent::Axis {
            axis: AxisId::StickX,
            value: 0,
        });
        let falling = normalizer.snapshot().x_axis;
        assert!(
            (falling - rising * 0.5).abs() < 1e-4,
            "falling edge should decay by the decel weight"
        );
    }

    #[test]
    fn trigger_pressure_is_clamped_to_unit_range() {
        let mut normalizer = InputNormalizer::new(no_smoothing());
        normalizer.apply(RawInputEvent::Axis {
            axis: AxisId::ExtrudeTrigger,
            value: -AXIS_MAX,
        });
        let frame = normalizer.snapshot();
        assert_eq!(frame.extrusion_pressure, 0.0);
    }

    #[test]
    fn empty_batch_is_a_noop() {
        let mut normalizer = InputNormalizer::new(no_smoothing());
        normalizer.apply(RawInputEvent::Axis {
            axis: AxisId::StickX,
            value: AXIS_MAX,
        });
        let before = normalizer.snapshot().x_axis;
        normalizer.apply_batch(&[]);
        let after = normalizer.snapshot().x_axis;
        assert_eq!(before, after);
    }

    #[test]
    fn buttons_track_press_and_release() {
        let mut normalizer = InputNormalizer::new(no_smoothing());
        normalizer.apply(RawInputEvent::Button {
            button: ButtonId::Home,
            pressed: true,
        });
        assert!(normalizer.snapshot().buttons.home);
        normalizer.apply(RawInputEvent::Button {
            button: ButtonId::Home,
            pressed: false,
        });
        assert!(!normalizer.snapshot().buttons.home);
    }
}
