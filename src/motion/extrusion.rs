//! Trigger-driven filament feed and retraction.
//!
//! Pressure on the extrude/retract triggers accumulates signed deltas into an
//! absolute E position; the feedrate is adjusted through two edge-triggered
//! buttons with a debounce window.

use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::ExtrusionSettings;

#[derive(Debug)]
pub struct ExtrusionController {
    settings: ExtrusionSettings,

    /// Absolute filament position in mm. Monotonically accumulates signed
    /// deltas; the machine runs in absolute extrusion mode.
    current_e: f64,

    /// Extrusion feedrate in mm/s.
    feedrate: f64,

    last_feedrate_change: Option<Instant>,
    prev_up: bool,
    prev_down: bool,
}

impl ExtrusionController {
    pub fn new(settings: ExtrusionSettings) -> Self {
        let feedrate = settings.feedrate;
        Self {
            settings,
            current_e: 0.0,
            feedrate,
            last_feedrate_change: None,
            prev_up: false,
            prev_down: false,
        }
    }

    pub fn current_e(&self) -> f64 {
        self.current_e
    }

    pub fn feedrate(&self) -> f64 {
        self.feedrate
    }

    pub fn feedrate_mm_min(&self) -> f64 {
        self.feedrate * 60.0
    }

    pub fn update_settings(&mut self, settings: ExtrusionSettings) {
        self.feedrate = self
            .feedrate
            .clamp(settings.min_feedrate, settings.max_feedrate);
        self.settings = settings;
    }

    /// Converts trigger pressures into a signed E delta for this tick and
    /// accumulates it. Extrusion wins when both triggers are pressed.
    pub fn update(&mut self, extrude_pressure: f32, retract_pressure: f32) -> f64 {
        let delta = if extrude_pressure > self.settings.trigger_deadzone {
            self.settings.extrusion_amount * extrude_pressure as f64
        } else if retract_pressure > self.settings.trigger_deadzone {
            -self.settings.retraction_amount * retract_pressure as f64
        } else {
            0.0
        };
        self.current_e += delta;
        delta
    }

    /// Edge-triggered feedrate adjustment with debounce: a press only counts
    /// on the rising edge and repeated presses inside the debounce window are
    /// ignored.
    pub fn adjust_feedrate(&mut self, up_pressed: bool, down_pressed: bool, now: Instant) {
        let up_edge = up_pressed && !self.prev_up;
        let down_edge = down_pressed && !self.prev_down;
        self.prev_up = up_pressed;
        self.prev_down = down_pressed;

        if !up_edge && !down_edge {
            return;
        }

        let debounce = Duration::from_millis(self.settings.feedrate_debounce_ms);
        if let Some(last) = self.last_feedrate_change {
            if now.duration_since(last) < debounce {
                return;
            }
        }

        let step = self.settings.feedrate_increment / 60.0;
        let adjusted = if up_edge {
            self.feedrate + step
        } else {
            self.feedrate - step
        };
        self.feedrate = adjusted.clamp(self.settings.min_feedrate, self.settings.max_feedrate);
        self.last_feedrate_change = Some(now);
        debug!("Extrusion feedrate adjusted to {:.2} mm/s", self.feedrate);
    }

    /// Zeroes session state; the feedrate returns to its configured default.
    pub fn reset(&mut self) {
        self.current_e = 0.0;
        self.feedrate = self.settings.feedrate;
        self.last_feedrate_change = None;
        self.prev_up = false;
        self.prev_down = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> ExtrusionController {
        ExtrusionController::new(ExtrusionSettings::default())
    }

    #[test]
    fn pressure_below_deadzone_produces_no_delta() {
        let mut extrusion = controller();
        assert_eq!(extrusion.update(0.05, 0.0), 0.0);
        assert_eq!(extrusion.update(0.0, 0.09), 0.0);
        assert_eq!(extrusion.current_e(), 0.0);
    }

    #[test]
    fn extrusion_accumulates_positive_deltas() {
        let mut extrusion = controller();
        let delta = extrusion.update(1.0, 0.0);
        assert!((delta - 0.2).abs() < 1e-9);
        extrusion.update(0.5, 0.0);
        assert!((extrusion.current_e() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn retraction_accumulates_negative_deltas() {
        let mut extrusion = controller();
        let delta = extrusion.update(0.0, 1.0);
        assert!((delta + 1.0).abs() < 1e-9);
        assert!(extrusion.current_e() < 0.0);
    }

    #[test]
    fn extrusion_wins_over_retraction() {
        let mut extrusion = controller();
        let delta = extrusion.update(0.8, 0.8);
        assert!(delta > 0.0);
    }

    #[test]
    fn feedrate_adjusts_on_rising_edge_only() {
        let mut extrusion = controller();
        let start = extrusion.feedrate();
        let t0 = Instant::now();

        extrusion.adjust_feedrate(true, false, t0);
        let after_press = extrusion.feedrate();
        assert!((after_press - (start + 100.0 / 60.0)).abs() < 1e-9);

        // Held across later calls: no further change even past the window.
        extrusion.adjust_feedrate(true, false, t0 + Duration::from_millis(500));
        assert_eq!(extrusion.feedrate(), after_press);
    }

    #[test]
    fn feedrate_presses_inside_debounce_window_are_ignored() {
        let mut extrusion = controller();
        let t0 = Instant::now();
        extrusion.adjust_feedrate(true, false, t0);
        let after_first = extrusion.feedrate();

        // Release then press again 50 ms later, inside the 100 ms window.
        extrusion.adjust_feedrate(false, false, t0 + Duration::from_millis(20));
        extrusion.adjust_feedrate(true, false, t0 + Duration::from_millis(50));
        assert_eq!(extrusion.feedrate(), after_first);

        // Past the window the press counts.
        extrusion.adjust_feedrate(false, false, t0 + Duration::from_millis(120));
        extrusion.adjust_feedrate(true, false, t0 + Duration::from_millis(150));
        assert!(extrusion.feedrate() > after_first);
    }

    #[test]
    fn feedrate_is_clamped_to_configured_range() {
        let mut extrusion = controller();
        let max = extrusion.settings.max_feedrate;
        let mut now = Instant::now();
        for _ in 0..600 {
            extrusion.adjust_feedrate(true, false, now);
            extrusion.adjust_feedrate(false, false, now);
            now += Duration::from_millis(150);
        }
        assert!((extrusion.feedrate() - max).abs() < 1e-9);

        for _ in 0..600 {
            extrusion.adjust_feedrate(false, true, now);
            extrusion.adjust_feedrate(false, false, now);
            now += Duration::from_millis(150);
        }
        assert!((extrusion.feedrate() - extrusion.settings.min_feedrate).abs() < 1e-9);
    }

    #[test]
    fn reset_returns_to_configured_feedrate_and_zero_e() {
        let mut extrusion = controller();
        extrusion.update(1.0, 0.0);
        extrusion.adjust_feedrate(true, false, Instant::now());
        extrusion.reset();
        assert_eq!(extrusion.current_e(), 0.0);
        assert_eq!(extrusion.feedrate(), ExtrusionSettings::default().feedrate);
    }
}
