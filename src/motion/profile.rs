//! Per-axis acceleration model.
//!
//! Integrates current speed toward target speed under a bounded acceleration
//! and returns the distance covered per time step. Target assignment clamps
//! to the speed limit, so the integration itself can trust its inputs.

/// Speeds closer than this to the target count as arrived.
const SPEED_EPSILON: f64 = 1e-3;

/// Continuous state machine over `current_speed -> target_speed` for one
/// axis. Speeds in mm/s, acceleration in mm/s².
#[derive(Debug, Clone)]
pub struct AxisProfile {
    acceleration: f64,
    max_speed: f64,
    current_speed: f64,
    target_speed: f64,
}

impl AxisProfile {
    pub fn new(acceleration: f64, max_speed: f64) -> Self {
        Self {
            acceleration,
            max_speed,
            current_speed: 0.0,
            target_speed: 0.0,
        }
    }

    pub fn current_speed(&self) -> f64 {
        self.current_speed
    }

    pub fn target_speed(&self) -> f64 {
        self.target_speed
    }

    pub fn max_speed(&self) -> f64 {
        self.max_speed
    }

    /// Sets the target, clamped to the speed limit. This is the only place
    /// the |speed| <= max_speed invariant is enforced.
    pub fn set_target_speed(&mut self, target: f64) {
        self.target_speed = target.clamp(-self.max_speed, self.max_speed);
    }

    /// Replaces the physical limits, keeping current speed within the new
    /// bound.
    pub fn set_limits(&mut self, acceleration: f64, max_speed: f64) {
        self.acceleration = acceleration;
        self.max_speed = max_speed;
        self.current_speed = self.current_speed.clamp(-max_speed, max_speed);
        self.target_speed = self.target_speed.clamp(-max_speed, max_speed);
    }

    /// Immediate stop: zeroes both current and target speed without ramping.
    pub fn halt(&mut self) {
        self.current_speed = 0.0;
        self.target_speed = 0.0;
    }

    /// Advances the profile by `time_delta` seconds and returns the signed
    /// distance covered. The new speed is committed into the profile.
    pub fn step(&mut self, time_delta: f64) -> f64 {
        if time_delta <= 0.0 {
            return 0.0;
        }

        let delta = self.target_speed - self.current_speed;
        if delta.abs() < SPEED_EPSILON {
            return self.current_speed * time_delta;
        }

        let accel = self.acceleration.copysign(delta);
        let time_to_target = delta.abs() / self.acceleration;

        if time_to_target <= time_delta {
            // Two phases: ramp to the target, then hold it. Landing exactly
            // on target_speed avoids floating-point overshoot.
            let ramp = self.current_speed * time_to_target
                + 0.5 * accel * time_to_target * time_to_target;
            let cruise = self.target_speed * (time_delta - time_to_target);
            self.current_speed = self.target_speed;
            ramp + cruise
        } else {
            let distance =
                self.current_speed * time_delta + 0.5 * accel * time_delta * time_delta;
            self.current_speed += accel * time_delta;
            distance
        }
    }

    pub fn reset(&mut self) {
        self.halt();
    }
}
