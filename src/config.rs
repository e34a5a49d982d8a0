//! Typed configuration surface for the plotter bridge.
//!
//! All tunables from the control pipeline live here as plain structs with
//! serde derives, loadable from a TOML file. Updates are validated as a whole
//! before they are applied anywhere: a single out-of-range value rejects the
//! entire settings object, so the running session never sees a half-applied
//! configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Per-axis input shaping: deadzone, walk/run/max tiering and smoothing.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CurveSettings {
    /// Normalized magnitude below which the stick reads as exactly zero.
    pub deadzone: f32,
    /// Upper bound of the walk band on the rescaled magnitude, in (0, 1).
    pub walk_threshold: f32,
    /// Upper bound of the run band, must be greater than `walk_threshold`.
    pub run_threshold: f32,
    /// Speed multiplier reached at the walk threshold.
    pub walk_multiplier: f32,
    /// Speed multiplier reached at the run threshold.
    pub run_multiplier: f32,
    /// Speed multiplier reached at full deflection.
    pub max_multiplier: f32,
    /// Smoothing weight on the previous value while magnitude is rising.
    /// Lower means more responsive.
    pub accel_smoothing: f32,
    /// Smoothing weight on the previous value while magnitude is falling.
    pub decel_smoothing: f32,
}

impl Default for CurveSettings {
    fn default() -> Self {
        Self {
            deadzone: 0.10,
            walk_threshold: 0.40,
            run_threshold: 0.75,
            walk_multiplier: 0.40,
            run_multiplier: 0.80,
            max_multiplier: 1.00,
            accel_smoothing: 0.10,
            decel_smoothing: 0.35,
        }
    }
}

/// How a tick reduces the drained frame batch to one velocity intent.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReductionPolicy {
    /// Average every frame in the batch. Better noise rejection, adds
    /// latency of roughly half the tick window.
    Average,
    /// Take the most recent frame, lightly blended against the previous
    /// tick's value. Lower latency, the default for plotting.
    LatestBlended,
}

/// Movement loop tunables.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MotionSettings {
    /// Base travel speed in mm/min at full multiplier.
    pub base_speed: f64,
    /// Axis acceleration in mm/s².
    pub acceleration: f64,
    /// Displacements below this many mm are skipped (speed state persists).
    pub min_movement: f64,
    /// Maximum length of a single emitted move in mm; longer tick
    /// displacements are subdivided.
    pub chunk_size: f64,
    /// Consumer (coordinator) tick interval in milliseconds.
    pub tick_interval_ms: u64,
    /// Producer (input polling) interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Input buffer capacity in frames.
    pub buffer_capacity: usize,
    /// Consecutive failed ticks before the session is terminated as fatal.
    pub max_consecutive_errors: u32,
    /// Frame batch reduction policy.
    pub reduction: ReductionPolicy,
    /// Weight on the previous tick's value under `LatestBlended`.
    pub blend_factor: f32,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            base_speed: 3000.0,
            acceleration: 1200.0,
            min_movement: 0.025,
            chunk_size: 2.0,
            tick_interval_ms: 25,
            poll_interval_ms: 1,
            buffer_capacity: 100,
            max_consecutive_errors: 10,
            reduction: ReductionPolicy::LatestBlended,
            blend_factor: 0.1,
        }
    }
}

/// Filament feed tunables.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ExtrusionSettings {
    /// Trigger pressure below this is ignored.
    pub trigger_deadzone: f32,
    /// mm of filament fed at full extrude pressure per tick.
    pub extrusion_amount: f64,
    /// mm of filament pulled at full retract pressure per tick.
    pub retraction_amount: f64,
    /// Starting extrusion feedrate in mm/s.
    pub feedrate: f64,
    /// Feedrate change per button press in mm/min.
    pub feedrate_increment: f64,
    /// Lower feedrate clamp in mm/s.
    pub min_feedrate: f64,
    /// Upper feedrate clamp in mm/s.
    pub max_feedrate: f64,
    /// Ignore repeated feedrate presses within this window.
    pub feedrate_debounce_ms: u64,
}

impl Default for ExtrusionSettings {
    fn default() -> Self {
        Self {
            trigger_deadzone: 0.1,
            extrusion_amount: 0.2,
            retraction_amount: 1.0,
            feedrate: 2.0,
            feedrate_increment: 100.0,
            min_feedrate: 0.5,
            max_feedrate: 15.0,
            feedrate_debounce_ms: 100,
        }
    }
}

/// Z heights for the drawing/travel toggle.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PenSettings {
    /// Z height while drawing, in mm.
    pub z_drawing: f64,
    /// Z height while travelling, in mm.
    pub z_travel: f64,
    /// Feedrate of the Z move in mm/min.
    pub z_feedrate: f64,
}

impl Default for PenSettings {
    fn default() -> Self {
        Self {
            z_drawing: 0.2,
            z_travel: 1.0,
            z_feedrate: 1000.0,
        }
    }
}

/// Command emitter tunables.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct EmitterSettings {
    /// Minimum spacing between dispatched move batches in milliseconds.
    pub min_command_spacing_ms: u64,
}

impl Default for EmitterSettings {
    fn default() -> Self {
        Self {
            min_command_spacing_ms: 10,
        }
    }
}

/// Complete settings tree, hot-reloadable as one unit.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub curve: CurveSettings,
    pub motion: MotionSettings,
    pub extrusion: ExtrusionSettings,
    pub pen: PenSettings,
    pub emitter: EmitterSettings,
}

impl Settings {
    /// Default on-disk location of the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("plotpilot")
            .join("config.toml")
    }

    /// Loads and validates settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading settings from {}", path.display());
        let raw = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&raw)?;
        settings.validate()?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Checks every tunable. Fails atomically: the caller must not apply any
    /// part of a settings object that did not pass.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.curve;
        check_unit_range("curve.deadzone", c.deadzone)?;
        // Thresholds divide the curve bands, so zero is as bad as one: a
        // walk_threshold of 0 makes the walk-band slope 0/0.
        check_open_unit_range("curve.walk_threshold", c.walk_threshold)?;
        check_open_unit_range("curve.run_threshold", c.run_threshold)?;
        if c.walk_threshold >= c.run_threshold {
            return Err(ConfigError::Invalid(format!(
                "curve.walk_threshold ({}) must be below curve.run_threshold ({})",
                c.walk_threshold, c.run_threshold
            )));
        }
        for (name, value) in [
            ("curve.walk_multiplier", c.walk_multiplier),
            ("curve.run_multiplier", c.run_multiplier),
            ("curve.max_multiplier", c.max_multiplier),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a positive number, got {}",
                    name, value
                )));
            }
        }
        if c.walk_multiplier > c.run_multiplier || c.run_multiplier > c.max_multiplier {
            return Err(ConfigError::Invalid(
                "curve multipliers must be ordered walk <= run <= max".to_string(),
            ));
        }
        check_unit_range("curve.accel_smoothing", c.accel_smoothing)?;
        check_unit_range("curve.decel_smoothing", c.decel_smoothing)?;

        let m = &self.motion;
        check_positive("motion.base_speed", m.base_speed)?;
        check_positive("motion.acceleration", m.acceleration)?;
        check_non_negative("motion.min_movement", m.min_movement)?;
        check_positive("motion.chunk_size", m.chunk_size)?;
        if m.tick_interval_ms == 0 || m.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "motion intervals must be at least 1 ms".to_string(),
            ));
        }
        if m.buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "motion.buffer_capacity must be at least 1".to_string(),
            ));
        }
        if m.max_consecutive_errors == 0 {
            return Err(ConfigError::Invalid(
                "motion.max_consecutive_errors must be at least 1".to_string(),
            ));
        }
        check_unit_range("motion.blend_factor", m.blend_factor)?;

        let e = &self.extrusion;
        check_unit_range("extrusion.trigger_deadzone", e.trigger_deadzone)?;
        check_non_negative("extrusion.extrusion_amount", e.extrusion_amount)?;
        check_non_negative("extrusion.retraction_amount", e.retraction_amount)?;
        check_positive("extrusion.min_feedrate", e.min_feedrate)?;
        check_positive("extrusion.feedrate_increment", e.feedrate_increment)?;
        if e.max_feedrate < e.min_feedrate {
            return Err(ConfigError::Invalid(format!(
                "extrusion.max_feedrate ({}) must not be below min_feedrate ({})",
                e.max_feedrate, e.min_feedrate
            )));
        }
        if e.feedrate < e.min_feedrate || e.feedrate > e.max_feedrate {
            return Err(ConfigError::Invalid(format!(
                "extrusion.feedrate ({}) must lie within [{}, {}]",
                e.feedrate, e.min_feedrate, e.max_feedrate
            )));
        }

        let p = &self.pen;
        if !p.z_drawing.is_finite() || !p.z_travel.is_finite() {
            return Err(ConfigError::Invalid(
                "pen z heights must be finite numbers".to_string(),
            ));
        }
        check_positive("pen.z_feedrate", p.z_feedrate)?;

        Ok(())
    }
}

/// Travel bounds of the physical machine, supplied by the envelope provider
/// at session start and on profile changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkEnvelope {
    pub max_x: f64,
    pub max_y: f64,
}

impl Default for WorkEnvelope {
    fn default() -> Self {
        Self {
            max_x: 200.0,
            max_y: 200.0,
        }
    }
}

impl WorkEnvelope {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("envelope.max_x", self.max_x)?;
        check_positive("envelope.max_y", self.max_y)?;
        Ok(())
    }
}

fn check_unit_range(name: &str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{} must lie within [0, 1), got {}",
            name, value
        )))
    }
}

fn check_open_unit_range(name: &str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{} must lie within (0, 1), got {}",
            name, value
        )))
    }
}

fn check_positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{} must be a positive number, got {}",
            name, value
        )))
    }
}

fn check_non_negative(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{} must not be negative, got {}",
            name, value
        )))
    }
}
