//! Raw input-event source abstraction and the gilrs-backed implementation.
//!
//! The control core only sees [`RawInputEvent`] values: absolute axis updates
//! carrying signed 16-bit integers and button updates carrying booleans. That
//! keeps the event source an external collaborator; tests substitute scripted
//! sources and the binary wires in [`GilrsSource`].

use gilrs::{Axis, Button, Event, EventType, Gamepad, GamepadId, Gilrs};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Maximum magnitude of a raw axis value (16-bit signed device range).
pub const AXIS_MAX: i32 = 32767;

/// Logical axes the core understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AxisId {
    StickX,
    StickY,
    ExtrudeTrigger,
    RetractTrigger,
}

/// Logical buttons the core understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ButtonId {
    PenToggle,
    Home,
    EmergencyStop,
    FeedrateUp,
    FeedrateDown,
}

/// A single discrete event from the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawInputEvent {
    Axis { axis: AxisId, value: i32 },
    Button { button: ButtonId, pressed: bool },
}

/// Errors surfaced by an input source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to initialize input source: {0}")]
    Initialization(String),

    #[error("Failed to read input events: {0}")]
    Read(String),
}

/// A source of discrete controller events.
///
/// `poll` drains everything currently pending; an empty batch is a successful
/// no-op, and a `Read` error is transient from the caller's perspective.
pub trait InputSource: Send {
    fn poll(&mut self) -> Result<Vec<RawInputEvent>, SourceError>;
}

/// Gamepad-backed input source using gilrs.
pub struct GilrsSource {
    gilrs: Gilrs,
    active_gamepad: Option<GamepadId>,
}

impl GilrsSource {
    pub fn new() -> Result<Self, SourceError> {
        info!("Initializing gilrs controller interface");
        let gilrs = Gilrs::new().map_err(|e| SourceError::Initialization(e.to_string()))?;

        let gamepads: Vec<(GamepadId, Gamepad<'_>)> = gilrs.gamepads().collect();
        let active_gamepad = if gamepads.is_empty() {
            warn!("No gamepad connected, continuing in idle mode");
            None
        } else {
            info!("Found {} gamepads:", gamepads.len());
            for (idx, (id, gamepad)) in gamepads.iter().enumerate() {
                info!("  [{}] ID: {}, Name: {}", idx, id, gamepad.name());
            }
            let (id, gamepad) = &gamepads[0];
            info!("Selected gamepad: {} ({})", gamepad.name(), id);
            Some(*id)
        };

        Ok(Self {
            gilrs,
            active_gamepad,
        })
    }
}

impl InputSource for GilrsSource {
    fn poll(&mut self) -> Result<Vec<RawInputEvent>, SourceError> {
        let mut events = Vec::new();

        while let Some(Event { id, event, .. }) = self.gilrs.next_event() {
            if let Some(active_id) = self.active_gamepad {
                if id != active_id {
                    debug!("Skipping event from non-active gamepad: {:?}", id);
                    continue;
                }
            }
            match event {
                EventType::Connected if self.active_gamepad.is_none() => {
                    info!("Controller connected, selecting gamepad {:?}", id);
                    self.active_gamepad = Some(id);
                }
                EventType::Disconnected => {
                    warn!("Active controller disconnected");
                    self.active_gamepad = None;
                }
                _ => {
                    if let Some(raw) = convert_event(event) {
                        events.push(raw);
                    }
                }
            }
        }

        Ok(events)
    }
}

// gilrs reports axes as floats in [-1, 1]; the core contract is integer
// device units, so scale back up to the 16-bit range.
fn scale_axis(value: f32) -> i32 {
    (value.clamp(-1.0, 1.0) * AXIS_MAX as f32) as i32
}

fn convert_event(event: EventType) -> Option<RawInputEvent> {
    match event {
        EventType::AxisChanged(axis, value, _) => {
            let axis = match axis {
                Axis::LeftStickX => AxisId::StickX,
                Axis::LeftStickY => AxisId::StickY,
                Axis::RightZ => AxisId::ExtrudeTrigger,
                Axis::LeftZ => AxisId::RetractTrigger,
                other => {
                    debug!("Ignoring unsupported axis: {:?}", other);
                    return None;
                }
            };
            Some(RawInputEvent::Axis {
                axis,
                value: scale_axis(value),
            })
        }
        EventType::ButtonPressed(button, _) => {
            map_button(button).map(|button| RawInputEvent::Button {
                button,
                pressed: true,
            })
        }
        EventType::ButtonReleased(button, _) => {
            map_button(button).map(|button| RawInputEvent::Button {
                button,
                pressed: false,
            })
        }
        other => {
            debug!("Unhandled event type: {:?}", other);
            None
        }
    }
}

fn map_button(button: Button) -> Option<ButtonId> {
    match button {
        Button::South => Some(ButtonId::PenToggle),
        Button::East => Some(ButtonId::Home),
        Button::Start => Some(ButtonId::EmergencyStop),
        Button::RightTrigger => Some(ButtonId::FeedrateUp),
        Button::LeftTrigger => Some(ButtonId::FeedrateDown),
        _ => None,
    }
}
