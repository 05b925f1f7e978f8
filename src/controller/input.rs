//! Virtual input devices and the per-port event fan-out
//!
//! Device (un)registration belongs to the host; the core only sees the
//! [`DeviceFactory`] and [`InputDevice`] seams.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::presence::ConnectionType;
use crate::protocol::{PortData, STATUS_EXTRA_POWER};

/// Buttons in report order: byte 1 bits 0..7, then byte 2 bits 0..3
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Button {
    A,
    B,
    X,
    Y,
    DPadLeft,
    DPadRight,
    DPadDown,
    DPadUp,
    Start,
    /// Z, reported as TR2
    Z,
    /// R shoulder, reported as TR
    R,
    /// L shoulder, reported as TL
    L,
}

impl Button {
    pub const ALL: [Button; 12] = [
        Button::A,
        Button::B,
        Button::X,
        Button::Y,
        Button::DPadLeft,
        Button::DPadRight,
        Button::DPadDown,
        Button::DPadUp,
        Button::Start,
        Button::Z,
        Button::R,
        Button::L,
    ];

    /// Index of the port byte and bit mask carrying this button
    fn location(self) -> (usize, u8) {
        match self {
            Button::A => (1, 1 << 0),
            Button::B => (1, 1 << 1),
            Button::X => (1, 1 << 2),
            Button::Y => (1, 1 << 3),
            Button::DPadLeft => (1, 1 << 4),
            Button::DPadRight => (1, 1 << 5),
            Button::DPadDown => (1, 1 << 6),
            Button::DPadUp => (1, 1 << 7),
            Button::Start => (2, 1 << 0),
            Button::Z => (2, 1 << 1),
            Button::R => (2, 1 << 2),
            Button::L => (2, 1 << 3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    RX,
    RY,
    Z,
    RZ,
}

impl Axis {
    pub const ALL: [Axis; 6] = [Axis::X, Axis::Y, Axis::RX, Axis::RY, Axis::Z, Axis::RZ];

    fn byte_index(self) -> usize {
        match self {
            Axis::X => 3,
            Axis::Y => 4,
            Axis::RX => 5,
            Axis::RY => 6,
            Axis::Z => 7,
            Axis::RZ => 8,
        }
    }

    /// Vertical stick axes grow downwards on the wire.
    fn inverted(self) -> bool {
        matches!(self, Axis::Y | Axis::RY)
    }

    pub fn value(self, data: &PortData) -> i32 {
        let raw = data.bytes()[self.byte_index()];
        if self.inverted() {
            (255 - raw) as i32
        } else {
            raw as i32
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisInfo {
    pub axis: Axis,
    pub min: i32,
    pub max: i32,
    pub fuzz: i32,
    pub flat: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub bus: String,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub name: String,
    pub identity: DeviceIdentity,
    pub buttons: Vec<Button>,
    pub axes: Vec<AxisInfo>,
    pub force_feedback: bool,
}

impl DeviceCapabilities {
    /// Capability set for a controller reporting `status`. Rumble is only
    /// offered to wired controllers with the extra-power line present.
    pub fn for_status(name: &str, identity: DeviceIdentity, status: u8) -> Self {
        let axes = Axis::ALL
            .iter()
            .map(|&axis| {
                let flat = match axis {
                    Axis::Z | Axis::RZ => 0,
                    _ => 16,
                };
                AxisInfo {
                    axis,
                    min: 0,
                    max: 255,
                    fuzz: 16,
                    flat,
                }
            })
            .collect();

        let wired = ConnectionType::from_status(status) == ConnectionType::Wired;

        Self {
            name: name.to_string(),
            identity,
            buttons: Button::ALL.to_vec(),
            axes,
            force_feedback: wired && status & STATUS_EXTRA_POWER != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputEvent {
    Key { button: Button, pressed: bool },
    Abs { axis: Axis, value: i32 },
    /// Marks the end of one coherent frame
    Sync,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Failed to create input device: {0}")]
    Creation(String),

    #[error("Failed to emit input events: {0}")]
    Emit(String),
}

/// A registered virtual input device for one port
pub trait InputDevice: Send + Sync {
    /// Delivers one frame. Called with the enable table locked, so it must not
    /// block.
    fn emit(&self, events: &[InputEvent]) -> Result<(), DeviceError>;
}

/// Host collaborator that registers and unregisters virtual devices. Both
/// calls may block and are never made with a lock held.
pub trait DeviceFactory: Send + Sync {
    fn create_device(
        &self,
        port: u8,
        capabilities: &DeviceCapabilities,
    ) -> Result<Box<dyn InputDevice>, DeviceError>;

    fn destroy_device(&self, port: u8, device: Box<dyn InputDevice>);
}

/// Events for one port group: every button, every axis, then a sync.
pub fn frame_events(data: &PortData) -> Vec<InputEvent> {
    let bytes = data.bytes();
    let mut events = Vec::with_capacity(Button::ALL.len() + Axis::ALL.len() + 1);

    for button in Button::ALL {
        let (index, mask) = button.location();
        events.push(InputEvent::Key {
            button,
            pressed: bytes[index] & mask != 0,
        });
    }
    for axis in Axis::ALL {
        events.push(InputEvent::Abs {
            axis,
            value: axis.value(data),
        });
    }
    events.push(InputEvent::Sync);
    events
}

/// Emits one frame into `device`; emission failures only cost that frame.
pub(crate) fn report_port(port: usize, device: &dyn InputDevice, data: &PortData) {
    if let Err(e) = device.emit(&frame_events(data)) {
        debug!("Port {} dropped a frame: {}", port, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            bus: "usb".into(),
            vendor: 0x057e,
            product: 0x0337,
            version: 0x0100,
        }
    }

    fn value_of(events: &[InputEvent], wanted: Axis) -> i32 {
        events
            .iter()
            .find_map(|event| match event {
                InputEvent::Abs { axis, value } if *axis == wanted => Some(*value),
                _ => None,
            })
            .unwrap()
    }

    fn pressed(events: &[InputEvent], wanted: Button) -> bool {
        events
            .iter()
            .find_map(|event| match event {
                InputEvent::Key { button, pressed } if *button == wanted => Some(*pressed),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn vertical_axes_are_inverted() {
        let data = PortData::new([0x10, 0, 0, 10, 20, 30, 40, 50, 60]);
        let events = frame_events(&data);

        assert_eq!(value_of(&events, Axis::X), 10);
        assert_eq!(value_of(&events, Axis::Y), 235);
        assert_eq!(value_of(&events, Axis::RX), 30);
        assert_eq!(value_of(&events, Axis::RY), 215);
        assert_eq!(value_of(&events, Axis::Z), 50);
        assert_eq!(value_of(&events, Axis::RZ), 60);
    }

    #[test]
    fn centered_frame_values() {
        let data = PortData::new([0x10, 0, 0, 128, 128, 128, 128, 0, 0]);
        let events = frame_events(&data);

        assert_eq!(value_of(&events, Axis::X), 128);
        assert_eq!(value_of(&events, Axis::Y), 127);
        assert_eq!(value_of(&events, Axis::RX), 128);
        assert_eq!(value_of(&events, Axis::RY), 127);
        assert_eq!(value_of(&events, Axis::Z), 0);
        assert_eq!(value_of(&events, Axis::RZ), 0);
    }

    #[test]
    fn buttons_follow_bitmasks() {
        let data = PortData::new([0x10, 0b1000_0001, 0b0000_1010, 0, 0, 0, 0, 0, 0]);
        let events = frame_events(&data);

        assert!(pressed(&events, Button::A));
        assert!(pressed(&events, Button::DPadUp));
        assert!(!pressed(&events, Button::B));
        assert!(pressed(&events, Button::Z));
        assert!(pressed(&events, Button::L));
        assert!(!pressed(&events, Button::Start));
        assert!(!pressed(&events, Button::R));
    }

    #[test]
    fn high_nibble_of_second_byte_is_ignored() {
        let data = PortData::new([0x10, 0, 0xf0, 0, 0, 0, 0, 0, 0]);
        let events = frame_events(&data);
        assert!(Button::ALL.iter().all(|&button| !pressed(&events, button)));
    }

    #[test]
    fn frame_ends_with_single_sync() {
        let events = frame_events(&PortData::default());
        assert_eq!(events.len(), 19);
        assert_eq!(events.last(), Some(&InputEvent::Sync));
        assert_eq!(
            events.iter().filter(|e| **e == InputEvent::Sync).count(),
            1
        );
    }

    #[test]
    fn force_feedback_needs_wired_and_extra_power() {
        let caps = |status| DeviceCapabilities::for_status("pad", identity(), status);

        assert!(caps(0x14).force_feedback);
        assert!(!caps(0x10).force_feedback);
        assert!(!caps(0x24).force_feedback);
        assert!(!caps(0x20).force_feedback);
    }

    #[test]
    fn capability_set_ranges() {
        let caps = DeviceCapabilities::for_status("pad", identity(), 0x10);
        assert_eq!(caps.buttons.len(), 12);
        assert_eq!(caps.axes.len(), 6);
        for info in &caps.axes {
            assert_eq!((info.min, info.max, info.fuzz), (0, 255, 16));
            let expected_flat = if matches!(info.axis, Axis::Z | Axis::RZ) { 0 } else { 16 };
            assert_eq!(info.flat, expected_flat);
        }
    }
}
