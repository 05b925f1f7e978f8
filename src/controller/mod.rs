//! Controller subsystem: everything that happens per port
//!
//! 1. [`presence`] - connect / disconnect tracking and device lifecycle
//! 2. [`input`] - capability sets, the host device seams and the event fan-out
//! 3. [`rumble`] - coalesced force-feedback output
//! 4. [`virtual_pad`] - channel-backed device factory
//!
//! # Architecture
//!
//! ```text
//! statuses ──► PresenceTracker ──► SlotTable ◄── fan-out ◄── snapshot
//!                    │                 │
//!              DeviceFactory      InputDevice::emit
//! ```

pub mod input;
pub mod presence;
pub mod rumble;
pub mod virtual_pad;

pub use input::{
    frame_events, Axis, AxisInfo, Button, DeviceCapabilities, DeviceError, DeviceFactory,
    DeviceIdentity, InputDevice, InputEvent,
};
pub use presence::{ConnectionType, PortStatus, PresenceReport, PresenceTracker, SlotTable};
pub use rumble::{RumbleCoalescer, RumbleEffect, RumbleError, RumbleStats};
pub use virtual_pad::{ChannelDeviceFactory, PadEvent, PadEventKind};
