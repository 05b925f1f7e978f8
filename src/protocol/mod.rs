//! Wire format of the adapter
//!
//! The adapter answers every poll with a fixed 37-byte report and accepts
//! two outbound commands:
//!
//! ```text
//! inbound   [0x21][port 0: status + 8 data][port 1 ...][port 2 ...][port 3 ...]
//! rumble    [0x11][r0][r1][r2][r3]
//! init      [0x13]
//! ```
//!
//! Each port group is 9 bytes at offset `1 + 9 * port`: one status byte
//! followed by two button bytes and six analog bytes.

use thiserror::Error;

pub const PORT_COUNT: usize = 4;
pub const PORT_DATA_LEN: usize = 9;

pub const IN_PACKET_LEN: usize = 37;
pub const OUT_PACKET_LEN: usize = 5;

pub const OPCODE_POLL: u8 = 0x21;
pub const OPCODE_RUMBLE: u8 = 0x11;
pub const OPCODE_INIT: u8 = 0x13;

/// Status bits of a port group
pub const STATUS_EXTRA_POWER: u8 = 0x04;
pub const STATUS_WIRED: u8 = 0x10;
pub const STATUS_WIRELESS: u8 = 0x20;
pub const STATUS_TYPE_MASK: u8 = STATUS_WIRED | STATUS_WIRELESS;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Bad sized packet: expected {expected} bytes, got {actual}")]
    BadLength { expected: usize, actual: usize },

    #[error("Unknown opcode 0x{0:02x}")]
    BadOpcode(u8),
}

/// One port's slice of an inbound report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortData {
    bytes: [u8; PORT_DATA_LEN],
}

impl PortData {
    pub fn new(bytes: [u8; PORT_DATA_LEN]) -> Self {
        Self { bytes }
    }

    pub fn status(&self) -> u8 {
        self.bytes[0]
    }

    /// Raw group bytes, status byte included (index 0)
    pub fn bytes(&self) -> &[u8; PORT_DATA_LEN] {
        &self.bytes
    }

    pub fn has_extra_power(&self) -> bool {
        self.status() & STATUS_EXTRA_POWER != 0
    }
}

/// Decoded state of all four ports from one inbound report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerSnapshot {
    ports: [PortData; PORT_COUNT],
}

impl ControllerSnapshot {
    pub fn port(&self, port: usize) -> Option<&PortData> {
        self.ports.get(port)
    }

    pub fn ports(&self) -> &[PortData; PORT_COUNT] {
        &self.ports
    }

    pub fn statuses(&self) -> [u8; PORT_COUNT] {
        let mut statuses = [0u8; PORT_COUNT];
        for (status, data) in statuses.iter_mut().zip(self.ports.iter()) {
            *status = data.status();
        }
        statuses
    }
}

/// Validates a poll report and slices it into the four port groups.
pub fn decode(packet: &[u8]) -> Result<ControllerSnapshot, ProtocolError> {
    if packet.len() != IN_PACKET_LEN {
        return Err(ProtocolError::BadLength {
            expected: IN_PACKET_LEN,
            actual: packet.len(),
        });
    }
    if packet[0] != OPCODE_POLL {
        return Err(ProtocolError::BadOpcode(packet[0]));
    }

    let mut ports = [PortData::default(); PORT_COUNT];
    for (index, chunk) in packet[1..].chunks_exact(PORT_DATA_LEN).enumerate() {
        let mut bytes = [0u8; PORT_DATA_LEN];
        bytes.copy_from_slice(chunk);
        ports[index] = PortData::new(bytes);
    }
    Ok(ControllerSnapshot { ports })
}

pub fn encode_rumble(values: [bool; PORT_COUNT]) -> [u8; OUT_PACKET_LEN] {
    [
        OPCODE_RUMBLE,
        values[0] as u8,
        values[1] as u8,
        values[2] as u8,
        values[3] as u8,
    ]
}

pub fn encode_init() -> [u8; 1] {
    [OPCODE_INIT]
}
