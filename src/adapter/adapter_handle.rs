//! Cloneable surface of a running adapter
//!
//! Everything outside the adapter talks to it through [`AdapterHandle`]: host
//! force-feedback requests, the 4-byte rumble control blob and the status
//! surfaces.

use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use super::AdapterShared;
use crate::controller::{ConnectionType, PortStatus, RumbleEffect, RumbleError};
use crate::lock_unpoisoned;
use crate::protocol::{ControllerSnapshot, PORT_COUNT};

/// Point-in-time summary of one adapter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterStatus {
    pub ports: Vec<PortStatus>,
    pub rumble: [bool; PORT_COUNT],
    pub packets_decoded: u64,
    pub packets_dropped: u64,
    pub rumble_packets_sent: u64,
    pub send_failures: u64,
    pub last_packet_at: Option<DateTime<Local>>,
}

#[derive(Clone)]
pub struct AdapterHandle {
    shared: Arc<AdapterShared>,
}

impl AdapterHandle {
    pub(crate) fn new(shared: Arc<AdapterShared>) -> Self {
        Self { shared }
    }

    pub fn request_rumble(&self, port: u8, on: bool) -> Result<(), RumbleError> {
        self.shared.rumble.request(port, on)
    }

    /// Entry point for a host force-feedback layer. Ports whose device was
    /// created without force feedback ignore effects.
    pub fn play_effect(&self, port: u8, effect: RumbleEffect) -> Result<(), RumbleError> {
        let force_feedback = lock_unpoisoned(&self.shared.table)
            .port_status(usize::from(port))
            .ok_or(RumbleError::InvalidPort(port))?
            .force_feedback;
        if !force_feedback {
            debug!("Ignoring effect on port {} without force feedback", port);
            return Ok(());
        }
        self.request_rumble(port, effect.is_active())
    }

    /// Currently requested rumble value of every port, one byte each.
    pub fn rumble_blob(&self) -> [u8; PORT_COUNT] {
        self.shared.rumble.requested().map(u8::from)
    }

    /// Applies a 4-byte rumble blob as one coalesced update. Any non-zero
    /// byte turns that port's motor on.
    pub fn write_rumble_blob(&self, bytes: &[u8]) -> Result<usize, RumbleError> {
        let values: [u8; PORT_COUNT] = bytes
            .try_into()
            .map_err(|_| RumbleError::InvalidLength(bytes.len()))?;
        self.shared.rumble.request_all(values.map(|value| value != 0))?;
        Ok(bytes.len())
    }

    pub fn port_status(&self, port: u8) -> Option<PortStatus> {
        lock_unpoisoned(&self.shared.table).port_status(usize::from(port))
    }

    /// Connection text of `port` as of the latest snapshot.
    pub fn status_text(&self, port: u8) -> Option<&'static str> {
        self.shared
            .snapshot
            .borrow()
            .port(usize::from(port))
            .map(|data| ConnectionType::from_status(data.status()).status_text())
    }

    pub fn status(&self) -> AdapterStatus {
        self.shared.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerSnapshot> {
        self.shared.snapshot.subscribe()
    }
}
