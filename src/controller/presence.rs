//! Per-port presence tracking
//!
//! Every port runs the same small state machine, driven by the type bits of
//! its status byte:
//!
//! ```text
//!                 create device
//! Disconnected ──────────────────► Wired | Wireless
//!      ▲                                 │
//!      └──────── destroy device ─────────┘
//! ```
//!
//! Device creation and destruction may block, so both happen outside the
//! table lock; the resulting slots for all four ports are swapped in during
//! one locked pass.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::input::{report_port, DeviceCapabilities, DeviceError, DeviceFactory, DeviceIdentity, InputDevice};
use crate::lock_unpoisoned;
use crate::protocol::{
    ControllerSnapshot, PORT_COUNT, STATUS_TYPE_MASK, STATUS_WIRED, STATUS_WIRELESS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionType {
    #[default]
    None,
    Wired,
    Wireless,
}

impl ConnectionType {
    /// Exact match on the type bits; a status carrying both bits is treated
    /// as nothing connected.
    pub fn from_status(status: u8) -> Self {
        match status & STATUS_TYPE_MASK {
            STATUS_WIRED => ConnectionType::Wired,
            STATUS_WIRELESS => ConnectionType::Wireless,
            _ => ConnectionType::None,
        }
    }

    pub fn is_connected(self) -> bool {
        self != ConnectionType::None
    }

    pub fn status_text(self) -> &'static str {
        match self {
            ConnectionType::Wired => "Connected\n",
            ConnectionType::Wireless => "Connected (Wireless)\n",
            ConnectionType::None => "Disconnected\n",
        }
    }
}

#[derive(Default)]
pub struct ControllerSlot {
    connection: ConnectionType,
    enabled: bool,
    force_feedback: bool,
    device: Option<Box<dyn InputDevice>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatus {
    pub port: u8,
    pub connection: ConnectionType,
    pub enabled: bool,
    pub force_feedback: bool,
}

/// Enable flags and device handles of all four ports, shared between the
/// presence worker (writer) and the input fan-out (reader).
#[derive(Default)]
pub struct SlotTable {
    slots: [ControllerSlot; PORT_COUNT],
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port_status(&self, port: usize) -> Option<PortStatus> {
        self.slots.get(port).map(|slot| PortStatus {
            port: port as u8,
            connection: slot.connection,
            enabled: slot.enabled,
            force_feedback: slot.force_feedback,
        })
    }

    pub fn enabled(&self) -> [bool; PORT_COUNT] {
        let mut enabled = [false; PORT_COUNT];
        for (flag, slot) in enabled.iter_mut().zip(self.slots.iter()) {
            *flag = slot.enabled;
        }
        enabled
    }

    /// Emits one frame per enabled port. Returns the number of ports reported.
    pub(crate) fn fan_out(&self, snapshot: &ControllerSnapshot) -> usize {
        let mut reported = 0;
        for (port, (slot, data)) in self.slots.iter().zip(snapshot.ports()).enumerate() {
            if !slot.enabled {
                continue;
            }
            if let Some(device) = &slot.device {
                report_port(port, device.as_ref(), data);
                reported += 1;
            }
        }
        reported
    }
}

/// Ports that changed in one [`PresenceTracker::apply`] pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceReport {
    pub connected: Vec<u8>,
    pub disconnected: Vec<u8>,
    pub failed: Vec<u8>,
}

#[derive(Clone)]
pub struct PresenceTracker {
    table: Arc<Mutex<SlotTable>>,
    factory: Arc<dyn DeviceFactory>,
    device_name: String,
    identity: DeviceIdentity,
}

impl PresenceTracker {
    pub fn new(
        table: Arc<Mutex<SlotTable>>,
        factory: Arc<dyn DeviceFactory>,
        device_name: impl Into<String>,
        identity: DeviceIdentity,
    ) -> Self {
        Self {
            table,
            factory,
            device_name: device_name.into(),
            identity,
        }
    }

    /// Brings the slot table in line with the given status bytes.
    pub async fn apply(&self, statuses: [u8; PORT_COUNT]) -> PresenceReport {
        let mut report = PresenceReport::default();
        let (current, enabled) = {
            let table = lock_unpoisoned(&self.table);
            let mut current = [ConnectionType::None; PORT_COUNT];
            for (connection, slot) in current.iter_mut().zip(table.slots.iter()) {
                *connection = slot.connection;
            }
            (current, table.enabled())
        };

        let mut replacements = Vec::new();
        for port in 0..PORT_COUNT {
            let desired = ConnectionType::from_status(statuses[port]);
            if desired == current[port] {
                continue;
            }
            debug!(
                "Port {} changed: {:?} -> {:?} (status 0x{:02x})",
                port, current[port], desired, statuses[port]
            );
            if enabled[port] {
                report.disconnected.push(port as u8);
            }

            let mut slot = ControllerSlot {
                connection: desired,
                ..ControllerSlot::default()
            };
            if desired.is_connected() {
                let capabilities = DeviceCapabilities::for_status(
                    &self.device_name,
                    self.identity.clone(),
                    statuses[port],
                );
                let force_feedback = capabilities.force_feedback;
                match self.create(port as u8, capabilities).await {
                    Ok(device) => {
                        info!(
                            "Controller connected on port {} ({:?}, rumble: {})",
                            port, desired, force_feedback
                        );
                        slot.enabled = true;
                        slot.force_feedback = force_feedback;
                        slot.device = Some(device);
                        report.connected.push(port as u8);
                    }
                    Err(e) => {
                        warn!("Port {} disabled: {}", port, e);
                        report.failed.push(port as u8);
                    }
                }
            }
            replacements.push((port, slot));
        }

        if replacements.is_empty() {
            return report;
        }

        let removed: Vec<(u8, Box<dyn InputDevice>)> = {
            let mut table = lock_unpoisoned(&self.table);
            replacements
                .into_iter()
                .filter_map(|(port, slot)| {
                    let old = std::mem::replace(&mut table.slots[port], slot);
                    old.device.map(|device| (port as u8, device))
                })
                .collect()
        };

        for (port, device) in removed {
            info!("Controller disconnected from port {}", port);
            self.destroy(port, device).await;
        }
        report
    }

    /// Disables every port and destroys all devices.
    pub async fn release_all(&self) {
        let removed: Vec<(u8, Box<dyn InputDevice>)> = {
            let mut table = lock_unpoisoned(&self.table);
            table
                .slots
                .iter_mut()
                .enumerate()
                .filter_map(|(port, slot)| {
                    std::mem::take(slot).device.map(|device| (port as u8, device))
                })
                .collect()
        };
        for (port, device) in removed {
            debug!("Releasing input device of port {}", port);
            self.destroy(port, device).await;
        }
    }

    /// Runs [`apply`] for every status change until `shutdown` fires.
    /// Changes arriving faster than devices can be created are collapsed into
    /// the latest statuses.
    ///
    /// [`apply`]: PresenceTracker::apply
    pub fn spawn(
        self,
        mut statuses: watch::Receiver<[u8; PORT_COUNT]>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Presence worker started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = statuses.changed() => {
                        if changed.is_err() {
                            debug!("Status channel closed");
                            break;
                        }
                        let latest = *statuses.borrow_and_update();
                        self.apply(latest).await;
                    }
                }
            }
            info!("Presence worker stopped");
        })
    }

    async fn create(
        &self,
        port: u8,
        capabilities: DeviceCapabilities,
    ) -> Result<Box<dyn InputDevice>, DeviceError> {
        let factory = Arc::clone(&self.factory);
        tokio::task::spawn_blocking(move || factory.create_device(port, &capabilities))
            .await
            .map_err(|e| DeviceError::Creation(format!("creation task failed: {}", e)))?
    }

    async fn destroy(&self, port: u8, device: Box<dyn InputDevice>) {
        let factory = Arc::clone(&self.factory);
        if let Err(e) =
            tokio::task::spawn_blocking(move || factory.destroy_device(port, device)).await
        {
            error!("Failed to destroy input device of port {}: {}", port, e);
        }
    }
}
