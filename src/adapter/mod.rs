//! Adapter context with statum lifecycle
//!
//! One [`GcAdapter`] owns everything belonging to one physical adapter: the
//! two endpoints, the slot table, the rumble state and the presence worker.
//! Nothing is process-wide.
//!
//! # State Machine
//!
//! ```text
//! Attached ──start()──► Running ──shutdown()──► Detached
//! ```
//!
//! # Shutdown order
//!
//! 1. close the send endpoint and drain the outstanding transfer (abort after
//!    `drain_timeout`)
//! 2. stop the transport and kill the receive loop
//! 3. stop the presence worker
//! 4. destroy every virtual device

mod adapter_handle;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use statum::{machine, state};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use adapter_handle::{AdapterHandle, AdapterStatus};

use crate::config::{AdapterConfig, ConfigError};
use crate::controller::{
    DeviceFactory, DeviceIdentity, PresenceTracker, RumbleCoalescer, RumbleError, SlotTable,
};
use crate::lock_unpoisoned;
use crate::protocol::{
    decode, ControllerSnapshot, ProtocolError, IN_PACKET_LEN, OUT_PACKET_LEN, PORT_COUNT,
};
use crate::transport::{InterruptTransport, ReceiveEndpoint, SendEndpoint, TransportError};

/// bcdDevice reported for every virtual pad
const DEVICE_VERSION: u16 = 0x0100;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Rumble error: {0}")]
    Rumble(#[from] RumbleError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Resource error: {0}")]
    Resource(String),
}

/// State reachable from the receive loop, the presence worker and every
/// [`AdapterHandle`].
pub(crate) struct AdapterShared {
    transport: Arc<dyn InterruptTransport>,
    send: Arc<SendEndpoint>,
    rumble: Arc<RumbleCoalescer>,
    table: Arc<Mutex<SlotTable>>,
    snapshot: watch::Sender<ControllerSnapshot>,
    statuses: watch::Sender<[u8; PORT_COUNT]>,
    packets_decoded: AtomicU64,
    packets_dropped: AtomicU64,
    last_packet_at: Mutex<Option<DateTime<Local>>>,
}

impl AdapterShared {
    /// Decode path for one completed read. Only the receive loop calls this,
    /// so snapshots have a single writer.
    fn ingest(&self, packet: &[u8]) {
        let snapshot = match decode(packet) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.packets_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping inbound packet: {}", e);
                return;
            }
        };
        self.packets_decoded.fetch_add(1, Ordering::Relaxed);
        *lock_unpoisoned(&self.last_packet_at) = Some(Local::now());

        let statuses = snapshot.statuses();
        self.statuses.send_if_modified(|current| {
            if *current == statuses {
                return false;
            }
            debug!("Port statuses changed: {:02x?}", statuses);
            *current = statuses;
            true
        });

        lock_unpoisoned(&self.table).fan_out(&snapshot);
        self.snapshot.send_replace(snapshot);
    }

    fn status(&self) -> AdapterStatus {
        let ports = {
            let table = lock_unpoisoned(&self.table);
            (0..PORT_COUNT)
                .filter_map(|port| table.port_status(port))
                .collect()
        };
        let rumble = self.rumble.stats();
        AdapterStatus {
            ports,
            rumble: self.rumble.requested(),
            packets_decoded: self.packets_decoded.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            rumble_packets_sent: rumble.packets_sent,
            send_failures: rumble.send_failures,
            last_packet_at: *lock_unpoisoned(&self.last_packet_at),
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum AdapterState {
    Attached, // Endpoints allocated, nothing in flight
    Running,  // Receive armed, presence worker running, init sent
    Detached, // Transfers drained, devices destroyed
}

#[machine]
pub struct GcAdapter<S: AdapterState> {
    shared: Arc<AdapterShared>,
    receive: ReceiveEndpoint,
    presence: PresenceTracker,
    config: AdapterConfig,
    presence_shutdown: CancellationToken,
    presence_task: Option<JoinHandle<()>>,
}

impl<S: AdapterState> GcAdapter<S> {
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn status(&self) -> AdapterStatus {
        self.shared.status()
    }

    async fn stop_presence(&mut self) {
        self.presence_shutdown.cancel();
        if let Some(task) = self.presence_task.take() {
            if let Err(e) = task.await {
                error!("Presence worker panicked: {}", e);
            }
        }
    }
}

impl GcAdapter<Attached> {
    /// Allocates the per-adapter context on top of `transport`. Devices for
    /// connected controllers are created through `factory`.
    pub fn attach(
        transport: Arc<dyn InterruptTransport>,
        factory: Arc<dyn DeviceFactory>,
        config: AdapterConfig,
    ) -> Result<Self, AdapterError> {
        config.validate()?;
        info!(
            "Attaching adapter {:04x}:{:04x}",
            config.vendor_id, config.product_id
        );

        let send = Arc::new(SendEndpoint::new(Arc::clone(&transport), OUT_PACKET_LEN));
        let rumble = RumbleCoalescer::new(Arc::clone(&send));
        let table = Arc::new(Mutex::new(SlotTable::new()));
        let identity = DeviceIdentity {
            bus: "usb".into(),
            vendor: config.vendor_id,
            product: config.product_id,
            version: DEVICE_VERSION,
        };
        let presence = PresenceTracker::new(
            Arc::clone(&table),
            factory,
            config.device_name.clone(),
            identity,
        );
        let (snapshot, _) = watch::channel(ControllerSnapshot::default());
        let (statuses, _) = watch::channel([0u8; PORT_COUNT]);

        let shared = Arc::new(AdapterShared {
            transport: Arc::clone(&transport),
            send,
            rumble,
            table,
            snapshot,
            statuses,
            packets_decoded: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            last_packet_at: Mutex::new(None),
        });
        let receive = ReceiveEndpoint::new(transport, IN_PACKET_LEN);

        Ok(Self::new(
            shared,
            receive,
            presence,
            config,
            CancellationToken::new(),
            None, // presence_task
        ))
    }

    /// Spawns the presence worker, arms the receive endpoint and sends the
    /// init packet. A failing step undoes the earlier ones in reverse order.
    pub async fn start(mut self) -> Result<GcAdapter<Running>, AdapterError> {
        let statuses = self.shared.statuses.subscribe();
        self.presence_task = Some(
            self.presence
                .clone()
                .spawn(statuses, self.presence_shutdown.clone()),
        );

        let shared = Arc::clone(&self.shared);
        if let Err(e) = self
            .receive
            .submit_receive(move |packet| shared.ingest(packet))
        {
            error!("Failed to arm receive endpoint: {}", e);
            self.stop_presence().await;
            return Err(e.into());
        }

        if let Err(e) = self.shared.rumble.send_init() {
            error!("Failed to send init packet: {}", e);
            self.receive.kill().await;
            self.stop_presence().await;
            return Err(e.into());
        }

        info!("Adapter running");
        Ok(self.transition())
    }
}

impl GcAdapter<Running> {
    pub fn handle(&self) -> AdapterHandle {
        AdapterHandle::new(Arc::clone(&self.shared))
    }

    pub async fn shutdown(mut self) -> GcAdapter<Detached> {
        info!("Shutting down adapter");

        let drain_timeout = self.config.drain_timeout();
        if !self.shared.send.drain(drain_timeout).await {
            warn!("Output transfer did not finish within {:?}", drain_timeout);
        }

        self.shared.transport.shutdown();
        self.receive.kill().await;
        self.stop_presence().await;
        self.presence.release_all().await;

        info!("Adapter detached");
        self.transition()
    }
}
