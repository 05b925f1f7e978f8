//! Rumble request coalescing
//!
//! Requests only update per-port values and dirty flags. At most one output
//! packet is outstanding; when it completes, anything that became dirty in
//! the meantime goes out as one consolidated packet. The dirty flags and the
//! in-flight flag live behind one mutex so a completion can never miss a
//! request that raced with it. A packet the adapter rejected is resent, with
//! whatever changed since, after a short pause.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::lock_unpoisoned;
use crate::protocol::{encode_init, encode_rumble, PORT_COUNT};
use crate::transport::{SendEndpoint, TransportError};

/// Pause before resending values whose packet failed
const RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RumbleError {
    #[error("Invalid port {0}")]
    InvalidPort(u8),

    #[error("Rumble state must be exactly {expected} bytes, got {0}", expected = PORT_COUNT)]
    InvalidLength(usize),

    #[error("Failed to send rumble packet: {0}")]
    Send(#[from] TransportError),
}

/// Force-feedback effect as a host input layer describes it. The motor is
/// either on or off, so any non-zero magnitude means on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RumbleEffect {
    pub strong_magnitude: u16,
    pub weak_magnitude: u16,
}

impl RumbleEffect {
    pub fn is_active(&self) -> bool {
        self.strong_magnitude != 0 || self.weak_magnitude != 0
    }
}

#[derive(Debug, Default)]
struct RumbleState {
    requested: [bool; PORT_COUNT],
    dirty: [bool; PORT_COUNT],
    in_flight: bool,
    packets_sent: u64,
    send_failures: u64,
}

impl RumbleState {
    fn any_dirty(&self) -> bool {
        self.dirty.iter().any(|&dirty| dirty)
    }

    /// Marks the ports of a packet that never reached the adapter as dirty
    /// again.
    fn restore(&mut self, taken: [bool; PORT_COUNT]) {
        for (dirty, was_taken) in self.dirty.iter_mut().zip(taken) {
            *dirty |= was_taken;
        }
    }

    /// Takes every dirty flag and claims the output endpoint.
    fn consolidate(&mut self) -> ([u8; 5], [bool; PORT_COUNT]) {
        let taken = std::mem::take(&mut self.dirty);
        self.in_flight = true;
        (encode_rumble(self.requested), taken)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RumbleStats {
    pub packets_sent: u64,
    pub send_failures: u64,
}

pub struct RumbleCoalescer {
    state: Mutex<RumbleState>,
    endpoint: Arc<SendEndpoint>,
}

impl RumbleCoalescer {
    pub fn new(endpoint: Arc<SendEndpoint>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RumbleState::default()),
            endpoint,
        })
    }

    /// Sends the init command. It occupies the output endpoint like any
    /// rumble packet, so requests made meanwhile are coalesced behind it.
    pub fn send_init(self: &Arc<Self>) -> Result<(), RumbleError> {
        {
            let mut state = lock_unpoisoned(&self.state);
            if state.in_flight {
                return Err(RumbleError::Send(TransportError::Busy));
            }
            state.in_flight = true;
        }

        let this = Arc::clone(self);
        let submitted = self
            .endpoint
            .submit_send(&encode_init(), move |status| {
                this.on_send_complete(status, [false; PORT_COUNT])
            });
        if let Err(e) = submitted {
            lock_unpoisoned(&self.state).in_flight = false;
            return Err(e.into());
        }
        info!("Init packet sent");
        Ok(())
    }

    pub fn request(self: &Arc<Self>, port: u8, on: bool) -> Result<(), RumbleError> {
        let index = usize::from(port);
        if index >= PORT_COUNT {
            return Err(RumbleError::InvalidPort(port));
        }

        let packet = {
            let mut state = lock_unpoisoned(&self.state);
            if state.requested[index] == on {
                return Ok(());
            }
            state.requested[index] = on;
            state.dirty[index] = true;
            debug!("Rumble port {} -> {}", port, on);
            (!state.in_flight).then(|| state.consolidate())
        };

        match packet {
            Some((packet, taken)) => self.submit(packet, taken),
            None => Ok(()),
        }
    }

    /// Applies all four values at once; at most one packet results.
    pub fn request_all(self: &Arc<Self>, values: [bool; PORT_COUNT]) -> Result<(), RumbleError> {
        let packet = {
            let mut state = lock_unpoisoned(&self.state);
            for (index, &on) in values.iter().enumerate() {
                if state.requested[index] != on {
                    state.requested[index] = on;
                    state.dirty[index] = true;
                }
            }
            (state.any_dirty() && !state.in_flight).then(|| state.consolidate())
        };

        match packet {
            Some((packet, taken)) => self.submit(packet, taken),
            None => Ok(()),
        }
    }

    pub fn requested(&self) -> [bool; PORT_COUNT] {
        lock_unpoisoned(&self.state).requested
    }

    pub fn is_in_flight(&self) -> bool {
        lock_unpoisoned(&self.state).in_flight
    }

    pub fn stats(&self) -> RumbleStats {
        let state = lock_unpoisoned(&self.state);
        RumbleStats {
            packets_sent: state.packets_sent,
            send_failures: state.send_failures,
        }
    }

    fn submit(self: &Arc<Self>, packet: [u8; 5], taken: [bool; PORT_COUNT]) -> Result<(), RumbleError> {
        let this = Arc::clone(self);
        let submitted = self
            .endpoint
            .submit_send(&packet, move |status| this.on_send_complete(status, taken));

        if let Err(e) = submitted {
            // Nothing went out: give the endpoint back and keep the values
            // pending for the next request.
            let mut state = lock_unpoisoned(&self.state);
            state.in_flight = false;
            state.restore(taken);
            debug!("Rumble packet not submitted: {}", e);
            return Err(e.into());
        }
        Ok(())
    }

    fn on_send_complete(
        self: &Arc<Self>,
        status: Result<(), TransportError>,
        taken: [bool; PORT_COUNT],
    ) {
        {
            let mut state = lock_unpoisoned(&self.state);
            match &status {
                Ok(()) => state.packets_sent += 1,
                Err(e) if e.is_transient() => {
                    debug!("Rumble transfer shutting down: {}", e);
                    state.in_flight = false;
                    return;
                }
                Err(e) => {
                    error!("Rumble transfer failed, resending: {}", e);
                    state.send_failures += 1;
                    state.restore(taken);
                    // The endpoint stays claimed until the retry runs, so
                    // requests made meanwhile join it.
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        tokio::time::sleep(RETRY_DELAY).await;
                        this.send_pending();
                    });
                    return;
                }
            }
        }
        self.send_pending();
    }

    /// Sends every dirty port as one packet, or releases the endpoint when
    /// nothing is pending. Only called while the endpoint is claimed.
    fn send_pending(self: &Arc<Self>) {
        let packet = {
            let mut state = lock_unpoisoned(&self.state);
            if state.any_dirty() {
                Some(state.consolidate())
            } else {
                state.in_flight = false;
                None
            }
        };

        if let Some((packet, taken)) = packet {
            match self.submit(packet, taken) {
                Ok(()) | Err(RumbleError::Send(TransportError::Shutdown)) => {}
                Err(e) => error!("Failed to resend coalesced rumble packet: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryPeer, MemoryTransport};
    use std::time::Duration;

    fn coalescer() -> (Arc<RumbleCoalescer>, MemoryPeer) {
        let (transport, peer) = MemoryTransport::pair();
        let endpoint = Arc::new(SendEndpoint::new(Arc::new(transport), 5));
        (RumbleCoalescer::new(endpoint), peer)
    }

    async fn settle(rumble: &RumbleCoalescer) {
        for _ in 0..200 {
            if !rumble.is_in_flight() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("rumble sends never settled");
    }

    #[tokio::test]
    async fn rejects_ports_outside_adapter() {
        let (rumble, _peer) = coalescer();
        assert_eq!(rumble.request(4, true), Err(RumbleError::InvalidPort(4)));
        assert_eq!(rumble.requested(), [false; 4]);
    }

    #[tokio::test]
    async fn repeated_request_sends_once() {
        let (rumble, mut peer) = coalescer();
        rumble.request(0, true).unwrap();
        settle(&rumble).await;
        rumble.request(0, true).unwrap();
        settle(&rumble).await;

        assert_eq!(peer.next_written().await.unwrap(), vec![0x11, 1, 0, 0, 0]);
        assert_eq!(peer.try_written(), None);
        assert_eq!(rumble.stats().packets_sent, 1);
    }

    #[tokio::test]
    async fn requests_during_a_send_are_coalesced() {
        let (rumble, mut peer) = coalescer();
        peer.hold_writes();

        rumble.request(0, true).unwrap();
        assert_eq!(peer.next_written().await.unwrap(), vec![0x11, 1, 0, 0, 0]);

        rumble.request(1, true).unwrap();
        rumble.request(2, true).unwrap();
        rumble.request(3, true).unwrap();
        assert_eq!(peer.try_written(), None);

        peer.release_writes(1);
        assert_eq!(peer.next_written().await.unwrap(), vec![0x11, 1, 1, 1, 1]);
        peer.release_writes(1);
        settle(&rumble).await;
        assert_eq!(peer.try_written(), None);
        assert_eq!(rumble.stats().packets_sent, 2);
    }

    #[tokio::test]
    async fn toggling_back_while_in_flight_still_converges() {
        let (rumble, mut peer) = coalescer();
        peer.hold_writes();

        rumble.request(2, true).unwrap();
        peer.next_written().await.unwrap();
        rumble.request(2, false).unwrap();

        peer.release_writes(2);
        assert_eq!(peer.next_written().await.unwrap(), vec![0x11, 0, 0, 0, 0]);
        settle(&rumble).await;
        assert_eq!(rumble.requested(), [false; 4]);
    }

    #[tokio::test]
    async fn init_packet_holds_the_endpoint() {
        let (rumble, mut peer) = coalescer();
        peer.hold_writes();

        rumble.send_init().unwrap();
        assert_eq!(peer.next_written().await.unwrap(), vec![0x13]);
        rumble.request(1, true).unwrap();
        assert_eq!(peer.try_written(), None);

        peer.release_writes(2);
        assert_eq!(peer.next_written().await.unwrap(), vec![0x11, 0, 1, 0, 0]);
        settle(&rumble).await;
    }

    #[tokio::test]
    async fn request_all_produces_one_packet() {
        let (rumble, mut peer) = coalescer();
        rumble.request_all([true, false, true, false]).unwrap();
        settle(&rumble).await;
        rumble.request_all([true, false, true, false]).unwrap();
        settle(&rumble).await;

        assert_eq!(peer.next_written().await.unwrap(), vec![0x11, 1, 0, 1, 0]);
        assert_eq!(peer.try_written(), None);
    }

    #[tokio::test]
    async fn failed_send_is_resent_until_it_lands() {
        let (rumble, mut peer) = coalescer();
        peer.fail_next_write(TransportError::Stall);

        rumble.request(0, true).unwrap();
        assert_eq!(peer.next_written().await.unwrap(), vec![0x11, 1, 0, 0, 0]);
        assert_eq!(peer.next_written().await.unwrap(), vec![0x11, 1, 0, 0, 0]);
        settle(&rumble).await;

        assert_eq!(
            rumble.stats(),
            RumbleStats {
                packets_sent: 1,
                send_failures: 1
            }
        );
        assert_eq!(peer.try_written(), None);
    }

    #[tokio::test]
    async fn requests_during_retry_join_the_resend() {
        let (rumble, mut peer) = coalescer();
        peer.fail_next_write(TransportError::Timeout);

        rumble.request(0, true).unwrap();
        assert_eq!(peer.next_written().await.unwrap(), vec![0x11, 1, 0, 0, 0]);
        rumble.request(1, true).unwrap();

        assert_eq!(peer.next_written().await.unwrap(), vec![0x11, 1, 1, 0, 0]);
        settle(&rumble).await;
        assert_eq!(peer.try_written(), None);
    }

    #[tokio::test]
    async fn failed_init_is_not_repeated() {
        let (rumble, mut peer) = coalescer();
        peer.fail_next_write(TransportError::Stall);

        rumble.send_init().unwrap();
        assert_eq!(peer.next_written().await.unwrap(), vec![0x13]);
        settle(&rumble).await;
        assert_eq!(peer.try_written(), None);
        assert_eq!(rumble.stats().send_failures, 1);
    }

    #[tokio::test]
    async fn closed_endpoint_keeps_values_pending() {
        let (transport, _peer) = MemoryTransport::pair();
        let endpoint = Arc::new(SendEndpoint::new(Arc::new(transport), 5));
        endpoint.close();
        let rumble = RumbleCoalescer::new(endpoint);

        assert_eq!(
            rumble.request(0, true),
            Err(RumbleError::Send(TransportError::Shutdown))
        );
        assert!(!rumble.is_in_flight());
        assert_eq!(rumble.requested(), [true, false, false, false]);
    }

    #[test]
    fn effect_magnitudes_normalize_to_on_off() {
        assert!(!RumbleEffect::default().is_active());
        assert!(RumbleEffect {
            strong_magnitude: 1,
            weak_magnitude: 0
        }
        .is_active());
        assert!(RumbleEffect {
            strong_magnitude: 0,
            weak_magnitude: 0x8000
        }
        .is_active());
    }
}
