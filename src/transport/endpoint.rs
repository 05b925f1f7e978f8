//! Endpoint manager: one receive loop and one single-slot send endpoint
//!
//! ```text
//!            ┌──── resubmit ────┐
//!            ▼                  │
//! ReceiveEndpoint ──► read ──► on_packet(&[u8])
//!
//! SendEndpoint ──► write ──► buffer back into slot ──► on_complete(result)
//! ```
//!
//! The receive side owns its buffer inside the loop task; the send side keeps
//! its buffer in a slot that is empty while a transfer is outstanding. An
//! empty slot is what makes `submit_send` answer [`TransportError::Busy`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::{Completion, InterruptTransport, TransportError};
use crate::lock_unpoisoned;

/// Pause before resubmitting after a failed read
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(10);

pub struct ReceiveEndpoint {
    transport: Arc<dyn InterruptTransport>,
    packet_len: usize,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ReceiveEndpoint {
    pub fn new(transport: Arc<dyn InterruptTransport>, packet_len: usize) -> Self {
        Self {
            transport,
            packet_len,
            shutdown: CancellationToken::new(),
            task: None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Arms the endpoint. Each completed read is handed to `on_packet` with its
    /// actual length, then the buffer is resubmitted until [`kill`] or a
    /// transient transport error.
    ///
    /// [`kill`]: ReceiveEndpoint::kill
    pub fn submit_receive<F>(&mut self, on_packet: F) -> Result<(), TransportError>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        if self.task.is_some() {
            return Err(TransportError::Busy);
        }

        let buffer = vec![0u8; self.packet_len];
        let task = tokio::spawn(receive_loop(
            Arc::clone(&self.transport),
            buffer,
            self.shutdown.clone(),
            on_packet,
        ));
        debug!("Receive endpoint armed ({} byte packets)", self.packet_len);
        self.task = Some(task);
        Ok(())
    }

    /// Stops resubmission and waits for the loop (and the buffer it owns) to
    /// be gone.
    pub async fn kill(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Receive loop panicked: {}", e);
            }
        }
    }
}

async fn receive_loop<F>(
    transport: Arc<dyn InterruptTransport>,
    mut buffer: Vec<u8>,
    shutdown: CancellationToken,
    mut on_packet: F,
) where
    F: FnMut(&[u8]) + Send + 'static,
{
    let packet_len = buffer.len();
    let mut failures: u64 = 0;
    loop {
        let Completion {
            buffer: returned,
            status,
        } = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Receive endpoint killed");
                return;
            }
            completion = transport.read_packet(buffer) => completion,
        };
        buffer = returned;

        match status {
            Ok(len) => {
                if failures > 1 {
                    info!("Controller transfers recovered after {} failures", failures);
                }
                failures = 0;
                on_packet(&buffer[..len.min(buffer.len())]);
            }
            Err(e) if e.is_transient() => {
                debug!("Controller transfer shutting down: {}", e);
                return;
            }
            Err(e) => {
                failures += 1;
                if failures == 1 {
                    warn!("Controller transfer status: {}", e);
                } else {
                    debug!("Controller transfer status: {} ({} in a row)", e, failures);
                }
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        debug!("Receive endpoint killed");
                        return;
                    }
                    _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                }
            }
        }

        if buffer.len() != packet_len {
            buffer.resize(packet_len, 0);
        }
    }
}

struct SendSlot {
    /// `None` while a transfer owns the buffer
    buffer: Option<Vec<u8>>,
    closed: bool,
}

pub struct SendEndpoint {
    transport: Arc<dyn InterruptTransport>,
    packet_len: usize,
    slot: Arc<Mutex<SendSlot>>,
    tracker: TaskTracker,
    abort: CancellationToken,
}

impl SendEndpoint {
    pub fn new(transport: Arc<dyn InterruptTransport>, packet_len: usize) -> Self {
        Self {
            transport,
            packet_len,
            slot: Arc::new(Mutex::new(SendSlot {
                buffer: Some(Vec::with_capacity(packet_len)),
                closed: false,
            })),
            tracker: TaskTracker::new(),
            abort: CancellationToken::new(),
        }
    }

    pub fn is_busy(&self) -> bool {
        lock_unpoisoned(&self.slot).buffer.is_none()
    }

    /// Copies `bytes` into the endpoint buffer and starts the transfer.
    /// `on_complete` runs after the buffer is back in the slot, so it may
    /// submit the next packet right away.
    pub fn submit_send<F>(&self, bytes: &[u8], on_complete: F) -> Result<(), TransportError>
    where
        F: FnOnce(Result<(), TransportError>) + Send + 'static,
    {
        if bytes.len() > self.packet_len {
            return Err(TransportError::PacketTooLarge {
                len: bytes.len(),
                max: self.packet_len,
            });
        }

        let mut buffer = {
            let mut slot = lock_unpoisoned(&self.slot);
            if slot.closed {
                return Err(TransportError::Shutdown);
            }
            slot.buffer.take().ok_or(TransportError::Busy)?
        };
        buffer.clear();
        buffer.extend_from_slice(bytes);
        debug!("Submitting output packet {:02x?}", buffer);

        let transport = Arc::clone(&self.transport);
        let slot = Arc::clone(&self.slot);
        let abort = self.abort.clone();
        self.tracker.spawn(async move {
            let status = tokio::select! {
                biased;
                completion = transport.write_packet(buffer) => {
                    let Completion { buffer, status } = completion;
                    lock_unpoisoned(&slot).buffer = Some(buffer);
                    status.map(|_| ())
                }
                _ = abort.cancelled() => {
                    debug!("Output transfer aborted");
                    Err(TransportError::Cancelled)
                }
            };
            on_complete(status);
        });
        Ok(())
    }

    /// Refuses any further submission.
    pub fn close(&self) {
        lock_unpoisoned(&self.slot).closed = true;
    }

    /// Closes the endpoint and waits for the outstanding transfer. After
    /// `timeout` the transfer is aborted and waited for again. Returns `true`
    /// when everything completed on its own.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.close();
        self.tracker.close();

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                debug!("Output endpoint drained");
                true
            }
            Err(_) => {
                warn!(
                    "Timed out after {:?} waiting for output transfer to complete, killing",
                    timeout
                );
                self.abort.cancel();
                self.tracker.wait().await;
                info!("Output transfer aborted");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn receive_resubmits_after_each_packet() {
        let (transport, peer) = MemoryTransport::pair();
        let mut endpoint = ReceiveEndpoint::new(Arc::new(transport), 4);
        let (tx, mut rx) = mpsc::unbounded_channel();

        endpoint
            .submit_receive(move |packet| {
                let _ = tx.send(packet.to_vec());
            })
            .unwrap();
        assert!(endpoint.is_armed());
        assert_eq!(
            endpoint.submit_receive(|_| {}),
            Err(TransportError::Busy)
        );

        peer.send_packet([1, 2, 3, 4]);
        peer.send_packet([5, 6]);
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(rx.recv().await.unwrap(), vec![5, 6]);

        endpoint.kill().await;
        assert!(!endpoint.is_armed());
    }

    #[tokio::test]
    async fn receive_continues_after_unexpected_error_and_stops_on_transient() {
        let (transport, peer) = MemoryTransport::pair();
        let mut endpoint = ReceiveEndpoint::new(Arc::new(transport), 4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        endpoint
            .submit_receive(move |packet| {
                let _ = tx.send(packet.to_vec());
            })
            .unwrap();

        peer.inject_read_error(TransportError::Stall);
        peer.send_packet([9]);
        assert_eq!(rx.recv().await.unwrap(), vec![9]);

        peer.inject_read_error(TransportError::Disconnected);
        peer.send_packet([10]);
        // The loop ended on the disconnect; the sender was dropped with it.
        assert_eq!(rx.recv().await, None);
        endpoint.kill().await;
    }

    #[tokio::test]
    async fn repeated_receive_errors_back_off() {
        let (transport, peer) = MemoryTransport::pair();
        let mut endpoint = ReceiveEndpoint::new(Arc::new(transport), 4);
        let (tx, mut rx) = mpsc::unbounded_channel();

        for _ in 0..3 {
            peer.inject_read_error(TransportError::Io("babble".into()));
        }
        peer.send_packet([7]);

        let started = tokio::time::Instant::now();
        endpoint
            .submit_receive(move |packet| {
                let _ = tx.send(packet.to_vec());
            })
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![7]);
        assert!(started.elapsed() >= RECEIVE_ERROR_BACKOFF * 3);

        endpoint.kill().await;
        assert!(!endpoint.is_armed());
    }

    #[tokio::test]
    async fn kill_interrupts_error_backoff() {
        let (transport, peer) = MemoryTransport::pair();
        let mut endpoint = ReceiveEndpoint::new(Arc::new(transport), 4);
        peer.inject_read_error(TransportError::Stall);
        endpoint.submit_receive(|_| {}).unwrap();
        tokio::task::yield_now().await;

        tokio::time::timeout(Duration::from_secs(1), endpoint.kill())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn send_is_single_slot() {
        let (transport, mut peer) = MemoryTransport::pair();
        peer.hold_writes();
        let endpoint = SendEndpoint::new(Arc::new(transport), 5);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let done = tx.clone();
        endpoint
            .submit_send(&[0x11, 1, 0, 0, 0], move |result| {
                let _ = done.send(result);
            })
            .unwrap();
        assert!(endpoint.is_busy());
        assert_eq!(
            endpoint.submit_send(&[0x13], |_| {}),
            Err(TransportError::Busy)
        );
        assert_eq!(peer.next_written().await.unwrap(), vec![0x11, 1, 0, 0, 0]);

        peer.release_writes(1);
        assert_eq!(rx.recv().await.unwrap(), Ok(()));
        assert!(!endpoint.is_busy());

        endpoint
            .submit_send(&[0x13], move |result| {
                let _ = tx.send(result);
            })
            .unwrap();
        assert_eq!(peer.next_written().await.unwrap(), vec![0x13]);
        peer.release_writes(1);
        assert_eq!(rx.recv().await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn send_rejects_oversized_packets() {
        let (transport, _peer) = MemoryTransport::pair();
        let endpoint = SendEndpoint::new(Arc::new(transport), 5);
        assert_eq!(
            endpoint.submit_send(&[0; 6], |_| {}),
            Err(TransportError::PacketTooLarge { len: 6, max: 5 })
        );
    }

    #[tokio::test]
    async fn send_reports_errors_upward() {
        let (transport, peer) = MemoryTransport::pair();
        peer.fail_next_write(TransportError::Stall);
        let endpoint = SendEndpoint::new(Arc::new(transport), 5);
        let (tx, mut rx) = mpsc::unbounded_channel();
        endpoint
            .submit_send(&[0x13], move |result| {
                let _ = tx.send(result);
            })
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), Err(TransportError::Stall));
        assert!(!endpoint.is_busy());
    }

    #[tokio::test]
    async fn drain_aborts_after_timeout() {
        let (transport, peer) = MemoryTransport::pair();
        peer.hold_writes();
        let endpoint = SendEndpoint::new(Arc::new(transport), 5);
        let (tx, mut rx) = mpsc::unbounded_channel();
        endpoint
            .submit_send(&[0x13], move |result| {
                let _ = tx.send(result);
            })
            .unwrap();

        let started = tokio::time::Instant::now();
        let drained = endpoint.drain(Duration::from_millis(50)).await;
        assert!(!drained);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(rx.recv().await.unwrap(), Err(TransportError::Cancelled));
        assert_eq!(
            endpoint.submit_send(&[0x13], |_| {}),
            Err(TransportError::Shutdown)
        );
    }

    #[tokio::test]
    async fn drain_returns_once_transfer_completes() {
        let (transport, mut peer) = MemoryTransport::pair();
        peer.hold_writes();
        let endpoint = Arc::new(SendEndpoint::new(Arc::new(transport), 5));
        endpoint.submit_send(&[0x13], |_| {}).unwrap();

        let draining = {
            let endpoint = Arc::clone(&endpoint);
            tokio::spawn(async move { endpoint.drain(Duration::from_secs(5)).await })
        };
        peer.next_written().await.unwrap();
        peer.release_writes(1);
        assert!(draining.await.unwrap());
    }
}
