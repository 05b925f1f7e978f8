//! In-memory transport for replaying captured traffic and for tests.
//!
//! [`MemoryTransport::pair`] returns the transport side (handed to the
//! adapter) and a [`MemoryPeer`] that plays the hardware: it feeds inbound
//! packets, records outbound ones, and can hold outbound completions until
//! released.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use super::{Completion, InterruptTransport, TransportError};
use crate::lock_unpoisoned;

type Inbound = Result<Vec<u8>, TransportError>;

pub struct MemoryTransport {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    write_control: Arc<WriteControl>,
    shutdown: CancellationToken,
}

struct WriteControl {
    held: AtomicBool,
    gate: Semaphore,
    failures: Mutex<VecDeque<TransportError>>,
}

impl WriteControl {
    fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
            gate: Semaphore::new(0),
            failures: Mutex::new(VecDeque::new()),
        }
    }
}

pub struct MemoryPeer {
    inbound: mpsc::UnboundedSender<Inbound>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    write_control: Arc<WriteControl>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let write_control = Arc::new(WriteControl::new());

        let transport = MemoryTransport {
            inbound: tokio::sync::Mutex::new(inbound_rx),
            outbound: outbound_tx,
            write_control: Arc::clone(&write_control),
            shutdown: CancellationToken::new(),
        };
        let peer = MemoryPeer {
            inbound: inbound_tx,
            outbound: outbound_rx,
            write_control,
        };
        (transport, peer)
    }
}

#[async_trait]
impl InterruptTransport for MemoryTransport {
    async fn read_packet(&self, mut buffer: Vec<u8>) -> Completion {
        let mut inbound = tokio::select! {
            _ = self.shutdown.cancelled() => {
                return Completion::new(buffer, Err(TransportError::Shutdown));
            }
            guard = self.inbound.lock() => guard,
        };

        let next = tokio::select! {
            _ = self.shutdown.cancelled() => {
                return Completion::new(buffer, Err(TransportError::Shutdown));
            }
            next = inbound.recv() => next,
        };

        let status = match next {
            Some(Ok(packet)) if packet.len() > buffer.len() => Err(TransportError::Overflow),
            Some(Ok(packet)) => {
                buffer[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            Some(Err(e)) => Err(e),
            None => Err(TransportError::Disconnected),
        };
        Completion::new(buffer, status)
    }

    async fn write_packet(&self, buffer: Vec<u8>) -> Completion {
        if self.shutdown.is_cancelled() {
            return Completion::new(buffer, Err(TransportError::Shutdown));
        }
        if self.outbound.send(buffer.clone()).is_err() {
            return Completion::new(buffer, Err(TransportError::Disconnected));
        }

        let control = &self.write_control;
        if control.held.load(Ordering::Acquire) {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Completion::new(buffer, Err(TransportError::Shutdown));
                }
                permit = control.gate.acquire() => match permit {
                    Ok(permit) => permit.forget(),
                    Err(_) => return Completion::new(buffer, Err(TransportError::Shutdown)),
                },
            }
        }

        let failure = lock_unpoisoned(&control.failures).pop_front();
        let status = match failure {
            Some(e) => Err(e),
            None => Ok(buffer.len()),
        };
        Completion::new(buffer, status)
    }

    fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl MemoryPeer {
    /// Queues one inbound packet (any length; decoding decides validity).
    pub fn send_packet(&self, packet: impl Into<Vec<u8>>) {
        let _ = self.inbound.send(Ok(packet.into()));
    }

    /// Completes the next read with `error` instead of data.
    pub fn inject_read_error(&self, error: TransportError) {
        let _ = self.inbound.send(Err(error));
    }

    /// Completes the next write with `error` after it was transmitted.
    pub fn fail_next_write(&self, error: TransportError) {
        lock_unpoisoned(&self.write_control.failures).push_back(error);
    }

    /// Writes started after this call stay outstanding until released.
    pub fn hold_writes(&self) {
        self.write_control.held.store(true, Ordering::Release);
    }

    /// Lets `count` held writes complete.
    pub fn release_writes(&self, count: usize) {
        self.write_control.gate.add_permits(count);
    }

    /// Next packet the host transmitted, in submission order.
    pub async fn next_written(&mut self) -> Option<Vec<u8>> {
        self.outbound.recv().await
    }

    pub fn try_written(&mut self) -> Option<Vec<u8>> {
        self.outbound.try_recv().ok()
    }
}
