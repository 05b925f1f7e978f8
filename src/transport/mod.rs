//! Interrupt transport to the adapter
//!
//! The transport is a collaborator: something that can move one fixed-size
//! packet in each direction. Buffers are passed by value into a transfer and
//! handed back in its [`Completion`], so a buffer can never be released while
//! the transfer that uses it is outstanding.
//!
//! [`endpoint`] builds the receive loop and the single-slot send endpoint on
//! top of any [`InterruptTransport`].

pub mod endpoint;
pub mod memory;
#[cfg(feature = "usb")]
pub mod usb;

use async_trait::async_trait;
use thiserror::Error;

pub use endpoint::{ReceiveEndpoint, SendEndpoint};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Device disconnected")]
    Disconnected,

    #[error("Transport shutting down")]
    Shutdown,

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Transfer overflow")]
    Overflow,

    #[error("Endpoint stalled")]
    Stall,

    #[error("Transfer timed out")]
    Timeout,

    #[error("A send is already outstanding")]
    Busy,

    #[error("Packet of {len} bytes exceeds endpoint size {max}")]
    PacketTooLarge { len: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Errors that mean the transfer was torn down rather than failed.
    /// Resubmission stops silently on these.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Disconnected
                | TransportError::Shutdown
                | TransportError::Cancelled
                | TransportError::Overflow
        )
    }
}

/// Result of one finished transfer, carrying its buffer back to the owner
#[derive(Debug)]
pub struct Completion {
    pub buffer: Vec<u8>,
    /// Number of bytes transferred
    pub status: Result<usize, TransportError>,
}

impl Completion {
    pub fn new(buffer: Vec<u8>, status: Result<usize, TransportError>) -> Self {
        Self { buffer, status }
    }
}

#[async_trait]
pub trait InterruptTransport: Send + Sync {
    /// Waits for the next inbound packet. `buffer` has the endpoint's packet
    /// length; the completion reports how many bytes were filled.
    async fn read_packet(&self, buffer: Vec<u8>) -> Completion;

    /// Sends `buffer` (exactly the bytes to transfer).
    async fn write_packet(&self, buffer: Vec<u8>) -> Completion;

    /// Makes every pending and future transfer finish with
    /// [`TransportError::Shutdown`].
    fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(TransportError::Disconnected.is_transient());
        assert!(TransportError::Shutdown.is_transient());
        assert!(TransportError::Cancelled.is_transient());
        assert!(TransportError::Overflow.is_transient());

        assert!(!TransportError::Stall.is_transient());
        assert!(!TransportError::Timeout.is_transient());
        assert!(!TransportError::Io("babble".into()).is_transient());
    }
}
