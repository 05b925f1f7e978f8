//! Driver core for the 4-port GameCube controller adapter
//!
//! ```text
//! Transport ──► ReceiveEndpoint ──► protocol::decode ──► Snapshot
//!                                                         │
//!                         ┌───────────────────────────────┤
//!                         ▼                               ▼
//!                  PresenceTracker                  input fan-out
//!             (create / destroy devices)      (button + axis frames)
//!
//! AdapterHandle::request_rumble ──► RumbleCoalescer ──► SendEndpoint ──► Transport
//! ```
//!
//! [`adapter::GcAdapter`] owns one adapter's context; [`adapter::AdapterHandle`]
//! is the cloneable surface used by everything else.

pub mod adapter;
pub mod config;
pub mod controller;
pub mod protocol;
pub mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use adapter::{AdapterError, AdapterHandle, GcAdapter};
pub use config::AdapterConfig;

/// The guarded data in this crate is flags and device handles, all valid
/// after a panicking holder, so poisoning is ignored.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
