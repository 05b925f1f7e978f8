//! libusb backend for the real adapter (VID 0x057e / PID 0x0337)
//!
//! rusb calls are blocking, so every transfer runs on the blocking pool. A
//! transfer owns its buffer for the whole blocking call and polls in slices of
//! `poll_timeout`, so [`InterruptTransport::shutdown`] is noticed within one
//! slice.
//!
//! Linux: the device node is root-only by default. A udev rule such as
//!
//! ```text
//! SUBSYSTEM=="usb", ATTRS{idVendor}=="057e", ATTRS{idProduct}=="0337", MODE="0666"
//! ```
//!
//! grants access to regular users.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusb::{DeviceHandle, Direction, GlobalContext, TransferType};
use tracing::{debug, error, info, warn};

use super::{Completion, InterruptTransport, TransportError};
use crate::adapter::AdapterError;
use crate::protocol::{IN_PACKET_LEN, OUT_PACKET_LEN};

pub struct UsbTransport {
    inner: Arc<UsbInner>,
}

struct UsbInner {
    handle: DeviceHandle<GlobalContext>,
    interface: u8,
    endpoint_in: u8,
    endpoint_out: u8,
    poll_timeout: Duration,
    closed: AtomicBool,
}

struct Endpoints {
    interface: u8,
    endpoint_in: u8,
    endpoint_out: u8,
}

impl UsbTransport {
    /// Opens the first adapter matching `vendor_id:product_id` and claims its
    /// interface. Fails unless it exposes an interrupt IN endpoint of exactly
    /// 37 bytes and an interrupt OUT endpoint of exactly 5.
    pub fn open(
        vendor_id: u16,
        product_id: u16,
        poll_timeout: Duration,
    ) -> Result<Self, AdapterError> {
        let handle = rusb::open_device_with_vid_pid(vendor_id, product_id).ok_or_else(|| {
            AdapterError::Resource(format!(
                "adapter {:04x}:{:04x} not found",
                vendor_id, product_id
            ))
        })?;

        let endpoints = find_endpoints(&handle)?;
        debug!(
            "Interface {}: IN 0x{:02x}, OUT 0x{:02x}",
            endpoints.interface, endpoints.endpoint_in, endpoints.endpoint_out
        );

        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!("Kernel driver auto-detach unavailable: {}", e);
        }
        handle
            .claim_interface(endpoints.interface)
            .map_err(|e| {
                AdapterError::Resource(format!(
                    "cannot claim interface {}: {}",
                    endpoints.interface, e
                ))
            })?;

        info!(
            "Opened adapter {:04x}:{:04x}",
            vendor_id, product_id
        );
        Ok(Self {
            inner: Arc::new(UsbInner {
                handle,
                interface: endpoints.interface,
                endpoint_in: endpoints.endpoint_in,
                endpoint_out: endpoints.endpoint_out,
                poll_timeout,
                closed: AtomicBool::new(false),
            }),
        })
    }
}

fn find_endpoints(handle: &DeviceHandle<GlobalContext>) -> Result<Endpoints, AdapterError> {
    let config = handle
        .device()
        .active_config_descriptor()
        .map_err(|e| AdapterError::Resource(format!("USB config descriptor: {}", e)))?;

    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            let mut endpoint_in = None;
            let mut endpoint_out = None;
            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Interrupt {
                    continue;
                }
                let size = usize::from(endpoint.max_packet_size());
                match endpoint.direction() {
                    Direction::In if size == IN_PACKET_LEN => {
                        endpoint_in.get_or_insert(endpoint.address());
                    }
                    Direction::Out if size == OUT_PACKET_LEN => {
                        endpoint_out.get_or_insert(endpoint.address());
                    }
                    _ => {}
                }
            }
            if let (Some(endpoint_in), Some(endpoint_out)) = (endpoint_in, endpoint_out) {
                return Ok(Endpoints {
                    interface: descriptor.interface_number(),
                    endpoint_in,
                    endpoint_out,
                });
            }
        }
    }

    Err(AdapterError::Resource(format!(
        "no interrupt endpoint pair of {}/{} bytes",
        IN_PACKET_LEN, OUT_PACKET_LEN
    )))
}

fn map_error(error: rusb::Error) -> TransportError {
    match error {
        rusb::Error::NoDevice => TransportError::Disconnected,
        rusb::Error::Interrupted => TransportError::Cancelled,
        rusb::Error::Overflow => TransportError::Overflow,
        rusb::Error::Pipe => TransportError::Stall,
        rusb::Error::Timeout => TransportError::Timeout,
        other => TransportError::Io(other.to_string()),
    }
}

impl UsbInner {
    fn read_blocking(&self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Shutdown);
            }
            match self
                .handle
                .read_interrupt(self.endpoint_in, buffer, self.poll_timeout)
            {
                Err(rusb::Error::Timeout) => continue,
                result => return result.map_err(map_error),
            }
        }
    }

    fn write_blocking(&self, buffer: &[u8]) -> Result<usize, TransportError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Shutdown);
            }
            match self
                .handle
                .write_interrupt(self.endpoint_out, buffer, self.poll_timeout)
            {
                Err(rusb::Error::Timeout) => continue,
                result => return result.map_err(map_error),
            }
        }
    }
}

impl Drop for UsbInner {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface) {
            warn!("Failed to release interface {}: {}", self.interface, e);
        }
        debug!("USB interface {} released", self.interface);
    }
}

#[async_trait]
impl InterruptTransport for UsbTransport {
    async fn read_packet(&self, mut buffer: Vec<u8>) -> Completion {
        let inner = Arc::clone(&self.inner);
        let joined = tokio::task::spawn_blocking(move || {
            let status = inner.read_blocking(&mut buffer);
            Completion::new(buffer, status)
        })
        .await;
        joined.unwrap_or_else(|e| {
            error!("USB read task failed: {}", e);
            Completion::new(Vec::new(), Err(TransportError::Io(e.to_string())))
        })
    }

    async fn write_packet(&self, buffer: Vec<u8>) -> Completion {
        let inner = Arc::clone(&self.inner);
        let joined = tokio::task::spawn_blocking(move || {
            let status = inner.write_blocking(&buffer);
            Completion::new(buffer, status)
        })
        .await;
        joined.unwrap_or_else(|e| {
            error!("USB write task failed: {}", e);
            Completion::new(Vec::new(), Err(TransportError::Io(e.to_string())))
        })
    }

    fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn libusb_errors_map_to_transport_errors() {
        assert_eq!(map_error(rusb::Error::NoDevice), TransportError::Disconnected);
        assert!(map_error(rusb::Error::NoDevice).is_transient());
        assert_eq!(map_error(rusb::Error::Pipe), TransportError::Stall);
        assert!(!map_error(rusb::Error::Pipe).is_transient());
        assert!(matches!(
            map_error(rusb::Error::Access),
            TransportError::Io(_)
        ));
    }
}
