//! Device factory that turns every virtual pad into a stream of events on
//! a tokio channel, for hosts that consume input in-process.

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::input::{DeviceCapabilities, DeviceError, DeviceFactory, InputDevice, InputEvent};

#[derive(Debug, Clone)]
pub struct PadEvent {
    pub port: u8,
    pub timestamp: DateTime<Local>,
    pub kind: PadEventKind,
}

#[derive(Debug, Clone)]
pub enum PadEventKind {
    Created(DeviceCapabilities),
    Input(Vec<InputEvent>),
    Destroyed,
}

impl PadEvent {
    fn now(port: u8, kind: PadEventKind) -> Self {
        Self {
            port,
            timestamp: Local::now(),
            kind,
        }
    }
}

pub struct ChannelDeviceFactory {
    sender: mpsc::Sender<PadEvent>,
}

impl ChannelDeviceFactory {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PadEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    fn publish(&self, event: PadEvent) {
        if let Err(e) = self.sender.try_send(event) {
            warn!("Lifecycle event not delivered: {}", e);
        }
    }
}

impl DeviceFactory for ChannelDeviceFactory {
    fn create_device(
        &self,
        port: u8,
        capabilities: &DeviceCapabilities,
    ) -> Result<Box<dyn InputDevice>, DeviceError> {
        if self.sender.is_closed() {
            return Err(DeviceError::Creation("event consumer is gone".into()));
        }
        self.publish(PadEvent::now(
            port,
            PadEventKind::Created(capabilities.clone()),
        ));
        Ok(Box::new(ChannelDevice {
            port,
            sender: self.sender.clone(),
        }))
    }

    fn destroy_device(&self, port: u8, device: Box<dyn InputDevice>) {
        drop(device);
        self.publish(PadEvent::now(port, PadEventKind::Destroyed));
    }
}

struct ChannelDevice {
    port: u8,
    sender: mpsc::Sender<PadEvent>,
}

impl InputDevice for ChannelDevice {
    fn emit(&self, events: &[InputEvent]) -> Result<(), DeviceError> {
        self.sender
            .try_send(PadEvent::now(self.port, PadEventKind::Input(events.to_vec())))
            .map_err(|e| {
                debug!("Port {} frame dropped: {}", self.port, e);
                DeviceError::Emit(e.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::input::DeviceIdentity;

    fn capabilities() -> DeviceCapabilities {
        DeviceCapabilities::for_status(
            "pad",
            DeviceIdentity {
                bus: "usb".into(),
                vendor: 1,
                product: 2,
                version: 3,
            },
            0x10,
        )
    }

    #[tokio::test]
    async fn lifecycle_and_frames_arrive_in_order() {
        let (factory, mut events) = ChannelDeviceFactory::new(8);
        let device = factory.create_device(2, &capabilities()).unwrap();
        device.emit(&[InputEvent::Sync]).unwrap();
        factory.destroy_device(2, device);

        let created = events.recv().await.unwrap();
        assert_eq!(created.port, 2);
        assert!(matches!(created.kind, PadEventKind::Created(_)));
        assert!(matches!(
            events.recv().await.unwrap().kind,
            PadEventKind::Input(ref frame) if frame == &[InputEvent::Sync]
        ));
        assert!(matches!(
            events.recv().await.unwrap().kind,
            PadEventKind::Destroyed
        ));
    }

    #[tokio::test]
    async fn full_channel_drops_frames_instead_of_blocking() {
        let (factory, _events) = ChannelDeviceFactory::new(1);
        let device = factory.create_device(0, &capabilities()).unwrap();
        assert!(matches!(
            device.emit(&[InputEvent::Sync]),
            Err(DeviceError::Emit(_))
        ));
    }

    #[test]
    fn creation_fails_without_consumer() {
        let (factory, events) = ChannelDeviceFactory::new(1);
        drop(events);
        assert!(matches!(
            factory.create_device(0, &capabilities()),
            Err(DeviceError::Creation(_))
        ));
    }
}
