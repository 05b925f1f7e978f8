use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::Result;
use gcadapter::controller::{ChannelDeviceFactory, InputEvent, PadEvent, PadEventKind};
use gcadapter::transport::usb::UsbTransport;
use gcadapter::{AdapterConfig, GcAdapter};
use tokio::sync::mpsc;
use tracing::{info, trace, Level};
use tracing_subscriber::FmtSubscriber;

/// Usage: `gcadapter [config.toml]`
#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(AdapterConfig::default_path);
    let config = AdapterConfig::load_from(&path).await?;
    setup_logging(config.log_level());
    info!("Using configuration {}", path.display());

    let transport = UsbTransport::open(
        config.vendor_id,
        config.product_id,
        config.usb_poll_timeout(),
    )?;
    let (factory, events) = ChannelDeviceFactory::new(config.event_buffer);
    let adapter = GcAdapter::attach(Arc::new(transport), Arc::new(factory), config)?
        .start()
        .await?;
    let logger = tokio::spawn(log_pad_events(events));

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");

    let adapter = adapter.shutdown().await;
    let status = adapter.status();
    info!(
        "Decoded {} packets, dropped {}, sent {} rumble packets ({} failed)",
        status.packets_decoded,
        status.packets_dropped,
        status.rumble_packets_sent,
        status.send_failures
    );

    // Last sender goes away with the adapter, which ends the logger.
    drop(adapter);
    logger.await?;
    Ok(())
}

fn setup_logging(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

async fn log_pad_events(mut events: mpsc::Receiver<PadEvent>) {
    while let Some(event) = events.recv().await {
        let time = event.timestamp.format("%H:%M:%S%.3f");
        match event.kind {
            PadEventKind::Created(capabilities) => info!(
                "[{}] Port {}: created '{}' (rumble: {})",
                time, event.port, capabilities.name, capabilities.force_feedback
            ),
            PadEventKind::Destroyed => info!("[{}] Port {}: destroyed", time, event.port),
            PadEventKind::Input(frame) => {
                let pressed: Vec<_> = frame
                    .iter()
                    .filter_map(|input| match input {
                        InputEvent::Key {
                            button,
                            pressed: true,
                        } => Some(*button),
                        _ => None,
                    })
                    .collect();
                trace!("[{}] Port {}: pressed {:?}", time, event.port, pressed);
            }
        }
    }
}
