use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bluest::Adapter;
use log::{error, info, LevelFilter};
use tokio::sync::mpsc;

use solar_monitor_lib::core::bluetooth::{BluestPeripheral, DeviceScanner};
use solar_monitor_lib::{logging, EventSink, MonitorConfig, MonitorEvent, MonitorService};

/// Scans for chargers and battery monitors, connects to all of them and
/// prints their events as JSON lines until interrupted.
///
/// The only argument is the directory holding `monitor_config.json`.
#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = logging::init(LevelFilter::Info) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let config_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let config = MonitorConfig::load_config(&config_dir).await?;

    let adapter = Adapter::default()
        .await
        .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
    adapter.wait_available().await?;
    info!("Bluetooth adapter is available.");

    let scanner = DeviceScanner::new(adapter.clone());
    let devices = scanner.scan(config.scan_duration()).await?;
    if devices.is_empty() {
        return Err(anyhow!("No solar chargers or battery monitors found"));
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<MonitorEvent>();
    let sink: Arc<dyn EventSink> = Arc::new(tx);
    let service = MonitorService::new(config, sink);
    for device in devices.into_values() {
        let peripheral = Arc::new(BluestPeripheral::new(adapter.clone(), device));
        if let Err(e) = service.connect(peripheral).await {
            error!("Failed to connect: {}", e);
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => error!("Failed to serialize event: {}", e),
                },
                None => break,
            },
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    service.shutdown().await;
    Ok(())
}
