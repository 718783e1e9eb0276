//! Scan command implementation.

use std::sync::Arc;

use anyhow::{Context, Result};

use beambox_core::config::parse_duration;
use beambox_core::discovery::{
    BroadcastReceiver, BroadcastReceiverObserver, DiscoveryOptions, RemoteDevice,
};

use super::ScanArgs;
use crate::ui::truncate_string;

struct LivePrinter;

impl BroadcastReceiverObserver for LivePrinter {
    fn on_active_remote_devices_update(&self, remote_devices: &[RemoteDevice]) {
        println!("  {} device(s) announcing", remote_devices.len());
    }
}

/// Run the scan command.
pub async fn run(args: ScanArgs) -> Result<()> {
    let config = super::load_config();

    let duration = parse_duration(&args.duration)
        .context("Invalid duration format. Use formats like '500ms', '10s', '1m'")?;

    if !args.json {
        println!();
        println!("Scanning for devices ({})...", args.duration);
        println!();
    }

    let receiver = BroadcastReceiver::new(DiscoveryOptions::from(&config));
    if !args.json {
        receiver.add_observer(Arc::new(LivePrinter));
    }
    receiver
        .start()
        .await
        .context("Failed to listen for broadcasts")?;

    tokio::select! {
        () = tokio::time::sleep(duration) => {}
        () = receiver.wait_close() => {
            anyhow::bail!("Broadcast listener closed unexpectedly");
        }
    }

    let devices = receiver.active_devices();
    receiver.close_connection_if_active();

    if args.json {
        output_json_devices(&devices)?;
    } else {
        display_devices(&devices);
    }
    Ok(())
}

/// Output devices as JSON.
fn output_json_devices(devices: &[RemoteDevice]) -> Result<()> {
    let output = serde_json::json!({
        "devices": devices.iter().map(|d| serde_json::json!({
            "name": d.device_name,
            "address": d.remote_address.ip().to_string(),
            "port": d.remote_address.port(),
        })).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Display devices as text table.
fn display_devices(devices: &[RemoteDevice]) {
    println!();
    println!("Devices on Network:");
    println!("{}", "─".repeat(48));
    println!("  {:24}  {:20}", "Device", "Address");
    println!("{}", "─".repeat(48));

    if devices.is_empty() {
        println!("  (no devices found)");
        println!("{}", "─".repeat(48));
        return;
    }

    for device in devices {
        println!(
            "  {:24}  {:20}",
            truncate_string(&device.device_name, 24),
            device.remote_address.ip()
        );
    }

    println!("{}", "─".repeat(48));
}
