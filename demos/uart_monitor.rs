//! Transparent UART monitor
//!
//! Connects to a peripheral, prints every link signal, received byte count
//! and reassembled record, and sends each line typed on stdin to the UART.
//!
//! Run with:
//!   cargo run --example uart_monitor -- AA:BB:CC:DD:EE:FF
//!
//! Set RUST_LOG to change verbosity, e.g. RUST_LOG=transparent_uart_ble=trace

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use transparent_uart_ble::{EngineConfig, Error, LinkSignal, Result, UartClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,transparent_uart_ble=info")),
        )
        .init();

    println!("Transparent UART Monitor");
    println!("========================\n");

    let address = std::env::args().nth(1).ok_or_else(|| Error::InvalidParameter {
        name: "address".to_string(),
        value: "<missing>".to_string(),
    })?;

    let adapter = transparent_uart_ble::ble::btleplug_transport::default_adapter().await?;
    let client = UartClient::with_adapter(
        adapter,
        EngineConfig::default().with_connect_timeout(Duration::from_secs(15)),
    )?;

    if !client.is_bluetooth_radio_enabled().await {
        println!("Bluetooth radio is not available");
        return Err(Error::BluetoothUnavailable);
    }

    let _state_handle = client.on_state_changed(|event| {
        println!("[state] {} -> {}", event.old, event.new);
    });

    let _record_handle = client.on_record(|record| {
        let samples = record.samples();
        let (min, max) = samples
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), &s| (lo.min(s), hi.max(s)));
        println!(
            "[record {}] key {} | {} samples | min {:.0} max {:.0}",
            record.sequence,
            record.storage_key(),
            samples.len(),
            min,
            max
        );
    });

    println!("Connecting to {}...", address);
    client.connect_and_wait(&address).await?;

    let snapshot = client.snapshot().await?;
    if let Some(caps) = &snapshot.capabilities {
        println!(
            "Ready: {:?}, {} byte writes\n",
            caps.write_mode, snapshot.unit_size
        );
    }
    println!("Type a line and press Enter to send it. Ctrl+C to quit.\n");

    let mut signals = client.subscribe_signals();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            signal = signals.recv() => match signal {
                Ok(LinkSignal::NewDataReceived) => {
                    let bytes = client.read_received_bytes().await?;
                    if !bytes.is_empty() {
                        println!("[rx] {} bytes", bytes.len());
                    }
                }
                Ok(LinkSignal::Disconnected) => {
                    println!("Peripheral disconnected");
                    break;
                }
                Ok(signal) => println!("[signal] {:?}", signal),
                Err(_) => break,
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let mut payload = line.into_bytes();
                    payload.extend_from_slice(b"\r\n");
                    match client.write_to_uart(&payload).await {
                        Ok(writes) => println!("[tx] {} bytes in {} writes", payload.len(), writes),
                        Err(e) => println!("[tx] failed: {}", e),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    println!("stdin error: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping...");
                break;
            }
        }
    }

    client.shutdown().await?;
    println!("Done.");

    Ok(())
}
