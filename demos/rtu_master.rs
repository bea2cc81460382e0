//! Modbus RTU master demo
//!
//! Issues one read-holding-registers poll over a serial line.
//!
//! Usage:
//!   cargo run --example rtu_master -- /dev/ttyUSB0 19200

use modlink::{ModbusInterface, RtuConfig, RtuInterface, TelegramContext, TelegramKind};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();

    let (port, baud_rate) = match args.len() {
        3 => (args[1].clone(), args[2].parse().unwrap_or(19200)),
        2 => (args[1].clone(), 19200),
        _ => {
            println!("Usage: rtu_master <port> [baud_rate]");
            println!("\nAvailable ports:");
            for port in modlink::list_ports()? {
                println!("  {}", port.port_name);
            }
            return Ok(());
        }
    };

    println!("Opening {} at {} baud...", port, baud_rate);
    let mut interface = RtuInterface::open(RtuConfig::new(&port, baud_rate))?;
    println!("Opened {}", interface.connection_info());

    // Read 3 holding registers starting at 0x006B from device 0x11.
    let mut frame = vec![0u8; interface.max_telegram_length()];
    let request = interface.create_telegram(
        0x11,
        0x03,
        4,
        &mut frame,
        TelegramKind::Request,
        TelegramContext::None,
    )?;
    frame[request.data_offset..request.data_offset + 4].copy_from_slice(&[0x00, 0x6B, 0x00, 0x03]);

    interface.send_telegram(&mut frame, request.length).await?;

    // Reply length depends on the device, so let the quiet line end the frame.
    match interface
        .receive_telegram(&mut frame, None, Duration::from_millis(1000))
        .await?
    {
        Some(len) => {
            match interface.parse_telegram(&frame, len, TelegramKind::Response, request.context)? {
                Some(reply) => {
                    let payload = &frame[reply.data_offset..reply.data_offset + reply.data_length];
                    println!(
                        "device {:#04x} function {:#04x} payload {}",
                        reply.address,
                        reply.function,
                        hex::encode(payload)
                    );
                }
                None => println!("reply did not match"),
            }
        }
        None => println!("no reply within 1000 ms"),
    }

    println!("stats: {:?}", interface.stats());
    Ok(())
}
