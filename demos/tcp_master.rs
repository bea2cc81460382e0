//! Modbus TCP master demo
//!
//! Issues one read-holding-registers poll against a Modbus TCP device.
//!
//! Usage:
//!   cargo run --example tcp_master -- <host> [port] [unit]

use modlink::{ModbusInterface, TcpConfig, TcpInterface, TelegramContext, TelegramKind};
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

    let (host, port, unit) = match args.len() {
        4 => (args[1].clone(), args[2].parse().unwrap_or(502), args[3].parse().unwrap_or(1)),
        3 => (args[1].clone(), args[2].parse().unwrap_or(502), 1),
        2 => (args[1].clone(), 502, 1),
        _ => {
            println!("Usage: tcp_master <host> [port] [unit]");
            println!("Example: tcp_master 10.0.0.7 502 1");
            return Ok(());
        }
    };

    println!("Connecting to {}:{}...", host, port);
    let mut interface = TcpInterface::connect(TcpConfig::new(&host, port)).await?;
    println!("Connected to {}", interface.connection_info());

    // Read 4 holding registers starting at 0x006B.
    let mut frame = vec![0u8; interface.max_telegram_length()];
    let request = interface.create_telegram(
        unit,
        0x03,
        4,
        &mut frame,
        TelegramKind::Request,
        TelegramContext::None,
    )?;
    frame[request.data_offset..request.data_offset + 4].copy_from_slice(&[0x00, 0x6B, 0x00, 0x04]);

    interface.clear_input_buffer().await?;
    interface.send_telegram(&mut frame, request.length).await?;

    match interface
        .receive_telegram(&mut frame, None, Duration::from_millis(1000))
        .await?
    {
        Some(len) => {
            match interface.parse_telegram(&frame, len, TelegramKind::Response, request.context)? {
                Some(reply) => {
                    let payload = &frame[reply.data_offset..reply.data_offset + reply.data_length];
                    println!(
                        "unit {:#04x} function {:#04x} payload {}",
                        reply.address,
                        reply.function,
                        hex::encode(payload)
                    );
                }
                None => println!("response carried a foreign transaction id"),
            }
        }
        None => println!("no response within 1000 ms"),
    }

    println!("stats: {:?}", interface.stats());
    interface.close().await;
    Ok(())
}
