//! # Modlink
//!
//! A Modbus telegram transport layer with a single transport-agnostic
//! contract over two physically different media:
//! - Modbus RTU over an asynchronous serial line (CRC-16 trailer,
//!   character-timing frame delimiting, half-duplex guard interval)
//! - Modbus TCP over a stream socket (MBAP-style header, length-prefixed
//!   framing, transaction-id correlation)
//!
//! A TCP connection listener accepts inbound connections and spawns one
//! interface per connection for the device role.
//!
//! The crate frames, sends, receives and validates telegrams; it never
//! interprets payload bytes. Function-code semantics, register maps and
//! retry policies belong to the master/device engine driving the
//! [`ModbusInterface`] contract.
//!
//! ## Example
//!
//! ```rust,no_run
//! use modlink::{
//!     create_interface, InterfaceConfig, ModbusInterface, TcpConfig, TelegramContext, TelegramKind,
//! };
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), modlink::TransportError> {
//!     let config = InterfaceConfig::Tcp(TcpConfig::new("10.0.0.7", 502));
//!     let mut interface = create_interface(config).await?;
//!
//!     let mut frame = vec![0u8; interface.max_telegram_length()];
//!     let layout = interface.create_telegram(
//!         0x01,
//!         0x03,
//!         4,
//!         &mut frame,
//!         TelegramKind::Request,
//!         TelegramContext::None,
//!     )?;
//!     frame[layout.data_offset..layout.data_offset + 4].copy_from_slice(&[0x00, 0x6B, 0x00, 0x03]);
//!
//!     interface.send_telegram(&mut frame, layout.length).await?;
//!     if let Some(len) = interface
//!         .receive_telegram(&mut frame, None, Duration::from_millis(500))
//!         .await?
//!     {
//!         let parsed = interface.parse_telegram(&frame, len, TelegramKind::Response, layout.context)?;
//!         println!("reply: {:?}", parsed);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod checksum;
pub mod telegram;
pub mod transport;

// Re-exports for convenience
pub use crate::telegram::{
    InterfaceStats, ParsedTelegram, TelegramContext, TelegramKind, TelegramLayout,
};
pub use crate::transport::{
    create_interface, list_ports, ConnectionListener, DeviceCollector, InterfaceConfig,
    ListenerConfig, ModbusInterface, RtuConfig, RtuInterface, SerialParity, TcpConfig,
    TcpInterface, TransportError, DEFAULT_MAX_DATA_LENGTH,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
