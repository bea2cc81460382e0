//! Transport layer: the Modbus interface contract and its realizations
//!
//! Supports:
//! - Modbus RTU over an asynchronous serial line
//! - Modbus TCP over a stream socket
//! - A TCP connection listener spawning one interface per connection
//!
//! Both transports implement [`ModbusInterface`]: the caller creates a
//! telegram (header pre-filled), writes its payload, sends, receives and
//! parses — without knowing which medium carries the bytes.

mod listener;
mod rtu;
mod tcp;

pub use listener::{ConnectionListener, DeviceCollector, ListenerConfig};
pub use rtu::{list_ports, RtuConfig, RtuInterface, SerialParity};
pub use tcp::{TcpConfig, TcpInterface};

use crate::telegram::{InterfaceStats, ParsedTelegram, TelegramContext, TelegramKind, TelegramLayout};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Default payload ceiling per telegram, per the Modbus specification
pub const DEFAULT_MAX_DATA_LENGTH: usize = 252;

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection timeout
    #[error("connection timeout after {0} seconds")]
    Timeout(u64),

    /// Port not found
    #[error("port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Telegram shorter than the protocol header
    #[error("telegram too short: {0} bytes")]
    TelegramTooShort(usize),

    /// CRC trailer does not match the frame contents
    #[error("CRC mismatch: calculated {calculated:#06x}, received {received:#06x}")]
    CrcMismatch {
        /// CRC computed over the received frame body
        calculated: u16,
        /// CRC carried in the frame trailer
        received: u16,
    },

    /// The caller's buffer cannot hold the frame
    #[error("buffer too small: frame is {frame} bytes, buffer holds {buffer}")]
    BufferTooSmall {
        /// Bytes the frame needs
        frame: usize,
        /// Bytes the buffer offers
        buffer: usize,
    },

    /// Interface used after its transport was released
    #[error("interface closed")]
    Closed,

    /// Peer closed the connection
    #[error("disconnected")]
    Disconnected,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport-agnostic Modbus telegram interface
///
/// One instance serves one master or device engine. Methods take
/// `&mut self`: an interface is not meant to be driven by more than one
/// caller at a time, and the receiver type makes that contract explicit.
///
/// The protocol-level state (which request is outstanding, what to do
/// with a payload) lives entirely in the caller; an interface only keeps
/// the small persistent fields its medium needs (send pacing deadline,
/// transaction-id counter, transport handle).
#[async_trait]
pub trait ModbusInterface: Send {
    /// Largest payload one telegram can carry
    fn max_data_length(&self) -> usize;

    /// Largest full frame, header and trailer included
    fn max_telegram_length(&self) -> usize;

    /// Write the protocol header for a telegram into `buffer`
    ///
    /// Only the header region is touched; the caller writes `data_length`
    /// payload bytes at the returned offset and later hands the whole
    /// frame to [`send_telegram`](Self::send_telegram). `data_length` is
    /// not checked against [`max_data_length`](Self::max_data_length) —
    /// exceeding the ceiling is a caller bug that surfaces once the
    /// length field or trailer overflows.
    ///
    /// For a TCP request a fresh transaction id is minted and returned in
    /// the layout's context; for a TCP response the supplied context is
    /// echoed into the header (a response created with
    /// [`TelegramContext::None`] echoes id 0). RTU ignores the context.
    fn create_telegram(
        &mut self,
        address: u8,
        function: u8,
        data_length: usize,
        buffer: &mut [u8],
        kind: TelegramKind,
        context: TelegramContext,
    ) -> Result<TelegramLayout, TransportError>;

    /// Finalize the wire trailer and transmit `buffer[..length]`
    ///
    /// RTU appends the CRC trailer and enforces the inter-frame guard
    /// interval before transmitting; TCP writes the bytes as they are.
    async fn send_telegram(
        &mut self,
        buffer: &mut [u8],
        length: usize,
    ) -> Result<(), TransportError>;

    /// Assemble one complete frame into `buffer`
    ///
    /// Returns `Ok(Some(telegram_length))` once a full frame is in the
    /// buffer, or `Ok(None)` when `timeout` elapses first — a timeout is
    /// an expected outcome, not an error.
    ///
    /// `expected_data_length` is the payload size the caller anticipates:
    /// with `Some(n)` the receive stops at exactly `n` plus the protocol
    /// overhead (RTU shortens the expectation to 5 bytes once the
    /// function code flags an exception response); with `None` RTU falls
    /// back to quiet-line detection. TCP ignores the hint — the frame
    /// length always comes from the header.
    async fn receive_telegram(
        &mut self,
        buffer: &mut [u8],
        expected_data_length: Option<usize>,
        timeout: Duration,
    ) -> Result<Option<usize>, TransportError>;

    /// Validate integrity and correlation, and locate the payload window
    ///
    /// Returns `Ok(None)` when a TCP response carries a foreign
    /// transaction id — the caller keeps listening. Integrity failures
    /// ([`TransportError::CrcMismatch`]) and structural failures
    /// ([`TransportError::TelegramTooShort`]) are errors: fatal for the
    /// frame, not for the interface.
    fn parse_telegram(
        &self,
        buffer: &[u8],
        length: usize,
        kind: TelegramKind,
        context: TelegramContext,
    ) -> Result<Option<ParsedTelegram>, TransportError>;

    /// Discard pending unread bytes on the medium
    async fn clear_input_buffer(&mut self) -> Result<(), TransportError>;

    /// Non-blocking probe for pending bytes
    async fn is_data_available(&mut self) -> bool;

    /// Liveness check; probe failures count as "not ok" and never propagate
    async fn is_connection_ok(&mut self) -> bool;

    /// Human-readable endpoint description
    fn connection_info(&self) -> String;

    /// Byte and telegram counters
    fn stats(&self) -> InterfaceStats;
}

/// Interface configuration
#[derive(Debug, Clone)]
pub enum InterfaceConfig {
    /// Modbus RTU over a serial line
    Rtu(RtuConfig),
    /// Modbus TCP client connection
    Tcp(TcpConfig),
}

/// Create and connect an interface instance from configuration
pub async fn create_interface(
    config: InterfaceConfig,
) -> Result<Box<dyn ModbusInterface>, TransportError> {
    match config {
        InterfaceConfig::Rtu(cfg) => {
            let interface = RtuInterface::open(cfg)?;
            Ok(Box::new(interface))
        }
        InterfaceConfig::Tcp(cfg) => {
            let interface = TcpInterface::connect(cfg).await?;
            Ok(Box::new(interface))
        }
    }
}
