//! Modbus TCP over a stream socket
//!
//! Frame layout, big-endian 16-bit fields:
//! `[transaction_id:2][protocol_id:2 = 0][remaining_length:2][unit_id:1][function:1][payload]`
//! where `remaining_length` covers everything after itself. The stream
//! carries explicit lengths, so receiving is two exact reads: the 6-byte
//! prefix, then the declared remainder. Responses are matched to requests
//! by the transaction id minted per interface instance.

use super::{TransportError, DEFAULT_MAX_DATA_LENGTH};
use crate::telegram::{
    InterfaceStats, ParsedTelegram, TelegramContext, TelegramKind, TelegramLayout,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Fixed per-frame overhead: the MBAP-style header
const TCP_OVERHEAD: usize = 8;

/// Header bytes up to and including the remaining-length field
const MBAP_PREFIX_LENGTH: usize = 6;

/// Shortest frame the wire format allows
const MIN_TELEGRAM_LENGTH: usize = 8;

/// Registered Modbus TCP port
const DEFAULT_PORT: u16 = 502;

/// TCP interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Connection timeout in seconds
    pub timeout_secs: u64,
    /// Payload ceiling per telegram
    pub max_data_length: usize,
}

impl TcpConfig {
    /// Create a new TCP configuration
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout_secs: 10,
            max_data_length: DEFAULT_MAX_DATA_LENGTH,
        }
    }

    /// Set the connection timeout
    #[must_use]
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set the payload ceiling
    #[must_use]
    pub fn max_data_length(mut self, length: usize) -> Self {
        self.max_data_length = length;
        self
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_PORT)
    }
}

/// Modbus TCP interface over a stream socket
///
/// Exists in two roles: a client connects its own socket, a server-side
/// instance wraps one accepted by [`ConnectionListener`](super::ConnectionListener).
/// Either way the interface owns the socket; [`close`](Self::close)
/// releases it and every later operation fails with
/// [`TransportError::Closed`].
pub struct TcpInterface {
    stream: Option<TcpStream>,
    max_data_length: usize,
    /// Transaction id handed to the next request
    next_transaction: u16,
    info: String,
    stats: InterfaceStats,
}

impl TcpInterface {
    /// Connect a client-role interface
    pub async fn connect(config: TcpConfig) -> Result<Self, TransportError> {
        let addr = format!("{}:{}", config.host, config.port);

        let stream = tokio::time::timeout(
            Duration::from_secs(config.timeout_secs),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| TransportError::Timeout(config.timeout_secs))?
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        // Telegrams are small; do not let the kernel batch them.
        stream.set_nodelay(true)?;

        tracing::info!("connected to {}", addr);
        Ok(Self::from_parts(stream, addr, config.max_data_length))
    }

    /// Wrap an already-connected socket (server role)
    #[must_use]
    pub fn from_stream(stream: TcpStream, max_data_length: usize) -> Self {
        let info = stream
            .peer_addr()
            .map_or_else(|_| "unknown peer".to_string(), |a| a.to_string());
        Self::from_parts(stream, info, max_data_length)
    }

    fn from_parts(stream: TcpStream, info: String, max_data_length: usize) -> Self {
        Self {
            stream: Some(stream),
            max_data_length,
            next_transaction: 0,
            info,
            stats: InterfaceStats::default(),
        }
    }

    /// Release the socket; the interface stays unusable afterwards
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await.ok();
            tracing::debug!("closed connection to {}", self.info);
        }
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl super::ModbusInterface for TcpInterface {
    fn max_data_length(&self) -> usize {
        self.max_data_length
    }

    fn max_telegram_length(&self) -> usize {
        self.max_data_length + TCP_OVERHEAD
    }

    fn create_telegram(
        &mut self,
        address: u8,
        function: u8,
        data_length: usize,
        buffer: &mut [u8],
        kind: TelegramKind,
        context: TelegramContext,
    ) -> Result<TelegramLayout, TransportError> {
        let transaction_id = match kind {
            TelegramKind::Request => {
                let id = self.next_transaction;
                self.next_transaction = self.next_transaction.wrapping_add(1);
                id
            }
            // A response echoes the id recovered from the request it answers.
            TelegramKind::Response => context.transaction_id().unwrap_or(0),
        };
        write_header(transaction_id, address, function, data_length, buffer)
    }

    async fn send_telegram(
        &mut self,
        buffer: &mut [u8],
        length: usize,
    ) -> Result<(), TransportError> {
        if buffer.len() < length {
            return Err(TransportError::BufferTooSmall {
                frame: length,
                buffer: buffer.len(),
            });
        }

        let stream = self.stream_mut()?;
        stream.write_all(&buffer[..length]).await?;
        stream.flush().await?;

        self.stats.bytes_sent += length as u64;
        self.stats.telegrams_sent += 1;
        tracing::trace!("tcp tx {}", hex::encode(&buffer[..length]));
        Ok(())
    }

    async fn receive_telegram(
        &mut self,
        buffer: &mut [u8],
        _expected_data_length: Option<usize>,
        timeout: Duration,
    ) -> Result<Option<usize>, TransportError> {
        // The total length always comes from the header, so the caller's
        // expectation is not needed on this medium.
        let deadline = Instant::now() + timeout;

        if buffer.len() < MBAP_PREFIX_LENGTH {
            return Err(TransportError::BufferTooSmall {
                frame: MBAP_PREFIX_LENGTH,
                buffer: buffer.len(),
            });
        }

        match tokio::time::timeout_at(
            deadline,
            self.stream_mut()?.read_exact(&mut buffer[..MBAP_PREFIX_LENGTH]),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::Disconnected)
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                self.stats.receive_timeouts += 1;
                return Ok(None);
            }
        }

        let remaining = usize::from(u16::from_be_bytes([buffer[4], buffer[5]]));
        let total = MBAP_PREFIX_LENGTH + remaining;
        if buffer.len() < total {
            return Err(TransportError::BufferTooSmall {
                frame: total,
                buffer: buffer.len(),
            });
        }

        match tokio::time::timeout_at(
            deadline,
            self.stream_mut()?.read_exact(&mut buffer[MBAP_PREFIX_LENGTH..total]),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::Disconnected)
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                self.stats.receive_timeouts += 1;
                return Ok(None);
            }
        }

        self.stats.bytes_received += total as u64;
        self.stats.telegrams_received += 1;
        tracing::trace!("tcp rx {}", hex::encode(&buffer[..total]));
        Ok(Some(total))
    }

    fn parse_telegram(
        &self,
        buffer: &[u8],
        length: usize,
        kind: TelegramKind,
        context: TelegramContext,
    ) -> Result<Option<ParsedTelegram>, TransportError> {
        parse_frame(buffer, length, kind, context)
    }

    async fn clear_input_buffer(&mut self) -> Result<(), TransportError> {
        let stream = self.stream_mut()?;
        let mut scratch = [0u8; 256];
        loop {
            match stream.try_read(&mut scratch) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(_) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn is_data_available(&mut self) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        let mut probe = [0u8; 1];
        match tokio::time::timeout(Duration::ZERO, stream.peek(&mut probe)).await {
            Ok(Ok(n)) => n > 0,
            Ok(Err(_)) | Err(_) => false,
        }
    }

    async fn is_connection_ok(&mut self) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        let mut probe = [0u8; 1];
        match tokio::time::timeout(Duration::ZERO, stream.peek(&mut probe)).await {
            // An orderly shutdown by the peer reads as zero bytes.
            Ok(Ok(n)) => n > 0,
            Ok(Err(_)) => false,
            // Nothing pending; the socket is healthy.
            Err(_) => true,
        }
    }

    fn connection_info(&self) -> String {
        self.info.clone()
    }

    fn stats(&self) -> InterfaceStats {
        self.stats
    }
}

/// Write the MBAP-style header and report the frame layout
fn write_header(
    transaction_id: u16,
    address: u8,
    function: u8,
    data_length: usize,
    buffer: &mut [u8],
) -> Result<TelegramLayout, TransportError> {
    if buffer.len() < TCP_OVERHEAD {
        return Err(TransportError::BufferTooSmall {
            frame: TCP_OVERHEAD,
            buffer: buffer.len(),
        });
    }

    buffer[0..2].copy_from_slice(&transaction_id.to_be_bytes());
    buffer[2..4].copy_from_slice(&0u16.to_be_bytes());
    // The length field covers unit id, function code and payload.
    let remaining = (data_length + 2) as u16;
    buffer[4..6].copy_from_slice(&remaining.to_be_bytes());
    buffer[6] = address;
    buffer[7] = function;

    Ok(TelegramLayout {
        length: data_length + TCP_OVERHEAD,
        data_offset: TCP_OVERHEAD,
        context: TelegramContext::Transaction(transaction_id),
    })
}

/// Validate a received frame and locate its payload window
///
/// The protocol id field is deliberately not checked; non-conforming
/// peers fill it with garbage and the frames are otherwise fine.
fn parse_frame(
    buffer: &[u8],
    length: usize,
    kind: TelegramKind,
    context: TelegramContext,
) -> Result<Option<ParsedTelegram>, TransportError> {
    if length < MIN_TELEGRAM_LENGTH {
        return Err(TransportError::TelegramTooShort(length));
    }
    if buffer.len() < length {
        return Err(TransportError::BufferTooSmall {
            frame: length,
            buffer: buffer.len(),
        });
    }

    let wire_id = u16::from_be_bytes([buffer[0], buffer[1]]);
    if kind == TelegramKind::Response {
        if let TelegramContext::Transaction(expected) = context {
            if wire_id != expected {
                // Someone else's reply; the caller keeps listening.
                return Ok(None);
            }
        }
    }

    Ok(Some(ParsedTelegram {
        address: buffer[6],
        function: buffer[7],
        data_offset: TCP_OVERHEAD,
        data_length: length - TCP_OVERHEAD,
        context: TelegramContext::Transaction(wire_id),
    }))
}
