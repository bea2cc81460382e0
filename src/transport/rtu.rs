//! Modbus RTU over an asynchronous serial line
//!
//! Frame layout: `[address][function][payload...][crc_lo][crc_hi]`, four
//! bytes of fixed overhead. The wire carries no length field — the end of
//! a frame is a quiet line, so all receive paths are driven by timing
//! constants derived from the character length at the configured line
//! parameters. The same constants pace sending: the line must have been
//! silent for 3.5 character times before a new frame may start.

use super::{TransportError, DEFAULT_MAX_DATA_LENGTH};
use crate::checksum;
use crate::telegram::{
    InterfaceStats, ParsedTelegram, TelegramContext, TelegramKind, TelegramLayout,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_serial::{ClearBuffer, DataBits, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits};

/// Fixed per-frame overhead: address, function code, CRC trailer
const RTU_OVERHEAD: usize = 4;

/// Shortest frame the wire format allows
const MIN_TELEGRAM_LENGTH: usize = 4;

/// An exception response is always 5 bytes on the wire
const EXCEPTION_TELEGRAM_LENGTH: usize = 5;

/// Function-code bit flagging an exception response
const EXCEPTION_BIT: u8 = 0x80;

/// Half-character length above 19200 baud, where bit time stops mattering
const FAST_BAUD_HALF_CHAR: Duration = Duration::from_micros(500);

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl std::str::FromStr for SerialParity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            _ => Ok(Self::None),
        }
    }
}

/// RTU interface configuration
///
/// The line parameters are fixed for the lifetime of the interface; the
/// inter-frame timing constants are derived from them once, at open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtuConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Payload ceiling per telegram
    pub max_data_length: usize,
}

impl RtuConfig {
    /// Create a new RTU configuration with default line settings
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            max_data_length: DEFAULT_MAX_DATA_LENGTH,
        }
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set the payload ceiling
    #[must_use]
    pub fn max_data_length(mut self, length: usize) -> Self {
        self.max_data_length = length;
        self
    }
}

impl Default for RtuConfig {
    fn default() -> Self {
        Self::new("COM1", 19200)
    }
}

/// Modbus RTU interface over a UART
///
/// Created once per serial line and kept for the life of the process.
/// The half-duplex medium needs no correlation token; ordering on the
/// wire is trusted.
pub struct RtuInterface {
    config: RtuConfig,
    port: SerialStream,
    /// Half of one character's duration; base unit for all RTU timing
    half_char: Duration,
    /// Earliest instant the next frame may start
    next_send: Instant,
    open: bool,
    stats: InterfaceStats,
}

impl RtuInterface {
    /// Open the serial device and fix the line parameters
    pub fn open(config: RtuConfig) -> Result<Self, TransportError> {
        let data_bits = match config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };

        let stop_bits = match config.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };

        let parity = match config.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        let port = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .open_native_async()
            .map_err(|e| match e.kind() {
                tokio_serial::ErrorKind::NoDevice => {
                    TransportError::PortNotFound(config.port.clone())
                }
                tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    TransportError::PermissionDenied(config.port.clone())
                }
                _ => TransportError::ConnectionFailed(e.to_string()),
            })?;

        let half_char = half_char_length(
            config.baud_rate,
            config.data_bits,
            config.stop_bits,
            config.parity,
        );
        tracing::debug!(
            "opened {} at {} baud, half-character time {} us",
            config.port,
            config.baud_rate,
            half_char.as_micros()
        );

        Ok(Self {
            config,
            port,
            half_char,
            next_send: Instant::now(),
            open: true,
            stats: InterfaceStats::default(),
        })
    }

    /// Read until exactly `expected` frame bytes have arrived
    ///
    /// The expectation shrinks to the exception frame length as soon as
    /// the function code shows the exception bit.
    async fn receive_exact(
        &mut self,
        buffer: &mut [u8],
        mut expected: usize,
        deadline: Instant,
    ) -> Result<Option<usize>, TransportError> {
        if buffer.len() < expected {
            return Err(TransportError::BufferTooSmall {
                frame: expected,
                buffer: buffer.len(),
            });
        }

        let mut received = 0;
        while received < expected {
            let n = match tokio::time::timeout_at(deadline, self.port.read(&mut buffer[received..expected])).await
            {
                Ok(Ok(0)) => return Err(TransportError::Disconnected),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(None),
            };
            received += n;

            if received >= 2 && buffer[1] & EXCEPTION_BIT != 0 {
                expected = EXCEPTION_TELEGRAM_LENGTH;
            }
        }

        Ok(Some(expected))
    }

    /// Assemble a frame of unknown length by watching for a quiet line
    ///
    /// A read that stays silent for three character times ends the frame.
    /// If the collected bytes then fail the CRC check the transmission is
    /// taken to be still in flight and collection continues, bounded only
    /// by the caller's deadline.
    async fn receive_until_silence(
        &mut self,
        buffer: &mut [u8],
        deadline: Instant,
    ) -> Result<Option<usize>, TransportError> {
        let silence = self.half_char * 6;
        let mut received = 0;

        loop {
            let fresh = if received == buffer.len() {
                // Nothing more can be stored; only the quiet-line check remains.
                sleep(silence).await;
                None
            } else {
                match tokio::time::timeout(silence, self.port.read(&mut buffer[received..])).await {
                    Ok(Ok(0)) => return Err(TransportError::Disconnected),
                    Ok(Ok(n)) => Some(n),
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => None,
                }
            };

            match fresh {
                Some(n) => {
                    received += n;
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
                None => {
                    // The line has been quiet for three character times.
                    if received >= MIN_TELEGRAM_LENGTH && checksum::trailer_matches(&buffer[..received]) {
                        return Ok(Some(received));
                    }
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl super::ModbusInterface for RtuInterface {
    fn max_data_length(&self) -> usize {
        self.config.max_data_length
    }

    fn max_telegram_length(&self) -> usize {
        self.config.max_data_length + RTU_OVERHEAD
    }

    fn create_telegram(
        &mut self,
        address: u8,
        function: u8,
        data_length: usize,
        buffer: &mut [u8],
        _kind: TelegramKind,
        context: TelegramContext,
    ) -> Result<TelegramLayout, TransportError> {
        write_header(address, function, data_length, buffer, context)
    }

    async fn send_telegram(
        &mut self,
        buffer: &mut [u8],
        length: usize,
    ) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        seal_telegram(buffer, length)?;

        // Hold the frame until the guard interval from the previous send
        // has passed, then start from empty FIFOs in both directions.
        sleep_until(self.next_send).await;
        self.port
            .clear(ClearBuffer::All)
            .map_err(|e| TransportError::Io(e.into()))?;

        self.port.write_all(&buffer[..length]).await?;
        self.port.flush().await?;

        // Frame transmission time plus a 3.5-character guard band.
        self.next_send = Instant::now() + self.half_char * (length as u32 * 2 + 7);

        self.stats.bytes_sent += length as u64;
        self.stats.telegrams_sent += 1;
        tracing::trace!("rtu tx {}", hex::encode(&buffer[..length]));
        Ok(())
    }

    async fn receive_telegram(
        &mut self,
        buffer: &mut [u8],
        expected_data_length: Option<usize>,
        timeout: Duration,
    ) -> Result<Option<usize>, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        let deadline = Instant::now() + timeout;

        let received = match expected_data_length {
            Some(data_length) => {
                self.receive_exact(buffer, data_length + RTU_OVERHEAD, deadline)
                    .await?
            }
            None => self.receive_until_silence(buffer, deadline).await?,
        };

        match received {
            Some(length) => {
                self.stats.bytes_received += length as u64;
                self.stats.telegrams_received += 1;
                tracing::trace!("rtu rx {}", hex::encode(&buffer[..length]));
                Ok(Some(length))
            }
            None => {
                self.stats.receive_timeouts += 1;
                Ok(None)
            }
        }
    }

    fn parse_telegram(
        &self,
        buffer: &[u8],
        length: usize,
        _kind: TelegramKind,
        context: TelegramContext,
    ) -> Result<Option<ParsedTelegram>, TransportError> {
        parse_frame(buffer, length, context)
    }

    async fn clear_input_buffer(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| TransportError::Io(e.into()))
    }

    async fn is_data_available(&mut self) -> bool {
        self.port.bytes_to_read().map(|n| n > 0).unwrap_or(false)
    }

    async fn is_connection_ok(&mut self) -> bool {
        self.open
    }

    fn connection_info(&self) -> String {
        format!(
            "{} @ {} baud ({}{}{})",
            self.config.port,
            self.config.baud_rate,
            self.config.data_bits,
            match self.config.parity {
                SerialParity::None => "N",
                SerialParity::Odd => "O",
                SerialParity::Even => "E",
            },
            self.config.stop_bits
        )
    }

    fn stats(&self) -> InterfaceStats {
        self.stats
    }
}

/// Half of one character's duration at the given line parameters
///
/// Above 19200 baud the Modbus specification fixes the timing constants
/// instead of scaling them with bit time.
fn half_char_length(baud_rate: u32, data_bits: u8, stop_bits: u8, parity: SerialParity) -> Duration {
    if baud_rate > 19200 {
        return FAST_BAUD_HALF_CHAR;
    }

    let parity_bit: u64 = match parity {
        SerialParity::None => 0,
        SerialParity::Odd | SerialParity::Even => 1,
    };
    let bits_per_char = u64::from(data_bits) + u64::from(stop_bits) + parity_bit;
    Duration::from_nanos(bits_per_char * 1_000_000_000 / u64::from(baud_rate) / 2)
}

/// Write the two-byte RTU header and report the frame layout
fn write_header(
    address: u8,
    function: u8,
    data_length: usize,
    buffer: &mut [u8],
    context: TelegramContext,
) -> Result<TelegramLayout, TransportError> {
    if buffer.len() < 2 {
        return Err(TransportError::BufferTooSmall {
            frame: 2,
            buffer: buffer.len(),
        });
    }
    buffer[0] = address;
    buffer[1] = function;

    Ok(TelegramLayout {
        length: data_length + RTU_OVERHEAD,
        data_offset: 2,
        context,
    })
}

/// Compute the CRC over the frame body and write the trailer, low byte first
fn seal_telegram(buffer: &mut [u8], length: usize) -> Result<(), TransportError> {
    if length < MIN_TELEGRAM_LENGTH {
        return Err(TransportError::TelegramTooShort(length));
    }
    if buffer.len() < length {
        return Err(TransportError::BufferTooSmall {
            frame: length,
            buffer: buffer.len(),
        });
    }

    let crc = checksum::crc16_modbus(&buffer[..length - 2]);
    buffer[length - 2..length].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// Validate a received frame and locate its payload window
fn parse_frame(
    buffer: &[u8],
    length: usize,
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

    let calculated = checksum::crc16_modbus(&buffer[..length - 2]);
    let received = u16::from_le_bytes([buffer[length - 2], buffer[length - 1]]);
    if calculated != received {
        return Err(TransportError::CrcMismatch {
            calculated,
            received,
        });
    }

    // No correlation field on this medium; ordering is trusted.
    Ok(Some(ParsedTelegram {
        address: buffer[0],
        function: buffer[1],
        data_offset: 2,
        data_length: length - RTU_OVERHEAD,
        context,
    }))
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<tokio_serial::SerialPortInfo>, TransportError> {
    tokio_serial::available_ports().map_err(|e| TransportError::Io(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_shape() {
        let mut buffer = [0u8; 16];
        let layout = write_header(0x11, 0x03, 4, &mut buffer, TelegramContext::None).unwrap();
        assert_eq!(layout.length, 8);
        assert_eq!(layout.data_offset, 2);
        assert_eq!(buffer[0], 0x11);
        assert_eq!(buffer[1], 0x03);
    }

    #[test]
    fn test_header_needs_two_bytes() {
        let mut buffer = [0u8; 1];
        assert!(matches!(
            write_header(0x11, 0x03, 0, &mut buffer, TelegramContext::None),
            Err(TransportError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_seal_and_parse_round_trip() {
        // Reference frame: 11 03 00 6B 00 03 76 87
        let mut buffer = [0u8; 16];
        let layout = write_header(0x11, 0x03, 4, &mut buffer, TelegramContext::None).unwrap();
        buffer[layout.data_offset..layout.data_offset + 4].copy_from_slice(&[0x00, 0x6B, 0x00, 0x03]);
        seal_telegram(&mut buffer, layout.length).unwrap();
        assert_eq!(&buffer[..8], &[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x87]);

        let parsed = parse_frame(&buffer, layout.length, TelegramContext::None)
            .unwrap()
            .unwrap();
        assert_eq!(parsed.address, 0x11);
        assert_eq!(parsed.function, 0x03);
        assert_eq!(parsed.data_offset, 2);
        assert_eq!(parsed.data_length, 4);
    }

    #[test]
    fn test_corrupted_byte_fails_crc() {
        let buffer = [0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x87];
        for i in 0..6 {
            let mut corrupted = buffer;
            corrupted[i] ^= 0x01;
            assert!(matches!(
                parse_frame(&corrupted, 8, TelegramContext::None),
                Err(TransportError::CrcMismatch { .. })
            ));
        }
        // The untouched frame still parses.
        assert!(parse_frame(&buffer, 8, TelegramContext::None).is_ok());
    }

    #[test]
    fn test_short_frame_rejected_before_reading_fields() {
        let buffer = [0x11, 0x03, 0x76];
        assert!(matches!(
            parse_frame(&buffer, 3, TelegramContext::None),
            Err(TransportError::TelegramTooShort(3))
        ));
    }

    #[test]
    fn test_seal_rejects_short_frame() {
        let mut buffer = [0u8; 8];
        assert!(matches!(
            seal_telegram(&mut buffer, 3),
            Err(TransportError::TelegramTooShort(3))
        ));
    }

    #[test]
    fn test_half_char_length_slow_baud() {
        // 9600 8N1: 9 bits per character, 937.5 us, half is 468.75 us
        let half = half_char_length(9600, 8, 1, SerialParity::None);
        assert_eq!(half, Duration::from_nanos(468_750));

        // 9600 8E1: parity adds a bit
        let half = half_char_length(9600, 8, 1, SerialParity::Even);
        assert_eq!(half, Duration::from_nanos(520_833));
    }

    #[test]
    fn test_half_char_length_fast_baud_is_fixed() {
        assert_eq!(half_char_length(38400, 8, 1, SerialParity::None), FAST_BAUD_HALF_CHAR);
        assert_eq!(half_char_length(115_200, 8, 2, SerialParity::Even), FAST_BAUD_HALF_CHAR);
    }
}
