//! # Modbus RTU Transport
//!
//! The [`ModbusTransport`] trait is the seam between the client's loops and
//! the wire. [`RtuTransport`] drives a real serial port; the simulator in
//! [`crate::modbus::simulator`] implements the same trait in memory.
//!
//! ## RTU framing
//!
//! - Slave id, PDU, CRC-16/MODBUS (low byte first)
//! - Frames are delimited by a silent interval of 3.5 character times
//! - One outstanding request at a time; the caller serializes access
//!
//! ```rust,no_run
//! use fdx_modbus_bridge::config::SerialConfig;
//! use fdx_modbus_bridge::modbus::transport::{ModbusTransport, RtuTransport};
//! use fdx_modbus_bridge::modbus::protocol::ModbusRequest;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut transport = RtuTransport::open(&SerialConfig::default())?;
//!     let response = transport.request(&ModbusRequest::new_read(1, 0, 10)).await?;
//!     println!("registers: {:?}", response.parse_registers()?);
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use crate::config::{Parity, SerialConfig};
use crate::error::{BridgeError, BridgeResult};
use crate::logging::CallbackLogger;
use crate::modbus::protocol::{crc16_modbus, ModbusFunction, ModbusRequest, ModbusResponse};

/// Maximum frame size for Modbus RTU
const MAX_RTU_FRAME_SIZE: usize = 256;

/// Transport abstraction for one Modbus line.
///
/// `request` performs one complete transaction. Implementations are not
/// required to tolerate concurrent use; callers hold `&mut self`.
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    /// Send a request and wait for the matching response.
    ///
    /// Exception responses are returned as `BridgeError::Exception`.
    async fn request(&mut self, request: &ModbusRequest) -> BridgeResult<ModbusResponse>;

    fn is_connected(&self) -> bool;

    async fn close(&mut self) -> BridgeResult<()>;

    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Encode a request into a complete RTU frame including CRC.
pub fn encode_rtu_frame(request: &ModbusRequest) -> Vec<u8> {
    let mut frame = Vec::with_capacity(9 + request.data.len());
    frame.push(request.slave_id);
    frame.push(request.function.to_u8());
    frame.extend_from_slice(&request.address.to_be_bytes());

    match request.function {
        ModbusFunction::ReadHoldingRegisters => {
            frame.extend_from_slice(&request.quantity.to_be_bytes());
        }
        ModbusFunction::WriteSingleRegister => {
            frame.extend_from_slice(&request.data[..2.min(request.data.len())]);
        }
        ModbusFunction::WriteMultipleRegisters => {
            frame.extend_from_slice(&request.quantity.to_be_bytes());
            frame.push(request.data.len() as u8);
            frame.extend_from_slice(&request.data);
        }
    }

    let crc = crc16_modbus(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Check CRC and split an RTU frame into a response.
pub fn decode_rtu_frame(frame: &[u8]) -> BridgeResult<ModbusResponse> {
    if frame.len() < 4 {
        return Err(BridgeError::frame("RTU frame too short"));
    }

    let data_len = frame.len() - 2;
    let received_crc = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    let calculated_crc = crc16_modbus(&frame[..data_len]);
    if received_crc != calculated_crc {
        return Err(BridgeError::crc_mismatch(calculated_crc, received_crc));
    }

    let slave_id = frame[0];
    let function_code = frame[1];

    if function_code & 0x80 != 0 {
        if frame.len() < 5 {
            return Err(BridgeError::frame("Invalid exception response"));
        }
        return Ok(ModbusResponse::new_exception(
            slave_id,
            ModbusFunction::from_u8(function_code & 0x7F)?,
            frame[2],
        ));
    }

    let function = ModbusFunction::from_u8(function_code)?;
    Ok(ModbusResponse::new_success(slave_id, function, frame[2..data_len].to_vec()))
}

/// Modbus RTU transport over a serial port
pub struct RtuTransport {
    port: Option<tokio_serial::SerialStream>,
    port_name: String,
    timeout: Duration,
    /// Minimum silent interval between frames
    frame_gap: Duration,
    stats: TransportStats,
    logger: CallbackLogger,
}

impl RtuTransport {
    /// Open the serial port described by `config`.
    pub fn open(config: &SerialConfig) -> BridgeResult<Self> {
        Self::open_with_logger(config, CallbackLogger::disabled())
    }

    pub fn open_with_logger(config: &SerialConfig, logger: CallbackLogger) -> BridgeResult<Self> {
        config.validate()?;

        let builder = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(data_bits(config.data_bits)?)
            .stop_bits(if config.stop_bits == 2 {
                tokio_serial::StopBits::Two
            } else {
                tokio_serial::StopBits::One
            })
            .parity(match config.parity {
                Parity::None => tokio_serial::Parity::None,
                Parity::Even => tokio_serial::Parity::Even,
                Parity::Odd => tokio_serial::Parity::Odd,
            })
            .timeout(config.timeout());

        let port = tokio_serial::SerialStream::open(&builder).map_err(|e| {
            BridgeError::connection(format!("Failed to open serial port {}: {}", config.port, e))
        })?;

        debug!(
            "Opened {} at {} baud ({}{:?}{})",
            config.port, config.baud_rate, config.data_bits, config.parity, config.stop_bits
        );

        Ok(Self {
            port: Some(port),
            port_name: config.port.clone(),
            timeout: config.timeout(),
            frame_gap: frame_gap(config.baud_rate),
            stats: TransportStats::default(),
            logger,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    async fn read_frame(&mut self) -> BridgeResult<Vec<u8>> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| BridgeError::not_connected("Serial port closed"))?;

        let mut frame = Vec::new();
        let mut buffer = [0u8; 1];

        loop {
            match timeout(self.frame_gap, port.read_exact(&mut buffer)).await {
                Ok(Ok(_)) => {
                    frame.push(buffer[0]);
                    if frame.len() > MAX_RTU_FRAME_SIZE {
                        return Err(BridgeError::frame("RTU frame too large"));
                    }
                }
                Ok(Err(e)) => return Err(BridgeError::io(format!("Serial read error: {}", e))),
                // silent interval: end of frame once something arrived
                Err(_) if !frame.is_empty() => break,
                Err(_) => {}
            }
        }

        Ok(frame)
    }
}

/// 3.5 character times, 11 bits per character.
fn frame_gap(baud_rate: u32) -> Duration {
    let char_time_us = 11_000_000 / baud_rate.max(1) as u64;
    Duration::from_micros(char_time_us * 35 / 10)
}

fn data_bits(bits: u8) -> BridgeResult<tokio_serial::DataBits> {
    match bits {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        other => Err(BridgeError::configuration(format!("Unsupported data bits: {}", other))),
    }
}

#[async_trait]
impl ModbusTransport for RtuTransport {
    async fn request(&mut self, request: &ModbusRequest) -> BridgeResult<ModbusResponse> {
        request.validate()?;

        tokio::time::sleep(self.frame_gap).await;

        let frame = encode_rtu_frame(request);
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        self.logger.log_request(
            request.slave_id,
            request.function.to_u8(),
            request.address,
            request.quantity,
            &request.data,
        );

        let port = self
            .port
            .as_mut()
            .ok_or_else(|| BridgeError::not_connected("Serial port closed"))?;

        match timeout(self.timeout, port.write_all(&frame)).await {
            Ok(Ok(_)) => {
                let _ = timeout(self.timeout, port.flush()).await;
            }
            Ok(Err(e)) => {
                self.stats.errors += 1;
                return Err(BridgeError::io(format!("Failed to send RTU frame: {}", e)));
            }
            Err(_) => {
                self.stats.timeouts += 1;
                self.stats.errors += 1;
                return Err(BridgeError::timeout("send request", self.timeout.as_millis() as u64));
            }
        }

        let response_frame = match timeout(self.timeout, self.read_frame()).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                self.stats.errors += 1;
                return Err(e);
            }
            Err(_) => {
                self.stats.timeouts += 1;
                self.stats.errors += 1;
                return Err(BridgeError::timeout(
                    format!("response from slave {}", request.slave_id),
                    self.timeout.as_millis() as u64,
                ));
            }
        };

        self.stats.responses_received += 1;
        self.stats.bytes_received += response_frame.len() as u64;

        let response = match decode_rtu_frame(&response_frame) {
            Ok(response) => response,
            Err(e) => {
                self.stats.errors += 1;
                return Err(e);
            }
        };
        self.logger
            .log_response(response.slave_id, response_frame[1], &response.data);

        if response.slave_id != request.slave_id {
            self.stats.errors += 1;
            return Err(BridgeError::frame(format!(
                "Response slave ID mismatch: expected {}, got {}",
                request.slave_id, response.slave_id
            )));
        }
        if let Some(code) = response.exception_code {
            self.stats.errors += 1;
            return Err(BridgeError::exception(response.function.to_u8(), code));
        }

        Ok(response)
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    async fn close(&mut self) -> BridgeResult<()> {
        if let Some(mut port) = self.port.take() {
            let _ = port.shutdown().await;
            debug!("Closed serial port {}", self.port_name);
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_read_frame() {
        let frame = encode_rtu_frame(&ModbusRequest::new_read(1, 0, 2));
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
    }

    #[test]
    fn test_encode_write_single_frame() {
        let request = ModbusRequest::new_write(1, ModbusFunction::WriteSingleRegister, 1, vec![0x00, 0x03]);
        assert_eq!(
            encode_rtu_frame(&request),
            vec![0x01, 0x06, 0x00, 0x01, 0x00, 0x03, 0x98, 0x0B]
        );
    }

    #[test]
    fn test_encode_write_multiple_frame() {
        let request = ModbusRequest::new_write(
            1,
            ModbusFunction::WriteMultipleRegisters,
            0x10,
            vec![0x00, 0x0A, 0x01, 0x02],
        );
        let frame = encode_rtu_frame(&request);
        assert_eq!(&frame[..11], &[0x01, 0x10, 0x00, 0x10, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]);
        let crc = crc16_modbus(&frame[..11]);
        assert_eq!(&frame[11..], &crc.to_le_bytes());
    }

    #[test]
    fn test_decode_response_frames() {
        let mut frame = vec![0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B];
        let crc = crc16_modbus(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        let response = decode_rtu_frame(&frame).unwrap();
        assert_eq!(response.parse_registers().unwrap(), vec![10, 11]);

        let mut exception = vec![0x01, 0x83, 0x02];
        let crc = crc16_modbus(&exception);
        exception.extend_from_slice(&crc.to_le_bytes());
        let response = decode_rtu_frame(&exception).unwrap();
        assert_eq!(response.exception_code, Some(0x02));
    }

    #[test]
    fn test_decode_rejects_bad_crc() {
        let frame = [0x01, 0x03, 0x02, 0x00, 0x01, 0x00, 0x00];
        assert!(matches!(decode_rtu_frame(&frame), Err(BridgeError::CrcMismatch { .. })));
    }

    #[test]
    fn test_frame_gap() {
        // 115200 baud: 95 us per character
        assert_eq!(frame_gap(115_200), Duration::from_micros(332));
        assert_eq!(frame_gap(9600), Duration::from_micros(4007));
    }
}
