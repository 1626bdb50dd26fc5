/// FDX protocol definitions and data structures
///
/// Wire constants, the datagram header, command codes and the typed command
/// payloads exchanged with CANoe over UDP or TCP.
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BridgeError, BridgeResult};

/// Fixed datagram signature, ASCII "CANoeFDX".
pub const FDX_SIGNATURE: [u8; 8] = [0x43, 0x41, 0x4E, 0x6F, 0x65, 0x46, 0x44, 0x58];

/// Size of the datagram header.
pub const HEADER_SIZE: usize = 16;

/// Size of the per-command size/code prefix.
pub const COMMAND_HEADER_SIZE: usize = 4;

/// Largest frame CANoe accepts.
pub const MAX_FRAME_SIZE: usize = 0xFFE3;

/// First sequence number of a UDP session.
pub const SEQUENCE_START: u16 = 1;

/// Sequence numbers wrap back to `SEQUENCE_START` instead of reaching this value.
pub const SEQUENCE_LIMIT: u16 = 0x7FFF;

pub(crate) const OFFSET_VERSION_MAJOR: usize = 8;
pub(crate) const OFFSET_VERSION_MINOR: usize = 9;
pub(crate) const OFFSET_COMMAND_COUNT: usize = 10;
pub(crate) const OFFSET_SEQUENCE_OR_LENGTH: usize = 12;
pub(crate) const OFFSET_FLAGS: usize = 14;

/// Byte order negotiated for every multi-byte field of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FdxByteOrder {
    #[default]
    Big,
    Little,
}

impl FdxByteOrder {
    /// Decode from the header's protocol-flags byte (bit 0).
    pub fn from_flags(flags: u8) -> Self {
        if flags & 0x01 == 0x01 {
            FdxByteOrder::Big
        } else {
            FdxByteOrder::Little
        }
    }

    pub fn flags(self) -> u8 {
        match self {
            FdxByteOrder::Big => 0x01,
            FdxByteOrder::Little => 0x00,
        }
    }

    pub fn read_u16(self, buf: &[u8]) -> u16 {
        match self {
            FdxByteOrder::Big => BigEndian::read_u16(buf),
            FdxByteOrder::Little => LittleEndian::read_u16(buf),
        }
    }

    pub fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            FdxByteOrder::Big => BigEndian::read_u32(buf),
            FdxByteOrder::Little => LittleEndian::read_u32(buf),
        }
    }

    pub fn read_u64(self, buf: &[u8]) -> u64 {
        match self {
            FdxByteOrder::Big => BigEndian::read_u64(buf),
            FdxByteOrder::Little => LittleEndian::read_u64(buf),
        }
    }

    pub fn read_i64(self, buf: &[u8]) -> i64 {
        match self {
            FdxByteOrder::Big => BigEndian::read_i64(buf),
            FdxByteOrder::Little => LittleEndian::read_i64(buf),
        }
    }

    /// Overwrite a u16 field in place.
    pub fn write_u16(self, buf: &mut [u8], value: u16) {
        match self {
            FdxByteOrder::Big => BigEndian::write_u16(buf, value),
            FdxByteOrder::Little => LittleEndian::write_u16(buf, value),
        }
    }

    pub fn put_u16(self, dst: &mut BytesMut, value: u16) {
        match self {
            FdxByteOrder::Big => dst.put_u16(value),
            FdxByteOrder::Little => dst.put_u16_le(value),
        }
    }

    pub fn put_u32(self, dst: &mut BytesMut, value: u32) {
        match self {
            FdxByteOrder::Big => dst.put_u32(value),
            FdxByteOrder::Little => dst.put_u32_le(value),
        }
    }

    pub fn put_u64(self, dst: &mut BytesMut, value: u64) {
        match self {
            FdxByteOrder::Big => dst.put_u64(value),
            FdxByteOrder::Little => dst.put_u64_le(value),
        }
    }

    pub fn put_i64(self, dst: &mut BytesMut, value: i64) {
        match self {
            FdxByteOrder::Big => dst.put_i64(value),
            FdxByteOrder::Little => dst.put_i64_le(value),
        }
    }
}

impl fmt::Display for FdxByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FdxByteOrder::Big => write!(f, "big-endian"),
            FdxByteOrder::Little => write!(f, "little-endian"),
        }
    }
}

/// Protocol version carried in header bytes 8 and 9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FdxVersion {
    pub major: u8,
    pub minor: u8,
}

impl FdxVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl Default for FdxVersion {
    fn default() -> Self {
        Self::new(2, 1)
    }
}

impl fmt::Display for FdxVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Socket flavour; decides the meaning of header bytes 12..14.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Bytes 12..14 hold the sequence number.
    #[default]
    Udp,
    /// Bytes 12..14 hold the total frame length.
    Tcp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Udp => write!(f, "UDP"),
            TransportKind::Tcp => write!(f, "TCP"),
        }
    }
}

/// Decoded datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdxHeader {
    pub version: FdxVersion,
    pub command_count: u16,
    /// Sequence number (UDP) or total frame length (TCP).
    pub sequence_or_length: u16,
    pub byte_order: FdxByteOrder,
}

/// FDX command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum FdxCommandCode {
    Start = 0x0001,
    Stop = 0x0002,
    Key = 0x0003,
    Status = 0x0004,
    DataExchange = 0x0005,
    DataRequest = 0x0006,
    DataError = 0x0007,
    FreeRunningRequest = 0x0008,
    FreeRunningCancel = 0x0009,
    StatusRequest = 0x000A,
    SequenceNumberError = 0x000B,
    FunctionCall = 0x000C,
    FunctionCallError = 0x000D,
    IncrementTime = 0x0011,
}

impl FdxCommandCode {
    pub fn from_u16(value: u16) -> BridgeResult<Self> {
        match value {
            0x0001 => Ok(FdxCommandCode::Start),
            0x0002 => Ok(FdxCommandCode::Stop),
            0x0003 => Ok(FdxCommandCode::Key),
            0x0004 => Ok(FdxCommandCode::Status),
            0x0005 => Ok(FdxCommandCode::DataExchange),
            0x0006 => Ok(FdxCommandCode::DataRequest),
            0x0007 => Ok(FdxCommandCode::DataError),
            0x0008 => Ok(FdxCommandCode::FreeRunningRequest),
            0x0009 => Ok(FdxCommandCode::FreeRunningCancel),
            0x000A => Ok(FdxCommandCode::StatusRequest),
            0x000B => Ok(FdxCommandCode::SequenceNumberError),
            0x000C => Ok(FdxCommandCode::FunctionCall),
            0x000D => Ok(FdxCommandCode::FunctionCallError),
            0x0011 => Ok(FdxCommandCode::IncrementTime),
            _ => Err(BridgeError::unknown_command(value)),
        }
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            FdxCommandCode::Start => "Start",
            FdxCommandCode::Stop => "Stop",
            FdxCommandCode::Key => "Key",
            FdxCommandCode::Status => "Status",
            FdxCommandCode::DataExchange => "DataExchange",
            FdxCommandCode::DataRequest => "DataRequest",
            FdxCommandCode::DataError => "DataError",
            FdxCommandCode::FreeRunningRequest => "FreeRunningRequest",
            FdxCommandCode::FreeRunningCancel => "FreeRunningCancel",
            FdxCommandCode::StatusRequest => "StatusRequest",
            FdxCommandCode::SequenceNumberError => "SequenceNumberError",
            FdxCommandCode::FunctionCall => "FunctionCall",
            FdxCommandCode::FunctionCallError => "FunctionCallError",
            FdxCommandCode::IncrementTime => "IncrementTime",
        }
    }
}

impl fmt::Display for FdxCommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:04X})", self.name(), self.to_u16())
    }
}

/// Command as found on the wire, before payload interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommand {
    pub code: u16,
    pub payload: Bytes,
}

impl RawCommand {
    pub fn new(code: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    /// Encoded length including the size/code prefix.
    pub fn wire_len(&self) -> usize {
        COMMAND_HEADER_SIZE + self.payload.len()
    }
}

/// CANoe measurement state reported by the status command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasurementState {
    NotRunning,
    PreStart,
    Running,
    Stop,
    Unknown(u8),
}

impl MeasurementState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => MeasurementState::NotRunning,
            2 => MeasurementState::PreStart,
            3 => MeasurementState::Running,
            4 => MeasurementState::Stop,
            other => MeasurementState::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            MeasurementState::NotRunning => 1,
            MeasurementState::PreStart => 2,
            MeasurementState::Running => 3,
            MeasurementState::Stop => 4,
            MeasurementState::Unknown(other) => other,
        }
    }
}

impl fmt::Display for MeasurementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementState::NotRunning => write!(f, "not running"),
            MeasurementState::PreStart => write!(f, "pre-start"),
            MeasurementState::Running => write!(f, "running"),
            MeasurementState::Stop => write!(f, "stopped"),
            MeasurementState::Unknown(code) => write!(f, "unknown ({})", code),
        }
    }
}

/// Transmission flags of a free-running request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FreeRunningFlags(pub u16);

impl FreeRunningFlags {
    pub const TRANSMIT_AT_PRE_START: FreeRunningFlags = FreeRunningFlags(0x0001);
    pub const TRANSMIT_AT_STOP: FreeRunningFlags = FreeRunningFlags(0x0002);
    pub const TRANSMIT_CYCLIC: FreeRunningFlags = FreeRunningFlags(0x0004);
    pub const TRANSMIT_AT_TRIGGER: FreeRunningFlags = FreeRunningFlags(0x0008);

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: FreeRunningFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FreeRunningFlags {
    type Output = FreeRunningFlags;

    fn bitor(self, rhs: FreeRunningFlags) -> FreeRunningFlags {
        FreeRunningFlags(self.0 | rhs.0)
    }
}

/// Error codes carried by the data-error command.
pub mod data_error_code {
    pub const MEASUREMENT_NOT_RUNNING: u16 = 1;
    pub const GROUP_ID_INVALID: u16 = 2;
    pub const DATA_SIZE_TOO_LARGE: u16 = 3;

    pub fn describe(code: u16) -> &'static str {
        match code {
            MEASUREMENT_NOT_RUNNING => "measurement not running",
            GROUP_ID_INVALID => "group id invalid",
            DATA_SIZE_TOO_LARGE => "data size too large",
            _ => "unknown data error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCommand {
    pub state: MeasurementState,
    /// Measurement time in nanoseconds.
    pub timestamp_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataExchange {
    pub group_id: u16,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataError {
    pub group_id: u16,
    pub error_code: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRunningRequest {
    pub group_id: u16,
    pub flags: FreeRunningFlags,
    pub cycle_time: u32,
    pub first_duration: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceNumberError {
    pub received: u16,
    pub expected: u16,
}

/// Every command the protocol defines, with its decoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FdxCommand {
    Start,
    Stop,
    Key { key_code: u32 },
    Status(StatusCommand),
    DataExchange(DataExchange),
    DataRequest { group_id: u16 },
    DataError(DataError),
    FreeRunningRequest(FreeRunningRequest),
    FreeRunningCancel { group_id: u16 },
    StatusRequest,
    SequenceNumberError(SequenceNumberError),
    FunctionCall,
    FunctionCallError,
    IncrementTime { time_step: u64 },
}

impl FdxCommand {
    pub fn code(&self) -> FdxCommandCode {
        match self {
            FdxCommand::Start => FdxCommandCode::Start,
            FdxCommand::Stop => FdxCommandCode::Stop,
            FdxCommand::Key { .. } => FdxCommandCode::Key,
            FdxCommand::Status(_) => FdxCommandCode::Status,
            FdxCommand::DataExchange(_) => FdxCommandCode::DataExchange,
            FdxCommand::DataRequest { .. } => FdxCommandCode::DataRequest,
            FdxCommand::DataError(_) => FdxCommandCode::DataError,
            FdxCommand::FreeRunningRequest(_) => FdxCommandCode::FreeRunningRequest,
            FdxCommand::FreeRunningCancel { .. } => FdxCommandCode::FreeRunningCancel,
            FdxCommand::StatusRequest => FdxCommandCode::StatusRequest,
            FdxCommand::SequenceNumberError(_) => FdxCommandCode::SequenceNumberError,
            FdxCommand::FunctionCall => FdxCommandCode::FunctionCall,
            FdxCommand::FunctionCallError => FdxCommandCode::FunctionCallError,
            FdxCommand::IncrementTime { .. } => FdxCommandCode::IncrementTime,
        }
    }

    /// Serialize the payload (without size/code prefix).
    pub fn encode_payload(&self, order: FdxByteOrder) -> BridgeResult<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            FdxCommand::Start
            | FdxCommand::Stop
            | FdxCommand::StatusRequest
            | FdxCommand::FunctionCall
            | FdxCommand::FunctionCallError => {}
            FdxCommand::Key { key_code } => order.put_u32(&mut buf, *key_code),
            FdxCommand::Status(status) => {
                buf.put_u8(status.state.to_u8());
                buf.put_bytes(0, 3);
                order.put_i64(&mut buf, status.timestamp_ns);
            }
            FdxCommand::DataExchange(exchange) => {
                let size = u16::try_from(exchange.data.len())
                    .map_err(|_| BridgeError::payload_too_large(exchange.data.len(), u16::MAX as usize))?;
                order.put_u16(&mut buf, exchange.group_id);
                order.put_u16(&mut buf, size);
                buf.extend_from_slice(&exchange.data);
            }
            FdxCommand::DataRequest { group_id } | FdxCommand::FreeRunningCancel { group_id } => {
                order.put_u16(&mut buf, *group_id)
            }
            FdxCommand::DataError(error) => {
                order.put_u16(&mut buf, error.group_id);
                order.put_u16(&mut buf, error.error_code);
            }
            FdxCommand::FreeRunningRequest(request) => {
                order.put_u16(&mut buf, request.group_id);
                order.put_u16(&mut buf, request.flags.bits());
                order.put_u32(&mut buf, request.cycle_time);
                order.put_u32(&mut buf, request.first_duration);
            }
            FdxCommand::SequenceNumberError(error) => {
                order.put_u16(&mut buf, error.received);
                order.put_u16(&mut buf, error.expected);
            }
            FdxCommand::IncrementTime { time_step } => {
                buf.put_bytes(0, 4);
                order.put_u64(&mut buf, *time_step);
            }
        }
        Ok(buf.freeze())
    }

    pub fn to_raw(&self, order: FdxByteOrder) -> BridgeResult<RawCommand> {
        Ok(RawCommand::new(self.code().to_u16(), self.encode_payload(order)?))
    }

    /// Interpret a raw command's payload. Trailing bytes beyond the fixed layout are ignored.
    pub fn decode(raw: &RawCommand, order: FdxByteOrder) -> BridgeResult<Self> {
        let code = FdxCommandCode::from_u16(raw.code)?;
        let p = &raw.payload;
        let command = match code {
            FdxCommandCode::Start => FdxCommand::Start,
            FdxCommandCode::Stop => FdxCommand::Stop,
            FdxCommandCode::StatusRequest => FdxCommand::StatusRequest,
            FdxCommandCode::FunctionCall => FdxCommand::FunctionCall,
            FdxCommandCode::FunctionCallError => FdxCommand::FunctionCallError,
            FdxCommandCode::Key => {
                require_len(code, p, 4)?;
                FdxCommand::Key {
                    key_code: order.read_u32(&p[0..4]),
                }
            }
            FdxCommandCode::Status => {
                require_len(code, p, 12)?;
                FdxCommand::Status(StatusCommand {
                    state: MeasurementState::from_u8(p[0]),
                    timestamp_ns: order.read_i64(&p[4..12]),
                })
            }
            FdxCommandCode::DataExchange => {
                require_len(code, p, 4)?;
                let group_id = order.read_u16(&p[0..2]);
                let size = order.read_u16(&p[2..4]) as usize;
                if p.len() < 4 + size {
                    return Err(BridgeError::malformed_frame(format!(
                        "data exchange for group {} declares {} bytes, payload holds {}",
                        group_id,
                        size,
                        p.len() - 4
                    )));
                }
                FdxCommand::DataExchange(DataExchange {
                    group_id,
                    data: p.slice(4..4 + size),
                })
            }
            FdxCommandCode::DataRequest => {
                require_len(code, p, 2)?;
                FdxCommand::DataRequest {
                    group_id: order.read_u16(&p[0..2]),
                }
            }
            FdxCommandCode::DataError => {
                require_len(code, p, 4)?;
                FdxCommand::DataError(DataError {
                    group_id: order.read_u16(&p[0..2]),
                    error_code: order.read_u16(&p[2..4]),
                })
            }
            FdxCommandCode::FreeRunningRequest => {
                require_len(code, p, 12)?;
                FdxCommand::FreeRunningRequest(FreeRunningRequest {
                    group_id: order.read_u16(&p[0..2]),
                    flags: FreeRunningFlags(order.read_u16(&p[2..4])),
                    cycle_time: order.read_u32(&p[4..8]),
                    first_duration: order.read_u32(&p[8..12]),
                })
            }
            FdxCommandCode::FreeRunningCancel => {
                require_len(code, p, 2)?;
                FdxCommand::FreeRunningCancel {
                    group_id: order.read_u16(&p[0..2]),
                }
            }
            FdxCommandCode::SequenceNumberError => {
                require_len(code, p, 4)?;
                FdxCommand::SequenceNumberError(SequenceNumberError {
                    received: order.read_u16(&p[0..2]),
                    expected: order.read_u16(&p[2..4]),
                })
            }
            FdxCommandCode::IncrementTime => {
                require_len(code, p, 12)?;
                FdxCommand::IncrementTime {
                    time_step: order.read_u64(&p[4..12]),
                }
            }
        };
        Ok(command)
    }
}

fn require_len(code: FdxCommandCode, payload: &[u8], needed: usize) -> BridgeResult<()> {
    if payload.len() < needed {
        return Err(BridgeError::malformed_frame(format!(
            "{} payload needs {} bytes, got {}",
            code.name(),
            needed,
            payload.len()
        )));
    }
    Ok(())
}
