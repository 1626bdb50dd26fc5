//! # Bridge Error Handling
//!
//! A single error type covers both halves of the bridge: the FDX frame codec and
//! socket transport on one side, the Modbus RTU master on the other.
//!
//! ## Error Categories
//!
//! ### FDX Frame Errors
//! - **Malformed Frame**: header shorter than 16 bytes, wrong signature, impossible command size
//! - **Truncated Frame**: a command declares more bytes than remain in the datagram
//! - **Unknown Command**: command code outside the defined set
//!
//! ### Usage Errors
//! - **Protocol Usage**: append requested while no frame header is pending
//! - **Payload Too Large**: payload would not fit the maximum FDX frame size
//!
//! ### Transport Errors
//! - **I/O Errors**: socket or serial failures during an active loop
//! - **Connection Errors**: serial open/probe failures, bind/connect failures
//! - **Timeout Errors**: a Modbus slave did not answer in time
//!
//! ### Modbus Protocol Errors
//! - **Frame / CRC / Exception**: malformed RTU responses and slave exceptions
//! - **Invalid Function / Address / Data**: requests the master refuses to send
//!
//! ## Error Recovery
//!
//! ```rust
//! use fdx_modbus_bridge::{BridgeError, BridgeResult};
//!
//! fn handle(result: BridgeResult<Vec<u16>>) {
//!     match result {
//!         Ok(registers) => println!("read {} registers", registers.len()),
//!         Err(error) if error.is_link_failure() => println!("link lost: {}", error),
//!         Err(error) if error.is_recoverable() => println!("retryable: {}", error),
//!         Err(error) => println!("dropped: {}", error),
//!     }
//! }
//!
//! handle(Err(BridgeError::timeout("read holding registers", 1000)));
//! ```

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors raised by the FDX engine, the Modbus master and the bridge glue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// I/O failure on a socket or serial line that was already open.
    ///
    /// Raised inside a running loop this marks the link as lost; the loop
    /// exits and no reconnection is attempted.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment failure.
    ///
    /// # Examples
    /// - Serial device cannot be opened
    /// - Probe slave does not answer on connect
    /// - Local UDP/TCP port already in use
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Operation exceeded its deadline.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// FDX datagram cannot be interpreted at all.
    #[error("Malformed FDX frame: {message}")]
    MalformedFrame { message: String },

    /// FDX command declares more bytes than the datagram holds.
    ///
    /// Commands decoded before the truncation point remain valid.
    #[error("Truncated FDX frame: command {index} needs {needed} bytes, {available} available")]
    TruncatedFrame {
        index: u16,
        needed: usize,
        available: usize,
    },

    /// FDX command code outside the defined set.
    #[error("Unknown FDX command code: 0x{code:04X}")]
    UnknownCommand { code: u16 },

    /// A session operation was used out of order.
    ///
    /// The pending frame is left untouched.
    #[error("Protocol usage error: {message}")]
    ProtocolUsage { message: String },

    /// Payload does not fit into one FDX frame.
    #[error("Payload too large: {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Modbus function code not supported by this master.
    #[error("Invalid function code: {code}")]
    InvalidFunction { code: u8 },

    /// Register address/quantity combination outside protocol limits.
    ///
    /// # Examples
    /// - Reading 200 holding registers (max 125)
    /// - Zero quantity in a read request
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Value that fails validation.
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// CRC check failure on an RTU response.
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Modbus exception response returned by a slave.
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Slave Device Failure
    /// - 0x05: Acknowledge
    /// - 0x06: Slave Device Busy
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// RTU frame structure violation.
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Operation requires an open link.
    #[error("Not connected: {message}")]
    NotConnected { message: String },

    /// Internal invariant violation.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BridgeError {
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn malformed_frame<S: Into<String>>(message: S) -> Self {
        Self::MalformedFrame { message: message.into() }
    }

    pub fn truncated_frame(index: u16, needed: usize, available: usize) -> Self {
        Self::TruncatedFrame {
            index,
            needed,
            available,
        }
    }

    pub fn unknown_command(code: u16) -> Self {
        Self::UnknownCommand { code }
    }

    pub fn protocol_usage<S: Into<String>>(message: S) -> Self {
        Self::ProtocolUsage { message: message.into() }
    }

    pub fn payload_too_large(size: usize, limit: usize) -> Self {
        Self::PayloadTooLarge { size, limit }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a Modbus exception error, mapping the standard codes to text.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception {
            function,
            code,
            message,
        }
    }

    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn not_connected<S: Into<String>>(message: S) -> Self {
        Self::NotConnected { message: message.into() }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if retrying the same operation might succeed.
    ///
    /// ```rust
    /// use fdx_modbus_bridge::BridgeError;
    ///
    /// assert!(BridgeError::timeout("read", 1000).is_recoverable());
    /// assert!(!BridgeError::invalid_function(0x99).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Timeout { .. } => true,
            Self::CrcMismatch { .. } => true,
            Self::Frame { .. } => true,
            // Acknowledge, Busy
            Self::Exception { code, .. } => matches!(code, 0x05 | 0x06),
            _ => false,
        }
    }

    /// Check if the error comes from the underlying socket or serial line.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. } | Self::NotConnected { .. }
        )
    }

    /// Check if the error is a wire-format violation (FDX or Modbus).
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame { .. }
                | Self::TruncatedFrame { .. }
                | Self::UnknownCommand { .. }
                | Self::InvalidFunction { .. }
                | Self::Exception { .. }
                | Self::Frame { .. }
                | Self::CrcMismatch { .. }
        )
    }

    /// Check if the link itself is gone, as opposed to a single failed transaction.
    ///
    /// A slave that times out leaves the line usable; a serial device that
    /// vanished does not.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::NotConnected { .. }
        )
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::AddrInUse => Self::connection(format!("address in use: {}", err)),
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable => {
                Self::connection(err.to_string())
            }
            std::io::ErrorKind::TimedOut => Self::timeout(err.to_string(), 0),
            _ => Self::io(err.to_string()),
        }
    }
}

/// Tokio timeouts carry no context; callers that know the deadline build
/// `BridgeError::timeout` themselves.
impl From<tokio::time::error::Elapsed> for BridgeError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<tokio_serial::Error> for BridgeError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::connection(format!("serial port: {}", err))
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for BridgeError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = BridgeError::timeout("read_registers", 1000);
        assert!(err.is_recoverable());
        assert!(err.is_transport_error());
        assert!(!err.is_link_failure());

        let err = BridgeError::exception(0x03, 0x02);
        assert!(!err.is_recoverable());
        assert!(err.is_protocol_error());

        let err = BridgeError::io("device removed");
        assert!(err.is_link_failure());
    }

    #[test]
    fn test_frame_errors_are_protocol_errors() {
        assert!(BridgeError::malformed_frame("bad signature").is_protocol_error());
        assert!(BridgeError::truncated_frame(1, 12, 4).is_protocol_error());
        assert!(BridgeError::unknown_command(0x42).is_protocol_error());
        assert!(!BridgeError::protocol_usage("append without header").is_protocol_error());
    }

    #[test]
    fn test_error_display() {
        let msg = format!("{}", BridgeError::crc_mismatch(0x1234, 0x5678));
        assert!(msg.contains("CRC validation failed"));
        assert!(msg.contains("1234"));
        assert!(msg.contains("5678"));

        let msg = format!("{}", BridgeError::unknown_command(0x42));
        assert!(msg.contains("0x0042"));
    }

    #[test]
    fn test_io_error_mapping() {
        let in_use = std::io::Error::new(std::io::ErrorKind::AddrInUse, "busy");
        assert!(matches!(BridgeError::from(in_use), BridgeError::Connection { .. }));

        let broken = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(BridgeError::from(broken), BridgeError::Io { .. }));
    }
}
