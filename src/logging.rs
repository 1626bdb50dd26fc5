//! Packet logging for the serial line and the FDX socket.
//!
//! Separate from the `tracing` diagnostics: a [`CallbackLogger`] receives one
//! line per frame, either as a hex dump, decoded, or both, and hands it to a
//! user callback. [`CallbackLogger::tracing`] routes those lines to the
//! `packets` target so they can be filtered with `RUST_LOG`.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

use crate::fdx::codec;
use crate::fdx::protocol::{FdxCommand, FdxCommandCode};
use crate::modbus::protocol::{crc16_modbus, ModbusFunction};

/// Severity attached to each packet line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        };
        f.write_str(name)
    }
}

/// How frames are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggingMode {
    /// Hex dump of the bytes on the wire
    Raw,
    /// Decoded fields
    #[default]
    Interpreted,
    /// Decoded line at info level, hex dump at debug level
    Both,
}

/// Sink for packet lines
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Packet logger shared by the RTU transport and the FDX transport.
///
/// Cloning shares the callback.
#[derive(Clone, Default)]
pub struct CallbackLogger {
    sink: Option<Arc<LogCallback>>,
    max_level: Option<LogLevel>,
    mode: LoggingMode,
}

impl CallbackLogger {
    pub fn new(callback: LogCallback, max_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            sink: Some(Arc::new(callback)),
            max_level: Some(max_level),
            mode,
        }
    }

    /// Timestamped lines on stdout, errors and warnings on stderr.
    pub fn console(mode: LoggingMode) -> Self {
        Self::new(
            Box::new(|level, line| {
                let now = chrono::Local::now().format("%H:%M:%S%.3f");
                if level <= LogLevel::Warn {
                    eprintln!("{} {:5} {}", now, level, line);
                } else {
                    println!("{} {:5} {}", now, level, line);
                }
            }),
            LogLevel::Debug,
            mode,
        )
    }

    /// Forward lines to `tracing` under the `packets` target.
    pub fn tracing(max_level: LogLevel, mode: LoggingMode) -> Self {
        Self::new(
            Box::new(|level, line| match level {
                LogLevel::Error => tracing::error!(target: "packets", "{}", line),
                LogLevel::Warn => tracing::warn!(target: "packets", "{}", line),
                LogLevel::Info => tracing::info!(target: "packets", "{}", line),
                LogLevel::Debug => tracing::debug!(target: "packets", "{}", line),
            }),
            max_level,
            mode,
        )
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn mode(&self) -> LoggingMode {
        self.mode
    }

    fn accepts(&self, level: LogLevel) -> bool {
        self.max_level.map_or(false, |max| level <= max)
    }

    fn write(&self, level: LogLevel, line: &str) {
        if !self.accepts(level) {
            return;
        }
        if let Some(sink) = &self.sink {
            sink(level, line);
        }
    }

    /// Outgoing RTU request; the raw form is rebuilt with its CRC.
    pub fn log_request(&self, slave_id: u8, function_code: u8, address: u16, quantity: u16, data: &[u8]) {
        self.emit(
            || {
                format!(
                    "RTU -> slave {} {} @{} x{}",
                    slave_id,
                    function_name(function_code),
                    address,
                    quantity
                )
            },
            || {
                let frame = raw_request_frame(slave_id, function_code, address, quantity, data);
                format!("RTU -> {}", hex_dump(&frame))
            },
        );
    }

    /// Incoming RTU response; `data` excludes slave id, function code and CRC.
    pub fn log_response(&self, slave_id: u8, function_code: u8, data: &[u8]) {
        self.emit(
            || {
                format!(
                    "RTU <- slave {} {}: {}",
                    slave_id,
                    function_name(function_code),
                    describe_response(function_code, data)
                )
            },
            || format!("RTU <- {}", hex_dump(&raw_response_frame(slave_id, function_code, data))),
        );
    }

    /// FDX frame; `direction` is "->" for sent and "<-" for received.
    pub fn log_fdx_frame(&self, direction: &str, frame: &[u8]) {
        self.emit(
            || format!("FDX {} {}", direction, describe_fdx_frame(frame)),
            || format!("FDX {} {}", direction, hex_dump(frame)),
        );
    }

    fn emit(&self, interpreted: impl FnOnce() -> String, raw: impl FnOnce() -> String) {
        if !self.accepts(LogLevel::Info) {
            return;
        }
        match self.mode {
            LoggingMode::Raw => self.write(LogLevel::Info, &raw()),
            LoggingMode::Interpreted => self.write(LogLevel::Info, &interpreted()),
            LoggingMode::Both => {
                self.write(LogLevel::Info, &interpreted());
                self.write(LogLevel::Debug, &raw());
            }
        }
    }
}

fn hex_dump(data: &[u8]) -> String {
    let mut text = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            text.push(' ');
        }
        text.push_str(&format!("{:02X}", byte));
    }
    text
}

fn raw_request_frame(slave_id: u8, function_code: u8, address: u16, quantity: u16, data: &[u8]) -> Vec<u8> {
    let mut frame = vec![slave_id, function_code];
    frame.extend_from_slice(&address.to_be_bytes());
    match function_code {
        0x06 => frame.extend_from_slice(data),
        0x10 => {
            frame.extend_from_slice(&quantity.to_be_bytes());
            frame.push(data.len() as u8);
            frame.extend_from_slice(data);
        }
        _ => frame.extend_from_slice(&quantity.to_be_bytes()),
    }
    let crc = crc16_modbus(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn raw_response_frame(slave_id: u8, function_code: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = vec![slave_id, function_code];
    frame.extend_from_slice(data);
    let crc = crc16_modbus(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn function_name(function_code: u8) -> String {
    match ModbusFunction::from_u8(function_code & 0x7F) {
        Ok(function) if function_code & 0x80 != 0 => format!("{} exception", function),
        Ok(function) => function.to_string(),
        Err(_) => format!("function 0x{:02X}", function_code),
    }
}

fn describe_response(function_code: u8, data: &[u8]) -> String {
    let word = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);
    match function_code {
        _ if data.is_empty() => "empty".to_string(),
        code if code & 0x80 != 0 => format!("code 0x{:02X}", data[0]),
        0x03 => {
            let words: Vec<String> = data[1..]
                .chunks_exact(2)
                .take(8)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]).to_string())
                .collect();
            let more = if data.len() > 17 { ", ..." } else { "" };
            format!("{} bytes [{}{}]", data[0], words.join(", "), more)
        }
        0x06 if data.len() >= 4 => format!("@{} = {} (0x{:04X})", word(0), word(2), word(2)),
        0x10 if data.len() >= 4 => format!("@{} x{}", word(0), word(2)),
        _ => hex::encode(data),
    }
}

fn describe_fdx_frame(frame: &[u8]) -> String {
    let bytes = Bytes::copy_from_slice(frame);
    let (header, decoded) = match codec::decode_frame(&bytes) {
        Ok(parts) => parts,
        Err(e) => return format!("undecodable ({} bytes): {}", frame.len(), e),
    };

    let commands: Vec<String> = decoded
        .commands
        .iter()
        .map(|raw| match FdxCommand::decode(raw, header.byte_order) {
            Ok(FdxCommand::DataExchange(exchange)) => {
                format!("DataExchange[group {}, {} bytes]", exchange.group_id, exchange.data.len())
            }
            Ok(FdxCommand::DataRequest { group_id }) => format!("DataRequest[group {}]", group_id),
            Ok(FdxCommand::FreeRunningRequest(request)) => {
                format!("FreeRunningRequest[group {}]", request.group_id)
            }
            Ok(FdxCommand::FreeRunningCancel { group_id }) => format!("FreeRunningCancel[group {}]", group_id),
            Ok(FdxCommand::Status(status)) => format!("Status[{}]", status.state),
            Ok(command) => command.code().name().to_string(),
            Err(_) => match FdxCommandCode::from_u16(raw.code) {
                Ok(code) => format!("{}[bad payload]", code.name()),
                Err(_) => format!("Unknown[0x{:04X}]", raw.code),
            },
        })
        .collect();

    let mut text = format!(
        "v{} seq/len {} {} commands: {}",
        header.version,
        header.sequence_or_length,
        header.command_count,
        commands.join(", ")
    );
    if let Some(error) = decoded.error {
        text.push_str(&format!(" ({})", error));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fdx::protocol::{FdxByteOrder, FdxVersion, TransportKind};
    use crate::fdx::session::FdxSession;
    use std::sync::Mutex;

    fn capture(mode: LoggingMode) -> (CallbackLogger, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let callback: LogCallback = Box::new(move |_level, message| {
            sink.lock().unwrap().push(message.to_string());
        });
        (CallbackLogger::new(callback, LogLevel::Debug, mode), lines)
    }

    #[test]
    fn test_raw_request_includes_crc() {
        let (logger, lines) = capture(LoggingMode::Raw);
        logger.log_request(1, 0x03, 0, 2, &[]);
        assert_eq!(lines.lock().unwrap()[0], "RTU -> 01 03 00 00 00 02 C4 0B");
    }

    #[test]
    fn test_interpreted_fdx_frame() {
        let (logger, lines) = capture(LoggingMode::Interpreted);
        let mut session = FdxSession::new(TransportKind::Udp, FdxVersion::default(), FdxByteOrder::Big);
        session.data_exchange(4, &[0, 1, 0, 2], false).unwrap();
        session.status_request(true).unwrap();
        logger.log_fdx_frame("->", &session.take_frame().unwrap());

        let line = lines.lock().unwrap()[0].clone();
        assert!(line.contains("DataExchange[group 4, 4 bytes]"));
        assert!(line.contains("StatusRequest"));
    }

    #[test]
    fn test_both_mode_logs_twice() {
        let (logger, lines) = capture(LoggingMode::Both);
        logger.log_response(1, 0x06, &[0x00, 0x01, 0x00, 0x03]);
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "RTU <- slave 1 Write Single Register (0x06): @1 = 3 (0x0003)");
        assert!(lines[1].ends_with("01 06 00 01 00 03 98 0B"));
    }

    #[test]
    fn test_disabled_logger_is_silent() {
        let logger = CallbackLogger::disabled();
        assert!(!logger.is_enabled());
        logger.log_fdx_frame("<-", &[0u8; 3]);
    }
}
