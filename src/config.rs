//! Bridge configuration.
//!
//! The top-level keys follow the flat bench configuration file layout
//! (`slaves_list`, `serial_baud_rate`, ...), so existing `config.json` files
//! load unchanged. FDX socket settings live under `fdx`.
//!
//! ```json
//! {
//!   "port": "/dev/ttyUSB0",
//!   "slaves_list": { "1": 10, "2": 4 },
//!   "cycle_read_slaves_list": [1, 2],
//!   "serial_baud_rate": 115200,
//!   "write_register_command_fdx_group_id": 100,
//!   "write_registers_command_fdx_group_id": 101,
//!   "fdx": { "transport": "udp", "local_port": 2000, "target_port": 2001 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::{BridgeError, BridgeResult};
use crate::fdx::protocol::{FdxByteOrder, FdxVersion, FreeRunningFlags, TransportKind, MAX_FRAME_SIZE};
use crate::modbus::protocol::{SlaveId, MAX_READ_REGISTERS};
use crate::utils::validation;

/// Serial parity, written "N", "E" or "O".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    #[serde(rename = "N")]
    None,
    #[serde(rename = "E")]
    Even,
    #[serde(rename = "O")]
    Odd,
}

/// Serial line settings handed to the RTU transport.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    /// Response timeout in seconds.
    pub timeout_secs: f64,
    /// Extra attempts after a recoverable failure.
    pub retries: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            timeout_secs: 1.0,
            retries: 0,
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.001))
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.port.is_empty() {
            return Err(BridgeError::configuration("serial port name is empty"));
        }
        if self.baud_rate == 0 {
            return Err(BridgeError::configuration("serial_baud_rate must be positive"));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(BridgeError::configuration(format!(
                "serial_bytesize must be 5-8, got {}",
                self.data_bits
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(BridgeError::configuration(format!(
                "serial_stop_bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        if !self.timeout_secs.is_finite() || self.timeout_secs <= 0.0 {
            return Err(BridgeError::configuration("serial_timeout must be positive"));
        }
        Ok(())
    }
}

/// Free-running subscription sent for each write group when FDX opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreeRunningConfig {
    pub enabled: bool,
    pub flags: FreeRunningFlags,
    pub cycle_time: u32,
    pub first_duration: u32,
}

impl Default for FreeRunningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flags: FreeRunningFlags::TRANSMIT_CYCLIC,
            cycle_time: 5_000_000,
            first_duration: 5_000_000,
        }
    }
}

/// FDX socket and framing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FdxConfig {
    pub transport: TransportKind,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub target_ip: IpAddr,
    pub target_port: u16,
    pub major_version: u8,
    pub minor_version: u8,
    pub byte_order: FdxByteOrder,
    pub receive_timeout_ms: u64,
    pub max_frame_size: usize,
    pub free_running: FreeRunningConfig,
}

impl Default for FdxConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Udp,
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_port: 2000,
            target_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            target_port: 2001,
            major_version: 2,
            minor_version: 1,
            byte_order: FdxByteOrder::Big,
            receive_timeout_ms: 1000,
            max_frame_size: MAX_FRAME_SIZE,
            free_running: FreeRunningConfig::default(),
        }
    }
}

impl FdxConfig {
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local_ip, self.local_port)
    }

    pub fn target_addr(&self) -> SocketAddr {
        SocketAddr::new(self.target_ip, self.target_port)
    }

    pub fn version(&self) -> FdxVersion {
        FdxVersion::new(self.major_version, self.minor_version)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms.max(1))
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub port: String,
    pub serial_baud_rate: u32,
    pub serial_bytesize: u8,
    pub serial_parity: Parity,
    pub serial_stop_bits: u8,
    /// Seconds.
    pub serial_timeout: f64,
    pub serial_retries: u32,
    /// Slave id -> number of holding registers polled from address 0.
    pub slaves_list: BTreeMap<SlaveId, u16>,
    /// Slaves polled cyclically, in order.
    pub cycle_read_slaves_list: Vec<SlaveId>,
    pub write_register_command_fdx_group_id: Option<u16>,
    pub write_registers_command_fdx_group_id: Option<u16>,
    /// Capacity of the single-shot request queue.
    pub queue_maxsize: usize,
    /// Read one register from a known slave before declaring the line connected.
    pub probe_on_connect: bool,
    /// Pause between two cyclic sweeps.
    pub cycle_interval_ms: u64,
    pub fdx: FdxConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let serial = SerialConfig::default();
        Self {
            port: serial.port,
            serial_baud_rate: serial.baud_rate,
            serial_bytesize: serial.data_bits,
            serial_parity: serial.parity,
            serial_stop_bits: serial.stop_bits,
            serial_timeout: serial.timeout_secs,
            serial_retries: serial.retries,
            slaves_list: BTreeMap::new(),
            cycle_read_slaves_list: Vec::new(),
            write_register_command_fdx_group_id: None,
            write_registers_command_fdx_group_id: None,
            queue_maxsize: crate::DEFAULT_QUEUE_SIZE,
            probe_on_connect: true,
            cycle_interval_ms: 0,
            fdx: FdxConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn from_file(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&text)?,
            Some("json") => Self::from_json(&text)?,
            other => {
                return Err(BridgeError::configuration(format!(
                    "unsupported config format {:?} for {}",
                    other,
                    path.display()
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> BridgeResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_yaml(text: &str) -> BridgeResult<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn serial(&self) -> SerialConfig {
        SerialConfig {
            port: self.port.clone(),
            baud_rate: self.serial_baud_rate,
            data_bits: self.serial_bytesize,
            parity: self.serial_parity,
            stop_bits: self.serial_stop_bits,
            timeout_secs: self.serial_timeout,
            retries: self.serial_retries,
        }
    }

    pub fn validate(&self) -> BridgeResult<()> {
        self.serial().validate()?;

        for (&slave_id, &count) in &self.slaves_list {
            validation::validate_slave_id(slave_id)
                .map_err(|e| BridgeError::configuration(format!("slaves_list: {}", e)))?;
            validation::validate_register_count(count, MAX_READ_REGISTERS)
                .map_err(|e| BridgeError::configuration(format!("slaves_list[{}]: {}", slave_id, e)))?;
        }
        for &slave_id in &self.cycle_read_slaves_list {
            validation::validate_slave_id(slave_id)
                .map_err(|e| BridgeError::configuration(format!("cycle_read_slaves_list: {}", e)))?;
        }

        if let (Some(single), Some(multi)) = (
            self.write_register_command_fdx_group_id,
            self.write_registers_command_fdx_group_id,
        ) {
            if single == multi {
                return Err(BridgeError::configuration(format!(
                    "write register groups must differ, both are {}",
                    single
                )));
            }
        }

        if self.queue_maxsize == 0 {
            return Err(BridgeError::configuration("queue_maxsize must be positive"));
        }
        if self.fdx.max_frame_size > MAX_FRAME_SIZE {
            return Err(BridgeError::configuration(format!(
                "fdx.max_frame_size exceeds {}",
                MAX_FRAME_SIZE
            )));
        }
        Ok(())
    }

    /// Slave answering the connect probe: first cyclic slave, else first mapped slave.
    pub fn probe_slave(&self) -> Option<SlaveId> {
        self.cycle_read_slaves_list
            .first()
            .copied()
            .or_else(|| self.slaves_list.keys().next().copied())
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }
}
