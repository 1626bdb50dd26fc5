/// Modbus protocol definitions and data structures
///
/// Function codes, exception codes, the wire-level request/response pair and
/// the register operations the bridge queues for the serial line.
use crc::{Crc, CRC_16_MODBUS};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BridgeError, BridgeResult};
use crate::utils::validation;

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus value type (16-bit register value)
pub type ModbusValue = u16;

/// Modbus slave/unit identifier (1-247)
pub type SlaveId = u8;

/// Maximum registers in one read holding registers request
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum registers in one write multiple registers request
pub const MAX_WRITE_REGISTERS: u16 = 123;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS over `data`; transmitted low byte first.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Supported Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    pub fn from_u8(value: u8) -> BridgeResult<Self> {
        match value {
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(BridgeError::invalid_function(value)),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn is_read_function(self) -> bool {
        matches!(self, ModbusFunction::ReadHoldingRegisters)
    }

    pub fn is_write_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::WriteSingleRegister | ModbusFunction::WriteMultipleRegisters
        )
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Wire-level request: one RTU PDU addressed to one slave.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusRequest {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub address: ModbusAddress,
    pub quantity: u16,
    /// Register values, big-endian, for write functions.
    pub data: Vec<u8>,
}

impl ModbusRequest {
    pub fn new_read(slave_id: SlaveId, address: ModbusAddress, quantity: u16) -> Self {
        Self {
            slave_id,
            function: ModbusFunction::ReadHoldingRegisters,
            address,
            quantity,
            data: Vec::new(),
        }
    }

    pub fn new_write(slave_id: SlaveId, function: ModbusFunction, address: ModbusAddress, data: Vec<u8>) -> Self {
        let quantity = match function {
            ModbusFunction::WriteSingleRegister => 1,
            _ => (data.len() / 2) as u16,
        };
        Self {
            slave_id,
            function,
            address,
            quantity,
            data,
        }
    }

    pub fn validate(&self) -> BridgeResult<()> {
        validation::validate_slave_id(self.slave_id)?;
        match self.function {
            ModbusFunction::ReadHoldingRegisters => {
                validation::validate_register_count(self.quantity, MAX_READ_REGISTERS)?;
                validation::validate_address_range(self.address, self.quantity)?;
            }
            ModbusFunction::WriteSingleRegister => {
                if self.data.len() != 2 {
                    return Err(BridgeError::invalid_data(format!(
                        "Write single register needs 2 data bytes, got {}",
                        self.data.len()
                    )));
                }
            }
            ModbusFunction::WriteMultipleRegisters => {
                validation::validate_register_count(self.quantity, MAX_WRITE_REGISTERS)?;
                validation::validate_address_range(self.address, self.quantity)?;
                if self.data.len() != self.quantity as usize * 2 {
                    return Err(BridgeError::invalid_data(format!(
                        "Data length {} does not match {} registers",
                        self.data.len(),
                        self.quantity
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Wire-level response; `data` excludes slave id, function code and CRC.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusResponse {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub data: Vec<u8>,
    pub exception_code: Option<u8>,
}

impl ModbusResponse {
    pub fn new_success(slave_id: SlaveId, function: ModbusFunction, data: Vec<u8>) -> Self {
        Self {
            slave_id,
            function,
            data,
            exception_code: None,
        }
    }

    pub fn new_exception(slave_id: SlaveId, function: ModbusFunction, exception_code: u8) -> Self {
        Self {
            slave_id,
            function,
            data: Vec::new(),
            exception_code: Some(exception_code),
        }
    }

    pub fn is_exception(&self) -> bool {
        self.exception_code.is_some()
    }

    pub fn exception(&self) -> Option<ModbusException> {
        self.exception_code.and_then(ModbusException::from_u8)
    }

    fn check_exception(&self) -> BridgeResult<()> {
        match self.exception_code {
            Some(code) => Err(BridgeError::exception(self.function.to_u8(), code)),
            None => Ok(()),
        }
    }

    /// Parse a read response (byte count prefix followed by big-endian registers)
    pub fn parse_registers(&self) -> BridgeResult<Vec<u16>> {
        self.check_exception()?;

        if self.data.is_empty() {
            return Err(BridgeError::frame("Empty response data"));
        }
        let byte_count = self.data[0] as usize;
        if self.data.len() < 1 + byte_count {
            return Err(BridgeError::frame("Incomplete register data"));
        }
        if byte_count % 2 != 0 {
            return Err(BridgeError::frame("Invalid register data length"));
        }

        Ok(self.data[1..1 + byte_count]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Parse the address/value (or address/quantity) echo of a write response
    pub fn parse_write_echo(&self) -> BridgeResult<(u16, u16)> {
        self.check_exception()?;

        if self.data.len() < 4 {
            return Err(BridgeError::frame(format!(
                "Write response needs 4 bytes, got {}",
                self.data.len()
            )));
        }
        Ok((
            u16::from_be_bytes([self.data[0], self.data[1]]),
            u16::from_be_bytes([self.data[2], self.data[3]]),
        ))
    }
}

/// A register operation queued for the serial line.
///
/// Built once and moved into the request queue; the worker consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterRequest {
    ReadHoldingRegisters {
        slave_id: SlaveId,
        address: ModbusAddress,
        count: u16,
    },
    WriteRegister {
        slave_id: SlaveId,
        address: ModbusAddress,
        value: ModbusValue,
    },
    WriteRegisters {
        slave_id: SlaveId,
        address: ModbusAddress,
        values: Vec<ModbusValue>,
    },
}

impl RegisterRequest {
    pub fn read(slave_id: SlaveId, address: ModbusAddress, count: u16) -> Self {
        RegisterRequest::ReadHoldingRegisters {
            slave_id,
            address,
            count,
        }
    }

    pub fn write_single(slave_id: SlaveId, address: ModbusAddress, value: ModbusValue) -> Self {
        RegisterRequest::WriteRegister {
            slave_id,
            address,
            value,
        }
    }

    pub fn write_multiple(slave_id: SlaveId, address: ModbusAddress, values: Vec<ModbusValue>) -> Self {
        RegisterRequest::WriteRegisters {
            slave_id,
            address,
            values,
        }
    }

    pub fn slave_id(&self) -> SlaveId {
        match self {
            RegisterRequest::ReadHoldingRegisters { slave_id, .. }
            | RegisterRequest::WriteRegister { slave_id, .. }
            | RegisterRequest::WriteRegisters { slave_id, .. } => *slave_id,
        }
    }

    pub fn function(&self) -> ModbusFunction {
        match self {
            RegisterRequest::ReadHoldingRegisters { .. } => ModbusFunction::ReadHoldingRegisters,
            RegisterRequest::WriteRegister { .. } => ModbusFunction::WriteSingleRegister,
            RegisterRequest::WriteRegisters { .. } => ModbusFunction::WriteMultipleRegisters,
        }
    }

    /// Build and validate the wire request.
    pub fn to_wire(&self) -> BridgeResult<ModbusRequest> {
        let request = match self {
            RegisterRequest::ReadHoldingRegisters {
                slave_id,
                address,
                count,
            } => ModbusRequest::new_read(*slave_id, *address, *count),
            RegisterRequest::WriteRegister {
                slave_id,
                address,
                value,
            } => ModbusRequest::new_write(
                *slave_id,
                ModbusFunction::WriteSingleRegister,
                *address,
                value.to_be_bytes().to_vec(),
            ),
            RegisterRequest::WriteRegisters {
                slave_id,
                address,
                values,
            } => ModbusRequest::new_write(
                *slave_id,
                ModbusFunction::WriteMultipleRegisters,
                *address,
                crate::utils::registers_to_bytes(values),
            ),
        };
        request.validate()?;
        Ok(request)
    }

    /// Turn the slave's answer into the event delivered to response handlers.
    pub fn interpret(&self, response: &ModbusResponse) -> BridgeResult<RegisterResponse> {
        if response.slave_id != self.slave_id() {
            return Err(BridgeError::frame(format!(
                "Response from slave {} to request for slave {}",
                response.slave_id,
                self.slave_id()
            )));
        }

        match self {
            RegisterRequest::ReadHoldingRegisters {
                slave_id,
                address,
                count,
            } => {
                let values = response.parse_registers()?;
                if values.len() != *count as usize {
                    return Err(BridgeError::frame(format!(
                        "Expected {} registers, got {}",
                        count,
                        values.len()
                    )));
                }
                Ok(RegisterResponse::HoldingRegisters {
                    slave_id: *slave_id,
                    address: *address,
                    values,
                })
            }
            RegisterRequest::WriteRegister { slave_id, .. } => {
                let (address, value) = response.parse_write_echo()?;
                Ok(RegisterResponse::RegisterWritten {
                    slave_id: *slave_id,
                    address,
                    value,
                })
            }
            RegisterRequest::WriteRegisters { slave_id, .. } => {
                let (address, count) = response.parse_write_echo()?;
                Ok(RegisterResponse::RegistersWritten {
                    slave_id: *slave_id,
                    address,
                    count,
                })
            }
        }
    }
}

impl fmt::Display for RegisterRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterRequest::ReadHoldingRegisters {
                slave_id,
                address,
                count,
            } => write!(f, "read {} registers @{} from slave {}", count, address, slave_id),
            RegisterRequest::WriteRegister {
                slave_id,
                address,
                value,
            } => write!(f, "write {} @{} on slave {}", value, address, slave_id),
            RegisterRequest::WriteRegisters {
                slave_id,
                address,
                values,
            } => write!(f, "write {} registers @{} on slave {}", values.len(), address, slave_id),
        }
    }
}

/// Successful outcome of a register operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterResponse {
    HoldingRegisters {
        slave_id: SlaveId,
        address: ModbusAddress,
        values: Vec<ModbusValue>,
    },
    RegisterWritten {
        slave_id: SlaveId,
        address: ModbusAddress,
        value: ModbusValue,
    },
    RegistersWritten {
        slave_id: SlaveId,
        address: ModbusAddress,
        count: u16,
    },
}

impl RegisterResponse {
    pub fn slave_id(&self) -> SlaveId {
        match self {
            RegisterResponse::HoldingRegisters { slave_id, .. }
            | RegisterResponse::RegisterWritten { slave_id, .. }
            | RegisterResponse::RegistersWritten { slave_id, .. } => *slave_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_conversion() {
        assert_eq!(
            ModbusFunction::from_u8(0x03).unwrap(),
            ModbusFunction::ReadHoldingRegisters
        );
        assert_eq!(ModbusFunction::WriteMultipleRegisters.to_u8(), 0x10);
        // coils are not supported
        assert!(ModbusFunction::from_u8(0x01).is_err());
        assert!(ModbusFunction::from_u8(0xFF).is_err());
    }

    #[test]
    fn test_crc_known_frames() {
        assert_eq!(crc16_modbus(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]).to_le_bytes(), [0xC4, 0x0B]);
        assert_eq!(crc16_modbus(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03]).to_le_bytes(), [0x98, 0x0B]);
    }

    #[test]
    fn test_request_validation() {
        assert!(RegisterRequest::read(1, 100, 10).to_wire().is_ok());
        assert!(RegisterRequest::read(0, 100, 10).to_wire().is_err());
        assert!(RegisterRequest::read(1, 100, 200).to_wire().is_err());
        assert!(RegisterRequest::read(1, 0xFFF0, 0x20).to_wire().is_err());
        assert!(RegisterRequest::write_multiple(1, 0, vec![]).to_wire().is_err());
        assert!(RegisterRequest::write_multiple(1, 0, vec![0; 124]).to_wire().is_err());

        let wire = RegisterRequest::write_multiple(2, 10, vec![0x1234, 0x5678]).to_wire().unwrap();
        assert_eq!(wire.quantity, 2);
        assert_eq!(wire.data, vec![0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn test_response_parsing() {
        let response = ModbusResponse::new_success(
            1,
            ModbusFunction::ReadHoldingRegisters,
            vec![4, 0x12, 0x34, 0x56, 0x78],
        );
        assert_eq!(response.parse_registers().unwrap(), vec![0x1234, 0x5678]);

        let result = RegisterRequest::read(1, 0, 2).interpret(&response).unwrap();
        assert_eq!(
            result,
            RegisterResponse::HoldingRegisters {
                slave_id: 1,
                address: 0,
                values: vec![0x1234, 0x5678],
            }
        );
    }

    #[test]
    fn test_interpret_rejects_mismatch() {
        let response = ModbusResponse::new_success(2, ModbusFunction::ReadHoldingRegisters, vec![2, 0, 1]);
        assert!(RegisterRequest::read(1, 0, 1).interpret(&response).is_err());

        let response = ModbusResponse::new_success(1, ModbusFunction::ReadHoldingRegisters, vec![2, 0, 1]);
        assert!(RegisterRequest::read(1, 0, 3).interpret(&response).is_err());
    }

    #[test]
    fn test_exception_response() {
        let response = ModbusResponse::new_exception(1, ModbusFunction::WriteSingleRegister, 0x02);
        assert_eq!(response.exception(), Some(ModbusException::IllegalDataAddress));
        let err = RegisterRequest::write_single(1, 9, 1).interpret(&response).unwrap_err();
        assert!(matches!(err, BridgeError::Exception { function: 0x06, code: 0x02, .. }));
    }
}
