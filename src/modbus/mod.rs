//! Modbus RTU master: protocol types, serial transport, simulated bus and the
//! polling client.

pub mod client;
pub mod protocol;
pub mod simulator;
pub mod transport;

pub use client::{ModbusRtuClient, RequestQueue, ResponseHandler};
pub use protocol::{ModbusFunction, RegisterRequest, RegisterResponse, SlaveId};
pub use simulator::SimulatedBus;
pub use transport::{ModbusTransport, RtuTransport, TransportStats};
