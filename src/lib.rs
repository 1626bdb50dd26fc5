//! # FDX Modbus Bridge
//!
//! Connects a CANoe simulation speaking the binary FDX protocol (UDP or TCP)
//! with Modbus RTU slaves on a serial line.
//!
//! ## Architecture
//!
//! ```text
//!   CANoe  <── FDX frames ──>  FdxTransport ──> FdxSession::handle_datagram
//!                                   ^                     │ FdxCommandHandler
//!                                   │ data-exchange       v
//!                                 Bridge ────────────> RequestQueue
//!                                   ^                     │
//!                      ResponseHandler                    v
//!                                   │            ModbusRtuClient
//!                                   └──────── poll loop + request worker
//!                                                          │
//!                                               ModbusTransport (RTU / simulated)
//! ```
//!
//! - **FDX engine** ([`fdx`]): header and command codec, typed commands,
//!   sequence numbering, append-mode frame building, UDP/TCP transport.
//! - **Modbus master** ([`modbus`]): read-holding-registers and register
//!   writes over RTU, a cyclic poller and a single-shot request worker sharing
//!   one serial line.
//! - **Bridge** ([`bridge`]): register snapshots out as data-exchange groups,
//!   write groups in as queued Modbus writes, with last-value de-duplication.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fdx_modbus_bridge::{Bridge, BridgeConfig, FdxTransport, ModbusRtuClient};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> fdx_modbus_bridge::BridgeResult<()> {
//!     let config = BridgeConfig::from_file("config/bridge.json")?;
//!
//!     let mut client: ModbusRtuClient = ModbusRtuClient::new(&config);
//!     client.connect().await?;
//!
//!     let transport = Arc::new(FdxTransport::new(&config.fdx));
//!     let bridge = Arc::new(Bridge::new(&config, transport, client.queue()));
//!     client.set_response_handler(bridge.clone());
//!     bridge.open().await?;
//!
//!     client.enable_cyclic_polling();
//!     tokio::signal::ctrl_c().await.ok();
//!
//!     client.disconnect().await?;
//!     bridge.close().await
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod fdx;
pub mod logging;
pub mod modbus;
pub mod utils;

pub use bridge::{Bridge, MultiWrite, SingleWrite};
pub use config::{BridgeConfig, FdxConfig, FreeRunningConfig, Parity, SerialConfig};
pub use error::{BridgeError, BridgeResult};
pub use fdx::{
    CommandContext, FdxByteOrder, FdxCommand, FdxCommandCode, FdxCommandHandler, FdxHeader, FdxSession,
    FdxTransport, FdxTransportStats, FdxVersion, MeasurementState, TransportKind,
};
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};
pub use modbus::{
    ModbusRtuClient, ModbusTransport, RegisterRequest, RegisterResponse, RequestQueue, ResponseHandler, RtuTransport,
    SimulatedBus, SlaveId, TransportStats,
};
pub use utils::{OperationTimer, PerformanceMetrics};

/// Default capacity of the single-shot request queue
pub const DEFAULT_QUEUE_SIZE: usize = 20;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("FDX Modbus Bridge v{}", VERSION)
}
