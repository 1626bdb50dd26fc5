//! FDX protocol engine: wire format, frame codec, session and socket transport.

pub mod codec;
pub mod protocol;
pub mod session;
pub mod transport;

pub use protocol::{FdxByteOrder, FdxCommand, FdxCommandCode, FdxHeader, FdxVersion, MeasurementState, TransportKind};
pub use session::{CommandContext, FdxCommandHandler, FdxSession};
pub use transport::{FdxTransport, FdxTransportStats};
