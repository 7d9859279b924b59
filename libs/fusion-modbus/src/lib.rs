//! Modbus TCP engine for the FusionCharge dispenser
//!
//! # Architecture
//!
//! ```text
//! Transport -> FrameProtocol (MBAP) -> PduCorrelationLayer -> ModbusServer -> Registry
//!                                                \-> unsolicited reports <-/
//! ```
//!
//! - [`transport`]: connected byte streams (TCP, in-memory)
//! - [`protocol`]: MBAP framing with per-request correlation contexts
//! - [`correlation`]: request/response matching with timeouts, unmatched PDU routing
//! - [`server`]: answers the power unit's register reads and writes
//! - [`registers`]: typed registers, providers, byte-order converters
//! - [`unsolicited`]: vendor function 0x41/0x91 register push

pub mod correlation;
pub mod error;
pub mod pdu;
pub mod protocol;
pub mod registers;
pub mod server;
pub mod transport;
pub mod unsolicited;

pub use correlation::PduCorrelationLayer;
pub use error::{ModbusError, ModbusResult};
pub use pdu::{ExceptionCode, GenericPdu, Pdu};
pub use protocol::{FrameProtocol, ModbusTcpProtocol, TcpContext};
pub use server::ModbusServer;
pub use transport::{MemoryTransport, TcpTransport, Transport};
pub use unsolicited::{send_unsolicited_report, Device, Segment, UnsolicitedReportRequest};
