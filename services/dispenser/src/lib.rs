//! FusionCharge dispenser driver
//!
//! Lets a charging controller operate a FusionCharge DC power unit. The power
//! unit talks to the dispenser over two channels:
//!
//! - Modbus TCP: the dispenser serves its register map (identity, connector
//!   telemetry, alarms) and pushes changes as unsolicited reports; the power unit
//!   writes its own settings, its MAC address and per-connector HMAC keys
//! - GOOSE over raw Ethernet: each connector publishes power requirements and stop
//!   requests and receives the power unit's replies
//!
//! Each [`Connector`] runs one state machine that turns car presence, charge phase
//! and setpoint updates from the host into register updates and GOOSE frames.
//!
//! ```text
//! host ──> Connector ──> ConnectorMessenger ──> GooseSender ──> LinkLayer
//!              │                                                   │
//!              └──> ConnectorRegisters ──> Registry <── Modbus ── power unit
//! ```

pub mod config;
pub mod connector;
pub mod dispenser;
pub mod error;
pub mod registers;
mod timer;

pub use config::{ConnectorConfig, DispenserConfig, RetransmissionConfig};
pub use connector::{Capabilities, ConnectionState, Connector, ConnectorFsm, FsmEvent, ModePhase};
pub use dispenser::{Dispenser, PsuCommunicationState};
pub use error::{DispenserError, Result};
pub use registers::{
    AlarmStatus, ConnectorAlarm, ConnectorCallbacks, ConnectorType, DispenserAlarm, ErrorCallback,
    ErrorCategory, ErrorEvent, ErrorPayload, ErrorSubcategory, PsuRunningMode, WorkingStatus,
};
