//! The dispenser's register map
//!
//! Addresses are fixed by the power unit's protocol. Connector-specific blocks
//! are repeated per connector at [`connector_offset`].
//!
//! | Block                        | Range           | Written by  |
//! |------------------------------|-----------------|-------------|
//! | Common dispenser information | 0x0000..0x002A  | dispenser   |
//! | Common power unit info       | 0x0100..0x012B  | power unit  |
//! | Collected dispenser info     | 0x1015..0x1026  | dispenser   |
//! | Collected connector info     | 0x1100..0x117F  | dispenser   |
//! | Power unit settings          | 0x2006..0x2114  | power unit  |
//! | Connector settings           | 0x2100..0x2130  | power unit  |
//! | Dispenser alarms             | 0x3001..0x3005  | dispenser   |
//! | Connector alarms             | 0x3105, 0x3115  | dispenser   |
//! | Power unit alarms            | 0x4000..0x40EA  | power unit  |

mod connector;
mod dispenser;
mod errors;
mod psu;
mod types;

pub use connector::{
    connector_offset, ConnectorAlarm, ConnectorCallbacks, ConnectorRegisters,
    ConnectorRegistersConfig,
};
pub use dispenser::{DispenserAlarm, DispenserRegisters, DispenserRegistersConfig};
pub use errors::{
    ChargingPowerUnitAlarm, ErrorCallback, ErrorCategory, ErrorEvent, ErrorPayload,
    ErrorRegisters, ErrorSubcategory, PowerUnitAlarm,
};
pub use psu::PsuRegisters;
pub use types::{
    AlarmStatus, ChargingEvent, ConnectionStatus, ConnectorType, ContactorStatus,
    ElectronicLockStatus, PsuPortAvailability, PsuRunningMode, WorkingStatus,
};
