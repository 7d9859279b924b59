//! Power-requirement and stop-charge messages
//!
//! Each message travels as the `allData` sequence of a GOOSE PDU identified by its
//! goID. Unsigned fields are encoded as `0x86` elements holding a 4-byte big-endian
//! value; floating point fields as `0x87` elements holding the exponent width `0x08`
//! followed by an IEEE-754 single in big-endian order.

use crate::ber::{self, BerEntry};
use crate::error::{GooseError, GooseResult};
use crate::frame::{GoosePdu, GooseTimestamp};

pub const POWER_REQUEST_GO_ID: &str = "CC/0$GO$PowerRequest";
pub const POWER_REQUEST_REPLY_GO_ID: &str = "CC/0$GO$PowerRequestReply";
pub const STOP_CHARGE_GO_ID: &str = "CC/0$GO$ShutdownRequest";

pub const POWER_REQUEST_APPID: u16 = 0x0001;
pub const POWER_REQUEST_REPLY_APPID: u16 = 0x3001;
pub const STOP_CHARGE_APPID: u16 = 0x3002;

/// Serial placeholder; reserved for multiplexing sessions on one connector
pub const DEFAULT_SERIAL: u16 = 0xFFFF;

const TAG_UNSIGNED: u8 = 0x86;
const TAG_FLOAT: u8 = 0x87;
const FLOAT_EXPONENT_WIDTH: u8 = 0x08;

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:expr),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl TryFrom<u32> for $name {
            type Error = GooseError;

            fn try_from(value: u32) -> GooseResult<Self> {
                match value {
                    $(v if v == $value => Ok(Self::$variant),)+
                    other => Err(GooseError::decoding(format!(
                        "Unknown {} value {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl From<$name> for u32 {
            fn from(value: $name) -> u32 {
                value as u32
            }
        }
    };
}

wire_enum! {
    /// What the power unit is asked to deliver
    pub enum RequirementType {
        /// Reserve power modules for the session, no output yet
        ModulePlaceholderRequest = 1,
        InsulationDetectionVoltageOutput = 2,
        InsulationDetectionVoltageOutputStoppage = 3,
        PrechargeVoltageOutput = 4,
        Charging = 5,
    }
}

wire_enum! {
    pub enum Mode {
        ConstantVoltage = 1,
        ConstantCurrent = 2,
    }
}

wire_enum! {
    pub enum RequirementResult {
        Success = 0,
        Failed = 1,
    }
}

wire_enum! {
    /// Why the dispenser asks the power unit to stop
    pub enum StopChargeReason {
        Normal = 0,
        InsulationFault = 1,
        EmergencyStop = 2,
        ConnectorMismatch = 3,
        OverVoltage = 4,
        OverCurrent = 5,
        OverTemperature = 6,
        CommunicationTimeout = 7,
        PowerUnitFault = 8,
    }
}

/// The requirement a connector sends, without addressing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerRequirement {
    pub requirement_type: RequirementType,
    pub mode: Mode,
    pub voltage: f32,
    pub current: f32,
}

impl PowerRequirement {
    pub fn new(requirement_type: RequirementType, voltage: f32, current: f32) -> Self {
        Self {
            requirement_type,
            mode: Mode::ConstantCurrent,
            voltage,
            current,
        }
    }

    pub fn placeholder() -> Self {
        Self::new(RequirementType::ModulePlaceholderRequest, 0.0, 0.0)
    }
}

/// A message carried as the data set of a GOOSE publication
pub trait GooseMessage: Sized {
    const GO_ID: &'static str;
    const DAT_SET: &'static str;
    const APPID: u16;

    fn to_entries(&self) -> Vec<BerEntry>;

    fn from_entries(entries: &[BerEntry]) -> GooseResult<Self>;

    /// PDU with stNum/sqNum zero; the publisher assigns them
    fn to_pdu(&self) -> GoosePdu {
        GoosePdu {
            go_cb_ref: Self::GO_ID.to_string(),
            time_allowed_to_live: 0,
            dat_set: Self::DAT_SET.to_string(),
            go_id: Self::GO_ID.to_string(),
            timestamp: GooseTimestamp::now(),
            st_num: 0,
            sq_num: 0,
            simulation: false,
            conf_rev: 1,
            nds_com: false,
            entries: self.to_entries(),
        }
    }

    fn from_pdu(pdu: &GoosePdu) -> GooseResult<Self> {
        if pdu.go_id != Self::GO_ID {
            return Err(GooseError::decoding(format!(
                "goID '{}' is not '{}'",
                pdu.go_id,
                Self::GO_ID
            )));
        }
        Self::from_entries(&pdu.entries)
    }
}

fn unsigned(value: u32) -> BerEntry {
    BerEntry::new(TAG_UNSIGNED, ber::encode_u32(value).to_vec())
}

fn float(value: f32) -> BerEntry {
    let mut bytes = Vec::with_capacity(5);
    bytes.push(FLOAT_EXPONENT_WIDTH);
    bytes.extend_from_slice(&value.to_be_bytes());
    BerEntry::new(TAG_FLOAT, bytes)
}

struct EntryCursor<'a> {
    entries: &'a [BerEntry],
    index: usize,
    message: &'static str,
}

impl<'a> EntryCursor<'a> {
    fn new(entries: &'a [BerEntry], expected: usize, message: &'static str) -> GooseResult<Self> {
        if entries.len() != expected {
            return Err(GooseError::decoding(format!(
                "{message} needs {expected} entries, got {}",
                entries.len()
            )));
        }
        Ok(Self {
            entries,
            index: 0,
            message,
        })
    }

    fn next(&mut self, tag: u8) -> GooseResult<&'a [u8]> {
        let entry = &self.entries[self.index];
        self.index += 1;
        if entry.tag != tag {
            return Err(GooseError::decoding(format!(
                "{} entry {}: expected tag 0x{tag:02X}, found 0x{:02X}",
                self.message,
                self.index - 1,
                entry.tag
            )));
        }
        Ok(&entry.value)
    }

    fn unsigned(&mut self) -> GooseResult<u32> {
        ber::decode_u32(self.next(TAG_UNSIGNED)?)
    }

    fn u16(&mut self) -> GooseResult<u16> {
        let value = self.unsigned()?;
        u16::try_from(value).map_err(|_| {
            GooseError::decoding(format!("{} value {value} exceeds u16", self.message))
        })
    }

    fn float(&mut self) -> GooseResult<f32> {
        match self.next(TAG_FLOAT)? {
            [FLOAT_EXPONENT_WIDTH, a, b, c, d] => Ok(f32::from_be_bytes([*a, *b, *c, *d])),
            other => Err(GooseError::decoding(format!(
                "{} float entry malformed: {}",
                self.message,
                hex::encode(other)
            ))),
        }
    }
}

/// Power requirement addressed to a connector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerRequirementRequest {
    pub charging_connector_no: u16,
    pub charging_sn: u16,
    pub requirement: PowerRequirement,
}

impl GooseMessage for PowerRequirementRequest {
    const GO_ID: &'static str = POWER_REQUEST_GO_ID;
    const DAT_SET: &'static str = "CC/0$PowerRequest";
    const APPID: u16 = POWER_REQUEST_APPID;

    fn to_entries(&self) -> Vec<BerEntry> {
        vec![
            unsigned(u32::from(self.charging_connector_no)),
            unsigned(u32::from(self.charging_sn)),
            unsigned(self.requirement.requirement_type.into()),
            unsigned(self.requirement.mode.into()),
            float(self.requirement.voltage),
            float(self.requirement.current),
        ]
    }

    fn from_entries(entries: &[BerEntry]) -> GooseResult<Self> {
        let mut c = EntryCursor::new(entries, 6, "PowerRequirementRequest")?;
        Ok(Self {
            charging_connector_no: c.u16()?,
            charging_sn: c.u16()?,
            requirement: PowerRequirement {
                requirement_type: RequirementType::try_from(c.unsigned()?)?,
                mode: Mode::try_from(c.unsigned()?)?,
                voltage: c.float()?,
                current: c.float()?,
            },
        })
    }
}

/// The power unit's answer to a requirement, most importantly to a placeholder request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerRequirementResponse {
    pub charging_connector_no: u16,
    pub charging_sn: u16,
    pub requirement: PowerRequirement,
    pub result: RequirementResult,
}

impl GooseMessage for PowerRequirementResponse {
    const GO_ID: &'static str = POWER_REQUEST_REPLY_GO_ID;
    const DAT_SET: &'static str = "CC/0$PowerRequestReply";
    const APPID: u16 = POWER_REQUEST_REPLY_APPID;

    fn to_entries(&self) -> Vec<BerEntry> {
        vec![
            unsigned(u32::from(self.charging_connector_no)),
            unsigned(u32::from(self.charging_sn)),
            unsigned(self.requirement.requirement_type.into()),
            unsigned(self.requirement.mode.into()),
            float(self.requirement.voltage),
            float(self.requirement.current),
            unsigned(self.result.into()),
        ]
    }

    fn from_entries(entries: &[BerEntry]) -> GooseResult<Self> {
        let mut c = EntryCursor::new(entries, 7, "PowerRequirementResponse")?;
        Ok(Self {
            charging_connector_no: c.u16()?,
            charging_sn: c.u16()?,
            requirement: PowerRequirement {
                requirement_type: RequirementType::try_from(c.unsigned()?)?,
                mode: Mode::try_from(c.unsigned()?)?,
                voltage: c.float()?,
                current: c.float()?,
            },
            result: RequirementResult::try_from(c.unsigned()?)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopChargeRequest {
    pub charging_connector_no: u16,
    pub charging_sn: u16,
    pub reason: StopChargeReason,
}

impl GooseMessage for StopChargeRequest {
    const GO_ID: &'static str = STOP_CHARGE_GO_ID;
    const DAT_SET: &'static str = "CC/0$ShutdownRequest";
    const APPID: u16 = STOP_CHARGE_APPID;

    fn to_entries(&self) -> Vec<BerEntry> {
        vec![
            unsigned(u32::from(self.charging_connector_no)),
            unsigned(u32::from(self.charging_sn)),
            unsigned(self.reason.into()),
        ]
    }

    fn from_entries(entries: &[BerEntry]) -> GooseResult<Self> {
        let mut c = EntryCursor::new(entries, 3, "StopChargeRequest")?;
        Ok(Self {
            charging_connector_no: c.u16()?,
            charging_sn: c.u16()?,
            reason: StopChargeReason::try_from(c.unsigned()?)?,
        })
    }
}
