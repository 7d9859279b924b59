//! Power unit alarm registers and the error events they produce
//!
//! The power unit writes its alarm state into 0x4000..0x40EA. Single alarms are
//! [`AlarmStatus`] words; module-level registers carry 32-bit fault flags. Every
//! write produces an [`ErrorEvent`] for the installed callbacks, whether or not the
//! value changed.

use super::types::AlarmStatus;
use fusion_modbus::registers::{HoldingProvider, Register, Subregistry};
use fusion_modbus::ModbusResult;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorCategory {
    PowerUnit,
    ChargingPowerUnit,
    AcBranch,
    AcDcRectifier,
    DcDcChargingModule,
    CoolingSection,
    PowerDistributionModule,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::PowerUnit => "PowerUnit",
            ErrorCategory::ChargingPowerUnit => "ChargingPowerUnit",
            ErrorCategory::AcBranch => "AcBranch",
            ErrorCategory::AcDcRectifier => "AcDcRectifier",
            ErrorCategory::DcDcChargingModule => "DcDcChargingModule",
            ErrorCategory::CoolingSection => "CoolingSection",
            ErrorCategory::PowerDistributionModule => "PowerDistributionModule",
        };
        f.write_str(name)
    }
}

/// Cabinet-level sensors, 0x4000..0x4004
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PowerUnitAlarm {
    HighVoltageDoorStatusSensor,
    DoorStatusSensor,
    Water,
    Smoke,
    Epo,
}

impl PowerUnitAlarm {
    pub const ALL: [PowerUnitAlarm; 5] = [
        PowerUnitAlarm::HighVoltageDoorStatusSensor,
        PowerUnitAlarm::DoorStatusSensor,
        PowerUnitAlarm::Water,
        PowerUnitAlarm::Smoke,
        PowerUnitAlarm::Epo,
    ];
}

/// Charging unit alarms, 0x4005..0x4012
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChargingPowerUnitAlarm {
    UnknownSystemType,
    PowerDetectionException,
    SynchronizationCableStatusFaultOfEnergyRoutingBoard,
    SoftStartFault,
    SoftStartModuleCommunicationFailure,
    SoftStartModuleOverloaded,
    SoftStartModuleFault,
    SoftStartModuleOvertemperature,
    SoftStartModuleUndertemperature,
    SoftStartModuleDisconnectionFailure,
    PhaseSequenceAbnormalAlarm,
    PowerDistributionModuleCommunicationFailure,
    FaultOfInsulationResistanceToGround,
    /// 16-bit flag word rather than an alarm status
    ModbusTcpCertificate,
}

impl ChargingPowerUnitAlarm {
    /// The status-word alarms, in address order
    pub const STATUS_ALARMS: [ChargingPowerUnitAlarm; 13] = [
        ChargingPowerUnitAlarm::UnknownSystemType,
        ChargingPowerUnitAlarm::PowerDetectionException,
        ChargingPowerUnitAlarm::SynchronizationCableStatusFaultOfEnergyRoutingBoard,
        ChargingPowerUnitAlarm::SoftStartFault,
        ChargingPowerUnitAlarm::SoftStartModuleCommunicationFailure,
        ChargingPowerUnitAlarm::SoftStartModuleOverloaded,
        ChargingPowerUnitAlarm::SoftStartModuleFault,
        ChargingPowerUnitAlarm::SoftStartModuleOvertemperature,
        ChargingPowerUnitAlarm::SoftStartModuleUndertemperature,
        ChargingPowerUnitAlarm::SoftStartModuleDisconnectionFailure,
        ChargingPowerUnitAlarm::PhaseSequenceAbnormalAlarm,
        ChargingPowerUnitAlarm::PowerDistributionModuleCommunicationFailure,
        ChargingPowerUnitAlarm::FaultOfInsulationResistanceToGround,
    ];
}

/// Which alarm an event is about, keyed by category
///
/// Numbered variants carry the 1-based unit index (`AcBranch(2)` is the second AC
/// branch). The derived order is category first, then subcategory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorSubcategory {
    PowerUnit(PowerUnitAlarm),
    ChargingPowerUnit(ChargingPowerUnitAlarm),
    AcBranch(u8),
    AcDcRectifier(u8),
    DcDcChargingModule(u8),
    CoolingSection(u8),
    PowerDistributionModule(u8),
}

impl ErrorSubcategory {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorSubcategory::PowerUnit(_) => ErrorCategory::PowerUnit,
            ErrorSubcategory::ChargingPowerUnit(_) => ErrorCategory::ChargingPowerUnit,
            ErrorSubcategory::AcBranch(_) => ErrorCategory::AcBranch,
            ErrorSubcategory::AcDcRectifier(_) => ErrorCategory::AcDcRectifier,
            ErrorSubcategory::DcDcChargingModule(_) => ErrorCategory::DcDcChargingModule,
            ErrorSubcategory::CoolingSection(_) => ErrorCategory::CoolingSection,
            ErrorSubcategory::PowerDistributionModule(_) => ErrorCategory::PowerDistributionModule,
        }
    }
}

impl fmt::Display for ErrorSubcategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSubcategory::PowerUnit(alarm) => write!(f, "{:?}", alarm),
            ErrorSubcategory::ChargingPowerUnit(alarm) => write!(f, "{:?}", alarm),
            ErrorSubcategory::AcBranch(n) => write!(f, "AcBranch{}", n),
            ErrorSubcategory::AcDcRectifier(n) => write!(f, "Rectifier{}", n),
            ErrorSubcategory::DcDcChargingModule(n) => write!(f, "DcDcModule{}", n),
            ErrorSubcategory::CoolingSection(n) => write!(f, "CoolingUnit{}", n),
            ErrorSubcategory::PowerDistributionModule(n) => {
                write!(f, "PowerDistributionModule{}", n)
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorPayload {
    Alarm(AlarmStatus),
    Flags(u32),
}

impl ErrorPayload {
    pub fn raw(&self) -> u32 {
        match self {
            ErrorPayload::Alarm(status) => u32::from(u16::from(*status)),
            ErrorPayload::Flags(flags) => *flags,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorEvent {
    pub subcategory: ErrorSubcategory,
    pub payload: ErrorPayload,
}

impl ErrorEvent {
    pub fn new(subcategory: ErrorSubcategory, payload: ErrorPayload) -> Self {
        Self {
            subcategory,
            payload,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.subcategory.category()
    }

    /// Raised alarm or any fault flag set
    pub fn is_error(&self) -> bool {
        self.payload.raw() != 0
    }

    /// `Category/Subcategory`, e.g. `ChargingPowerUnit/SoftStartFault`
    pub fn subtype(&self) -> String {
        format!("{}/{}", self.category(), self.subcategory)
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Category: {}; Subcategory: {}; ",
            self.category(),
            self.subcategory
        )?;
        match (self.subcategory, self.payload) {
            (_, ErrorPayload::Alarm(status)) => write!(f, "AlarmState: {:?}", status),
            (
                ErrorSubcategory::ChargingPowerUnit(ChargingPowerUnitAlarm::ModbusTcpCertificate),
                ErrorPayload::Flags(flags),
            ) => write!(f, "Flags: 0x{:04X}", flags),
            (_, ErrorPayload::Flags(flags)) => write!(f, "Flags: 0x{:08X}", flags),
        }
    }
}

pub type ErrorCallback = Arc<dyn Fn(ErrorEvent) + Send + Sync>;

const POWER_UNIT_BASE: u16 = 0x4000;
const CHARGING_POWER_UNIT_BASE: u16 = 0x4005;
const MODBUS_TCP_CERTIFICATE: u16 = 0x4012;

/// `(first address, unit count, subcategory constructor)` of the 32-bit flag blocks
const FLAG_BLOCKS: [(u16, u8, fn(u8) -> ErrorSubcategory); 5] = [
    (0x4020, 2, ErrorSubcategory::AcBranch),
    (0x4040, 6, ErrorSubcategory::AcDcRectifier),
    (0x4070, 12, ErrorSubcategory::DcDcChargingModule),
    (0x40D0, 1, ErrorSubcategory::CoolingSection),
    (0x40E0, 5, ErrorSubcategory::PowerDistributionModule),
];

struct Slot<T> {
    address: u16,
    subcategory: ErrorSubcategory,
    provider: Arc<HoldingProvider<T>>,
}

/// Power unit alarm registers
pub struct ErrorRegisters {
    alarms: Vec<Slot<AlarmStatus>>,
    certificate: Slot<u16>,
    flags: Vec<Slot<u32>>,
}

impl Default for ErrorRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorRegisters {
    pub fn new() -> Self {
        let power_unit = PowerUnitAlarm::ALL
            .iter()
            .enumerate()
            .map(|(i, alarm)| Slot {
                address: POWER_UNIT_BASE + i as u16,
                subcategory: ErrorSubcategory::PowerUnit(*alarm),
                provider: HoldingProvider::new(AlarmStatus::Normal),
            });
        let charging_unit = ChargingPowerUnitAlarm::STATUS_ALARMS
            .iter()
            .enumerate()
            .map(|(i, alarm)| Slot {
                address: CHARGING_POWER_UNIT_BASE + i as u16,
                subcategory: ErrorSubcategory::ChargingPowerUnit(*alarm),
                provider: HoldingProvider::new(AlarmStatus::Normal),
            });
        let alarms = power_unit.chain(charging_unit).collect();

        let flags = FLAG_BLOCKS
            .iter()
            .flat_map(|&(base, count, subcategory)| {
                (0..count).map(move |i| Slot {
                    address: base + 2 * u16::from(i),
                    subcategory: subcategory(i + 1),
                    provider: HoldingProvider::new(0u32),
                })
            })
            .collect();

        Self {
            alarms,
            certificate: Slot {
                address: MODBUS_TCP_CERTIFICATE,
                subcategory: ErrorSubcategory::ChargingPowerUnit(
                    ChargingPowerUnitAlarm::ModbusTcpCertificate,
                ),
                provider: HoldingProvider::new(0u16),
            },
            flags,
        }
    }

    /// Deliver an event for every protocol write to an alarm register
    pub fn add_callback(&self, callback: ErrorCallback) {
        for slot in &self.alarms {
            let callback = callback.clone();
            let subcategory = slot.subcategory;
            slot.provider.add_write_callback(move |status| {
                callback(ErrorEvent::new(subcategory, ErrorPayload::Alarm(*status)))
            });
        }

        {
            let callback = callback.clone();
            let subcategory = self.certificate.subcategory;
            self.certificate.provider.add_write_callback(move |flags| {
                callback(ErrorEvent::new(
                    subcategory,
                    ErrorPayload::Flags(u32::from(*flags)),
                ))
            });
        }

        for slot in &self.flags {
            let callback = callback.clone();
            let subcategory = slot.subcategory;
            slot.provider.add_write_callback(move |flags| {
                callback(ErrorEvent::new(subcategory, ErrorPayload::Flags(*flags)))
            });
        }
    }

    /// Current register contents as events, raised or not
    pub fn snapshot(&self) -> Vec<ErrorEvent> {
        let mut events: Vec<ErrorEvent> = self
            .alarms
            .iter()
            .map(|s| ErrorEvent::new(s.subcategory, ErrorPayload::Alarm(s.provider.get_value())))
            .chain(std::iter::once(ErrorEvent::new(
                self.certificate.subcategory,
                ErrorPayload::Flags(u32::from(self.certificate.provider.get_value())),
            )))
            .chain(self.flags.iter().map(|s| {
                ErrorEvent::new(s.subcategory, ErrorPayload::Flags(s.provider.get_value()))
            }))
            .collect();
        events.sort_by_key(|e| e.subcategory);
        events
    }

    pub fn subregistry(&self) -> ModbusResult<Subregistry> {
        let mut subregistry = Subregistry::new("power unit alarms");
        for slot in &self.alarms {
            subregistry.add(Register::abcd(slot.address, slot.provider.clone()))?;
        }
        subregistry.add(Register::abcd(
            self.certificate.address,
            self.certificate.provider.clone(),
        ))?;
        for slot in &self.flags {
            subregistry.add(Register::abcd(slot.address, slot.provider.clone()))?;
        }
        Ok(subregistry)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Tests can use unwrap()
mod tests {
    use super::*;
    use fusion_modbus::registers::Registry;
    use parking_lot::Mutex;

    fn registry_with_events() -> (Registry, Arc<Mutex<Vec<ErrorEvent>>>) {
        let errors = ErrorRegisters::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = events.clone();
            errors.add_callback(Arc::new(move |e| events.lock().push(e)));
        }
        let registry = Registry::new();
        registry.add(errors.subregistry().unwrap()).unwrap();
        registry.verify_overlap().unwrap();
        (registry, events)
    }

    #[test]
    fn test_soft_start_fault_address() {
        let (registry, events) = registry_with_events();
        registry.on_write(0x4008, &[0x00, 0x01]).unwrap();

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].category(), ErrorCategory::ChargingPowerUnit);
        assert_eq!(
            events[0].subcategory,
            ErrorSubcategory::ChargingPowerUnit(ChargingPowerUnitAlarm::SoftStartFault)
        );
        assert_eq!(events[0].payload, ErrorPayload::Alarm(AlarmStatus::Alarm));
        assert!(events[0].is_error());
        assert_eq!(events[0].subtype(), "ChargingPowerUnit/SoftStartFault");
    }

    #[test]
    fn test_flag_blocks_map_to_units() {
        let (registry, events) = registry_with_events();
        registry
            .on_write(0x4022, &0x8000_0001u32.to_be_bytes())
            .unwrap();
        registry.on_write(0x40E2, &[0, 0, 0, 0]).unwrap();
        registry.on_write(0x4086, &[0, 0, 0, 4]).unwrap();

        let events = events.lock();
        assert_eq!(events[0].subtype(), "AcBranch/AcBranch2");
        assert_eq!(events[0].payload, ErrorPayload::Flags(0x8000_0001));
        assert_eq!(events[1].subtype(), "PowerDistributionModule/PowerDistributionModule2");
        assert!(!events[1].is_error());
        assert_eq!(events[2].subtype(), "DcDcChargingModule/DcDcModule12");
    }

    #[test]
    fn test_certificate_is_sixteen_bit_flags() {
        let (registry, events) = registry_with_events();
        registry.on_write(0x4012, &[0x00, 0x0A]).unwrap();
        registry.on_write(0x4000, &[0x00, 0x01]).unwrap();

        let events = events.lock();
        assert_eq!(events[0].payload, ErrorPayload::Flags(0x0A));
        assert!(events[0]
            .to_string()
            .ends_with("Subcategory: ModbusTcpCertificate; Flags: 0x000A"));
        assert_eq!(
            events[1].subcategory,
            ErrorSubcategory::PowerUnit(PowerUnitAlarm::HighVoltageDoorStatusSensor)
        );
    }

    #[test]
    fn test_invalid_alarm_status_is_rejected() {
        let (registry, events) = registry_with_events();
        assert!(registry.on_write(0x4001, &[0x00, 0x07]).is_err());
        assert!(events.lock().is_empty());
    }

    #[test]
    fn test_ordering_is_category_then_subcategory() {
        let mut events = vec![
            ErrorEvent::new(ErrorSubcategory::AcBranch(1), ErrorPayload::Flags(1)),
            ErrorEvent::new(
                ErrorSubcategory::ChargingPowerUnit(ChargingPowerUnitAlarm::SoftStartFault),
                ErrorPayload::Alarm(AlarmStatus::Alarm),
            ),
            ErrorEvent::new(
                ErrorSubcategory::PowerUnit(PowerUnitAlarm::Epo),
                ErrorPayload::Alarm(AlarmStatus::Alarm),
            ),
            ErrorEvent::new(
                ErrorSubcategory::ChargingPowerUnit(ChargingPowerUnitAlarm::UnknownSystemType),
                ErrorPayload::Alarm(AlarmStatus::Alarm),
            ),
        ];
        events.sort_by_key(|e| e.subcategory);
        let order: Vec<_> = events.iter().map(|e| e.subtype()).collect();
        assert_eq!(
            order,
            vec![
                "PowerUnit/Epo",
                "ChargingPowerUnit/UnknownSystemType",
                "ChargingPowerUnit/SoftStartFault",
                "AcBranch/AcBranch1",
            ]
        );
    }

    #[test]
    fn test_snapshot_covers_every_register() {
        let errors = ErrorRegisters::new();
        let snapshot = errors.snapshot();
        assert_eq!(snapshot.len(), 5 + 13 + 1 + 2 + 6 + 12 + 1 + 5);
        assert!(snapshot.iter().all(|e| !e.is_error()));
    }
}
