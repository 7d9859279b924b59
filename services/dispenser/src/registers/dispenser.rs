//! Registers describing the dispenser as a whole

use super::types::AlarmStatus;
use fusion_modbus::registers::{
    CallbackProvider, FixedString, HoldingProvider, Register, Subregistry,
};
use fusion_modbus::ModbusResult;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct DispenserRegistersConfig {
    pub manufacturer: u16,
    pub model: u16,
    pub protocol_version: u16,
    pub hardware_version: u16,
    pub software_version: String,
    pub esn: String,
    pub connector_count: u16,
}

/// Dispenser-level alarms reported to the power unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispenserAlarm {
    Door,
    Water,
    EmergencyStop,
    Tilt,
}

pub struct DispenserRegisters {
    pub manufacturer: Arc<HoldingProvider<u16>>,
    pub model: Arc<HoldingProvider<u16>>,
    pub protocol_version: Arc<HoldingProvider<u16>>,
    pub hardware_version: Arc<HoldingProvider<u16>>,
    pub software_version: Arc<HoldingProvider<FixedString<48>>>,

    pub charging_connectors_count: Arc<HoldingProvider<u16>>,
    pub esn: Arc<HoldingProvider<FixedString<22>>>,
    /// Unix seconds, pushed with every unsolicited report
    pub time_sync: Arc<CallbackProvider<u32>>,

    pub door_alarm: Arc<HoldingProvider<AlarmStatus>>,
    pub water_alarm: Arc<HoldingProvider<AlarmStatus>>,
    pub epo_alarm: Arc<HoldingProvider<AlarmStatus>>,
    pub tilt_alarm: Arc<HoldingProvider<AlarmStatus>>,
}

impl DispenserRegisters {
    pub fn new(config: &DispenserRegistersConfig) -> Self {
        Self {
            manufacturer: HoldingProvider::new(config.manufacturer),
            model: HoldingProvider::new(config.model),
            protocol_version: HoldingProvider::new(config.protocol_version),
            hardware_version: HoldingProvider::new(config.hardware_version),
            software_version: HoldingProvider::new(FixedString::new(&config.software_version)),
            charging_connectors_count: HoldingProvider::new(config.connector_count),
            esn: HoldingProvider::new(FixedString::new(&config.esn)),
            time_sync: CallbackProvider::always_reported(|| chrono::Utc::now().timestamp() as u32),
            door_alarm: HoldingProvider::unsolicited(AlarmStatus::Normal),
            water_alarm: HoldingProvider::unsolicited(AlarmStatus::Normal),
            epo_alarm: HoldingProvider::unsolicited(AlarmStatus::Normal),
            tilt_alarm: HoldingProvider::unsolicited(AlarmStatus::Normal),
        }
    }

    pub fn alarm(&self, alarm: DispenserAlarm) -> &Arc<HoldingProvider<AlarmStatus>> {
        match alarm {
            DispenserAlarm::Door => &self.door_alarm,
            DispenserAlarm::Water => &self.water_alarm,
            DispenserAlarm::EmergencyStop => &self.epo_alarm,
            DispenserAlarm::Tilt => &self.tilt_alarm,
        }
    }

    pub fn subregistries(&self) -> ModbusResult<Vec<Subregistry>> {
        let common = Subregistry::new("common dispenser information")
            .with(Register::abcd(0x0000, self.manufacturer.clone()))?
            .with(Register::abcd(0x0001, self.model.clone()))?
            .with(Register::abcd(0x0002, self.protocol_version.clone()))?
            .with(Register::abcd(0x0004, self.hardware_version.clone()))?
            .with(Register::identity(0x0013, self.software_version.clone()))?;

        let collected = Subregistry::new("collected dispenser information")
            .with(Register::abcd(0x1015, self.charging_connectors_count.clone()))?
            .with(Register::identity(0x1016, self.esn.clone()))?
            .with(Register::abcd(0x1024, self.time_sync.clone()))?;

        let alarms = Subregistry::new("dispenser alarms")
            .with(Register::abcd(0x3001, self.door_alarm.clone()))?
            .with(Register::abcd(0x3002, self.water_alarm.clone()))?
            .with(Register::abcd(0x3003, self.epo_alarm.clone()))?
            .with(Register::abcd(0x3004, self.tilt_alarm.clone()))?;

        Ok(vec![common, collected, alarms])
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Tests can use unwrap()
mod tests {
    use super::*;
    use fusion_modbus::registers::Registry;

    fn registry() -> (DispenserRegisters, Registry) {
        let registers = DispenserRegisters::new(&DispenserRegistersConfig {
            manufacturer: 7,
            software_version: "2.1.0".to_string(),
            esn: "DISP-0001".to_string(),
            connector_count: 2,
            ..Default::default()
        });
        let registry = Registry::new();
        for subregistry in registers.subregistries().unwrap() {
            registry.add(subregistry).unwrap();
        }
        (registers, registry)
    }

    #[test]
    fn test_identity_is_readable() {
        let (_registers, registry) = registry();
        assert_eq!(registry.on_read(0x0000, 1).unwrap(), vec![0x00, 0x07]);
        assert_eq!(registry.on_read(0x1015, 1).unwrap(), vec![0x00, 0x02]);
        let version = registry.on_read(0x0013, 24).unwrap();
        assert_eq!(&version[..5], b"2.1.0");
        assert!(version[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_time_sync_and_alarms_are_reported() {
        let (registers, registry) = registry();
        let first: Vec<u16> = registry
            .take_report_segments()
            .iter()
            .map(|s| s.registers_start)
            .collect();
        assert_eq!(first, vec![0x1024, 0x3001, 0x3002, 0x3003, 0x3004]);

        let second: Vec<u16> = registry
            .take_report_segments()
            .iter()
            .map(|s| s.registers_start)
            .collect();
        assert_eq!(second, vec![0x1024]);

        registers
            .alarm(DispenserAlarm::Tilt)
            .update_value(AlarmStatus::Alarm);
        let third = registry.take_report_segments();
        assert_eq!(third.len(), 2);
        assert_eq!(third[1].registers_start, 0x3004);
        assert_eq!(third[1].registers, vec![0x00, 0x01]);
    }
}
