//! Per-connector register blocks
//!
//! Every connector owns three blocks (collected information, settings written by
//! the power unit, alarms) at the base addresses below plus [`connector_offset`].

use super::types::{
    AlarmStatus, ChargingEvent, ConnectionStatus, ConnectorType, ContactorStatus,
    ElectronicLockStatus, PsuPortAvailability, WorkingStatus,
};
use fusion_modbus::registers::{CallbackProvider, HoldingProvider, Register, Subregistry};
use fusion_modbus::ModbusResult;
use std::fmt;
use std::sync::Arc;

/// Address offset of the blocks of local connector `1..=4`
pub fn connector_offset(local_connector_number: u16) -> Option<u16> {
    match local_connector_number {
        1 => Some(0x0000),
        2 => Some(0x0C00),
        3 => Some(0x0D00),
        4 => Some(0x0E00),
        _ => None,
    }
}

type Getter<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Live connector telemetry owned by the host
pub struct ConnectorCallbacks {
    pub contactor_upstream_voltage: Getter<f32>,
    pub output_voltage: Getter<f32>,
    pub output_current: Getter<f32>,
    pub contactor_status: Getter<ContactorStatus>,
    pub electronic_lock_status: Getter<ElectronicLockStatus>,
}

impl Default for ConnectorCallbacks {
    fn default() -> Self {
        Self {
            contactor_upstream_voltage: Box::new(|| 0.0),
            output_voltage: Box::new(|| 0.0),
            output_current: Box::new(|| 0.0),
            contactor_status: Box::new(|| ContactorStatus::Off),
            electronic_lock_status: Box::new(|| ElectronicLockStatus::Unlocked),
        }
    }
}

impl fmt::Debug for ConnectorCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorCallbacks").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorRegistersConfig {
    /// Link-layer address of the dispenser
    pub mac_address: [u8; 6],
    pub connector_type: ConnectorType,
    pub local_connector_number: u16,
    /// Amperes
    pub max_rated_charge_current: f32,
    /// Kilowatts
    pub rated_output_power_connector: f32,
}

/// Connector alarms reported to the power unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorAlarm {
    DcOutputContactFault,
    InverseConnectionDispenserInletCable,
}

pub struct ConnectorRegisters {
    offset: u16,

    // Collected connector information
    pub total_energy_charged: Arc<HoldingProvider<f64>>,
    pub connector_type: Arc<HoldingProvider<ConnectorType>>,
    pub max_rated_charge_current: Arc<HoldingProvider<f32>>,
    pub output_voltage: Arc<CallbackProvider<f32>>,
    pub output_current: Arc<CallbackProvider<f32>>,
    pub working_status: Arc<HoldingProvider<WorkingStatus>>,
    pub connection_status: Arc<HoldingProvider<ConnectionStatus>>,
    pub connector_number: Arc<HoldingProvider<u16>>,
    pub contactor_upstream_voltage: Arc<CallbackProvider<f32>>,
    pub mac_address: Arc<HoldingProvider<[u8; 6]>>,
    pub contactor_status: Arc<CallbackProvider<ContactorStatus>>,
    pub electronic_lock_status: Arc<CallbackProvider<ElectronicLockStatus>>,
    pub charging_event: Arc<HoldingProvider<ChargingEvent>>,

    // Settings written by the power unit
    pub max_rated_psu_voltage: Arc<HoldingProvider<f32>>,
    pub max_rated_psu_current: Arc<HoldingProvider<f32>>,
    pub min_rated_psu_voltage: Arc<HoldingProvider<f32>>,
    pub min_rated_psu_current: Arc<HoldingProvider<f32>>,
    /// Kilowatts
    pub rated_output_power_connector: Arc<HoldingProvider<f32>>,
    pub hmac_key: Arc<HoldingProvider<[u8; 48]>>,
    /// Kilowatts
    pub rated_output_power_psu: Arc<HoldingProvider<f32>>,
    pub psu_port_available: Arc<HoldingProvider<PsuPortAvailability>>,

    // Alarms
    pub dc_output_contact_fault: Arc<HoldingProvider<AlarmStatus>>,
    pub inverse_connection_dispenser_inlet_cable: Arc<HoldingProvider<AlarmStatus>>,
}

impl ConnectorRegisters {
    /// `None` when the local connector number has no register block
    pub fn new(config: &ConnectorRegistersConfig, callbacks: ConnectorCallbacks) -> Option<Self> {
        let offset = connector_offset(config.local_connector_number)?;
        let ConnectorCallbacks {
            contactor_upstream_voltage,
            output_voltage,
            output_current,
            contactor_status,
            electronic_lock_status,
        } = callbacks;

        Some(Self {
            offset,
            total_energy_charged: HoldingProvider::new(0.0),
            connector_type: HoldingProvider::new(config.connector_type),
            max_rated_charge_current: HoldingProvider::new(config.max_rated_charge_current),
            output_voltage: CallbackProvider::new(output_voltage),
            output_current: CallbackProvider::new(output_current),
            working_status: HoldingProvider::unsolicited(WorkingStatus::Standby),
            connection_status: HoldingProvider::unsolicited(ConnectionStatus::NotConnected),
            connector_number: HoldingProvider::new(config.local_connector_number),
            contactor_upstream_voltage: CallbackProvider::new(contactor_upstream_voltage),
            mac_address: HoldingProvider::new(config.mac_address),
            contactor_status: CallbackProvider::unsolicited(contactor_status),
            electronic_lock_status: CallbackProvider::unsolicited(electronic_lock_status),
            charging_event: HoldingProvider::unsolicited(ChargingEvent::StartToStop),

            max_rated_psu_voltage: HoldingProvider::new(0.0),
            max_rated_psu_current: HoldingProvider::new(0.0),
            min_rated_psu_voltage: HoldingProvider::new(0.0),
            min_rated_psu_current: HoldingProvider::new(0.0),
            rated_output_power_connector: HoldingProvider::new(config.rated_output_power_connector),
            hmac_key: HoldingProvider::new([0; 48]),
            rated_output_power_psu: HoldingProvider::new(0.0),
            psu_port_available: HoldingProvider::new(PsuPortAvailability::NotAvailable),

            dc_output_contact_fault: HoldingProvider::unsolicited(AlarmStatus::Normal),
            inverse_connection_dispenser_inlet_cable: HoldingProvider::unsolicited(
                AlarmStatus::Normal,
            ),
        })
    }

    pub fn offset(&self) -> u16 {
        self.offset
    }

    pub fn alarm(&self, alarm: ConnectorAlarm) -> &Arc<HoldingProvider<AlarmStatus>> {
        match alarm {
            ConnectorAlarm::DcOutputContactFault => &self.dc_output_contact_fault,
            ConnectorAlarm::InverseConnectionDispenserInletCable => {
                &self.inverse_connection_dispenser_inlet_cable
            },
        }
    }

    /// Collected, settings and alarm blocks at this connector's offset
    pub fn subregistries(&self) -> ModbusResult<Vec<Subregistry>> {
        let at = |base: u16| base + self.offset;
        let n = self.connector_number.get_value();

        let collected = Subregistry::new(format!("connector {} collected information", n))
            .with(Register::abcd(at(0x1100), self.total_energy_charged.clone()))?
            .with(Register::abcd(at(0x1104), self.connector_type.clone()))?
            .with(Register::abcd(at(0x1105), self.max_rated_charge_current.clone()))?
            .with(Register::abcd(at(0x1107), self.output_voltage.clone()))?
            .with(Register::abcd(at(0x1109), self.output_current.clone()))?
            .with(Register::abcd(at(0x110B), self.working_status.clone()))?
            .with(Register::abcd(at(0x110D), self.connection_status.clone()))?
            .with(Register::abcd(at(0x110E), self.connector_number.clone()))?
            .with(Register::abcd(at(0x1113), self.contactor_upstream_voltage.clone()))?
            .with(Register::identity(at(0x114D), self.mac_address.clone()))?
            .with(Register::abcd(at(0x1154), self.contactor_status.clone()))?
            .with(Register::abcd(at(0x1156), self.electronic_lock_status.clone()))?
            .with(Register::abcd(at(0x117E), self.charging_event.clone()))?;

        let settings = Subregistry::new(format!("connector {} settings", n))
            .with(Register::abcd(at(0x2100), self.max_rated_psu_voltage.clone()))?
            .with(Register::abcd(at(0x2102), self.max_rated_psu_current.clone()))?
            .with(Register::abcd(at(0x2105), self.min_rated_psu_voltage.clone()))?
            .with(Register::abcd(at(0x2107), self.min_rated_psu_current.clone()))?
            .with(Register::abcd(at(0x2109), self.rated_output_power_connector.clone()))?
            .with(Register::identity(at(0x2115), self.hmac_key.clone()))?
            .with(Register::abcd(at(0x212D), self.rated_output_power_psu.clone()))?
            .with(Register::abcd(at(0x212F), self.psu_port_available.clone()))?;

        let alarms = Subregistry::new(format!("connector {} alarms", n))
            .with(Register::abcd(at(0x3105), self.dc_output_contact_fault.clone()))?
            .with(Register::abcd(
                at(0x3115),
                self.inverse_connection_dispenser_inlet_cable.clone(),
            ))?;

        Ok(vec![collected, settings, alarms])
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Tests can use unwrap()
mod tests {
    use super::*;
    use fusion_modbus::registers::Registry;

    fn config(local: u16) -> ConnectorRegistersConfig {
        ConnectorRegistersConfig {
            mac_address: [0x02, 0xD1, 0, 0, 0, 0x01],
            connector_type: ConnectorType::Ccs2,
            local_connector_number: local,
            max_rated_charge_current: 250.0,
            rated_output_power_connector: 150.0,
        }
    }

    #[test]
    fn test_four_connectors_do_not_overlap() {
        let registry = Registry::new();
        for local in 1..=4 {
            let registers = ConnectorRegisters::new(&config(local), ConnectorCallbacks::default())
                .unwrap();
            for subregistry in registers.subregistries().unwrap() {
                registry.add(subregistry).unwrap();
            }
        }
        registry.verify_overlap().unwrap();
        assert!(ConnectorRegisters::new(&config(5), ConnectorCallbacks::default()).is_none());
    }

    #[test]
    fn test_offset_applies_to_every_block() {
        let registers =
            ConnectorRegisters::new(&config(3), ConnectorCallbacks::default()).unwrap();
        let registry = Registry::new();
        for subregistry in registers.subregistries().unwrap() {
            registry.add(subregistry).unwrap();
        }

        registry.on_write(0x2E00, &800.0f32.to_be_bytes()).unwrap();
        assert_eq!(registers.max_rated_psu_voltage.get_value(), 800.0);
        assert_eq!(registry.on_read(0x1E0E, 1).unwrap(), vec![0x00, 0x03]);
        assert_eq!(
            registry.on_read(0x1E4D, 3).unwrap(),
            vec![0x02, 0xD1, 0, 0, 0, 0x01]
        );
        registry.on_write(0x3E05, &[0x00, 0x01]).unwrap();
        assert_eq!(
            registers.alarm(ConnectorAlarm::DcOutputContactFault).get_value(),
            AlarmStatus::Alarm
        );
    }

    #[test]
    fn test_host_telemetry_is_read_through_callbacks() {
        let callbacks = ConnectorCallbacks {
            output_voltage: Box::new(|| 401.5),
            contactor_status: Box::new(|| ContactorStatus::On),
            ..ConnectorCallbacks::default()
        };
        let registers = ConnectorRegisters::new(&config(1), callbacks).unwrap();
        let registry = Registry::new();
        for subregistry in registers.subregistries().unwrap() {
            registry.add(subregistry).unwrap();
        }
        assert_eq!(registry.on_read(0x1107, 2).unwrap(), 401.5f32.to_be_bytes().to_vec());

        let reported: Vec<u16> = registry
            .take_report_segments()
            .iter()
            .map(|s| s.registers_start)
            .collect();
        assert!(reported.contains(&0x1154));
        assert!(reported.contains(&0x110B));
        assert!(!reported.contains(&0x1107));
    }
}
