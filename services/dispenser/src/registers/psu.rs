//! Registers the power unit fills in about itself

use super::types::PsuRunningMode;
use fusion_modbus::registers::{FixedString, HoldingProvider, Register, Subregistry};
use fusion_modbus::ModbusResult;
use std::sync::Arc;

/// Common power unit information and power unit settings
pub struct PsuRegisters {
    pub manufacturer: Arc<HoldingProvider<u16>>,
    pub protocol_version: Arc<HoldingProvider<u16>>,
    pub hardware_version: Arc<HoldingProvider<u16>>,
    pub software_version: Arc<HoldingProvider<FixedString<48>>>,
    pub esn_control_board: Arc<HoldingProvider<FixedString<32>>>,

    pub psu_running_mode: Arc<HoldingProvider<PsuRunningMode>>,
    /// Phase A, B, C in volts
    pub ac_input_voltages: [Arc<HoldingProvider<f32>>; 3],
    /// Phase A, B, C in amperes
    pub ac_input_currents: [Arc<HoldingProvider<f32>>; 3],
    /// kWh
    pub total_historic_input_energy: Arc<HoldingProvider<f64>>,
    pub psu_mac: Arc<HoldingProvider<[u8; 6]>>,
}

impl Default for PsuRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl PsuRegisters {
    pub fn new() -> Self {
        Self {
            manufacturer: HoldingProvider::new(0),
            protocol_version: HoldingProvider::new(0),
            hardware_version: HoldingProvider::new(0),
            software_version: HoldingProvider::new(FixedString::default()),
            esn_control_board: HoldingProvider::new(FixedString::default()),
            psu_running_mode: HoldingProvider::new(PsuRunningMode::StartingUp),
            ac_input_voltages: std::array::from_fn(|_| HoldingProvider::new(0.0)),
            ac_input_currents: std::array::from_fn(|_| HoldingProvider::new(0.0)),
            total_historic_input_energy: HoldingProvider::new(0.0),
            psu_mac: HoldingProvider::new([0; 6]),
        }
    }

    pub fn common_subregistry(&self) -> ModbusResult<Subregistry> {
        Subregistry::new("common power unit information")
            .with(Register::abcd(0x0100, self.manufacturer.clone()))?
            .with(Register::abcd(0x0101, self.protocol_version.clone()))?
            .with(Register::abcd(0x0102, self.hardware_version.clone()))?
            .with(Register::identity(0x0103, self.software_version.clone()))?
            .with(Register::identity(0x011B, self.esn_control_board.clone()))
    }

    pub fn settings_subregistry(&self) -> ModbusResult<Subregistry> {
        let mut subregistry = Subregistry::new("power unit settings")
            .with(Register::abcd(0x2006, self.psu_running_mode.clone()))?;
        for (i, provider) in self.ac_input_voltages.iter().enumerate() {
            subregistry.add(Register::abcd(0x2007 + 2 * i as u16, provider.clone()))?;
        }
        for (i, provider) in self.ac_input_currents.iter().enumerate() {
            subregistry.add(Register::abcd(0x200D + 2 * i as u16, provider.clone()))?;
        }
        subregistry
            .with(Register::abcd(0x2013, self.total_historic_input_energy.clone()))?
            .with(Register::identity(0x2111, self.psu_mac.clone()))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Tests can use unwrap()
mod tests {
    use super::*;
    use fusion_modbus::registers::Registry;

    #[test]
    fn test_power_unit_writes_land_in_providers() {
        let psu = PsuRegisters::new();
        let registry = Registry::new();
        registry.add(psu.common_subregistry().unwrap()).unwrap();
        registry.add(psu.settings_subregistry().unwrap()).unwrap();

        registry.on_write(0x2006, &[0x00, 0x01]).unwrap();
        registry.on_write(0x2009, &230.5f32.to_be_bytes()).unwrap();
        registry
            .on_write(0x2111, &[0x02, 0xB0, 0x00, 0x00, 0x00, 0x07])
            .unwrap();
        let mut esn = [0u8; 32];
        esn[..6].copy_from_slice(b"PU-123");
        registry.on_write(0x011B, &esn).unwrap();

        assert_eq!(psu.psu_running_mode.get_value(), PsuRunningMode::Running);
        assert_eq!(psu.ac_input_voltages[1].get_value(), 230.5);
        assert_eq!(psu.psu_mac.get_value(), [0x02, 0xB0, 0x00, 0x00, 0x00, 0x07]);
        assert_eq!(psu.esn_control_board.get_value().as_string(), "PU-123");
    }
}
