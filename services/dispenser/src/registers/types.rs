//! One-word enumerations of the dispenser register map

use fusion_modbus::register_enum;
use serde::{Deserialize, Serialize};

register_enum! {
    /// Charging connector standard
    #[derive(Serialize, Deserialize)]
    pub enum ConnectorType {
        Ccs1 = 1,
        Ccs2 = 2,
        Chademo = 3,
        Gb = 4,
    }
}

register_enum! {
    /// Connector state as presented to the power unit
    pub enum WorkingStatus {
        Standby = 0,
        StandbyWithConnectorInserted = 1,
        Charging = 3,
        ChargingComplete = 4,
        Fault = 5,
        DispenserUpgrade = 7,
        ChargingStarting = 8,
    }
}

register_enum! {
    pub enum ConnectionStatus {
        NotConnected = 0,
        SemiConnected = 1,
        FullConnected = 2,
    }
}

register_enum! {
    pub enum ContactorStatus {
        Off = 0,
        On = 1,
    }
}

register_enum! {
    pub enum ElectronicLockStatus {
        Unlocked = 0,
        Locked = 1,
    }
}

register_enum! {
    /// Edge reported when a connector enters or leaves the running session
    pub enum ChargingEvent {
        StartToStop = 0,
        StopToStart = 1,
    }
}

register_enum! {
    pub enum PsuRunningMode {
        StartingUp = 0,
        Running = 1,
        Faulty = 2,
        Sleeping = 3,
        Upgrading = 4,
    }
}

register_enum! {
    pub enum PsuPortAvailability {
        NotAvailable = 0,
        Available = 1,
    }
}

register_enum! {
    pub enum AlarmStatus {
        Normal = 0,
        Alarm = 1,
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Tests can use unwrap()
mod tests {
    use super::*;
    use fusion_modbus::registers::RegisterValue;

    #[test]
    fn test_working_status_gaps_are_rejected() {
        assert_eq!(WorkingStatus::try_from(8).unwrap(), WorkingStatus::ChargingStarting);
        assert!(WorkingStatus::try_from(2).is_err());
        assert!(WorkingStatus::try_from(6).is_err());
    }

    #[test]
    fn test_connector_type_serde_names() {
        let parsed: Vec<ConnectorType> = serde_yaml::from_str("[Ccs1, Chademo, Gb]").unwrap();
        assert_eq!(
            parsed,
            vec![ConnectorType::Ccs1, ConnectorType::Chademo, ConnectorType::Gb]
        );
    }

    #[test]
    fn test_enum_is_one_register_wide() {
        assert_eq!(<AlarmStatus as RegisterValue>::WORDS, 1);
        let bytes = AlarmStatus::Alarm.to_host_bytes();
        assert_eq!(AlarmStatus::from_host_bytes(&bytes).unwrap(), AlarmStatus::Alarm);
        assert!(PsuRunningMode::from_host_bytes(&9u16.to_ne_bytes()).is_err());
    }
}
