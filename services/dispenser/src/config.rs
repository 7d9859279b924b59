//! Dispenser configuration
//!
//! Loaded from a YAML file layered over built-in defaults; environment variables
//! prefixed with `FUSION_DISPENSER_` override both (nested keys use `__`).

use crate::error::{DispenserError, Result};
use crate::registers::ConnectorType;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use fusion_goose::{Retransmission, SenderConfig, VlanTag};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// The power unit accepts at most four dispenser connectors
pub const MAX_CONNECTORS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Number the power unit uses for this connector, `1..=4`
    pub global_connector_number: u16,
    #[serde(default = "default_connector_type")]
    pub connector_type: ConnectorType,
    /// Amperes
    pub max_rated_charge_current: f32,
    /// Watts
    pub max_rated_output_power: f32,
}

fn default_connector_type() -> ConnectorType {
    ConnectorType::Ccs2
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetransmissionConfig {
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
}

fn default_initial_interval_ms() -> u64 {
    20
}

fn default_max_interval_ms() -> u64 {
    1000
}

impl Default for RetransmissionConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispenserConfig {
    #[serde(default = "default_psu_host")]
    pub psu_host: String,
    #[serde(default = "default_psu_port")]
    pub psu_port: u16,

    // Identity published in the common dispenser registers
    #[serde(default = "default_one")]
    pub manufacturer: u16,
    #[serde(default = "default_one")]
    pub model: u16,
    #[serde(default = "default_one")]
    pub protocol_version: u16,
    #[serde(default = "default_one")]
    pub hardware_version: u16,
    #[serde(default = "default_software_version")]
    pub software_version: String,
    #[serde(default)]
    pub esn: String,

    /// Sign outgoing GOOSE frames; nothing is sent before the power unit hands out a key
    #[serde(default = "default_true")]
    pub send_secure_goose: bool,
    /// Accept unsigned GOOSE frames from the power unit
    #[serde(default)]
    pub allow_unsecured_goose: bool,
    /// Check the HMAC of signed frames against the connector's key
    #[serde(default = "default_true")]
    pub verify_secure_goose_hmac: bool,

    #[serde(default = "default_allocation_timeout_ms")]
    pub module_placeholder_allocation_timeout_ms: u64,
    /// The session fails when the power unit sends nothing for this long
    #[serde(default = "default_modbus_timeout_ms")]
    pub modbus_timeout_ms: u64,
    #[serde(default = "default_report_interval_ms")]
    pub unsolicited_report_interval_ms: u64,
    #[serde(default = "default_report_timeout_ms")]
    pub unsolicited_report_timeout_ms: u64,
    #[serde(default)]
    pub unsolicited_report_location: u16,

    #[serde(default)]
    pub goose_vlan_id: u16,
    #[serde(default = "default_goose_priority")]
    pub goose_priority: u8,
    /// `None` disables retransmission of the last published frame
    #[serde(default = "default_retransmission")]
    pub goose_retransmission: Option<RetransmissionConfig>,

    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,

    #[serde(default)]
    pub connectors: Vec<ConnectorConfig>,
}

fn default_psu_host() -> String {
    "192.168.11.1".to_string()
}

fn default_psu_port() -> u16 {
    502
}

fn default_one() -> u16 {
    1
}

fn default_software_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_true() -> bool {
    true
}

fn default_allocation_timeout_ms() -> u64 {
    5000
}

fn default_modbus_timeout_ms() -> u64 {
    60_000
}

fn default_report_interval_ms() -> u64 {
    1000
}

fn default_report_timeout_ms() -> u64 {
    3000
}

fn default_goose_priority() -> u8 {
    5
}

fn default_retransmission() -> Option<RetransmissionConfig> {
    Some(RetransmissionConfig::default())
}

fn default_connect_retries() -> u32 {
    10
}

fn default_connect_backoff_ms() -> u64 {
    10
}

impl Default for DispenserConfig {
    fn default() -> Self {
        Self {
            psu_host: default_psu_host(),
            psu_port: default_psu_port(),
            manufacturer: default_one(),
            model: default_one(),
            protocol_version: default_one(),
            hardware_version: default_one(),
            software_version: default_software_version(),
            esn: String::new(),
            send_secure_goose: true,
            allow_unsecured_goose: false,
            verify_secure_goose_hmac: true,
            module_placeholder_allocation_timeout_ms: default_allocation_timeout_ms(),
            modbus_timeout_ms: default_modbus_timeout_ms(),
            unsolicited_report_interval_ms: default_report_interval_ms(),
            unsolicited_report_timeout_ms: default_report_timeout_ms(),
            unsolicited_report_location: 0,
            goose_vlan_id: 0,
            goose_priority: default_goose_priority(),
            goose_retransmission: default_retransmission(),
            connect_retries: default_connect_retries(),
            connect_backoff_ms: default_connect_backoff_ms(),
            connectors: Vec::new(),
        }
    }
}

impl DispenserConfig {
    /// Load from `path`, then apply `FUSION_DISPENSER_*` overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: DispenserConfig =
            Figment::from(Serialized::defaults(DispenserConfig::default()))
                .merge(Yaml::file(path.as_ref()))
                .merge(Env::prefixed("FUSION_DISPENSER_").split("__"))
                .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connectors.len() > MAX_CONNECTORS {
            return Err(DispenserError::Config(format!(
                "{} connectors configured, at most {} are supported",
                self.connectors.len(),
                MAX_CONNECTORS
            )));
        }

        let mut seen = Vec::with_capacity(self.connectors.len());
        for connector in &self.connectors {
            let number = connector.global_connector_number;
            if !(1..=MAX_CONNECTORS as u16).contains(&number) {
                return Err(DispenserError::Config(format!(
                    "Connector number {} is outside 1..={}",
                    number, MAX_CONNECTORS
                )));
            }
            if seen.contains(&number) {
                return Err(DispenserError::Config(format!(
                    "Connector number {} is configured twice",
                    number
                )));
            }
            seen.push(number);
        }

        if self.goose_priority > 7 {
            return Err(DispenserError::Config(format!(
                "GOOSE priority {} does not fit the 3-bit PCP field",
                self.goose_priority
            )));
        }
        if self.goose_vlan_id > 0x0FFF {
            return Err(DispenserError::Config(format!(
                "GOOSE VLAN id {} does not fit 12 bits",
                self.goose_vlan_id
            )));
        }
        if let Some(r) = &self.goose_retransmission {
            if r.initial_interval_ms == 0 || r.initial_interval_ms > r.max_interval_ms {
                return Err(DispenserError::Config(format!(
                    "GOOSE retransmission intervals {}..{} ms are invalid",
                    r.initial_interval_ms, r.max_interval_ms
                )));
            }
        }
        if self.modbus_timeout_ms == 0 {
            return Err(DispenserError::Config(
                "modbus_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn psu_address(&self) -> String {
        format!("{}:{}", self.psu_host, self.psu_port)
    }

    pub fn connector(&self, global_connector_number: u16) -> Option<&ConnectorConfig> {
        self.connectors
            .iter()
            .find(|c| c.global_connector_number == global_connector_number)
    }

    pub fn modbus_timeout(&self) -> Duration {
        Duration::from_millis(self.modbus_timeout_ms)
    }

    pub fn allocation_timeout(&self) -> Duration {
        Duration::from_millis(self.module_placeholder_allocation_timeout_ms)
    }

    pub fn unsolicited_report_interval(&self) -> Duration {
        Duration::from_millis(self.unsolicited_report_interval_ms)
    }

    pub fn unsolicited_report_timeout(&self) -> Duration {
        Duration::from_millis(self.unsolicited_report_timeout_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            vlan: VlanTag::new(self.goose_priority, self.goose_vlan_id),
            retransmission: self.goose_retransmission.map(|r| Retransmission {
                initial_interval: Duration::from_millis(r.initial_interval_ms),
                max_interval: Duration::from_millis(r.max_interval_ms),
            }),
        }
    }
}
