//! Dispenser driver errors

use fusion_goose::GooseError;
use fusion_modbus::ModbusError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispenserError {
    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Modbus(#[from] ModbusError),

    #[error(transparent)]
    Goose(#[from] GooseError),

    /// No connector with this global number is configured
    #[error("Invalid connector number {0}")]
    InvalidConnector(u16),

    /// The power unit session is not established
    #[error("Dispenser is not running")]
    NotRunning,
}

impl From<figment::Error> for DispenserError {
    fn from(e: figment::Error) -> Self {
        DispenserError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DispenserError>;
