use thiserror::Error;

use crate::{
    config_manager::ConfigError, dbus_service::DbusServiceError,
    devices_manager::DevicesManagerError,
};

// A failed sensor read
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Unit \"{unit}\" is unavailable")]
    Unavailable { unit: String },
    #[error("Failed to read {what} on \"{unit}\": {reason}")]
    Read {
        unit: String,
        what: &'static str,
        reason: String,
    },
}

// A failed fan command
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Unit \"{unit}\" is unavailable")]
    Unavailable { unit: String },
    #[error("Unit \"{unit}\" does not expose a controllable fan")]
    NoControllableFan { unit: String },
    #[error("Hardware rejected fan command on \"{unit}\": {reason}")]
    Rejected { unit: String, reason: String },
}

// The main crate error type
#[derive(Debug, Error)]
pub enum MossFanError {
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    DevicesManager(#[from] DevicesManagerError),
    #[error(transparent)]
    DBusService(#[from] DbusServiceError),
}
