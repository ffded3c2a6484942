//! Application error types.

use thiserror::Error;

use crate::keys::KeyError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Unknown market: {0}")]
    UnknownMarket(String),

    #[error("Core error: {0}")]
    Core(#[from] mmpos_core::CoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] mmpos_protocol::ProtocolError),

    #[error("Position error: {0}")]
    Position(#[from] mmpos_position::PositionError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] mmpos_telemetry::TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
