//! Command-line driver for the money-market position manager.
//!
//! Wires the configured collaborators (JSON-RPC or in-memory) to a
//! [`mmpos_position::PositionManager`] and runs one command per invocation.

pub mod app;
pub mod config;
pub mod error;
pub mod keys;

pub use app::{Application, Command, MarketStatus};
pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use keys::{KeyError, KeyManager, KeySource};
