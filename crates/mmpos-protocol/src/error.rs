//! Protocol error types.
//!
//! These are transport and adapter failures. Protocol-level rejections come
//! back as non-zero [`mmpos_core::StatusCode`]s, not as errors.

use alloy::primitives::Address;
use mmpos_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transaction reverted: {0}")]
    Reverted(String),

    #[error("Account {account} cannot act through signer {signer}")]
    Unauthorized { account: Address, signer: Address },

    #[error("Unknown token: {0}")]
    UnknownToken(Address),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Arithmetic error: {0}")]
    Core(#[from] CoreError),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
