//! Signing key loading.
//!
//! Key material is read as hex from an environment variable or a file,
//! decoded into zeroizing memory, and handed to a `PrivateKeySigner`.
//! Never log key material.

use std::path::PathBuf;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

/// Source of the private key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum KeySource {
    /// Load from environment variable (development).
    Env { var_name: String },
    /// Load from file (production, recommend 0600 permissions).
    File { path: PathBuf },
}

impl Default for KeySource {
    fn default() -> Self {
        KeySource::Env {
            var_name: "MMPOS_PRIVATE_KEY".to_string(),
        }
    }
}

/// Key management errors.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Failed to decode hex: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    #[error("Address mismatch: expected {expected}, got {actual}")]
    AddressMismatch { expected: Address, actual: Address },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The custody account's signer.
pub struct KeyManager {
    signer: PrivateKeySigner,
}

impl KeyManager {
    /// Load the key from `source`, checking it against `expected` if given.
    pub fn load(source: &KeySource, expected: Option<Address>) -> Result<Self, KeyError> {
        let secret = match source {
            KeySource::Env { var_name } => {
                let value = Zeroizing::new(
                    std::env::var(var_name)
                        .map_err(|_| KeyError::EnvVarNotFound(var_name.clone()))?,
                );
                parse_hex_key(&value)?
            }
            KeySource::File { path } => {
                let content = Zeroizing::new(std::fs::read_to_string(path)?);
                parse_hex_key(&content)?
            }
        };
        Self::from_bytes(&secret, expected)
    }

    /// Build from raw key bytes.
    pub fn from_bytes(secret: &[u8], expected: Option<Address>) -> Result<Self, KeyError> {
        let signer =
            PrivateKeySigner::from_slice(secret).map_err(|e| KeyError::InvalidKey(e.to_string()))?;

        if let Some(expected) = expected {
            if signer.address() != expected {
                return Err(KeyError::AddressMismatch {
                    expected,
                    actual: signer.address(),
                });
            }
        }

        Ok(Self { signer })
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Hand the signer to a transport.
    pub fn into_signer(self) -> PrivateKeySigner {
        self.signer
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Parse a hex key, accepting a `0x` prefix and surrounding whitespace.
fn parse_hex_key(hex_str: &str) -> Result<Zeroizing<Vec<u8>>, KeyError> {
    let trimmed = hex_str.trim().trim_start_matches("0x");
    Ok(Zeroizing::new(hex::decode(trimmed)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known test key (anvil account #0).
    const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const TEST_ADDRESS: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

    #[test]
    fn test_from_bytes_derives_address() {
        let bytes = hex::decode(TEST_KEY).unwrap();
        let keys = KeyManager::from_bytes(&bytes, None).unwrap();
        assert_eq!(keys.address(), TEST_ADDRESS.parse::<Address>().unwrap());
    }

    #[test]
    fn test_address_mismatch() {
        let bytes = hex::decode(TEST_KEY).unwrap();
        let result = KeyManager::from_bytes(&bytes, Some(Address::repeat_byte(0x11)));
        assert!(matches!(result, Err(KeyError::AddressMismatch { .. })));
    }

    #[test]
    fn test_parse_hex_key_trims_prefix() {
        let parsed = parse_hex_key(&format!("  0x{TEST_KEY}\n")).unwrap();
        assert_eq!(parsed.len(), 32);
        assert!(parse_hex_key("0xzz").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("mmpos-key-{}", std::process::id()));
        std::fs::write(&path, format!("0x{TEST_KEY}\n")).unwrap();

        let keys = KeyManager::load(&KeySource::File { path: path.clone() }, None).unwrap();
        assert_eq!(keys.address(), TEST_ADDRESS.parse::<Address>().unwrap());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_missing_env_var() {
        let source = KeySource::Env {
            var_name: "MMPOS_TEST_KEY_THAT_IS_NOT_SET".to_string(),
        };
        assert!(matches!(
            KeyManager::load(&source, None),
            Err(KeyError::EnvVarNotFound(_))
        ));
    }
}
