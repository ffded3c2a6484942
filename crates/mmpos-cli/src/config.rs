//! Application configuration.
//!
//! Addresses are kept as strings in the file and parsed in [`AppConfig::validate`]
//! and the accessors, so a typo is reported with the field it came from.

use std::str::FromStr;

use mmpos_core::fixed::{self, MANTISSA_DECIMALS};
use mmpos_core::{Address, FractionBps, Market, U256};
use mmpos_protocol::{RpcEndpoints, SimMarketConfig};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::keys::KeySource;

/// JSON-RPC endpoint and protocol-wide contract addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// HTTP JSON-RPC URL.
    #[serde(default = "default_rpc_url")]
    pub url: String,
    /// Risk registry (comptroller) address.
    pub registry: String,
    /// Price oracle address.
    pub oracle: String,
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

/// Signing key configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyConfig {
    #[serde(flatten)]
    pub source: KeySource,
    /// If set, the loaded key must derive this address.
    #[serde(default)]
    pub expected_address: Option<String>,
}

/// One (underlying, share market) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Display and lookup symbol (e.g. "cDAI").
    pub symbol: String,
    pub underlying: String,
    pub share_market: String,
    #[serde(default = "default_underlying_decimals")]
    pub underlying_decimals: u8,
    #[serde(default = "default_share_decimals")]
    pub share_decimals: u8,
    /// Simulated price override (whole reference units per whole underlying).
    #[serde(default)]
    pub sim_price: Option<String>,
}

fn default_underlying_decimals() -> u8 {
    18
}

fn default_share_decimals() -> u8 {
    8
}

/// Position manager defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionConfig {
    /// Borrow fraction used when the command does not give one.
    #[serde(default = "default_fraction_bps")]
    pub default_fraction_bps: u16,
    /// Address funds are pulled from and returned to. Defaults to the
    /// custody account itself.
    #[serde(default)]
    pub caller: Option<String>,
}

fn default_fraction_bps() -> u16 {
    5_000
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            default_fraction_bps: default_fraction_bps(),
            caller: None,
        }
    }
}

/// In-memory protocol parameters for `--simulate`.
///
/// Amounts are whole units; rates and factors are plain decimals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Custody account used by the simulated manager.
    #[serde(default = "default_sim_account")]
    pub account: String,
    /// Caller used when `position.caller` is unset.
    #[serde(default = "default_sim_caller")]
    pub caller: String,
    /// Underlying credited to the caller in every market.
    #[serde(default = "default_caller_funding")]
    pub caller_funding: String,
    /// Underlying cash held by every share market.
    #[serde(default = "default_market_cash")]
    pub market_cash: String,
    /// Whole underlying per whole share.
    #[serde(default = "default_exchange_rate")]
    pub exchange_rate: String,
    #[serde(default = "default_collateral_factor")]
    pub collateral_factor: String,
    /// Whole reference units per whole underlying.
    #[serde(default = "default_price")]
    pub price: String,
}

fn default_sim_account() -> String {
    "0x4242424242424242424242424242424242424242".to_string()
}

fn default_sim_caller() -> String {
    "0x0101010101010101010101010101010101010101".to_string()
}

fn default_caller_funding() -> String {
    "10000".to_string()
}

fn default_market_cash() -> String {
    "1000000".to_string()
}

fn default_exchange_rate() -> String {
    "0.02".to_string()
}

fn default_collateral_factor() -> String {
    "0.75".to_string()
}

fn default_price() -> String {
    "1".to_string()
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            account: default_sim_account(),
            caller: default_sim_caller(),
            caller_funding: default_caller_funding(),
            market_cash: default_market_cash(),
            exchange_rate: default_exchange_rate(),
            collateral_factor: default_collateral_factor(),
            price: default_price(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Required unless running with `--simulate`.
    #[serde(default)]
    pub rpc: Option<RpcConfig>,
    #[serde(default)]
    pub key: KeyConfig,
    #[serde(default)]
    pub markets: Vec<MarketConfig>,
    #[serde(default)]
    pub position: PositionConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config {path}: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))
    }

    /// Check every market, the fraction default, and (for RPC) the endpoints.
    pub fn validate(&self, simulate: bool) -> AppResult<()> {
        if self.markets.is_empty() {
            return Err(AppError::Config("no markets configured".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for market in &self.markets {
            if !seen.insert(market.symbol.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate market symbol {}",
                    market.symbol
                )));
            }
            market.to_market()?;
        }
        FractionBps::new(self.position.default_fraction_bps).map_err(|e| {
            AppError::Config(format!("position.default_fraction_bps: {e}"))
        })?;
        if let Some(caller) = &self.position.caller {
            parse_address("position.caller", caller)?;
        }

        if simulate {
            self.simulation.validate()?;
        } else {
            self.rpc_endpoints()?;
            if let Some(expected) = &self.key.expected_address {
                parse_address("key.expected_address", expected)?;
            }
        }
        Ok(())
    }

    /// Look up a market by symbol (case-insensitive).
    pub fn market(&self, symbol: &str) -> AppResult<Market> {
        self.markets
            .iter()
            .find(|m| m.symbol.eq_ignore_ascii_case(symbol))
            .ok_or_else(|| AppError::UnknownMarket(symbol.to_string()))?
            .to_market()
    }

    pub fn rpc_endpoints(&self) -> AppResult<RpcEndpoints> {
        let rpc = self
            .rpc
            .as_ref()
            .ok_or_else(|| AppError::Config("[rpc] section is required".to_string()))?;
        Ok(RpcEndpoints {
            rpc_url: rpc.url.clone(),
            registry: parse_address("rpc.registry", &rpc.registry)?,
            oracle: parse_address("rpc.oracle", &rpc.oracle)?,
        })
    }

    pub fn expected_address(&self) -> AppResult<Option<Address>> {
        self.key
            .expected_address
            .as_deref()
            .map(|a| parse_address("key.expected_address", a))
            .transpose()
    }

    pub fn caller(&self) -> AppResult<Option<Address>> {
        self.position
            .caller
            .as_deref()
            .map(|a| parse_address("position.caller", a))
            .transpose()
    }
}

impl MarketConfig {
    pub fn to_market(&self) -> AppResult<Market> {
        let underlying = parse_address(&format!("{}.underlying", self.symbol), &self.underlying)?;
        let share_market =
            parse_address(&format!("{}.share_market", self.symbol), &self.share_market)?;
        Market::new(
            underlying,
            share_market,
            self.underlying_decimals,
            self.share_decimals,
        )
        .map(|m| m.with_symbol(self.symbol.clone()))
        .map_err(|e| AppError::Config(format!("market {}: {e}", self.symbol)))
    }
}

impl SimulationConfig {
    fn validate(&self) -> AppResult<()> {
        parse_address("simulation.account", &self.account)?;
        parse_address("simulation.caller", &self.caller)?;
        parse_decimal_mantissa("simulation.collateral_factor", &self.collateral_factor)?;
        parse_decimal_mantissa("simulation.price", &self.price)?;
        Ok(())
    }

    pub fn account(&self) -> AppResult<Address> {
        parse_address("simulation.account", &self.account)
    }

    pub fn caller(&self) -> AppResult<Address> {
        parse_address("simulation.caller", &self.caller)
    }

    /// Protocol parameters for one market, in on-chain mantissa form.
    ///
    /// The exchange rate mantissa is scaled by `10^(18 + underlying - share)`
    /// so that `shares * rate / 1e18` yields underlying base units.
    pub fn market_config(&self, market: &MarketConfig) -> AppResult<SimMarketConfig> {
        let rate_decimals = i32::from(MANTISSA_DECIMALS) + i32::from(market.underlying_decimals)
            - i32::from(market.share_decimals);
        let rate_decimals = u8::try_from(rate_decimals).map_err(|_| {
            AppError::Config(format!(
                "market {}: exchange rate scale {rate_decimals} out of range",
                market.symbol
            ))
        })?;
        let exchange_rate = fixed::parse_units(&self.exchange_rate, rate_decimals)
            .map_err(|e| AppError::Config(format!("simulation.exchange_rate: {e}")))?;
        if exchange_rate.is_zero() {
            return Err(AppError::Config(
                "simulation.exchange_rate must be positive".to_string(),
            ));
        }
        let price = parse_decimal_mantissa(
            "price",
            market.sim_price.as_deref().unwrap_or(&self.price),
        )?;

        Ok(SimMarketConfig {
            exchange_rate,
            supply_rate: U256::ZERO,
            collateral_factor: parse_decimal_mantissa(
                "simulation.collateral_factor",
                &self.collateral_factor,
            )?,
            price,
        })
    }
}

fn parse_address(field: &str, value: &str) -> AppResult<Address> {
    Address::from_str(value.trim())
        .map_err(|e| AppError::Config(format!("{field}: invalid address {value:?}: {e}")))
}

fn parse_decimal_mantissa(field: &str, value: &str) -> AppResult<U256> {
    fixed::parse_units(value, MANTISSA_DECIMALS)
        .map_err(|e| AppError::Config(format!("{field}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mmpos_core::fixed::MANTISSA_ONE;

    const SAMPLE: &str = r#"
[rpc]
registry = "0x3d9819210a31b4961b30ef54be2aed79b9c9cd3b"
oracle = "0x65c816077c29b557bee980ae3cc2dce80204a0c5"

[key]
source = "file"
path = "/run/secrets/mmpos.key"

[position]
default_fraction_bps = 2500

[[markets]]
symbol = "cDAI"
underlying = "0x6b175474e89094c44da98b954eedeac495271d0f"
share_market = "0x5d3a536e4d6dbd6114cc1ead35777bab948e3643"

[[markets]]
symbol = "cUSDC"
underlying = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"
share_market = "0x39aa39c021dfbae8fac545936693ac917d5e7563"
underlying_decimals = 6
sim_price = "1.0001"
"#;

    #[test]
    fn test_parse_sample() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        config.validate(false).unwrap();

        assert_eq!(config.markets.len(), 2);
        assert_eq!(config.position.default_fraction_bps, 2500);
        assert_eq!(config.rpc.as_ref().unwrap().url, "http://127.0.0.1:8545");
        assert!(matches!(config.key.source, KeySource::File { .. }));

        let usdc = config.market("cusdc").unwrap();
        assert_eq!(usdc.underlying_decimals(), 6);
        assert_eq!(usdc.share_decimals(), 8);
        assert_eq!(usdc.symbol(), Some("cUSDC"));
    }

    #[test]
    fn test_unknown_market() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        assert!(matches!(
            config.market("cETH"),
            Err(AppError::UnknownMarket(_))
        ));
    }

    #[test]
    fn test_rpc_required_unless_simulating() {
        let mut config = AppConfig::from_toml(SAMPLE).unwrap();
        config.rpc = None;
        assert!(config.validate(false).is_err());
        config.validate(true).unwrap();
    }

    #[test]
    fn test_rejects_bad_fraction_and_duplicate_symbol() {
        let mut config = AppConfig::from_toml(SAMPLE).unwrap();
        config.position.default_fraction_bps = 0;
        assert!(config.validate(true).is_err());

        let mut config = AppConfig::from_toml(SAMPLE).unwrap();
        config.markets[1].symbol = "cDAI".to_string();
        assert!(config.validate(true).is_err());
    }

    #[test]
    fn test_simulated_market_config_scales_rate() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();

        // 18/8 decimals: 0.02 whole underlying per share is 2e26.
        let dai = config.simulation.market_config(&config.markets[0]).unwrap();
        assert_eq!(dai.exchange_rate, U256::from(2u8) * fixed::pow10(26).unwrap());
        assert_eq!(dai.price, MANTISSA_ONE);
        assert_eq!(
            dai.collateral_factor,
            MANTISSA_ONE * U256::from(3u8) / U256::from(4u8)
        );

        // 6/8 decimals: 2e14, with the per-market price override.
        let usdc = config.simulation.market_config(&config.markets[1]).unwrap();
        assert_eq!(usdc.exchange_rate, U256::from(2u8) * fixed::pow10(14).unwrap());
        assert_eq!(usdc.price, U256::from(1_000_100_000_000_000_000u64));
    }
}
