//! Collaborator interfaces for a collateralized money-market protocol.
//!
//! The position manager talks to four external collaborators, each modelled
//! as a dyn-compatible capability trait:
//! - [`AssetLedger`]: fungible token balances, transfers and approvals
//! - [`ShareMarket`]: mint/redeem yield-bearing shares, borrow/repay
//! - [`RiskRegistry`]: market listing, collateral entry, account liquidity
//! - [`PriceOracle`]: reference-currency unit price per market
//!
//! Two backends implement all four:
//! - [`SimulatedProtocol`]: deterministic in-memory money market with fault injection
//! - [`RpcProtocol`]: JSON-RPC client over alloy contract bindings

pub mod collaborators;
pub mod error;
pub mod ledger;
pub mod oracle;
pub mod registry;
pub mod rpc;
pub mod share_market;
pub mod sim;

pub use collaborators::{BoxFuture, Collaborators};
pub use error::{ProtocolError, ProtocolResult};
pub use ledger::AssetLedger;
pub use oracle::PriceOracle;
pub use registry::{AccountLiquidity, MarketInfo, RiskRegistry};
pub use rpc::{RpcEndpoints, RpcProtocol};
pub use share_market::ShareMarket;
pub use sim::{SimCall, SimMarketConfig, SimOp, SimulatedProtocol};
