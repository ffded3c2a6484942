//! Collaborator bundle handed to the position manager.

use std::pin::Pin;
use std::sync::Arc;

use crate::ledger::AssetLedger;
use crate::oracle::PriceOracle;
use crate::registry::RiskRegistry;
use crate::share_market::ShareMarket;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Wrap an already-computed value as a `BoxFuture`.
pub(crate) fn ready<'a, T: Send + 'a>(value: T) -> BoxFuture<'a, T> {
    Box::pin(std::future::ready(value))
}

/// One handle per collaborator role.
///
/// Constructed once and shared by reference; each role may be served by a
/// different backend.
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn AssetLedger>,
    pub share_market: Arc<dyn ShareMarket>,
    pub registry: Arc<dyn RiskRegistry>,
    pub oracle: Arc<dyn PriceOracle>,
}

impl Collaborators {
    pub fn new(
        ledger: Arc<dyn AssetLedger>,
        share_market: Arc<dyn ShareMarket>,
        registry: Arc<dyn RiskRegistry>,
        oracle: Arc<dyn PriceOracle>,
    ) -> Self {
        Self {
            ledger,
            share_market,
            registry,
            oracle,
        }
    }

    /// Use one backend for every role.
    pub fn from_backend<P>(backend: Arc<P>) -> Self
    where
        P: AssetLedger + ShareMarket + RiskRegistry + PriceOracle + 'static,
    {
        Self {
            ledger: backend.clone(),
            share_market: backend.clone(),
            registry: backend.clone(),
            oracle: backend,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
