//! Compensation journal for multi-step operations.
//!
//! Each externally visible step that succeeds pushes the action that undoes
//! it. On failure the journal is unwound newest-first; on success it is
//! committed and the recorded actions are discarded.
//!
//! Compensation is best effort: a failing compensating action is logged and
//! counted, the remaining actions still run, and the caller reports the
//! error that triggered the unwind.

use mmpos_core::{Address, StatusCode, U256};
use mmpos_protocol::Collaborators;
use mmpos_telemetry::Metrics;
use tracing::{debug, error, warn};

/// An action that reverses one completed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// Set the custody account's approval of `spender` back to zero.
    ResetApproval { token: Address, spender: Address },
    /// Return `amount` of `token` from custody to `to`.
    Refund {
        token: Address,
        to: Address,
        amount: U256,
    },
    /// Re-mint `amount` of underlying into `share_market`.
    Resupply {
        token: Address,
        share_market: Address,
        amount: U256,
    },
}

impl Compensation {
    fn label(&self) -> &'static str {
        match self {
            Compensation::ResetApproval { .. } => "reset_approval",
            Compensation::Refund { .. } => "refund",
            Compensation::Resupply { .. } => "resupply",
        }
    }
}

/// Undo log for one operation, acting from `account`'s custody.
#[derive(Debug)]
pub struct Journal<'a> {
    op: &'static str,
    account: Address,
    collaborators: &'a Collaborators,
    steps: Vec<Compensation>,
}

impl<'a> Journal<'a> {
    pub fn new(op: &'static str, account: Address, collaborators: &'a Collaborators) -> Self {
        Self {
            op,
            account,
            collaborators,
            steps: Vec::new(),
        }
    }

    pub fn record(&mut self, step: Compensation) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Discard all compensations; the operation is complete.
    pub fn commit(self) {
        debug!(op = self.op, steps = self.steps.len(), "Journal committed");
    }

    /// Run every recorded compensation, newest first.
    ///
    /// Returns the number of compensations that failed.
    pub async fn unwind(self) -> usize {
        if self.is_empty() {
            return 0;
        }
        let mut failures = 0;
        warn!(op = self.op, steps = self.steps.len(), "Unwinding partial operation");

        for step in self.steps.iter().rev() {
            match self.apply(step).await {
                Ok(()) => {
                    debug!(op = self.op, action = step.label(), "Compensation applied");
                    Metrics::compensation(step.label(), true);
                }
                Err(reason) => {
                    failures += 1;
                    error!(
                        op = self.op,
                        action = step.label(),
                        ?step,
                        %reason,
                        "Compensation failed, custody may be inconsistent"
                    );
                    Metrics::compensation(step.label(), false);
                }
            }
        }

        failures
    }

    async fn apply(&self, step: &Compensation) -> Result<(), String> {
        let c = self.collaborators;
        match *step {
            Compensation::ResetApproval { token, spender } => c
                .ledger
                .approve(token, self.account, spender, U256::ZERO)
                .await
                .map_err(|e| e.to_string()),
            Compensation::Refund { token, to, amount } => {
                match c.ledger.transfer(token, self.account, to, amount).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err("refund transfer rejected".to_string()),
                    Err(e) => Err(e.to_string()),
                }
            }
            Compensation::Resupply {
                token,
                share_market,
                amount,
            } => {
                c.ledger
                    .approve(token, self.account, share_market, amount)
                    .await
                    .map_err(|e| e.to_string())?;
                let status = c
                    .share_market
                    .mint(share_market, self.account, amount)
                    .await
                    .map_err(|e| e.to_string());
                let reset = c
                    .ledger
                    .approve(token, self.account, share_market, U256::ZERO)
                    .await;
                match status? {
                    StatusCode::OK => reset.map_err(|e| e.to_string()),
                    code => Err(format!("resupply mint returned status {code}")),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mmpos_core::fixed::MANTISSA_ONE;
    use mmpos_core::Market;
    use mmpos_protocol::{SimCall, SimMarketConfig, SimulatedProtocol};
    use std::sync::Arc;

    fn setup() -> (Arc<SimulatedProtocol>, Collaborators, Market, Address) {
        let sim = Arc::new(SimulatedProtocol::new());
        let market = Market::new(Address::repeat_byte(0xaa), Address::repeat_byte(0xca), 18, 18)
            .unwrap()
            .with_symbol("TKN");
        sim.list_market(&market, SimMarketConfig::default());
        let collaborators = Collaborators::from_backend(sim.clone());
        (sim, collaborators, market, Address::repeat_byte(0x77))
    }

    #[tokio::test]
    async fn test_unwind_runs_newest_first() {
        let (sim, collaborators, market, account) = setup();
        let caller = Address::repeat_byte(0x01);
        sim.fund(market.underlying(), account, MANTISSA_ONE);
        sim.set_allowance(market.underlying(), account, market.share_market(), MANTISSA_ONE);

        let mut journal = Journal::new("test", account, &collaborators);
        journal.record(Compensation::Refund {
            token: market.underlying(),
            to: caller,
            amount: MANTISSA_ONE,
        });
        journal.record(Compensation::ResetApproval {
            token: market.underlying(),
            spender: market.share_market(),
        });
        assert_eq!(journal.len(), 2);

        let failures = journal.unwind().await;
        assert_eq!(failures, 0);

        let calls = sim.calls();
        assert!(matches!(calls[0], SimCall::Approve { amount, .. } if amount.is_zero()));
        assert!(matches!(calls[1], SimCall::Transfer { accepted: true, .. }));
        assert_eq!(sim.balance(market.underlying(), caller), MANTISSA_ONE);
        assert_eq!(
            sim.allowance_of(market.underlying(), account, market.share_market()),
            U256::ZERO
        );
    }

    #[tokio::test]
    async fn test_unwind_continues_after_failure() {
        let (sim, collaborators, market, account) = setup();
        sim.reject_transfers(true);

        let mut journal = Journal::new("test", account, &collaborators);
        journal.record(Compensation::Refund {
            token: market.underlying(),
            to: Address::repeat_byte(0x01),
            amount: MANTISSA_ONE,
        });
        journal.record(Compensation::ResetApproval {
            token: market.underlying(),
            spender: market.share_market(),
        });

        assert_eq!(journal.unwind().await, 1);
        assert_eq!(sim.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_resupply_mints_and_clears_approval() {
        let (sim, collaborators, market, account) = setup();
        sim.fund(market.underlying(), account, MANTISSA_ONE);

        let mut journal = Journal::new("test", account, &collaborators);
        journal.record(Compensation::Resupply {
            token: market.underlying(),
            share_market: market.share_market(),
            amount: MANTISSA_ONE,
        });
        assert_eq!(journal.unwind().await, 0);

        assert_eq!(sim.shares(market.share_market(), account), MANTISSA_ONE);
        assert_eq!(sim.balance(market.underlying(), account), U256::ZERO);
        assert_eq!(
            sim.allowance_of(market.underlying(), account, market.share_market()),
            U256::ZERO
        );
    }

    #[tokio::test]
    async fn test_empty_unwind_is_a_no_op() {
        let (sim, collaborators, _market, account) = setup();
        let journal = Journal::new("test", account, &collaborators);
        assert!(journal.is_empty());
        assert_eq!(journal.unwind().await, 0);
        assert!(sim.calls().is_empty());
    }

    #[tokio::test]
    async fn test_commit_runs_nothing() {
        let (sim, collaborators, market, account) = setup();
        let mut journal = Journal::new("test", account, &collaborators);
        journal.record(Compensation::ResetApproval {
            token: market.underlying(),
            spender: market.share_market(),
        });
        journal.commit();
        assert!(sim.calls().is_empty());
    }
}
