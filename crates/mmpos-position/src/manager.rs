//! Position manager.
//!
//! Orchestrates supply, redeem, enter-and-borrow and repay against the four
//! collaborators, holding funds in the custody of a single `account`.
//!
//! # Atomicity
//!
//! Every mutating operation holds the position lock for its full duration.
//! External calls run first and local bookkeeping is committed only after
//! every external step has been confirmed. Collateral entry is the one step
//! that cannot be undone, so it is recorded as soon as the registry confirms
//! it. Completed external steps are
//! recorded in a [`Journal`] and unwound newest-first when a later step
//! fails, so a failed operation leaves custody balances and approvals as
//! they were.
//!
//! # Custody
//!
//! Supplied underlying is pulled from the caller (who must have approved
//! `account`), minted from `account`, and redeemed back to the caller.
//! Borrowed underlying stays in `account`'s custody until
//! [`PositionManager::withdraw_borrowed`] forwards it.

use std::time::Instant;

use mmpos_core::fixed;
use mmpos_core::{Address, FractionBps, LiquiditySnapshot, Market, Position, U256};
use mmpos_protocol::{AccountLiquidity, Collaborators, MarketInfo, ProtocolError, ProtocolResult};
use mmpos_telemetry::Metrics;
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{PositionError, PositionResult};
use crate::journal::{Compensation, Journal};

/// Outcome of a successful enter-and-borrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BorrowReceipt {
    /// Liquidity snapshot the borrow was sized against.
    pub snapshot: LiquiditySnapshot,
    /// Oracle price of the borrowed underlying (1e18 reference per whole unit).
    pub price: U256,
    /// Borrow limit before the fraction was applied.
    pub max_borrow: U256,
    /// Amount actually borrowed.
    pub borrowed: U256,
}

/// Single-account position manager.
#[derive(Debug)]
pub struct PositionManager {
    account: Address,
    collaborators: Collaborators,
    position: Mutex<Position>,
}

impl PositionManager {
    /// Create a manager acting as `account` with an empty position.
    pub fn new(account: Address, collaborators: Collaborators) -> Self {
        Self {
            account,
            collaborators,
            position: Mutex::new(Position::new()),
        }
    }

    /// Custody account all protocol calls are made from.
    pub fn account(&self) -> Address {
        self.account
    }

    // ========================================================================
    // Mutating operations
    // ========================================================================

    /// Deposit `amount` of the market's underlying from `caller` and mint shares.
    ///
    /// Returns the shares minted, measured as the custody share-balance delta.
    pub async fn supply(
        &self,
        caller: Address,
        market: &Market,
        amount: U256,
    ) -> PositionResult<U256> {
        let started = Instant::now();
        info!(%caller, %market, %amount, "Supply requested");
        let result = self.supply_inner(caller, market, amount).await;
        observe("supply", started, &result);
        result
    }

    /// Redeem `share_amount` shares and forward the underlying to `caller`.
    ///
    /// Returns the underlying received. The account's liquidity is not
    /// re-checked; see [`PositionManager::post_redeem_liquidity`].
    pub async fn redeem(
        &self,
        caller: Address,
        market: &Market,
        share_amount: U256,
    ) -> PositionResult<U256> {
        let started = Instant::now();
        info!(%caller, %market, %share_amount, "Redeem requested");
        let result = self.redeem_inner(caller, market, share_amount).await;
        observe("redeem", started, &result);
        result
    }

    /// Enter `market` as collateral and borrow `fraction_bps` of the
    /// computed limit from the same market.
    ///
    /// `borrow_decimals` is the decimal count the limit is denominated in.
    pub async fn enter_and_borrow(
        &self,
        caller: Address,
        market: &Market,
        borrow_decimals: u8,
        fraction_bps: u16,
    ) -> PositionResult<BorrowReceipt> {
        let started = Instant::now();
        info!(%caller, %market, borrow_decimals, fraction_bps, "Enter and borrow requested");
        let result = self
            .enter_and_borrow_inner(market, market, borrow_decimals, fraction_bps)
            .await;
        observe("enter_and_borrow", started, &result);
        result
    }

    /// Enter `collateral` and borrow from `borrow_market`, sized against the
    /// borrowed asset's price and decimals.
    pub async fn enter_and_borrow_from(
        &self,
        caller: Address,
        collateral: &Market,
        borrow_market: &Market,
        fraction_bps: u16,
    ) -> PositionResult<BorrowReceipt> {
        let started = Instant::now();
        info!(
            %caller,
            %collateral,
            %borrow_market,
            fraction_bps,
            "Enter and borrow (cross-market) requested"
        );
        let result = self
            .enter_and_borrow_inner(
                collateral,
                borrow_market,
                borrow_market.underlying_decimals(),
                fraction_bps,
            )
            .await;
        observe("enter_and_borrow", started, &result);
        result
    }

    /// Repay `amount` of the borrow in `market` from custody.
    ///
    /// Returns the locally recorded principal remaining.
    pub async fn repay(
        &self,
        caller: Address,
        market: &Market,
        amount: U256,
    ) -> PositionResult<U256> {
        let started = Instant::now();
        info!(%caller, %market, %amount, "Repay requested");
        let result = self.repay_inner(None, market, amount).await;
        observe("repay", started, &result);
        result
    }

    /// Pull `amount` from `caller` into custody, then repay it.
    pub async fn fund_and_repay(
        &self,
        caller: Address,
        market: &Market,
        amount: U256,
    ) -> PositionResult<U256> {
        let started = Instant::now();
        info!(%caller, %market, %amount, "Fund and repay requested");
        let result = self.repay_inner(Some(caller), market, amount).await;
        observe("fund_and_repay", started, &result);
        result
    }

    /// Forward `amount` of the market's underlying from custody to `caller`.
    pub async fn withdraw_borrowed(
        &self,
        caller: Address,
        market: &Market,
        amount: U256,
    ) -> PositionResult<()> {
        let started = Instant::now();
        info!(%caller, %market, %amount, "Withdraw requested");
        let result = self.withdraw_inner(caller, market, amount).await;
        observe("withdraw_borrowed", started, &result);
        result
    }

    /// Replace the recorded share balances of `markets` with the custody
    /// account's balances on the share markets.
    ///
    /// A new manager starts empty; syncing makes shares supplied by an
    /// earlier process redeemable.
    pub async fn sync(&self, markets: &[Market]) -> PositionResult<()> {
        let mut position = self.position.lock().await;
        for market in markets {
            self.sync_market(&mut position, market).await?;
        }
        info!(markets = markets.len(), "Position synced from share markets");
        Ok(())
    }

    // ========================================================================
    // Read-only accessors
    // ========================================================================

    /// Custody share balance, read from the share market.
    pub async fn share_balance(&self, market: &Market) -> PositionResult<U256> {
        Ok(self
            .collaborators
            .share_market
            .balance_of(market.share_market(), self.account)
            .await?)
    }

    /// `(exchange_rate, supply_rate_per_block)`, both 1e18 mantissas.
    pub async fn exchange_rate_and_supply_rate(
        &self,
        market: &Market,
    ) -> PositionResult<(U256, U256)> {
        let share_market = &self.collaborators.share_market;
        let rate = share_market.exchange_rate(market.share_market()).await?;
        let supply_rate = share_market.supply_rate(market.share_market()).await?;
        Ok((rate, supply_rate))
    }

    /// Estimated underlying value of the custody share balance.
    pub async fn estimate_underlying_balance(&self, market: &Market) -> PositionResult<U256> {
        let shares = self.share_balance(market).await?;
        let rate = self
            .collaborators
            .share_market
            .exchange_rate(market.share_market())
            .await?;
        Ok(fixed::estimate_underlying(
            shares,
            rate,
            market.underlying_decimals(),
            market.share_decimals(),
        )?)
    }

    /// Listing status and collateral factor mantissa.
    pub async fn collateral_factor(&self, market: &Market) -> PositionResult<MarketInfo> {
        Ok(self
            .collaborators
            .registry
            .market_info(market.share_market())
            .await?)
    }

    /// Outstanding borrow including accrued interest, read fresh.
    pub async fn borrow_balance(&self, market: &Market) -> PositionResult<U256> {
        Ok(self
            .collaborators
            .share_market
            .borrow_balance(market.share_market(), self.account)
            .await?)
    }

    /// Current account liquidity as reported by the registry.
    pub async fn account_liquidity(&self) -> PositionResult<LiquiditySnapshot> {
        self.query_liquidity().await
    }

    /// Oracle price of the market's underlying. Zero is reported as unavailable.
    pub async fn underlying_price(&self, market: &Market) -> PositionResult<U256> {
        self.query_price(market).await
    }

    /// Copy of the local bookkeeping.
    pub async fn position(&self) -> Position {
        self.position.lock().await.clone()
    }

    /// Liquidity the account would have after redeeming `share_amount` shares.
    ///
    /// Informational only; nothing is sent. Shares of a market that is not
    /// entered as collateral do not back borrowing, so redeeming them leaves
    /// liquidity unchanged.
    pub async fn post_redeem_liquidity(
        &self,
        market: &Market,
        share_amount: U256,
    ) -> PositionResult<LiquiditySnapshot> {
        let current = self.query_liquidity().await?;
        if !self.position.lock().await.is_entered(&market.share_market()) {
            return Ok(current);
        }

        let info = self.collateral_factor(market).await?;
        let price = self.query_price(market).await?;
        let rate = self
            .collaborators
            .share_market
            .exchange_rate(market.share_market())
            .await?;

        let underlying = fixed::shares_to_underlying(share_amount, rate)?;
        let value = fixed::reference_value(underlying, price, market.underlying_decimals())?;
        let weighted = fixed::mul_mantissa(value, info.collateral_factor)?;

        let projected = if current.liquidity() >= weighted {
            LiquiditySnapshot::with_liquidity(current.liquidity() - weighted)
        } else {
            let extra = weighted - current.liquidity();
            let shortfall = current
                .shortfall()
                .checked_add(extra)
                .ok_or_else(|| PositionError::ArithmeticOverflow("post-redeem shortfall".into()))?;
            LiquiditySnapshot::with_shortfall(shortfall)
        };
        debug!(
            %market,
            %share_amount,
            %weighted,
            liquidity = %projected.liquidity(),
            shortfall = %projected.shortfall(),
            "Projected post-redeem liquidity"
        );
        Ok(projected)
    }

    // ========================================================================
    // Operation bodies
    // ========================================================================

    async fn supply_inner(
        &self,
        caller: Address,
        market: &Market,
        amount: U256,
    ) -> PositionResult<U256> {
        require_nonzero(amount, "supply amount")?;
        let mut position = self.position.lock().await;
        let c = &self.collaborators;
        let token = market.underlying();
        let share_market = market.share_market();

        let shares_before = c.share_market.balance_of(share_market, self.account).await?;

        let mut journal = Journal::new("supply", self.account, c);

        transfer_outcome(
            c.ledger
                .transfer_from(token, self.account, caller, self.account, amount)
                .await,
            "pull from caller",
        )?;
        journal.record(Compensation::Refund {
            token,
            to: caller,
            amount,
        });

        if let Err(e) = c
            .ledger
            .approve(token, self.account, share_market, amount)
            .await
        {
            journal.unwind().await;
            return Err(e.into());
        }
        journal.record(Compensation::ResetApproval {
            token,
            spender: share_market,
        });

        match c.share_market.mint(share_market, self.account, amount).await {
            Ok(status) if status.is_ok() => {}
            Ok(code) => {
                journal.unwind().await;
                return Err(PositionError::MintFailed { code });
            }
            Err(e) => {
                journal.unwind().await;
                return Err(e.into());
            }
        }
        journal.commit();

        self.clear_leftover_approval(token, share_market).await;

        let minted = match c.share_market.balance_of(share_market, self.account).await {
            Ok(shares_after) => {
                let minted = shares_after.checked_sub(shares_before).ok_or_else(|| {
                    PositionError::Protocol(ProtocolError::Malformed(format!(
                        "share balance fell from {shares_before} to {shares_after} across mint"
                    )))
                })?;
                position.credit_shares(share_market, minted)?;
                let held = position.supplied_shares(&share_market);
                Metrics::supplied_shares(&market.to_string(), shares_f64(market, held));
                minted
            }
            Err(e) => {
                // The mint stands; take the record from the share market instead.
                warn!(%market, error = %e, "Share read-back failed after mint, re-syncing");
                let held = self.sync_market(&mut position, market).await?;
                held.saturating_sub(shares_before)
            }
        };

        info!(
            %market,
            %amount,
            %minted,
            held = %position.supplied_shares(&share_market),
            "Supply complete"
        );
        Ok(minted)
    }

    async fn redeem_inner(
        &self,
        caller: Address,
        market: &Market,
        share_amount: U256,
    ) -> PositionResult<U256> {
        require_nonzero(share_amount, "redeem share amount")?;
        let mut position = self.position.lock().await;
        let c = &self.collaborators;
        let token = market.underlying();
        let share_market = market.share_market();

        let held = position.supplied_shares(&share_market);
        if share_amount > held {
            return Err(PositionError::InsufficientShares {
                market: share_market,
                requested: share_amount,
                held,
            });
        }

        let custody_before = c.ledger.balance_of(token, self.account).await?;

        let code = c
            .share_market
            .redeem(share_market, self.account, share_amount)
            .await?;
        if !code.is_ok() {
            return Err(PositionError::RedeemFailed { code });
        }

        let custody_after = c.ledger.balance_of(token, self.account).await?;
        let received = custody_after.saturating_sub(custody_before);

        if !received.is_zero() {
            let mut journal = Journal::new("redeem", self.account, c);
            journal.record(Compensation::Resupply {
                token,
                share_market,
                amount: received,
            });
            if let Err(e) = transfer_outcome(
                c.ledger
                    .transfer(token, self.account, caller, received)
                    .await,
                "forward to caller",
            ) {
                journal.unwind().await;
                return Err(e);
            }
            journal.commit();
        }

        position.debit_shares(share_market, share_amount)?;
        let remaining = position.supplied_shares(&share_market);
        Metrics::supplied_shares(&market.to_string(), shares_f64(market, remaining));
        info!(%market, %share_amount, %received, %remaining, "Redeem complete");
        Ok(received)
    }

    async fn enter_and_borrow_inner(
        &self,
        collateral: &Market,
        borrow_market: &Market,
        borrow_decimals: u8,
        fraction_bps: u16,
    ) -> PositionResult<BorrowReceipt> {
        let fraction = FractionBps::new(fraction_bps)?;
        let mut position = self.position.lock().await;
        let c = &self.collaborators;
        let collateral_market = collateral.share_market();

        let statuses = c
            .registry
            .enter_markets(self.account, vec![collateral_market])
            .await?;
        match statuses.first() {
            Some(code) if code.is_ok() => {}
            Some(&code) => {
                return Err(PositionError::MarketEntryFailed {
                    market: collateral_market,
                    code,
                })
            }
            None => {
                return Err(PositionError::Protocol(ProtocolError::Malformed(
                    "enterMarkets returned no status".to_string(),
                )))
            }
        }
        // The registry has flagged the market; record it now so the local
        // collateral set matches even if the borrow below fails.
        position.mark_entered(collateral_market);
        debug!(market = %collateral, "Collateral market entered");

        // Shortfall wins over any reported liquidity, so it is checked on the
        // raw response before the exclusivity check in `LiquiditySnapshot`.
        let raw = self.fetch_liquidity().await?;
        if !raw.shortfall.is_zero() {
            return Err(PositionError::InsufficientCollateral {
                shortfall: raw.shortfall,
            });
        }
        let snapshot = LiquiditySnapshot::with_liquidity(raw.liquidity);
        if !snapshot.has_liquidity() {
            return Err(PositionError::NoLiquidity);
        }

        let price = self.query_price(borrow_market).await?;
        let max_borrow = fixed::max_borrow(snapshot.liquidity(), price, borrow_decimals)?;
        if max_borrow.is_zero() {
            return Err(PositionError::ZeroMaxBorrow);
        }
        let amount = fixed::apply_fraction(max_borrow, fraction)?;
        if amount.is_zero() {
            return Err(PositionError::ZeroMaxBorrow);
        }
        debug!(
            liquidity = %snapshot.liquidity(),
            %price,
            %max_borrow,
            %fraction,
            %amount,
            "Borrow sized"
        );

        let code = c
            .share_market
            .borrow(borrow_market.share_market(), self.account, amount)
            .await?;
        if !code.is_ok() {
            return Err(PositionError::BorrowFailed { code });
        }

        position.record_borrow(borrow_market.share_market(), amount)?;
        let recorded = position.recorded_borrow(&borrow_market.share_market());
        Metrics::recorded_borrow(
            &borrow_market.to_string(),
            amount_f64(recorded, borrow_market.underlying_decimals()),
        );
        info!(
            collateral = %collateral,
            borrow_market = %borrow_market,
            %amount,
            %recorded,
            "Borrow complete"
        );

        Ok(BorrowReceipt {
            snapshot,
            price,
            max_borrow,
            borrowed: amount,
        })
    }

    async fn repay_inner(
        &self,
        fund_from: Option<Address>,
        market: &Market,
        amount: U256,
    ) -> PositionResult<U256> {
        require_nonzero(amount, "repay amount")?;
        let mut position = self.position.lock().await;
        let c = &self.collaborators;
        let token = market.underlying();
        let share_market = market.share_market();

        let mut journal = Journal::new("repay", self.account, c);

        if let Some(caller) = fund_from {
            transfer_outcome(
                c.ledger
                    .transfer_from(token, self.account, caller, self.account, amount)
                    .await,
                "pull from caller",
            )?;
            journal.record(Compensation::Refund {
                token,
                to: caller,
                amount,
            });
        }

        if let Err(e) = c
            .ledger
            .approve(token, self.account, share_market, amount)
            .await
        {
            journal.unwind().await;
            return Err(e.into());
        }
        journal.record(Compensation::ResetApproval {
            token,
            spender: share_market,
        });

        match c
            .share_market
            .repay_borrow(share_market, self.account, amount)
            .await
        {
            Ok(status) if status.is_ok() => {}
            Ok(code) => {
                journal.unwind().await;
                return Err(PositionError::RepayFailed { code });
            }
            Err(e) => {
                journal.unwind().await;
                return Err(e.into());
            }
        }
        journal.commit();

        self.clear_leftover_approval(token, share_market).await;

        let remaining = position.record_repay(share_market, amount);
        Metrics::recorded_borrow(
            &market.to_string(),
            amount_f64(remaining, market.underlying_decimals()),
        );
        info!(%market, %amount, %remaining, "Repay complete");
        Ok(remaining)
    }

    async fn withdraw_inner(
        &self,
        caller: Address,
        market: &Market,
        amount: U256,
    ) -> PositionResult<()> {
        require_nonzero(amount, "withdraw amount")?;
        let _position = self.position.lock().await;
        transfer_outcome(
            self.collaborators
                .ledger
                .transfer(market.underlying(), self.account, caller, amount)
                .await,
            "withdraw to caller",
        )?;
        info!(%market, %amount, %caller, "Withdraw complete");
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Registry liquidity with a successful status, not yet validated.
    async fn fetch_liquidity(&self) -> PositionResult<AccountLiquidity> {
        let raw = self
            .collaborators
            .registry
            .account_liquidity(self.account)
            .await?;
        if !raw.status.is_ok() {
            return Err(PositionError::LiquidityQueryFailed(format!(
                "registry returned status {}",
                raw.status
            )));
        }
        Metrics::account_liquidity(
            amount_f64(raw.liquidity, fixed::MANTISSA_DECIMALS),
            amount_f64(raw.shortfall, fixed::MANTISSA_DECIMALS),
        );
        Ok(raw)
    }

    async fn query_liquidity(&self) -> PositionResult<LiquiditySnapshot> {
        self.fetch_liquidity()
            .await?
            .into_snapshot()
            .map_err(|e| PositionError::LiquidityQueryFailed(e.to_string()))
    }

    async fn sync_market(&self, position: &mut Position, market: &Market) -> PositionResult<U256> {
        let held = self.share_balance(market).await?;
        position.set_supplied_shares(market.share_market(), held);
        Metrics::supplied_shares(&market.to_string(), shares_f64(market, held));
        debug!(%market, %held, "Recorded shares synced");
        Ok(held)
    }

    async fn query_price(&self, market: &Market) -> PositionResult<U256> {
        let price = self
            .collaborators
            .oracle
            .underlying_price(market.share_market())
            .await?;
        if price.is_zero() {
            return Err(PositionError::PriceUnavailable(market.share_market()));
        }
        Ok(price)
    }

    /// Zero any approval the share market left unconsumed.
    ///
    /// Runs after the protocol step succeeded, so a failure here is logged
    /// rather than failing the operation.
    async fn clear_leftover_approval(&self, token: Address, spender: Address) {
        let ledger = &self.collaborators.ledger;
        let leftover = match ledger.allowance(token, self.account, spender).await {
            Ok(leftover) => leftover,
            Err(e) => {
                warn!(%token, %spender, error = %e, "Could not read leftover approval");
                return;
            }
        };
        if leftover.is_zero() {
            return;
        }
        debug!(%token, %spender, %leftover, "Resetting unconsumed approval");
        if let Err(e) = ledger.approve(token, self.account, spender, U256::ZERO).await {
            warn!(%token, %spender, error = %e, "Could not reset leftover approval");
        }
    }
}

fn require_nonzero(amount: U256, what: &str) -> PositionResult<()> {
    if amount.is_zero() {
        return Err(PositionError::InvalidAmount(format!("{what} must be positive")));
    }
    Ok(())
}

/// A rejected or reverted transfer is `TransferFailed`; transport errors pass through.
fn transfer_outcome(result: ProtocolResult<bool>, what: &str) -> PositionResult<()> {
    match result {
        Ok(true) => Ok(()),
        Ok(false) => Err(PositionError::TransferFailed(format!("{what}: rejected"))),
        Err(ProtocolError::Reverted(reason)) => {
            Err(PositionError::TransferFailed(format!("{what}: {reason}")))
        }
        Err(e) => Err(e.into()),
    }
}

fn observe<T>(op: &'static str, started: Instant, result: &PositionResult<T>) {
    let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
    match result {
        Ok(_) => Metrics::operation_ok(op, elapsed_ms),
        Err(e) => {
            warn!(op, kind = e.kind(), error = %e, "Operation failed");
            Metrics::operation_failed(op, e.kind(), elapsed_ms);
        }
    }
}

fn amount_f64(amount: U256, decimals: u8) -> f64 {
    fixed::to_decimal(amount, decimals)
        .ok()
        .and_then(|d| d.to_f64())
        .unwrap_or(f64::NAN)
}

fn shares_f64(market: &Market, shares: U256) -> f64 {
    amount_f64(shares, market.share_decimals())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mmpos_core::fixed::MANTISSA_ONE;
    use mmpos_protocol::{SimCall, SimMarketConfig, SimOp, SimulatedProtocol};
    use std::sync::Arc;

    fn e18(n: u64) -> U256 {
        U256::from(n) * MANTISSA_ONE
    }

    struct Fixture {
        sim: Arc<SimulatedProtocol>,
        manager: PositionManager,
        market: Market,
        caller: Address,
    }

    impl Fixture {
        fn custody(&self) -> U256 {
            self.sim
                .balance(self.market.underlying(), self.manager.account())
        }

        fn caller_balance(&self) -> U256 {
            self.sim.balance(self.market.underlying(), self.caller)
        }

        fn market_allowance(&self) -> U256 {
            self.sim.allowance_of(
                self.market.underlying(),
                self.manager.account(),
                self.market.share_market(),
            )
        }
    }

    fn fixture_with(config: SimMarketConfig) -> Fixture {
        let sim = Arc::new(SimulatedProtocol::new());
        let market = Market::new(Address::repeat_byte(0xda), Address::repeat_byte(0xcd), 18, 18)
            .unwrap()
            .with_symbol("cDAI");
        let caller = Address::repeat_byte(0x01);
        let account = Address::repeat_byte(0x42);

        sim.list_market(&market, config);
        sim.fund(market.underlying(), caller, e18(10_000));
        sim.fund(market.underlying(), market.share_market(), e18(5_000));
        sim.set_allowance(market.underlying(), caller, account, U256::MAX);

        let manager = PositionManager::new(account, Collaborators::from_backend(sim.clone()));
        Fixture {
            sim,
            manager,
            market,
            caller,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SimMarketConfig::default())
    }

    async fn supplied(f: &Fixture, amount: U256) {
        f.manager.supply(f.caller, &f.market, amount).await.unwrap();
    }

    // === supply ===

    #[tokio::test]
    async fn test_supply_credits_minted_shares() {
        let f = fixture();
        let minted = f.manager.supply(f.caller, &f.market, e18(1_000)).await.unwrap();

        assert_eq!(minted, e18(1_000));
        let position = f.manager.position().await;
        assert_eq!(position.supplied_shares(&f.market.share_market()), e18(1_000));
        assert_eq!(f.custody(), U256::ZERO);
        assert_eq!(f.market_allowance(), U256::ZERO);
        assert_eq!(f.caller_balance(), e18(9_000));
    }

    #[tokio::test]
    async fn test_supply_uses_share_delta_not_amount() {
        let f = fixture_with(SimMarketConfig {
            exchange_rate: U256::from(4u8) * MANTISSA_ONE,
            ..SimMarketConfig::default()
        });
        let minted = f.manager.supply(f.caller, &f.market, e18(1_000)).await.unwrap();
        assert_eq!(minted, e18(250));
    }

    #[tokio::test]
    async fn test_supply_rejects_zero() {
        let f = fixture();
        let err = f
            .manager
            .supply(f.caller, &f.market, U256::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, PositionError::InvalidAmount(_)));
        assert!(f.sim.calls().is_empty());
    }

    #[tokio::test]
    async fn test_supply_mint_status_restores_caller() {
        let f = fixture();
        f.sim.fail_next_status(SimOp::Mint, 1);

        let err = f
            .manager
            .supply(f.caller, &f.market, e18(1_000))
            .await
            .unwrap_err();

        assert!(matches!(err, PositionError::MintFailed { code } if code.code() == 1));
        assert_eq!(f.caller_balance(), e18(10_000));
        assert_eq!(f.custody(), U256::ZERO);
        assert_eq!(f.market_allowance(), U256::ZERO);
        assert!(f.manager.position().await.is_empty());
    }

    #[tokio::test]
    async fn test_supply_mint_transport_error_restores_caller() {
        let f = fixture();
        f.sim.fail_next_transport(SimOp::Mint);

        let err = f
            .manager
            .supply(f.caller, &f.market, e18(10))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "protocol");
        assert_eq!(f.caller_balance(), e18(10_000));
        assert_eq!(f.market_allowance(), U256::ZERO);
    }

    #[tokio::test]
    async fn test_supply_rejected_pull() {
        let f = fixture();
        f.sim.reject_transfers(true);

        let err = f
            .manager
            .supply(f.caller, &f.market, e18(1))
            .await
            .unwrap_err();

        assert!(matches!(err, PositionError::TransferFailed(_)));
        assert_eq!(f.caller_balance(), e18(10_000));
        assert!(f
            .sim
            .calls()
            .iter()
            .all(|call| !matches!(call, SimCall::Mint { .. })));
    }

    // === redeem ===

    #[tokio::test]
    async fn test_redeem_debits_exact_shares() {
        let f = fixture();
        supplied(&f, e18(1_000)).await;
        // 1.5 underlying per share.
        f.sim.set_exchange_rate(
            f.market.share_market(),
            U256::from(15u8) * MANTISSA_ONE / U256::from(10u8),
        );

        let received = f.manager.redeem(f.caller, &f.market, e18(400)).await.unwrap();

        assert_eq!(received, e18(600));
        let position = f.manager.position().await;
        assert_eq!(position.supplied_shares(&f.market.share_market()), e18(600));
        assert_eq!(f.caller_balance(), e18(9_600));
        assert_eq!(f.custody(), U256::ZERO);
    }

    #[tokio::test]
    async fn test_redeem_more_than_held() {
        let f = fixture();
        supplied(&f, e18(10)).await;

        let err = f
            .manager
            .redeem(f.caller, &f.market, e18(11))
            .await
            .unwrap_err();
        assert!(matches!(err, PositionError::InsufficientShares { .. }));

        let err = f
            .manager
            .redeem(f.caller, &f.market, U256::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, PositionError::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn test_redeem_status_failure_keeps_shares() {
        let f = fixture();
        supplied(&f, e18(10)).await;
        f.sim.fail_next_status(SimOp::Redeem, 14);

        let err = f
            .manager
            .redeem(f.caller, &f.market, e18(5))
            .await
            .unwrap_err();

        assert!(matches!(err, PositionError::RedeemFailed { code } if code.code() == 14));
        let position = f.manager.position().await;
        assert_eq!(position.supplied_shares(&f.market.share_market()), e18(10));
    }

    #[tokio::test]
    async fn test_redeem_forward_failure_resupplies() {
        let f = fixture();
        supplied(&f, e18(100)).await;
        f.sim.reject_transfers(true);

        let err = f
            .manager
            .redeem(f.caller, &f.market, e18(40))
            .await
            .unwrap_err();

        assert!(matches!(err, PositionError::TransferFailed(_)));
        assert_eq!(
            f.sim.shares(f.market.share_market(), f.manager.account()),
            e18(100)
        );
        let position = f.manager.position().await;
        assert_eq!(position.supplied_shares(&f.market.share_market()), e18(100));
        assert_eq!(f.custody(), U256::ZERO);
        assert_eq!(f.market_allowance(), U256::ZERO);
    }

    // === enter_and_borrow ===

    #[tokio::test]
    async fn test_borrow_full_and_half_fraction() {
        let f = fixture();
        supplied(&f, e18(1_000)).await;

        // 1000 supplied at a 75% collateral factor and unit price.
        let receipt = f
            .manager
            .enter_and_borrow(f.caller, &f.market, 18, 5_000)
            .await
            .unwrap();
        assert_eq!(receipt.snapshot.liquidity(), e18(750));
        assert_eq!(receipt.max_borrow, e18(750));
        assert_eq!(receipt.borrowed, e18(375));

        let receipt = f
            .manager
            .enter_and_borrow(f.caller, &f.market, 18, 10_000)
            .await
            .unwrap();
        assert_eq!(receipt.max_borrow, e18(375));
        assert_eq!(receipt.borrowed, e18(375));

        let position = f.manager.position().await;
        assert!(position.is_entered(&f.market.share_market()));
        assert_eq!(position.recorded_borrow(&f.market.share_market()), e18(750));
        assert_eq!(f.custody(), e18(750));
    }

    #[tokio::test]
    async fn test_borrow_rejects_shortfall_for_any_liquidity() {
        let f = fixture();
        supplied(&f, e18(1_000)).await;

        for liquidity in [U256::ZERO, e18(500)] {
            f.sim.force_liquidity(Some((liquidity, U256::from(1u8))));
            let err = f
                .manager
                .enter_and_borrow(f.caller, &f.market, 18, 5_000)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                PositionError::InsufficientCollateral { shortfall } if shortfall == U256::from(1u8)
            ));
        }

        let position = f.manager.position().await;
        assert!(position.is_entered(&f.market.share_market()));
        assert!(position.recorded_borrow(&f.market.share_market()).is_zero());
        assert!(f.sim.borrowed(f.market.share_market(), f.manager.account()).is_zero());
    }

    #[tokio::test]
    async fn test_borrow_without_collateral_has_no_liquidity() {
        let f = fixture();
        let err = f
            .manager
            .enter_and_borrow(f.caller, &f.market, 18, 5_000)
            .await
            .unwrap_err();
        assert!(matches!(err, PositionError::NoLiquidity));
    }

    #[tokio::test]
    async fn test_borrow_liquidity_error_code() {
        let f = fixture();
        supplied(&f, e18(1_000)).await;
        f.sim.set_liquidity_error(Some(3));

        let err = f
            .manager
            .enter_and_borrow(f.caller, &f.market, 18, 5_000)
            .await
            .unwrap_err();
        assert!(matches!(err, PositionError::LiquidityQueryFailed(_)));
    }

    #[tokio::test]
    async fn test_borrow_market_entry_failure() {
        let f = fixture();
        supplied(&f, e18(1_000)).await;
        f.sim.fail_next_status(SimOp::EnterMarkets, 9);

        let err = f
            .manager
            .enter_and_borrow(f.caller, &f.market, 18, 5_000)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PositionError::MarketEntryFailed { code, .. } if code.code() == 9
        ));
        assert!(!f
            .manager
            .position()
            .await
            .is_entered(&f.market.share_market()));
    }

    #[tokio::test]
    async fn test_borrow_enters_share_market_address() {
        let f = fixture();
        supplied(&f, e18(1_000)).await;
        f.manager
            .enter_and_borrow(f.caller, &f.market, 18, 1_000)
            .await
            .unwrap();

        assert!(f.sim.calls().iter().any(|call| matches!(
            call,
            SimCall::EnterMarkets { markets, .. } if markets == &vec![f.market.share_market()]
        )));
    }

    #[tokio::test]
    async fn test_borrow_zero_price() {
        let f = fixture();
        f.sim.force_liquidity(Some((e18(1_000), U256::ZERO)));
        f.sim.set_price(f.market.share_market(), U256::ZERO);

        let err = f
            .manager
            .enter_and_borrow(f.caller, &f.market, 18, 5_000)
            .await
            .unwrap_err();
        assert!(matches!(err, PositionError::PriceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_borrow_limit_truncates_to_zero() {
        let f = fixture();
        f.sim.force_liquidity(Some((U256::from(1u8), U256::ZERO)));

        // 1 * 10^0 / 1e18 truncates to zero.
        let err = f
            .manager
            .enter_and_borrow(f.caller, &f.market, 0, 10_000)
            .await
            .unwrap_err();
        assert!(matches!(err, PositionError::ZeroMaxBorrow));

        // Limit of one base unit, half of it truncates to zero.
        let err = f
            .manager
            .enter_and_borrow(f.caller, &f.market, 18, 5_000)
            .await
            .unwrap_err();
        assert!(matches!(err, PositionError::ZeroMaxBorrow));
    }

    #[tokio::test]
    async fn test_borrow_invalid_fraction() {
        let f = fixture();
        for bps in [0u16, 10_001] {
            let err = f
                .manager
                .enter_and_borrow(f.caller, &f.market, 18, bps)
                .await
                .unwrap_err();
            assert!(matches!(err, PositionError::InvalidFraction(b) if b == u32::from(bps)));
        }
        assert!(f.sim.calls().is_empty());
    }

    #[tokio::test]
    async fn test_borrow_status_failure_keeps_entry_only() {
        let f = fixture();
        supplied(&f, e18(1_000)).await;
        f.sim.fail_next_status(SimOp::Borrow, 4);

        let err = f
            .manager
            .enter_and_borrow(f.caller, &f.market, 18, 5_000)
            .await
            .unwrap_err();
        assert!(matches!(err, PositionError::BorrowFailed { code } if code.code() == 4));

        // The registry entry stands, so the local collateral set follows it.
        let position = f.manager.position().await;
        assert_eq!(
            f.sim.entered_markets(f.manager.account()),
            vec![f.market.share_market()]
        );
        assert!(position.is_entered(&f.market.share_market()));
        assert!(position.recorded_borrow(&f.market.share_market()).is_zero());
        assert_eq!(f.custody(), U256::ZERO);

        // Redeeming all collateral would remove all of the 750 liquidity.
        assert_eq!(
            f.manager.account_liquidity().await.unwrap().liquidity(),
            e18(750)
        );
        let projected = f
            .manager
            .post_redeem_liquidity(&f.market, e18(1_000))
            .await
            .unwrap();
        assert_eq!(projected, LiquiditySnapshot::with_liquidity(U256::ZERO));
    }

    #[tokio::test]
    async fn test_borrow_price_failure_keeps_entry() {
        let f = fixture();
        supplied(&f, e18(1_000)).await;
        f.sim.fail_next_transport(SimOp::UnderlyingPrice);

        assert!(f
            .manager
            .enter_and_borrow(f.caller, &f.market, 18, 5_000)
            .await
            .is_err());
        assert!(f
            .manager
            .position()
            .await
            .is_entered(&f.market.share_market()));
    }

    #[tokio::test]
    async fn test_borrow_from_other_market() {
        let f = fixture();
        let usdc = Market::new(Address::repeat_byte(0x0c), Address::repeat_byte(0xc0), 6, 8)
            .unwrap()
            .with_symbol("cUSDC");
        f.sim.list_market(
            &usdc,
            SimMarketConfig {
                // $2 per whole unit.
                price: U256::from(2u8) * MANTISSA_ONE,
                ..SimMarketConfig::default()
            },
        );
        f.sim
            .fund(usdc.underlying(), usdc.share_market(), U256::from(1_000_000_000_000u64));
        supplied(&f, e18(1_000)).await;

        let receipt = f
            .manager
            .enter_and_borrow_from(f.caller, &f.market, &usdc, 10_000)
            .await
            .unwrap();

        // 750 reference units at $2 is 375 USDC, in 6-decimal base units.
        assert_eq!(receipt.borrowed, U256::from(375_000_000u64));
        let position = f.manager.position().await;
        assert!(position.is_entered(&f.market.share_market()));
        assert!(!position.is_entered(&usdc.share_market()));
        assert_eq!(
            position.recorded_borrow(&usdc.share_market()),
            U256::from(375_000_000u64)
        );
    }

    // === repay ===

    #[tokio::test]
    async fn test_repay_reduces_recorded_and_actual() {
        let f = fixture();
        supplied(&f, e18(1_000)).await;
        f.manager
            .enter_and_borrow(f.caller, &f.market, 18, 5_000)
            .await
            .unwrap();

        let remaining = f.manager.repay(f.caller, &f.market, e18(100)).await.unwrap();

        assert_eq!(remaining, e18(275));
        assert_eq!(f.manager.borrow_balance(&f.market).await.unwrap(), e18(275));
        assert_eq!(f.market_allowance(), U256::ZERO);
        assert_eq!(f.custody(), e18(275));
    }

    #[tokio::test]
    async fn test_repay_with_interest_floors_recorded() {
        let f = fixture();
        supplied(&f, e18(1_000)).await;
        f.manager
            .enter_and_borrow(f.caller, &f.market, 18, 5_000)
            .await
            .unwrap();
        f.sim
            .accrue_interest(f.market.share_market(), f.manager.account(), e18(10));
        f.sim
            .fund(f.market.underlying(), f.manager.account(), e18(10));

        let remaining = f.manager.repay(f.caller, &f.market, e18(385)).await.unwrap();

        assert!(remaining.is_zero());
        assert!(f.manager.borrow_balance(&f.market).await.unwrap().is_zero());
    }

    #[tokio::test]
    async fn test_repay_failure_resets_approval() {
        let f = fixture();
        supplied(&f, e18(1_000)).await;
        f.manager
            .enter_and_borrow(f.caller, &f.market, 18, 5_000)
            .await
            .unwrap();
        f.sim.fail_next_status(SimOp::RepayBorrow, 13);

        let err = f
            .manager
            .repay(f.caller, &f.market, e18(100))
            .await
            .unwrap_err();

        assert!(matches!(err, PositionError::RepayFailed { code } if code.code() == 13));
        assert_eq!(f.market_allowance(), U256::ZERO);
        let position = f.manager.position().await;
        assert_eq!(position.recorded_borrow(&f.market.share_market()), e18(375));
    }

    #[tokio::test]
    async fn test_fund_and_repay_after_withdraw() {
        let f = fixture();
        supplied(&f, e18(1_000)).await;
        f.manager
            .enter_and_borrow(f.caller, &f.market, 18, 5_000)
            .await
            .unwrap();
        f.manager
            .withdraw_borrowed(f.caller, &f.market, e18(375))
            .await
            .unwrap();
        assert_eq!(f.custody(), U256::ZERO);
        assert_eq!(f.caller_balance(), e18(9_375));

        // Failed repay returns the pulled funds.
        f.sim.fail_next_status(SimOp::RepayBorrow, 1);
        let err = f
            .manager
            .fund_and_repay(f.caller, &f.market, e18(375))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "repay_failed");
        assert_eq!(f.caller_balance(), e18(9_375));
        assert_eq!(f.custody(), U256::ZERO);

        let remaining = f
            .manager
            .fund_and_repay(f.caller, &f.market, e18(375))
            .await
            .unwrap();
        assert!(remaining.is_zero());
        assert_eq!(f.caller_balance(), e18(9_000));
    }

    // === accessors ===

    #[tokio::test]
    async fn test_accessors_read_through() {
        let f = fixture_with(SimMarketConfig {
            exchange_rate: U256::from(2u8) * MANTISSA_ONE,
            supply_rate: U256::from(1_000u64),
            ..SimMarketConfig::default()
        });
        supplied(&f, e18(2_000)).await;

        assert_eq!(f.manager.share_balance(&f.market).await.unwrap(), e18(1_000));
        assert_eq!(
            f.manager
                .exchange_rate_and_supply_rate(&f.market)
                .await
                .unwrap(),
            (U256::from(2u8) * MANTISSA_ONE, U256::from(1_000u64))
        );
        assert_eq!(
            f.manager
                .estimate_underlying_balance(&f.market)
                .await
                .unwrap(),
            e18(2_000)
        );

        let info = f.manager.collateral_factor(&f.market).await.unwrap();
        assert!(info.is_listed);
        assert_eq!(info.collateral_factor, MANTISSA_ONE * U256::from(3u8) / U256::from(4u8));
        assert_eq!(
            f.manager.underlying_price(&f.market).await.unwrap(),
            MANTISSA_ONE
        );
    }

    #[tokio::test]
    async fn test_account_liquidity_rejects_malformed_snapshot() {
        let f = fixture();
        f.sim.force_liquidity(Some((e18(1), e18(1))));
        let err = f.manager.account_liquidity().await.unwrap_err();
        assert!(matches!(err, PositionError::LiquidityQueryFailed(_)));
    }

    #[tokio::test]
    async fn test_post_redeem_liquidity_projection() {
        let f = fixture();
        supplied(&f, e18(1_000)).await;

        // Not yet collateral: unchanged.
        let projected = f
            .manager
            .post_redeem_liquidity(&f.market, e18(400))
            .await
            .unwrap();
        assert_eq!(projected, f.manager.account_liquidity().await.unwrap());

        f.manager
            .enter_and_borrow(f.caller, &f.market, 18, 5_000)
            .await
            .unwrap();
        assert_eq!(
            f.manager.account_liquidity().await.unwrap().liquidity(),
            e18(375)
        );

        let projected = f
            .manager
            .post_redeem_liquidity(&f.market, e18(400))
            .await
            .unwrap();
        assert_eq!(projected, LiquiditySnapshot::with_liquidity(e18(75)));

        let projected = f
            .manager
            .post_redeem_liquidity(&f.market, e18(600))
            .await
            .unwrap();
        assert_eq!(projected, LiquiditySnapshot::with_shortfall(e18(75)));
    }

    #[tokio::test]
    async fn test_supply_readback_failure_resyncs_shares() {
        let f = fixture();
        // The pre-mint read passes, the post-mint read fails.
        f.sim.fail_transport_after(SimOp::BalanceOf, 1);

        let minted = f.manager.supply(f.caller, &f.market, e18(1_000)).await.unwrap();
        assert_eq!(minted, e18(1_000));
        assert_eq!(
            f.manager
                .position()
                .await
                .supplied_shares(&f.market.share_market()),
            e18(1_000)
        );
    }

    #[tokio::test]
    async fn test_sync_makes_earlier_shares_redeemable() {
        let f = fixture();
        supplied(&f, e18(1_000)).await;

        let fresh = PositionManager::new(
            f.manager.account(),
            Collaborators::from_backend(f.sim.clone()),
        );
        let err = fresh
            .redeem(f.caller, &f.market, e18(100))
            .await
            .unwrap_err();
        assert!(matches!(err, PositionError::InsufficientShares { .. }));

        fresh.sync(std::slice::from_ref(&f.market)).await.unwrap();
        assert_eq!(
            fresh.position().await.supplied_shares(&f.market.share_market()),
            e18(1_000)
        );

        let received = fresh.redeem(f.caller, &f.market, e18(100)).await.unwrap();
        assert_eq!(received, e18(100));
        assert_eq!(f.caller_balance(), e18(9_100));
    }

    #[tokio::test]
    async fn test_concurrent_supplies_are_serialized() {
        let f = fixture();
        let (a, b) = tokio::join!(
            f.manager.supply(f.caller, &f.market, e18(100)),
            f.manager.supply(f.caller, &f.market, e18(200)),
        );
        assert_eq!(a.unwrap() + b.unwrap(), e18(300));
        let position = f.manager.position().await;
        assert_eq!(position.supplied_shares(&f.market.share_market()), e18(300));
    }
}
