//! In-memory simulated money market.
//!
//! Implements every collaborator trait against one shared state so that
//! token custody, share balances, borrows and account liquidity stay
//! consistent with each other. Used by tests and by the CLI's simulate mode.
//!
//! Pricing model: `underlying_price` is the value of one whole underlying
//! unit scaled 1e18, so an amount is worth `amount * price / 10^decimals`.
//! Account liquidity is `sum(collateral value * collateral factor)` over
//! entered markets minus the value of all borrows.
//!
//! Faults can be injected per operation: a non-zero status for the next call
//! (`fail_next_status`), a transport error on the next call or after a number
//! of successful ones (`fail_next_transport`, `fail_transport_after`), a
//! forced liquidity response, or rejection of every ledger transfer.

use std::collections::{BTreeSet, HashMap};

use alloy::primitives::{Address, U256};
use mmpos_core::fixed::{self, MANTISSA_ONE};
use mmpos_core::{Market, StatusCode};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::collaborators::{ready, BoxFuture};
use crate::error::{ProtocolError, ProtocolResult};
use crate::ledger::AssetLedger;
use crate::oracle::PriceOracle;
use crate::registry::{AccountLiquidity, MarketInfo, RiskRegistry};
use crate::share_market::ShareMarket;

/// Status codes produced by the simulation.
pub mod codes {
    pub const BAD_INPUT: u64 = 2;
    pub const INSUFFICIENT_LIQUIDITY: u64 = 4;
    pub const MARKET_NOT_LISTED: u64 = 9;
    pub const TOKEN_INSUFFICIENT_ALLOWANCE: u64 = 12;
    pub const TOKEN_INSUFFICIENT_BALANCE: u64 = 13;
    pub const TOKEN_INSUFFICIENT_CASH: u64 = 14;
}

// ============================================================================
// Public configuration / inspection types
// ============================================================================

/// Operations that accept injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    BalanceOf,
    Transfer,
    TransferFrom,
    Approve,
    Mint,
    Redeem,
    Borrow,
    RepayBorrow,
    ExchangeRate,
    BorrowBalance,
    EnterMarkets,
    AccountLiquidity,
    MarketInfo,
    UnderlyingPrice,
}

/// Parameters for listing a simulated market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimMarketConfig {
    /// Exchange rate mantissa (underlying base units per share base unit, 1e18).
    pub exchange_rate: U256,
    /// Supply rate per block mantissa.
    pub supply_rate: U256,
    /// Collateral factor mantissa (1e18 = 100%).
    pub collateral_factor: U256,
    /// Price of one whole underlying unit, 1e18-scaled.
    pub price: U256,
}

impl Default for SimMarketConfig {
    fn default() -> Self {
        Self {
            exchange_rate: MANTISSA_ONE,
            supply_rate: U256::ZERO,
            collateral_factor: MANTISSA_ONE * U256::from(3u8) / U256::from(4u8),
            price: MANTISSA_ONE,
        }
    }
}

/// A state-changing call observed by the simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    Transfer {
        token: Address,
        from: Address,
        to: Address,
        amount: U256,
        accepted: bool,
    },
    TransferFrom {
        token: Address,
        spender: Address,
        from: Address,
        to: Address,
        amount: U256,
        accepted: bool,
    },
    Approve {
        token: Address,
        owner: Address,
        spender: Address,
        amount: U256,
    },
    Mint {
        market: Address,
        account: Address,
        amount: U256,
        status: StatusCode,
    },
    Redeem {
        market: Address,
        account: Address,
        shares: U256,
        status: StatusCode,
    },
    Borrow {
        market: Address,
        account: Address,
        amount: U256,
        status: StatusCode,
    },
    RepayBorrow {
        market: Address,
        account: Address,
        amount: U256,
        status: StatusCode,
    },
    EnterMarkets {
        account: Address,
        markets: Vec<Address>,
    },
}

// ============================================================================
// Internal state
// ============================================================================

#[derive(Debug, Clone)]
struct SimMarket {
    underlying: Address,
    underlying_decimals: u8,
    config: SimMarketConfig,
    listed: bool,
    shares: HashMap<Address, U256>,
    borrows: HashMap<Address, U256>,
}

impl SimMarket {
    fn shares_of(&self, account: &Address) -> U256 {
        self.shares.get(account).copied().unwrap_or(U256::ZERO)
    }

    fn borrow_of(&self, account: &Address) -> U256 {
        self.borrows.get(account).copied().unwrap_or(U256::ZERO)
    }
}

#[derive(Debug, Default)]
struct SimState {
    balances: HashMap<(Address, Address), U256>,
    allowances: HashMap<(Address, Address, Address), U256>,
    token_decimals: HashMap<Address, u8>,
    markets: HashMap<Address, SimMarket>,
    entered: HashMap<Address, BTreeSet<Address>>,
    status_faults: HashMap<SimOp, u64>,
    /// Op -> calls still allowed through before the fault fires.
    transport_faults: HashMap<SimOp, usize>,
    liquidity_error: Option<u64>,
    forced_liquidity: Option<(U256, U256)>,
    reject_transfers: bool,
    calls: Vec<SimCall>,
}

impl SimState {
    fn take_transport_fault(&mut self, op: SimOp) -> ProtocolResult<()> {
        let Some(passes) = self.transport_faults.get_mut(&op) else {
            return Ok(());
        };
        if *passes > 0 {
            *passes -= 1;
            return Ok(());
        }
        self.transport_faults.remove(&op);
        debug!(?op, "Injected transport fault");
        Err(ProtocolError::Transport(format!("injected fault on {op:?}")))
    }

    fn take_status_fault(&mut self, op: SimOp) -> Option<StatusCode> {
        self.status_faults.remove(&op).map(StatusCode::new)
    }

    fn balance(&self, token: Address, account: Address) -> U256 {
        self.balances
            .get(&(token, account))
            .copied()
            .unwrap_or(U256::ZERO)
    }

    fn allowance(&self, token: Address, owner: Address, spender: Address) -> U256 {
        self.allowances
            .get(&(token, owner, spender))
            .copied()
            .unwrap_or(U256::ZERO)
    }

    /// Move funds if the balance allows. Returns whether it moved.
    fn move_funds(&mut self, token: Address, from: Address, to: Address, amount: U256) -> bool {
        let from_balance = self.balance(token, from);
        if from_balance < amount {
            return false;
        }
        self.balances.insert((token, from), from_balance - amount);
        let to_balance = self.balance(token, to);
        self.balances.insert((token, to), to_balance.saturating_add(amount));
        true
    }

    /// Draw `amount` from `owner` into `spender`'s custody using the allowance.
    fn pull_with_allowance(
        &mut self,
        token: Address,
        owner: Address,
        spender: Address,
        amount: U256,
    ) -> Option<StatusCode> {
        let allowed = self.allowance(token, owner, spender);
        if allowed < amount {
            return Some(StatusCode::new(codes::TOKEN_INSUFFICIENT_ALLOWANCE));
        }
        if !self.move_funds(token, owner, spender, amount) {
            return Some(StatusCode::new(codes::TOKEN_INSUFFICIENT_BALANCE));
        }
        self.allowances
            .insert((token, owner, spender), allowed - amount);
        None
    }

    fn market(&self, market: Address) -> Option<&SimMarket> {
        self.markets.get(&market).filter(|m| m.listed)
    }

    /// Liquidity and shortfall after hypothetically redeeming `redeem_shares`
    /// or borrowing `borrow_amount` in `target`.
    fn hypothetical_liquidity(
        &self,
        account: Address,
        target: Option<Address>,
        redeem_shares: U256,
        borrow_amount: U256,
    ) -> ProtocolResult<(U256, U256)> {
        let entered = self.entered.get(&account);
        let mut collateral = U256::ZERO;
        let mut debt = U256::ZERO;

        for (address, market) in &self.markets {
            let is_target = target == Some(*address);
            let price = market.config.price;
            let decimals = market.underlying_decimals;

            if entered.map_or(false, |set| set.contains(address)) {
                let mut shares = market.shares_of(&account);
                if is_target {
                    shares = shares.saturating_sub(redeem_shares);
                }
                let underlying = fixed::shares_to_underlying(shares, market.config.exchange_rate)?;
                let value = fixed::reference_value(underlying, price, decimals)?;
                let weighted = fixed::mul_mantissa(value, market.config.collateral_factor)?;
                collateral = collateral.saturating_add(weighted);
            }

            let mut owed = market.borrow_of(&account);
            if is_target {
                owed = owed.saturating_add(borrow_amount);
            }
            debt = debt.saturating_add(fixed::reference_value(owed, price, decimals)?);
        }

        if collateral >= debt {
            Ok((collateral - debt, U256::ZERO))
        } else {
            Ok((U256::ZERO, debt - collateral))
        }
    }
}

// ============================================================================
// SimulatedProtocol
// ============================================================================

/// Deterministic in-memory money market.
#[derive(Debug, Default)]
pub struct SimulatedProtocol {
    state: Mutex<SimState>,
}

impl SimulatedProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    // === Setup ===

    /// List a market and register its underlying token.
    pub fn list_market(&self, market: &Market, config: SimMarketConfig) {
        let mut state = self.state.lock();
        state
            .token_decimals
            .insert(market.underlying(), market.underlying_decimals());
        state
            .token_decimals
            .insert(market.share_market(), market.share_decimals());
        state.markets.insert(
            market.share_market(),
            SimMarket {
                underlying: market.underlying(),
                underlying_decimals: market.underlying_decimals(),
                config,
                listed: true,
                shares: HashMap::new(),
                borrows: HashMap::new(),
            },
        );
        debug!(market = %market, "Listed simulated market");
    }

    /// Credit `amount` of `token` to `account` out of thin air.
    pub fn fund(&self, token: Address, account: Address, amount: U256) {
        let mut state = self.state.lock();
        let balance = state.balance(token, account);
        state
            .balances
            .insert((token, account), balance.saturating_add(amount));
    }

    /// Set an allowance directly (as if `owner` had approved `spender`).
    pub fn set_allowance(&self, token: Address, owner: Address, spender: Address, amount: U256) {
        self.state
            .lock()
            .allowances
            .insert((token, owner, spender), amount);
    }

    pub fn set_exchange_rate(&self, market: Address, rate: U256) {
        if let Some(m) = self.state.lock().markets.get_mut(&market) {
            m.config.exchange_rate = rate;
        }
    }

    pub fn set_price(&self, market: Address, price: U256) {
        if let Some(m) = self.state.lock().markets.get_mut(&market) {
            m.config.price = price;
        }
    }

    pub fn set_collateral_factor(&self, market: Address, factor: U256) {
        if let Some(m) = self.state.lock().markets.get_mut(&market) {
            m.config.collateral_factor = factor;
        }
    }

    /// Add interest to an account's borrow balance.
    pub fn accrue_interest(&self, market: Address, account: Address, interest: U256) {
        if let Some(m) = self.state.lock().markets.get_mut(&market) {
            let owed = m.borrow_of(&account);
            m.borrows.insert(account, owed.saturating_add(interest));
        }
    }

    // === Fault injection ===

    /// The next call of `op` reports status `code`.
    pub fn fail_next_status(&self, op: SimOp, code: u64) {
        self.state.lock().status_faults.insert(op, code);
    }

    /// The next call of `op` fails at the transport level.
    pub fn fail_next_transport(&self, op: SimOp) {
        self.fail_transport_after(op, 0);
    }

    /// Let `passes` calls of `op` through, then fail the next one at the
    /// transport level.
    pub fn fail_transport_after(&self, op: SimOp, passes: usize) {
        self.state.lock().transport_faults.insert(op, passes);
    }

    /// Account liquidity queries report this error code until cleared.
    pub fn set_liquidity_error(&self, code: Option<u64>) {
        self.state.lock().liquidity_error = code;
    }

    /// Account liquidity queries report these raw values until cleared.
    pub fn force_liquidity(&self, forced: Option<(U256, U256)>) {
        self.state.lock().forced_liquidity = forced;
    }

    /// Reject every ledger transfer until cleared.
    pub fn reject_transfers(&self, reject: bool) {
        self.state.lock().reject_transfers = reject;
    }

    // === Inspection ===

    pub fn balance(&self, token: Address, account: Address) -> U256 {
        self.state.lock().balance(token, account)
    }

    pub fn allowance_of(&self, token: Address, owner: Address, spender: Address) -> U256 {
        self.state.lock().allowance(token, owner, spender)
    }

    pub fn shares(&self, market: Address, account: Address) -> U256 {
        self.state
            .lock()
            .markets
            .get(&market)
            .map_or(U256::ZERO, |m| m.shares_of(&account))
    }

    pub fn borrowed(&self, market: Address, account: Address) -> U256 {
        self.state
            .lock()
            .markets
            .get(&market)
            .map_or(U256::ZERO, |m| m.borrow_of(&account))
    }

    /// Underlying cash held by a share market.
    pub fn cash(&self, market: Address) -> U256 {
        let state = self.state.lock();
        state
            .markets
            .get(&market)
            .map_or(U256::ZERO, |m| state.balance(m.underlying, market))
    }

    pub fn entered_markets(&self, account: Address) -> Vec<Address> {
        self.state
            .lock()
            .entered
            .get(&account)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// State-changing calls observed so far, oldest first.
    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.clone()
    }

    // === Operation bodies (synchronous) ===

    fn do_mint(
        &self,
        market: Address,
        minter: Address,
        amount: U256,
    ) -> ProtocolResult<StatusCode> {
        let mut state = self.state.lock();
        state.take_transport_fault(SimOp::Mint)?;

        let status = match state.take_status_fault(SimOp::Mint) {
            Some(code) => code,
            None => match state.market(market).cloned() {
                None => StatusCode::new(codes::MARKET_NOT_LISTED),
                Some(m) => {
                    let shares = fixed::underlying_to_shares(amount, m.config.exchange_rate)?;
                    match state.pull_with_allowance(m.underlying, minter, market, amount) {
                        Some(code) => code,
                        None => {
                            if let Some(entry) = state.markets.get_mut(&market) {
                                let held = entry.shares_of(&minter);
                                entry.shares.insert(minter, held.saturating_add(shares));
                            }
                            trace!(%market, %minter, %amount, %shares, "Simulated mint");
                            StatusCode::OK
                        }
                    }
                }
            },
        };

        state.calls.push(SimCall::Mint {
            market,
            account: minter,
            amount,
            status,
        });
        Ok(status)
    }

    fn do_redeem(
        &self,
        market: Address,
        redeemer: Address,
        shares: U256,
    ) -> ProtocolResult<StatusCode> {
        let mut state = self.state.lock();
        state.take_transport_fault(SimOp::Redeem)?;

        let status = match state.take_status_fault(SimOp::Redeem) {
            Some(code) => code,
            None => match state.market(market).cloned() {
                None => StatusCode::new(codes::MARKET_NOT_LISTED),
                Some(m) if m.shares_of(&redeemer) < shares => {
                    StatusCode::new(codes::TOKEN_INSUFFICIENT_BALANCE)
                }
                Some(m) => {
                    let (_, shortfall) =
                        state.hypothetical_liquidity(redeemer, Some(market), shares, U256::ZERO)?;
                    let underlying = fixed::shares_to_underlying(shares, m.config.exchange_rate)?;
                    if !shortfall.is_zero() {
                        StatusCode::new(codes::INSUFFICIENT_LIQUIDITY)
                    } else if !state.move_funds(m.underlying, market, redeemer, underlying) {
                        StatusCode::new(codes::TOKEN_INSUFFICIENT_CASH)
                    } else {
                        if let Some(entry) = state.markets.get_mut(&market) {
                            let held = entry.shares_of(&redeemer);
                            entry.shares.insert(redeemer, held - shares);
                        }
                        trace!(%market, %redeemer, %shares, %underlying, "Simulated redeem");
                        StatusCode::OK
                    }
                }
            },
        };

        state.calls.push(SimCall::Redeem {
            market,
            account: redeemer,
            shares,
            status,
        });
        Ok(status)
    }

    fn do_borrow(
        &self,
        market: Address,
        borrower: Address,
        amount: U256,
    ) -> ProtocolResult<StatusCode> {
        let mut state = self.state.lock();
        state.take_transport_fault(SimOp::Borrow)?;

        let status = match state.take_status_fault(SimOp::Borrow) {
            Some(code) => code,
            None => match state.market(market).cloned() {
                None => StatusCode::new(codes::MARKET_NOT_LISTED),
                Some(m) => {
                    let (_, shortfall) =
                        state.hypothetical_liquidity(borrower, Some(market), U256::ZERO, amount)?;
                    if !shortfall.is_zero() {
                        StatusCode::new(codes::INSUFFICIENT_LIQUIDITY)
                    } else if !state.move_funds(m.underlying, market, borrower, amount) {
                        StatusCode::new(codes::TOKEN_INSUFFICIENT_CASH)
                    } else {
                        if let Some(entry) = state.markets.get_mut(&market) {
                            let owed = entry.borrow_of(&borrower);
                            entry.borrows.insert(borrower, owed.saturating_add(amount));
                        }
                        trace!(%market, %borrower, %amount, "Simulated borrow");
                        StatusCode::OK
                    }
                }
            },
        };

        state.calls.push(SimCall::Borrow {
            market,
            account: borrower,
            amount,
            status,
        });
        Ok(status)
    }

    fn do_repay(
        &self,
        market: Address,
        payer: Address,
        amount: U256,
    ) -> ProtocolResult<StatusCode> {
        let mut state = self.state.lock();
        state.take_transport_fault(SimOp::RepayBorrow)?;

        let status = match state.take_status_fault(SimOp::RepayBorrow) {
            Some(code) => code,
            None => match state.market(market).cloned() {
                None => StatusCode::new(codes::MARKET_NOT_LISTED),
                Some(m) => {
                    let owed = m.borrow_of(&payer);
                    // `U256::MAX` repays the full balance.
                    let due = if amount == U256::MAX { owed } else { amount };
                    if due > owed {
                        StatusCode::new(codes::BAD_INPUT)
                    } else {
                        match state.pull_with_allowance(m.underlying, payer, market, due) {
                            Some(code) => code,
                            None => {
                                if let Some(entry) = state.markets.get_mut(&market) {
                                    entry.borrows.insert(payer, owed - due);
                                }
                                trace!(%market, %payer, %due, "Simulated repay");
                                StatusCode::OK
                            }
                        }
                    }
                }
            },
        };

        state.calls.push(SimCall::RepayBorrow {
            market,
            account: payer,
            amount,
            status,
        });
        Ok(status)
    }

    fn do_account_liquidity(&self, account: Address) -> ProtocolResult<AccountLiquidity> {
        let mut state = self.state.lock();
        state.take_transport_fault(SimOp::AccountLiquidity)?;

        if let Some(code) = state.liquidity_error {
            return Ok(AccountLiquidity {
                status: StatusCode::new(code),
                liquidity: U256::ZERO,
                shortfall: U256::ZERO,
            });
        }
        let (liquidity, shortfall) = match state.forced_liquidity {
            Some(forced) => forced,
            None => state.hypothetical_liquidity(account, None, U256::ZERO, U256::ZERO)?,
        };
        Ok(AccountLiquidity {
            status: StatusCode::OK,
            liquidity,
            shortfall,
        })
    }

    fn market_query<T>(
        &self,
        op: SimOp,
        market: Address,
        f: impl FnOnce(Option<&SimMarket>) -> T,
    ) -> ProtocolResult<T> {
        let mut state = self.state.lock();
        state.take_transport_fault(op)?;
        Ok(f(state.markets.get(&market)))
    }
}

// ============================================================================
// Trait implementations
// ============================================================================

impl AssetLedger for SimulatedProtocol {
    fn balance_of(&self, token: Address, account: Address) -> BoxFuture<'_, ProtocolResult<U256>> {
        let result = {
            let mut state = self.state.lock();
            state
                .take_transport_fault(SimOp::BalanceOf)
                .map(|_| state.balance(token, account))
        };
        ready(result)
    }

    fn transfer(
        &self,
        token: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> BoxFuture<'_, ProtocolResult<bool>> {
        let result = {
            let mut state = self.state.lock();
            state.take_transport_fault(SimOp::Transfer).map(|_| {
                let accepted = !state.reject_transfers && state.move_funds(token, from, to, amount);
                state.calls.push(SimCall::Transfer {
                    token,
                    from,
                    to,
                    amount,
                    accepted,
                });
                accepted
            })
        };
        ready(result)
    }

    fn transfer_from(
        &self,
        token: Address,
        spender: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> BoxFuture<'_, ProtocolResult<bool>> {
        let result = {
            let mut state = self.state.lock();
            state.take_transport_fault(SimOp::TransferFrom).map(|_| {
                let allowed = state.allowance(token, from, spender);
                let accepted = !state.reject_transfers
                    && allowed >= amount
                    && state.move_funds(token, from, to, amount);
                if accepted {
                    state
                        .allowances
                        .insert((token, from, spender), allowed - amount);
                }
                state.calls.push(SimCall::TransferFrom {
                    token,
                    spender,
                    from,
                    to,
                    amount,
                    accepted,
                });
                accepted
            })
        };
        ready(result)
    }

    fn approve(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
        amount: U256,
    ) -> BoxFuture<'_, ProtocolResult<()>> {
        let result = {
            let mut state = self.state.lock();
            state.take_transport_fault(SimOp::Approve).map(|_| {
                state.allowances.insert((token, owner, spender), amount);
                state.calls.push(SimCall::Approve {
                    token,
                    owner,
                    spender,
                    amount,
                });
            })
        };
        ready(result)
    }

    fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> BoxFuture<'_, ProtocolResult<U256>> {
        ready(Ok(self.state.lock().allowance(token, owner, spender)))
    }

    fn decimals(&self, token: Address) -> BoxFuture<'_, ProtocolResult<u8>> {
        let result = self
            .state
            .lock()
            .token_decimals
            .get(&token)
            .copied()
            .ok_or(ProtocolError::UnknownToken(token));
        ready(result)
    }
}

impl ShareMarket for SimulatedProtocol {
    fn mint(
        &self,
        market: Address,
        minter: Address,
        amount: U256,
    ) -> BoxFuture<'_, ProtocolResult<StatusCode>> {
        ready(self.do_mint(market, minter, amount))
    }

    fn redeem(
        &self,
        market: Address,
        redeemer: Address,
        shares: U256,
    ) -> BoxFuture<'_, ProtocolResult<StatusCode>> {
        ready(self.do_redeem(market, redeemer, shares))
    }

    fn borrow(
        &self,
        market: Address,
        borrower: Address,
        amount: U256,
    ) -> BoxFuture<'_, ProtocolResult<StatusCode>> {
        ready(self.do_borrow(market, borrower, amount))
    }

    fn repay_borrow(
        &self,
        market: Address,
        payer: Address,
        amount: U256,
    ) -> BoxFuture<'_, ProtocolResult<StatusCode>> {
        ready(self.do_repay(market, payer, amount))
    }

    fn balance_of(
        &self,
        market: Address,
        account: Address,
    ) -> BoxFuture<'_, ProtocolResult<U256>> {
        ready(self.market_query(SimOp::BalanceOf, market, |m| {
            m.map_or(U256::ZERO, |m| m.shares_of(&account))
        }))
    }

    fn exchange_rate(&self, market: Address) -> BoxFuture<'_, ProtocolResult<U256>> {
        ready(self.market_query(SimOp::ExchangeRate, market, |m| {
            m.map_or(U256::ZERO, |m| m.config.exchange_rate)
        }))
    }

    fn supply_rate(&self, market: Address) -> BoxFuture<'_, ProtocolResult<U256>> {
        ready(self.market_query(SimOp::ExchangeRate, market, |m| {
            m.map_or(U256::ZERO, |m| m.config.supply_rate)
        }))
    }

    fn borrow_balance(
        &self,
        market: Address,
        account: Address,
    ) -> BoxFuture<'_, ProtocolResult<U256>> {
        ready(self.market_query(SimOp::BorrowBalance, market, |m| {
            m.map_or(U256::ZERO, |m| m.borrow_of(&account))
        }))
    }
}

impl RiskRegistry for SimulatedProtocol {
    fn enter_markets(
        &self,
        account: Address,
        markets: Vec<Address>,
    ) -> BoxFuture<'_, ProtocolResult<Vec<StatusCode>>> {
        let result = {
            let mut state = self.state.lock();
            state.take_transport_fault(SimOp::EnterMarkets).map(|_| {
                let injected = state.take_status_fault(SimOp::EnterMarkets);
                let statuses: Vec<StatusCode> = markets
                    .iter()
                    .map(|market| {
                        if let Some(code) = injected {
                            return code;
                        }
                        if state.market(*market).is_none() {
                            return StatusCode::new(codes::MARKET_NOT_LISTED);
                        }
                        state.entered.entry(account).or_default().insert(*market);
                        StatusCode::OK
                    })
                    .collect();
                state.calls.push(SimCall::EnterMarkets {
                    account,
                    markets: markets.clone(),
                });
                statuses
            })
        };
        ready(result)
    }

    fn account_liquidity(
        &self,
        account: Address,
    ) -> BoxFuture<'_, ProtocolResult<AccountLiquidity>> {
        ready(self.do_account_liquidity(account))
    }

    fn market_info(&self, market: Address) -> BoxFuture<'_, ProtocolResult<MarketInfo>> {
        ready(self.market_query(SimOp::MarketInfo, market, |m| {
            m.map_or(MarketInfo::default(), |m| MarketInfo {
                is_listed: m.listed,
                collateral_factor: m.config.collateral_factor,
            })
        }))
    }
}

impl PriceOracle for SimulatedProtocol {
    fn underlying_price(&self, market: Address) -> BoxFuture<'_, ProtocolResult<U256>> {
        ready(self.market_query(SimOp::UnderlyingPrice, market, |m| {
            m.map_or(U256::ZERO, |m| m.config.price)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mmpos_core::fixed::pow10;
    use tokio_test::block_on;

    fn dai() -> Market {
        Market::new(
            Address::repeat_byte(0xda),
            Address::repeat_byte(0xcd),
            18,
            8,
        )
        .unwrap()
        .with_symbol("DAI")
    }

    fn user() -> Address {
        Address::repeat_byte(0x01)
    }

    fn e18(n: u64) -> U256 {
        U256::from(n) * MANTISSA_ONE
    }

    fn listed() -> (SimulatedProtocol, Market) {
        let sim = SimulatedProtocol::new();
        let market = dai();
        sim.list_market(
            &market,
            SimMarketConfig {
                exchange_rate: U256::from(2u8) * pow10(26).unwrap(),
                ..SimMarketConfig::default()
            },
        );
        sim.fund(market.underlying(), user(), e18(1_000));
        (sim, market)
    }

    #[test]
    fn test_transfer_from_requires_allowance() {
        let (sim, market) = listed();
        let spender = Address::repeat_byte(0x02);

        let moved = block_on(sim.transfer_from(
            market.underlying(),
            spender,
            user(),
            spender,
            e18(1),
        ));
        assert!(!moved.unwrap());

        sim.set_allowance(market.underlying(), user(), spender, e18(1));
        let moved = block_on(sim.transfer_from(
            market.underlying(),
            spender,
            user(),
            spender,
            e18(1),
        ));
        assert!(moved.unwrap());
        assert_eq!(sim.balance(market.underlying(), spender), e18(1));
        assert_eq!(sim.allowance_of(market.underlying(), user(), spender), U256::ZERO);
    }

    #[test]
    fn test_mint_converts_at_exchange_rate() {
        let (sim, market) = listed();
        sim.set_allowance(market.underlying(), user(), market.share_market(), e18(1_000));

        let status = block_on(sim.mint(market.share_market(), user(), e18(1_000))).unwrap();
        assert!(status.is_ok());
        // 1000e18 * 1e18 / 2e26 = 5e12 shares (50,000 with 8 decimals).
        assert_eq!(sim.shares(market.share_market(), user()), U256::from(5_000_000_000_000u64));
        assert_eq!(sim.cash(market.share_market()), e18(1_000));
    }

    #[test]
    fn test_mint_without_allowance_reports_status() {
        let (sim, market) = listed();
        let status = block_on(sim.mint(market.share_market(), user(), e18(1))).unwrap();
        assert_eq!(status.code(), codes::TOKEN_INSUFFICIENT_ALLOWANCE);
        assert_eq!(sim.balance(market.underlying(), user()), e18(1_000));
    }

    #[test]
    fn test_liquidity_tracks_collateral_and_debt() {
        let (sim, market) = listed();
        sim.set_allowance(market.underlying(), user(), market.share_market(), e18(1_000));
        block_on(sim.mint(market.share_market(), user(), e18(1_000))).unwrap();

        // Not entered: no borrowing power.
        let liq = block_on(sim.account_liquidity(user())).unwrap();
        assert_eq!(liq.liquidity, U256::ZERO);

        let statuses = block_on(sim.enter_markets(user(), vec![market.share_market()])).unwrap();
        assert_eq!(statuses, vec![StatusCode::OK]);

        // 1000 DAI at $1 with a 75% collateral factor.
        let liq = block_on(sim.account_liquidity(user())).unwrap();
        assert_eq!(liq.liquidity, e18(750));
        assert_eq!(liq.shortfall, U256::ZERO);

        let status = block_on(sim.borrow(market.share_market(), user(), e18(700))).unwrap();
        assert!(status.is_ok());
        let liq = block_on(sim.account_liquidity(user())).unwrap();
        assert_eq!(liq.liquidity, e18(50));

        let status = block_on(sim.borrow(market.share_market(), user(), e18(51))).unwrap();
        assert_eq!(status.code(), codes::INSUFFICIENT_LIQUIDITY);
    }

    #[test]
    fn test_enter_unlisted_market() {
        let sim = SimulatedProtocol::new();
        let statuses =
            block_on(sim.enter_markets(user(), vec![Address::repeat_byte(0x77)])).unwrap();
        assert_eq!(statuses, vec![StatusCode::new(codes::MARKET_NOT_LISTED)]);
        assert!(sim.entered_markets(user()).is_empty());
    }

    #[test]
    fn test_injected_faults_are_one_shot() {
        let (sim, market) = listed();
        sim.fail_next_status(SimOp::Mint, 7);
        sim.fail_next_transport(SimOp::Borrow);

        let status = block_on(sim.mint(market.share_market(), user(), e18(1))).unwrap();
        assert_eq!(status.code(), 7);
        assert!(block_on(sim.borrow(market.share_market(), user(), e18(1))).is_err());

        // Faults consumed: next mint fails only for lack of allowance.
        let status = block_on(sim.mint(market.share_market(), user(), e18(1))).unwrap();
        assert_eq!(status.code(), codes::TOKEN_INSUFFICIENT_ALLOWANCE);
    }

    #[test]
    fn test_transport_fault_after_passes() {
        let (sim, market) = listed();
        sim.fail_transport_after(SimOp::BalanceOf, 2);

        let read = || block_on(ShareMarket::balance_of(&sim, market.share_market(), user()));
        assert!(read().is_ok());
        assert!(read().is_ok());
        assert!(read().is_err());
        assert!(read().is_ok());
    }

    #[test]
    fn test_repay_rejects_overpayment() {
        let (sim, market) = listed();
        sim.fund(market.underlying(), market.share_market(), e18(100));
        sim.force_liquidity(None);
        sim.set_collateral_factor(market.share_market(), MANTISSA_ONE);
        sim.set_allowance(market.underlying(), user(), market.share_market(), e18(500));
        block_on(sim.mint(market.share_market(), user(), e18(500))).unwrap();
        block_on(sim.enter_markets(user(), vec![market.share_market()])).unwrap();
        block_on(sim.borrow(market.share_market(), user(), e18(10))).unwrap();

        sim.set_allowance(market.underlying(), user(), market.share_market(), e18(20));
        let status = block_on(sim.repay_borrow(market.share_market(), user(), e18(11))).unwrap();
        assert_eq!(status.code(), codes::BAD_INPUT);

        let status =
            block_on(sim.repay_borrow(market.share_market(), user(), U256::MAX)).unwrap();
        assert!(status.is_ok());
        assert_eq!(sim.borrowed(market.share_market(), user()), U256::ZERO);
    }
}
