//! Application wiring and command execution.

use std::fmt;
use std::sync::Arc;

use clap::Subcommand;
use mmpos_core::{Address, FractionBps, LiquiditySnapshot, Market, U256};
use mmpos_position::{BorrowReceipt, PositionManager};
use mmpos_protocol::{Collaborators, RpcProtocol, SimulatedProtocol};
use rust_decimal::Decimal;
use tracing::info;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::keys::KeyManager;

/// Position commands. Amounts are whole units of the market's underlying
/// (shares for `redeem`).
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Deposit underlying and mint shares.
    Supply { market: String, amount: String },
    /// Redeem shares and return the underlying to the caller.
    Redeem {
        market: String,
        /// Whole shares; omit with --all.
        shares: Option<String>,
        /// Redeem the whole recorded share balance.
        #[arg(long)]
        all: bool,
    },
    /// Enter collateral and borrow a fraction of the computed limit.
    Borrow {
        market: String,
        /// Collateral market, if different from the borrowed market.
        #[arg(long)]
        collateral: Option<String>,
        /// Fraction of the limit in basis points (1..=10000).
        #[arg(long)]
        fraction_bps: Option<u16>,
    },
    /// Repay borrowed underlying.
    Repay {
        market: String,
        amount: String,
        /// Pull the repayment from the caller first.
        #[arg(long)]
        fund: bool,
    },
    /// Forward borrowed underlying from custody to the caller.
    Withdraw { market: String, amount: String },
    /// Print balances, rates and liquidity for one or all markets.
    Status { market: Option<String> },
    /// Supply, borrow, repay and redeem in sequence.
    Lifecycle {
        market: String,
        amount: String,
        #[arg(long)]
        fraction_bps: Option<u16>,
    },
}

/// Snapshot of one market for display.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketStatus {
    pub market: String,
    pub shares: Decimal,
    pub recorded_shares: Decimal,
    pub estimated_underlying: U256,
    pub exchange_rate: U256,
    pub supply_rate: U256,
    pub is_listed: bool,
    pub collateral_factor: U256,
    pub entered: bool,
    pub borrow_balance: Decimal,
    pub recorded_borrow: Decimal,
}

impl fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- {} ---", self.market)?;
        writeln!(
            f,
            "  shares: {} (recorded {})",
            self.shares, self.recorded_shares
        )?;
        writeln!(f, "  estimated underlying: {}", self.estimated_underlying)?;
        writeln!(
            f,
            "  exchange rate: {}  supply rate/block: {}",
            self.exchange_rate, self.supply_rate
        )?;
        writeln!(
            f,
            "  listed: {}  collateral factor: {}  entered: {}",
            self.is_listed, self.collateral_factor, self.entered
        )?;
        write!(
            f,
            "  borrow balance: {} (recorded {})",
            self.borrow_balance, self.recorded_borrow
        )
    }
}

/// Configured position manager plus the caller it acts for.
pub struct Application {
    config: AppConfig,
    manager: PositionManager,
    caller: Address,
    simulation: Option<Arc<SimulatedProtocol>>,
}

impl Application {
    /// Build against an in-memory protocol seeded from `config.simulation`.
    pub fn simulated(config: AppConfig) -> AppResult<Self> {
        let sim = Arc::new(SimulatedProtocol::new());
        let account = config.simulation.account()?;
        let caller = match config.caller()? {
            Some(caller) => caller,
            None => config.simulation.caller()?,
        };

        for market_config in &config.markets {
            let market = market_config.to_market()?;
            sim.list_market(&market, config.simulation.market_config(market_config)?);
            sim.fund(
                market.underlying(),
                caller,
                market.parse_amount(&config.simulation.caller_funding)?,
            );
            sim.fund(
                market.underlying(),
                market.share_market(),
                market.parse_amount(&config.simulation.market_cash)?,
            );
            // The caller has approved the custody account without limit.
            sim.set_allowance(market.underlying(), caller, account, U256::MAX);
        }

        info!(%account, %caller, markets = config.markets.len(), "Simulated protocol ready");
        let manager = PositionManager::new(account, Collaborators::from_backend(sim.clone()));
        Ok(Self {
            config,
            manager,
            caller,
            simulation: Some(sim),
        })
    }

    /// Build against the JSON-RPC protocol, signing as the configured key.
    ///
    /// Recorded shares are seeded from the chain, so shares supplied by an
    /// earlier run can be redeemed.
    pub async fn connect(config: AppConfig) -> AppResult<Self> {
        let keys = KeyManager::load(&config.key.source, config.expected_address()?)?;
        let account = keys.address();
        let caller = config.caller()?.unwrap_or(account);
        let protocol = RpcProtocol::connect(config.rpc_endpoints()?, keys.into_signer())?;

        info!(%account, %caller, "RPC protocol ready");
        let manager =
            PositionManager::new(account, Collaborators::from_backend(Arc::new(protocol)));
        let app = Self {
            config,
            manager,
            caller,
            simulation: None,
        };
        app.sync().await?;
        Ok(app)
    }

    /// Reload recorded shares for every configured market from the share
    /// markets.
    pub async fn sync(&self) -> AppResult<()> {
        let markets = self.markets()?;
        self.manager.sync(&markets).await?;
        Ok(())
    }

    pub fn manager(&self) -> &PositionManager {
        &self.manager
    }

    pub fn caller(&self) -> Address {
        self.caller
    }

    /// The in-memory protocol, when running simulated.
    pub fn simulation(&self) -> Option<&Arc<SimulatedProtocol>> {
        self.simulation.as_ref()
    }

    /// Run one command.
    pub async fn execute(&self, command: Command) -> AppResult<()> {
        match command {
            Command::Supply { market, amount } => {
                let market = self.config.market(&market)?;
                let minted = self
                    .manager
                    .supply(self.caller, &market, market.parse_amount(&amount)?)
                    .await?;
                println!(
                    "supplied {amount} {market}: minted {} shares",
                    market.shares_to_decimal(minted)?
                );
            }
            Command::Redeem {
                market,
                shares,
                all,
            } => {
                let market = self.config.market(&market)?;
                let share_amount = self.redeem_amount(&market, shares.as_deref(), all).await?;
                let received = self.manager.redeem(self.caller, &market, share_amount).await?;
                println!(
                    "redeemed {} shares of {market}: received {}",
                    market.shares_to_decimal(share_amount)?,
                    market.to_decimal(received)?
                );
            }
            Command::Borrow {
                market,
                collateral,
                fraction_bps,
            } => {
                let market = self.config.market(&market)?;
                let collateral = collateral
                    .map(|symbol| self.config.market(&symbol))
                    .transpose()?;
                let receipt = self
                    .borrow(&market, collateral.as_ref(), self.fraction(fraction_bps)?)
                    .await?;
                println!("{}", describe_borrow(&market, &receipt)?);
            }
            Command::Repay {
                market,
                amount,
                fund,
            } => {
                let market = self.config.market(&market)?;
                let amount = market.parse_amount(&amount)?;
                let remaining = if fund {
                    self.manager.fund_and_repay(self.caller, &market, amount).await?
                } else {
                    self.manager.repay(self.caller, &market, amount).await?
                };
                println!(
                    "repaid {} {market}: recorded principal now {}",
                    market.to_decimal(amount)?,
                    market.to_decimal(remaining)?
                );
            }
            Command::Withdraw { market, amount } => {
                let market = self.config.market(&market)?;
                self.manager
                    .withdraw_borrowed(self.caller, &market, market.parse_amount(&amount)?)
                    .await?;
                println!("withdrew {amount} {market} to {}", self.caller);
            }
            Command::Status { market } => {
                let markets = match market {
                    Some(symbol) => vec![self.config.market(&symbol)?],
                    None => self.markets()?,
                };
                for market in &markets {
                    println!("{}", self.status(market).await?);
                }
                println!("{}", describe_liquidity(&self.manager.account_liquidity().await?));
            }
            Command::Lifecycle {
                market,
                amount,
                fraction_bps,
            } => {
                let market = self.config.market(&market)?;
                self.lifecycle(&market, market.parse_amount(&amount)?, self.fraction(fraction_bps)?)
                    .await?;
            }
        }
        Ok(())
    }

    /// Status of one market, read fresh from the collaborators.
    pub async fn status(&self, market: &Market) -> AppResult<MarketStatus> {
        let position = self.manager.position().await;
        let (exchange_rate, supply_rate) =
            self.manager.exchange_rate_and_supply_rate(market).await?;
        let info = self.manager.collateral_factor(market).await?;

        Ok(MarketStatus {
            market: market.to_string(),
            shares: market.shares_to_decimal(self.manager.share_balance(market).await?)?,
            recorded_shares: market
                .shares_to_decimal(position.supplied_shares(&market.share_market()))?,
            estimated_underlying: self.manager.estimate_underlying_balance(market).await?,
            exchange_rate,
            supply_rate,
            is_listed: info.is_listed,
            collateral_factor: info.collateral_factor,
            entered: position.is_entered(&market.share_market()),
            borrow_balance: market.to_decimal(self.manager.borrow_balance(market).await?)?,
            recorded_borrow: market
                .to_decimal(position.recorded_borrow(&market.share_market()))?,
        })
    }

    /// Supply `amount`, borrow `fraction` of the limit, repay it in full,
    /// then redeem everything supplied.
    pub async fn lifecycle(
        &self,
        market: &Market,
        amount: U256,
        fraction: FractionBps,
    ) -> AppResult<()> {
        let minted = self.manager.supply(self.caller, market, amount).await?;
        info!(%market, %minted, "Lifecycle: supplied");

        let receipt = self.borrow(market, None, fraction).await?;
        println!("{}", describe_borrow(market, &receipt)?);
        println!("{}", self.status(market).await?);

        let remaining = self
            .manager
            .repay(self.caller, market, receipt.borrowed)
            .await?;
        info!(%market, %remaining, "Lifecycle: repaid");

        let held = self
            .manager
            .position()
            .await
            .supplied_shares(&market.share_market());
        let received = self.manager.redeem(self.caller, market, held).await?;
        println!(
            "lifecycle complete: redeemed {} shares for {} {market}",
            market.shares_to_decimal(held)?,
            market.to_decimal(received)?
        );
        Ok(())
    }

    async fn borrow(
        &self,
        market: &Market,
        collateral: Option<&Market>,
        fraction: FractionBps,
    ) -> AppResult<BorrowReceipt> {
        let bps = fraction.as_u16();
        let receipt = match collateral {
            Some(collateral) if collateral != market => {
                self.manager
                    .enter_and_borrow_from(self.caller, collateral, market, bps)
                    .await?
            }
            _ => {
                self.manager
                    .enter_and_borrow(self.caller, market, market.underlying_decimals(), bps)
                    .await?
            }
        };
        Ok(receipt)
    }

    async fn redeem_amount(
        &self,
        market: &Market,
        shares: Option<&str>,
        all: bool,
    ) -> AppResult<U256> {
        match (shares, all) {
            (Some(_), true) => Err(AppError::Config(
                "give either a share amount or --all, not both".to_string(),
            )),
            (Some(shares), false) => Ok(market.parse_shares(shares)?),
            (None, true) => Ok(self
                .manager
                .position()
                .await
                .supplied_shares(&market.share_market())),
            (None, false) => Err(AppError::Config(
                "a share amount or --all is required".to_string(),
            )),
        }
    }

    fn markets(&self) -> AppResult<Vec<Market>> {
        self.config.markets.iter().map(|m| m.to_market()).collect()
    }

    fn fraction(&self, bps: Option<u16>) -> AppResult<FractionBps> {
        Ok(FractionBps::new(
            bps.unwrap_or(self.config.position.default_fraction_bps),
        )?)
    }
}

fn describe_borrow(market: &Market, receipt: &BorrowReceipt) -> AppResult<String> {
    Ok(format!(
        "borrowed {} {market} (limit {}, price {}, liquidity {})",
        market.to_decimal(receipt.borrowed)?,
        market.to_decimal(receipt.max_borrow)?,
        receipt.price,
        receipt.snapshot.liquidity()
    ))
}

fn describe_liquidity(snapshot: &LiquiditySnapshot) -> String {
    format!(
        "account liquidity: {}  shortfall: {}",
        snapshot.liquidity(),
        snapshot.shortfall()
    )
}
