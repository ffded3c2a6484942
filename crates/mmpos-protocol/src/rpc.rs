//! JSON-RPC collaborators over alloy contract bindings.
//!
//! One `RpcProtocol` serves all four collaborator roles for a single signing
//! account. State-changing calls are simulated with `eth_call` first: a
//! non-zero simulated status is returned without sending, a zero status is
//! sent as a transaction and confirmed by its receipt.
//!
//! Every state-changing call is issued from the signer address.
//! A simulation that reverts is reported as `ProtocolError::Reverted`; read
//! failures are `ProtocolError::Transport`.

use alloy::network::{Ethereum, EthereumWallet};
use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, PendingTransactionBuilder, Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use mmpos_core::StatusCode;
use tracing::{debug, info};

use crate::collaborators::BoxFuture;
use crate::error::{ProtocolError, ProtocolResult};
use crate::ledger::AssetLedger;
use crate::oracle::PriceOracle;
use crate::registry::{AccountLiquidity, MarketInfo, RiskRegistry};
use crate::share_market::ShareMarket;

sol! {
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
        function transferFrom(address from, address to, uint256 amount) external returns (bool);
        function approve(address spender, uint256 amount) external returns (bool);
        function allowance(address owner, address spender) external view returns (uint256);
        function decimals() external view returns (uint8);
    }

    #[sol(rpc)]
    interface IShareMarket {
        function mint(uint256 mintAmount) external returns (uint256);
        function redeem(uint256 redeemTokens) external returns (uint256);
        function borrow(uint256 borrowAmount) external returns (uint256);
        function repayBorrow(uint256 repayAmount) external returns (uint256);
        function balanceOf(address owner) external view returns (uint256);
        function exchangeRateCurrent() external returns (uint256);
        function supplyRatePerBlock() external view returns (uint256);
        function borrowBalanceCurrent(address account) external returns (uint256);
    }

    #[sol(rpc)]
    interface IRiskRegistry {
        function enterMarkets(address[] calldata markets) external returns (uint256[] memory);
        function getAccountLiquidity(address account) external view returns (uint256 err, uint256 liquidity, uint256 shortfall);
        function markets(address market) external view returns (bool isListed, uint256 collateralFactorMantissa, bool isComped);
    }

    #[sol(rpc)]
    interface IPriceOracle {
        function getUnderlyingPrice(address market) external view returns (uint256);
    }
}

/// Addresses of the protocol-wide collaborators.
///
/// Token and share-market addresses travel with each `Market`; only the
/// registry and the oracle are fixed per deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcEndpoints {
    /// JSON-RPC HTTP endpoint.
    pub rpc_url: String,
    /// Risk registry (comptroller) address.
    pub registry: Address,
    /// Price oracle address.
    pub oracle: Address,
}

fn transport(context: &str) -> impl Fn(alloy::contract::Error) -> ProtocolError + '_ {
    move |e| ProtocolError::Transport(format!("{context}: {e}"))
}

fn reverted(context: &str) -> impl Fn(alloy::contract::Error) -> ProtocolError + '_ {
    move |e| ProtocolError::Reverted(format!("{context}: {e}"))
}

/// JSON-RPC backend signing as one account.
pub struct RpcProtocol {
    provider: DynProvider,
    signer_address: Address,
    endpoints: RpcEndpoints,
}

impl RpcProtocol {
    /// Connect to `endpoints.rpc_url`, signing with `signer`.
    ///
    /// # Errors
    /// Returns `ProtocolError::InvalidEndpoint` if the URL does not parse.
    pub fn connect(endpoints: RpcEndpoints, signer: PrivateKeySigner) -> ProtocolResult<Self> {
        let url: url::Url = endpoints
            .rpc_url
            .parse()
            .map_err(|e: url::ParseError| ProtocolError::InvalidEndpoint(e.to_string()))?;
        let signer_address = signer.address();
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();

        info!(
            rpc_url = %endpoints.rpc_url,
            registry = %endpoints.registry,
            oracle = %endpoints.oracle,
            account = %signer_address,
            "Connected RPC collaborators"
        );

        Ok(Self {
            provider,
            signer_address,
            endpoints,
        })
    }

    /// Account that signs every transaction.
    pub fn signer_address(&self) -> Address {
        self.signer_address
    }

    fn ensure_signer(&self, account: Address) -> ProtocolResult<()> {
        if account != self.signer_address {
            return Err(ProtocolError::Unauthorized {
                account,
                signer: self.signer_address,
            });
        }
        Ok(())
    }

    async fn confirm(
        pending: PendingTransactionBuilder<Ethereum>,
        what: &str,
    ) -> ProtocolResult<()> {
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| ProtocolError::Transport(format!("{what} receipt: {e}")))?;
        if !receipt.status() {
            return Err(ProtocolError::Reverted(format!(
                "{what} reverted in tx {}",
                receipt.transaction_hash
            )));
        }
        debug!(tx = %receipt.transaction_hash, what, "Transaction confirmed");
        Ok(())
    }

    async fn share_market_call(
        &self,
        market: Address,
        account: Address,
        amount: U256,
        op: ShareOp,
    ) -> ProtocolResult<StatusCode> {
        self.ensure_signer(account)?;
        let contract = IShareMarket::new(market, &self.provider);
        let what = op.name();

        macro_rules! simulate_then_send {
            ($call:expr) => {{
                let call = $call.from(self.signer_address);
                let status = StatusCode::from_u256(call.call().await.map_err(reverted(what))?);
                if !status.is_ok() {
                    debug!(%market, what, %status, "Simulated call returned failure status");
                    return Ok(status);
                }
                let pending = call.send().await.map_err(transport(what))?;
                Self::confirm(pending, what).await?;
                Ok(status)
            }};
        }

        match op {
            ShareOp::Mint => simulate_then_send!(contract.mint(amount)),
            ShareOp::Redeem => simulate_then_send!(contract.redeem(amount)),
            ShareOp::Borrow => simulate_then_send!(contract.borrow(amount)),
            ShareOp::Repay => simulate_then_send!(contract.repayBorrow(amount)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ShareOp {
    Mint,
    Redeem,
    Borrow,
    Repay,
}

impl ShareOp {
    fn name(self) -> &'static str {
        match self {
            ShareOp::Mint => "mint",
            ShareOp::Redeem => "redeem",
            ShareOp::Borrow => "borrow",
            ShareOp::Repay => "repayBorrow",
        }
    }
}

impl AssetLedger for RpcProtocol {
    fn balance_of(&self, token: Address, account: Address) -> BoxFuture<'_, ProtocolResult<U256>> {
        Box::pin(async move {
            IERC20::new(token, &self.provider)
                .balanceOf(account)
                .call()
                .await
                .map_err(transport("balanceOf"))
        })
    }

    fn transfer(
        &self,
        token: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> BoxFuture<'_, ProtocolResult<bool>> {
        Box::pin(async move {
            self.ensure_signer(from)?;
            let contract = IERC20::new(token, &self.provider);
            let call = contract
                .transfer(to, amount)
                .from(self.signer_address);
            if !call.call().await.map_err(reverted("transfer"))? {
                return Ok(false);
            }
            Self::confirm(call.send().await.map_err(transport("transfer"))?, "transfer").await?;
            Ok(true)
        })
    }

    fn transfer_from(
        &self,
        token: Address,
        spender: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> BoxFuture<'_, ProtocolResult<bool>> {
        Box::pin(async move {
            self.ensure_signer(spender)?;
            let contract = IERC20::new(token, &self.provider);
            let call = contract
                .transferFrom(from, to, amount)
                .from(self.signer_address);
            if !call.call().await.map_err(reverted("transferFrom"))? {
                return Ok(false);
            }
            let pending = call.send().await.map_err(transport("transferFrom"))?;
            Self::confirm(pending, "transferFrom").await?;
            Ok(true)
        })
    }

    fn approve(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
        amount: U256,
    ) -> BoxFuture<'_, ProtocolResult<()>> {
        Box::pin(async move {
            self.ensure_signer(owner)?;
            let contract = IERC20::new(token, &self.provider);
            let call = contract
                .approve(spender, amount)
                .from(self.signer_address);
            let pending = call.send().await.map_err(transport("approve"))?;
            Self::confirm(pending, "approve").await
        })
    }

    fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> BoxFuture<'_, ProtocolResult<U256>> {
        Box::pin(async move {
            IERC20::new(token, &self.provider)
                .allowance(owner, spender)
                .call()
                .await
                .map_err(transport("allowance"))
        })
    }

    fn decimals(&self, token: Address) -> BoxFuture<'_, ProtocolResult<u8>> {
        Box::pin(async move {
            IERC20::new(token, &self.provider)
                .decimals()
                .call()
                .await
                .map_err(transport("decimals"))
        })
    }
}

impl ShareMarket for RpcProtocol {
    fn mint(
        &self,
        market: Address,
        minter: Address,
        amount: U256,
    ) -> BoxFuture<'_, ProtocolResult<StatusCode>> {
        Box::pin(self.share_market_call(market, minter, amount, ShareOp::Mint))
    }

    fn redeem(
        &self,
        market: Address,
        redeemer: Address,
        shares: U256,
    ) -> BoxFuture<'_, ProtocolResult<StatusCode>> {
        Box::pin(self.share_market_call(market, redeemer, shares, ShareOp::Redeem))
    }

    fn borrow(
        &self,
        market: Address,
        borrower: Address,
        amount: U256,
    ) -> BoxFuture<'_, ProtocolResult<StatusCode>> {
        Box::pin(self.share_market_call(market, borrower, amount, ShareOp::Borrow))
    }

    fn repay_borrow(
        &self,
        market: Address,
        payer: Address,
        amount: U256,
    ) -> BoxFuture<'_, ProtocolResult<StatusCode>> {
        Box::pin(self.share_market_call(market, payer, amount, ShareOp::Repay))
    }

    fn balance_of(
        &self,
        market: Address,
        account: Address,
    ) -> BoxFuture<'_, ProtocolResult<U256>> {
        Box::pin(async move {
            IShareMarket::new(market, &self.provider)
                .balanceOf(account)
                .call()
                .await
                .map_err(transport("share balanceOf"))
        })
    }

    fn exchange_rate(&self, market: Address) -> BoxFuture<'_, ProtocolResult<U256>> {
        // exchangeRateCurrent accrues interest; eth_call returns the fresh value.
        Box::pin(async move {
            IShareMarket::new(market, &self.provider)
                .exchangeRateCurrent()
                .call()
                .await
                .map_err(transport("exchangeRateCurrent"))
        })
    }

    fn supply_rate(&self, market: Address) -> BoxFuture<'_, ProtocolResult<U256>> {
        Box::pin(async move {
            IShareMarket::new(market, &self.provider)
                .supplyRatePerBlock()
                .call()
                .await
                .map_err(transport("supplyRatePerBlock"))
        })
    }

    fn borrow_balance(
        &self,
        market: Address,
        account: Address,
    ) -> BoxFuture<'_, ProtocolResult<U256>> {
        Box::pin(async move {
            IShareMarket::new(market, &self.provider)
                .borrowBalanceCurrent(account)
                .call()
                .await
                .map_err(transport("borrowBalanceCurrent"))
        })
    }
}

impl RiskRegistry for RpcProtocol {
    fn enter_markets(
        &self,
        account: Address,
        markets: Vec<Address>,
    ) -> BoxFuture<'_, ProtocolResult<Vec<StatusCode>>> {
        Box::pin(async move {
            self.ensure_signer(account)?;
            let registry = IRiskRegistry::new(self.endpoints.registry, &self.provider);
            let call = registry.enterMarkets(markets).from(self.signer_address);
            let statuses: Vec<StatusCode> = call
                .call()
                .await
                .map_err(reverted("enterMarkets"))?
                .into_iter()
                .map(StatusCode::from_u256)
                .collect();
            if statuses.iter().all(StatusCode::is_ok) {
                let pending = call.send().await.map_err(transport("enterMarkets"))?;
                Self::confirm(pending, "enterMarkets").await?;
            }
            Ok(statuses)
        })
    }

    fn account_liquidity(
        &self,
        account: Address,
    ) -> BoxFuture<'_, ProtocolResult<AccountLiquidity>> {
        Box::pin(async move {
            let result = IRiskRegistry::new(self.endpoints.registry, &self.provider)
                .getAccountLiquidity(account)
                .call()
                .await
                .map_err(transport("getAccountLiquidity"))?;
            Ok(AccountLiquidity {
                status: StatusCode::from_u256(result.err),
                liquidity: result.liquidity,
                shortfall: result.shortfall,
            })
        })
    }

    fn market_info(&self, market: Address) -> BoxFuture<'_, ProtocolResult<MarketInfo>> {
        Box::pin(async move {
            let result = IRiskRegistry::new(self.endpoints.registry, &self.provider)
                .markets(market)
                .call()
                .await
                .map_err(transport("markets"))?;
            Ok(MarketInfo {
                is_listed: result.isListed,
                collateral_factor: result.collateralFactorMantissa,
            })
        })
    }
}

impl PriceOracle for RpcProtocol {
    fn underlying_price(&self, market: Address) -> BoxFuture<'_, ProtocolResult<U256>> {
        Box::pin(async move {
            IPriceOracle::new(self.endpoints.oracle, &self.provider)
                .getUnderlyingPrice(market)
                .call()
                .await
                .map_err(transport("getUnderlyingPrice"))
        })
    }
}
