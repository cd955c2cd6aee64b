//! AMM integration.
//!
//! Defines the `AmmRouter` trait the engine consumes and a paper
//! implementation (`simulated`) used by the keeper's paper mode and tests.

pub mod simulated;

use async_trait::async_trait;
use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::types::{Amount, EngineError, PairAddress, TokenId};

/// Current reserves of a pair, in token0/token1 order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reserves {
    pub reserve0: Amount,
    pub reserve1: Amount,
    pub last_update: u64,
}

impl Reserves {
    pub fn is_empty(&self) -> bool {
        self.reserve0 == 0 || self.reserve1 == 0
    }
}

/// Cumulative price accumulators as of `timestamp`.
///
/// Each accumulator is the sum of `price * seconds` with prices scaled by
/// `math::WAD`. Accumulators wrap on overflow; only differences are
/// meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CumulativePrices {
    pub price0_cumulative: U256,
    pub price1_cumulative: U256,
    pub timestamp: u64,
}

/// Parameters of an add-liquidity call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddLiquidity {
    pub token_a: TokenId,
    pub token_b: TokenId,
    pub amount_a_desired: Amount,
    pub amount_b_desired: Amount,
    pub amount_a_min: Amount,
    pub amount_b_min: Amount,
    pub to: String,
    pub deadline: u64,
}

/// Amounts actually used and LP tokens minted, in the request's A/B order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiquidityReceipt {
    pub amount_a: Amount,
    pub amount_b: Amount,
    pub liquidity: Amount,
}

/// Parameters of a remove-liquidity call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveLiquidity {
    pub token_a: TokenId,
    pub token_b: TokenId,
    pub liquidity: Amount,
    pub amount_a_min: Amount,
    pub amount_b_min: Amount,
    pub owner: String,
    pub deadline: u64,
}

/// Abstraction over a constant-product AMM.
///
/// Every call either fully succeeds or fails without effect. Calls carrying
/// a deadline fail with `DeadlineExceeded` once the AMM clock has passed it;
/// calls carrying minimum amounts fail with `SlippageExceeded` when the
/// executed terms are worse.
#[async_trait]
pub trait AmmRouter: Send + Sync {
    /// Current AMM clock (seconds).
    async fn now(&self) -> Result<u64, EngineError>;

    /// Pair trading `a` against `b`, in either order.
    async fn pair_for(&self, a: &TokenId, b: &TokenId) -> Result<Option<PairAddress>, EngineError>;

    /// Token order of a pair.
    async fn pair_tokens(&self, pair: &PairAddress) -> Result<(TokenId, TokenId), EngineError>;

    async fn get_reserves(&self, pair: &PairAddress) -> Result<Reserves, EngineError>;

    /// Accumulators brought forward to the current clock.
    async fn cumulative_prices(&self, pair: &PairAddress) -> Result<CumulativePrices, EngineError>;

    async fn lp_total_supply(&self, pair: &PairAddress) -> Result<Amount, EngineError>;

    async fn lp_balance(&self, pair: &PairAddress, owner: &str) -> Result<Amount, EngineError>;

    /// Swap an exact input along the direct pair; returns the output amount.
    async fn swap_exact_in(
        &self,
        token_in: &TokenId,
        token_out: &TokenId,
        amount_in: Amount,
        amount_out_min: Amount,
        to: &str,
        deadline: u64,
    ) -> Result<Amount, EngineError>;

    async fn add_liquidity(&self, request: AddLiquidity) -> Result<LiquidityReceipt, EngineError>;

    /// Burn LP tokens; returns `(amount_a, amount_b)` in the request's order.
    async fn remove_liquidity(&self, request: RemoveLiquidity) -> Result<(Amount, Amount), EngineError>;
}
