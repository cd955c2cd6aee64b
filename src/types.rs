//! Shared types for the DALP engine.
//!
//! These types form the data model used across all modules. Amounts are
//! integer base units of an 18-decimal asset; prices and ratings are
//! 256-bit fixed-point values.

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::math;

/// Quantity of a token in its smallest unit (18 decimals).
pub type Amount = u128;

/// Fixed-point price scaled by `math::WAD`.
pub type Price = U256;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identity of a fungible token (symbol or address).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub String);

impl TokenId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of an AMM pair pool.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairAddress(pub String);

impl PairAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Tracked pairs
// ---------------------------------------------------------------------------

/// Which of the pair's two accumulators the rating follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceSide {
    /// token0 priced in token1.
    Price0,
    /// token1 priced in token0.
    Price1,
}

/// A candidate pair from the fixed allow-list.
///
/// `index` is the pair's position in the allow-list and is used as the
/// deterministic tie-break when two ratings are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedPair {
    pub index: usize,
    pub address: PairAddress,
    pub token0: TokenId,
    pub token1: TokenId,
    pub side: PriceSide,
}

impl TrackedPair {
    /// Build a tracked pair, choosing the price side so that the non-base
    /// token is priced in the base asset whenever the pair contains it.
    pub fn new(
        index: usize,
        address: PairAddress,
        token0: TokenId,
        token1: TokenId,
        base: &TokenId,
    ) -> Self {
        let side = if &token0 == base {
            PriceSide::Price1
        } else {
            PriceSide::Price0
        };
        Self {
            index,
            address,
            token0,
            token1,
            side,
        }
    }

    /// Whether the pair trades directly against `token`.
    pub fn contains(&self, token: &TokenId) -> bool {
        &self.token0 == token || &self.token1 == token
    }

    /// The other token of the pair, if `token` is one of its sides.
    pub fn counterpart(&self, token: &TokenId) -> Option<&TokenId> {
        if &self.token0 == token {
            Some(&self.token1)
        } else if &self.token1 == token {
            Some(&self.token0)
        } else {
            None
        }
    }

    pub fn tokens(&self) -> (TokenId, TokenId) {
        (self.token0.clone(), self.token1.clone())
    }
}

impl fmt::Display for TrackedPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {}/{} ({})",
            self.index, self.token0, self.token1, self.address
        )
    }
}

// ---------------------------------------------------------------------------
// Oracle observations
// ---------------------------------------------------------------------------

/// A sample of a pair's cumulative price accumulators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub price0_cumulative: U256,
    pub price1_cumulative: U256,
    pub timestamp: u64,
}

impl PriceObservation {
    pub fn cumulative(&self, side: PriceSide) -> U256 {
        match side {
            PriceSide::Price0 => self.price0_cumulative,
            PriceSide::Price1 => self.price1_cumulative,
        }
    }
}

// ---------------------------------------------------------------------------
// Pool state
// ---------------------------------------------------------------------------

/// The single active liquidity position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub pair: PairAddress,
    pub token0: TokenId,
    pub token1: TokenId,
    /// LP tokens held in the pair.
    pub liquidity: Amount,
    pub opened_at: u64,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} @ {} lp={}",
            self.token0,
            self.token1,
            self.pair,
            math::format_amount(self.liquidity),
        )
    }
}

/// Allocation state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationState {
    Idle,
    Positioned(PairAddress),
}

impl fmt::Display for AllocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationState::Idle => write!(f, "IDLE"),
            AllocationState::Positioned(pair) => write!(f, "POSITIONED({pair})"),
        }
    }
}

/// Everything the pool holds.
///
/// `residuals` carries non-base token balances: leftovers from the AMM's
/// ratio rounding and tokens stranded by a failed deployment. They are
/// included in NAV and swept back into base on the next withdrawal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolState {
    pub idle: Amount,
    pub position: Option<Position>,
    #[serde(default)]
    pub residuals: BTreeMap<TokenId, Amount>,
}

impl PoolState {
    pub fn allocation(&self) -> AllocationState {
        match &self.position {
            Some(p) => AllocationState::Positioned(p.pair.clone()),
            None => AllocationState::Idle,
        }
    }

    pub fn active_pair(&self) -> Option<&PairAddress> {
        self.position.as_ref().map(|p| &p.pair)
    }

    pub fn residual(&self, token: &TokenId) -> Amount {
        self.residuals.get(token).copied().unwrap_or(0)
    }

    pub fn credit_residual(&mut self, token: &TokenId, amount: Amount) -> Result<(), EngineError> {
        if amount == 0 {
            return Ok(());
        }
        let entry = self.residuals.entry(token.clone()).or_insert(0);
        *entry = entry.checked_add(amount).ok_or(EngineError::MathOverflow)?;
        Ok(())
    }

    pub fn debit_residual(&mut self, token: &TokenId, amount: Amount) -> Result<(), EngineError> {
        if amount == 0 {
            return Ok(());
        }
        let held = self.residual(token);
        let left = held.checked_sub(amount).ok_or(EngineError::InsufficientIdle {
            needed: amount,
            available: held,
        })?;
        if left == 0 {
            self.residuals.remove(token);
        } else {
            self.residuals.insert(token.clone(), left);
        }
        Ok(())
    }

    pub fn credit_idle(&mut self, amount: Amount) -> Result<(), EngineError> {
        self.idle = self.idle.checked_add(amount).ok_or(EngineError::MathOverflow)?;
        Ok(())
    }

    pub fn debit_idle(&mut self, amount: Amount) -> Result<(), EngineError> {
        self.idle = self.idle.checked_sub(amount).ok_or(EngineError::InsufficientIdle {
            needed: amount,
            available: self.idle,
        })?;
        Ok(())
    }

    /// No idle balance, no position and no residual tokens.
    pub fn is_empty(&self) -> bool {
        self.idle == 0 && self.position.is_none() && self.residuals.values().all(|v| *v == 0)
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | idle={}", self.allocation(), math::format_amount(self.idle))?;
        if let Some(p) = &self.position {
            write!(f, " | {p}")?;
        }
        if !self.residuals.is_empty() {
            write!(f, " | residuals={}", self.residuals.len())?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Rating
// ---------------------------------------------------------------------------

/// Opportunity score: growth per unit of reserve depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rating(pub U256);

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for the engine.
///
/// Every variant aborts the enclosing operation. None are retried
/// automatically.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Stale pair {pair}: no usable price observation")]
    StalePair { pair: PairAddress },

    #[error("Observation for {pair} not fresh: {elapsed}s since last sample, period is {period}s")]
    ObservationNotFresh {
        pair: PairAddress,
        elapsed: u64,
        period: u64,
    },

    #[error("Insufficient amount: {amount} below minimum {minimum}")]
    InsufficientAmount { amount: Amount, minimum: Amount },

    #[error("Deposit amount must be non-zero")]
    ZeroDeposit,

    #[error("Deadline exceeded: deadline {deadline}, now {now}")]
    DeadlineExceeded { deadline: u64, now: u64 },

    #[error("Slippage exceeded: got {actual}, minimum acceptable {minimum}")]
    SlippageExceeded { actual: Amount, minimum: Amount },

    #[error("Reentrant call rejected while {operation} is in progress")]
    ReentrantCall { operation: String },

    #[error("Unknown pair: {0}")]
    UnknownPair(String),

    #[error("Position already active in {active}")]
    PositionActive { active: PairAddress },

    #[error("No liquidity in pair {0}")]
    NoLiquidity(PairAddress),

    #[error("No route from {from} to {to}")]
    NoRoute { from: TokenId, to: TokenId },

    #[error("Arithmetic overflow")]
    MathOverflow,

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Insufficient shares: need {needed}, have {available}")]
    InsufficientShares { needed: Amount, available: Amount },

    #[error("Insufficient idle balance: need {needed}, have {available}")]
    InsufficientIdle { needed: Amount, available: Amount },

    #[error("AMM error: {0}")]
    Amm(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Errors that mean "this pair cannot be rated right now" rather than
    /// a failure of the whole reallocation.
    pub fn is_unrateable(&self) -> bool {
        matches!(
            self,
            EngineError::StalePair { .. }
                | EngineError::ObservationNotFresh { .. }
                | EngineError::NoLiquidity(_)
                | EngineError::MathOverflow
                | EngineError::DivisionByZero
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
