//! Paper AMM.
//!
//! An in-memory constant-product exchange with Uniswap-V2 style price
//! accumulators. Deterministic and controllable from code: the clock only
//! moves when told to, and individual operations can be forced to fail.
//! The whole book is serialisable so paper runs survive restarts.

use async_trait::async_trait;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::{AddLiquidity, AmmRouter, CumulativePrices, LiquidityReceipt, RemoveLiquidity, Reserves};
use crate::math::{self, wad};
use crate::types::{Amount, EngineError, PairAddress, TokenId};

/// Account credited with the LP tokens of a pool's seed liquidity.
pub const GENESIS_PROVIDER: &str = "genesis";

// ---------------------------------------------------------------------------
// Book
// ---------------------------------------------------------------------------

/// Operations that can be forced to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AmmOperation {
    Swap,
    AddLiquidity,
    RemoveLiquidity,
    Reserves,
}

/// One pair pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimPool {
    pub token0: TokenId,
    pub token1: TokenId,
    pub reserve0: Amount,
    pub reserve1: Amount,
    pub price0_cumulative: U256,
    pub price1_cumulative: U256,
    pub last_update: u64,
    pub total_supply: Amount,
    pub balances: BTreeMap<String, Amount>,
}

impl SimPool {
    /// Accumulator values brought forward to `now` without mutating.
    fn cumulative_at(&self, now: u64) -> (U256, U256) {
        let elapsed = now.saturating_sub(self.last_update);
        if elapsed == 0 || self.reserve0 == 0 || self.reserve1 == 0 {
            return (self.price0_cumulative, self.price1_cumulative);
        }
        // reserve * WAD < 2^188 and elapsed < 2^64, so the products fit.
        let price0 = U256::from(self.reserve1) * wad() / U256::from(self.reserve0);
        let price1 = U256::from(self.reserve0) * wad() / U256::from(self.reserve1);
        let span = U256::from(elapsed);
        (
            self.price0_cumulative.overflowing_add(price0 * span).0,
            self.price1_cumulative.overflowing_add(price1 * span).0,
        )
    }

    /// Fold the time since the last update into the accumulators. Must run
    /// before any reserve change so the elapsed time is priced at the old
    /// reserves.
    fn accrue(&mut self, now: u64) {
        let (p0, p1) = self.cumulative_at(now);
        self.price0_cumulative = p0;
        self.price1_cumulative = p1;
        if now > self.last_update {
            self.last_update = now;
        }
    }

    fn reserves_for(&self, token: &TokenId) -> (Amount, Amount) {
        if token == &self.token0 {
            (self.reserve0, self.reserve1)
        } else {
            (self.reserve1, self.reserve0)
        }
    }

    fn set_reserves_for(&mut self, token: &TokenId, reserve_in: Amount, reserve_out: Amount) {
        if token == &self.token0 {
            self.reserve0 = reserve_in;
            self.reserve1 = reserve_out;
        } else {
            self.reserve1 = reserve_in;
            self.reserve0 = reserve_out;
        }
    }
}

/// Serialisable state of the whole exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmmBook {
    pub now: u64,
    pub pools: BTreeMap<PairAddress, SimPool>,
    #[serde(default)]
    pub failures: BTreeSet<AmmOperation>,
    /// Pairs whose swaps and liquidity changes fail. Reads still succeed.
    #[serde(default)]
    pub failing_pairs: BTreeSet<PairAddress>,
}

impl AmmBook {
    fn check_failure(&self, op: AmmOperation) -> Result<(), EngineError> {
        if self.failures.contains(&op) {
            return Err(EngineError::Amm(format!("simulated {op:?} failure")));
        }
        Ok(())
    }

    fn check_pair(&self, pair: &PairAddress) -> Result<(), EngineError> {
        if self.failing_pairs.contains(pair) {
            return Err(EngineError::Amm(format!("simulated failure in pair {pair}")));
        }
        Ok(())
    }

    fn check_deadline(&self, deadline: u64) -> Result<(), EngineError> {
        if self.now > deadline {
            return Err(EngineError::DeadlineExceeded {
                deadline,
                now: self.now,
            });
        }
        Ok(())
    }

    fn find(&self, a: &TokenId, b: &TokenId) -> Option<PairAddress> {
        self.pools
            .iter()
            .find(|(_, p)| (&p.token0 == a && &p.token1 == b) || (&p.token0 == b && &p.token1 == a))
            .map(|(addr, _)| addr.clone())
    }

    fn route(&self, a: &TokenId, b: &TokenId) -> Result<PairAddress, EngineError> {
        self.find(a, b).ok_or_else(|| EngineError::NoRoute {
            from: a.clone(),
            to: b.clone(),
        })
    }

    fn pool(&self, pair: &PairAddress) -> Result<&SimPool, EngineError> {
        self.pools
            .get(pair)
            .ok_or_else(|| EngineError::UnknownPair(pair.to_string()))
    }

    fn pool_mut(&mut self, pair: &PairAddress) -> Result<&mut SimPool, EngineError> {
        self.pools
            .get_mut(pair)
            .ok_or_else(|| EngineError::UnknownPair(pair.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Simulated AMM
// ---------------------------------------------------------------------------

/// In-memory constant-product AMM.
pub struct SimulatedAmm {
    book: Mutex<AmmBook>,
}

impl SimulatedAmm {
    pub fn new(now: u64) -> Self {
        Self::from_book(AmmBook {
            now,
            ..Default::default()
        })
    }

    /// Restore from a saved book.
    pub fn from_book(book: AmmBook) -> Self {
        Self {
            book: Mutex::new(book),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, AmmBook>, EngineError> {
        self.book
            .lock()
            .map_err(|_| EngineError::Amm("AMM book lock poisoned".into()))
    }

    /// Snapshot of the whole book for persistence.
    pub fn book(&self) -> Result<AmmBook, EngineError> {
        Ok(self.lock()?.clone())
    }

    /// Create a pool seeded with `reserve0`/`reserve1`. The seed LP tokens
    /// go to `GENESIS_PROVIDER`. Returns the seed liquidity.
    pub fn create_pool(
        &self,
        address: PairAddress,
        token0: TokenId,
        token1: TokenId,
        reserve0: Amount,
        reserve1: Amount,
    ) -> Result<Amount, EngineError> {
        let mut book = self.lock()?;
        if book.pools.contains_key(&address) || book.find(&token0, &token1).is_some() {
            return Err(EngineError::Config(format!("pool {address} already exists")));
        }
        let liquidity = math::to_amount(math::reserve_depth(reserve0, reserve1))?;
        let mut balances = BTreeMap::new();
        if liquidity > 0 {
            balances.insert(GENESIS_PROVIDER.to_string(), liquidity);
        }
        let now = book.now;
        book.pools.insert(
            address,
            SimPool {
                token0,
                token1,
                reserve0,
                reserve1,
                price0_cumulative: U256::zero(),
                price1_cumulative: U256::zero(),
                last_update: now,
                total_supply: liquidity,
                balances,
            },
        );
        Ok(liquidity)
    }

    /// Move the clock forward to `timestamp`. Earlier timestamps are ignored.
    pub fn set_time(&self, timestamp: u64) -> Result<(), EngineError> {
        let mut book = self.lock()?;
        if timestamp > book.now {
            book.now = timestamp;
        }
        Ok(())
    }

    pub fn advance_time(&self, seconds: u64) -> Result<u64, EngineError> {
        let mut book = self.lock()?;
        book.now = book.now.saturating_add(seconds);
        Ok(book.now)
    }

    /// Force every subsequent `op` to fail until cleared.
    pub fn fail_on(&self, op: AmmOperation) -> Result<(), EngineError> {
        self.lock()?.failures.insert(op);
        Ok(())
    }

    /// Force swaps and liquidity changes routed through `pair` to fail.
    pub fn fail_pair(&self, pair: PairAddress) -> Result<(), EngineError> {
        self.lock()?.failing_pairs.insert(pair);
        Ok(())
    }

    pub fn clear_failures(&self) -> Result<(), EngineError> {
        let mut book = self.lock()?;
        book.failures.clear();
        book.failing_pairs.clear();
        Ok(())
    }

    pub fn pool(&self, pair: &PairAddress) -> Result<SimPool, EngineError> {
        Ok(self.lock()?.pool(pair)?.clone())
    }
}

#[async_trait]
impl AmmRouter for SimulatedAmm {
    async fn now(&self) -> Result<u64, EngineError> {
        Ok(self.lock()?.now)
    }

    async fn pair_for(&self, a: &TokenId, b: &TokenId) -> Result<Option<PairAddress>, EngineError> {
        Ok(self.lock()?.find(a, b))
    }

    async fn pair_tokens(&self, pair: &PairAddress) -> Result<(TokenId, TokenId), EngineError> {
        let book = self.lock()?;
        let pool = book.pool(pair)?;
        Ok((pool.token0.clone(), pool.token1.clone()))
    }

    async fn get_reserves(&self, pair: &PairAddress) -> Result<Reserves, EngineError> {
        let book = self.lock()?;
        book.check_failure(AmmOperation::Reserves)?;
        let pool = book.pool(pair)?;
        Ok(Reserves {
            reserve0: pool.reserve0,
            reserve1: pool.reserve1,
            last_update: pool.last_update,
        })
    }

    async fn cumulative_prices(&self, pair: &PairAddress) -> Result<CumulativePrices, EngineError> {
        let book = self.lock()?;
        let pool = book.pool(pair)?;
        let (price0_cumulative, price1_cumulative) = pool.cumulative_at(book.now);
        Ok(CumulativePrices {
            price0_cumulative,
            price1_cumulative,
            timestamp: book.now,
        })
    }

    async fn lp_total_supply(&self, pair: &PairAddress) -> Result<Amount, EngineError> {
        Ok(self.lock()?.pool(pair)?.total_supply)
    }

    async fn lp_balance(&self, pair: &PairAddress, owner: &str) -> Result<Amount, EngineError> {
        let book = self.lock()?;
        Ok(book.pool(pair)?.balances.get(owner).copied().unwrap_or(0))
    }

    async fn swap_exact_in(
        &self,
        token_in: &TokenId,
        token_out: &TokenId,
        amount_in: Amount,
        amount_out_min: Amount,
        to: &str,
        deadline: u64,
    ) -> Result<Amount, EngineError> {
        let mut book = self.lock()?;
        book.check_failure(AmmOperation::Swap)?;
        book.check_deadline(deadline)?;
        let pair = book.route(token_in, token_out)?;
        book.check_pair(&pair)?;
        let now = book.now;
        let pool = book.pool_mut(&pair)?;

        let (reserve_in, reserve_out) = pool.reserves_for(token_in);
        if reserve_in == 0 || reserve_out == 0 {
            return Err(EngineError::NoLiquidity(pair));
        }
        let amount_out = math::get_amount_out(amount_in, reserve_in, reserve_out)?;
        if amount_out == 0 {
            return Err(EngineError::InsufficientAmount {
                amount: amount_in,
                minimum: 1,
            });
        }
        if amount_out < amount_out_min {
            return Err(EngineError::SlippageExceeded {
                actual: amount_out,
                minimum: amount_out_min,
            });
        }

        pool.accrue(now);
        let new_in = reserve_in.checked_add(amount_in).ok_or(EngineError::MathOverflow)?;
        pool.set_reserves_for(token_in, new_in, reserve_out - amount_out);

        debug!(
            pair = %pair,
            token_in = %token_in,
            amount_in = %math::format_amount(amount_in),
            amount_out = %math::format_amount(amount_out),
            to,
            "Simulated swap"
        );
        Ok(amount_out)
    }

    async fn add_liquidity(&self, request: AddLiquidity) -> Result<LiquidityReceipt, EngineError> {
        let mut book = self.lock()?;
        book.check_failure(AmmOperation::AddLiquidity)?;
        book.check_deadline(request.deadline)?;
        let pair = book.route(&request.token_a, &request.token_b)?;
        book.check_pair(&pair)?;
        let now = book.now;
        let pool = book.pool_mut(&pair)?;

        let (reserve_a, reserve_b) = pool.reserves_for(&request.token_a);
        let (amount_a, amount_b) = math::optimal_liquidity_amounts(
            request.amount_a_desired,
            request.amount_b_desired,
            reserve_a,
            reserve_b,
        )?;
        if amount_a < request.amount_a_min {
            return Err(EngineError::SlippageExceeded {
                actual: amount_a,
                minimum: request.amount_a_min,
            });
        }
        if amount_b < request.amount_b_min {
            return Err(EngineError::SlippageExceeded {
                actual: amount_b,
                minimum: request.amount_b_min,
            });
        }

        let liquidity = if pool.total_supply == 0 {
            math::to_amount(math::reserve_depth(amount_a, amount_b))?
        } else {
            let by_a = math::mul_div_amount(amount_a, pool.total_supply, reserve_a)?;
            let by_b = math::mul_div_amount(amount_b, pool.total_supply, reserve_b)?;
            by_a.min(by_b)
        };
        if liquidity == 0 {
            return Err(EngineError::InsufficientAmount {
                amount: amount_a.min(amount_b),
                minimum: 1,
            });
        }

        pool.accrue(now);
        let new_a = reserve_a.checked_add(amount_a).ok_or(EngineError::MathOverflow)?;
        let new_b = reserve_b.checked_add(amount_b).ok_or(EngineError::MathOverflow)?;
        pool.set_reserves_for(&request.token_a, new_a, new_b);
        pool.total_supply = pool
            .total_supply
            .checked_add(liquidity)
            .ok_or(EngineError::MathOverflow)?;
        *pool.balances.entry(request.to.clone()).or_insert(0) += liquidity;

        debug!(
            pair = %pair,
            amount_a = %math::format_amount(amount_a),
            amount_b = %math::format_amount(amount_b),
            liquidity = %math::format_amount(liquidity),
            "Simulated add liquidity"
        );
        Ok(LiquidityReceipt {
            amount_a,
            amount_b,
            liquidity,
        })
    }

    async fn remove_liquidity(&self, request: RemoveLiquidity) -> Result<(Amount, Amount), EngineError> {
        let mut book = self.lock()?;
        book.check_failure(AmmOperation::RemoveLiquidity)?;
        book.check_deadline(request.deadline)?;
        let pair = book.route(&request.token_a, &request.token_b)?;
        book.check_pair(&pair)?;
        let now = book.now;
        let pool = book.pool_mut(&pair)?;

        let held = pool.balances.get(&request.owner).copied().unwrap_or(0);
        if held < request.liquidity {
            return Err(EngineError::Amm(format!(
                "{} holds {held} LP in {pair}, cannot burn {}",
                request.owner, request.liquidity
            )));
        }
        if pool.total_supply == 0 {
            return Err(EngineError::NoLiquidity(pair));
        }

        let (reserve_a, reserve_b) = pool.reserves_for(&request.token_a);
        let amount_a = math::mul_div_amount(request.liquidity, reserve_a, pool.total_supply)?;
        let amount_b = math::mul_div_amount(request.liquidity, reserve_b, pool.total_supply)?;
        if amount_a < request.amount_a_min {
            return Err(EngineError::SlippageExceeded {
                actual: amount_a,
                minimum: request.amount_a_min,
            });
        }
        if amount_b < request.amount_b_min {
            return Err(EngineError::SlippageExceeded {
                actual: amount_b,
                minimum: request.amount_b_min,
            });
        }

        pool.accrue(now);
        pool.set_reserves_for(&request.token_a, reserve_a - amount_a, reserve_b - amount_b);
        pool.total_supply -= request.liquidity;
        let left = held - request.liquidity;
        if left == 0 {
            pool.balances.remove(&request.owner);
        } else {
            pool.balances.insert(request.owner.clone(), left);
        }

        debug!(
            pair = %pair,
            liquidity = %math::format_amount(request.liquidity),
            amount_a = %math::format_amount(amount_a),
            amount_b = %math::format_amount(amount_b),
            "Simulated remove liquidity"
        );
        Ok((amount_a, amount_b))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
