//! Allocation controller. Moves the pool's capital into the best-rated pair.
//!
//! Every AMM call is made against a staged copy of the pool state. The
//! staged copy is written back after each external effect succeeds, so the
//! books always match what actually happened on the exchange: a withdrawal
//! that completed stays committed even when the redeployment that follows
//! it fails, and any tokens already swapped for that redeployment are kept
//! as residuals and swept back into the base asset.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::amm::{AddLiquidity, AmmRouter, RemoveLiquidity};
use crate::math;
use crate::oracle::PriceOracle;
use crate::rating::{select_best, PairRatingEngine, RatingBreakdown};
use crate::types::{Amount, EngineError, PairAddress, PoolState, Position, TokenId, TrackedPair};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Asset the pool is denominated in.
    pub base: TokenId,
    /// Account that owns the pool's LP tokens and receives swap output.
    pub account: String,
    /// Tolerance applied to every expected AMM amount.
    pub slippage_bps: u32,
    /// Seconds from "now" after which an AMM call must revert.
    pub deadline_secs: u64,
    /// Idle balances below this are not worth deploying.
    pub dust_threshold: Amount,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What a reallocation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReallocationOutcome {
    /// No pair could be rated.
    NoCandidate,
    /// The best pair already holds the position.
    Unchanged { pair: PairAddress },
    /// Capital moved into `to`.
    Reallocated {
        from: Option<PairAddress>,
        to: PairAddress,
        liquidity: Amount,
    },
    /// Nothing left to deploy after withdrawing.
    NothingToDeploy {
        from: Option<PairAddress>,
        best: PairAddress,
    },
}

/// A pair left out of the ranking, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPair {
    pub pair: PairAddress,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReallocationReport {
    pub id: Uuid,
    pub outcome: ReallocationOutcome,
    pub ratings: Vec<RatingBreakdown>,
    pub skipped: Vec<SkippedPair>,
    pub idle_before: Amount,
    pub idle_after: Amount,
    pub timestamp: DateTime<Utc>,
}

/// Result of a deployment into a pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployReceipt {
    pub pair: PairAddress,
    /// Base asset taken from idle.
    pub spent: Amount,
    /// LP tokens minted by this deployment.
    pub liquidity: Amount,
    /// LP tokens held in the pair afterwards.
    pub position_liquidity: Amount,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct AllocationController {
    config: ControllerConfig,
}

impl AllocationController {
    pub fn new(config: ControllerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Rate every tracked pair. Pairs without fresh windows, without
    /// liquidity or whose rating does not fit 256 bits are reported as
    /// skipped; any other failure aborts.
    pub async fn rate_candidates(
        &self,
        pairs: &[TrackedPair],
        oracle: &PriceOracle,
        rater: &PairRatingEngine,
        amm: &dyn AmmRouter,
        now: u64,
    ) -> Result<(Vec<RatingBreakdown>, Vec<SkippedPair>), EngineError> {
        let mut ratings = Vec::with_capacity(pairs.len());
        let mut skipped = Vec::new();

        for pair in pairs {
            if let Err(e) = oracle.fresh_windows(pair, now) {
                debug!(pair = %pair.address, reason = %e, "Pair skipped");
                skipped.push(SkippedPair {
                    pair: pair.address.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
            let reserves = amm.get_reserves(&pair.address).await?;
            match rater.rate(pair, oracle, &reserves, now) {
                Ok(rating) => ratings.push(rating),
                Err(e) if e.is_unrateable() => {
                    debug!(pair = %pair.address, reason = %e, "Pair skipped");
                    skipped.push(SkippedPair {
                        pair: pair.address.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        Ok((ratings, skipped))
    }

    /// Move the pool into the best-rated pair.
    ///
    /// Does nothing when no pair can be rated or the best pair is already
    /// the active one. Otherwise withdraws the active position (if any),
    /// sweeps every residual token back into base and deploys the idle
    /// balance into the winner.
    pub async fn reallocate(
        &self,
        state: &mut PoolState,
        pairs: &[TrackedPair],
        oracle: &PriceOracle,
        rater: &PairRatingEngine,
        amm: &dyn AmmRouter,
    ) -> Result<ReallocationReport, EngineError> {
        let now = amm.now().await?;
        let idle_before = state.idle;
        let (ratings, skipped) = self.rate_candidates(pairs, oracle, rater, amm, now).await?;

        let outcome = match select_best(&ratings) {
            None => {
                info!(skipped = skipped.len(), "No pair could be rated, allocation unchanged");
                ReallocationOutcome::NoCandidate
            }
            Some(best) if state.active_pair() == Some(&best.pair) => {
                debug!(pair = %best.pair, "Best pair already active");
                ReallocationOutcome::Unchanged {
                    pair: best.pair.clone(),
                }
            }
            Some(best) => {
                let target = pairs
                    .iter()
                    .find(|p| p.address == best.pair)
                    .ok_or_else(|| EngineError::UnknownPair(best.pair.to_string()))?;
                let from = state.active_pair().cloned();

                if state.position.is_some() {
                    self.withdraw(state, amm).await?;
                } else if !state.residuals.is_empty() {
                    self.sweep_residuals(state, amm).await;
                }

                if state.idle == 0 || state.idle < self.config.dust_threshold {
                    info!(
                        best = %target.address,
                        idle = %math::format_amount(state.idle),
                        "Idle balance below dust threshold, staying idle"
                    );
                    ReallocationOutcome::NothingToDeploy {
                        from,
                        best: target.address.clone(),
                    }
                } else {
                    let amount = state.idle;
                    let receipt = self.deploy(state, target, amount, amm).await?;
                    info!(
                        from = ?from.as_ref().map(|p| p.as_str()),
                        to = %target.address,
                        liquidity = %math::format_amount(receipt.liquidity),
                        "Liquidity reallocated"
                    );
                    ReallocationOutcome::Reallocated {
                        from,
                        to: target.address.clone(),
                        liquidity: receipt.liquidity,
                    }
                }
            }
        };

        Ok(ReallocationReport {
            id: Uuid::new_v4(),
            outcome,
            ratings,
            skipped,
            idle_before,
            idle_after: state.idle,
            timestamp: Utc::now(),
        })
    }

    /// Remove the whole active position. Base proceeds go to idle, other
    /// tokens are swept back into base on a best-effort basis. Returns the
    /// increase in idle balance.
    pub async fn withdraw(&self, state: &mut PoolState, amm: &dyn AmmRouter) -> Result<Amount, EngineError> {
        let Some(position) = state.position.clone() else {
            return Ok(0);
        };
        let idle_before = state.idle;

        let reserves = amm.get_reserves(&position.pair).await?;
        let supply = amm.lp_total_supply(&position.pair).await?;
        let expected0 = math::mul_div_amount(position.liquidity, reserves.reserve0, supply)?;
        let expected1 = math::mul_div_amount(position.liquidity, reserves.reserve1, supply)?;
        let deadline = self.deadline(amm).await?;

        let (amount0, amount1) = amm
            .remove_liquidity(RemoveLiquidity {
                token_a: position.token0.clone(),
                token_b: position.token1.clone(),
                liquidity: position.liquidity,
                amount_a_min: math::apply_slippage(expected0, self.config.slippage_bps),
                amount_b_min: math::apply_slippage(expected1, self.config.slippage_bps),
                owner: self.config.account.clone(),
                deadline,
            })
            .await?;

        let mut staged = state.clone();
        staged.position = None;
        self.credit(&mut staged, &position.token0, amount0)?;
        self.credit(&mut staged, &position.token1, amount1)?;
        *state = staged;

        info!(
            pair = %position.pair,
            liquidity = %math::format_amount(position.liquidity),
            amount0 = %math::format_amount(amount0),
            amount1 = %math::format_amount(amount1),
            "Position withdrawn"
        );

        self.sweep_residuals(state, amm).await;
        Ok(state.idle.saturating_sub(idle_before))
    }

    /// Deploy `amount` of idle base into `pair`.
    ///
    /// Adding to the pair that already holds the position grows it; any
    /// other pair is refused while a position is open.
    pub async fn deploy(
        &self,
        state: &mut PoolState,
        pair: &TrackedPair,
        amount: Amount,
        amm: &dyn AmmRouter,
    ) -> Result<DeployReceipt, EngineError> {
        let minimum = self.config.dust_threshold.max(1);
        if amount < minimum {
            return Err(EngineError::InsufficientAmount { amount, minimum });
        }
        if amount > state.idle {
            return Err(EngineError::InsufficientIdle {
                needed: amount,
                available: state.idle,
            });
        }
        if let Some(active) = state.active_pair() {
            if active != &pair.address {
                return Err(EngineError::PositionActive {
                    active: active.clone(),
                });
            }
        }

        let deadline = self.deadline(amm).await?;
        let mut staged = state.clone();
        match self.acquire(&mut staged, pair, amount, deadline, amm).await {
            Ok(liquidity) => {
                *state = staged;
                let position_liquidity = state.position.as_ref().map_or(0, |p| p.liquidity);
                Ok(DeployReceipt {
                    pair: pair.address.clone(),
                    spent: amount,
                    liquidity,
                    position_liquidity,
                })
            }
            Err(e) => {
                warn!(
                    pair = %pair.address,
                    error = %e,
                    residuals = staged.residuals.len(),
                    "Deployment failed, keeping completed swaps and sweeping back"
                );
                *state = staged;
                self.sweep_residuals(state, amm).await;
                Err(e)
            }
        }
    }

    /// Swap every residual token back into base. Tokens without a route or
    /// whose swap fails stay in residuals for the next attempt.
    pub async fn sweep_residuals(&self, state: &mut PoolState, amm: &dyn AmmRouter) -> Amount {
        let tokens: Vec<(TokenId, Amount)> = state
            .residuals
            .iter()
            .map(|(token, amount)| (token.clone(), *amount))
            .collect();
        if tokens.is_empty() {
            return 0;
        }

        let deadline = match self.deadline(amm).await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "Cannot sweep residuals");
                return 0;
            }
        };

        let mut swept = 0;
        for (token, amount) in tokens {
            match self.swap(state, &token, &self.config.base, amount, deadline, amm).await {
                Ok(out) => {
                    swept += out;
                    debug!(token = %token, amount = %math::format_amount(amount), out = %math::format_amount(out), "Residual swept");
                }
                Err(e) => warn!(token = %token, error = %e, "Residual left unswept"),
            }
        }
        swept
    }

    // -- Internals ----------------------------------------------------------

    async fn deadline(&self, amm: &dyn AmmRouter) -> Result<u64, EngineError> {
        Ok(amm.now().await?.saturating_add(self.config.deadline_secs))
    }

    fn credit(&self, state: &mut PoolState, token: &TokenId, amount: Amount) -> Result<(), EngineError> {
        if token == &self.config.base {
            state.credit_idle(amount)
        } else {
            state.credit_residual(token, amount)
        }
    }

    fn debit(&self, state: &mut PoolState, token: &TokenId, amount: Amount) -> Result<(), EngineError> {
        if token == &self.config.base {
            state.debit_idle(amount)
        } else {
            state.debit_residual(token, amount)
        }
    }

    /// Reserves of `pair` ordered as `(token, other)`.
    async fn oriented_reserves(
        &self,
        pair: &PairAddress,
        token: &TokenId,
        amm: &dyn AmmRouter,
    ) -> Result<(Amount, Amount), EngineError> {
        let (token0, _) = amm.pair_tokens(pair).await?;
        let reserves = amm.get_reserves(pair).await?;
        if reserves.is_empty() {
            return Err(EngineError::NoLiquidity(pair.clone()));
        }
        if &token0 == token {
            Ok((reserves.reserve0, reserves.reserve1))
        } else {
            Ok((reserves.reserve1, reserves.reserve0))
        }
    }

    /// Exact-input swap that books both legs on `state`.
    async fn swap(
        &self,
        state: &mut PoolState,
        from: &TokenId,
        to: &TokenId,
        amount_in: Amount,
        deadline: u64,
        amm: &dyn AmmRouter,
    ) -> Result<Amount, EngineError> {
        let route = amm.pair_for(from, to).await?.ok_or_else(|| EngineError::NoRoute {
            from: from.clone(),
            to: to.clone(),
        })?;
        let (reserve_in, reserve_out) = self.oriented_reserves(&route, from, amm).await?;
        let expected = math::get_amount_out(amount_in, reserve_in, reserve_out)?;
        let amount_out = amm
            .swap_exact_in(
                from,
                to,
                amount_in,
                math::apply_slippage(expected, self.config.slippage_bps),
                &self.config.account,
                deadline,
            )
            .await?;
        self.debit(state, from, amount_in)?;
        self.credit(state, to, amount_out)?;
        Ok(amount_out)
    }

    /// Convert `amount` of base into both sides of `pair` and provide
    /// liquidity. Returns the LP tokens minted.
    async fn acquire(
        &self,
        staged: &mut PoolState,
        pair: &TrackedPair,
        amount: Amount,
        deadline: u64,
        amm: &dyn AmmRouter,
    ) -> Result<Amount, EngineError> {
        let base = &self.config.base;
        match pair.counterpart(base) {
            Some(other) => {
                // Single-sided zap: swap just enough that the remainder and
                // the output match the post-swap ratio.
                let (reserve_base, _) = self.oriented_reserves(&pair.address, base, amm).await?;
                let swap_in = math::optimal_swap_amount(amount, reserve_base)?;
                self.swap(staged, base, other, swap_in, deadline, amm).await?;
                let other_amount = staged.residual(other);
                self.provide(staged, pair, (base, amount - swap_in), (other, other_amount), deadline, amm)
                    .await
            }
            None => {
                let half = amount / 2;
                self.swap(staged, base, &pair.token0, half, deadline, amm).await?;
                self.swap(staged, base, &pair.token1, amount - half, deadline, amm).await?;
                let amount0 = staged.residual(&pair.token0);
                let amount1 = staged.residual(&pair.token1);
                self.provide(
                    staged,
                    pair,
                    (&pair.token0, amount0),
                    (&pair.token1, amount1),
                    deadline,
                    amm,
                )
                .await
            }
        }
    }

    async fn provide(
        &self,
        staged: &mut PoolState,
        pair: &TrackedPair,
        (token_a, desired_a): (&TokenId, Amount),
        (token_b, desired_b): (&TokenId, Amount),
        deadline: u64,
        amm: &dyn AmmRouter,
    ) -> Result<Amount, EngineError> {
        let (reserve_a, reserve_b) = self.oriented_reserves(&pair.address, token_a, amm).await?;
        let (expected_a, expected_b) =
            math::optimal_liquidity_amounts(desired_a, desired_b, reserve_a, reserve_b)?;

        let receipt = amm
            .add_liquidity(AddLiquidity {
                token_a: token_a.clone(),
                token_b: token_b.clone(),
                amount_a_desired: desired_a,
                amount_b_desired: desired_b,
                amount_a_min: math::apply_slippage(expected_a, self.config.slippage_bps),
                amount_b_min: math::apply_slippage(expected_b, self.config.slippage_bps),
                to: self.config.account.clone(),
                deadline,
            })
            .await?;

        self.debit(staged, token_a, receipt.amount_a)?;
        self.debit(staged, token_b, receipt.amount_b)?;

        match staged.position.as_mut() {
            Some(position) => {
                position.liquidity = position
                    .liquidity
                    .checked_add(receipt.liquidity)
                    .ok_or(EngineError::MathOverflow)?;
            }
            None => {
                staged.position = Some(Position {
                    pair: pair.address.clone(),
                    token0: pair.token0.clone(),
                    token1: pair.token1.clone(),
                    liquidity: receipt.liquidity,
                    opened_at: amm.now().await?,
                });
            }
        }

        debug!(
            pair = %pair.address,
            amount_a = %math::format_amount(receipt.amount_a),
            amount_b = %math::format_amount(receipt.amount_b),
            liquidity = %math::format_amount(receipt.liquidity),
            "Liquidity provided"
        );
        Ok(receipt.liquidity)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
