//! Net asset value and share issuance.
//!
//! NAV is the idle base balance plus the position and any residual tokens
//! marked to base at current reserves. Shares are minted against NAV so
//! that a deposit never dilutes existing holders, and redeemed against it
//! so a holder gets back exactly their fraction.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::amm::AmmRouter;
use crate::ledger::ShareLedger;
use crate::math;
use crate::types::{Amount, EngineError, PoolState, Position, TokenId};

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MintReceipt {
    pub id: Uuid,
    pub account: String,
    pub deposit: Amount,
    pub shares: Amount,
    pub nav_before: Amount,
    pub supply_before: Amount,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedeemReceipt {
    pub id: Uuid,
    pub account: String,
    pub shares: Amount,
    pub payout: Amount,
    pub nav_before: Amount,
    pub supply_before: Amount,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Share arithmetic
// ---------------------------------------------------------------------------

/// Shares owed for `deposit` given the supply and NAV before the deposit.
/// The first deposit into an unissued pool mints 1:1. A deposit too small
/// to mint one share fails with the smallest deposit that would.
pub fn calculate_mint_amount(
    deposit: Amount,
    total_supply: Amount,
    total_value: Amount,
) -> Result<Amount, EngineError> {
    if deposit == 0 {
        return Err(EngineError::ZeroDeposit);
    }
    if total_supply == 0 {
        return Ok(deposit);
    }
    let shares = math::mul_div_amount(deposit, total_supply, total_value)?;
    if shares == 0 {
        return Err(EngineError::InsufficientAmount {
            amount: deposit,
            minimum: total_value.div_ceil(total_supply),
        });
    }
    Ok(shares)
}

/// Base owed for burning `shares` out of `total_supply`.
pub fn calculate_redeem_amount(
    shares: Amount,
    total_supply: Amount,
    total_value: Amount,
) -> Result<Amount, EngineError> {
    if shares == 0 {
        return Err(EngineError::InsufficientAmount {
            amount: 0,
            minimum: 1,
        });
    }
    if shares > total_supply {
        return Err(EngineError::InsufficientShares {
            needed: shares,
            available: total_supply,
        });
    }
    math::mul_div_amount(shares, total_value, total_supply)
}

// ---------------------------------------------------------------------------
// Accountant
// ---------------------------------------------------------------------------

pub struct NavAccountant {
    base: TokenId,
}

impl NavAccountant {
    pub fn new(base: TokenId) -> Self {
        Self { base }
    }

    /// Everything the pool holds, in base units.
    ///
    /// The position is marked at spot. Residual tokens are marked at what
    /// a swap into base would return, so dust that cannot be sold is
    /// worth nothing.
    pub async fn total_value(&self, state: &PoolState, amm: &dyn AmmRouter) -> Result<Amount, EngineError> {
        let mut total = state.idle;
        if let Some(position) = &state.position {
            let value = self.position_value(position, amm).await?;
            total = total.checked_add(value).ok_or(EngineError::MathOverflow)?;
        }
        for (token, amount) in &state.residuals {
            let value = self.exit_value(token, *amount, amm).await?;
            total = total.checked_add(value).ok_or(EngineError::MathOverflow)?;
        }
        Ok(total)
    }

    /// The position's share of the pair reserves, marked to base.
    pub async fn position_value(&self, position: &Position, amm: &dyn AmmRouter) -> Result<Amount, EngineError> {
        let supply = amm.lp_total_supply(&position.pair).await?;
        if supply == 0 || position.liquidity == 0 {
            return Ok(0);
        }
        let reserves = amm.get_reserves(&position.pair).await?;
        let amount0 = math::mul_div_amount(position.liquidity, reserves.reserve0, supply)?;
        let amount1 = math::mul_div_amount(position.liquidity, reserves.reserve1, supply)?;
        let value0 = self.value_in_base(&position.token0, amount0, amm).await?;
        let value1 = self.value_in_base(&position.token1, amount1, amm).await?;
        value0.checked_add(value1).ok_or(EngineError::MathOverflow)
    }

    /// Spot value of `amount` of `token` at the reserves of its base pair.
    pub async fn value_in_base(
        &self,
        token: &TokenId,
        amount: Amount,
        amm: &dyn AmmRouter,
    ) -> Result<Amount, EngineError> {
        if token == &self.base || amount == 0 {
            return Ok(amount);
        }
        let (reserve_token, reserve_base) = self.base_reserves(token, amm).await?;
        math::quote(amount, reserve_token, reserve_base)
    }

    /// Base a swap of `amount` of `token` would return, fee included.
    pub async fn exit_value(
        &self,
        token: &TokenId,
        amount: Amount,
        amm: &dyn AmmRouter,
    ) -> Result<Amount, EngineError> {
        if token == &self.base || amount == 0 {
            return Ok(amount);
        }
        let (reserve_token, reserve_base) = self.base_reserves(token, amm).await?;
        math::get_amount_out(amount, reserve_token, reserve_base)
    }

    /// Reserves of `token`'s base pair as `(token, base)`.
    async fn base_reserves(&self, token: &TokenId, amm: &dyn AmmRouter) -> Result<(Amount, Amount), EngineError> {
        let pair = amm
            .pair_for(token, &self.base)
            .await?
            .ok_or_else(|| EngineError::NoRoute {
                from: token.clone(),
                to: self.base.clone(),
            })?;
        let (token0, _) = amm.pair_tokens(&pair).await?;
        let reserves = amm.get_reserves(&pair).await?;
        let oriented = if &token0 == token {
            (reserves.reserve0, reserves.reserve1)
        } else {
            (reserves.reserve1, reserves.reserve0)
        };
        if oriented.0 == 0 || oriented.1 == 0 {
            return Err(EngineError::NoLiquidity(pair));
        }
        Ok(oriented)
    }

    /// Issue shares for a deposit of `amount` base. The deposit is only
    /// booked once the ledger has minted.
    pub async fn mint(
        &self,
        state: &mut PoolState,
        ledger: &dyn ShareLedger,
        amm: &dyn AmmRouter,
        depositor: &str,
        amount: Amount,
    ) -> Result<MintReceipt, EngineError> {
        if amount == 0 {
            return Err(EngineError::ZeroDeposit);
        }
        let supply = ledger.total_supply().await?;
        let nav = if supply == 0 {
            0
        } else {
            self.total_value(state, amm).await?
        };
        let shares = calculate_mint_amount(amount, supply, nav)?;

        let mut staged = state.clone();
        staged.credit_idle(amount)?;
        ledger.mint(depositor, shares).await?;
        *state = staged;

        info!(
            account = depositor,
            deposit = %math::format_amount(amount),
            shares = %math::format_amount(shares),
            nav = %math::format_amount(nav),
            "Shares minted"
        );
        Ok(MintReceipt {
            id: Uuid::new_v4(),
            account: depositor.to_string(),
            deposit: amount,
            shares,
            nav_before: nav,
            supply_before: supply,
            timestamp: Utc::now(),
        })
    }

    /// Base a holder would receive for `shares` right now.
    pub async fn quote_redeem(
        &self,
        state: &PoolState,
        ledger: &dyn ShareLedger,
        amm: &dyn AmmRouter,
        shares: Amount,
    ) -> Result<Amount, EngineError> {
        let supply = ledger.total_supply().await?;
        let nav = self.total_value(state, amm).await?;
        calculate_redeem_amount(shares, supply, nav)
    }

    /// Burn `shares` and pay the holder out of idle.
    pub async fn redeem(
        &self,
        state: &mut PoolState,
        ledger: &dyn ShareLedger,
        amm: &dyn AmmRouter,
        holder: &str,
        shares: Amount,
    ) -> Result<RedeemReceipt, EngineError> {
        let balance = ledger.balance_of(holder).await?;
        if balance < shares {
            return Err(EngineError::InsufficientShares {
                needed: shares,
                available: balance,
            });
        }
        let supply = ledger.total_supply().await?;
        let nav = self.total_value(state, amm).await?;
        let payout = calculate_redeem_amount(shares, supply, nav)?;

        let mut staged = state.clone();
        staged.debit_idle(payout)?;
        ledger.burn(holder, shares).await?;
        *state = staged;

        info!(
            account = holder,
            shares = %math::format_amount(shares),
            payout = %math::format_amount(payout),
            "Shares redeemed"
        );
        Ok(RedeemReceipt {
            id: Uuid::new_v4(),
            account: holder.to_string(),
            shares,
            payout,
            nav_before: nav,
            supply_before: supply,
            timestamp: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
