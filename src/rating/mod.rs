//! Pair rating.
//!
//! A pair's rating is its TWAP growth divided by its reserve depth:
//!
//! ```text
//! growth = current_twap * 1e18 / reference_twap      (1e18 == flat)
//! depth  = sqrt(reserve0 * reserve1)
//! rating = growth * 1e36 / depth
//! ```
//!
//! Two pairs with the same growth score differently when one already has
//! more capital in it; the shallower pair wins. Products are carried in 512
//! bits; a rating that does not fit 256 bits surfaces as `MathOverflow`.

use primitive_types::U256;
use serde::Serialize;
use tracing::debug;

use crate::amm::Reserves;
use crate::math::{self, wad};
use crate::oracle::PriceOracle;
use crate::types::{EngineError, PairAddress, Price, Rating, TrackedPair};

/// Rating with the inputs it was computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RatingBreakdown {
    pub pair: PairAddress,
    pub index: usize,
    pub current_twap: Price,
    pub reference_twap: Price,
    /// 1e18-scaled ratio of current to reference TWAP.
    pub growth: U256,
    pub depth: U256,
    pub rating: Rating,
}

#[derive(Debug, Clone, Default)]
pub struct PairRatingEngine;

impl PairRatingEngine {
    pub fn new() -> Self {
        Self
    }

    /// Rate `pair` from its oracle windows and current reserves.
    pub fn rate(
        &self,
        pair: &TrackedPair,
        oracle: &PriceOracle,
        reserves: &Reserves,
        now: u64,
    ) -> Result<RatingBreakdown, EngineError> {
        let (current, reference) = oracle.fresh_windows(pair, now)?;
        let current_twap = current.average(pair.side);
        let reference_twap = reference.average(pair.side);

        if reserves.is_empty() {
            return Err(EngineError::NoLiquidity(pair.address.clone()));
        }
        // A zero reference means the pair had no price over the whole window.
        if reference_twap.is_zero() {
            return Err(EngineError::StalePair {
                pair: pair.address.clone(),
            });
        }

        let growth = growth(current_twap, reference_twap)?;
        let depth = math::reserve_depth(reserves.reserve0, reserves.reserve1);
        let rating = rating_from(growth, depth)?;

        debug!(
            pair = %pair.address,
            growth = %growth,
            depth = %depth,
            rating = %rating,
            "Pair rated"
        );

        Ok(RatingBreakdown {
            pair: pair.address.clone(),
            index: pair.index,
            current_twap,
            reference_twap,
            growth,
            depth,
            rating,
        })
    }
}

/// `current * 1e18 / reference`.
pub fn growth(current: Price, reference: Price) -> Result<U256, EngineError> {
    math::mul_div(current, wad(), reference)
}

/// `growth * 1e36 / depth`.
pub fn rating_from(growth: U256, depth: U256) -> Result<Rating, EngineError> {
    if depth.is_zero() {
        return Err(EngineError::DivisionByZero);
    }
    let scale = wad() * wad();
    math::mul_div(growth, scale, depth).map(Rating)
}

/// Highest rating; ties go to the lowest pair index.
pub fn select_best(ratings: &[RatingBreakdown]) -> Option<&RatingBreakdown> {
    ratings.iter().fold(None, |best: Option<&RatingBreakdown>, candidate| match best {
        Some(b) if b.rating > candidate.rating => Some(b),
        Some(b) if b.rating == candidate.rating && b.index <= candidate.index => Some(b),
        _ => Some(candidate),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
