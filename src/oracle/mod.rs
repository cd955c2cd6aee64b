//! Time-weighted average price oracle.
//!
//! Keeps one slot per tracked pair: the last accumulator sample plus the two
//! most recent completed averaging windows. `update` is safe to poll: a call
//! made before `period` has elapsed since the last sample changes nothing.
//! Requiring a full period per window means a manipulator has to hold a
//! skewed price for the whole period to move the average.

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::amm::AmmRouter;
use crate::math;
use crate::types::{EngineError, PairAddress, Price, PriceObservation, PriceSide, TrackedPair};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Minimum seconds between two samples of the same pair.
    pub period: u64,
    /// Oldest sample (seconds) a rating will still accept.
    pub max_observation_age: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            period: 3_600,
            max_observation_age: 2 * 3_600,
        }
    }
}

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

/// Average prices over one completed window `[start, end]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceWindow {
    pub price0_average: Price,
    pub price1_average: Price,
    pub start: u64,
    pub end: u64,
}

impl PriceWindow {
    pub fn average(&self, side: PriceSide) -> Price {
        match side {
            PriceSide::Price0 => self.price0_average,
            PriceSide::Price1 => self.price1_average,
        }
    }
}

/// Oracle state of one pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleSlot {
    pub observation: PriceObservation,
    /// Most recent completed window.
    pub current: Option<PriceWindow>,
    /// The window before `current`; the growth reference.
    pub reference: Option<PriceWindow>,
}

/// Result of an `update` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// First sample recorded; no average yet.
    Initialized { timestamp: u64 },
    /// A new window completed.
    Updated { window: PriceWindow },
    /// Less than `period` since the last sample; nothing changed.
    Skipped { elapsed: u64 },
}

// ---------------------------------------------------------------------------
// Oracle
// ---------------------------------------------------------------------------

/// TWAP oracle over the fixed pair allow-list.
#[derive(Debug, Clone)]
pub struct PriceOracle {
    config: OracleConfig,
    slots: BTreeMap<PairAddress, OracleSlot>,
}

impl PriceOracle {
    pub fn new(config: OracleConfig) -> Self {
        Self {
            config,
            slots: BTreeMap::new(),
        }
    }

    /// Rebuild from persisted slots.
    pub fn with_slots(config: OracleConfig, slots: BTreeMap<PairAddress, OracleSlot>) -> Self {
        Self { config, slots }
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    pub fn slots(&self) -> &BTreeMap<PairAddress, OracleSlot> {
        &self.slots
    }

    pub fn slot(&self, pair: &PairAddress) -> Option<&OracleSlot> {
        self.slots.get(pair)
    }

    /// Sample `pair`'s accumulators and, if a full period has elapsed since
    /// the last sample, close a new averaging window.
    pub async fn update(
        &mut self,
        pair: &TrackedPair,
        amm: &dyn AmmRouter,
    ) -> Result<UpdateOutcome, EngineError> {
        let sample = amm.cumulative_prices(&pair.address).await?;
        let observation = PriceObservation {
            price0_cumulative: sample.price0_cumulative,
            price1_cumulative: sample.price1_cumulative,
            timestamp: sample.timestamp,
        };

        let Some(slot) = self.slots.get_mut(&pair.address) else {
            info!(pair = %pair.address, timestamp = sample.timestamp, "Oracle initialised");
            self.slots.insert(
                pair.address.clone(),
                OracleSlot {
                    observation,
                    current: None,
                    reference: None,
                },
            );
            return Ok(UpdateOutcome::Initialized {
                timestamp: sample.timestamp,
            });
        };

        let elapsed = sample.timestamp.saturating_sub(slot.observation.timestamp);
        if elapsed < self.config.period {
            debug!(
                pair = %pair.address,
                elapsed,
                period = self.config.period,
                "Oracle update skipped, period not elapsed"
            );
            return Ok(UpdateOutcome::Skipped { elapsed });
        }

        let window = PriceWindow {
            price0_average: average(slot.observation.price0_cumulative, observation.price0_cumulative, elapsed),
            price1_average: average(slot.observation.price1_cumulative, observation.price1_cumulative, elapsed),
            start: slot.observation.timestamp,
            end: observation.timestamp,
        };

        slot.reference = slot.current.take();
        slot.current = Some(window.clone());
        slot.observation = observation;

        info!(
            pair = %pair.address,
            twap = %window.average(pair.side),
            elapsed,
            "Oracle updated"
        );
        Ok(UpdateOutcome::Updated { window })
    }

    /// Most recent TWAP of `pair` on its tracked side.
    pub fn consult(&self, pair: &TrackedPair) -> Result<Price, EngineError> {
        self.slots
            .get(&pair.address)
            .and_then(|s| s.current.as_ref())
            .map(|w| w.average(pair.side))
            .ok_or_else(|| EngineError::StalePair {
                pair: pair.address.clone(),
            })
    }

    /// The `(current, reference)` windows of a pair, provided the pair can be
    /// rated at `now`.
    ///
    /// `StalePair`: never averaged, or last sample older than
    /// `max_observation_age`. `ObservationNotFresh`: only one window is
    /// complete, so there is no reference to measure growth against.
    pub fn fresh_windows(
        &self,
        pair: &TrackedPair,
        now: u64,
    ) -> Result<(&PriceWindow, &PriceWindow), EngineError> {
        let stale = || EngineError::StalePair {
            pair: pair.address.clone(),
        };
        let slot = self.slots.get(&pair.address).ok_or_else(stale)?;
        let current = slot.current.as_ref().ok_or_else(stale)?;

        let age = now.saturating_sub(slot.observation.timestamp);
        if age > self.config.max_observation_age {
            return Err(stale());
        }

        let reference = slot
            .reference
            .as_ref()
            .ok_or_else(|| EngineError::ObservationNotFresh {
                pair: pair.address.clone(),
                elapsed: age,
                period: self.config.period,
            })?;
        Ok((current, reference))
    }

    pub fn is_fresh(&self, pair: &TrackedPair, now: u64) -> bool {
        self.fresh_windows(pair, now).is_ok()
    }
}

/// `(end - start) / elapsed` with wrap-around accumulators.
fn average(start: U256, end: U256, elapsed: u64) -> Price {
    let (delta, _) = end.overflowing_sub(start);
    delta / U256::from(elapsed.max(1))
}

/// Human-readable price (whole units).
pub fn format_price(price: Price) -> String {
    match math::to_amount(price) {
        Ok(units) => math::format_amount(units),
        Err(_) => price.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
