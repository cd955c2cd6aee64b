//! Keeper cycle: refresh every oracle, then reallocate.
//!
//! The core has no timers of its own. A keeper calls `run_cycle` on
//! whatever schedule it likes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::controller::{ReallocationOutcome, ReallocationReport};
use super::{LiquidityManager, PairUpdate};
use crate::math;
use crate::oracle::UpdateOutcome;
use crate::types::{Amount, EngineError};

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_number: u64,
    pub updates: Vec<PairUpdate>,
    pub reallocation: ReallocationReport,
    pub total_value: Amount,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CycleReport {
    /// Pairs whose oracle closed a new window this cycle.
    pub fn windows_closed(&self) -> usize {
        self.updates
            .iter()
            .filter(|u| matches!(u.outcome, Some(UpdateOutcome::Updated { .. })))
            .count()
    }

    pub fn failed_updates(&self) -> usize {
        self.updates.iter().filter(|u| u.error.is_some()).count()
    }
}

/// Run one keeper cycle.
pub async fn run_cycle(manager: &LiquidityManager, cycle_number: u64) -> Result<CycleReport, EngineError> {
    let started_at = Utc::now();
    info!(cycle = cycle_number, "Starting cycle");

    let updates = manager.update_all().await?;
    let reallocation = manager.reallocate_liquidity().await?;
    let total_value = manager.total_value().await?;

    let report = CycleReport {
        cycle_number,
        updates,
        reallocation,
        total_value,
        started_at,
        finished_at: Utc::now(),
    };

    if report.failed_updates() > 0 {
        warn!(
            cycle = cycle_number,
            failed = report.failed_updates(),
            "Some oracle updates failed"
        );
    }
    info!(
        cycle = cycle_number,
        windows = report.windows_closed(),
        rated = report.reallocation.ratings.len(),
        outcome = outcome_label(&report.reallocation.outcome),
        nav = %math::format_amount(report.total_value),
        "Cycle complete"
    );

    Ok(report)
}

fn outcome_label(outcome: &ReallocationOutcome) -> &'static str {
    match outcome {
        ReallocationOutcome::NoCandidate => "no_candidate",
        ReallocationOutcome::Unchanged { .. } => "unchanged",
        ReallocationOutcome::Reallocated { .. } => "reallocated",
        ReallocationOutcome::NothingToDeploy { .. } => "nothing_to_deploy",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
