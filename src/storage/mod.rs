//! Persistence layer.
//!
//! Saves and loads the engine snapshot, the share ledger and (in paper
//! mode) the simulated AMM book to one JSON file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::amm::simulated::{AmmBook, SimulatedAmm};
use crate::engine::{LiquidityManager, VaultSnapshot};
use crate::ledger::{LedgerBook, ShareBook};
use crate::math;

/// Default state file path.
pub const DEFAULT_STATE_FILE: &str = "dalp_state.json";

/// Everything written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DalpState {
    pub vault: VaultSnapshot,
    pub ledger: LedgerBook,
    /// Present when running against the paper AMM.
    #[serde(default)]
    pub paper_amm: Option<AmmBook>,
}

/// Save state to a JSON file. The file is written to a sibling temp path
/// and renamed into place.
pub fn save_state(state: &DalpState, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    let json = serde_json::to_string_pretty(state).context("Failed to serialise state")?;

    let tmp = format!("{path}.tmp");
    std::fs::write(&tmp, &json).context(format!("Failed to write state to {tmp}"))?;
    std::fs::rename(&tmp, path).context(format!("Failed to move state into {path}"))?;

    debug!(
        path,
        idle = %math::format_amount(state.vault.pool.idle),
        allocation = %state.vault.pool.allocation(),
        "State saved"
    );
    Ok(())
}

/// Load state from a JSON file.
/// Returns None if the file doesn't exist (fresh start).
pub fn load_state(path: Option<&str>) -> Result<Option<DalpState>> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);

    if !Path::new(path).exists() {
        info!(path, "No saved state found, starting fresh");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path).context(format!("Failed to read state from {path}"))?;
    let state: DalpState =
        serde_json::from_str(&json).context(format!("Failed to parse state from {path}"))?;

    info!(
        path,
        allocation = %state.vault.pool.allocation(),
        idle = %math::format_amount(state.vault.pool.idle),
        shares = %math::format_amount(state.ledger.total_supply),
        observations = state.vault.observations.len(),
        paper = state.paper_amm.is_some(),
        "State loaded from disk"
    );

    Ok(Some(state))
}

/// Delete the state file (for testing or reset).
pub fn delete_state(path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    if Path::new(path).exists() {
        std::fs::remove_file(path).context(format!("Failed to delete state file {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// State store
// ---------------------------------------------------------------------------

/// Everything needed to write a `DalpState` for a running manager.
#[derive(Clone)]
pub struct StateStore {
    path: String,
    ledger: Arc<ShareBook>,
    paper_amm: Option<Arc<SimulatedAmm>>,
    /// Shared by clones so the keeper and the dashboard never write at once.
    write_lock: Arc<Mutex<()>>,
}

impl StateStore {
    pub fn new(path: impl Into<String>, ledger: Arc<ShareBook>, paper_amm: Option<Arc<SimulatedAmm>>) -> Self {
        Self {
            path: path.into(),
            ledger,
            paper_amm,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Snapshot `manager`, the ledger and the paper book, and save them.
    pub async fn persist(&self, manager: &LiquidityManager) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let paper_amm = match &self.paper_amm {
            Some(amm) => Some(amm.book()?),
            None => None,
        };
        let state = DalpState {
            vault: manager.snapshot().await?,
            ledger: self.ledger.book()?,
            paper_amm,
        };
        save_state(&state, Some(&self.path))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
