//! Core engine: the liquidity manager and its operational surface.
//!
//! `LiquidityManager` owns the pool state and the oracle behind a single
//! async mutex, so every operation runs to completion before the next one
//! starts. A call made from inside a running operation on the same task
//! (an AMM or ledger callback, say) is rejected with `ReentrantCall`
//! instead of deadlocking on the mutex.

pub mod accountant;
pub mod controller;
pub mod keeper;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::amm::{AmmRouter, Reserves};
use crate::ledger::ShareLedger;
use crate::math::{self, WAD};
use crate::oracle::{OracleConfig, OracleSlot, PriceOracle, UpdateOutcome};
use crate::rating::{PairRatingEngine, RatingBreakdown};
use crate::types::{
    AllocationState, Amount, EngineError, PairAddress, PoolState, Position, Price, TokenId,
    TrackedPair,
};

use accountant::{MintReceipt, NavAccountant, RedeemReceipt};
use controller::{AllocationController, ControllerConfig, DeployReceipt, ReallocationReport};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub base_asset: TokenId,
    /// Account that holds the pool's LP tokens on the AMM.
    pub account: String,
    pub oracle: OracleConfig,
    pub slippage_bps: u32,
    pub deadline_secs: u64,
    pub dust_threshold: Amount,
}

impl EngineConfig {
    pub fn new(base_asset: TokenId) -> Self {
        Self {
            base_asset,
            account: "dalp-pool".to_string(),
            oracle: OracleConfig::default(),
            slippage_bps: 50,
            deadline_secs: 300,
            dust_threshold: WAD / 1_000,
        }
    }
}

// ---------------------------------------------------------------------------
// State and views
// ---------------------------------------------------------------------------

/// Everything the manager mutates.
#[derive(Debug, Clone)]
pub struct EngineState {
    pub pool: PoolState,
    pub oracle: PriceOracle,
}

/// Durable form of the engine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSnapshot {
    pub pool: PoolState,
    pub observations: BTreeMap<PairAddress, OracleSlot>,
    pub saved_at: DateTime<Utc>,
}

/// Result of updating one pair's oracle.
#[derive(Debug, Clone, Serialize)]
pub struct PairUpdate {
    pub pair: PairAddress,
    pub outcome: Option<UpdateOutcome>,
    pub error: Option<String>,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct VaultStatus {
    pub allocation: AllocationState,
    pub active_pair: Option<(TokenId, TokenId)>,
    pub idle: Amount,
    pub position: Option<Position>,
    pub residuals: BTreeMap<TokenId, Amount>,
    pub total_value: Amount,
    pub total_supply: Amount,
    /// NAV per share, 1e18-scaled. 1e18 before any shares exist.
    pub share_price: Amount,
}

/// Per-pair market view.
#[derive(Debug, Clone, Serialize)]
pub struct PairReport {
    pub pair: TrackedPair,
    pub reserves: Option<Reserves>,
    pub twap: Option<Price>,
    pub rating: Option<RatingBreakdown>,
    pub status: String,
}

// ---------------------------------------------------------------------------
// Reentrancy guard
// ---------------------------------------------------------------------------

tokio::task_local! {
    static ACTIVE_OPERATION: &'static str;
}

/// Run `body` as `operation`, refusing to start if this task is already
/// inside an operation.
async fn exclusive<T, F>(operation: &'static str, body: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    if let Ok(active) = ACTIVE_OPERATION.try_with(|op| *op) {
        warn!(operation, active, "Reentrant call rejected");
        return Err(EngineError::ReentrantCall {
            operation: active.to_string(),
        });
    }
    ACTIVE_OPERATION.scope(operation, body).await
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct LiquidityManager {
    config: EngineConfig,
    pairs: Vec<TrackedPair>,
    state: Mutex<EngineState>,
    controller: AllocationController,
    accountant: NavAccountant,
    rater: PairRatingEngine,
    amm: Arc<dyn AmmRouter>,
    ledger: Arc<dyn ShareLedger>,
}

impl std::fmt::Debug for LiquidityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiquidityManager")
            .field("config", &self.config)
            .field("pairs", &self.pairs)
            .finish_non_exhaustive()
    }
}

impl LiquidityManager {
    /// Build a manager over a fixed allow-list of pair addresses. Token
    /// identities are read from the AMM; the list order sets each pair's
    /// tie-break index.
    pub async fn new(
        config: EngineConfig,
        pair_addresses: &[PairAddress],
        amm: Arc<dyn AmmRouter>,
        ledger: Arc<dyn ShareLedger>,
    ) -> Result<Self, EngineError> {
        if pair_addresses.is_empty() {
            return Err(EngineError::Config("at least one pair must be tracked".into()));
        }
        let mut seen = BTreeSet::new();
        let mut pairs = Vec::with_capacity(pair_addresses.len());
        for (index, address) in pair_addresses.iter().enumerate() {
            if !seen.insert(address.clone()) {
                return Err(EngineError::Config(format!("pair {address} listed twice")));
            }
            let (token0, token1) = amm.pair_tokens(address).await?;
            pairs.push(TrackedPair::new(
                index,
                address.clone(),
                token0,
                token1,
                &config.base_asset,
            ));
        }

        info!(
            base = %config.base_asset,
            pairs = pairs.len(),
            period = config.oracle.period,
            "Liquidity manager ready"
        );

        Ok(Self {
            controller: AllocationController::new(ControllerConfig {
                base: config.base_asset.clone(),
                account: config.account.clone(),
                slippage_bps: config.slippage_bps,
                deadline_secs: config.deadline_secs,
                dust_threshold: config.dust_threshold,
            }),
            accountant: NavAccountant::new(config.base_asset.clone()),
            rater: PairRatingEngine::new(),
            state: Mutex::new(EngineState {
                pool: PoolState::default(),
                oracle: PriceOracle::new(config.oracle),
            }),
            config,
            pairs,
            amm,
            ledger,
        })
    }

    /// Replace the in-memory state with a saved snapshot. Oracle slots of
    /// pairs no longer tracked are dropped.
    pub fn with_snapshot(mut self, snapshot: VaultSnapshot) -> Self {
        let tracked: BTreeSet<&PairAddress> = self.pairs.iter().map(|p| &p.address).collect();
        let observations: BTreeMap<PairAddress, OracleSlot> = snapshot
            .observations
            .into_iter()
            .filter(|(pair, _)| tracked.contains(pair))
            .collect();
        if let Some(active) = snapshot.pool.active_pair() {
            if !tracked.contains(active) {
                warn!(pair = %active, "Restored position is in an untracked pair");
            }
        }
        info!(
            pool = %snapshot.pool,
            observations = observations.len(),
            saved_at = %snapshot.saved_at,
            "Engine state restored"
        );
        *self.state.get_mut() = EngineState {
            pool: snapshot.pool,
            oracle: PriceOracle::with_slots(self.config.oracle, observations),
        };
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pairs(&self) -> &[TrackedPair] {
        &self.pairs
    }

    pub fn amm(&self) -> &Arc<dyn AmmRouter> {
        &self.amm
    }

    pub fn ledger(&self) -> &Arc<dyn ShareLedger> {
        &self.ledger
    }

    fn tracked(&self, pair: &PairAddress) -> Result<&TrackedPair, EngineError> {
        self.pairs
            .iter()
            .find(|p| &p.address == pair)
            .ok_or_else(|| EngineError::UnknownPair(pair.to_string()))
    }

    fn tracked_by_tokens(&self, a: &TokenId, b: &TokenId) -> Result<&TrackedPair, EngineError> {
        self.pairs
            .iter()
            .find(|p| p.counterpart(a) == Some(b))
            .ok_or_else(|| EngineError::UnknownPair(format!("{a}/{b}")))
    }

    // -- Oracle -------------------------------------------------------------

    /// Sample one pair's accumulators.
    pub async fn update(&self, pair: &PairAddress) -> Result<UpdateOutcome, EngineError> {
        let pair = self.tracked(pair)?;
        exclusive("update", async {
            let mut state = self.state.lock().await;
            state.oracle.update(pair, self.amm.as_ref()).await
        })
        .await
    }

    /// Sample every tracked pair. One pair failing does not stop the rest.
    pub async fn update_all(&self) -> Result<Vec<PairUpdate>, EngineError> {
        exclusive("update_all", async {
            let mut state = self.state.lock().await;
            let mut updates = Vec::with_capacity(self.pairs.len());
            for pair in &self.pairs {
                let update = match state.oracle.update(pair, self.amm.as_ref()).await {
                    Ok(outcome) => PairUpdate {
                        pair: pair.address.clone(),
                        outcome: Some(outcome),
                        error: None,
                    },
                    Err(e) => {
                        warn!(pair = %pair.address, error = %e, "Oracle update failed");
                        PairUpdate {
                            pair: pair.address.clone(),
                            outcome: None,
                            error: Some(e.to_string()),
                        }
                    }
                };
                updates.push(update);
            }
            Ok(updates)
        })
        .await
    }

    /// Most recent TWAP of `pair`.
    pub async fn consult(&self, pair: &PairAddress) -> Result<Price, EngineError> {
        let pair = self.tracked(pair)?;
        exclusive("consult", async {
            let state = self.state.lock().await;
            state.oracle.consult(pair)
        })
        .await
    }

    /// Rate `pair` at current reserves.
    pub async fn rate(&self, pair: &PairAddress) -> Result<RatingBreakdown, EngineError> {
        let pair = self.tracked(pair)?;
        exclusive("rate", async {
            let state = self.state.lock().await;
            let now = self.amm.now().await?;
            let reserves = self.amm.get_reserves(&pair.address).await?;
            self.rater.rate(pair, &state.oracle, &reserves, now)
        })
        .await
    }

    // -- Allocation ---------------------------------------------------------

    /// Move the pool into the best-rated pair.
    pub async fn reallocate_liquidity(&self) -> Result<ReallocationReport, EngineError> {
        exclusive("reallocate_liquidity", async {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            self.controller
                .reallocate(
                    &mut state.pool,
                    &self.pairs,
                    &state.oracle,
                    &self.rater,
                    self.amm.as_ref(),
                )
                .await
        })
        .await
    }

    /// Deploy idle base into the tracked pair trading `token_a` against
    /// `token_b`. `None` deploys the whole idle balance.
    pub async fn add_liquidity(
        &self,
        token_a: &TokenId,
        token_b: &TokenId,
        amount: Option<Amount>,
    ) -> Result<DeployReceipt, EngineError> {
        let pair = self.tracked_by_tokens(token_a, token_b)?;
        exclusive("add_liquidity", async {
            let mut state = self.state.lock().await;
            let amount = amount.unwrap_or(state.pool.idle);
            self.controller
                .deploy(&mut state.pool, pair, amount, self.amm.as_ref())
                .await
        })
        .await
    }

    /// Tokens of the active pair, or `None` while idle.
    pub async fn get_active_pair(&self) -> Result<Option<(TokenId, TokenId)>, EngineError> {
        exclusive("get_active_pair", async {
            let state = self.state.lock().await;
            Ok(state
                .pool
                .position
                .as_ref()
                .map(|p| (p.token0.clone(), p.token1.clone())))
        })
        .await
    }

    // -- Accounting ---------------------------------------------------------

    pub async fn total_value(&self) -> Result<Amount, EngineError> {
        exclusive("total_value", async {
            let state = self.state.lock().await;
            self.accountant.total_value(&state.pool, self.amm.as_ref()).await
        })
        .await
    }

    /// Shares a deposit of `amount` would mint right now.
    pub async fn calculate_mint_amount(&self, amount: Amount) -> Result<Amount, EngineError> {
        exclusive("calculate_mint_amount", async {
            let state = self.state.lock().await;
            let supply = self.ledger.total_supply().await?;
            let nav = if supply == 0 {
                0
            } else {
                self.accountant.total_value(&state.pool, self.amm.as_ref()).await?
            };
            accountant::calculate_mint_amount(amount, supply, nav)
        })
        .await
    }

    /// Deposit `amount` base for `depositor`. Does not deploy it.
    pub async fn mint(&self, depositor: &str, amount: Amount) -> Result<MintReceipt, EngineError> {
        exclusive("mint", async {
            let mut state = self.state.lock().await;
            self.accountant
                .mint(
                    &mut state.pool,
                    self.ledger.as_ref(),
                    self.amm.as_ref(),
                    depositor,
                    amount,
                )
                .await
        })
        .await
    }

    /// Base `shares` would redeem for right now.
    pub async fn calculate_redeem_amount(&self, shares: Amount) -> Result<Amount, EngineError> {
        exclusive("calculate_redeem_amount", async {
            let state = self.state.lock().await;
            self.accountant
                .quote_redeem(&state.pool, self.ledger.as_ref(), self.amm.as_ref(), shares)
                .await
        })
        .await
    }

    /// Burn `shares` from `holder` and pay out of idle. When idle cannot
    /// cover the payout the active position is withdrawn first (or, while
    /// idle, residual tokens are swept into base); the next reallocation
    /// redeploys what is left.
    pub async fn redeem(&self, holder: &str, shares: Amount) -> Result<RedeemReceipt, EngineError> {
        exclusive("redeem", async {
            let mut state = self.state.lock().await;
            let held = self.ledger.balance_of(holder).await?;
            if held < shares {
                return Err(EngineError::InsufficientShares {
                    needed: shares,
                    available: held,
                });
            }

            let owed = self
                .accountant
                .quote_redeem(&state.pool, self.ledger.as_ref(), self.amm.as_ref(), shares)
                .await?;
            if owed > state.pool.idle && state.pool.position.is_some() {
                info!(
                    owed = %math::format_amount(owed),
                    idle = %math::format_amount(state.pool.idle),
                    "Withdrawing position to cover redemption"
                );
                self.controller
                    .withdraw(&mut state.pool, self.amm.as_ref())
                    .await?;
            } else if owed > state.pool.idle && !state.pool.residuals.is_empty() {
                info!(
                    owed = %math::format_amount(owed),
                    idle = %math::format_amount(state.pool.idle),
                    "Sweeping residuals to cover redemption"
                );
                self.controller
                    .sweep_residuals(&mut state.pool, self.amm.as_ref())
                    .await;
            }

            self.accountant
                .redeem(
                    &mut state.pool,
                    self.ledger.as_ref(),
                    self.amm.as_ref(),
                    holder,
                    shares,
                )
                .await
        })
        .await
    }

    // -- Views --------------------------------------------------------------

    pub async fn pool_state(&self) -> Result<PoolState, EngineError> {
        exclusive("pool_state", async { Ok(self.state.lock().await.pool.clone()) }).await
    }

    pub async fn snapshot(&self) -> Result<VaultSnapshot, EngineError> {
        exclusive("snapshot", async {
            let state = self.state.lock().await;
            Ok(VaultSnapshot {
                pool: state.pool.clone(),
                observations: state.oracle.slots().clone(),
                saved_at: Utc::now(),
            })
        })
        .await
    }

    pub async fn status(&self) -> Result<VaultStatus, EngineError> {
        exclusive("status", async {
            let state = self.state.lock().await;
            let total_value = self.accountant.total_value(&state.pool, self.amm.as_ref()).await?;
            let total_supply = self.ledger.total_supply().await?;
            let share_price = if total_supply == 0 {
                WAD
            } else {
                math::mul_div_amount(total_value, WAD, total_supply)?
            };
            Ok(VaultStatus {
                allocation: state.pool.allocation(),
                active_pair: state
                    .pool
                    .position
                    .as_ref()
                    .map(|p| (p.token0.clone(), p.token1.clone())),
                idle: state.pool.idle,
                position: state.pool.position.clone(),
                residuals: state.pool.residuals.clone(),
                total_value,
                total_supply,
                share_price,
            })
        })
        .await
    }

    /// Reserves, TWAP and rating of every tracked pair.
    pub async fn pair_reports(&self) -> Result<Vec<PairReport>, EngineError> {
        exclusive("pair_reports", async {
            let state = self.state.lock().await;
            let now = self.amm.now().await?;
            let reserves = join_all(
                self.pairs
                    .iter()
                    .map(|p| self.amm.get_reserves(&p.address)),
            )
            .await;

            let reports = self
                .pairs
                .iter()
                .zip(reserves)
                .map(|(pair, reserves)| {
                    let twap = state.oracle.consult(pair).ok();
                    let (reserves, rating, status) = match reserves {
                        Ok(r) => match self.rater.rate(pair, &state.oracle, &r, now) {
                            Ok(rating) => (Some(r), Some(rating), "rated".to_string()),
                            Err(e) => (Some(r), None, e.to_string()),
                        },
                        Err(e) => (None, None, e.to_string()),
                    };
                    PairReport {
                        pair: pair.clone(),
                        reserves,
                        twap,
                        rating,
                        status,
                    }
                })
                .collect();
            Ok(reports)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amm::simulated::SimulatedAmm;
    use crate::ledger::ShareBook;
    use tokio_test::{assert_err, assert_ok};

    fn tok(s: &str) -> TokenId {
        TokenId::new(s)
    }

    async fn manager() -> (Arc<SimulatedAmm>, LiquidityManager) {
        let amm = Arc::new(SimulatedAmm::new(10_000));
        amm.create_pool(PairAddress::new("0xa"), tok("TKA"), tok("WETH"), 100 * WAD, 400 * WAD)
            .unwrap();
        amm.create_pool(PairAddress::new("0xb"), tok("TKB"), tok("WETH"), 400 * WAD, 400 * WAD)
            .unwrap();
        let mut config = EngineConfig::new(tok("WETH"));
        config.oracle = OracleConfig {
            period: 60,
            max_observation_age: 600,
        };
        let manager = LiquidityManager::new(
            config,
            &[PairAddress::new("0xa"), PairAddress::new("0xb")],
            amm.clone(),
            Arc::new(ShareBook::new()),
        )
        .await
        .unwrap();
        (amm, manager)
    }

    #[tokio::test]
    async fn test_new_rejects_bad_pair_lists() {
        let amm: Arc<dyn AmmRouter> = Arc::new(SimulatedAmm::new(0));
        let ledger: Arc<dyn ShareLedger> = Arc::new(ShareBook::new());
        let config = EngineConfig::new(tok("WETH"));

        assert_err!(LiquidityManager::new(config.clone(), &[], amm.clone(), ledger.clone()).await);
        assert_err!(
            LiquidityManager::new(config, &[PairAddress::new("0xmissing")], amm, ledger).await
        );
    }

    #[tokio::test]
    async fn test_tracked_pairs_get_indices_and_sides() {
        let (_, m) = manager().await;
        assert_eq!(m.pairs()[0].index, 0);
        assert_eq!(m.pairs()[1].index, 1);
        assert_eq!(m.pairs()[0].counterpart(&tok("WETH")), Some(&tok("TKA")));
    }

    #[tokio::test]
    async fn test_unknown_pair() {
        let (_, m) = manager().await;
        let err = m.consult(&PairAddress::new("0xzz")).await.unwrap_err();
        assert_eq!(err, EngineError::UnknownPair("0xzz".into()));
        assert_err!(m.add_liquidity(&tok("TKA"), &tok("TKB"), None).await);
    }

    #[tokio::test]
    async fn test_consult_before_update_is_stale() {
        let (amm, m) = manager().await;
        let pair = PairAddress::new("0xa");
        assert!(matches!(m.consult(&pair).await, Err(EngineError::StalePair { .. })));

        assert_ok!(m.update(&pair).await);
        amm.advance_time(60).unwrap();
        assert_ok!(m.update(&pair).await);
        // TKA priced in WETH at 400/100.
        assert_eq!(m.consult(&pair).await.unwrap(), Price::from(4 * WAD));
    }

    #[tokio::test]
    async fn test_update_all_reports_each_pair() {
        let (_, m) = manager().await;
        let updates = m.update_all().await.unwrap();
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|u| matches!(u.outcome, Some(UpdateOutcome::Initialized { .. }))));

        let again = m.update_all().await.unwrap();
        assert!(again.iter().all(|u| matches!(u.outcome, Some(UpdateOutcome::Skipped { .. }))));
    }

    #[tokio::test]
    async fn test_mint_then_status() {
        let (_, m) = manager().await;
        assert_eq!(m.calculate_mint_amount(WAD).await.unwrap(), WAD);
        m.mint("alice", 2 * WAD).await.unwrap();

        let status = m.status().await.unwrap();
        assert_eq!(status.allocation, AllocationState::Idle);
        assert_eq!(status.total_value, 2 * WAD);
        assert_eq!(status.total_supply, 2 * WAD);
        assert_eq!(status.share_price, WAD);
        assert_eq!(m.get_active_pair().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_add_liquidity_then_redeem_withdraws() {
        let (amm, m) = manager().await;
        m.mint("alice", 10 * WAD).await.unwrap();
        let receipt = m.add_liquidity(&tok("WETH"), &tok("TKB"), None).await.unwrap();
        assert!(receipt.liquidity > 0);
        assert_eq!(
            m.get_active_pair().await.unwrap(),
            Some((tok("TKB"), tok("WETH")))
        );
        assert!(amm.lp_balance(&PairAddress::new("0xb"), "dalp-pool").await.unwrap() > 0);

        let redeemed = m.redeem("alice", 10 * WAD).await.unwrap();
        assert!(redeemed.payout > 9 * WAD);
        let pool = m.pool_state().await.unwrap();
        assert!(pool.position.is_none());
        assert_eq!(m.ledger().total_supply().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let (amm, m) = manager().await;
        m.mint("alice", WAD).await.unwrap();
        m.update_all().await.unwrap();
        let snapshot = m.snapshot().await.unwrap();

        let restored = LiquidityManager::new(
            m.config().clone(),
            &[PairAddress::new("0xa"), PairAddress::new("0xb")],
            amm,
            Arc::new(ShareBook::new()),
        )
        .await
        .unwrap()
        .with_snapshot(snapshot.clone());

        assert_eq!(restored.pool_state().await.unwrap(), snapshot.pool);
        assert_eq!(restored.snapshot().await.unwrap().observations, snapshot.observations);
    }

    #[tokio::test]
    async fn test_nested_operation_is_rejected() {
        let (_, m) = manager().await;
        let err = exclusive("outer", async { m.total_value().await }).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::ReentrantCall {
                operation: "outer".into()
            }
        );
        // Outside any operation the same call succeeds.
        assert_ok!(m.total_value().await);
    }

    #[tokio::test]
    async fn test_redeem_sweeps_residuals_when_idle_is_short() {
        let (_, m) = manager().await;
        m.ledger().mint("alice", 3 * WAD).await.unwrap();
        let m = m.with_snapshot(VaultSnapshot {
            pool: PoolState {
                idle: WAD,
                position: None,
                residuals: BTreeMap::from([(tok("TKA"), 2 * WAD)]),
            },
            observations: BTreeMap::new(),
            saved_at: Utc::now(),
        });
        let nav = m.total_value().await.unwrap();
        assert!(nav > 8 * WAD);

        let receipt = m.redeem("alice", 3 * WAD).await.unwrap();
        assert!(receipt.payout > 8 * WAD);
        let pool = m.pool_state().await.unwrap();
        assert!(pool.residuals.is_empty());
        assert_eq!(pool.idle, 0);
        assert_eq!(m.ledger().total_supply().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mint_preview_agrees_with_mint_below_one_share() {
        let (_, m) = manager().await;
        m.ledger().mint("alice", 10).await.unwrap();
        let m = m.with_snapshot(VaultSnapshot {
            pool: PoolState {
                idle: 1_000,
                ..Default::default()
            },
            observations: BTreeMap::new(),
            saved_at: Utc::now(),
        });

        let expected = EngineError::InsufficientAmount { amount: 99, minimum: 100 };
        assert_eq!(m.calculate_mint_amount(99).await, Err(expected.clone()));
        assert_eq!(m.mint("bob", 99).await.map(|r| r.shares), Err(expected));
        assert_eq!(m.calculate_mint_amount(100).await, Ok(1));
    }
}
