//! Test harness for integration scenarios.
//!
//! Builds a paper AMM with three pools quoting a consistent price set
//! (1 TKA = 4 TKB = 4 WETH, 1 TKB = 1 WETH), a share ledger and a manager
//! tracking all three pairs. `CallbackAmm` wraps the paper AMM and calls
//! back into the manager from inside `add_liquidity`, the way a hostile
//! token hook would.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use dalp::amm::simulated::SimulatedAmm;
use dalp::amm::{AddLiquidity, AmmRouter, CumulativePrices, LiquidityReceipt, RemoveLiquidity, Reserves};
use dalp::engine::{EngineConfig, LiquidityManager};
use dalp::ledger::ShareBook;
use dalp::math::WAD;
use dalp::oracle::OracleConfig;
use dalp::types::{Amount, EngineError, PairAddress, TokenId};

pub const PAIR_AB: &str = "0xpair-ab";
pub const PAIR_WA: &str = "0xpair-wa";
pub const PAIR_WB: &str = "0xpair-wb";
pub const PERIOD: u64 = 3_600;
pub const TRADER: &str = "trader";

pub fn tok(s: &str) -> TokenId {
    TokenId::new(s)
}

pub fn addr(s: &str) -> PairAddress {
    PairAddress::new(s)
}

pub fn pair_list() -> Vec<PairAddress> {
    vec![addr(PAIR_AB), addr(PAIR_WA), addr(PAIR_WB)]
}

pub fn engine_config() -> EngineConfig {
    let mut config = EngineConfig::new(tok("WETH"));
    config.oracle = OracleConfig {
        period: PERIOD,
        max_observation_age: 2 * PERIOD,
    };
    config
}

pub fn fixture_amm() -> SimulatedAmm {
    let amm = SimulatedAmm::new(1_000_000);
    amm.create_pool(addr(PAIR_AB), tok("TKA"), tok("TKB"), 1_000 * WAD, 4_000 * WAD)
        .unwrap();
    amm.create_pool(addr(PAIR_WA), tok("WETH"), tok("TKA"), 4_000 * WAD, 1_000 * WAD)
        .unwrap();
    amm.create_pool(addr(PAIR_WB), tok("WETH"), tok("TKB"), 4_000 * WAD, 4_000 * WAD)
        .unwrap();
    amm
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub amm: Arc<SimulatedAmm>,
    pub ledger: Arc<ShareBook>,
    pub manager: Arc<LiquidityManager>,
}

impl Harness {
    pub async fn new() -> Self {
        let amm = Arc::new(fixture_amm());
        let ledger = Arc::new(ShareBook::new());
        let manager = LiquidityManager::new(engine_config(), &pair_list(), amm.clone(), ledger.clone())
            .await
            .unwrap();
        Self {
            amm,
            ledger,
            manager: Arc::new(manager),
        }
    }

    pub fn advance_period(&self) {
        self.amm.advance_time(PERIOD).unwrap();
    }

    /// Two completed oracle windows on every pair at current prices.
    pub async fn warm_up(&self) {
        self.manager.update_all().await.unwrap();
        self.advance_period();
        self.manager.update_all().await.unwrap();
        self.advance_period();
        self.manager.update_all().await.unwrap();
    }

    /// An outside trader swapping on the AMM.
    pub async fn trade(&self, from: &str, to: &str, amount: Amount) -> Amount {
        let deadline = self.amm.now().await.unwrap() + 60;
        self.amm
            .swap_exact_in(&tok(from), &tok(to), amount, 0, TRADER, deadline)
            .await
            .unwrap()
    }

    /// LP tokens the pool holds in `pair`.
    pub async fn lp_balance(&self, pair: &str) -> Amount {
        self.amm
            .lp_balance(&addr(pair), &self.manager.config().account)
            .await
            .unwrap()
    }
}

// ---------------------------------------------------------------------------
// Callback AMM
// ---------------------------------------------------------------------------

/// Paper AMM that re-enters the manager during `add_liquidity`.
pub struct CallbackAmm {
    inner: Arc<SimulatedAmm>,
    manager: OnceLock<Weak<LiquidityManager>>,
    observed: Mutex<Vec<Result<Amount, EngineError>>>,
}

impl CallbackAmm {
    pub fn new(inner: Arc<SimulatedAmm>) -> Self {
        Self {
            inner,
            manager: OnceLock::new(),
            observed: Mutex::new(Vec::new()),
        }
    }

    pub fn attach(&self, manager: &Arc<LiquidityManager>) {
        let _ = self.manager.set(Arc::downgrade(manager));
    }

    /// Results of every callback made so far.
    pub fn observed(&self) -> Vec<Result<Amount, EngineError>> {
        self.observed.lock().unwrap().clone()
    }

    async fn call_back(&self) {
        let Some(manager) = self.manager.get().and_then(Weak::upgrade) else {
            return;
        };
        let result = manager.total_value().await;
        self.observed.lock().unwrap().push(result);
    }
}

#[async_trait]
impl AmmRouter for CallbackAmm {
    async fn now(&self) -> Result<u64, EngineError> {
        self.inner.now().await
    }

    async fn pair_for(&self, a: &TokenId, b: &TokenId) -> Result<Option<PairAddress>, EngineError> {
        self.inner.pair_for(a, b).await
    }

    async fn pair_tokens(&self, pair: &PairAddress) -> Result<(TokenId, TokenId), EngineError> {
        self.inner.pair_tokens(pair).await
    }

    async fn get_reserves(&self, pair: &PairAddress) -> Result<Reserves, EngineError> {
        self.inner.get_reserves(pair).await
    }

    async fn cumulative_prices(&self, pair: &PairAddress) -> Result<CumulativePrices, EngineError> {
        self.inner.cumulative_prices(pair).await
    }

    async fn lp_total_supply(&self, pair: &PairAddress) -> Result<Amount, EngineError> {
        self.inner.lp_total_supply(pair).await
    }

    async fn lp_balance(&self, pair: &PairAddress, owner: &str) -> Result<Amount, EngineError> {
        self.inner.lp_balance(pair, owner).await
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
        self.inner
            .swap_exact_in(token_in, token_out, amount_in, amount_out_min, to, deadline)
            .await
    }

    async fn add_liquidity(&self, request: AddLiquidity) -> Result<LiquidityReceipt, EngineError> {
        self.call_back().await;
        self.inner.add_liquidity(request).await
    }

    async fn remove_liquidity(&self, request: RemoveLiquidity) -> Result<(Amount, Amount), EngineError> {
        self.inner.remove_liquidity(request).await
    }
}
