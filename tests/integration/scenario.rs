//! End-to-end scenarios: deposits, oracle windows, reallocation, failure
//! recovery, reentrancy and restart.

use primitive_types::U256;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

use dalp::amm::simulated::AmmOperation;
use dalp::engine::controller::ReallocationOutcome;
use dalp::engine::LiquidityManager;
use dalp::ledger::{ShareBook, ShareLedger};
use dalp::math::WAD;
use dalp::oracle::UpdateOutcome;
use dalp::storage::{self, DalpState};
use dalp::types::EngineError;

use crate::harness::*;

// ---------------------------------------------------------------------------
// Deposit, growth, reallocation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_deposit_then_follow_price_growth() {
    let h = Harness::new().await;

    let first = h.manager.mint("alice", WAD).await.unwrap();
    assert_eq!(first.shares, WAD);

    // One flat window on every pair, then TKA rallies against WETH.
    h.manager.update_all().await.unwrap();
    h.advance_period();
    h.manager.update_all().await.unwrap();
    h.trade("WETH", "TKA", 100 * WAD).await;
    h.advance_period();
    let outcome = h.manager.update(&addr(PAIR_WA)).await.unwrap();
    assert!(matches!(outcome, UpdateOutcome::Updated { .. }));
    h.manager.update_all().await.unwrap();

    let rating = h.manager.rate(&addr(PAIR_WA)).await.unwrap();
    assert!(rating.growth > U256::from(WAD));

    let report = h.manager.reallocate_liquidity().await.unwrap();
    match &report.outcome {
        ReallocationOutcome::Reallocated { from, to, liquidity } => {
            assert_eq!(from, &None);
            assert_eq!(to, &addr(PAIR_WA));
            assert!(*liquidity > 0);
        }
        other => panic!("expected a reallocation, got {other:?}"),
    }
    assert_eq!(
        h.manager.get_active_pair().await.unwrap(),
        Some((tok("WETH"), tok("TKA")))
    );
    assert!(h.lp_balance(PAIR_WA).await > 0);

    // The rally continues and lifts the position's value.
    h.trade("WETH", "TKA", 500 * WAD).await;
    let second = h.manager.mint("bob", WAD).await.unwrap();
    assert!(second.shares < first.shares);
    assert!(second.shares > 0);
}

#[tokio::test]
async fn test_add_liquidity_into_token_pair() {
    let h = Harness::new().await;
    h.manager.mint("alice", 10 * WAD).await.unwrap();

    let receipt = h
        .manager
        .add_liquidity(&tok("TKA"), &tok("TKB"), None)
        .await
        .unwrap();
    assert_eq!(receipt.pair, addr(PAIR_AB));
    assert!(receipt.liquidity > 0);
    assert_eq!(h.lp_balance(PAIR_AB).await, receipt.position_liquidity);
    assert_eq!(
        h.manager.get_active_pair().await.unwrap(),
        Some((tok("TKA"), tok("TKB")))
    );

    // Fees and ratio rounding cost a little, nothing more.
    let nav = h.manager.total_value().await.unwrap();
    assert!(nav > 10 * WAD * 98 / 100);
}

#[tokio::test]
async fn test_add_liquidity_into_base_pair() {
    let h = Harness::new().await;
    h.manager.mint("alice", 10 * WAD).await.unwrap();

    let receipt = h
        .manager
        .add_liquidity(&tok("TKA"), &tok("WETH"), Some(4 * WAD))
        .await
        .unwrap();
    assert_eq!(receipt.pair, addr(PAIR_WA));
    assert_eq!(receipt.spent, 4 * WAD);
    assert!(h.lp_balance(PAIR_WA).await > 0);

    let state = h.manager.pool_state().await.unwrap();
    assert!(state.idle >= 6 * WAD);

    // A second pair cannot be opened while positioned.
    let result = h.manager.add_liquidity(&tok("WETH"), &tok("TKB"), None).await;
    assert!(matches!(result, Err(EngineError::PositionActive { .. })));
}

#[tokio::test]
async fn test_redeem_withdraws_position_when_idle_is_short() {
    let h = Harness::new().await;
    h.manager.mint("alice", 2 * WAD).await.unwrap();
    h.manager.mint("bob", WAD).await.unwrap();
    h.manager
        .add_liquidity(&tok("WETH"), &tok("TKB"), None)
        .await
        .unwrap();
    let price_before = h.manager.status().await.unwrap().share_price;

    let receipt = h.manager.redeem("bob", WAD).await.unwrap();
    assert!(receipt.payout > WAD * 99 / 100);
    assert!(receipt.payout < WAD);

    let state = h.manager.pool_state().await.unwrap();
    assert!(state.position.is_none());
    assert_eq!(h.lp_balance(PAIR_WB).await, 0);
    assert_eq!(h.ledger.balance_of("bob").await.unwrap(), 0);

    let price_after = h.manager.status().await.unwrap().share_price;
    assert!(price_after >= price_before * 99 / 100);
}

// ---------------------------------------------------------------------------
// Reallocation stability
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_reallocating_into_active_pair_changes_nothing() {
    let h = Harness::new().await;
    h.manager.mint("alice", WAD).await.unwrap();

    h.manager.update_all().await.unwrap();
    h.advance_period();
    h.manager.update_all().await.unwrap();
    h.trade("WETH", "TKA", 100 * WAD).await;
    h.advance_period();
    h.manager.update_all().await.unwrap();

    let first = h.manager.reallocate_liquidity().await.unwrap();
    assert!(matches!(first.outcome, ReallocationOutcome::Reallocated { .. }));

    let state = h.manager.pool_state().await.unwrap();
    let supply = h.ledger.total_supply().await.unwrap();
    let lp = h.lp_balance(PAIR_WA).await;
    let observations = h.manager.snapshot().await.unwrap().observations;

    // Polling inside the period leaves the oracle alone.
    for update in h.manager.update_all().await.unwrap() {
        assert!(matches!(update.outcome, Some(UpdateOutcome::Skipped { .. })));
    }
    assert_eq!(h.manager.snapshot().await.unwrap().observations, observations);

    let second = h.manager.reallocate_liquidity().await.unwrap();
    assert_eq!(
        second.outcome,
        ReallocationOutcome::Unchanged {
            pair: addr(PAIR_WA)
        }
    );
    assert_eq!(h.manager.pool_state().await.unwrap(), state);
    assert_eq!(h.ledger.total_supply().await.unwrap(), supply);
    assert_eq!(h.lp_balance(PAIR_WA).await, lp);
}

#[tokio::test]
async fn test_reallocate_before_warm_up_has_no_candidate() {
    let h = Harness::new().await;
    h.manager.mint("alice", WAD).await.unwrap();
    h.manager.update_all().await.unwrap();

    let report = h.manager.reallocate_liquidity().await.unwrap();
    assert_eq!(report.outcome, ReallocationOutcome::NoCandidate);
    assert_eq!(report.skipped.len(), 3);
    assert_eq!(h.manager.pool_state().await.unwrap().idle, WAD);
}

// ---------------------------------------------------------------------------
// Failure recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failed_redeploy_keeps_withdrawn_funds_idle() {
    let h = Harness::new().await;
    h.manager.mint("alice", 10 * WAD).await.unwrap();
    h.manager
        .add_liquidity(&tok("WETH"), &tok("TKB"), None)
        .await
        .unwrap();
    // Flat prices: TKA/TKB and WETH/TKA tie and the first listed wins.
    h.warm_up().await;

    let before = h.manager.pool_state().await.unwrap();
    let supply = h.ledger.total_supply().await.unwrap();
    let old_pool = h.amm.pool(&addr(PAIR_WB)).unwrap();
    let route_pool = h.amm.pool(&addr(PAIR_WA)).unwrap();
    let target_pool = h.amm.pool(&addr(PAIR_AB)).unwrap();

    // Buying TKA for the new position goes through WETH/TKA.
    h.amm.fail_pair(addr(PAIR_WA)).unwrap();
    let err = h.manager.reallocate_liquidity().await.unwrap_err();
    assert!(matches!(err, EngineError::Amm(_)));

    let after = h.manager.pool_state().await.unwrap();
    assert!(after.position.is_none());
    assert!(after.residuals.is_empty());
    assert_eq!(h.lp_balance(PAIR_WB).await, 0);

    // Every unit of WETH that left the old pair is sitting idle.
    let old_after = h.amm.pool(&addr(PAIR_WB)).unwrap();
    assert_eq!(after.idle - before.idle, old_pool.reserve0 - old_after.reserve0);
    assert_eq!(h.amm.pool(&addr(PAIR_WA)).unwrap(), route_pool);
    assert_eq!(h.amm.pool(&addr(PAIR_AB)).unwrap(), target_pool);
    assert_eq!(h.ledger.total_supply().await.unwrap(), supply);

    // Once the route recovers the next reallocation completes.
    h.amm.clear_failures().unwrap();
    let report = h.manager.reallocate_liquidity().await.unwrap();
    assert!(matches!(
        report.outcome,
        ReallocationOutcome::Reallocated { from: None, .. }
    ));
    assert_eq!(h.manager.pool_state().await.unwrap().active_pair(), Some(&addr(PAIR_AB)));
}

#[tokio::test]
async fn test_failed_add_liquidity_sweeps_back_to_base() {
    let h = Harness::new().await;
    h.manager.mint("alice", 10 * WAD).await.unwrap();
    h.manager
        .add_liquidity(&tok("WETH"), &tok("TKB"), None)
        .await
        .unwrap();
    h.warm_up().await;
    let nav_before = h.manager.total_value().await.unwrap();

    h.amm.fail_on(AmmOperation::AddLiquidity).unwrap();
    assert_err!(h.manager.reallocate_liquidity().await);

    let after = h.manager.pool_state().await.unwrap();
    assert!(after.position.is_none());
    assert!(after.residuals.is_empty());
    let nav_after = h.manager.total_value().await.unwrap();
    assert_eq!(nav_after, after.idle);
    assert!(nav_after > nav_before * 98 / 100);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_callback_into_manager_is_rejected() {
    let inner = Arc::new(fixture_amm());
    let callback = Arc::new(CallbackAmm::new(inner.clone()));
    let ledger = Arc::new(ShareBook::new());
    let manager = Arc::new(
        LiquidityManager::new(engine_config(), &pair_list(), callback.clone(), ledger)
            .await
            .unwrap(),
    );
    callback.attach(&manager);

    manager.mint("alice", 10 * WAD).await.unwrap();
    let receipt = manager
        .add_liquidity(&tok("WETH"), &tok("TKB"), None)
        .await
        .unwrap();
    assert!(receipt.liquidity > 0);

    assert_eq!(
        callback.observed(),
        vec![Err(EngineError::ReentrantCall {
            operation: "add_liquidity".to_string()
        })]
    );
    // Outside an operation the same call goes through.
    assert_ok!(manager.total_value().await);
}

#[tokio::test]
async fn test_concurrent_callers_are_serialised() {
    let h = Harness::new().await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.mint(&format!("user{i}"), WAD).await })
        })
        .collect();
    for handle in handles {
        assert_ok!(handle.await.unwrap());
    }

    // Interleaved on one task is fine too: only nesting is refused.
    let (a, b) = tokio::join!(h.manager.mint("x", WAD), h.manager.total_value());
    assert_ok!(a);
    assert_ok!(b);

    assert_eq!(h.ledger.total_supply().await.unwrap(), 9 * WAD);
    assert_eq!(h.manager.pool_state().await.unwrap().idle, 9 * WAD);
}

// ---------------------------------------------------------------------------
// Restart
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_state_survives_restart() {
    let h = Harness::new().await;
    h.manager.mint("alice", 5 * WAD).await.unwrap();
    h.manager
        .add_liquidity(&tok("WETH"), &tok("TKA"), None)
        .await
        .unwrap();
    h.manager.update_all().await.unwrap();

    let path = std::env::temp_dir()
        .join(format!("dalp-restart-{}.json", uuid::Uuid::new_v4()))
        .to_string_lossy()
        .to_string();
    let state = DalpState {
        vault: h.manager.snapshot().await.unwrap(),
        ledger: h.ledger.book().unwrap(),
        paper_amm: Some(h.amm.book().unwrap()),
    };
    storage::save_state(&state, Some(&path)).unwrap();

    let loaded = storage::load_state(Some(&path)).unwrap().unwrap();
    let amm = Arc::new(dalp::amm::simulated::SimulatedAmm::from_book(
        loaded.paper_amm.unwrap(),
    ));
    let ledger = Arc::new(ShareBook::from_book(loaded.ledger));
    let restored = LiquidityManager::new(engine_config(), &pair_list(), amm, ledger.clone())
        .await
        .unwrap()
        .with_snapshot(loaded.vault);

    assert_eq!(
        restored.pool_state().await.unwrap(),
        h.manager.pool_state().await.unwrap()
    );
    assert_eq!(
        restored.snapshot().await.unwrap().observations,
        state.vault.observations
    );
    assert_eq!(
        restored.total_value().await.unwrap(),
        h.manager.total_value().await.unwrap()
    );
    assert_eq!(ledger.balance_of("alice").await.unwrap(), 5 * WAD);
    assert_eq!(
        restored.get_active_pair().await.unwrap(),
        Some((tok("WETH"), tok("TKA")))
    );

    storage::delete_state(Some(&path)).unwrap();
}
