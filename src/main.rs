//! DALP: dynamic AMM liquidity pool keeper.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores state from disk (or creates fresh) and either runs the keeper
//! loop with graceful shutdown or executes a single operator command.
//! Runs against the paper AMM, whose book is persisted with the rest of
//! the state.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use dalp::amm::simulated::SimulatedAmm;
use dalp::amm::AmmRouter;
use dalp::config::AppConfig;
use dalp::dashboard::{self, routes::DashboardState};
use dalp::engine::keeper::{self, CycleReport};
use dalp::engine::LiquidityManager;
use dalp::ledger::ShareBook;
use dalp::math;
use dalp::storage::{self, StateStore};
use dalp::types::{PairAddress, TokenId};

const BANNER: &str = r#"
  ____    _    _     ____
 |  _ \  / \  | |   |  _ \
 | | | |/ _ \ | |   | |_) |
 | |_| / ___ \| |___|  __/
 |____/_/   \_\_____|_|

  Dynamic AMM Liquidity Pool
  v0.1.0 Keeper
"#;

#[derive(Parser, Debug)]
#[command(name = "dalp", version, about = "Dynamic AMM liquidity pool keeper")]
struct Cli {
    /// Path to the TOML configuration.
    #[arg(long, env = "DALP_CONFIG", default_value = "config.toml")]
    config: String,

    /// Override the state file from the configuration.
    #[arg(long, env = "DALP_STATE")]
    state: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the keeper loop until Ctrl+C.
    Run,
    /// Sample every tracked pair's oracle once.
    Update,
    /// Reallocate once and print the result.
    Reallocate,
    /// Deposit base asset and mint shares.
    Deposit {
        #[arg(long)]
        account: String,
        /// Amount in whole tokens, e.g. 1.5
        amount: String,
    },
    /// Burn shares and withdraw base asset.
    Redeem {
        #[arg(long)]
        account: String,
        /// Shares in whole units, e.g. 0.25
        shares: String,
    },
    /// Print pool and pair status.
    Status,
}

/// Components shared by every command.
struct Runtime {
    manager: Arc<LiquidityManager>,
    amm: Arc<SimulatedAmm>,
    store: StateStore,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cli = Cli::parse();
    let cfg = AppConfig::load(&cli.config)?;
    init_logging();

    let state_file = cli.state.clone().unwrap_or_else(|| cfg.storage.state_file.clone());
    let rt = boot(&cfg, state_file).await?;

    match cli.command {
        Command::Run => run_keeper(&cfg, &rt).await?,
        Command::Update => {
            let updates = rt.manager.update_all().await?;
            println!("{}", serde_json::to_string_pretty(&updates)?);
            persist(&rt).await?;
        }
        Command::Reallocate => {
            let report = rt.manager.reallocate_liquidity().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            match rt.manager.get_active_pair().await? {
                Some((a, b)) => println!("active pair: {a}/{b}"),
                None => println!("active pair: none (idle)"),
            }
            persist(&rt).await?;
        }
        Command::Deposit { account, amount } => {
            let amount = math::parse_amount(&amount)?;
            let receipt = rt.manager.mint(&account, amount).await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
            persist(&rt).await?;
        }
        Command::Redeem { account, shares } => {
            let shares = math::parse_amount(&shares)?;
            let receipt = rt.manager.redeem(&account, shares).await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
            persist(&rt).await?;
        }
        Command::Status => {
            let status = rt.manager.status().await?;
            let pairs = rt.manager.pair_reports().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            println!("{}", serde_json::to_string_pretty(&pairs)?);
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// Restore or create the paper AMM, ledger and engine.
async fn boot(cfg: &AppConfig, state_file: String) -> Result<Runtime> {
    let saved = storage::load_state(Some(&state_file))?;

    let amm = match saved.as_ref().and_then(|s| s.paper_amm.clone()) {
        Some(book) => SimulatedAmm::from_book(book),
        None => SimulatedAmm::new(wall_clock()),
    };
    amm.set_time(wall_clock())?;
    let amm = Arc::new(amm);
    seed_pools(cfg, &amm).await?;

    let ledger = Arc::new(match &saved {
        Some(s) => ShareBook::from_book(s.ledger.clone()),
        None => ShareBook::new(),
    });

    let mut manager = LiquidityManager::new(
        cfg.engine_config()?,
        &cfg.pair_addresses(),
        amm.clone(),
        ledger.clone(),
    )
    .await
    .context("Failed to start the liquidity manager")?;

    match saved {
        Some(s) => {
            info!(
                allocation = %s.vault.pool.allocation(),
                idle = %math::format_amount(s.vault.pool.idle),
                "Resumed from saved state"
            );
            manager = manager.with_snapshot(s.vault);
        }
        None => info!(pairs = cfg.pairs.len(), "Fresh start"),
    }

    Ok(Runtime {
        manager: Arc::new(manager),
        store: StateStore::new(state_file, ledger, Some(amm.clone())),
        amm,
    })
}

/// Create configured pools missing from the paper AMM and check that
/// existing ones trade the configured tokens.
async fn seed_pools(cfg: &AppConfig, amm: &SimulatedAmm) -> Result<()> {
    for pair in &cfg.pairs {
        let address = PairAddress::new(pair.address.clone());
        let token0 = TokenId::new(pair.token0.clone());
        let token1 = TokenId::new(pair.token1.clone());

        match amm.pair_tokens(&address).await {
            Ok((t0, t1)) => {
                let matches = (t0 == token0 && t1 == token1) || (t0 == token1 && t1 == token0);
                if !matches {
                    bail!("pair {address} trades {t0}/{t1}, config says {token0}/{token1}");
                }
            }
            Err(_) => {
                let Some((r0, r1)) = pair.seed_reserves()? else {
                    bail!("pair {address} does not exist and has no seed reserves");
                };
                amm.create_pool(address.clone(), token0, token1, r0, r1)?;
                info!(
                    pair = %address,
                    reserve0 = %math::format_amount(r0),
                    reserve1 = %math::format_amount(r1),
                    "Paper pool created"
                );
            }
        }
    }
    Ok(())
}

async fn persist(rt: &Runtime) -> Result<()> {
    rt.store.persist(&rt.manager).await
}

fn wall_clock() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Keeper loop
// ---------------------------------------------------------------------------

async fn run_keeper(cfg: &AppConfig, rt: &Runtime) -> Result<()> {
    println!("{BANNER}");
    info!(
        base = %cfg.engine.base_asset,
        pairs = cfg.pairs.len(),
        interval_secs = cfg.keeper.interval_secs,
        "DALP starting up"
    );

    let dashboard_state =
        Arc::new(DashboardState::new(rt.manager.clone()).with_store(rt.store.clone()));
    if cfg.dashboard.enabled {
        dashboard::spawn_dashboard(dashboard_state.clone(), cfg.dashboard.port).await?;
    }

    let mut interval = tokio::time::interval(Duration::from_secs(cfg.keeper.interval_secs));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut cycle: u64 = 0;

    info!(
        interval_secs = cfg.keeper.interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                cycle += 1;
                if let Err(e) = rt.amm.set_time(wall_clock()) {
                    warn!(error = %e, "Failed to advance paper clock");
                }
                match keeper::run_cycle(&rt.manager, cycle).await {
                    Ok(report) => {
                        log_cycle_report(&report);
                        dashboard_state.record_cycle(&report).await;
                    }
                    Err(e) => {
                        error!(cycle, error = %e, "Cycle failed, continuing to next");
                        dashboard_state.record_failure(cycle, &e).await;
                    }
                }
                // Persist after every cycle: a failed cycle may still have
                // committed a withdrawal.
                if let Err(e) = persist(rt).await {
                    error!(error = %e, "Failed to save state");
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    persist(rt).await?;
    let status = rt.manager.status().await?;
    info!(
        cycles = cycle,
        allocation = %status.allocation,
        nav = %math::format_amount(status.total_value),
        shares = %math::format_amount(status.total_supply),
        "DALP shut down cleanly."
    );
    Ok(())
}

/// Log a human-readable cycle summary.
fn log_cycle_report(report: &CycleReport) {
    info!(
        cycle = report.cycle_number,
        windows = report.windows_closed(),
        failed_updates = report.failed_updates(),
        rated = report.reallocation.ratings.len(),
        skipped = report.reallocation.skipped.len(),
        idle = %math::format_amount(report.reallocation.idle_after),
        nav = %math::format_amount(report.total_value),
        "Cycle summary"
    );
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dalp=info"));

    let json_logging = std::env::var("DALP_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
