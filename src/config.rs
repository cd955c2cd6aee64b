//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Token amounts are written as decimal strings in whole tokens
//! (`"0.001"`) and converted to base units on use.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;

use crate::engine::EngineConfig;
use crate::math;
use crate::oracle::OracleConfig;
use crate::types::{Amount, PairAddress, TokenId};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub engine: EngineSection,
    #[serde(default)]
    pub keeper: KeeperConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    pub pairs: Vec<PairConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineSection {
    pub base_asset: String,
    #[serde(default = "default_account")]
    pub account: String,
    pub period_secs: u64,
    pub max_observation_age_secs: u64,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u32,
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KeeperConfig {
    pub interval_secs: u64,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self { interval_secs: 600 }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub state_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: crate::storage::DEFAULT_STATE_FILE.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8080,
        }
    }
}

/// One allow-listed pair. The seed reserves are only used to create the
/// pool on the paper AMM the first time it runs.
#[derive(Debug, Deserialize, Clone)]
pub struct PairConfig {
    pub address: String,
    pub token0: String,
    pub token1: String,
    pub seed_reserve0: Option<String>,
    pub seed_reserve1: Option<String>,
}

fn default_account() -> String {
    "dalp-pool".to_string()
}

fn default_slippage_bps() -> u32 {
    50
}

fn default_deadline_secs() -> u64 {
    300
}

fn default_dust_threshold() -> String {
    "0.001".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Invalid config file: {path}"))
    }

    /// Parse and validate TOML text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.base_asset.trim().is_empty() {
            bail!("engine.base_asset must not be empty");
        }
        if self.engine.period_secs == 0 {
            bail!("engine.period_secs must be positive");
        }
        if self.engine.max_observation_age_secs < self.engine.period_secs {
            bail!("engine.max_observation_age_secs must be at least engine.period_secs");
        }
        if self.engine.slippage_bps as u128 >= math::BPS_DENOMINATOR {
            bail!("engine.slippage_bps must be below {}", math::BPS_DENOMINATOR);
        }
        if self.keeper.interval_secs == 0 {
            bail!("keeper.interval_secs must be positive");
        }
        if self.pairs.is_empty() {
            bail!("at least one [[pairs]] entry is required");
        }
        self.dust_threshold()?;

        let mut addresses = BTreeSet::new();
        let mut token_pairs = BTreeSet::new();
        for pair in &self.pairs {
            if pair.token0 == pair.token1 {
                bail!("pair {} trades {} against itself", pair.address, pair.token0);
            }
            if !addresses.insert(pair.address.as_str()) {
                bail!("pair {} listed twice", pair.address);
            }
            let key = if pair.token0 < pair.token1 {
                (pair.token0.as_str(), pair.token1.as_str())
            } else {
                (pair.token1.as_str(), pair.token0.as_str())
            };
            if !token_pairs.insert(key) {
                bail!("two pairs trade {}/{}", pair.token0, pair.token1);
            }
            if pair.seed_reserve0.is_some() != pair.seed_reserve1.is_some() {
                bail!("pair {} must set both seed reserves or neither", pair.address);
            }
        }
        Ok(())
    }

    pub fn dust_threshold(&self) -> Result<Amount> {
        math::parse_amount(&self.engine.dust_threshold).context("engine.dust_threshold")
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        Ok(EngineConfig {
            base_asset: TokenId::new(self.engine.base_asset.clone()),
            account: self.engine.account.clone(),
            oracle: OracleConfig {
                period: self.engine.period_secs,
                max_observation_age: self.engine.max_observation_age_secs,
            },
            slippage_bps: self.engine.slippage_bps,
            deadline_secs: self.engine.deadline_secs,
            dust_threshold: self.dust_threshold()?,
        })
    }

    /// Allow-list in configured order.
    pub fn pair_addresses(&self) -> Vec<PairAddress> {
        self.pairs
            .iter()
            .map(|p| PairAddress::new(p.address.clone()))
            .collect()
    }
}

impl PairConfig {
    /// Seed reserves in base units, if configured.
    pub fn seed_reserves(&self) -> Result<Option<(Amount, Amount)>> {
        match (&self.seed_reserve0, &self.seed_reserve1) {
            (Some(r0), Some(r1)) => {
                let r0 = math::parse_amount(r0).with_context(|| format!("{}.seed_reserve0", self.address))?;
                let r1 = math::parse_amount(r1).with_context(|| format!("{}.seed_reserve1", self.address))?;
                Ok(Some((r0, r1)))
            }
            _ => Ok(None),
        }
    }
}
