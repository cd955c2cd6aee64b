//! Share ledger.
//!
//! Defines the `ShareLedger` trait the engine drives to issue and burn pool
//! shares, and `ShareBook`, an in-memory implementation that can be saved
//! alongside the engine state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::math;
use crate::types::{Amount, EngineError};

/// Balance bookkeeping for pool shares.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ShareLedger: Send + Sync {
    async fn mint(&self, to: &str, amount: Amount) -> Result<(), EngineError>;

    async fn burn(&self, from: &str, amount: Amount) -> Result<(), EngineError>;

    async fn total_supply(&self) -> Result<Amount, EngineError>;

    async fn balance_of(&self, account: &str) -> Result<Amount, EngineError>;
}

// ---------------------------------------------------------------------------
// In-memory ledger
// ---------------------------------------------------------------------------

/// Serialisable ledger contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerBook {
    pub total_supply: Amount,
    pub balances: BTreeMap<String, Amount>,
}

/// In-memory share ledger.
#[derive(Debug, Default)]
pub struct ShareBook {
    book: Mutex<LedgerBook>,
}

impl ShareBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_book(book: LedgerBook) -> Self {
        Self {
            book: Mutex::new(book),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerBook>, EngineError> {
        self.book
            .lock()
            .map_err(|_| EngineError::Ledger("ledger lock poisoned".into()))
    }

    /// Snapshot for persistence.
    pub fn book(&self) -> Result<LedgerBook, EngineError> {
        Ok(self.lock()?.clone())
    }
}

#[async_trait]
impl ShareLedger for ShareBook {
    async fn mint(&self, to: &str, amount: Amount) -> Result<(), EngineError> {
        let mut book = self.lock()?;
        let supply = book
            .total_supply
            .checked_add(amount)
            .ok_or(EngineError::MathOverflow)?;
        let balance = book.balances.get(to).copied().unwrap_or(0);
        // balance <= supply, so this cannot overflow once supply did not.
        book.balances.insert(to.to_string(), balance + amount);
        book.total_supply = supply;
        debug!(to, amount = %math::format_amount(amount), "Shares minted");
        Ok(())
    }

    async fn burn(&self, from: &str, amount: Amount) -> Result<(), EngineError> {
        let mut book = self.lock()?;
        let balance = book.balances.get(from).copied().unwrap_or(0);
        if balance < amount {
            return Err(EngineError::InsufficientShares {
                needed: amount,
                available: balance,
            });
        }
        let left = balance - amount;
        if left == 0 {
            book.balances.remove(from);
        } else {
            book.balances.insert(from.to_string(), left);
        }
        book.total_supply -= amount;
        debug!(from, amount = %math::format_amount(amount), "Shares burned");
        Ok(())
    }

    async fn total_supply(&self) -> Result<Amount, EngineError> {
        Ok(self.lock()?.total_supply)
    }

    async fn balance_of(&self, account: &str) -> Result<Amount, EngineError> {
        Ok(self.lock()?.balances.get(account).copied().unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
