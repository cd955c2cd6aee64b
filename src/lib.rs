//! DALP: dynamically allocated liquidity pool engine.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod amm;
pub mod config;
pub mod dashboard;
pub mod engine;
pub mod ledger;
pub mod math;
pub mod oracle;
pub mod rating;
pub mod storage;
pub mod types;
