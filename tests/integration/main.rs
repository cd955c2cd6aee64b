//! Integration tests against the paper AMM.

mod harness;
mod scenario;
