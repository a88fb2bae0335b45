//! Integration tests module
//!
//! End-to-end tests for the pubcrawl engine, including:
//! - Ledger resume, stale requeue and concurrent claims
//! - Complete resolve → fetch → classify → record runs
//! - Host cooldown, shutdown and crash recovery scenarios

pub mod engine_test;
pub mod ledger_test;
pub mod recovery_test;
