//! Integration tests entry point
//!
//! This file serves as the entry point for all integration tests.
//! It includes the integration_tests module which contains:
//! - Ledger durability and claim tests
//! - Crawl engine scenario tests
//! - Shutdown and crash recovery tests

mod common;
mod integration_tests;
