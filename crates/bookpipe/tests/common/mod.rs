//! Shared test utilities for bookpipe integration tests.
//!
//! This module provides:
//! - `ScriptedBackend`, an in-memory publishing backend with call counters
//! - `TestHarness` for isolated runs against a temporary database

pub mod backend;
pub mod harness;

pub use backend::*;
pub use harness::TestHarness;
