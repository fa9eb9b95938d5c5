//! Shared test utilities for distill integration tests.
//!
//! This module provides:
//! - `TestHarness` wiring a store, router, gateway and executor over an
//!   in-memory database, with a queue the test drains by hand
//! - `ScriptedProvider` for deterministic provider behaviour

#![allow(unused_imports)]

pub mod harness;
pub mod providers;

pub use harness::{
    started_stages, summarize_text, youtube_summary, ManualQueue, TestHarness, OWNER,
};
pub use providers::{Script, ScriptedProvider};
