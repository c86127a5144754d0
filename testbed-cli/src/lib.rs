//! `testbed` library.
//!
//! This library exposes internal modules for integration testing.
//! In production, `testbed` is used as a binary (main.rs).

pub mod cli;
pub mod logging;
pub mod orchestrator;
