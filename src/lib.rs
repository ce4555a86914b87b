//! NIMBUS: resilient multi-provider weather aggregator.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod error;
pub mod location;
pub mod routing;
pub mod quota;
pub mod cache;
pub mod providers;
pub mod verification;
pub mod monitoring;
pub mod radar;
pub mod service;
pub mod api;
