//! Themis - submission judging pipeline
//!
//! Takes code submissions, runs them against a problem's test cases in a
//! resource-bounded sandbox, derives a verdict and keeps problem and user
//! statistics consistent under concurrent judging.

pub mod aggregator;
pub mod comparator;
pub mod config;
pub mod constants;
pub mod intake;
pub mod judge;
pub mod languages;
pub mod metrics;
pub mod queue;
pub mod reconcile;
pub mod recovery;
pub mod retry;
pub mod sandbox;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod worker;

pub use config::Config;
pub use scheduler::{EnqueueResult, JudgeService, StatusSnapshot};
