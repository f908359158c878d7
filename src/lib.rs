//! Cache fleet health monitor.
//!
//! Polls every cache in a topology on a fixed schedule, folds the results
//! into availability verdicts in batched aggregation pipelines, reconciles
//! the local view with peer monitors, and serves the outcome over HTTP.

pub mod api;
pub mod config;
pub mod fetch;
pub mod health;
pub mod metrics;
pub mod monitor;
pub mod pipeline;
pub mod poller;
pub mod reconcile;
pub mod state;
pub mod topology;
pub mod version;
