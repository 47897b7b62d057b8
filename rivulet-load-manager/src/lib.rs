//! # Rivulet Load Manager
//!
//! Load scoring, short-horizon load prediction and cluster-wide load
//! monitoring for the rivulet dispatcher pool.
//!
//! ## Core Responsibilities
//!
//! - **Load Scoring**: Reduces twelve per-dispatcher load signals to one
//!   comparable score in `[0, 1]` via fixed weights
//! - **Load Prediction**: Keeps a bounded, age-pruned window of past scores
//!   per dispatcher and forecasts near-future load (EMA + linear regression)
//! - **Cluster Monitoring**: Tracks every dispatcher's latest load snapshot
//!   and answers least-loaded / most-loaded / rebalance-needed queries
//!
//! ## Architecture
//!
//! Each dispatcher owns a [`LoadMetrics`] it alone mutates and a
//! [`LoadPredictor`] it feeds on every load-report tick. The shared
//! [`LoadMonitor`] aggregates [`LoadSnapshot`]s across dispatchers; the
//! migration layer in `rivulet-reactor` consumes its ranking queries to pick
//! the source and target of a rebalance.

pub mod metrics;
pub mod monitor;
pub mod predictor;
pub mod snapshot;

// Re-export main types
pub use metrics::LoadMetrics;
pub use monitor::{LoadMonitor, LoadThresholds};
pub use predictor::LoadPredictor;
pub use snapshot::LoadSnapshot;
