//! Background Jobs for BALLAST API
//!
//! Periodic maintenance tasks owned by the application context:
//!
//! - `spatial_prune`: drops supplier positions that stopped reporting
//!
//! Component timers (coalescer, batch writer, write queue, cache sweep) live
//! with their components; this module holds the jobs that only make sense at
//! the application level.
//!
//! # Usage
//!
//! ```ignore
//! use ballast_api::jobs::{spatial_prune_task, SpatialPruneConfig};
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! tokio::spawn(spatial_prune_task(Arc::clone(&index), SpatialPruneConfig::default(), shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! ```

pub mod spatial_prune;

pub use spatial_prune::{spatial_prune_task, SpatialPruneConfig, SpatialPruneMetrics};
