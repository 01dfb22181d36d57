//! # minishard
//!
//! Distributed job sharding and failover coordination:
//! - Items of a job are partitioned across live instances by a pluggable strategy
//! - A single leader per job reshards, guarded by flags in the coordination tree
//! - Per-item running markers are ephemeral, so a crash removes them
//! - Survivors claim crashed items and re-run them out of cycle
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        Coordination tree (/{ns}/{job})       │
//! │  config  servers/  instances/  sharding/     │
//! │  leader/{election,sharding,failover,...}     │
//! └───────┬──────────────────────────┬───────────┘
//!         │ change feed              │ reads / txns
//! ┌───────▼───────────┐     ┌────────┴──────────────────┐
//! │ ListenerDispatcher│────▶│ Sharding / Execution /    │
//! │  + handlers       │flags│ Failover services         │
//! └───────────────────┘     │   (LeaderGate for writes) │
//!                           └────────┬──────────────────┘
//!                                    │
//!                           ┌────────▼──────────┐
//!                           │ JobFacade         │◀── trigger layer
//!                           │ JobScheduler tick │
//!                           └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use minishard::{Config, InstanceRegistry, JobConfig, JobScheduler, JobTrigger, MemoryTree};
//! use std::sync::Arc;
//!
//! struct Log;
//! impl JobTrigger for Log {
//!     fn trigger_job(&self, instance_id: &str) -> minishard::Result<()> {
//!         println!("fire {}", instance_id);
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> minishard::Result<()> {
//! let tree = MemoryTree::new(1024);
//! let scheduler = JobScheduler::register(
//!     Arc::new(tree.connect()),
//!     InstanceRegistry::new(),
//!     &Config::load(),
//!     JobConfig::new("reports", 4).with_failover(true),
//!     Arc::new(Log),
//!     Vec::new(),
//! )
//! .await?;
//! let contexts = scheduler.facade().get_sharding_contexts().await?;
//! println!("local items: {:?}", contexts.items());
//! scheduler.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Simulate a fleet
//! ```bash
//! minishard-sim --instances 3 --items 8 --ticks 5 --crash 1 --failover
//! ```

pub mod common;
pub mod job;
pub mod leader;
pub mod listener;
pub mod registry;
pub mod storage;

// Re-export commonly used types
pub use common::{Config, Error, JobConfig, Result};
pub use job::{
    JobFacade, JobListener, JobScheduler, ShardedJob, ShardingContext, ShardingContexts,
    TickReport,
};
pub use leader::{LeaderGate, LeaderService};
pub use registry::{InstanceRegistry, JobInstance, JobTrigger};
pub use storage::{CoordinationClient, MemorySession, MemoryTree};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
