//! Fleetpulse Ingest - Location Persistence
//!
//! Moves driver positions from the location cache into the week-partitioned
//! history store, keeping only points that show real movement.
//!
//! ## Architecture
//!
//! ```text
//!                 per-driver append logs
//!                 ┌──────────┐ ┌──────────┐ ┌──────────┐
//!                 │ driver 1 │ │ driver 2 │ │ driver N │
//!                 └────┬─────┘ └────┬─────┘ └────┬─────┘
//!                      │  HashRing  │            │
//!            ┌─────────┴───┐   ┌────┴────────────┴──┐
//!            │ worker-0    │   │ worker-1           │   ConsumerPool
//!            │  read/claim │   │  read/claim        │
//!            │  filter     │   │  filter            │   DownsampleFilter
//!            │  batch      │   │  batch             │   BatchAccumulator
//!            └──────┬──────┘   └─────────┬──────────┘
//!                   │ persist            │
//!                   ▼                    ▼
//!            ┌───────────────────────────────────┐
//!            │ BatchPersister (COPY / INSERT)    │──► history partitions
//!            └───────────────────────────────────┘
//!                   │ then ack (or dead-letter)
//!                   ▼
//!              append logs / dead-letter log
//! ```
//!
//! ## Components
//!
//! - **StreamWorker**: one consumer-group member; read, down-sample, persist,
//!   acknowledge, with retry and poison-pill isolation
//! - **ConsumerPool**: runs and announces a process's workers
//! - **HashRing**: stable driver-to-worker assignment over the group's live
//!   members, across processes
//! - **DownsampleFilter**: distance rule over an injected per-driver state
//! - **IntervalSync**: snapshot-based alternative for small deployments
//! - **IngestConfig**: `FLEETPULSE_*` environment configuration
//!
//! ## Example
//!
//! ```rust,ignore
//! let pool = ConsumerPool::new(
//!     WorkerConfig::from_ingest(&config, &config.consumer_name),
//!     config.workers,
//!     Arc::new(cache),
//!     Arc::new(CopyPersister::new(table)),
//! );
//! pool.start().await?;
//!
//! // ... until shutdown ...
//!
//! pool.shutdown().await?;
//! ```

pub mod batch;
pub mod config;
pub mod dead_letter;
pub mod downsample;
pub mod error;
pub mod interval_sync;
pub mod pool;
pub mod retry;
pub mod ring;
pub mod worker;

pub use batch::BatchAccumulator;
pub use config::{IngestConfig, PersistenceMode};
pub use dead_letter::DeadLetterRouter;
pub use downsample::{Decision, DownsampleFilter, MemoryPointState, PointStateStore, Resolution};
pub use error::{IngestError, Result};
pub use interval_sync::{IntervalSync, SyncReport};
pub use pool::ConsumerPool;
pub use retry::RetryPolicy;
pub use ring::HashRing;
pub use worker::{
    StreamWorker, WorkerConfig, WorkerHandle, WorkerState, WorkerStats, DEFAULT_MEMBER_TTL,
};
