//! ACE Playbook - self-curating agentic context library
//!
//! An incrementally curated knowledge cache for LLM agents:
//! - atomic insight records ("bullets") produced from task executions
//! - utility counters updated by per-task reflection verdicts
//! - delta-based merging into a shared SQLite-backed store
//! - periodic dedup, pruning, and capacity eviction
//! - scored top-K retrieval building a bounded prompt context
//!
//! # Example
//!
//! ```ignore
//! use ace_playbook::{AceConfig, AceEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Arc::new(AceEngine::new(AceConfig::default()).await?);
//!     let context = engine.retrieve_context("migrate the billing tables", 5).await;
//!     let trajectory = engine.execute_task("migrate the billing tables", 5).await;
//!     engine.learn_in_background(trajectory);
//!     let _ = context;
//!     Ok(())
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod error;
pub mod types;
pub mod config;
pub mod embeddings;
pub mod llm;
pub mod store;

// Pipeline components
pub mod generator;
pub mod reflector;
pub mod curator;
pub mod refiner;
pub mod retriever;
pub mod engine;

// Binary support
pub mod cli;

// Re-export commonly used types for convenience
pub use config::AceConfig;
pub use engine::{start_refiner, AceEngine, EngineStats, LearnReport};
pub use error::{PlaybookError, Result};
pub use store::{AppliedDelta, BulletStore, StoreStats};
pub use types::{
    Bullet, BulletId, BulletStatus, CandidateBullet, CounterUpdate, Delta, Playbook, Reflection,
    Section, Trajectory, TrajectoryStep, Verdict, VerdictOutcome,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
