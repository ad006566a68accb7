//! Context window management for LLM agents
//!
//! Keeps a long-running conversation inside a model's context window:
//! heuristic token estimation, a checked token budget, tiered message
//! memory, pluggable compression strategies, profile-driven allocation,
//! and versioned session persistence with incremental checkpoints.
//!
//! `ContextManager` is the facade most callers want:
//!
//! ```no_run
//! use context_engine::{ContextConfig, ContextManager, PrepareOptions};
//!
//! # async fn run() -> context_engine::Result<()> {
//! let mut manager = ContextManager::new(ContextConfig::for_window(128_000))?;
//! manager.add_system_message("You are a helpful assistant.").await?;
//! manager.add_user_message("Summarize the build failure.").await?;
//! let request = manager.prepare_for_request(PrepareOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod budget;
pub mod compressor;
pub mod config;
pub mod error;
pub mod estimator;
pub mod manager;
pub mod message;
pub mod session;
pub mod storage;
pub mod summarizer;
pub mod tiers;

pub use allocator::{AllocationDecision, AllocationProfile, Allocator};
pub use budget::{BudgetBreakdown, ReservationId, TokenBudgetTracker, TokenReservation};
pub use compressor::{
    CompressionOptions, CompressionRecord, CompressionResult, CompressionStrategy, Compressor,
    Lossiness, ToolReducer,
};
pub use config::{
    CompressionConfig, ContextConfig, EstimatorConfig, TierConfig, TierConfigs,
};
pub use error::{ContextError, Result};
pub use estimator::{EstimateItem, HeuristicEstimator, TokenEstimator};
pub use manager::{
    AddOptions, ApiMessage, ContextEvent, ContextManager, ContextStats, EventHandler,
    PrepareOptions, PreparedRequest,
};
pub use message::{
    ContentBlock, ContextMessage, ImageSource, MessageContent, MessageId, MessagePriority,
    MessageRole, ToolResultRecord,
};
pub use session::{
    DeserializeOptions, SerializeOptions, SerializedSession, SessionCheckpoint,
    SessionSerializer, SESSION_VERSION,
};
pub use storage::{FileStorage, InstrumentedStorage, MemoryStorage, SessionStorage};
pub use summarizer::{LlmSummarizer, Summarizer, SummarizerConfig, SummarizerError};
pub use tiers::{MemoryTier, TieredMemory};
