//! Per-session context manager
//!
//! The facade composing estimator, tiered memory, budget tracker, compressor
//! and allocator behind one API. No hidden global state: every collaborator
//! is passed at construction, so independent sessions coexist in one process.
//!
//! All mutating methods must be awaited to completion before the next call on
//! the same instance; reads are synchronous and safe at any time. Token
//! bookkeeping and tier placement are synchronous so budget invariants hold
//! the moment a mutating call returns.

use crate::allocator::{AllocationDecision, Allocator};
use crate::budget::{BudgetBreakdown, ReservationId, TokenBudgetTracker};
use crate::compressor::{
    CompressionOptions, CompressionRecord, CompressionStrategy, Compressor,
};
use crate::config::ContextConfig;
use crate::error::{ContextError, Result};
use crate::estimator::{HeuristicEstimator, TokenEstimator};
use crate::message::{
    ContextMessage, MessageContent, MessageId, MessageRole, ToolResultRecord,
};
use crate::summarizer::Summarizer;
use crate::tiers::{MemoryTier, TieredMemory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tiers compaction walks, in order, skipping any not flagged compressible
const COMPACTION_ORDER: [MemoryTier; 4] = [
    MemoryTier::Archived,
    MemoryTier::Ephemeral,
    MemoryTier::Resources,
    MemoryTier::Recent,
];

/// Utilization ratio at which `budget_critical` fires
const CRITICAL_UTILIZATION: f64 = 0.95;

/// Engine lifecycle events, delivered to handlers in registration order
#[derive(Debug, Clone)]
pub enum ContextEvent {
    MessageAdded {
        id: MessageId,
        tier: MemoryTier,
        tokens: usize,
    },
    MessageEvicted {
        id: MessageId,
        tier: MemoryTier,
        tokens: usize,
    },
    CompressionStarted {
        tier: MemoryTier,
        strategy: CompressionStrategy,
    },
    CompressionCompleted {
        tier: MemoryTier,
        strategy: CompressionStrategy,
        tokens_saved: usize,
    },
    TierOverflow {
        tier: MemoryTier,
        overflow: usize,
    },
    BudgetWarning {
        utilization: f64,
    },
    BudgetCritical {
        utilization: f64,
    },
}

/// Observer callback; panics are caught at the emission site
pub type EventHandler = Arc<dyn Fn(&ContextEvent) + Send + Sync>;

/// Running session statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextStats {
    pub messages_added: u64,
    pub messages_evicted: u64,
    pub compressions: u64,
    pub tokens_saved: u64,
}

/// Options for `add_message`
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub tier_override: Option<MemoryTier>,
    /// Skip the inline compression check for this insertion
    pub skip_compression: bool,
}

/// Options for `prepare_for_request`
#[derive(Debug, Clone)]
pub struct PrepareOptions {
    /// Cap on assembled messages; system messages are always retained
    pub max_messages: Option<usize>,
    /// Tokens reserved for the model's response
    pub response_tokens: usize,
    /// Tokens reserved for tool definitions and use
    pub tool_tokens: usize,
    pub force_compaction: bool,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            max_messages: None,
            response_tokens: 1_024,
            tool_tokens: 0,
            force_compaction: false,
        }
    }
}

/// Role/content pair at the provider adapter boundary
#[derive(Debug, Clone, Serialize)]
pub struct ApiMessage {
    pub role: MessageRole,
    pub content: MessageContent,
}

/// Assembled request-ready message set
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub messages: Vec<ApiMessage>,
    pub total_tokens: usize,
    pub response_tokens: usize,
    pub was_compressed: bool,
    /// Indices marking the end of the longest stable prefix, for
    /// provider-side prompt caching
    pub cache_breakpoints: Vec<usize>,
}

/// Per-session context window manager
#[derive(Clone)]
pub struct ContextManager {
    session_id: String,
    config: ContextConfig,
    memory: TieredMemory,
    budget: TokenBudgetTracker,
    compressor: Compressor,
    allocator: Allocator,
    handlers: Vec<EventHandler>,
    stats: ContextStats,
    compressions: Vec<CompressionRecord>,
    evicted_log: Vec<(DateTime<Utc>, MessageId)>,
    changed_log: Vec<(DateTime<Utc>, MessageId)>,
    request_reservations: Vec<ReservationId>,
    metadata: HashMap<String, String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ContextManager {
    /// Build a manager with the default heuristic estimator and no summarizer
    pub fn new(config: ContextConfig) -> Result<Self> {
        let estimator: Arc<dyn TokenEstimator> =
            Arc::new(HeuristicEstimator::new(config.estimator.clone()));
        Self::with_collaborators(config, estimator, None)
    }

    /// Build a manager with explicit collaborators
    pub fn with_collaborators(
        config: ContextConfig,
        estimator: Arc<dyn TokenEstimator>,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> Result<Self> {
        config.validate()?;
        let memory = TieredMemory::new(
            config.tiers.clone(),
            estimator.clone(),
            &config.priority_boost_patterns,
        )?;
        let budget = TokenBudgetTracker::new(config.max_tokens);
        let mut compressor = Compressor::new(estimator.clone(), config.compression.clone())?;
        if let Some(summarizer) = summarizer {
            compressor = compressor.with_summarizer(summarizer);
        }
        let allocator = Allocator::new(estimator, config.tiers.clone(), config.profile);
        let now = Utc::now();
        Ok(Self {
            session_id: Uuid::new_v4().to_string(),
            config,
            memory,
            budget,
            compressor,
            allocator,
            handlers: Vec::new(),
            stats: ContextStats::default(),
            compressions: Vec::new(),
            evicted_log: Vec::new(),
            changed_log: Vec::new(),
            request_reservations: Vec::new(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn set_session_id(&mut self, id: impl Into<String>) {
        self.session_id = id.into();
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.metadata
    }

    /// Register an event handler; handlers run in registration order and a
    /// panicking handler never interrupts the triggering operation
    pub fn on(&mut self, handler: EventHandler) {
        self.handlers.push(handler);
    }

    /// Register a tool-specific reducer for tool-aware compression
    pub fn register_tool_reducer(&mut self, tool_name: &str, reducer: crate::compressor::ToolReducer) {
        self.compressor.register_tool_reducer(tool_name, reducer);
    }

    fn emit(&self, event: &ContextEvent) {
        for handler in &self.handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(?event, "event handler panicked, continuing");
            }
        }
    }

    /// Insert a message, computing its tokens and priority, recording the
    /// budget allocation, and compacting inline once utilization crosses the
    /// threshold (unless skipped).
    ///
    /// Returns `BudgetExhausted` only when the message cannot fit even after
    /// compaction and eviction; the insertion is rolled back in that case.
    pub async fn add_message(
        &mut self,
        mut msg: ContextMessage,
        options: AddOptions,
    ) -> Result<MessageId> {
        // computed priority never lowers an explicit caller boost
        let recent_len = self.memory.tier_message_count(MemoryTier::Recent);
        let computed = self
            .memory
            .calculate_priority(&msg, recent_len, recent_len + 1);
        msg.priority = msg.priority.max(computed);

        let (id, tier, mut tokens) = self.memory.add_message(msg, options.tier_override);
        self.updated_at = Utc::now();

        if !self.budget.allocate(tier.as_str(), tokens) {
            self.recover_capacity(tokens, options.skip_compression).await;
            // recovery may have compressed the new message itself
            let survived = self.memory.get_message(id).map(|m| m.cached_tokens());
            let fitted = match survived {
                Some(current) => {
                    tokens = current;
                    self.budget.allocate(tier.as_str(), current)
                }
                None => false,
            };
            if !fitted {
                // roll back: nothing fits even after compaction and eviction
                let available = self.budget.remaining_tokens();
                if self.memory.remove_message(id).is_some() {
                    debug!(%id, ?tier, "rolled back insertion, budget exhausted");
                }
                self.emit(&ContextEvent::BudgetCritical {
                    utilization: self.budget.utilization_ratio(),
                });
                return Err(ContextError::BudgetExhausted {
                    needed: tokens,
                    available,
                });
            }
        }

        self.stats.messages_added += 1;
        self.emit(&ContextEvent::MessageAdded { id, tier, tokens });

        if self.memory.is_tier_over_limit(tier) {
            self.emit(&ContextEvent::TierOverflow {
                tier,
                overflow: self.memory.get_tier_overflow(tier),
            });
        }

        let utilization = self.budget.utilization_ratio();
        if utilization >= CRITICAL_UTILIZATION {
            self.emit(&ContextEvent::BudgetCritical { utilization });
        } else if utilization >= self.config.compression.compression_threshold {
            self.emit(&ContextEvent::BudgetWarning { utilization });
        }

        if !options.skip_compression && self.should_compress() {
            self.compact(None).await?;
        }
        Ok(id)
    }

    pub async fn add_system_message(&mut self, text: impl Into<String>) -> Result<MessageId> {
        self.add_message(ContextMessage::system(text.into()), AddOptions::default())
            .await
    }

    pub async fn add_user_message(&mut self, text: impl Into<String>) -> Result<MessageId> {
        self.add_message(ContextMessage::user(text.into()), AddOptions::default())
            .await
    }

    pub async fn add_assistant_message(&mut self, text: impl Into<String>) -> Result<MessageId> {
        self.add_message(
            ContextMessage::assistant(text.into()),
            AddOptions::default(),
        )
        .await
    }

    pub async fn add_tool_result(&mut self, result: ToolResultRecord) -> Result<MessageId> {
        self.add_message(ContextMessage::tool_result(result), AddOptions::default())
            .await
    }

    /// Free capacity under pressure: compact first, then evict per the
    /// allocator's plan
    async fn recover_capacity(&mut self, needed: usize, skip_compression: bool) {
        if !skip_compression {
            if let Err(e) = self.compact(None).await {
                warn!(error = %e, "compaction during capacity recovery failed");
            }
        }
        if self.budget.can_fit(needed) {
            return;
        }
        let decision = self.allocator.allocate(&self.memory, &self.budget, &[]);
        self.apply_evictions(&decision);
    }

    fn apply_evictions(&mut self, decision: &AllocationDecision) {
        for id in &decision.to_evict {
            if let Some((tier, msg)) = self.memory.remove_message(*id) {
                let tokens = msg.cached_tokens();
                self.budget.deallocate(tier.as_str(), tokens);
                self.record_eviction(msg.id);
                self.stats.messages_evicted += 1;
                self.emit(&ContextEvent::MessageEvicted {
                    id: msg.id,
                    tier,
                    tokens,
                });
            }
        }
    }

    fn record_eviction(&mut self, id: MessageId) {
        self.evicted_log.push((Utc::now(), id));
    }

    /// True once utilization passes the configured compression threshold
    pub fn should_compress(&self) -> bool {
        self.compressor
            .should_compress(self.memory.tier_messages(MemoryTier::Recent), &self.budget)
    }

    /// Compact compressible tiers toward `target_ratio` overall utilization
    /// (the configured compaction target by default).
    ///
    /// Never blocks on a missing summarizer: lossy truncation is always
    /// available as the terminal fallback. Returns tokens saved.
    pub async fn compact(&mut self, target_ratio: Option<f64>) -> Result<usize> {
        let target_ratio = target_ratio.unwrap_or(self.config.compression.compaction_target);
        let target_tokens = (self.budget.max_tokens() as f64 * target_ratio) as usize;
        let mut needed = self.budget.used_tokens().saturating_sub(target_tokens);
        let mut total_saved = 0usize;

        for tier in COMPACTION_ORDER {
            let tier_cfg = self.config.tiers.get(tier);
            if !tier_cfg.compressible {
                continue;
            }
            let current = self.memory.tier_tokens(tier);
            if current == 0 {
                continue;
            }

            // per-tier overflow forces the tier to its compression target
            // even when overall utilization is acceptable
            let mut tier_target = current;
            if current > tier_cfg.max_tokens {
                tier_target =
                    (tier_cfg.max_tokens as f64 * tier_cfg.compression_target) as usize;
            }
            tier_target = tier_target
                .min(current.saturating_sub(needed.min(current)))
                .max(tier_cfg.min_tokens);
            if tier_target >= current {
                continue;
            }

            let strategy = self.compressor.recommended_strategy(
                current,
                tier_target,
                self.compressor.has_summarizer(),
            );
            if strategy == CompressionStrategy::None {
                continue;
            }

            self.emit(&ContextEvent::CompressionStarted { tier, strategy });
            let messages = self.memory.tier_messages(tier).to_vec();
            let result = self
                .compressor
                .compress(&messages, &CompressionOptions::new(strategy, tier_target))
                .await;

            if result.compressed_tokens >= result.original_tokens {
                self.emit(&ContextEvent::CompressionCompleted {
                    tier,
                    strategy: result.strategy,
                    tokens_saved: 0,
                });
                continue;
            }

            let kept_ids: Vec<MessageId> = result.compressed.iter().map(|m| m.id).collect();
            self.memory
                .replace_messages(tier, &result.original_ids, result.compressed.clone())?;
            // ids replaced outright are gone for good; log them so
            // checkpoints can propagate the removal
            for id in result.original_ids.iter().filter(|id| !kept_ids.contains(id)) {
                self.record_eviction(*id);
            }
            // surviving messages may be rewritten in place or backdated
            // summaries, so their timestamps cannot mark them as changed;
            // log them so checkpoints pick them up
            let now = Utc::now();
            self.changed_log.extend(kept_ids.iter().map(|id| (now, *id)));

            let saved = result.original_tokens - result.compressed_tokens;
            self.budget.deallocate(tier.as_str(), saved);
            self.stats.compressions += 1;
            self.stats.tokens_saved += saved as u64;
            self.compressions.push(CompressionRecord {
                timestamp: Utc::now(),
                tier,
                strategy: result.strategy,
                original_tokens: result.original_tokens,
                compressed_tokens: result.compressed_tokens,
                ratio: result.ratio,
            });
            info!(
                ?tier,
                strategy = ?result.strategy,
                saved,
                "tier compacted"
            );
            self.emit(&ContextEvent::CompressionCompleted {
                tier,
                strategy: result.strategy,
                tokens_saved: saved,
            });

            total_saved += saved;
            needed = needed.saturating_sub(saved);
        }

        self.updated_at = Utc::now();
        Ok(total_saved)
    }

    /// Assemble the final ordered message set for a provider call.
    ///
    /// Reserves the response/tool budgets (releasing the previous request's
    /// reservations first), optionally forces compaction, caps to the most
    /// recent `max_messages` while always retaining every system message,
    /// and computes the cache breakpoint after the last System/Tools message.
    pub async fn prepare_for_request(
        &mut self,
        options: PrepareOptions,
    ) -> Result<PreparedRequest> {
        for id in self.request_reservations.drain(..).collect::<Vec<_>>() {
            self.budget.release(id);
        }

        let mut was_compressed = false;
        if options.force_compaction || self.should_compress() {
            was_compressed = self.compact(None).await? > 0;
        }

        if options.response_tokens > 0 {
            let id = self.budget.reserve(options.response_tokens, "response");
            self.request_reservations.push(id);
        }
        if options.tool_tokens > 0 {
            let id = self.budget.reserve(options.tool_tokens, "tool_use");
            self.request_reservations.push(id);
        }

        let all = self.memory.get_all_with_tiers();
        let cap = options.max_messages.or(self.config.max_messages);
        let selected: Vec<(MemoryTier, &ContextMessage)> = match cap {
            Some(cap) => {
                let system_count = all
                    .iter()
                    .filter(|(t, _)| *t == MemoryTier::System)
                    .count();
                let non_system_budget = cap.saturating_sub(system_count);
                let non_system_total = all.len() - system_count;
                let mut skip_remaining = non_system_total.saturating_sub(non_system_budget);
                all.into_iter()
                    .filter(|(tier, _)| {
                        if *tier == MemoryTier::System {
                            true
                        } else if skip_remaining > 0 {
                            skip_remaining -= 1;
                            false
                        } else {
                            true
                        }
                    })
                    .collect()
            }
            None => all,
        };

        let total_tokens: usize = selected.iter().map(|(_, m)| m.cached_tokens()).sum();
        let cache_breakpoints = selected
            .iter()
            .rposition(|(tier, _)| matches!(tier, MemoryTier::System | MemoryTier::Tools))
            .map(|idx| vec![idx + 1])
            .unwrap_or_default();
        let messages = selected
            .into_iter()
            .map(|(_, m)| ApiMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();

        Ok(PreparedRequest {
            messages,
            total_tokens,
            response_tokens: options.response_tokens,
            was_compressed,
            cache_breakpoints,
        })
    }

    /// Role/content pairs for a provider adapter, in merge order
    pub fn to_api_format(&self) -> Vec<ApiMessage> {
        self.memory
            .get_all_messages()
            .into_iter()
            .map(|m| ApiMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect()
    }

    // Synchronous reads, safe at any time including from event handlers.

    pub fn get_messages(&self) -> Vec<&ContextMessage> {
        self.memory.get_all_messages()
    }

    pub fn get_stats(&self) -> &ContextStats {
        &self.stats
    }

    pub fn get_budget(&self) -> BudgetBreakdown {
        self.budget.get_breakdown()
    }

    pub fn total_tokens(&self) -> usize {
        self.memory.total_tokens()
    }

    pub fn total_messages(&self) -> usize {
        self.memory.total_messages()
    }

    pub fn utilization_ratio(&self) -> f64 {
        self.budget.utilization_ratio()
    }

    pub fn memory(&self) -> &TieredMemory {
        &self.memory
    }

    /// Whether any tier currently owns a message with this id
    pub fn has_message(&self, id: MessageId) -> bool {
        self.memory.find_tier(id).is_some()
    }

    pub fn budget(&self) -> &TokenBudgetTracker {
        &self.budget
    }

    pub fn compressions(&self) -> &[CompressionRecord] {
        &self.compressions
    }

    /// Ids evicted or replaced-by-summary since `since`, for checkpoints
    pub fn evicted_since(&self, since: DateTime<Utc>) -> Vec<MessageId> {
        self.evicted_log
            .iter()
            .filter(|(ts, _)| *ts > since)
            .map(|(_, id)| *id)
            .collect()
    }

    /// Ids created or rewritten by compaction since `since`.
    ///
    /// Compaction output keeps old timestamps (rewrites keep the original's,
    /// summaries take the replaced block's), so checkpoints need this log in
    /// addition to the timestamp filter.
    pub fn changed_since(&self, since: DateTime<Utc>) -> Vec<MessageId> {
        self.changed_log
            .iter()
            .filter(|(ts, _)| *ts > since)
            .map(|(_, id)| *id)
            .collect()
    }

    // Restoration hooks used by the session serializer. Budget state is
    // restored separately from saved allocations and checkpoint deltas, so
    // these do not touch the tracker.

    pub(crate) fn restore_message(&mut self, msg: ContextMessage, tier: MemoryTier) {
        self.memory.add_message(msg, Some(tier));
    }

    pub(crate) fn remove_restored(&mut self, id: MessageId) {
        self.memory.remove_message(id);
    }


    pub(crate) fn set_stats(&mut self, stats: ContextStats) {
        self.stats = stats;
    }

    pub(crate) fn set_compressions(&mut self, compressions: Vec<CompressionRecord>) {
        self.compressions = compressions;
    }

    pub(crate) fn set_timestamps(&mut self, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) {
        self.created_at = created_at;
        self.updated_at = updated_at;
    }

    pub(crate) fn set_metadata_map(&mut self, metadata: HashMap<String, String>) {
        self.metadata = metadata;
    }

    pub(crate) fn apply_budget_delta(&mut self, category: &str, delta: i64) {
        if delta >= 0 {
            if !self.budget.allocate(category, delta as usize) {
                warn!(category, delta, "budget delta exceeds ceiling, skipped");
            }
        } else {
            self.budget.deallocate(category, (-delta) as usize);
        }
    }
}
