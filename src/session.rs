//! Session serialization, restoration, and incremental checkpoints
//!
//! Sessions persist as versioned JSON-compatible records. Restoration fails
//! fast only on a version newer than this build supports; everything else —
//! bad message shape, unknown role, unparseable entry — is skipped and
//! logged to maximize restorability.

use crate::compressor::CompressionRecord;
use crate::config::ContextConfig;
use crate::error::{ContextError, Result};
use crate::estimator::TokenEstimator;
use crate::manager::{ContextManager, ContextStats};
use crate::message::{ContextMessage, MessageId};
use crate::summarizer::Summarizer;
use crate::tiers::MemoryTier;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Current session format version
pub const SESSION_VERSION: u32 = 2;

/// Flattened plain record for one persisted message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedMessage {
    pub id: MessageId,
    pub role: crate::message::MessageRole,
    pub content: crate::message::MessageContent,
    pub timestamp: DateTime<Utc>,
    pub tokens: Option<usize>,
    pub priority: crate::message::MessagePriority,
    pub compressible: bool,
    #[serde(default)]
    pub summarized_from: Vec<MessageId>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl From<&ContextMessage> for SerializedMessage {
    fn from(msg: &ContextMessage) -> Self {
        Self {
            id: msg.id,
            role: msg.role,
            content: msg.content.clone(),
            timestamp: msg.timestamp,
            tokens: msg.tokens,
            priority: msg.priority,
            compressible: msg.compressible,
            summarized_from: msg.summarized_from.clone(),
            metadata: msg.metadata.clone(),
        }
    }
}

impl From<SerializedMessage> for ContextMessage {
    fn from(record: SerializedMessage) -> Self {
        ContextMessage {
            id: record.id,
            role: record.role,
            content: record.content,
            timestamp: record.timestamp,
            tokens: record.tokens,
            priority: record.priority,
            compressible: record.compressible,
            summarized_from: record.summarized_from,
            metadata: record.metadata,
        }
    }
}

/// Coarse budget snapshot persisted with a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerializedBudget {
    pub max_tokens: usize,
    pub allocations: IndexMap<String, usize>,
}

/// Versioned session snapshot
///
/// Messages are stored as raw JSON values per tier so a single malformed
/// entry never poisons the rest of the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedSession {
    pub version: u32,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub config: ContextConfig,
    pub tiers: IndexMap<String, Vec<serde_json::Value>>,
    pub budget: SerializedBudget,
    #[serde(default)]
    pub compressions: Vec<CompressionRecord>,
    #[serde(default)]
    pub stats: ContextStats,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Incremental save: only what changed since a known point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    /// The point this checkpoint is incremental from
    pub since: DateTime<Utc>,
    /// (tier, message record) pairs for messages newer than `since`
    pub messages: Vec<(String, serde_json::Value)>,
    /// Ids evicted or replaced-by-summary since `since`
    pub evicted_ids: Vec<MessageId>,
    /// Net per-category budget movement since `since`
    pub budget_delta: IndexMap<String, i64>,
}

#[derive(Debug, Clone)]
pub struct SerializeOptions {
    pub include_compressions: bool,
    pub include_stats: bool,
}

impl Default for SerializeOptions {
    fn default() -> Self {
        Self {
            include_compressions: true,
            include_stats: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeserializeOptions {
    /// Discard cached token counts and re-estimate on insertion
    pub recalculate_tokens: bool,
    /// Restore only messages at or before this timestamp
    pub cutoff: Option<DateTime<Utc>>,
}

/// Serializes and restores `ContextManager` state
pub struct SessionSerializer;

impl SessionSerializer {
    /// Flatten a manager into a versioned snapshot
    pub fn serialize(
        manager: &ContextManager,
        options: &SerializeOptions,
    ) -> Result<SerializedSession> {
        let mut tiers: IndexMap<String, Vec<serde_json::Value>> = IndexMap::new();
        for tier in MemoryTier::PRECEDENCE {
            let records = manager
                .memory()
                .tier_messages(tier)
                .iter()
                .map(|m| serde_json::to_value(SerializedMessage::from(m)))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            tiers.insert(tier.as_str().to_string(), records);
        }

        let breakdown = manager.budget().get_breakdown();
        Ok(SerializedSession {
            version: SESSION_VERSION,
            session_id: manager.session_id().to_string(),
            created_at: manager.created_at(),
            updated_at: manager.updated_at(),
            config: manager.config().clone(),
            tiers,
            budget: SerializedBudget {
                max_tokens: breakdown.max_tokens,
                allocations: breakdown.allocations,
            },
            compressions: if options.include_compressions {
                manager.compressions().to_vec()
            } else {
                Vec::new()
            },
            stats: if options.include_stats {
                manager.get_stats().clone()
            } else {
                ContextStats::default()
            },
            metadata: manager.metadata().clone(),
        })
    }

    /// Restore a manager with the default heuristic estimator
    pub fn deserialize(
        session: &SerializedSession,
        options: &DeserializeOptions,
    ) -> Result<ContextManager> {
        let estimator: Arc<dyn TokenEstimator> = Arc::new(
            crate::estimator::HeuristicEstimator::new(session.config.estimator.clone()),
        );
        Self::deserialize_with(session, estimator, None, options)
    }

    /// Restore a manager with explicit collaborators.
    ///
    /// Messages are re-inserted in fixed tier precedence order with
    /// compaction suppressed; invalid entries are skipped and logged.
    pub fn deserialize_with(
        session: &SerializedSession,
        estimator: Arc<dyn TokenEstimator>,
        summarizer: Option<Arc<dyn Summarizer>>,
        options: &DeserializeOptions,
    ) -> Result<ContextManager> {
        if session.version > SESSION_VERSION {
            return Err(ContextError::UnsupportedVersion {
                found: session.version,
                supported: SESSION_VERSION,
            });
        }

        let mut manager =
            ContextManager::with_collaborators(session.config.clone(), estimator, summarizer)?;
        manager.set_session_id(session.session_id.clone());
        manager.set_timestamps(session.created_at, session.updated_at);
        manager.set_metadata_map(session.metadata.clone());
        manager.set_stats(session.stats.clone());
        manager.set_compressions(session.compressions.clone());

        let mut restored = 0usize;
        let mut skipped = 0usize;
        for tier in MemoryTier::PRECEDENCE {
            let Some(records) = session.tiers.get(tier.as_str()) else {
                continue;
            };
            for record in records {
                match Self::parse_message(record, session.version) {
                    Some(mut msg) => {
                        if let Some(cutoff) = options.cutoff {
                            if msg.timestamp > cutoff {
                                debug!(id = %msg.id, "message after cutoff, skipped");
                                skipped += 1;
                                continue;
                            }
                        }
                        if options.recalculate_tokens {
                            msg.tokens = None;
                        }
                        manager.restore_message(msg, tier);
                        restored += 1;
                    }
                    None => skipped += 1,
                }
            }
        }

        // budget state comes from the saved snapshot, not from insertion
        for (category, tokens) in &session.budget.allocations {
            manager.apply_budget_delta(category, *tokens as i64);
        }

        info!(
            session_id = %session.session_id,
            restored,
            skipped,
            "session restored"
        );
        Ok(manager)
    }

    /// Parse one persisted message record, migrating older formats
    fn parse_message(record: &serde_json::Value, version: u32) -> Option<ContextMessage> {
        let record = if version < 2 {
            Self::migrate_v1(record.clone())
        } else {
            record.clone()
        };
        match serde_json::from_value::<SerializedMessage>(record) {
            Ok(msg) => Some(msg.into()),
            Err(e) => {
                warn!(error = %e, "invalid message record, skipped");
                None
            }
        }
    }

    /// Version 1 stored priority as a bare numeric score
    fn migrate_v1(mut record: serde_json::Value) -> serde_json::Value {
        if let Some(obj) = record.as_object_mut() {
            if let Some(score) = obj.get("priority").and_then(|p| p.as_u64()) {
                let priority = if score >= 200 {
                    crate::message::MessagePriority::System
                } else {
                    crate::message::MessagePriority::from_score(score as u32)
                };
                obj.insert(
                    "priority".to_string(),
                    serde_json::to_value(priority).unwrap_or(serde_json::Value::Null),
                );
            }
            if !obj.contains_key("compressible") {
                obj.insert("compressible".to_string(), serde_json::Value::Bool(true));
            }
        }
        record
    }

    /// Incremental save carrying only changes since `since`.
    ///
    /// `baseline` is the budget breakdown captured at `since` (typically at
    /// the previous checkpoint); the delta is computed against it.
    pub fn create_checkpoint(
        manager: &ContextManager,
        since: DateTime<Utc>,
        baseline: &crate::budget::BudgetBreakdown,
    ) -> Result<SessionCheckpoint> {
        // compaction output keeps old timestamps, so the timestamp filter
        // alone would miss summaries and in-place rewrites
        let changed = manager.changed_since(since);
        let mut messages = Vec::new();
        for (tier, msg) in manager.memory().get_all_with_tiers() {
            if msg.timestamp > since || changed.contains(&msg.id) {
                messages.push((
                    tier.as_str().to_string(),
                    serde_json::to_value(SerializedMessage::from(msg))?,
                ));
            }
        }

        let current = manager.budget().get_breakdown();
        let mut budget_delta: IndexMap<String, i64> = IndexMap::new();
        let categories: Vec<&String> = current
            .allocations
            .keys()
            .chain(baseline.allocations.keys())
            .collect();
        for category in categories {
            let now = current.allocations.get(category).copied().unwrap_or(0) as i64;
            let then = baseline.allocations.get(category).copied().unwrap_or(0) as i64;
            if now != then && !budget_delta.contains_key(category) {
                budget_delta.insert(category.clone(), now - then);
            }
        }

        Ok(SessionCheckpoint {
            session_id: manager.session_id().to_string(),
            created_at: Utc::now(),
            since,
            messages,
            evicted_ids: manager.evicted_since(since),
            budget_delta,
        })
    }

    /// Apply checkpoints in timestamp order.
    ///
    /// Evicted-id removal is idempotent; already-present messages are not
    /// inserted twice. Returns how many messages were applied.
    pub fn apply_checkpoints(
        manager: &mut ContextManager,
        mut checkpoints: Vec<SessionCheckpoint>,
    ) -> Result<usize> {
        checkpoints.sort_by_key(|c| c.created_at);
        let mut applied = 0usize;
        for checkpoint in checkpoints {
            if checkpoint.session_id != manager.session_id() {
                warn!(
                    checkpoint_session = %checkpoint.session_id,
                    "checkpoint for a different session, skipped"
                );
                continue;
            }
            for id in &checkpoint.evicted_ids {
                manager.remove_restored(*id);
            }
            for (tier_name, record) in &checkpoint.messages {
                let Some(tier) = MemoryTier::from_str(tier_name) else {
                    warn!(tier_name, "unknown tier in checkpoint, entry skipped");
                    continue;
                };
                let Some(msg) = Self::parse_message(record, SESSION_VERSION) else {
                    continue;
                };
                // an already-present id may carry rewritten content from a
                // compaction pass; replace it unless it is identical
                let unchanged = manager
                    .memory()
                    .get_message(msg.id)
                    .map(|existing| existing.content == msg.content && existing.tokens == msg.tokens);
                match unchanged {
                    Some(true) => continue,
                    Some(false) => {
                        manager.remove_restored(msg.id);
                        manager.restore_message(msg, tier);
                        applied += 1;
                    }
                    None => {
                        manager.restore_message(msg, tier);
                        applied += 1;
                    }
                }
            }
            for (category, delta) in &checkpoint.budget_delta {
                manager.apply_budget_delta(category, *delta);
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::manager::AddOptions;

    async fn populated_manager() -> ContextManager {
        let mut manager = ContextManager::new(ContextConfig::for_window(50_000)).unwrap();
        manager.add_system_message("system rules").await.unwrap();
        manager.add_user_message("first question").await.unwrap();
        manager
            .add_assistant_message("first answer with detail")
            .await
            .unwrap();
        manager
            .add_tool_result(crate::message::ToolResultRecord {
                tool_use_id: "t1".to_string(),
                name: "grep".to_string(),
                content: "two matches found".to_string(),
                is_error: false,
            })
            .await
            .unwrap();
        manager
    }

    #[tokio::test]
    async fn test_round_trip_preserves_counts() {
        let manager = populated_manager().await;
        let session =
            SessionSerializer::serialize(&manager, &SerializeOptions::default()).unwrap();
        let restored =
            SessionSerializer::deserialize(&session, &DeserializeOptions::default()).unwrap();

        assert_eq!(restored.session_id(), manager.session_id());
        assert_eq!(restored.total_messages(), manager.total_messages());
        assert_eq!(restored.total_tokens(), manager.total_tokens());
        for tier in MemoryTier::ALL {
            assert_eq!(
                restored.memory().tier_message_count(tier),
                manager.memory().tier_message_count(tier)
            );
            assert_eq!(
                restored.memory().tier_tokens(tier),
                manager.memory().tier_tokens(tier)
            );
        }
        assert_eq!(
            restored.budget().used_tokens(),
            manager.budget().used_tokens()
        );
    }

    #[tokio::test]
    async fn test_future_version_rejected() {
        let manager = populated_manager().await;
        let mut session =
            SessionSerializer::serialize(&manager, &SerializeOptions::default()).unwrap();
        session.version = SESSION_VERSION + 1;
        let err = SessionSerializer::deserialize(&session, &DeserializeOptions::default());
        assert!(matches!(
            err,
            Err(ContextError::UnsupportedVersion { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_entries_skipped_not_fatal() {
        let manager = populated_manager().await;
        let mut session =
            SessionSerializer::serialize(&manager, &SerializeOptions::default()).unwrap();
        session
            .tiers
            .get_mut("recent")
            .unwrap()
            .push(serde_json::json!({"role": "gremlin", "content": 42}));
        let restored =
            SessionSerializer::deserialize(&session, &DeserializeOptions::default()).unwrap();
        assert_eq!(restored.total_messages(), manager.total_messages());
    }

    #[tokio::test]
    async fn test_v1_numeric_priority_migrated() {
        let manager = populated_manager().await;
        let mut session =
            SessionSerializer::serialize(&manager, &SerializeOptions::default()).unwrap();
        session.version = 1;
        for records in session.tiers.values_mut() {
            for record in records.iter_mut() {
                let obj = record.as_object_mut().unwrap();
                obj.insert("priority".to_string(), serde_json::json!(75));
            }
        }
        let restored =
            SessionSerializer::deserialize(&session, &DeserializeOptions::default()).unwrap();
        assert_eq!(restored.total_messages(), manager.total_messages());
        let any_recent = &restored.memory().tier_messages(MemoryTier::Recent)[0];
        assert_eq!(any_recent.priority, crate::message::MessagePriority::High);
    }

    #[tokio::test]
    async fn test_cutoff_filters_newer_messages() {
        let mut manager = ContextManager::new(ContextConfig::for_window(50_000)).unwrap();
        manager.add_user_message("old").await.unwrap();
        let cutoff = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        manager.add_user_message("new").await.unwrap();

        let session =
            SessionSerializer::serialize(&manager, &SerializeOptions::default()).unwrap();
        let restored = SessionSerializer::deserialize(
            &session,
            &DeserializeOptions {
                cutoff: Some(cutoff),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(restored.total_messages(), 1);
    }

    #[tokio::test]
    async fn test_recalculate_tokens() {
        let mut manager = ContextManager::new(ContextConfig::for_window(50_000)).unwrap();
        let mut msg = crate::message::ContextMessage::user("some ordinary text here");
        msg.tokens = Some(9_999); // deliberately wrong cache
        manager.add_message(msg, AddOptions::default()).await.unwrap();

        let session =
            SessionSerializer::serialize(&manager, &SerializeOptions::default()).unwrap();
        let restored = SessionSerializer::deserialize(
            &session,
            &DeserializeOptions {
                recalculate_tokens: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(restored.total_tokens() < 9_999);
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip_and_idempotent_eviction() {
        let mut manager = populated_manager().await;
        let since = manager.updated_at();
        let baseline = manager.budget().get_breakdown();

        // snapshot now, then keep working
        let session =
            SessionSerializer::serialize(&manager, &SerializeOptions::default()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        manager.add_user_message("after checkpoint").await.unwrap();

        let checkpoint =
            SessionSerializer::create_checkpoint(&manager, since, &baseline).unwrap();
        assert_eq!(checkpoint.messages.len(), 1);

        let mut restored =
            SessionSerializer::deserialize(&session, &DeserializeOptions::default()).unwrap();
        let applied =
            SessionSerializer::apply_checkpoints(&mut restored, vec![checkpoint.clone()])
                .unwrap();
        assert_eq!(applied, 1);
        assert_eq!(restored.total_messages(), manager.total_messages());
        assert_eq!(
            restored.budget().used_tokens(),
            manager.budget().used_tokens()
        );

        // applying the same messages again is a no-op
        let mut checkpoint_again = checkpoint;
        checkpoint_again.budget_delta.clear();
        let applied_again =
            SessionSerializer::apply_checkpoints(&mut restored, vec![checkpoint_again]).unwrap();
        assert_eq!(applied_again, 0);
    }
}
