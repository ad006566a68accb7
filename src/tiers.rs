//! Tiered message memory
//!
//! Six retention tiers, each an owned ordered arena with its own exact
//! running token counter. Moving a message between tiers is always
//! remove-from-one plus append-to-other, never a flag flip, so counters stay
//! exact without rescans. The single exception is `replace_messages`, which
//! recomputes the counter after a bulk swap.

use crate::config::TierConfigs;
use crate::error::{ContextError, Result};
use crate::estimator::TokenEstimator;
use crate::message::{ContextMessage, MessageId, MessagePriority, MessageRole};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Named retention class, ordered by retention priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTier {
    System,
    Tools,
    Resources,
    Recent,
    Archived,
    Ephemeral,
}

impl MemoryTier {
    /// All tiers in retention order
    pub const ALL: [MemoryTier; 6] = [
        MemoryTier::System,
        MemoryTier::Tools,
        MemoryTier::Resources,
        MemoryTier::Recent,
        MemoryTier::Archived,
        MemoryTier::Ephemeral,
    ];

    /// Fixed precedence used for timestamp tie-breaking in merges and for
    /// deserialization insertion order
    pub const PRECEDENCE: [MemoryTier; 6] = [
        MemoryTier::System,
        MemoryTier::Tools,
        MemoryTier::Resources,
        MemoryTier::Archived,
        MemoryTier::Recent,
        MemoryTier::Ephemeral,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::System => "system",
            MemoryTier::Tools => "tools",
            MemoryTier::Resources => "resources",
            MemoryTier::Recent => "recent",
            MemoryTier::Archived => "archived",
            MemoryTier::Ephemeral => "ephemeral",
        }
    }

    pub fn from_str(s: &str) -> Option<MemoryTier> {
        match s {
            "system" => Some(MemoryTier::System),
            "tools" => Some(MemoryTier::Tools),
            "resources" => Some(MemoryTier::Resources),
            "recent" => Some(MemoryTier::Recent),
            "archived" => Some(MemoryTier::Archived),
            "ephemeral" => Some(MemoryTier::Ephemeral),
            _ => None,
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }

    fn precedence_index(&self) -> usize {
        Self::PRECEDENCE.iter().position(|t| t == self).unwrap()
    }
}

/// One tier's owned messages plus its exact running token total
#[derive(Debug, Clone, Default)]
struct TierArena {
    messages: Vec<ContextMessage>,
    tokens: usize,
}

/// Six-tier message store with priority and eviction logic
#[derive(Clone)]
pub struct TieredMemory {
    arenas: [TierArena; 6],
    configs: TierConfigs,
    estimator: Arc<dyn TokenEstimator>,
    boost_patterns: Vec<Regex>,
}

impl TieredMemory {
    pub fn new(
        configs: TierConfigs,
        estimator: Arc<dyn TokenEstimator>,
        boost_patterns: &[String],
    ) -> Result<Self> {
        let boost_patterns = boost_patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| ContextError::Configuration(format!("invalid pattern {p:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            arenas: Default::default(),
            configs,
            estimator,
            boost_patterns,
        })
    }

    fn arena(&self, tier: MemoryTier) -> &TierArena {
        &self.arenas[tier.index()]
    }

    fn arena_mut(&mut self, tier: MemoryTier) -> &mut TierArena {
        &mut self.arenas[tier.index()]
    }

    /// Natural tier for a message: critical/system content pins to System,
    /// tool results to Tools, everything else lands in Recent
    pub fn compute_tier(&self, msg: &ContextMessage) -> MemoryTier {
        if msg.role == MessageRole::System || msg.priority >= MessagePriority::Critical {
            MemoryTier::System
        } else if msg.role == MessageRole::Tool {
            MemoryTier::Tools
        } else {
            MemoryTier::Recent
        }
    }

    /// Insert a message, computing and caching its token count if absent.
    ///
    /// Returns the tier it landed in and its token count.
    pub fn add_message(
        &mut self,
        mut msg: ContextMessage,
        tier_override: Option<MemoryTier>,
    ) -> (MessageId, MemoryTier, usize) {
        let tier = tier_override.unwrap_or_else(|| self.compute_tier(&msg));
        let tokens = match msg.tokens {
            Some(t) => t,
            None => {
                let t = self.estimator.estimate_message(&msg);
                msg.tokens = Some(t);
                t
            }
        };
        let id = msg.id;
        let arena = self.arena_mut(tier);
        arena.tokens += tokens;
        arena.messages.push(msg);
        debug!(?tier, tokens, %id, "message added");
        (id, tier, tokens)
    }

    /// Priority for a message at `position` of `total_recent` messages:
    /// role base, plus a boost per matched keyword pattern, plus a recency
    /// weight, capped at Critical for non-system roles.
    pub fn calculate_priority(
        &self,
        msg: &ContextMessage,
        position: usize,
        total_recent: usize,
    ) -> MessagePriority {
        if msg.role == MessageRole::System {
            return MessagePriority::System;
        }
        let base: f64 = match msg.role {
            MessageRole::Tool => 40.0,
            _ => 50.0,
        };
        let text = msg.content.as_text();
        let boost = self
            .boost_patterns
            .iter()
            .filter(|p| p.is_match(&text))
            .count() as f64
            * 15.0;
        let recency = if total_recent > 0 {
            (position as f64 / total_recent as f64) * 25.0
        } else {
            0.0
        };
        let score = (base + boost + recency).min(100.0);
        MessagePriority::from_score(score as u32)
    }

    /// All messages merged across tiers, ascending by timestamp.
    ///
    /// Ties break by fixed tier precedence, then insertion order; request
    /// assembly relies on this ordering being deterministic.
    pub fn get_all_messages(&self) -> Vec<&ContextMessage> {
        self.get_all_with_tiers().into_iter().map(|(_, m)| m).collect()
    }

    /// Same merge as `get_all_messages`, tagged with the owning tier
    pub fn get_all_with_tiers(&self) -> Vec<(MemoryTier, &ContextMessage)> {
        let mut merged: Vec<(MemoryTier, &ContextMessage)> =
            Vec::with_capacity(self.total_messages());
        for tier in MemoryTier::PRECEDENCE {
            for msg in &self.arena(tier).messages {
                merged.push((tier, msg));
            }
        }
        // stable sort keeps insertion order within (timestamp, tier) ties
        merged.sort_by(|a, b| {
            a.1.timestamp
                .cmp(&b.1.timestamp)
                .then(a.0.precedence_index().cmp(&b.0.precedence_index()))
        });
        merged
    }

    pub fn get_message(&self, id: MessageId) -> Option<&ContextMessage> {
        MemoryTier::ALL
            .into_iter()
            .find_map(|tier| self.arena(tier).messages.iter().find(|m| m.id == id))
    }

    pub fn tier_messages(&self, tier: MemoryTier) -> &[ContextMessage] {
        &self.arena(tier).messages
    }

    pub fn tier_tokens(&self, tier: MemoryTier) -> usize {
        self.arena(tier).tokens
    }

    pub fn tier_message_count(&self, tier: MemoryTier) -> usize {
        self.arena(tier).messages.len()
    }

    pub fn total_tokens(&self) -> usize {
        self.arenas.iter().map(|a| a.tokens).sum()
    }

    pub fn total_messages(&self) -> usize {
        self.arenas.iter().map(|a| a.messages.len()).sum()
    }

    pub fn configs(&self) -> &TierConfigs {
        &self.configs
    }

    pub fn is_tier_over_limit(&self, tier: MemoryTier) -> bool {
        self.arena(tier).tokens > self.configs.get(tier).max_tokens
    }

    pub fn get_tier_overflow(&self, tier: MemoryTier) -> usize {
        self.arena(tier)
            .tokens
            .saturating_sub(self.configs.get(tier).max_tokens)
    }

    /// Locate the tier currently owning a message
    pub fn find_tier(&self, id: MessageId) -> Option<MemoryTier> {
        MemoryTier::ALL
            .into_iter()
            .find(|tier| self.arena(*tier).messages.iter().any(|m| m.id == id))
    }

    /// Remove a message from whichever tier owns it
    pub fn remove_message(&mut self, id: MessageId) -> Option<(MemoryTier, ContextMessage)> {
        for tier in MemoryTier::ALL {
            let arena = self.arena_mut(tier);
            if let Some(pos) = arena.messages.iter().position(|m| m.id == id) {
                let msg = arena.messages.remove(pos);
                arena.tokens -= msg.cached_tokens();
                return Some((tier, msg));
            }
        }
        None
    }

    /// Move the oldest `n` Recent messages to Archived, preserving order
    pub fn demote_to_archived(&mut self, n: usize) -> Vec<MessageId> {
        let n = n.min(self.arena(MemoryTier::Recent).messages.len());
        let moved: Vec<ContextMessage> = self
            .arena_mut(MemoryTier::Recent)
            .messages
            .drain(..n)
            .collect();
        let mut ids = Vec::with_capacity(moved.len());
        for msg in moved {
            let tokens = msg.cached_tokens();
            self.arena_mut(MemoryTier::Recent).tokens -= tokens;
            ids.push(msg.id);
            let archived = self.arena_mut(MemoryTier::Archived);
            archived.tokens += tokens;
            archived.messages.push(msg);
        }
        ids
    }

    /// Move the given Archived messages back to Recent, preserving their
    /// relative order; returns how many actually moved
    pub fn promote_to_recent(&mut self, ids: &[MessageId]) -> usize {
        let mut moved = 0;
        let archived_ids: Vec<MessageId> = self
            .arena(MemoryTier::Archived)
            .messages
            .iter()
            .filter(|m| ids.contains(&m.id))
            .map(|m| m.id)
            .collect();
        for id in archived_ids {
            if let Some((_, msg)) = self.remove_message(id) {
                let tokens = msg.cached_tokens();
                let recent = self.arena_mut(MemoryTier::Recent);
                recent.tokens += tokens;
                recent.messages.push(msg);
                moved += 1;
            }
        }
        moved
    }

    /// Evict lowest-priority-then-oldest messages from a tier until its
    /// token total is at or below `floor`.
    ///
    /// The tier never drops below its configured `min_tokens`, and System is
    /// never evicted regardless of the call. Returns the evicted messages.
    pub fn evict(&mut self, tier: MemoryTier, floor: usize) -> Vec<ContextMessage> {
        if tier == MemoryTier::System {
            warn!("eviction requested for system tier, ignoring");
            return Vec::new();
        }
        let min_tokens = self.configs.get(tier).min_tokens;
        let target = floor.max(min_tokens);
        let arena = self.arena_mut(tier);
        let mut evicted = Vec::new();
        while arena.tokens > target {
            let candidate = arena
                .messages
                .iter()
                .enumerate()
                .min_by_key(|(i, m)| (m.priority, m.timestamp, *i))
                .map(|(i, _)| i);
            let Some(pos) = candidate else { break };
            let tokens = arena.messages[pos].cached_tokens();
            if arena.tokens - tokens < min_tokens {
                break;
            }
            let msg = arena.messages.remove(pos);
            arena.tokens -= tokens;
            evicted.push(msg);
        }
        if !evicted.is_empty() {
            debug!(?tier, count = evicted.len(), "evicted messages");
        }
        evicted
    }

    /// Atomically swap `old_ids` in a tier for `new_messages`.
    ///
    /// Fails without side effects unless every id is present in the tier.
    /// The tier counter is recomputed from the resulting set; this is the
    /// one sanctioned bulk-replace rescan.
    pub fn replace_messages(
        &mut self,
        tier: MemoryTier,
        old_ids: &[MessageId],
        new_messages: Vec<ContextMessage>,
    ) -> Result<()> {
        if tier == MemoryTier::System {
            return Err(ContextError::InvalidOperation(
                "system tier messages cannot be replaced".to_string(),
            ));
        }
        let arena = self.arena(tier);
        for id in old_ids {
            if !arena.messages.iter().any(|m| m.id == *id) {
                return Err(ContextError::InvalidOperation(format!(
                    "message {id} not present in {} tier",
                    tier.as_str()
                )));
            }
        }
        let new_messages: Vec<ContextMessage> = new_messages
            .into_iter()
            .map(|mut m| {
                if m.tokens.is_none() {
                    m.tokens = Some(self.estimator.estimate_message(&m));
                }
                m
            })
            .collect();
        let arena = self.arena_mut(tier);
        arena.messages.retain(|m| !old_ids.contains(&m.id));
        arena.messages.extend(new_messages);
        arena.tokens = arena.messages.iter().map(|m| m.cached_tokens()).sum();
        Ok(())
    }
}
