//! Per-tier token budget allocation
//!
//! Splits the distributable budget (ceiling minus reservations) across tiers
//! by profile percentage tables, then plans retain/compress/evict for tiers
//! over their share. System overflow is reported, never dropped.

use crate::budget::TokenBudgetTracker;
use crate::config::TierConfigs;
use crate::estimator::TokenEstimator;
use crate::message::{ContextMessage, MessageId, MessagePriority};
use crate::tiers::{MemoryTier, TieredMemory};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Named budget-split profile; same mechanism, different percentage tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationProfile {
    /// Tool- and resource-heavy workloads
    Coding,
    /// Conversation-heavy workloads
    Chat,
    /// Reference-material-heavy workloads
    Analysis,
}

impl AllocationProfile {
    /// Per-tier percentage shares, in retention order, summing to 100
    pub fn shares(&self) -> [(MemoryTier, usize); 6] {
        match self {
            AllocationProfile::Coding => [
                (MemoryTier::System, 10),
                (MemoryTier::Tools, 25),
                (MemoryTier::Resources, 25),
                (MemoryTier::Recent, 25),
                (MemoryTier::Archived, 10),
                (MemoryTier::Ephemeral, 5),
            ],
            AllocationProfile::Chat => [
                (MemoryTier::System, 10),
                (MemoryTier::Tools, 10),
                (MemoryTier::Resources, 10),
                (MemoryTier::Recent, 40),
                (MemoryTier::Archived, 25),
                (MemoryTier::Ephemeral, 5),
            ],
            AllocationProfile::Analysis => [
                (MemoryTier::System, 10),
                (MemoryTier::Tools, 10),
                (MemoryTier::Resources, 40),
                (MemoryTier::Recent, 25),
                (MemoryTier::Archived, 10),
                (MemoryTier::Ephemeral, 5),
            ],
        }
    }
}

/// Result of one allocation pass
#[derive(Debug, Clone)]
pub struct AllocationDecision {
    /// Target token share per tier
    pub allocations: IndexMap<MemoryTier, usize>,
    pub retained: Vec<MessageId>,
    pub to_compress: Vec<MessageId>,
    pub to_evict: Vec<MessageId>,
    /// False when System content alone exceeds its share
    pub success: bool,
    /// Tokens of System content that no share can cover
    pub overflow: Option<usize>,
}

/// Computes per-tier budgets and retain/compress/evict plans
#[derive(Clone)]
pub struct Allocator {
    estimator: Arc<dyn TokenEstimator>,
    configs: TierConfigs,
    profile: AllocationProfile,
}

impl Allocator {
    pub fn new(
        estimator: Arc<dyn TokenEstimator>,
        configs: TierConfigs,
        profile: AllocationProfile,
    ) -> Self {
        Self {
            estimator,
            configs,
            profile,
        }
    }

    pub fn profile(&self) -> AllocationProfile {
        self.profile
    }

    /// Profile shares of a distributable budget, clamped to each tier's
    /// absolute ceiling
    pub fn get_optimal_allocation(&self, distributable: usize) -> IndexMap<MemoryTier, usize> {
        self.profile
            .shares()
            .into_iter()
            .map(|(tier, pct)| {
                let share = distributable * pct / 100;
                (tier, share.min(self.configs.get(tier).max_tokens))
            })
            .collect()
    }

    /// Plan retention for the current store plus `incoming` messages.
    ///
    /// Incoming content is provisionally placed in its natural tier before
    /// the decision, so a single oversized turn can itself be trimmed.
    pub fn allocate(
        &self,
        memory: &TieredMemory,
        budget: &TokenBudgetTracker,
        incoming: &[ContextMessage],
    ) -> AllocationDecision {
        let distributable = budget
            .max_tokens()
            .saturating_sub(budget.reserved_tokens());
        let allocations = self.get_optimal_allocation(distributable);

        let mut retained = Vec::new();
        let mut to_compress = Vec::new();
        let mut to_evict = Vec::new();
        let mut success = true;
        let mut overflow_tokens = 0usize;

        for tier in MemoryTier::ALL {
            let share = allocations.get(&tier).copied().unwrap_or(0);

            // owned messages plus incoming ones that would land here
            let mut candidates: Vec<(MessageId, usize, MessagePriority, bool)> = memory
                .tier_messages(tier)
                .iter()
                .map(|m| (m.id, m.cached_tokens(), m.priority, m.compressible))
                .collect();
            for msg in incoming {
                if memory.compute_tier(msg) == tier {
                    let tokens = msg
                        .tokens
                        .unwrap_or_else(|| self.estimator.estimate_message(msg));
                    candidates.push((msg.id, tokens, msg.priority, msg.compressible));
                }
            }

            let current: usize = candidates.iter().map(|(_, t, ..)| t).sum();
            if current <= share {
                retained.extend(candidates.iter().map(|(id, ..)| *id));
                continue;
            }

            if tier == MemoryTier::System {
                // System is always fully retained; report what cannot fit
                warn!(
                    current,
                    share, "system tier exceeds its share, reporting overflow"
                );
                retained.extend(candidates.iter().map(|(id, ..)| *id));
                overflow_tokens += current - share;
                success = false;
                continue;
            }

            let mut need = current - share;
            let compression_target = self.configs.get(tier).compression_target;
            // lowest priority first, then oldest (insertion order)
            candidates.sort_by_key(|(_, _, priority, _)| *priority);

            let mut planned: Vec<MessageId> = Vec::new();
            // compressible low-priority content is compressed first
            for (id, tokens, priority, compressible) in &candidates {
                if need == 0 {
                    break;
                }
                if *compressible && *priority <= MessagePriority::Normal {
                    let saving = (*tokens as f64 * (1.0 - compression_target)) as usize;
                    to_compress.push(*id);
                    planned.push(*id);
                    need = need.saturating_sub(saving);
                }
            }
            // remainder is evicted outright
            for (id, tokens, _, _) in &candidates {
                if need == 0 {
                    break;
                }
                if planned.contains(id) {
                    continue;
                }
                to_evict.push(*id);
                planned.push(*id);
                need = need.saturating_sub(*tokens);
            }
            retained.extend(
                candidates
                    .iter()
                    .filter(|(id, ..)| !planned.contains(id))
                    .map(|(id, ..)| *id),
            );
        }

        debug!(
            retained = retained.len(),
            to_compress = to_compress.len(),
            to_evict = to_evict.len(),
            success,
            "allocation planned"
        );
        AllocationDecision {
            allocations,
            retained,
            to_compress,
            to_evict,
            success,
            overflow: if overflow_tokens > 0 {
                Some(overflow_tokens)
            } else {
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::HeuristicEstimator;
    use crate::message::{ContextMessage, MessageRole};

    fn sized(tokens: usize) -> ContextMessage {
        let mut msg = ContextMessage::user("x");
        msg.tokens = Some(tokens);
        msg
    }

    fn setup(profile: AllocationProfile) -> (Allocator, TieredMemory, TokenBudgetTracker) {
        let estimator: Arc<dyn TokenEstimator> = Arc::new(HeuristicEstimator::default());
        let configs = TierConfigs::default();
        let allocator = Allocator::new(estimator.clone(), configs.clone(), profile);
        let memory = TieredMemory::new(configs, estimator, &[]).unwrap();
        let budget = TokenBudgetTracker::new(10_000);
        (allocator, memory, budget)
    }

    #[test]
    fn test_profiles_sum_to_100() {
        for profile in [
            AllocationProfile::Coding,
            AllocationProfile::Chat,
            AllocationProfile::Analysis,
        ] {
            let total: usize = profile.shares().iter().map(|(_, pct)| pct).sum();
            assert_eq!(total, 100);
        }
    }

    #[test]
    fn test_shares_clamped_to_tier_max() {
        let estimator: Arc<dyn TokenEstimator> = Arc::new(HeuristicEstimator::default());
        let mut configs = TierConfigs::default();
        configs.recent.max_tokens = 100;
        let allocator = Allocator::new(estimator, configs, AllocationProfile::Chat);
        let allocation = allocator.get_optimal_allocation(10_000);
        assert_eq!(allocation[&MemoryTier::Recent], 100);
    }

    #[test]
    fn test_reservations_come_off_the_top() {
        let (allocator, _, _) = setup(AllocationProfile::Chat);
        let mut budget = TokenBudgetTracker::new(10_000);
        budget.reserve(5_000, "response");
        let memory = TieredMemory::new(
            TierConfigs::default(),
            Arc::new(HeuristicEstimator::default()),
            &[],
        )
        .unwrap();
        let decision = allocator.allocate(&memory, &budget, &[]);
        // chat recent share: 40% of 5000, not of 10000
        assert_eq!(decision.allocations[&MemoryTier::Recent], 2_000);
    }

    #[test]
    fn test_under_share_retains_everything() {
        let (allocator, mut memory, budget) = setup(AllocationProfile::Chat);
        let (id, ..) = memory.add_message(sized(100), None);
        let decision = allocator.allocate(&memory, &budget, &[]);
        assert!(decision.success);
        assert!(decision.retained.contains(&id));
        assert!(decision.to_compress.is_empty());
        assert!(decision.to_evict.is_empty());
    }

    #[test]
    fn test_over_share_compresses_then_evicts() {
        let (allocator, mut memory, mut budget) = setup(AllocationProfile::Chat);
        budget.set_max_tokens(1_000);
        // chat recent share: 400 tokens; load 1200 tokens of normal content
        let ids: Vec<_> = (0..6)
            .map(|_| memory.add_message(sized(200), None).0)
            .collect();
        let decision = allocator.allocate(&memory, &budget, &[]);
        assert!(decision.success);
        assert!(!decision.to_compress.is_empty());
        for id in &decision.to_compress {
            assert!(ids.contains(id));
        }
        // retained holds only untouched messages
        for id in decision.to_compress.iter().chain(&decision.to_evict) {
            assert!(!decision.retained.contains(id));
        }
    }

    #[test]
    fn test_system_overflow_reported_not_dropped() {
        let (allocator, mut memory, mut budget) = setup(AllocationProfile::Chat);
        budget.set_max_tokens(1_000);
        let mut system = ContextMessage::system("rules");
        system.tokens = Some(500);
        let (id, ..) = memory.add_message(system, None);
        let decision = allocator.allocate(&memory, &budget, &[]);
        assert!(!decision.success);
        // system share is 10% of 1000 = 100; 400 tokens cannot fit
        assert_eq!(decision.overflow, Some(400));
        assert!(decision.retained.contains(&id));
        assert!(!decision.to_evict.contains(&id));
        assert!(!decision.to_compress.contains(&id));
    }

    #[test]
    fn test_incoming_placed_before_decision() {
        let (allocator, memory, mut budget) = setup(AllocationProfile::Chat);
        budget.set_max_tokens(1_000);
        // a single oversized incoming turn can itself be planned for trimming
        let incoming = vec![sized(900)];
        let decision = allocator.allocate(&memory, &budget, &incoming);
        let planned: Vec<_> = decision
            .to_compress
            .iter()
            .chain(decision.to_evict.iter())
            .collect();
        assert!(planned.contains(&&incoming[0].id));
    }
}
