//! Token budget tracking
//!
//! Tracks a hard ceiling, named per-category running totals, and trusted
//! reservations. The conservation invariant holds after every call:
//! `used_tokens() == Σ allocations + Σ outstanding reservations`.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Opaque handle for an outstanding reservation
pub type ReservationId = Uuid;

/// A trusted, capacity-unchecked pre-allocation of tokens for a future need
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenReservation {
    pub id: ReservationId,
    pub label: String,
    pub tokens: usize,
    pub created_at: DateTime<Utc>,
}

/// Read-only snapshot of budget state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetBreakdown {
    pub max_tokens: usize,
    pub allocations: IndexMap<String, usize>,
    pub reserved: usize,
    pub used: usize,
    pub available: usize,
}

/// Token budget tracker
///
/// `allocate` is checked and all-or-nothing; `reserve` always succeeds
/// (callers reserve only what they are trusted to need, e.g. a response
/// budget). `Clone` is deep and independent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBudgetTracker {
    max_tokens: usize,
    allocations: IndexMap<String, usize>,
    reservations: Vec<TokenReservation>,
}

impl TokenBudgetTracker {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            allocations: IndexMap::new(),
            reservations: Vec::new(),
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Change the ceiling. Existing allocations are kept even if the new
    /// ceiling is below current usage; callers decide whether to compact.
    pub fn set_max_tokens(&mut self, max_tokens: usize) {
        self.max_tokens = max_tokens;
    }

    /// Total committed tokens: allocations plus outstanding reservations
    pub fn used_tokens(&self) -> usize {
        let allocated: usize = self.allocations.values().sum();
        let reserved: usize = self.reservations.iter().map(|r| r.tokens).sum();
        allocated + reserved
    }

    pub fn remaining_tokens(&self) -> usize {
        self.max_tokens.saturating_sub(self.used_tokens())
    }

    /// Atomic check-then-act allocation.
    ///
    /// Increments the category only if the result stays within the ceiling;
    /// on failure nothing changes and `false` is returned. Exhaustion is an
    /// expected condition, not an error.
    pub fn allocate(&mut self, category: &str, amount: usize) -> bool {
        if self.used_tokens() + amount > self.max_tokens {
            debug!(
                category,
                amount,
                used = self.used_tokens(),
                max = self.max_tokens,
                "allocation rejected"
            );
            return false;
        }
        *self.allocations.entry(category.to_string()).or_insert(0) += amount;
        true
    }

    /// Release tokens from a category, clamping at zero
    pub fn deallocate(&mut self, category: &str, amount: usize) {
        if let Some(current) = self.allocations.get_mut(category) {
            *current = current.saturating_sub(amount);
        }
    }

    pub fn allocation(&self, category: &str) -> usize {
        self.allocations.get(category).copied().unwrap_or(0)
    }

    /// Reserve tokens unconditionally and return the handle to release them
    pub fn reserve(&mut self, amount: usize, label: &str) -> ReservationId {
        let reservation = TokenReservation {
            id: Uuid::new_v4(),
            label: label.to_string(),
            tokens: amount,
            created_at: Utc::now(),
        };
        let id = reservation.id;
        debug!(label, amount, "reserved tokens");
        self.reservations.push(reservation);
        id
    }

    /// Release a reservation, returning the freed tokens if it existed
    pub fn release(&mut self, id: ReservationId) -> Option<usize> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos).tokens)
    }

    pub fn reserved_tokens(&self) -> usize {
        self.reservations.iter().map(|r| r.tokens).sum()
    }

    pub fn reservations(&self) -> &[TokenReservation] {
        &self.reservations
    }

    /// Whether `amount` more tokens would still fit under the ceiling
    pub fn can_fit(&self, amount: usize) -> bool {
        self.used_tokens() + amount <= self.max_tokens
    }

    /// Used/max ratio.
    ///
    /// A zero-capacity budget reports 1.0: a window with no room is
    /// saturated by definition, which keeps compaction triggers firing
    /// instead of propagating NaN.
    pub fn utilization_ratio(&self) -> f64 {
        if self.max_tokens == 0 {
            return 1.0;
        }
        self.used_tokens() as f64 / self.max_tokens as f64
    }

    pub fn get_breakdown(&self) -> BudgetBreakdown {
        BudgetBreakdown {
            max_tokens: self.max_tokens,
            allocations: self.allocations.clone(),
            reserved: self.reserved_tokens(),
            used: self.used_tokens(),
            available: self.remaining_tokens(),
        }
    }

    /// Clear per-request allocations while keeping longer-lived reservations
    pub fn reset(&mut self) {
        self.allocations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_within_budget() {
        let mut budget = TokenBudgetTracker::new(1000);
        assert!(budget.allocate("history", 800));
        assert_eq!(budget.used_tokens(), 800);
        assert!(budget.can_fit(150));
        assert!(!budget.can_fit(250));
    }

    #[test]
    fn test_allocate_rejection_has_no_partial_effect() {
        let mut budget = TokenBudgetTracker::new(100);
        assert!(budget.allocate("a", 90));
        assert!(!budget.allocate("b", 20));
        assert_eq!(budget.allocation("b"), 0);
        assert_eq!(budget.used_tokens(), 90);
    }

    #[test]
    fn test_conservation_across_sequences() {
        let mut budget = TokenBudgetTracker::new(10_000);
        budget.allocate("system", 500);
        budget.allocate("recent", 2_000);
        let r1 = budget.reserve(1_000, "response");
        let _r2 = budget.reserve(200, "tool_use");
        budget.deallocate("recent", 300);
        assert_eq!(budget.used_tokens(), 500 + 1_700 + 1_200);
        budget.release(r1);
        assert_eq!(budget.used_tokens(), 500 + 1_700 + 200);
        assert_eq!(
            budget.remaining_tokens(),
            budget.max_tokens() - budget.used_tokens()
        );
    }

    #[test]
    fn test_deallocate_clamps_at_zero() {
        let mut budget = TokenBudgetTracker::new(100);
        budget.allocate("a", 10);
        budget.deallocate("a", 50);
        assert_eq!(budget.allocation("a"), 0);
    }

    #[test]
    fn test_reserve_always_succeeds() {
        let mut budget = TokenBudgetTracker::new(100);
        let id = budget.reserve(10_000, "oversize");
        assert_eq!(budget.reserved_tokens(), 10_000);
        assert_eq!(budget.remaining_tokens(), 0);
        assert_eq!(budget.release(id), Some(10_000));
        assert_eq!(budget.release(id), None);
    }

    #[test]
    fn test_reset_keeps_reservations() {
        let mut budget = TokenBudgetTracker::new(1000);
        budget.allocate("history", 400);
        budget.reserve(100, "response");
        budget.reset();
        assert_eq!(budget.used_tokens(), 100);
        assert_eq!(budget.reserved_tokens(), 100);
    }

    #[test]
    fn test_zero_capacity_is_saturated() {
        let budget = TokenBudgetTracker::new(0);
        assert_eq!(budget.utilization_ratio(), 1.0);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut budget = TokenBudgetTracker::new(1000);
        budget.allocate("a", 100);
        let mut copy = budget.clone();
        copy.allocate("a", 200);
        assert_eq!(budget.allocation("a"), 100);
        assert_eq!(copy.allocation("a"), 300);
    }

    #[test]
    fn test_set_max_tokens_no_retroactive_eviction() {
        let mut budget = TokenBudgetTracker::new(1000);
        budget.allocate("a", 800);
        budget.set_max_tokens(500);
        assert_eq!(budget.used_tokens(), 800);
        assert!(budget.utilization_ratio() > 1.0);
        assert_eq!(budget.remaining_tokens(), 0);
    }

    #[test]
    fn test_breakdown() {
        let mut budget = TokenBudgetTracker::new(1000);
        budget.allocate("system", 100);
        budget.reserve(50, "response");
        let breakdown = budget.get_breakdown();
        assert_eq!(breakdown.allocations.get("system"), Some(&100));
        assert_eq!(breakdown.reserved, 50);
        assert_eq!(breakdown.used, 150);
        assert_eq!(breakdown.available, 850);
    }
}
