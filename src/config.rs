//! Engine configuration
//!
//! Every knob lives here so a `ContextManager` can be constructed for very
//! different window sizes (a few hundred tokens in tests, six figures in
//! production) without touching engine code.

use crate::allocator::AllocationProfile;
use crate::error::{ContextError, Result};
use crate::tiers::MemoryTier;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Retention policy for a single memory tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Token ceiling before the tier counts as overflowing
    pub max_tokens: usize,
    /// Floor that eviction never drops the tier below
    pub min_tokens: usize,
    /// Whether compaction may touch this tier at all
    pub compressible: bool,
    /// Fraction of `max_tokens` compaction aims for (0, 1]
    pub compression_target: f64,
}

impl TierConfig {
    fn new(max_tokens: usize, min_tokens: usize, compressible: bool) -> Self {
        Self {
            max_tokens,
            min_tokens,
            compressible,
            compression_target: 0.5,
        }
    }
}

/// Per-tier retention policies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfigs {
    pub system: TierConfig,
    pub tools: TierConfig,
    pub resources: TierConfig,
    pub recent: TierConfig,
    pub archived: TierConfig,
    pub ephemeral: TierConfig,
}

impl Default for TierConfigs {
    fn default() -> Self {
        Self::scaled(128_000)
    }
}

impl TierConfigs {
    /// Tier ceilings and floors proportional to a context window size
    pub fn scaled(window_tokens: usize) -> Self {
        let pct = |p: usize| window_tokens * p / 100;
        Self {
            system: TierConfig::new(pct(10), 0, false),
            tools: TierConfig::new(pct(20), pct(2), false),
            resources: TierConfig::new(pct(20), pct(2), true),
            recent: TierConfig::new(pct(35), pct(5), true),
            archived: TierConfig::new(pct(10), pct(2), true),
            ephemeral: TierConfig::new(pct(5), 0, true),
        }
    }
}

impl TierConfigs {
    pub fn get(&self, tier: MemoryTier) -> &TierConfig {
        match tier {
            MemoryTier::System => &self.system,
            MemoryTier::Tools => &self.tools,
            MemoryTier::Resources => &self.resources,
            MemoryTier::Recent => &self.recent,
            MemoryTier::Archived => &self.archived,
            MemoryTier::Ephemeral => &self.ephemeral,
        }
    }

    pub fn get_mut(&mut self, tier: MemoryTier) -> &mut TierConfig {
        match tier {
            MemoryTier::System => &mut self.system,
            MemoryTier::Tools => &mut self.tools,
            MemoryTier::Resources => &mut self.resources,
            MemoryTier::Recent => &mut self.recent,
            MemoryTier::Archived => &mut self.archived,
            MemoryTier::Ephemeral => &mut self.ephemeral,
        }
    }
}

/// Token estimation heuristics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Characters per token for ordinary prose
    pub chars_per_token: f64,
    /// Characters per token for code-fenced or symbol-dense text
    pub dense_chars_per_token: f64,
    /// Non-alphanumeric ratio above which text counts as symbol-dense
    pub symbol_density_threshold: f64,
    /// Fixed per-message framing overhead in tokens
    pub message_overhead: usize,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            chars_per_token: 4.0,
            dense_chars_per_token: 3.0,
            symbol_density_threshold: 0.25,
            message_overhead: 4,
        }
    }
}

/// Compression behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Utilization ratio at which compaction kicks in
    pub compression_threshold: f64,
    /// Overall utilization compaction aims for
    pub compaction_target: f64,
    /// Patterns whose matches minification must keep byte-identical
    pub preserve_patterns: Vec<String>,
    /// Chunk size in tokens for hierarchical summarization
    pub chunk_tokens: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            compression_threshold: 0.8,
            compaction_target: 0.7,
            preserve_patterns: vec![
                // inline and fenced code, URLs, file paths
                r"`[^`]*`".to_string(),
                r"https?://\S+".to_string(),
                r"(?:[\w.-]+/)+[\w.-]+".to_string(),
            ],
            chunk_tokens: 2_000,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Total context window ceiling in tokens
    pub max_tokens: usize,
    /// Cap on messages assembled per request (system messages exempt)
    pub max_messages: Option<usize>,
    /// Budget split profile across tiers
    pub profile: AllocationProfile,
    pub tiers: TierConfigs,
    pub estimator: EstimatorConfig,
    pub compression: CompressionConfig,
    /// Regexes that boost a matching message's priority
    pub priority_boost_patterns: Vec<String>,
}

impl ContextConfig {
    /// Configuration for a given window size, tiers scaled to match
    pub fn for_window(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            tiers: TierConfigs::scaled(max_tokens),
            ..Self::default()
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 128_000,
            max_messages: None,
            profile: AllocationProfile::Chat,
            tiers: TierConfigs::default(),
            estimator: EstimatorConfig::default(),
            compression: CompressionConfig::default(),
            priority_boost_patterns: vec![
                r"(?i)\berror\b".to_string(),
                r"(?i)\bcritical\b".to_string(),
                r"(?i)\bimportant\b".to_string(),
                r"(?i)\bremember\b".to_string(),
            ],
        }
    }
}

impl ContextConfig {
    /// Validate that the configuration is internally consistent
    pub fn validate(&self) -> Result<()> {
        let ratio_ok = |v: f64| v > 0.0 && v <= 1.0;
        if !ratio_ok(self.compression.compression_threshold) {
            return Err(ContextError::Configuration(format!(
                "compression_threshold must be in (0, 1], got {}",
                self.compression.compression_threshold
            )));
        }
        if !ratio_ok(self.compression.compaction_target) {
            return Err(ContextError::Configuration(format!(
                "compaction_target must be in (0, 1], got {}",
                self.compression.compaction_target
            )));
        }
        for tier in MemoryTier::ALL {
            let cfg = self.tiers.get(tier);
            if cfg.min_tokens > cfg.max_tokens {
                return Err(ContextError::Configuration(format!(
                    "tier {:?}: min_tokens {} exceeds max_tokens {}",
                    tier, cfg.min_tokens, cfg.max_tokens
                )));
            }
            if !ratio_ok(cfg.compression_target) {
                return Err(ContextError::Configuration(format!(
                    "tier {:?}: compression_target must be in (0, 1]",
                    tier
                )));
            }
        }
        for pattern in self
            .priority_boost_patterns
            .iter()
            .chain(self.compression.preserve_patterns.iter())
        {
            Regex::new(pattern).map_err(|e| {
                ContextError::Configuration(format!("invalid pattern {pattern:?}: {e}"))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ContextConfig::default().validate().is_ok());
    }

    #[test]
    fn test_inverted_tier_bounds_rejected() {
        let mut config = ContextConfig::default();
        config.tiers.recent.min_tokens = config.tiers.recent.max_tokens + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let mut config = ContextConfig::default();
        config.priority_boost_patterns.push("(unclosed".to_string());
        assert!(config.validate().is_err());
    }
}
