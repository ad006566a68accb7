//! Message-set compression
//!
//! A closed strategy table: one handler per `CompressionStrategy` value,
//! dispatched through `compress`. Lossy strategies degrade gracefully — a
//! missing or failing summarizer downgrades to truncation, never an error.

use crate::config::CompressionConfig;
use crate::error::{ContextError, Result};
use crate::estimator::TokenEstimator;
use crate::message::{ContextMessage, MessageContent, MessageId, MessageRole};
use crate::budget::TokenBudgetTracker;
use crate::summarizer::Summarizer;
use crate::tiers::MemoryTier;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Compression strategy, a closed tagged-variant set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionStrategy {
    None,
    Truncate,
    Minify,
    Extract,
    Summarize,
    Hierarchical,
    ToolAware,
}

/// How much original information a compression pass discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lossiness {
    None,
    Minimal,
    Moderate,
    High,
}

/// Outcome of one compression pass
#[derive(Debug, Clone)]
pub struct CompressionResult {
    /// Ids of the messages this pass replaced
    pub original_ids: Vec<MessageId>,
    pub compressed: Vec<ContextMessage>,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    /// compressed_tokens / original_tokens
    pub ratio: f64,
    /// Strategy actually executed (fallbacks are recorded, not requested)
    pub strategy: CompressionStrategy,
    pub lossiness: Lossiness,
}

/// Historical record of a completed compression, kept by the manager and
/// optionally serialized with the session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionRecord {
    pub timestamp: DateTime<Utc>,
    pub tier: MemoryTier,
    pub strategy: CompressionStrategy,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub ratio: f64,
}

/// Per-call compression options
#[derive(Debug, Clone)]
pub struct CompressionOptions {
    pub strategy: CompressionStrategy,
    pub target_tokens: usize,
    /// Instruction handed to the summarizer for summarize/hierarchical
    pub instruction: Option<String>,
}

impl CompressionOptions {
    pub fn new(strategy: CompressionStrategy, target_tokens: usize) -> Self {
        Self {
            strategy,
            target_tokens,
            instruction: None,
        }
    }
}

/// Tool-specific reducer: returns the reduced textual content for a tool
/// message it knows how to handle, or `None` to decline
pub type ToolReducer = Arc<dyn Fn(&ContextMessage) -> Option<String> + Send + Sync>;

const DEFAULT_SUMMARY_INSTRUCTION: &str =
    "Summarize the following conversation segment. Preserve decisions, \
     constraints, identifiers, and open items.";

/// Pluggable message-set compressor
#[derive(Clone)]
pub struct Compressor {
    estimator: Arc<dyn TokenEstimator>,
    summarizer: Option<Arc<dyn Summarizer>>,
    config: CompressionConfig,
    preserve: Vec<Regex>,
    space_run: Regex,
    blank_run: Regex,
    severity: Regex,
    tool_reducers: HashMap<String, ToolReducer>,
}

impl Compressor {
    pub fn new(estimator: Arc<dyn TokenEstimator>, config: CompressionConfig) -> Result<Self> {
        let preserve = config
            .preserve_patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| ContextError::Configuration(format!("invalid pattern {p:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            estimator,
            summarizer: None,
            config,
            preserve,
            space_run: Regex::new(r"[ \t]{2,}").expect("static pattern"),
            blank_run: Regex::new(r"\n{3,}").expect("static pattern"),
            severity: Regex::new(r"(?i)\b(error|fail|failed|warn|warning|exception|panic|fatal|critical)\b")
                .expect("static pattern"),
            tool_reducers: HashMap::new(),
        })
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn has_summarizer(&self) -> bool {
        self.summarizer.is_some()
    }

    /// Register a reducer for tool results recorded under `tool_name`
    pub fn register_tool_reducer(&mut self, tool_name: &str, reducer: ToolReducer) {
        self.tool_reducers.insert(tool_name.to_string(), reducer);
    }

    /// Utilization-based compression trigger
    pub fn should_compress(
        &self,
        messages: &[ContextMessage],
        budget: &TokenBudgetTracker,
    ) -> bool {
        let utilization = if budget.max_tokens() == 0 {
            budget.utilization_ratio()
        } else {
            let content: usize = messages.iter().map(|m| self.estimator.estimate_message(m)).sum();
            let used = budget.used_tokens().max(content);
            used as f64 / budget.max_tokens() as f64
        };
        utilization >= self.config.compression_threshold
    }

    /// Deterministic strategy table keyed on the required reduction
    pub fn recommended_strategy(
        &self,
        current_tokens: usize,
        target_tokens: usize,
        summarizer_available: bool,
    ) -> CompressionStrategy {
        if target_tokens >= current_tokens || current_tokens == 0 {
            return CompressionStrategy::None;
        }
        let reduction = 1.0 - target_tokens as f64 / current_tokens as f64;
        if reduction > 0.75 && summarizer_available {
            CompressionStrategy::Hierarchical
        } else if reduction <= 0.20 {
            CompressionStrategy::Minify
        } else if reduction <= 0.50 {
            CompressionStrategy::Extract
        } else if summarizer_available {
            CompressionStrategy::Summarize
        } else {
            CompressionStrategy::Truncate
        }
    }

    /// Cheap non-mutating projection of what a strategy would leave behind,
    /// for the allocator to pick a strategy without paying its cost
    pub fn estimate(
        &self,
        messages: &[ContextMessage],
        strategy: CompressionStrategy,
        target_tokens: usize,
    ) -> usize {
        let current: usize = messages
            .iter()
            .map(|m| self.estimator.estimate_message(m))
            .sum();
        match strategy {
            CompressionStrategy::None => current,
            CompressionStrategy::Minify => (current as f64 * 0.85) as usize,
            CompressionStrategy::Extract => (current as f64 * 0.50) as usize,
            CompressionStrategy::ToolAware => (current as f64 * 0.40) as usize,
            CompressionStrategy::Truncate
            | CompressionStrategy::Summarize
            | CompressionStrategy::Hierarchical => target_tokens.min(current),
        }
    }

    /// Run one compression pass over a message set.
    ///
    /// Already-under-target input is returned untouched with ratio 1. For
    /// every other outcome `compressed_tokens <= original_tokens`.
    pub async fn compress(
        &self,
        messages: &[ContextMessage],
        options: &CompressionOptions,
    ) -> CompressionResult {
        let original_tokens: usize = messages
            .iter()
            .map(|m| self.estimator.estimate_message(m))
            .sum();
        let original_ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();

        if options.strategy == CompressionStrategy::None
            || original_tokens <= options.target_tokens
        {
            return CompressionResult {
                original_ids,
                compressed: messages.to_vec(),
                original_tokens,
                compressed_tokens: original_tokens,
                ratio: 1.0,
                strategy: CompressionStrategy::None,
                lossiness: Lossiness::None,
            };
        }

        let (compressed, strategy, lossiness) = match options.strategy {
            CompressionStrategy::None => unreachable!("handled above"),
            CompressionStrategy::Truncate => (
                self.truncate(messages, options.target_tokens),
                CompressionStrategy::Truncate,
                Lossiness::High,
            ),
            CompressionStrategy::Minify => (
                self.minify(messages),
                CompressionStrategy::Minify,
                Lossiness::Minimal,
            ),
            CompressionStrategy::Extract => (
                self.extract(messages, options.target_tokens),
                CompressionStrategy::Extract,
                Lossiness::Moderate,
            ),
            CompressionStrategy::Summarize => {
                match self.summarize(messages, options).await {
                    Some(compressed) => {
                        (compressed, CompressionStrategy::Summarize, Lossiness::High)
                    }
                    None => (
                        self.truncate(messages, options.target_tokens),
                        CompressionStrategy::Truncate,
                        Lossiness::High,
                    ),
                }
            }
            CompressionStrategy::Hierarchical => {
                match self.hierarchical(messages, options).await {
                    Some(compressed) => (
                        compressed,
                        CompressionStrategy::Hierarchical,
                        Lossiness::High,
                    ),
                    None => (
                        self.truncate(messages, options.target_tokens),
                        CompressionStrategy::Truncate,
                        Lossiness::High,
                    ),
                }
            }
            CompressionStrategy::ToolAware => (
                self.tool_aware(messages, options.target_tokens),
                CompressionStrategy::ToolAware,
                Lossiness::Moderate,
            ),
        };

        let compressed_tokens: usize = compressed
            .iter()
            .map(|m| self.estimator.estimate_message(m))
            .sum();
        let ratio = if original_tokens == 0 {
            1.0
        } else {
            compressed_tokens as f64 / original_tokens as f64
        };
        debug!(
            ?strategy,
            original_tokens, compressed_tokens, ratio, "compression pass complete"
        );
        CompressionResult {
            original_ids,
            compressed,
            original_tokens,
            compressed_tokens,
            ratio,
            strategy,
            lossiness,
        }
    }

    /// Drop oldest-first whole messages until under target
    fn truncate(&self, messages: &[ContextMessage], target_tokens: usize) -> Vec<ContextMessage> {
        let mut kept: Vec<ContextMessage> = Vec::new();
        let mut total = 0usize;
        // newest first, then restore chronological order
        for msg in messages.iter().rev() {
            let tokens = self.estimator.estimate_message(msg);
            if total + tokens > target_tokens {
                break;
            }
            total += tokens;
            kept.push(msg.clone());
        }
        kept.reverse();
        kept
    }

    /// Collapse whitespace runs per message without dropping words.
    /// Caller-supplied preserve patterns remain byte-identical.
    fn minify(&self, messages: &[ContextMessage]) -> Vec<ContextMessage> {
        messages
            .iter()
            .map(|msg| {
                let text = msg.content.as_text();
                let minified = self.minify_text(&text);
                self.rewrite_content(msg, minified)
            })
            .collect()
    }

    fn minify_text(&self, text: &str) -> String {
        // collect spans that must survive byte-identical
        let mut spans: Vec<(usize, usize)> = Vec::new();
        for re in &self.preserve {
            for m in re.find_iter(text) {
                spans.push((m.start(), m.end()));
            }
        }
        spans.sort_unstable();
        let mut merged: Vec<(usize, usize)> = Vec::new();
        for span in spans {
            match merged.last_mut() {
                Some(last) if span.0 <= last.1 => last.1 = last.1.max(span.1),
                _ => merged.push(span),
            }
        }

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for (start, end) in merged {
            out.push_str(&self.minify_fragment(&text[cursor..start]));
            out.push_str(&text[start..end]);
            cursor = end;
        }
        out.push_str(&self.minify_fragment(&text[cursor..]));
        out
    }

    fn minify_fragment(&self, fragment: &str) -> String {
        let collapsed = self.space_run.replace_all(fragment, " ");
        self.blank_run.replace_all(&collapsed, "\n\n").into_owned()
    }

    /// Keep ranked segments (headings, list items, severity-flagged lines)
    /// ahead of plain prose until under target
    fn extract(&self, messages: &[ContextMessage], target_tokens: usize) -> Vec<ContextMessage> {
        let total: usize = messages
            .iter()
            .map(|m| self.estimator.estimate_message(m))
            .sum();
        if total == 0 {
            return messages.to_vec();
        }
        messages
            .iter()
            .map(|msg| {
                let tokens = self.estimator.estimate_message(msg);
                // each message gets a share of the target proportional to
                // its share of the original
                let share = ((tokens as f64 / total as f64) * target_tokens as f64) as usize;
                let text = msg.content.as_text();
                let extracted = self.extract_text(&text, share.max(1));
                self.rewrite_content(msg, extracted)
            })
            .collect()
    }

    fn segment_score(&self, line: &str) -> u32 {
        let trimmed = line.trim_start();
        if self.severity.is_match(line) {
            4
        } else if trimmed.starts_with('#') {
            3
        } else if trimmed.starts_with('-')
            || trimmed.starts_with('*')
            || trimmed.starts_with('+')
            || trimmed
                .split_once('.')
                .map(|(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false)
        {
            2
        } else {
            1
        }
    }

    fn extract_text(&self, text: &str, target_tokens: usize) -> String {
        let lines: Vec<&str> = text.lines().collect();
        let mut ranked: Vec<(usize, u32)> = lines
            .iter()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .map(|(i, l)| (i, self.segment_score(l)))
            .collect();
        // highest score first, original order within a score
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut kept: Vec<usize> = Vec::new();
        let mut total = 0usize;
        for (idx, _) in ranked {
            let tokens = self.estimator.estimate_text(lines[idx]);
            if total + tokens > target_tokens && !kept.is_empty() {
                continue;
            }
            total += tokens;
            kept.push(idx);
        }
        kept.sort_unstable();
        kept.into_iter()
            .map(|i| lines[i])
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn summarize(
        &self,
        messages: &[ContextMessage],
        options: &CompressionOptions,
    ) -> Option<Vec<ContextMessage>> {
        let summarizer = self.summarizer.as_ref()?;
        let combined = Self::combined_text(messages);
        let instruction = options
            .instruction
            .as_deref()
            .unwrap_or(DEFAULT_SUMMARY_INSTRUCTION);
        match summarizer
            .summarize(&combined, instruction, options.target_tokens)
            .await
        {
            Ok(summary) => Some(vec![self.summary_message(messages, summary)]),
            Err(e) => {
                warn!(error = %e, "summarizer unavailable, falling back to truncation");
                None
            }
        }
    }

    /// Summarize fixed-size chunks, then summarize the summaries if the
    /// combined result is still over target
    async fn hierarchical(
        &self,
        messages: &[ContextMessage],
        options: &CompressionOptions,
    ) -> Option<Vec<ContextMessage>> {
        let summarizer = self.summarizer.as_ref()?;
        let instruction = options
            .instruction
            .as_deref()
            .unwrap_or(DEFAULT_SUMMARY_INSTRUCTION);

        let mut chunks: Vec<Vec<&ContextMessage>> = Vec::new();
        let mut current: Vec<&ContextMessage> = Vec::new();
        let mut current_tokens = 0usize;
        for msg in messages {
            let tokens = self.estimator.estimate_message(msg);
            if current_tokens + tokens > self.config.chunk_tokens && !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            current_tokens += tokens;
            current.push(msg);
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        let per_chunk_target = (options.target_tokens / chunks.len().max(1)).max(64);
        let mut summaries: Vec<String> = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let text = chunk
                .iter()
                .map(|m| format!("{}: {}", m.role.as_str(), m.content.as_text()))
                .collect::<Vec<_>>()
                .join("\n");
            match summarizer
                .summarize(&text, instruction, per_chunk_target)
                .await
            {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    warn!(error = %e, "chunk summarization failed, falling back");
                    return None;
                }
            }
        }

        let combined = summaries.join("\n\n");
        let combined_tokens = self.estimator.estimate_text(&combined);
        let final_text = if combined_tokens > options.target_tokens {
            match summarizer
                .summarize(&combined, instruction, options.target_tokens)
                .await
            {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(error = %e, "summary-of-summaries failed, falling back");
                    return None;
                }
            }
        } else {
            combined
        };

        Some(vec![self.summary_message(messages, final_text)])
    }

    /// Per-message dispatch to tool-specific reducers; messages without a
    /// matching reducer go through segment extraction instead
    fn tool_aware(&self, messages: &[ContextMessage], target_tokens: usize) -> Vec<ContextMessage> {
        messages
            .iter()
            .map(|msg| {
                let reduced = msg
                    .tool_name()
                    .and_then(|name| self.tool_reducers.get(name))
                    .and_then(|reducer| reducer(msg));
                match reduced {
                    Some(content) => self.rewrite_content(msg, content),
                    None => {
                        let share = target_tokens / messages.len().max(1);
                        let extracted =
                            self.extract_text(&msg.content.as_text(), share.max(1));
                        self.rewrite_content(msg, extracted)
                    }
                }
            })
            .collect()
    }

    /// Same message identity, new textual content, fresh token count
    fn rewrite_content(&self, msg: &ContextMessage, content: String) -> ContextMessage {
        let mut rewritten = msg.clone();
        rewritten.content = MessageContent::Text(content);
        rewritten.tokens = None;
        rewritten.tokens = Some(self.estimator.estimate_message(&rewritten));
        rewritten
    }

    fn summary_message(&self, originals: &[ContextMessage], summary: String) -> ContextMessage {
        let mut msg = ContextMessage::new(MessageRole::Assistant, summary);
        msg.summarized_from = originals.iter().map(|m| m.id).collect();
        if let Some(last) = originals.last() {
            // keep the summary at the replaced block's position in the merge
            msg.timestamp = last.timestamp;
        }
        msg.tokens = Some(self.estimator.estimate_message(&msg));
        msg.metadata
            .insert("summary".to_string(), "true".to_string());
        msg
    }

    fn combined_text(messages: &[ContextMessage]) -> String {
        messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content.as_text()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
