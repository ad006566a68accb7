//! Token estimation heuristics
//!
//! The engine works on calibrated estimates, not exact tokenization: a
//! consistent approximation that never fails is preferred over an exact
//! count that can stall the pipeline. An exact tokenizer can be plugged in
//! through the `TokenEstimator` trait.

use crate::config::EstimatorConfig;
use crate::message::{ContentBlock, ContextMessage, ImageSource, ToolResultRecord};

/// Image cost buckets: payload size is bucketed rather than decoded, so the
/// estimate stays proportional to nothing but the bucket.
const IMAGE_TOKENS_SMALL: usize = 256;
const IMAGE_TOKENS_MEDIUM: usize = 1_024;
const IMAGE_TOKENS_LARGE: usize = 2_048;

const IMAGE_SMALL_MAX_BYTES: usize = 64 * 1024;
const IMAGE_MEDIUM_MAX_BYTES: usize = 512 * 1024;

/// One item in a heterogeneous batch estimate
pub enum EstimateItem<'a> {
    Message(&'a ContextMessage),
    ToolResult(&'a ToolResultRecord),
    Text(&'a str),
}

/// Token counting strategy
///
/// All methods are total: they return a best-effort non-negative count and
/// never error.
pub trait TokenEstimator: Send + Sync {
    /// Estimate tokens for raw text; empty text is 0
    fn estimate_text(&self, text: &str) -> usize;

    /// Estimate tokens for a message.
    ///
    /// A cached `tokens` value is authoritative and returned verbatim;
    /// otherwise the content blocks are estimated and fixed per-message
    /// overhead added.
    fn estimate_message(&self, msg: &ContextMessage) -> usize;

    /// Estimate tokens for a tool result record
    fn estimate_tool_result(&self, result: &ToolResultRecord) -> usize;

    /// Estimate tokens for an image by payload bucket
    fn estimate_image(&self, source: &ImageSource) -> usize;

    /// Sum of estimates over a heterogeneous batch
    fn estimate_batch(&self, items: &[EstimateItem<'_>]) -> usize {
        items
            .iter()
            .map(|item| match item {
                EstimateItem::Message(m) => self.estimate_message(m),
                EstimateItem::ToolResult(r) => self.estimate_tool_result(r),
                EstimateItem::Text(t) => self.estimate_text(t),
            })
            .sum()
    }
}

/// Character-density token estimator
///
/// Ordinary prose averages ~4 characters per token; code and symbol-dense
/// text tokenizes denser, so it gets a lower divisor.
#[derive(Debug, Clone, Default)]
pub struct HeuristicEstimator {
    config: EstimatorConfig,
}

impl HeuristicEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }

    fn is_dense(&self, text: &str) -> bool {
        if text.contains("```") {
            return true;
        }
        let total = text.chars().filter(|c| !c.is_whitespace()).count();
        if total == 0 {
            return false;
        }
        let symbols = text
            .chars()
            .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
            .count();
        symbols as f64 / total as f64 > self.config.symbol_density_threshold
    }

    fn estimate_block(&self, block: &ContentBlock) -> usize {
        match block {
            ContentBlock::Text { text } => self.estimate_text(text),
            ContentBlock::Image { source } => self.estimate_image(source),
            ContentBlock::ToolResult { result } => self.estimate_tool_result(result),
        }
    }
}

impl TokenEstimator for HeuristicEstimator {
    fn estimate_text(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let divisor = if self.is_dense(text) {
            self.config.dense_chars_per_token
        } else {
            self.config.chars_per_token
        };
        (text.chars().count() as f64 / divisor).ceil() as usize
    }

    fn estimate_message(&self, msg: &ContextMessage) -> usize {
        if let Some(tokens) = msg.tokens {
            return tokens;
        }
        let content = match &msg.content {
            crate::message::MessageContent::Text(t) => self.estimate_text(t),
            crate::message::MessageContent::Blocks(blocks) => {
                blocks.iter().map(|b| self.estimate_block(b)).sum()
            }
        };
        content + self.config.message_overhead
    }

    fn estimate_tool_result(&self, result: &ToolResultRecord) -> usize {
        // tool_use_id and name ride along in the frame
        self.estimate_text(&result.content) + self.estimate_text(&result.name) + 2
    }

    fn estimate_image(&self, source: &ImageSource) -> usize {
        match source {
            ImageSource::Base64 { data, .. } => {
                if data.len() < IMAGE_SMALL_MAX_BYTES {
                    IMAGE_TOKENS_SMALL
                } else if data.len() < IMAGE_MEDIUM_MAX_BYTES {
                    IMAGE_TOKENS_MEDIUM
                } else {
                    IMAGE_TOKENS_LARGE
                }
            }
            // size unknown, assume the middle bucket
            ImageSource::Url { .. } => IMAGE_TOKENS_MEDIUM,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ContextMessage, MessageContent};

    fn estimator() -> HeuristicEstimator {
        HeuristicEstimator::default()
    }

    #[test]
    fn test_empty_text_is_zero() {
        assert_eq!(estimator().estimate_text(""), 0);
    }

    #[test]
    fn test_prose_density() {
        let text = "The quick brown fox jumps over the lazy dog";
        let tokens = estimator().estimate_text(text);
        // 43 chars / 4.0 -> 11
        assert_eq!(tokens, 11);
    }

    #[test]
    fn test_code_fence_is_denser() {
        let prose = "let x equal one plus two then print it out now";
        let code = "```\nlet x = 1 + 2; println!(\"{x}\");\n ok now\n```";
        let e = estimator();
        let prose_rate = e.estimate_text(prose) as f64 / prose.chars().count() as f64;
        let code_rate = e.estimate_text(code) as f64 / code.chars().count() as f64;
        assert!(code_rate > prose_rate);
    }

    #[test]
    fn test_cached_tokens_are_authoritative() {
        let mut msg = ContextMessage::user("some text that would estimate differently");
        msg.tokens = Some(7);
        assert_eq!(estimator().estimate_message(&msg), 7);
    }

    #[test]
    fn test_message_overhead_applied() {
        let msg = ContextMessage::user("hi");
        let e = estimator();
        assert_eq!(e.estimate_message(&msg), e.estimate_text("hi") + 4);
    }

    #[test]
    fn test_image_buckets() {
        let e = estimator();
        let small = ImageSource::Base64 {
            media_type: "image/png".to_string(),
            data: "a".repeat(1_000),
        };
        let large = ImageSource::Base64 {
            media_type: "image/png".to_string(),
            data: "a".repeat(600 * 1024),
        };
        let url = ImageSource::Url {
            url: "https://example.com/img.png".to_string(),
        };
        assert_eq!(e.estimate_image(&small), IMAGE_TOKENS_SMALL);
        assert_eq!(e.estimate_image(&large), IMAGE_TOKENS_LARGE);
        assert_eq!(e.estimate_image(&url), IMAGE_TOKENS_MEDIUM);
    }

    #[test]
    fn test_batch_sums_variants() {
        let e = estimator();
        let msg = ContextMessage::user("hello there");
        let result = ToolResultRecord {
            tool_use_id: "t1".to_string(),
            name: "grep".to_string(),
            content: "no matches".to_string(),
            is_error: false,
        };
        let items = [
            EstimateItem::Message(&msg),
            EstimateItem::ToolResult(&result),
            EstimateItem::Text("plain"),
        ];
        let total = e.estimate_batch(&items);
        assert_eq!(
            total,
            e.estimate_message(&msg)
                + e.estimate_tool_result(&result)
                + e.estimate_text("plain")
        );
    }

    #[test]
    fn test_blocks_content_estimated() {
        let e = estimator();
        let msg = ContextMessage::new(
            crate::message::MessageRole::User,
            MessageContent::Blocks(vec![
                ContentBlock::Text {
                    text: "describe this image".to_string(),
                },
                ContentBlock::Image {
                    source: ImageSource::Url {
                        url: "https://example.com/x.png".to_string(),
                    },
                },
            ]),
        );
        let tokens = e.estimate_message(&msg);
        assert!(tokens > IMAGE_TOKENS_MEDIUM);
    }
}
