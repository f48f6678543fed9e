//! Context budget tracking per session.
//!
//! Maintains a running estimate of consumed context and raises a one-shot
//! auto-compact trigger when usage crosses the configured threshold. The
//! trigger stays latched until it is explicitly reset, e.g. after a
//! successful compaction or when a new session starts.

use crate::message::Message;
use serde::{Deserialize, Serialize};

/// Approximate chars per token when the provider reports no usage
const CHARS_PER_TOKEN: u64 = 4;

/// Default trigger threshold, percent of the context window
const DEFAULT_THRESHOLD_PERCENT: f32 = 80.0;

/// Snapshot of consumed context, recomputed on every usage report
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub max_tokens: u64,
    pub usage_percent: f32,
}

/// Per-session context tracker. Not shared across sessions, so no locking.
#[derive(Debug, Clone)]
pub struct ContextTracker {
    prompt_tokens: u64,
    completion_tokens: u64,
    max_tokens: u64,
    threshold_percent: f32,
    auto_compact_fired: bool,
}

impl ContextTracker {
    pub fn new(max_tokens: u64) -> Self {
        Self {
            prompt_tokens: 0,
            completion_tokens: 0,
            max_tokens: max_tokens.max(1),
            threshold_percent: DEFAULT_THRESHOLD_PERCENT,
            auto_compact_fired: false,
        }
    }

    /// Record a provider usage report. The prompt count replaces the prior
    /// value (it reflects the whole transmitted context); the completion
    /// count is for the latest response.
    pub fn update_usage(&mut self, prompt_tokens: u64, completion_tokens: Option<u64>) {
        self.prompt_tokens = prompt_tokens;
        if let Some(completion) = completion_tokens {
            self.completion_tokens = completion;
        }
    }

    /// Fallback when the provider reported nothing: estimate from the
    /// character count of the transmitted history.
    pub fn update_from_estimate(&mut self, history: &[Message]) {
        let chars: u64 = history.iter().map(|m| m.char_count() as u64).sum();
        self.prompt_tokens = estimate_tokens_from_chars(chars);
        self.completion_tokens = 0;
    }

    pub fn usage(&self) -> ContextUsage {
        let total = self.prompt_tokens + self.completion_tokens;
        ContextUsage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: total,
            max_tokens: self.max_tokens,
            usage_percent: total as f32 / self.max_tokens as f32 * 100.0,
        }
    }

    /// Edge-triggered: returns true exactly once per threshold crossing,
    /// then false until `reset_auto_compact_trigger` is called.
    pub fn should_trigger_auto_compact(&mut self) -> bool {
        if self.auto_compact_fired {
            return false;
        }
        if self.usage().usage_percent >= self.threshold_percent {
            self.auto_compact_fired = true;
            return true;
        }
        false
    }

    /// Re-arm the trigger, e.g. after compaction succeeded.
    pub fn reset_auto_compact_trigger(&mut self) {
        self.auto_compact_fired = false;
    }

    /// Set the trigger threshold. Valid range is (0, 100].
    pub fn set_threshold(&mut self, percent: f32) -> anyhow::Result<()> {
        if percent <= 0.0 || percent > 100.0 {
            anyhow::bail!("threshold must be in (0, 100], got {}", percent);
        }
        self.threshold_percent = percent;
        Ok(())
    }

    pub fn threshold(&self) -> f32 {
        self.threshold_percent
    }
}

/// `ceil(chars / 4)` token estimate
pub fn estimate_tokens_from_chars(chars: u64) -> u64 {
    chars.div_ceil(CHARS_PER_TOKEN)
}
