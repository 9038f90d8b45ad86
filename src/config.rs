//! Injected configuration for the validation core.
//!
//! Everything that used to live in environment lookups or per-call globals is
//! carried here and passed in at construction time.

use std::time::Duration;

/// Connection settings for the LLM fixer collaborator.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// Hard cap on a single fixer request.
    pub timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Backoff policy for transient collaborator failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per fixer call, including the first.
    pub max_attempts: u8,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    /// Add up to 20% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (1-based attempt that just failed).
    pub fn backoff_for(&self, attempt: u8) -> Duration {
        let base = self.initial_backoff.as_millis() as f64
            * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = if self.jitter {
            use rand::Rng;
            let factor: f64 = rand::thread_rng().gen_range(1.0..1.2);
            base * factor
        } else {
            base
        };
        Duration::from_millis(millis as u64)
    }
}

/// Top-level configuration for the validation core.
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    /// Business vocabulary accepted even though it is not a literal column.
    /// Each entry is (term, audit note).
    pub business_synonyms: Vec<(String, String)>,
    pub retry: RetryPolicy,
    /// How many times a draft may go through fix → revalidate.
    pub max_fix_rounds: u8,
    pub llm: LlmConfig,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            business_synonyms: Vec::new(),
            retry: RetryPolicy::default(),
            max_fix_rounds: 2,
            llm: LlmConfig::default(),
        }
    }
}

impl SentinelConfig {
    pub fn new() -> Self {
        Self::default()
    }
}
