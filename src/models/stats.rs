//! Token accounting and run statistics.
//!
//! Purely observational: nothing here feeds back into control flow.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Instant;

/// Token usage reported by one completion call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default, rename = "prompt_tokens")]
    pub prompt: u64,
    #[serde(default, rename = "completion_tokens")]
    pub completion: u64,
    #[serde(default, rename = "total_tokens")]
    pub total: u64,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64, total: u64) -> Self {
        Self {
            prompt,
            completion,
            total,
        }
    }
}

#[derive(Debug, Default)]
struct TokenTotals {
    prompt: u64,
    completion: u64,
    total: u64,
    calls: u64,
}

/// Lock-guarded token accumulator shared by every task of a run.
#[derive(Debug)]
pub struct TokenStats {
    totals: Mutex<TokenTotals>,
    started: Instant,
}

impl Default for TokenStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStats {
    pub fn new() -> Self {
        Self {
            totals: Mutex::new(TokenTotals::default()),
            started: Instant::now(),
        }
    }

    /// Record one successful call.
    pub fn add(&self, usage: TokenUsage) {
        let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        totals.prompt += usage.prompt;
        totals.completion += usage.completion;
        totals.total += usage.total;
        totals.calls += 1;
    }

    /// Totals and rates as of now.
    pub fn snapshot(&self) -> TokenSnapshot {
        let (prompt, completion, total, calls) = {
            let totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
            (totals.prompt, totals.completion, totals.total, totals.calls)
        };
        TokenSnapshot::new(prompt, completion, total, calls, self.started.elapsed().as_secs_f64())
    }
}

/// Point-in-time view of [`TokenStats`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TokenSnapshot {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
    pub calls: u64,
    pub elapsed_secs: f64,
    pub tokens_per_sec: f64,
    pub completion_per_sec: f64,
}

impl TokenSnapshot {
    fn new(prompt: u64, completion: u64, total: u64, calls: u64, elapsed_secs: f64) -> Self {
        let rate = |n: u64| {
            if elapsed_secs > 0.0 {
                n as f64 / elapsed_secs
            } else {
                0.0
            }
        };
        Self {
            prompt,
            completion,
            total,
            calls,
            elapsed_secs,
            tokens_per_sec: rate(total),
            completion_per_sec: rate(completion),
        }
    }
}

/// Format a token count with a K/M suffix.
pub fn format_tokens(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

/// Statistics for a whole run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Records handed to the orchestrator
    pub total_records: usize,

    /// Records skipped because a previous run already wrote them
    pub skipped: usize,

    /// Records regenerated successfully
    pub success: usize,

    /// Records written as error lines
    pub error: usize,

    /// Wall time in seconds
    pub runtime_secs: f64,

    /// Records per second
    pub records_per_sec: f64,

    /// Token totals for the run
    pub tokens: TokenSnapshot,
}

impl RunSummary {
    /// Records that went through regeneration this run.
    pub fn processed(&self) -> usize {
        self.success + self.error
    }

    /// Calculate derived stats.
    pub fn finalize(&mut self) {
        if self.runtime_secs > 0.0 {
            self.records_per_sec = self.processed() as f64 / self.runtime_secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_add_accumulates() {
        let stats = TokenStats::new();
        stats.add(TokenUsage::new(100, 20, 120));
        stats.add(TokenUsage::new(50, 5, 55));

        let snap = stats.snapshot();
        assert_eq!(snap.prompt, 150);
        assert_eq!(snap.completion, 25);
        assert_eq!(snap.total, 175);
        assert_eq!(snap.calls, 2);
    }

    #[test]
    fn test_rates_are_zero_without_elapsed_time() {
        let snap = TokenSnapshot::new(10, 10, 20, 1, 0.0);
        assert_eq!(snap.tokens_per_sec, 0.0);
        assert_eq!(snap.completion_per_sec, 0.0);

        let snap = TokenSnapshot::new(10, 30, 40, 1, 2.0);
        assert_eq!(snap.tokens_per_sec, 20.0);
        assert_eq!(snap.completion_per_sec, 15.0);
    }

    #[tokio::test]
    async fn test_concurrent_adds() {
        let stats = Arc::new(TokenStats::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let stats = Arc::clone(&stats);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    stats.add(TokenUsage::new(1, 2, 3));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let snap = stats.snapshot();
        assert_eq!(snap.calls, 1600);
        assert_eq!(snap.total, 4800);
    }

    #[test]
    fn test_format_tokens() {
        assert_eq!(format_tokens(999), "999");
        assert_eq!(format_tokens(1_500), "1.5K");
        assert_eq!(format_tokens(5_200_000), "5.2M");
    }

    #[test]
    fn test_summary_finalize() {
        let mut summary = RunSummary {
            success: 8,
            error: 2,
            runtime_secs: 5.0,
            ..Default::default()
        };
        summary.finalize();
        assert_eq!(summary.processed(), 10);
        assert_eq!(summary.records_per_sec, 2.0);
    }
}
