// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context-pressure estimation.
//!
//! The heuristic is ~4 bytes per token plus a small per-message overhead
//! (see `Message::approx_tokens`).  The hybrid estimate anchors on the
//! provider's last reported prompt-token count and adds the heuristic only
//! for messages appended since that report, which keeps the estimate both
//! cheap and monotone non-decreasing under appends.

use opal_model::Message;

#[derive(Debug, Default, Clone)]
pub struct TokenEstimator {
    /// Prompt size the provider last reported, with the path length at the
    /// time of the report.
    last_report: Option<(u32, usize)>,
}

impl TokenEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the prompt-token count from a provider usage report taken when
    /// the path had `path_len` messages.
    pub fn record_report(&mut self, prompt_tokens: u32, path_len: usize) {
        if prompt_tokens > 0 {
            self.last_report = Some((prompt_tokens, path_len));
        }
    }

    pub fn last_prompt_tokens(&self) -> Option<u32> {
        self.last_report.map(|(t, _)| t)
    }

    /// Pure heuristic over a message slice.
    pub fn heuristic(path: &[Message]) -> usize {
        path.iter().map(Message::approx_tokens).sum()
    }

    /// Last reported prompt size plus the heuristic for everything appended
    /// since; falls back to the pure heuristic before any report.
    pub fn hybrid_estimate(&self, path: &[Message]) -> usize {
        match self.last_report {
            Some((reported, at_len)) if at_len <= path.len() => {
                reported as usize + Self::heuristic(&path[at_len..])
            }
            _ => Self::heuristic(path),
        }
    }

    /// Reset after compaction rewrites the path; the old report no longer
    /// describes any prefix of it.
    pub fn reset(&mut self) {
        self.last_report = None;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn msgs(n: usize) -> Vec<Message> {
        (0..n).map(|i| Message::user(format!("message {i}"))).collect()
    }

    #[test]
    fn heuristic_counts_all_messages() {
        let path = msgs(3);
        let each = path[0].approx_tokens();
        assert!(TokenEstimator::heuristic(&path) >= each * 3);
    }

    #[test]
    fn hybrid_without_report_is_heuristic() {
        let est = TokenEstimator::new();
        let path = msgs(4);
        assert_eq!(est.hybrid_estimate(&path), TokenEstimator::heuristic(&path));
    }

    #[test]
    fn hybrid_anchors_on_report_and_adds_suffix() {
        let mut est = TokenEstimator::new();
        let mut path = msgs(2);
        est.record_report(10_000, path.len());
        assert_eq!(est.hybrid_estimate(&path), 10_000);

        path.push(Message::user("appended after the report"));
        let with_suffix = est.hybrid_estimate(&path);
        assert_eq!(
            with_suffix,
            10_000 + path.last().unwrap().approx_tokens()
        );
    }

    #[test]
    fn hybrid_is_monotone_under_appends() {
        let mut est = TokenEstimator::new();
        let mut path = msgs(2);
        est.record_report(500, path.len());
        let mut prev = est.hybrid_estimate(&path);
        for i in 0..10 {
            path.push(Message::assistant(format!("reply {i}")));
            let cur = est.hybrid_estimate(&path);
            assert!(cur >= prev, "estimate must not decrease on append");
            prev = cur;
        }
    }

    #[test]
    fn stale_report_after_shrink_falls_back_to_heuristic() {
        let mut est = TokenEstimator::new();
        let path = msgs(5);
        est.record_report(9_999, path.len());
        let shorter = msgs(2);
        assert_eq!(
            est.hybrid_estimate(&shorter),
            TokenEstimator::heuristic(&shorter)
        );
    }

    #[test]
    fn zero_report_is_ignored() {
        let mut est = TokenEstimator::new();
        est.record_report(0, 3);
        assert!(est.last_prompt_tokens().is_none());
    }

    #[test]
    fn reset_clears_report() {
        let mut est = TokenEstimator::new();
        est.record_report(100, 1);
        est.reset();
        assert!(est.last_prompt_tokens().is_none());
    }
}
