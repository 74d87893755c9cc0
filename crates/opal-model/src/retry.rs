// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Static retry classification and backoff for provider errors.

use std::time::Duration;

/// Default base delay doubled per attempt.
pub const DEFAULT_BASE_MS: u64 = 2_000;
/// Backoff ceiling.
pub const DEFAULT_MAX_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with backoff.
    Transient,
    /// Retrying cannot help; fail the turn.
    Permanent,
}

/// Markers that indicate a request the provider will never accept:
/// context-window overflow or failed authentication.
const PERMANENT_MARKERS: &[&str] = &[
    "context length",
    "context_length",
    "maximum context",
    "prompt is too long",
    "token limit",
    "tokens exceed",
    "exceed_context_size",
    "invalid api key",
    "invalid x-api-key",
    "incorrect api key",
    "authentication",
    "unauthorized",
    "401",
    "403",
    "permission denied",
];

/// Classify a provider error payload.
///
/// A permanent marker anywhere in the payload wins: a rate-limit message
/// that also mentions a context overflow must not be retried.  Everything
/// else (rate limits, 5xx-class trouble, connection resets, payloads never
/// seen before) classifies as transient; the attempt cap bounds the retries.
pub fn classify(payload: &str) -> ErrorClass {
    let lower = payload.to_lowercase();
    if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return ErrorClass::Permanent;
    }
    ErrorClass::Transient
}

/// Classify an HTTP status + body pair from a non-streaming provider reply.
pub fn classify_status(status: u16, body: &str) -> ErrorClass {
    match classify(body) {
        ErrorClass::Permanent => ErrorClass::Permanent,
        ErrorClass::Transient => {
            if status == 429 || status >= 500 {
                ErrorClass::Transient
            } else if status == 401 || status == 403 {
                ErrorClass::Permanent
            } else if (400..500).contains(&status) {
                // Remaining 4xx: the request itself is bad.
                ErrorClass::Permanent
            } else {
                ErrorClass::Transient
            }
        }
    }
}

/// Exponential backoff: `min(max, base * 2^(attempt-1))`.
/// `attempt` is 1-based; a successful stream segment resets it.
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let attempt = attempt.max(1);
    let factor = 1u64 << (attempt - 1).min(15);
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
