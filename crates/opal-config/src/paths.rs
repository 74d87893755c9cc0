// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Persisted-state layout.
//!
//! Everything the runtime writes lives under one data directory:
//! `sessions/<id>.jsonl`, `auth.json`, `cli_state.json`, `logs/`, `node`.

use std::path::PathBuf;

/// Root data directory.
///
/// `OPAL_DATA_DIR` overrides; otherwise `~/.opal` on Unix and the platform
/// user-data dir on Windows.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("OPAL_DATA_DIR") {
        return PathBuf::from(shellexpand::tilde(&dir).into_owned());
    }
    #[cfg(windows)]
    {
        if let Some(d) = dirs::data_dir() {
            return d.join("opal");
        }
    }
    dirs::home_dir()
        .map(|h| h.join(".opal"))
        .unwrap_or_else(|| PathBuf::from(".opal"))
}

/// Directory holding one `<session_id>.jsonl` per session.
pub fn sessions_dir() -> PathBuf {
    data_dir().join("sessions")
}

pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_dir_is_under_data_dir() {
        assert!(sessions_dir().starts_with(data_dir()));
    }

    #[test]
    fn env_override_wins() {
        std::env::set_var("OPAL_DATA_DIR", "/tmp/opal-test-data");
        assert_eq!(data_dir(), PathBuf::from("/tmp/opal-test-data"));
        std::env::remove_var("OPAL_DATA_DIR");
    }
}
