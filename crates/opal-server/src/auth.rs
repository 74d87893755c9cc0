// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! API-key storage backed by `<data_dir>/auth.json`.
//!
//! Keys set over RPC are the lowest-priority source: a key in the model
//! config or its env var always wins (see `build_provider`).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use opal_model::{Error, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
struct AuthFile {
    #[serde(default)]
    keys: BTreeMap<String, String>,
}

pub struct AuthStore {
    path: PathBuf,
    keys: Mutex<BTreeMap<String, String>>,
}

impl AuthStore {
    /// Load `auth.json` under `data_dir`, starting empty when absent.
    pub fn load(data_dir: &std::path::Path) -> Self {
        let path = data_dir.join("auth.json");
        let keys = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str::<AuthFile>(&text).ok())
            .map(|f| f.keys)
            .unwrap_or_default();
        Self {
            path,
            keys: Mutex::new(keys),
        }
    }

    pub fn key_for(&self, provider: &str) -> Option<String> {
        self.keys.lock().unwrap().get(provider).cloned()
    }

    pub fn set_key(&self, provider: &str, api_key: &str) -> Result<()> {
        self.keys
            .lock()
            .unwrap()
            .insert(provider.to_string(), api_key.to_string());
        self.save()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = AuthFile {
            keys: self.keys.lock().unwrap().clone(),
        };
        std::fs::write(&self.path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    /// Answer for `auth/status`.
    pub fn status(&self) -> serde_json::Value {
        let keys = self.keys.lock().unwrap();
        let providers: Vec<&String> = keys.keys().collect();
        let authenticated = !keys.is_empty()
            || std::env::var("ANTHROPIC_API_KEY").is_ok()
            || std::env::var("OPENAI_API_KEY").is_ok();
        json!({
            "authenticated": authenticated,
            "auth": {
                "status": if authenticated { "authenticated" } else { "unauthenticated" },
                "provider": providers.first(),
                "providers": providers,
            }
        })
    }

    /// Device-code login is only available for providers that expose a device
    /// flow; none of the built-in adapters do, so this reports the key-based
    /// alternative.
    pub fn begin_login(&self) -> Result<serde_json::Value> {
        warn!("auth/login requested but no provider supports a device flow");
        Err(Error::RpcServer {
            code: -32000,
            message: "device-code login is not available for the configured providers; \
                      use auth/set_key"
                .into(),
            data: None,
        })
    }

    pub fn poll_login(&self, _device_code: &str) -> Result<serde_json::Value> {
        Err(Error::RpcServer {
            code: -32000,
            message: "no device-code login in progress".into(),
            data: None,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
