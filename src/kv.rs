// =============================================================================
// Key-Value Store — JSON snapshots behind the stable key layout
// =============================================================================
//
// Writes are last-writer-wins and readers tolerate staleness bounded by the
// producer's publish cadence. The store optionally persists to a JSON file
// with the atomic tmp + rename pattern so virtual-wallet state and pending
// verifications survive a restart.
//
// Key layout (stable, consumed by external tooling):
//   orderbook:{scripCode}:latest          — {bestBid, bestAsk, lastRate, ts}
//   virtual:orders:{id}                   — paper order snapshot
//   virtual:positions:{scripCode}         — paper position snapshot
//   virtual:settings                      — paper wallet settings
//   verify:pending:{orderId}              — verification snapshot at shutdown
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

pub struct KvStore {
    data: RwLock<HashMap<String, Value>>,
    snapshot_path: Option<PathBuf>,
}

impl KvStore {
    /// In-memory only; nothing survives the process.
    pub fn ephemeral() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            snapshot_path: None,
        }
    }

    /// Backed by a JSON snapshot file. An existing snapshot is loaded;
    /// a missing or corrupt one starts empty with a warning.
    pub fn with_snapshot(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let data = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<HashMap<String, Value>>(&content) {
                Ok(map) => {
                    info!(path = %path.display(), keys = map.len(), "kv snapshot loaded");
                    map
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "kv snapshot unreadable — starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            data: RwLock::new(data),
            snapshot_path: Some(path),
        }
    }

    /// Last-writer-wins set.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) {
        if let Ok(v) = serde_json::to_value(value) {
            self.data.write().insert(key.to_string(), v);
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let map = self.data.read();
        let v = map.get(key)?;
        serde_json::from_value(v.clone()).ok()
    }

    pub fn remove(&self, key: &str) {
        self.data.write().remove(key);
    }

    /// All keys under a prefix, e.g. `virtual:orders:`.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.data
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Persist the full map to the snapshot file (atomic tmp + rename).
    /// No-op for ephemeral stores.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let content = {
            let map = self.data.read();
            serde_json::to_string_pretty(&*map).context("failed to serialise kv snapshot")?
        };

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write kv tmp snapshot to {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename kv snapshot to {}", path.display()))?;

        info!(path = %path.display(), "kv snapshot persisted");
        Ok(())
    }
}

/// Key for the latest orderbook snapshot of an instrument.
pub fn orderbook_key(scrip_code: &str) -> String {
    format!("orderbook:{scrip_code}:latest")
}

pub fn virtual_order_key(id: &str) -> String {
    format!("virtual:orders:{id}")
}

pub fn virtual_position_key(scrip_code: &str) -> String {
    format!("virtual:positions:{scrip_code}")
}

pub const VIRTUAL_SETTINGS_KEY: &str = "virtual:settings";

pub fn pending_verification_key(order_id: &str) -> String {
    format!("verify:pending:{order_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Quote {
        best_bid: f64,
        best_ask: f64,
    }

    #[test]
    fn put_get_roundtrip() {
        let kv = KvStore::ephemeral();
        let q = Quote { best_bid: 7.85, best_ask: 7.90 };
        kv.put(&orderbook_key("114311"), &q);
        assert_eq!(kv.get::<Quote>("orderbook:114311:latest"), Some(q));
        assert_eq!(kv.get::<Quote>("orderbook:999:latest"), None);
    }

    #[test]
    fn prefix_scan() {
        let kv = KvStore::ephemeral();
        kv.put(&virtual_order_key("a"), &1);
        kv.put(&virtual_order_key("b"), &2);
        kv.put(VIRTUAL_SETTINGS_KEY, &3);
        let mut keys = kv.keys_with_prefix("virtual:orders:");
        keys.sort();
        assert_eq!(keys, vec!["virtual:orders:a", "virtual:orders:b"]);
    }

    #[test]
    fn snapshot_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");

        let kv = KvStore::with_snapshot(&path);
        kv.put("virtual:settings", &serde_json::json!({"capital": 1_000_000.0}));
        kv.persist().unwrap();

        let reloaded = KvStore::with_snapshot(&path);
        let settings: Value = reloaded.get("virtual:settings").unwrap();
        assert!((settings["capital"].as_f64().unwrap() - 1_000_000.0).abs() < 1e-9);
    }
}
