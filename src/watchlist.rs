// =============================================================================
// Pending Watchlist — signals awaiting entry confirmation, keyed by instrument
// =============================================================================
//
// One pending signal per instrument: a newer admission replaces the older one
// unconditionally (recency over age — the fresher signal reflects current
// market structure). Entries leave on expiry, on promotion to an active
// trade, or on an explicit risk block.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::signal::PendingSignal;

/// Summary row for the admin surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSummary {
    pub scrip_code: String,
    pub company_name: String,
    pub direction: String,
    pub signal_price: f64,
    pub admitted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub validation_attempts: u32,
    pub breach_seen: bool,
    pub potential_rr: Option<f64>,
}

pub struct PendingWatchlist {
    entries: RwLock<HashMap<String, PendingSignal>>,
}

impl PendingWatchlist {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Admit a pending signal, replacing any older entry for the instrument.
    /// Returns the replaced entry when one existed.
    pub fn admit(&self, pending: PendingSignal) -> Option<PendingSignal> {
        let scrip = pending.scrip_code().to_string();
        let replaced = self.entries.write().insert(scrip.clone(), pending);
        if replaced.is_some() {
            info!(scrip = %scrip, "newer signal replaced pending entry");
        } else {
            debug!(scrip = %scrip, "signal admitted to watchlist");
        }
        replaced
    }

    pub fn remove(&self, scrip_code: &str) -> Option<PendingSignal> {
        self.entries.write().remove(scrip_code)
    }

    pub fn for_scrip(&self, scrip_code: &str) -> Option<PendingSignal> {
        self.entries.read().get(scrip_code).cloned()
    }

    pub fn all(&self) -> Vec<PendingSignal> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Apply an in-place mutation to a pending entry (breach marking, attempt
    /// counters). No-op when the instrument is not pending.
    pub fn update<F: FnOnce(&mut PendingSignal)>(&self, scrip_code: &str, f: F) {
        if let Some(entry) = self.entries.write().get_mut(scrip_code) {
            f(entry);
        }
    }

    /// Remove and return entries whose `expires_at` has passed.
    pub fn expire_older_than(&self, now: DateTime<Utc>) -> Vec<PendingSignal> {
        let mut map = self.entries.write();
        let expired_keys: Vec<String> = map
            .iter()
            .filter(|(_, p)| p.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();

        expired_keys
            .into_iter()
            .filter_map(|k| {
                let removed = map.remove(&k);
                if removed.is_some() {
                    info!(scrip = %k, "pending signal expired");
                }
                removed
            })
            .collect()
    }

    /// Drop everything — called when an entry is submitted and the single
    /// active slot is consumed.
    pub fn clear(&self) -> usize {
        let mut map = self.entries.write();
        let n = map.len();
        map.clear();
        if n > 0 {
            info!(cleared = n, "watchlist cleared on entry submission");
        }
        n
    }

    pub fn summaries(&self) -> Vec<PendingSummary> {
        self.entries
            .read()
            .values()
            .map(|p| PendingSummary {
                scrip_code: p.scrip_code().to_string(),
                company_name: p.signal.company_name.clone(),
                direction: p.direction.to_string(),
                signal_price: p.signal_price,
                admitted_at: p.admitted_at,
                expires_at: p.expires_at,
                validation_attempts: p.validation_attempts,
                breach_seen: p.breach_candle_start_ms.is_some(),
                potential_rr: p.potential_rr,
            })
            .collect()
    }
}

impl Default for PendingWatchlist {
    fn default() -> Self {
        Self::new()
    }
}
