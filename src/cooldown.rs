//! Cooldown Manager (C5, spec §4.5): persisted `key → expiresAt` map with
//! atomic disk writes, modeled on the teacher's `ModelChainStore`
//! load/save idiom (write-to-temp-then-rename).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CooldownFile {
    #[serde(default, rename = "cooldowns")]
    entries: HashMap<String, DateTime<Utc>>,
    #[serde(default, rename = "lastSelected")]
    last_selected: Option<String>,
}

/// Tracks provider/account/window cooldowns across selector runs.
#[derive(Clone)]
pub struct CooldownStore {
    state: Arc<RwLock<CooldownFile>>,
    storage_path: PathBuf,
}

impl CooldownStore {
    pub async fn new(storage_path: PathBuf) -> Self {
        let store = Self {
            state: Arc::new(RwLock::new(CooldownFile::default())),
            storage_path,
        };
        store.load_persisted_cooldowns().await;
        store
    }

    /// Spec §4.5 `loadPersistedCooldowns()`: read and retain all entries,
    /// expired ones included. Pruning is a separate step the selector runs
    /// explicitly (spec §4.5 `pruneExpiredCooldowns`, selector step 1).
    async fn load_persisted_cooldowns(&self) {
        match self.load_from_disk() {
            Ok(loaded) => {
                let mut state = self.state.write().await;
                *state = loaded;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(
                    "failed to load cooldowns from {}: {} — starting with an empty cooldown store",
                    self.storage_path.display(),
                    e
                );
            }
        }
    }

    fn load_from_disk(&self) -> Result<CooldownFile, std::io::Error> {
        let contents = std::fs::read_to_string(&self.storage_path)?;
        serde_json::from_str(&contents).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn save_to_disk(&self, file: &CooldownFile) -> Result<(), std::io::Error> {
        if let Some(parent) = self.storage_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(file)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp_path = self.storage_path.with_extension("tmp");
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, &self.storage_path)?;
        Ok(())
    }

    /// Drop entries whose `expiresAt` has already passed. Run on load and
    /// before every `isOnCooldown` query.
    pub async fn prune_expired_cooldowns(&self) {
        let now = Utc::now();
        let mut state = self.state.write().await;
        state.entries.retain(|_, expires_at| *expires_at > now);
    }

    /// Spec §4.5: the bucket-level key (`provider|account|window`) shape is
    /// accepted by `isOnCooldown` for backward compatibility, but this
    /// crate never writes one (spec §9 open question (c)) — only the
    /// provider-wildcard key below is ever persisted by `record_rate_limit`.
    pub async fn is_on_cooldown(&self, key: &str) -> bool {
        let now = Utc::now();
        self.state
            .read()
            .await
            .entries
            .get(key)
            .is_some_and(|expires_at| *expires_at > now)
    }

    /// Spec §4.5: the key this crate actually writes on a 429 —
    /// `provider|account|*`, 1-hour TTL from "now", extended (not
    /// replaced) if the provider/account is already on cooldown.
    pub fn wildcard_key(provider: &str, account: Option<&str>) -> String {
        format!("{}|{}|*", provider, account.unwrap_or(""))
    }

    /// Record a 429 for `provider`/`account`. Monotonic: if already on
    /// cooldown, the expiry only ever moves later, never earlier. Returns
    /// whether the cooldown was actually created or extended, so a caller
    /// can notify only on real updates instead of every repeated 429.
    pub async fn record_rate_limit(&self, provider: &str, account: Option<&str>) -> bool {
        let key = Self::wildcard_key(provider, account);
        let candidate_expiry = Utc::now() + chrono::Duration::hours(1);

        let mut state = self.state.write().await;
        let updated = match state.entries.get(&key) {
            Some(existing) if *existing >= candidate_expiry => false,
            _ => {
                state.entries.insert(key, candidate_expiry);
                true
            }
        };
        if !updated {
            return false;
        }
        let snapshot = state.clone();
        drop(state);
        self.persist(&snapshot);
        true
    }

    pub async fn set_last_selected_key(&self, key: impl Into<String>) {
        let mut state = self.state.write().await;
        state.last_selected = Some(key.into());
        let snapshot = state.clone();
        drop(state);
        self.persist(&snapshot);
    }

    pub async fn last_selected_key(&self) -> Option<String> {
        self.state.read().await.last_selected.clone()
    }

    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        *state = CooldownFile::default();
        let snapshot = state.clone();
        drop(state);
        self.persist(&snapshot);
    }

    fn persist(&self, file: &CooldownFile) {
        if let Err(e) = self.save_to_disk(file) {
            tracing::error!("failed to persist cooldowns to {}: {}", self.storage_path.display(), e);
        }
    }
}
