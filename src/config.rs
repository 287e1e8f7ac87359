//! User-maintained configuration consumed by the selector.
//!
//! Reading and writing the on-disk wizard config format is an external
//! collaborator (out of scope here — see spec). This module defines the
//! parsed shape callers hand us (`LoadedConfig`) and the types it is built
//! from (`MappingEntry`, priority keys, fallback).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ProviderId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("mapping entry has both window and windowPattern set")]
    AmbiguousWindowSelector,
    #[error("mapping entry has none of model/ignore/combine set")]
    EmptyMappingAction,
    #[error("invalid regex in windowPattern {0:?}: {1}")]
    InvalidPattern(String, regex::Error),
}

/// One key the ranker compares candidates on, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PriorityKey {
    FullAvailability,
    RemainingPercent,
    EarliestReset,
}

/// Default priority order per spec §4.4.
pub fn default_priority() -> Vec<PriorityKey> {
    vec![
        PriorityKey::FullAvailability,
        PriorityKey::EarliestReset,
        PriorityKey::RemainingPercent,
    ]
}

/// Selects a usage bucket a mapping rule applies to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSelector {
    pub provider: ProviderId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_pattern: Option<String>,
}

impl UsageSelector {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.is_some() && self.window_pattern.is_some() {
            return Err(ConfigError::AmbiguousWindowSelector);
        }
        if let Some(pattern) = &self.window_pattern {
            regex::Regex::new(pattern)
                .map_err(|e| ConfigError::InvalidPattern(pattern.clone(), e))?;
        }
        Ok(())
    }
}

/// A concrete model reference (`provider/id`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub id: String,
}

impl ModelRef {
    pub fn lock_key(&self) -> String {
        format!("{}/{}", self.provider, self.id)
    }
}

/// The one action a `MappingEntry` takes for matching buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MappingAction {
    Model {
        model: ModelRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reserve: Option<u8>,
    },
    Ignore {
        ignore: bool,
    },
    Combine {
        combine: String,
    },
}

/// A single user rule mapping a usage bucket to a model, or marking it
/// ignored/combined. See spec §3 `MappingEntry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingEntry {
    #[serde(flatten)]
    pub usage: UsageSelector,
    #[serde(flatten)]
    pub action: MappingAction,
}

impl MappingEntry {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.usage.validate()?;
        if let MappingAction::Model { reserve: _, .. } = &self.action {
            // reserve is only meaningful alongside `model`, which this arm
            // already guarantees syntactically.
        }
        Ok(())
    }
}

/// Last-resort fallback model, used when every tracked candidate is
/// exhausted or locked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    pub provider: String,
    pub id: String,
    /// Whether the fallback participates in lock acquisition. Defaults to
    /// `true`; `Some(false)` means "use without a lock if nothing else is
    /// available" (spec §4.7 step 8).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<bool>,
}

impl FallbackConfig {
    pub fn wants_lock(&self) -> bool {
        self.lock.unwrap_or(true)
    }

    pub fn model_ref(&self) -> ModelRef {
        ModelRef {
            provider: self.provider.clone(),
            id: self.id.clone(),
        }
    }
}

/// Immutable per-selection snapshot of user configuration (spec §3
/// `LoadedConfig`). Reloaded on demand by the caller; never mutated here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedConfig {
    pub mappings: Vec<MappingEntry>,
    #[serde(default = "default_priority")]
    pub priority: Vec<PriorityKey>,
    #[serde(default)]
    pub disabled_providers: Vec<ProviderId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_log: Option<bool>,
}

impl Default for LoadedConfig {
    fn default() -> Self {
        Self {
            mappings: Vec::new(),
            priority: default_priority(),
            disabled_providers: Vec::new(),
            fallback: None,
            debug_log: None,
        }
    }
}

impl LoadedConfig {
    /// Validate every mapping, dropping (and logging) any whose selector is
    /// malformed rather than failing the whole config. Spec §7: "the
    /// offending mapping is ignored; other mappings still apply."
    pub fn sanitized(mut self) -> Self {
        self.mappings.retain(|m| match m.validate() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("dropping invalid mapping entry: {}", e);
                false
            }
        });
        self
    }
}

/// Supplies a `LoadedConfig` for a selection run. The concrete on-disk
/// format and the interactive wizard that edits it are external
/// collaborators; this crate only consumes the parsed result.
pub trait ConfigProvider: Send + Sync {
    fn load(&self) -> Result<LoadedConfig, ConfigError>;
}

/// A `ConfigProvider` that always returns a fixed, in-memory config. Used by
/// tests and the demo binary.
pub struct StaticConfigProvider(pub LoadedConfig);

impl ConfigProvider for StaticConfigProvider {
    fn load(&self) -> Result<LoadedConfig, ConfigError> {
        Ok(self.0.clone())
    }
}
