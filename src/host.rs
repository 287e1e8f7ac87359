//! Interfaces the host process provides to us (spec §6 "Downstream
//! interface consumed by the core"). The concrete implementations — the
//! host's plugin surface, its model registry, its credential store — are
//! external collaborators out of scope here; we only define the boundary.

use std::sync::Arc;

use crate::config::ModelRef;

/// A model the host can route requests to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub provider: String,
    pub id: String,
}

impl Model {
    pub fn matches(&self, model_ref: &ModelRef) -> bool {
        self.provider == model_ref.provider && self.id == model_ref.id
    }

    pub fn lock_key(&self) -> String {
        format!("{}/{}", self.provider, self.id)
    }
}

/// `modelRegistry.find` / `modelRegistry.getAvailable` (spec §6).
pub trait ModelRegistry: Send + Sync {
    fn find(&self, provider: &str, id: &str) -> Option<Model>;
    fn get_available(&self) -> Vec<Model>;
}

pub type SharedModelRegistry = Arc<dyn ModelRegistry>;

/// `authStorage.getApiKey` / `authStorage.get` (spec §6, §4.1 discovery
/// order). `get` returns a generic JSON record so each probe can pull out
/// the aliases it needs (`access|accessToken|token`, `refresh`, etc.).
pub trait AuthStorage: Send + Sync {
    fn get_api_key(&self, id: &str) -> Option<String>;
    fn get(&self, id: &str) -> Option<serde_json::Value>;
}

pub type SharedAuthStorage = Arc<dyn AuthStorage>;

/// Notification severity (spec §6 `host.notify`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Warning,
    Error,
}

/// `host.setModel` / `host.notify` / `host.currentModel` (spec §6).
pub trait Host: Send + Sync {
    fn set_model(&self, model: &Model) -> bool;
    fn notify(&self, level: NotifyLevel, message: &str);
    fn current_model(&self) -> Option<Model>;
}

pub type SharedHost = Arc<dyn Host>;

/// An in-memory `AuthStorage` + `ModelRegistry` + `Host`, suitable for
/// tests and the demo binary. Not wired to any real credential store.
pub struct MemoryHost {
    api_keys: std::collections::HashMap<String, String>,
    records: std::collections::HashMap<String, serde_json::Value>,
    models: Vec<Model>,
    current: std::sync::Mutex<Option<Model>>,
}

impl MemoryHost {
    pub fn new(models: Vec<Model>) -> Self {
        Self {
            api_keys: std::collections::HashMap::new(),
            records: std::collections::HashMap::new(),
            models,
            current: std::sync::Mutex::new(None),
        }
    }

    pub fn with_api_key(mut self, id: impl Into<String>, key: impl Into<String>) -> Self {
        self.api_keys.insert(id.into(), key.into());
        self
    }

    pub fn with_record(mut self, id: impl Into<String>, record: serde_json::Value) -> Self {
        self.records.insert(id.into(), record);
        self
    }
}

impl AuthStorage for MemoryHost {
    fn get_api_key(&self, id: &str) -> Option<String> {
        self.api_keys.get(id).cloned()
    }

    fn get(&self, id: &str) -> Option<serde_json::Value> {
        self.records.get(id).cloned()
    }
}

impl ModelRegistry for MemoryHost {
    fn find(&self, provider: &str, id: &str) -> Option<Model> {
        self.models
            .iter()
            .find(|m| m.provider == provider && m.id == id)
            .cloned()
    }

    fn get_available(&self) -> Vec<Model> {
        self.models.clone()
    }
}

impl Host for MemoryHost {
    fn set_model(&self, model: &Model) -> bool {
        *self.current.lock().expect("current model lock poisoned") = Some(model.clone());
        true
    }

    fn notify(&self, level: NotifyLevel, message: &str) {
        match level {
            NotifyLevel::Info => tracing::info!("{}", message),
            NotifyLevel::Warning => tracing::warn!("{}", message),
            NotifyLevel::Error => tracing::error!("{}", message),
        }
    }

    fn current_model(&self) -> Option<Model> {
        self.current.lock().expect("current model lock poisoned").clone()
    }
}
