//! Core data model shared by every component: `RateWindow`, `UsageSnapshot`,
//! `UsageCandidate`, and the `ProviderId` enum. See spec §3.

use serde::{Deserialize, Serialize};

/// One of the 7 providers this crate probes. A narrower, purpose-built
/// sibling of a general inference-provider enum: it only lists providers
/// this crate knows how to usage-probe, not every provider a host might
/// route inference through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderId {
    Anthropic,
    #[serde(rename = "github-copilot")]
    Copilot,
    Gemini,
    Codex,
    Antigravity,
    Kiro,
    Zai,
}

/// Canonical registration order (spec §5: "Snapshots returned to the user
/// preserve probe registration order").
pub const ALL_PROVIDERS: [ProviderId; 7] = [
    ProviderId::Anthropic,
    ProviderId::Copilot,
    ProviderId::Gemini,
    ProviderId::Codex,
    ProviderId::Antigravity,
    ProviderId::Kiro,
    ProviderId::Zai,
];

impl ProviderId {
    pub fn id(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::Copilot => "github-copilot",
            Self::Gemini => "gemini",
            Self::Codex => "codex",
            Self::Antigravity => "antigravity",
            Self::Kiro => "kiro",
            Self::Zai => "zai",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Anthropic => "Claude",
            Self::Copilot => "GitHub Copilot",
            Self::Gemini => "Gemini",
            Self::Codex => "Codex",
            Self::Antigravity => "Antigravity",
            Self::Kiro => "Kiro",
            Self::Zai => "Z.AI",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "anthropic" => Some(Self::Anthropic),
            "github-copilot" | "copilot" => Some(Self::Copilot),
            "gemini" | "google-gemini" | "google-gemini-cli" => Some(Self::Gemini),
            "codex" | "openai-codex" => Some(Self::Codex),
            "antigravity" | "google-antigravity" | "anti-gravity" => Some(Self::Antigravity),
            "kiro" => Some(Self::Kiro),
            "zai" | "z-ai" => Some(Self::Zai),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// One rate-limit dimension reported by a provider. Spec §3 invariants:
/// `usedPercent` is clamped to `[0,100]` on ingest; if both `resetsAt` and
/// `resetDescription` are present they describe the same instant (callers
/// constructing both are responsible for that agreement — this type does
/// not attempt to parse `resetDescription` back into an instant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateWindow {
    pub label: String,
    pub used_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_description: Option<String>,
}

impl RateWindow {
    pub fn new(label: impl Into<String>, used_percent: f64) -> Self {
        Self {
            label: label.into(),
            used_percent: used_percent.clamp(0.0, 100.0),
            resets_at: None,
            reset_description: None,
        }
    }

    pub fn with_reset(mut self, resets_at: chrono::DateTime<chrono::Utc>) -> Self {
        self.resets_at = Some(resets_at);
        self
    }

    pub fn with_reset_description(mut self, description: impl Into<String>) -> Self {
        self.reset_description = Some(description.into());
        self
    }

    /// The synthetic "credential is alive but quota unreadable" window
    /// (spec §3 `UsageSnapshot` invariant exception).
    pub fn synthetic_access() -> Self {
        Self::new("Access", 0.0)
    }
}

/// Probe output for one (provider, account). Spec §3 invariant: either
/// `error` is set and `windows` is empty, or `error` is absent and
/// `windows` is non-empty — except a snapshot may carry a synthetic
/// `Access` window alongside an empty/absent error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub provider: ProviderId,
    pub display_name: String,
    #[serde(default)]
    pub windows: Vec<RateWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UsageSnapshot {
    pub fn ok(provider: ProviderId, display_name: impl Into<String>, windows: Vec<RateWindow>) -> Self {
        Self {
            provider,
            display_name: display_name.into(),
            windows,
            plan: None,
            account: None,
            error: None,
        }
    }

    pub fn error(provider: ProviderId, account_tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider,
            display_name: provider.display_name().to_string(),
            windows: Vec::new(),
            plan: None,
            account: Some(account_tag.into()),
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Spec §7: a 429 anywhere in the error string is rate-limiting, not a
    /// generic protocol failure.
    pub fn is_rate_limited(&self) -> bool {
        self.error.as_deref().is_some_and(|e| e.contains("429"))
    }
}

/// One window promoted to a selection atom (spec §3 `UsageCandidate`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageCandidate {
    pub provider: ProviderId,
    pub display_name: String,
    pub window_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    pub used_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub is_synthetic: bool,
    /// Set once a mapping rule has been applied (spec §4.3 step 4/5).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapped_model: Option<crate::config::ModelRef>,
    /// Set when a `reserve` mapping makes this candidate effectively
    /// exhausted below its raw `usedPercent` (spec §4.3 step 5).
    #[serde(default)]
    pub effectively_exhausted: bool,
}

impl UsageCandidate {
    pub fn remaining_percent(&self) -> f64 {
        100.0 - self.used_percent
    }

    /// Stable key identifying this candidate's bucket: `provider|account|window`.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.provider,
            self.account.as_deref().unwrap_or(""),
            self.window_label
        )
    }

    pub fn is_exhausted(&self) -> bool {
        self.effectively_exhausted || self.remaining_percent() <= 0.0
    }
}
