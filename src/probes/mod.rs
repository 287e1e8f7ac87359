//! Provider Probes (C1, spec §4.1): one module per provider, sharing a
//! `discover → fetch-with-timeout → parse/normalize → emit snapshot(s)`
//! skeleton.

mod antigravity;
mod anthropic;
mod codex;
mod common;
mod copilot;
mod gemini;
mod kiro;
mod zai;

pub use common::{CredentialSource, DiscoveredCredential, PiAuthRecord, TokenRefreshError};

use async_trait::async_trait;

use crate::host::SharedAuthStorage;
use crate::types::{ProviderId, UsageSnapshot};

/// Per-call deadline for a single provider probe (spec §4.1: "within a
/// 10 000 ms per-call deadline").
pub const PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(10_000);

/// Everything a probe needs to discover credentials and call its provider.
pub struct ProbeContext {
    pub http: reqwest::Client,
    pub auth_storage: SharedAuthStorage,
    /// Parsed `~/.pi/agent/auth.json` (spec §4.1 discovery order).
    pub pi_auth: std::collections::HashMap<String, PiAuthRecord>,
    /// Process-local Copilot ETag/body cache (spec §5, §9: "owned object
    /// passed to the Copilot probe, not a true global").
    pub copilot_cache: copilot::EtagCache,
}

impl ProbeContext {
    pub fn new(auth_storage: SharedAuthStorage) -> Self {
        Self {
            http: reqwest::Client::builder()
                .build()
                .expect("reqwest client"),
            auth_storage,
            pi_auth: std::collections::HashMap::new(),
            copilot_cache: copilot::EtagCache::default(),
        }
    }

    pub fn with_pi_auth(mut self, pi_auth: std::collections::HashMap<String, PiAuthRecord>) -> Self {
        self.pi_auth = pi_auth;
        self
    }
}

/// Common contract every provider probe implements (spec §4.1).
///
/// A probe never returns an `Err` from its public operation — every
/// failure becomes a `UsageSnapshot` with `error` set (spec §7
/// "Propagation policy").
#[async_trait]
pub trait Probe: Send + Sync {
    fn provider(&self) -> ProviderId;

    /// Returns one or more snapshots (several for providers that can have
    /// multiple discovered accounts: Copilot, Gemini, Codex).
    async fn probe(&self, ctx: &ProbeContext) -> Vec<UsageSnapshot>;
}

/// All 7 probes, in spec §5 registration order.
pub fn all_probes() -> Vec<Box<dyn Probe>> {
    vec![
        Box::new(anthropic::AnthropicProbe),
        Box::new(copilot::CopilotProbe),
        Box::new(gemini::GeminiProbe),
        Box::new(codex::CodexProbe),
        Box::new(antigravity::AntigravityProbe),
        Box::new(kiro::KiroProbe),
        Box::new(zai::ZaiProbe),
    ]
}
