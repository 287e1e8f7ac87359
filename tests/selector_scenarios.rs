//! End-to-end selection scenarios spanning multiple components, mirroring
//! the walkthroughs used to validate this crate's design.

use std::sync::Arc;

use model_selector::config::{
    FallbackConfig, LoadedConfig, MappingAction, MappingEntry, StaticConfigProvider, UsageSelector,
};
use model_selector::cooldown::CooldownStore;
use model_selector::host::{AuthStorage, MemoryHost, Model};
use model_selector::lock::ModelLockCoordinator;
use model_selector::probes::ProbeContext;
use model_selector::selector::{run_selector, SelectionReason, SelectorDeps, SelectorOptions};
use model_selector::ProviderId;

async fn harness(config: LoadedConfig, models: Vec<Model>) -> (SelectorDeps, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(MemoryHost::new(models));
    let cooldowns = Arc::new(CooldownStore::new(dir.path().join("cooldowns.json")).await);
    let locks = Arc::new(ModelLockCoordinator::new(dir.path().join("locks")));
    let probe_ctx = ProbeContext::new(host.clone() as Arc<dyn AuthStorage>);

    (
        SelectorDeps {
            config_provider: Arc::new(StaticConfigProvider(config)),
            host: host.clone(),
            model_registry: host,
            cooldowns,
            locks,
            probe_ctx,
            probes: Vec::new(),
        },
        dir,
    )
}

fn model(provider: &str, id: &str) -> Model {
    Model {
        provider: provider.to_string(),
        id: id.to_string(),
    }
}

/// Scenario: every provider is disabled (standing in for "every tracked
/// bucket is exhausted") and a fallback is configured without requiring a
/// lock — the selector must still produce a model.
#[tokio::test]
async fn all_buckets_exhausted_falls_back() {
    let mut config = LoadedConfig::default();
    config.disabled_providers = model_selector::types::ALL_PROVIDERS.to_vec();
    config.fallback = Some(FallbackConfig {
        provider: "zai".into(),
        id: "glm-4-plus".into(),
        lock: Some(false),
    });

    let fallback_model = model("zai", "glm-4-plus");
    let (deps, _dir) = harness(config, vec![fallback_model.clone()]).await;

    let selected = run_selector(&deps, SelectionReason::Manual, &SelectorOptions::default())
        .await
        .unwrap();
    assert_eq!(selected, fallback_model);
}

/// Scenario: two selector instances race for the same model lock. The
/// first holds it; the second, with no fallback configured and every
/// other provider disabled, has nothing left to select and errors out
/// rather than double-booking the locked model.
#[tokio::test]
async fn lock_contention_without_fallback_errors_instead_of_double_booking() {
    let mut config = LoadedConfig::default();
    config.disabled_providers = model_selector::types::ALL_PROVIDERS.to_vec();
    config.mappings.push(MappingEntry {
        usage: UsageSelector {
            provider: ProviderId::Anthropic,
            account: None,
            window: Some("5h".into()),
            window_pattern: None,
        },
        action: MappingAction::Model {
            model: model_selector::config::ModelRef {
                provider: "anthropic".into(),
                id: "claude".into(),
            },
            reserve: None,
        },
    });

    let claude = model("anthropic", "claude");

    // Two coordinators sharing one lock directory stand in for two
    // selector processes racing for the same model.
    let shared_dir = tempfile::tempdir().unwrap();
    let locks_a = Arc::new(ModelLockCoordinator::new(shared_dir.path().join("locks")));
    let locks_b = ModelLockCoordinator::new(shared_dir.path().join("locks"));
    assert!(locks_b.acquire(&claude.lock_key(), 1_000).await);

    let host = Arc::new(MemoryHost::new(vec![claude.clone()]));
    let probe_ctx = ProbeContext::new(host.clone() as Arc<dyn AuthStorage>);
    let cooldowns = Arc::new(CooldownStore::new(shared_dir.path().join("cooldowns.json")).await);
    let deps = SelectorDeps {
        config_provider: Arc::new(StaticConfigProvider(config)),
        host: host.clone(),
        model_registry: host,
        cooldowns,
        locks: locks_a,
        probe_ctx,
        probes: Vec::new(),
    };

    let mut options = SelectorOptions::default();
    options.wait_for_lock_cap = std::time::Duration::from_millis(300);
    options.wait_for_lock_interval = std::time::Duration::from_millis(50);

    let result = run_selector(&deps, SelectionReason::Startup, &options).await;
    assert!(result.is_err());
}

/// A fixed-snapshot probe standing in for a real provider call, so the
/// lock-contention scenario below exercises genuine candidate ranking and
/// acquisition instead of short-circuiting on "no usage windows."
struct FixedProbe(model_selector::UsageSnapshot);

#[async_trait::async_trait]
impl model_selector::probes::Probe for FixedProbe {
    fn provider(&self) -> ProviderId {
        self.0.provider
    }

    async fn probe(&self, _ctx: &ProbeContext) -> Vec<model_selector::UsageSnapshot> {
        vec![self.0.clone()]
    }
}

fn config_with_anthropic_mapping(fallback: FallbackConfig) -> LoadedConfig {
    let mut config = LoadedConfig::default();
    config.disabled_providers = model_selector::types::ALL_PROVIDERS
        .into_iter()
        .filter(|p| *p != ProviderId::Anthropic)
        .collect();
    config.mappings.push(MappingEntry {
        usage: UsageSelector {
            provider: ProviderId::Anthropic,
            account: None,
            window: Some("5h".into()),
            window_pattern: None,
        },
        action: MappingAction::Model {
            model: model_selector::config::ModelRef {
                provider: "anthropic".into(),
                id: "claude-sonnet-4-5".into(),
            },
            reserve: None,
        },
    });
    config.fallback = Some(fallback);
    config
}

/// Scenario: two simultaneous selector runs both want the same mapped
/// model. The first to run acquires it outright; the second finds it
/// locked, waits out a short bounded poll, then falls back to a
/// differently-locked fallback model rather than going without (spec §8
/// scenario 5). Both runs succeed.
#[tokio::test]
async fn lock_contention_with_fallback_both_instances_succeed() {
    let primary = model("anthropic", "claude-sonnet-4-5");
    let fallback_model = model("openai", "gpt-4o-mini");

    let shared_dir = tempfile::tempdir().unwrap();
    let locks_a = Arc::new(ModelLockCoordinator::new(shared_dir.path().join("locks")));
    let locks_b = Arc::new(ModelLockCoordinator::new(shared_dir.path().join("locks")));

    let snapshot = model_selector::UsageSnapshot::ok(
        ProviderId::Anthropic,
        "Claude",
        vec![model_selector::RateWindow::new("5h", 10.0)],
    );

    let fallback = FallbackConfig {
        provider: "openai".into(),
        id: "gpt-4o-mini".into(),
        lock: Some(true),
    };

    let host_a = Arc::new(MemoryHost::new(vec![primary.clone(), fallback_model.clone()]));
    let probe_ctx_a = ProbeContext::new(host_a.clone() as Arc<dyn AuthStorage>);
    let cooldowns_a = Arc::new(CooldownStore::new(shared_dir.path().join("cooldowns-a.json")).await);
    let deps_a = SelectorDeps {
        config_provider: Arc::new(StaticConfigProvider(config_with_anthropic_mapping(fallback.clone()))),
        host: host_a.clone(),
        model_registry: host_a,
        cooldowns: cooldowns_a,
        locks: locks_a,
        probe_ctx: probe_ctx_a,
        probes: vec![Box::new(FixedProbe(snapshot.clone()))],
    };

    let host_b = Arc::new(MemoryHost::new(vec![primary.clone(), fallback_model.clone()]));
    let probe_ctx_b = ProbeContext::new(host_b.clone() as Arc<dyn AuthStorage>);
    let cooldowns_b = Arc::new(CooldownStore::new(shared_dir.path().join("cooldowns-b.json")).await);
    let deps_b = SelectorDeps {
        config_provider: Arc::new(StaticConfigProvider(config_with_anthropic_mapping(fallback))),
        host: host_b.clone(),
        model_registry: host_b,
        cooldowns: cooldowns_b,
        locks: locks_b,
        probe_ctx: probe_ctx_b,
        probes: vec![Box::new(FixedProbe(snapshot))],
    };
    let mut options = SelectorOptions::default();
    options.wait_for_lock_cap = std::time::Duration::from_millis(200);
    options.wait_for_lock_interval = std::time::Duration::from_millis(50);

    // A runs first and claims the only mapped candidate's lock.
    let selected_a = run_selector(&deps_a, SelectionReason::Startup, &options).await.unwrap();
    assert_eq!(selected_a, primary);

    // B contends for the same lock, times out waiting, and falls back —
    // acquiring its own (different) lock rather than going without.
    let selected_b = run_selector(&deps_b, SelectionReason::Startup, &options).await.unwrap();
    assert_eq!(selected_b, fallback_model);
}

/// Scenario: a 429 from a provider records a cooldown that survives a
/// second selection pass, so the cooled-down bucket isn't retried
/// immediately.
#[tokio::test]
async fn recorded_rate_limit_cooldown_persists_across_passes() {
    let dir = tempfile::tempdir().unwrap();
    let cooldowns = CooldownStore::new(dir.path().join("cooldowns.json")).await;
    cooldowns.record_rate_limit("anthropic", None).await;

    let reloaded = CooldownStore::new(dir.path().join("cooldowns.json")).await;
    let key = CooldownStore::wildcard_key("anthropic", None);
    assert!(reloaded.is_on_cooldown(&key).await);
}
