//! Selector (C7, spec §4.7): the orchestrator that ties every other
//! component together into one selection pass.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::aggregator::collect_usage;
use crate::candidates::{build_candidates, provider_is_ignored};
use crate::config::ConfigProvider;
use crate::cooldown::CooldownStore;
use crate::host::{Model, NotifyLevel, SharedHost, SharedModelRegistry};
use crate::lock::ModelLockCoordinator;
use crate::probes::{Probe, ProbeContext};
use crate::ranker::rank;
use crate::types::{ProviderId, UsageCandidate};

/// Why this selection pass was triggered (spec §4.7, informs the
/// notification text composed at the end of a run).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    Startup,
    RateLimited,
    Manual,
}

impl SelectionReason {
    fn describe(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::RateLimited => "rate limit",
            Self::Manual => "manual request",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectorOptions {
    /// Spec §4.7 step 8: when `false`, the selector skips lock
    /// acquisition entirely and just takes `ranked[0]` — used by callers
    /// that only want to know the best candidate (e.g. a print/widget
    /// pass) without reserving it.
    pub acquire_model_lock: bool,
    /// Spec §4.7 step 8: when every candidate's lock is busy, poll for
    /// `wait_for_lock_cap` rather than falling back immediately. Ignored
    /// when `acquire_model_lock` is `false`.
    pub wait_for_model_lock: bool,
    /// Total time budget for waiting on a contended lock, once the
    /// immediate acquisition attempt across all candidates fails
    /// (spec §4.7 step 8: "10 min cap").
    pub wait_for_lock_cap: Duration,
    /// Poll interval while waiting for a contended lock (spec §4.7 step 8:
    /// "1250ms interval").
    pub wait_for_lock_interval: Duration,
}

impl Default for SelectorOptions {
    fn default() -> Self {
        Self {
            acquire_model_lock: true,
            wait_for_model_lock: true,
            wait_for_lock_cap: Duration::from_secs(600),
            wait_for_lock_interval: Duration::from_millis(1_250),
        }
    }
}

/// Everything `run_selector` needs, gathered once by the caller (the demo
/// binary, or the real host integration).
pub struct SelectorDeps {
    pub config_provider: Arc<dyn ConfigProvider>,
    pub host: SharedHost,
    pub model_registry: SharedModelRegistry,
    pub cooldowns: Arc<CooldownStore>,
    pub locks: Arc<ModelLockCoordinator>,
    pub probe_ctx: ProbeContext,
    /// The probe set to fan out over. Production callers pass
    /// `probes::all_probes()`; tests substitute deterministic fakes so a
    /// selection scenario doesn't depend on real network access.
    pub probes: Vec<Box<dyn Probe>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("no candidate model was available and no fallback is configured")]
    Exhausted,
}

/// Run one end-to-end selection pass (spec §4.7 steps 1-11).
pub async fn run_selector(
    deps: &SelectorDeps,
    reason: SelectionReason,
    options: &SelectorOptions,
) -> Result<Model, SelectorError> {
    // 1. Config + cooldown load.
    let config = deps.config_provider.load()?.sanitized();
    deps.cooldowns.prune_expired_cooldowns().await;

    // 2. Usage fetch. Providers with no matching mapping at all are
    // implicitly disabled alongside the explicit list (spec §4.7 step 2),
    // so an unmapped provider never gets probed, ranked, or short-circuits
    // the pipeline into fallback ahead of a lower-ranked mapped candidate.
    let mut probe_config = config.clone();
    probe_config.disabled_providers = effective_disabled_providers(&config);
    let snapshots = collect_usage(&deps.probe_ctx, &probe_config, &deps.probes).await;

    // 3. 429 handling: skip providers/accounts ignored via a mapping (spec
    // §4.5 — they must never trigger a cooldown), and notify at most once
    // per provider, only when a cooldown was actually created or extended.
    let mut notified_providers = std::collections::HashSet::new();
    for snapshot in &snapshots {
        if !snapshot.is_rate_limited() {
            continue;
        }
        if provider_is_ignored(&config, snapshot.provider, snapshot.account.as_deref()) {
            continue;
        }
        let updated = deps
            .cooldowns
            .record_rate_limit(snapshot.provider.id(), snapshot.account.as_deref())
            .await;
        if updated && notified_providers.insert(snapshot.provider) {
            deps.host.notify(
                NotifyLevel::Warning,
                &format!("{} is rate-limited; entering cooldown", snapshot.display_name),
            );
        }
    }

    // 4. Other-error warnings, one per provider (suppress repeats within a
    // single pass; the aggregator already fans providers out only once).
    for snapshot in &snapshots {
        if snapshot.is_error() && !snapshot.is_rate_limited() {
            warn!(
                provider = %snapshot.provider,
                error = %snapshot.error.as_deref().unwrap_or("unknown"),
                "probe reported an error"
            );
        }
    }

    // 5. Candidate construction (combine groups, ignore rules, mapping
    // lookup, reserve thresholds).
    let candidates = build_candidates(&snapshots, &config);

    // 6. Cooldown filtering, with one retry ignoring cooldowns if candidates
    // were dropped *only* because of cooldowns (spec §4.7 step 5) — prefer
    // a cooled-down candidate over an immediate fallback when every
    // candidate happens to be cooling down at once. This must not also
    // reinstate exhausted candidates, so it runs before the exhaustion drop.
    let mut after_cooldown = filter_cooldown(&deps.cooldowns, candidates.clone()).await;
    if after_cooldown.is_empty() && !candidates.is_empty() {
        after_cooldown = candidates;
    }

    // 7. Exhaustion drop (`remainingPercent <= 0` / reserve-exhausted),
    // applied after the cooldown retry resolves and before ranking or
    // fallback (spec §4.7 step 7) — a candidate that is merely cooling down
    // can be reinstated above, but one that is genuinely exhausted never is.
    let usable: Vec<UsageCandidate> = after_cooldown.into_iter().filter(|c| !c.is_exhausted()).collect();

    if usable.is_empty() {
        return apply_fallback(deps, &config, reason).await;
    }

    // 8. Rank.
    let ranked = rank(usable, &config.priority);

    // 9. Without lock acquisition, the best candidate is simply ranked[0]
    // (spec §4.7 step 8, `options.acquireModelLock == false`) — used by
    // callers that only want to know the winner without reserving it.
    if !options.acquire_model_lock {
        if let Some(best) = ranked.first() {
            if let Some(model) = resolve_model(deps, best) {
                return apply_selection(deps, best, model, reason).await;
            }
        }
        return apply_fallback(deps, &config, reason).await;
    }

    // Lock acquisition walk, then an optional bounded wait on the best
    // candidate (spec §4.7 step 8).
    if let Some((candidate, model)) = acquire_ranked(deps, &ranked).await {
        return apply_selection(deps, &candidate, model, reason).await;
    }

    if options.wait_for_model_lock {
        if let Some(best) = ranked.first() {
            if let Some(model) = resolve_model(deps, best) {
                let key = model.lock_key();
                let acquired = wait_for_lock(
                    &deps.locks,
                    &key,
                    options.wait_for_lock_cap,
                    options.wait_for_lock_interval,
                )
                .await;
                if acquired {
                    return apply_selection(deps, best, model, reason).await;
                }
            }
        }
    }

    apply_fallback(deps, &config, reason).await
}

/// Explicit `disabled_providers` plus any provider with no matching mapping
/// at all (spec §4.7 step 2: "effective disabled providers" = explicit ∪
/// implicit). An unmapped provider has nothing this crate could ever do
/// with its usage, so it is skipped before the probe fan-out rather than
/// filtered out after the fact.
fn effective_disabled_providers(config: &crate::config::LoadedConfig) -> Vec<ProviderId> {
    let mapped: std::collections::HashSet<ProviderId> =
        config.mappings.iter().map(|m| m.usage.provider).collect();
    let mut disabled: std::collections::HashSet<ProviderId> =
        config.disabled_providers.iter().copied().collect();
    for provider in crate::types::ALL_PROVIDERS {
        if !mapped.contains(&provider) {
            disabled.insert(provider);
        }
    }
    disabled.into_iter().collect()
}

/// Cooldown-only filter, deliberately blind to exhaustion: the step 5
/// retry-once rule must fire only when cooldowns alone emptied the list
/// (see the exhaustion drop applied separately afterward in `run_selector`).
async fn filter_cooldown(cooldowns: &CooldownStore, candidates: Vec<UsageCandidate>) -> Vec<UsageCandidate> {
    let mut kept = Vec::new();
    for candidate in candidates {
        let key = CooldownStore::wildcard_key(candidate.provider.id(), candidate.account.as_deref());
        if !cooldowns.is_on_cooldown(&key).await {
            kept.push(candidate);
        }
    }
    kept
}

fn resolve_model(deps: &SelectorDeps, candidate: &UsageCandidate) -> Option<Model> {
    let model_ref = candidate.mapped_model.as_ref()?;
    deps.model_registry.find(&model_ref.provider, &model_ref.id)
}

async fn acquire_ranked(deps: &SelectorDeps, ranked: &[UsageCandidate]) -> Option<(UsageCandidate, Model)> {
    for candidate in ranked {
        let Some(model) = resolve_model(deps, candidate) else {
            continue;
        };
        if deps.locks.acquire(&model.lock_key(), 0).await {
            return Some((candidate.clone(), model));
        }
    }
    None
}

async fn wait_for_lock(
    locks: &ModelLockCoordinator,
    key: &str,
    cap: Duration,
    interval: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + cap;
    loop {
        if locks.acquire(key, 0).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

async fn apply_selection(
    deps: &SelectorDeps,
    candidate: &UsageCandidate,
    model: Model,
    reason: SelectionReason,
) -> Result<Model, SelectorError> {
    if !deps.host.set_model(&model) {
        deps.locks.release(&model.lock_key()).await;
        warn!(model = %model.lock_key(), "host rejected model selection; releasing lock");
        return Err(SelectorError::Exhausted);
    }

    // Spec §4.7 step 9: release any previously held lock that differs from
    // the new one, then start the heartbeat on the new one.
    deps.locks.activate(&model.lock_key()).await;

    deps.cooldowns.set_last_selected_key(candidate.key()).await;
    info!(
        model = %model.lock_key(),
        reason = reason.describe(),
        provider = %candidate.provider,
        window = %candidate.window_label,
        "selected model"
    );
    deps.host.notify(
        NotifyLevel::Info,
        &format!(
            "Switched to {} ({}) — {}",
            model.id,
            candidate.window_label,
            reason.describe()
        ),
    );
    Ok(model)
}

/// Spec §4.7 step 8: last resort when every tracked candidate is exhausted
/// or locked. Honors `fallback.lock`: when `true` (default), the fallback
/// still goes through the lock coordinator; `false` means "use it even if
/// locked elsewhere."
async fn apply_fallback(
    deps: &SelectorDeps,
    config: &crate::config::LoadedConfig,
    reason: SelectionReason,
) -> Result<Model, SelectorError> {
    let Some(fallback) = &config.fallback else {
        deps.host.notify(
            NotifyLevel::Error,
            "All tracked models are exhausted or locked and no fallback is configured",
        );
        return Err(SelectorError::Exhausted);
    };

    let model_ref = fallback.model_ref();
    let Some(model) = deps.model_registry.find(&model_ref.provider, &model_ref.id) else {
        return Err(SelectorError::Exhausted);
    };

    if fallback.wants_lock() {
        deps.locks.acquire(&model.lock_key(), 0).await;
    }

    deps.host.set_model(&model);
    deps.cooldowns.set_last_selected_key(model.lock_key()).await;
    deps.host.notify(
        NotifyLevel::Warning,
        &format!("Falling back to {} — {}", model.id, reason.describe()),
    );
    Ok(model)
}
