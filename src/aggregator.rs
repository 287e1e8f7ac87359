//! Usage Aggregator (C2, spec §4.2): fans every enabled probe out
//! concurrently and collects their snapshots, preserving registration
//! order and enforcing an outer per-probe deadline independent of each
//! probe's own internal HTTP timeout.

use std::time::Duration;

use tracing::warn;

use crate::config::LoadedConfig;
use crate::probes::{Probe, ProbeContext};
use crate::types::UsageSnapshot;

/// Outer deadline for a whole probe call (which may itself fan out to
/// several accounts internally), distinct from `probes::PROBE_TIMEOUT`
/// which bounds a single HTTP request (spec §4.2).
pub const AGGREGATE_DEADLINE: Duration = Duration::from_millis(12_000);

/// Run every enabled probe in `probes` concurrently and return their
/// snapshots flattened, in probe-registration order (spec §5: "Snapshots
/// returned to the user preserve probe registration order"). The probe
/// set is caller-supplied — production callers pass
/// `probes::all_probes()`; tests substitute deterministic fakes.
pub async fn collect_usage(
    ctx: &ProbeContext,
    config: &LoadedConfig,
    probes: &[Box<dyn Probe>],
) -> Vec<UsageSnapshot> {
    let disabled = &config.disabled_providers;

    let futures = probes.iter().map(|probe: &Box<dyn Probe>| {
        let provider = probe.provider();
        let enabled = !disabled.contains(&provider);
        async move {
            if !enabled {
                return Vec::new();
            }
            match tokio::time::timeout(AGGREGATE_DEADLINE, probe.probe(ctx)).await {
                Ok(snapshots) => snapshots,
                Err(_) => {
                    warn!(provider = %provider, "probe exceeded aggregate deadline");
                    vec![UsageSnapshot::error(provider, "aggregator", "Timeout")]
                }
            }
        }
    });

    futures::future::join_all(futures).await.into_iter().flatten().collect()
}
