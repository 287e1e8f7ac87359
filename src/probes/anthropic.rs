//! Claude usage probe (spec §4.1 "Claude", §6 endpoint table).

use async_trait::async_trait;
use serde::Deserialize;

use crate::types::{ProviderId, RateWindow, UsageSnapshot};

use super::common::{discover_credentials, order_by_freshness, DiscoveredCredential};
use super::{Probe, ProbeContext, PROBE_TIMEOUT};

pub struct AnthropicProbe;

#[derive(Debug, Deserialize)]
struct UsageResponse {
    five_hour: Option<WindowUsage>,
    seven_day: Option<WindowUsage>,
    #[serde(default)]
    seven_day_sonnet: Option<WindowUsage>,
    #[serde(default)]
    seven_day_opus: Option<WindowUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct WindowUsage {
    utilization: f64,
    #[serde(default)]
    resets_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[async_trait]
impl Probe for AnthropicProbe {
    fn provider(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    async fn probe(&self, ctx: &ProbeContext) -> Vec<UsageSnapshot> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let creds = order_by_freshness(
            discover_credentials(ctx, "anthropic", &["anthropic"]),
            now_ms,
        );

        let Some(token) = creds.iter().find_map(|c| match c {
            DiscoveredCredential::ApiKey { key, .. } => Some(key.clone()),
            DiscoveredCredential::OAuth { record, .. } => record.access.clone(),
        }) else {
            return vec![UsageSnapshot::error(
                ProviderId::Anthropic,
                "auth.json",
                "No credentials",
            )];
        };

        let result = ctx
            .http
            .get("https://api.anthropic.com/api/oauth/usage")
            .bearer_auth(&token)
            .header("anthropic-beta", "oauth-2025-04-20")
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return vec![UsageSnapshot::error(ProviderId::Anthropic, "auth.json", "Timeout")]
            }
            Err(e) => return vec![UsageSnapshot::error(ProviderId::Anthropic, "auth.json", e.to_string())],
        };

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return vec![UsageSnapshot::error(ProviderId::Anthropic, "auth.json", "Unauthorized")];
        }
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return vec![UsageSnapshot::error(ProviderId::Anthropic, "auth.json", "HTTP 429")];
        }
        if !response.status().is_success() {
            return vec![UsageSnapshot::error(
                ProviderId::Anthropic,
                "auth.json",
                format!("HTTP {}", response.status().as_u16()),
            )];
        }

        let body: UsageResponse = match response.json().await {
            Ok(b) => b,
            Err(_) => {
                return vec![UsageSnapshot::error(
                    ProviderId::Anthropic,
                    "auth.json",
                    "No quota data",
                )]
            }
        };

        vec![normalize(body)]
    }
}

/// Spec §4.1 "Claude": per-model pessimistic windows lifted to
/// `max(modelUtil, globalUtil)`, with the later of model/global reset.
/// Always emits the raw `5h`/`Week` windows too; a `Shared` window stands
/// in when no model-specific window exists.
fn normalize(body: UsageResponse) -> UsageSnapshot {
    let mut windows = Vec::new();

    let global_5h = body.five_hour.clone();
    let global_week = body.seven_day.clone();

    if let Some(w) = &global_5h {
        windows.push(rate_window("5h", w));
    }
    if let Some(w) = &global_week {
        windows.push(rate_window("Week", w));
    }

    let has_model_windows = body.seven_day_sonnet.is_some() || body.seven_day_opus.is_some();

    if let Some(sonnet) = &body.seven_day_sonnet {
        windows.push(pessimistic_merge("Sonnet", sonnet, global_5h.as_ref()));
    }
    if let Some(opus) = &body.seven_day_opus {
        windows.push(pessimistic_merge("Opus", opus, global_5h.as_ref()));
    }

    if !has_model_windows {
        if let Some(w) = &global_5h.clone().or(global_week.clone()) {
            windows.push(rate_window("Shared", w));
        }
    }

    UsageSnapshot::ok(ProviderId::Anthropic, "Claude", windows)
}

fn rate_window(label: &str, usage: &WindowUsage) -> RateWindow {
    let mut w = RateWindow::new(label, usage.utilization * 100.0);
    if let Some(resets_at) = usage.resets_at {
        w = w.with_reset(resets_at);
    }
    w
}

fn pessimistic_merge(label: &str, model: &WindowUsage, global: Option<&WindowUsage>) -> RateWindow {
    let (used, resets_at) = match global {
        Some(global) => {
            let used = (model.utilization.max(global.utilization)) * 100.0;
            let resets_at = later(model.resets_at, global.resets_at);
            (used, resets_at)
        }
        None => (model.utilization * 100.0, model.resets_at),
    };
    let mut w = RateWindow::new(label, used);
    if let Some(resets_at) = resets_at {
        w = w.with_reset(resets_at);
    }
    w
}

fn later(
    a: Option<chrono::DateTime<chrono::Utc>>,
    b: Option<chrono::DateTime<chrono::Utc>>,
) -> Option<chrono::DateTime<chrono::Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn claude_pessimistic_merge_scenario() {
        // Spec §8 scenario 1.
        let body = UsageResponse {
            five_hour: Some(WindowUsage {
                utilization: 0.5,
                resets_at: Some(chrono::Utc.with_ymd_and_hms(2026, 2, 8, 22, 0, 0).unwrap()),
            }),
            seven_day: None,
            seven_day_sonnet: Some(WindowUsage {
                utilization: 0.3,
                resets_at: Some(chrono::Utc.with_ymd_and_hms(2026, 2, 8, 21, 0, 0).unwrap()),
            }),
            seven_day_opus: Some(WindowUsage {
                utilization: 0.4,
                resets_at: Some(chrono::Utc.with_ymd_and_hms(2026, 2, 8, 23, 0, 0).unwrap()),
            }),
        };

        let snapshot = normalize(body);
        assert_eq!(snapshot.windows.len(), 3);

        let sonnet = snapshot.windows.iter().find(|w| w.label == "Sonnet").unwrap();
        assert_eq!(sonnet.used_percent, 50.0);

        let opus = snapshot.windows.iter().find(|w| w.label == "Opus").unwrap();
        assert_eq!(opus.used_percent, 50.0);

        let five_h = snapshot.windows.iter().find(|w| w.label == "5h").unwrap();
        assert_eq!(five_h.used_percent, 50.0);
    }

    #[test]
    fn emits_shared_window_when_no_model_specific_windows() {
        let body = UsageResponse {
            five_hour: Some(WindowUsage {
                utilization: 0.2,
                resets_at: None,
            }),
            seven_day: None,
            seven_day_sonnet: None,
            seven_day_opus: None,
        };
        let snapshot = normalize(body);
        assert!(snapshot.windows.iter().any(|w| w.label == "Shared"));
    }

    #[test]
    fn zero_utilization_with_reset_still_produces_window() {
        let usage = WindowUsage {
            utilization: 0.0,
            resets_at: Some(chrono::Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
        };
        let w = rate_window("5h", &usage);
        assert_eq!(w.used_percent, 0.0);
        assert!(w.resets_at.is_some());
    }
}
