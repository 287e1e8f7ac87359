//! Codex (ChatGPT) usage probe (spec §4.1 "Codex", §6 endpoint table,
//! §4.1 "Multi-account handling").

use async_trait::async_trait;
use serde::Deserialize;

use crate::types::{ProviderId, RateWindow, UsageSnapshot};

use super::common::{discover_credentials, order_by_freshness, DiscoveredCredential};
use super::{Probe, ProbeContext, PROBE_TIMEOUT};

pub struct CodexProbe;

#[derive(Debug, Clone, Deserialize)]
struct UsageResponse {
    rate_limit: RateLimit,
    #[serde(default)]
    credit_balance: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct RateLimit {
    primary_window: Window,
    #[serde(default)]
    secondary_window: Option<Window>,
}

#[derive(Debug, Clone, Deserialize)]
struct Window {
    used_percent: f64,
    #[serde(default)]
    resets_at: Option<chrono::DateTime<chrono::Utc>>,
    limit_window_seconds: i64,
}

#[async_trait]
impl Probe for CodexProbe {
    fn provider(&self) -> ProviderId {
        ProviderId::Codex
    }

    async fn probe(&self, ctx: &ProbeContext) -> Vec<UsageSnapshot> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let creds = order_by_freshness(
            discover_credentials(ctx, "codex", &["openai-codex", "openai-codex-cli"]),
            now_ms,
        );

        if creds.is_empty() {
            return vec![UsageSnapshot::error(ProviderId::Codex, "auth.json", "No credentials")];
        }

        let fetches = creds
            .into_iter()
            .enumerate()
            .map(|(i, cred)| fetch_one(ctx, cred, i));
        let mut results = futures::future::join_all(fetches).await;

        // Dedup by fingerprint `provider|sorted(label:pct:resetTs)|account`.
        let mut seen = std::collections::HashSet::new();
        results.retain(|s| seen.insert(fingerprint(s)));

        results.sort_by_key(|s| s.is_error() as u8);
        results
    }
}

async fn fetch_one(ctx: &ProbeContext, cred: DiscoveredCredential, index: usize) -> UsageSnapshot {
    let account_tag = format!("{}#{}", cred.source(), index);

    let (token, account_id) = match &cred {
        DiscoveredCredential::ApiKey { key, .. } => (key.clone(), None),
        DiscoveredCredential::OAuth { record, .. } => match &record.access {
            Some(access) => (access.clone(), record.project_id.clone()),
            None => return UsageSnapshot::error(ProviderId::Codex, account_tag, "No token found"),
        },
    };

    let mut request = ctx
        .http
        .get("https://chatgpt.com/backend-api/wham/usage")
        .bearer_auth(&token);
    if let Some(account_id) = &account_id {
        request = request.header("ChatGPT-Account-Id", account_id);
    }

    let result = request.timeout(PROBE_TIMEOUT).send().await;
    let response = match result {
        Ok(r) => r,
        Err(e) if e.is_timeout() => return UsageSnapshot::error(ProviderId::Codex, account_tag, "Timeout"),
        Err(e) => return UsageSnapshot::error(ProviderId::Codex, account_tag, e.to_string()),
    };

    if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        return UsageSnapshot::error(ProviderId::Codex, account_tag, "Unauthorized");
    }
    if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return UsageSnapshot::error(ProviderId::Codex, account_tag, "HTTP 429");
    }
    if !response.status().is_success() {
        return UsageSnapshot::error(
            ProviderId::Codex,
            account_tag,
            format!("HTTP {}", response.status().as_u16()),
        );
    }

    let body: UsageResponse = match response.json().await {
        Ok(b) => b,
        Err(_) => return UsageSnapshot::error(ProviderId::Codex, account_tag, "No quota data"),
    };

    let mut snapshot = normalize(body);
    snapshot.account = account_id;
    snapshot
}

/// Spec §4.1 "Codex": pick the window with higher `used_percent` (ties →
/// later reset); label `${hours}h` where `hours = round(limit_window_seconds
/// /3600)` and `≥24 ⇒ "Week"`. Append credit balance as `$${n}` to `plan`.
fn normalize(body: UsageResponse) -> UsageSnapshot {
    let chosen = match &body.rate_limit.secondary_window {
        Some(secondary) => pick_worse(&body.rate_limit.primary_window, secondary),
        None => &body.rate_limit.primary_window,
    };

    let mut window = RateWindow::new(window_label(chosen), chosen.used_percent);
    if let Some(resets_at) = chosen.resets_at {
        window = window.with_reset(resets_at);
    }

    let mut snapshot = UsageSnapshot::ok(ProviderId::Codex, "Codex", vec![window]);
    if let Some(credit) = body.credit_balance {
        snapshot.plan = Some(format!("${}", credit as i64));
    }
    snapshot
}

fn pick_worse<'a>(a: &'a Window, b: &'a Window) -> &'a Window {
    if (a.used_percent - b.used_percent).abs() < f64::EPSILON {
        match (a.resets_at, b.resets_at) {
            (Some(ra), Some(rb)) => {
                if ra >= rb {
                    a
                } else {
                    b
                }
            }
            (Some(_), None) => a,
            (None, Some(_)) => b,
            (None, None) => a,
        }
    } else if a.used_percent > b.used_percent {
        a
    } else {
        b
    }
}

fn window_label(window: &Window) -> String {
    let hours = (window.limit_window_seconds as f64 / 3600.0).round() as i64;
    if hours >= 24 {
        "Week".to_string()
    } else {
        format!("{}h", hours)
    }
}

fn fingerprint(snapshot: &UsageSnapshot) -> String {
    let mut parts: Vec<String> = snapshot
        .windows
        .iter()
        .map(|w| {
            format!(
                "{}:{}:{}",
                w.label,
                w.used_percent,
                w.resets_at.map(|r| r.timestamp()).unwrap_or(0)
            )
        })
        .collect();
    parts.sort();
    format!(
        "{}|{}|{}",
        snapshot.provider,
        parts.join(","),
        snapshot.account.as_deref().unwrap_or("")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_higher_used_percent_window() {
        let primary = Window {
            used_percent: 40.0,
            resets_at: None,
            limit_window_seconds: 3600 * 5,
        };
        let secondary = Window {
            used_percent: 70.0,
            resets_at: None,
            limit_window_seconds: 3600 * 24 * 7,
        };
        let chosen = pick_worse(&primary, &secondary);
        assert_eq!(chosen.used_percent, 70.0);
    }

    #[test]
    fn week_label_at_24h_or_more() {
        let week = Window {
            used_percent: 10.0,
            resets_at: None,
            limit_window_seconds: 3600 * 24 * 7,
        };
        assert_eq!(window_label(&week), "Week");
        let five_hour = Window {
            used_percent: 10.0,
            resets_at: None,
            limit_window_seconds: 3600 * 5,
        };
        assert_eq!(window_label(&five_hour), "5h");
    }

    #[test]
    fn credit_balance_appended_to_plan() {
        let body = UsageResponse {
            rate_limit: RateLimit {
                primary_window: Window {
                    used_percent: 10.0,
                    resets_at: None,
                    limit_window_seconds: 3600 * 5,
                },
                secondary_window: None,
            },
            credit_balance: Some(12.0),
        };
        let snapshot = normalize(body);
        assert_eq!(snapshot.plan.as_deref(), Some("$12"));
    }
}
