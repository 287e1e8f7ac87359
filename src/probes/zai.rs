//! Z.AI usage probe (spec §4.1 "Z.AI", §6 endpoint table).

use async_trait::async_trait;
use serde::Deserialize;

use crate::types::{ProviderId, RateWindow, UsageSnapshot};

use super::common::{discover_credentials, DiscoveredCredential};
use super::{Probe, ProbeContext, PROBE_TIMEOUT};

pub struct ZaiProbe;

#[derive(Debug, Deserialize)]
struct QuotaResponse {
    #[serde(default)]
    limits: Vec<Limit>,
}

#[derive(Debug, Deserialize)]
struct Limit {
    #[serde(rename = "type")]
    kind: String,
    unit: i32,
    #[serde(rename = "usedPercent")]
    used_percent: f64,
    #[serde(default, rename = "resetsAt")]
    resets_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[async_trait]
impl Probe for ZaiProbe {
    fn provider(&self) -> ProviderId {
        ProviderId::Zai
    }

    async fn probe(&self, ctx: &ProbeContext) -> Vec<UsageSnapshot> {
        let mut creds = discover_credentials(ctx, "zai", &["z-ai", "zhipu"]);
        if let Ok(key) = std::env::var("Z_AI_API_KEY") {
            creds.push(DiscoveredCredential::ApiKey {
                key,
                source: super::common::CredentialSource::EnvVar,
            });
        }

        let Some(token) = creds.iter().find_map(|c| match c {
            DiscoveredCredential::ApiKey { key, .. } => Some(key.clone()),
            DiscoveredCredential::OAuth { record, .. } => record.access.clone(),
        }) else {
            return vec![UsageSnapshot::error(ProviderId::Zai, "auth.json", "No credentials")];
        };

        let result = ctx
            .http
            .get("https://api.z.ai/api/monitor/usage/quota/limit")
            .bearer_auth(&token)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return vec![UsageSnapshot::error(ProviderId::Zai, "auth.json", "Timeout")],
            Err(e) => return vec![UsageSnapshot::error(ProviderId::Zai, "auth.json", e.to_string())],
        };

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return vec![UsageSnapshot::error(ProviderId::Zai, "auth.json", "Unauthorized")];
        }
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return vec![UsageSnapshot::error(ProviderId::Zai, "auth.json", "HTTP 429")];
        }
        if !response.status().is_success() {
            return vec![UsageSnapshot::error(
                ProviderId::Zai,
                "auth.json",
                format!("HTTP {}", response.status().as_u16()),
            )];
        }

        let body: QuotaResponse = match response.json().await {
            Ok(b) => b,
            Err(_) => return vec![UsageSnapshot::error(ProviderId::Zai, "auth.json", "No quota data")],
        };

        let windows = normalize(&body);
        if windows.is_empty() {
            return vec![UsageSnapshot::error(ProviderId::Zai, "auth.json", "No quota data")];
        }
        vec![UsageSnapshot::ok(ProviderId::Zai, "Z.AI", windows)]
    }
}

/// Spec §4.1 "Z.AI": `unit` 1/3/5 → day/hour/minute window labels; `type`
/// `TOKENS_LIMIT` → `Tokens (...)`, `TIME_LIMIT` → `Monthly`; unknown types
/// are dropped.
fn normalize(body: &QuotaResponse) -> Vec<RateWindow> {
    body.limits
        .iter()
        .filter_map(|limit| {
            let label = match limit.kind.as_str() {
                "TOKENS_LIMIT" => format!("Tokens ({})", unit_label(limit.unit)),
                "TIME_LIMIT" => "Monthly".to_string(),
                _ => return None,
            };
            let mut window = RateWindow::new(label, limit.used_percent);
            if let Some(resets_at) = limit.resets_at {
                window = window.with_reset(resets_at);
            }
            Some(window)
        })
        .collect()
}

fn unit_label(unit: i32) -> &'static str {
    match unit {
        1 => "1d",
        3 => "1h",
        5 => "1m",
        _ => "?",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_limit_types_and_drops_unknown() {
        let body = QuotaResponse {
            limits: vec![
                Limit {
                    kind: "TOKENS_LIMIT".into(),
                    unit: 3,
                    used_percent: 40.0,
                    resets_at: None,
                },
                Limit {
                    kind: "TIME_LIMIT".into(),
                    unit: 1,
                    used_percent: 10.0,
                    resets_at: None,
                },
                Limit {
                    kind: "SOMETHING_ELSE".into(),
                    unit: 1,
                    used_percent: 99.0,
                    resets_at: None,
                },
            ],
        };
        let windows = normalize(&body);
        assert_eq!(windows.len(), 2);
        assert!(windows.iter().any(|w| w.label == "Tokens (1h)"));
        assert!(windows.iter().any(|w| w.label == "Monthly"));
    }

    #[test]
    fn unit_maps_to_expected_labels() {
        assert_eq!(unit_label(1), "1d");
        assert_eq!(unit_label(3), "1h");
        assert_eq!(unit_label(5), "1m");
    }
}
