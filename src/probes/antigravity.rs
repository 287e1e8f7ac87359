//! Antigravity usage probe (spec §4.1 "Antigravity", §6 endpoint table,
//! §4.1 environment-variable credential sources).

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

use crate::types::{ProviderId, RateWindow, UsageSnapshot};

use super::common::{
    discover_credentials, order_by_freshness, refresh_google_token, DiscoveredCredential,
};
use super::{Probe, ProbeContext, PROBE_TIMEOUT};

pub struct AntigravityProbe;

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    models: Vec<ModelAvailability>,
}

#[derive(Debug, Deserialize)]
struct ModelAvailability {
    #[serde(rename = "modelId")]
    model_id: String,
    #[serde(rename = "remainingFraction")]
    remaining_fraction: f64,
}

#[async_trait]
impl Probe for AntigravityProbe {
    fn provider(&self) -> ProviderId {
        ProviderId::Antigravity
    }

    async fn probe(&self, ctx: &ProbeContext) -> Vec<UsageSnapshot> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut creds = order_by_freshness(
            discover_credentials(ctx, "antigravity", &["google-antigravity", "antigravity", "anti-gravity"]),
            now_ms,
        );

        // Env var fallback credential (spec §4.1, §6).
        if let (Ok(api_key), project_id) = (
            std::env::var("ANTIGRAVITY_API_KEY"),
            std::env::var("ANTIGRAVITY_PROJECT_ID")
                .or_else(|_| std::env::var("GOOGLE_CLOUD_PROJECT"))
                .ok(),
        ) {
            creds.push(DiscoveredCredential::OAuth {
                record: super::common::PiAuthRecord {
                    access: Some(api_key),
                    project_id,
                    ..Default::default()
                },
                source: super::common::CredentialSource::EnvVar,
            });
        }

        if creds.is_empty() {
            return vec![UsageSnapshot::error(
                ProviderId::Antigravity,
                "auth.json",
                "No credentials",
            )];
        }

        let mut attempted = std::collections::HashSet::new();
        let mut out = Vec::new();
        for cred in creds {
            out.push(fetch_one(ctx, cred, now_ms, &mut attempted).await);
        }
        out.sort_by_key(|s| s.is_error() as u8);
        out
    }
}

async fn fetch_one(
    ctx: &ProbeContext,
    cred: DiscoveredCredential,
    now_ms: i64,
    attempted: &mut std::collections::HashSet<String>,
) -> UsageSnapshot {
    let (access_token, project_id) = match &cred {
        DiscoveredCredential::ApiKey { key, .. } => (key.clone(), None),
        DiscoveredCredential::OAuth { record, .. } => {
            let project_id = record.project_id.clone();
            // 5-minute refresh window for Antigravity (spec §4.1).
            let needs_refresh = (record.access.is_none() && record.refresh.is_some())
                || record.expires_within(now_ms, 5 * 60_000);

            if !needs_refresh {
                if let Some(access) = &record.access {
                    return fetch_quota(ctx, access, project_id).await;
                }
            }

            let Some(refresh_token) = &record.refresh else {
                return match &record.access {
                    Some(access) => return fetch_quota(ctx, access, project_id).await,
                    None => {
                        return UsageSnapshot::error(ProviderId::Antigravity, "auth.json", "No token found")
                    }
                };
            };

            match refresh_google_token(
                &ctx.http,
                refresh_token,
                record.client_id.as_deref(),
                record.client_secret.as_deref(),
                attempted,
            )
            .await
            {
                Ok((access, _)) => (access, project_id),
                Err(_) => match &record.access {
                    Some(access) => (access.clone(), project_id),
                    None => return UsageSnapshot::error(ProviderId::Antigravity, "auth.json", "Token expired"),
                },
            }
        }
    };

    fetch_quota(ctx, &access_token, project_id).await
}

async fn fetch_quota(ctx: &ProbeContext, access_token: &str, project_id: Option<String>) -> UsageSnapshot {
    let Some(project_id) = project_id else {
        return UsageSnapshot::error(ProviderId::Antigravity, "auth.json", "Missing projectId");
    };

    let result = ctx
        .http
        .post("https://cloudcode-pa.googleapis.com/v1internal:fetchAvailableModels")
        .bearer_auth(access_token)
        .header("User-Agent", "antigravity/1.0")
        .header("X-Goog-Api-Client", "model-selector/0.1.0")
        .json(&serde_json::json!({ "project": project_id }))
        .timeout(PROBE_TIMEOUT)
        .send()
        .await;

    let response = match result {
        Ok(r) => r,
        Err(e) if e.is_timeout() => return UsageSnapshot::error(ProviderId::Antigravity, "auth.json", "Timeout"),
        Err(e) => return UsageSnapshot::error(ProviderId::Antigravity, "auth.json", e.to_string()),
    };

    if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        return UsageSnapshot::error(ProviderId::Antigravity, "auth.json", "Unauthorized");
    }
    if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return UsageSnapshot::error(ProviderId::Antigravity, "auth.json", "HTTP 429");
    }
    if !response.status().is_success() {
        return UsageSnapshot::error(
            ProviderId::Antigravity,
            "auth.json",
            format!("HTTP {}", response.status().as_u16()),
        );
    }

    let body: ModelsResponse = match response.json().await {
        Ok(b) => b,
        Err(_) => return UsageSnapshot::error(ProviderId::Antigravity, "auth.json", "No quota data"),
    };

    let mut snapshot = normalize(body);
    snapshot.account = Some(project_id);
    snapshot
}

/// Spec §4.1 "Antigravity": for each model-group bucket, pick the worst
/// (lowest remaining fraction) model in the group; emit one window per
/// group (`Claude`, `G3 Pro`, `G3 Flash`).
fn normalize(body: ModelsResponse) -> UsageSnapshot {
    let mut worst: HashMap<&'static str, f64> = HashMap::new();
    for model in &body.models {
        let group = group_of(&model.model_id);
        let entry = worst.entry(group).or_insert(model.remaining_fraction);
        if model.remaining_fraction < *entry {
            *entry = model.remaining_fraction;
        }
    }

    let windows = worst
        .into_iter()
        .map(|(group, remaining)| RateWindow::new(group, (1.0 - remaining) * 100.0))
        .collect();

    UsageSnapshot::ok(ProviderId::Antigravity, "Antigravity", windows)
}

fn group_of(model_id: &str) -> &'static str {
    let lower = model_id.to_lowercase();
    if lower.contains("claude") {
        "Claude"
    } else if lower.contains("g3") && lower.contains("pro") {
        "G3 Pro"
    } else if lower.contains("g3") && lower.contains("flash") {
        "G3 Flash"
    } else {
        "Other"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn antigravity_group_pessimism_scenario() {
        // Spec §8 scenario 2.
        let body = ModelsResponse {
            models: vec![
                ModelAvailability {
                    model_id: "claude-sonnet-4-5".into(),
                    remaining_fraction: 0.5,
                },
                ModelAvailability {
                    model_id: "claude-sonnet-4-5-thinking".into(),
                    remaining_fraction: 0.1,
                },
                ModelAvailability {
                    model_id: "gpt-oss-120b-medium".into(),
                    remaining_fraction: 0.9,
                },
            ],
        };
        let snapshot = normalize(body);
        let claude = snapshot.windows.iter().find(|w| w.label == "Claude").unwrap();
        assert_eq!(claude.used_percent, 90.0);
    }
}
