//! Gemini usage probe (spec §4.1 "Gemini", §6 endpoint table).

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

use crate::types::{ProviderId, RateWindow, UsageSnapshot};

use super::common::{
    discover_credentials, order_by_freshness, refresh_google_token, DiscoveredCredential,
};
use super::{Probe, ProbeContext, PROBE_TIMEOUT};

pub struct GeminiProbe;

#[derive(Debug, Deserialize)]
struct QuotaResponse {
    #[serde(default)]
    models: Vec<ModelQuota>,
}

#[derive(Debug, Deserialize)]
struct ModelQuota {
    #[serde(rename = "modelId")]
    model_id: String,
    /// Fraction remaining, 0.0..=1.0.
    #[serde(rename = "remainingFraction")]
    remaining_fraction: f64,
}

#[async_trait]
impl Probe for GeminiProbe {
    fn provider(&self) -> ProviderId {
        ProviderId::Gemini
    }

    async fn probe(&self, ctx: &ProbeContext) -> Vec<UsageSnapshot> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let creds = order_by_freshness(
            discover_credentials(ctx, "gemini", &["google-gemini", "google-gemini-cli"]),
            now_ms,
        );

        if creds.is_empty() {
            return vec![UsageSnapshot::error(ProviderId::Gemini, "auth.json", "No credentials")];
        }

        let mut attempted = std::collections::HashSet::new();
        let mut results = Vec::new();
        for cred in creds {
            results.push(fetch_one(ctx, cred, now_ms, &mut attempted).await);
        }

        // Dedup by projectId (spec §4.1).
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for (snapshot, project_id) in results.drain(..) {
            if let Some(pid) = &project_id {
                if !seen.insert(pid.clone()) {
                    continue;
                }
            }
            out.push(snapshot);
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
) -> (UsageSnapshot, Option<String>) {
    let (access_token, project_id) = match resolve_token(ctx, &cred, now_ms, attempted).await {
        Ok(v) => v,
        Err(snapshot) => return (snapshot, None),
    };

    let Some(project_id) = project_id else {
        return (
            UsageSnapshot::error(ProviderId::Gemini, "auth.json", "Missing projectId"),
            None,
        );
    };

    let result = ctx
        .http
        .post("https://cloudcode-pa.googleapis.com/v1internal:retrieveUserQuota")
        .bearer_auth(&access_token)
        .json(&serde_json::json!({ "project": project_id }))
        .timeout(PROBE_TIMEOUT)
        .send()
        .await;

    let response = match result {
        Ok(r) => r,
        Err(e) if e.is_timeout() => {
            return (
                UsageSnapshot::error(ProviderId::Gemini, "auth.json", "Timeout"),
                Some(project_id),
            )
        }
        Err(e) => {
            return (
                UsageSnapshot::error(ProviderId::Gemini, "auth.json", e.to_string()),
                Some(project_id),
            )
        }
    };

    if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        return (
            UsageSnapshot::error(ProviderId::Gemini, "auth.json", "Unauthorized"),
            Some(project_id),
        );
    }
    if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return (
            UsageSnapshot::error(ProviderId::Gemini, "auth.json", "HTTP 429"),
            Some(project_id),
        );
    }
    if !response.status().is_success() {
        return (
            UsageSnapshot::error(
                ProviderId::Gemini,
                "auth.json",
                format!("HTTP {}", response.status().as_u16()),
            ),
            Some(project_id),
        );
    }

    let body: QuotaResponse = match response.json().await {
        Ok(b) => b,
        Err(_) => {
            return (
                UsageSnapshot::error(ProviderId::Gemini, "auth.json", "No quota data"),
                Some(project_id),
            )
        }
    };

    let mut snapshot = normalize(body);
    snapshot.account = Some(project_id.clone());
    (snapshot, Some(project_id))
}

async fn resolve_token(
    ctx: &ProbeContext,
    cred: &DiscoveredCredential,
    now_ms: i64,
    attempted: &mut std::collections::HashSet<String>,
) -> Result<(String, Option<String>), UsageSnapshot> {
    match cred {
        DiscoveredCredential::ApiKey { key, .. } => Ok((key.clone(), None)),
        DiscoveredCredential::OAuth { record, .. } => {
            let project_id = record.project_id.clone();

            let needs_refresh = record.access.is_none() && record.refresh.is_some()
                || record.expires_within(now_ms, 60_000);

            if !needs_refresh {
                if let Some(access) = &record.access {
                    return Ok((access.clone(), project_id));
                }
            }

            let Some(refresh_token) = &record.refresh else {
                return match &record.access {
                    Some(access) => Ok((access.clone(), project_id)),
                    None => Err(UsageSnapshot::error(
                        ProviderId::Gemini,
                        "auth.json",
                        "No token found",
                    )),
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
                Ok((access, _)) => Ok((access, project_id)),
                Err(_) => match &record.access {
                    Some(access) => Ok((access.clone(), project_id)),
                    None => Err(UsageSnapshot::error(
                        ProviderId::Gemini,
                        "auth.json",
                        "Token expired",
                    )),
                },
            }
        }
    }
}

/// Spec §4.1 "Gemini": bucket model ids by family (`Pro`, `Flash`,
/// otherwise capitalized first segment); per family keep the minimum
/// remaining fraction.
fn normalize(body: QuotaResponse) -> UsageSnapshot {
    let mut by_family: HashMap<String, f64> = HashMap::new();
    for model in &body.models {
        let family = family_of(&model.model_id);
        let entry = by_family.entry(family).or_insert(model.remaining_fraction);
        if model.remaining_fraction < *entry {
            *entry = model.remaining_fraction;
        }
    }

    let windows = by_family
        .into_iter()
        .map(|(family, remaining)| RateWindow::new(family, (1.0 - remaining) * 100.0))
        .collect();

    UsageSnapshot::ok(ProviderId::Gemini, "Gemini", windows)
}

fn family_of(model_id: &str) -> String {
    let lower = model_id.to_lowercase();
    if lower.contains("pro") {
        "Pro".to_string()
    } else if lower.contains("flash") {
        "Flash".to_string()
    } else {
        let segment = model_id.split(['-', '_']).next().unwrap_or(model_id);
        let mut chars = segment.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => segment.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_group_by_pro_flash_or_capitalized_segment() {
        assert_eq!(family_of("gemini-2.5-pro"), "Pro");
        assert_eq!(family_of("gemini-2.5-flash"), "Flash");
        assert_eq!(family_of("custom-model"), "Custom");
    }

    #[test]
    fn family_keeps_minimum_remaining_fraction() {
        let body = QuotaResponse {
            models: vec![
                ModelQuota {
                    model_id: "gemini-2.5-pro".into(),
                    remaining_fraction: 0.8,
                },
                ModelQuota {
                    model_id: "gemini-2.5-pro-exp".into(),
                    remaining_fraction: 0.3,
                },
            ],
        };
        let snapshot = normalize(body);
        let pro = snapshot.windows.iter().find(|w| w.label == "Pro").unwrap();
        assert_eq!(pro.used_percent, 70.0);
    }
}
