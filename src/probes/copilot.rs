//! GitHub Copilot usage probe (spec §4.1 "Copilot", §4.1 "Multi-account
//! handling", §9 "Copilot ETag cache").

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{ProviderId, RateWindow, UsageSnapshot};

use super::common::{discover_credentials, DiscoveredCredential};
use super::{Probe, ProbeContext, PROBE_TIMEOUT};

/// Process-local cache of the last successful Copilot user-endpoint body,
/// keyed by the *exact token used for that call* — not the discovery
/// token, which may differ after exchange (spec §5, §9). Modeled as an
/// owned object passed to the probe rather than a true global, matching
/// spec §9's explicit design note.
#[derive(Default)]
pub struct EtagCache {
    entries: Mutex<HashMap<String, CachedBody>>,
}

struct CachedBody {
    etag: String,
    body: UserResponse,
}

impl EtagCache {
    fn get(&self, token: &str) -> Option<(String, UserResponse)> {
        self.entries
            .lock()
            .expect("copilot etag cache poisoned")
            .get(token)
            .map(|c| (c.etag.clone(), c.body.clone()))
    }

    fn put(&self, token: &str, etag: String, body: UserResponse) {
        self.entries
            .lock()
            .expect("copilot etag cache poisoned")
            .insert(token.to_string(), CachedBody { etag, body });
    }
}

pub struct CopilotProbe;

#[derive(Debug, Clone, Deserialize)]
struct TokenExchangeResponse {
    token: String,
}

#[derive(Debug, Clone, Deserialize)]
struct UserResponse {
    login: String,
    #[serde(default)]
    quota_snapshots: Option<QuotaSnapshots>,
}

#[derive(Debug, Clone, Deserialize)]
struct QuotaSnapshots {
    premium_interactions: Option<Quota>,
    chat: Option<ChatQuota>,
}

#[derive(Debug, Clone, Deserialize)]
struct Quota {
    percent_remaining: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ChatQuota {
    Unlimited(UnlimitedMarker),
    Metered(Quota),
}

#[derive(Debug, Clone, Deserialize)]
struct UnlimitedMarker {
    unlimited: bool,
}

struct AccountResult {
    snapshot: UsageSnapshot,
    login: Option<String>,
}

#[async_trait]
impl Probe for CopilotProbe {
    fn provider(&self) -> ProviderId {
        ProviderId::Copilot
    }

    async fn probe(&self, ctx: &ProbeContext) -> Vec<UsageSnapshot> {
        let creds = discover_credentials(ctx, "github-copilot", &["github-copilot"]);
        if creds.is_empty() {
            return vec![UsageSnapshot::error(ProviderId::Copilot, "auth.json", "No credentials")];
        }

        let fetches = creds
            .into_iter()
            .enumerate()
            .map(|(i, cred)| fetch_account(ctx, cred, i));
        let results: Vec<AccountResult> = futures::future::join_all(fetches).await;
        dedup_and_suppress(results)
    }
}

/// Spec §4.1 "Multi-account handling": successes first, dedup by login,
/// then drop error snapshots for accounts that already have a successful
/// one, and — if exactly one account succeeded — drop anonymous errors
/// whose account field is just a discovery-source tag rather than a real
/// identity. Pulled out of `probe()` so it is testable without a live
/// HTTP round-trip (spec §8 scenario 3).
fn dedup_and_suppress(mut results: Vec<AccountResult>) -> Vec<UsageSnapshot> {
    // Successes first (spec §4.1 "Sort by (error? 1 : 0)").
    results.sort_by_key(|r| r.snapshot.is_error() as u8);

    let mut succeeded_logins = std::collections::HashSet::new();
    for r in &results {
        if !r.snapshot.is_error() {
            if let Some(login) = &r.login {
                succeeded_logins.insert(login.clone());
            }
        }
    }

    let success_count = results.iter().filter(|r| !r.snapshot.is_error()).count();
    let mut seen_logins = std::collections::HashSet::new();
    let mut out = Vec::new();
    for r in results {
        if !r.snapshot.is_error() {
            if let Some(login) = &r.login {
                if !seen_logins.insert(login.clone()) {
                    continue;
                }
            }
            out.push(r.snapshot);
            continue;
        }

        // Error suppression: drop same-account errors once that
        // account has a successful snapshot.
        if let Some(login) = &r.login {
            if succeeded_logins.contains(login) {
                continue;
            }
        }
        // If exactly one account succeeded, also drop anonymous
        // errors whose account field is a discovery-source tag.
        if success_count == 1 && r.login.is_none() {
            continue;
        }
        out.push(r.snapshot);
    }

    if out.is_empty() {
        out.push(UsageSnapshot::error(ProviderId::Copilot, "auth.json", "No quota data"));
    }
    out
}

async fn fetch_account(
    ctx: &ProbeContext,
    cred: super::common::DiscoveredCredential,
    index: usize,
) -> AccountResult {
    let account_tag = format!("{}#{}", cred.source(), index);

    let gh_token = match &cred {
        DiscoveredCredential::ApiKey { key, .. } => key.clone(),
        DiscoveredCredential::OAuth { record, .. } => match &record.access {
            Some(t) => t.clone(),
            None => {
                return AccountResult {
                    snapshot: UsageSnapshot::error(ProviderId::Copilot, account_tag, "No token found"),
                    login: None,
                }
            }
        },
    };

    // A GitHub-style token (non `tid=` prefix) is upgraded to a Copilot
    // token via the exchange endpoint (spec §4.1).
    let copilot_token = if gh_token.contains("tid=") {
        gh_token.clone()
    } else {
        match exchange_token(&ctx.http, &gh_token).await {
            Ok(t) => t,
            Err(_) => gh_token.clone(),
        }
    };

    match fetch_user(ctx, &copilot_token, &account_tag).await {
        Ok(user) => AccountResult {
            snapshot: normalize(&user),
            login: Some(user.login),
        },
        Err(snapshot) => {
            // Exchange succeeded (we have a distinct copilot token) but
            // the user endpoint keeps failing: emit a synthetic Access
            // window rather than a hard error (spec §4.1).
            if copilot_token != gh_token {
                AccountResult {
                    snapshot: UsageSnapshot::ok(
                        ProviderId::Copilot,
                        "GitHub Copilot",
                        vec![RateWindow::synthetic_access()],
                    ),
                    login: None,
                }
            } else {
                AccountResult { snapshot, login: None }
            }
        }
    }
}

async fn exchange_token(http: &reqwest::Client, gh_token: &str) -> Result<String, ()> {
    for auth_header in [format!("token {}", gh_token), format!("Bearer {}", gh_token)] {
        let result = http
            .get("https://api.github.com/copilot_internal/v2/token")
            .header("Authorization", auth_header)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;
        if let Ok(resp) = result {
            if resp.status().is_success() {
                if let Ok(parsed) = resp.json::<TokenExchangeResponse>().await {
                    return Ok(parsed.token);
                }
            }
        }
    }
    Err(())
}

async fn fetch_user(
    ctx: &ProbeContext,
    token: &str,
    account_tag: &str,
) -> Result<UserResponse, UsageSnapshot> {
    let cached = ctx.copilot_cache.get(token);

    let mut request = ctx
        .http
        .get("https://api.github.com/copilot_internal/user")
        .header("Authorization", format!("token {}", token))
        .header("Editor-Version", "model-selector/0.1.0")
        .header("Editor-Plugin-Version", "model-selector/0.1.0")
        .header("User-Agent", "model-selector");

    if let Some((etag, _)) = &cached {
        request = request.header("If-None-Match", etag.clone());
    }

    let response = match request.timeout(PROBE_TIMEOUT).send().await {
        Ok(r) => r,
        Err(e) if e.is_timeout() => {
            return Err(UsageSnapshot::error(ProviderId::Copilot, account_tag, "Timeout"))
        }
        Err(e) => return Err(UsageSnapshot::error(ProviderId::Copilot, account_tag, e.to_string())),
    };

    if response.status() == reqwest::StatusCode::NOT_MODIFIED {
        if let Some((_, body)) = cached {
            return Ok(body);
        }
        return Err(UsageSnapshot::error(ProviderId::Copilot, account_tag, "No quota data"));
    }

    if response.status() == reqwest::StatusCode::UNAUTHORIZED
        || response.status() == reqwest::StatusCode::FORBIDDEN
    {
        return Err(UsageSnapshot::error(ProviderId::Copilot, account_tag, "Unauthorized"));
    }
    if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(UsageSnapshot::error(ProviderId::Copilot, account_tag, "HTTP 429"));
    }
    if !response.status().is_success() {
        return Err(UsageSnapshot::error(
            ProviderId::Copilot,
            account_tag,
            format!("HTTP {}", response.status().as_u16()),
        ));
    }

    let etag = response
        .headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let body: UserResponse = response
        .json()
        .await
        .map_err(|_| UsageSnapshot::error(ProviderId::Copilot, account_tag, "No quota data"))?;

    if let Some(etag) = etag {
        ctx.copilot_cache.put(token, etag, body.clone());
    }

    Ok(body)
}

fn normalize(user: &UserResponse) -> UsageSnapshot {
    let mut windows = Vec::new();
    if let Some(quotas) = &user.quota_snapshots {
        if let Some(premium) = &quotas.premium_interactions {
            windows.push(RateWindow::new("Premium", 100.0 - premium.percent_remaining));
        }
        if let Some(chat) = &quotas.chat {
            if let ChatQuota::Metered(q) = chat {
                windows.push(RateWindow::new("Chat", 100.0 - q.percent_remaining));
            }
        }
    }
    if windows.is_empty() {
        windows.push(RateWindow::synthetic_access());
    }

    let mut snapshot = UsageSnapshot::ok(ProviderId::Copilot, "GitHub Copilot", windows);
    snapshot.account = Some(user.login.clone());
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_result(login: &str, premium_remaining: f64) -> AccountResult {
        let user = UserResponse {
            login: login.to_string(),
            quota_snapshots: Some(QuotaSnapshots {
                premium_interactions: Some(Quota {
                    percent_remaining: premium_remaining,
                }),
                chat: None,
            }),
        };
        AccountResult {
            snapshot: normalize(&user),
            login: Some(login.to_string()),
        }
    }

    fn error_result(login: Option<&str>, message: &str) -> AccountResult {
        let tag = login.unwrap_or("discovery-source#0");
        AccountResult {
            snapshot: UsageSnapshot::error(ProviderId::Copilot, tag, message),
            login: login.map(str::to_string),
        }
    }

    #[test]
    fn copilot_multi_account_dedup_scenario() {
        // Spec §8 scenario 3: two tokens both resolve to "user1" — one
        // succeeds, the other 401s. Expect exactly one snapshot, and the
        // 401 is suppressed.
        let results = vec![ok_result("user1", 50.0), error_result(Some("user1"), "Unauthorized")];
        let out = dedup_and_suppress(results);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].account.as_deref(), Some("user1"));
        assert!(!out[0].is_error());
    }

    #[test]
    fn duplicate_successful_logins_are_deduped() {
        let results = vec![ok_result("user1", 50.0), ok_result("user1", 10.0)];
        let out = dedup_and_suppress(results);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn lone_anonymous_error_is_suppressed_when_exactly_one_account_succeeded() {
        let results = vec![ok_result("user1", 80.0), error_result(None, "Timeout")];
        let out = dedup_and_suppress(results);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].account.as_deref(), Some("user1"));
    }

    #[test]
    fn anonymous_error_survives_when_nothing_succeeded() {
        let results = vec![error_result(None, "No credentials")];
        let out = dedup_and_suppress(results);
        assert_eq!(out.len(), 1);
        assert!(out[0].is_error());
    }

    #[test]
    fn premium_usage_maps_to_used_percent() {
        let user = UserResponse {
            login: "user1".into(),
            quota_snapshots: Some(QuotaSnapshots {
                premium_interactions: Some(Quota {
                    percent_remaining: 30.0,
                }),
                chat: None,
            }),
        };
        let snapshot = normalize(&user);
        let premium = snapshot.windows.iter().find(|w| w.label == "Premium").unwrap();
        assert_eq!(premium.used_percent, 70.0);
    }

    #[test]
    fn unlimited_chat_is_not_emitted_as_a_window() {
        let user = UserResponse {
            login: "user1".into(),
            quota_snapshots: Some(QuotaSnapshots {
                premium_interactions: None,
                chat: Some(ChatQuota::Unlimited(UnlimitedMarker { unlimited: true })),
            }),
        };
        let snapshot = normalize(&user);
        assert!(snapshot.windows.iter().all(|w| w.label != "Chat"));
    }
}
