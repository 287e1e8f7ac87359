//! Credential discovery and OAuth token refresh shared by every probe
//! (spec §4.1 "Credential discovery order", "Token refresh").

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where a discovered credential came from — attached to error snapshots
/// so the user can tell which credential failed (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    AuthStore,
    PiAuth,
    Keychain,
    OAuthFile,
    ExternalCli,
    EnvVar,
}

impl std::fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AuthStore => "auth-store",
            Self::PiAuth => "pi-auth",
            Self::Keychain => "keychain",
            Self::OAuthFile => "oauth-file",
            Self::ExternalCli => "external-cli",
            Self::EnvVar => "env-var",
        };
        write!(f, "{}", s)
    }
}

/// A credential record as read from `authStore.get`/`piAuth[...]`, sharing
/// the aliases spec §4.1 lists (`access|accessToken|token`, `refresh`,
/// `expires|expiresAt|expiry_date`, `projectId|project_id`,
/// `clientId|client_id`, `clientSecret|client_secret`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PiAuthRecord {
    #[serde(alias = "accessToken", alias = "token")]
    pub access: Option<String>,
    #[serde(default)]
    pub refresh: Option<String>,
    #[serde(alias = "expiresAt", alias = "expiry_date")]
    pub expires: Option<i64>,
    #[serde(alias = "project_id")]
    pub project_id: Option<String>,
    #[serde(alias = "client_id")]
    pub client_id: Option<String>,
    #[serde(alias = "client_secret")]
    pub client_secret: Option<String>,
}

impl PiAuthRecord {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires.is_some_and(|e| e <= now_ms)
    }

    pub fn expires_within(&self, now_ms: i64, window_ms: i64) -> bool {
        self.expires.is_some_and(|e| e - now_ms <= window_ms)
    }
}

/// A credential discovered from one of the sources in spec §4.1, tagged
/// with where it came from.
#[derive(Debug, Clone)]
pub enum DiscoveredCredential {
    ApiKey {
        key: String,
        source: CredentialSource,
    },
    OAuth {
        record: PiAuthRecord,
        source: CredentialSource,
    },
}

impl DiscoveredCredential {
    pub fn source(&self) -> CredentialSource {
        match self {
            Self::ApiKey { source, .. } => *source,
            Self::OAuth { source, .. } => *source,
        }
    }
}

/// Collect credentials from `authStore` and `piAuth` for `provider_id`
/// (and any aliases), in discovery order. Freshness ordering (non-expired
/// first) is the caller's responsibility once it knows "now" — this just
/// gathers what's available, as spec §4.1 separates "collect ... then try
/// in order of freshness."
pub fn discover_credentials(
    ctx: &super::ProbeContext,
    provider_id: &str,
    pi_aliases: &[&str],
) -> Vec<DiscoveredCredential> {
    let mut found = Vec::new();

    if let Some(key) = ctx.auth_storage.get_api_key(provider_id) {
        found.push(DiscoveredCredential::ApiKey {
            key,
            source: CredentialSource::AuthStore,
        });
    }

    if let Some(value) = ctx.auth_storage.get(provider_id) {
        if let Ok(record) = serde_json::from_value::<PiAuthRecord>(value) {
            found.push(DiscoveredCredential::OAuth {
                record,
                source: CredentialSource::AuthStore,
            });
        }
    }

    for alias in pi_aliases {
        if let Some(record) = ctx.pi_auth.get(*alias) {
            found.push(DiscoveredCredential::OAuth {
                record: record.clone(),
                source: CredentialSource::PiAuth,
            });
        }
    }

    found
}

/// Order discovered credentials with non-expired ones first (spec §4.1:
/// "tries them in order of freshness (non-expired first)").
pub fn order_by_freshness(mut creds: Vec<DiscoveredCredential>, now_ms: i64) -> Vec<DiscoveredCredential> {
    creds.sort_by_key(|c| match c {
        DiscoveredCredential::ApiKey { .. } => 0,
        DiscoveredCredential::OAuth { record, .. } => i32::from(record.is_expired(now_ms)),
    });
    creds
}

#[derive(Debug, Error)]
pub enum TokenRefreshError {
    #[error("no refresh token available")]
    NoRefreshToken,
    #[error("refresh request failed: {0}")]
    Request(String),
    #[error("refresh response had no access_token")]
    MissingAccessToken,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// The well-known Cloud-Shell OAuth client, used as a last resort when a
/// provider-specific client id/secret fails to refresh (spec §4.1).
const CLOUD_SHELL_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const CLOUD_SHELL_CLIENT_SECRET: &str = "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";

/// Refresh a Google-family OAuth token (Gemini, Antigravity). Tries the
/// record's own `client_id`/`client_secret` first, then retries with the
/// Cloud-Shell client id on failure. `attempted` is the per-call
/// "attempted tokens" set shared across a probe's internal calls, used to
/// avoid refresh loops (spec §4.1, §5).
pub async fn refresh_google_token(
    http: &reqwest::Client,
    refresh_token: &str,
    client_id: Option<&str>,
    client_secret: Option<&str>,
    attempted: &mut std::collections::HashSet<String>,
) -> Result<(String, Option<i64>), TokenRefreshError> {
    if !attempted.insert(refresh_token.to_string()) {
        return Err(TokenRefreshError::NoRefreshToken);
    }

    let attempts: Vec<(Option<&str>, Option<&str>)> = vec![
        (client_id, client_secret),
        (Some(CLOUD_SHELL_CLIENT_ID), Some(CLOUD_SHELL_CLIENT_SECRET)),
    ];

    let mut last_err = TokenRefreshError::NoRefreshToken;
    for (cid, secret) in attempts {
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        if let Some(cid) = cid {
            form.push(("client_id", cid.to_string()));
        }
        if let Some(secret) = secret {
            form.push(("client_secret", secret.to_string()));
        }

        let result = http
            .post("https://oauth2.googleapis.com/token")
            .form(&form)
            .timeout(super::PROBE_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<RefreshResponse>().await {
                    Ok(parsed) => return Ok((parsed.access_token, parsed.expires_in)),
                    Err(e) => last_err = TokenRefreshError::Request(e.to_string()),
                }
            }
            Ok(resp) => {
                last_err = TokenRefreshError::Request(format!("HTTP {}", resp.status()));
            }
            Err(e) => last_err = TokenRefreshError::Request(e.to_string()),
        }
    }

    Err(last_err)
}
