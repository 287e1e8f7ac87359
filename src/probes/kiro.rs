//! Kiro usage probe (spec §4.1 "Kiro"). Kiro has no HTTP usage endpoint;
//! usage is read by shelling out to the `kiro-cli` and screen-scraping its
//! `/usage` reply.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{ProviderId, RateWindow, UsageSnapshot};

use super::{Probe, ProbeContext};

pub struct KiroProbe;

#[async_trait]
impl Probe for KiroProbe {
    fn provider(&self) -> ProviderId {
        ProviderId::Kiro
    }

    async fn probe(&self, _ctx: &ProbeContext) -> Vec<UsageSnapshot> {
        // Spec §6: TERM is forced to xterm-256color so kiro-cli's output
        // doesn't switch to a dumb-terminal rendering that drops the ANSI
        // styling this parser's strip_ansi step expects to strip.
        let output = tokio::process::Command::new("kiro-cli")
            .args(["chat", "--no-interactive", "/usage"])
            .env("TERM", "xterm-256color")
            .output()
            .await;

        let output = match output {
            Ok(o) if o.status.success() => o,
            Ok(o) => {
                return vec![UsageSnapshot::error(
                    ProviderId::Kiro,
                    "kiro-cli",
                    format!("kiro-cli exited with {}", o.status),
                )]
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return vec![UsageSnapshot::error(
                    ProviderId::Kiro,
                    "kiro-cli",
                    "kiro-cli not found",
                )]
            }
            Err(e) => {
                return vec![UsageSnapshot::error(
                    ProviderId::Kiro,
                    "kiro-cli",
                    format!("failed to launch kiro-cli: {}", e),
                )]
            }
        };

        let text = strip_ansi(&String::from_utf8_lossy(&output.stdout));
        let windows = parse_usage(&text, Utc::now());

        if windows.is_empty() {
            return vec![UsageSnapshot::error(
                ProviderId::Kiro,
                "kiro-cli",
                "No quota data",
            )];
        }

        vec![UsageSnapshot::ok(ProviderId::Kiro, "Kiro", windows)]
    }
}

/// Reused from the teacher's ANSI-stripping helper for CLI-tool output.
fn strip_ansi(input: &str) -> String {
    static ANSI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap());
    ANSI_RE.replace_all(input, "").to_string()
}

/// Matches a quota line: one of the known labels, then either `NN%` or an
/// `A/B` fraction (spec §4.1 "Kiro" capture set).
static QUOTA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(Progress|Usage|Credits|Quota|Remaining|Bonus)[^\n%0-9]{0,20}(?:(\d+(?:\.\d+)?)\s*%|(\d+)\s*/\s*(\d+))",
    )
    .unwrap()
});

/// Matches a trailing reset/expiry annotation following a quota line.
static RESET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)resets? on\s+(\d{1,2}/\d{1,2})|expires? in\s+(\d+)\s*d").unwrap());

fn parse_usage(text: &str, now: DateTime<Utc>) -> Vec<RateWindow> {
    let mut windows = Vec::new();

    for line in text.lines() {
        let Some(quota) = QUOTA_RE.captures(line) else {
            continue;
        };

        let label = quota.get(1).unwrap().as_str().to_string();
        let used_percent = if let Some(pct) = quota.get(2) {
            pct.as_str().parse::<f64>().unwrap_or(0.0)
        } else if let (Some(used), Some(total)) = (quota.get(3), quota.get(4)) {
            let used: f64 = used.as_str().parse().unwrap_or(0.0);
            let total: f64 = total.as_str().parse().unwrap_or(1.0);
            if total > 0.0 {
                (used / total) * 100.0
            } else {
                0.0
            }
        } else {
            continue;
        };

        let mut window = RateWindow::new(label, used_percent);

        if let Some(reset) = RESET_RE.captures(line) {
            if let Some(date) = reset.get(1) {
                if let Some(resolved) = resolve_ambiguous_date(date.as_str(), now) {
                    window = window.with_reset(resolved);
                }
            } else if let Some(days) = reset.get(2) {
                if let Ok(days) = days.as_str().parse::<i64>() {
                    window = window.with_reset(now + ChronoDuration::days(days));
                }
            }
        }

        windows.push(window);
    }

    windows
}

/// Disambiguate a `A/B` date string that could be `MM/DD` or `DD/MM`
/// (spec §8: "Kiro date '10/11' on system date 2026-01-01 resolves to the
/// nearest future date"). Builds candidates for both orderings across the
/// previous, current, and next year, then picks the one closest to `now`
/// among those that are in the future or at most 7 days in the past
/// (rolling a year forward otherwise).
fn resolve_ambiguous_date(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut parts = raw.split('/');
    let a: u32 = parts.next()?.parse().ok()?;
    let b: u32 = parts.next()?.parse().ok()?;

    let mut candidates = Vec::new();
    for (month, day) in [(a, b), (b, a)] {
        if month == 0 || month > 12 || day == 0 || day > 31 {
            continue;
        }
        for year_offset in [-1, 0, 1] {
            let year = now.year() + year_offset;
            if let Some(date) = Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).single() {
                candidates.push(date);
            }
        }
    }

    if candidates.is_empty() {
        return None;
    }

    candidates.retain(|c| *c >= now - ChronoDuration::days(7));

    candidates.into_iter().min_by_key(|c| (*c - now).num_seconds().abs())
}
