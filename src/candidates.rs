//! Candidate Builder (C3, spec §4.3): turns raw `UsageSnapshot`s into
//! `UsageCandidate`s, applying combine-groups, ignore rules, mapping
//! lookups, and reserve thresholds.

use regex::Regex;

use crate::config::{LoadedConfig, MappingAction, MappingEntry, ModelRef};
use crate::types::{ProviderId, RateWindow, UsageCandidate, UsageSnapshot};

/// Build the full candidate list for one aggregator pass (spec §4.3
/// steps 1-5).
pub fn build_candidates(snapshots: &[UsageSnapshot], config: &LoadedConfig) -> Vec<UsageCandidate> {
    let mut raw = Vec::new();
    for snapshot in snapshots {
        if snapshot.is_error() {
            continue;
        }
        for window in &snapshot.windows {
            raw.push(raw_candidate(snapshot, window));
        }
    }

    let (combined, mut rest) = apply_combine_groups(raw, config);
    rest.extend(combined);

    rest.retain(|c| find_ignore_mapping(c, config).is_none());

    for candidate in &mut rest {
        if let Some((action, reserve)) = find_model_mapping(candidate, config) {
            candidate.mapped_model = Some(action);
            if let Some(reserve) = reserve {
                let threshold = 100.0 - reserve as f64;
                if candidate.used_percent >= threshold {
                    candidate.effectively_exhausted = true;
                }
            }
        }
    }

    rest
}

fn raw_candidate(snapshot: &UsageSnapshot, window: &RateWindow) -> UsageCandidate {
    UsageCandidate {
        provider: snapshot.provider,
        display_name: snapshot.display_name.clone(),
        window_label: window.label.clone(),
        account: snapshot.account.clone(),
        used_percent: window.used_percent,
        resets_at: window.resets_at,
        is_synthetic: window.label == "Access",
        mapped_model: None,
        effectively_exhausted: false,
    }
}

/// Spec §4.3 step 3: candidates whose mapping action is `combine` collapse
/// into one synthetic candidate per `(provider, account, combine-name)`
/// group, taking the maximum `usedPercent` and the latest `resetsAt`.
fn apply_combine_groups(
    raw: Vec<UsageCandidate>,
    config: &LoadedConfig,
) -> (Vec<UsageCandidate>, Vec<UsageCandidate>) {
    use std::collections::HashMap;

    let mut groups: HashMap<(ProviderId, Option<String>, String), Vec<UsageCandidate>> = HashMap::new();
    let mut ungrouped = Vec::new();

    for candidate in raw {
        match find_combination_mapping(&candidate, config) {
            Some(combine_name) => {
                groups
                    .entry((candidate.provider, candidate.account.clone(), combine_name))
                    .or_default()
                    .push(candidate);
            }
            None => ungrouped.push(candidate),
        }
    }

    let combined = groups
        .into_iter()
        .filter_map(|((provider, account, combine_name), members)| {
            members.into_iter().reduce(|mut worst, next| {
                if next.used_percent > worst.used_percent {
                    worst.used_percent = next.used_percent;
                }
                worst.resets_at = later(worst.resets_at, next.resets_at);
                worst
            }).map(|mut merged| {
                merged.provider = provider;
                merged.account = account;
                merged.window_label = combine_name;
                // Spec §3: isSynthetic is true for combined groups (and
                // the fallback pseudo-candidate, set in selector.rs).
                merged.is_synthetic = true;
                merged
            })
        })
        .collect();

    (combined, ungrouped)
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

/// Mapping lookup precedence (spec §4.3 step 4): exact
/// provider+account+window, then exact provider+window (any account),
/// then a `windowPattern` regex match — same account-matching rules apply
/// at each tier.
fn find_matching_entry<'a>(
    candidate: &UsageCandidate,
    config: &'a LoadedConfig,
    want: impl Fn(&MappingAction) -> bool,
) -> Option<&'a MappingEntry> {
    let account_matches = |m: &MappingEntry| match &m.usage.account {
        Some(acct) => candidate.account.as_deref() == Some(acct.as_str()),
        None => true,
    };

    let exact_window = |m: &MappingEntry| {
        m.usage.provider == candidate.provider
            && account_matches(m)
            && m.usage.window.as_deref() == Some(candidate.window_label.as_str())
    };

    if let Some(entry) = config
        .mappings
        .iter()
        .find(|m| exact_window(m) && m.usage.account.is_some() && want(&m.action))
    {
        return Some(entry);
    }

    if let Some(entry) = config.mappings.iter().find(|m| exact_window(m) && want(&m.action)) {
        return Some(entry);
    }

    config.mappings.iter().find(|m| {
        m.usage.provider == candidate.provider
            && account_matches(m)
            && m.usage
                .window_pattern
                .as_deref()
                .and_then(|p| Regex::new(p).ok())
                .is_some_and(|re| re.is_match(&candidate.window_label))
            && want(&m.action)
    })
}

fn find_ignore_mapping(candidate: &UsageCandidate, config: &LoadedConfig) -> Option<()> {
    find_matching_entry(candidate, config, |a| matches!(a, MappingAction::Ignore { ignore: true }))
        .map(|_| ())
}

fn find_combination_mapping(candidate: &UsageCandidate, config: &LoadedConfig) -> Option<String> {
    find_matching_entry(candidate, config, |a| matches!(a, MappingAction::Combine { .. })).and_then(|m| {
        match &m.action {
            MappingAction::Combine { combine } => Some(combine.clone()),
            _ => None,
        }
    })
}

fn find_model_mapping(candidate: &UsageCandidate, config: &LoadedConfig) -> Option<(ModelRef, Option<u8>)> {
    find_matching_entry(candidate, config, |a| matches!(a, MappingAction::Model { .. })).and_then(|m| {
        match &m.action {
            MappingAction::Model { model, reserve } => Some((model.clone(), *reserve)),
            _ => None,
        }
    })
}

/// True if a mapping marks this whole provider/account combination as
/// ignored, independent of any particular window (spec §4.5: a 429 from an
/// ignored provider/account must never start a cooldown). Unlike
/// `find_ignore_mapping`, this runs before any `UsageCandidate` exists —
/// the 429 handling step only has the raw snapshot's provider and account.
pub fn provider_is_ignored(config: &LoadedConfig, provider: ProviderId, account: Option<&str>) -> bool {
    config.mappings.iter().any(|m| {
        m.usage.provider == provider
            && matches!(m.action, MappingAction::Ignore { ignore: true })
            && match &m.usage.account {
                Some(acct) => Some(acct.as_str()) == account,
                None => true,
            }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UsageSelector;
    use crate::types::RateWindow;

    fn snapshot(provider: ProviderId, windows: Vec<RateWindow>) -> UsageSnapshot {
        UsageSnapshot::ok(provider, provider.display_name(), windows)
    }

    #[test]
    fn ignore_mapping_drops_candidate() {
        let mut config = LoadedConfig::default();
        config.mappings.push(MappingEntry {
            usage: UsageSelector {
                provider: ProviderId::Anthropic,
                account: None,
                window: Some("5h".into()),
                window_pattern: None,
            },
            action: MappingAction::Ignore { ignore: true },
        });

        let snapshots = vec![snapshot(ProviderId::Anthropic, vec![RateWindow::new("5h", 10.0)])];
        let candidates = build_candidates(&snapshots, &config);
        assert!(candidates.is_empty());
    }

    #[test]
    fn reserve_marks_candidate_exhausted_below_raw_percent() {
        let mut config = LoadedConfig::default();
        config.mappings.push(MappingEntry {
            usage: UsageSelector {
                provider: ProviderId::Anthropic,
                account: None,
                window: Some("5h".into()),
                window_pattern: None,
            },
            action: MappingAction::Model {
                model: ModelRef {
                    provider: "anthropic".into(),
                    id: "claude".into(),
                },
                reserve: Some(20),
            },
        });

        let snapshots = vec![snapshot(ProviderId::Anthropic, vec![RateWindow::new("5h", 85.0)])];
        let candidates = build_candidates(&snapshots, &config);
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].effectively_exhausted);
    }

    #[test]
    fn provider_is_ignored_matches_regardless_of_window() {
        let mut config = LoadedConfig::default();
        config.mappings.push(MappingEntry {
            usage: UsageSelector {
                provider: ProviderId::Zai,
                account: Some("acct-1".into()),
                window: None,
                window_pattern: None,
            },
            action: MappingAction::Ignore { ignore: true },
        });

        assert!(provider_is_ignored(&config, ProviderId::Zai, Some("acct-1")));
        assert!(!provider_is_ignored(&config, ProviderId::Zai, Some("acct-2")));
        assert!(!provider_is_ignored(&config, ProviderId::Codex, Some("acct-1")));
    }

    #[test]
    fn combine_group_takes_max_percent_and_latest_reset() {
        let mut config = LoadedConfig::default();
        config.mappings.push(MappingEntry {
            usage: UsageSelector {
                provider: ProviderId::Antigravity,
                account: None,
                window_pattern: Some("^G3.*".into()),
                window: None,
            },
            action: MappingAction::Combine {
                combine: "G3".into(),
            },
        });

        let snapshots = vec![snapshot(
            ProviderId::Antigravity,
            vec![
                RateWindow::new("G3 Pro", 30.0),
                RateWindow::new("G3 Flash", 80.0),
            ],
        )];
        let candidates = build_candidates(&snapshots, &config);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].window_label, "G3");
        assert_eq!(candidates[0].used_percent, 80.0);
    }
}
