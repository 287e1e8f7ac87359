//! Ranker (C4, spec §4.4): orders candidates by the user's configured
//! priority keys, falling back to a stable `(provider, windowLabel)`
//! tiebreak so the ordering is always total.

use std::cmp::Ordering;

use crate::config::PriorityKey;
use crate::types::UsageCandidate;

/// Sort `candidates` best-first according to `priority` (spec §4.4).
pub fn rank(mut candidates: Vec<UsageCandidate>, priority: &[PriorityKey]) -> Vec<UsageCandidate> {
    candidates.sort_by(|a, b| compare(a, b, priority));
    candidates
}

fn compare(a: &UsageCandidate, b: &UsageCandidate, priority: &[PriorityKey]) -> Ordering {
    for key in priority {
        let ord = match key {
            PriorityKey::FullAvailability => {
                // Fully-available (0% used, no reserve exhaustion) candidates
                // sort before everything else.
                let a_full = a.used_percent <= 0.0 && !a.effectively_exhausted;
                let b_full = b.used_percent <= 0.0 && !b.effectively_exhausted;
                b_full.cmp(&a_full)
            }
            PriorityKey::RemainingPercent => b
                .remaining_percent()
                .partial_cmp(&a.remaining_percent())
                .unwrap_or(Ordering::Equal),
            PriorityKey::EarliestReset => match (a.resets_at, b.resets_at) {
                (Some(ra), Some(rb)) => ra.cmp(&rb),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    // Stable tiebreak (spec §4.4): identical-priority candidates sort by
    // provider id, then window label, so the ordering is a total order
    // independent of input order.
    a.provider
        .id()
        .cmp(b.provider.id())
        .then_with(|| a.window_label.cmp(&b.window_label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_priority;
    use crate::types::{ProviderId, UsageCandidate};
    use chrono::{TimeZone, Utc};

    fn candidate(provider: ProviderId, window_label: &str, used_percent: f64) -> UsageCandidate {
        UsageCandidate {
            provider,
            display_name: provider.display_name().to_string(),
            window_label: window_label.to_string(),
            account: None,
            used_percent,
            resets_at: None,
            is_synthetic: false,
            mapped_model: None,
            effectively_exhausted: false,
        }
    }

    #[test]
    fn fully_available_candidates_sort_first() {
        let candidates = vec![
            candidate(ProviderId::Codex, "5h", 50.0),
            candidate(ProviderId::Anthropic, "5h", 0.0),
        ];
        let ranked = rank(candidates, &default_priority());
        assert_eq!(ranked[0].provider, ProviderId::Anthropic);
    }

    #[test]
    fn ties_break_by_provider_then_window_label_for_total_order() {
        let candidates = vec![
            candidate(ProviderId::Codex, "Week", 50.0),
            candidate(ProviderId::Codex, "5h", 50.0),
        ];
        let priority = vec![crate::config::PriorityKey::RemainingPercent];
        let ranked = rank(candidates, &priority);
        assert_eq!(ranked[0].window_label, "5h");
    }

    #[test]
    fn ranking_is_a_total_order_regardless_of_input_order() {
        let mut forward = vec![
            candidate(ProviderId::Anthropic, "5h", 10.0),
            candidate(ProviderId::Codex, "5h", 10.0),
            candidate(ProviderId::Gemini, "Pro", 10.0),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();

        let priority = default_priority();
        let ranked_forward = rank(std::mem::take(&mut forward), &priority);
        let ranked_reversed = rank(std::mem::take(&mut reversed), &priority);

        let forward_keys: Vec<_> = ranked_forward.iter().map(|c| (c.provider, c.window_label.clone())).collect();
        let reversed_keys: Vec<_> = ranked_reversed.iter().map(|c| (c.provider, c.window_label.clone())).collect();
        assert_eq!(forward_keys, reversed_keys);
    }

    #[test]
    fn earliest_reset_breaks_ties_when_prioritized() {
        let mut early = candidate(ProviderId::Anthropic, "5h", 50.0);
        early.resets_at = Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        let mut late = candidate(ProviderId::Codex, "5h", 50.0);
        late.resets_at = Some(Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap());

        let priority = vec![crate::config::PriorityKey::EarliestReset];
        let ranked = rank(vec![late, early], &priority);
        assert_eq!(ranked[0].provider, ProviderId::Anthropic);
    }
}
