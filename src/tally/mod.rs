use chrono::{DateTime, Utc};

use crate::models::{CandidateEntry, CandidateRatio, CurrentState, Reading};

/// Turns raw percentage ratios into a calibrated Reading.
///
/// The provider only publishes vote shares, so absolute counts are derived
/// from the running total estimate:
/// 1. `votes = round(percent / 100 * total)`, with `total` taken from the
///    previous state (or the configured seed when no state exists yet);
/// 2. per-candidate counts never decrease (`max` against the previous state);
/// 3. the total is re-derived as `sum(votes) / sum(percent) * 100` and is
///    itself monotonic.
///
/// Entries are ranked densely from 1 by votes descending; ties keep the
/// input order, which the source client already sorted by share.
pub fn calibrate(
    ratios: &[CandidateRatio],
    previous: Option<&CurrentState>,
    initial_total: u64,
    timestamp: DateTime<Utc>,
) -> Reading {
    let prev_total = previous.map(|s| s.current_total).unwrap_or(initial_total);

    let mut entries: Vec<CandidateEntry> = ratios
        .iter()
        .map(|r| {
            let derived = (r.percent / 100.0 * prev_total as f64).round() as u64;
            let floor = previous
                .and_then(|s| s.candidate_votes.get(&r.name).copied())
                .unwrap_or(0);
            CandidateEntry {
                rank: 0,
                name: r.name.clone(),
                percent: r.percent,
                votes: derived.max(floor),
            }
        })
        .collect();

    let vote_sum: u64 = entries.iter().map(|e| e.votes).sum();
    let percent_sum: f64 = entries.iter().map(|e| e.percent).sum();

    // The total must at least account for the monotonic per-candidate counts.
    let total = if percent_sum > 0.0 {
        let implied = (vote_sum as f64 / percent_sum * 100.0).round() as u64;
        prev_total.max(implied)
    } else {
        prev_total
    };

    // sort_by is stable, so equal counts keep their share ordering
    entries.sort_by(|a, b| b.votes.cmp(&a.votes));
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.rank = (i + 1) as u32;
    }

    Reading { timestamp, total, entries }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ratios(pairs: &[(&str, f64)]) -> Vec<CandidateRatio> {
        pairs
            .iter()
            .map(|(name, percent)| CandidateRatio { name: name.to_string(), percent: *percent })
            .collect()
    }

    fn state(total: u64, votes: &[(&str, u64)]) -> CurrentState {
        CurrentState {
            current_total: total,
            candidate_votes: votes
                .iter()
                .map(|(n, v)| (n.to_string(), *v))
                .collect::<HashMap<_, _>>(),
            last_update: Utc::now(),
        }
    }

    #[test]
    fn derives_votes_from_shares_and_seed_total() {
        let reading = calibrate(&ratios(&[("A", 60.0), ("B", 40.0)]), None, 1000, Utc::now());

        assert_eq!(reading.votes_for("A"), Some(600));
        assert_eq!(reading.votes_for("B"), Some(400));
        assert_eq!(reading.total, 1000);
    }

    #[test]
    fn candidate_votes_never_decrease() {
        let prev = state(1000, &[("A", 700), ("B", 100)]);
        let reading = calibrate(&ratios(&[("A", 60.0), ("B", 40.0)]), Some(&prev), 0, Utc::now());

        // A's derived 600 is clamped up to the previous 700; B rises normally.
        assert_eq!(reading.votes_for("A"), Some(700));
        assert_eq!(reading.votes_for("B"), Some(400));
    }

    #[test]
    fn total_is_monotonic() {
        let prev = state(1000, &[("A", 700), ("B", 400)]);
        let reading = calibrate(&ratios(&[("A", 60.0), ("B", 40.0)]), Some(&prev), 0, Utc::now());

        // Clamped counts sum to 1100, so the implied total grows past 1000.
        assert!(reading.total >= 1100);

        // A partial candidate list implies the same total, never a lower one.
        let partial = calibrate(&ratios(&[("A", 50.0)]), None, 1000, Utc::now());
        assert_eq!(partial.total, 1000);
    }

    #[test]
    fn ranks_follow_votes_with_stable_ties() {
        let prev = state(1000, &[("B", 650)]);
        let reading = calibrate(
            &ratios(&[("A", 65.0), ("B", 30.0), ("C", 5.0)]),
            Some(&prev),
            0,
            Utc::now(),
        );

        // A and B both end at 650; A came first in share order and keeps rank 1.
        let ranked: Vec<(&str, u32, u64)> = reading
            .entries
            .iter()
            .map(|e| (e.name.as_str(), e.rank, e.votes))
            .collect();
        assert_eq!(ranked, vec![("A", 1, 650), ("B", 2, 650), ("C", 3, 50)]);
    }

    #[test]
    fn votes_stay_within_total() {
        let reading = calibrate(
            &ratios(&[("A", 55.5), ("B", 33.3), ("C", 11.2)]),
            None,
            1_017_428,
            Utc::now(),
        );

        let sum: u64 = reading.entries.iter().map(|e| e.votes).sum();
        assert!(sum <= reading.total + 1);
        for entry in &reading.entries {
            assert!(entry.votes <= reading.total);
        }
    }

    #[test]
    fn full_candidate_set_percents_sum_to_one_hundred() {
        // Calibration never rescales shares, so a complete Reading carries
        // the feed's shares verbatim and they stay within rounding of 100.
        let reading = calibrate(
            &ratios(&[("A", 55.512345), ("B", 33.287655), ("C", 11.2)]),
            None,
            1_017_428,
            Utc::now(),
        );

        let percent_sum: f64 = reading.entries.iter().map(|e| e.percent).sum();
        assert!((percent_sum - 100.0).abs() <= 1.0);
        for entry in &reading.entries {
            assert!((0.0..=100.0).contains(&entry.percent));
        }

        // A partial candidate list is tolerated: shares are kept as-is and
        // the implied total compensates, so counts still stay consistent.
        let partial = calibrate(&ratios(&[("A", 50.0)]), None, 1000, Utc::now());
        let partial_sum: f64 = partial.entries.iter().map(|e| e.percent).sum();
        assert_eq!(partial_sum, 50.0);
        assert!(partial.entries.iter().all(|e| e.votes <= partial.total));
    }

    #[test]
    fn zero_percent_sum_keeps_previous_total() {
        let prev = state(500, &[]);
        let reading = calibrate(&ratios(&[]), Some(&prev), 0, Utc::now());
        assert_eq!(reading.total, 500);
        assert!(reading.entries.is_empty());
    }
}
