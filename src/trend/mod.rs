use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::InsufficientData;
use crate::models::Reading;

/// Per-candidate movement between the two Readings bounding a window.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrendEntry {
    pub name: String,
    pub vote_delta: i64,
    pub percent_delta: f64,
    /// `None` when the two Readings are not far enough apart to define a rate.
    pub votes_per_minute: Option<f64>,
}

/// Computed view over a time range; never persisted, always recomputable
/// from the log.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrendWindow {
    pub baseline_at: DateTime<Utc>,
    pub latest_at: DateTime<Utc>,
    pub entries: Vec<TrendEntry>,
}

/// Compares the earliest Reading at/after `from` with the latest Reading
/// at/before `to` (`None` bounds fall back to the edges of the log).
/// `readings` must be ordered ascending, as the store returns them.
///
/// Candidate policy: a candidate present only in the latest Reading counts
/// from a zero baseline (its full count is the delta); one that disappeared
/// since the baseline is omitted. Fewer than two distinct Readings in the
/// window is a normal `InsufficientData` outcome.
pub fn compute_trend(
    readings: &[Reading],
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Result<TrendWindow, InsufficientData> {
    let baseline = readings
        .iter()
        .find(|r| from.is_none_or(|t0| r.timestamp >= t0))
        .ok_or(InsufficientData)?;
    let latest = readings
        .iter()
        .rev()
        .find(|r| to.is_none_or(|t1| r.timestamp <= t1))
        .ok_or(InsufficientData)?;

    if std::ptr::eq(baseline, latest) || latest.timestamp < baseline.timestamp {
        return Err(InsufficientData);
    }

    let elapsed_minutes =
        (latest.timestamp - baseline.timestamp).num_seconds() as f64 / 60.0;

    let entries = latest
        .entries
        .iter()
        .map(|entry| {
            let base_votes = baseline.votes_for(&entry.name).unwrap_or(0);
            let base_percent = baseline.percent_for(&entry.name).unwrap_or(0.0);
            let vote_delta = entry.votes as i64 - base_votes as i64;
            let votes_per_minute = if elapsed_minutes > 0.0 {
                Some(vote_delta as f64 / elapsed_minutes)
            } else {
                None
            };
            TrendEntry {
                name: entry.name.clone(),
                vote_delta,
                percent_delta: entry.percent - base_percent,
                votes_per_minute,
            }
        })
        .collect();

    Ok(TrendWindow {
        baseline_at: baseline.timestamp,
        latest_at: latest.timestamp,
        entries,
    })
}

impl TrendWindow {
    /// Biggest vote gains first; equal deltas ordered by name ascending.
    pub fn top_gainers(&self, n: usize) -> Vec<&TrendEntry> {
        let mut ranked: Vec<&TrendEntry> = self.entries.iter().collect();
        ranked.sort_by(|a, b| b.vote_delta.cmp(&a.vote_delta).then(a.name.cmp(&b.name)));
        ranked.truncate(n);
        ranked
    }

    /// Smallest (most negative) vote deltas first; same deterministic order.
    pub fn top_losers(&self, n: usize) -> Vec<&TrendEntry> {
        let mut ranked: Vec<&TrendEntry> = self.entries.iter().collect();
        ranked.sort_by(|a, b| a.vote_delta.cmp(&b.vote_delta).then(a.name.cmp(&b.name)));
        ranked.truncate(n);
        ranked
    }
}
