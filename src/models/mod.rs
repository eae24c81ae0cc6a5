use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One candidate as extracted from the provider response, before any vote
/// counts are derived. `percent` is the provider's ratioVotes value.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRatio {
    pub name: String,
    pub percent: f64,
}

/// One line of a Reading: a candidate with its rank, share and vote count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateEntry {
    pub rank: u32,
    pub name: String,
    pub percent: f64,
    pub votes: u64,
}

/// One timestamped observation of the race. Immutable once appended to the
/// log; ranks are dense and 1-based, ordered by votes descending.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub total: u64,
    pub entries: Vec<CandidateEntry>,
}

impl Reading {
    pub fn votes_for(&self, name: &str) -> Option<u64> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.votes)
    }

    pub fn percent_for(&self, name: &str) -> Option<f64> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.percent)
    }
}

/// Snapshot derived from the most recent successful Reading. Always replaced
/// as a whole; every field comes from the same Reading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurrentState {
    pub current_total: u64,
    pub candidate_votes: HashMap<String, u64>,
    pub last_update: DateTime<Utc>,
}

impl CurrentState {
    pub fn from_reading(reading: &Reading) -> Self {
        let candidate_votes = reading
            .entries
            .iter()
            .map(|e| (e.name.clone(), e.votes))
            .collect();

        Self {
            current_total: reading.total,
            candidate_votes,
            last_update: reading.timestamp,
        }
    }

    /// Consumers infer a stopped tracker purely from this: the state is stale
    /// once more than two poll periods have passed without an update.
    pub fn is_stale(&self, poll_interval: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_update > poll_interval * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading() -> Reading {
        Reading {
            timestamp: Utc::now(),
            total: 180,
            entries: vec![
                CandidateEntry { rank: 1, name: "A".into(), percent: 72.2, votes: 130 },
                CandidateEntry { rank: 2, name: "B".into(), percent: 27.8, votes: 50 },
            ],
        }
    }

    #[test]
    fn state_projects_latest_reading() {
        let r = reading();
        let state = CurrentState::from_reading(&r);

        assert_eq!(state.current_total, 180);
        assert_eq!(state.candidate_votes.get("A"), Some(&130));
        assert_eq!(state.candidate_votes.get("B"), Some(&50));
        assert_eq!(state.last_update, r.timestamp);
    }

    #[test]
    fn staleness_is_relative_to_poll_interval() {
        let mut state = CurrentState::from_reading(&reading());
        let now = Utc::now();
        let interval = Duration::minutes(5);

        state.last_update = now - Duration::minutes(5);
        assert!(!state.is_stale(interval, now));

        state.last_update = now - Duration::minutes(11);
        assert!(state.is_stale(interval, now));
    }
}
