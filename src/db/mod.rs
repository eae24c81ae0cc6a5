use chrono::{DateTime, Utc};
use log::warn;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, migrate::MigrateDatabase};
use std::collections::HashMap;

use crate::error::StoreError;
use crate::models::{CandidateEntry, CurrentState, Reading};

/// Log Store and State Store over one SQLite file.
///
/// `log_entries` is the append-only source of truth (one row per candidate
/// per Reading); `current_state` is a single-row projection of the latest
/// Reading. Only the poller writes; readers can run concurrently and always
/// see whole Readings because appends are transactional.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self, StoreError> {
        if !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            Sqlite::create_database(db_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    /// Private in-memory store for tests; a single pinned connection so the
    /// database survives for the whole test.
    #[cfg(test)]
    pub async fn in_memory() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        Self::init_schema(&pool).await.expect("schema");
        Self { pool }
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS log_entries (
                timestamp TEXT NOT NULL,
                total INTEGER NOT NULL,
                rank INTEGER NOT NULL,
                name TEXT NOT NULL,
                percent REAL NOT NULL,
                votes INTEGER NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_log_entries_timestamp ON log_entries(timestamp);",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS current_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                current_total INTEGER NOT NULL,
                candidate_votes TEXT NOT NULL,
                last_update TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Appends every entry of the Reading in one transaction. Prior rows are
    /// never touched; appending the same Reading twice stores it twice.
    pub async fn append_reading(&self, reading: &Reading) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let ts = reading.timestamp.to_rfc3339();

        for entry in &reading.entries {
            sqlx::query(
                r#"
                INSERT INTO log_entries (timestamp, total, rank, name, percent, votes)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&ts)
            .bind(reading.total as i64)
            .bind(entry.rank as i64)
            .bind(&entry.name)
            .bind(entry.percent)
            .bind(entry.votes as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn read_all(&self) -> Result<Vec<Reading>, StoreError> {
        self.read_range(None, None).await
    }

    /// Reconstructs Readings from the log, ordered by timestamp ascending.
    /// An empty range is an empty vec, never an error; rows that fail to
    /// parse are skipped with a warning and the rest of their Reading kept.
    pub async fn read_range(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Reading>, StoreError> {
        const COLS: &str = "SELECT timestamp, total, rank, name, percent, votes FROM log_entries";
        const ORDER: &str = "ORDER BY timestamp, rank";

        let rows = match (from, to) {
            (Some(f), Some(t)) => {
                sqlx::query(&format!("{COLS} WHERE timestamp >= ? AND timestamp <= ? {ORDER}"))
                    .bind(f.to_rfc3339())
                    .bind(t.to_rfc3339())
                    .fetch_all(&self.pool)
                    .await?
            }
            (Some(f), None) => sqlx::query(&format!("{COLS} WHERE timestamp >= ? {ORDER}"))
                .bind(f.to_rfc3339())
                .fetch_all(&self.pool)
                .await?,
            (None, Some(t)) => sqlx::query(&format!("{COLS} WHERE timestamp <= ? {ORDER}"))
                .bind(t.to_rfc3339())
                .fetch_all(&self.pool)
                .await?,
            (None, None) => {
                sqlx::query(&format!("{COLS} {ORDER}"))
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut readings: Vec<Reading> = Vec::new();
        for row in &rows {
            match decode_row(row) {
                Ok((timestamp, total, entry)) => {
                    let same_group =
                        readings.last().is_some_and(|last| last.timestamp == timestamp);
                    if same_group {
                        if let Some(last) = readings.last_mut() {
                            last.entries.push(entry);
                        }
                    } else {
                        readings.push(Reading { timestamp, total, entries: vec![entry] });
                    }
                }
                Err(reason) => warn!("skipping corrupt log row: {}", reason),
            }
        }

        Ok(readings)
    }

    /// Age-based archival: drops log rows strictly older than `cutoff` and
    /// returns how many were removed.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM log_entries WHERE timestamp < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_state(&self) -> Result<Option<CurrentState>, StoreError> {
        let row = sqlx::query(
            "SELECT current_total, candidate_votes, last_update FROM current_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let total: i64 = row.try_get("current_total")?;
        let votes_json: String = row.try_get("candidate_votes")?;
        let last_update_raw: String = row.try_get("last_update")?;

        // A corrupt state row is not fatal: the state is a projection of the
        // log and will be rebuilt on the next successful cycle.
        let candidate_votes: HashMap<String, u64> = match serde_json::from_str(&votes_json) {
            Ok(votes) => votes,
            Err(e) => {
                warn!("discarding corrupt state row: {}", e);
                return Ok(None);
            }
        };
        let last_update = match DateTime::parse_from_rfc3339(&last_update_raw) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(e) => {
                warn!("discarding state row with bad last_update {:?}: {}", last_update_raw, e);
                return Ok(None);
            }
        };

        Ok(Some(CurrentState {
            current_total: total.max(0) as u64,
            candidate_votes,
            last_update,
        }))
    }

    /// Atomically replaces the snapshot with the projection of `reading`.
    /// A single upsert statement, so readers see the old state or the new
    /// one, never a mix.
    pub async fn replace_state(&self, reading: &Reading) -> Result<(), StoreError> {
        let state = CurrentState::from_reading(reading);
        let votes_json = serde_json::to_string(&state.candidate_votes)?;

        sqlx::query(
            r#"
            INSERT INTO current_state (id, current_total, candidate_votes, last_update)
            VALUES (1, ?, ?, ?)
            ON CONFLICT(id)
            DO UPDATE SET current_total = excluded.current_total,
                          candidate_votes = excluded.candidate_votes,
                          last_update = excluded.last_update
            "#,
        )
        .bind(state.current_total as i64)
        .bind(votes_json)
        .bind(state.last_update.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn decode_row(row: &SqliteRow) -> Result<(DateTime<Utc>, u64, CandidateEntry), String> {
    let ts_raw: String = row
        .try_get("timestamp")
        .map_err(|e| format!("timestamp: {e}"))?;
    let timestamp = DateTime::parse_from_rfc3339(&ts_raw)
        .map_err(|e| format!("timestamp {ts_raw:?}: {e}"))?
        .with_timezone(&Utc);

    let total = row
        .try_get::<i64, _>("total")
        .map_err(|e| format!("total: {e}"))
        .and_then(|v| u64::try_from(v).map_err(|_| format!("negative total {v}")))?;
    let rank = row
        .try_get::<i64, _>("rank")
        .map_err(|e| format!("rank: {e}"))
        .and_then(|v| u32::try_from(v).map_err(|_| format!("bad rank {v}")))?;
    let name: String = row.try_get("name").map_err(|e| format!("name: {e}"))?;
    let percent: f64 = row.try_get("percent").map_err(|e| format!("percent: {e}"))?;
    let votes = row
        .try_get::<i64, _>("votes")
        .map_err(|e| format!("votes: {e}"))
        .and_then(|v| u64::try_from(v).map_err(|_| format!("negative votes {v}")))?;

    Ok((timestamp, total, CandidateEntry { rank, name, percent, votes }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn reading(at: DateTime<Utc>, rows: &[(&str, f64, u64)]) -> Reading {
        let total = rows.iter().map(|(_, _, v)| v).sum();
        Reading {
            timestamp: at,
            total,
            entries: rows
                .iter()
                .enumerate()
                .map(|(i, (name, percent, votes))| CandidateEntry {
                    rank: (i + 1) as u32,
                    name: name.to_string(),
                    percent: *percent,
                    votes: *votes,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn appends_grow_the_log_monotonically() {
        let db = Database::in_memory().await;
        let t0 = Utc::now();

        assert!(db.read_all().await.unwrap().is_empty());

        db.append_reading(&reading(t0, &[("A", 66.7, 100), ("B", 33.3, 50)]))
            .await
            .unwrap();
        assert_eq!(db.read_all().await.unwrap().len(), 1);

        db.append_reading(&reading(t0 + Duration::minutes(5), &[("A", 70.0, 130), ("B", 30.0, 50)]))
            .await
            .unwrap();
        let all = db.read_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].timestamp < all[1].timestamp);
        assert_eq!(all[1].votes_for("A"), Some(130));
    }

    #[tokio::test]
    async fn range_reads_filter_by_timestamp() {
        let db = Database::in_memory().await;
        let t0 = Utc::now();
        for i in 0..4 {
            db.append_reading(&reading(t0 + Duration::minutes(i * 10), &[("A", 100.0, 100)]))
                .await
                .unwrap();
        }

        let mid = db
            .read_range(Some(t0 + Duration::minutes(5)), Some(t0 + Duration::minutes(25)))
            .await
            .unwrap();
        assert_eq!(mid.len(), 2);

        let none = db
            .read_range(Some(t0 + Duration::hours(2)), None)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn corrupt_rows_are_skipped_not_fatal() {
        let db = Database::in_memory().await;
        let t0 = Utc::now();
        db.append_reading(&reading(t0, &[("A", 60.0, 60), ("B", 40.0, 40)]))
            .await
            .unwrap();

        // A row with an unparseable timestamp and one with text where votes
        // should be; SQLite happily stores both.
        sqlx::query("INSERT INTO log_entries VALUES ('not-a-date', 100, 1, 'X', 50.0, 50)")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("INSERT INTO log_entries VALUES (?, 100, 1, 'Y', 50.0, 'corrupt')")
            .bind((t0 + Duration::minutes(1)).to_rfc3339())
            .execute(db.pool())
            .await
            .unwrap();

        let all = db.read_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].entries.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_appends_are_kept_verbatim() {
        let db = Database::in_memory().await;
        let t0 = Utc::now();
        let r = reading(t0, &[("A", 100.0, 10)]);
        db.append_reading(&r).await.unwrap();
        db.append_reading(&r).await.unwrap();

        // No dedup on write: both row groups come back under one timestamp.
        let all = db.read_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].entries.len(), 2);
    }

    #[tokio::test]
    async fn state_round_trips_and_replaces_atomically() {
        let db = Database::in_memory().await;
        assert!(db.get_state().await.unwrap().is_none());

        let t0 = Utc::now();
        let first = reading(t0, &[("A", 60.0, 60), ("B", 40.0, 40)]);
        db.replace_state(&first).await.unwrap();

        let second = reading(t0 + Duration::minutes(5), &[("A", 65.0, 80), ("B", 35.0, 43)]);
        db.replace_state(&second).await.unwrap();

        let state = db.get_state().await.unwrap().unwrap();
        assert_eq!(state, CurrentState::from_reading(&second));

        // candidate_votes and current_total always come from the same Reading.
        let sum: u64 = state.candidate_votes.values().sum();
        assert_eq!(sum, state.current_total);
    }

    #[tokio::test]
    async fn pruning_drops_only_old_rows() {
        let db = Database::in_memory().await;
        let t0 = Utc::now();
        db.append_reading(&reading(t0, &[("A", 100.0, 10)])).await.unwrap();
        db.append_reading(&reading(t0 + Duration::hours(1), &[("A", 100.0, 20)]))
            .await
            .unwrap();

        let removed = db.prune_older_than(t0 + Duration::minutes(30)).await.unwrap();
        assert_eq!(removed, 1);

        let all = db.read_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].votes_for("A"), Some(20));
    }
}
