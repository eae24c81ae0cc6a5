use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::db::Database;
use crate::error::PollError;
use crate::models::Reading;
use crate::source::VoteSource;
use crate::tally::calibrate;
use crate::trend::compute_trend;

/// The background sampling loop. One cycle is ever in flight; the loop
/// sleeps the poll interval after a success and an exponentially growing,
/// capped delay after a failure. It never terminates on its own; transient
/// errors only delay the next attempt. Cancellation is honored between
/// cycles and during either sleep, so an in-flight cycle always completes
/// before the task exits.
pub async fn poll_loop(
    db: Arc<Database>,
    source: Arc<dyn VoteSource>,
    settings: Settings,
    cancel: CancellationToken,
) {
    info!(
        "starting poller: every {:?}, feed {}",
        settings.poll_interval, settings.feed_url
    );
    let mut consecutive_failures: u32 = 0;

    loop {
        match poll_cycle(&db, source.as_ref(), &settings).await {
            Ok(reading) => {
                consecutive_failures = 0;
                log_standings(&reading);
                log_recent_trend(&db).await;
                if let Some(retention) = settings.retention {
                    prune_old(&db, retention).await;
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!("poll cycle failed ({} in a row): {}", consecutive_failures, e);
                if consecutive_failures == settings.degraded_after {
                    // Consumers see this outage as last_update staleness;
                    // the warning is for the operator.
                    warn!(
                        "tracker degraded: {} consecutive failures, still retrying",
                        consecutive_failures
                    );
                }
            }
        }

        let delay = if consecutive_failures == 0 {
            settings.poll_interval
        } else {
            backoff_delay(consecutive_failures, settings.backoff_base, settings.backoff_cap)
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("poller stopping");
                break;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// One sample: fetch, calibrate against the previous state, append to the
/// log, replace the state. Nothing durable is written unless the fetch
/// produced a complete set of ratios.
pub async fn poll_cycle(
    db: &Database,
    source: &dyn VoteSource,
    settings: &Settings,
) -> Result<Reading, PollError> {
    let ratios = source.fetch().await?;
    let previous = db.get_state().await?;
    let reading = calibrate(&ratios, previous.as_ref(), settings.initial_total, Utc::now());

    db.append_reading(&reading).await?;

    // The log row group is durable at this point. A failed state replace
    // only costs freshness: retry a few times, then let the next cycle
    // rebuild it. The log stays authoritative either way.
    let mut attempt: u32 = 0;
    while let Err(e) = db.replace_state(&reading).await {
        attempt += 1;
        if attempt > settings.state_retries {
            warn!(
                "state replace failed after {} retries, log remains authoritative: {}",
                settings.state_retries, e
            );
            break;
        }
        warn!("state replace failed (attempt {}): {}", attempt, e);
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    Ok(reading)
}

fn backoff_delay(failures: u32, base: Duration, cap: Duration) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(cap)
}

fn log_standings(reading: &Reading) {
    info!(
        "total: {} votes ({} candidates)",
        reading.total,
        reading.entries.len()
    );
    for entry in &reading.entries {
        info!(
            "  {:>2}. {:<24} {:>6.2}% = {:>9} votes",
            entry.rank, entry.name, entry.percent, entry.votes
        );
    }
}

async fn log_recent_trend(db: &Database) {
    let since = Utc::now() - ChronoDuration::hours(1);
    let readings = match db.read_range(Some(since), None).await {
        Ok(readings) => readings,
        Err(e) => {
            warn!("could not read log for trend summary: {}", e);
            return;
        }
    };

    match compute_trend(&readings, None, None) {
        Ok(window) => {
            for entry in window.top_gainers(3) {
                info!("  last hour gainer: {} {:+} votes", entry.name, entry.vote_delta);
            }
            if let Some(slowest) = window.top_losers(1).first() {
                info!(
                    "  last hour slowest: {} {:+} votes",
                    slowest.name, slowest.vote_delta
                );
            }
        }
        Err(_) => debug!("not enough history yet for a trend summary"),
    }
}

async fn prune_old(db: &Database, retention: Duration) {
    let Ok(retention) = ChronoDuration::from_std(retention) else {
        return;
    };
    let cutoff = Utc::now() - retention;
    match db.prune_older_than(cutoff).await {
        Ok(0) => {}
        Ok(n) => info!("pruned {} log rows older than {}", n, cutoff),
        Err(e) => warn!("prune failed: {}", e),
    }
}
