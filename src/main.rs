mod config;
mod db;
mod error;
mod models;
mod source;
mod tally;
mod tasks;
mod trend;

use config::Settings;
use db::Database;
use log::{error, info};
use source::{HttpVoteSource, VoteSource};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    // Initialize logging
    dotenvy::dotenv().ok();
    env_logger::init();

    let settings = Settings::from_env();

    // Initialize database
    let database = match Database::new(&settings.database_url).await {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            return;
        }
    };

    // Report where a previous run left off.
    match database.get_state().await {
        Ok(Some(state)) => {
            let staleness = if state.is_stale(
                chrono::Duration::from_std(settings.poll_interval)
                    .unwrap_or_else(|_| chrono::Duration::minutes(5)),
                chrono::Utc::now(),
            ) {
                " (stale)"
            } else {
                ""
            };
            info!(
                "Resuming: total={}, {} candidates, last update {}{}",
                state.current_total,
                state.candidate_votes.len(),
                state.last_update,
                staleness
            );
        }
        Ok(None) => info!("No previous state, starting fresh."),
        Err(e) => error!("Could not load previous state: {}", e),
    }

    let source: Arc<dyn VoteSource> = match HttpVoteSource::new(&settings) {
        Ok(source) => Arc::new(source),
        Err(e) => {
            error!("Failed to build HTTP client: {}", e);
            return;
        }
    };

    // --- Start Background Poller Task ---
    let cancel = CancellationToken::new();
    let poller = tokio::spawn(tasks::poller::poll_loop(
        Arc::clone(&database),
        source,
        settings.clone(),
        cancel.clone(),
    ));
    // --- End Background Poller Task ---

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested, waiting for the poller to finish its cycle...");
    cancel.cancel();

    if let Err(e) = poller.await {
        error!("Poller task panicked: {}", e);
    }
    info!("Tracker stopped.");
}
