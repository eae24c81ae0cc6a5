use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_FEED_URL: &str =
    "https://yvoting-service.onfan.vn/api/v1/nominations/spotlight?awardId=58e78a33-c7c9-4bd4-b536-f25fa75b68c2";
const DEFAULT_DATABASE_URL: &str = "sqlite:yvote_tracker.db";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 20;
const DEFAULT_BACKOFF_BASE_SECS: u64 = 15;
const DEFAULT_BACKOFF_CAP_SECS: u64 = 300;
const DEFAULT_DEGRADED_AFTER: u32 = 5;
const DEFAULT_STATE_RETRIES: u32 = 3;
// Seed for the vote-count calibration before any state exists.
const DEFAULT_INITIAL_TOTAL: u64 = 1_017_428;
const DEFAULT_RAW_CAPTURE_PATH: &str = "dumps/raw_latest.txt";

/// Runtime settings, read once at startup from the environment (a `.env`
/// file is honored via dotenvy). Every variable has a working default.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub feed_url: String,
    /// Fallback endpoint tried when the primary feed fails; usually a
    /// text-proxy mirror of the same URL.
    pub proxy_url: Option<String>,
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Consecutive failures before the "tracker degraded" warning.
    pub degraded_after: u32,
    /// Bounded retries of the state replace after a durable log append.
    pub state_retries: u32,
    /// Total-vote estimate used by calibration until a state exists.
    pub initial_total: u64,
    /// Where the last raw response body is dumped; `None` disables capture.
    pub raw_capture_path: Option<PathBuf>,
    /// Log rows older than this are pruned after each cycle; `None` keeps all.
    pub retention: Option<Duration>,
}

impl Settings {
    pub fn from_env() -> Self {
        let feed_url = env::var("VOTE_FEED_URL").unwrap_or_else(|_| DEFAULT_FEED_URL.to_string());
        // Default proxy mirrors the feed through r.jina.ai, which usually
        // stays reachable when the provider rate-limits direct calls.
        let proxy_url = match env::var("VOTE_PROXY_URL") {
            Ok(v) if v.is_empty() => None,
            Ok(v) => Some(v),
            Err(_) => Some(format!("https://r.jina.ai/{}", feed_url)),
        };

        let raw_capture_path = match env::var("RAW_CAPTURE_PATH") {
            Ok(v) if v.is_empty() => None,
            Ok(v) => Some(PathBuf::from(v)),
            Err(_) => Some(PathBuf::from(DEFAULT_RAW_CAPTURE_PATH)),
        };

        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            feed_url,
            proxy_url,
            poll_interval: Duration::from_secs(env_u64(
                "POLL_INTERVAL_SECS",
                DEFAULT_POLL_INTERVAL_SECS,
            )),
            fetch_timeout: Duration::from_secs(env_u64(
                "FETCH_TIMEOUT_SECS",
                DEFAULT_FETCH_TIMEOUT_SECS,
            )),
            backoff_base: Duration::from_secs(env_u64(
                "BACKOFF_BASE_SECS",
                DEFAULT_BACKOFF_BASE_SECS,
            )),
            backoff_cap: Duration::from_secs(env_u64("BACKOFF_CAP_SECS", DEFAULT_BACKOFF_CAP_SECS)),
            degraded_after: env_u64("DEGRADED_AFTER_FAILURES", DEFAULT_DEGRADED_AFTER as u64)
                as u32,
            state_retries: env_u64("STATE_REPLACE_RETRIES", DEFAULT_STATE_RETRIES as u64) as u32,
            initial_total: env_u64("INITIAL_TOTAL_ESTIMATE", DEFAULT_INITIAL_TOTAL),
            raw_capture_path,
            retention: env::var("RETENTION_HOURS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(|hours| Duration::from_secs(hours * 3600)),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                log::warn!("ignoring unparseable {}={:?}, using {}", key, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}
