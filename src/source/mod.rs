use async_trait::async_trait;
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use reqwest::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, ORIGIN, REFERER, USER_AGENT};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::Settings;
use crate::error::FetchError;
use crate::models::CandidateRatio;

lazy_static! {
    // Lenient pair-scan for proxy-wrapped bodies that are no longer valid JSON.
    static ref PAIR_RE: Regex =
        Regex::new(r#"(?s)"name"\s*:\s*"([^"]+)".*?"ratioVotes"\s*:\s*"?([0-9.]+)"?"#)
            .expect("pair regex");
}

/// Seam between the poller and the network. The poller only ever sees
/// normalized ratios or a `FetchError`; partial data never crosses this
/// boundary.
#[async_trait]
pub trait VoteSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<CandidateRatio>, FetchError>;
}

pub struct HttpVoteSource {
    client: Client,
    feed_url: String,
    proxy_url: Option<String>,
    raw_capture_path: Option<PathBuf>,
}

impl HttpVoteSource {
    pub fn new(settings: &Settings) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain, */*"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static("Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/141"),
        );
        headers.insert(REFERER, HeaderValue::from_static("https://yvote.vn/"));
        headers.insert(ORIGIN, HeaderValue::from_static("https://yvote.vn"));

        let client = Client::builder()
            .timeout(settings.fetch_timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            feed_url: settings.feed_url.clone(),
            proxy_url: settings.proxy_url.clone(),
            raw_capture_path: settings.raw_capture_path.clone(),
        })
    }

    async fn fetch_body(&self) -> Result<String, FetchError> {
        match self.try_endpoint(&self.feed_url).await {
            Ok(body) => Ok(body),
            Err(err) => match &self.proxy_url {
                Some(proxy) => {
                    warn!("primary feed failed ({}), trying proxy", err);
                    self.try_endpoint(proxy).await
                }
                None => Err(err),
            },
        }
    }

    async fn try_endpoint(&self, url: &str) -> Result<String, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Err(FetchError::EmptyBody);
        }
        Ok(body)
    }

    /// Best-effort diagnostic dump of the raw body; a failed write is only
    /// a warning, the poll cycle goes on.
    async fn capture_raw(&self, body: &str) {
        let Some(path) = &self.raw_capture_path else {
            return;
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    warn!("cannot create {}: {}", parent.display(), e);
                    return;
                }
            }
        }
        if let Err(e) = tokio::fs::write(path, body).await {
            warn!("failed to capture raw response to {}: {}", path.display(), e);
        }
    }
}

#[async_trait]
impl VoteSource for HttpVoteSource {
    async fn fetch(&self) -> Result<Vec<CandidateRatio>, FetchError> {
        let body = self.fetch_body().await?;
        self.capture_raw(&body).await;
        let ratios = extract_ratios(&body)?;
        debug!("extracted {} candidates from feed", ratios.len());
        Ok(ratios)
    }
}

/// Normalizes a raw response body into candidate ratios, sorted by share
/// descending. JSON bodies are parsed strictly: a candidate record missing
/// its ratio, or carrying a non-numeric one, fails the whole fetch rather
/// than producing a partial Reading. Non-JSON bodies (the text proxy wraps
/// the payload in markdown) go through the lenient pair-scan.
pub fn extract_ratios(body: &str) -> Result<Vec<CandidateRatio>, FetchError> {
    let raw = match serde_json::from_str::<Value>(body) {
        Ok(value) => extract_from_json(&value)?,
        Err(_) => extract_from_text(body),
    };

    let mut ratios = dedupe(raw);
    if ratios.is_empty() {
        return Err(FetchError::NoCandidates);
    }
    ratios.sort_by(|a, b| b.percent.partial_cmp(&a.percent).unwrap_or(Ordering::Equal));
    Ok(ratios)
}

fn extract_from_json(value: &Value) -> Result<Vec<CandidateRatio>, FetchError> {
    let records = find_candidate_array(value).ok_or(FetchError::NoCandidates)?;
    records.iter().map(parse_candidate).collect()
}

fn parse_candidate(record: &Value) -> Result<CandidateRatio, FetchError> {
    let name = record
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| FetchError::Malformed("candidate record without a name".into()))?;

    let ratio = record
        .get("ratioVotes")
        .ok_or_else(|| FetchError::Malformed(format!("candidate {:?} has no ratioVotes", name)))?;
    let percent = ratio
        .as_f64()
        .or_else(|| ratio.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| {
            FetchError::Malformed(format!("candidate {:?} has a non-numeric ratioVotes", name))
        })?;
    if !(0.0..=100.0).contains(&percent) {
        return Err(FetchError::Malformed(format!(
            "candidate {:?} ratioVotes {} out of range",
            name, percent
        )));
    }

    Ok(CandidateRatio { name: name.to_string(), percent })
}

/// The nomination list is the largest array whose elements are all objects
/// carrying a "name" key, wherever the provider nests it.
fn find_candidate_array(value: &Value) -> Option<&Vec<Value>> {
    let mut best: Option<&Vec<Value>> = None;
    let mut stack = vec![value];
    while let Some(v) = stack.pop() {
        match v {
            Value::Array(items) => {
                let all_named = !items.is_empty()
                    && items
                        .iter()
                        .all(|i| i.as_object().is_some_and(|o| o.contains_key("name")));
                if all_named && best.is_none_or(|b| items.len() > b.len()) {
                    best = Some(items);
                }
                stack.extend(items.iter());
            }
            Value::Object(map) => stack.extend(map.values()),
            _ => {}
        }
    }
    best
}

fn extract_from_text(body: &str) -> Vec<CandidateRatio> {
    PAIR_RE
        .captures_iter(body)
        .filter_map(|caps| {
            let name = caps[1].trim();
            let percent: f64 = caps[2].parse().ok()?;
            if name.is_empty() || !(0.0..=100.0).contains(&percent) {
                return None;
            }
            Some(CandidateRatio { name: name.to_string(), percent })
        })
        .collect()
}

/// The feed occasionally repeats a candidate with differing casing; keep the
/// first position but the highest share seen.
fn dedupe(ratios: Vec<CandidateRatio>) -> Vec<CandidateRatio> {
    let mut by_key: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<CandidateRatio> = Vec::with_capacity(ratios.len());
    for ratio in ratios {
        let key = ratio.name.to_uppercase();
        match by_key.get(&key) {
            Some(&idx) => {
                if ratio.percent > out[idx].percent {
                    out[idx] = ratio;
                }
            }
            None => {
                by_key.insert(key, out.len());
                out.push(ratio);
            }
        }
    }
    out
}
