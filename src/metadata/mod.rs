//! Metadata enrichment pipeline
//!
//! Items are enriched through a fixed provider chain (TVDB, TMDB, local NFO
//! beside the file, filename parse), merging fields as they come. The
//! pipeline is observational as far as streaming is concerned: it never
//! blocks a broadcast, and its health is tracked through lookup counters,
//! a per-item confidence score, and a once-per-cycle drift check.

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use thiserror::Error;

use crate::db::MediaItem;
use crate::metrics;

/// Confidence floor after repeated failures
const CONFIDENCE_FLOOR: f64 = 0.1;

/// Confidence gain per successful provider
const CONFIDENCE_GAIN: f64 = 0.2;

/// Multiplier applied on a failed lookup
const CONFIDENCE_DECAY: f64 = 0.8;

/// Drift alarm threshold: a rise of the failure ratio beyond this between
/// cycles emits one structured warning
const DRIFT_THRESHOLD: f64 = 0.1;

/// HTTP provider timeout; lookups must never hang a cycle
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

static EPISODE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[Ss](\d{1,2})[Ee](\d{1,2})").expect("episode regex"));
static YEAR_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b((?:19|20)\d{2})\b").expect("year regex"));

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("provider not configured")]
    NotConfigured,

    #[error("lookup failed: {0}")]
    Lookup(String),
}

/// Fields a provider can contribute; merged first-wins along the chain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataPatch {
    pub title: Option<String>,
    pub show_title: Option<String>,
    pub season: Option<i32>,
    pub episode: Option<i32>,
    pub year: Option<i32>,
    pub genres: Option<Vec<String>>,
}

impl MetadataPatch {
    pub fn is_empty(&self) -> bool {
        self == &MetadataPatch::default()
    }

    /// Fill this patch's gaps from a later provider's result
    fn absorb(&mut self, other: MetadataPatch) {
        if self.title.is_none() {
            self.title = other.title;
        }
        if self.show_title.is_none() {
            self.show_title = other.show_title;
        }
        if self.season.is_none() {
            self.season = other.season;
        }
        if self.episode.is_none() {
            self.episode = other.episode;
        }
        if self.year.is_none() {
            self.year = other.year;
        }
        if self.genres.is_none() {
            self.genres = other.genres;
        }
    }
}

/// One metadata source in the chain
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn lookup(&self, item: &MediaItem) -> Result<Option<MetadataPatch>, MetadataError>;
}

/// Derives season/episode/year/title facts from the filename alone
pub struct FilenameProvider;

#[async_trait]
impl MetadataProvider for FilenameProvider {
    fn name(&self) -> &'static str {
        "filename"
    }

    async fn lookup(&self, item: &MediaItem) -> Result<Option<MetadataPatch>, MetadataError> {
        let stem = item
            .url
            .rsplit(['/', '\\'])
            .next()
            .map(|name| name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name))
            .unwrap_or(&item.url);

        let mut patch = MetadataPatch::default();
        if let Some(caps) = EPISODE_MARKER.captures(stem) {
            patch.season = caps.get(1).and_then(|m| m.as_str().parse().ok());
            patch.episode = caps.get(2).and_then(|m| m.as_str().parse().ok());
        }
        if let Some(caps) = YEAR_MARKER.captures(stem) {
            patch.year = caps.get(1).and_then(|m| m.as_str().parse().ok());
        }
        if let Some(derived) = crate::epg::titles::derive_from_filename(&item.url) {
            patch.title = Some(derived);
        }

        Ok(if patch.is_empty() { None } else { Some(patch) })
    }
}

/// Reads a `.nfo` sidecar file next to local media
pub struct NfoProvider;

impl NfoProvider {
    fn sidecar_path(url: &str) -> Option<PathBuf> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return None;
        }
        let path = PathBuf::from(url);
        let stem = path.file_stem()?.to_string_lossy().into_owned();
        Some(path.with_file_name(format!("{}.nfo", stem)))
    }

    fn parse_nfo(content: &str) -> MetadataPatch {
        let mut patch = MetadataPatch::default();
        let grab = |tag: &str| -> Option<String> {
            let open = format!("<{}>", tag);
            let close = format!("</{}>", tag);
            let start = content.find(&open)? + open.len();
            let end = content[start..].find(&close)? + start;
            let value = content[start..end].trim();
            if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        };

        patch.title = grab("title");
        patch.show_title = grab("showtitle");
        patch.season = grab("season").and_then(|v| v.parse().ok());
        patch.episode = grab("episode").and_then(|v| v.parse().ok());
        patch.year = grab("year").and_then(|v| v.parse().ok());
        if let Some(genre) = grab("genre") {
            patch.genres = Some(vec![genre]);
        }
        patch
    }
}

#[async_trait]
impl MetadataProvider for NfoProvider {
    fn name(&self) -> &'static str {
        "nfo"
    }

    async fn lookup(&self, item: &MediaItem) -> Result<Option<MetadataPatch>, MetadataError> {
        let Some(path) = Self::sidecar_path(&item.url) else {
            return Ok(None);
        };
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MetadataError::Lookup(e.to_string())),
        };
        let patch = Self::parse_nfo(&content);
        Ok(if patch.is_empty() { None } else { Some(patch) })
    }
}

/// Thin TMDB search client; inactive without an API key
pub struct TmdbProvider {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl TmdbProvider {
    pub fn new(api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, api_key }
    }
}

#[async_trait]
impl MetadataProvider for TmdbProvider {
    fn name(&self) -> &'static str {
        "tmdb"
    }

    async fn lookup(&self, item: &MediaItem) -> Result<Option<MetadataPatch>, MetadataError> {
        let Some(api_key) = &self.api_key else {
            return Err(MetadataError::NotConfigured);
        };
        let url = format!(
            "https://api.themoviedb.org/3/search/multi?api_key={}&query={}",
            urlencoding::encode(api_key),
            urlencoding::encode(&item.title)
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| MetadataError::Lookup(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MetadataError::Lookup(format!("TMDB returned {}", response.status())));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MetadataError::Lookup(e.to_string()))?;

        let first = match body.get("results").and_then(|r| r.as_array()).and_then(|a| a.first()) {
            Some(first) => first,
            None => return Ok(None),
        };

        let mut patch = MetadataPatch::default();
        patch.title = first
            .get("title")
            .or_else(|| first.get("name"))
            .and_then(|v| v.as_str())
            .map(String::from);
        patch.year = first
            .get("release_date")
            .or_else(|| first.get("first_air_date"))
            .and_then(|v| v.as_str())
            .and_then(|date| date.get(..4))
            .and_then(|year| year.parse().ok());
        Ok(if patch.is_empty() { None } else { Some(patch) })
    }
}

/// Thin TVDB v4 search client; inactive without a bearer token
pub struct TvdbProvider {
    client: reqwest::Client,
    token: Option<String>,
}

impl TvdbProvider {
    pub fn new(token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, token }
    }
}

#[async_trait]
impl MetadataProvider for TvdbProvider {
    fn name(&self) -> &'static str {
        "tvdb"
    }

    async fn lookup(&self, item: &MediaItem) -> Result<Option<MetadataPatch>, MetadataError> {
        let Some(token) = &self.token else {
            return Err(MetadataError::NotConfigured);
        };
        let query = item.show_title.as_deref().unwrap_or(item.title.as_str());
        let url = format!(
            "https://api4.thetvdb.com/v4/search?query={}&type=series",
            urlencoding::encode(query)
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| MetadataError::Lookup(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MetadataError::Lookup(format!("TVDB returned {}", response.status())));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MetadataError::Lookup(e.to_string()))?;

        let first = match body.get("data").and_then(|d| d.as_array()).and_then(|a| a.first()) {
            Some(first) => first,
            None => return Ok(None),
        };

        let mut patch = MetadataPatch::default();
        patch.show_title = first.get("name").and_then(|v| v.as_str()).map(String::from);
        patch.year = first
            .get("year")
            .and_then(|v| v.as_str())
            .and_then(|year| year.parse().ok());
        if let Some(genres) = first.get("genres").and_then(|v| v.as_array()) {
            let list: Vec<String> = genres
                .iter()
                .filter_map(|g| g.as_str().map(String::from))
                .collect();
            if !list.is_empty() {
                patch.genres = Some(list);
            }
        }
        Ok(if patch.is_empty() { None } else { Some(patch) })
    }
}

/// Per-cycle counts handed over by the EPG job for early-warning checks
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub programmes: usize,
    pub missing_episode_num: usize,
    pub missing_year: usize,
    pub placeholder_titles: usize,
}

/// The provider chain plus health tracking
pub struct MetadataPipeline {
    providers: Vec<Arc<dyn MetadataProvider>>,
    successes: AtomicU64,
    failures: AtomicU64,
    confidence: DashMap<i32, f64>,
    prior_failure_ratio: Mutex<Option<f64>>,
}

impl MetadataPipeline {
    /// Standard chain order: TVDB, TMDB, NFO, filename
    pub fn new(tvdb_token: Option<String>, tmdb_api_key: Option<String>) -> Self {
        Self::with_providers(vec![
            Arc::new(TvdbProvider::new(tvdb_token)),
            Arc::new(TmdbProvider::new(tmdb_api_key)),
            Arc::new(NfoProvider),
            Arc::new(FilenameProvider),
        ])
    }

    pub fn with_providers(providers: Vec<Arc<dyn MetadataProvider>>) -> Self {
        Self {
            providers,
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            confidence: DashMap::new(),
            prior_failure_ratio: Mutex::new(None),
        }
    }

    /// Run the chain for one item, merging fields first-wins.
    ///
    /// Unconfigured providers are skipped without touching the counters.
    pub async fn enrich(&self, item: &MediaItem) -> MetadataPatch {
        let item_id = item.id.unwrap_or(0);
        let mut merged = MetadataPatch::default();

        for provider in &self.providers {
            match provider.lookup(item).await {
                Ok(Some(patch)) => {
                    self.successes.fetch_add(1, Ordering::Relaxed);
                    metrics::epg::METADATA_LOOKUP_SUCCESS.inc();
                    self.raise_confidence(item_id);
                    merged.absorb(patch);
                }
                Ok(None) => {}
                Err(MetadataError::NotConfigured) => {}
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    metrics::epg::METADATA_LOOKUP_FAILURE.inc();
                    self.decay_confidence(item_id);
                    tracing::debug!(
                        provider = provider.name(),
                        item = item_id,
                        "metadata lookup failed: {}",
                        e
                    );
                }
            }
        }
        merged
    }

    fn raise_confidence(&self, item_id: i32) {
        let mut entry = self.confidence.entry(item_id).or_insert(0.5);
        *entry = (*entry + CONFIDENCE_GAIN).min(1.0);
    }

    fn decay_confidence(&self, item_id: i32) {
        let mut entry = self.confidence.entry(item_id).or_insert(0.5);
        *entry = (*entry * CONFIDENCE_DECAY).max(CONFIDENCE_FLOOR);
    }

    /// Confidence for an item, defaulting to the neutral midpoint
    pub fn confidence(&self, item_id: i32) -> f64 {
        self.confidence.get(&item_id).map(|c| *c).unwrap_or(0.5)
    }

    pub fn failure_ratio(&self) -> f64 {
        let successes = self.successes.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let total = successes + failures;
        if total == 0 {
            0.0
        } else {
            failures as f64 / total as f64
        }
    }

    /// Once-per-EPG-cycle drift check: a failure-ratio rise above the
    /// threshold emits one structured warning. Returns the delta when it
    /// fired.
    pub fn check_drift(&self) -> Option<f64> {
        let current = self.failure_ratio();
        let mut prior = self.prior_failure_ratio.lock().expect("drift lock poisoned");
        let fired = match *prior {
            Some(previous) if current - previous > DRIFT_THRESHOLD => {
                tracing::warn!(
                    previous_ratio = previous,
                    current_ratio = current,
                    "metadata failure ratio drifted upward"
                );
                Some(current - previous)
            }
            _ => None,
        };
        *prior = Some(current);
        fired
    }

    /// Early-warning signals, one structured log per cycle rather than one
    /// per programme
    pub fn report_cycle(&self, stats: &CycleStats) {
        if stats.programmes == 0 {
            return;
        }
        let total = stats.programmes as f64;

        if stats.missing_episode_num as f64 / total > 0.05 {
            tracing::warn!(
                missing = stats.missing_episode_num,
                programmes = stats.programmes,
                "more than 5% of programmes missing episode numbers"
            );
        }
        if stats.missing_year as f64 / total > 0.05 {
            tracing::warn!(
                missing = stats.missing_year,
                programmes = stats.programmes,
                "more than 5% of programmes missing a year"
            );
        }
        if stats.placeholder_titles > 10 {
            tracing::warn!(
                placeholders = stats.placeholder_titles,
                "more than 10 programmes using placeholder titles"
            );
        }
        let ratio = self.failure_ratio();
        if ratio > 0.3 {
            tracing::warn!(failure_ratio = ratio, "metadata failure ratio above 0.3");
        }
    }
}
