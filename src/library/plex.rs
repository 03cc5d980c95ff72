//! Plex library adapter
//!
//! Resolves Plex-backed items to token-bearing direct-play URLs. Token URLs
//! expire server-side, so entries carry a 2 hour TTL and get proactively
//! refreshed by the cache front-end at 80% of that. The section listing is
//! warmed at startup so the first tune does not pay for a library walk.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{LibraryResolver, PlayableUrl, ResolveError};
use crate::db::{MediaItem, SourceKind};

/// Token URLs are re-issued well before Plex's own expiry
const PLEX_URL_TTL: Duration = Duration::from_secs(2 * 3600);

/// Request timeout for Plex API calls
const PLEX_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// One library section from `/library/sections`
#[derive(Debug, Clone, Deserialize)]
pub struct PlexSection {
    pub key: String,
    pub title: String,
    #[serde(rename = "type")]
    pub section_type: String,
}

#[derive(Debug, Deserialize)]
struct SectionsContainer {
    #[serde(rename = "MediaContainer")]
    media_container: SectionsInner,
}

#[derive(Debug, Deserialize)]
struct SectionsInner {
    #[serde(rename = "Directory", default)]
    directory: Vec<PlexSection>,
}

/// Resolves Plex media parts to direct-play URLs
pub struct PlexResolver {
    client: reqwest::Client,
    base_url: String,
    token: String,
    /// Optional section scoping; items outside the section are refused
    section: Option<String>,
}

impl PlexResolver {
    pub fn new(base_url: String, token: String, section: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PLEX_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            section,
        }
    }

    /// Fetch the section listing once at startup.
    ///
    /// Failure is logged, not fatal: resolution still works, only the first
    /// tune pays the extra round trip.
    pub async fn warm_sections(&self) -> Result<Vec<PlexSection>, ResolveError> {
        let url = format!(
            "{}/library/sections?X-Plex-Token={}",
            self.base_url,
            urlencoding::encode(&self.token)
        );
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ResolveError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ResolveError::Unreachable(format!(
                "Plex sections returned {}",
                response.status()
            )));
        }

        let container: SectionsContainer = response
            .json()
            .await
            .map_err(|e| ResolveError::Unreachable(format!("bad sections payload: {}", e)))?;

        let sections = container.media_container.directory;
        tracing::info!(count = sections.len(), "warmed Plex section cache");
        Ok(sections)
    }

    /// Build the direct-play URL for a media part key.
    ///
    /// `source_id` holds the part key (e.g. `/library/parts/1234/file.mkv`).
    fn part_url(&self, part_key: &str) -> String {
        let key = if part_key.starts_with('/') {
            part_key.to_string()
        } else {
            format!("/{}", part_key)
        };
        format!(
            "{}{}?X-Plex-Token={}",
            self.base_url,
            key,
            urlencoding::encode(&self.token)
        )
    }
}

#[async_trait]
impl LibraryResolver for PlexResolver {
    fn source_kind(&self) -> SourceKind {
        SourceKind::Plex
    }

    async fn resolve(&self, item: &MediaItem) -> Result<PlayableUrl, ResolveError> {
        if let Some(section) = &self.section {
            // Section scoping: items record their section in provider metadata
            let in_section = item
                .provider_metadata
                .as_deref()
                .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
                .and_then(|v| v.get("section").and_then(|s| s.as_str().map(String::from)))
                .map(|s| &s == section)
                .unwrap_or(true);
            if !in_section {
                return Err(ResolveError::MissingLibrary(format!(
                    "item {} is outside the configured section {}",
                    item.source_id, section
                )));
            }
        }

        Ok(PlayableUrl::expiring(
            self.part_url(&item.source_id),
            PLEX_URL_TTL,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_url_carries_token() {
        let resolver = PlexResolver::new(
            "http://plex.local:32400/".to_string(),
            "tok en".to_string(),
            None,
        );
        let url = resolver.part_url("/library/parts/99/file.mkv");
        assert_eq!(
            url,
            "http://plex.local:32400/library/parts/99/file.mkv?X-Plex-Token=tok%20en"
        );
    }

    #[test]
    fn test_part_url_normalizes_missing_slash() {
        let resolver =
            PlexResolver::new("http://plex.local:32400".to_string(), "t".to_string(), None);
        let url = resolver.part_url("library/parts/99/file.mkv");
        assert!(url.starts_with("http://plex.local:32400/library/parts/99"));
    }

    #[tokio::test]
    async fn test_plex_ttl_is_two_hours() {
        let resolver =
            PlexResolver::new("http://plex.local:32400".to_string(), "t".to_string(), None);
        let item = MediaItem {
            id: Some(1),
            source: "plex".to_string(),
            source_id: "/library/parts/1/movie.mkv".to_string(),
            url: String::new(),
            title: "Movie".to_string(),
            duration_seconds: 5400,
            show_title: None,
            season: None,
            episode: None,
            year: None,
            genres: None,
            provider_metadata: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let playable = resolver.resolve(&item).await.unwrap();
        assert_eq!(playable.ttl, Some(Duration::from_secs(7200)));
    }

    #[tokio::test]
    async fn test_out_of_section_item_is_refused() {
        let resolver = PlexResolver::new(
            "http://plex.local:32400".to_string(),
            "t".to_string(),
            Some("2".to_string()),
        );
        let item = MediaItem {
            id: Some(1),
            source: "plex".to_string(),
            source_id: "/library/parts/1/movie.mkv".to_string(),
            url: String::new(),
            title: "Movie".to_string(),
            duration_seconds: 5400,
            show_title: None,
            season: None,
            episode: None,
            year: None,
            genres: None,
            provider_metadata: Some(r#"{"section":"7"}"#.to_string()),
            created_at: String::new(),
            updated_at: String::new(),
        };
        let err = resolver.resolve(&item).await.unwrap_err();
        assert!(matches!(err, ResolveError::MissingLibrary(_)));
    }
}
