//! Local file and direct-HTTP resolvers
//!
//! Both produce permanent URLs: local paths cannot expire, and direct HTTP
//! sources (Archive.org page-linked media, plain `.ts` endpoints) are passed
//! through after a reachability check.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use super::{LibraryResolver, PlayableUrl, ResolveError};
use crate::db::{MediaItem, SourceKind};

/// Reachability probe timeout for direct HTTP sources
const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves local files to `file://` URLs with forward-slash paths
pub struct LocalResolver;

/// Normalize a filesystem path to forward slashes for the transcoder
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

#[async_trait]
impl LibraryResolver for LocalResolver {
    fn source_kind(&self) -> SourceKind {
        SourceKind::Local
    }

    async fn resolve(&self, item: &MediaItem) -> Result<PlayableUrl, ResolveError> {
        let normalized = normalize_path(&item.url);
        if !Path::new(&normalized).exists() {
            return Err(ResolveError::Unreachable(format!(
                "local file missing: {}",
                normalized
            )));
        }
        Ok(PlayableUrl::permanent(normalized))
    }
}

/// Passes direct HTTP URLs through after verifying reachability
pub struct HttpResolver {
    client: reqwest::Client,
    kind: SourceKind,
}

impl HttpResolver {
    pub fn new(kind: SourceKind) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, kind }
    }

    /// Resolver for plain HTTP sources
    pub fn direct() -> Self {
        Self::new(SourceKind::Http)
    }

    /// Resolver for Archive.org page-linked media (same pass-through shape)
    pub fn archive_org() -> Self {
        Self::new(SourceKind::ArchiveOrg)
    }
}

#[async_trait]
impl LibraryResolver for HttpResolver {
    fn source_kind(&self) -> SourceKind {
        self.kind
    }

    async fn resolve(&self, item: &MediaItem) -> Result<PlayableUrl, ResolveError> {
        // A malformed URL fails here with a clear message instead of a
        // confusing transcoder error later
        let parsed = url::Url::parse(&item.url)
            .map_err(|e| ResolveError::Unreachable(format!("bad URL {}: {}", item.url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ResolveError::Unreachable(format!(
                "unsupported scheme in {}",
                item.url
            )));
        }

        let response = self
            .client
            .head(&item.url)
            .send()
            .await
            .map_err(|e| ResolveError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 || status.as_u16() == 410 {
            return Err(ResolveError::Expired(format!("{} from {}", status, item.url)));
        }
        // Some hosts reject HEAD; anything that is not an auth failure or a
        // server error counts as reachable
        if status.is_server_error() {
            return Err(ResolveError::Unreachable(format!(
                "{} from {}",
                status, item.url
            )));
        }

        Ok(PlayableUrl::permanent(item.url.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backslashes_become_forward_slashes() {
        assert_eq!(
            normalize_path("C:\\media\\shows\\pilot.mkv"),
            "C:/media/shows/pilot.mkv"
        );
    }

    #[test]
    fn test_forward_slash_path_unchanged() {
        assert_eq!(normalize_path("/media/shows/pilot.mkv"), "/media/shows/pilot.mkv");
    }

    #[tokio::test]
    async fn test_missing_local_file_is_unreachable() {
        let resolver = LocalResolver;
        let item = MediaItem {
            id: Some(1),
            source: "local".to_string(),
            source_id: "/no/such/file.mkv".to_string(),
            url: "/no/such/file.mkv".to_string(),
            title: "Missing".to_string(),
            duration_seconds: 0,
            show_title: None,
            season: None,
            episode: None,
            year: None,
            genres: None,
            provider_metadata: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let err = resolver.resolve(&item).await.unwrap_err();
        assert!(matches!(err, ResolveError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_existing_local_file_resolves_permanently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("show.mkv");
        std::fs::write(&path, b"x").unwrap();

        let resolver = LocalResolver;
        let item = MediaItem {
            id: Some(1),
            source: "local".to_string(),
            source_id: path.to_string_lossy().to_string(),
            url: path.to_string_lossy().to_string(),
            title: "Show".to_string(),
            duration_seconds: 0,
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
        assert!(playable.ttl.is_none());
    }
}
