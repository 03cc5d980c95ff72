//! Library adapters and URL resolution
//!
//! Every media source is represented by a [`LibraryResolver`] that turns a
//! [`MediaItem`] into a playable URL plus the TTL appropriate to its source.
//! The [`UrlResolver`] front-end owns the TTL cache, schedules proactive
//! refreshes at 80% of an entry's TTL, and retries synchronous misses with
//! exponential backoff and jitter.

pub mod cache;
pub mod jellyfin;
pub mod local;
pub mod plex;
pub mod youtube;

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::db::{MediaItem, SourceKind};
use cache::UrlCache;

/// Maximum synchronous re-resolve attempts on a cache miss
const MAX_RESOLVE_ATTEMPTS: u32 = 5;

/// Base delay for the exponential backoff between attempts
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Errors surfaced by resolution
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no resolver registered for source '{0}'")]
    UnknownSource(String),

    #[error("source unreachable: {0}")]
    Unreachable(String),

    #[error("resolved URL rejected upstream (expired token): {0}")]
    Expired(String),

    #[error("extractor failed: {0}")]
    ExtractorFailed(String),

    #[error("library is not configured: {0}")]
    MissingLibrary(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A resolved, immediately-playable URL
#[derive(Debug, Clone)]
pub struct PlayableUrl {
    pub url: String,
    /// `None` means the URL never expires
    pub ttl: Option<Duration>,
}

impl PlayableUrl {
    pub fn permanent(url: String) -> Self {
        Self { url, ttl: None }
    }

    pub fn expiring(url: String, ttl: Duration) -> Self {
        Self { url, ttl: Some(ttl) }
    }
}

/// Capability interface each source implements
#[async_trait]
pub trait LibraryResolver: Send + Sync {
    /// Which `source` tag this resolver serves
    fn source_kind(&self) -> SourceKind;

    /// Resolve an item to a playable URL with its TTL
    async fn resolve(&self, item: &MediaItem) -> Result<PlayableUrl, ResolveError>;
}

/// Front-end over the resolver registry and the TTL cache
pub struct UrlResolver {
    registry: Arc<HashMap<SourceKind, Arc<dyn LibraryResolver>>>,
    cache: Arc<UrlCache>,
}

impl UrlResolver {
    pub fn new(resolvers: Vec<Arc<dyn LibraryResolver>>) -> Self {
        let mut registry: HashMap<SourceKind, Arc<dyn LibraryResolver>> = HashMap::new();
        for resolver in resolvers {
            registry.insert(resolver.source_kind(), resolver);
        }
        Self {
            registry: Arc::new(registry),
            cache: Arc::new(UrlCache::default()),
        }
    }

    pub fn cache(&self) -> Arc<UrlCache> {
        self.cache.clone()
    }

    /// Resolve an item to a playable URL.
    ///
    /// Cache hits return immediately; an entry past 80% of its TTL
    /// additionally kicks off a background refresh. Misses resolve
    /// synchronously with bounded retries.
    pub async fn resolve_playable(&self, item: &MediaItem) -> Result<String, ResolveError> {
        if let Some((url, wants_refresh)) = self.cache.get(&item.source, &item.source_id) {
            if wants_refresh {
                self.spawn_refresh(item.clone());
            }
            return Ok(url);
        }

        let playable = self.resolve_with_retries(item).await?;
        self.cache
            .insert(&item.source, &item.source_id, playable.url.clone(), playable.ttl);
        Ok(playable.url)
    }

    /// Drop the cached URL for an item (after an upstream 401/403/410) and
    /// resolve it once more.
    pub async fn invalidate_and_resolve(&self, item: &MediaItem) -> Result<String, ResolveError> {
        self.cache.invalidate(&item.source, &item.source_id);
        self.resolve_playable(item).await
    }

    fn resolver_for(&self, item: &MediaItem) -> Result<Arc<dyn LibraryResolver>, ResolveError> {
        self.registry
            .get(&item.source_kind())
            .cloned()
            .ok_or_else(|| ResolveError::UnknownSource(item.source.clone()))
    }

    async fn resolve_with_retries(&self, item: &MediaItem) -> Result<PlayableUrl, ResolveError> {
        let resolver = self.resolver_for(item)?;

        let mut last_err = None;
        for attempt in 0..MAX_RESOLVE_ATTEMPTS {
            match resolver.resolve(item).await {
                Ok(playable) => return Ok(playable),
                Err(ResolveError::MissingLibrary(msg)) => {
                    // Configuration problems do not heal by retrying
                    return Err(ResolveError::MissingLibrary(msg));
                }
                Err(e) => {
                    tracing::warn!(
                        source = %item.source,
                        source_id = %item.source_id,
                        attempt = attempt + 1,
                        "URL resolution failed: {}",
                        e
                    );
                    last_err = Some(e);
                    if attempt + 1 < MAX_RESOLVE_ATTEMPTS {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            ResolveError::Unreachable("resolution failed with no error recorded".to_string())
        }))
    }

    /// Refresh an aging entry off the request path.
    ///
    /// On failure the stale entry stays in place until hard expiration.
    fn spawn_refresh(&self, item: MediaItem) {
        let registry = self.registry.clone();
        let cache = self.cache.clone();
        tokio::spawn(async move {
            let resolver = match registry.get(&item.source_kind()) {
                Some(resolver) => resolver.clone(),
                None => return,
            };
            match resolver.resolve(&item).await {
                Ok(playable) => {
                    cache.insert(&item.source, &item.source_id, playable.url, playable.ttl);
                    tracing::debug!(
                        source = %item.source,
                        source_id = %item.source_id,
                        "proactively refreshed resolved URL"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        source = %item.source,
                        source_id = %item.source_id,
                        "proactive refresh failed, keeping stale entry: {}",
                        e
                    );
                }
            }
        });
    }
}

/// Build the resolver set from the configured libraries.
///
/// Local, direct-HTTP, Archive.org, and YouTube resolvers are always
/// present; Plex/Jellyfin/Emby resolvers come from enabled `libraries`
/// rows with their tokens decrypted at startup.
pub fn build_resolvers(
    conn: &mut crate::db::DbPooledConnection,
    credentials: &crate::credentials::CredentialManager,
) -> Vec<Arc<dyn LibraryResolver>> {
    use crate::db::schema::libraries::dsl;
    use diesel::prelude::*;

    let mut resolvers: Vec<Arc<dyn LibraryResolver>> = vec![
        Arc::new(local::LocalResolver),
        Arc::new(local::HttpResolver::direct()),
        Arc::new(local::HttpResolver::archive_org()),
        Arc::new(youtube::YoutubeResolver::new()),
    ];

    let rows: Vec<crate::db::Library> = match dsl::libraries
        .filter(dsl::enabled.eq(1))
        .load(conn)
    {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!("library table unavailable, media-server sources disabled: {}", e);
            return resolvers;
        }
    };

    for library in rows {
        let Some(base_url) = library.base_url.clone().filter(|u| !u.is_empty()) else {
            tracing::warn!(library = %library.name, "library has no base URL, skipped");
            continue;
        };
        let token = library
            .token_encrypted
            .as_deref()
            .and_then(|blob| credentials.decrypt(blob).ok())
            .unwrap_or_default();

        match library.kind.parse::<SourceKind>() {
            Ok(SourceKind::Plex) => {
                let resolver = Arc::new(plex::PlexResolver::new(
                    base_url,
                    token,
                    library.section.clone(),
                ));
                // Warm the section listing so the first tune skips the
                // library walk; failure only costs that head start
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let warm = resolver.clone();
                    handle.spawn(async move {
                        if let Err(e) = warm.warm_sections().await {
                            tracing::warn!("Plex section warmup failed: {}", e);
                        }
                    });
                }
                resolvers.push(resolver);
            }
            Ok(SourceKind::Jellyfin) => {
                resolvers.push(Arc::new(jellyfin::JellyfinResolver::jellyfin(base_url, token)));
            }
            Ok(SourceKind::Emby) => {
                resolvers.push(Arc::new(jellyfin::JellyfinResolver::emby(base_url, token)));
            }
            _ => {
                tracing::warn!(
                    library = %library.name,
                    kind = %library.kind,
                    "library kind has no resolver"
                );
            }
        }
    }

    resolvers
}

/// Exponential backoff with jitter: base * 2^attempt, +-25%
fn backoff_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE_DELAY.as_millis() as u64 * 2u64.saturating_pow(attempt);
    let jitter = rand::thread_rng().gen_range(0.75..1.25);
    Duration::from_millis((base as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_item(source: &str, source_id: &str) -> MediaItem {
        MediaItem {
            id: Some(1),
            source: source.to_string(),
            source_id: source_id.to_string(),
            url: "/media/test.mkv".to_string(),
            title: "Test".to_string(),
            duration_seconds: 1800,
            show_title: None,
            season: None,
            episode: None,
            year: None,
            genres: None,
            provider_metadata: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    /// Resolver that fails a configured number of times before succeeding
    struct FlakyResolver {
        failures_remaining: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LibraryResolver for FlakyResolver {
        fn source_kind(&self) -> SourceKind {
            SourceKind::Http
        }

        async fn resolve(&self, item: &MediaItem) -> Result<PlayableUrl, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ResolveError::Unreachable("try again".to_string()));
            }
            Ok(PlayableUrl::permanent(item.url.clone()))
        }
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let resolver = Arc::new(FlakyResolver {
            failures_remaining: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        let front = Arc::new(UrlResolver::new(vec![resolver.clone()]));

        let url = front.resolve_playable(&test_item("http", "x")).await.unwrap();
        assert_eq!(url, "/media/test.mkv");
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let resolver = Arc::new(FlakyResolver {
            failures_remaining: AtomicU32::new(u32::MAX),
            calls: AtomicU32::new(0),
        });
        let front = Arc::new(UrlResolver::new(vec![resolver.clone()]));

        let err = front
            .resolve_playable(&test_item("http", "y"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Unreachable(_)));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), MAX_RESOLVE_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_second_lookup_hits_cache() {
        let resolver = Arc::new(FlakyResolver {
            failures_remaining: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        });
        let front = Arc::new(UrlResolver::new(vec![resolver.clone()]));

        let item = test_item("http", "z");
        front.resolve_playable(&item).await.unwrap();
        front.resolve_playable(&item).await.unwrap();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_source_is_rejected() {
        let front = Arc::new(UrlResolver::new(vec![]));
        let err = front
            .resolve_playable(&test_item("plex", "k"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::UnknownSource(_)));
    }

    #[test]
    fn test_backoff_grows_with_attempts() {
        // Jitter is +-25%, so attempt 3 (2000ms nominal) always exceeds
        // attempt 0 (250ms nominal)
        let early = backoff_delay(0);
        let late = backoff_delay(3);
        assert!(late > early);
    }
}
