//! YouTube adapter
//!
//! Stream URLs come out of the `yt-dlp` extractor, which can take seconds;
//! the subprocess runs through `tokio::process` so the broadcast loop never
//! blocks on it. Extracted CDN URLs are signed and expire, hence the 6 hour
//! TTL.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::{LibraryResolver, PlayableUrl, ResolveError};
use crate::db::{MediaItem, SourceKind};

const YOUTUBE_URL_TTL: Duration = Duration::from_secs(6 * 3600);

/// Hard deadline on the extractor subprocess
const EXTRACTOR_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves YouTube video ids through the `yt-dlp` extractor
pub struct YoutubeResolver {
    extractor_bin: String,
}

impl YoutubeResolver {
    pub fn new() -> Self {
        Self {
            extractor_bin: "yt-dlp".to_string(),
        }
    }

    #[cfg(test)]
    fn with_binary(bin: &str) -> Self {
        Self {
            extractor_bin: bin.to_string(),
        }
    }

    async fn extract(&self, video_url: &str) -> Result<String, ResolveError> {
        let mut child = Command::new(&self.extractor_bin)
            .args(["-g", "-f", "best[protocol^=http]", "--no-playlist", video_url])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ResolveError::ExtractorFailed(format!("spawn failed: {}", e)))?;

        let mut stdout = child.stdout.take().ok_or_else(|| {
            ResolveError::ExtractorFailed("extractor stdout unavailable".to_string())
        })?;

        let output = tokio::time::timeout(EXTRACTOR_TIMEOUT, async {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((buf, status))
        })
        .await
        .map_err(|_| ResolveError::ExtractorFailed("extractor timed out".to_string()))?
        .map_err(ResolveError::Io)?;

        let (buf, status) = output;
        if !status.success() {
            return Err(ResolveError::ExtractorFailed(format!(
                "extractor exited with {}",
                status
            )));
        }

        // Extractor output may carry stray bytes; decode with replacement
        let text = String::from_utf8_lossy(&buf);
        let url = text
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with("http"))
            .ok_or_else(|| {
                ResolveError::ExtractorFailed("extractor produced no URL".to_string())
            })?;

        Ok(url.to_string())
    }
}

impl Default for YoutubeResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LibraryResolver for YoutubeResolver {
    fn source_kind(&self) -> SourceKind {
        SourceKind::Youtube
    }

    async fn resolve(&self, item: &MediaItem) -> Result<PlayableUrl, ResolveError> {
        let video_url = if item.url.starts_with("http") {
            item.url.clone()
        } else {
            format!("https://www.youtube.com/watch?v={}", item.source_id)
        };

        let stream_url = self.extract(&video_url).await?;
        Ok(PlayableUrl::expiring(stream_url, YOUTUBE_URL_TTL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(source_id: &str, url: &str) -> MediaItem {
        MediaItem {
            id: Some(1),
            source: "youtube".to_string(),
            source_id: source_id.to_string(),
            url: url.to_string(),
            title: "Clip".to_string(),
            duration_seconds: 300,
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

    #[tokio::test]
    async fn test_missing_extractor_binary_fails_cleanly() {
        let resolver = YoutubeResolver::with_binary("definitely-not-a-real-extractor");
        let err = resolver
            .resolve(&item("dQw4w9WgXcQ", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::ExtractorFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fake_extractor_output_is_parsed() {
        use std::os::unix::fs::PermissionsExt;

        // A stub extractor that prints a CDN URL and exits 0
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("fake-extractor");
        std::fs::write(&stub, "#!/bin/sh\necho 'https://cdn.example/video.m3u8'\n").unwrap();
        std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();

        let resolver = YoutubeResolver::with_binary(stub.to_str().unwrap());
        let playable = resolver
            .resolve(&item("dQw4w9WgXcQ", ""))
            .await
            .unwrap();
        assert_eq!(playable.url, "https://cdn.example/video.m3u8");
        assert_eq!(playable.ttl, Some(Duration::from_secs(21600)));
    }
}
