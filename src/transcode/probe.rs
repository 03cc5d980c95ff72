//! Input probing and encoder detection
//!
//! The stream probe runs `ffprobe` with a small probe window so HTTP inputs
//! reach first byte quickly. Hardware encoder selection never trusts the OS
//! version: each candidate encoder proves itself with a 100 ms test encode
//! at startup, and the winner is cached until explicitly invalidated.

use serde::Deserialize;
use std::process::Stdio;
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Probe window kept small to minimize time-to-first-byte on HTTP sources
const PROBE_SIZE: &str = "500000";
const ANALYZE_DURATION: &str = "500000";

/// Deadline for the ffprobe subprocess
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for one encoder test encode
const ENCODER_TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe spawn failed: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("probe timed out")]
    Timeout,

    #[error("probe produced unparseable output: {0}")]
    BadOutput(String),
}

/// Codec facts about an input
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub container: Option<String>,
}

impl ProbeResult {
    /// H.264 video with AAC or MP3 audio can be remuxed into MPEG-TS
    /// without re-encoding
    pub fn is_ts_copy_compatible(&self) -> bool {
        let video_ok = matches!(self.video_codec.as_deref(), Some("h264"));
        let audio_ok = matches!(self.audio_codec.as_deref(), Some("aac") | Some("mp3"));
        video_ok && audio_ok
    }

    /// MPEG-4 family codecs are known-broken on hardware decoders and must
    /// fall back to software decode
    pub fn needs_software_decode(&self) -> bool {
        matches!(
            self.video_codec.as_deref(),
            Some("mpeg4") | Some("msmpeg4v2") | Some("msmpeg4v3")
        )
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
}

/// Probe an input URL with a short window
pub async fn probe_input(url: &str) -> Result<ProbeResult, ProbeError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-probesize",
            PROBE_SIZE,
            "-analyzeduration",
            ANALYZE_DURATION,
            "-show_entries",
            "stream=codec_type,codec_name",
            "-show_entries",
            "format=format_name",
            "-of",
            "json",
            url,
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(PROBE_TIMEOUT, output)
        .await
        .map_err(|_| ProbeError::Timeout)??;

    // ffprobe output can carry stray bytes on exotic inputs
    let text = String::from_utf8_lossy(&output.stdout);
    let parsed: FfprobeOutput =
        serde_json::from_str(&text).map_err(|e| ProbeError::BadOutput(e.to_string()))?;

    let mut result = ProbeResult {
        container: parsed.format.and_then(|f| f.format_name),
        ..Default::default()
    };
    for stream in parsed.streams {
        match stream.codec_type.as_deref() {
            Some("video") if result.video_codec.is_none() => {
                result.video_codec = stream.codec_name;
            }
            Some("audio") if result.audio_codec.is_none() => {
                result.audio_codec = stream.codec_name;
            }
            _ => {}
        }
    }
    Ok(result)
}

/// Hardware accelerator families, ordered by preference at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accelerator {
    VideoToolbox,
    Nvenc,
    Vaapi,
    Software,
}

impl Accelerator {
    /// The H.264 encoder name this accelerator exposes
    pub fn h264_encoder(&self) -> &'static str {
        match self {
            Self::VideoToolbox => "h264_videotoolbox",
            Self::Nvenc => "h264_nvenc",
            Self::Vaapi => "h264_vaapi",
            Self::Software => "libx264",
        }
    }

    /// `-hwaccel` input flag, if the accelerator has one
    pub fn hwaccel_flag(&self) -> Option<&'static str> {
        match self {
            Self::VideoToolbox => Some("videotoolbox"),
            Self::Nvenc => Some("cuda"),
            Self::Vaapi => Some("vaapi"),
            Self::Software => None,
        }
    }
}

/// Cached accelerator choice; probed once, re-probed only on invalidation
pub struct AcceleratorSelection {
    selected: RwLock<Option<Accelerator>>,
    candidates: Vec<Accelerator>,
}

impl AcceleratorSelection {
    pub fn new(candidates: Vec<Accelerator>) -> Self {
        Self {
            selected: RwLock::new(None),
            candidates,
        }
    }

    /// Platform-default candidate order ending in software
    pub fn platform_default() -> Self {
        let mut candidates = Vec::new();
        if cfg!(target_os = "macos") {
            candidates.push(Accelerator::VideoToolbox);
        } else {
            candidates.push(Accelerator::Nvenc);
            candidates.push(Accelerator::Vaapi);
        }
        candidates.push(Accelerator::Software);
        Self::new(candidates)
    }

    /// The working accelerator, probing candidates on first call
    pub async fn get(&self) -> Accelerator {
        if let Some(accel) = *self.selected.read().expect("accelerator lock poisoned") {
            return accel;
        }
        let accel = self.probe_candidates().await;
        *self.selected.write().expect("accelerator lock poisoned") = Some(accel);
        accel
    }

    /// Force a re-probe on the next `get`
    pub fn invalidate(&self) {
        *self.selected.write().expect("accelerator lock poisoned") = None;
    }

    async fn probe_candidates(&self) -> Accelerator {
        for candidate in &self.candidates {
            if *candidate == Accelerator::Software {
                return Accelerator::Software;
            }
            if encoder_works(candidate.h264_encoder()).await {
                tracing::info!(encoder = candidate.h264_encoder(), "selected hardware encoder");
                return *candidate;
            }
            tracing::debug!(
                encoder = candidate.h264_encoder(),
                "encoder test failed, trying next candidate"
            );
        }
        Accelerator::Software
    }
}

/// Spawn a 100 ms test encode to prove an encoder actually works
async fn encoder_works(encoder: &str) -> bool {
    let result = Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "lavfi",
            "-i",
            "testsrc=duration=0.1:size=128x72:rate=25",
            "-c:v",
            encoder,
            "-f",
            "null",
            "-",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();

    match tokio::time::timeout(ENCODER_TEST_TIMEOUT, result).await {
        Ok(Ok(status)) => status.success(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_h264_aac_is_copy_compatible() {
        let probe = ProbeResult {
            video_codec: Some("h264".to_string()),
            audio_codec: Some("aac".to_string()),
            container: Some("mov,mp4,m4a".to_string()),
        };
        assert!(probe.is_ts_copy_compatible());
    }

    #[test]
    fn test_h264_mp3_is_copy_compatible() {
        let probe = ProbeResult {
            video_codec: Some("h264".to_string()),
            audio_codec: Some("mp3".to_string()),
            container: None,
        };
        assert!(probe.is_ts_copy_compatible());
    }

    #[test]
    fn test_hevc_requires_transcode() {
        let probe = ProbeResult {
            video_codec: Some("hevc".to_string()),
            audio_codec: Some("aac".to_string()),
            container: None,
        };
        assert!(!probe.is_ts_copy_compatible());
    }

    #[test]
    fn test_ac3_audio_requires_transcode() {
        let probe = ProbeResult {
            video_codec: Some("h264".to_string()),
            audio_codec: Some("ac3".to_string()),
            container: None,
        };
        assert!(!probe.is_ts_copy_compatible());
    }

    #[test]
    fn test_mpeg4_forces_software_decode() {
        let probe = ProbeResult {
            video_codec: Some("mpeg4".to_string()),
            audio_codec: None,
            container: None,
        };
        assert!(probe.needs_software_decode());
    }

    #[test]
    fn test_accelerator_encoder_names() {
        assert_eq!(Accelerator::Software.h264_encoder(), "libx264");
        assert_eq!(Accelerator::Nvenc.h264_encoder(), "h264_nvenc");
        assert!(Accelerator::Software.hwaccel_flag().is_none());
    }

    #[tokio::test]
    async fn test_software_candidate_short_circuits() {
        // Software never needs a test encode, so selection is immediate
        let selection = AcceleratorSelection::new(vec![Accelerator::Software]);
        assert_eq!(selection.get().await, Accelerator::Software);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reprobe() {
        let selection = AcceleratorSelection::new(vec![Accelerator::Software]);
        let _ = selection.get().await;
        selection.invalidate();
        assert!(selection.selected.read().unwrap().is_none());
        assert_eq!(selection.get().await, Accelerator::Software);
    }

    #[test]
    fn test_ffprobe_json_shape_parses() {
        let raw = r#"{
            "streams": [
                {"codec_type": "video", "codec_name": "h264"},
                {"codec_type": "audio", "codec_name": "aac"}
            ],
            "format": {"format_name": "mpegts"}
        }"#;
        let parsed: FfprobeOutput = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.streams.len(), 2);
        assert_eq!(parsed.format.unwrap().format_name.as_deref(), Some("mpegts"));
    }
}
