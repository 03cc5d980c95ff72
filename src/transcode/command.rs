//! Transcoder command construction
//!
//! Builds the exact ffmpeg argument vector for a playable URL. Two paths:
//! smart copy for pre-recorded H.264 + AAC/MP3 sources, re-encode for
//! everything else. Both end in the same tuned MPEG-TS muxer writing to
//! stdout.
//!
//! The copy path MUST carry `h264_mp4toannexb,dump_extra`: the first filter
//! rewrites length-prefixed NAL units to start-code form, the second
//! re-emits SPS/PPS on every keyframe. Dropping either breaks seeking and
//! thumbnails in Plex.

use std::time::Duration;

use super::probe::{Accelerator, ProbeResult};
use crate::db::{FfmpegProfile, SourceKind, TranscodeMode, Watermark};

/// PCR interval in milliseconds; short for tight A/V sync on live tuners
const PCR_PERIOD_MS: &str = "20";

/// Mux queue headroom for corrupt-ish inputs
const MAX_MUXING_QUEUE: &str = "1024";

/// Default video bitrate when a channel has no transcode profile
const DEFAULT_VIDEO_KBPS: i32 = 4000;
const DEFAULT_AUDIO_KBPS: i32 = 192;

/// Whether the command copies or re-encodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Copy,
    Transcode,
}

/// A fully built transcoder invocation
#[derive(Debug, Clone)]
pub struct TranscodePlan {
    pub args: Vec<String>,
    pub mode: StreamMode,
    /// First-byte deadline appropriate to the source
    pub cold_start_timeout: Duration,
}

/// Per-channel knobs consumed by the builder
#[derive(Debug, Clone, Default)]
pub struct ChannelEncoding {
    pub transcode_mode: Option<TranscodeMode>,
    pub profile: Option<FfmpegProfile>,
    pub watermark: Option<Watermark>,
    pub preferred_audio_language: Option<String>,
    pub burn_subtitles: bool,
}

/// First-byte expectations differ wildly by source: local files are
/// instant, Plex has transcoder warmup
pub fn cold_start_timeout_for(source: SourceKind) -> Duration {
    match source {
        SourceKind::Local => Duration::from_secs(1),
        SourceKind::Youtube => Duration::from_secs(10),
        SourceKind::Plex => Duration::from_secs(60),
        SourceKind::ArchiveOrg => Duration::from_secs(45),
        SourceKind::Jellyfin | SourceKind::Emby => Duration::from_secs(30),
        SourceKind::Http => Duration::from_secs(30),
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Sources that are files rather than live feeds need the real-time pacing
/// flag, otherwise ffmpeg reads the whole file as fast as the disk allows
/// and downstream buffers explode
fn is_prerecorded(source: SourceKind) -> bool {
    !matches!(source, SourceKind::Http)
}

/// Build the streaming invocation for one item
pub fn build_stream_command(
    input_url: &str,
    source: SourceKind,
    probe: &ProbeResult,
    encoding: &ChannelEncoding,
    accelerator: Accelerator,
) -> TranscodePlan {
    let mode = decide_mode(source, probe, encoding);

    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "warning".into()];

    if is_prerecorded(source) {
        args.push("-re".into());
    }

    // Corruption tolerance: regenerate missing PTS, drop corrupt packets,
    // ignore invalid DTS, keep decoding through minor errors
    args.extend([
        "-fflags".into(),
        "+genpts+discardcorrupt+igndts".into(),
        "-err_detect".into(),
        "ignore_err".into(),
    ]);

    if is_http_url(input_url) {
        args.extend([
            "-reconnect".into(),
            "1".into(),
            "-reconnect_at_eof".into(),
            "1".into(),
            "-reconnect_streamed".into(),
            "1".into(),
            "-reconnect_delay_max".into(),
            "5".into(),
        ]);
    }

    // Hardware decode only when the codec family tolerates it
    if mode == StreamMode::Transcode && !probe.needs_software_decode() {
        if let Some(hwaccel) = accelerator.hwaccel_flag() {
            args.extend(["-hwaccel".into(), hwaccel.into()]);
        }
    }

    args.extend(["-i".into(), input_url.to_string()]);

    if let Some(lang) = &encoding.preferred_audio_language {
        args.extend([
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            format!("0:a:m:language:{}?", lang),
            "-map".into(),
            "0:a:0?".into(),
        ]);
    }

    let (video_kbps, audio_kbps) = match &encoding.profile {
        Some(profile) => (profile.video_bitrate_kbps, profile.audio_bitrate_kbps),
        None => (DEFAULT_VIDEO_KBPS, DEFAULT_AUDIO_KBPS),
    };

    match mode {
        StreamMode::Copy => {
            args.extend([
                "-c:v".into(),
                "copy".into(),
                "-c:a".into(),
                "copy".into(),
                // Annex B conversion + parameter set repetition; both
                // mandatory for H.264 copy into MPEG-TS
                "-bsf:v".into(),
                "h264_mp4toannexb,dump_extra".into(),
            ]);
        }
        StreamMode::Transcode => {
            args.extend([
                "-c:v".into(),
                accelerator.h264_encoder().into(),
                "-b:v".into(),
                format!("{}k", video_kbps),
                "-maxrate".into(),
                format!("{}k", video_kbps),
                "-bufsize".into(),
                format!("{}k", video_kbps * 2),
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                format!("{}k", audio_kbps),
            ]);

            if let Some(profile) = &encoding.profile {
                if let (Some(width), Some(height)) = (profile.width, profile.height) {
                    args.extend(["-vf".into(), format!("scale={}:{}", width, height)]);
                }
                if let Some(framerate) = profile.framerate {
                    args.extend(["-r".into(), framerate.to_string()]);
                }
            }

            if let Some(watermark) = &encoding.watermark {
                // Watermark overlay replaces any scale filter; the overlay
                // chain carries its own scaling
                let position = match watermark.corner.as_str() {
                    "top_left" => "10:10",
                    "bottom_left" => "10:main_h-overlay_h-10",
                    "bottom_right" => "main_w-overlay_w-10:main_h-overlay_h-10",
                    _ => "main_w-overlay_w-10:10",
                };
                let filter = format!(
                    "movie={}[wm];[in][wm]overlay={}[out]",
                    watermark.image_path, position
                );
                if let Some(index) = args.iter().position(|a| a == "-vf") {
                    args.remove(index);
                    args.remove(index);
                }
                args.extend(["-vf".into(), filter]);
            }
        }
    }

    // MPEG-TS muxer tuning: fixed mux rate above the stream bitrate, short
    // PCR period, immediate flushing, no interleave buffering
    let muxrate_kbps = (video_kbps + audio_kbps) * 2;
    args.extend([
        "-f".into(),
        "mpegts".into(),
        "-mpegts_flags".into(),
        "+resend_headers+initial_discontinuity".into(),
        "-muxrate".into(),
        format!("{}k", muxrate_kbps),
        "-pcr_period".into(),
        PCR_PERIOD_MS.into(),
        "-flush_packets".into(),
        "1".into(),
        "-max_interleave_delta".into(),
        "0".into(),
        "-max_muxing_queue_size".into(),
        MAX_MUXING_QUEUE.into(),
        "pipe:1".into(),
    ]);

    TranscodePlan {
        args,
        mode,
        cold_start_timeout: cold_start_timeout_for(source),
    }
}

fn decide_mode(source: SourceKind, probe: &ProbeResult, encoding: &ChannelEncoding) -> StreamMode {
    match encoding.transcode_mode {
        Some(TranscodeMode::Always) => return StreamMode::Transcode,
        Some(TranscodeMode::CopyOnly) => return StreamMode::Copy,
        Some(TranscodeMode::OnDemand) | None => {}
    }
    // Watermarks and burned subtitles force the encode path
    if encoding.watermark.is_some() || encoding.burn_subtitles {
        return StreamMode::Transcode;
    }
    if is_prerecorded(source) && probe.is_ts_copy_compatible() {
        StreamMode::Copy
    } else {
        StreamMode::Transcode
    }
}

/// Build a short "no programming" or error slate: black video, silence, and
/// a centered message, muxed exactly like real content
pub fn build_slate_command(message: &str, seconds: u32) -> Vec<String> {
    let sanitized = message.replace('\'', "\u{2019}").replace(':', "\\:");
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "lavfi".into(),
        "-i".into(),
        format!("color=c=black:s=1280x720:r=25:d={}", seconds),
        "-f".into(),
        "lavfi".into(),
        "-i".into(),
        format!("anullsrc=channel_layout=stereo:sample_rate=48000:d={}", seconds),
        "-vf".into(),
        format!(
            "drawtext=text='{}':fontcolor=white:fontsize=48:x=(w-text_w)/2:y=(h-text_h)/2",
            sanitized
        ),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "ultrafast".into(),
        "-c:a".into(),
        "aac".into(),
        "-shortest".into(),
        "-f".into(),
        "mpegts".into(),
        "-mpegts_flags".into(),
        "+resend_headers+initial_discontinuity".into(),
        "-flush_packets".into(),
        "1".into(),
        "pipe:1".into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn copy_probe() -> ProbeResult {
        ProbeResult {
            video_codec: Some("h264".to_string()),
            audio_codec: Some("aac".to_string()),
            container: Some("mov,mp4,m4a".to_string()),
        }
    }

    fn hevc_probe() -> ProbeResult {
        ProbeResult {
            video_codec: Some("hevc".to_string()),
            audio_codec: Some("ac3".to_string()),
            container: None,
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_copy_mode_for_prerecorded_h264_aac() {
        let plan = build_stream_command(
            "/media/movie.mp4",
            SourceKind::Local,
            &copy_probe(),
            &ChannelEncoding::default(),
            Accelerator::Software,
        );
        assert_eq!(plan.mode, StreamMode::Copy);
        assert!(has_pair(&plan.args, "-c:v", "copy"));
    }

    #[test]
    fn test_copy_mode_carries_annexb_and_dump_extra() {
        let plan = build_stream_command(
            "/media/movie.mp4",
            SourceKind::Local,
            &copy_probe(),
            &ChannelEncoding::default(),
            Accelerator::Software,
        );
        assert!(has_pair(&plan.args, "-bsf:v", "h264_mp4toannexb,dump_extra"));
    }

    #[test]
    fn test_live_http_source_never_copies_blind() {
        // Live feeds are not pre-recorded: no -re, transcode decision
        let plan = build_stream_command(
            "http://feed.example/stream",
            SourceKind::Http,
            &copy_probe(),
            &ChannelEncoding::default(),
            Accelerator::Software,
        );
        assert!(!plan.args.contains(&"-re".to_string()));
        assert_eq!(plan.mode, StreamMode::Transcode);
    }

    #[test]
    fn test_prerecorded_sources_get_realtime_pacing() {
        let plan = build_stream_command(
            "/media/movie.mp4",
            SourceKind::Local,
            &copy_probe(),
            &ChannelEncoding::default(),
            Accelerator::Software,
        );
        assert!(plan.args.contains(&"-re".to_string()));
    }

    #[test]
    fn test_corruption_tolerance_flags_always_present() {
        for (url, source) in [
            ("/media/a.mp4", SourceKind::Local),
            ("http://feed.example/s", SourceKind::Http),
        ] {
            let plan = build_stream_command(
                url,
                source,
                &hevc_probe(),
                &ChannelEncoding::default(),
                Accelerator::Software,
            );
            assert!(has_pair(&plan.args, "-fflags", "+genpts+discardcorrupt+igndts"));
            assert!(has_pair(&plan.args, "-err_detect", "ignore_err"));
        }
    }

    #[test]
    fn test_http_sources_get_reconnect_flags() {
        let plan = build_stream_command(
            "https://archive.example/reel.mp4",
            SourceKind::ArchiveOrg,
            &copy_probe(),
            &ChannelEncoding::default(),
            Accelerator::Software,
        );
        assert!(has_pair(&plan.args, "-reconnect", "1"));
        assert!(has_pair(&plan.args, "-reconnect_at_eof", "1"));
        assert!(has_pair(&plan.args, "-reconnect_streamed", "1"));
        assert!(has_pair(&plan.args, "-reconnect_delay_max", "5"));
    }

    #[test]
    fn test_local_paths_skip_reconnect_flags() {
        let plan = build_stream_command(
            "/media/a.mp4",
            SourceKind::Local,
            &copy_probe(),
            &ChannelEncoding::default(),
            Accelerator::Software,
        );
        assert!(!plan.args.contains(&"-reconnect".to_string()));
    }

    #[test]
    fn test_mpegts_muxer_tuning() {
        let plan = build_stream_command(
            "/media/a.mp4",
            SourceKind::Local,
            &copy_probe(),
            &ChannelEncoding::default(),
            Accelerator::Software,
        );
        assert!(has_pair(&plan.args, "-f", "mpegts"));
        assert!(has_pair(&plan.args, "-pcr_period", "20"));
        assert!(has_pair(&plan.args, "-flush_packets", "1"));
        assert!(has_pair(&plan.args, "-max_interleave_delta", "0"));
        assert_eq!(plan.args.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    fn test_mpeg4_forces_software_decode_on_hw_accelerator() {
        let probe = ProbeResult {
            video_codec: Some("mpeg4".to_string()),
            audio_codec: Some("mp3".to_string()),
            container: None,
        };
        let plan = build_stream_command(
            "http://feed.example/old.avi",
            SourceKind::Http,
            &probe,
            &ChannelEncoding::default(),
            Accelerator::Nvenc,
        );
        // Encode may still use the hw encoder, but decode must be software
        assert!(!plan.args.contains(&"-hwaccel".to_string()));
        assert!(has_pair(&plan.args, "-c:v", "h264_nvenc"));
    }

    #[test]
    fn test_copy_only_channel_never_transcodes() {
        let encoding = ChannelEncoding {
            transcode_mode: Some(TranscodeMode::CopyOnly),
            ..Default::default()
        };
        let plan = build_stream_command(
            "http://feed.example/s",
            SourceKind::Http,
            &hevc_probe(),
            &encoding,
            Accelerator::Software,
        );
        assert_eq!(plan.mode, StreamMode::Copy);
    }

    #[test]
    fn test_watermark_forces_transcode_with_overlay() {
        let encoding = ChannelEncoding {
            watermark: Some(Watermark {
                id: Some(1),
                name: "bug".to_string(),
                image_path: "/assets/bug.png".to_string(),
                corner: "bottom_right".to_string(),
                opacity_percent: 100,
                width_percent: 15,
            }),
            ..Default::default()
        };
        let plan = build_stream_command(
            "/media/a.mp4",
            SourceKind::Local,
            &copy_probe(),
            &encoding,
            Accelerator::Software,
        );
        assert_eq!(plan.mode, StreamMode::Transcode);
        assert!(plan.args.iter().any(|a| a.contains("overlay=")));
    }

    #[test]
    fn test_cold_start_timeouts_by_source() {
        assert_eq!(cold_start_timeout_for(SourceKind::Local), Duration::from_secs(1));
        assert_eq!(cold_start_timeout_for(SourceKind::Youtube), Duration::from_secs(10));
        assert_eq!(cold_start_timeout_for(SourceKind::Plex), Duration::from_secs(60));
        assert_eq!(cold_start_timeout_for(SourceKind::ArchiveOrg), Duration::from_secs(45));
    }

    #[test]
    fn test_slate_command_is_mpegts_to_stdout() {
        let args = build_slate_command("No programming", 4);
        assert!(args.iter().any(|a| a.contains("drawtext")));
        assert!(args.contains(&"mpegts".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    fn test_slate_message_quotes_are_sanitized() {
        // A raw apostrophe inside the message would terminate the drawtext
        // quoting; it is swapped for a typographic one
        let args = build_slate_command("Channel's off", 4);
        let drawtext = args.iter().find(|a| a.contains("drawtext")).unwrap();
        assert!(!drawtext.contains("Channel's"));
        assert!(drawtext.contains("Channel\u{2019}s"));
    }
}
