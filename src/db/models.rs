use diesel::prelude::*;
use std::fmt;
use std::str::FromStr;

use crate::db::schema::{
    channels, ffmpeg_profiles, filler_presets, libraries, media_items, playlist_items, playlists,
    playouts, program_schedule_items, program_schedules, watermarks,
};

/// Error for enum columns holding an unrecognized value
#[derive(Debug, thiserror::Error)]
#[error("unrecognized {kind} value: {value}")]
pub struct EnumParseError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = EnumParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(EnumParseError {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum! {
    /// Wire format of a channel's live output
    StreamingMode {
        TransportStream => "transport_stream",
        TransportStreamHybrid => "transport_stream_hybrid",
    }
}

text_enum! {
    /// When the channel re-encodes instead of copying
    TranscodeMode {
        OnDemand => "on_demand",
        Always => "always",
        CopyOnly => "copy_only",
    }
}

text_enum! {
    /// Subtitle handling for a channel
    SubtitleMode {
        None => "none",
        Embed => "embed",
        Burn => "burn",
    }
}

text_enum! {
    /// What the broadcaster does when the last client detaches
    IdleBehavior {
        StopOnDisconnect => "stop_on_disconnect",
        KeepRunning => "keep_running",
    }
}

text_enum! {
    /// Origin of a media item
    SourceKind {
        Local => "local",
        Plex => "plex",
        Jellyfin => "jellyfin",
        Emby => "emby",
        Youtube => "youtube",
        ArchiveOrg => "archive_org",
        Http => "http",
    }
}

text_enum! {
    /// How a playlist's item set is defined
    CollectionType {
        Manual => "manual",
        Smart => "smart",
        Static => "static",
    }
}

text_enum! {
    /// Whether a schedule slot starts dynamically or at a committed wall-clock time
    StartType {
        Dynamic => "dynamic",
        Fixed => "fixed",
    }
}

text_enum! {
    /// Item ordering within a slot's collection
    PlaybackOrder {
        Chronological => "chronological",
        Shuffle => "shuffle",
        Random => "random",
        RotatingShuffle => "rotating_shuffle",
    }
}

text_enum! {
    /// How many items a slot plays before advancing
    PlayoutMode {
        One => "one",
        Multiple => "multiple",
        Duration => "duration",
        Flood => "flood",
    }
}

text_enum! {
    /// Role of a filler preset
    FillerKind {
        PreRoll => "pre_roll",
        MidRoll => "mid_roll",
        PostRoll => "post_roll",
        Tail => "tail",
        Fallback => "fallback",
    }
}

/// Normalize a channel number for storage and lookup.
///
/// Channel numbers are strings and may contain a decimal (`"1984.1"`); they
/// are never parsed as integers. Surrounding whitespace is stripped; the
/// interior is left untouched.
pub fn normalize_channel_number(raw: &str) -> String {
    raw.trim().to_string()
}

/// Channel model for querying existing channels
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = channels)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Channel {
    pub id: Option<i32>,
    pub number: String,
    pub name: String,
    pub enabled: i32,
    pub group_name: Option<String>,
    pub logo: Option<String>,
    pub streaming_mode: String,
    pub transcode_mode: String,
    pub ffmpeg_profile_id: Option<i32>,
    pub watermark_id: Option<i32>,
    pub preferred_audio_language: Option<String>,
    pub preferred_subtitle_language: Option<String>,
    pub subtitle_mode: String,
    pub idle_behavior: String,
    pub fallback_filler_id: Option<i32>,
    pub show_in_epg: i32,
    pub prewarm: i32,
    pub auto_restart_eligible: i32,
    pub created_at: String,
    pub updated_at: String,
}

impl Channel {
    pub fn is_enabled(&self) -> bool {
        self.enabled != 0
    }

    pub fn idle_behavior(&self) -> IdleBehavior {
        self.idle_behavior
            .parse()
            .unwrap_or(IdleBehavior::StopOnDisconnect)
    }

    pub fn transcode_mode(&self) -> TranscodeMode {
        self.transcode_mode.parse().unwrap_or(TranscodeMode::OnDemand)
    }

    pub fn wants_prewarm(&self) -> bool {
        self.prewarm != 0
    }

    /// Whether the health supervisor may restart this channel when stale.
    /// Disabling this leaves recovery entirely to a manual enable/disable.
    pub fn is_auto_restart_eligible(&self) -> bool {
        self.auto_restart_eligible != 0
    }
}

/// New channel model for inserting records
#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = channels)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewChannel {
    pub number: String,
    pub name: String,
    pub enabled: i32,
    pub streaming_mode: String,
    pub transcode_mode: String,
    pub subtitle_mode: String,
    pub idle_behavior: String,
    pub show_in_epg: i32,
    pub prewarm: i32,
    pub auto_restart_eligible: i32,
}

impl NewChannel {
    pub fn new(number: impl AsRef<str>, name: impl Into<String>) -> Self {
        Self {
            number: normalize_channel_number(number.as_ref()),
            name: name.into(),
            enabled: 1,
            streaming_mode: StreamingMode::TransportStream.to_string(),
            transcode_mode: TranscodeMode::OnDemand.to_string(),
            subtitle_mode: SubtitleMode::None.to_string(),
            idle_behavior: IdleBehavior::StopOnDisconnect.to_string(),
            show_in_epg: 1,
            prewarm: 0,
            auto_restart_eligible: 1,
        }
    }
}

/// Media item model
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = media_items)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct MediaItem {
    pub id: Option<i32>,
    pub source: String,
    pub source_id: String,
    pub url: String,
    pub title: String,
    pub duration_seconds: i32,
    pub show_title: Option<String>,
    pub season: Option<i32>,
    pub episode: Option<i32>,
    pub year: Option<i32>,
    pub genres: Option<String>,
    pub provider_metadata: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl MediaItem {
    pub fn source_kind(&self) -> SourceKind {
        self.source.parse().unwrap_or(SourceKind::Local)
    }
}

/// New media item model for inserting records
#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = media_items)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewMediaItem {
    pub source: String,
    pub source_id: String,
    pub url: String,
    pub title: String,
    pub duration_seconds: i32,
    pub show_title: Option<String>,
    pub season: Option<i32>,
    pub episode: Option<i32>,
    pub year: Option<i32>,
}

/// Playlist (collection) model
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = playlists)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Playlist {
    pub id: Option<i32>,
    pub name: String,
    pub collection_type: String,
    pub search_query: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Playlist item model
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = playlist_items)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PlaylistItem {
    pub id: Option<i32>,
    pub playlist_id: i32,
    pub media_item_id: i32,
    pub position: i32,
    pub in_point_seconds: Option<i32>,
    pub out_point_seconds: Option<i32>,
    pub enabled: i32,
}

/// Program schedule model
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = program_schedules)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ProgramSchedule {
    pub id: Option<i32>,
    pub name: String,
    pub keep_multi_part_episodes_together: i32,
    pub treat_collections_as_shows: i32,
    pub shuffle_schedule_items: i32,
    pub random_start_point: i32,
    pub created_at: String,
    pub updated_at: String,
}

/// Schedule slot model
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = program_schedule_items)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ProgramScheduleItem {
    pub id: Option<i32>,
    pub schedule_id: i32,
    pub slot_index: i32,
    pub start_type: String,
    pub fixed_start_time: Option<String>,
    pub collection_kind: String,
    pub collection_id: i32,
    pub playback_order: String,
    pub playout_mode: String,
    pub multiple_count: Option<i32>,
    pub duration_seconds: Option<i32>,
    pub pre_roll_filler_id: Option<i32>,
    pub mid_roll_filler_id: Option<i32>,
    pub post_roll_filler_id: Option<i32>,
    pub tail_filler_id: Option<i32>,
    pub fallback_filler_id: Option<i32>,
    pub custom_title: Option<String>,
    pub guide_mode: String,
}

impl ProgramScheduleItem {
    pub fn start_type(&self) -> StartType {
        self.start_type.parse().unwrap_or(StartType::Dynamic)
    }

    pub fn playback_order(&self) -> PlaybackOrder {
        self.playback_order
            .parse()
            .unwrap_or(PlaybackOrder::Chronological)
    }

    pub fn playout_mode(&self) -> PlayoutMode {
        self.playout_mode.parse().unwrap_or(PlayoutMode::Flood)
    }
}

/// Playout anchor model
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = playouts)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Playout {
    pub id: Option<i32>,
    pub channel_id: i32,
    pub schedule_id: i32,
    pub last_item_index: i32,
    pub last_item_end_wallclock: String,
    pub enumerator_state: Option<String>,
    pub is_active: i32,
    pub updated_at: String,
}

/// New playout anchor for first schedule assignment
#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = playouts)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewPlayout {
    pub channel_id: i32,
    pub schedule_id: i32,
    pub last_item_index: i32,
    pub last_item_end_wallclock: String,
    pub enumerator_state: Option<String>,
    pub is_active: i32,
}

/// Changeset advancing the playout anchor
#[derive(AsChangeset, Debug)]
#[diesel(table_name = playouts)]
pub struct PlayoutAdvance {
    pub last_item_index: i32,
    pub last_item_end_wallclock: String,
    pub enumerator_state: Option<String>,
    pub updated_at: String,
}

/// Filler preset model
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = filler_presets)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct FillerPreset {
    pub id: Option<i32>,
    pub name: String,
    pub kind: String,
    pub collection_kind: String,
    pub collection_id: i32,
}

/// Library (media source credentials) model
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = libraries)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Library {
    pub id: Option<i32>,
    pub name: String,
    pub kind: String,
    pub base_url: Option<String>,
    pub token_encrypted: Option<Vec<u8>>,
    pub section: Option<String>,
    pub enabled: i32,
    pub created_at: String,
    pub updated_at: String,
}

/// Transcode profile model
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = ffmpeg_profiles)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct FfmpegProfile {
    pub id: Option<i32>,
    pub name: String,
    pub video_bitrate_kbps: i32,
    pub audio_bitrate_kbps: i32,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub framerate: Option<i32>,
}

/// Watermark overlay model
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = watermarks)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Watermark {
    pub id: Option<i32>,
    pub name: String,
    pub image_path: String,
    pub corner: String,
    pub opacity_percent: i32,
    pub width_percent: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_number_normalization_strips_whitespace() {
        assert_eq!(normalize_channel_number("  7 "), "7");
        assert_eq!(normalize_channel_number("\t1984.1\n"), "1984.1");
    }

    #[test]
    fn test_channel_number_keeps_decimal_form() {
        // Decimal numbers survive untouched; they are never int-parsed
        assert_eq!(normalize_channel_number("1984.1"), "1984.1");
        assert_eq!(normalize_channel_number("007"), "007");
    }

    #[test]
    fn test_source_kind_round_trip() {
        for kind in [
            SourceKind::Local,
            SourceKind::Plex,
            SourceKind::Jellyfin,
            SourceKind::Emby,
            SourceKind::Youtube,
            SourceKind::ArchiveOrg,
            SourceKind::Http,
        ] {
            assert_eq!(kind.as_str().parse::<SourceKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_playout_mode_round_trip() {
        for mode in [
            PlayoutMode::One,
            PlayoutMode::Multiple,
            PlayoutMode::Duration,
            PlayoutMode::Flood,
        ] {
            assert_eq!(mode.as_str().parse::<PlayoutMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_unknown_enum_value_is_an_error() {
        let err = "betamax".parse::<StreamingMode>().unwrap_err();
        assert!(err.to_string().contains("betamax"));
    }

    #[test]
    fn test_channel_defaults() {
        let channel = NewChannel::new(" 12.5 ", "Retro Movies");
        assert_eq!(channel.number, "12.5");
        assert_eq!(channel.enabled, 1);
        assert_eq!(channel.idle_behavior, "stop_on_disconnect");
        // Supervised recovery is opt-out, not opt-in
        assert_eq!(channel.auto_restart_eligible, 1);
    }
}
