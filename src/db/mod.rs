pub mod connection;
pub mod models;
pub mod schema;

pub use connection::{
    establish_connection, pool_size_for, prepare_db_path, run_migrations, DbConnection, DbPool,
    DbPooledConnection,
};
pub use models::{
    normalize_channel_number, Channel, CollectionType, FfmpegProfile, FillerKind, FillerPreset,
    IdleBehavior, Library, MediaItem, NewChannel, NewMediaItem, NewPlayout, PlaybackOrder,
    Playlist, PlaylistItem, Playout, PlayoutAdvance, PlayoutMode, ProgramSchedule,
    ProgramScheduleItem, SourceKind, StartType, StreamingMode, SubtitleMode, TranscodeMode,
    Watermark,
};
