//! Telecast: a virtual IPTV broadcaster.
//!
//! Synthesizes continuous scheduled television channels from on-demand
//! media sources (local files, Plex/Jellyfin libraries, YouTube,
//! Archive.org, direct HTTP) and serves them as live MPEG-TS. To Plex it
//! looks like a networked HDHomeRun tuner; to IPTV players it is an M3U
//! playlist with an XMLTV guide.

pub mod agent;
pub mod broadcast;
pub mod config;
pub mod credentials;
pub mod db;
pub mod epg;
pub mod library;
pub mod metadata;
pub mod metrics;
pub mod playout;
pub mod scheduler;
pub mod server;
pub mod transcode;
