//! HDHomeRun Emulation Module
//!
//! Implements the tuner appliance identity Plex discovers and tunes
//! against: device discovery, the channel lineup, and lineup status. The
//! identity is stable across restarts (hostname-hashed DeviceID) and every
//! URL handed back to a client is derived from the request's Host header so
//! the appliance works from any interface it is reached on.

use diesel::prelude::*;
use regex::Regex;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;

use crate::db::{normalize_channel_number, schema, Channel, DbPooledConnection};

/// DeviceIDs are exactly 8 uppercase hex characters
static DEVICE_ID_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-F]{8}$").expect("device id regex"));

/// Deterministic fallback when a configured DeviceID fails validation
pub const DEVICE_ID_FALLBACK: &str = "E5E17001";

/// Advertised tuner model
const MODEL_NUMBER: &str = "HDTC-2US";

/// HDHomeRun discovery response
///
/// Returned by GET /discover.json. Uses PascalCase for HDHomeRun protocol
/// compatibility.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoverResponse {
    pub friendly_name: String,
    pub model_number: String,
    pub firmware_name: String,
    pub firmware_version: String,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    pub device_auth: String,
    #[serde(rename = "BaseURL")]
    pub base_url: String,
    #[serde(rename = "LineupURL")]
    pub lineup_url: String,
    #[serde(rename = "GuideURL")]
    pub guide_url: String,
    pub tuner_count: u32,
}

/// HDHomeRun channel lineup entry
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct LineupEntry {
    pub guide_number: String,
    pub guide_name: String,
    #[serde(rename = "URL")]
    pub url: String,
}

/// HDHomeRun lineup status response
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct LineupStatusResponse {
    pub scan_in_progress: u8,
    pub scan_possible: u8,
    pub source: String,
    pub source_list: Vec<String>,
}

/// Generate a stable DeviceID from the machine hostname.
///
/// The same machine always produces the same 8 hex characters, so Plex
/// keeps recognizing the tuner across restarts.
pub fn generate_device_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "telecast".to_string());

    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!("{:08X}", hasher.finish() as u32)
}

/// Validate a configured DeviceID, normalizing invalid values to the
/// deterministic fallback with a warning.
pub fn normalize_device_id(configured: Option<&str>) -> String {
    match configured {
        None => generate_device_id(),
        Some(raw) => {
            let candidate = raw.trim().to_uppercase();
            if DEVICE_ID_SHAPE.is_match(&candidate) {
                candidate
            } else {
                tracing::warn!(
                    configured = raw,
                    fallback = DEVICE_ID_FALLBACK,
                    "configured DeviceID is not 8 hex characters, using fallback"
                );
                DEVICE_ID_FALLBACK.to_string()
            }
        }
    }
}

/// The LAN address used when a request's Host header is unusable
pub fn get_local_ip() -> String {
    local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// Derive the externally-reachable base URL for a request.
///
/// Loopback hosts are rewritten to the LAN address: a lineup URL of
/// `http://127.0.0.1/...` would send Plex (possibly on another machine)
/// to itself.
pub fn derive_base_url(host_header: Option<&str>, port: u16) -> String {
    match host_header {
        Some(host) if !host.trim().is_empty() => {
            let trimmed = host.trim();
            let hostname = trimmed
                .rsplit_once(':')
                .map(|(name, _)| name)
                .unwrap_or(trimmed);
            if hostname == "localhost" || hostname == "127.0.0.1" || hostname == "[::1]" {
                format!("http://{}:{}", get_local_ip(), port)
            } else {
                format!("http://{}", trimmed)
            }
        }
        _ => format!("http://{}:{}", get_local_ip(), port),
    }
}

/// Generate the discovery response
pub fn generate_discover_response(
    base_url: &str,
    configured_device_id: Option<&str>,
    tuner_count: u32,
) -> DiscoverResponse {
    DiscoverResponse {
        friendly_name: "Telecast".to_string(),
        model_number: MODEL_NUMBER.to_string(),
        firmware_name: "hdhomeruntc_atsc".to_string(),
        firmware_version: "20200101".to_string(),
        device_id: normalize_device_id(configured_device_id),
        device_auth: "telecast".to_string(),
        base_url: base_url.to_string(),
        lineup_url: format!("{}/lineup.json", base_url),
        guide_url: format!("{}/epg.xml", base_url),
        tuner_count,
    }
}

/// Enabled channels ordered by number, for lineup/playlist/EPG agreement
pub fn enabled_channels(conn: &mut DbPooledConnection) -> QueryResult<Vec<Channel>> {
    use schema::channels::dsl;
    dsl::channels
        .filter(dsl::enabled.eq(1))
        .order(dsl::number.asc())
        .load::<Channel>(conn)
}

/// Generate the channel lineup.
///
/// GuideNumbers are the stored channel-number strings; duplicates are
/// skipped with a warning so the emitted lineup is always unique.
pub fn generate_lineup(
    conn: &mut DbPooledConnection,
    base_url: &str,
) -> QueryResult<Vec<LineupEntry>> {
    let channels = enabled_channels(conn)?;
    let mut seen: HashSet<String> = HashSet::new();
    let mut lineup = Vec::with_capacity(channels.len());

    for channel in channels {
        if !seen.insert(channel.number.clone()) {
            tracing::warn!(number = %channel.number, "duplicate channel number skipped in lineup");
            continue;
        }
        lineup.push(LineupEntry {
            guide_number: channel.number.clone(),
            guide_name: channel.name,
            url: format!("{}/iptv/channel/{}.ts", base_url, channel.number),
        });
    }
    Ok(lineup)
}

/// Static lineup status: scanning is meaningless for a virtual lineup
pub fn generate_lineup_status() -> LineupStatusResponse {
    LineupStatusResponse {
        scan_in_progress: 0,
        scan_possible: 0,
        source: "Cable".to_string(),
        source_list: vec!["Cable".to_string()],
    }
}

/// Extract the channel number from a tune target.
///
/// Accepts `auto:v7`, `v7`, or a bare number, with arbitrary surrounding
/// whitespace; decimal numbers stay strings and are never integer-parsed.
pub fn parse_tune_target(raw: &str) -> String {
    let stripped = normalize_channel_number(raw);
    let without_auto = stripped.strip_prefix("auto:").unwrap_or(&stripped);
    let number = without_auto
        .strip_prefix('v')
        .unwrap_or(without_auto);
    normalize_channel_number(number)
}

/// Look up a channel by its (whitespace-stripped) number string
pub fn find_channel_by_number(
    conn: &mut DbPooledConnection,
    raw_number: &str,
) -> QueryResult<Option<Channel>> {
    use schema::channels::dsl;
    let number = normalize_channel_number(raw_number);
    dsl::channels
        .filter(dsl::number.eq(number))
        .first::<Channel>(conn)
        .optional()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_shape() {
        let id = generate_device_id();
        assert!(DEVICE_ID_SHAPE.is_match(&id), "bad device id: {}", id);
    }

    #[test]
    fn test_device_id_is_stable() {
        assert_eq!(generate_device_id(), generate_device_id());
    }

    #[test]
    fn test_valid_configured_device_id_kept() {
        assert_eq!(normalize_device_id(Some("0A1B2C3D")), "0A1B2C3D");
        // Lowercase input is normalized, not rejected
        assert_eq!(normalize_device_id(Some("0a1b2c3d")), "0A1B2C3D");
    }

    #[test]
    fn test_invalid_configured_device_id_falls_back() {
        assert_eq!(normalize_device_id(Some("hello")), DEVICE_ID_FALLBACK);
        assert_eq!(normalize_device_id(Some("0A1B2C3")), DEVICE_ID_FALLBACK);
        assert_eq!(normalize_device_id(Some("0A1B2C3DF")), DEVICE_ID_FALLBACK);
        assert_eq!(normalize_device_id(Some("")), DEVICE_ID_FALLBACK);
    }

    #[test]
    fn test_discover_response_pascal_case() {
        let response = generate_discover_response("http://10.0.0.2:5004", Some("0A1B2C3D"), 4);
        let json = serde_json::to_string(&response).unwrap();

        assert!(json.contains("\"FriendlyName\":\"Telecast\""));
        assert!(json.contains("\"DeviceID\":\"0A1B2C3D\""));
        assert!(json.contains("\"BaseURL\":\"http://10.0.0.2:5004\""));
        assert!(json.contains("\"LineupURL\":\"http://10.0.0.2:5004/lineup.json\""));
        assert!(json.contains("\"GuideURL\":\"http://10.0.0.2:5004/epg.xml\""));
        assert!(json.contains("\"TunerCount\":4"));
    }

    #[test]
    fn test_base_url_uses_host_header() {
        assert_eq!(
            derive_base_url(Some("10.1.2.3:5004"), 5004),
            "http://10.1.2.3:5004"
        );
    }

    #[test]
    fn test_base_url_rewrites_loopback() {
        let derived = derive_base_url(Some("127.0.0.1:5004"), 5004);
        assert!(!derived.contains("127.0.0.1") || get_local_ip() == "127.0.0.1");
        let derived = derive_base_url(Some("localhost:5004"), 5004);
        assert!(!derived.contains("localhost"));
    }

    #[test]
    fn test_tune_target_parsing() {
        assert_eq!(parse_tune_target("auto:v7"), "7");
        assert_eq!(parse_tune_target("  auto:v1984.1  "), "1984.1");
        assert_eq!(parse_tune_target("v12"), "12");
        assert_eq!(parse_tune_target(" 42 "), "42");
    }

    #[test]
    fn test_tune_target_keeps_decimal_channel_numbers() {
        // Round-trip property: a stored decimal number survives the parse
        let stored = "1984.1";
        assert_eq!(parse_tune_target(&format!("auto:v{}", stored)), stored);
        assert_eq!(parse_tune_target(&format!("\tauto:v{} \n", stored)), stored);
    }

    #[test]
    fn test_lineup_status_static_values() {
        let status = generate_lineup_status();
        assert_eq!(status.scan_in_progress, 0);
        assert_eq!(status.scan_possible, 0);
        assert_eq!(status.source_list, vec!["Cable"]);
    }
}
