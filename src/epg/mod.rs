//! XMLTV EPG generation
//!
//! Emits the guide for all enabled channels over a sliding horizon. Wall
//! clock times are reassigned sequentially (each programme starts where the
//! previous one stopped, anchored at the playout anchor) so upstream
//! overlaps can never reach the document. Every document is validated
//! before emit; a failed validation keeps the prior cycle's output.

pub mod titles;

use chrono::{DateTime, Datelike, Utc};
use diesel::prelude::*;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::RwLock;
use thiserror::Error;

use crate::db::{schema, Channel, DbPool};
use crate::metrics;
use crate::playout::schedule::PlannedItem;
use crate::playout::PlayoutEngine;
use titles::{episode_num_xmltv, resolve_title};

/// Errors raised by EPG generation
#[derive(Debug, Error)]
pub enum EpgError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("XML write error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("XML write error: {0}")]
    Io(#[from] std::io::Error),
}

/// One guide channel
#[derive(Debug, Clone)]
pub struct XmltvChannel {
    /// Channel id in the document; the channel number string
    pub id: String,
    pub display_name: String,
    pub icon: Option<String>,
}

/// One guide programme with resolved times and title
#[derive(Debug, Clone)]
pub struct XmltvProgramme {
    pub channel_id: String,
    pub title: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub category: Option<String>,
    /// xmltv_ns form, e.g. "0.1.0"
    pub episode_num: Option<String>,
}

/// Format a datetime in XMLTV form: "YYYYMMDDHHmmss +0000"
pub fn format_xmltv_datetime(dt: DateTime<Utc>) -> String {
    dt.format("%Y%m%d%H%M%S +0000").to_string()
}

/// Reassign sequential non-overlapping times in place.
///
/// The first programme keeps its anchor-derived start; every later start
/// becomes the prior stop, durations preserved.
pub fn sequence_times(programmes: &mut [XmltvProgramme]) {
    for i in 1..programmes.len() {
        let prior_stop = programmes[i - 1].stop;
        let duration = programmes[i].stop - programmes[i].start;
        programmes[i].start = prior_stop;
        programmes[i].stop = prior_stop + duration;
    }
}

/// Structural validation of one channel's programme run
pub fn validate_programmes(programmes: &[XmltvProgramme]) -> Result<(), EpgError> {
    for programme in programmes {
        if programme.start >= programme.stop {
            return Err(EpgError::Validation(format!(
                "programme '{}' has start >= stop",
                programme.title
            )));
        }
        if programme.title.trim().is_empty() {
            return Err(EpgError::Validation(format!(
                "programme on channel {} has an empty title",
                programme.channel_id
            )));
        }
        for time in [programme.start, programme.stop] {
            let year = time.year();
            if !(1970..=2100).contains(&year) {
                return Err(EpgError::Validation(format!(
                    "programme '{}' has out-of-range year {}",
                    programme.title, year
                )));
            }
        }
    }
    for pair in programmes.windows(2) {
        if pair[0].stop > pair[1].start {
            return Err(EpgError::Validation(format!(
                "programmes '{}' and '{}' overlap",
                pair[0].title, pair[1].title
            )));
        }
        if pair[0].start > pair[1].start {
            return Err(EpgError::Validation("programme starts not monotone".to_string()));
        }
    }
    Ok(())
}

/// Cross-check the guide's channel set against the tuner lineup.
///
/// Mismatches are counted and logged once per cycle; they do not block
/// emission.
pub fn crosscheck_lineup(xmltv_channels: &[XmltvChannel], lineup_numbers: &[String]) {
    let xmltv_set: HashSet<&str> = xmltv_channels.iter().map(|c| c.id.as_str()).collect();
    let lineup_set: HashSet<&str> = lineup_numbers.iter().map(String::as_str).collect();

    let mut mismatches = 0u64;
    if xmltv_set != lineup_set {
        mismatches += 1;
    }
    if lineup_set.len() != lineup_numbers.len() {
        mismatches += 1;
    }
    if xmltv_channels.iter().any(|c| c.display_name.trim().is_empty()) {
        mismatches += 1;
    }

    if mismatches > 0 {
        metrics::epg::XMLTV_LINEUP_MISMATCH.inc_by(mismatches);
        tracing::warn!(
            mismatches,
            "XMLTV/lineup cross-check found inconsistencies this cycle"
        );
    }
}

/// Guide generator over the playout engine
pub struct EpgGenerator {
    db: DbPool,
    engine: Arc<PlayoutEngine>,
    horizon: std::time::Duration,
}

impl EpgGenerator {
    pub fn new(db: DbPool, engine: Arc<PlayoutEngine>, horizon: std::time::Duration) -> Self {
        Self {
            db,
            engine,
            horizon,
        }
    }

    /// Generate and validate the full XMLTV document
    pub async fn generate(&self, now: DateTime<Utc>) -> Result<String, EpgError> {
        let channels = self.load_channels().await?;

        let mut xmltv_channels = Vec::with_capacity(channels.len());
        let mut all_programmes: Vec<XmltvProgramme> = Vec::new();
        let mut placeholder_count = 0u64;

        for channel in &channels {
            let number = channel.number.clone();
            xmltv_channels.push(XmltvChannel {
                id: number.clone(),
                display_name: channel.name.clone(),
                icon: channel.logo.clone(),
            });

            if channel.show_in_epg == 0 {
                continue;
            }
            let Some(channel_id) = channel.id else { continue };

            let planned = match self
                .engine
                .future_programmes(channel_id, now, self.horizon)
                .await
            {
                Ok(planned) => planned,
                Err(e) => {
                    tracing::warn!(channel_id, "EPG walk failed: {}", e);
                    continue;
                }
            };

            let mut programmes: Vec<XmltvProgramme> = planned
                .iter()
                .map(|item| self.programme_from(item, &number, &channel.name, &mut placeholder_count))
                .collect();
            sequence_times(&mut programmes);

            // Drop programmes already fully in the past except the one
            // still playing
            programmes.retain(|p| p.stop > now);

            validate_programmes(&programmes)?;
            all_programmes.extend(programmes);
        }

        if placeholder_count > 0 {
            metrics::epg::PLACEHOLDER_TITLES.inc_by(placeholder_count);
        }

        let lineup_numbers: Vec<String> = channels.iter().map(|c| c.number.clone()).collect();
        crosscheck_lineup(&xmltv_channels, &lineup_numbers);

        write_xmltv(&xmltv_channels, &all_programmes)
    }

    fn programme_from(
        &self,
        item: &PlannedItem,
        channel_number: &str,
        channel_name: &str,
        placeholder_count: &mut u64,
    ) -> XmltvProgramme {
        let resolved = resolve_title(
            item.custom_title.as_deref(),
            &item.media_item.title,
            &item.media_item.url,
            channel_name,
            item.start,
        );
        if resolved.generated {
            *placeholder_count += 1;
        }

        let episode_num = match (item.media_item.season, item.media_item.episode) {
            (Some(season), Some(episode)) => Some(episode_num_xmltv(season, episode)),
            _ => None,
        };

        let category = item
            .media_item
            .genres
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
            .and_then(|genres| genres.into_iter().next());

        XmltvProgramme {
            channel_id: channel_number.to_string(),
            title: resolved.title,
            description: item.media_item.show_title.clone().map(|show| {
                match (item.media_item.season, item.media_item.episode) {
                    (Some(s), Some(e)) => format!("{} S{:02}E{:02}", show, s, e),
                    _ => show,
                }
            }),
            start: item.start,
            stop: item.end,
            category,
            episode_num,
        }
    }

    async fn load_channels(&self) -> Result<Vec<Channel>, EpgError> {
        let pool = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| EpgError::Database(e.to_string()))?;
            use schema::channels::dsl;
            dsl::channels
                .filter(dsl::enabled.eq(1))
                .order(dsl::number.asc())
                .load::<Channel>(&mut conn)
                .map_err(|e| EpgError::Database(e.to_string()))
        })
        .await
        .expect("EPG load task panicked")
    }
}

/// Serialize the validated guide with quick-xml
pub fn write_xmltv(
    channels: &[XmltvChannel],
    programmes: &[XmltvProgramme],
) -> Result<String, EpgError> {
    let estimated = 500 + channels.len() * 400 + programmes.len() * 300;
    let mut writer = Writer::new(Cursor::new(Vec::with_capacity(estimated)));

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Text(BytesText::new("\n")))?;
    writer.write_event(Event::DocType(BytesText::from_escaped("tv SYSTEM \"xmltv.dtd\"")))?;
    writer.write_event(Event::Text(BytesText::new("\n")))?;

    let mut tv = BytesStart::new("tv");
    tv.push_attribute(("generator-info-name", "Telecast"));
    writer.write_event(Event::Start(tv))?;
    writer.write_event(Event::Text(BytesText::new("\n")))?;

    for channel in channels {
        let mut elem = BytesStart::new("channel");
        elem.push_attribute(("id", channel.id.as_str()));
        writer.write_event(Event::Start(elem))?;

        writer.write_event(Event::Start(BytesStart::new("display-name")))?;
        writer.write_event(Event::Text(BytesText::new(&channel.display_name)))?;
        writer.write_event(Event::End(BytesEnd::new("display-name")))?;

        if let Some(icon) = &channel.icon {
            let mut icon_elem = BytesStart::new("icon");
            icon_elem.push_attribute(("src", icon.as_str()));
            writer.write_event(Event::Empty(icon_elem))?;
        }

        writer.write_event(Event::End(BytesEnd::new("channel")))?;
        writer.write_event(Event::Text(BytesText::new("\n")))?;
    }

    for programme in programmes {
        let start = format_xmltv_datetime(programme.start);
        let stop = format_xmltv_datetime(programme.stop);
        let mut elem = BytesStart::new("programme");
        elem.push_attribute(("start", start.as_str()));
        elem.push_attribute(("stop", stop.as_str()));
        elem.push_attribute(("channel", programme.channel_id.as_str()));
        writer.write_event(Event::Start(elem))?;

        let mut title = BytesStart::new("title");
        title.push_attribute(("lang", "en"));
        writer.write_event(Event::Start(title))?;
        writer.write_event(Event::Text(BytesText::new(&programme.title)))?;
        writer.write_event(Event::End(BytesEnd::new("title")))?;

        if let Some(desc) = &programme.description {
            let mut desc_elem = BytesStart::new("desc");
            desc_elem.push_attribute(("lang", "en"));
            writer.write_event(Event::Start(desc_elem))?;
            writer.write_event(Event::Text(BytesText::new(desc)))?;
            writer.write_event(Event::End(BytesEnd::new("desc")))?;
        }

        if let Some(category) = &programme.category {
            let mut cat_elem = BytesStart::new("category");
            cat_elem.push_attribute(("lang", "en"));
            writer.write_event(Event::Start(cat_elem))?;
            writer.write_event(Event::Text(BytesText::new(category)))?;
            writer.write_event(Event::End(BytesEnd::new("category")))?;
        }

        if let Some(episode_num) = &programme.episode_num {
            let mut ep_elem = BytesStart::new("episode-num");
            ep_elem.push_attribute(("system", "xmltv_ns"));
            writer.write_event(Event::Start(ep_elem))?;
            writer.write_event(Event::Text(BytesText::new(episode_num)))?;
            writer.write_event(Event::End(BytesEnd::new("episode-num")))?;
        }

        // <url> is deliberately never emitted: a fetch failure downstream
        // breaks EPG parsing in known clients

        writer.write_event(Event::End(BytesEnd::new("programme")))?;
        writer.write_event(Event::Text(BytesText::new("\n")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("tv")))?;
    writer.write_event(Event::Text(BytesText::new("\n")))?;

    let bytes = writer.into_inner().into_inner();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// The last good document, kept across failed cycles
pub struct EpgCache {
    document: RwLock<Option<String>>,
}

impl EpgCache {
    pub fn new() -> Self {
        Self {
            document: RwLock::new(None),
        }
    }

    pub fn store(&self, document: String) {
        *self.document.write().expect("epg cache poisoned") = Some(document);
    }

    pub fn last_good(&self) -> Option<String> {
        self.document.read().expect("epg cache poisoned").clone()
    }
}

impl Default for EpgCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn programme(channel: &str, title: &str, start: &str, stop: &str) -> XmltvProgramme {
        XmltvProgramme {
            channel_id: channel.to_string(),
            title: title.to_string(),
            description: None,
            start: t(start),
            stop: t(stop),
            category: None,
            episode_num: None,
        }
    }

    #[test]
    fn test_sequence_times_removes_overlap() {
        let mut programmes = vec![
            programme("7", "A", "2026-03-01T12:00:00Z", "2026-03-01T12:30:00Z"),
            // Overlapping start from a drifted upstream calculation
            programme("7", "B", "2026-03-01T12:20:00Z", "2026-03-01T12:50:00Z"),
            programme("7", "C", "2026-03-01T12:40:00Z", "2026-03-01T13:40:00Z"),
        ];
        sequence_times(&mut programmes);

        assert_eq!(programmes[1].start, t("2026-03-01T12:30:00Z"));
        assert_eq!(programmes[1].stop, t("2026-03-01T13:00:00Z"));
        assert_eq!(programmes[2].start, t("2026-03-01T13:00:00Z"));
        // Durations preserved
        assert_eq!(programmes[2].stop - programmes[2].start, ChronoDuration::hours(1));
        validate_programmes(&programmes).unwrap();
    }

    #[test]
    fn test_validation_rejects_inverted_times() {
        let bad = vec![programme("7", "A", "2026-03-01T13:00:00Z", "2026-03-01T12:00:00Z")];
        assert!(matches!(
            validate_programmes(&bad),
            Err(EpgError::Validation(_))
        ));
    }

    #[test]
    fn test_validation_rejects_empty_title() {
        let bad = vec![programme("7", "   ", "2026-03-01T12:00:00Z", "2026-03-01T13:00:00Z")];
        assert!(validate_programmes(&bad).is_err());
    }

    #[test]
    fn test_validation_rejects_absurd_years() {
        let bad = vec![programme("7", "A", "1969-12-31T00:00:00Z", "1970-01-02T00:00:00Z")];
        assert!(validate_programmes(&bad).is_err());
        let far = vec![programme("7", "A", "2101-01-01T00:00:00Z", "2101-01-01T01:00:00Z")];
        assert!(validate_programmes(&far).is_err());
    }

    #[test]
    fn test_validation_rejects_overlap() {
        let bad = vec![
            programme("7", "A", "2026-03-01T12:00:00Z", "2026-03-01T12:45:00Z"),
            programme("7", "B", "2026-03-01T12:30:00Z", "2026-03-01T13:00:00Z"),
        ];
        assert!(validate_programmes(&bad).is_err());
    }

    #[test]
    fn test_back_to_back_is_valid() {
        let good = vec![
            programme("7", "A", "2026-03-01T12:00:00Z", "2026-03-01T12:30:00Z"),
            programme("7", "B", "2026-03-01T12:30:00Z", "2026-03-01T13:00:00Z"),
        ];
        validate_programmes(&good).unwrap();
    }

    #[test]
    fn test_xmltv_document_shape() {
        let channels = vec![XmltvChannel {
            id: "7".to_string(),
            display_name: "Retro".to_string(),
            icon: Some("http://host/logo.png".to_string()),
        }];
        let programmes = vec![XmltvProgramme {
            channel_id: "7".to_string(),
            title: "Cosmos S01E02".to_string(),
            description: Some("Cosmos S01E02".to_string()),
            start: t("2026-03-01T12:00:00Z"),
            stop: t("2026-03-01T13:00:00Z"),
            category: Some("Documentary".to_string()),
            episode_num: Some("0.1.0".to_string()),
        }];

        let xml = write_xmltv(&channels, &programmes).unwrap();
        assert!(xml.contains("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<!DOCTYPE tv SYSTEM \"xmltv.dtd\">"));
        assert!(xml.contains("<channel id=\"7\">"));
        assert!(xml.contains("<display-name>Retro</display-name>"));
        assert!(xml.contains("<icon src=\"http://host/logo.png\"/>"));
        assert!(xml.contains(
            "<programme start=\"20260301120000 +0000\" stop=\"20260301130000 +0000\" channel=\"7\">"
        ));
        assert!(xml.contains("<title lang=\"en\">Cosmos S01E02</title>"));
        assert!(xml.contains("<episode-num system=\"xmltv_ns\">0.1.0</episode-num>"));
        // <url> is never emitted
        assert!(!xml.contains("<url>"));
    }

    #[test]
    fn test_decimal_channel_numbers_survive_as_strings() {
        let channels = vec![XmltvChannel {
            id: "1984.1".to_string(),
            display_name: "Docs".to_string(),
            icon: None,
        }];
        let xml = write_xmltv(&channels, &[]).unwrap();
        assert!(xml.contains("<channel id=\"1984.1\">"));
    }

    #[test]
    fn test_epg_cache_keeps_last_good() {
        let cache = EpgCache::new();
        assert!(cache.last_good().is_none());
        cache.store("<tv/>".to_string());
        assert_eq!(cache.last_good().unwrap(), "<tv/>");
    }
}
