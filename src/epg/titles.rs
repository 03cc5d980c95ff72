//! Programme title resolution
//!
//! Guide titles fall through a fixed chain, stopping at the first usable
//! candidate: the slot's custom title, the item's own title, a title
//! derived from the filename, the URL basename, and finally a generated
//! "{channel} — {start}" label. Auto-generated placeholder names of the
//! form `Item 12345` are never usable and always fall through.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

/// Upstream placeholder names that must never reach the guide
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Item \d+$").expect("placeholder regex"));

/// SxxEyy episode markers in filenames
static EPISODE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[Ss](\d{1,2})[Ee](\d{1,2})").expect("episode regex"));

/// Release years in filenames
static YEAR_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(19|20)\d{2}\b").expect("year regex"));

/// A resolved title plus whether it came from the generated fallback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTitle {
    pub title: String,
    pub generated: bool,
}

fn usable(candidate: &str) -> bool {
    let trimmed = candidate.trim();
    !trimmed.is_empty() && !PLACEHOLDER.is_match(trimmed)
}

/// Replace filename separators with spaces and collapse runs
fn humanize(raw: &str) -> String {
    let spaced: String = raw
        .chars()
        .map(|c| if c == '.' || c == '_' || c == '-' { ' ' } else { c })
        .collect();
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn file_stem(path: &str) -> Option<&str> {
    let basename = path
        .rsplit(['/', '\\'])
        .next()
        .filter(|s| !s.is_empty())?;
    Some(basename.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(basename))
}

/// Derive a guide title from a media path.
///
/// `"/shows/Cosmos S01E02.mkv"` becomes `"Cosmos S01E02"`;
/// `"Blade.Runner.1982.mkv"` becomes `"Blade Runner (1982)"`.
pub fn derive_from_filename(path: &str) -> Option<String> {
    let stem = file_stem(path)?;

    if let Some(found) = EPISODE_MARKER.find(stem) {
        let show = humanize(&stem[..found.start()]);
        let marker = found.as_str().to_uppercase();
        let title = if show.is_empty() {
            marker
        } else {
            format!("{} {}", show, marker)
        };
        return Some(title);
    }

    if let Some(found) = YEAR_MARKER.find(stem) {
        let name = humanize(&stem[..found.start()]);
        if !name.is_empty() {
            return Some(format!("{} ({})", name, found.as_str()));
        }
    }

    None
}

/// The URL path's basename, humanized
fn basename_candidate(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let stem = file_stem(path)?;
    let human = humanize(stem);
    if human.is_empty() {
        None
    } else {
        Some(human)
    }
}

/// Walk the fallback chain for one programme
pub fn resolve_title(
    custom_title: Option<&str>,
    item_title: &str,
    url: &str,
    channel_name: &str,
    start: DateTime<Utc>,
) -> ResolvedTitle {
    if let Some(custom) = custom_title {
        if usable(custom) {
            return ResolvedTitle {
                title: custom.trim().to_string(),
                generated: false,
            };
        }
    }

    if usable(item_title) {
        return ResolvedTitle {
            title: item_title.trim().to_string(),
            generated: false,
        };
    }

    if let Some(derived) = derive_from_filename(url) {
        if usable(&derived) {
            return ResolvedTitle {
                title: derived,
                generated: false,
            };
        }
    }

    if let Some(base) = basename_candidate(url) {
        if usable(&base) {
            return ResolvedTitle {
                title: base,
                generated: false,
            };
        }
    }

    ResolvedTitle {
        title: format!("{} — {}", channel_name, start.format("%H:%M")),
        generated: true,
    }
}

/// Episode numbering in `xmltv_ns` form: zero-based season and episode with
/// a literal trailing part term, e.g. season 1 episode 2 is `0.1.0`
pub fn episode_num_xmltv(season: i32, episode: i32) -> String {
    format!("{}.{}.0", (season - 1).max(0), (episode - 1).max(0))
}
