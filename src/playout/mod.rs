//! Playout engine
//!
//! Given a channel's schedule, playout anchor, and referenced collections,
//! the engine decides the currently-playing item and the ordered future
//! programme list. The database anchor (`playouts.last_item_index` plus the
//! serialized walker state) is authoritative: EPG math never drives
//! playback, and anchor advancement is serialized per channel.

pub mod enumerator;
pub mod schedule;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::db::{
    models, schema, CollectionType, DbPool, MediaItem, Playout, ProgramScheduleItem,
};
use schedule::{group_by_show, PlannedItem, PlannedKind, ResolvedSlot, Walker, WalkerState};

/// Catch-up walks are bounded; beyond this the playout resets to now
const MAX_CATCHUP_STEPS: usize = 10_000;

/// Errors raised by the playout engine
#[derive(Debug, Error)]
pub enum PlayoutError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("channel {0} has no playout")]
    NoPlayout(i32),

    #[error("schedule {0} has no slots")]
    EmptySchedule(i32),

    #[error("anchor state is corrupt: {0}")]
    CorruptState(#[from] serde_json::Error),
}

/// Everything persisted in the anchor's opaque state column: the walker
/// state plus the item most recently checked out for playback, so the
/// currently-playing programme survives restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnchorState {
    walker: WalkerState,
    current: Option<CurrentProgramme>,
}

/// The checked-out programme, denormalized for restart recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentProgramme {
    pub media_item_id: i32,
    pub title: String,
    pub url: String,
    pub source: String,
    pub source_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub slot_index: usize,
    pub custom_title: Option<String>,
    pub is_filler: bool,
}

impl CurrentProgramme {
    fn from_planned(planned: &PlannedItem) -> Self {
        Self {
            media_item_id: planned.media_item.id.unwrap_or(0),
            title: planned.media_item.title.clone(),
            url: planned.media_item.url.clone(),
            source: planned.media_item.source.clone(),
            source_id: planned.media_item.source_id.clone(),
            start: planned.start,
            end: planned.end,
            slot_index: planned.slot_index,
            custom_title: planned.custom_title.clone(),
            is_filler: planned.kind == PlannedKind::Filler,
        }
    }
}

/// Per-channel schedule decisions over the persistent anchor
pub struct PlayoutEngine {
    pool: DbPool,
    /// Anchor advancement is single-writer per channel
    locks: DashMap<i32, Arc<tokio::sync::Mutex<()>>>,
}

impl PlayoutEngine {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            locks: DashMap::new(),
        }
    }

    fn channel_lock(&self, channel_id: i32) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(channel_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// The item playing on a channel at `now`, read-only.
    pub async fn current_item(
        &self,
        channel_id: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<PlannedItem>, PlayoutError> {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let context = load_context(&mut conn, channel_id)?;
            Ok::<_, PlayoutError>(peek_current(&context, now))
        })
        .await
        .expect("playout task panicked")?;
        Ok(result)
    }

    /// Check out the next item for playback, advancing and persisting the
    /// anchor. Called by the broadcaster once per item.
    pub async fn checkout_next(
        &self,
        channel_id: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<PlannedItem>, PlayoutError> {
        let lock = self.channel_lock(channel_id);
        let _guard = lock.lock().await;

        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let context = load_context(&mut conn, channel_id)?;
            checkout(&mut conn, context, now)
        })
        .await
        .expect("playout task panicked")
    }

    /// Ordered future programmes for the EPG, including the item playing at
    /// `now` (its start may be in the past).
    pub async fn future_programmes(
        &self,
        channel_id: i32,
        now: DateTime<Utc>,
        horizon: std::time::Duration,
    ) -> Result<Vec<PlannedItem>, PlayoutError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let context = load_context(&mut conn, channel_id)?;
            Ok::<_, PlayoutError>(peek_programmes(
                &context,
                now,
                ChronoDuration::from_std(horizon).unwrap_or(ChronoDuration::hours(48)),
            ))
        })
        .await
        .expect("playout task panicked")
    }

    /// Reset a channel's anchor to `now` with fresh enumerator state.
    pub async fn rebuild(&self, channel_id: i32, now: DateTime<Utc>) -> Result<(), PlayoutError> {
        let lock = self.channel_lock(channel_id);
        let _guard = lock.lock().await;

        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let context = load_context(&mut conn, channel_id)?;
            let state = AnchorState {
                walker: WalkerState::new(&context.slots),
                current: None,
            };
            persist_anchor(&mut conn, channel_id, context.playout.last_item_index, now, &state)?;
            tracing::info!(channel_id, "playout rebuilt at current wall clock");
            Ok(())
        })
        .await
        .expect("playout task panicked")
    }
}

/// A loaded anchor with its resolved schedule
struct PlayoutContext {
    playout: Playout,
    slots: Vec<ResolvedSlot>,
    anchor_end: DateTime<Utc>,
    state: AnchorState,
}

fn load_context(
    conn: &mut crate::db::DbPooledConnection,
    channel_id: i32,
) -> Result<PlayoutContext, PlayoutError> {
    use schema::playouts::dsl;

    let playout: Playout = dsl::playouts
        .filter(dsl::channel_id.eq(channel_id))
        .first(conn)
        .optional()?
        .ok_or(PlayoutError::NoPlayout(channel_id))?;

    let slot_rows: Vec<ProgramScheduleItem> = {
        use schema::program_schedule_items::dsl as items;
        items::program_schedule_items
            .filter(items::schedule_id.eq(playout.schedule_id))
            .order(items::slot_index.asc())
            .load(conn)?
    };
    if slot_rows.is_empty() {
        return Err(PlayoutError::EmptySchedule(playout.schedule_id));
    }

    let slots = slot_rows
        .into_iter()
        .map(|slot| resolve_slot(conn, slot))
        .collect::<Result<Vec<_>, _>>()?;

    let anchor_end = playout
        .last_item_end_wallclock
        .parse::<DateTime<Utc>>()
        .unwrap_or_else(|_| Utc::now());

    let state = match playout.enumerator_state.as_deref() {
        Some(raw) => match serde_json::from_str::<AnchorState>(raw) {
            Ok(state) => AnchorState {
                walker: state.walker.restore(&slots),
                current: state.current,
            },
            Err(e) => {
                // A corrupt anchor resets rather than wedging the channel
                tracing::warn!(channel_id, "discarding corrupt anchor state: {}", e);
                AnchorState {
                    walker: WalkerState::new(&slots),
                    current: None,
                }
            }
        },
        None => AnchorState {
            walker: WalkerState::new(&slots),
            current: None,
        },
    };

    Ok(PlayoutContext {
        playout,
        slots,
        anchor_end,
        state,
    })
}

fn resolve_slot(
    conn: &mut crate::db::DbPooledConnection,
    slot: ProgramScheduleItem,
) -> Result<ResolvedSlot, PlayoutError> {
    let items = resolve_collection(conn, slot.collection_id)?;
    let groups = group_by_show(&items);
    let pre_roll = resolve_filler(conn, slot.pre_roll_filler_id)?;
    let mid_roll = resolve_filler(conn, slot.mid_roll_filler_id)?;
    let post_roll = resolve_filler(conn, slot.post_roll_filler_id)?;
    let tail = resolve_filler(conn, slot.tail_filler_id)?;
    let fallback = resolve_filler(conn, slot.fallback_filler_id)?;

    Ok(ResolvedSlot {
        slot,
        items,
        groups,
        pre_roll,
        mid_roll,
        post_roll,
        tail,
        fallback,
    })
}

/// Resolve a collection reference to its ordered item list.
///
/// Smart collections re-evaluate their query on every load; the enumerator
/// fingerprint handles a changed result set.
pub fn resolve_collection(
    conn: &mut crate::db::DbPooledConnection,
    playlist_id: i32,
) -> Result<Vec<MediaItem>, PlayoutError> {
    use schema::playlists::dsl as pl;

    let playlist: Option<models::Playlist> = pl::playlists
        .filter(pl::id.eq(playlist_id))
        .first(conn)
        .optional()?;
    let playlist = match playlist {
        Some(p) => p,
        None => return Ok(Vec::new()),
    };

    let collection_type: CollectionType = playlist
        .collection_type
        .parse()
        .unwrap_or(CollectionType::Manual);

    if collection_type == CollectionType::Smart {
        let query = playlist.search_query.unwrap_or_default();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        use schema::media_items::dsl as mi;
        let pattern = format!("%{}%", query);
        let items = mi::media_items
            .filter(
                mi::title
                    .like(pattern.clone())
                    .nullable()
                    .or(mi::show_title.like(pattern.clone()))
                    .or(mi::genres.like(pattern)),
            )
            .order(mi::id.asc())
            .load::<MediaItem>(conn)?;
        return Ok(items);
    }

    use schema::media_items::dsl as mi;
    use schema::playlist_items::dsl as pi;

    let rows: Vec<(models::PlaylistItem, MediaItem)> = pi::playlist_items
        .inner_join(mi::media_items.on(mi::id.nullable().eq(pi::media_item_id.nullable())))
        .filter(pi::playlist_id.eq(playlist_id))
        .filter(pi::enabled.eq(1))
        .order(pi::position.asc())
        .load(conn)?;

    Ok(rows.into_iter().map(|(_, item)| item).collect())
}

fn resolve_filler(
    conn: &mut crate::db::DbPooledConnection,
    preset_id: Option<i32>,
) -> Result<Vec<MediaItem>, PlayoutError> {
    let preset_id = match preset_id {
        Some(id) => id,
        None => return Ok(Vec::new()),
    };
    use schema::filler_presets::dsl as fp;

    let preset: Option<models::FillerPreset> = fp::filler_presets
        .filter(fp::id.eq(preset_id))
        .first(conn)
        .optional()?;
    match preset {
        Some(preset) => resolve_collection(conn, preset.collection_id),
        None => Ok(Vec::new()),
    }
}

/// Walk read-only until the item whose window covers `now`
fn peek_current(context: &PlayoutContext, now: DateTime<Utc>) -> Option<PlannedItem> {
    if let Some(current) = &context.state.current {
        if now < current.end {
            return Some(reconstruct_planned(context, current));
        }
    }

    let mut walker = Walker::new(
        &context.slots,
        context.state.walker.clone(),
        context.anchor_end,
    );
    let mut rng = rand::thread_rng();
    for _ in 0..MAX_CATCHUP_STEPS {
        let planned = walker.step(&mut rng)?;
        if planned.end > now {
            return Some(planned);
        }
    }
    None
}

/// Future programme list: the current item first, then the walk ahead
fn peek_programmes(
    context: &PlayoutContext,
    now: DateTime<Utc>,
    horizon: ChronoDuration,
) -> Vec<PlannedItem> {
    let mut programmes = Vec::new();
    let deadline = now + horizon;

    let mut walker = Walker::new(
        &context.slots,
        context.state.walker.clone(),
        context.anchor_end,
    );

    if let Some(current) = &context.state.current {
        if now < current.end {
            programmes.push(reconstruct_planned(context, current));
            walker.cursor = current.end.max(context.anchor_end);
        }
    }

    let mut rng = rand::thread_rng();
    let mut catchup = 0usize;
    while walker.cursor < deadline && catchup < MAX_CATCHUP_STEPS {
        catchup += 1;
        match walker.step(&mut rng) {
            Some(planned) => {
                // Items fully before `now` were missed while off air
                if planned.end <= now {
                    continue;
                }
                programmes.push(planned);
            }
            None => break,
        }
    }
    programmes
}

fn reconstruct_planned(context: &PlayoutContext, current: &CurrentProgramme) -> PlannedItem {
    // Prefer the live media row; the denormalized copy covers deletion
    let media_item = context
        .slots
        .iter()
        .flat_map(|slot| slot.items.iter())
        .find(|item| item.id == Some(current.media_item_id))
        .cloned()
        .unwrap_or_else(|| MediaItem {
            id: Some(current.media_item_id),
            source: current.source.clone(),
            source_id: current.source_id.clone(),
            url: current.url.clone(),
            title: current.title.clone(),
            duration_seconds: (current.end - current.start).num_seconds().max(0) as i32,
            show_title: None,
            season: None,
            episode: None,
            year: None,
            genres: None,
            provider_metadata: None,
            created_at: String::new(),
            updated_at: String::new(),
        });

    PlannedItem {
        media_item,
        start: current.start,
        end: current.end,
        slot_index: current.slot_index,
        custom_title: current.custom_title.clone(),
        kind: if current.is_filler {
            PlannedKind::Filler
        } else {
            PlannedKind::Program
        },
    }
}

/// Advance the anchor one item and persist it
fn checkout(
    conn: &mut crate::db::DbPooledConnection,
    mut context: PlayoutContext,
    now: DateTime<Utc>,
) -> Result<Option<PlannedItem>, PlayoutError> {
    let mut walker = Walker::new(
        &context.slots,
        context.state.walker.clone(),
        context.anchor_end,
    );
    let mut rng = rand::thread_rng();

    let mut steps = 0usize;
    let planned = loop {
        steps += 1;
        if steps > MAX_CATCHUP_STEPS {
            // The channel was off air for too long to replay; restart the
            // walk at the current wall clock
            walker = Walker::new(&context.slots, WalkerState::new(&context.slots), now);
            match walker.step(&mut rng) {
                Some(planned) => break Some(planned),
                None => break None,
            }
        }
        match walker.step(&mut rng) {
            Some(planned) => {
                if planned.end > now {
                    break Some(planned);
                }
            }
            None => break None,
        }
    };

    let planned = match planned {
        Some(p) => p,
        None => return Ok(None),
    };

    context.state.walker = walker.state.clone();
    context.state.current = Some(CurrentProgramme::from_planned(&planned));
    let next_index = context.playout.last_item_index + steps as i32;
    persist_anchor(conn, context.playout.channel_id, next_index, planned.end, &context.state)?;

    Ok(Some(planned))
}

fn persist_anchor(
    conn: &mut crate::db::DbPooledConnection,
    channel_id: i32,
    last_item_index: i32,
    last_item_end: DateTime<Utc>,
    state: &AnchorState,
) -> Result<(), PlayoutError> {
    use schema::playouts::dsl;

    let serialized = serde_json::to_string(state)?;
    diesel::update(dsl::playouts.filter(dsl::channel_id.eq(channel_id)))
        .set((
            dsl::last_item_index.eq(last_item_index),
            dsl::last_item_end_wallclock.eq(last_item_end.to_rfc3339()),
            dsl::enumerator_state.eq(serialized),
            dsl::updated_at.eq(Utc::now().to_rfc3339()),
        ))
        .execute(conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::run_migrations;
    use diesel::r2d2::{ConnectionManager, Pool};

    fn seeded_pool() -> DbPool {
        // One shared in-memory connection; a larger pool would hand out
        // fresh empty databases
        let manager = ConnectionManager::<diesel::SqliteConnection>::new(":memory:");
        let pool = Pool::builder().max_size(1).build(manager).expect("pool");
        let mut conn = pool.get().expect("conn");
        run_migrations(&mut conn).expect("migrations");

        diesel::sql_query(
            "INSERT INTO channels (id, number, name) VALUES (1, '7', 'Retro')",
        )
        .execute(&mut conn)
        .unwrap();
        diesel::sql_query(
            "INSERT INTO media_items (id, source, source_id, url, title, duration_seconds)
             VALUES (1, 'local', '/m/a.mkv', '/m/a.mkv', 'Alpha', 1800),
                    (2, 'local', '/m/b.mkv', '/m/b.mkv', 'Beta', 1800)",
        )
        .execute(&mut conn)
        .unwrap();
        diesel::sql_query("INSERT INTO playlists (id, name, collection_type) VALUES (1, 'Main', 'manual')")
            .execute(&mut conn)
            .unwrap();
        diesel::sql_query(
            "INSERT INTO playlist_items (playlist_id, media_item_id, position) VALUES (1, 1, 0), (1, 2, 1)",
        )
        .execute(&mut conn)
        .unwrap();
        diesel::sql_query("INSERT INTO program_schedules (id, name) VALUES (1, 'Always on')")
            .execute(&mut conn)
            .unwrap();
        diesel::sql_query(
            "INSERT INTO program_schedule_items
             (schedule_id, slot_index, start_type, collection_kind, collection_id, playback_order, playout_mode, guide_mode)
             VALUES (1, 0, 'dynamic', 'playlist', 1, 'chronological', 'flood', 'normal')",
        )
        .execute(&mut conn)
        .unwrap();
        diesel::sql_query(
            "INSERT INTO playouts (channel_id, schedule_id, last_item_index, last_item_end_wallclock)
             VALUES (1, 1, 0, '2026-03-01T12:00:00+00:00')",
        )
        .execute(&mut conn)
        .unwrap();

        drop(conn);
        pool
    }

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_checkout_advances_anchor() {
        let engine = PlayoutEngine::new(seeded_pool());
        let now = t("2026-03-01T12:00:00Z");

        let first = engine.checkout_next(1, now).await.unwrap().unwrap();
        assert_eq!(first.media_item.title, "Alpha");
        assert_eq!(first.start, now);

        let second = engine
            .checkout_next(1, first.end)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.media_item.title, "Beta");
        assert_eq!(second.start, first.end);
    }

    #[tokio::test]
    async fn test_current_item_reflects_checked_out_programme() {
        let engine = PlayoutEngine::new(seeded_pool());
        let now = t("2026-03-01T12:00:00Z");

        let checked_out = engine.checkout_next(1, now).await.unwrap().unwrap();
        // Mid-item, the read path reports the same programme
        let mid = now + ChronoDuration::minutes(10);
        let current = engine.current_item(1, mid).await.unwrap().unwrap();
        assert_eq!(current.media_item.id, checked_out.media_item.id);
        assert_eq!(current.start, checked_out.start);
    }

    #[tokio::test]
    async fn test_future_programmes_are_monotone_and_include_current() {
        let engine = PlayoutEngine::new(seeded_pool());
        let now = t("2026-03-01T12:00:00Z");
        engine.checkout_next(1, now).await.unwrap().unwrap();

        let mid = now + ChronoDuration::minutes(10);
        let programmes = engine
            .future_programmes(1, mid, std::time::Duration::from_secs(4 * 3600))
            .await
            .unwrap();

        assert!(!programmes.is_empty());
        // The first entry is the currently-playing item with a past start
        assert!(programmes[0].start <= mid);
        assert!(programmes[0].end > mid);
        for pair in programmes.windows(2) {
            assert!(pair[0].start <= pair[1].start);
            assert!(pair[0].end <= pair[1].start);
        }
    }

    #[tokio::test]
    async fn test_missing_playout_is_an_error() {
        let engine = PlayoutEngine::new(seeded_pool());
        let err = engine
            .current_item(99, t("2026-03-01T12:00:00Z"))
            .await
            .unwrap_err();
        assert!(matches!(err, PlayoutError::NoPlayout(99)));
    }

    #[tokio::test]
    async fn test_rebuild_resets_anchor() {
        let engine = PlayoutEngine::new(seeded_pool());
        let now = t("2026-03-01T12:00:00Z");
        engine.checkout_next(1, now).await.unwrap();

        let later = t("2026-03-02T09:00:00Z");
        engine.rebuild(1, later).await.unwrap();

        let current = engine.current_item(1, later).await.unwrap().unwrap();
        assert_eq!(current.start, later);
    }
}
