//! Schedule walking
//!
//! The [`Walker`] turns a channel's schedule into a deterministic, infinite
//! sequence of planned items. Its entire mutable state ([`WalkerState`])
//! serializes into the playout anchor, so any walk can be replayed from the
//! database after a restart.
//!
//! Slot semantics:
//! - `one` plays a single item, then advances.
//! - `multiple` plays its configured count, then advances.
//! - `duration` plays items until the accumulated runtime meets the
//!   configured duration; items are never truncated.
//! - `flood` plays items until the next fixed-start boundary; the last item
//!   may overrun the boundary, which then starts late by that amount.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::enumerator::{Enumerator, Selection};
use crate::db::{MediaItem, PlayoutMode, ProgramScheduleItem, StartType};

/// Minimum assumed runtime for an item with unknown duration.
///
/// Zero-duration items would stall the walk; unknown durations get a
/// placeholder block instead.
const FALLBACK_ITEM_SECONDS: i64 = 30 * 60;

/// How far a fixed-start slot may begin late before the walk gives up on
/// today's occurrence and waits for tomorrow's. A flood item that overruns
/// the boundary starts the fixed slot late by the overrun, never truncated.
const SLOT_OVERRUN_TOLERANCE: ChronoDuration = ChronoDuration::hours(1);

/// What a planned entry is, for filler styling and EPG guide modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedKind {
    Program,
    Filler,
}

/// One planned playback entry
#[derive(Debug, Clone)]
pub struct PlannedItem {
    pub media_item: MediaItem,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub slot_index: usize,
    pub custom_title: Option<String>,
    pub kind: PlannedKind,
}

/// A schedule slot with its collections resolved to concrete items
#[derive(Debug, Clone)]
pub struct ResolvedSlot {
    pub slot: ProgramScheduleItem,
    /// Main collection items, in collection order
    pub items: Vec<MediaItem>,
    /// Item indices grouped by show, for the rotating shuffle
    pub groups: Vec<Vec<usize>>,
    pub pre_roll: Vec<MediaItem>,
    pub mid_roll: Vec<MediaItem>,
    pub post_roll: Vec<MediaItem>,
    pub tail: Vec<MediaItem>,
    pub fallback: Vec<MediaItem>,
}

impl ResolvedSlot {
    pub fn item_ids(&self) -> Vec<i32> {
        self.items.iter().filter_map(|i| i.id).collect()
    }
}

/// Persistable walk state; lives in `playouts.enumerator_state`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkerState {
    /// Which slot the walk is inside
    pub slot_index: usize,
    /// Main items played during the current slot visit
    pub slot_items_played: usize,
    /// Runtime accumulated during the current slot visit (duration mode)
    pub slot_seconds_accumulated: i64,
    /// Whether the current slot visit has emitted its pre-roll
    pub pre_roll_done: bool,
    /// A mid-roll is owed before the next main item
    #[serde(default)]
    pub mid_roll_pending: bool,
    /// One enumerator per slot, index-aligned with the schedule
    pub enumerators: Vec<Enumerator>,
    /// Chronological cursors for filler collections, keyed by preset id
    pub filler_cursors: HashMap<i32, usize>,
}

impl WalkerState {
    /// Fresh state for a resolved schedule
    pub fn new(slots: &[ResolvedSlot]) -> Self {
        let enumerators = slots
            .iter()
            .map(|slot| Enumerator::new(slot.slot.playback_order(), &slot.item_ids()))
            .collect();
        Self {
            slot_index: 0,
            slot_items_played: 0,
            slot_seconds_accumulated: 0,
            pre_roll_done: false,
            mid_roll_pending: false,
            enumerators,
            filler_cursors: HashMap::new(),
        }
    }

    /// Restore persisted state against a freshly resolved schedule.
    ///
    /// Slots whose item sets changed (smart collections) reset their
    /// enumerators; a schedule with a different slot count resets entirely.
    pub fn restore(self, slots: &[ResolvedSlot]) -> Self {
        if self.enumerators.len() != slots.len() {
            return Self::new(slots);
        }
        let Self {
            slot_index,
            slot_items_played,
            slot_seconds_accumulated,
            pre_roll_done,
            mid_roll_pending,
            enumerators,
            filler_cursors,
        } = self;
        let enumerators = enumerators
            .into_iter()
            .zip(slots.iter())
            .map(|(e, slot)| e.restore_or_reset(&slot.item_ids()))
            .collect();
        Self {
            slot_index,
            slot_items_played,
            slot_seconds_accumulated,
            pre_roll_done,
            mid_roll_pending,
            enumerators,
            filler_cursors,
        }
    }
}

/// Deterministic walk over a resolved schedule
pub struct Walker<'a> {
    slots: &'a [ResolvedSlot],
    pub state: WalkerState,
    pub cursor: DateTime<Utc>,
}

impl<'a> Walker<'a> {
    pub fn new(slots: &'a [ResolvedSlot], state: WalkerState, cursor: DateTime<Utc>) -> Self {
        Self {
            slots,
            state,
            cursor,
        }
    }

    /// Produce the next planned entry, advancing cursor and state.
    ///
    /// Returns `None` only when every collection in the schedule (including
    /// fallbacks) is empty; the broadcaster then emits a slate.
    pub fn step<R: Rng>(&mut self, rng: &mut R) -> Option<PlannedItem> {
        if self.slots.is_empty() {
            return None;
        }

        // Bounded by twice the slot count so a schedule of all-empty
        // collections terminates instead of spinning
        for _ in 0..(self.slots.len() * 2 + 2) {
            self.state.slot_index %= self.slots.len();
            let slot_index = self.state.slot_index;
            let slot = &self.slots[slot_index];

            // Arriving at a fixed-start slot: fill the gap with tail filler
            // from the slot itself, then jump the cursor to the boundary
            if self.state.slot_items_played == 0 && !self.state.pre_roll_done {
                if let Some(boundary) = self.fixed_boundary(slot) {
                    if self.cursor < boundary {
                        if let Some(filler) = self.take_tail_filler(slot_index, boundary) {
                            return Some(filler);
                        }
                        // Residual gap smaller than any filler: dead air
                        // until the committed boundary
                        self.cursor = boundary;
                    }
                }
            }

            // Pre-roll once per slot visit
            if !self.state.pre_roll_done {
                self.state.pre_roll_done = true;
                if let Some(filler) = self.take_preset_filler(slot_index, FillerSlot::Pre) {
                    return Some(filler);
                }
            }

            // Mid-roll owed from the previous main item
            if self.state.mid_roll_pending {
                self.state.mid_roll_pending = false;
                if !self.slot_complete(slot) {
                    if let Some(filler) = self.take_preset_filler(slot_index, FillerSlot::Mid) {
                        return Some(filler);
                    }
                }
            }

            if self.slot_complete(slot) {
                let post = self.take_preset_filler(slot_index, FillerSlot::Post);
                self.advance_slot();
                if let Some(filler) = post {
                    return Some(filler);
                }
                continue;
            }

            // Main item
            let item_count = slot.items.len();
            let selection =
                self.state.enumerators[slot_index].next(item_count, &slot.groups, rng);

            match selection {
                Selection::Item(index) => {
                    let item = slot.items[index].clone();
                    let planned = self.emit(item, slot_index, PlannedKind::Program);
                    self.state.slot_items_played += 1;
                    self.state.slot_seconds_accumulated +=
                        (planned.end - planned.start).num_seconds();

                    // Flood slots cut over once the boundary is reached; the
                    // item that crossed it has already been emitted whole.
                    // Completion by count or duration is re-checked at the
                    // top of the next step so post-roll runs first.
                    if slot.slot.playout_mode() == PlayoutMode::Flood {
                        if let Some(boundary) = self.next_fixed_boundary_after(slot_index) {
                            if self.cursor >= boundary {
                                self.advance_slot();
                            }
                        }
                    } else if !self.slot_complete(slot)
                        && slot.slot.mid_roll_filler_id.is_some()
                    {
                        self.state.mid_roll_pending = true;
                    }

                    return Some(planned);
                }
                Selection::Empty => {
                    // Schedule emptiness: fall back to the slot's fallback
                    // filler; an empty fallback skips the slot
                    if let Some(filler) = self.take_preset_filler(slot_index, FillerSlot::Fallback)
                    {
                        self.advance_slot();
                        return Some(filler);
                    }
                    self.advance_slot();
                }
            }
        }

        None
    }

    /// Whether the current slot visit has played enough main items
    fn slot_complete(&self, slot: &ResolvedSlot) -> bool {
        match slot.slot.playout_mode() {
            PlayoutMode::One => self.state.slot_items_played >= 1,
            PlayoutMode::Multiple => {
                let count = slot.slot.multiple_count.unwrap_or(1).max(1) as usize;
                self.state.slot_items_played >= count
            }
            PlayoutMode::Duration => {
                let target = slot.slot.duration_seconds.unwrap_or(0).max(0) as i64;
                target > 0 && self.state.slot_seconds_accumulated >= target
            }
            // Flood completion is boundary-driven inside step()
            PlayoutMode::Flood => false,
        }
    }

    fn advance_slot(&mut self) {
        self.state.slot_index = (self.state.slot_index + 1) % self.slots.len();
        self.state.slot_items_played = 0;
        self.state.slot_seconds_accumulated = 0;
        self.state.pre_roll_done = false;
    }

    /// The committed wall-clock boundary of a fixed-start slot, relative to
    /// the cursor: the next occurrence of its time-of-day. An occurrence the
    /// cursor overran by less than the slot tolerance still counts as
    /// "today", so the slot starts late instead of waiting a day.
    fn fixed_boundary(&self, slot: &ResolvedSlot) -> Option<DateTime<Utc>> {
        if slot.slot.start_type() != StartType::Fixed {
            return None;
        }
        let raw = slot.slot.fixed_start_time.as_deref()?;
        let time = NaiveTime::parse_from_str(raw, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
            .ok()?;

        let today = self.cursor.date_naive().and_time(time).and_utc();
        if today >= self.cursor || self.cursor - today <= SLOT_OVERRUN_TOLERANCE {
            Some(today)
        } else {
            Some(today + ChronoDuration::days(1))
        }
    }

    /// Next fixed-start boundary among the slots after `from`, cyclically
    fn next_fixed_boundary_after(&self, from: usize) -> Option<DateTime<Utc>> {
        let n = self.slots.len();
        for offset in 1..=n {
            let candidate = &self.slots[(from + offset) % n];
            if let Some(boundary) = self.fixed_boundary(candidate) {
                return Some(boundary);
            }
        }
        None
    }

    fn emit(&mut self, item: MediaItem, slot_index: usize, kind: PlannedKind) -> PlannedItem {
        let seconds = if item.duration_seconds > 0 {
            item.duration_seconds as i64
        } else {
            FALLBACK_ITEM_SECONDS
        };
        let start = self.cursor;
        let end = start + ChronoDuration::seconds(seconds);
        self.cursor = end;
        PlannedItem {
            media_item: item,
            start,
            end,
            slot_index,
            custom_title: self.slots[slot_index].slot.custom_title.clone(),
            kind,
        }
    }

    /// Tail filler items are emitted only while they fit the gap whole
    fn take_tail_filler(
        &mut self,
        slot_index: usize,
        boundary: DateTime<Utc>,
    ) -> Option<PlannedItem> {
        let preset_id = self.slots[slot_index].slot.tail_filler_id?;
        let pool = &self.slots[slot_index].tail;
        if pool.is_empty() {
            return None;
        }

        let gap = (boundary - self.cursor).num_seconds();
        let cursor = self.state.filler_cursors.entry(preset_id).or_insert(0);
        let item = pool[*cursor % pool.len()].clone();
        let runtime = if item.duration_seconds > 0 {
            item.duration_seconds as i64
        } else {
            FALLBACK_ITEM_SECONDS
        };
        if runtime > gap {
            return None;
        }
        *cursor += 1;
        Some(self.emit(item, slot_index, PlannedKind::Filler))
    }

    fn take_preset_filler(&mut self, slot_index: usize, which: FillerSlot) -> Option<PlannedItem> {
        let slot = &self.slots[slot_index];
        let (preset_id, pool) = match which {
            FillerSlot::Pre => (slot.slot.pre_roll_filler_id, &slot.pre_roll),
            FillerSlot::Mid => (slot.slot.mid_roll_filler_id, &slot.mid_roll),
            FillerSlot::Post => (slot.slot.post_roll_filler_id, &slot.post_roll),
            FillerSlot::Fallback => (slot.slot.fallback_filler_id, &slot.fallback),
        };
        let preset_id = preset_id?;
        if pool.is_empty() {
            return None;
        }
        let cursor = self.state.filler_cursors.entry(preset_id).or_insert(0);
        let item = pool[*cursor % pool.len()].clone();
        *cursor += 1;
        Some(self.emit(item, slot_index, PlannedKind::Filler))
    }

}

#[derive(Debug, Clone, Copy)]
enum FillerSlot {
    Pre,
    Mid,
    Post,
    Fallback,
}

/// Group item indices by show title for the rotating shuffle.
///
/// Items without a show title each form their own group.
pub fn group_by_show(items: &[MediaItem]) -> Vec<Vec<usize>> {
    let mut order: Vec<String> = Vec::new();
    let mut buckets: HashMap<String, Vec<usize>> = HashMap::new();
    for (index, item) in items.iter().enumerate() {
        let key = item
            .show_title
            .clone()
            .unwrap_or_else(|| format!("\u{0}solo-{}", index));
        if !buckets.contains_key(&key) {
            order.push(key.clone());
        }
        buckets.entry(key).or_default().push(index);
    }
    order
        .into_iter()
        .filter_map(|key| buckets.remove(&key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn media(id: i32, title: &str, minutes: i32) -> MediaItem {
        MediaItem {
            id: Some(id),
            source: "local".to_string(),
            source_id: format!("/media/{}.mkv", id),
            url: format!("/media/{}.mkv", id),
            title: title.to_string(),
            duration_seconds: minutes * 60,
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

    fn slot(index: i32, mode: PlayoutMode) -> ProgramScheduleItem {
        ProgramScheduleItem {
            id: Some(index),
            schedule_id: 1,
            slot_index: index,
            start_type: "dynamic".to_string(),
            fixed_start_time: None,
            collection_kind: "playlist".to_string(),
            collection_id: index,
            playback_order: "chronological".to_string(),
            playout_mode: mode.to_string(),
            multiple_count: None,
            duration_seconds: None,
            pre_roll_filler_id: None,
            mid_roll_filler_id: None,
            post_roll_filler_id: None,
            tail_filler_id: None,
            fallback_filler_id: None,
            custom_title: None,
            guide_mode: "normal".to_string(),
        }
    }

    fn resolved(slot: ProgramScheduleItem, items: Vec<MediaItem>) -> ResolvedSlot {
        let groups = group_by_show(&items);
        ResolvedSlot {
            slot,
            items,
            groups,
            pre_roll: Vec::new(),
            mid_roll: Vec::new(),
            post_roll: Vec::new(),
            tail: Vec::new(),
            fallback: Vec::new(),
        }
    }

    fn start_time() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_one_mode_alternates_slots() {
        let slots = vec![
            resolved(slot(0, PlayoutMode::One), vec![media(1, "A1", 30), media(2, "A2", 30)]),
            resolved(slot(1, PlayoutMode::One), vec![media(3, "B1", 30)]),
        ];
        let state = WalkerState::new(&slots);
        let mut walker = Walker::new(&slots, state, start_time());
        let mut r = rng();

        let titles: Vec<String> = (0..4)
            .map(|_| walker.step(&mut r).unwrap().media_item.title)
            .collect();
        assert_eq!(titles, vec!["A1", "B1", "A2", "B1"]);
    }

    #[test]
    fn test_times_are_sequential_and_non_overlapping() {
        let slots = vec![resolved(
            slot(0, PlayoutMode::Flood),
            vec![media(1, "A", 25), media(2, "B", 40)],
        )];
        let state = WalkerState::new(&slots);
        let mut walker = Walker::new(&slots, state, start_time());
        let mut r = rng();

        let planned: Vec<PlannedItem> = (0..5).map(|_| walker.step(&mut r).unwrap()).collect();
        for pair in planned.windows(2) {
            assert!(pair[0].start < pair[0].end);
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_multiple_mode_plays_count_then_advances() {
        let mut multi = slot(0, PlayoutMode::Multiple);
        multi.multiple_count = Some(3);
        let slots = vec![
            resolved(multi, vec![media(1, "A1", 30), media(2, "A2", 30)]),
            resolved(slot(1, PlayoutMode::One), vec![media(3, "B", 30)]),
        ];
        let state = WalkerState::new(&slots);
        let mut walker = Walker::new(&slots, state, start_time());
        let mut r = rng();

        let titles: Vec<String> = (0..4)
            .map(|_| walker.step(&mut r).unwrap().media_item.title)
            .collect();
        assert_eq!(titles, vec!["A1", "A2", "A1", "B"]);
    }

    #[test]
    fn test_duration_mode_never_truncates() {
        let mut timed = slot(0, PlayoutMode::Duration);
        timed.duration_seconds = Some(3600);
        let slots = vec![
            // 45-minute items: the second one overruns the hour, whole
            resolved(timed, vec![media(1, "Long", 45)]),
            resolved(slot(1, PlayoutMode::One), vec![media(2, "Next", 30)]),
        ];
        let state = WalkerState::new(&slots);
        let mut walker = Walker::new(&slots, state, start_time());
        let mut r = rng();

        let first = walker.step(&mut r).unwrap();
        let second = walker.step(&mut r).unwrap();
        let third = walker.step(&mut r).unwrap();

        assert_eq!(first.media_item.title, "Long");
        assert_eq!(second.media_item.title, "Long");
        // 90 accumulated minutes >= 60 target, both items whole
        assert_eq!((second.end - first.start).num_minutes(), 90);
        assert_eq!(third.media_item.title, "Next");
    }

    #[test]
    fn test_flood_cuts_over_at_fixed_boundary() {
        let mut fixed = slot(1, PlayoutMode::One);
        fixed.start_type = "fixed".to_string();
        fixed.fixed_start_time = Some("14:00:00".to_string());

        let slots = vec![
            resolved(slot(0, PlayoutMode::Flood), vec![media(1, "Loop", 45)]),
            resolved(fixed, vec![media(2, "News", 30)]),
        ];
        let state = WalkerState::new(&slots);
        // Noon cursor, boundary at 14:00: flood fits two whole 45-minute
        // items and the third overruns to 14:15
        let mut walker = Walker::new(&slots, state, start_time());
        let mut r = rng();

        let mut titles = Vec::new();
        for _ in 0..4 {
            titles.push(walker.step(&mut r).unwrap().media_item.title);
        }
        assert_eq!(titles, vec!["Loop", "Loop", "Loop", "News"]);
    }

    #[test]
    fn test_empty_slot_uses_fallback_filler() {
        let mut bare = slot(0, PlayoutMode::One);
        bare.fallback_filler_id = Some(99);
        let mut empty_slot = resolved(bare, Vec::new());
        empty_slot.fallback = vec![media(50, "Interstitial", 5)];

        let slots = vec![
            empty_slot,
            resolved(slot(1, PlayoutMode::One), vec![media(2, "Real", 30)]),
        ];
        let state = WalkerState::new(&slots);
        let mut walker = Walker::new(&slots, state, start_time());
        let mut r = rng();

        let first = walker.step(&mut r).unwrap();
        assert_eq!(first.media_item.title, "Interstitial");
        assert_eq!(first.kind, PlannedKind::Filler);
        let second = walker.step(&mut r).unwrap();
        assert_eq!(second.media_item.title, "Real");
    }

    #[test]
    fn test_all_empty_schedule_yields_none() {
        let slots = vec![resolved(slot(0, PlayoutMode::One), Vec::new())];
        let state = WalkerState::new(&slots);
        let mut walker = Walker::new(&slots, state, start_time());
        assert!(walker.step(&mut rng()).is_none());
    }

    #[test]
    fn test_tail_filler_fills_gap_before_fixed_start() {
        let mut fixed = slot(0, PlayoutMode::One);
        fixed.start_type = "fixed".to_string();
        fixed.fixed_start_time = Some("12:30:00".to_string());
        fixed.tail_filler_id = Some(7);
        let mut with_tail = resolved(fixed, vec![media(1, "Feature", 60)]);
        with_tail.tail = vec![media(60, "Short", 10)];

        let slots = vec![with_tail];
        let state = WalkerState::new(&slots);
        // Cursor at 12:00, boundary 12:30: three whole 10-minute shorts fit
        let mut walker = Walker::new(&slots, state, start_time());
        let mut r = rng();

        for expected_start in ["12:00", "12:10", "12:20"] {
            let filler = walker.step(&mut r).unwrap();
            assert_eq!(filler.kind, PlannedKind::Filler);
            assert_eq!(filler.start.format("%H:%M").to_string(), expected_start);
        }
        let feature = walker.step(&mut r).unwrap();
        assert_eq!(feature.media_item.title, "Feature");
        assert_eq!(feature.start.format("%H:%M").to_string(), "12:30");
    }

    #[test]
    fn test_walker_state_round_trips_through_json() {
        let slots = vec![resolved(
            slot(0, PlayoutMode::Flood),
            vec![media(1, "A", 30), media(2, "B", 30)],
        )];
        let state = WalkerState::new(&slots);
        let mut walker = Walker::new(&slots, state, start_time());
        let mut r = rng();
        let first = walker.step(&mut r).unwrap();

        let json = serde_json::to_string(&walker.state).unwrap();
        let restored: WalkerState = serde_json::from_str(&json).unwrap();
        let restored = restored.restore(&slots);
        let mut resumed = Walker::new(&slots, restored, first.end);

        let second = resumed.step(&mut r).unwrap();
        assert_eq!(second.start, first.end);
        assert_ne!(second.media_item.id, first.media_item.id);
    }

    #[test]
    fn test_group_by_show_keeps_singletons_apart() {
        let mut a1 = media(1, "E1", 30);
        a1.show_title = Some("Show A".to_string());
        let mut a2 = media(2, "E2", 30);
        a2.show_title = Some("Show A".to_string());
        let b = media(3, "Film", 90);

        let groups = group_by_show(&[a1, a2, b]);
        assert_eq!(groups, vec![vec![0, 1], vec![2]]);
    }
}
