//! Collection enumerators
//!
//! An enumerator decides which item of a collection plays next. Its state is
//! serialized into the playout anchor's `enumerator_state` column, so a
//! process restart resumes exactly where the previous run stopped: a shuffle
//! keeps its permutation and cursor, a random order keeps its no-repeat
//! history.
//!
//! Selection returns outcome values rather than throwing on empty
//! collections; the scheduler branches per slot.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};

use crate::db::PlaybackOrder;

/// Outcome of asking an enumerator for the next item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Index into the collection's item list
    Item(usize),
    /// The collection resolved to zero items
    Empty,
}

/// Persistable enumerator state, one per schedule slot.
///
/// `items_hash` fingerprints the resolved item-id list; when a smart
/// collection's result set changes, stale cursors reset instead of indexing
/// into a list that no longer matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "order", rename_all = "snake_case")]
pub enum Enumerator {
    Chronological {
        cursor: usize,
        items_hash: u64,
    },
    Shuffle {
        permutation: Vec<usize>,
        cursor: usize,
        items_hash: u64,
    },
    Random {
        recent: VecDeque<usize>,
        items_hash: u64,
    },
    RotatingShuffle {
        group_cursor: usize,
        #[serde(rename = "rotation_order")]
        order: Vec<usize>,
        cursor: usize,
        items_hash: u64,
    },
}

/// Fingerprint a resolved item-id list
pub fn items_hash(item_ids: &[i32]) -> u64 {
    let mut hasher = DefaultHasher::new();
    item_ids.hash(&mut hasher);
    hasher.finish()
}

impl Enumerator {
    /// Fresh enumerator for a playback order over `item_ids`
    pub fn new(order: PlaybackOrder, item_ids: &[i32]) -> Self {
        let hash = items_hash(item_ids);
        match order {
            PlaybackOrder::Chronological => Self::Chronological {
                cursor: 0,
                items_hash: hash,
            },
            PlaybackOrder::Shuffle => Self::Shuffle {
                permutation: Vec::new(),
                cursor: 0,
                items_hash: hash,
            },
            PlaybackOrder::Random => Self::Random {
                recent: VecDeque::new(),
                items_hash: hash,
            },
            PlaybackOrder::RotatingShuffle => Self::RotatingShuffle {
                group_cursor: 0,
                order: Vec::new(),
                cursor: 0,
                items_hash: hash,
            },
        }
    }

    fn stored_hash(&self) -> u64 {
        match self {
            Self::Chronological { items_hash, .. }
            | Self::Shuffle { items_hash, .. }
            | Self::Random { items_hash, .. }
            | Self::RotatingShuffle { items_hash, .. } => *items_hash,
        }
    }

    fn playback_order(&self) -> PlaybackOrder {
        match self {
            Self::Chronological { .. } => PlaybackOrder::Chronological,
            Self::Shuffle { .. } => PlaybackOrder::Shuffle,
            Self::Random { .. } => PlaybackOrder::Random,
            Self::RotatingShuffle { .. } => PlaybackOrder::RotatingShuffle,
        }
    }

    /// Restore from persisted state, resetting if the item set changed
    pub fn restore_or_reset(self, item_ids: &[i32]) -> Self {
        if self.stored_hash() == items_hash(item_ids) {
            self
        } else {
            Self::new(self.playback_order(), item_ids)
        }
    }

    /// Select the next item index.
    ///
    /// `groups` is consulted only by the rotating shuffle; each inner vec
    /// holds indices belonging to one group (e.g. one show).
    pub fn next<R: Rng>(
        &mut self,
        item_count: usize,
        groups: &[Vec<usize>],
        rng: &mut R,
    ) -> Selection {
        if item_count == 0 {
            return Selection::Empty;
        }

        match self {
            Self::Chronological { cursor, .. } => {
                let index = *cursor % item_count;
                *cursor = (index + 1) % item_count;
                Selection::Item(index)
            }

            Self::Shuffle {
                permutation,
                cursor,
                ..
            } => {
                // One permutation per full cycle; regenerate when exhausted
                if permutation.len() != item_count || *cursor >= permutation.len() {
                    *permutation = (0..item_count).collect();
                    permutation.shuffle(rng);
                    *cursor = 0;
                }
                let index = permutation[*cursor];
                *cursor += 1;
                Selection::Item(index)
            }

            Self::Random { recent, .. } => {
                let window = (item_count / 10).max(1).min(item_count.saturating_sub(1));
                recent.truncate(window);
                let index = loop {
                    let candidate = rng.gen_range(0..item_count);
                    if !recent.contains(&candidate) || window == 0 {
                        break candidate;
                    }
                };
                recent.push_front(index);
                recent.truncate(window.max(1));
                Selection::Item(index)
            }

            Self::RotatingShuffle {
                group_cursor,
                order,
                cursor,
                ..
            } => {
                if groups.is_empty() {
                    // No grouping available: behave like a plain shuffle
                    if order.len() != item_count || *cursor >= order.len() {
                        *order = (0..item_count).collect();
                        order.shuffle(rng);
                        *cursor = 0;
                    }
                } else if *cursor >= order.len() {
                    // Current group exhausted: rotate to the next group and
                    // shuffle within it
                    *group_cursor %= groups.len();
                    *order = groups[*group_cursor].clone();
                    order.shuffle(rng);
                    *cursor = 0;
                    *group_cursor = (*group_cursor + 1) % groups.len();
                }
                if order.is_empty() {
                    return Selection::Empty;
                }
                let index = order[*cursor].min(item_count - 1);
                *cursor += 1;
                Selection::Item(index)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(1984)
    }

    #[test]
    fn test_chronological_wraps_modulo_collection_size() {
        let ids = [10, 20, 30];
        let mut e = Enumerator::new(PlaybackOrder::Chronological, &ids);
        let mut r = rng();

        let picks: Vec<_> = (0..7).map(|_| e.next(3, &[], &mut r)).collect();
        assert_eq!(
            picks,
            vec![
                Selection::Item(0),
                Selection::Item(1),
                Selection::Item(2),
                Selection::Item(0),
                Selection::Item(1),
                Selection::Item(2),
                Selection::Item(0),
            ]
        );
    }

    #[test]
    fn test_empty_collection_yields_empty() {
        let mut e = Enumerator::new(PlaybackOrder::Chronological, &[]);
        assert_eq!(e.next(0, &[], &mut rng()), Selection::Empty);
    }

    #[test]
    fn test_shuffle_covers_every_item_each_cycle() {
        let ids: Vec<i32> = (0..12).collect();
        let mut e = Enumerator::new(PlaybackOrder::Shuffle, &ids);
        let mut r = rng();

        let mut seen: Vec<usize> = (0..12)
            .map(|_| match e.next(12, &[], &mut r) {
                Selection::Item(i) => i,
                Selection::Empty => panic!("unexpected empty"),
            })
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn test_shuffle_state_survives_serialization() {
        let ids: Vec<i32> = (0..8).collect();
        let mut e = Enumerator::new(PlaybackOrder::Shuffle, &ids);
        let mut r = rng();

        // Advance partway through the cycle
        let first: Vec<_> = (0..3).map(|_| e.next(8, &[], &mut r)).collect();

        // Round-trip through JSON as the playout anchor does
        let json = serde_json::to_string(&e).unwrap();
        let restored: Enumerator = serde_json::from_str(&json).unwrap();
        let mut restored = restored.restore_or_reset(&ids);

        // The remaining picks complete the same permutation
        let mut all: Vec<usize> = first
            .iter()
            .map(|s| match s {
                Selection::Item(i) => *i,
                Selection::Empty => panic!(),
            })
            .collect();
        for _ in 0..5 {
            match restored.next(8, &[], &mut r) {
                Selection::Item(i) => all.push(i),
                Selection::Empty => panic!(),
            }
        }
        all.sort_unstable();
        assert_eq!(all, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_changed_item_set_resets_state() {
        let ids: Vec<i32> = (0..8).collect();
        let mut e = Enumerator::new(PlaybackOrder::Chronological, &ids);
        let mut r = rng();
        e.next(8, &[], &mut r);
        e.next(8, &[], &mut r);

        let changed: Vec<i32> = (0..5).collect();
        let e = e.restore_or_reset(&changed);
        match e {
            Enumerator::Chronological { cursor, .. } => assert_eq!(cursor, 0),
            _ => panic!("order changed"),
        }
    }

    #[test]
    fn test_random_avoids_recent_repeats() {
        let ids: Vec<i32> = (0..30).collect();
        let mut e = Enumerator::new(PlaybackOrder::Random, &ids);
        let mut r = rng();

        // Window is max(1, 30/10) = 3: no pick may repeat within 3
        let picks: Vec<usize> = (0..200)
            .map(|_| match e.next(30, &[], &mut r) {
                Selection::Item(i) => i,
                Selection::Empty => panic!(),
            })
            .collect();
        for window in picks.windows(4) {
            let current = window[3];
            assert!(
                !window[..3].contains(&current),
                "repeat within no-repeat window: {:?}",
                window
            );
        }
    }

    #[test]
    fn test_random_single_item_collection_still_plays() {
        let mut e = Enumerator::new(PlaybackOrder::Random, &[42]);
        let mut r = rng();
        assert_eq!(e.next(1, &[], &mut r), Selection::Item(0));
        assert_eq!(e.next(1, &[], &mut r), Selection::Item(0));
    }

    #[test]
    fn test_rotating_shuffle_cycles_groups() {
        let ids: Vec<i32> = (0..6).collect();
        let groups = vec![vec![0usize, 1], vec![2, 3], vec![4, 5]];
        let mut e = Enumerator::new(PlaybackOrder::RotatingShuffle, &ids);
        let mut r = rng();

        let picks: Vec<usize> = (0..6)
            .map(|_| match e.next(6, &groups, &mut r) {
                Selection::Item(i) => i,
                Selection::Empty => panic!(),
            })
            .collect();

        // Each consecutive pair comes from one group
        let group_of = |i: usize| i / 2;
        assert_eq!(group_of(picks[0]), group_of(picks[1]));
        assert_eq!(group_of(picks[2]), group_of(picks[3]));
        assert_eq!(group_of(picks[4]), group_of(picks[5]));
        // And the three groups rotate without repeating
        let mut heads = vec![group_of(picks[0]), group_of(picks[2]), group_of(picks[4])];
        heads.sort_unstable();
        assert_eq!(heads, vec![0, 1, 2]);
    }

    #[test]
    fn test_items_hash_is_order_sensitive() {
        assert_ne!(items_hash(&[1, 2, 3]), items_hash(&[3, 2, 1]));
        assert_eq!(items_hash(&[1, 2, 3]), items_hash(&[1, 2, 3]));
    }
}
