//! Pure ranking over partition snapshots.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::leaderboard::entry::LeaderboardEntry;

/// Score descending, then earliest `achieved_at`, then entry id so the order is total.
pub fn compare_entries(left: &LeaderboardEntry, right: &LeaderboardEntry) -> Ordering {
    right
        .score
        .cmp(&left.score)
        .then_with(|| left.achieved_at.cmp(&right.achieved_at))
        .then_with(|| left.entry_id.cmp(&right.entry_id))
}

/// Sorts `entries` and numbers them 1..N.
pub fn rank_entries(mut entries: Vec<LeaderboardEntry>) -> Vec<LeaderboardEntry> {
    entries.sort_by(compare_entries);
    for (position, entry) in entries.iter_mut().enumerate() {
        entry.rank = Some(position as u32 + 1);
    }
    entries
}

/// Rank of every player in a ranked snapshot, taken from the player's best row.
pub fn player_ranks(ranked: &[LeaderboardEntry]) -> BTreeMap<String, u32> {
    let mut ranks = BTreeMap::new();
    for entry in ranked {
        if let Some(rank) = entry.rank {
            ranks.entry(entry.player_id.clone()).or_insert(rank);
        }
    }
    ranks
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RankChange {
    pub player_id: String,
    pub previous: Option<u32>,
    pub current: u32,
}

/// Players whose rank differs between two snapshots. Players that entered the snapshot count as
/// moved; players that fell out of it are not reported.
pub fn rank_changes(
    previous: &BTreeMap<String, u32>,
    current: &BTreeMap<String, u32>,
) -> Vec<RankChange> {
    let mut changes: Vec<RankChange> = current
        .iter()
        .filter(|(player_id, rank)| previous.get(*player_id) != Some(*rank))
        .map(|(player_id, rank)| RankChange {
            player_id: player_id.clone(),
            previous: previous.get(player_id).copied(),
            current: *rank,
        })
        .collect();
    changes.sort_by_key(|change| change.current);
    changes
}

/// Rows within `radius` positions of the player's best row, or nothing if the player is absent.
pub fn window_around(
    ranked: &[LeaderboardEntry],
    player_id: &str,
    radius: usize,
) -> Vec<LeaderboardEntry> {
    let Some(index) = ranked.iter().position(|entry| entry.player_id == player_id) else {
        return Vec::new();
    };
    let start = index.saturating_sub(radius);
    let end = (index + radius + 1).min(ranked.len());
    ranked[start..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaderboard::partition::LeaderboardType;
    use chrono::{Duration, TimeZone, Utc};

    fn entry(id: &str, player: &str, score: i64, offset_secs: i64) -> LeaderboardEntry {
        LeaderboardEntry {
            entry_id: id.to_string(),
            player_id: player.to_string(),
            display_name: player.to_string(),
            score,
            achieved_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
                + Duration::seconds(offset_secs),
            bot_used: "b1".to_string(),
            leaderboard_type: LeaderboardType::Global,
            partition_id: "global_all-time".to_string(),
            rank: None,
        }
    }

    #[test]
    fn higher_score_ranks_first_in_either_order() {
        for entries in [
            vec![entry("a", "p1", 500, 0), entry("b", "p2", 300, 1)],
            vec![entry("b", "p2", 300, 1), entry("a", "p1", 500, 0)],
        ] {
            let ranked = rank_entries(entries);
            assert_eq!(ranked[0].score, 500);
            assert_eq!(ranked[0].rank, Some(1));
            assert_eq!(ranked[1].rank, Some(2));
        }
    }

    #[test]
    fn ties_go_to_the_earliest_achievement() {
        let ranked = rank_entries(vec![
            entry("z", "late", 700, 30),
            entry("y", "early", 700, 5),
            entry("x", "low", 10, 0),
        ]);
        let order: Vec<_> = ranked.iter().map(|e| e.player_id.as_str()).collect();
        assert_eq!(order, ["early", "late", "low"]);
        let ranks: Vec<_> = ranked.iter().filter_map(|e| e.rank).collect();
        assert_eq!(ranks, [1, 2, 3]);
    }

    #[test]
    fn player_rank_uses_best_row() {
        let ranked = rank_entries(vec![
            entry("a", "p1", 900, 0),
            entry("b", "p2", 800, 0),
            entry("c", "p1", 100, 0),
        ]);
        let ranks = player_ranks(&ranked);
        assert_eq!(ranks["p1"], 1);
        assert_eq!(ranks["p2"], 2);
    }

    #[test]
    fn reports_moved_and_new_players() {
        let previous = BTreeMap::from([("p1".to_string(), 1), ("p2".to_string(), 2)]);
        let current = BTreeMap::from([
            ("p3".to_string(), 1),
            ("p1".to_string(), 2),
            ("p2".to_string(), 3),
        ]);
        let changes = rank_changes(&previous, &current);
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].player_id, "p3");
        assert_eq!(changes[0].previous, None);
        assert_eq!(changes[1].previous, Some(1));

        assert!(rank_changes(&current, &current).is_empty());
    }

    #[test]
    fn window_is_clamped_to_snapshot() {
        let ranked = rank_entries(
            (0..6)
                .map(|i| entry(&format!("e{i}"), &format!("p{i}"), 100 - i, 0))
                .collect(),
        );
        let around = window_around(&ranked, "p0", 2);
        assert_eq!(around.len(), 3);
        let around = window_around(&ranked, "p3", 1);
        let players: Vec<_> = around.iter().map(|e| e.player_id.as_str()).collect();
        assert_eq!(players, ["p2", "p3", "p4"]);
        assert!(window_around(&ranked, "nobody", 3).is_empty());
    }
}
