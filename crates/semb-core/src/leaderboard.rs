use crate::{domain::Username, marathon::Marathon};

/// One ranked row of the standings. Derived, never stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderboardEntry {
    pub username: Username,
    pub delta: i64,
    pub rank: usize,
}

/// Aggregate per-participant deltas into ranked standings.
///
/// Sums `last_known - baseline` over resolved entries with a captured
/// baseline; degraded entries still contribute their last-known delta,
/// unresolved (NotFound) entries never do. Ordered by descending aggregate
/// delta; ties broken by earliest baseline capture, then original
/// participant order, so output is deterministic across repeated calls.
/// Safe to call in any phase (no baselines yields all-zero deltas).
pub fn compute(marathon: &Marathon) -> Vec<LeaderboardEntry> {
    let mut rows: Vec<(Username, i64, u64, usize)> = marathon
        .participants
        .iter()
        .enumerate()
        .map(|(index, participant)| {
            let delta: i64 = participant
                .entries
                .iter()
                .filter(|e| e.aggregates())
                .map(|e| e.delta())
                .sum();
            let first_capture = participant
                .entries
                .iter()
                .filter_map(|e| e.baseline_seq)
                .min()
                .unwrap_or(u64::MAX);
            (participant.username.clone(), delta, first_capture, index)
        })
        .collect();

    rows.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)).then(a.3.cmp(&b.3)));

    rows.into_iter()
        .enumerate()
        .map(|(pos, (username, delta, _, _))| LeaderboardEntry {
            username,
            delta,
            rank: pos + 1,
        })
        .collect()
}
