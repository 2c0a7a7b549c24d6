//! Ordered score → (bantime, add_score) step function, grounded on the
//! original's `ScoreTable`.

/// One tier of the threshold table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreTier {
    pub lower_bound: i64,
    pub bantime_secs: u64,
    pub add_score: i64,
}

/// Ascending-`lower_bound`-ordered list of tiers, always containing the
/// `(0, 0, base_add_score)` sentinel so lookup never fails.
pub struct ScoreTable {
    tiers: Vec<ScoreTier>,
}

impl ScoreTable {
    pub fn new(base_add_score: i64) -> Self {
        ScoreTable {
            tiers: vec![ScoreTier { lower_bound: 0, bantime_secs: 0, add_score: base_add_score }],
        }
    }

    /// Inserts a tier, preserving ascending `lower_bound` order. When a
    /// duplicate `lower_bound` is added, it is inserted after existing
    /// entries with the same bound, so the most recently added one wins
    /// on lookup (lookup takes the last entry with `lower_bound <= score`).
    pub fn add(&mut self, tier: ScoreTier) {
        let pos = self.tiers.partition_point(|t| t.lower_bound <= tier.lower_bound);
        self.tiers.insert(pos, tier);
    }

    /// Returns the rightmost tier whose `lower_bound <= score`. Never
    /// fails: the sentinel guarantees a match for any `score >= 0`, and
    /// for negative scores (which should not occur after any public
    /// operation) it still returns the sentinel.
    pub fn lookup(&self, score: i64) -> ScoreTier {
        let idx = self.tiers.partition_point(|t| t.lower_bound <= score);
        self.tiers[idx.saturating_sub(1).min(self.tiers.len() - 1)]
    }
}
