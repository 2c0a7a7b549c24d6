//! The per-IP score/decay state machine, grounded on the original's
//! `RegBan::adjust_ip_score`, `RegBan::cleanup` and `RegBan::handle_ip`.
//!
//! This module is deliberately free of I/O: it decides *what happened*
//! (a sighting, a whitelist hit, a ban) and leaves committing that
//! decision to a kernel set, or logging it, to the caller.

use crate::ip::IpValue;
use crate::ip_table::IpTable;
use crate::range_table::IpRangeTable;
use crate::score_table::{ScoreTable, ScoreTier};

/// Per-IP bookkeeping. `score` is never negative after any public
/// operation returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct BanEntry {
    pub last_scoretime: i64,
    pub last_bantime: Option<i64>,
    pub score: i64,
}

/// Governs how score decays with time: `amount` per `interval_secs`
/// seconds, applied with truncating integer division,
/// multiply-before-divide.
#[derive(Debug, Clone, Copy)]
pub struct Decay {
    pub amount: i64,
    pub interval_secs: u64,
}

impl Decay {
    fn delta(&self, elapsed_secs: i64) -> i64 {
        if self.interval_secs == 0 {
            return 0;
        }
        (elapsed_secs * self.amount) / self.interval_secs as i64
    }
}

/// What a call to [`ScoringState::handle_ip`] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The IP's family (v4/v6) is disabled; no state touched.
    FamilyDisabled,
    /// The IP falls in a whitelist range (`range value <= 0`); no state
    /// touched.
    Whitelisted,
    /// Score updated; no ban tier fired.
    Scored { score: i64 },
    /// Score updated and a ban tier with nonzero bantime fired.
    Banned { score: i64, bantime_secs: u64 },
}

/// Ties together the bucketed IP table, the whitelist/range table, and the
/// threshold table. Uses the same [`IpTable`] the range table is built on
/// so [`ScoringState::iter`] (and therefore the state-file format) yields a
/// deterministic bucket order rather than hash order.
pub struct ScoringState {
    entries: IpTable<BanEntry>,
    ranges: IpRangeTable<i64>,
    thresholds: ScoreTable,
    decay: Decay,
    v4_enabled: bool,
    v6_enabled: bool,
}

impl ScoringState {
    pub fn new(ranges: IpRangeTable<i64>, thresholds: ScoreTable, decay: Decay, v4_enabled: bool, v6_enabled: bool) -> Self {
        ScoringState { entries: IpTable::new(), ranges, thresholds, decay, v4_enabled, v6_enabled }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, ip: IpValue) -> Option<&BanEntry> {
        self.entries.find(ip)
    }

    fn adjust_score(&self, entry: &mut BanEntry, now: i64) {
        let elapsed = now - entry.last_scoretime;
        let delta = self.decay.delta(elapsed);
        entry.score = if entry.score <= delta { 0 } else { entry.score - delta };
        entry.last_scoretime = now;
    }

    /// Implements `spec.md` §4.5 step by step.
    pub fn handle_ip(&mut self, ip: IpValue, now: i64, matched_score: i64) -> Outcome {
        if (ip.is_v6() && !self.v6_enabled) || (!ip.is_v6() && !self.v4_enabled) {
            return Outcome::FamilyDisabled;
        }

        let mut matched_score = matched_score;
        let (_, _, range_value) = self.ranges.find_range_for(ip);
        if let Some(&r) = range_value {
            if r <= 0 {
                return Outcome::Whitelisted;
            }
            matched_score += r;
        }

        let (existed, entry) = self.entries.find_or_insert(ip);
        if existed {
            self.adjust_score(entry, now);
        }
        entry.last_scoretime = now;
        entry.score += matched_score;

        let tier: ScoreTier = self.thresholds.lookup(entry.score);
        entry.score += tier.add_score;

        if tier.bantime_secs > 0 {
            entry.last_bantime = Some(now);
            Outcome::Banned { score: entry.score, bantime_secs: tier.bantime_secs }
        } else {
            Outcome::Scored { score: entry.score }
        }
    }

    /// Applies decay to every tracked IP and removes any whose score has
    /// fallen to zero. Returns the removed IPs.
    pub fn cleanup(&mut self, now: i64) -> Vec<IpValue> {
        let decay = self.decay;
        // Collected up front: `IpTable` has no `iter_mut`, and walking it
        // while mutating entries in place would borrow it twice at once.
        let ips: Vec<IpValue> = self.entries.iter().map(|(ip, _)| ip).collect();
        let mut removed = Vec::new();
        for ip in ips {
            let Some(entry) = self.entries.find_mut(ip) else { continue };
            let elapsed = now - entry.last_scoretime;
            let delta = decay.delta(elapsed);
            entry.score = if entry.score <= delta { 0 } else { entry.score - delta };
            entry.last_scoretime = now;
            if entry.score == 0 {
                removed.push(ip);
            }
        }
        for &ip in &removed {
            self.entries.remove(ip);
        }
        removed
    }

    /// Restores entries from a state-file snapshot. `last_bantime` is not
    /// persisted and is always `None` after load.
    pub fn restore(&mut self, entries: impl IntoIterator<Item = (IpValue, i64, i64)>) {
        for (ip, last_scoretime, score) in entries {
            let (_, entry) = self.entries.find_or_insert(ip);
            *entry = BanEntry { last_scoretime, last_bantime: None, score };
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (IpValue, &BanEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds_for_s1_s2() -> ScoreTable {
        let mut t = ScoreTable::new(0);
        t.add(ScoreTier { lower_bound: 50, bantime_secs: 60, add_score: 0 });
        t
    }

    fn state(thresholds: ScoreTable, decay: Decay) -> ScoringState {
        ScoringState::new(IpRangeTable::new(), thresholds, decay, true, true)
    }

    #[test]
    fn s1_single_match_below_threshold() {
        let mut s = state(thresholds_for_s1_s2(), Decay { amount: 1, interval_secs: 60 });
        let ip = IpValue::parse("1.2.3.4").unwrap();
        let outcome = s.handle_ip(ip, 0, 10);
        assert_eq!(outcome, Outcome::Scored { score: 10 });
        assert_eq!(s.entry(ip).unwrap().score, 10);
    }

    #[test]
    fn s2_escalate_to_ban() {
        let mut s = state(thresholds_for_s1_s2(), Decay { amount: 1, interval_secs: 60 });
        let ip = IpValue::parse("1.2.3.4").unwrap();
        let outcome = s.handle_ip(ip, 0, 60);
        assert_eq!(outcome, Outcome::Banned { score: 60, bantime_secs: 60 });
        assert_eq!(s.entry(ip).unwrap().score, 60);
    }

    #[test]
    fn s3_whitelist_dominance() {
        let mut ranges = IpRangeTable::new();
        let net = IpValue::parse("10.0.0.0").unwrap();
        *ranges.find_or_insert(net, 8).unwrap().1 = -1;
        let mut s = ScoringState::new(ranges, ScoreTable::new(0), Decay { amount: 1, interval_secs: 60 }, true, true);

        let ip = IpValue::parse("10.1.2.3").unwrap();
        let outcome = s.handle_ip(ip, 0, 1000);
        assert_eq!(outcome, Outcome::Whitelisted);
        assert!(s.entry(ip).is_none());
    }

    #[test]
    fn s4_decay_to_zero_then_cleanup_removes() {
        let mut s = state(ScoreTable::new(0), Decay { amount: 1, interval_secs: 60 });
        let ip = IpValue::parse("1.2.3.4").unwrap();
        s.handle_ip(ip, 0, 5);
        assert_eq!(s.entry(ip).unwrap().score, 5);

        let removed = s.cleanup(600);
        assert_eq!(removed, vec![ip]);
        assert!(s.entry(ip).is_none());
    }

    #[test]
    fn decay_then_rematch_full_decay_resets() {
        let mut s = state(ScoreTable::new(0), Decay { amount: 1, interval_secs: 60 });
        let ip = IpValue::parse("1.2.3.4").unwrap();
        s.handle_ip(ip, 0, 10);
        // 600s * 1 / 60 = 10 >= 10, full decay
        let outcome = s.handle_ip(ip, 600, 10);
        assert_eq!(outcome, Outcome::Scored { score: 10 });
    }

    #[test]
    fn family_disabled_short_circuits() {
        let mut s = ScoringState::new(IpRangeTable::new(), ScoreTable::new(0), Decay { amount: 1, interval_secs: 60 }, false, true);
        let ip = IpValue::parse("1.2.3.4").unwrap();
        assert_eq!(s.handle_ip(ip, 0, 100), Outcome::FamilyDisabled);
        assert!(s.entry(ip).is_none());
    }

    #[test]
    fn tier_add_score_escalation_bump() {
        let mut thresholds = ScoreTable::new(0);
        thresholds.add(ScoreTier { lower_bound: 10, bantime_secs: 60, add_score: 5 });
        thresholds.add(ScoreTier { lower_bound: 100, bantime_secs: 3600, add_score: 0 });
        let mut s = state(thresholds, Decay { amount: 0, interval_secs: 60 });
        let ip = IpValue::parse("1.2.3.4").unwrap();
        // score becomes 15, lands in tier(10), bump +5 => 20
        let outcome = s.handle_ip(ip, 0, 15);
        assert_eq!(outcome, Outcome::Banned { score: 20, bantime_secs: 60 });
    }
}
