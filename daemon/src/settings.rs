//! YAML settings schema and loading, grounded on `original_source/src/main.cpp`'s
//! settings tree and `spec.md` §6.

use regband_common::range_table::IpRangeTable;
use regband_common::score_table::{ScoreTable, ScoreTier};
use regband_common::scoring::Decay;
use regband_common::{IpValue, RegbandError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

const IP_TOKEN: &str = "{{ip}}";
const IP_REGEXP: &str = r"([0-9a-f:\.]+)";

const VALID_TABLE_TYPES: &[&str] = &["inet", "ip", "ip6", "bridge", "arp", "unspec"];

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub cleanupinterval: u64,
    #[serde(default)]
    pub restartusleep: i64,
    #[serde(default)]
    pub statefile: String,
    pub nft: NftSettings,
    #[serde(default)]
    pub processes: Vec<ProcessSettings>,
    #[serde(default)]
    pub rangetables: Vec<RangeTableSettings>,
    pub scores: ScoresSettings,
}

#[derive(Debug, Deserialize)]
pub struct NftSettings {
    #[serde(rename = "type")]
    pub table_type: String,
    pub table: String,
    #[serde(default)]
    pub ipv4set: Option<String>,
    #[serde(default)]
    pub ipv6set: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProcessSettings {
    pub command: String,
    pub name: String,
    #[serde(default)]
    pub patterns: Vec<PatternSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PatternSettings {
    pub pattern: String,
    pub score: i64,
}

#[derive(Debug, Deserialize)]
pub struct RangeTableSettings {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub cidr: Option<u8>,
    #[serde(default)]
    pub score: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ScoresSettings {
    pub decay: DecaySettings,
    #[serde(default)]
    pub table: HashMap<i64, TierSettings>,
}

#[derive(Debug, Deserialize)]
pub struct DecaySettings {
    pub amount: i64,
    pub per: u64,
}

#[derive(Debug, Deserialize)]
pub struct TierSettings {
    pub bantime: u64,
    pub score: i64,
}

/// Loads settings from a file path, or from standard input when `source`
/// is `"-"`.
pub fn load(source: &str) -> Result<Settings> {
    let text = if source == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(Path::new(source))?
    };
    let settings: Settings = serde_yaml::from_str(&text)?;
    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &Settings) -> Result<()> {
    if !VALID_TABLE_TYPES.contains(&settings.nft.table_type.as_str()) {
        return Err(RegbandError::Configuration(format!(
            "invalid nft.type {:?}, use one of {:?}",
            settings.nft.table_type, VALID_TABLE_TYPES
        )));
    }
    if settings.restartusleep < 0 {
        return Err(RegbandError::Configuration("restartusleep must not be negative".into()));
    }
    Ok(())
}

/// Substitutes the literal token `{{ip}}` with `IP_REGEXP`. Any other
/// `{{...}}` token is a fatal configuration error.
pub fn fill_template(pattern: &str) -> Result<String> {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start..];
        let end = after.find("}}").ok_or_else(|| RegbandError::Configuration(format!("unterminated template token in {pattern:?}")))?;
        let token = &after[..end + 2];
        if token == IP_TOKEN {
            out.push_str(IP_REGEXP);
        } else {
            return Err(RegbandError::Configuration(format!("unknown template token {token:?} in pattern {pattern:?}")));
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// A pattern ready to be matched: a compiled, whole-line-anchored regex
/// with exactly one capturing group, plus the score it contributes.
pub struct CompiledPattern {
    pub regex: regex::Regex,
    pub score: i64,
}

pub fn compile_pattern(settings: &PatternSettings) -> Result<CompiledPattern> {
    let substituted = fill_template(&settings.pattern)?;
    let anchored = format!("^(?:{substituted})$");
    let regex = regex::Regex::new(&anchored).map_err(|e| RegbandError::InvalidPattern { pattern: settings.pattern.clone(), reason: e.to_string() })?;
    if regex.captures_len() != 2 {
        return Err(RegbandError::InvalidPattern {
            pattern: settings.pattern.clone(),
            reason: format!("expected exactly one capturing group, found {}", regex.captures_len() - 1),
        });
    }
    Ok(CompiledPattern { regex, score: settings.score })
}

/// Builds the range/whitelist table from inline and CSV-sourced entries.
pub fn build_range_table(tables: &[RangeTableSettings]) -> Result<IpRangeTable<i64>> {
    let mut ranges = IpRangeTable::new();
    for entry in tables {
        if let Some(filename) = &entry.filename {
            let mut reader = csv::ReaderBuilder::new().has_headers(false).from_path(filename)?;
            for record in reader.records() {
                let record = record.map_err(|e| RegbandError::Configuration(format!("{filename}: {e}")))?;
                insert_range_row(&mut ranges, &record[0], &record[1], &record[2])?;
            }
        } else {
            let ip = entry.ip.as_deref().ok_or_else(|| RegbandError::Configuration("rangetables entry missing ip".into()))?;
            let cidr = entry.cidr.ok_or_else(|| RegbandError::Configuration("rangetables entry missing cidr".into()))?;
            let score = entry.score.ok_or_else(|| RegbandError::Configuration("rangetables entry missing score".into()))?;
            insert_range(&mut ranges, ip, cidr, score)?;
        }
    }
    Ok(ranges)
}

fn insert_range_row(ranges: &mut IpRangeTable<i64>, ip: &str, cidr: &str, score: &str) -> Result<()> {
    let cidr: u8 = cidr.parse().map_err(|_| RegbandError::Configuration(format!("invalid cidr {cidr:?}")))?;
    let score: i64 = score.parse().map_err(|_| RegbandError::Configuration(format!("invalid score {score:?}")))?;
    insert_range(ranges, ip, cidr, score)
}

fn insert_range(ranges: &mut IpRangeTable<i64>, ip: &str, cidr: u8, score: i64) -> Result<()> {
    let value = IpValue::parse(ip).ok_or_else(|| RegbandError::Configuration(format!("invalid range ip {ip:?}")))?;
    *ranges.find_or_insert(value, cidr)?.1 = score;
    Ok(())
}

/// Builds the score threshold table from the settings tree, with entries
/// applied in ascending `lower_bound` order so duplicate bounds resolve
/// the way [`ScoreTable::add`] documents.
pub fn build_score_table(scores: &ScoresSettings) -> ScoreTable {
    let mut table = ScoreTable::new(0);
    let mut entries: Vec<_> = scores.table.iter().collect();
    entries.sort_by_key(|(bound, _)| **bound);
    for (bound, tier) in entries {
        table.add(ScoreTier { lower_bound: *bound, bantime_secs: tier.bantime, add_score: tier.score });
    }
    table
}

pub fn build_decay(scores: &ScoresSettings) -> Decay {
    Decay { amount: scores.decay.amount, interval_secs: scores.decay.per }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_template_substitutes_ip_token() {
        assert_eq!(fill_template("failed for {{ip}}").unwrap(), format!("failed for {IP_REGEXP}"));
    }

    #[test]
    fn fill_template_rejects_unknown_token() {
        assert!(fill_template("{{unknown}}").is_err());
    }

    #[test]
    fn compile_pattern_requires_one_group() {
        let bad = PatternSettings { pattern: "no groups here".into(), score: 1 };
        assert!(compile_pattern(&bad).is_err());

        let good = PatternSettings { pattern: "auth failure from {{ip}}".into(), score: 10 };
        let compiled = compile_pattern(&good).unwrap();
        let caps = compiled.regex.captures("auth failure from 1.2.3.4").unwrap();
        assert_eq!(&caps[1], "1.2.3.4");
    }

    #[test]
    fn compile_pattern_anchors_whole_line() {
        let p = PatternSettings { pattern: "bad ip {{ip}}".into(), score: 1 };
        let compiled = compile_pattern(&p).unwrap();
        assert!(compiled.regex.is_match("bad ip 1.2.3.4"));
        assert!(!compiled.regex.is_match("prefix bad ip 1.2.3.4"));
        assert!(!compiled.regex.is_match("bad ip 1.2.3.4 suffix"));
    }

    #[test]
    fn validate_rejects_unknown_table_type() {
        let settings = Settings {
            cleanupinterval: 60,
            restartusleep: 0,
            statefile: String::new(),
            nft: NftSettings { table_type: "nope".into(), table: "t".into(), ipv4set: None, ipv6set: None },
            processes: vec![],
            rangetables: vec![],
            scores: ScoresSettings { decay: DecaySettings { amount: 1, per: 60 }, table: HashMap::new() },
        };
        assert!(validate(&settings).is_err());
    }

    #[test]
    fn validate_rejects_negative_restart_sleep() {
        let settings = Settings {
            cleanupinterval: 60,
            restartusleep: -1,
            statefile: String::new(),
            nft: NftSettings { table_type: "inet".into(), table: "t".into(), ipv4set: None, ipv6set: None },
            processes: vec![],
            rangetables: vec![],
            scores: ScoresSettings { decay: DecaySettings { amount: 1, per: 60 }, table: HashMap::new() },
        };
        assert!(validate(&settings).is_err());
    }

    #[test]
    fn build_range_table_from_inline_entries() {
        let tables = vec![RangeTableSettings { filename: None, ip: Some("10.0.0.0".into()), cidr: Some(8), score: Some(-1) }];
        let ranges = build_range_table(&tables).unwrap();
        assert_eq!(ranges.len(), 1);
        let ip = IpValue::parse("10.1.2.3").unwrap();
        assert_eq!(ranges.find_range_for(ip).2, Some(&-1));
    }

    #[test]
    fn build_score_table_applies_tiers_in_order() {
        let mut table = HashMap::new();
        table.insert(10, TierSettings { bantime: 60, score: 5 });
        table.insert(100, TierSettings { bantime: 3600, score: 0 });
        let scores = ScoresSettings { decay: DecaySettings { amount: 1, per: 60 }, table };
        let score_table = build_score_table(&scores);
        assert_eq!(score_table.lookup(15).add_score, 5);
        assert_eq!(score_table.lookup(100).bantime_secs, 3600);
    }
}
