//! Plaintext state-file checkpoint, grounded on the original's
//! `RegBan::read_state`/`write_state`.
//!
//! Format, one entry per IP:
//! ```text
//! "<ip-string>":
//!   last_scoretime: <unix-seconds>
//!   score: <integer>
//! ```
//! `last_bantime` is never persisted.

use regband_common::scoring::ScoringState;
use regband_common::IpValue;
use std::io::Write;
use std::path::Path;

pub fn write_state(path: &str, state: &ScoringState) -> std::io::Result<()> {
    let mut out = String::new();
    for (ip, entry) in state.iter() {
        out.push_str(&format!("\"{ip}\":\n"));
        out.push_str(&format!("  last_scoretime: {}\n", entry.last_scoretime));
        out.push_str(&format!("  score: {}\n", entry.score));
    }
    let mut file = std::fs::File::create(Path::new(path))?;
    file.write_all(out.as_bytes())
}

/// Parses the state file and returns `(ip, last_scoretime, score)` triples
/// for every recognized entry. Unparseable or unrecognized IPs are
/// reported to `on_error` and skipped; an unreadable state file is
/// reported via `Ok(vec![])` rather than propagated, since startup
/// continues with empty state (`spec.md` §7.6).
pub fn read_state(path: &str, mut on_error: impl FnMut(&str)) -> Vec<(IpValue, i64, i64)> {
    let text = match std::fs::read_to_string(Path::new(path)) {
        Ok(t) => t,
        Err(e) => {
            on_error(&format!("could not read state file {path}: {e}"));
            return Vec::new();
        }
    };

    let mut result = Vec::new();
    let mut lines = text.lines().peekable();
    while let Some(line) = lines.next() {
        let trimmed = line.trim();
        let Some(ip_str) = trimmed.strip_prefix('"').and_then(|s| s.strip_suffix("\":")) else {
            if !trimmed.is_empty() {
                on_error(&format!("malformed state entry header: {line:?}"));
            }
            continue;
        };
        let Some(ip) = IpValue::parse(ip_str) else {
            on_error(&format!("unrecognized IP in state file: {ip_str:?}"));
            // still consume the two indented lines that belong to this entry
            lines.next();
            lines.next();
            continue;
        };

        let mut last_scoretime = None;
        let mut score = None;
        for _ in 0..2 {
            let Some(field_line) = lines.next() else { break };
            let field_line = field_line.trim();
            if let Some(v) = field_line.strip_prefix("last_scoretime:") {
                last_scoretime = v.trim().parse::<i64>().ok();
            } else if let Some(v) = field_line.strip_prefix("score:") {
                score = v.trim().parse::<i64>().ok();
            }
        }

        match (last_scoretime, score) {
            (Some(t), Some(s)) => result.push((ip, t, s)),
            _ => on_error(&format!("malformed state entry for {ip_str:?}")),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use regband_common::range_table::IpRangeTable;
    use regband_common::score_table::ScoreTable;
    use regband_common::scoring::Decay;

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.txt");
        let path_str = path.to_str().unwrap();

        let mut state = ScoringState::new(IpRangeTable::new(), ScoreTable::new(0), Decay { amount: 1, interval_secs: 60 }, true, true);
        let ip = IpValue::parse("1.2.3.4").unwrap();
        state.handle_ip(ip, 1000, 42);
        write_state(path_str, &state).unwrap();

        let mut errors = Vec::new();
        let entries = read_state(path_str, |e| errors.push(e.to_string()));
        assert!(errors.is_empty());
        assert_eq!(entries, vec![(ip, 1000, 42)]);
    }

    #[test]
    fn unreadable_file_yields_empty_state() {
        let mut errors = Vec::new();
        let entries = read_state("/nonexistent/path/state.txt", |e| errors.push(e.to_string()));
        assert!(entries.is_empty());
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn malformed_ip_is_skipped_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.txt");
        std::fs::write(&path, "\"not-an-ip\":\n  last_scoretime: 1\n  score: 2\n").unwrap();

        let mut errors = Vec::new();
        let entries = read_state(path.to_str().unwrap(), |e| errors.push(e.to_string()));
        assert!(entries.is_empty());
        assert_eq!(errors.len(), 1);
    }
}
