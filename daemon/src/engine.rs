//! The event loop, grounded on `original_source/include/RegBan.h`'s `run`
//! and `check_process`. `select()` over raw fds plus a self-pipe to cancel
//! it becomes `tokio::select!` over each process's next line, a signal
//! stream, and a cleanup-interval sleep; no self-pipe is needed because
//! `tokio::select!` already cancels the other futures when one completes.

use crate::banset::BanSetDriver;
use crate::process::ProcessWatcher;
use crate::settings::Settings;
use crate::state;
use regband_common::scoring::{Outcome, ScoringState};
use regband_common::{IpValue, Result};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::signal::unix::{signal, SignalKind};

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

/// Ties settings, per-process watchers, the scoring core and the ban-set
/// driver together and drives them until a shutdown signal arrives.
pub struct Engine {
    processes: Vec<ProcessWatcher>,
    scoring: ScoringState,
    banset: Option<BanSetDriver>,
    cleanup_interval: Duration,
    restart_usleep: i64,
    statefile: String,
    dry_run: bool,
}

impl Engine {
    pub fn new(settings: &Settings, processes: Vec<ProcessWatcher>, scoring: ScoringState, banset: Option<BanSetDriver>, dry_run: bool) -> Self {
        Engine {
            processes,
            scoring,
            banset,
            cleanup_interval: Duration::from_secs(settings.cleanupinterval),
            restart_usleep: settings.restartusleep,
            statefile: settings.statefile.clone(),
            dry_run,
        }
    }

    /// Loads the state file, if configured, before the first run.
    pub fn load_state(&mut self) {
        if self.statefile.is_empty() {
            return;
        }
        let entries = state::read_state(&self.statefile, |msg| tracing::error!("{msg}"));
        self.scoring.restore(entries);
    }

    /// Runs until `SIGINT`/`SIGTERM`, persisting state on exit if
    /// configured. Returns once every process has been torn down.
    pub async fn run(&mut self) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        // An `interval` remembers its own next-due instant across ticks, so
        // sustained log traffic winning every `select!` race still lets
        // cleanup fire on schedule, unlike a `sleep` future rebuilt from
        // scratch each time the loop re-enters `select!`.
        let mut cleanup_tick = tokio::time::interval(self.cleanup_interval);
        cleanup_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.processes.is_empty() {
                break;
            }

            tokio::select! {
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    break;
                }
                _ = cleanup_tick.tick() => {
                    let removed = self.scoring.cleanup(now());
                    if !removed.is_empty() {
                        tracing::debug!(count = removed.len(), "cleanup removed decayed entries");
                    }
                }
                result = read_any(&mut self.processes) => {
                    let (idx, outcome) = result;
                    match outcome {
                        LineOutcome::Line(line) => self.handle_line(idx, &line)?,
                        LineOutcome::Eof => self.processes[idx].restart(self.restart_usleep).await?,
                    }
                }
            }
        }

        if !self.statefile.is_empty() {
            if let Err(e) = state::write_state(&self.statefile, &self.scoring) {
                tracing::error!("could not write state file {}: {e}", self.statefile);
            }
        }
        Ok(())
    }

    fn handle_line(&mut self, idx: usize, line: &str) -> Result<()> {
        let name = self.processes[idx].name.clone();
        // Collected up front so the per-match scoring below, which needs
        // `&mut self`, isn't blocked by a live borrow of `self.processes`.
        let matches: Vec<(i64, String)> = self.processes[idx]
            .patterns
            .iter()
            .filter_map(|pattern| pattern.regex.captures(line).map(|caps| (pattern.score, caps[1].to_string())))
            .collect();

        for (score, ip_str) in matches {
            let Some(ip) = IpValue::parse(&ip_str) else {
                tracing::error!("could not parse ip from {ip_str:?}");
                continue;
            };
            self.score_and_ban(ip, score, &name)?;
        }
        Ok(())
    }

    fn score_and_ban(&mut self, ip: IpValue, pattern_score: i64, process_name: &str) -> Result<()> {
        match self.scoring.handle_ip(ip, now(), pattern_score) {
            Outcome::FamilyDisabled => {
                tracing::debug!(process = process_name, %ip, "match, but this address family is disabled");
            }
            Outcome::Whitelisted => {
                tracing::info!(process = process_name, %ip, "match, but ip is always allowed");
            }
            Outcome::Scored { score } => {
                tracing::info!(process = process_name, %ip, score, "match");
            }
            Outcome::Banned { score, bantime_secs } => {
                tracing::info!(process = process_name, %ip, score, bantime_secs, "match, banning");
                if !self.dry_run {
                    if let Some(banset) = &mut self.banset {
                        banset.add_ip(ip, bantime_secs);
                        banset.commit_batch()?;
                    }
                }
            }
        }
        Ok(())
    }
}

enum LineOutcome {
    Line(String),
    Eof,
}

/// Polls every process for its next line and returns the first one ready,
/// tagged with its index. A `ChildExited` error bubbles straight up since
/// the caller treats any read error identically to a confirmed nonzero
/// exit once `restart` is called.
async fn read_any(processes: &mut [ProcessWatcher]) -> (usize, LineOutcome) {
    let polls: Vec<_> = processes.iter_mut().enumerate().map(|(idx, p)| Box::pin(async move { (idx, p.next_line().await) })).collect();
    let (result, _idx, _rest) = futures_util::future::select_all(polls).await;
    match result {
        (idx, Ok(Some(line))) => (idx, LineOutcome::Line(line)),
        (idx, Ok(None)) => (idx, LineOutcome::Eof),
        (idx, Err(_)) => (idx, LineOutcome::Eof),
    }
}
