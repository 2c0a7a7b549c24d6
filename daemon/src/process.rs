//! Child-process log tailing, grounded on `original_source/include/RegBan.h`'s
//! `Process`/`check_process`. `tokio::process::Command` with a piped stdout
//! replaces the manual `pipe2(O_NONBLOCK)` + `fork`/`execv` there; line
//! framing and the restart policy carry over unchanged.

use crate::settings::{CompiledPattern, ProcessSettings};
use regband_common::{RegbandError, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};

/// One configured log source: the shell command that produces it, its
/// compiled patterns, and the currently-running child (if any).
pub struct ProcessWatcher {
    pub name: String,
    command: String,
    pub patterns: Vec<CompiledPattern>,
    child: Child,
    lines: tokio::io::Lines<BufReader<ChildStdout>>,
}

impl ProcessWatcher {
    pub fn spawn(settings: &ProcessSettings, patterns: Vec<CompiledPattern>) -> Result<Self> {
        let (child, lines) = spawn_command(&settings.command)?;
        Ok(ProcessWatcher { name: settings.name.clone(), command: settings.command.clone(), patterns, child, lines })
    }

    /// Reads the next framed line from the child's stdout. `Ok(None)` means
    /// the child exited cleanly (EOF) and has already been respawned by the
    /// caller's restart policy; callers should loop and call again.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        self.lines
            .next_line()
            .await
            .map_err(|e| RegbandError::ChildExited { name: self.name.clone(), code: e.raw_os_error().unwrap_or(-1) })
    }

    /// Waits for the child to exit, applies the restart policy, and
    /// replaces `self` with a fresh process. A nonzero, non-signal exit
    /// status is fatal, matching the original's `throw` on nonzero rc.
    pub async fn restart(&mut self, restart_usleep: i64) -> Result<()> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| RegbandError::ChildExited { name: self.name.clone(), code: e.raw_os_error().unwrap_or(-1) })?;

        match status.code() {
            Some(0) | None => {
                tracing::info!(process = %self.name, "restarting");
                if restart_usleep > 0 {
                    tokio::time::sleep(std::time::Duration::from_micros(restart_usleep as u64)).await;
                }
                let (child, lines) = spawn_command(&self.command)?;
                self.child = child;
                self.lines = lines;
                Ok(())
            }
            Some(code) => Err(RegbandError::ChildExited { name: self.name.clone(), code }),
        }
    }
}

fn spawn_command(command: &str) -> Result<(Child, tokio::io::Lines<BufReader<ChildStdout>>)> {
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdout(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RegbandError::Configuration(format!("could not run \"/bin/sh -c '{command}'\": {e}")))?;
    let stdout = child.stdout.take().expect("child spawned with piped stdout");
    let lines = BufReader::new(stdout).lines();
    Ok((child, lines))
}
