//! Error taxonomy shared between the scoring core and the daemon binary.

use thiserror::Error;

/// One variant per behavioral error kind. Configuration and child-process
/// failures are fatal; parse and kernel-set duplicate errors are logged
/// and the engine continues.
#[derive(Error, Debug)]
pub enum RegbandError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to read settings: {0}")]
    SettingsIo(#[from] std::io::Error),

    #[error("failed to parse settings: {0}")]
    SettingsParse(#[from] serde_yaml::Error),

    #[error("failed to read range table CSV: {0}")]
    RangeTableCsv(#[from] csv::Error),

    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("child process {name:?} exited with status {code}")]
    ChildExited { name: String, code: i32 },

    #[error("kernel set error: {0}")]
    BanSet(String),

    #[error("state file error: {0}")]
    StateFile(String),
}

pub type Result<T> = std::result::Result<T, RegbandError>;
