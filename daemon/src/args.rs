//! Command-line argument parsing.

use clap::Parser;

/// Fail2ban-style scoring daemon that bans IPs into nftables sets.
#[derive(Parser, Debug)]
#[command(author, about, long_about = None)]
pub struct Args {
    /// Settings file path, or `-` to read YAML settings from standard input.
    /// Required unless `--diff` is given.
    pub settings: Option<String>,

    /// Skip ban-set initialization and commits; still scores and logs
    #[arg(short, long)]
    pub dry_run: bool,

    /// Print the embedded build diff, if any, and exit
    #[arg(long)]
    pub diff: bool,

    /// Print version information and exit
    #[arg(short, long, action = clap::ArgAction::Version)]
    version: (),
}
