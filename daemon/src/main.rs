//! regband daemon entry point.

mod args;
mod banset;
mod engine;
mod process;
mod settings;
mod state;

use args::Args;
use banset::BanSetDriver;
use clap::Parser;
use engine::Engine;
use process::ProcessWatcher;
use regband_common::scoring::ScoringState;
use regband_common::RegbandError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "regband=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.diff {
        println!("{}", option_env!("REGBAND_BUILD_DIFF").unwrap_or("No diff available"));
        return;
    }

    match run(args).await {
        Ok(()) => std::process::exit(0),
        Err(RegbandError::ChildExited { .. }) => std::process::exit(1),
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(255);
        }
    }
}

async fn run(args: Args) -> regband_common::Result<()> {
    let settings_path = args.settings.ok_or_else(|| RegbandError::Configuration("the SETTINGS argument is required unless --diff is given".into()))?;
    let settings = settings::load(&settings_path)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), dry_run = args.dry_run, "starting regband");

    let ranges = settings::build_range_table(&settings.rangetables)?;
    let thresholds = settings::build_score_table(&settings.scores);
    let decay = settings::build_decay(&settings.scores);
    let v4_enabled = settings.nft.ipv4set.is_some();
    let v6_enabled = settings.nft.ipv6set.is_some();
    let scoring = ScoringState::new(ranges, thresholds, decay, v4_enabled, v6_enabled);

    let banset = if args.dry_run {
        None
    } else {
        Some(BanSetDriver::initialize(
            &settings.nft.table_type,
            &settings.nft.table,
            settings.nft.ipv4set.as_deref(),
            settings.nft.ipv6set.as_deref(),
        )?)
    };

    let mut processes = Vec::with_capacity(settings.processes.len());
    for process_settings in &settings.processes {
        let mut patterns = Vec::with_capacity(process_settings.patterns.len());
        for pattern_settings in &process_settings.patterns {
            patterns.push(settings::compile_pattern(pattern_settings)?);
        }
        processes.push(ProcessWatcher::spawn(process_settings, patterns)?);
    }

    let mut engine = Engine::new(&settings, processes, scoring, banset, args.dry_run);
    engine.load_state();
    engine.run().await
}
