use anyhow::{Context, Result};
use clap::Parser;

use occ_messaging::{
    bench,
    cli::{BenchConfig, Cli},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = BenchConfig::from_cli(&cli)?;

    let runtime = bench::build_runtime(&config)?;
    let report = runtime.block_on(bench::run(&config))?;

    if config.json {
        let encoded = serde_json::to_string_pretty(&report).context("failed to encode report")?;
        println!("{encoded}");
    } else {
        println!("{report}");
    }

    Ok(())
}
