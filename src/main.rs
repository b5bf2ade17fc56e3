mod cli;
mod config;
mod dns;
mod framer;
mod inflight;
mod metrics;
mod qgen;
mod rate;
mod runner;
mod trafgen;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

fn init_tracing(verbosity: u64) {
	let level = match verbosity {
		0 => Level::ERROR,
		1 => Level::INFO,
		2 => Level::DEBUG,
		_ => Level::TRACE,
	};
	// RUST_LOG takes precedence over the -v mapping
	let filter = EnvFilter::from_default_env().add_directive(level.into());
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	init_tracing(cli.verbosity);

	// single-threaded event loop: every generator, timer and socket runs
	// on this LocalSet
	let local = tokio::task::LocalSet::new();
	local.run_until(runner::run(cli)).await
}
