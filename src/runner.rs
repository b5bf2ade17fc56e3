use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use anyhow::{anyhow, bail, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::time::{interval, sleep, Duration};
use tracing::warn;

use crate::cli::Cli;
use crate::config::{self, Family, Protocol, TrafGenConfig};
use crate::dns;
use crate::metrics::{ConfigEcho, MetricsMgr};
use crate::qgen::{self, GenConfig, SharedGenerator};
use crate::rate::{FlowScheduler, SharedBucket, TokenBucket};
use crate::trafgen::TrafGen;

/// Resolve the target to an address of the requested family.
async fn resolve_target(target: &str, port: u16, family: Family) -> Result<SocketAddr> {
	let addrs = tokio::net::lookup_host((target, port))
		.await
		.map_err(|e| anyhow!("unable to resolve target address: {}: {}", target, e))?;
	for addr in addrs {
		if family.matches(&addr) {
			return Ok(addr);
		}
	}
	bail!("name did not resolve to valid IP address for this inet family")
}

/// Delay, batch and concurrency fall back to protocol-dependent defaults
/// when not explicitly given: TCP paces by session, so it gets slower,
/// larger batches across more generators.
fn effective_params(cli: &Cli, protocol: Protocol) -> (u64, u64, u64) {
	match protocol {
		Protocol::Udp => (
			cli.delay_ms.unwrap_or(1),
			cli.qcount.unwrap_or(10),
			cli.tcount.unwrap_or(10),
		),
		Protocol::Tcp => (
			cli.delay_ms.unwrap_or(1000),
			cli.qcount.unwrap_or(100),
			cli.tcount.unwrap_or(30),
		),
	}
}

/// Build everything, run the fleet, finalize metrics. Must be called
/// from within a LocalSet on a current-thread runtime.
pub async fn run(cli: Cli) -> Result<()> {
	let family = Family::parse(&cli.family)?;
	let protocol = Protocol::parse(&cli.protocol)?;
	let target = resolve_target(&cli.target, cli.port, family).await?;
	let (s_delay, batch_count, concurrency) = effective_params(&cli, protocol);

	let gen_config = GenConfig {
		qname: cli.record.clone(),
		qtype: dns::parse_qtype(&cli.qtype)?,
		qclass: dns::parse_qclass(&cli.qclass)?,
		dnssec: cli.dnssec,
		loops: cli.loops,
	};
	let mut generator = qgen::build(gen_config, &cli.generator, cli.file.as_deref(), &cli.genopts)
		.map_err(|e| anyhow!("generator error: {}", e))?;
	if cli.randomize {
		generator.randomize();
	}
	let finite = cli.loops > 0;
	let gen_name = generator.name();
	let gen_size = generator.size();
	let qgen: SharedGenerator = Rc::new(RefCell::new(generator));

	// one bucket per process, shared by every traffic generator; the
	// flow scheduler rewrites it in place on its own timer
	let mut rate_limit: Option<SharedBucket> = None;
	if cli.qps > 0 {
		rate_limit = Some(Rc::new(RefCell::new(TokenBucket::new(cli.qps, cli.qps))));
	} else if let Some(spec) = &cli.qps_flow {
		let flows = config::parse_flow_spec(spec)?;
		let bucket: SharedBucket = Rc::new(RefCell::new(TokenBucket::unlimited()));
		rate_limit = Some(bucket.clone());
		tokio::task::spawn_local(FlowScheduler::new(flows, bucket).run());
	}

	let traf_config = Rc::new(TrafGenConfig {
		target,
		family,
		protocol,
		r_timeout: cli.timeout_secs,
		s_delay,
		batch_count,
	});

	let cmdline = std::env::args().collect::<Vec<_>>().join(" ");
	let echo = ConfigEcho {
		target: cli.target.clone(),
		target_address: target.ip().to_string(),
		port: cli.port,
		family: family.to_string(),
		protocol: protocol.to_string(),
		concurrency,
		batch_count,
		delay_ms: s_delay,
		timeout_secs: cli.timeout_secs,
		qps_limit: cli.qps,
		qps_flow: cli.qps_flow.clone(),
		generator: gen_name.to_string(),
		loops: cli.loops,
		qname: cli.record.clone(),
		qtype: cli.qtype.clone(),
		qclass: cli.qclass.clone(),
		dnssec: cli.dnssec,
		runtime_limit_secs: cli.limit_secs,
	};
	let mut metrics_mgr = MetricsMgr::new(cmdline, echo, cli.output.clone(), cli.verbosity);

	if cli.verbosity > 0 {
		println!(
			"flaming target {} ({}) on port {} with {} concurrent generators, \
			each sending {} queries every {}ms over {}",
			cli.target, target.ip(), cli.port, concurrency, batch_count, s_delay, protocol,
		);
		println!("query generator [{}] contains {} record(s)", gen_name, gen_size);
		if cli.randomize {
			println!("query list randomized");
		}
	}

	let (stop_tx, stop_rx) = watch::channel(false);

	let mut handles = Vec::with_capacity(concurrency as usize);
	for _ in 0..concurrency {
		let trafgen = TrafGen::new(
			traf_config.clone(),
			qgen.clone(),
			rate_limit.clone(),
			metrics_mgr.create_sink(),
			stop_rx.clone(),
		);
		handles.push(tokio::task::spawn_local(trafgen.run()));
	}

	metrics_mgr.start_progress(stop_rx.clone());

	// control task: SIGINT/SIGTERM, the runtime limit, and the finite
	// generator exhaustion poll all funnel into one idempotent stop
	let mut sigint = signal(SignalKind::interrupt())?;
	let mut sigterm = signal(SignalKind::terminate())?;
	let sinks = metrics_mgr.sinks();
	let qgen_poll = qgen.clone();
	let limit = cli.limit_secs;
	let verbosity = cli.verbosity;
	let r_timeout = cli.timeout_secs;
	tokio::task::spawn_local(async move {
		let limit_sleep = sleep(Duration::from_secs(limit));
		tokio::pin!(limit_sleep);
		let mut exhaust_poll = interval(Duration::from_millis(500));
		loop {
			tokio::select! {
				_ = sigint.recv() => break,
				_ = sigterm.recv() => break,
				_ = &mut limit_sleep, if limit > 0 => break,
				_ = exhaust_poll.tick(), if finite => {
					if qgen_poll.borrow().finished() {
						break;
					}
				}
			}
		}
		let in_flight: usize = sinks.iter().map(|s| s.borrow().in_flight()).sum();
		if in_flight > 0 && verbosity > 0 {
			println!(
				"stopping, waiting up to {}s for in flight queries to finish...",
				r_timeout,
			);
		}
		let _ = stop_tx.send(true);
	});

	for handle in handles {
		match handle.await {
			Ok(Ok(())) => {}
			Ok(Err(e)) => warn!("traffic generator failed: {}", e),
			Err(e) => warn!("traffic generator task failed: {}", e),
		}
	}

	metrics_mgr.finalize()
}
