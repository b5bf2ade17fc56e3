use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use hickory_proto::op::ResponseCode;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval_at, Duration, Instant as TokioInstant};

/// Shared handle to one traffic generator's metric sink.
pub type MetricsSink = Rc<RefCell<Metrics>>;

/// Counters and latency samples for a single traffic generator. The
/// engine reports events; nothing here blocks or allocates beyond the
/// latency vector push.
#[derive(Debug, Default)]
pub struct Metrics {
	port: u16,
	sends: u64,
	send_bytes: u64,
	receives: u64,
	timeouts: u64,
	bad_receives: u64,
	net_errors: u64,
	tcp_connections: u64,
	pool_exhausted: u64,
	in_flight: usize,
	latencies_ms: Vec<f64>,
	rcodes: BTreeMap<String, u64>,
}

impl Metrics {
	pub fn new() -> Metrics {
		Metrics::default()
	}

	/// The generator's ephemeral source port, used as its identity in
	/// the report.
	pub fn trafgen_id(&mut self, port: u16) {
		self.port = port;
	}

	pub fn send(&mut self, bytes: usize, count: usize, in_flight: usize) {
		self.sends += count as u64;
		self.send_bytes += bytes as u64;
		self.in_flight = in_flight;
	}

	pub fn receive(&mut self, send_time: Instant, rcode: ResponseCode, in_flight: usize) {
		self.receives += 1;
		self.latencies_ms.push(send_time.elapsed().as_secs_f64() * 1000.0);
		*self.rcodes.entry(rcode.to_string()).or_insert(0) += 1;
		self.in_flight = in_flight;
	}

	pub fn timeout(&mut self, in_flight: usize) {
		self.timeouts += 1;
		self.in_flight = in_flight;
	}

	pub fn bad_receive(&mut self, in_flight: usize) {
		self.bad_receives += 1;
		self.in_flight = in_flight;
	}

	pub fn net_error(&mut self) {
		self.net_errors += 1;
	}

	pub fn tcp_connection(&mut self) {
		self.tcp_connections += 1;
	}

	pub fn pool_exhausted(&mut self) {
		self.pool_exhausted += 1;
	}

	pub fn sends(&self) -> u64 {
		self.sends
	}

	pub fn receives(&self) -> u64 {
		self.receives
	}

	pub fn timeouts(&self) -> u64 {
		self.timeouts
	}

	pub fn bad_receives(&self) -> u64 {
		self.bad_receives
	}

	pub fn net_errors(&self) -> u64 {
		self.net_errors
	}

	pub fn tcp_connections(&self) -> u64 {
		self.tcp_connections
	}

	pub fn in_flight(&self) -> usize {
		self.in_flight
	}
}

/// Configuration echo written into the JSON report.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigEcho {
	pub target: String,
	pub target_address: String,
	pub port: u16,
	pub family: String,
	pub protocol: String,
	pub concurrency: u64,
	pub batch_count: u64,
	pub delay_ms: u64,
	pub timeout_secs: u64,
	pub qps_limit: u64,
	pub qps_flow: Option<String>,
	pub generator: String,
	pub loops: u64,
	pub qname: String,
	pub qtype: String,
	pub qclass: String,
	pub dnssec: bool,
	pub runtime_limit_secs: u64,
}

#[derive(Debug, Default, Serialize)]
struct Totals {
	sends: u64,
	send_bytes: u64,
	receives: u64,
	timeouts: u64,
	bad_receives: u64,
	net_errors: u64,
	tcp_connections: u64,
	pool_exhausted: u64,
}

#[derive(Debug, Default, Serialize)]
struct LatencySummary {
	count: usize,
	min_ms: f64,
	mean_ms: f64,
	stddev_ms: f64,
	p50_ms: f64,
	p95_ms: f64,
	p99_ms: f64,
	max_ms: f64,
}

#[derive(Debug, Serialize)]
struct TrafGenReport {
	port: u16,
	sends: u64,
	receives: u64,
	timeouts: u64,
}

#[derive(Debug, Serialize)]
struct Report<'a> {
	command_line: &'a str,
	config: &'a ConfigEcho,
	runtime_secs: f64,
	totals: Totals,
	latency_ms: LatencySummary,
	rcodes: BTreeMap<String, u64>,
	trafgens: Vec<TrafGenReport>,
}

/// Owns every generator's sink, drives the periodic progress line, and
/// produces the end-of-run summary and JSON report.
pub struct MetricsMgr {
	sinks: Vec<MetricsSink>,
	cmdline: String,
	config: ConfigEcho,
	output: Option<String>,
	verbosity: u64,
	started: Instant,
}

impl MetricsMgr {
	pub fn new(
		cmdline: String,
		config: ConfigEcho,
		output: Option<String>,
		verbosity: u64,
	) -> MetricsMgr {
		MetricsMgr {
			sinks: Vec::new(),
			cmdline,
			config,
			output,
			verbosity,
			started: Instant::now(),
		}
	}

	pub fn create_sink(&mut self) -> MetricsSink {
		let sink: MetricsSink = Rc::new(RefCell::new(Metrics::new()));
		self.sinks.push(sink.clone());
		sink
	}

	pub fn sinks(&self) -> Vec<MetricsSink> {
		self.sinks.clone()
	}

	/// Once-a-second progress line. Runs until the stop signal fires.
	pub fn start_progress(&self, mut stop_rx: watch::Receiver<bool>) {
		if self.verbosity == 0 {
			return;
		}
		let sinks = self.sinks.clone();
		let started = self.started;
		tokio::task::spawn_local(async move {
			let mut ticker =
				interval_at(TokioInstant::now() + Duration::from_secs(1), Duration::from_secs(1));
			let mut last_sends = 0u64;
			let mut last_receives = 0u64;
			loop {
				tokio::select! {
					_ = ticker.tick() => {
						let sends: u64 = sinks.iter().map(|s| s.borrow().sends()).sum();
						let receives: u64 = sinks.iter().map(|s| s.borrow().receives()).sum();
						let in_flight: usize = sinks.iter().map(|s| s.borrow().in_flight()).sum();
						println!(
							"runtime: {}s, sent: {} ({}/s), received: {} ({}/s), in flight: {}",
							started.elapsed().as_secs(),
							sends,
							sends - last_sends,
							receives,
							receives - last_receives,
							in_flight,
						);
						last_sends = sends;
						last_receives = receives;
					}
					_ = stop_rx.changed() => break,
				}
			}
		});
	}

	fn totals(&self) -> Totals {
		let mut totals = Totals::default();
		for sink in &self.sinks {
			let m = sink.borrow();
			totals.sends += m.sends;
			totals.send_bytes += m.send_bytes;
			totals.receives += m.receives;
			totals.timeouts += m.timeouts;
			totals.bad_receives += m.bad_receives;
			totals.net_errors += m.net_errors;
			totals.tcp_connections += m.tcp_connections;
			totals.pool_exhausted += m.pool_exhausted;
		}
		totals
	}

	fn latency_summary(&self) -> LatencySummary {
		let mut all: Vec<f64> = self
			.sinks
			.iter()
			.flat_map(|s| s.borrow().latencies_ms.clone())
			.collect();
		all.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
		LatencySummary {
			count: all.len(),
			min_ms: all.first().copied().unwrap_or(0.0),
			mean_ms: mean(&all).unwrap_or(0.0),
			stddev_ms: stddev(&all).unwrap_or(0.0),
			p50_ms: percentile(&all, 50.0).unwrap_or(0.0),
			p95_ms: percentile(&all, 95.0).unwrap_or(0.0),
			p99_ms: percentile(&all, 99.0).unwrap_or(0.0),
			max_ms: all.last().copied().unwrap_or(0.0),
		}
	}

	fn rcode_histogram(&self) -> BTreeMap<String, u64> {
		let mut rcodes = BTreeMap::new();
		for sink in &self.sinks {
			for (rcode, count) in &sink.borrow().rcodes {
				*rcodes.entry(rcode.clone()).or_insert(0) += count;
			}
		}
		rcodes
	}

	/// Print the summary table and write the JSON report. Called once,
	/// after the event loop has drained.
	pub fn finalize(&self) -> Result<()> {
		let runtime = self.started.elapsed().as_secs_f64();
		let totals = self.totals();
		let latency = self.latency_summary();
		let rcodes = self.rcode_histogram();

		if self.verbosity > 0 {
			self.print_summary(runtime, &totals, &latency, &rcodes);
		}

		if let Some(path) = &self.output {
			let trafgens = self
				.sinks
				.iter()
				.map(|s| {
					let m = s.borrow();
					TrafGenReport {
						port: m.port,
						sends: m.sends,
						receives: m.receives,
						timeouts: m.timeouts,
					}
				})
				.collect();
			let report = Report {
				command_line: &self.cmdline,
				config: &self.config,
				runtime_secs: runtime,
				totals,
				latency_ms: latency,
				rcodes,
				trafgens,
			};
			let file = std::fs::File::create(path)
				.map_err(|e| anyhow!("failed to create metrics file '{}': {}", path, e))?;
			serde_json::to_writer_pretty(file, &report)
				.map_err(|e| anyhow!("failed to write metrics file '{}': {}", path, e))?;
			if self.verbosity > 0 {
				println!("\nMetrics written to: {}", path);
			}
		}
		Ok(())
	}

	fn print_summary(
		&self,
		runtime: f64,
		totals: &Totals,
		latency: &LatencySummary,
		rcodes: &BTreeMap<String, u64>,
	) {
		let mut table = Table::new();
		table.load_preset(UTF8_FULL);
		table.set_content_arrangement(ContentArrangement::Dynamic);
		table.set_header(vec!["Metric", "Value"]);

		let qps = if runtime > 0.0 { totals.sends as f64 / runtime } else { 0.0 };
		table.add_row(vec!["Runtime".to_string(), format!("{:.1} s", runtime)]);
		table.add_row(vec!["Queries sent".to_string(), totals.sends.to_string()]);
		table.add_row(vec!["Send rate".to_string(), format!("{:.0} qps", qps)]);
		table.add_row(vec!["Bytes sent".to_string(), totals.send_bytes.to_string()]);
		table.add_row(vec!["Responses".to_string(), totals.receives.to_string()]);
		table.add_row(vec!["Timeouts".to_string(), totals.timeouts.to_string()]);
		table.add_row(vec!["Bad receives".to_string(), totals.bad_receives.to_string()]);
		table.add_row(vec!["Net errors".to_string(), totals.net_errors.to_string()]);
		table.add_row(vec!["TCP connections".to_string(), totals.tcp_connections.to_string()]);
		table.add_row(vec!["ID pool exhaustion".to_string(), totals.pool_exhausted.to_string()]);
		if latency.count > 0 {
			table.add_row(vec![
				"Latency p50/p95/p99".to_string(),
				format!("{:.2} / {:.2} / {:.2} ms", latency.p50_ms, latency.p95_ms, latency.p99_ms),
			]);
			table.add_row(vec![
				"Latency min/mean/max".to_string(),
				format!("{:.2} / {:.2} / {:.2} ms", latency.min_ms, latency.mean_ms, latency.max_ms),
			]);
		}

		println!("\nTraffic Summary");
		println!("===============\n");
		println!("{table}");

		if !rcodes.is_empty() {
			println!("\nResponse codes:");
			for (rcode, count) in rcodes {
				println!("  {}: {}", rcode, count);
			}
		}
	}
}

/// Calculate the p-th percentile from a sorted slice using nearest-rank.
pub fn percentile(sorted_values: &[f64], p: f64) -> Option<f64> {
	if sorted_values.is_empty() {
		return None;
	}
	if sorted_values.len() == 1 {
		return Some(sorted_values[0]);
	}
	let n = sorted_values.len();
	let rank = ((p / 100.0) * n as f64).ceil() as usize;
	let rank = rank.clamp(1, n);
	Some(sorted_values[rank - 1])
}

/// Calculate the arithmetic mean of a slice of values.
pub fn mean(values: &[f64]) -> Option<f64> {
	if values.is_empty() {
		return None;
	}
	let sum: f64 = values.iter().sum();
	Some(sum / values.len() as f64)
}

/// Calculate the population standard deviation of a slice of values.
pub fn stddev(values: &[f64]) -> Option<f64> {
	let avg = mean(values)?;
	let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64;
	Some(variance.sqrt())
}
