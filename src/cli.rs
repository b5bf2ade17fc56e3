use clap::Parser;

/// DNS traffic generator and load tester
#[derive(Parser, Debug)]
#[command(name = "flame")]
#[command(about = "Send crafted DNS query traffic at a target over UDP or TCP", version)]
pub struct Cli {
	/// Target name or address to send queries to
	pub target: String,

	/// Generator arguments as KEY=VAL pairs (keys are case-insensitive)
	#[arg(value_name = "GENOPTS")]
	pub genopts: Vec<String>,

	/// Number of concurrent traffic generators (default 10, tcp 30)
	#[arg(short = 'c', value_name = "TCOUNT")]
	pub tcount: Option<u64>,

	/// Number of queries to send every DELAY ms (default 10, tcp 100)
	#[arg(short = 'q', value_name = "QCOUNT")]
	pub qcount: Option<u64>,

	/// ms delay between each traffic generator's batch (default 1, tcp 1000)
	#[arg(short = 'd', value_name = "DELAY_MS")]
	pub delay_ms: Option<u64>,

	/// Limit traffic generation to N seconds, 0 is unlimited
	#[arg(short = 'l', value_name = "LIMIT_SECS", default_value = "0")]
	pub limit_secs: u64,

	/// Query timeout in seconds
	#[arg(short = 't', value_name = "TIMEOUT_SECS", default_value = "3")]
	pub timeout_secs: u64,

	/// Loop through the record list LOOP times, 0 is unlimited
	#[arg(short = 'n', value_name = "LOOP", default_value = "0")]
	pub loops: u64,

	/// Rate limit to a maximum of QPS, 0 is no limit
	#[arg(short = 'Q', value_name = "QPS", default_value = "0")]
	pub qps: u64,

	/// Change the rate limit over time, format: QPS,MS;QPS,MS;...
	#[arg(long = "qps-flow", value_name = "SPEC")]
	pub qps_flow: Option<String>,

	/// The base record to use as the DNS query for generators
	#[arg(short = 'r', value_name = "RECORD", default_value = "test.com")]
	pub record: String,

	/// The query type to use for generators
	#[arg(short = 'T', value_name = "QTYPE", default_value = "A")]
	pub qtype: String,

	/// Query class, IN or CH
	#[arg(long = "class", value_name = "CLASS", default_value = "IN")]
	pub qclass: String,

	/// Read records from FILE, one per line, QNAME TYPE
	#[arg(short = 'f', value_name = "FILE")]
	pub file: Option<String>,

	/// Which port to send queries to
	#[arg(short = 'p', value_name = "PORT", default_value = "53")]
	pub port: u16,

	/// Internet family, inet or inet6
	#[arg(short = 'F', value_name = "FAMILY", default_value = "inet")]
	pub family: String,

	/// Protocol to use, udp or tcp
	#[arg(short = 'P', value_name = "PROTOCOL", default_value = "udp")]
	pub protocol: String,

	/// Generate queries with the given generator variant
	#[arg(short = 'g', value_name = "GENERATOR", default_value = "static")]
	pub generator: String,

	/// Metrics output file, JSON format
	#[arg(short = 'o', value_name = "FILE")]
	pub output: Option<String>,

	/// How verbose output should be, 0 is silent
	#[arg(short = 'v', value_name = "VERBOSITY", default_value = "1")]
	pub verbosity: u64,

	/// Randomize the query list before sending
	#[arg(short = 'R')]
	pub randomize: bool,

	/// Set the DO flag in EDNS
	#[arg(long = "dnssec")]
	pub dnssec: bool,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_defaults() {
		let cli = Cli::parse_from(["flame", "target.test.com"]);
		assert_eq!(cli.target, "target.test.com");
		assert_eq!(cli.port, 53);
		assert_eq!(cli.qtype, "A");
		assert_eq!(cli.protocol, "udp");
		assert_eq!(cli.generator, "static");
		assert!(cli.tcount.is_none());
		assert!(cli.qcount.is_none());
		assert!(cli.delay_ms.is_none());
	}

	#[test]
	fn test_genopts_trailing() {
		let cli = Cli::parse_from([
			"flame", "target.test.com", "-g", "randomlabel", "lblsize=10", "count=1000",
		]);
		assert_eq!(cli.generator, "randomlabel");
		assert_eq!(cli.genopts, vec!["lblsize=10", "count=1000"]);
	}

	#[test]
	fn test_explicit_overrides() {
		let cli = Cli::parse_from([
			"flame", "-P", "tcp", "-c", "5", "-q", "7", "-d", "250", "10.0.0.1",
		]);
		assert_eq!(cli.protocol, "tcp");
		assert_eq!(cli.tcount, Some(5));
		assert_eq!(cli.qcount, Some(7));
		assert_eq!(cli.delay_ms, Some(250));
	}
}
