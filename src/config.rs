use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;

use anyhow::{anyhow, bail, Result};

/// Wire protocol used to carry queries to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
	Udp,
	Tcp,
}

impl Protocol {
	pub fn parse(input: &str) -> Result<Protocol> {
		match input {
			"udp" => Ok(Protocol::Udp),
			"tcp" => Ok(Protocol::Tcp),
			_ => bail!("protocol must be 'udp' or 'tcp'"),
		}
	}
}

impl fmt::Display for Protocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Protocol::Udp => write!(f, "udp"),
			Protocol::Tcp => write!(f, "tcp"),
		}
	}
}

/// Internet address family for the target and the local socket bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
	Inet,
	Inet6,
}

impl Family {
	pub fn parse(input: &str) -> Result<Family> {
		match input {
			"inet" => Ok(Family::Inet),
			"inet6" => Ok(Family::Inet6),
			_ => bail!("internet family must be 'inet' or 'inet6'"),
		}
	}

	pub fn matches(&self, addr: &SocketAddr) -> bool {
		match self {
			Family::Inet => addr.is_ipv4(),
			Family::Inet6 => addr.is_ipv6(),
		}
	}
}

impl fmt::Display for Family {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Family::Inet => write!(f, "inet"),
			Family::Inet6 => write!(f, "inet6"),
		}
	}
}

/// Per-generator traffic configuration, immutable once the generators start.
#[derive(Debug, Clone)]
pub struct TrafGenConfig {
	/// Resolved target address, port included.
	pub target: SocketAddr,
	pub family: Family,
	pub protocol: Protocol,
	/// Per-query timeout in seconds.
	pub r_timeout: u64,
	/// Delay between sender ticks (UDP) or minimum session spacing (TCP), in ms.
	pub s_delay: u64,
	/// Queries attempted per tick or per TCP session.
	pub batch_count: u64,
}

/// One entry of a `--qps-flow` schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flow {
	pub qps: u64,
	pub duration_ms: u64,
}

/// Parse a flow spec of the form `QPS,MS;QPS,MS;...`.
///
/// The duration of the final entry is ignored at run time; it still must parse.
pub fn parse_flow_spec(spec: &str) -> Result<VecDeque<Flow>> {
	let mut flows = VecDeque::new();
	for group in spec.split(';').filter(|g| !g.is_empty()) {
		let (qps, duration) = group
			.split_once(',')
			.ok_or_else(|| anyhow!("bad qps-flow entry '{}', expected QPS,MS", group))?;
		let qps: u64 = qps
			.trim()
			.parse()
			.map_err(|e| anyhow!("bad qps-flow QPS '{}': {}", qps, e))?;
		let duration_ms: u64 = duration
			.trim()
			.parse()
			.map_err(|e| anyhow!("bad qps-flow duration '{}': {}", duration, e))?;
		flows.push_back(Flow { qps, duration_ms });
	}
	if flows.is_empty() {
		bail!("qps-flow spec '{}' contains no entries", spec);
	}
	Ok(flows)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_protocol() {
		assert_eq!(Protocol::parse("udp").unwrap(), Protocol::Udp);
		assert_eq!(Protocol::parse("tcp").unwrap(), Protocol::Tcp);
		assert!(Protocol::parse("sctp").is_err());
	}

	#[test]
	fn test_parse_family() {
		assert_eq!(Family::parse("inet").unwrap(), Family::Inet);
		assert_eq!(Family::parse("inet6").unwrap(), Family::Inet6);
		assert!(Family::parse("ipx").is_err());
	}

	#[test]
	fn test_family_matches() {
		let v4: SocketAddr = "127.0.0.1:53".parse().unwrap();
		let v6: SocketAddr = "[::1]:53".parse().unwrap();
		assert!(Family::Inet.matches(&v4));
		assert!(!Family::Inet.matches(&v6));
		assert!(Family::Inet6.matches(&v6));
		assert!(!Family::Inet6.matches(&v4));
	}

	#[test]
	fn test_parse_flow_spec() {
		let flows = parse_flow_spec("50,500;500,500;5000,0").unwrap();
		assert_eq!(flows.len(), 3);
		assert_eq!(flows[0], Flow { qps: 50, duration_ms: 500 });
		assert_eq!(flows[2], Flow { qps: 5000, duration_ms: 0 });
	}

	#[test]
	fn test_parse_flow_spec_single() {
		let flows = parse_flow_spec("100,0").unwrap();
		assert_eq!(flows.len(), 1);
		assert_eq!(flows[0].qps, 100);
	}

	#[test]
	fn test_parse_flow_spec_bad() {
		assert!(parse_flow_spec("").is_err());
		assert!(parse_flow_spec("100").is_err());
		assert!(parse_flow_spec("abc,100").is_err());
		assert!(parse_flow_spec("100,xyz").is_err());
	}
}
