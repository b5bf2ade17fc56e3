use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use hickory_proto::op::{Edns, Message, Query, ResponseCode};
use hickory_proto::rr::domain::Label;
use hickory_proto::rr::{DNSClass, Name, RecordType};

/// Advertised EDNS receive buffer when the DO bit is requested.
const EDNS_PAYLOAD_SIZE: u16 = 4096;

/// Fields the engine needs from a response; everything else is ignored.
#[derive(Debug)]
pub struct WireResponse {
	pub id: u16,
	pub rcode: ResponseCode,
}

/// Serialize a DNS query for `name`/`qtype`/`qclass`. The transaction ID
/// is left at zero; callers stamp the real ID into the first two bytes.
pub fn build_query(name: Name, qtype: RecordType, qclass: DNSClass, dnssec: bool) -> Result<Vec<u8>> {
	let mut message = Message::new();
	message.set_id(0);
	message.set_recursion_desired(true);
	let mut query = Query::query(name, qtype);
	query.set_query_class(qclass);
	message.add_query(query);
	if dnssec {
		let mut edns = Edns::new();
		edns.set_max_payload(EDNS_PAYLOAD_SIZE);
		edns.set_dnssec_ok(true);
		message.extensions_mut().replace(edns);
	}
	message
		.to_vec()
		.map_err(|e| anyhow!("failed to serialize DNS query: {}", e))
}

/// Overwrite the transaction ID at the front of a wire packet. Packets
/// shorter than the ID field (possible with raw random packets) are left
/// untouched.
pub fn stamp_id(wire: &mut [u8], id: u16) {
	if wire.len() >= 2 {
		wire[..2].copy_from_slice(&id.to_be_bytes());
	}
}

/// Decode a response far enough to correlate it: transaction ID and rcode.
pub fn parse_response(bytes: &[u8]) -> Result<WireResponse> {
	let message = Message::from_vec(bytes)
		.map_err(|e| anyhow!("failed to parse DNS response: {}", e))?;
	Ok(WireResponse {
		id: message.id(),
		rcode: message.response_code(),
	})
}

pub fn parse_qtype(input: &str) -> Result<RecordType> {
	RecordType::from_str(&input.to_ascii_uppercase())
		.map_err(|_| anyhow!("unknown query type '{}'", input))
}

pub fn parse_qclass(input: &str) -> Result<DNSClass> {
	match input.to_ascii_uppercase().as_str() {
		"IN" => Ok(DNSClass::IN),
		"CH" => Ok(DNSClass::CH),
		_ => bail!("query class must be 'IN' or 'CH'"),
	}
}

/// Build a name from raw (possibly non-ASCII, possibly NUL) bytes under
/// `base`, chunking the bytes into wire labels of at most 63 octets.
pub fn name_from_raw_bytes(bytes: &[u8], base: &Name) -> Result<Name> {
	let labels: Vec<Label> = bytes
		.chunks(63)
		.map(Label::from_raw_bytes)
		.collect::<Result<_, _>>()
		.map_err(|e| anyhow!("bad raw label: {}", e))?;
	let name = Name::from_labels(labels).map_err(|e| anyhow!("bad raw qname: {}", e))?;
	name.append_domain(base)
		.map_err(|e| anyhow!("qname too long under base '{}': {}", base, e))
}
