use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{anyhow, bail, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use hickory_proto::rr::{DNSClass, Name, RecordType};
use tracing::warn;

use crate::dns;

/// Shared handle to the query generator; every traffic generator in the
/// process advances the same cursor.
pub type SharedGenerator = Rc<RefCell<Box<dyn QueryGenerator>>>;

/// Configuration surface common to every generator variant.
#[derive(Debug, Clone)]
pub struct GenConfig {
	pub qname: String,
	pub qtype: RecordType,
	pub qclass: DNSClass,
	pub dnssec: bool,
	/// Passes through the record list; 0 means loop forever.
	pub loops: u64,
}

/// Synthesizes DNS query wire packets. `next_udp` returns one packet
/// stamped with the given transaction ID; `next_tcp` returns a batch of
/// length-prefixed packets stamped with successive IDs.
pub trait QueryGenerator {
	fn name(&self) -> &'static str;

	/// Number of distinct records this generator cycles through.
	fn size(&self) -> usize;

	/// Reorder the internal list. A no-op for variants that synthesize
	/// randomly anyway.
	fn randomize(&mut self) {}

	/// True once a finite generator has completed all its passes.
	fn finished(&self) -> bool;

	fn next_udp(&mut self, id: u16) -> Result<Vec<u8>>;

	fn next_tcp(&mut self, ids: &[u16]) -> Result<Vec<u8>> {
		let mut out = Vec::new();
		for &id in ids {
			let query = self.next_udp(id)?;
			out.extend_from_slice(&(query.len() as u16).to_be_bytes());
			out.extend_from_slice(&query);
		}
		Ok(out)
	}
}

/// Select and construct a generator. `-f FILE` always selects the file
/// generator; otherwise the `-g` name picks the variant, and unknown
/// names fall back to static.
pub fn build(
	config: GenConfig,
	generator: &str,
	file: Option<&str>,
	genopts: &[String],
) -> Result<Box<dyn QueryGenerator>> {
	if let Some(path) = file {
		return Ok(Box::new(FileGenerator::new(config, path, genopts)?));
	}
	match generator {
		"static" => Ok(Box::new(StaticGenerator::new(config, genopts)?)),
		"numberqname" => Ok(Box::new(NumberQnameGenerator::new(config, genopts)?)),
		"randompkt" => Ok(Box::new(RandomPktGenerator::new(config, genopts)?)),
		"randomqname" => Ok(Box::new(RandomQnameGenerator::new(config, genopts)?)),
		"randomlabel" => Ok(Box::new(RandomLabelGenerator::new(config, genopts)?)),
		other => {
			warn!("unknown generator '{}', using static", other);
			Ok(Box::new(StaticGenerator::new(config, genopts)?))
		}
	}
}

/// Parse KEY=VAL generator options. Keys are case-insensitive; anything
/// outside `allowed` fails startup.
fn parse_genopts(genopts: &[String], allowed: &[&str]) -> Result<HashMap<String, String>> {
	let mut map = HashMap::new();
	for opt in genopts {
		let (key, val) = opt
			.split_once('=')
			.ok_or_else(|| anyhow!("bad generator argument '{}', expected KEY=VAL", opt))?;
		let key = key.to_ascii_lowercase();
		if !allowed.contains(&key.as_str()) {
			bail!("unknown generator argument '{}'", opt);
		}
		map.insert(key, val.to_string());
	}
	Ok(map)
}

fn opt_u64(map: &HashMap<String, String>, key: &str, default: u64) -> Result<u64> {
	match map.get(key) {
		Some(val) => val
			.parse()
			.map_err(|e| anyhow!("bad value for generator argument {}='{}': {}", key, val, e)),
		None => Ok(default),
	}
}

/// Walks a record list of `size` entries, counting completed passes.
#[derive(Debug, Clone)]
struct Cursor {
	size: u64,
	pos: u64,
	loops: u64,
	completed: u64,
}

impl Cursor {
	fn new(size: u64, loops: u64) -> Cursor {
		Cursor { size, pos: 0, loops, completed: 0 }
	}

	/// Current index, advancing the cursor and wrapping at the end of a
	/// pass.
	fn advance(&mut self) -> usize {
		let index = self.pos;
		self.pos += 1;
		if self.pos >= self.size {
			self.pos = 0;
			self.completed += 1;
		}
		index as usize
	}

	fn finished(&self) -> bool {
		self.loops > 0 && self.completed >= self.loops
	}
}

/// Ensure the base qname is fully qualified so synthesized names append
/// cleanly under it.
fn parse_base(qname: &str) -> Result<Name> {
	Name::from_ascii(&format!("{}.", qname.trim_end_matches('.')))
		.map_err(|e| anyhow!("invalid base record '{}': {}", qname, e))
}

/// Single fixed qname/qtype from the command line.
pub struct StaticGenerator {
	template: Vec<u8>,
	cursor: Cursor,
}

impl StaticGenerator {
	pub fn new(config: GenConfig, genopts: &[String]) -> Result<StaticGenerator> {
		parse_genopts(genopts, &[])?;
		let name = Name::from_ascii(&config.qname)
			.map_err(|e| anyhow!("invalid record '{}': {}", config.qname, e))?;
		let template = dns::build_query(name, config.qtype, config.qclass, config.dnssec)?;
		Ok(StaticGenerator {
			template,
			cursor: Cursor::new(1, config.loops),
		})
	}
}

impl QueryGenerator for StaticGenerator {
	fn name(&self) -> &'static str {
		"static"
	}

	fn size(&self) -> usize {
		1
	}

	fn finished(&self) -> bool {
		self.cursor.finished()
	}

	fn next_udp(&mut self, id: u16) -> Result<Vec<u8>> {
		self.cursor.advance();
		let mut wire = self.template.clone();
		dns::stamp_id(&mut wire, id);
		Ok(wire)
	}
}

/// One query per `QNAME TYPE` line of an input file.
pub struct FileGenerator {
	templates: Vec<Vec<u8>>,
	cursor: Cursor,
}

impl FileGenerator {
	pub fn new(config: GenConfig, path: &str, genopts: &[String]) -> Result<FileGenerator> {
		parse_genopts(genopts, &[])?;
		let content = std::fs::read_to_string(path)
			.map_err(|e| anyhow!("failed to read record file '{}': {}", path, e))?;
		let mut templates = Vec::new();
		for line in content.lines() {
			let trimmed = line.trim();
			if trimmed.is_empty() || trimmed.starts_with('#') {
				continue;
			}
			let mut parts = trimmed.split_whitespace();
			let qname = parts.next().unwrap_or_default();
			let qtype = match parts.next() {
				Some(token) => dns::parse_qtype(token)
					.map_err(|e| anyhow!("bad record line '{}': {}", trimmed, e))?,
				None => config.qtype,
			};
			let name = Name::from_ascii(qname)
				.map_err(|e| anyhow!("bad record line '{}': {}", trimmed, e))?;
			templates.push(dns::build_query(name, qtype, config.qclass, config.dnssec)?);
		}
		if templates.is_empty() {
			bail!("record file '{}' contains no records", path);
		}
		let cursor = Cursor::new(templates.len() as u64, config.loops);
		Ok(FileGenerator { templates, cursor })
	}
}

impl QueryGenerator for FileGenerator {
	fn name(&self) -> &'static str {
		"file"
	}

	fn size(&self) -> usize {
		self.templates.len()
	}

	fn randomize(&mut self) {
		self.templates.shuffle(&mut rand::thread_rng());
	}

	fn finished(&self) -> bool {
		self.cursor.finished()
	}

	fn next_udp(&mut self, id: u16) -> Result<Vec<u8>> {
		let index = self.cursor.advance();
		let mut wire = self.templates[index].clone();
		dns::stamp_id(&mut wire, id);
		Ok(wire)
	}
}

/// Qnames of the form `{rand(LOW..=HIGH)}.{base}`; one pass covers the
/// whole numeric range for loop accounting.
pub struct NumberQnameGenerator {
	base: String,
	low: u64,
	high: u64,
	qtype: RecordType,
	qclass: DNSClass,
	dnssec: bool,
	cursor: Cursor,
}

impl NumberQnameGenerator {
	pub fn new(config: GenConfig, genopts: &[String]) -> Result<NumberQnameGenerator> {
		let opts = parse_genopts(genopts, &["low", "high"])?;
		let low = opt_u64(&opts, "low", 0)?;
		let high = opt_u64(&opts, "high", 100_000)?;
		if low > high {
			bail!("numberqname LOW {} exceeds HIGH {}", low, high);
		}
		let base = config.qname.trim_end_matches('.').to_string();
		// surface bad base names at startup rather than mid-run
		Name::from_ascii(&format!("{}.{}", high, base))
			.map_err(|e| anyhow!("invalid base record '{}': {}", base, e))?;
		let cursor = Cursor::new(high - low + 1, config.loops);
		Ok(NumberQnameGenerator {
			base,
			low,
			high,
			qtype: config.qtype,
			qclass: config.qclass,
			dnssec: config.dnssec,
			cursor,
		})
	}
}

impl QueryGenerator for NumberQnameGenerator {
	fn name(&self) -> &'static str {
		"numberqname"
	}

	fn size(&self) -> usize {
		(self.high - self.low + 1) as usize
	}

	fn finished(&self) -> bool {
		self.cursor.finished()
	}

	fn next_udp(&mut self, id: u16) -> Result<Vec<u8>> {
		self.cursor.advance();
		let number = rand::thread_rng().gen_range(self.low..=self.high);
		let name = Name::from_ascii(&format!("{}.{}", number, self.base))
			.map_err(|e| anyhow!("invalid synthesized qname: {}", e))?;
		let mut wire = dns::build_query(name, self.qtype, self.qclass, self.dnssec)?;
		dns::stamp_id(&mut wire, id);
		Ok(wire)
	}
}

/// COUNT raw random packets of length uniform in [1, SIZE]. Not valid
/// DNS at all; exercises the target's parser.
pub struct RandomPktGenerator {
	packets: Vec<Vec<u8>>,
	cursor: Cursor,
}

impl RandomPktGenerator {
	pub fn new(config: GenConfig, genopts: &[String]) -> Result<RandomPktGenerator> {
		let opts = parse_genopts(genopts, &["count", "size"])?;
		let count = opt_u64(&opts, "count", 1000)?.max(1);
		let size = opt_u64(&opts, "size", 600)?.max(1) as usize;
		let mut rng = rand::thread_rng();
		let packets = (0..count)
			.map(|_| {
				let len = rng.gen_range(1..=size);
				let mut pkt = vec![0u8; len];
				rng.fill(&mut pkt[..]);
				pkt
			})
			.collect();
		Ok(RandomPktGenerator {
			packets,
			cursor: Cursor::new(count, config.loops),
		})
	}
}

impl QueryGenerator for RandomPktGenerator {
	fn name(&self) -> &'static str {
		"randompkt"
	}

	fn size(&self) -> usize {
		self.packets.len()
	}

	fn finished(&self) -> bool {
		self.cursor.finished()
	}

	fn next_udp(&mut self, id: u16) -> Result<Vec<u8>> {
		let index = self.cursor.advance();
		let mut wire = self.packets[index].clone();
		dns::stamp_id(&mut wire, id);
		Ok(wire)
	}
}

/// COUNT queries whose qnames are random bytes (NULs included) of length
/// uniform in [1, SIZE], placed under the base zone.
pub struct RandomQnameGenerator {
	templates: Vec<Vec<u8>>,
	cursor: Cursor,
}

impl RandomQnameGenerator {
	pub fn new(config: GenConfig, genopts: &[String]) -> Result<RandomQnameGenerator> {
		let opts = parse_genopts(genopts, &["count", "size"])?;
		let count = opt_u64(&opts, "count", 1000)?.max(1);
		let size = opt_u64(&opts, "size", 255)?.max(1) as usize;
		let base = parse_base(&config.qname)?;

		// clamp the random byte budget so qname + label overhead + base
		// stays inside the 255-octet name limit
		let mut max_len = size.min(255);
		while max_len > 1 && max_len + (max_len + 62) / 63 + base.len() > 255 {
			max_len -= 1;
		}
		if max_len + (max_len + 62) / 63 + base.len() > 255 {
			bail!("base record '{}' leaves no room for random qnames", config.qname);
		}

		let mut rng = rand::thread_rng();
		let mut templates = Vec::with_capacity(count as usize);
		for _ in 0..count {
			let len = rng.gen_range(1..=max_len);
			let mut raw = vec![0u8; len];
			rng.fill(&mut raw[..]);
			let name = dns::name_from_raw_bytes(&raw, &base)?;
			templates.push(dns::build_query(name, config.qtype, config.qclass, config.dnssec)?);
		}
		Ok(RandomQnameGenerator {
			templates,
			cursor: Cursor::new(count, config.loops),
		})
	}
}

impl QueryGenerator for RandomQnameGenerator {
	fn name(&self) -> &'static str {
		"randomqname"
	}

	fn size(&self) -> usize {
		self.templates.len()
	}

	fn finished(&self) -> bool {
		self.cursor.finished()
	}

	fn next_udp(&mut self, id: u16) -> Result<Vec<u8>> {
		let index = self.cursor.advance();
		let mut wire = self.templates[index].clone();
		dns::stamp_id(&mut wire, id);
		Ok(wire)
	}
}

/// Query types a busy authoritative zone actually sees; randomlabel draws
/// from this set per record.
const POPULAR_QTYPES: [RecordType; 9] = [
	RecordType::A,
	RecordType::AAAA,
	RecordType::NS,
	RecordType::CNAME,
	RecordType::SOA,
	RecordType::MX,
	RecordType::TXT,
	RecordType::SRV,
	RecordType::PTR,
];

/// COUNT queries of 1..=LBLCOUNT random labels, each 1..=LBLSIZE random
/// bytes, under the base zone, with qtypes from the popular set.
pub struct RandomLabelGenerator {
	templates: Vec<Vec<u8>>,
	cursor: Cursor,
}

impl RandomLabelGenerator {
	pub fn new(config: GenConfig, genopts: &[String]) -> Result<RandomLabelGenerator> {
		let opts = parse_genopts(genopts, &["count", "lblsize", "lblcount"])?;
		let count = opt_u64(&opts, "count", 1000)?.max(1);
		let lblsize = opt_u64(&opts, "lblsize", 10)?.max(1) as usize;
		let lblcount = opt_u64(&opts, "lblcount", 5)?.max(1) as usize;
		if lblsize > 63 {
			bail!("randomlabel LBLSIZE {} exceeds the 63-octet label limit", lblsize);
		}
		let base = parse_base(&config.qname)?;
		if lblcount * (lblsize + 1) + base.len() > 255 {
			bail!(
				"randomlabel LBLCOUNT {} x LBLSIZE {} does not fit under '{}'",
				lblcount, lblsize, config.qname
			);
		}

		let mut rng = rand::thread_rng();
		let mut templates = Vec::with_capacity(count as usize);
		for _ in 0..count {
			let labels = rng.gen_range(1..=lblcount);
			let mut chunks = Vec::with_capacity(labels);
			for _ in 0..labels {
				let len = rng.gen_range(1..=lblsize);
				let mut label = vec![0u8; len];
				rng.fill(&mut label[..]);
				chunks.push(label);
			}
			let name = build_label_name(&chunks, &base)?;
			let qtype = *POPULAR_QTYPES
				.choose(&mut rng)
				.unwrap_or(&RecordType::A);
			templates.push(dns::build_query(name, qtype, config.qclass, config.dnssec)?);
		}
		Ok(RandomLabelGenerator {
			templates,
			cursor: Cursor::new(count, config.loops),
		})
	}
}

impl QueryGenerator for RandomLabelGenerator {
	fn name(&self) -> &'static str {
		"randomlabel"
	}

	fn size(&self) -> usize {
		self.templates.len()
	}

	fn finished(&self) -> bool {
		self.cursor.finished()
	}

	fn next_udp(&mut self, id: u16) -> Result<Vec<u8>> {
		let index = self.cursor.advance();
		let mut wire = self.templates[index].clone();
		dns::stamp_id(&mut wire, id);
		Ok(wire)
	}
}

fn build_label_name(chunks: &[Vec<u8>], base: &Name) -> Result<Name> {
	use hickory_proto::rr::domain::Label;
	let labels: Vec<Label> = chunks
		.iter()
		.map(|c| Label::from_raw_bytes(c))
		.collect::<Result<_, _>>()
		.map_err(|e| anyhow!("bad random label: {}", e))?;
	let name = Name::from_labels(labels).map_err(|e| anyhow!("bad random qname: {}", e))?;
	name.append_domain(base)
		.map_err(|e| anyhow!("random qname too long under '{}': {}", base, e))
}

#[cfg(test)]
mod tests {
	use super::*;
	use hickory_proto::op::Message;

	fn test_config(loops: u64) -> GenConfig {
		GenConfig {
			qname: "test.com".to_string(),
			qtype: RecordType::A,
			qclass: DNSClass::IN,
			dnssec: false,
			loops,
		}
	}

	#[test]
	fn test_static_stamps_id() {
		let mut qgen = StaticGenerator::new(test_config(0), &[]).unwrap();
		let wire = qgen.next_udp(0xbeef).unwrap();
		let parsed = Message::from_vec(&wire).unwrap();
		assert_eq!(parsed.id(), 0xbeef);
		assert_eq!(parsed.queries()[0].name().to_ascii().trim_end_matches('.'), "test.com");
	}

	#[test]
	fn test_static_infinite_never_finishes() {
		let mut qgen = StaticGenerator::new(test_config(0), &[]).unwrap();
		for _ in 0..1000 {
			qgen.next_udp(1).unwrap();
		}
		assert!(!qgen.finished());
	}

	#[test]
	fn test_static_rejects_genopts() {
		assert!(StaticGenerator::new(test_config(0), &["count=5".to_string()]).is_err());
	}

	#[test]
	fn test_finite_loops_complete() {
		let mut qgen = StaticGenerator::new(test_config(2), &[]).unwrap();
		assert!(!qgen.finished());
		qgen.next_udp(1).unwrap();
		assert!(!qgen.finished());
		qgen.next_udp(2).unwrap();
		assert!(qgen.finished());
	}

	#[test]
	fn test_numberqname_one_pass() {
		let genopts = vec!["low=0".to_string(), "high=9".to_string()];
		let mut qgen = NumberQnameGenerator::new(test_config(1), &genopts).unwrap();
		assert_eq!(qgen.size(), 10);
		for i in 0..10 {
			assert!(!qgen.finished(), "finished after {} of 10", i);
			qgen.next_udp(i as u16).unwrap();
		}
		assert!(qgen.finished());
	}

	#[test]
	fn test_numberqname_qname_in_range() {
		let genopts = vec!["low=5".to_string(), "high=5".to_string()];
		let mut qgen = NumberQnameGenerator::new(test_config(0), &genopts).unwrap();
		let wire = qgen.next_udp(7).unwrap();
		let parsed = Message::from_vec(&wire).unwrap();
		assert_eq!(parsed.queries()[0].name().to_ascii().trim_end_matches('.'), "5.test.com");
	}

	#[test]
	fn test_numberqname_rejects_inverted_range() {
		let genopts = vec!["low=10".to_string(), "high=1".to_string()];
		assert!(NumberQnameGenerator::new(test_config(0), &genopts).is_err());
	}

	#[test]
	fn test_genopts_case_insensitive_keys() {
		let genopts = vec!["LOW=1".to_string(), "High=2".to_string()];
		assert!(NumberQnameGenerator::new(test_config(0), &genopts).is_ok());
	}

	#[test]
	fn test_unknown_genopt_fails() {
		let genopts = vec!["bogus=1".to_string()];
		assert!(NumberQnameGenerator::new(test_config(0), &genopts).is_err());
	}

	#[test]
	fn test_randompkt_sizes_and_stamp() {
		let genopts = vec!["count=50".to_string(), "size=100".to_string()];
		let mut qgen = RandomPktGenerator::new(test_config(0), &genopts).unwrap();
		assert_eq!(qgen.size(), 50);
		for _ in 0..50 {
			let wire = qgen.next_udp(0x0102).unwrap();
			assert!((1..=100).contains(&wire.len()));
			if wire.len() >= 2 {
				assert_eq!(&wire[..2], &[0x01, 0x02]);
			}
		}
	}

	#[test]
	fn test_randomqname_parses_as_dns() {
		let genopts = vec!["count=20".to_string(), "size=50".to_string()];
		let mut qgen = RandomQnameGenerator::new(test_config(0), &genopts).unwrap();
		for _ in 0..20 {
			let wire = qgen.next_udp(42).unwrap();
			let parsed = Message::from_vec(&wire).unwrap();
			assert_eq!(parsed.id(), 42);
		}
	}

	#[test]
	fn test_randomlabel_popular_qtypes() {
		let genopts = vec!["count=30".to_string()];
		let mut qgen = RandomLabelGenerator::new(test_config(0), &genopts).unwrap();
		for _ in 0..30 {
			let wire = qgen.next_udp(3).unwrap();
			let parsed = Message::from_vec(&wire).unwrap();
			let qtype = parsed.queries()[0].query_type();
			assert!(POPULAR_QTYPES.contains(&qtype));
		}
	}

	#[test]
	fn test_randomlabel_rejects_oversized_label() {
		let genopts = vec!["lblsize=64".to_string()];
		assert!(RandomLabelGenerator::new(test_config(0), &genopts).is_err());
	}

	#[test]
	fn test_next_tcp_framing() {
		let mut qgen = StaticGenerator::new(test_config(0), &[]).unwrap();
		let ids = [10u16, 20, 30];
		let batch = qgen.next_tcp(&ids).unwrap();

		let mut offset = 0;
		for &id in &ids {
			let len = u16::from_be_bytes([batch[offset], batch[offset + 1]]) as usize;
			offset += 2;
			let parsed = Message::from_vec(&batch[offset..offset + len]).unwrap();
			assert_eq!(parsed.id(), id);
			offset += len;
		}
		assert_eq!(offset, batch.len());
	}

	#[test]
	fn test_file_generator() {
		let dir = std::env::temp_dir().join("dns-flame-qgen-test");
		std::fs::create_dir_all(&dir).unwrap();
		let path = dir.join("records.txt");
		std::fs::write(&path, "# comment\nfoo.test.com A\nbar.test.com AAAA\n\nbaz.test.com\n").unwrap();

		let mut qgen =
			FileGenerator::new(test_config(1), path.to_str().unwrap(), &[]).unwrap();
		assert_eq!(qgen.size(), 3);
		let wire = qgen.next_udp(1).unwrap();
		let parsed = Message::from_vec(&wire).unwrap();
		assert_eq!(parsed.queries()[0].name().to_ascii().trim_end_matches('.'), "foo.test.com");
		let wire = qgen.next_udp(2).unwrap();
		let parsed = Message::from_vec(&wire).unwrap();
		assert_eq!(parsed.queries()[0].query_type(), RecordType::AAAA);
		// third line has no TYPE token and falls back to the CLI qtype
		let wire = qgen.next_udp(3).unwrap();
		let parsed = Message::from_vec(&wire).unwrap();
		assert_eq!(parsed.queries()[0].query_type(), RecordType::A);
		assert!(qgen.finished());
	}

	#[test]
	fn test_file_generator_missing_file() {
		assert!(FileGenerator::new(test_config(0), "/nonexistent/records.txt", &[]).is_err());
	}

	#[test]
	fn test_build_falls_back_to_static() {
		let qgen = build(test_config(0), "doesnotexist", None, &[]).unwrap();
		assert_eq!(qgen.name(), "static");
	}
}
