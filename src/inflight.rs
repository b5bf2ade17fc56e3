use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;

/// An outstanding query, keyed externally by its DNS transaction ID.
#[derive(Debug, Clone, Copy)]
pub struct Query {
	pub send_time: Instant,
}

/// Registry of outstanding query IDs with per-entry send timestamps.
///
/// The 16-bit transaction ID space doubles as the concurrency budget: an
/// ID is either in flight or in the free pool, never both, and the union
/// always covers all 65,536 IDs. The pool starts as a random permutation
/// so successive reservations hand out unpredictable IDs.
pub struct InFlightTable {
	in_flight: HashMap<u16, Query>,
	free_ids: Vec<u16>,
}

impl InFlightTable {
	pub fn new() -> InFlightTable {
		let mut free_ids: Vec<u16> = (0..=u16::MAX).collect();
		free_ids.shuffle(&mut rand::thread_rng());
		InFlightTable {
			in_flight: HashMap::with_capacity(free_ids.len()),
			free_ids,
		}
	}

	/// Pop a free ID and record its send time. None when every ID is in
	/// flight, which callers treat as the in-flight ceiling.
	pub fn reserve(&mut self) -> Option<u16> {
		let id = self.free_ids.pop()?;
		self.in_flight.insert(id, Query { send_time: Instant::now() });
		Some(id)
	}

	/// Remove a completed entry, returning its ID to the pool.
	pub fn complete(&mut self, id: u16) -> Option<Query> {
		let query = self.in_flight.remove(&id)?;
		self.free_ids.push(id);
		Some(query)
	}

	/// GC entries whose send time is at least `timeout` old. Returns the
	/// expired IDs; they are already back in the free pool.
	pub fn expire_older_than(&mut self, timeout: Duration) -> Vec<u16> {
		let now = Instant::now();
		let expired: Vec<u16> = self
			.in_flight
			.iter()
			.filter(|(_, q)| now.duration_since(q.send_time) >= timeout)
			.map(|(id, _)| *id)
			.collect();
		for id in &expired {
			self.in_flight.remove(id);
			self.free_ids.push(*id);
		}
		expired
	}

	/// Expire every outstanding entry. Used when a TCP connection drops
	/// with responses still pending.
	pub fn force_expire_all(&mut self) -> Vec<u16> {
		let expired: Vec<u16> = self.in_flight.keys().copied().collect();
		self.in_flight.clear();
		self.free_ids.extend(&expired);
		expired
	}

	pub fn len(&self) -> usize {
		self.in_flight.len()
	}

	pub fn is_empty(&self) -> bool {
		self.in_flight.is_empty()
	}

	#[cfg(test)]
	fn free_len(&self) -> usize {
		self.free_ids.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const ID_SPACE: usize = 65_536;

	#[test]
	fn test_union_cardinality() {
		let mut table = InFlightTable::new();
		assert_eq!(table.free_len(), ID_SPACE);
		for _ in 0..1000 {
			assert!(table.reserve().is_some());
		}
		assert_eq!(table.len() + table.free_len(), ID_SPACE);
	}

	#[test]
	fn test_reserve_until_exhausted() {
		let mut table = InFlightTable::new();
		for _ in 0..ID_SPACE {
			assert!(table.reserve().is_some());
		}
		assert!(table.reserve().is_none());
		assert_eq!(table.len(), ID_SPACE);
		assert_eq!(table.free_len(), 0);
	}

	#[test]
	fn test_reserved_ids_are_unique() {
		let mut table = InFlightTable::new();
		let mut seen = std::collections::HashSet::new();
		for _ in 0..ID_SPACE {
			assert!(seen.insert(table.reserve().unwrap()));
		}
	}

	#[test]
	fn test_complete_returns_id_to_pool() {
		let mut table = InFlightTable::new();
		let id = table.reserve().unwrap();
		assert!(table.complete(id).is_some());
		assert_eq!(table.len(), 0);
		assert_eq!(table.free_len(), ID_SPACE);
		// completing an untracked id is a no-op
		assert!(table.complete(id).is_none());
		assert_eq!(table.free_len(), ID_SPACE);
	}

	#[test]
	fn test_expire_older_than() {
		let mut table = InFlightTable::new();
		let id = table.reserve().unwrap();
		assert!(table.expire_older_than(Duration::from_secs(60)).is_empty());
		let expired = table.expire_older_than(Duration::ZERO);
		assert_eq!(expired, vec![id]);
		assert_eq!(table.len(), 0);
		assert_eq!(table.free_len(), ID_SPACE);
	}

	#[test]
	fn test_force_expire_all() {
		let mut table = InFlightTable::new();
		for _ in 0..10 {
			table.reserve();
		}
		let expired = table.force_expire_all();
		assert_eq!(expired.len(), 10);
		assert!(table.is_empty());
		assert_eq!(table.free_len(), ID_SPACE);
	}
}
