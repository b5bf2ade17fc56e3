use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Instant;

use tokio::time::{sleep, Duration};
use tracing::info;

use crate::config::Flow;

/// Shared handle to a rate limiter. All access is serialized by the
/// single-threaded event loop, so a plain RefCell suffices.
pub type SharedBucket = Rc<RefCell<TokenBucket>>;

/// Classical token bucket. Refill is lazy on each `consume` call and
/// clamped to capacity. A zero-rate bucket permits everything, which is
/// what the flow scheduler starts from before its first flow installs.
#[derive(Debug, Clone)]
pub struct TokenBucket {
	capacity: u64,
	tokens: f64,
	rate: u64,
	last_refill: Instant,
}

impl TokenBucket {
	pub fn new(capacity: u64, rate: u64) -> TokenBucket {
		TokenBucket {
			capacity,
			tokens: capacity as f64,
			rate,
			last_refill: Instant::now(),
		}
	}

	/// A bucket that always permits consumption.
	pub fn unlimited() -> TokenBucket {
		TokenBucket::new(0, 0)
	}

	pub fn rate(&self) -> u64 {
		self.rate
	}

	/// Take `n` tokens if available. Returns false, deducting nothing,
	/// when the bucket cannot cover the request.
	pub fn consume(&mut self, n: u64) -> bool {
		if self.rate == 0 {
			return true;
		}
		let now = Instant::now();
		let elapsed = now.duration_since(self.last_refill).as_secs_f64();
		self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.capacity as f64);
		self.last_refill = now;
		if self.tokens >= n as f64 {
			self.tokens -= n as f64;
			true
		} else {
			false
		}
	}
}

/// Replays a finite `--qps-flow` schedule by rewriting the shared bucket
/// in place. The final flow stays in effect until process exit; its
/// duration is ignored.
pub struct FlowScheduler {
	flows: VecDeque<Flow>,
	bucket: SharedBucket,
}

impl FlowScheduler {
	pub fn new(flows: VecDeque<Flow>, bucket: SharedBucket) -> FlowScheduler {
		FlowScheduler { flows, bucket }
	}

	pub async fn run(mut self) {
		while let Some(flow) = self.flows.pop_front() {
			*self.bucket.borrow_mut() = TokenBucket::new(flow.qps, flow.qps);
			if self.flows.is_empty() {
				info!("qps flow now {} until completion", flow.qps);
				break;
			}
			info!(
				"qps flow now {} for {}ms, flows left: {}",
				flow.qps,
				flow.duration_ms,
				self.flows.len()
			);
			sleep(Duration::from_millis(flow.duration_ms)).await;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_consume_from_full_bucket() {
		let mut bucket = TokenBucket::new(10, 10);
		for _ in 0..10 {
			assert!(bucket.consume(1));
		}
		// bucket drained, refill over a few nanoseconds is well below 1
		assert!(!bucket.consume(1));
	}

	#[test]
	fn test_failed_consume_deducts_nothing() {
		let mut bucket = TokenBucket::new(5, 1);
		assert!(bucket.consume(5));
		assert!(!bucket.consume(5));
		// a single token is still out of reach right away
		assert!(!bucket.consume(1));
	}

	#[test]
	fn test_refill_clamped_to_capacity() {
		let mut bucket = TokenBucket::new(2, 1_000_000);
		assert!(bucket.consume(2));
		std::thread::sleep(Duration::from_millis(10));
		// 10ms at 1M/s would refill 10k tokens, but capacity is 2
		assert!(bucket.consume(2));
		assert!(!bucket.consume(1));
	}

	#[test]
	fn test_unlimited_always_permits() {
		let mut bucket = TokenBucket::unlimited();
		for _ in 0..100_000 {
			assert!(bucket.consume(1));
		}
		assert!(bucket.consume(1_000_000));
	}

	#[test]
	fn test_rewrite_in_place() {
		let bucket: SharedBucket = Rc::new(RefCell::new(TokenBucket::unlimited()));
		*bucket.borrow_mut() = TokenBucket::new(50, 50);
		assert_eq!(bucket.borrow().rate(), 50);
	}

	#[tokio::test]
	async fn test_flow_scheduler_terminal_rate() {
		let bucket: SharedBucket = Rc::new(RefCell::new(TokenBucket::unlimited()));
		let mut flows = VecDeque::new();
		flows.push_back(Flow { qps: 50, duration_ms: 5 });
		flows.push_back(Flow { qps: 500, duration_ms: 5 });
		flows.push_back(Flow { qps: 5000, duration_ms: 0 });
		FlowScheduler::new(flows, bucket.clone()).run().await;
		// after all durations elapse the last flow's rate remains
		assert_eq!(bucket.borrow().rate(), 5000);
	}
}
