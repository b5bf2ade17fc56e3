use std::net::SocketAddr;
use std::rc::Rc;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, sleep_until, Duration, Instant as TokioInstant, Interval};
use tracing::{debug, warn};

use crate::config::{Family, Protocol, TrafGenConfig};
use crate::dns;
use crate::framer::TcpFramer;
use crate::inflight::InFlightTable;
use crate::metrics::MetricsSink;
use crate::qgen::SharedGenerator;
use crate::rate::SharedBucket;

/// Large enough for EDNS-extended responses.
const RECV_BUF_SIZE: usize = 4096;
/// Period of the TCP session drain poll.
const TCP_POLL_PERIOD: Duration = Duration::from_millis(50);
/// Period of the in-flight timeout GC.
const GC_PERIOD: Duration = Duration::from_secs(1);
/// Reconnect back-off bounds for repeated TCP connect failures.
const CONNECT_BACKOFF_START: Duration = Duration::from_millis(100);
const CONNECT_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// How one TCP session ended, seen from the reconnect loop.
enum SessionEnd {
	/// Session ran its course (including error paths past connect).
	Completed,
	/// The connect itself failed; back off before retrying.
	ConnectFailed,
	/// Stop was requested or the generator is exhausted.
	Stopping,
}

/// Drives one flow of traffic: a transport, the shared query generator,
/// an in-flight table, the shared rate limiter, and the timers that tie
/// them together. One task per TrafGen on the single-threaded loop.
pub struct TrafGen {
	config: Rc<TrafGenConfig>,
	qgen: SharedGenerator,
	rate_limit: Option<SharedBucket>,
	metrics: MetricsSink,
	table: InFlightTable,
	stop_rx: watch::Receiver<bool>,
}

impl TrafGen {
	pub fn new(
		config: Rc<TrafGenConfig>,
		qgen: SharedGenerator,
		rate_limit: Option<SharedBucket>,
		metrics: MetricsSink,
		stop_rx: watch::Receiver<bool>,
	) -> TrafGen {
		TrafGen {
			config,
			qgen,
			rate_limit,
			metrics,
			table: InFlightTable::new(),
			stop_rx,
		}
	}

	pub async fn run(mut self) -> Result<()> {
		match self.config.protocol {
			Protocol::Udp => self.run_udp().await,
			Protocol::Tcp => self.run_tcp().await,
		}
	}

	fn bind_addr(&self) -> SocketAddr {
		match self.config.family {
			Family::Inet => "0.0.0.0:0".parse().expect("constant v4 bind address"),
			Family::Inet6 => "[::]:0".parse().expect("constant v6 bind address"),
		}
	}

	async fn run_udp(&mut self) -> Result<()> {
		let socket = UdpSocket::bind(self.bind_addr()).await?;
		self.metrics.borrow_mut().trafgen_id(socket.local_addr()?.port());

		let mut sender = interval_at(
			TokioInstant::now() + Duration::from_millis(1),
			Duration::from_millis(self.config.s_delay.max(1)),
		);
		let mut gc = interval_at(
			TokioInstant::now() + Duration::from_secs(self.config.r_timeout),
			GC_PERIOD,
		);
		let mut stop_rx = self.stop_rx.clone();
		let mut buf = [0u8; RECV_BUF_SIZE];

		loop {
			tokio::select! {
				_ = sender.tick() => self.udp_send(&socket).await,
				res = socket.recv_from(&mut buf) => match res {
					Ok((len, _src)) => self.process_wire(&buf[..len]),
					Err(e) => {
						debug!("udp receive error: {}", e);
						self.metrics.borrow_mut().net_error();
					}
				},
				_ = gc.tick() => self.handle_timeouts(),
				_ = stop_rx.changed() => break,
			}
		}

		// drain: stop sending, give in-flight queries up to the query
		// timeout to come home, then sweep the rest as timeouts
		let grace = if self.table.is_empty() {
			Duration::from_millis(1)
		} else {
			Duration::from_secs(self.config.r_timeout)
		};
		let deadline = TokioInstant::now() + grace;
		while !self.table.is_empty() {
			tokio::select! {
				res = socket.recv_from(&mut buf) => match res {
					Ok((len, _src)) => self.process_wire(&buf[..len]),
					Err(e) => {
						debug!("udp receive error: {}", e);
						self.metrics.borrow_mut().net_error();
					}
				},
				_ = gc.tick() => self.handle_timeouts(),
				_ = sleep_until(deadline) => break,
			}
		}
		self.force_expire();
		Ok(())
	}

	async fn udp_send(&mut self, socket: &UdpSocket) {
		for _ in 0..self.config.batch_count {
			if self.qgen.borrow().finished() {
				return;
			}
			if let Some(rl) = &self.rate_limit {
				if !rl.borrow_mut().consume(1) {
					return;
				}
			}
			let Some(id) = self.table.reserve() else {
				warn!("max in flight reached");
				self.metrics.borrow_mut().pool_exhausted();
				return;
			};
			let wire = match self.qgen.borrow_mut().next_udp(id) {
				Ok(wire) => wire,
				Err(e) => {
					warn!("query synthesis failed: {}", e);
					self.table.complete(id);
					return;
				}
			};
			match socket.send_to(&wire, self.config.target).await {
				Ok(sent) => {
					let in_flight = self.table.len();
					self.metrics.borrow_mut().send(sent, 1, in_flight);
				}
				Err(e) => {
					debug!("udp send error: {}", e);
					self.metrics.borrow_mut().net_error();
				}
			}
		}
	}

	async fn run_tcp(&mut self) -> Result<()> {
		let mut gc = interval_at(
			TokioInstant::now() + Duration::from_secs(self.config.r_timeout),
			GC_PERIOD,
		);
		let mut stop_rx = self.stop_rx.clone();
		let mut backoff = CONNECT_BACKOFF_START;

		while !*stop_rx.borrow() {
			match self.tcp_session(&mut gc, &mut stop_rx).await {
				SessionEnd::Completed => backoff = CONNECT_BACKOFF_START,
				SessionEnd::ConnectFailed => {
					self.metrics.borrow_mut().net_error();
					debug!("tcp connect failed, retrying in {:?}", backoff);
					tokio::select! {
						_ = sleep(backoff) => {}
						_ = stop_rx.changed() => break,
					}
					backoff = (backoff * 2).min(CONNECT_BACKOFF_MAX);
				}
				SessionEnd::Stopping => break,
			}
		}
		self.force_expire();
		Ok(())
	}

	/// One connect -> send -> drain -> close cycle.
	async fn tcp_session(
		&mut self,
		gc: &mut Interval,
		stop_rx: &mut watch::Receiver<bool>,
	) -> SessionEnd {
		if self.qgen.borrow().finished() {
			return SessionEnd::Stopping;
		}

		let mut stream = tokio::select! {
			res = TcpStream::connect(self.config.target) => match res {
				Ok(stream) => stream,
				Err(e) => {
					debug!("tcp connect error: {}", e);
					return SessionEnd::ConnectFailed;
				}
			},
			_ = stop_rx.changed() => return SessionEnd::Stopping,
		};
		self.metrics.borrow_mut().tcp_connection();
		if let Ok(local) = stream.local_addr() {
			self.metrics.borrow_mut().trafgen_id(local.port());
		}

		// reserve the batch up front; send times are recorded here, at
		// write issuance, so an early response can never race its entry
		let mut ids = Vec::with_capacity(self.config.batch_count as usize);
		for _ in 0..self.config.batch_count {
			if self.qgen.borrow().finished() {
				break;
			}
			if let Some(rl) = &self.rate_limit {
				if !rl.borrow_mut().consume(1) {
					break;
				}
			}
			match self.table.reserve() {
				Some(id) => ids.push(id),
				None => {
					warn!("max in flight reached");
					self.metrics.borrow_mut().pool_exhausted();
					break;
				}
			}
		}
		if ids.is_empty() {
			// rate limited or out of ids; close without writing
			return SessionEnd::Completed;
		}

		let wire = match self.qgen.borrow_mut().next_tcp(&ids) {
			Ok(wire) => wire,
			Err(e) => {
				warn!("query synthesis failed: {}", e);
				for id in ids {
					self.table.complete(id);
				}
				return SessionEnd::Completed;
			}
		};
		if let Err(e) = stream.write_all(&wire).await {
			debug!("tcp write error: {}", e);
			self.metrics.borrow_mut().net_error();
			self.force_expire();
			return SessionEnd::Completed;
		}
		let in_flight = self.table.len();
		self.metrics.borrow_mut().send(wire.len(), ids.len(), in_flight);

		// drain responses: close once every response is in (or the query
		// timeout has passed) and the minimum session spacing has elapsed
		let write_done = TokioInstant::now();
		let mut poll = interval_at(write_done + Duration::from_millis(1), TCP_POLL_PERIOD);
		let mut framer = TcpFramer::new();
		let mut buf = [0u8; RECV_BUF_SIZE];
		loop {
			tokio::select! {
				res = stream.read(&mut buf) => match res {
					Ok(0) => break, // peer EOF
					Ok(n) => {
						framer.push(&buf[..n]);
						loop {
							match framer.try_yield_message() {
								Ok(Some(message)) => self.process_wire(&message),
								Ok(None) => break,
								Err(e) => {
									debug!("tcp framing error: {}", e);
									self.metrics.borrow_mut().net_error();
									self.force_expire();
									return SessionEnd::Completed;
								}
							}
						}
					}
					Err(e) => {
						debug!("tcp read error: {}", e);
						self.metrics.borrow_mut().net_error();
						break;
					}
				},
				_ = poll.tick() => {
					let waited = write_done.elapsed();
					let responses_done = self.table.is_empty()
						|| waited >= Duration::from_secs(self.config.r_timeout);
					let spacing_done = waited >= Duration::from_millis(self.config.s_delay);
					if responses_done && (spacing_done || *stop_rx.borrow()) {
						break;
					}
				},
				_ = gc.tick() => self.handle_timeouts(),
			}
		}

		drop(stream);
		self.force_expire();
		if *stop_rx.borrow() {
			SessionEnd::Stopping
		} else {
			SessionEnd::Completed
		}
	}

	/// Correlate a response with its in-flight entry by transaction ID.
	fn process_wire(&mut self, bytes: &[u8]) {
		let response = match dns::parse_response(bytes) {
			Ok(response) => response,
			Err(_) => {
				let in_flight = self.table.len();
				self.metrics.borrow_mut().bad_receive(in_flight);
				return;
			}
		};
		let in_flight = self.table.len();
		match self.table.complete(response.id) {
			Some(query) => {
				self.metrics
					.borrow_mut()
					.receive(query.send_time, response.rcode, in_flight);
			}
			None => {
				debug!("untracked transaction id {}", response.id);
				self.metrics.borrow_mut().bad_receive(in_flight);
			}
		}
	}

	fn handle_timeouts(&mut self) {
		let expired = self.table.expire_older_than(Duration::from_secs(self.config.r_timeout));
		let in_flight = self.table.len();
		let mut metrics = self.metrics.borrow_mut();
		for _ in &expired {
			metrics.timeout(in_flight);
		}
	}

	fn force_expire(&mut self) {
		let expired = self.table.force_expire_all();
		let mut metrics = self.metrics.borrow_mut();
		for _ in &expired {
			metrics.timeout(0);
		}
	}
}
