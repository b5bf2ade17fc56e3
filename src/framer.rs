use anyhow::{bail, Result};
use bytes::{Buf, BytesMut};

/// Smallest plausible DNS message: header plus a one-label question.
pub const MIN_DNS_MSG_SIZE: usize = 17;
/// Largest message a well-behaved server sends on this kind of session.
pub const MAX_DNS_MSG_SIZE: usize = 512;

/// Deframer for the DNS-over-TCP stream: each message is preceded by a
/// 2-byte network-order length. The buffer holds at most one partial
/// message plus whatever tail has not been drained yet.
pub struct TcpFramer {
	buf: BytesMut,
}

impl TcpFramer {
	pub fn new() -> TcpFramer {
		TcpFramer { buf: BytesMut::new() }
	}

	pub fn push(&mut self, data: &[u8]) {
		self.buf.extend_from_slice(data);
	}

	/// Try to extract the next complete message from the front of the
	/// buffer. `Ok(None)` means more bytes are needed. A length prefix
	/// outside [MIN_DNS_MSG_SIZE, MAX_DNS_MSG_SIZE] is a framing error;
	/// the caller drops the connection and force-expires its queries.
	pub fn try_yield_message(&mut self) -> Result<Option<Vec<u8>>> {
		if self.buf.len() < 2 {
			return Ok(None);
		}
		let size = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
		if !(MIN_DNS_MSG_SIZE..=MAX_DNS_MSG_SIZE).contains(&size) {
			bail!("tcp message length {} outside [{}, {}]", size, MIN_DNS_MSG_SIZE, MAX_DNS_MSG_SIZE);
		}
		if self.buf.len() < 2 + size {
			return Ok(None);
		}
		self.buf.advance(2);
		Ok(Some(self.buf.split_to(size).to_vec()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn frame(payload: &[u8]) -> Vec<u8> {
		let mut out = (payload.len() as u16).to_be_bytes().to_vec();
		out.extend_from_slice(payload);
		out
	}

	#[test]
	fn test_yields_nothing_on_short_prefix() {
		let mut framer = TcpFramer::new();
		framer.push(&[0x00]);
		assert!(framer.try_yield_message().unwrap().is_none());
	}

	#[test]
	fn test_single_complete_message() {
		let payload = vec![0xabu8; 32];
		let mut framer = TcpFramer::new();
		framer.push(&frame(&payload));
		assert_eq!(framer.try_yield_message().unwrap(), Some(payload));
		assert!(framer.try_yield_message().unwrap().is_none());
	}

	#[test]
	fn test_partial_then_complete() {
		let payload = vec![0x11u8; 64];
		let framed = frame(&payload);
		let mut framer = TcpFramer::new();
		framer.push(&framed[..10]);
		assert!(framer.try_yield_message().unwrap().is_none());
		framer.push(&framed[10..]);
		assert_eq!(framer.try_yield_message().unwrap(), Some(payload));
	}

	#[test]
	fn test_multiple_messages_in_order() {
		let first = vec![0x01u8; 20];
		let second = vec![0x02u8; 40];
		let mut bytes = frame(&first);
		bytes.extend_from_slice(&frame(&second));
		let mut framer = TcpFramer::new();
		framer.push(&bytes);
		assert_eq!(framer.try_yield_message().unwrap(), Some(first));
		assert_eq!(framer.try_yield_message().unwrap(), Some(second));
		assert!(framer.try_yield_message().unwrap().is_none());
	}

	#[test]
	fn test_length_below_minimum_is_error() {
		let mut framer = TcpFramer::new();
		framer.push(&16u16.to_be_bytes());
		assert!(framer.try_yield_message().is_err());
	}

	#[test]
	fn test_length_above_maximum_is_error() {
		let mut framer = TcpFramer::new();
		framer.push(&513u16.to_be_bytes());
		assert!(framer.try_yield_message().is_err());
	}

	#[test]
	fn test_boundary_lengths_accepted() {
		for size in [MIN_DNS_MSG_SIZE, MAX_DNS_MSG_SIZE] {
			let payload = vec![0u8; size];
			let mut framer = TcpFramer::new();
			framer.push(&frame(&payload));
			assert_eq!(framer.try_yield_message().unwrap(), Some(payload));
		}
	}
}
