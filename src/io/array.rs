//! Stream adapters over plain byte slices.

use super::{Readable, Writeable};

/// A [`Writeable`] that fills a caller-provided slice.
///
/// Used for scratch assembly of small messages (e.g. rebuilding the
/// first bytes of a rejected datagram for an ICMP error).
pub struct ArrayWrite<'a> {
	dst: &'a mut [u8],
	wridx: usize,
	wrlen: usize,
	overflow: bool,
}

impl<'a> ArrayWrite<'a> {
	pub fn new(dst: &'a mut [u8]) -> Self {
		Self {
			dst,
			wridx: 0,
			wrlen: 0,
			overflow: false,
		}
	}

	/// Length of the most recently finalized packet.
	pub fn written(&self) -> usize {
		self.wrlen
	}
}

impl Writeable for ArrayWrite<'_> {
	fn get_write_space(&self) -> usize {
		if self.overflow {
			0
		} else {
			self.dst.len() - self.wridx
		}
	}

	fn write_next(&mut self, data: u8) {
		self.dst[self.wridx] = data;
		self.wridx += 1;
		self.wrlen = 0;
	}

	fn write_overflow(&mut self) {
		self.overflow = true;
	}

	fn write_finalize(&mut self) -> bool {
		let ok = !self.overflow;
		self.wrlen = if ok { self.wridx } else { 0 };
		self.wridx = 0;
		self.overflow = false;
		ok
	}

	fn write_abort(&mut self) {
		self.wrlen = 0;
		self.wridx = 0;
		self.overflow = false;
	}
}

/// A [`Readable`] over a borrowed slice holding exactly one frame.
pub struct ArrayRead<'a> {
	src: &'a [u8],
	rdidx: usize,
	underflow: bool,
}

impl<'a> ArrayRead<'a> {
	pub fn new(src: &'a [u8]) -> Self {
		Self {
			src,
			rdidx: 0,
			underflow: false,
		}
	}
}

impl Readable for ArrayRead<'_> {
	fn get_read_ready(&self) -> usize {
		if self.underflow {
			0
		} else {
			self.src.len() - self.rdidx
		}
	}

	fn read_next(&mut self) -> u8 {
		let b = self.src[self.rdidx];
		self.rdidx += 1;
		b
	}

	fn read_underflow(&mut self) {
		self.underflow = true;
	}

	fn read_finalize(&mut self) {
		self.rdidx = self.src.len();
		self.underflow = false;
	}
}
