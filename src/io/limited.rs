//! Bounded view over another readable stream.

use super::Readable;

/// A [`Readable`] exposing at most `len` bytes of an inner stream.
///
/// Dispatch layers hand one of these to each protocol handler so a
/// handler can only consume its own payload, never the trailing
/// bytes of an enclosing frame (e.g. Ethernet padding after a short
/// IPv4 datagram).
pub struct LimitedRead<'a> {
	src: &'a mut dyn Readable,
	rem: usize,
	underflow: bool,
}

impl<'a> LimitedRead<'a> {
	pub fn new(src: &'a mut dyn Readable, len: usize) -> Self {
		let rem = len.min(src.get_read_ready());
		Self {
			src,
			rem,
			underflow: false,
		}
	}
}

impl Readable for LimitedRead<'_> {
	fn get_read_ready(&self) -> usize {
		if self.underflow {
			0
		} else {
			self.rem.min(self.src.get_read_ready())
		}
	}

	fn read_next(&mut self) -> u8 {
		self.rem -= 1;
		self.src.read_next()
	}

	fn read_underflow(&mut self) {
		self.underflow = true;
	}

	fn read_finalize(&mut self) {
		// Drain this view without touching the framing of the
		// underlying stream.
		while self.rem > 0 && self.src.get_read_ready() > 0 {
			self.rem -= 1;
			self.src.read_next();
		}
		self.underflow = false;
	}
}
