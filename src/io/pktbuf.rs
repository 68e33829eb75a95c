//! Heap-backed packet FIFO.

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use super::{ReadCallback, Readable, Writeable};

/// A bounded FIFO of whole packets with independent read/write sides.
///
/// One writer stages a packet byte by byte; `write_finalize` commits
/// it and (optionally) notifies a registered callback. The reader
/// sees one committed packet at a time. This is the workhorse stream
/// for port adapters, loopback wiring, and tests.
pub struct PacketBuffer {
	/// Committed bytes of all queued packets, oldest first.
	buff: VecDeque<u8>,
	/// Length of each committed packet.
	lens: VecDeque<usize>,
	/// Staging area for the packet being written.
	stage: Vec<u8>,
	max_bytes: usize,
	overflow: bool,
	underflow: bool,
	/// Read offset into the front packet.
	rdpos: usize,
	callback: Option<Rc<RefCell<dyn ReadCallback>>>,
}

impl PacketBuffer {
	/// Create a buffer holding up to `max_bytes` of committed and
	/// staged packet data.
	pub fn new(max_bytes: usize) -> Self {
		Self {
			buff: VecDeque::new(),
			lens: VecDeque::new(),
			stage: Vec::new(),
			max_bytes,
			overflow: false,
			underflow: false,
			rdpos: 0,
			callback: None,
		}
	}

	/// Register (or clear) the new-packet notification hook.
	pub fn set_callback(&mut self, callback: Option<Rc<RefCell<dyn ReadCallback>>>) {
		self.callback = callback;
	}

	/// Number of committed packets waiting to be read.
	pub fn pkt_count(&self) -> usize {
		self.lens.len()
	}

	fn front_len(&self) -> usize {
		self.lens.front().copied().unwrap_or(0)
	}
}

impl Writeable for PacketBuffer {
	fn get_write_space(&self) -> usize {
		if self.overflow {
			return 0;
		}
		self.max_bytes
			.saturating_sub(self.buff.len() + self.stage.len())
	}

	fn write_next(&mut self, data: u8) {
		self.stage.push(data);
	}

	fn write_overflow(&mut self) {
		self.overflow = true;
	}

	fn write_finalize(&mut self) -> bool {
		if self.overflow {
			self.write_abort();
			return false;
		}
		if self.stage.is_empty() {
			return true;
		}
		self.lens.push_back(self.stage.len());
		self.buff.extend(self.stage.drain(..));
		if let Some(cb) = self.callback.clone() {
			cb.borrow_mut().data_rcvd();
		}
		true
	}

	fn write_abort(&mut self) {
		self.stage.clear();
		self.overflow = false;
	}
}

impl Readable for PacketBuffer {
	fn get_read_ready(&self) -> usize {
		if self.underflow {
			0
		} else {
			self.front_len() - self.rdpos
		}
	}

	fn read_next(&mut self) -> u8 {
		self.rdpos += 1;
		self.buff.pop_front().unwrap_or(0)
	}

	fn read_underflow(&mut self) {
		self.underflow = true;
	}

	fn read_finalize(&mut self) {
		let rem = self.front_len() - self.rdpos;
		for _ in 0..rem {
			self.buff.pop_front();
		}
		self.lens.pop_front();
		self.rdpos = 0;
		self.underflow = false;
	}
}

impl Drop for PacketBuffer {
	fn drop(&mut self) {
		if let Some(cb) = self.callback.take() {
			cb.borrow_mut().data_unlink();
		}
	}
}
