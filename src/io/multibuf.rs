//! Shared, reference-counted packet pool.
//!
//! A [`MultiBuffer`] carves a fixed allocation into small chunks and
//! hands them out to packet descriptors on demand. Committed packets
//! enter a single ingress FIFO; the switch fans each packet out by
//! taking one reference per egress port. A packet's storage returns
//! to the free lists when its last reference is released.
//!
//! External code holds [`PacketHandle`] values, never pointers; all
//! bookkeeping happens inside the pool at acquire/release time.

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use super::{ReadCallback, Readable};
use crate::config::{MBUF_CHUNK_BYTES, MBUF_USER_WORDS};

const NONE: u16 = u16::MAX;

/// Index of a live packet descriptor inside a [`MultiBuffer`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PacketHandle(pub(crate) u16);

#[derive(Clone, Copy)]
struct PacketDesc {
	length: usize,
	refct: u16,
	priority: u8,
	user: [u32; MBUF_USER_WORDS],
	first: u16,
	last: u16,
}

impl PacketDesc {
	const EMPTY: Self = Self {
		length: 0,
		refct: 0,
		priority: 0,
		user: [0; MBUF_USER_WORDS],
		first: NONE,
		last: NONE,
	};
}

/// Fixed pool of packet storage with per-packet reference counts.
pub struct MultiBuffer {
	chunks: Vec<[u8; MBUF_CHUNK_BYTES]>,
	chunk_next: Vec<u16>,
	chunk_free: u16,
	free_chunks: usize,
	descs: Vec<PacketDesc>,
	desc_free: Vec<u16>,
	rx_queue: VecDeque<u16>,
	callback: Option<Rc<RefCell<dyn ReadCallback>>>,
}

impl MultiBuffer {
	/// Create a pool with roughly `total_bytes` of packet storage and
	/// up to `max_pkts` simultaneously live packets.
	pub fn new(total_bytes: usize, max_pkts: usize) -> Self {
		let nchunks = (total_bytes / MBUF_CHUNK_BYTES).max(1);
		assert!(nchunks < usize::from(NONE) && max_pkts < usize::from(NONE));
		let mut chunk_next = Vec::with_capacity(nchunks);
		for idx in 0..nchunks {
			chunk_next.push(if idx + 1 < nchunks {
				(idx + 1) as u16
			} else {
				NONE
			});
		}
		Self {
			chunks: vec![[0u8; MBUF_CHUNK_BYTES]; nchunks],
			chunk_next,
			chunk_free: 0,
			free_chunks: nchunks,
			descs: vec![PacketDesc::EMPTY; max_pkts],
			desc_free: (0..max_pkts as u16).rev().collect(),
			rx_queue: VecDeque::new(),
			callback: None,
		}
	}

	/// Register (or clear) the new-packet notification hook.
	pub fn set_callback(&mut self, callback: Option<Rc<RefCell<dyn ReadCallback>>>) {
		self.callback = callback;
	}

	/// Maximum number of simultaneously live packets.
	pub fn capacity_pkts(&self) -> usize {
		self.descs.len()
	}

	/// Bytes a fresh packet could still accept.
	pub fn write_space(&self, pkt: Option<PacketHandle>) -> usize {
		let tail = match pkt {
			Some(h) => {
				let fill = self.descs[h.0 as usize].length % MBUF_CHUNK_BYTES;
				if fill > 0 && self.descs[h.0 as usize].first != NONE {
					MBUF_CHUNK_BYTES - fill
				} else {
					0
				}
			}
			None => 0,
		};
		tail + self.free_chunks * MBUF_CHUNK_BYTES
	}

	/// Start a new packet. Returns `None` when the pool is exhausted.
	pub fn alloc(&mut self) -> Option<PacketHandle> {
		let idx = self.desc_free.pop()?;
		let desc = &mut self.descs[idx as usize];
		*desc = PacketDesc::EMPTY;
		desc.refct = 1;
		Some(PacketHandle(idx))
	}

	/// Append bytes to an open packet. Either all bytes land or none
	/// do (pool exhausted).
	pub fn append(&mut self, pkt: PacketHandle, src: &[u8]) -> bool {
		if self.write_space(Some(pkt)) < src.len() {
			return false;
		}
		let mut remaining = src;
		while !remaining.is_empty() {
			let desc = self.descs[pkt.0 as usize];
			let fill = desc.length % MBUF_CHUNK_BYTES;
			let needs_chunk = desc.first == NONE || fill == 0;
			let chunk = if needs_chunk {
				let chunk = self.chunk_free;
				debug_assert!(chunk != NONE);
				self.chunk_free = self.chunk_next[chunk as usize];
				self.chunk_next[chunk as usize] = NONE;
				self.free_chunks -= 1;
				let desc = &mut self.descs[pkt.0 as usize];
				if desc.first == NONE {
					desc.first = chunk;
				} else {
					let last = desc.last;
					self.chunk_next[last as usize] = chunk;
				}
				self.descs[pkt.0 as usize].last = chunk;
				chunk
			} else {
				desc.last
			};
			let offset = if needs_chunk { 0 } else { fill };
			let take = remaining.len().min(MBUF_CHUNK_BYTES - offset);
			self.chunks[chunk as usize][offset..offset + take].copy_from_slice(&remaining[..take]);
			self.descs[pkt.0 as usize].length += take;
			remaining = &remaining[take..];
		}
		true
	}

	/// Commit a packet onto the ingress queue.
	pub fn commit(&mut self, pkt: PacketHandle) {
		self.rx_queue.push_back(pkt.0);
		if let Some(cb) = self.callback.clone() {
			cb.borrow_mut().data_rcvd();
		}
	}

	/// Next committed packet, in arrival order.
	pub fn pop_ingress(&mut self) -> Option<PacketHandle> {
		self.rx_queue.pop_front().map(PacketHandle)
	}

	/// Take an additional reference for fan-out.
	pub fn acquire(&mut self, pkt: PacketHandle) {
		self.descs[pkt.0 as usize].refct += 1;
	}

	/// Drop one reference; storage is recycled when none remain.
	pub fn release(&mut self, pkt: PacketHandle) {
		let desc = &mut self.descs[pkt.0 as usize];
		debug_assert!(desc.refct > 0);
		desc.refct -= 1;
		if desc.refct > 0 {
			return;
		}
		let mut chunk = desc.first;
		desc.first = NONE;
		desc.last = NONE;
		while chunk != NONE {
			let next = self.chunk_next[chunk as usize];
			self.chunk_next[chunk as usize] = self.chunk_free;
			self.chunk_free = chunk;
			self.free_chunks += 1;
			chunk = next;
		}
		self.desc_free.push(pkt.0);
	}

	pub fn len(&self, pkt: PacketHandle) -> usize {
		self.descs[pkt.0 as usize].length
	}

	pub fn refct(&self, pkt: PacketHandle) -> u16 {
		self.descs[pkt.0 as usize].refct
	}

	pub fn priority(&self, pkt: PacketHandle) -> u8 {
		self.descs[pkt.0 as usize].priority
	}

	pub fn set_priority(&mut self, pkt: PacketHandle, priority: u8) {
		self.descs[pkt.0 as usize].priority = priority;
	}

	pub fn user(&self, pkt: PacketHandle, idx: usize) -> u32 {
		self.descs[pkt.0 as usize].user[idx]
	}

	pub fn set_user(&mut self, pkt: PacketHandle, idx: usize, value: u32) {
		self.descs[pkt.0 as usize].user[idx] = value;
	}

	/// First chunk index of a packet, for cursor-style readers.
	pub(crate) fn first_chunk(&self, pkt: PacketHandle) -> u16 {
		self.descs[pkt.0 as usize].first
	}

	/// Successor of `chunk` in its packet's chain.
	pub(crate) fn next_chunk(&self, chunk: u16) -> u16 {
		self.chunk_next[chunk as usize]
	}

	/// One byte at a (chunk, offset) cursor position.
	pub(crate) fn chunk_byte(&self, chunk: u16, offset: usize) -> u8 {
		self.chunks[chunk as usize][offset]
	}

	/// Non-consuming reader over a packet's bytes.
	pub fn reader(&self, pkt: PacketHandle) -> PacketReader<'_> {
		let desc = &self.descs[pkt.0 as usize];
		PacketReader {
			pool: self,
			chunk: desc.first,
			offset: 0,
			rem: desc.length,
			underflow: false,
		}
	}

	/// Reader positioned `skip` bytes into the packet.
	pub fn reader_at(&self, pkt: PacketHandle, skip: usize) -> PacketReader<'_> {
		let mut rd = self.reader(pkt);
		let skip = skip.min(rd.rem);
		for _ in 0..skip {
			rd.read_next();
		}
		rd
	}

	/// Overwrite bytes in place, without changing the packet length.
	/// Used to persist header rewrites (MAC swap, TTL update) before
	/// fan-out. Fails if the range extends past the packet.
	pub fn overwrite(&mut self, pkt: PacketHandle, offset: usize, src: &[u8]) -> bool {
		let desc = self.descs[pkt.0 as usize];
		if offset + src.len() > desc.length {
			return false;
		}
		let mut chunk = desc.first;
		for _ in 0..offset / MBUF_CHUNK_BYTES {
			chunk = self.chunk_next[chunk as usize];
		}
		let mut at = offset % MBUF_CHUNK_BYTES;
		let mut remaining = src;
		while !remaining.is_empty() {
			let take = remaining.len().min(MBUF_CHUNK_BYTES - at);
			self.chunks[chunk as usize][at..at + take].copy_from_slice(&remaining[..take]);
			remaining = &remaining[take..];
			at = 0;
			chunk = self.chunk_next[chunk as usize];
		}
		true
	}
}

/// Read-only cursor over one pooled packet.
///
/// The cursor never consumes the packet; fan-out bookkeeping happens
/// through [`MultiBuffer::acquire`] / [`MultiBuffer::release`].
pub struct PacketReader<'a> {
	pool: &'a MultiBuffer,
	chunk: u16,
	offset: usize,
	rem: usize,
	underflow: bool,
}

impl Readable for PacketReader<'_> {
	fn get_read_ready(&self) -> usize {
		if self.underflow { 0 } else { self.rem }
	}

	fn read_next(&mut self) -> u8 {
		let b = self.pool.chunks[self.chunk as usize][self.offset];
		self.offset += 1;
		self.rem -= 1;
		if self.offset == MBUF_CHUNK_BYTES {
			self.chunk = self.pool.chunk_next[self.chunk as usize];
			self.offset = 0;
		}
		b
	}

	fn read_underflow(&mut self) {
		self.underflow = true;
	}

	fn read_finalize(&mut self) {
		while self.rem > 0 {
			self.read_next();
		}
		self.underflow = false;
	}
}
