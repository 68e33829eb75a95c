//! Packet-framed byte-stream abstractions.
//!
//! Every producer or consumer of packet data in this crate speaks one
//! of two traits: [`Writeable`] (build a packet byte by byte, then
//! commit or abort it) and [`Readable`] (walk the bytes of one packet,
//! then discard the remainder). All multi-byte integers default to
//! big-endian, matching the wire; `_le` variants exist for the few
//! host-order register formats.
//!
//! Overflow and underflow are sticky per frame: once an operation does
//! not fit, the frame is poisoned until `write_abort`/`write_finalize`
//! or `read_finalize` resets the stream. No operation ever partially
//! completes.

use thiserror::Error;

mod array;
mod limited;
mod multibuf;
mod pktbuf;

pub use self::array::{ArrayRead, ArrayWrite};
pub use self::limited::LimitedRead;
pub use self::multibuf::{MultiBuffer, PacketHandle, PacketReader};
pub use self::pktbuf::PacketBuffer;

/// Stream I/O fault.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
	/// A write did not fit in the space remaining before the frame
	/// boundary.
	#[error("write past end of buffer")]
	Overflow,
	/// A read requested more bytes than remain in the current frame.
	#[error("read past end of frame")]
	Underflow,
	/// Frame contents violate a header invariant.
	#[error("malformed header")]
	Malformed,
}

pub type Result<T> = core::result::Result<T, StreamError>;

/// Notification hook for newly available packets.
pub trait ReadCallback {
	/// A complete packet has become available on the watched stream.
	fn data_rcvd(&mut self);
	/// The watched stream is going away.
	fn data_unlink(&mut self) {}
}

/// Byte-stream producer with packet framing.
///
/// Implementors provide [`get_write_space`](Self::get_write_space),
/// [`write_next`](Self::write_next), and the framing operations; the
/// typed helpers are derived. `write_next` is only invoked after a
/// space check, so implementations may treat it as infallible.
pub trait Writeable {
	/// Bytes accepted before the stream overflows.
	fn get_write_space(&self) -> usize;

	/// Append one byte. Only called when space is available.
	fn write_next(&mut self, data: u8);

	/// Record an overflow; the current frame is now poisoned.
	fn write_overflow(&mut self) {}

	/// Commit the current packet. Returns false (and discards the
	/// partial frame) if any prior write overflowed.
	fn write_finalize(&mut self) -> bool {
		true
	}

	/// Discard the partial packet and return to an accepting state.
	/// Idempotent.
	fn write_abort(&mut self) {}

	/// Append all of `src`, or set the overflow flag and append
	/// nothing.
	fn write_bytes(&mut self, src: &[u8]) {
		if self.get_write_space() >= src.len() {
			for &b in src {
				self.write_next(b);
			}
		} else {
			self.write_overflow();
		}
	}

	fn write_u8(&mut self, data: u8) {
		self.write_bytes(&[data]);
	}

	fn write_u16(&mut self, data: u16) {
		self.write_bytes(&data.to_be_bytes());
	}

	fn write_u32(&mut self, data: u32) {
		self.write_bytes(&data.to_be_bytes());
	}

	fn write_u64(&mut self, data: u64) {
		self.write_bytes(&data.to_be_bytes());
	}

	fn write_u16le(&mut self, data: u16) {
		self.write_bytes(&data.to_le_bytes());
	}

	fn write_u32le(&mut self, data: u32) {
		self.write_bytes(&data.to_le_bytes());
	}

	fn write_u64le(&mut self, data: u64) {
		self.write_bytes(&data.to_le_bytes());
	}

	fn write_i8(&mut self, data: i8) {
		self.write_u8(data as u8);
	}

	fn write_i16(&mut self, data: i16) {
		self.write_u16(data as u16);
	}

	fn write_i32(&mut self, data: i32) {
		self.write_u32(data as u32);
	}

	fn write_i64(&mut self, data: i64) {
		self.write_u64(data as u64);
	}

	fn write_f32(&mut self, data: f32) {
		self.write_u32(data.to_bits());
	}

	fn write_f64(&mut self, data: f64) {
		self.write_u64(data.to_bits());
	}

	fn write_str(&mut self, data: &str) {
		self.write_bytes(data.as_bytes());
	}
}

/// Byte-stream consumer with packet framing.
pub trait Readable {
	/// Bytes remaining in the current frame.
	fn get_read_ready(&self) -> usize;

	/// Consume one byte. Only called when data is available.
	fn read_next(&mut self) -> u8;

	/// Record an underflow; reads fail until the frame is finalized.
	fn read_underflow(&mut self) {}

	/// Discard any unread bytes of the current packet and make the
	/// next packet (if any) available.
	fn read_finalize(&mut self) {}

	/// Fill all of `dst`, or consume nothing and fail.
	fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
		if self.get_read_ready() >= dst.len() {
			for b in dst.iter_mut() {
				*b = self.read_next();
			}
			Ok(())
		} else {
			self.read_underflow();
			Err(StreamError::Underflow)
		}
	}

	/// Discard exactly `n` bytes.
	fn read_consume(&mut self, n: usize) -> Result<()> {
		if self.get_read_ready() >= n {
			for _ in 0..n {
				self.read_next();
			}
			Ok(())
		} else {
			self.read_underflow();
			Err(StreamError::Underflow)
		}
	}

	fn read_u8(&mut self) -> Result<u8> {
		let mut buf = [0u8; 1];
		self.read_bytes(&mut buf)?;
		Ok(buf[0])
	}

	fn read_u16(&mut self) -> Result<u16> {
		let mut buf = [0u8; 2];
		self.read_bytes(&mut buf)?;
		Ok(u16::from_be_bytes(buf))
	}

	fn read_u32(&mut self) -> Result<u32> {
		let mut buf = [0u8; 4];
		self.read_bytes(&mut buf)?;
		Ok(u32::from_be_bytes(buf))
	}

	fn read_u64(&mut self) -> Result<u64> {
		let mut buf = [0u8; 8];
		self.read_bytes(&mut buf)?;
		Ok(u64::from_be_bytes(buf))
	}

	fn read_u16le(&mut self) -> Result<u16> {
		let mut buf = [0u8; 2];
		self.read_bytes(&mut buf)?;
		Ok(u16::from_le_bytes(buf))
	}

	fn read_u32le(&mut self) -> Result<u32> {
		let mut buf = [0u8; 4];
		self.read_bytes(&mut buf)?;
		Ok(u32::from_le_bytes(buf))
	}

	fn read_u64le(&mut self) -> Result<u64> {
		let mut buf = [0u8; 8];
		self.read_bytes(&mut buf)?;
		Ok(u64::from_le_bytes(buf))
	}

	fn read_i8(&mut self) -> Result<i8> {
		Ok(self.read_u8()? as i8)
	}

	fn read_i16(&mut self) -> Result<i16> {
		Ok(self.read_u16()? as i16)
	}

	fn read_i32(&mut self) -> Result<i32> {
		Ok(self.read_u32()? as i32)
	}

	fn read_i64(&mut self) -> Result<i64> {
		Ok(self.read_u64()? as i64)
	}

	fn read_f32(&mut self) -> Result<f32> {
		Ok(f32::from_bits(self.read_u32()?))
	}

	fn read_f64(&mut self) -> Result<f64> {
		Ok(f64::from_bits(self.read_u64()?))
	}

	/// Stream the remaining bytes of the current packet to `dst`.
	/// Stops early (flagging overflow on `dst`) if `dst` fills up.
	/// Returns the number of bytes copied.
	fn copy_to(&mut self, dst: &mut dyn Writeable) -> usize {
		let mut count = 0;
		while self.get_read_ready() > 0 {
			if dst.get_write_space() == 0 {
				dst.write_overflow();
				break;
			}
			dst.write_next(self.read_next());
			count += 1;
		}
		count
	}
}
