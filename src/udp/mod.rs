//! UDP datagram header and well-known ports.

use core::fmt;

use crate::io::{Readable, Result, StreamError, Writeable};

/// A UDP port number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Port(pub u16);

pub const PORT_NONE: Port = Port(0);
pub const PORT_ECHO: Port = Port(7);
pub const PORT_DHCP_SERVER: Port = Port(67);
pub const PORT_DHCP_CLIENT: Port = Port(68);
pub const PORT_TFTP_SERVER: Port = Port(69);
pub const PORT_NTP_SERVER: Port = Port(123);
pub const PORT_PTP_EVENT: Port = Port(319);
pub const PORT_PTP_GENERAL: Port = Port(320);

/// First port in the dynamically allocated range.
pub const DYNAMIC_PORT_MIN: u16 = 0xC000;
/// Last port in the dynamically allocated range.
pub const DYNAMIC_PORT_MAX: u16 = 0xFFFF;

impl fmt::Display for Port {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// On-wire length of the UDP header.
pub const UDP_HDR_BYTES: usize = 8;

/// A UDP header. The checksum is written as zero (disabled) on send
/// and ignored on receive.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct UdpHeader {
	pub src: Port,
	pub dst: Port,
	/// Datagram length, including this header.
	pub length: u16,
}

impl UdpHeader {
	pub fn write_to(&self, wr: &mut dyn Writeable) {
		wr.write_u16(self.src.0);
		wr.write_u16(self.dst.0);
		wr.write_u16(self.length);
		wr.write_u16(0); // Checksum disabled
	}

	pub fn read_from(rd: &mut dyn Readable) -> Result<Self> {
		if rd.get_read_ready() < UDP_HDR_BYTES {
			return Err(StreamError::Underflow);
		}
		let hdr = Self {
			src: Port(rd.read_u16()?),
			dst: Port(rd.read_u16()?),
			length: rd.read_u16()?,
		};
		let _chk = rd.read_u16()?;
		if usize::from(hdr.length) < UDP_HDR_BYTES {
			return Err(StreamError::Malformed);
		}
		Ok(hdr)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::io::{ArrayRead, ArrayWrite};

	#[test]
	fn header_round_trip_zeroes_checksum() {
		let hdr = UdpHeader {
			src: Port(0xC123),
			dst: Port(5000),
			length: 12,
		};
		let mut buf = [0u8; 8];
		let mut wr = ArrayWrite::new(&mut buf);
		hdr.write_to(&mut wr);
		assert!(wr.write_finalize());
		assert_eq!(&buf[6..8], &[0, 0]);

		let mut rd = ArrayRead::new(&buf);
		assert_eq!(UdpHeader::read_from(&mut rd), Ok(hdr));
	}

	#[test]
	fn nonzero_checksum_is_ignored() {
		let bytes = [0x12, 0x34, 0x13, 0x88, 0x00, 0x09, 0xAB, 0xCD, 0x55];
		let mut rd = ArrayRead::new(&bytes);
		let hdr = UdpHeader::read_from(&mut rd).unwrap();
		assert_eq!(hdr.dst, Port(5000));
		assert_eq!(hdr.length, 9);
	}

	#[test]
	fn undersized_length_is_rejected() {
		let bytes = [0x12, 0x34, 0x13, 0x88, 0x00, 0x04, 0x00, 0x00];
		let mut rd = ArrayRead::new(&bytes);
		assert_eq!(UdpHeader::read_from(&mut rd), Err(StreamError::Malformed));
	}
}
