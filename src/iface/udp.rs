//! UDP layer: port-based delivery and dynamic port allocation.

use alloc::rc::Rc;
use core::cell::RefCell;

use super::{Address, Interface, TxFrame, icmp};
use crate::io::{ArrayRead, ArrayWrite, LimitedRead, Readable, Writeable};
use crate::net::{Protocol, Type};
use crate::udp::{DYNAMIC_PORT_MAX, DYNAMIC_PORT_MIN, Port, UDP_HDR_BYTES, UdpHeader};

impl Interface {
	/// Register a handler for datagrams to `port`.
	pub fn udp_bind(&mut self, port: Port, proto: Rc<RefCell<dyn Protocol>>) {
		self.udp_handlers.add(Type::from_u16(port.0), proto);
	}

	/// Register a handler filtering on (remote port, local port).
	pub fn udp_bind_pair(&mut self, src: Port, dst: Port, proto: Rc<RefCell<dyn Protocol>>) {
		self.udp_handlers.add(Type::pair(src.0, dst.0), proto);
	}

	pub fn udp_unbind(&mut self, proto: &Rc<RefCell<dyn Protocol>>) {
		self.udp_handlers.remove(proto);
	}

	/// Source port of the most recently received datagram.
	pub fn udp_reply_src(&self) -> Port {
		self.udp_reply_src
	}

	/// Destination port of the most recently received datagram.
	pub fn udp_reply_dst(&self) -> Port {
		self.udp_reply_dst
	}

	/// Claim an unused port from the dynamic range [0xC000, 0xFFFF].
	/// Returns [`crate::udp::PORT_NONE`] if every port is bound.
	pub fn udp_next_free_port(&mut self) -> Port {
		// Resume scanning just past the previous grant; this succeeds
		// on the first try unless the range is nearly saturated.
		let wrap = self.udp_next_port;
		loop {
			self.udp_next_port = if self.udp_next_port < DYNAMIC_PORT_MAX {
				self.udp_next_port + 1
			} else {
				DYNAMIC_PORT_MIN
			};
			if !self.udp_handlers.bound(Type::from_u16(self.udp_next_port)) {
				return Port(self.udp_next_port);
			}
			if self.udp_next_port == wrap {
				warn!("UDP dynamic ports exhausted");
				return crate::udp::PORT_NONE;
			}
		}
	}

	pub(crate) fn udp_frame_rcvd(&mut self, src: &mut LimitedRead<'_>) {
		let hdr = match UdpHeader::read_from(src) {
			Ok(hdr) => hdr,
			Err(err) => {
				trace!("Dropping malformed UDP header: {err}");
				return;
			}
		};
		self.udp_reply_src = hdr.src;
		self.udp_reply_dst = hdr.dst;

		// The length field must be consistent with the IP payload.
		let len_eff = usize::from(hdr.length) - UDP_HDR_BYTES;
		if len_eff > src.get_read_ready() {
			trace!("Dropping UDP datagram with bad length {}", hdr.length);
			return;
		}

		// Offer by destination port, then by (source, destination).
		// The UDP length trims any padding added by lower layers.
		let handler = self
			.udp_handlers
			.find(Type::from_u16(hdr.dst.0))
			.or_else(|| self.udp_handlers.find(Type::pair(hdr.src.0, hdr.dst.0)));
		if let Some(handler) = handler {
			let mut rd = LimitedRead::new(src, len_eff);
			handler.borrow_mut().frame_rcvd(self, &mut rd);
			return;
		}

		trace!("No handler for UDP port {}", hdr.dst);
		if self.reply_hdr.dst().is_unicast() {
			// Reconstruct the datagram header so the ICMP error can
			// echo the first eight bytes of the original payload.
			let mut scratch = [0u8; icmp::ICMP_ECHO_BYTES];
			let mut wr = ArrayWrite::new(&mut scratch);
			hdr.write_to(&mut wr);
			let ok = wr.write_finalize();
			debug_assert!(ok);
			let mut rd = ArrayRead::new(&scratch);
			self.icmp_send_error(icmp::UNREACHABLE_PORT, &mut rd, 0);
		}
	}

	/// Open an outgoing datagram toward a resolved address.
	pub fn udp_open_write(
		&mut self,
		addr: &mut Address,
		src: Port,
		dst: Port,
		len: usize,
	) -> Option<TxFrame<'_>> {
		let total = len + UDP_HDR_BYTES;
		let mut wr = addr.open_write(self, total)?;
		UdpHeader {
			src,
			dst,
			length: total as u16,
		}
		.write_to(&mut wr);
		Some(wr)
	}

	/// Open a reply to the most recently received datagram (ports
	/// swapped, addresses from the captured reply state).
	pub fn udp_open_reply(&mut self, len: usize) -> Option<TxFrame<'_>> {
		let total = len + UDP_HDR_BYTES;
		let hdr = UdpHeader {
			src: self.udp_reply_dst,
			dst: self.udp_reply_src,
			length: total as u16,
		};
		let dst_ip = self.reply_hdr.src();
		let mac = self.reply_mac();
		let vtag = self.reply_vtag();
		let mut wr = self.ip_open_write(mac, vtag, dst_ip, crate::ip::PROTO_UDP, total)?;
		hdr.write_to(&mut wr);
		Some(wr)
	}
}
