//! Internet Control Message Protocol engine (RFC 792).
//!
//! Handles echo ("ping") service, timestamp queries, redirect
//! processing, and the generation of standard error messages on
//! behalf of the other layers.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use smallvec::SmallVec;

use super::{Address, Interface};
use crate::io::{ArrayRead, ArrayWrite, LimitedRead, Readable, Writeable};
use crate::ip::{Addr, IpHeader, PROTO_ICMP, checksum, checksum_bytes};

// Combined ICMP message codes (type in the high byte, subtype low).
pub const ECHO_REPLY: u16 = 0x0000;
pub const UNREACHABLE_NET: u16 = 0x0300;
pub const UNREACHABLE_HOST: u16 = 0x0301;
pub const UNREACHABLE_PROTO: u16 = 0x0302;
pub const UNREACHABLE_PORT: u16 = 0x0303;
pub const REDIRECT_NET: u16 = 0x0500;
pub const REDIRECT_HOST: u16 = 0x0501;
pub const ECHO_REQUEST: u16 = 0x0800;
pub const TTL_EXPIRED: u16 = 0x0B00;
pub const TIME_REQUEST: u16 = 0x0D00;
pub const TIME_REPLY: u16 = 0x0E00;

/// Mask selecting the ICMP type byte of a combined code.
pub const TYPE_MASK: u16 = 0xFF00;

/// Number of payload bytes echoed inside an ICMP error message.
pub const ICMP_ECHO_BYTES: usize = 8;

/// Is this combined code an ICMP *error* (as opposed to a query or
/// reply)? Errors must never trigger further ICMP errors.
pub fn is_error_type(code: u16) -> bool {
	matches!(code & TYPE_MASK, 0x0300 | 0x0500 | 0x0B00 | 0x0C00)
}

/// Callback interface for echo ("ping") responses.
pub trait PingListener {
	fn ping_event(&mut self, iface: &mut Interface, from: Addr, elapsed_usec: u32);
}

pub(crate) type PingListenerList = SmallVec<[Rc<RefCell<dyn PingListener>>; 2]>;

impl Interface {
	/// Register a listener for echo replies.
	pub fn icmp_add_ping_listener(&mut self, listener: Rc<RefCell<dyn PingListener>>) {
		self.ping_listeners.insert(0, listener);
	}

	pub fn icmp_remove_ping_listener(&mut self, listener: &Rc<RefCell<dyn PingListener>>) {
		self.ping_listeners.retain(|l| !Rc::ptr_eq(l, listener));
	}

	/// Send an echo request to a resolved address. The identifier
	/// and sequence fields carry the transmit timestamp, so the
	/// matching reply yields a round-trip time without bookkeeping.
	pub fn icmp_send_ping(&mut self, addr: &mut Address) -> bool {
		let t0 = (self.clock().now() / 1_000) as u32;
		let chk = checksum_bytes(&t0.to_be_bytes(), checksum(&[ECHO_REQUEST], 0));
		let Some(mut wr) = addr.open_write(self, 8) else {
			return false;
		};
		wr.write_u16(ECHO_REQUEST);
		wr.write_u16(chk);
		wr.write_u32(t0);
		wr.write_finalize()
	}

	/// Send a standard ICMP error about the most recently received
	/// packet. `src` must be positioned at the offending packet's
	/// payload (the first [`ICMP_ECHO_BYTES`] of it are echoed);
	/// `arg` carries the redirect gateway for type-5 codes and is
	/// zero otherwise.
	///
	/// Errors are suppressed for broadcast/multicast traffic, for
	/// fragments, and in response to other ICMP errors.
	pub fn icmp_send_error(&mut self, code: u16, src: &mut dyn Readable, arg: u32) -> bool {
		let hdr = self.reply_hdr;
		if !hdr.src().is_unicast() || hdr.dst().is_multicast() || hdr.frg() != 0 {
			return false;
		}
		let mut tail = [0u8; ICMP_ECHO_BYTES];
		let n = src.get_read_ready().min(ICMP_ECHO_BYTES);
		if src.read_bytes(&mut tail[..n]).is_err() {
			return false;
		}
		if hdr.proto() == PROTO_ICMP {
			let embedded = u16::from(tail[0]) << 8;
			if n == 0 || is_error_type(embedded) {
				return false;
			}
		}

		// Message body: 32-bit argument, offending IP header, and the
		// first payload bytes.
		let mut scratch = [0u8; 4 + 2 * crate::ip::IP_HDR_MAX_SHORTS + ICMP_ECHO_BYTES];
		let body_len = {
			let mut wr = ArrayWrite::new(&mut scratch);
			wr.write_u32(arg);
			hdr.write_to(&mut wr);
			wr.write_bytes(&tail[..n]);
			if !wr.write_finalize() {
				return false;
			}
			wr.written()
		};
		let chk = checksum_bytes(&scratch[..body_len], checksum(&[code], 0));

		let Some(mut wr) = self.ip_open_reply(PROTO_ICMP, 4 + body_len) else {
			return false;
		};
		wr.write_u16(code);
		wr.write_u16(chk);
		wr.write_bytes(&scratch[..body_len]);
		wr.write_finalize()
	}

	pub(crate) fn icmp_frame_rcvd(&mut self, src: &mut LimitedRead<'_>) {
		if src.get_read_ready() < 4 {
			return;
		}
		let Ok(code) = src.read_u16() else { return };
		let Ok(chk) = src.read_u16() else { return };
		let mut rest = vec![0u8; src.get_read_ready()];
		if src.read_bytes(&mut rest).is_err() {
			return;
		}
		if checksum_bytes(&rest, checksum(&[code, chk], 0)) != 0 {
			trace!("Dropping ICMP message with bad checksum");
			return;
		}

		match code & TYPE_MASK {
			0x0000 if code == ECHO_REPLY => self.icmp_echo_reply(&rest),
			0x0800 if code == ECHO_REQUEST => self.icmp_echo_request(&rest),
			0x0500 => self.icmp_redirect(&rest),
			0x0D00 if code == TIME_REQUEST => self.icmp_time_request(&rest),
			typ if is_error_type(typ) => {
				debug!("ICMP error {:#06x} from {}", code, self.reply_ip());
			}
			_ => trace!("Ignoring ICMP message {code:#06x}"),
		}
	}

	fn icmp_echo_request(&mut self, rest: &[u8]) {
		let chk = checksum_bytes(rest, checksum(&[ECHO_REPLY], 0));
		let Some(mut wr) = self.ip_open_reply(PROTO_ICMP, 4 + rest.len()) else {
			return;
		};
		wr.write_u16(ECHO_REPLY);
		wr.write_u16(chk);
		wr.write_bytes(rest);
		wr.write_finalize();
	}

	fn icmp_echo_reply(&mut self, rest: &[u8]) {
		if rest.len() < 4 {
			return;
		}
		let t0 = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
		let now = (self.clock().now() / 1_000) as u32;
		let elapsed = now.wrapping_sub(t0);
		let from = self.reply_ip();
		let listeners: Vec<_> = self.ping_listeners.iter().cloned().collect();
		for listener in listeners {
			listener.borrow_mut().ping_event(self, from, elapsed);
		}
	}

	fn icmp_redirect(&mut self, rest: &[u8]) {
		if rest.len() < 4 + crate::ip::IP_HDR_MIN_BYTES {
			return;
		}
		let gateway = Addr(u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]));
		if !gateway.is_unicast() {
			return;
		}
		let mut rd = ArrayRead::new(&rest[4..]);
		if let Ok(embedded) = IpHeader::read_core(&mut rd) {
			debug!("ICMP redirect: {} via {}", embedded.dst(), gateway);
			self.arp_gateway_change(embedded.dst(), gateway);
		}
	}

	fn icmp_time_request(&mut self, rest: &[u8]) {
		// Identifier/sequence plus originate timestamp, then our
		// receive and transmit stamps (milliseconds).
		if rest.len() < 8 {
			return;
		}
		let now_ms = (self.clock().now() / 1_000_000) as u32;
		let mut body = [0u8; 16];
		body[..8].copy_from_slice(&rest[..8]);
		body[8..12].copy_from_slice(&now_ms.to_be_bytes());
		body[12..16].copy_from_slice(&now_ms.to_be_bytes());
		let chk = checksum_bytes(&body, checksum(&[TIME_REPLY], 0));
		let Some(mut wr) = self.ip_open_reply(PROTO_ICMP, 4 + body.len()) else {
			return;
		};
		wr.write_u16(TIME_REPLY);
		wr.write_u16(chk);
		wr.write_bytes(&body);
		wr.write_finalize();
	}
}

#[cfg(test)]
mod tests {
	use alloc::rc::Rc;
	use alloc::vec::Vec;
	use core::cell::RefCell;

	use super::super::testing::TestHarness;
	use super::*;
	use crate::eth::{EthHeader, MacAddr};
	use crate::ip::{MASK_24, Subnet};

	const MAC_SELF: MacAddr = MacAddr([0x02, 0xAA, 0, 0, 0, 0x01]);
	const MAC_PEER: MacAddr = MacAddr([0x02, 0xBB, 0, 0, 0, 0x02]);
	const IP_SELF: Addr = Addr::new(192, 168, 1, 10);
	const IP_PEER: Addr = Addr::new(192, 168, 1, 20);

	fn icmp_payload(code: u16, rest: &[u8]) -> Vec<u8> {
		let chk = checksum_bytes(rest, checksum(&[code], 0));
		let mut msg = Vec::new();
		msg.extend_from_slice(&code.to_be_bytes());
		msg.extend_from_slice(&chk.to_be_bytes());
		msg.extend_from_slice(rest);
		msg
	}

	fn parse_icmp_reply(frame: &[u8]) -> (IpHeader, u16, Vec<u8>) {
		let mut rd = ArrayRead::new(frame);
		let eth = EthHeader::read_from(&mut rd).unwrap();
		assert_eq!(eth.etype, crate::eth::ETYPE_IPV4);
		let ip = IpHeader::read_from(&mut rd).unwrap();
		assert_eq!(ip.proto(), PROTO_ICMP);
		let code = rd.read_u16().unwrap();
		let _chk = rd.read_u16().unwrap();
		let mut rest = vec![0u8; rd.get_read_ready()];
		rd.read_bytes(&mut rest).unwrap();
		(ip, code, rest)
	}

	#[test]
	fn echo_request_gets_echo_reply() {
		let mut h = TestHarness::new(MAC_SELF, IP_SELF);
		let payload = icmp_payload(ECHO_REQUEST, &[0x12, 0x34, 0x00, 0x01, b'h', b'i']);
		h.inject(&TestHarness::ip_frame(
			MAC_SELF, MAC_PEER, IP_PEER, IP_SELF, PROTO_ICMP, 64, &payload,
		));

		let sent = h.sent_frame().expect("an echo reply");
		let (ip, code, rest) = parse_icmp_reply(&sent);
		assert_eq!(ip.dst(), IP_PEER);
		assert_eq!(code, ECHO_REPLY);
		// Identifier, sequence, and payload are preserved.
		assert_eq!(rest, &[0x12, 0x34, 0x00, 0x01, b'h', b'i']);
	}

	#[test]
	fn corrupt_icmp_checksum_is_dropped() {
		let mut h = TestHarness::new(MAC_SELF, IP_SELF);
		let mut payload = icmp_payload(ECHO_REQUEST, &[1, 2, 3, 4]);
		payload[3] ^= 0xFF;
		h.inject(&TestHarness::ip_frame(
			MAC_SELF, MAC_PEER, IP_PEER, IP_SELF, PROTO_ICMP, 64, &payload,
		));
		assert!(h.sent_frame().is_none());
	}

	#[test]
	fn ping_reply_reports_elapsed_time() {
		struct Spy(Vec<(Addr, u32)>);
		impl PingListener for Spy {
			fn ping_event(&mut self, _iface: &mut Interface, from: Addr, usec: u32) {
				self.0.push((from, usec));
			}
		}

		let mut h = TestHarness::new(MAC_SELF, IP_SELF);
		let spy = Rc::new(RefCell::new(Spy(Vec::new())));
		h.iface.icmp_add_ping_listener(spy.clone());

		// Resolve the peer manually and send a ping.
		let mut addr = Address::new(PROTO_ICMP);
		addr.connect_manual(IP_PEER, MAC_PEER, crate::eth::VlanTag(0));
		assert!(h.iface.icmp_send_ping(&mut addr));
		let request = h.sent_frame().unwrap();
		let (_, code, echo) = parse_icmp_reply(&request);
		assert_eq!(code, ECHO_REQUEST);

		// The peer echoes the request back 2500 microseconds later.
		h.clock.advance_usec(2500);
		let reply = icmp_payload(ECHO_REPLY, &echo);
		h.inject(&TestHarness::ip_frame(
			MAC_SELF, MAC_PEER, IP_PEER, IP_SELF, PROTO_ICMP, 64, &reply,
		));
		assert_eq!(spy.borrow().0.as_slice(), &[(IP_PEER, 2500)]);
	}

	#[test]
	fn unknown_protocol_triggers_unreachable() {
		let mut h = TestHarness::new(MAC_SELF, IP_SELF);
		let frame = TestHarness::ip_frame(
			MAC_SELF,
			MAC_PEER,
			IP_PEER,
			IP_SELF,
			123, // No handler for this protocol
			64,
			&[0xA1, 0xA2, 0xA3, 0xA4, 0xB1, 0xB2, 0xB3, 0xB4, 0xC1],
		);
		h.inject(&frame);

		let sent = h.sent_frame().expect("protocol unreachable");
		let (ip, code, rest) = parse_icmp_reply(&sent);
		assert_eq!(code, UNREACHABLE_PROTO);
		assert_eq!(ip.dst(), IP_PEER);
		// Argument word, then the offending header, then 8 bytes.
		assert_eq!(&rest[..4], &[0, 0, 0, 0]);
		let mut rd = ArrayRead::new(&rest[4..]);
		let embedded = IpHeader::read_core(&mut rd).unwrap();
		assert_eq!(embedded.src(), IP_PEER);
		assert_eq!(embedded.dst(), IP_SELF);
		assert_eq!(embedded.proto(), 123);
		let tail = &rest[4 + 20..];
		assert_eq!(tail, &[0xA1, 0xA2, 0xA3, 0xA4, 0xB1, 0xB2, 0xB3, 0xB4]);
	}

	#[test]
	fn no_error_for_broadcast_or_icmp_errors() {
		let mut h = TestHarness::new(MAC_SELF, IP_SELF);
		// Multicast destination: accepted, but no ICMP error.
		let frame = TestHarness::ip_frame(
			MAC_SELF,
			MAC_PEER,
			IP_PEER,
			Addr::new(224, 0, 0, 1),
			123,
			64,
			&[0u8; 8],
		);
		h.inject(&frame);
		assert!(h.sent_frame().is_none());

		// An inbound ICMP error never triggers an outbound error.
		let err = icmp_payload(UNREACHABLE_HOST, &[0u8; 12]);
		h.inject(&TestHarness::ip_frame(
			MAC_SELF, MAC_PEER, IP_PEER, IP_SELF, PROTO_ICMP, 64, &err,
		));
		assert!(h.sent_frame().is_none());
	}

	#[test]
	fn redirect_updates_routing_table() {
		let mut h = TestHarness::new(MAC_SELF, IP_SELF);
		let gw1 = Addr::new(192, 168, 1, 1);
		let gw2 = Addr::new(192, 168, 1, 2);
		let remote = Addr::new(10, 0, 0, 5);
		h.routes
			.borrow_mut()
			.route_set(Subnet::new(Addr::new(10, 0, 0, 0), MASK_24), gw1);

		// Build the redirect: new gateway, then the embedded header
		// of the packet that took the wrong path.
		let mut body = Vec::new();
		body.extend_from_slice(&gw2.0.to_be_bytes());
		let mut hdr = IpHeader::default();
		hdr.data[0] = 0x4500;
		hdr.data[1] = 28;
		hdr.data[4] = (64 << 8) | u16::from(crate::ip::PROTO_UDP);
		hdr.data[6] = (IP_SELF.0 >> 16) as u16;
		hdr.data[7] = IP_SELF.0 as u16;
		hdr.data[8] = (remote.0 >> 16) as u16;
		hdr.data[9] = remote.0 as u16;
		hdr.data[5] = checksum(&hdr.data[..crate::ip::IP_HDR_MIN_SHORTS], 0);
		for word in &hdr.data[..crate::ip::IP_HDR_MIN_SHORTS] {
			body.extend_from_slice(&word.to_be_bytes());
		}
		body.extend_from_slice(&[0u8; 8]);

		let redirect = icmp_payload(REDIRECT_HOST, &body);
		h.inject(&TestHarness::ip_frame(
			MAC_SELF, MAC_PEER, gw1, IP_SELF, PROTO_ICMP, 64, &redirect,
		));

		let hop = h.routes.borrow().route_lookup(remote).unwrap();
		assert_eq!(hop.addr, gw2);
	}
}
