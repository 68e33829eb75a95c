//! Destination-address resolution state.

use super::arp::ArpListener;
use super::{Interface, TxFrame};
use crate::config::ARP_RETRY_MSEC;
use crate::eth::{MACADDR_BROADCAST, MACADDR_NONE, MacAddr, VlanTag};
use crate::ip::{ADDR_NONE, Addr};
use crate::util::elapsed;

/// Everything needed to reach one IPv4 destination: the next-hop
/// gateway, its MAC address, and the VLAN tag to use.
///
/// In automatic mode ([`Address::connect`]) the routing table picks
/// the next hop and ARP resolves its MAC, with queries rate-limited
/// to one per [`ARP_RETRY_MSEC`]. Register the object as an
/// [`ArpListener`] on its interface so replies and ICMP redirects
/// keep it current. Manual mode skips resolution entirely.
pub struct Address {
	proto: u8,
	ready: bool,
	arp_tref: u64,
	dstmac: MacAddr,
	dstaddr: Addr,
	gateway: Addr,
	vtag: VlanTag,
}

impl Address {
	/// Create an unconnected address for one IPv4 protocol number.
	pub fn new(proto: u8) -> Self {
		Self {
			proto,
			ready: false,
			arp_tref: 0,
			dstmac: MACADDR_BROADCAST,
			dstaddr: ADDR_NONE,
			gateway: ADDR_NONE,
			vtag: VlanTag(0),
		}
	}

	/// Resolve `dstaddr` through the routing table, issuing an ARP
	/// query if the next-hop MAC is not yet cached.
	pub fn connect(&mut self, iface: &mut Interface, dstaddr: Addr, vtag: VlanTag) {
		let route = iface.routes().borrow().route_lookup(dstaddr);
		self.dstaddr = dstaddr;
		self.vtag = vtag;
		self.arp_tref = iface.clock().now();
		match route {
			Some(hop) => {
				self.gateway = hop.addr;
				self.dstmac = hop.mac;
				if hop.addr.is_multicast() {
					// Multicast and broadcast need no resolution.
					self.ready = true;
				} else if hop.mac.is_unicast() {
					self.ready = true;
				} else if hop.addr.is_unicast() {
					self.ready = false;
					iface.arp_send_query(hop.addr, vtag);
				} else {
					self.ready = false;
				}
			}
			None => {
				// No route at all; halt until reconfigured.
				self.gateway = ADDR_NONE;
				self.dstmac = MACADDR_NONE;
				self.ready = false;
			}
		}
	}

	/// Use a caller-supplied MAC address, skipping resolution.
	/// (Required for DHCP-style flows where the IP may be zero.)
	pub fn connect_manual(&mut self, dstaddr: Addr, dstmac: MacAddr, vtag: VlanTag) {
		self.dstaddr = dstaddr;
		self.dstmac = dstmac;
		self.gateway = ADDR_NONE;
		self.vtag = vtag;
		self.ready = dstmac != MACADDR_NONE;
	}

	/// Forget the current destination.
	pub fn close(&mut self) {
		self.dstmac = MACADDR_BROADCAST;
		self.dstaddr = ADDR_NONE;
		self.gateway = ADDR_NONE;
		self.ready = false;
	}

	/// Can packets be sent right now?
	pub fn ready(&self) -> bool {
		self.ready
	}

	/// Re-issue the ARP query for an unresolved gateway.
	pub fn retry(&mut self, iface: &mut Interface) {
		if !self.ready && self.gateway.is_unicast() {
			iface.arp_send_query(self.gateway, self.vtag);
		}
	}

	/// Open an IPv4 frame to this destination. While unresolved,
	/// returns `None` and re-queries ARP at most once per
	/// [`ARP_RETRY_MSEC`].
	pub fn open_write<'a>(&mut self, iface: &'a mut Interface, len: usize) -> Option<TxFrame<'a>> {
		if self.ready {
			return iface.ip_open_write(self.dstmac, self.vtag, self.dstaddr, self.proto, len);
		}
		let retry_ns = u64::from(ARP_RETRY_MSEC) * 1_000_000;
		if self.gateway.is_unicast() && elapsed(iface.clock(), self.arp_tref) >= retry_ns {
			self.arp_tref = iface.clock().now();
			iface.arp_send_query(self.gateway, self.vtag);
		}
		None
	}

	pub fn dstaddr(&self) -> Addr {
		self.dstaddr
	}

	pub fn dstmac(&self) -> MacAddr {
		self.dstmac
	}

	pub fn gateway(&self) -> Addr {
		self.gateway
	}

	pub fn vtag(&self) -> VlanTag {
		self.vtag
	}

	pub fn is_multicast(&self) -> bool {
		self.dstaddr.is_multicast()
	}
}

impl ArpListener for Address {
	fn arp_event(&mut self, _iface: &mut Interface, mac: MacAddr, ip: Addr) {
		if ip == self.gateway {
			self.dstmac = mac;
			self.ready = true;
		}
	}

	fn gateway_change(&mut self, iface: &mut Interface, dst: Addr, gateway: Addr) {
		if dst != self.dstaddr || gateway == self.gateway {
			return;
		}
		// Adopt the new gateway at once. If its MAC is cached, use
		// it; otherwise query, and keep sending via the old MAC until
		// the answer arrives.
		self.gateway = gateway;
		let cached = iface.routes().borrow().route_lookup(self.dstaddr);
		match cached {
			Some(hop) if hop.mac.is_unicast() => self.dstmac = hop.mac,
			_ => {
				iface.arp_send_query(gateway, self.vtag);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use alloc::rc::Rc;
	use core::cell::RefCell;

	use super::super::testing::TestHarness;
	use super::*;
	use crate::eth::EthHeader;
	use crate::io::{ArrayRead, Readable, Writeable};
	use crate::ip::{MASK_24, PROTO_UDP, Subnet};

	const MAC_SELF: MacAddr = MacAddr([0x02, 0xAA, 0, 0, 0, 0x01]);
	const MAC_GW: MacAddr = MacAddr([0x02, 0xBB, 0, 0, 0, 0x02]);
	const IP_SELF: Addr = Addr::new(192, 168, 1, 10);
	const IP_GW: Addr = Addr::new(192, 168, 1, 1);
	const IP_REMOTE: Addr = Addr::new(10, 20, 30, 40);

	fn arp_reply_from_gw() -> alloc::vec::Vec<u8> {
		use crate::eth::ETYPE_ARP;
		use crate::io::ArrayWrite;
		let mut buf = [0u8; 64];
		let mut wr = ArrayWrite::new(&mut buf);
		EthHeader::new(MAC_SELF, MAC_GW, ETYPE_ARP, VlanTag(0)).write_to(&mut wr);
		wr.write_u16(1);
		wr.write_u16(0x0800);
		wr.write_u8(6);
		wr.write_u8(4);
		wr.write_u16(2); // Reply
		MAC_GW.write_to(&mut wr);
		IP_GW.write_to(&mut wr);
		MAC_SELF.write_to(&mut wr);
		IP_SELF.write_to(&mut wr);
		assert!(wr.write_finalize());
		let len = wr.written();
		buf[..len].to_vec()
	}

	#[test]
	fn connect_via_gateway_resolves_then_sends() {
		let mut h = TestHarness::new(MAC_SELF, IP_SELF);
		h.iface.route_simple(IP_GW, MASK_24);

		let addr = Rc::new(RefCell::new(Address::new(PROTO_UDP)));
		h.iface.arp_add_listener(addr.clone());
		addr.borrow_mut()
			.connect(&mut h.iface, IP_REMOTE, VlanTag(0));
		assert!(!addr.borrow().ready());
		assert_eq!(addr.borrow().gateway(), IP_GW);

		// The connect issued exactly one broadcast ARP query.
		let query = h.sent_frame().expect("an ARP query");
		let mut rd = ArrayRead::new(&query);
		let eth = EthHeader::read_from(&mut rd).unwrap();
		assert_eq!(eth.dst, crate::eth::MACADDR_BROADCAST);
		assert_eq!(eth.etype, crate::eth::ETYPE_ARP);

		// Not ready yet: writes fail, and the retry is rate-limited.
		assert!(addr.borrow_mut().open_write(&mut h.iface, 4).is_none());
		assert!(h.sent_frame().is_none());

		// After the retry interval, another query goes out.
		h.clock.advance_msec(u64::from(ARP_RETRY_MSEC));
		assert!(addr.borrow_mut().open_write(&mut h.iface, 4).is_none());
		assert!(h.sent_frame().is_some());

		// The gateway answers; the address becomes ready.
		h.inject(&arp_reply_from_gw());
		assert!(addr.borrow().ready());
		assert_eq!(addr.borrow().dstmac(), MAC_GW);

		{
			let mut wr = addr.borrow_mut().open_write(&mut h.iface, 2).unwrap();
			wr.write_u16(0xF00D);
			assert!(wr.write_finalize());
		}
		let sent = h.sent_frame().unwrap();
		let mut rd = ArrayRead::new(&sent);
		let eth = EthHeader::read_from(&mut rd).unwrap();
		assert_eq!(eth.dst, MAC_GW);
		let ip = crate::ip::IpHeader::read_from(&mut rd).unwrap();
		assert_eq!(ip.dst(), IP_REMOTE);
		assert_eq!(ip.proto(), PROTO_UDP);
	}

	#[test]
	fn connect_multicast_is_immediately_ready() {
		let mut h = TestHarness::new(MAC_SELF, IP_SELF);
		let mut addr = Address::new(PROTO_UDP);
		addr.connect(&mut h.iface, Addr::new(224, 0, 0, 7), VlanTag(0));
		assert!(addr.ready());
		assert_eq!(addr.dstmac(), MACADDR_BROADCAST);
		assert!(h.sent_frame().is_none());
	}

	#[test]
	fn connect_without_route_halts() {
		let mut h = TestHarness::new(MAC_SELF, IP_SELF);
		let mut addr = Address::new(PROTO_UDP);
		addr.connect(&mut h.iface, IP_REMOTE, VlanTag(0));
		assert!(!addr.ready());
		assert!(h.sent_frame().is_none());
		assert!(addr.open_write(&mut h.iface, 4).is_none());
	}

	#[test]
	fn gateway_change_requeries_when_unknown() {
		let mut h = TestHarness::new(MAC_SELF, IP_SELF);
		h.iface.route_simple(IP_GW, MASK_24);
		h.routes.borrow_mut().route_set(
			Subnet::new(Addr::new(10, 20, 30, 0), MASK_24),
			IP_GW,
		);

		let addr = Rc::new(RefCell::new(Address::new(PROTO_UDP)));
		h.iface.arp_add_listener(addr.clone());
		addr.borrow_mut()
			.connect(&mut h.iface, IP_REMOTE, VlanTag(0));
		h.inject(&arp_reply_from_gw());
		assert!(addr.borrow().ready());
		let _ = h.sent_frame();

		// A redirect moves the destination behind another gateway.
		let new_gw = Addr::new(192, 168, 1, 2);
		h.iface.arp_gateway_change(IP_REMOTE, new_gw);
		assert_eq!(addr.borrow().gateway(), new_gw);
		// Old MAC remains in use until the new one resolves.
		assert!(addr.borrow().ready());
		assert_eq!(addr.borrow().dstmac(), MAC_GW);
	}
}
