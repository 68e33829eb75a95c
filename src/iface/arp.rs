//! Address Resolution Protocol engine (RFC 826, RFC 5227).

use alloc::rc::Rc;
use core::cell::RefCell;

use smallvec::SmallVec;

use super::Interface;
use crate::eth::{ETYPE_ARP, MACADDR_BROADCAST, MACADDR_NONE, MacAddr, VlanTag};
use crate::io::{LimitedRead, Readable, Result, Writeable};
use crate::ip::{ADDR_NONE, Addr};
use crate::net::Type;

const ARP_HTYPE_ETHERNET: u16 = 0x0001;
const ARP_PTYPE_IPV4: u16 = 0x0800;
const ARP_HLEN_ETHERNET: u8 = 6;
const ARP_PLEN_IPV4: u8 = 4;
const ARP_OPER_QUERY: u16 = 0x0001;
const ARP_OPER_REPLY: u16 = 0x0002;
const ARP_FRAME_BYTES: usize = 28;

/// Callback interface for observed ARP traffic and gateway changes.
pub trait ArpListener {
	/// Called for every announced MAC/IP pair.
	fn arp_event(&mut self, iface: &mut Interface, mac: MacAddr, ip: Addr);

	/// Called when an ICMP redirect moves `_dst` behind `_gateway`.
	fn gateway_change(&mut self, _iface: &mut Interface, _dst: Addr, _gateway: Addr) {}
}

/// An ARP message body (operation plus the four address fields).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct ArpHeader {
	pub oper: u16,
	pub sha: MacAddr,
	pub spa: Addr,
	pub tha: MacAddr,
	pub tpa: Addr,
}

impl ArpHeader {
	/// Parse and validate an ARP body. Messages that are not
	/// IPv4-over-Ethernet are reported as `Ok(None)` and ignored.
	pub fn read_from(rd: &mut dyn Readable) -> Result<Option<Self>> {
		let htype = rd.read_u16()?;
		let ptype = rd.read_u16()?;
		let hlen = rd.read_u8()?;
		let plen = rd.read_u8()?;
		let oper = rd.read_u16()?;
		let sha = MacAddr::read_from(rd)?;
		let spa = Addr::read_from(rd)?;
		let tha = MacAddr::read_from(rd)?;
		let tpa = Addr::read_from(rd)?;
		let ok = htype == ARP_HTYPE_ETHERNET
			&& ptype == ARP_PTYPE_IPV4
			&& hlen == ARP_HLEN_ETHERNET
			&& plen == ARP_PLEN_IPV4;
		Ok(ok.then_some(Self {
			oper,
			sha,
			spa,
			tha,
			tpa,
		}))
	}
}

pub(crate) struct ArpState {
	listeners: SmallVec<[Rc<RefCell<dyn ArpListener>>; 4]>,
	proxy: bool,
}

impl ArpState {
	pub fn new() -> Self {
		Self {
			listeners: SmallVec::new(),
			proxy: false,
		}
	}
}

impl Interface {
	/// Register a listener for ARP events and gateway changes.
	pub fn arp_add_listener(&mut self, listener: Rc<RefCell<dyn ArpListener>>) {
		self.arp.listeners.insert(0, listener);
	}

	pub fn arp_remove_listener(&mut self, listener: &Rc<RefCell<dyn ArpListener>>) {
		self.arp.listeners.retain(|l| !Rc::ptr_eq(l, listener));
	}

	/// Enable or disable proxy-ARP replies for routed subnets.
	pub fn set_proxy_arp(&mut self, enable: bool) {
		self.arp.proxy = enable;
	}

	/// Broadcast a query for `target`'s MAC address.
	pub fn arp_send_query(&mut self, target: Addr, vtag: VlanTag) -> bool {
		let spa = self.ipaddr();
		self.arp_send(
			ARP_OPER_QUERY,
			vtag,
			MACADDR_BROADCAST,
			spa,
			MACADDR_BROADCAST, // THA is a placeholder in queries
			target,
		)
	}

	/// Broadcast a gratuitous announcement of our own binding
	/// (pseudo-request form preferred by RFC 5227 Section 3).
	pub fn arp_send_announce(&mut self, vtag: VlanTag) -> bool {
		let spa = self.ipaddr();
		self.arp_send(
			ARP_OPER_QUERY,
			vtag,
			MACADDR_BROADCAST,
			spa, // Announce SPA = our IP
			MACADDR_NONE, // Announce THA = zero (required)
			spa, // Announce TPA = our IP
		)
	}

	/// Broadcast an address probe (RFC 5227 Section 2.1) to test
	/// whether `target` is already claimed.
	pub fn arp_send_probe(&mut self, target: Addr, vtag: VlanTag) -> bool {
		self.arp_send(
			ARP_OPER_QUERY,
			vtag,
			MACADDR_BROADCAST,
			ADDR_NONE, // Probe SPA = zero (required)
			MACADDR_NONE, // Probe THA = zero (required)
			target,
		)
	}

	/// Propagate an ICMP redirect: update the routing table and
	/// notify every listener.
	pub fn arp_gateway_change(&mut self, dst: Addr, gateway: Addr) {
		self.routes().borrow_mut().gateway_change(dst, gateway);
		let listeners = self.arp.listeners.clone();
		for listener in listeners {
			listener.borrow_mut().gateway_change(self, dst, gateway);
		}
	}

	pub(crate) fn arp_frame_rcvd(&mut self, src: &mut LimitedRead<'_>) {
		if src.get_read_ready() < ARP_FRAME_BYTES {
			return;
		}
		let hdr = match ArpHeader::read_from(src) {
			Ok(Some(hdr)) => hdr,
			_ => return,
		};

		// A zero or broadcast sender MAC is never legitimate.
		if hdr.sha == MACADDR_NONE || hdr.sha == MACADDR_BROADCAST {
			return;
		}

		// Valid SHA/SPA pairs feed the MAC cache and all listeners.
		if hdr.spa.is_unicast() {
			self.routes().borrow_mut().route_cache(hdr.spa, hdr.sha);
			let listeners = self.arp.listeners.clone();
			for listener in listeners {
				listener.borrow_mut().arp_event(self, hdr.sha, hdr.spa);
			}
		}

		// Reply to queries for our own address, or (as proxy) for
		// subnets the routing table says we can reach.
		if hdr.oper == ARP_OPER_QUERY && self.arp_should_answer(hdr.tpa) {
			trace!("ARP reply to {} for {}", hdr.spa, hdr.tpa);
			let vtag = self.reply_vtag();
			// Per RFC 5227 Section 2, reply to the requester only.
			self.arp_send(ARP_OPER_REPLY, vtag, hdr.sha, hdr.tpa, hdr.sha, hdr.spa);
		}
	}

	fn arp_should_answer(&self, tpa: Addr) -> bool {
		if tpa == self.ipaddr() && tpa.is_valid() {
			return true;
		}
		if !self.arp.proxy || !tpa.is_unicast() || tpa == self.ipaddr() {
			return false;
		}
		// Proxy mode answers for routed subnets, but never for /32
		// host entries (those peers answer for themselves).
		self.routes()
			.borrow()
			.iter()
			.any(|route| route.subnet.contains(tpa) && route.subnet.mask.prefix() < 32)
	}

	fn arp_send(
		&mut self,
		oper: u16,
		vtag: VlanTag,
		dst: MacAddr,
		spa: Addr,
		tha: MacAddr,
		tpa: Addr,
	) -> bool {
		let sha = self.macaddr();
		let Some(mut wr) = self.eth_open_write(dst, ETYPE_ARP, vtag, ARP_FRAME_BYTES) else {
			return false;
		};
		wr.write_u16(ARP_HTYPE_ETHERNET);
		wr.write_u16(ARP_PTYPE_IPV4);
		wr.write_u8(ARP_HLEN_ETHERNET);
		wr.write_u8(ARP_PLEN_IPV4);
		wr.write_u16(oper);
		sha.write_to(&mut wr);
		spa.write_to(&mut wr);
		tha.write_to(&mut wr);
		tpa.write_to(&mut wr);
		wr.write_finalize()
	}
}

/// Pattern matching ARP frames on the Ethernet layer.
pub const TYPE_ARP: Type = Type::from_u16(0x0806);
