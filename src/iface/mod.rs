//! The host-side protocol stack bound to one network attachment.
//!
//! An [`Interface`] owns the Ethernet, ARP, IPv4, ICMP, and UDP
//! layers for a single attachment point (a switch port, a serial
//! link codec, or a loopback buffer in tests). Incoming frames are
//! pulled with [`Interface::poll`]; outgoing frames are opened with
//! one of the `*_open_write` / `*_open_reply` methods, written, and
//! committed with `write_finalize`.
//!
//! User protocols register through the [`crate::net::Dispatch`]
//! lists of each layer. ARP, ICMP, and UDP are built into the
//! interface itself and claim their EtherType / protocol numbers
//! before the user lists are consulted.

use alloc::rc::Rc;
use core::cell::{RefCell, RefMut};

use crate::eth::{
	ETH_HDR_TAGGED_BYTES, ETYPE_ARP, ETYPE_IPV4, ETYPE_MIN_PROTOCOL, EthHeader, EtherType,
	MACADDR_NONE, MacAddr, VlanTag,
};
use crate::io::{LimitedRead, Readable, Writeable};
use crate::ip::{IpHeader, RouteTable};
use crate::net::{Dispatch, Type};
use crate::udp::Port;
use crate::util::{Clock, Prng};

mod addr;
mod arp;
pub mod icmp;
mod ping;
mod udp;

pub use self::addr::Address;
pub use self::arp::ArpListener;
pub use self::icmp::PingListener;
pub use self::ping::Ping;

use self::arp::ArpState;

/// One network attachment with its full protocol stack.
pub struct Interface {
	mac: MacAddr,
	addr: crate::ip::Addr,
	tx: Rc<RefCell<dyn Writeable>>,
	clock: Rc<dyn Clock>,
	routes: Rc<RefCell<RouteTable>>,
	// Ethernet layer
	eth_handlers: Dispatch,
	default_vid: VlanTag,
	reply_mac: MacAddr,
	reply_vtag: VlanTag,
	// ARP engine
	pub(crate) arp: ArpState,
	// IPv4 layer
	ip_handlers: Dispatch,
	pub(crate) reply_hdr: IpHeader,
	ident: u16,
	// ICMP engine
	pub(crate) ping_listeners: icmp::PingListenerList,
	// UDP layer
	pub(crate) udp_handlers: Dispatch,
	pub(crate) udp_reply_src: Port,
	pub(crate) udp_reply_dst: Port,
	pub(crate) udp_next_port: u16,
}

impl Interface {
	/// Create an interface with the given addresses, frame sink, and
	/// ambient services. The IPv4 identification counter is seeded
	/// from `prng` once, here.
	pub fn new(
		mac: MacAddr,
		addr: crate::ip::Addr,
		tx: Rc<RefCell<dyn Writeable>>,
		clock: Rc<dyn Clock>,
		routes: Rc<RefCell<RouteTable>>,
		prng: &mut dyn Prng,
	) -> Self {
		Self {
			mac,
			addr,
			tx,
			clock,
			routes,
			eth_handlers: Dispatch::new(),
			default_vid: VlanTag(0),
			reply_mac: crate::eth::MACADDR_BROADCAST,
			reply_vtag: VlanTag(0),
			arp: ArpState::new(),
			ip_handlers: Dispatch::new(),
			reply_hdr: IpHeader::default(),
			ident: prng.next_u32() as u16,
			ping_listeners: icmp::PingListenerList::new(),
			udp_handlers: Dispatch::new(),
			udp_reply_src: Port(0),
			udp_reply_dst: Port(0),
			udp_next_port: crate::udp::DYNAMIC_PORT_MIN.wrapping_sub(1),
		}
	}

	pub fn macaddr(&self) -> MacAddr {
		self.mac
	}

	pub fn set_macaddr(&mut self, mac: MacAddr) {
		self.mac = mac;
	}

	pub fn ipaddr(&self) -> crate::ip::Addr {
		self.addr
	}

	pub fn set_ipaddr(&mut self, addr: crate::ip::Addr) {
		self.addr = addr;
	}

	/// Shared handle to the routing table.
	pub fn routes(&self) -> Rc<RefCell<RouteTable>> {
		self.routes.clone()
	}

	pub(crate) fn clock(&self) -> &dyn Clock {
		&*self.clock
	}

	/// Source MAC of the most recently received frame.
	pub fn reply_mac(&self) -> MacAddr {
		self.reply_mac
	}

	/// VID (only) of the most recently received frame's tag.
	pub fn reply_vtag(&self) -> VlanTag {
		self.reply_vtag
	}

	/// VID merged into outgoing frames that specify none. Useful for
	/// attachments where tags are mandatory.
	pub fn set_default_vid(&mut self, vid: VlanTag) {
		self.default_vid = VlanTag(vid.vid());
	}

	/// Set the default route to `gateway` and mark the interface's
	/// own subnet (derived from `mask`) as directly attached.
	pub fn route_simple(&mut self, gateway: crate::ip::Addr, mask: crate::ip::Mask) {
		let mut routes = self.routes.borrow_mut();
		routes.route_default(gateway);
		routes.route_local(crate::ip::Subnet::new(self.addr, mask));
	}

	/// Register a handler for an Ethernet-layer pattern (EtherType,
	/// or VID + EtherType via [`Type::pair`]).
	pub fn eth_bind(&mut self, typ: Type, proto: Rc<RefCell<dyn crate::net::Protocol>>) {
		self.eth_handlers.add(typ, proto);
	}

	pub fn eth_unbind(&mut self, proto: &Rc<RefCell<dyn crate::net::Protocol>>) {
		self.eth_handlers.remove(proto);
	}

	/// Register a handler for an IPv4 protocol number.
	pub fn ip_bind(&mut self, proto_id: u8, proto: Rc<RefCell<dyn crate::net::Protocol>>) {
		self.ip_handlers.add(Type::from_u8(proto_id), proto);
	}

	pub fn ip_unbind(&mut self, proto: &Rc<RefCell<dyn crate::net::Protocol>>) {
		self.ip_handlers.remove(proto);
	}

	/// Drain and process every complete frame queued on `src`.
	pub fn poll(&mut self, src: &mut dyn Readable) {
		while src.get_read_ready() > 0 {
			self.eth_frame_rcvd(src);
			src.read_finalize();
		}
	}

	fn eth_frame_rcvd(&mut self, src: &mut dyn Readable) {
		let hdr = match EthHeader::read_from(src) {
			Ok(hdr) => hdr,
			Err(err) => {
				trace!("Dropping malformed Ethernet frame: {err}");
				return;
			}
		};
		self.reply_mac = hdr.src;
		self.reply_vtag = VlanTag(hdr.vtag.vid());

		// ARP, then IPv4, are handled by the built-in engines.
		match hdr.etype {
			ETYPE_ARP => {
				let len = src.get_read_ready();
				let mut rd = LimitedRead::new(src, len);
				self.arp_frame_rcvd(&mut rd);
				return;
			}
			ETYPE_IPV4 => {
				self.ip_frame_rcvd(src);
				return;
			}
			_ => {}
		}

		// Everything else goes to the registered Ethernet handlers:
		// first as (VID, EtherType), then as plain (EtherType), so
		// VLAN-specific handlers take priority over generic ones.
		let mut pending = true;
		if hdr.vtag.vid() != 0 {
			pending = !self.eth_deliver(Type::pair(hdr.vtag.vid(), hdr.etype.0), src);
		}
		if pending {
			pending = !self.eth_deliver(Type::from_u16(hdr.etype.0), src);
		}
		if pending {
			trace!("No handler for EtherType {}", hdr.etype);
		}
	}

	fn eth_deliver(&mut self, typ: Type, src: &mut dyn Readable) -> bool {
		let Some(proto) = self.eth_handlers.find(typ) else {
			return false;
		};
		let len = src.get_read_ready();
		let mut rd = LimitedRead::new(src, len);
		proto.borrow_mut().frame_rcvd(self, &mut rd);
		true
	}

	/// Open an outgoing Ethernet frame. `len` is the payload size
	/// that will follow the header; the frame is refused when the
	/// sink lacks space, the destination is unset, or the EtherType
	/// is a legacy length value.
	pub fn eth_open_write(
		&mut self,
		dst: MacAddr,
		etype: EtherType,
		mut vtag: VlanTag,
		len: usize,
	) -> Option<TxFrame<'_>> {
		if dst == MACADDR_NONE || etype.0 < ETYPE_MIN_PROTOCOL {
			return None;
		}
		if vtag.vid() == 0 {
			vtag = VlanTag(vtag.0 | self.default_vid.0);
		}
		let mut wr = self.tx.borrow_mut();
		if wr.get_write_space() < ETH_HDR_TAGGED_BYTES + len {
			return None;
		}
		let hdr = EthHeader::new(dst, self.mac, etype, vtag);
		hdr.write_to(&mut *wr);
		Some(TxFrame(wr))
	}

	/// Open a reply to the most recently received frame. The `typ`
	/// pattern carries (VID, EtherType); a zero VID falls back to the
	/// received frame's VID.
	pub fn eth_open_reply(&mut self, typ: Type, len: usize) -> Option<TxFrame<'_>> {
		let (vid, etype) = typ.as_pair();
		let mut vtag = VlanTag(vid);
		if vtag.vid() == 0 {
			vtag = VlanTag(vtag.0 | self.reply_vtag.0);
		}
		self.eth_open_write(self.reply_mac, EtherType(etype), vtag, len)
	}

	// ---- IPv4 layer ----------------------------------------------

	/// Source address of the most recently accepted IPv4 packet.
	pub fn reply_ip(&self) -> crate::ip::Addr {
		self.reply_hdr.src()
	}

	/// Header of the most recently accepted IPv4 packet.
	pub fn reply_ip_hdr(&self) -> &IpHeader {
		&self.reply_hdr
	}

	fn ip_frame_rcvd(&mut self, src: &mut dyn Readable) {
		let hdr = match IpHeader::read_from(src) {
			Ok(hdr) => hdr,
			Err(err) => {
				trace!("Dropping malformed IPv4 header: {err}");
				return;
			}
		};
		// Fragmentation is not supported.
		if hdr.frg() != 0 {
			trace!("Dropping IPv4 fragment from {}", hdr.src());
			return;
		}
		self.reply_hdr = hdr;

		let accept = hdr.dst() == self.addr // Regular unicast
			|| hdr.dst().is_multicast() // Broadcast or multicast
			|| !self.addr.is_valid(); // Local address not yet set
		if !accept {
			return;
		}

		let len = hdr.len_inner();
		match hdr.proto() {
			crate::ip::PROTO_ICMP => {
				let mut rd = LimitedRead::new(src, len);
				self.icmp_frame_rcvd(&mut rd);
			}
			crate::ip::PROTO_UDP => {
				let mut rd = LimitedRead::new(src, len);
				self.udp_frame_rcvd(&mut rd);
			}
			proto => {
				if let Some(handler) = self.ip_handlers.find(Type::from_u8(proto)) {
					let mut rd = LimitedRead::new(src, len);
					handler.borrow_mut().frame_rcvd(self, &mut rd);
				} else if hdr.dst() == self.addr && hdr.dst().is_unicast() {
					let mut rd = LimitedRead::new(src, len);
					self.icmp_send_error(icmp::UNREACHABLE_PROTO, &mut rd, 0);
				}
			}
		}
	}

	/// Build the next outgoing IPv4 header.
	pub(crate) fn next_header(&mut self, proto: u8, dst: crate::ip::Addr, inner: usize) -> IpHeader {
		let mut hdr = IpHeader::default();
		hdr.data[0] = 0x4500; // Version 4, IHL 5, no DSCP/ECN
		hdr.data[1] = (inner + crate::ip::IP_HDR_MIN_BYTES) as u16;
		hdr.data[2] = self.ident;
		hdr.data[3] = 0; // Never fragmented on send
		hdr.data[4] = (u16::from(crate::config::IP_DEFAULT_TTL) << 8) | u16::from(proto);
		hdr.data[5] = 0;
		hdr.data[6] = (self.addr.0 >> 16) as u16;
		hdr.data[7] = self.addr.0 as u16;
		hdr.data[8] = (dst.0 >> 16) as u16;
		hdr.data[9] = dst.0 as u16;
		hdr.data[5] = crate::ip::checksum(&hdr.data[..crate::ip::IP_HDR_MIN_SHORTS], 0);
		self.ident = self.ident.wrapping_add(1);
		hdr
	}

	/// Open an outgoing IPv4 packet toward a resolved MAC address.
	/// `len` is the payload size after the IPv4 header.
	pub fn ip_open_write(
		&mut self,
		dstmac: MacAddr,
		vtag: VlanTag,
		dst: crate::ip::Addr,
		proto: u8,
		len: usize,
	) -> Option<TxFrame<'_>> {
		let hdr = self.next_header(proto, dst, len);
		let mut frame =
			self.eth_open_write(dstmac, ETYPE_IPV4, vtag, len + crate::ip::IP_HDR_MIN_BYTES)?;
		hdr.write_to(&mut frame);
		Some(frame)
	}

	/// Open an IPv4 reply to the most recently accepted packet.
	pub fn ip_open_reply(&mut self, proto: u8, len: usize) -> Option<TxFrame<'_>> {
		let dst = self.reply_hdr.src();
		let vtag = self.reply_vtag;
		let mac = self.reply_mac;
		self.ip_open_write(mac, vtag, dst, proto, len)
	}
}

/// An open outgoing frame.
///
/// Write the payload through the [`Writeable`] impl, then commit
/// with `write_finalize` (or drop to abandon the frame to the sink's
/// abort handling).
pub struct TxFrame<'a>(RefMut<'a, dyn Writeable + 'static>);

impl Writeable for TxFrame<'_> {
	fn get_write_space(&self) -> usize {
		self.0.get_write_space()
	}

	fn write_next(&mut self, data: u8) {
		self.0.write_next(data);
	}

	fn write_overflow(&mut self) {
		self.0.write_overflow();
	}

	fn write_finalize(&mut self) -> bool {
		self.0.write_finalize()
	}

	fn write_abort(&mut self) {
		self.0.write_abort();
	}
}
