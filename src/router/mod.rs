//! IPv4 router built on the switch engine.
//!
//! The router reuses the switch's pool, ingress queue, and plugin
//! chain, but replaces the delivery stage: instead of flooding by
//! MAC address, each packet is classified (local, ARP, policy,
//! forward), has its TTL decremented and checksum incrementally
//! updated, and is steered by a longest-prefix routing lookup. When
//! the next hop's MAC is unknown, the packet parks in the deferred-
//! forwarding pool while ARP resolves it. A hardware offload bridge
//! can carry part of the port set.
//!
//! One switch port (the "local" port) is wired to an [`Interface`],
//! which supplies the router's own ARP, ICMP, and UDP stacks.

use alloc::rc::Rc;
use core::cell::RefCell;

use bitflags::bitflags;

use crate::eth::{ETYPE_ARP, ETYPE_IPV4, EthHeader, MacAddr, VlanTag};
use crate::iface::{ArpListener, Interface, icmp};
use crate::io::{ArrayWrite, Readable, Writeable};
use crate::ip::{Addr, PROTO_ICMP, RouteTable, checksum, checksum_bytes};
use crate::switch::{DropReason, PluginPacket, SwitchCore, idx2mask};
use crate::util::{Clock, Timer};

mod defer;
mod offload;

use self::defer::{DeferEvent, DeferFwd};
pub use self::offload::{MmioOffloadHw, Offload, OffloadHw, regs};

bitflags! {
	/// Router policy bits. A set bit *blocks* the named traffic
	/// class, mirroring the gateware policy register.
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct RouterRules: u32 {
		/// Block delivery of IPv4 broadcast/multicast to the local port.
		const LCL_BCAST = 1 << 21;
		/// Block all non-IPv4 traffic.
		const NOIP_ALL = 1 << 20;
		/// Block non-IPv4 broadcast traffic.
		const NOIP_BCAST = 1 << 19;
		/// Block forwarding of IPv4 multicast.
		const IPV4_MCAST = 1 << 18;
		/// Block forwarding of IPv4 broadcast.
		const IPV4_BCAST = 1 << 17;
		/// Block frames not addressed to the router's MAC.
		const BAD_DMAC = 1 << 16;
	}
}

/// The IPv4 router core.
pub struct Router {
	core: Rc<RefCell<SwitchCore>>,
	iface: Rc<RefCell<Interface>>,
	routes: Rc<RefCell<RouteTable>>,
	clock: Rc<dyn Clock>,
	local_port: usize,
	rules: RouterRules,
	defer: DeferFwd,
	offload: Option<Offload>,
	last_tick: u64,
}

impl Router {
	/// Create a router over an existing switch core and local
	/// interface. `local_port` names the switch port wired to the
	/// interface. The router registers itself for ARP callbacks;
	/// callers should also register it with a
	/// [`Timekeeper`](crate::util::Timekeeper) every
	/// [`DEFER_POLL_MSEC`](crate::config::DEFER_POLL_MSEC)
	/// milliseconds for retry processing.
	pub fn new(
		core: Rc<RefCell<SwitchCore>>,
		iface: Rc<RefCell<Interface>>,
		local_port: usize,
		clock: Rc<dyn Clock>,
	) -> Rc<RefCell<Self>> {
		let slots = core.borrow().pool().capacity_pkts();
		let routes = iface.borrow().routes();
		let now = clock.now();
		let router = Rc::new(RefCell::new(Self {
			core,
			iface: iface.clone(),
			routes,
			clock,
			local_port,
			rules: RouterRules::all(),
			defer: DeferFwd::new(slots),
			offload: None,
			last_tick: now,
		}));
		iface.borrow_mut().arp_add_listener(router.clone());
		router
	}

	pub fn ipaddr(&self) -> Addr {
		self.iface.borrow().ipaddr()
	}

	pub fn macaddr(&self) -> MacAddr {
		self.iface.borrow().macaddr()
	}

	pub fn set_ipaddr(&mut self, addr: Addr) {
		self.iface.borrow_mut().set_ipaddr(addr);
		self.reconfigure();
	}

	/// Permit the traffic classes in `rules`.
	pub fn rule_allow(&mut self, rules: RouterRules) {
		self.rules.remove(rules);
		self.reconfigure();
	}

	/// Block the traffic classes in `rules`.
	pub fn rule_block(&mut self, rules: RouterRules) {
		self.rules.insert(rules);
		self.reconfigure();
	}

	/// Attach the hardware offload bridge.
	pub fn set_offload(&mut self, offload: Offload) {
		self.offload = Some(offload);
		self.reconfigure();
	}

	pub fn offload(&self) -> Option<&Offload> {
		self.offload.as_ref()
	}

	/// Packets parked awaiting ARP resolution.
	pub fn defer_pending(&self) -> usize {
		self.defer.pending()
	}

	fn reconfigure(&mut self) {
		let mac = self.macaddr();
		let ip = self.ipaddr();
		let rules = self.rules;
		if let Some(offload) = self.offload.as_mut() {
			offload.reconfigure(mac, ip, rules);
		}
	}

	/// Drain the offload mailbox and the ingress queue, deciding the
	/// fate of every pending packet.
	pub fn poll(&mut self) {
		if let Some(offload) = self.offload.as_mut() {
			let mut core = self.core.borrow_mut();
			while offload.poll_rx(&mut core) {}
		}
		loop {
			let meta = self.core.borrow_mut().ingest_next();
			let Some(mut meta) = meta else { break };
			self.route_one(&mut meta);
		}
	}

	/// Classify one packet and dispose of its ingress reference.
	fn route_one(&mut self, meta: &mut PluginPacket) {
		// Traffic originated by the router itself (ARP queries,
		// ICMP, local applications) already carries resolved
		// headers; send it straight out.
		if meta.src_port == self.local_port {
			self.deliver_ports(meta);
			self.core.borrow_mut().free_packet(meta.pkt);
			return;
		}

		// ARP is handed to the local interface, which answers
		// queries (including proxy-ARP) and feeds every listener.
		if meta.hdr.etype == ETYPE_ARP {
			self.deliver_local(meta);
			self.core.borrow_mut().free_packet(meta.pkt);
			return;
		}

		let Some(ip) = meta.ip else {
			// Non-IPv4: blocked or switched at layer two.
			let bcast = meta.hdr.dst.is_multicast();
			let blocked = self.rules.contains(RouterRules::NOIP_ALL)
				|| (bcast && self.rules.contains(RouterRules::NOIP_BCAST));
			if blocked {
				self.drop(meta, DropReason::Policy);
			} else {
				self.deliver_ports(meta);
				self.core.borrow_mut().free_packet(meta.pkt);
			}
			return;
		};

		let dst = ip.dst();
		if dst == self.ipaddr() {
			self.deliver_local(meta);
			self.core.borrow_mut().free_packet(meta.pkt);
			return;
		}
		if dst.is_multicast() {
			let mut sunk = false;
			if !self.rules.contains(RouterRules::LCL_BCAST) {
				self.deliver_local(meta);
				sunk = true;
			}
			let fwd_rule = if dst.is_broadcast() {
				RouterRules::IPV4_BCAST
			} else {
				RouterRules::IPV4_MCAST
			};
			if !self.rules.contains(fwd_rule) {
				self.deliver_ports(meta);
				sunk = true;
			}
			if sunk {
				self.core.borrow_mut().free_packet(meta.pkt);
			} else {
				self.drop(meta, DropReason::Policy);
			}
			return;
		}

		// Unicast IPv4 not addressed to our MAC is only routed when
		// the policy explicitly permits promiscuous forwarding.
		if meta.hdr.dst != self.macaddr()
			&& !meta.hdr.dst.is_multicast()
			&& self.rules.contains(RouterRules::BAD_DMAC)
		{
			self.drop(meta, DropReason::Policy);
			return;
		}

		self.forward(meta, ip);
	}

	/// The common case: decrement TTL, find the next hop, rewrite
	/// the MAC addresses, and send (or defer, or reject).
	fn forward(&mut self, meta: &mut PluginPacket, ip: crate::ip::IpHeader) {
		if ip.ttl() <= 1 {
			self.icmp_error(icmp::TTL_EXPIRED, 0, meta);
			self.drop(meta, DropReason::Ttl);
			return;
		}

		// Decrement TTL with the RFC 1624 incremental checksum
		// update, and persist before any deferral.
		let mut newip = ip;
		let prev = newip.data[4];
		let next = prev - 0x0100;
		newip.data[4] = next;
		newip.chk_incr16(prev, next);
		meta.ip = Some(newip);
		meta.adjust();
		self.core.borrow_mut().persist_headers(meta);
		meta.dirty = false;

		let hop = self.routes.borrow().route_lookup(ip.dst());
		let Some(hop) = hop else {
			self.icmp_error(icmp::UNREACHABLE_NET, 0, meta);
			self.drop(meta, DropReason::NoRoute);
			return;
		};
		if let Some(port) = hop.port {
			meta.dst_mask = idx2mask(usize::from(port));
		}

		if hop.mac.is_unicast() {
			let our_mac = self.macaddr();
			meta.hdr.src = our_mac;
			meta.hdr.dst = hop.mac;
			meta.adjust();
			self.core.borrow_mut().persist_headers(meta);
			meta.dirty = false;
			self.deliver_ports(meta);
			self.core.borrow_mut().free_packet(meta.pkt);
		} else if self.defer.accept(meta.pkt, hop.addr, meta.dst_mask) {
			// The defer slot inherits the ingress reference.
			trace!("Deferring packet for {} via {}", ip.dst(), hop.addr);
			self.iface.borrow_mut().arp_send_query(hop.addr, VlanTag(0));
		} else {
			self.drop(meta, DropReason::Unreachable);
		}
	}

	/// Fan out through both the software egress queues and (when
	/// attached) the hardware offload mailbox.
	fn deliver_ports(&mut self, meta: &PluginPacket) -> usize {
		let mut count = 0;
		if let Some(offload) = self.offload.as_mut() {
			let core = self.core.borrow();
			count += offload.deliver(&core, meta, &*self.clock);
		}
		count += self.core.borrow_mut().deliver(meta);
		count
	}

	/// Queue one packet for the local interface.
	fn deliver_local(&mut self, meta: &PluginPacket) {
		let mut core = self.core.borrow_mut();
		core.pool_mut().acquire(meta.pkt);
		core.enqueue_egress(self.local_port, meta.pkt);
	}

	fn drop(&mut self, meta: &PluginPacket, code: DropReason) {
		self.core
			.borrow_mut()
			.drop_packet(meta.pkt, meta.src_port, code);
	}

	/// Build and emit a router-generated ICMP error about `meta`,
	/// back through the port it arrived on. Never responds to ICMP
	/// errors, fragments, or non-unicast traffic.
	fn icmp_error(&mut self, code: u16, arg: u32, meta: &PluginPacket) -> bool {
		let Some(ip) = meta.ip else {
			return false;
		};
		if !ip.src().is_unicast() || ip.dst().is_multicast() || ip.frg() != 0 {
			return false;
		}

		// First payload bytes of the offending packet, echoed in the
		// error body.
		let payload_off = meta.hdr_len + ip.hdr_len();
		let mut tail = [0u8; icmp::ICMP_ECHO_BYTES];
		let n = {
			let core = self.core.borrow();
			let mut rd = core.pool().reader_at(meta.pkt, payload_off);
			let n = rd.get_read_ready().min(icmp::ICMP_ECHO_BYTES);
			if rd.read_bytes(&mut tail[..n]).is_err() {
				return false;
			}
			n
		};
		if ip.proto() == PROTO_ICMP && (n == 0 || icmp::is_error_type(u16::from(tail[0]) << 8)) {
			return false;
		}

		let mut body = [0u8; 4 + 2 * crate::ip::IP_HDR_MAX_SHORTS + icmp::ICMP_ECHO_BYTES];
		let body_len = {
			let mut wr = ArrayWrite::new(&mut body);
			wr.write_u32(arg);
			ip.write_to(&mut wr);
			wr.write_bytes(&tail[..n]);
			if !wr.write_finalize() {
				return false;
			}
			wr.written()
		};
		let chk = checksum_bytes(&body[..body_len], checksum(&[code], 0));

		let (eth, iphdr) = {
			let mut iface = self.iface.borrow_mut();
			let eth = EthHeader::new(meta.hdr.src, iface.macaddr(), ETYPE_IPV4, meta.hdr.vtag);
			let iphdr = iface.next_header(PROTO_ICMP, ip.src(), 4 + body_len);
			(eth, iphdr)
		};

		let mut frame = [0u8; 128];
		let frame_len = {
			let mut wr = ArrayWrite::new(&mut frame);
			eth.write_to(&mut wr);
			iphdr.write_to(&mut wr);
			wr.write_u16(code);
			wr.write_u16(chk);
			wr.write_bytes(&body[..body_len]);
			if !wr.write_finalize() {
				return false;
			}
			wr.written()
		};

		// Send back out the ingress port: software queue, or the
		// offload mailbox for hardware-backed ports.
		let back_mask = idx2mask(meta.src_port);
		let hw_mask = self
			.offload
			.as_ref()
			.map_or(0, |offload| offload.port_mask_all());
		let mut core = self.core.borrow_mut();
		let Some(pkt) = core.build_packet(&frame[..frame_len]) else {
			return false;
		};
		if back_mask & hw_mask != 0 {
			let sent = match (self.offload.as_mut(), core.packet_meta(pkt, back_mask)) {
				(Some(offload), Some(err_meta)) => offload.deliver(&core, &err_meta, &*self.clock),
				_ => 0,
			};
			core.free_packet(pkt);
			sent > 0
		} else {
			core.enqueue_egress(meta.src_port, pkt);
			true
		}
	}
}

impl ArpListener for Router {
	/// A fresh MAC binding may release deferred packets.
	fn arp_event(&mut self, iface: &mut Interface, mac: MacAddr, ip: Addr) {
		let our_mac = iface.macaddr();
		for (pkt, dst_mask) in self.defer.take_matching(ip) {
			let meta = self.core.borrow().packet_meta(pkt, dst_mask);
			match meta {
				Some(mut meta) => {
					meta.hdr.src = our_mac;
					meta.hdr.dst = mac;
					meta.adjust();
					self.core.borrow_mut().persist_headers(&meta);
					meta.dirty = false;
					let sent = self.deliver_ports(&meta);
					trace!("Deferred packet released to {sent} port(s)");
				}
				None => debug!("Discarding undecodable deferred packet"),
			}
			self.core.borrow_mut().free_packet(pkt);
		}
	}
}

impl Timer for Router {
	/// Deferred-forwarding retry service; run every
	/// [`DEFER_POLL_MSEC`](crate::config::DEFER_POLL_MSEC)
	/// milliseconds.
	fn timer_event(&mut self) {
		let now = self.clock.now();
		let elapsed_ms = now.wrapping_sub(self.last_tick) / 1_000_000;
		if elapsed_ms == 0 {
			return;
		}
		self.last_tick += elapsed_ms * 1_000_000;

		let events = self.defer.tick(elapsed_ms.min(u64::from(u16::MAX)) as u16);
		for event in events {
			match event {
				DeferEvent::Query(ip) => {
					self.iface.borrow_mut().arp_send_query(ip, VlanTag(0));
				}
				DeferEvent::Expired { pkt, dst_mask } => {
					debug!("Deferred packet expired, sending host-unreachable");
					let meta = self.core.borrow().packet_meta(pkt, dst_mask);
					if let Some(meta) = meta {
						self.icmp_error(icmp::UNREACHABLE_HOST, 0, &meta);
					}
					self.core
						.borrow_mut()
						.drop_packet(pkt, usize::MAX, DropReason::Unreachable);
				}
			}
		}
	}
}
