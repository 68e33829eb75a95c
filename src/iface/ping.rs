//! Repeating ICMP-ping and ARP-ping utility.

use alloc::rc::Rc;
use core::cell::RefCell;

use super::arp::ArpListener;
use super::icmp::PingListener;
use super::{Address, Interface};
use crate::eth::{MacAddr, VlanTag};
use crate::ip::{Addr, PROTO_ICMP};
use crate::util::Timer;

/// Unlimited repeat count for [`Ping::ping`] / [`Ping::arping`].
pub const PING_FOREVER: u32 = u32::MAX;

/// Round-trip connectivity tester.
///
/// Resolves a destination, then sends one ICMP echo request (or raw
/// ARP query) per timer tick, logging each reply with its round-trip
/// time. Register the returned object with a
/// [`Timekeeper`](crate::util::Timekeeper) at a one-second period.
pub struct Ping {
	iface: Rc<RefCell<Interface>>,
	addr: Rc<RefCell<Address>>,
	arp_remct: u32,
	icmp_remct: u32,
	reply_rcvd: bool,
}

impl Ping {
	/// Create a ping utility and register its callbacks on `iface`.
	pub fn new(iface: Rc<RefCell<Interface>>) -> Rc<RefCell<Self>> {
		let addr = Rc::new(RefCell::new(Address::new(PROTO_ICMP)));
		let ping = Rc::new(RefCell::new(Self {
			iface: iface.clone(),
			addr: addr.clone(),
			arp_remct: 0,
			icmp_remct: 0,
			reply_rcvd: false,
		}));
		let mut i = iface.borrow_mut();
		i.arp_add_listener(addr);
		i.arp_add_listener(ping.clone());
		i.icmp_add_ping_listener(ping.clone());
		ping
	}

	/// Start an ICMP echo sequence of `qty` requests.
	pub fn ping(&mut self, dstaddr: Addr, qty: u32) {
		self.stop();
		if qty > 0 {
			self.arp_remct = 2; // Extra address-resolution attempts
			self.icmp_remct = qty;
			self.addr
				.borrow_mut()
				.connect(&mut self.iface.borrow_mut(), dstaddr, VlanTag(0));
		}
	}

	/// Start an ARP-query sequence of `qty` probes.
	pub fn arping(&mut self, dstaddr: Addr, qty: u32) {
		self.stop();
		if qty > 0 {
			self.arp_remct = qty;
			self.icmp_remct = 0;
			let mut iface = self.iface.borrow_mut();
			self.addr
				.borrow_mut()
				.connect_manual(dstaddr, crate::eth::MACADDR_NONE, VlanTag(0));
			self.reply_rcvd = false;
			iface.arp_send_query(dstaddr, VlanTag(0));
			self.arp_remct = self.arp_remct.saturating_sub(1);
		}
	}

	/// Cancel any sequence in progress.
	pub fn stop(&mut self) {
		self.arp_remct = 0;
		self.icmp_remct = 0;
		self.reply_rcvd = false;
	}

	fn send_ping(&mut self) {
		let mut iface = self.iface.borrow_mut();
		if self.addr.borrow().ready() {
			self.reply_rcvd = false;
			iface.icmp_send_ping(&mut self.addr.borrow_mut());
			self.arp_remct = 0;
			if self.icmp_remct != PING_FOREVER {
				self.icmp_remct -= 1;
			}
		} else if self.arp_remct > 0 {
			self.arp_remct -= 1;
			self.addr.borrow_mut().retry(&mut iface);
		} else {
			info!("Ping: gateway unreachable: {}", self.addr.borrow().gateway());
			drop(iface);
			self.stop();
		}
	}

	fn send_arping(&mut self) {
		let mut iface = self.iface.borrow_mut();
		self.reply_rcvd = false;
		iface.arp_send_query(self.addr.borrow().dstaddr(), VlanTag(0));
		if self.arp_remct != PING_FOREVER {
			self.arp_remct -= 1;
		}
	}
}

impl Timer for Ping {
	fn timer_event(&mut self) {
		let resolving = self.icmp_remct > 0 && self.arp_remct > 0;
		if !resolving && !self.reply_rcvd && (self.icmp_remct > 0 || self.arp_remct > 0) {
			info!("Ping: request timed out");
		}
		if self.icmp_remct > 0 {
			self.send_ping();
		} else if self.arp_remct > 0 {
			self.send_arping();
		}
	}
}

impl ArpListener for Ping {
	fn arp_event(&mut self, _iface: &mut Interface, _mac: MacAddr, ip: Addr) {
		if ip == self.addr.borrow().dstaddr() && self.icmp_remct == 0 && self.arp_remct > 0 {
			self.reply_rcvd = true;
			info!("Ping: ARP reply from {ip}");
		}
	}
}

impl PingListener for Ping {
	fn ping_event(&mut self, _iface: &mut Interface, from: Addr, elapsed_usec: u32) {
		if from == self.addr.borrow().dstaddr() {
			self.reply_rcvd = true;
			info!("Ping: reply from {from}, elapsed usec {elapsed_usec}");
		}
	}
}
