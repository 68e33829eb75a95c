//! Bridge to a gateware-accelerated router core.
//!
//! When the router runs alongside a hardware forwarding fabric, bulk
//! traffic never reaches software; the fabric offloads only the
//! rare-but-complex cases (unresolved next hops, ICMP generation,
//! local delivery) through a small memory-mapped mailbox: one shared
//! frame buffer plus control registers for one in-flight packet in
//! each direction.
//!
//! Register access goes through the [`OffloadHw`] trait so that the
//! bridge logic is testable with a mock; [`MmioOffloadHw`] is the
//! raw-pointer implementation for real hardware.

use alloc::boxed::Box;

use super::RouterRules;
use crate::config::{MIN_FRAME_BYTES, OFFLOAD_BUFF_BYTES};
use crate::eth::MacAddr;
use crate::io::Readable;
use crate::ip::Addr;
use crate::switch::{PluginPacket, PortMask, SwitchCore, idx2mask};
use crate::util::Clock;

/// Word offsets of the offload register block (4 KiB total: the
/// 1600-byte frame buffer, control registers, and per-port config).
pub mod regs {
	pub const TXRX_BUFF: usize = 0; // 400 words
	pub const PKT_LOG: usize = 489;
	pub const VLAN_VID: usize = 490;
	pub const VLAN_MASK: usize = 491;
	pub const VLAN_RATE: usize = 492;
	pub const PKT_COUNT: usize = 493;
	pub const PORT_SHDN: usize = 494;
	pub const INFO: usize = 495;
	pub const ECN_RED: usize = 496;
	pub const NAT_CTRL: usize = 497;
	pub const GATEWAY: usize = 498;
	pub const TX_MASK: usize = 499;
	pub const TX_CTRL: usize = 500;
	pub const PORT_COUNT: usize = 502;
	pub const DATA_WIDTH: usize = 503;
	pub const CORE_CLOCK: usize = 504;
	pub const TABLE_SIZE: usize = 505;
	pub const NOIP_DATA: usize = 506;
	pub const NOIP_CTRL: usize = 507;
	pub const CIDR_DATA: usize = 508;
	pub const CIDR_CTRL: usize = 509;
	pub const RX_IRQ: usize = 510;
	pub const RX_CTRL: usize = 511;
	pub const PORT_CFG: usize = 512; // 512 words
}

/// Access to the offload mailbox hardware.
pub trait OffloadHw {
	/// Rx status: packet length in the low 16 bits, source hardware
	/// port in bits 16..24. Zero length means no packet pending.
	fn rx_status(&mut self) -> u32;

	/// Acknowledge the pending Rx packet, freeing the buffer.
	fn rx_clear(&mut self);

	/// Is a transmit still in flight?
	fn tx_busy(&mut self) -> bool;

	/// Start transmitting `len` buffered bytes to the hardware ports
	/// in `mask`.
	fn tx_start(&mut self, mask: u32, len: u32);

	/// Copy `buf.len()` bytes out of the shared frame buffer.
	fn frame_read(&mut self, buf: &mut [u8]);

	/// Copy `data` into the shared frame buffer.
	fn frame_write(&mut self, data: &[u8]);

	/// Load the gateway-configuration register (three writes: MAC
	/// high word + policy, MAC low word, IP address).
	fn set_gateway(&mut self, w0: u32, w1: u32, w2: u32);

	/// Mask of hardware ports currently shut down.
	fn port_shdn(&mut self) -> u32;
}

/// The software half of the offload bridge.
pub struct Offload {
	hw: Box<dyn OffloadHw>,
	/// Software port index of hardware port zero.
	port_index: usize,
	hw_ports: usize,
	zero_pad: bool,
	/// Tx packets dropped because the mailbox stayed busy.
	busy_drops: u32,
}

impl Offload {
	/// Wrap the hardware mailbox and reserve `hw_ports` port indices
	/// on the switch core. Register all software ports first.
	pub fn new(hw: Box<dyn OffloadHw>, core: &mut SwitchCore, hw_ports: usize) -> Self {
		let port_index = core.add_virtual_ports(hw_ports);
		Self {
			hw,
			port_index,
			hw_ports,
			zero_pad: true,
			busy_drops: 0,
		}
	}

	/// Enable or disable zero-padding of runt frames.
	pub fn set_zero_pad(&mut self, enable: bool) {
		self.zero_pad = enable;
	}

	/// Software port index for a hardware port.
	pub fn port_index(&self, hw_idx: usize) -> usize {
		self.port_index + hw_idx
	}

	/// Mask covering every hardware-backed port.
	pub fn port_mask_all(&self) -> PortMask {
		let mut mask = 0;
		for n in 0..self.hw_ports {
			mask |= idx2mask(self.port_index + n);
		}
		mask
	}

	/// Tx packets dropped on a busy mailbox.
	pub fn busy_drops(&self) -> u32 {
		self.busy_drops
	}

	/// Push the router's addresses and policy into the gateware.
	pub fn reconfigure(&mut self, mac: MacAddr, ip: Addr, rules: RouterRules) {
		let mac64 = mac.to_u64();
		self.hw.set_gateway(
			((mac64 >> 32) as u32) | rules.bits(),
			mac64 as u32,
			ip.0,
		);
	}

	/// Hardware ports currently shut down, as a software port mask.
	pub fn link_shdn(&mut self) -> PortMask {
		(self.hw.port_shdn() as PortMask) << self.port_index
	}

	/// Deliver one packet to the hardware ports selected by its
	/// destination mask. Returns the number of ports reached.
	pub(crate) fn deliver(
		&mut self,
		core: &SwitchCore,
		meta: &PluginPacket,
		clock: &dyn Clock,
	) -> usize {
		let len = meta.length;
		if len > OFFLOAD_BUFF_BYTES {
			return 0; // No jumbo frames through the mailbox
		}
		let hw_mask = ((meta.dst_mask & self.port_mask_all()) >> self.port_index) as u32;
		if hw_mask == 0 {
			return 0;
		}

		// If a transmit is in flight, give the fabric a few
		// microseconds to drain before giving up.
		if self.hw.tx_busy() {
			let t0 = clock.now();
			while self.hw.tx_busy() && clock.now().wrapping_sub(t0) < 10_000 {}
			if self.hw.tx_busy() {
				self.busy_drops += 1;
				debug!("Offload Tx busy, dropping packet");
				return 0;
			}
		}

		let mut buf = [0u8; OFFLOAD_BUFF_BYTES];
		let mut rd = core.pool().reader(meta.pkt);
		if rd.read_bytes(&mut buf[..len]).is_err() {
			return 0;
		}
		let mut padded = len;
		if self.zero_pad && padded < MIN_FRAME_BYTES {
			// Runt frames are padded to the Ethernet minimum.
			padded = MIN_FRAME_BYTES;
		}
		self.hw.frame_write(&buf[..padded]);
		self.hw.tx_start(hw_mask, padded as u32);
		hw_mask.count_ones() as usize
	}

	/// Move one pending Rx packet (if any) from the mailbox into the
	/// switch's ingress queue. Returns true if a packet moved.
	pub fn poll_rx(&mut self, core: &mut SwitchCore) -> bool {
		let status = self.hw.rx_status();
		let len = (status & 0xFFFF) as usize;
		let source = ((status >> 16) & 0xFF) as usize;
		if len == 0 {
			return false;
		}
		let mut buf = [0u8; OFFLOAD_BUFF_BYTES];
		let ok = len <= OFFLOAD_BUFF_BYTES;
		if ok {
			self.hw.frame_read(&mut buf[..len]);
			core.inject_frame(self.port_index + source, &buf[..len]);
		} else {
			warn!("Offload Rx length {len} exceeds buffer");
		}
		self.hw.rx_clear();
		ok
	}
}

/// [`OffloadHw`] over a memory-mapped register block.
pub struct MmioOffloadHw {
	base: *mut u32,
}

impl MmioOffloadHw {
	/// # Safety
	///
	/// `base` must point to a 4 KiB offload register block, mapped
	/// uncached and not aliased by safe code.
	pub unsafe fn new(base: *mut u32) -> Self {
		Self { base }
	}

	fn read_reg(&self, reg: usize) -> u32 {
		unsafe { self.base.add(reg).read_volatile() }
	}

	fn write_reg(&mut self, reg: usize, value: u32) {
		unsafe { self.base.add(reg).write_volatile(value) }
	}
}

impl OffloadHw for MmioOffloadHw {
	fn rx_status(&mut self) -> u32 {
		self.read_reg(regs::RX_CTRL)
	}

	fn rx_clear(&mut self) {
		self.write_reg(regs::RX_CTRL, 0);
	}

	fn tx_busy(&mut self) -> bool {
		self.read_reg(regs::TX_CTRL) != 0
	}

	fn tx_start(&mut self, mask: u32, len: u32) {
		self.write_reg(regs::TX_MASK, mask);
		self.write_reg(regs::TX_CTRL, len);
	}

	fn frame_read(&mut self, buf: &mut [u8]) {
		let bytes = self.base.cast::<u8>();
		for (idx, b) in buf.iter_mut().enumerate() {
			*b = unsafe { bytes.add(idx).read_volatile() };
		}
	}

	fn frame_write(&mut self, data: &[u8]) {
		let bytes = self.base.cast::<u8>();
		for (idx, &b) in data.iter().enumerate() {
			unsafe { bytes.add(idx).write_volatile(b) };
		}
	}

	fn set_gateway(&mut self, w0: u32, w1: u32, w2: u32) {
		self.write_reg(regs::GATEWAY, w0);
		self.write_reg(regs::GATEWAY, w1);
		self.write_reg(regs::GATEWAY, w2);
	}

	fn port_shdn(&mut self) -> u32 {
		self.read_reg(regs::PORT_SHDN)
	}
}

#[cfg(test)]
pub(crate) mod testing {
	use alloc::rc::Rc;
	use alloc::vec::Vec;
	use core::cell::RefCell;

	use super::*;

	/// Scriptable mailbox state shared between a test and the bridge.
	pub struct MockState {
		pub rx: Option<(usize, Vec<u8>)>,
		pub tx: Vec<(u32, Vec<u8>)>,
		pub busy_polls: u32,
		pub shdn: u32,
		pub gateway: Vec<(u32, u32, u32)>,
		buffer: Vec<u8>,
	}

	/// [`OffloadHw`] backed by shared [`MockState`].
	pub struct MockHw(pub Rc<RefCell<MockState>>);

	impl MockHw {
		pub fn new() -> (Self, Rc<RefCell<MockState>>) {
			let state = Rc::new(RefCell::new(MockState {
				rx: None,
				tx: Vec::new(),
				busy_polls: 0,
				shdn: 0,
				gateway: Vec::new(),
				buffer: vec![0u8; OFFLOAD_BUFF_BYTES],
			}));
			(Self(state.clone()), state)
		}
	}

	impl OffloadHw for MockHw {
		fn rx_status(&mut self) -> u32 {
			match &self.0.borrow().rx {
				Some((source, data)) => ((*source as u32) << 16) | data.len() as u32,
				None => 0,
			}
		}

		fn rx_clear(&mut self) {
			self.0.borrow_mut().rx = None;
		}

		fn tx_busy(&mut self) -> bool {
			let mut state = self.0.borrow_mut();
			if state.busy_polls > 0 {
				state.busy_polls -= 1;
				true
			} else {
				false
			}
		}

		fn tx_start(&mut self, mask: u32, len: u32) {
			let mut state = self.0.borrow_mut();
			let data = state.buffer[..len as usize].to_vec();
			state.tx.push((mask, data));
		}

		fn frame_read(&mut self, buf: &mut [u8]) {
			if let Some((_, data)) = &self.0.borrow().rx {
				buf.copy_from_slice(&data[..buf.len()]);
			}
		}

		fn frame_write(&mut self, data: &[u8]) {
			self.0.borrow_mut().buffer[..data.len()].copy_from_slice(data);
		}

		fn set_gateway(&mut self, w0: u32, w1: u32, w2: u32) {
			self.0.borrow_mut().gateway.push((w0, w1, w2));
		}

		fn port_shdn(&mut self) -> u32 {
			self.0.borrow().shdn
		}
	}
}
