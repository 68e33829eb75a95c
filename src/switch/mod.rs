//! Software-defined Ethernet switch core.
//!
//! The core owns a shared packet pool and a catalogue of up to 32
//! ports. Ingress adapters write whole frames into the pool; the
//! owner drains the ingress queue (via [`SwitchCore::poll`] for
//! plain switching, or a router's own delivery loop), running every
//! packet through the registered plugin chain. Accepted packets fan
//! out by reference onto per-port egress queues, where each port's
//! reader streams the bytes out, rewriting the VLAN tag region when
//! an egress plugin changed it.

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use smallvec::SmallVec;

use crate::config::{MAX_PORTS, MBUF_CHUNK_BYTES};
use crate::eth::{ETH_HDR_TAGGED_BYTES, ETYPE_IPV4, EthHeader, VlanTag};
use crate::io::{ArrayWrite, MultiBuffer, PacketHandle, Writeable};
use crate::ip::IpHeader;

mod cache;
mod port;
mod vlan;

pub use self::cache::SwitchCache;
pub use self::port::SwitchPort;
pub use self::vlan::{
	RateAction, SwitchVlan, VLAN_RATE_8KBPS, VLAN_RATE_UNLIMITED, VlanEgress, VlanRate,
};

/// Bitmap naming a set of switch ports (bit N = port index N).
pub type PortMask = u32;

pub const PMASK_NONE: PortMask = 0;
pub const PMASK_ALL: PortMask = PortMask::MAX;

/// Single-bit mask for a port index.
pub const fn idx2mask(idx: usize) -> PortMask {
	1 << idx
}

/// Reason a packet was dropped inside the pipeline.
#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DropReason {
	/// Not dropped.
	None = 0,
	/// Malformed or truncated header.
	PktError,
	/// VLAN membership or tag-policy violation.
	Vlan,
	/// VLAN rate limit exceeded.
	Vrate,
	/// Blocked by router policy rules.
	Policy,
	/// No matching route.
	NoRoute,
	/// Next-hop resolution failed.
	Unreachable,
	/// IPv4 time-to-live expired.
	Ttl,
	/// Buffer or queue exhaustion.
	Overflow,
	/// Hardware offload busy.
	Busy,
	/// Destination port set was empty.
	NoDest,
}

impl DropReason {
	pub(crate) const COUNT: usize = 11;
}

/// Per-port traffic and error counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct PortCounters {
	pub rx_frames: u32,
	pub rx_bytes: u64,
	pub tx_frames: u32,
	pub tx_bytes: u64,
	pub errct_mac: u32,
	pub errct_ovr_tx: u32,
	pub errct_ovr_rx: u32,
	pub errct_pkt: u32,
	pub errct_ptp_tx: u32,
	pub errct_ptp_rx: u32,
}

/// How a port treats 802.1Q tags.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TagPolicy {
	/// Accept tagged and untagged frames; egress untagged.
	#[default]
	AdmitAll = 0,
	/// Accept only untagged frames; egress untagged.
	Restrict = 1,
	/// Accept only untagged frames; egress priority tags (VID 0).
	Priority = 2,
	/// Accept only tagged frames; egress fully tagged.
	Mandatory = 3,
}

/// A port's VLAN configuration: tag policy plus default tag fields.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct VtagPolicy {
	pub policy: TagPolicy,
	pub vtag: VlanTag,
}

impl VtagPolicy {
	pub const fn new(policy: TagPolicy, vtag: VlanTag) -> Self {
		Self { policy, vtag }
	}

	/// Pack into the metadata word carried with each packet.
	pub fn to_word(self) -> u32 {
		(u32::from(u8::from(self.policy)) << 16) | u32::from(self.vtag.0)
	}

	pub fn from_word(word: u32) -> Self {
		Self {
			policy: TagPolicy::try_from((word >> 16) as u8).unwrap_or_default(),
			vtag: VlanTag(word as u16),
		}
	}
}

/// Per-packet scratch record passed along the plugin chain.
pub struct PluginPacket {
	/// Handle of the underlying pooled packet.
	pub pkt: PacketHandle,
	/// Parsed Ethernet header; plugins may rewrite it.
	pub hdr: EthHeader,
	/// Parsed IPv4 header, present iff the EtherType is IPv4.
	pub ip: Option<IpHeader>,
	/// On-wire length of the original Ethernet header.
	pub hdr_len: usize,
	/// Total packet length in bytes.
	pub length: usize,
	/// Egress priority (0..7), from PCP or the port default.
	pub priority: u8,
	/// Ingress port index.
	pub src_port: usize,
	/// Ingress port's VLAN configuration snapshot.
	pub src_vcfg: VtagPolicy,
	/// Candidate egress ports; plugins only narrow this.
	pub dst_mask: PortMask,
	/// Set to drop the packet and stop the chain.
	pub drop_code: DropReason,
	/// Header fields changed; egress must rewrite them.
	pub dirty: bool,
}

impl PluginPacket {
	/// Single-bit mask of the ingress port.
	pub fn src_mask(&self) -> PortMask {
		idx2mask(self.src_port)
	}

	/// Mark this packet for dropping.
	pub fn drop(&mut self, code: DropReason) {
		self.drop_code = code;
	}

	/// Flag a header modification for the egress rewrite stage.
	pub fn adjust(&mut self) {
		self.dirty = true;
	}
}

/// A packet-inspection stage run once per ingress packet.
pub trait PluginCore {
	fn query(&mut self, pkt: &mut PluginPacket);
}

/// A per-port egress stage. May rewrite `pkt.hdr` (marking the
/// packet dirty) but must not change `dst_mask`.
pub trait PluginPort {
	fn egress(&mut self, pkt: &mut PluginPacket, port_cfg: &VtagPolicy);
}

struct EgressState {
	pkt: PacketHandle,
	/// Rewritten Ethernet header bytes for this port.
	prefix: [u8; ETH_HDR_TAGGED_BYTES],
	prefix_len: usize,
	/// Bytes of the original packet skipped (its header).
	payload_skip: usize,
	total: usize,
	pos: usize,
	chunk: u16,
	chunk_off: usize,
}

struct PortState {
	vcfg: VtagPolicy,
	link_up: bool,
	enabled: bool,
	stats: PortCounters,
	wr_pkt: Option<PacketHandle>,
	wr_fail: bool,
	egress: VecDeque<PacketHandle>,
	rd: Option<EgressState>,
	egress_plugin: Option<Rc<RefCell<dyn PluginPort>>>,
}

impl PortState {
	fn new() -> Self {
		Self {
			vcfg: VtagPolicy::default(),
			link_up: true,
			enabled: true,
			stats: PortCounters::default(),
			wr_pkt: None,
			wr_fail: false,
			egress: VecDeque::new(),
			rd: None,
			egress_plugin: None,
		}
	}
}

/// The switch engine: packet pool, port catalogue, plugin chain.
pub struct SwitchCore {
	pool: MultiBuffer,
	ports: Vec<PortState>,
	/// Hardware-backed ports: present in every port mask but with no
	/// software egress queue (an offload bridge moves their frames).
	virtual_base: usize,
	virtual_count: usize,
	plugins: SmallVec<[Rc<RefCell<dyn PluginCore>>; 4]>,
	drops: [u32; DropReason::COUNT],
}

impl SwitchCore {
	/// Create a switch with `buff_bytes` of pooled packet storage
	/// and up to `max_pkts` simultaneously live packets.
	pub fn new(buff_bytes: usize, max_pkts: usize) -> Self {
		Self {
			pool: MultiBuffer::new(buff_bytes, max_pkts),
			ports: Vec::new(),
			virtual_base: 0,
			virtual_count: 0,
			plugins: SmallVec::new(),
			drops: [0; DropReason::COUNT],
		}
	}

	/// Register the next port. Ports are added in a fixed order at
	/// startup and keep their index for the life of the switch.
	pub fn add_port(&mut self) -> usize {
		assert!(self.ports.len() < MAX_PORTS);
		// Hardware-backed ports always occupy the top of the index
		// space; software ports must be registered first.
		assert!(self.virtual_count == 0);
		self.ports.push(PortState::new());
		self.ports.len() - 1
	}

	/// Reserve `count` consecutive port indices for hardware-backed
	/// ports. They participate in every port mask, but fan-out to
	/// them is the offload bridge's job. Returns the first index.
	pub fn add_virtual_ports(&mut self, count: usize) -> usize {
		assert!(self.ports.len() + self.virtual_count + count <= MAX_PORTS);
		if self.virtual_count == 0 {
			self.virtual_base = self.ports.len();
		}
		let base = self.virtual_base + self.virtual_count;
		self.virtual_count += count;
		base
	}

	pub fn port_count(&self) -> usize {
		self.ports.len() + self.virtual_count
	}

	/// Register a packet-inspection plugin. Plugins run in
	/// registration order for every ingress packet.
	pub fn add_plugin(&mut self, plugin: Rc<RefCell<dyn PluginCore>>) {
		self.plugins.push(plugin);
	}

	/// Attach an egress-rewrite plugin to one port.
	pub fn attach_egress(&mut self, port: usize, plugin: Rc<RefCell<dyn PluginPort>>) {
		self.ports[port].egress_plugin = Some(plugin);
	}

	pub fn set_link(&mut self, port: usize, up: bool) {
		self.ports[port].link_up = up;
	}

	/// Administratively enable the ports in `mask`.
	pub fn port_enable(&mut self, mask: PortMask) {
		for (idx, port) in self.ports.iter_mut().enumerate() {
			if mask & idx2mask(idx) != 0 {
				port.enabled = true;
			}
		}
	}

	/// Administratively disable (shut down) the ports in `mask`.
	pub fn port_disable(&mut self, mask: PortMask) {
		for (idx, port) in self.ports.iter_mut().enumerate() {
			if mask & idx2mask(idx) != 0 {
				port.enabled = false;
			}
		}
	}

	/// Ports that are both link-up and enabled.
	pub fn link_up_mask(&self) -> PortMask {
		let mut mask = 0;
		for (idx, port) in self.ports.iter().enumerate() {
			if port.link_up && port.enabled {
				mask |= idx2mask(idx);
			}
		}
		for n in 0..self.virtual_count {
			mask |= idx2mask(self.virtual_base + n);
		}
		mask
	}

	pub fn vlan_config(&self, port: usize) -> VtagPolicy {
		self.ports[port].vcfg
	}

	pub fn set_vlan_config(&mut self, port: usize, cfg: VtagPolicy) {
		self.ports[port].vcfg = cfg;
	}

	pub fn counters(&self, port: usize) -> PortCounters {
		self.ports[port].stats
	}

	/// Packets dropped for the given reason since startup.
	pub fn drop_count(&self, reason: DropReason) -> u32 {
		self.drops[usize::from(u8::from(reason))]
	}

	pub(crate) fn pool(&self) -> &MultiBuffer {
		&self.pool
	}

	pub(crate) fn pool_mut(&mut self) -> &mut MultiBuffer {
		&mut self.pool
	}

	// ---- Ingress (per-port writer) -------------------------------

	pub(crate) fn port_write_space(&self, port: usize) -> usize {
		if self.ports[port].wr_fail {
			0
		} else {
			self.pool.write_space(self.ports[port].wr_pkt)
		}
	}

	pub(crate) fn port_write_bytes(&mut self, port: usize, src: &[u8]) {
		if self.ports[port].wr_fail {
			return;
		}
		let pkt = match self.ports[port].wr_pkt {
			Some(pkt) => pkt,
			None => match self.pool.alloc() {
				Some(pkt) => {
					self.ports[port].wr_pkt = Some(pkt);
					pkt
				}
				None => {
					self.ports[port].wr_fail = true;
					return;
				}
			},
		};
		if !self.pool.append(pkt, src) {
			self.ports[port].wr_fail = true;
		}
	}

	pub(crate) fn port_write_fail(&mut self, port: usize) {
		self.ports[port].wr_fail = true;
	}

	pub(crate) fn port_write_abort(&mut self, port: usize) {
		if let Some(pkt) = self.ports[port].wr_pkt.take() {
			self.pool.release(pkt);
		}
		self.ports[port].wr_fail = false;
	}

	/// Commit the frame being written on `port` into the ingress
	/// queue, stamping its metadata. Returns false (and counts an
	/// overflow) if any part of the frame failed to buffer.
	pub(crate) fn port_write_finalize(&mut self, port: usize) -> bool {
		if self.ports[port].wr_fail {
			self.ports[port].stats.errct_ovr_rx += 1;
			self.port_write_abort(port);
			return false;
		}
		let Some(pkt) = self.ports[port].wr_pkt.take() else {
			return true; // Nothing staged
		};
		if self.pool.len(pkt) == 0 {
			self.pool.release(pkt);
			return true;
		}
		let vcfg = self.ports[port].vcfg;
		self.pool.set_user(pkt, 0, port as u32);
		self.pool.set_user(pkt, 1, vcfg.to_word());
		self.ports[port].stats.rx_frames += 1;
		self.ports[port].stats.rx_bytes += self.pool.len(pkt) as u64;
		self.pool.commit(pkt);
		true
	}

	/// Inject a complete frame as if received on `src_port`. Used by
	/// hardware bridges and self-generated traffic.
	pub fn inject_frame(&mut self, src_port: usize, bytes: &[u8]) -> bool {
		let Some(pkt) = self.build_packet(bytes) else {
			if src_port < self.ports.len() {
				self.ports[src_port].stats.errct_ovr_rx += 1;
			}
			return false;
		};
		let vcfg = match self.ports.get(src_port) {
			Some(port) => port.vcfg,
			None => VtagPolicy::default(), // Hardware-backed source
		};
		self.pool.set_user(pkt, 0, src_port as u32);
		self.pool.set_user(pkt, 1, vcfg.to_word());
		if let Some(port) = self.ports.get_mut(src_port) {
			port.stats.rx_frames += 1;
			port.stats.rx_bytes += bytes.len() as u64;
		}
		self.pool.commit(pkt);
		true
	}

	/// Allocate a pooled packet holding `bytes`, owned by the caller
	/// (not queued anywhere).
	pub fn build_packet(&mut self, bytes: &[u8]) -> Option<PacketHandle> {
		let pkt = self.pool.alloc()?;
		if self.pool.append(pkt, bytes) {
			Some(pkt)
		} else {
			self.pool.release(pkt);
			None
		}
	}

	/// Release one reference to a pooled packet.
	pub fn free_packet(&mut self, pkt: PacketHandle) {
		self.pool.release(pkt);
	}

	// ---- Pipeline ------------------------------------------------

	/// Pop the next ingress packet, parse it, and run the plugin
	/// chain. Dropped packets are counted and recycled internally;
	/// the first survivor is returned for delivery. The caller owns
	/// the packet's ingress reference and must release it after
	/// delivery.
	pub fn ingest_next(&mut self) -> Option<PluginPacket> {
		while let Some(pkt) = self.pool.pop_ingress() {
			let src_port = self.pool.user(pkt, 0) as usize;
			let (hdr, ip, hdr_len) = match self.parse_headers(pkt) {
				Some(parsed) => parsed,
				None => {
					self.drop_packet(pkt, src_port, DropReason::PktError);
					continue;
				}
			};
			let mut meta = PluginPacket {
				pkt,
				hdr,
				ip,
				hdr_len,
				length: self.pool.len(pkt),
				priority: 0,
				src_port,
				src_vcfg: VtagPolicy::from_word(self.pool.user(pkt, 1)),
				dst_mask: self.link_up_mask() & !idx2mask(src_port),
				drop_code: DropReason::None,
				dirty: false,
			};
			let plugins = self.plugins.clone();
			for plugin in plugins {
				plugin.borrow_mut().query(&mut meta);
				if meta.drop_code != DropReason::None {
					break;
				}
			}
			if meta.drop_code != DropReason::None {
				let code = meta.drop_code;
				self.drop_packet(pkt, src_port, code);
				continue;
			}
			self.pool.set_priority(pkt, meta.priority);
			return Some(meta);
		}
		None
	}

	/// Fan the packet out to every port in its destination mask.
	/// Returns the number of egress queues reached.
	pub fn deliver(&mut self, meta: &PluginPacket) -> usize {
		if meta.dirty {
			self.persist_headers(meta);
		}
		let mask = meta.dst_mask & self.link_up_mask() & !meta.src_mask();
		let mut count = 0;
		for idx in 0..self.ports.len() {
			if mask & idx2mask(idx) != 0 {
				self.pool.acquire(meta.pkt);
				self.ports[idx].egress.push_back(meta.pkt);
				count += 1;
			}
		}
		count
	}

	/// Enqueue a caller-owned packet reference directly onto one
	/// port's egress queue (bypassing the plugin pipeline).
	pub fn enqueue_egress(&mut self, port: usize, pkt: PacketHandle) {
		self.ports[port].egress.push_back(pkt);
	}

	/// Process every pending ingress packet with plain L2 delivery.
	pub fn poll(&mut self) {
		while let Some(meta) = self.ingest_next() {
			if self.deliver(&meta) == 0 {
				self.drops[usize::from(u8::from(DropReason::NoDest))] += 1;
			}
			self.pool.release(meta.pkt);
		}
	}

	/// Write modified headers back into the packet bytes so every
	/// egress port sees them.
	pub(crate) fn persist_headers(&mut self, meta: &PluginPacket) {
		let mut buf = [0u8; ETH_HDR_TAGGED_BYTES];
		let mut wr = ArrayWrite::new(&mut buf);
		meta.hdr.write_to(&mut wr);
		if wr.write_finalize() && wr.written() == meta.hdr_len {
			self.pool.overwrite(meta.pkt, 0, &buf[..meta.hdr_len]);
		} else {
			// Length-changing rewrites happen per-port at egress.
			debug!("Skipping in-place rewrite of resized header");
		}
		if let Some(ip) = &meta.ip {
			let mut buf = [0u8; 2 * crate::ip::IP_HDR_MAX_SHORTS];
			let mut wr = ArrayWrite::new(&mut buf);
			ip.write_to(&mut wr);
			if wr.write_finalize() {
				let len = wr.written();
				self.pool.overwrite(meta.pkt, meta.hdr_len, &buf[..len]);
			}
		}
	}

	/// Reconstitute a pipeline record from a stored packet (used by
	/// deferred forwarding). The caller supplies the destination mask.
	pub(crate) fn packet_meta(&self, pkt: PacketHandle, dst_mask: PortMask) -> Option<PluginPacket> {
		let (hdr, ip, hdr_len) = self.parse_headers(pkt)?;
		Some(PluginPacket {
			pkt,
			hdr,
			ip,
			hdr_len,
			length: self.pool.len(pkt),
			priority: self.pool.priority(pkt),
			src_port: self.pool.user(pkt, 0) as usize,
			src_vcfg: VtagPolicy::from_word(self.pool.user(pkt, 1)),
			dst_mask,
			drop_code: DropReason::None,
			dirty: false,
		})
	}

	fn parse_headers(&self, pkt: PacketHandle) -> Option<(EthHeader, Option<IpHeader>, usize)> {
		let mut rd = self.pool.reader(pkt);
		let hdr = EthHeader::read_from(&mut rd).ok()?;
		let hdr_len = hdr.wire_len();
		let ip = if hdr.etype == ETYPE_IPV4 {
			Some(IpHeader::read_from(&mut rd).ok()?)
		} else {
			None
		};
		Some((hdr, ip, hdr_len))
	}

	/// Count a drop decided outside the plugin chain (router policy,
	/// defer-pool exhaustion) and release the packet reference.
	pub(crate) fn drop_packet(&mut self, pkt: PacketHandle, src_port: usize, code: DropReason) {
		trace!("Dropping packet from port {src_port}: {code:?}");
		self.drops[usize::from(u8::from(code))] += 1;
		if code == DropReason::PktError && src_port < self.ports.len() {
			self.ports[src_port].stats.errct_pkt += 1;
		}
		self.pool.release(pkt);
	}

	// ---- Egress (per-port reader) --------------------------------

	/// Packets waiting on a port's egress queue.
	pub fn egress_pending(&self, port: usize) -> usize {
		self.ports[port].egress.len() + usize::from(self.ports[port].rd.is_some())
	}

	pub(crate) fn port_read_ready(&mut self, port: usize) -> usize {
		self.egress_load(port);
		match &self.ports[port].rd {
			Some(st) => st.total - st.pos,
			None => 0,
		}
	}

	pub(crate) fn port_read_next(&mut self, port: usize) -> u8 {
		let pool = &self.pool;
		let Some(st) = self.ports[port].rd.as_mut() else {
			debug_assert!(false, "read past end of egress stream");
			return 0;
		};
		let byte = if st.pos < st.prefix_len {
			st.prefix[st.pos]
		} else {
			let byte = pool.chunk_byte(st.chunk, st.chunk_off);
			st.chunk_off += 1;
			if st.chunk_off == MBUF_CHUNK_BYTES {
				st.chunk = pool.next_chunk(st.chunk);
				st.chunk_off = 0;
			}
			byte
		};
		st.pos += 1;
		byte
	}

	pub(crate) fn port_read_finalize(&mut self, port: usize) {
		if let Some(st) = self.ports[port].rd.take() {
			self.ports[port].egress.pop_front();
			self.ports[port].stats.tx_frames += 1;
			self.ports[port].stats.tx_bytes += st.total as u64;
			self.pool.release(st.pkt);
		}
	}

	/// Stage the next queued packet on `port`, applying the egress
	/// plugin and precomputing the (possibly rewritten) header.
	fn egress_load(&mut self, port: usize) {
		while self.ports[port].rd.is_none() {
			let Some(&pkt) = self.ports[port].egress.front() else {
				return;
			};
			let Some((hdr, _, hdr_len)) = self.parse_headers(pkt) else {
				// Cannot happen for packets that passed ingress, but
				// direct egress injection is not validated.
				self.ports[port].egress.pop_front();
				self.ports[port].stats.errct_pkt += 1;
				self.pool.release(pkt);
				continue;
			};
			let mut meta = PluginPacket {
				pkt,
				hdr,
				ip: None,
				hdr_len,
				length: self.pool.len(pkt),
				priority: self.pool.priority(pkt),
				src_port: self.pool.user(pkt, 0) as usize,
				src_vcfg: VtagPolicy::from_word(self.pool.user(pkt, 1)),
				dst_mask: idx2mask(port),
				drop_code: DropReason::None,
				dirty: false,
			};
			if let Some(plugin) = self.ports[port].egress_plugin.clone() {
				let cfg = self.ports[port].vcfg;
				plugin.borrow_mut().egress(&mut meta, &cfg);
			}

			let mut prefix = [0u8; ETH_HDR_TAGGED_BYTES];
			let mut wr = ArrayWrite::new(&mut prefix);
			meta.hdr.write_to(&mut wr);
			let ok = wr.write_finalize();
			debug_assert!(ok);
			let prefix_len = wr.written();

			// Position the payload cursor just past the original
			// header.
			let mut chunk = self.pool.first_chunk(pkt);
			let mut chunk_off = hdr_len;
			while chunk_off >= MBUF_CHUNK_BYTES {
				chunk = self.pool.next_chunk(chunk);
				chunk_off -= MBUF_CHUNK_BYTES;
			}
			self.ports[port].rd = Some(EgressState {
				pkt,
				prefix,
				prefix_len,
				payload_skip: hdr_len,
				total: prefix_len + self.pool.len(pkt) - hdr_len,
				pos: 0,
				chunk,
				chunk_off,
			});
		}
	}
}

#[cfg(test)]
mod tests {
	use alloc::rc::Rc;
	use alloc::vec::Vec;
	use core::cell::RefCell;

	use super::*;
	use crate::eth::{ETYPE_PTP, MACADDR_BROADCAST, MacAddr};

	pub(crate) const MAC_A: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
	pub(crate) const MAC_B: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x02]);

	pub(crate) fn frame(dst: MacAddr, src: MacAddr, vtag: VlanTag, payload: &[u8]) -> Vec<u8> {
		let mut buf = vec![0u8; ETH_HDR_TAGGED_BYTES + payload.len()];
		let mut wr = ArrayWrite::new(&mut buf);
		EthHeader::new(dst, src, ETYPE_PTP, vtag).write_to(&mut wr);
		wr.write_bytes(payload);
		assert!(wr.write_finalize());
		let len = wr.written();
		buf.truncate(len);
		buf
	}

	pub(crate) fn read_port(core: &mut SwitchCore, port: usize) -> Option<Vec<u8>> {
		let len = core.port_read_ready(port);
		if len == 0 {
			return None;
		}
		let mut out = Vec::with_capacity(len);
		for _ in 0..len {
			out.push(core.port_read_next(port));
		}
		core.port_read_finalize(port);
		Some(out)
	}

	fn send(core: &mut SwitchCore, port: usize, bytes: &[u8]) -> bool {
		core.port_write_bytes(port, bytes);
		core.port_write_finalize(port)
	}

	#[test]
	fn flood_without_plugins() {
		let mut core = SwitchCore::new(8192, 8);
		for _ in 0..3 {
			core.add_port();
		}
		let data = frame(MACADDR_BROADCAST, MAC_A, VlanTag(0), b"PING");
		assert!(send(&mut core, 0, &data));
		core.poll();

		// Every port except the source sees the identical frame.
		assert_eq!(read_port(&mut core, 0), None);
		assert_eq!(read_port(&mut core, 1).unwrap(), data);
		assert_eq!(read_port(&mut core, 2).unwrap(), data);
		let stats = core.counters(0);
		assert_eq!(stats.rx_frames, 1);
		assert_eq!(core.counters(1).tx_frames, 1);
	}

	#[test]
	fn malformed_frames_count_pkt_errors() {
		let mut core = SwitchCore::new(4096, 4);
		core.add_port();
		core.add_port();
		assert!(send(&mut core, 0, &[0xEE; 6])); // Truncated header
		core.poll();
		assert_eq!(core.drop_count(DropReason::PktError), 1);
		assert_eq!(core.counters(0).errct_pkt, 1);
		assert_eq!(read_port(&mut core, 1), None);
	}

	#[test]
	fn bad_ipv4_checksum_is_dropped_at_ingress() {
		let mut core = SwitchCore::new(4096, 4);
		core.add_port();
		core.add_port();
		// IPv4 EtherType with a garbage payload.
		let mut data = frame(MAC_B, MAC_A, VlanTag(0), &[0u8; 24]);
		data[12] = 0x08;
		data[13] = 0x00;
		assert!(send(&mut core, 0, &data));
		core.poll();
		assert_eq!(core.drop_count(DropReason::PktError), 1);
	}

	#[test]
	fn link_down_ports_are_skipped() {
		let mut core = SwitchCore::new(8192, 8);
		for _ in 0..3 {
			core.add_port();
		}
		core.set_link(2, false);
		let data = frame(MACADDR_BROADCAST, MAC_A, VlanTag(0), b"x");
		assert!(send(&mut core, 0, &data));
		core.poll();
		assert!(read_port(&mut core, 1).is_some());
		assert_eq!(read_port(&mut core, 2), None);
	}

	#[test]
	fn pool_exhaustion_counts_rx_overflow() {
		let mut core = SwitchCore::new(256, 2);
		core.add_port();
		core.add_port();
		core.port_write_bytes(0, &[0u8; 512]);
		assert!(!core.port_write_finalize(0));
		assert_eq!(core.counters(0).errct_ovr_rx, 1);
		// The port recovers for the next frame.
		let data = frame(MAC_B, MAC_A, VlanTag(0), b"ok");
		assert!(send(&mut core, 0, &data));
	}

	#[test]
	fn refcounts_drain_to_zero_after_fanout() {
		let mut core = SwitchCore::new(4096, 4);
		for _ in 0..4 {
			core.add_port();
		}
		let data = frame(MACADDR_BROADCAST, MAC_A, VlanTag(0), b"spread");
		assert!(send(&mut core, 0, &data));
		core.poll();
		for port in 1..4 {
			assert!(read_port(&mut core, port).is_some());
		}
		// All references were released; the pool accepts a frame
		// large enough to need every chunk again.
		let big = frame(MACADDR_BROADCAST, MAC_A, VlanTag(0), &[0u8; 4000]);
		assert!(send(&mut core, 0, &big));
	}

	#[test]
	fn plugins_can_redirect_and_drop() {
		struct Steer;
		impl PluginCore for Steer {
			fn query(&mut self, pkt: &mut PluginPacket) {
				if pkt.hdr.dst == MAC_B {
					pkt.dst_mask &= idx2mask(2);
				} else {
					pkt.drop(DropReason::Policy);
				}
			}
		}
		let mut core = SwitchCore::new(8192, 8);
		for _ in 0..3 {
			core.add_port();
		}
		core.add_plugin(Rc::new(RefCell::new(Steer)));

		assert!(send(&mut core, 0, &frame(MAC_B, MAC_A, VlanTag(0), b"yes")));
		assert!(send(&mut core, 0, &frame(MAC_A, MAC_B, VlanTag(0), b"no")));
		core.poll();
		assert!(read_port(&mut core, 2).is_some());
		assert_eq!(read_port(&mut core, 1), None);
		assert_eq!(core.drop_count(DropReason::Policy), 1);
	}
}
