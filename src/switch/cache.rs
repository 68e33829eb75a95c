//! MAC-address learning plugin.

use super::{PMASK_ALL, PMASK_NONE, PluginCore, PluginPacket, PortMask, idx2mask};
use crate::eth::MacAddr;
use crate::util::LruCache;

/// The switch's MAC-address table: an LRU cache mapping each learned
/// source address to the port it was last seen on.
///
/// Every switch needs this plugin (or an equivalent) to steer
/// unicast traffic. Frames whose destination is not yet in the table
/// flood to the ports selected by the miss mask; broadcast floods
/// everywhere; an all-zero destination is dropped by narrowing the
/// destination set to nothing.
pub struct SwitchCache {
	cache: LruCache<u64, usize>,
	learn: bool,
	miss_mask: PortMask,
}

impl SwitchCache {
	/// Create a cache plugin holding up to `size` learned addresses
	/// (64 is the conventional default).
	pub fn new(size: usize) -> Self {
		Self {
			cache: LruCache::new(size),
			learn: true,
			miss_mask: PMASK_ALL,
		}
	}

	/// Enable or disable miss-as-broadcast for one port.
	pub fn set_miss_bcast(&mut self, port: usize, enable: bool) {
		if enable {
			self.miss_mask |= idx2mask(port);
		} else {
			self.miss_mask &= !idx2mask(port);
		}
	}

	/// Set the whole miss-as-broadcast port mask at once.
	pub fn set_miss_mask(&mut self, mask: PortMask) {
		self.miss_mask = mask;
	}

	pub fn miss_mask(&self) -> PortMask {
		self.miss_mask
	}

	/// Maximum number of table entries.
	pub fn mactbl_size(&self) -> usize {
		self.cache.capacity()
	}

	/// Read the Nth entry, in most-recently-used order.
	pub fn mactbl_read(&self, index: usize) -> Option<(usize, MacAddr)> {
		self.cache
			.iter()
			.nth(index)
			.map(|(mac, port)| (port, MacAddr::from_u64(mac)))
	}

	/// Manually pin an address to a port.
	pub fn mactbl_write(&mut self, port: usize, mac: MacAddr) -> bool {
		if !mac.is_unicast() {
			return false;
		}
		self.cache.insert(mac.to_u64(), port);
		true
	}

	/// Forget every learned address.
	pub fn mactbl_clear(&mut self) {
		self.cache.clear();
	}

	/// Enable or disable automatic source-address learning.
	pub fn mactbl_learn(&mut self, enable: bool) {
		self.learn = enable;
	}

	fn destination_mask(&mut self, dst: MacAddr) -> PortMask {
		if dst.is_broadcast() || dst.is_multicast() {
			PMASK_ALL
		} else if !dst.is_valid() {
			PMASK_NONE
		} else if let Some(port) = self.cache.get(&dst.to_u64()) {
			idx2mask(port)
		} else {
			self.miss_mask
		}
	}
}

impl PluginCore for SwitchCache {
	fn query(&mut self, pkt: &mut PluginPacket) {
		// Learn the sender's port, then steer by destination.
		if self.learn && pkt.hdr.src.is_unicast() {
			self.cache.insert(pkt.hdr.src.to_u64(), pkt.src_port);
		}
		pkt.dst_mask &= self.destination_mask(pkt.hdr.dst);
	}
}
