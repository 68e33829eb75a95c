//! Deferred-forwarding queue: packets parked while ARP resolves
//! their next hop.

use alloc::vec::Vec;

use smallvec::SmallVec;

use crate::config::{DEFER_RETRY_MAX, DEFER_RETRY_MSEC};
use crate::io::PacketHandle;
use crate::ip::Addr;
use crate::switch::PortMask;

/// One parked packet awaiting MAC resolution.
#[derive(Clone, Copy)]
struct DeferPkt {
	pkt: PacketHandle,
	dst_ip: Addr,
	dst_mask: PortMask,
	/// ARP queries sent so far.
	sent: u16,
	/// Milliseconds until the next retry.
	trem: u16,
	active: bool,
}

/// Work item produced by the retry timer.
pub(crate) enum DeferEvent {
	/// Send another ARP query for this next-hop address.
	Query(Addr),
	/// Retries exhausted: report unreachable and release the packet.
	Expired {
		pkt: PacketHandle,
		dst_mask: PortMask,
	},
}

/// Fixed pool of [`DeferPkt`] slots with exponential-backoff retry.
///
/// The owner holds one packet-pool reference per occupied slot, sends
/// the ARP queries this structure requests, and forwards or releases
/// packets as slots resolve or expire.
pub(crate) struct DeferFwd {
	slots: Vec<DeferPkt>,
}

impl DeferFwd {
	/// Create a pool of `capacity` slots (conventionally equal to
	/// the packet pool's capacity, so deferral can never be the
	/// bottleneck).
	pub fn new(capacity: usize) -> Self {
		Self {
			slots: (0..capacity)
				.map(|_| DeferPkt {
					pkt: PacketHandle(0),
					dst_ip: Addr(0),
					dst_mask: 0,
					sent: 0,
					trem: 0,
					active: false,
				})
				.collect(),
		}
	}

	/// Park a packet until `dst_ip` resolves. Returns false (caller
	/// drops the packet) when every slot is busy. On success the
	/// caller must send the first ARP query.
	pub fn accept(&mut self, pkt: PacketHandle, dst_ip: Addr, dst_mask: PortMask) -> bool {
		let Some(slot) = self.slots.iter_mut().find(|s| !s.active) else {
			return false;
		};
		*slot = DeferPkt {
			pkt,
			dst_ip,
			dst_mask,
			sent: 1,
			trem: DEFER_RETRY_MSEC,
			active: true,
		};
		true
	}

	/// Advance all retry timers by `elapsed` milliseconds.
	pub fn tick(&mut self, elapsed: u16) -> SmallVec<[DeferEvent; 4]> {
		let mut events = SmallVec::new();
		for slot in self.slots.iter_mut() {
			if !slot.active {
				continue;
			}
			if slot.trem > elapsed {
				slot.trem -= elapsed;
			} else if slot.sent <= DEFER_RETRY_MAX {
				// Exponential backoff: 10, 20, 40, 80, 160 ms.
				slot.trem = DEFER_RETRY_MSEC << slot.sent;
				slot.sent += 1;
				events.push(DeferEvent::Query(slot.dst_ip));
			} else {
				slot.active = false;
				events.push(DeferEvent::Expired {
					pkt: slot.pkt,
					dst_mask: slot.dst_mask,
				});
			}
		}
		events
	}

	/// Release every slot waiting on `ip`, returning the parked
	/// packets for immediate forwarding.
	pub fn take_matching(&mut self, ip: Addr) -> SmallVec<[(PacketHandle, PortMask); 4]> {
		let mut out = SmallVec::new();
		for slot in self.slots.iter_mut() {
			if slot.active && slot.dst_ip == ip {
				slot.active = false;
				out.push((slot.pkt, slot.dst_mask));
			}
		}
		out
	}

	/// Number of occupied slots.
	pub fn pending(&self) -> usize {
		self.slots.iter().filter(|s| s.active).count()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const HOP: Addr = Addr::new(10, 0, 0, 1);

	fn queries(events: &[DeferEvent]) -> usize {
		events
			.iter()
			.filter(|e| matches!(e, DeferEvent::Query(_)))
			.count()
	}

	#[test]
	fn backoff_schedule_and_expiry() {
		let mut defer = DeferFwd::new(4);
		assert!(defer.accept(PacketHandle(0), HOP, 0b10));

		// Expected retry offsets after the initial query at t=0.
		let mut total_queries = 1; // The caller's initial query
		let mut t = 0u32;
		let mut expired = false;
		for _ in 0..200 {
			let events = defer.tick(3);
			t += 3;
			total_queries += queries(&events);
			if events
				.iter()
				.any(|e| matches!(e, DeferEvent::Expired { .. }))
			{
				expired = true;
				break;
			}
		}
		assert!(expired);
		// One initial query plus DEFER_RETRY_MAX retries.
		assert_eq!(total_queries, usize::from(DEFER_RETRY_MAX) + 1);
		// Cumulative schedule: 10 + 20 + 40 + 80 + 160, with 3 ms
		// timer granularity.
		assert!((310..=320).contains(&t), "expired at {t} ms");
		assert_eq!(defer.pending(), 0);
	}

	#[test]
	fn arp_match_releases_slots() {
		let mut defer = DeferFwd::new(4);
		assert!(defer.accept(PacketHandle(1), HOP, 0b010));
		assert!(defer.accept(PacketHandle(2), HOP, 0b100));
		assert!(defer.accept(PacketHandle(3), Addr::new(10, 0, 0, 2), 0b100));

		let hits = defer.take_matching(HOP);
		assert_eq!(hits.len(), 2);
		assert_eq!(defer.pending(), 1);
		// Released slots are immediately reusable.
		assert!(defer.accept(PacketHandle(4), HOP, 0b1));
		assert!(defer.accept(PacketHandle(5), HOP, 0b1));
	}

	#[test]
	fn pool_exhaustion_rejects() {
		let mut defer = DeferFwd::new(2);
		assert!(defer.accept(PacketHandle(1), HOP, 1));
		assert!(defer.accept(PacketHandle(2), HOP, 1));
		assert!(!defer.accept(PacketHandle(3), HOP, 1));
	}
}
