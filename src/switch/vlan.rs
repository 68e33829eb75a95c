//! IEEE 802.1Q Virtual-LAN plugin: per-VID connectivity and
//! token-bucket rate limiting, plus per-port egress tag formatting.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use super::{
	DropReason, PMASK_ALL, PMASK_NONE, PluginCore, PluginPacket, PluginPort, PortMask, SwitchCore,
	TagPolicy, VtagPolicy,
};
use crate::eth::{VTAG_DEFAULT, VlanTag};
use crate::util::Timer;

/// Action applied when a VLAN exceeds its rate budget.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum RateAction {
	/// Never meter this VLAN.
	#[default]
	Unlimited,
	/// Reduce excess traffic to priority zero.
	Demote,
	/// Drop excess traffic.
	Strict,
	/// Demote excess traffic, dropping frames marked drop-eligible.
	Auto,
}

/// Token-bucket configuration for one VLAN.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VlanRate {
	pub action: RateAction,
	/// Count cost in 256-byte units instead of bytes.
	pub scale256: bool,
	/// Maximum accumulated budget (bucket size).
	pub tok_max: u32,
	/// Budget added per millisecond.
	pub tok_rate: u32,
}

/// No rate limiting at all.
pub const VLAN_RATE_UNLIMITED: VlanRate = VlanRate {
	action: RateAction::Unlimited,
	scale256: false,
	tok_max: u32::MAX,
	tok_rate: 0,
};

/// Conservative lockdown default (8 kbps, strict).
pub const VLAN_RATE_8KBPS: VlanRate = VlanRate::kbps(RateAction::Strict, 8);

impl VlanRate {
	/// Rate limit of `kbps` kilobits per second, with a one-MTU
	/// minimum burst allowance.
	pub const fn kbps(action: RateAction, kbps: u32) -> Self {
		let tok_rate = kbps / 8; // Bytes per millisecond
		let burst = tok_rate * 8;
		Self {
			action,
			scale256: false,
			tok_max: if burst > 1536 { burst } else { 1536 },
			tok_rate,
		}
	}
}

struct VlanPolicy {
	rate: VlanRate,
	pmask: PortMask,
	tcount: u32,
}

/// Switch plugin enforcing VLAN membership and rate limits.
///
/// Register the returned object both as a switch plugin and with a
/// [`Timekeeper`](crate::util::Timekeeper) at a one-millisecond
/// period for token refill. Egress tag formatting is handled by the
/// companion [`VlanEgress`] port plugin.
pub struct SwitchVlan {
	core: Rc<RefCell<SwitchCore>>,
	policy: Vec<VlanPolicy>,
}

impl SwitchVlan {
	/// Create the plugin supporting VIDs `1..=vmax` and register it
	/// with the switch. `lockdown` chooses whether the initial rules
	/// are permissive (allow everything, unmetered) or closed (allow
	/// nothing, 8 kbps).
	pub fn attach(core: &Rc<RefCell<SwitchCore>>, vmax: u16, lockdown: bool) -> Rc<RefCell<Self>> {
		let plugin = Rc::new(RefCell::new(Self {
			core: core.clone(),
			policy: (0..vmax)
				.map(|_| VlanPolicy {
					rate: VLAN_RATE_UNLIMITED,
					pmask: PMASK_ALL,
					tcount: 0,
				})
				.collect(),
		}));
		plugin.borrow_mut().vlan_reset(lockdown);
		core.borrow_mut().add_plugin(plugin.clone());
		plugin
	}

	/// Revert every port and VID to the default rules.
	pub fn vlan_reset(&mut self, lockdown: bool) {
		let tags = if lockdown {
			TagPolicy::Restrict
		} else {
			TagPolicy::AdmitAll
		};
		{
			let mut core = self.core.borrow_mut();
			for port in 0..core.port_count() {
				core.set_vlan_config(port, VtagPolicy::new(tags, VTAG_DEFAULT));
			}
		}
		for policy in self.policy.iter_mut() {
			if lockdown {
				policy.rate = VLAN_RATE_8KBPS;
				policy.pmask = PMASK_NONE;
			} else {
				policy.rate = VLAN_RATE_UNLIMITED;
				policy.pmask = PMASK_ALL;
			}
			policy.tcount = policy.rate.tok_max;
		}
	}

	/// Ports allowed to carry the given VID.
	pub fn vlan_get_mask(&self, vid: u16) -> PortMask {
		match self.vid_index(vid) {
			Some(idx) => self.policy[idx].pmask,
			None => PMASK_NONE,
		}
	}

	/// Restrict the given VID to the designated ports.
	pub fn vlan_set_mask(&mut self, vid: u16, mask: PortMask) {
		if let Some(idx) = self.vid_index(vid) {
			self.policy[idx].pmask = mask;
		}
	}

	/// Add one port to a VLAN.
	pub fn vlan_join(&mut self, vid: u16, port: usize) {
		if let Some(idx) = self.vid_index(vid) {
			self.policy[idx].pmask |= super::idx2mask(port);
		}
	}

	/// Remove one port from a VLAN.
	pub fn vlan_leave(&mut self, vid: u16, port: usize) {
		if let Some(idx) = self.vid_index(vid) {
			self.policy[idx].pmask &= !super::idx2mask(port);
		}
	}

	/// Set one port's tag policy and default tag.
	pub fn vlan_set_port(&mut self, port: usize, cfg: VtagPolicy) {
		self.core.borrow_mut().set_vlan_config(port, cfg);
	}

	/// Set rate-limiter options for one VID, resetting its bucket.
	pub fn vlan_set_rate(&mut self, vid: u16, rate: VlanRate) {
		if let Some(idx) = self.vid_index(vid) {
			self.policy[idx].rate = rate;
			self.policy[idx].tcount = rate.tok_max;
		}
	}

	fn vid_index(&self, vid: u16) -> Option<usize> {
		if vid == 0 || usize::from(vid) > self.policy.len() {
			None
		} else {
			Some(usize::from(vid) - 1)
		}
	}
}

impl PluginCore for SwitchVlan {
	fn query(&mut self, pkt: &mut PluginPacket) {
		let pkt_vid = pkt.hdr.vtag.vid();
		let pkt_dei = pkt.hdr.vtag.dei();
		let pkt_pcp = pkt.hdr.vtag.pcp();

		// Does the frame satisfy the source port's tag policy?
		let mut tag_ok = match pkt.src_vcfg.policy {
			TagPolicy::AdmitAll => true,
			TagPolicy::Restrict | TagPolicy::Priority => pkt_vid == 0,
			TagPolicy::Mandatory => pkt_vid != 0,
		};

		// Use the frame's VID, or fall back to the port default.
		let dst_vid = if pkt_vid != 0 {
			pkt_vid
		} else {
			pkt.src_vcfg.vtag.vid()
		};
		let Some(idx) = self.vid_index(dst_vid) else {
			pkt.drop(DropReason::Vlan);
			return;
		};

		pkt.priority = if pkt_pcp != 0 {
			pkt_pcp as u8
		} else {
			pkt.src_vcfg.vtag.pcp() as u8
		};

		// The source port must itself belong to the VLAN.
		let vmask = if tag_ok { self.policy[idx].pmask } else { 0 };
		if vmask & pkt.src_mask() == 0 {
			tag_ok = false;
		}
		if !tag_ok {
			pkt.drop(DropReason::Vlan);
			return;
		}

		// Token-bucket accounting.
		let policy = &mut self.policy[idx];
		let scale = if policy.rate.scale256 { 256 } else { 1 };
		let cost = (pkt.length as u32).div_ceil(scale);
		if cost > policy.tcount {
			let action = policy.rate.action;
			if matches!(action, RateAction::Demote | RateAction::Auto) {
				pkt.priority = 0;
			}
			if action == RateAction::Strict || (action == RateAction::Auto && pkt_dei != 0) {
				pkt.drop(DropReason::Vrate);
				return;
			}
		} else if policy.rate.action != RateAction::Unlimited {
			policy.tcount -= cost;
		}

		// Forwarding stays within the VLAN's membership.
		pkt.dst_mask &= policy.pmask;
	}
}

impl Timer for SwitchVlan {
	fn timer_event(&mut self) {
		for policy in self.policy.iter_mut() {
			policy.tcount = policy
				.tcount
				.saturating_add(policy.rate.tok_rate)
				.min(policy.rate.tok_max);
		}
	}
}

/// Egress tag formatter; attach one to each port that needs its
/// outgoing 802.1Q tags rewritten. Stateless, so a single instance
/// may serve every port.
pub struct VlanEgress;

impl PluginPort for VlanEgress {
	fn egress(&mut self, pkt: &mut PluginPacket, port_cfg: &VtagPolicy) {
		let vref = pkt.hdr.vtag;

		// Fill missing fields from the egress port's defaults.
		let dst_vid = if vref.vid() != 0 {
			vref.vid()
		} else {
			port_cfg.vtag.vid()
		};
		let dst_dei = if vref.any() { vref.dei() } else { port_cfg.vtag.dei() };
		let dst_pcp = if vref.any() { vref.pcp() } else { port_cfg.vtag.pcp() };

		pkt.hdr.vtag = match port_cfg.policy {
			// Priority tagging carries DEI/PCP but no VID.
			TagPolicy::Priority => VlanTag::new(0, dst_dei, dst_pcp),
			// Mandatory tagging emits every field.
			TagPolicy::Mandatory => VlanTag::new(dst_vid, dst_dei, dst_pcp),
			// Other modes never emit tagged frames.
			TagPolicy::AdmitAll | TagPolicy::Restrict => VlanTag(0),
		};
		if pkt.hdr.vtag != vref {
			pkt.adjust();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::super::tests::{MAC_A, MAC_B, frame, read_port};
	use super::*;
	use crate::eth::{ETH_HDR_BYTES, ETH_HDR_TAGGED_BYTES, EthHeader, MACADDR_BROADCAST};
	use crate::io::ArrayRead;
	use crate::switch::idx2mask;

	/// Three-port switch per the VLAN enforcement scenario:
	/// port 0 mandatory-tagged on VID 10, port 1 untagged on VID 10,
	/// port 2 untagged on VID 20.
	fn vlan_switch() -> (Rc<RefCell<SwitchCore>>, Rc<RefCell<SwitchVlan>>) {
		let core = Rc::new(RefCell::new(SwitchCore::new(8192, 8)));
		for _ in 0..3 {
			core.borrow_mut().add_port();
		}
		let vlan = SwitchVlan::attach(&core, 64, false);
		{
			let mut v = vlan.borrow_mut();
			v.vlan_set_mask(10, idx2mask(0) | idx2mask(1));
			v.vlan_set_mask(20, idx2mask(1) | idx2mask(2));
			v.vlan_set_port(
				0,
				VtagPolicy::new(TagPolicy::Mandatory, VlanTag::new(10, 0, 0)),
			);
			v.vlan_set_port(1, VtagPolicy::new(TagPolicy::Restrict, VlanTag::new(10, 0, 0)));
			v.vlan_set_port(2, VtagPolicy::new(TagPolicy::AdmitAll, VlanTag::new(20, 0, 0)));
		}
		let egress = Rc::new(RefCell::new(VlanEgress));
		for port in 0..3 {
			core.borrow_mut().attach_egress(port, egress.clone());
		}
		(core, vlan)
	}

	fn send(core: &Rc<RefCell<SwitchCore>>, port: usize, bytes: &[u8]) {
		let mut c = core.borrow_mut();
		c.port_write_bytes(port, bytes);
		assert!(c.port_write_finalize(port));
		c.poll();
	}

	#[test]
	fn membership_and_egress_rewrite() {
		let (core, _vlan) = vlan_switch();

		// Tagged VID-10 broadcast from port 0.
		let tagged = frame(MACADDR_BROADCAST, MAC_A, VlanTag::new(10, 0, 3), b"pay");
		send(&core, 0, &tagged);

		// Port 1 (restrict) receives the frame with the tag removed.
		let got = read_port(&mut core.borrow_mut(), 1).expect("delivery to port 1");
		assert_eq!(got.len(), tagged.len() - 4);
		let mut rd = ArrayRead::new(&got);
		let hdr = EthHeader::read_from(&mut rd).unwrap();
		assert!(!hdr.vtag.any());
		assert_eq!(got[ETH_HDR_BYTES..], tagged[ETH_HDR_TAGGED_BYTES..]);

		// Port 2 is not a member of VLAN 10.
		assert_eq!(read_port(&mut core.borrow_mut(), 2), None);
	}

	#[test]
	fn mandatory_port_rejects_untagged() {
		let (core, _vlan) = vlan_switch();
		let untagged = frame(MACADDR_BROADCAST, MAC_A, VlanTag(0), b"x");
		send(&core, 0, &untagged);
		assert_eq!(read_port(&mut core.borrow_mut(), 1), None);
		assert_eq!(core.borrow().drop_count(DropReason::Vlan), 1);
	}

	#[test]
	fn default_vid_steers_untagged_frames() {
		let (core, _vlan) = vlan_switch();
		// Untagged on port 2 joins VLAN 20 = ports {1, 2}.
		let untagged = frame(MACADDR_BROADCAST, MAC_B, VlanTag(0), b"y");
		send(&core, 2, &untagged);
		assert!(read_port(&mut core.borrow_mut(), 1).is_some());
		assert_eq!(read_port(&mut core.borrow_mut(), 0), None);
	}

	#[test]
	fn mandatory_egress_fills_default_fields() {
		let core = Rc::new(RefCell::new(SwitchCore::new(8192, 8)));
		core.borrow_mut().add_port();
		core.borrow_mut().add_port();
		let vlan = SwitchVlan::attach(&core, 64, false);
		vlan.borrow_mut().vlan_set_port(
			1,
			VtagPolicy::new(TagPolicy::Mandatory, VlanTag::new(30, 1, 5)),
		);
		let egress = Rc::new(RefCell::new(VlanEgress));
		core.borrow_mut().attach_egress(1, egress);

		let untagged = frame(MACADDR_BROADCAST, MAC_A, VlanTag(0), b"z");
		send(&core, 0, &untagged);
		let got = read_port(&mut core.borrow_mut(), 1).unwrap();
		let mut rd = ArrayRead::new(&got);
		let hdr = EthHeader::read_from(&mut rd).unwrap();
		assert_eq!(hdr.vtag.vid(), 30);
		assert_eq!(hdr.vtag.dei(), 1);
		assert_eq!(hdr.vtag.pcp(), 5);
		// Payload is untouched by the rewrite.
		assert_eq!(got[ETH_HDR_TAGGED_BYTES..], untagged[ETH_HDR_BYTES..]);
	}

	#[test]
	fn strict_rate_limit_drops_excess() {
		let (core, vlan) = vlan_switch();
		vlan.borrow_mut().vlan_set_rate(
			10,
			VlanRate {
				action: RateAction::Strict,
				scale256: false,
				tok_max: 64,
				tok_rate: 16,
			},
		);

		let tagged = frame(MACADDR_BROADCAST, MAC_A, VlanTag::new(10, 0, 0), &[0u8; 30]);
		// 48-byte frames: the first fits the 64-token bucket, the
		// second does not.
		send(&core, 0, &tagged);
		send(&core, 0, &tagged);
		assert!(read_port(&mut core.borrow_mut(), 1).is_some());
		assert_eq!(read_port(&mut core.borrow_mut(), 1), None);
		assert_eq!(core.borrow().drop_count(DropReason::Vrate), 1);

		// One millisecond refills 16 tokens; three more reach 48.
		for _ in 0..4 {
			vlan.borrow_mut().timer_event();
		}
		send(&core, 0, &tagged);
		assert!(read_port(&mut core.borrow_mut(), 1).is_some());
	}

	#[test]
	fn auto_demotes_and_drops_dei_frames() {
		let (core, vlan) = vlan_switch();
		vlan.borrow_mut().vlan_set_rate(
			10,
			VlanRate {
				action: RateAction::Auto,
				scale256: false,
				tok_max: 10,
				tok_rate: 0,
			},
		);

		// Over budget without DEI: demoted to priority 0 but kept.
		let plain = frame(MACADDR_BROADCAST, MAC_A, VlanTag::new(10, 0, 6), b"a");
		send(&core, 0, &plain);
		assert!(read_port(&mut core.borrow_mut(), 1).is_some());

		// Over budget with DEI set: dropped.
		let dei = frame(MACADDR_BROADCAST, MAC_A, VlanTag::new(10, 1, 6), b"b");
		send(&core, 0, &dei);
		assert_eq!(read_port(&mut core.borrow_mut(), 1), None);
		assert_eq!(core.borrow().drop_count(DropReason::Vrate), 1);
	}

	#[test]
	fn unlimited_never_debits_tokens() {
		let (core, vlan) = vlan_switch();
		let tagged = frame(MACADDR_BROADCAST, MAC_A, VlanTag::new(10, 0, 0), &[0u8; 100]);
		for _ in 0..16 {
			send(&core, 0, &tagged);
			assert!(read_port(&mut core.borrow_mut(), 1).is_some());
		}
		// Bucket untouched under the unlimited default.
		assert_eq!(
			vlan.borrow().policy[9].tcount,
			vlan.borrow().policy[9].rate.tok_max
		);
	}

	#[test]
	fn lockdown_reset_blocks_everything() {
		let (core, vlan) = vlan_switch();
		vlan.borrow_mut().vlan_reset(true);
		assert_eq!(vlan.borrow().vlan_get_mask(10), PMASK_NONE);

		let untagged = frame(MACADDR_BROADCAST, MAC_A, VlanTag(0), b"x");
		send(&core, 0, &untagged);
		assert_eq!(read_port(&mut core.borrow_mut(), 1), None);
	}

	#[test]
	fn join_and_leave_edit_membership() {
		let (_core, vlan) = vlan_switch();
		let mut v = vlan.borrow_mut();
		v.vlan_join(10, 2);
		assert_eq!(v.vlan_get_mask(10), idx2mask(0) | idx2mask(1) | idx2mask(2));
		v.vlan_leave(10, 0);
		assert_eq!(v.vlan_get_mask(10), idx2mask(1) | idx2mask(2));
		// Out-of-range VIDs are ignored.
		v.vlan_join(0, 1);
		v.vlan_join(65, 1);
		assert_eq!(v.vlan_get_mask(65), PMASK_NONE);
	}
}
