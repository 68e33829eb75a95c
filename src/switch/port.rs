//! Port attachment handle.

use alloc::rc::Rc;
use core::cell::RefCell;

use super::{PortCounters, PortMask, SwitchCore, VtagPolicy, idx2mask};
use crate::io::{Readable, Writeable};

/// A bidirectional attachment to one switch (or router) port.
///
/// The handle implements [`Writeable`] for the ingress direction
/// (the attached device writes received frames into the switch) and
/// [`Readable`] for egress (the device streams out frames the switch
/// queued for it, with any per-port VLAN rewrite already applied).
/// Handles are cheap to clone and may be wired directly as the frame
/// sink of an [`Interface`](crate::iface::Interface).
#[derive(Clone)]
pub struct SwitchPort {
	core: Rc<RefCell<SwitchCore>>,
	index: usize,
}

impl SwitchPort {
	/// Register a new port on `core` and return its handle.
	pub fn attach(core: &Rc<RefCell<SwitchCore>>) -> Self {
		let index = core.borrow_mut().add_port();
		Self {
			core: core.clone(),
			index,
		}
	}

	pub fn index(&self) -> usize {
		self.index
	}

	pub fn mask(&self) -> PortMask {
		idx2mask(self.index)
	}

	pub fn set_link(&self, up: bool) {
		self.core.borrow_mut().set_link(self.index, up);
	}

	pub fn vlan_config(&self) -> VtagPolicy {
		self.core.borrow().vlan_config(self.index)
	}

	pub fn set_vlan_config(&self, cfg: VtagPolicy) {
		self.core.borrow_mut().set_vlan_config(self.index, cfg);
	}

	pub fn counters(&self) -> PortCounters {
		self.core.borrow().counters(self.index)
	}
}

impl Writeable for SwitchPort {
	fn get_write_space(&self) -> usize {
		self.core.borrow().port_write_space(self.index)
	}

	fn write_next(&mut self, data: u8) {
		self.core.borrow_mut().port_write_bytes(self.index, &[data]);
	}

	fn write_overflow(&mut self) {
		self.core.borrow_mut().port_write_fail(self.index);
	}

	fn write_bytes(&mut self, src: &[u8]) {
		// Bulk path; the core handles its own overflow marking.
		if self.get_write_space() >= src.len() {
			self.core.borrow_mut().port_write_bytes(self.index, src);
		} else {
			self.write_overflow();
		}
	}

	fn write_finalize(&mut self) -> bool {
		self.core.borrow_mut().port_write_finalize(self.index)
	}

	fn write_abort(&mut self) {
		self.core.borrow_mut().port_write_abort(self.index);
	}
}

impl Readable for SwitchPort {
	fn get_read_ready(&self) -> usize {
		self.core.borrow_mut().port_read_ready(self.index)
	}

	fn read_next(&mut self) -> u8 {
		self.core.borrow_mut().port_read_next(self.index)
	}

	fn read_finalize(&mut self) {
		self.core.borrow_mut().port_read_finalize(self.index);
	}
}
