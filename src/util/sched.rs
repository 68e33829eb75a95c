//! Cooperative timer scheduling.
//!
//! The event loop owns one [`Timekeeper`]; components that need
//! periodic service (VLAN token refill, deferred-forwarding retries,
//! ping repetition) register themselves as [`Timer`] objects. Timer
//! callbacks run to completion on the polling thread; there is no
//! preemption and no interrupt-context execution.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use super::Clock;

/// Callback interface for periodic or one-shot timers.
pub trait Timer {
	fn timer_event(&mut self);
}

/// Opaque handle for cancelling a registered timer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerId(u32);

struct TimerSlot {
	id: TimerId,
	hook: Rc<RefCell<dyn Timer>>,
	/// Re-arm interval in nanoseconds; zero for one-shot timers.
	interval: u64,
	deadline: u64,
	/// Registration order, for breaking deadline ties.
	seq: u32,
}

/// Deadline-ordered dispatcher for [`Timer`] callbacks.
pub struct Timekeeper {
	clock: Rc<dyn Clock>,
	timers: Vec<TimerSlot>,
	next_id: u32,
}

impl Timekeeper {
	pub fn new(clock: Rc<dyn Clock>) -> Self {
		Self {
			clock,
			timers: Vec::new(),
			next_id: 0,
		}
	}

	/// Register a periodic timer firing every `msec` milliseconds.
	pub fn timer_every(&mut self, msec: u32, hook: Rc<RefCell<dyn Timer>>) -> TimerId {
		self.register(u64::from(msec.max(1)) * 1_000_000, true, hook)
	}

	/// Register a one-shot timer firing once after `msec` milliseconds.
	pub fn timer_once(&mut self, msec: u32, hook: Rc<RefCell<dyn Timer>>) -> TimerId {
		self.register(u64::from(msec) * 1_000_000, false, hook)
	}

	/// Cancel a timer. A stopped timer never fires again, including
	/// any event that would otherwise be due right now.
	pub fn timer_stop(&mut self, id: TimerId) {
		self.timers.retain(|t| t.id != id);
	}

	/// Service every timer whose deadline has elapsed, in deadline
	/// order (ties broken by registration order).
	pub fn poll(&mut self) {
		let now = self.clock.now();
		loop {
			// Pick the most overdue timer; one at a time, since a
			// callback may register or stop other timers.
			let due = self
				.timers
				.iter()
				.filter(|t| t.deadline <= now)
				.min_by_key(|t| (t.deadline, t.seq))
				.map(|t| (t.id, t.hook.clone()));
			let Some((id, hook)) = due else { break };
			if let Some(slot) = self.timers.iter_mut().find(|t| t.id == id) {
				if slot.interval > 0 {
					slot.deadline += slot.interval;
					if slot.deadline <= now {
						// Missed several periods; fire once and resume
						// from the present rather than replaying them.
						slot.deadline = now + slot.interval;
					}
				}
			}
			hook.borrow_mut().timer_event();
			if self
				.timers
				.iter()
				.position(|t| t.id == id)
				.is_some_and(|idx| self.timers[idx].interval == 0)
			{
				self.timers.retain(|t| t.id != id);
			}
		}
	}

	fn register(&mut self, interval: u64, periodic: bool, hook: Rc<RefCell<dyn Timer>>) -> TimerId {
		let id = TimerId(self.next_id);
		self.next_id = self.next_id.wrapping_add(1);
		self.timers.push(TimerSlot {
			id,
			hook,
			interval: if periodic { interval } else { 0 },
			deadline: self.clock.now() + interval,
			seq: id.0,
		});
		id
	}
}
