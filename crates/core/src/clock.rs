// Veriboard - Embedded Board Emulation Platform
// Copyright (C) 2026 The Veriboard Authors
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Cycle counter and one-shot cycle timers.
//!
//! Simulated time is a monotonically non-decreasing cycle count. Everything
//! that wants to happen "later" arms a [`CycleTimer`]; the CPU loop (or the
//! idle loop) periodically compares `now` against [`CycleClock::first_expiry`]
//! and calls [`CycleClock::run_due`].

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;

pub type Cycles = u64;

/// Sentinel returned by `first_expiry` when no timer is armed.
pub const NO_EXPIRY: Cycles = u64::MAX;

type TimerCallback = Box<dyn FnMut()>;

struct TimerSlot {
    callback: Option<TimerCallback>,
    expiry: Option<Cycles>,
    seq: u64,
}

struct ClockInner {
    now: Cycles,
    rate: u64,
    next_id: u64,
    next_seq: u64,
    slots: HashMap<u64, TimerSlot>,
    // (expiry, seq, id); seq keeps FIFO order among equal expiries and lets
    // stale entries from re-arms be detected and discarded lazily.
    heap: BinaryHeap<Reverse<(Cycles, u64, u64)>>,
}

/// Handle on the process-wide cycle clock. Cheap to clone; all clones share
/// the same counter and timer set.
#[derive(Clone)]
pub struct CycleClock {
    inner: Rc<RefCell<ClockInner>>,
}

impl CycleClock {
    /// `rate` is the fixed simulated frequency in cycles per second.
    pub fn new(rate: u64) -> Self {
        assert!(rate > 0, "cycle rate must be nonzero");
        Self {
            inner: Rc::new(RefCell::new(ClockInner {
                now: 0,
                rate,
                next_id: 0,
                next_seq: 0,
                slots: HashMap::new(),
                heap: BinaryHeap::new(),
            })),
        }
    }

    pub fn now(&self) -> Cycles {
        self.inner.borrow().now
    }

    pub fn rate(&self) -> u64 {
        self.inner.borrow().rate
    }

    /// Advance the counter. The counter never moves backwards; dispatching
    /// timers that became due is the caller's job (`run_due`).
    pub fn advance(&self, delta: Cycles) {
        let mut inner = self.inner.borrow_mut();
        inner.now = inner.now.saturating_add(delta);
    }

    /// Jump the counter directly to `target` if that is in the future.
    pub fn advance_to(&self, target: Cycles) {
        let mut inner = self.inner.borrow_mut();
        if target > inner.now {
            inner.now = target;
        }
    }

    /// Earliest expiry among active timers, or [`NO_EXPIRY`].
    pub fn first_expiry(&self) -> Cycles {
        let mut inner = self.inner.borrow_mut();
        inner.prune_stale();
        match inner.heap.peek() {
            Some(Reverse((expiry, _, _))) => *expiry,
            None => NO_EXPIRY,
        }
    }

    /// True when `run_due` has work to do.
    pub fn timers_due(&self) -> bool {
        let now = self.now();
        self.first_expiry() <= now
    }

    /// Fire every timer with expiry <= now, in ascending expiry order and
    /// FIFO among equals. A timer is deactivated before its callback runs,
    /// so callbacks may re-arm themselves or any other timer.
    pub fn run_due(&self) {
        loop {
            let (id, mut callback) = {
                let mut inner = self.inner.borrow_mut();
                inner.prune_stale();
                let due = match inner.heap.peek() {
                    Some(Reverse((expiry, _, _))) if *expiry <= inner.now => true,
                    _ => false,
                };
                if !due {
                    return;
                }
                let Reverse((expiry, seq, id)) = inner.heap.pop().unwrap();
                let slot = inner.slots.get_mut(&id).unwrap();
                match slot.callback.take() {
                    Some(cb) => {
                        slot.expiry = None;
                        (id, cb)
                    }
                    None => {
                        // This timer's callback is running further up the
                        // stack; leave its arming alone and let the outer
                        // dispatch pass pick it up.
                        inner.heap.push(Reverse((expiry, seq, id)));
                        return;
                    }
                }
            };
            callback();
            let mut inner = self.inner.borrow_mut();
            // The timer may have been dropped from inside its own callback.
            if let Some(slot) = inner.slots.get_mut(&id) {
                slot.callback = Some(callback);
            }
        }
    }

    pub fn usecs_to_cycles(&self, us: u64) -> Cycles {
        mul_div(us, self.rate(), 1_000_000)
    }

    pub fn msecs_to_cycles(&self, ms: u64) -> Cycles {
        mul_div(ms, self.rate(), 1_000)
    }

    pub fn nsecs_to_cycles(&self, ns: u64) -> Cycles {
        mul_div(ns, self.rate(), 1_000_000_000)
    }

    pub fn cycles_to_nsecs(&self, cycles: Cycles) -> u64 {
        mul_div(cycles, 1_000_000_000, self.rate())
    }

    fn alloc_timer(&self, callback: TimerCallback) -> u64 {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.slots.insert(
            id,
            TimerSlot {
                callback: Some(callback),
                expiry: None,
                seq: 0,
            },
        );
        id
    }
}

impl ClockInner {
    fn prune_stale(&mut self) {
        while let Some(Reverse((expiry, seq, id))) = self.heap.peek().copied() {
            let stale = match self.slots.get(&id) {
                Some(slot) => slot.expiry != Some(expiry) || slot.seq != seq,
                None => true,
            };
            if stale {
                self.heap.pop();
            } else {
                break;
            }
        }
    }
}

fn mul_div(value: u64, num: u64, den: u64) -> u64 {
    ((value as u128 * num as u128) / den as u128) as u64
}

/// A one-shot timer. At most one active instance; `modify` re-arms.
pub struct CycleTimer {
    clock: CycleClock,
    id: u64,
}

impl CycleTimer {
    pub fn new(clock: &CycleClock, callback: impl FnMut() + 'static) -> Self {
        let id = clock.alloc_timer(Box::new(callback));
        Self {
            clock: clock.clone(),
            id,
        }
    }

    /// Arm (or re-arm) the timer `delta` cycles from now.
    pub fn modify(&self, delta: Cycles) {
        let mut inner = self.clock.inner.borrow_mut();
        let expiry = inner.now.saturating_add(delta);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let slot = inner
            .slots
            .get_mut(&self.id)
            .expect("timer slot outlives handle");
        slot.expiry = Some(expiry);
        slot.seq = seq;
        inner.heap.push(Reverse((expiry, seq, self.id)));
    }

    /// Deactivate without firing. A timer whose callback has already started
    /// completes that invocation.
    pub fn remove(&self) {
        let mut inner = self.clock.inner.borrow_mut();
        if let Some(slot) = inner.slots.get_mut(&self.id) {
            slot.expiry = None;
        }
    }

    pub fn is_active(&self) -> bool {
        let inner = self.clock.inner.borrow();
        inner
            .slots
            .get(&self.id)
            .map(|slot| slot.expiry.is_some())
            .unwrap_or(false)
    }
}

impl Drop for CycleTimer {
    fn drop(&mut self) {
        let mut inner = self.clock.inner.borrow_mut();
        inner.slots.remove(&self.id);
    }
}
