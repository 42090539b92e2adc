// Veriboard - Embedded Board Emulation Platform
// Copyright (C) 2026 The Veriboard Authors
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Senseless-poll detector.
//!
//! Guests busy-waiting on an I/O register (UART status, timer counts) burn
//! host CPU for nothing. Peripherals report such reads with a weight; when
//! reports come in fast enough the detector jumps the cycle counter forward
//! (never past the next timer) and, once enough jumped time accumulates,
//! sleeps the host. The guest still sees time pass at the normal rate.
//!
//! Only report from read paths that are safe to accelerate; reporting from
//! a path that advances device state is a bug in the caller.

use crate::clock::{CycleClock, Cycles, NO_EXPIRY};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use veriboard_config::Config;

pub const DEFAULT_WEIGHT: u32 = 100;

/// Nanoseconds of jumped time that trigger a host sleep.
const SLEEP_DEBT_NS: i64 = 11_000_000;
/// How long each host sleep block is.
const SLEEP_CHUNK: Duration = Duration::from_millis(10);

struct MonitorState {
    last_report: Cycles,
    saved_cycles: Cycles,
    threshold: Cycles,
    jump_width: Cycles,
    overjumped_ns: i64,
    sensitivity: u32,
}

/// The poll detector. One per board; handles are cheap clones.
#[derive(Clone)]
pub struct Senseless {
    clock: CycleClock,
    state: Rc<RefCell<MonitorState>>,
}

impl Senseless {
    /// Defaults put threshold and jump width at rate/20000 cycles; all
    /// three knobs can be overridden from the `[poll_detector]` section
    /// (`sensivity`, `jump_width`, `threshold` — the first spelled the way
    /// existing configuration files spell it).
    pub fn new(clock: &CycleClock, config: &Config) -> Self {
        let default_width = clock.rate() / 20_000;
        let sensitivity = config
            .read_uint32("poll_detector", "sensivity")
            .unwrap_or(10);
        let jump_width = config
            .read_uint64("poll_detector", "jump_width")
            .unwrap_or(default_width);
        let threshold = config
            .read_uint64("poll_detector", "threshold")
            .unwrap_or(default_width);
        tracing::info!(
            "poll detector sensivity {} jump_width {} threshold {}",
            sensitivity,
            jump_width,
            threshold
        );
        Self {
            clock: clock.clone(),
            state: Rc::new(RefCell::new(MonitorState {
                last_report: 0,
                saved_cycles: 0,
                threshold,
                jump_width,
                overjumped_ns: 0,
                sensitivity,
            })),
        }
    }

    /// Report a possibly senseless poll. A higher weight means the
    /// operation needs fewer repetitions to be treated as a busy-wait;
    /// [`DEFAULT_WEIGHT`] suits most status registers.
    pub fn report(&self, weight: u32) {
        let mut state = self.state.borrow_mut();
        let now = self.clock.now();
        let diff = now - state.last_report;
        let consumed = 2 * diff;
        state.last_report = now;
        state.saved_cycles += self
            .clock
            .nsecs_to_cycles(state.sensitivity as u64 * weight as u64);
        if consumed > state.saved_cycles {
            state.saved_cycles = 0;
            return;
        }
        state.saved_cycles -= consumed;
        if state.saved_cycles > state.threshold {
            self.jump(&mut state);
            if state.saved_cycles > state.threshold << 1 {
                state.saved_cycles = 0;
            }
        }
    }

    /// Jump over `jump_width` cycles, bounded by the next timer expiry, and
    /// book the skipped time onto the nanosecond account. Sleep the host
    /// once the account covers more than a sleep chunk, debiting slightly
    /// more than was slept to compensate for overshoot.
    fn jump(&self, state: &mut MonitorState) {
        let now = self.clock.now();
        let first = self.clock.first_expiry();
        let width = if first == NO_EXPIRY {
            state.jump_width
        } else {
            state.jump_width.min(first.saturating_sub(now))
        };
        if width == 0 {
            return;
        }
        self.clock.advance(width);
        state.overjumped_ns += self.clock.cycles_to_nsecs(width) as i64;
        state.saved_cycles = state.saved_cycles.saturating_sub(width);
        while state.overjumped_ns > SLEEP_DEBT_NS {
            let before = Instant::now();
            std::thread::sleep(SLEEP_CHUNK);
            let slept = before.elapsed().as_nanos() as i64;
            state.overjumped_ns -= slept + slept / 10;
        }
    }

    /// Cycles currently credited towards a jump; diagnostic only.
    pub fn saved_cycles(&self) -> Cycles {
        self.state.borrow().saved_cycles
    }
}
