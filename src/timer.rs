// Per-thread event-loop core: I/O dispatch, timers, deferred deletion and
// cross-thread posting.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2023 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2023 UBIDECO Institute, Switzerland
// Copyright 2021 Alexis Sellier <alexis@cloudhead.io>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// Identifier of a timer, unique within the dispatcher which created it.
#[derive(Wrapper, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug, From)]
#[wrapper(Display)]
pub struct TimerId(u64);

/// Fallback horizon for deadline arithmetic which would otherwise overflow
/// the monotonic clock representation.
const DISTANT_FUTURE: Duration = Duration::from_secs(u32::MAX as u64);

/// Converts a millisecond count into a POSIX `timeval`.
///
/// Seconds are clamped into the `time_t` range instead of overflowing; the
/// microsecond field is always strictly less than 1_000_000. Below the clamp
/// threshold the original millisecond count is reconstructible as
/// `tv_sec * 1000 + tv_usec / 1000`.
pub fn milliseconds_to_timeval(msecs: u64) -> libc::timeval {
    let secs = msecs / 1000;
    let usecs = (msecs % 1000) * 1000;
    libc::timeval {
        tv_sec: libc::time_t::try_from(secs).unwrap_or(libc::time_t::MAX),
        tv_usec: usecs as libc::suseconds_t,
    }
}

pub(crate) struct TimerState {
    id: TimerId,
    deadline: Cell<Option<Instant>>,
    callback: RefCell<Option<Box<dyn FnMut()>>>,
}

impl TimerState {
    pub(crate) fn fire(&self) {
        // Disarmed before the callback runs: a re-arm from inside the
        // callback is a fresh arm, and `enabled()` queried during the
        // callback reports false.
        self.deadline.set(None);
        let cb = self.callback.borrow_mut().take();
        if let Some(mut cb) = cb {
            cb();
            *self.callback.borrow_mut() = Some(cb);
        }
    }
}

/// Set of armed timers belonging to one dispatcher.
///
/// Keeps absolute deadlines ordered so the earliest one bounds the poll
/// timeout. Holds only weak scheduling references: timer lifetime belongs to
/// the [`Timer`] handles.
#[derive(Default)]
pub(crate) struct TimerQueue {
    armed: RefCell<BTreeMap<(Instant, TimerId), Weak<TimerState>>>,
    next_id: Cell<u64>,
}

impl TimerQueue {
    fn next_id(&self) -> TimerId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        TimerId::from(id)
    }

    fn arm(&self, deadline: Instant, state: &Rc<TimerState>) {
        self.armed.borrow_mut().insert((deadline, state.id), Rc::downgrade(state));
    }

    fn disarm(&self, deadline: Instant, id: TimerId) {
        self.armed.borrow_mut().remove(&(deadline, id));
    }

    /// Time left until the earliest armed deadline. `None` when no timer is
    /// armed; zero when a deadline has already passed.
    pub(crate) fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.armed
            .borrow()
            .keys()
            .next()
            .map(|&(deadline, _)| deadline.saturating_duration_since(now))
    }

    /// Removes every timer with a deadline at or before `now` from the armed
    /// set and returns them for firing. No map borrow survives into the
    /// callback invocations.
    pub(crate) fn expire(&self, now: Instant) -> Vec<Rc<TimerState>> {
        let mut armed = self.armed.borrow_mut();
        let mut due = Vec::new();
        while let Some((&(deadline, _), _)) = armed.first_key_value() {
            if deadline > now {
                break;
            }
            let (_, slot) = armed.pop_first().expect("armed set is non-empty");
            if let Some(state) = slot.upgrade() {
                due.push(state);
            }
        }
        due
    }
}

/// One-shot, re-armable alarm scheduled on the dispatcher's monotonic clock.
///
/// Owned by the code which created it; the dispatcher only tracks armed
/// deadlines. Dropping the handle disarms the timer. A timer may disable,
/// re-arm or drop itself from within its own firing callback.
pub struct Timer {
    state: Rc<TimerState>,
    queue: Rc<TimerQueue>,
}

impl Timer {
    pub(crate) fn new(queue: Rc<TimerQueue>, callback: Box<dyn FnMut()>) -> Self {
        let state = Rc::new(TimerState {
            id: queue.next_id(),
            deadline: Cell::new(None),
            callback: RefCell::new(Some(callback)),
        });
        Timer { state, queue }
    }

    /// Arms the timer to fire once `duration` from now, replacing any
    /// previously armed deadline.
    ///
    /// A zero duration still requires one loop pass before the callback is
    /// invoked; the callback never runs synchronously from here.
    pub fn enable_timer(&self, duration: Duration) {
        let now = Instant::now();
        let deadline = now.checked_add(duration).unwrap_or(now + DISTANT_FUTURE);
        if let Some(old) = self.state.deadline.replace(Some(deadline)) {
            self.queue.disarm(old, self.state.id);
        }
        self.queue.arm(deadline, &self.state);
    }

    /// Disarms the timer. No-op when the timer is not armed.
    pub fn disable_timer(&self) {
        if let Some(deadline) = self.state.deadline.take() {
            self.queue.disarm(deadline, self.state.id);
        }
    }

    /// Whether the timer is currently armed.
    pub fn enabled(&self) -> bool { self.state.deadline.get().is_some() }
}

impl Drop for Timer {
    fn drop(&mut self) { self.disable_timer(); }
}
