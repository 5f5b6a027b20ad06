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

/// Marker for objects whose destruction may be handed over to the dispatcher.
///
/// An object submitted through `Dispatcher::deferred_delete` stays alive until
/// the next drain of the deferred-delete list, after the callback stack which
/// removed it has fully unwound.
pub trait DeferredDeletable: 'static {}

/// Double-buffered list of objects awaiting destruction.
///
/// Items are enqueued into the current generation; draining flips the
/// generation first and only then drops the previous one. A destructor may
/// therefore enqueue further items (they land in the new generation and
/// survive until the next drain) and may even re-enter the drain itself
/// (a no-op while a drain is in progress).
#[derive(Default)]
pub(crate) struct DeferredDeleteQueue {
    generations: [RefCell<Vec<Box<dyn DeferredDeletable>>>; 2],
    current: Cell<usize>,
    deleting: Cell<bool>,
}

impl DeferredDeleteQueue {
    pub(crate) fn push(&self, item: Box<dyn DeferredDeletable>) {
        self.generations[self.current.get()].borrow_mut().push(item);
    }

    pub(crate) fn clear(&self) {
        if self.deleting.get() {
            return;
        }
        let previous = self.current.get();
        if self.generations[previous].borrow().is_empty() {
            return;
        }
        // Flip generations before destroying anything: destructors enqueue
        // into the other buffer and never touch the one being drained.
        self.current.set(1 - previous);
        self.deleting.set(true);
        self.generations[previous].borrow_mut().clear();
        self.deleting.set(false);
    }
}
