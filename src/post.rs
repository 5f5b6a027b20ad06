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

use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex};

use crate::poller::WakerSend;

pub(crate) type PostCallback = Box<dyn FnOnce() + Send + 'static>;

/// FIFO of callbacks submitted for execution on the dispatcher thread.
///
/// The mutex is held only for the O(1) enqueue and for the whole-queue swap
/// at drain time - never while a callback executes. This is the single lock
/// of the event-loop core.
#[derive(Default)]
pub(crate) struct PostQueue {
    callbacks: Mutex<VecDeque<PostCallback>>,
}

impl PostQueue {
    pub(crate) fn push(&self, callback: PostCallback) {
        self.callbacks.lock().expect("post queue poisoned").push_back(callback);
    }

    /// Swaps the accumulated callbacks out under the lock and releases it
    /// before anything runs. Submissions made while the batch executes land
    /// in the queue for the next drain.
    pub(crate) fn drain(&self) -> VecDeque<PostCallback> {
        let mut queue = self.callbacks.lock().expect("post queue poisoned");
        mem::take(&mut *queue)
    }
}

/// Cross-thread handle submitting callbacks for execution on the dispatcher
/// thread.
///
/// Obtained from `Dispatcher::poster`; cheap to clone and safe to use from
/// any thread. Outlives the dispatcher: posts submitted after the loop has
/// been torn down are dropped unexecuted.
pub struct Poster<W: WakerSend> {
    pub(crate) queue: Arc<PostQueue>,
    pub(crate) waker: W,
}

impl<W: WakerSend> Clone for Poster<W> {
    fn clone(&self) -> Self {
        Poster {
            queue: self.queue.clone(),
            waker: self.waker.clone(),
        }
    }
}

impl<W: WakerSend> Poster<W> {
    /// Appends the callback to the post queue and wakes the loop so the new
    /// work is observed promptly. Never blocks waiting for execution.
    pub fn post(&self, callback: impl FnOnce() + Send + 'static) {
        #[cfg(feature = "log")]
        log::trace!(target: "dispatcher-post", "Posting a callback to the dispatcher");

        self.queue.push(Box::new(callback));
        if let Err(err) = self.waker.wake() {
            #[cfg(feature = "log")]
            log::warn!(target: "dispatcher-post", "Unable to wake the dispatcher: {err}");
            #[cfg(not(feature = "log"))]
            let _ = err;
        }
    }
}
