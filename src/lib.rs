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

#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Event dispatcher ([`Dispatcher`]) is the per-thread loop core driving a
//! proxy worker thread: it blocks on I/O readiness from registered file
//! descriptors (plus waker, plus timers), invokes the matching callbacks in
//! the context of the loop thread, and between polls runs due timers, drains
//! the cross-thread post queue and destroys deferred-deleted objects.
//!
//! Each connection, filter and codec above this crate is driven exclusively
//! through callbacks scheduled here; the loop guarantees that the post-queue
//! lock is never held while a callback executes, and that an object removed
//! from inside its own callback outlives the unwinding of the stack which
//! removed it.
//!
//! Other threads interact with a dispatcher only through the [`Poster`]
//! handle; everything else is bound to the loop thread.

#[macro_use]
extern crate amplify;

pub mod poller;
mod deferred;
mod dispatcher;
mod post;
mod stats;
mod timer;

pub use deferred::DeferredDeletable;
pub use post::Poster;
pub use stats::{Histogram, Scope};
pub use timer::{milliseconds_to_timeval, Timer, TimerId};

pub use self::dispatcher::{Dispatcher, FileEvent, RunType};
