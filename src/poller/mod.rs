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

#[cfg(feature = "popol")]
pub mod popol;

use std::fmt::{self, Display, Formatter};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{io, ops};

/// Set of I/O operations a file descriptor is interested in - or ready for.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct IoType {
    /// Specifies whether I/O source has data to read.
    pub read: bool,
    /// Specifies whether I/O source is ready for write operations.
    pub write: bool,
}

impl IoType {
    pub fn none() -> Self {
        Self {
            read: false,
            write: false,
        }
    }

    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    pub fn write_only() -> Self {
        Self {
            read: false,
            write: true,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
        }
    }

    pub fn is_none(self) -> bool { !self.read && !self.write }
    pub fn is_read_only(self) -> bool { self.read && !self.write }
    pub fn is_write_only(self) -> bool { !self.read && self.write }
    pub fn is_read_write(self) -> bool { self.read && self.write }
}

impl ops::Not for IoType {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self {
            read: !self.read,
            write: !self.write,
        }
    }
}

impl Display for IoType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("none")
        } else if self.is_read_write() {
            f.write_str("read-write")
        } else if self.read {
            f.write_str("read")
        } else if self.write {
            f.write_str("write")
        } else {
            unreachable!()
        }
    }
}

/// Failure condition reported by the poller for a single file descriptor,
/// delivered to the registered file-event callback instead of a readiness set.
#[derive(Copy, Clone, Debug, Display, Error)]
#[display(doc_comments)]
pub enum IoFail {
    /// connection is absent (POSIX events {0:#b})
    Connectivity(i16),
    /// OS-level error (POSIX events {0:#b})
    Os(i16),
}

/// I/O readiness backend driving the event loop.
///
/// Abstracts the concrete OS polling mechanism so the loop core never touches
/// it directly; swapping the syscall means providing another `Poll`
/// implementation. Readiness collected by [`Poll::poll`] is retrieved with
/// [`Poll::next_event`] one entry at a time, which keeps the backend usable
/// while file-event callbacks re-enter the registration methods.
pub trait Poll {
    /// Waker type awaking the poll from other threads.
    type Waker: Waker;

    /// Registers a file descriptor with an initial interest set.
    fn register(&mut self, fd: RawFd, interest: IoType);

    /// Removes a file descriptor from the poll set.
    fn unregister(&mut self, fd: RawFd);

    /// Replaces the interest set for an already registered file descriptor.
    fn set_interest(&mut self, fd: RawFd, interest: IoType) -> bool;

    /// Blocks for up to `timeout` waiting for readiness on the registered
    /// descriptors.
    ///
    /// # Returns
    ///
    /// Number of newly collected readiness events; zero signals a timeout.
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize>;

    /// Pops the next readiness event collected by the last [`Poll::poll`]
    /// call.
    fn next_event(&mut self) -> Option<(RawFd, Result<IoType, IoFail>)>;
}

/// Waker awaking the dispatcher event loop.
///
/// The receiving part is polled by the dispatcher thread as one more file
/// descriptor; the sending part is cloned into cross-thread handles.
pub trait Waker: Send {
    /// Type for the sender part of the waker.
    type Send: WakerSend;
    /// Type for the receiver part of the waker.
    type Recv: WakerRecv;

    /// Constructs pair of waker sender and receiver parts.
    fn pair() -> Result<(Self::Send, Self::Recv), io::Error>;
}

/// Sending part of the waker, used from any thread.
pub trait WakerSend: Send + Sync + Clone {
    /// Awakes the dispatcher thread blocked on the poll.
    fn wake(&self) -> io::Result<()>;
}

/// Receiving part of the waker, owned and reset by the dispatcher thread.
pub trait WakerRecv: AsRawFd + Send {
    /// Drains the wakeup notification so the poll can block again.
    fn reset(&self);
}
