use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use crate::poller::{IoFail, IoType, Poll, Waker, WakerRecv, WakerSend};

/// Poll backend for the dispatcher event loop based on the [`popol`] library.
pub struct Poller {
    poll: popol::Poll<RawFd>,
    events: VecDeque<(RawFd, Result<IoType, IoFail>)>,
}

impl Poller {
    pub fn new() -> Self {
        Self {
            poll: popol::Poll::new(),
            events: empty!(),
        }
    }
}

impl Default for Poller {
    fn default() -> Self { Poller::new() }
}

impl Poll for Poller {
    type Waker = PopolWaker;

    fn register(&mut self, fd: RawFd, interest: IoType) {
        #[cfg(feature = "log")]
        log::trace!(target: "dispatcher-poll", "Registering {fd}");
        self.poll.register(fd, &fd, interest.into());
    }

    fn unregister(&mut self, fd: RawFd) {
        #[cfg(feature = "log")]
        log::trace!(target: "dispatcher-poll", "Unregistering {fd}");
        self.poll.unregister(&fd);
    }

    fn set_interest(&mut self, fd: RawFd, interest: IoType) -> bool {
        #[cfg(feature = "log")]
        log::trace!(target: "dispatcher-poll", "Setting interest `{interest}` on {fd}");

        self.poll.unset(&fd, (!interest).into());
        self.poll.set(&fd, interest.into())
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let len = self.events.len();

        #[cfg(feature = "log")]
        log::trace!(target: "dispatcher-poll",
            "Polling {} descriptors with timeout {timeout:?} (pending event queue is {len})",
            self.poll.len(),
        );

        // Blocking call
        if self.poll.wait_timeout(timeout.into())? {
            #[cfg(feature = "log")]
            log::trace!(target: "dispatcher-poll", "Poll timed out with zero events generated");
            return Ok(0);
        }

        for (fd, fired) in self.poll.events() {
            let res = if fired.has_hangup() {
                Err(IoFail::Connectivity(fired.fired_events()))
            } else if fired.is_err() {
                Err(IoFail::Os(fired.fired_events()))
            } else {
                Ok(IoType {
                    read: fired.is_readable(),
                    write: fired.is_writable(),
                })
            };
            #[cfg(feature = "log")]
            log::trace!(target: "dispatcher-poll", "Got `{res:?}` for {fd}");
            self.events.push_back((*fd, res))
        }

        Ok(self.events.len() - len)
    }

    fn next_event(&mut self) -> Option<(RawFd, Result<IoType, IoFail>)> {
        self.events.pop_front()
    }
}

impl From<IoType> for popol::PollEvents {
    fn from(ev: IoType) -> Self {
        let mut e = popol::event::NONE;
        if ev.read {
            e |= popol::event::READ;
        }
        if ev.write {
            e |= popol::event::WRITE;
        }
        e
    }
}

/// Waker built from the [`popol`] waker object shared between its sending and
/// receiving parts.
#[derive(Clone)]
pub struct PopolWaker(Arc<popol::Waker>);

impl Waker for PopolWaker {
    type Send = Self;
    type Recv = Self;

    fn pair() -> Result<(Self::Send, Self::Recv), io::Error> {
        let waker = Arc::new(popol::Waker::new()?);
        Ok((Self(waker.clone()), Self(waker)))
    }
}

impl WakerSend for PopolWaker {
    fn wake(&self) -> io::Result<()> { self.0.wake() }
}

impl WakerRecv for PopolWaker {
    fn reset(&self) {
        if let Err(err) = popol::Waker::reset(self.0.as_ref()) {
            #[cfg(feature = "log")]
            log::error!(target: "dispatcher-poll", "Unable to reset waker: {err}");
            #[cfg(not(feature = "log"))]
            let _ = err;
        }
    }
}

impl AsRawFd for PopolWaker {
    fn as_raw_fd(&self) -> RawFd { self.0.as_raw_fd() }
}
