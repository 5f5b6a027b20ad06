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

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::deferred::{DeferredDeletable, DeferredDeleteQueue};
use crate::poller::{IoFail, IoType, Poll, Waker, WakerRecv};
use crate::post::{PostQueue, Poster};
use crate::stats::{DispatcherStats, Scope};
use crate::timer::{Timer, TimerQueue};

/// Maximum amount of time to wait for I/O when no timer bounds the wait.
const WAIT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Loop execution mode for [`Dispatcher::run`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RunType {
    /// Run the loop until [`Dispatcher::exit`] is requested.
    Block,
    /// Perform exactly one loop pass and return.
    NonBlock,
}

pub(crate) struct FileEventState {
    fd: RawFd,
    callback: RefCell<Option<Box<dyn FnMut(Result<IoType, IoFail>)>>>,
}

impl FileEventState {
    fn invoke(&self, res: Result<IoType, IoFail>) {
        // The callback slot is vacated for the duration of the call so the
        // callback may drop its own registration handle.
        let cb = self.callback.borrow_mut().take();
        if let Some(mut cb) = cb {
            cb(res);
            *self.callback.borrow_mut() = Some(cb);
        }
    }
}

pub(crate) struct IoRegistry<P: Poll> {
    poller: RefCell<P>,
    events: RefCell<HashMap<RawFd, Weak<FileEventState>>>,
}

/// Registration of a file descriptor with the dispatcher's poll backend.
///
/// The callback is invoked on the dispatcher thread with each readiness
/// report (or per-descriptor failure) for the descriptor. Dropping the handle
/// unregisters the descriptor; doing so from inside the callback itself is
/// supported.
pub struct FileEvent<P: Poll> {
    state: Rc<FileEventState>,
    io: Rc<IoRegistry<P>>,
}

impl<P: Poll> FileEvent<P> {
    /// Replaces the set of I/O operations the callback is notified about.
    pub fn set_interest(&self, interest: IoType) {
        self.io.poller.borrow_mut().set_interest(self.state.fd, interest);
    }

    pub fn fd(&self) -> RawFd { self.state.fd }
}

impl<P: Poll> Drop for FileEvent<P> {
    fn drop(&mut self) {
        self.io.events.borrow_mut().remove(&self.state.fd);
        self.io.poller.borrow_mut().unregister(self.state.fd);
    }
}

/// Single-threaded event loop driving one worker thread of a proxy.
///
/// Owns the poll backend, the armed-timer set, the deferred-delete list and
/// the cross-thread post queue. All methods except posting are bound to the
/// thread the dispatcher was created on; the type is `!Send`, so the compiler
/// rejects foreign-thread use. Cross-thread work is submitted through the
/// [`Poster`] handle returned by [`Dispatcher::poster`].
///
/// One loop pass services ready I/O, then fires all due timers, then drains
/// one batch of posted callbacks, then clears the deferred-delete list.
pub struct Dispatcher<P: Poll> {
    io: Rc<IoRegistry<P>>,
    timers: Rc<TimerQueue>,
    posts: Arc<PostQueue>,
    waker: <P::Waker as Waker>::Send,
    waker_recv: <P::Waker as Waker>::Recv,
    deferred: DeferredDeleteQueue,
    exit_requested: Cell<bool>,
    running: Cell<bool>,
    stats: RefCell<Option<DispatcherStats>>,
}

impl<P: Poll> Dispatcher<P> {
    /// Creates a dispatcher around the provided poll backend.
    ///
    /// # Error
    ///
    /// Errors with a system/OS error if the waker pair can't be constructed.
    pub fn new(mut poller: P) -> io::Result<Self> {
        let (waker, waker_recv) = P::Waker::pair()?;

        #[cfg(feature = "log")]
        log::debug!(target: "dispatcher", "Registering waker (fd {})", waker_recv.as_raw_fd());
        poller.register(waker_recv.as_raw_fd(), IoType::read_only());

        Ok(Dispatcher {
            io: Rc::new(IoRegistry {
                poller: RefCell::new(poller),
                events: empty!(),
            }),
            timers: Rc::new(TimerQueue::default()),
            posts: Arc::new(PostQueue::default()),
            waker,
            waker_recv,
            deferred: DeferredDeleteQueue::default(),
            exit_requested: Cell::new(false),
            running: Cell::new(false),
            stats: RefCell::new(None),
        })
    }

    /// Allocates a new, initially disabled [`Timer`] bound to this
    /// dispatcher's clock and wakeup mechanism. No side effects until the
    /// timer is enabled.
    pub fn create_timer(&self, callback: impl FnMut() + 'static) -> Timer {
        Timer::new(self.timers.clone(), Box::new(callback))
    }

    /// Registers `fd` with the poll backend and binds `callback` to its
    /// readiness reports.
    pub fn create_file_event(
        &self,
        fd: RawFd,
        interest: IoType,
        callback: impl FnMut(Result<IoType, IoFail>) + 'static,
    ) -> FileEvent<P> {
        #[cfg(feature = "log")]
        log::debug!(target: "dispatcher", "Registering file event for {fd} with interest `{interest}`");

        let state = Rc::new(FileEventState {
            fd,
            callback: RefCell::new(Some(Box::new(callback))),
        });
        self.io.events.borrow_mut().insert(fd, Rc::downgrade(&state));
        self.io.poller.borrow_mut().register(fd, interest);
        FileEvent {
            state,
            io: self.io.clone(),
        }
    }

    /// Provides a [`Poster`] handle for submitting callbacks to this
    /// dispatcher from other threads.
    pub fn poster(&self) -> Poster<<P::Waker as Waker>::Send> {
        Poster {
            queue: self.posts.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Appends the callback to the post queue for execution on the loop
    /// thread. Equivalent to posting through a [`Poster`] handle.
    pub fn post(&self, callback: impl FnOnce() + Send + 'static) { self.poster().post(callback) }

    /// Transfers ownership of `item` into the deferred-delete list. The item
    /// stays alive until the next [`Dispatcher::clear_deferred_delete_list`]
    /// call, performed by the loop at the end of the current iteration at the
    /// latest.
    pub fn deferred_delete(&self, item: Box<dyn DeferredDeletable>) {
        #[cfg(feature = "log")]
        log::trace!(target: "dispatcher", "Item moved to the deferred-delete list");
        self.deferred.push(item);
    }

    /// Destroys the items enqueued before this call was entered. Items
    /// enqueued by their destructors are preserved for the following call.
    pub fn clear_deferred_delete_list(&self) { self.deferred.clear(); }

    /// Requests the blocking loop to stop after completing its current
    /// iteration. Never interrupts an in-flight callback.
    pub fn exit(&self) {
        #[cfg(feature = "log")]
        log::debug!(target: "dispatcher", "Dispatcher exit requested");
        self.exit_requested.set(true);
    }

    /// Attaches the loop latency histograms described in the module docs:
    /// `<prefix>loop_duration_us` and `<prefix>poll_delay_us`. Must be called
    /// at most once; without it the loop performs no latency measurement.
    pub fn initialize_stats(&self, scope: &dyn Scope, prefix: &str) {
        let mut stats = self.stats.borrow_mut();
        debug_assert!(stats.is_none(), "dispatcher stats are initialized twice");
        *stats = Some(DispatcherStats::new(scope, prefix));
    }

    /// Executes the event loop. Callable only on the thread owning the
    /// dispatcher; reentrant calls are a contract violation.
    pub fn run(&self, run_type: RunType) {
        debug_assert!(!self.running.get(), "reentrant Dispatcher::run");
        self.running.set(true);
        match run_type {
            RunType::Block => {
                #[cfg(feature = "log")]
                log::info!(target: "dispatcher", "Entering dispatcher event loop");
                while !self.exit_requested.get() {
                    self.run_once(true);
                }
                #[cfg(feature = "log")]
                log::info!(target: "dispatcher", "Dispatcher event loop has stopped");
            }
            RunType::NonBlock => self.run_once(false),
        }
        self.running.set(false);
    }

    fn run_once(&self, blocking: bool) {
        let iteration_start = Instant::now();
        let timeout = if blocking {
            self.timers
                .next_timeout(iteration_start)
                .map_or(WAIT_TIMEOUT, |until_deadline| until_deadline.min(WAIT_TIMEOUT))
        } else {
            Duration::ZERO
        };

        // Blocking
        let res = self.io.poller.borrow_mut().poll(Some(timeout));
        let now = Instant::now();

        if let Some(stats) = self.stats.borrow().as_ref() {
            stats.record_poll_delay(now.saturating_duration_since(iteration_start + timeout));
        }

        match res {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                #[cfg(feature = "log")]
                log::error!(target: "dispatcher", "Error during polling: {err}");
            }
        }

        self.service_io_events();
        self.fire_due_timers(now);
        self.run_post_callbacks();
        self.clear_deferred_delete_list();

        if let Some(stats) = self.stats.borrow().as_ref() {
            stats.record_loop_duration(iteration_start.elapsed());
        }
    }

    fn service_io_events(&self) {
        loop {
            // The poller borrow must not survive into the callback: handlers
            // re-enter registration methods.
            let event = self.io.poller.borrow_mut().next_event();
            let (fd, res) = match event {
                Some(event) => event,
                None => break,
            };
            if fd == self.waker_recv.as_raw_fd() {
                #[cfg(feature = "log")]
                log::trace!(target: "dispatcher", "Awoken by the waker");
                self.waker_recv.reset();
                continue;
            }
            let state = self.io.events.borrow().get(&fd).and_then(Weak::upgrade);
            match state {
                Some(state) => state.invoke(res),
                None => {
                    #[cfg(feature = "log")]
                    log::warn!(target: "dispatcher", "Readiness event for unknown descriptor {fd}");
                }
            }
        }
    }

    fn fire_due_timers(&self, now: Instant) {
        for timer in self.timers.expire(now) {
            #[cfg(feature = "log")]
            log::trace!(target: "dispatcher", "Timer has fired");
            timer.fire();
        }
    }

    fn run_post_callbacks(&self) {
        let batch = self.posts.drain();
        #[cfg(feature = "log")]
        log::trace!(target: "dispatcher", "Draining {} posted callback(s)", batch.len());
        for callback in batch {
            callback();
        }
    }
}

#[cfg(all(test, feature = "popol"))]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;

    use super::*;
    use crate::poller::popol::{Poller, PopolWaker};
    use crate::stats::Histogram;

    const KEEPALIVE: Duration = Duration::from_millis(25);

    fn dispatcher() -> Dispatcher<Poller> { Dispatcher::new(Poller::new()).expect("waker pair") }

    /// Dispatcher running `RunType::Block` on its own thread, kept alive by a
    /// self-re-arming timer which also carries the stop request.
    struct LoopThread {
        poster: Poster<PopolWaker>,
        stop: Arc<AtomicBool>,
        thread: thread::JoinHandle<()>,
    }

    impl LoopThread {
        fn spawn() -> Self {
            let stop = Arc::new(AtomicBool::new(false));
            let stop_flag = stop.clone();
            let (tx, rx) = crossbeam_channel::bounded(1);
            let thread = thread::spawn(move || {
                let dispatcher = Rc::new(dispatcher());
                let keepalive: Rc<RefCell<Option<Timer>>> = Rc::new(RefCell::new(None));
                let slot = keepalive.clone();
                let looper = dispatcher.clone();
                let timer = dispatcher.create_timer(move || {
                    if stop_flag.load(Ordering::SeqCst) {
                        looper.exit();
                        // drop the self-referential timer so nothing leaks
                        slot.borrow_mut().take();
                    } else if let Some(timer) = slot.borrow().as_ref() {
                        timer.enable_timer(KEEPALIVE);
                    }
                });
                timer.enable_timer(KEEPALIVE);
                *keepalive.borrow_mut() = Some(timer);

                tx.send(dispatcher.poster()).expect("test thread is waiting");
                dispatcher.run(RunType::Block);
            });
            let poster = rx.recv().expect("loop thread started");
            LoopThread {
                poster,
                stop,
                thread,
            }
        }

        fn join(self) {
            self.stop.store(true, Ordering::SeqCst);
            self.poster.post(|| {});
            self.thread.join().expect("loop thread panicked");
        }
    }

    #[test]
    fn timer_enabled_disabled() {
        let dispatcher = dispatcher();
        let timer = dispatcher.create_timer(|| {});
        assert!(!timer.enabled());
        timer.enable_timer(Duration::ZERO);
        assert!(timer.enabled());
        dispatcher.run(RunType::NonBlock);
        assert!(!timer.enabled());
    }

    #[test]
    fn timer_fires_once() {
        let dispatcher = dispatcher();
        let fired = Rc::new(Cell::new(0u32));
        let counter = fired.clone();
        let timer = dispatcher.create_timer(move || counter.set(counter.get() + 1));

        timer.enable_timer(Duration::from_millis(10));
        thread::sleep(Duration::from_millis(20));
        dispatcher.run(RunType::NonBlock);
        assert_eq!(fired.get(), 1);

        // One-shot: no further firing without a re-arm.
        dispatcher.run(RunType::NonBlock);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn due_timers_fire_before_posted_batch() {
        let dispatcher = dispatcher();
        let order = Arc::new(Mutex::new(Vec::new()));

        let posted = order.clone();
        dispatcher.post(move || posted.lock().unwrap().push("post"));
        let timed = order.clone();
        let timer = dispatcher.create_timer(move || timed.lock().unwrap().push("timer"));
        timer.enable_timer(Duration::ZERO);

        dispatcher.run(RunType::NonBlock);
        assert_eq!(*order.lock().unwrap(), ["timer", "post"]);
    }

    struct RingOnDrop {
        bell: Rc<Cell<u32>>,
    }

    impl DeferredDeletable for RingOnDrop {}

    impl Drop for RingOnDrop {
        fn drop(&mut self) { self.bell.set(self.bell.get() + 1) }
    }

    struct NestedDelete {
        bell: Rc<Cell<u32>>,
        next_bell: Rc<Cell<u32>>,
        dispatcher: Rc<Dispatcher<Poller>>,
    }

    impl DeferredDeletable for NestedDelete {}

    impl Drop for NestedDelete {
        fn drop(&mut self) {
            self.bell.set(self.bell.get() + 1);
            self.dispatcher.deferred_delete(Box::new(RingOnDrop {
                bell: self.next_bell.clone(),
            }));
            // An inline clear from a destructor chain must do nothing.
            self.dispatcher.clear_deferred_delete_list();
        }
    }

    #[test]
    fn deferred_delete_generations() {
        let dispatcher = Rc::new(dispatcher());
        let bell1 = Rc::new(Cell::new(0));
        let bell2 = Rc::new(Cell::new(0));
        let bell3 = Rc::new(Cell::new(0));

        dispatcher.deferred_delete(Box::new(RingOnDrop {
            bell: bell1.clone(),
        }));
        assert_eq!(bell1.get(), 0);
        dispatcher.clear_deferred_delete_list();
        assert_eq!(bell1.get(), 1);

        dispatcher.deferred_delete(Box::new(NestedDelete {
            bell: bell2.clone(),
            next_bell: bell3.clone(),
            dispatcher: dispatcher.clone(),
        }));
        dispatcher.clear_deferred_delete_list();
        assert_eq!(bell2.get(), 1);
        assert_eq!(bell3.get(), 0);

        dispatcher.clear_deferred_delete_list();
        assert_eq!(bell3.get(), 1);
    }

    #[test]
    fn nonblock_pass_clears_deferred_list() {
        let dispatcher = dispatcher();
        let bell = Rc::new(Cell::new(0));
        dispatcher.deferred_delete(Box::new(RingOnDrop { bell: bell.clone() }));
        dispatcher.run(RunType::NonBlock);
        assert_eq!(bell.get(), 1);
    }

    #[test]
    fn post_runs_on_loop_thread_exactly_once() {
        let lt = LoopThread::spawn();
        let ran = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = crossbeam_channel::bounded(1);

        let counter = ran.clone();
        lt.poster.post(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            tx.send(thread::current().id()).unwrap();
        });

        let loop_tid = rx.recv_timeout(Duration::from_secs(5)).expect("posted callback ran");
        assert_eq!(loop_tid, lt.thread.thread().id());
        assert_ne!(loop_tid, thread::current().id());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        lt.join();
    }

    #[test]
    fn posts_preserve_submission_order() {
        let lt = LoopThread::spawn();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            lt.poster.post(move || order.lock().unwrap().push(i));
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        lt.poster.post(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).expect("posted callbacks ran");
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        lt.join();
    }

    struct PostOnDestruct {
        poster: Poster<PopolWaker>,
        tx: crossbeam_channel::Sender<()>,
    }

    impl Drop for PostOnDestruct {
        fn drop(&mut self) {
            let tx = self.tx.clone();
            self.poster.post(move || {
                tx.send(()).ok();
            });
        }
    }

    // A posted callback whose captured state re-enters `post` on destruction
    // must complete without deadlock, and the re-posted callback must run in
    // a subsequent drain.
    #[test]
    fn post_during_callback_destruction() {
        let lt = LoopThread::spawn();
        let (tx, rx) = crossbeam_channel::bounded(1);

        let guard = PostOnDestruct {
            poster: lt.poster.clone(),
            tx,
        };
        lt.poster.post(move || drop(guard));

        rx.recv_timeout(Duration::from_secs(5)).expect("re-posted callback ran");
        lt.join();
    }

    #[test]
    fn file_event_reports_readable() {
        let dispatcher = dispatcher();
        let (mut writer, reader) = UnixStream::pair().expect("socketpair");
        reader.set_nonblocking(true).expect("nonblocking");

        let readable = Rc::new(Cell::new(false));
        let flag = readable.clone();
        let event =
            dispatcher.create_file_event(reader.as_raw_fd(), IoType::read_only(), move |res| {
                if let Ok(io) = res {
                    flag.set(io.read);
                }
            });

        writer.write_all(b"ping").expect("write side is open");
        dispatcher.run(RunType::NonBlock);
        assert!(readable.get());
        drop(event);
    }

    // A protocol sniffer reads until satisfied and then detaches by dropping
    // its registration from inside the callback.
    #[test]
    fn file_event_detaches_from_own_callback() {
        let dispatcher = dispatcher();
        let (mut writer, reader) = UnixStream::pair().expect("socketpair");
        reader.set_nonblocking(true).expect("nonblocking");

        let invoked = Rc::new(Cell::new(0u32));
        let slot: Rc<RefCell<Option<FileEvent<Poller>>>> = Rc::new(RefCell::new(None));
        let counter = invoked.clone();
        let detach = slot.clone();
        let event =
            dispatcher.create_file_event(reader.as_raw_fd(), IoType::read_only(), move |_| {
                counter.set(counter.get() + 1);
                detach.borrow_mut().take();
            });
        *slot.borrow_mut() = Some(event);

        writer.write_all(b"ping").expect("write side is open");
        dispatcher.run(RunType::NonBlock);
        assert_eq!(invoked.get(), 1);
        assert!(slot.borrow().is_none());

        writer.write_all(b"pong").expect("write side is open");
        dispatcher.run(RunType::NonBlock);
        assert_eq!(invoked.get(), 1, "detached event must not fire again");
    }

    #[derive(Default)]
    struct RecordingScope {
        names: RefCell<Vec<String>>,
        records: Arc<AtomicUsize>,
    }

    struct CountingHistogram(Arc<AtomicUsize>);

    impl Histogram for CountingHistogram {
        fn record_value(&self, _value: u64) { self.0.fetch_add(1, Ordering::SeqCst); }
    }

    impl Scope for RecordingScope {
        fn histogram(&self, name: &str) -> Box<dyn Histogram> {
            self.names.borrow_mut().push(name.to_owned());
            Box::new(CountingHistogram(self.records.clone()))
        }
    }

    #[test]
    fn initialize_stats_registers_series() {
        let dispatcher = dispatcher();
        let scope = RecordingScope::default();
        dispatcher.initialize_stats(&scope, "test.dispatcher.");
        assert_eq!(*scope.names.borrow(), [
            "test.dispatcher.loop_duration_us",
            "test.dispatcher.poll_delay_us"
        ]);

        dispatcher.run(RunType::NonBlock);
        assert_eq!(scope.records.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn exit_before_block_run_returns_immediately() {
        let dispatcher = dispatcher();
        dispatcher.exit();
        dispatcher.run(RunType::Block);
    }

    #[test]
    fn rearm_from_own_callback() {
        let dispatcher = Rc::new(dispatcher());
        let fired = Rc::new(Cell::new(0u32));
        let slot: Rc<RefCell<Option<Timer>>> = Rc::new(RefCell::new(None));

        let counter = fired.clone();
        let rearm = slot.clone();
        let looper = dispatcher.clone();
        let timer = dispatcher.create_timer(move || {
            counter.set(counter.get() + 1);
            if counter.get() < 3 {
                if let Some(timer) = rearm.borrow().as_ref() {
                    timer.enable_timer(Duration::ZERO);
                }
            } else {
                looper.exit();
                rearm.borrow_mut().take();
            }
        });
        timer.enable_timer(Duration::ZERO);
        *slot.borrow_mut() = Some(timer);

        dispatcher.run(RunType::Block);
        assert_eq!(fired.get(), 3);
    }
}
