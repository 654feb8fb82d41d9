//! Event base: registration tables, timers, signals and the dispatch loop.
//!
//! ```text
//!   Event handles (slot, generation)
//!        |
//!        v
//!   +-------------------------------------------------------+
//!   | EventBase                                             |
//!   |   slot table ---- fd map ---- timer heap ---- signals |
//!   |                      \            |            /      |
//!   |                       +------ backend --------+       |
//!   |                       |  "polling" | "poll"   |       |
//!   +-------------------------------------------------------+
//!        |
//!        v
//!   active queues (one per priority) -> callbacks
//! ```
//!
//! # Dispatch
//!
//! Each loop iteration: compute the earliest deadline, poll the backend no
//! longer than that, promote ready descriptors and expired timers into the
//! active queues, then drain the highest-priority non-empty queue. Lower
//! priorities wait for the next iteration, which polls with a zero timeout
//! while anything is still queued, so fresh high-priority work can overtake
//! them.
//!
//! # Key Types
//!
//! | Type | Role |
//! |-------------|---------------------------------------------|
//! | [`EventBase`] | owns all tables; runs the loop |
//! | [`LoopFlags`] | per-run behavior (once, nonblock, ...) |
//! | [`ExitReason`] | why a run returned |
//!
//! Callbacks run to completion; everything is single-threaded. A callback
//! may add, remove or free any event, including its own, and may stop or
//! break the loop.
//!
//! Handles hold the base weakly, but a user callback that captures its own
//! `EventBase` keeps the base alive for as long as the event is registered.
//! Free the event (or capture a clone of nothing heavier than what the
//! callback needs) to break such cycles.

mod backend;
mod pollfd;
mod poller;
mod signal;
mod timer;

use crate::config::{BaseFlags, Config, DispatchLimit, Features};
use crate::error::{Error, RegistrationError, Result};
use crate::event::{Event, EventCallback, What};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::os::raw::c_int;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant, SystemTime};

use backend::{Backend, Ready, ReadyEvent};
use signal::SignalTable;
use timer::TimerHeap;

/// Per-run behavior flags for [`EventBase::run`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LoopFlags(u8);

impl LoopFlags {
    /// Block until told to stop or until no events remain.
    pub const NONE: Self = Self(0);
    /// Return after the first batch of callbacks has run.
    pub const ONCE: Self = Self(0x01);
    /// Poll once without blocking, run whatever is ready, return.
    pub const NONBLOCK: Self = Self(0x02);
    /// Keep blocking for new work instead of returning when no events
    /// remain.
    pub const NO_EXIT_ON_EMPTY: Self = Self(0x04);

    /// True when every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    #[must_use]
    pub const fn add(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for LoopFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.add(rhs)
    }
}

impl fmt::Debug for LoopFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "LoopFlags(NONE)");
        }
        let mut first = true;
        write!(f, "LoopFlags(")?;
        for (bit, name) in [
            (Self::ONCE, "ONCE"),
            (Self::NONBLOCK, "NONBLOCK"),
            (Self::NO_EXIT_ON_EMPTY, "NO_EXIT_ON_EMPTY"),
        ] {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        write!(f, ")")
    }
}

/// Why [`EventBase::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// No pending or active events remained.
    Done,
    /// [`EventBase::request_stop`] ended the loop after a callback batch.
    Stopped,
    /// [`EventBase::break_loop`] aborted the loop mid-batch.
    Broken,
}

/// What a registration watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventKind {
    Io(RawFd),
    Signal(c_int),
    Timer,
}

struct EventState {
    kind: EventKind,
    what: What,
    priority: usize,
    pending: bool,
    /// Interval to re-arm on each fire of a persistent event.
    requested_timeout: Option<Duration>,
    /// Nonzero while a deadline is armed; pairs with heap entries.
    timer_epoch: u64,
    queued: bool,
    active_what: What,
    /// Taken out of the slot while the callback runs.
    callback: Option<EventCallback>,
}

struct EventSlot {
    gen: u64,
    state: Option<EventState>,
}

/// All events watching one descriptor, folded into a single backend
/// registration.
#[derive(Default)]
struct FdWatch {
    readers: SmallVec<[usize; 2]>,
    writers: SmallVec<[usize; 2]>,
    edge: bool,
}

impl FdWatch {
    fn ready_mask(&self) -> Ready {
        let mut ready = Ready::NONE;
        if !self.readers.is_empty() {
            ready |= Ready::READABLE;
        }
        if !self.writers.is_empty() {
            ready |= Ready::WRITABLE;
        }
        ready
    }
}

pub(crate) struct BaseInner {
    backend: Box<dyn Backend>,
    config: Config,
    slots: Vec<EventSlot>,
    free_slots: Vec<usize>,
    fd_map: HashMap<RawFd, FdWatch>,
    timers: TimerHeap,
    signals: SignalTable,
    active: Vec<VecDeque<(usize, u64)>>,
    deferred: VecDeque<Box<dyn FnOnce()>>,
    flags: BaseFlags,
    limit: DispatchLimit,
    cached_instant: Instant,
    cached_wall: SystemTime,
    timer_seq: u64,
    pending_events: usize,
    running: bool,
    stop_now: bool,
    break_now: bool,
    stop_at: Option<Instant>,
    got_stop: bool,
    got_break: bool,
    poll_buf: Vec<ReadyEvent>,
}

impl BaseInner {
    pub(crate) fn register(
        &mut self,
        kind: EventKind,
        what: What,
        callback: EventCallback,
    ) -> std::result::Result<(usize, u64), RegistrationError> {
        if what.is_edge_triggered() {
            let EventKind::Io(fd) = kind else {
                return Err(RegistrationError::InvalidMask(
                    "ET applies only to descriptor events",
                ));
            };
            if !self.backend.features().contains(Features::ET) {
                return Err(RegistrationError::Backend {
                    fd,
                    message: format!(
                        "backend \"{}\" lacks edge-triggered support",
                        self.backend.name()
                    ),
                });
            }
        }
        let state = EventState {
            kind,
            what,
            priority: self.active.len() / 2,
            pending: false,
            requested_timeout: None,
            timer_epoch: 0,
            queued: false,
            active_what: What::NONE,
            callback: Some(callback),
        };
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot].state = Some(state);
                slot
            }
            None => {
                self.slots.push(EventSlot {
                    gen: 1,
                    state: Some(state),
                });
                self.slots.len() - 1
            }
        };
        Ok((slot, self.slots[slot].gen))
    }

    pub(crate) fn event_add(
        &mut self,
        slot: usize,
        gen: u64,
        timeout: Option<Duration>,
    ) -> std::result::Result<(), RegistrationError> {
        self.check_handle(slot, gen)?;
        let (kind, what, pending) = {
            let Some(st) = self.slots[slot].state.as_ref() else {
                return Err(RegistrationError::Stale);
            };
            (st.kind, st.what, st.pending)
        };
        if !pending {
            match kind {
                EventKind::Io(fd) => self.fd_watch_add(fd, slot, what)?,
                EventKind::Signal(signum) => self.signal_watch_add(signum, slot)?,
                EventKind::Timer => {}
            }
            if let Some(st) = self.slots[slot].state.as_mut() {
                st.pending = true;
            }
            self.pending_events += 1;
        }
        if let Some(interval) = timeout {
            self.arm_timer(slot, interval);
            if let Some(st) = self.slots[slot].state.as_mut() {
                st.requested_timeout = Some(interval);
            }
        } else if !pending {
            if let Some(st) = self.slots[slot].state.as_mut() {
                st.requested_timeout = None;
            }
        }
        Ok(())
    }

    pub(crate) fn event_del(
        &mut self,
        slot: usize,
        gen: u64,
    ) -> std::result::Result<(), RegistrationError> {
        self.check_handle(slot, gen)?;
        self.deactivate(slot);
        self.make_nonpending(slot);
        Ok(())
    }

    pub(crate) fn event_free(&mut self, slot: usize, gen: u64) {
        if self.check_handle(slot, gen).is_err() {
            return;
        }
        self.deactivate(slot);
        self.make_nonpending(slot);
        let entry = &mut self.slots[slot];
        entry.gen += 1;
        entry.state = None;
        self.free_slots.push(slot);
    }

    pub(crate) fn event_is_pending(&self, slot: usize, gen: u64, what: What) -> bool {
        let Some(st) = self
            .slots
            .get(slot)
            .filter(|entry| entry.gen == gen)
            .and_then(|entry| entry.state.as_ref())
        else {
            return false;
        };
        let mut bits = st.active_what;
        if st.pending {
            bits = bits.add(st.what.remove(What::TIMEOUT | What::PERSIST | What::ET));
            if st.timer_epoch != 0 {
                bits |= What::TIMEOUT;
            }
        }
        bits.intersects(what)
    }

    pub(crate) fn event_set_priority(
        &mut self,
        slot: usize,
        gen: u64,
        priority: usize,
    ) -> std::result::Result<(), RegistrationError> {
        self.check_handle(slot, gen)?;
        if priority >= self.active.len() {
            return Err(RegistrationError::PriorityRange {
                priority,
                levels: self.active.len(),
            });
        }
        let Some(st) = self.slots[slot].state.as_mut() else {
            return Err(RegistrationError::Stale);
        };
        if st.queued {
            return Err(RegistrationError::Pending);
        }
        st.priority = priority;
        Ok(())
    }

    pub(crate) fn event_activate(
        &mut self,
        slot: usize,
        gen: u64,
        what: What,
    ) -> std::result::Result<(), RegistrationError> {
        self.check_handle(slot, gen)?;
        self.activate(slot, what.remove(What::PERSIST | What::ET));
        Ok(())
    }

    fn check_handle(&self, slot: usize, gen: u64) -> std::result::Result<(), RegistrationError> {
        match self.slots.get(slot) {
            Some(entry) if entry.gen == gen && entry.state.is_some() => Ok(()),
            _ => Err(RegistrationError::Stale),
        }
    }

    fn fd_watch_add(
        &mut self,
        fd: RawFd,
        slot: usize,
        what: What,
    ) -> std::result::Result<(), RegistrationError> {
        if !what.intersects(What::READ | What::WRITE) {
            // Timeout-only registration on a descriptor; nothing to watch.
            return Ok(());
        }
        let wants_edge = what.is_edge_triggered();
        if let Some(watch) = self.fd_map.get_mut(&fd) {
            if watch.edge != wants_edge {
                return Err(RegistrationError::EdgeConflict { fd });
            }
            let push_reader = what.is_read() && !watch.readers.contains(&slot);
            if push_reader {
                watch.readers.push(slot);
            }
            let push_writer = what.is_write() && !watch.writers.contains(&slot);
            if push_writer {
                watch.writers.push(slot);
            }
            let ready = watch.ready_mask();
            if let Err(error) = self.backend.modify(fd, ready, wants_edge) {
                if push_reader {
                    watch.readers.pop();
                }
                if push_writer {
                    watch.writers.pop();
                }
                return Err(RegistrationError::backend(fd, &error));
            }
        } else {
            let mut watch = FdWatch {
                edge: wants_edge,
                ..FdWatch::default()
            };
            if what.is_read() {
                watch.readers.push(slot);
            }
            if what.is_write() {
                watch.writers.push(slot);
            }
            self.backend
                .add(fd, watch.ready_mask(), wants_edge)
                .map_err(|error| RegistrationError::backend(fd, &error))?;
            self.fd_map.insert(fd, watch);
        }
        Ok(())
    }

    fn fd_watch_del(&mut self, fd: RawFd, slot: usize) {
        let Some(watch) = self.fd_map.get_mut(&fd) else {
            return;
        };
        watch.readers.retain(|s| *s != slot);
        watch.writers.retain(|s| *s != slot);
        let ready = watch.ready_mask();
        let edge = watch.edge;
        if ready.is_empty() {
            self.fd_map.remove(&fd);
            if let Err(error) = self.backend.delete(fd) {
                tracing::debug!(fd, %error, "backend delete failed; descriptor likely closed");
            }
        } else if let Err(error) = self.backend.modify(fd, ready, edge) {
            tracing::debug!(fd, %error, "backend modify failed during removal");
        }
    }

    fn signal_watch_add(
        &mut self,
        signum: c_int,
        slot: usize,
    ) -> std::result::Result<(), RegistrationError> {
        match self.signals.subscribe(signum, slot) {
            Ok(Some(read_fd)) => {
                if let Err(error) = self.backend.add(read_fd, Ready::READABLE, false) {
                    self.signals.unsubscribe(signum, slot);
                    return Err(RegistrationError::backend(signum, &error));
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(error) => Err(RegistrationError::backend(signum, &error)),
        }
    }

    fn signal_watch_del(&mut self, signum: c_int, slot: usize) {
        if let Some(read_fd) = self.signals.unsubscribe(signum, slot) {
            if let Err(error) = self.backend.delete(read_fd) {
                tracing::debug!(signum, %error, "signal pipe delete failed");
            }
        }
    }

    fn make_nonpending(&mut self, slot: usize) {
        let Some(st) = self.slots[slot].state.as_ref() else {
            return;
        };
        if !st.pending {
            return;
        }
        let kind = st.kind;
        match kind {
            EventKind::Io(fd) => self.fd_watch_del(fd, slot),
            EventKind::Signal(signum) => self.signal_watch_del(signum, slot),
            EventKind::Timer => {}
        }
        if let Some(st) = self.slots[slot].state.as_mut() {
            st.pending = false;
            st.timer_epoch = 0;
        }
        self.pending_events -= 1;
    }

    fn deactivate(&mut self, slot: usize) {
        if let Some(st) = self.slots[slot].state.as_mut() {
            st.queued = false;
            st.active_what = What::NONE;
        }
    }

    fn activate(&mut self, slot: usize, what: What) {
        if what.is_empty() {
            return;
        }
        let (priority, gen) = {
            let gen = self.slots[slot].gen;
            let Some(st) = self.slots[slot].state.as_mut() else {
                return;
            };
            st.active_what = st.active_what.add(what);
            if st.queued {
                return;
            }
            st.queued = true;
            (st.priority, gen)
        };
        let priority = priority.min(self.active.len().saturating_sub(1));
        self.active[priority].push_back((slot, gen));
    }

    fn arm_timer(&mut self, slot: usize, interval: Duration) {
        self.timer_seq += 1;
        let epoch = self.timer_seq;
        let deadline = self.mono_now() + interval;
        if let Some(st) = self.slots[slot].state.as_mut() {
            st.timer_epoch = epoch;
        }
        self.timers.insert(slot, epoch, deadline);
    }

    fn timer_epoch_live(&self, slot: usize, epoch: u64) -> bool {
        self.slots
            .get(slot)
            .and_then(|entry| entry.state.as_ref())
            .is_some_and(|st| st.timer_epoch == epoch)
    }

    fn prune_stale_timers(&mut self) {
        while let Some((slot, epoch, _)) = self.timers.peek() {
            if self.timer_epoch_live(slot, epoch) {
                break;
            }
            self.timers.pop();
        }
    }

    fn has_work(&self) -> bool {
        self.pending_events > 0
            || !self.deferred.is_empty()
            || self.stop_at.is_some()
            || self.active.iter().any(|q| !q.is_empty())
    }

    fn poll_timeout(&mut self) -> Option<Duration> {
        if !self.deferred.is_empty() || self.active.iter().any(|q| !q.is_empty()) {
            return Some(Duration::ZERO);
        }
        self.prune_stale_timers();
        let mut next = self.timers.peek_deadline();
        if let Some(at) = self.stop_at {
            next = Some(match next {
                Some(deadline) => deadline.min(at),
                None => at,
            });
        }
        next.map(|deadline| deadline.saturating_duration_since(self.cached_instant))
    }

    fn poll_and_activate(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        let mut buf = std::mem::take(&mut self.poll_buf);
        buf.clear();
        let result = self.backend.poll(&mut buf, timeout);
        if let Err(error) = result {
            self.poll_buf = buf;
            return Err(error);
        }
        for ready_event in &buf {
            let fd = ready_event.fd;
            if self.signals.owns_fd(fd) {
                if ready_event.ready.is_readable() {
                    if let Some((signum, slots)) = self.signals.drain(fd) {
                        tracing::trace!(signum, watchers = slots.len(), "signal delivered");
                        for slot in slots {
                            self.activate(slot, What::SIGNAL);
                        }
                    }
                }
                continue;
            }
            let Some(watch) = self.fd_map.get(&fd) else {
                continue;
            };
            let readers: SmallVec<[usize; 2]> = if ready_event.ready.is_readable() {
                watch.readers.clone()
            } else {
                SmallVec::new()
            };
            let writers: SmallVec<[usize; 2]> = if ready_event.ready.is_writable() {
                watch.writers.clone()
            } else {
                SmallVec::new()
            };
            for slot in readers {
                self.activate(slot, What::READ);
            }
            for slot in writers {
                self.activate(slot, What::WRITE);
            }
        }
        self.poll_buf = buf;
        Ok(())
    }

    fn expire_timers(&mut self) {
        let now = self.cached_instant;
        for (slot, epoch) in self.timers.pop_expired(now) {
            if !self.timer_epoch_live(slot, epoch) {
                continue;
            }
            if let Some(st) = self.slots[slot].state.as_mut() {
                st.timer_epoch = 0;
            }
            self.activate(slot, What::TIMEOUT);
        }
    }

    /// Clears activation state and detaches a non-persistent event; for a
    /// persistent one, re-arms its interval. Returns the fired conditions
    /// and the callback, taken out of the slot for the invocation.
    fn prepare_invocation(&mut self, slot: usize) -> Option<(What, EventCallback)> {
        let (fired, persist, requested_timeout) = {
            let st = self.slots[slot].state.as_mut()?;
            let fired = st.active_what;
            st.active_what = What::NONE;
            st.queued = false;
            (fired, st.what.is_persistent(), st.requested_timeout)
        };
        if fired.is_empty() {
            return None;
        }
        if persist {
            let still_pending = self.slots[slot]
                .state
                .as_ref()
                .is_some_and(|st| st.pending);
            if still_pending {
                if let Some(interval) = requested_timeout {
                    self.arm_timer(slot, interval);
                }
            }
        } else {
            self.make_nonpending(slot);
        }
        let callback = self.slots[slot].state.as_mut()?.callback.take()?;
        Some((fired, callback))
    }

    fn restore_callback(&mut self, slot: usize, gen: u64, callback: EventCallback) {
        if let Some(entry) = self.slots.get_mut(slot) {
            if entry.gen == gen {
                if let Some(st) = entry.state.as_mut() {
                    if st.callback.is_none() {
                        st.callback = Some(callback);
                    }
                }
            }
        }
    }

    fn refresh_clock(&mut self) {
        self.cached_instant = Instant::now();
        self.cached_wall = SystemTime::now();
    }

    fn mono_now(&self) -> Instant {
        if self.running && !self.flags.contains(BaseFlags::NO_CACHE_TIME) {
            self.cached_instant
        } else {
            Instant::now()
        }
    }

    fn reinit(&mut self) -> Result<()> {
        self.backend = backend::select(&self.config)?;
        for (fd, watch) in &self.fd_map {
            let ready = watch.ready_mask();
            if ready.is_empty() {
                continue;
            }
            self.backend
                .add(*fd, ready, watch.edge)
                .map_err(|error| RegistrationError::backend(*fd, &error))?;
        }
        let rewired = self.signals.reinit()?;
        for (signum, read_fd) in rewired {
            self.backend
                .add(read_fd, Ready::READABLE, false)
                .map_err(|error| RegistrationError::backend(signum, &error))?;
        }
        tracing::debug!(method = self.backend.name(), "base reinitialized after fork");
        Ok(())
    }
}

/// Restores a taken-out callback into its slot when the invocation ends,
/// including by panic. A slot freed during its own callback drops the
/// closure instead.
struct RestoreCallback {
    inner: Rc<RefCell<BaseInner>>,
    slot: usize,
    gen: u64,
    callback: Option<EventCallback>,
}

impl Drop for RestoreCallback {
    fn drop(&mut self) {
        let Some(callback) = self.callback.take() else {
            return;
        };
        if let Ok(mut inner) = self.inner.try_borrow_mut() {
            inner.restore_callback(self.slot, self.gen, callback);
        }
    }
}

/// The reactor: a single-threaded dispatch loop over descriptor readiness,
/// timeouts and signals.
///
/// Cloning yields another handle to the same base. Construction picks a
/// polling backend; see [`Config`] for steering the choice.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use evio::{Event, EventBase, ExitReason};
///
/// let base = EventBase::new()?;
/// let tick = Event::timer(&base, |_ev, _what| println!("tick"))?;
/// tick.add(Some(Duration::from_millis(10)))?;
/// assert_eq!(base.dispatch()?, ExitReason::Done);
/// # Ok::<(), evio::Error>(())
/// ```
#[derive(Clone)]
pub struct EventBase {
    inner: Rc<RefCell<BaseInner>>,
}

impl EventBase {
    /// Builds a base with default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(Config::new())
    }

    /// Builds a base per `config`; fails when no backend satisfies it.
    pub fn with_config(config: Config) -> Result<Self> {
        let backend = backend::select(&config)?;
        let flags = config.flags;
        let limit = config.dispatch;
        let inner = Rc::new(RefCell::new(BaseInner {
            backend,
            config,
            slots: Vec::new(),
            free_slots: Vec::new(),
            fd_map: HashMap::new(),
            timers: TimerHeap::new(),
            signals: SignalTable::new(),
            active: vec![VecDeque::new()],
            deferred: VecDeque::new(),
            flags,
            limit,
            cached_instant: Instant::now(),
            cached_wall: SystemTime::now(),
            timer_seq: 0,
            pending_events: 0,
            running: false,
            stop_now: false,
            break_now: false,
            stop_at: None,
            got_stop: false,
            got_break: false,
            poll_buf: Vec::new(),
        }));
        tracing::debug!(method = inner.borrow().backend.name(), "event base ready");
        Ok(Self { inner })
    }

    /// Name of the selected backend.
    #[must_use]
    pub fn method(&self) -> &'static str {
        self.inner.borrow().backend.name()
    }

    /// Features of the selected backend.
    #[must_use]
    pub fn features(&self) -> Features {
        self.inner.borrow().backend.features()
    }

    /// Names of every compiled-in backend, in default selection order.
    #[must_use]
    pub fn supported_methods() -> Vec<&'static str> {
        backend::method_names()
    }

    /// Runs the loop until no events remain or it is told to stop.
    ///
    /// Equivalent to `run(LoopFlags::NONE)`.
    pub fn dispatch(&self) -> Result<ExitReason> {
        self.run(LoopFlags::NONE)
    }

    /// Runs the dispatch loop with the given flags.
    ///
    /// # Errors
    ///
    /// [`Error::LoopRunning`] when called from inside a callback of this
    /// base; [`Error::Poll`] when the backend fails hard.
    pub fn run(&self, flags: LoopFlags) -> Result<ExitReason> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.running {
                return Err(Error::LoopRunning);
            }
            inner.running = true;
            inner.got_stop = false;
            inner.got_break = false;
            inner.refresh_clock();
        }
        let result = self.run_loop(flags);
        {
            let mut inner = self.inner.borrow_mut();
            inner.running = false;
            inner.stop_now = false;
            inner.break_now = false;
            inner.stop_at = None;
        }
        result
    }

    fn run_loop(&self, flags: LoopFlags) -> Result<ExitReason> {
        let once = flags.contains(LoopFlags::ONCE);
        let nonblock = flags.contains(LoopFlags::NONBLOCK);
        let wait_when_empty = flags.contains(LoopFlags::NO_EXIT_ON_EMPTY);

        loop {
            {
                let mut inner = self.inner.borrow_mut();
                if inner.break_now {
                    inner.got_break = true;
                    return Ok(ExitReason::Broken);
                }
                if inner.stop_now {
                    inner.got_stop = true;
                    return Ok(ExitReason::Stopped);
                }
                if let Some(at) = inner.stop_at {
                    if inner.cached_instant >= at {
                        inner.got_stop = true;
                        return Ok(ExitReason::Stopped);
                    }
                }
                if !inner.has_work() && !wait_when_empty {
                    return Ok(ExitReason::Done);
                }
            }

            {
                let mut inner = self.inner.borrow_mut();
                let timeout = if nonblock {
                    Some(Duration::ZERO)
                } else {
                    inner.poll_timeout()
                };
                inner
                    .poll_and_activate(timeout)
                    .map_err(|source| Error::Poll { source })?;
                inner.refresh_clock();
                inner.expire_timers();
            }

            let deferred: Vec<Box<dyn FnOnce()>> = {
                let mut inner = self.inner.borrow_mut();
                inner.deferred.drain(..).collect()
            };
            let mut processed = deferred.len();
            for callback in deferred {
                callback();
            }

            processed += self.process_active();

            {
                let mut inner = self.inner.borrow_mut();
                if inner.break_now {
                    inner.got_break = true;
                    return Ok(ExitReason::Broken);
                }
                if inner.stop_now {
                    inner.got_stop = true;
                    return Ok(ExitReason::Stopped);
                }
            }
            if nonblock || (once && processed > 0) {
                return Ok(ExitReason::Done);
            }
        }
    }

    /// Drains the highest-priority non-empty queue, bounded by the
    /// configured dispatch limits. Returns how many callbacks ran.
    fn process_active(&self) -> usize {
        let (priority, capped, max_callbacks, max_interval) = {
            let inner = self.inner.borrow();
            let Some(priority) = inner.active.iter().position(|q| !q.is_empty()) else {
                return 0;
            };
            let capped = priority >= inner.limit.min_priority && !inner.limit.is_unbounded();
            (
                priority,
                capped,
                inner.limit.max_callbacks,
                inner.limit.max_interval,
            )
        };
        let started = Instant::now();
        let mut processed = 0usize;
        loop {
            let Some((slot, gen, fired, callback)) = self.pop_active(priority) else {
                break;
            };
            let event = Event::from_parts(self.weak(), slot, gen);
            let mut guard = RestoreCallback {
                inner: Rc::clone(&self.inner),
                slot,
                gen,
                callback: Some(callback),
            };
            if let Some(cb) = guard.callback.as_mut() {
                cb(&event, fired);
            }
            drop(guard);
            processed += 1;
            {
                let mut inner = self.inner.borrow_mut();
                if inner.flags.contains(BaseFlags::NO_CACHE_TIME) {
                    inner.refresh_clock();
                }
                if inner.break_now {
                    break;
                }
            }
            if capped {
                if max_callbacks.is_some_and(|max| processed >= max) {
                    break;
                }
                if max_interval.is_some_and(|max| started.elapsed() >= max) {
                    break;
                }
            }
        }
        processed
    }

    fn pop_active(&self, priority: usize) -> Option<(usize, u64, What, EventCallback)> {
        let mut inner = self.inner.borrow_mut();
        loop {
            let (slot, gen) = inner.active[priority].pop_front()?;
            let live = inner.slots.get(slot).is_some_and(|entry| {
                entry.gen == gen && entry.state.as_ref().is_some_and(|st| st.queued)
            });
            if !live {
                continue;
            }
            if let Some((fired, callback)) = inner.prepare_invocation(slot) {
                return Some((slot, gen, fired, callback));
            }
        }
    }

    /// Asks the loop to exit. With no delay the current callback batch
    /// finishes and the loop returns [`ExitReason::Stopped`]; with a delay
    /// the loop keeps dispatching until the deadline.
    pub fn request_stop(&self, after: Option<Duration>) {
        let mut inner = self.inner.borrow_mut();
        match after {
            None => inner.stop_now = true,
            Some(delay) => {
                let at = inner.mono_now() + delay;
                inner.stop_at = Some(at);
            }
        }
    }

    /// Aborts the loop immediately; callbacks already queued stay queued
    /// for a later run.
    pub fn break_loop(&self) {
        self.inner.borrow_mut().break_now = true;
    }

    /// True when the most recent run exited via [`EventBase::request_stop`].
    #[must_use]
    pub fn got_stop(&self) -> bool {
        self.inner.borrow().got_stop
    }

    /// True when the most recent run exited via [`EventBase::break_loop`].
    #[must_use]
    pub fn got_break(&self) -> bool {
        self.inner.borrow().got_break
    }

    /// Resizes the priority queues. Events keep their priorities; values
    /// beyond the new count are clamped at activation time. New events
    /// default to the middle level.
    ///
    /// # Errors
    ///
    /// Rejected while any callback is queued, and for a zero level count.
    pub fn set_priority_levels(&self, levels: usize) -> Result<()> {
        if levels == 0 || levels > 256 {
            return Err(Error::Config {
                reason: format!("priority level count {levels} out of range 1..=256"),
            });
        }
        let mut inner = self.inner.borrow_mut();
        let queued: usize = inner.active.iter().map(VecDeque::len).sum();
        if queued > 0 {
            return Err(RegistrationError::LevelsInUse { pending: queued }.into());
        }
        inner.active.resize_with(levels, VecDeque::new);
        tracing::debug!(levels, "priority levels resized");
        Ok(())
    }

    /// Number of configured priority levels.
    #[must_use]
    pub fn priority_levels(&self) -> usize {
        self.inner.borrow().active.len()
    }

    /// Number of events currently pending or queued for dispatch.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        let inner = self.inner.borrow();
        inner
            .slots
            .iter()
            .filter(|entry| {
                entry
                    .state
                    .as_ref()
                    .is_some_and(|st| st.pending || st.queued)
            })
            .count()
    }

    /// The wall clock as cached by the running loop; outside the loop (or
    /// under [`BaseFlags::NO_CACHE_TIME`]) a fresh sample.
    #[must_use]
    pub fn cached_now(&self) -> SystemTime {
        let inner = self.inner.borrow();
        if inner.running && !inner.flags.contains(BaseFlags::NO_CACHE_TIME) {
            inner.cached_wall
        } else {
            SystemTime::now()
        }
    }

    /// Forces a fresh clock sample into the cache.
    pub fn update_cache_time(&self) {
        self.inner.borrow_mut().refresh_clock();
    }

    /// Rebuilds backend and signal state in the child after `fork`.
    ///
    /// Every pending registration is re-added to a fresh backend and every
    /// signal pipe is recreated.
    pub fn reinit_after_fork(&self) -> Result<()> {
        self.inner.borrow_mut().reinit()
    }

    pub(crate) fn register(
        &self,
        kind: EventKind,
        what: What,
        callback: EventCallback,
    ) -> std::result::Result<(usize, u64), RegistrationError> {
        self.inner.borrow_mut().register(kind, what, callback)
    }

    pub(crate) fn weak(&self) -> Weak<RefCell<BaseInner>> {
        Rc::downgrade(&self.inner)
    }

    /// Queues a closure to run at the start of the next loop iteration,
    /// outside any event slot.
    pub(crate) fn defer(&self, callback: Box<dyn FnOnce()>) {
        self.inner.borrow_mut().deferred.push_back(callback);
    }
}

impl fmt::Debug for EventBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("EventBase")
            .field("method", &inner.backend.name())
            .field("levels", &inner.active.len())
            .field("pending", &inner.pending_events)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::cell::Cell;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn empty_dispatch_returns_done() {
        let base = EventBase::new().unwrap();
        assert_eq!(base.dispatch().unwrap(), ExitReason::Done);
    }

    #[test]
    fn timer_fires_once_and_goes_nonpending() {
        let base = EventBase::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let seen = Rc::clone(&fired);
        let timer = Event::timer(&base, move |_ev, what| {
            assert!(what.is_timeout());
            seen.set(seen.get() + 1);
        })
        .unwrap();
        timer.add(Some(Duration::from_millis(10))).unwrap();
        assert!(timer.is_pending(What::TIMEOUT));

        assert_eq!(base.dispatch().unwrap(), ExitReason::Done);
        assert_eq!(fired.get(), 1);
        assert!(!timer.is_pending(What::TIMEOUT));
    }

    #[test]
    fn persistent_timer_refires_until_removed() {
        let base = EventBase::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let seen = Rc::clone(&fired);
        let timer = Event::new(&base, -1, What::PERSIST, move |ev, _what| {
            seen.set(seen.get() + 1);
            if seen.get() == 3 {
                ev.remove().unwrap();
            }
        })
        .unwrap();
        timer.add(Some(Duration::from_millis(1))).unwrap();

        assert_eq!(base.dispatch().unwrap(), ExitReason::Done);
        assert_eq!(fired.get(), 3);
    }

    #[test]
    fn nonblocking_run_returns_without_waiting() {
        let base = EventBase::new().unwrap();
        let timer = Event::timer(&base, |_ev, _what| {}).unwrap();
        timer.add(Some(Duration::from_secs(3600))).unwrap();

        let start = Instant::now();
        assert_eq!(base.run(LoopFlags::NONBLOCK).unwrap(), ExitReason::Done);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(timer.is_pending(What::TIMEOUT));
    }

    #[test]
    fn manual_activation_runs_callback() {
        let base = EventBase::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let seen = Rc::clone(&fired);
        let ev = Event::timer(&base, move |_ev, what| {
            assert!(what.is_timeout());
            seen.set(true);
        })
        .unwrap();
        ev.activate(What::TIMEOUT).unwrap();

        base.run(LoopFlags::NONBLOCK).unwrap();
        assert!(fired.get());
    }

    #[test]
    fn request_stop_ends_loop_with_stopped() {
        let base = EventBase::new().unwrap();
        let handle = base.clone();
        let fired = Rc::new(Cell::new(0));
        let seen = Rc::clone(&fired);
        let timer = Event::new(&base, -1, What::PERSIST, move |_ev, _what| {
            seen.set(seen.get() + 1);
            if seen.get() == 3 {
                handle.request_stop(None);
            }
        })
        .unwrap();
        timer.add(Some(Duration::from_millis(1))).unwrap();

        assert_eq!(base.dispatch().unwrap(), ExitReason::Stopped);
        assert_eq!(fired.get(), 3);
        assert!(base.got_stop());
        assert!(!base.got_break());
        timer.free();
    }

    #[test]
    fn break_leaves_lower_priority_callbacks_queued() {
        let base = EventBase::new().unwrap();
        base.set_priority_levels(2).unwrap();

        let later = Rc::new(Cell::new(false));
        let later_seen = Rc::clone(&later);
        let low = Event::timer(&base, move |_ev, _what| later_seen.set(true)).unwrap();
        low.set_priority(1).unwrap();

        let handle = base.clone();
        let high = Event::timer(&base, move |_ev, _what| handle.break_loop()).unwrap();
        high.set_priority(0).unwrap();

        low.activate(What::TIMEOUT).unwrap();
        high.activate(What::TIMEOUT).unwrap();

        assert_eq!(base.dispatch().unwrap(), ExitReason::Broken);
        assert!(base.got_break());
        assert!(!later.get());

        // The queued low-priority callback survives for the next run.
        assert_eq!(base.run(LoopFlags::NONBLOCK).unwrap(), ExitReason::Done);
        assert!(later.get());
        high.free();
    }

    #[test]
    fn higher_priority_runs_first() {
        let base = EventBase::new().unwrap();
        base.set_priority_levels(3).unwrap();

        let order = Rc::new(RefCell::new(Vec::new()));
        let o1 = Rc::clone(&order);
        let slow = Event::timer(&base, move |_ev, _what| o1.borrow_mut().push("low")).unwrap();
        slow.set_priority(2).unwrap();
        let o2 = Rc::clone(&order);
        let fast = Event::timer(&base, move |_ev, _what| o2.borrow_mut().push("high")).unwrap();
        fast.set_priority(0).unwrap();

        slow.activate(What::TIMEOUT).unwrap();
        fast.activate(What::TIMEOUT).unwrap();

        base.dispatch().unwrap();
        assert_eq!(*order.borrow(), vec!["high", "low"]);
    }

    #[test]
    fn io_event_fires_on_readable_socket() {
        let base = EventBase::new().unwrap();
        let (reader, writer) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();

        let fired = Rc::new(Cell::new(false));
        let seen = Rc::clone(&fired);
        let ev = Event::new(&base, reader.as_raw_fd(), What::READ, move |_ev, what| {
            assert!(what.is_read());
            seen.set(true);
        })
        .unwrap();
        ev.add(None).unwrap();

        (&writer).write_all(b"ping").unwrap();
        assert_eq!(base.run(LoopFlags::ONCE).unwrap(), ExitReason::Done);
        assert!(fired.get());
        // Non-persistent events detach when they fire.
        assert!(!ev.is_pending(What::READ));
    }

    #[test]
    fn persistent_io_event_stays_pending() {
        let base = EventBase::new().unwrap();
        let (reader, writer) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();

        let fired = Rc::new(Cell::new(0));
        let seen = Rc::clone(&fired);
        let reader_clone = reader.try_clone().unwrap();
        let ev = Event::new(
            &base,
            reader.as_raw_fd(),
            What::READ | What::PERSIST,
            move |_ev, _what| {
                let mut buf = [0u8; 16];
                use std::io::Read;
                let _ = (&reader_clone).read(&mut buf);
                seen.set(seen.get() + 1);
            },
        )
        .unwrap();
        ev.add(None).unwrap();

        (&writer).write_all(b"a").unwrap();
        base.run(LoopFlags::ONCE).unwrap();
        assert_eq!(fired.get(), 1);
        assert!(ev.is_pending(What::READ));

        (&writer).write_all(b"b").unwrap();
        base.run(LoopFlags::ONCE).unwrap();
        assert_eq!(fired.get(), 2);
        ev.free();
    }

    #[test]
    fn event_freed_from_own_callback_goes_stale() {
        let base = EventBase::new().unwrap();
        let timer = Event::timer(&base, |ev, _what| ev.free()).unwrap();
        timer.add(Some(Duration::from_millis(5))).unwrap();

        assert_eq!(base.dispatch().unwrap(), ExitReason::Done);
        assert!(matches!(
            timer.add(None),
            Err(Error::Registration(RegistrationError::Stale))
        ));
        assert!(!timer.is_pending(What::TIMEOUT));
    }

    #[test]
    fn double_free_is_harmless() {
        let base = EventBase::new().unwrap();
        let timer = Event::timer(&base, |_ev, _what| {}).unwrap();
        timer.free();
        timer.free();
        assert!(matches!(
            timer.add(None),
            Err(Error::Registration(RegistrationError::Stale))
        ));
    }

    #[test]
    fn level_resize_rejected_while_callbacks_queued() {
        let base = EventBase::new().unwrap();
        let ev = Event::timer(&base, |_ev, _what| {}).unwrap();
        ev.activate(What::TIMEOUT).unwrap();
        assert!(matches!(
            base.set_priority_levels(4),
            Err(Error::Registration(RegistrationError::LevelsInUse { pending: 1 }))
        ));
        base.run(LoopFlags::NONBLOCK).unwrap();
        base.set_priority_levels(4).unwrap();
        assert_eq!(base.priority_levels(), 4);
    }

    #[test]
    fn priority_out_of_range_rejected() {
        let base = EventBase::new().unwrap();
        let ev = Event::timer(&base, |_ev, _what| {}).unwrap();
        assert!(matches!(
            ev.set_priority(1),
            Err(Error::Registration(RegistrationError::PriorityRange {
                priority: 1,
                levels: 1
            }))
        ));
    }

    #[test]
    fn edge_and_level_watchers_cannot_share_a_descriptor() {
        let base = EventBase::new().unwrap();
        assert!(base.features().contains(Features::ET));
        let (sock, _peer) = UnixStream::pair().unwrap();
        sock.set_nonblocking(true).unwrap();
        let fd = sock.as_raw_fd();

        let level = Event::new(&base, fd, What::READ | What::PERSIST, |_e, _w| {}).unwrap();
        level.add(None).unwrap();

        let edge = Event::new(
            &base,
            fd,
            What::READ | What::PERSIST | What::ET,
            |_e, _w| {},
        )
        .unwrap();
        assert!(matches!(
            edge.add(None),
            Err(Error::Registration(RegistrationError::EdgeConflict { .. }))
        ));
        level.free();
    }

    #[test]
    fn edge_triggered_rejected_on_poll_backend() {
        let base = EventBase::with_config(Config::new().require_features(Features::FDS)).unwrap();
        assert_eq!(base.method(), "poll");
        let (sock, _peer) = UnixStream::pair().unwrap();
        let result = Event::new(
            &base,
            sock.as_raw_fd(),
            What::READ | What::ET,
            |_e, _w| {},
        );
        assert!(matches!(
            result,
            Err(Error::Registration(RegistrationError::Backend { .. }))
        ));
    }

    #[test]
    fn reentrant_run_is_rejected() {
        let base = EventBase::new().unwrap();
        let handle = base.clone();
        let saw_error = Rc::new(Cell::new(false));
        let seen = Rc::clone(&saw_error);
        let ev = Event::timer(&base, move |_ev, _what| {
            seen.set(matches!(handle.dispatch(), Err(Error::LoopRunning)));
        })
        .unwrap();
        ev.activate(What::TIMEOUT).unwrap();
        base.run(LoopFlags::NONBLOCK).unwrap();
        assert!(saw_error.get());
        ev.free();
    }

    #[test]
    fn pending_count_tracks_added_events() {
        let base = EventBase::new().unwrap();
        assert_eq!(base.pending_count(), 0);
        let a = Event::timer(&base, |_e, _w| {}).unwrap();
        let b = Event::timer(&base, |_e, _w| {}).unwrap();
        a.add(Some(Duration::from_secs(60))).unwrap();
        b.add(Some(Duration::from_secs(60))).unwrap();
        assert_eq!(base.pending_count(), 2);
        a.remove().unwrap();
        assert_eq!(base.pending_count(), 1);
        b.free();
        assert_eq!(base.pending_count(), 0);
    }

    #[test]
    fn readd_with_timeout_pushes_deadline_back() {
        let base = EventBase::new().unwrap();
        let fired_at = Rc::new(RefCell::new(None));

        let seen = Rc::clone(&fired_at);
        let start = Instant::now();
        let slow = Event::timer(&base, move |_ev, _what| {
            *seen.borrow_mut() = Some(start.elapsed());
        })
        .unwrap();
        slow.add(Some(Duration::from_millis(60))).unwrap();

        let rearm_target = slow.clone();
        let rearm = Event::timer(&base, move |_ev, _what| {
            // Pushing the pending deadline back is the only effect.
            rearm_target.add(Some(Duration::from_millis(60))).unwrap();
        })
        .unwrap();
        rearm.add(Some(Duration::from_millis(30))).unwrap();

        base.dispatch().unwrap();
        let elapsed = fired_at.borrow().expect("slow timer fired");
        assert!(elapsed >= Duration::from_millis(85), "fired at {elapsed:?}");
    }

    #[test]
    fn max_callback_cap_forces_repoll() {
        let config = Config::new().set_max_dispatch_interval(None, Some(1), 0);
        let base = EventBase::with_config(config).unwrap();

        let order = Rc::new(RefCell::new(Vec::new()));
        let mut events = Vec::new();
        for i in 0..3 {
            let o = Rc::clone(&order);
            let ev = Event::timer(&base, move |_ev, _what| o.borrow_mut().push(i)).unwrap();
            ev.activate(What::TIMEOUT).unwrap();
            events.push(ev);
        }

        // Each iteration may run only one callback; all still run to
        // completion before the loop exhausts its work.
        base.dispatch().unwrap();
        assert_eq!(order.borrow().len(), 3);
    }

    #[test]
    fn stop_deadline_ends_blocking_loop() {
        let base = EventBase::new().unwrap();
        let ev = Event::timer(&base, |_e, _w| {}).unwrap();
        ev.add(Some(Duration::from_secs(3600))).unwrap();

        base.request_stop(Some(Duration::from_millis(30)));
        let start = Instant::now();
        assert_eq!(base.dispatch().unwrap(), ExitReason::Stopped);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(25), "exited at {elapsed:?}");
        assert!(base.got_stop());
    }
}
