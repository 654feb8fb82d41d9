//! Backend on the `polling` crate (epoll/kqueue under the hood).
//!
//! Registrations are keyed by the raw descriptor value. Level-triggered
//! watches use [`PollMode::Level`]; descriptors whose events all request
//! edge semantics are registered with [`PollMode::Edge`]. The wait buffer
//! is reused across calls.

use crate::config::Features;
use std::io;
use std::num::NonZeroUsize;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::time::Duration;

use polling::{Event as PollEvent, Events as PollEvents, PollMode, Poller};

use super::backend::{Backend, Ready, ReadyEvent};

const EVENT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1024) {
    Some(n) => n,
    None => panic!("capacity is nonzero"),
};

/// `polling::Poller` adapter; selection name `"polling"`.
pub(crate) struct PollerBackend {
    poller: Poller,
    events: PollEvents,
}

impl PollerBackend {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            events: PollEvents::with_capacity(EVENT_CAPACITY),
        })
    }
}

fn interest(key: usize, ready: Ready) -> PollEvent {
    match (ready.is_readable(), ready.is_writable()) {
        (true, true) => PollEvent::all(key),
        (true, false) => PollEvent::readable(key),
        (false, true) => PollEvent::writable(key),
        (false, false) => PollEvent::none(key),
    }
}

const fn mode(edge: bool) -> PollMode {
    if edge {
        PollMode::Edge
    } else {
        PollMode::Level
    }
}

impl Backend for PollerBackend {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn features(&self) -> Features {
        Features::ET | Features::O1
    }

    #[allow(unsafe_code)]
    fn add(&mut self, fd: RawFd, ready: Ready, edge: bool) -> io::Result<()> {
        // SAFETY: the base owns this registration and deletes it before the
        // descriptor is closed or the watching events are freed.
        unsafe {
            self.poller
                .add_with_mode(fd, interest(fd as usize, ready), mode(edge))
        }
    }

    #[allow(unsafe_code)]
    fn modify(&mut self, fd: RawFd, ready: Ready, edge: bool) -> io::Result<()> {
        // SAFETY: `fd` was registered by `add` and is still open; the borrow
        // lasts only for this call.
        let source = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller
            .modify_with_mode(source, interest(fd as usize, ready), mode(edge))
    }

    #[allow(unsafe_code)]
    fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        // SAFETY: same borrow discipline as `modify`; if the descriptor was
        // closed early the poller reports it and the caller ignores the
        // error.
        let source = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller.delete(source)
    }

    fn poll(&mut self, out: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> io::Result<()> {
        self.events.clear();
        match self.poller.wait(&mut self.events, timeout) {
            Ok(_) => {}
            Err(error) if error.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(error) => return Err(error),
        }
        for event in self.events.iter() {
            let mut ready = Ready::NONE;
            if event.readable {
                ready |= Ready::READABLE;
            }
            if event.writable {
                ready |= Ready::WRITABLE;
            }
            if ready.is_empty() {
                continue;
            }
            out.push(ReadyEvent {
                fd: event.key as RawFd,
                ready,
            });
        }
        Ok(())
    }
}
