//! Backend on `libc::poll`; selection name `"poll"`.
//!
//! Linear-scan fallback that can watch any pollable descriptor, not just
//! sockets. Only level-triggered; the base rejects edge-triggered events
//! before they reach this backend.

use crate::config::Features;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::backend::{Backend, Ready, ReadyEvent};

pub(crate) struct PollFdBackend {
    fds: Vec<libc::pollfd>,
    index: HashMap<RawFd, usize>,
}

impl PollFdBackend {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            fds: Vec::new(),
            index: HashMap::new(),
        })
    }
}

fn poll_events(ready: Ready) -> libc::c_short {
    let mut events = 0;
    if ready.is_readable() {
        events |= libc::POLLIN | libc::POLLPRI;
    }
    if ready.is_writable() {
        events |= libc::POLLOUT;
    }
    events
}

fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            // Round up so a short timeout cannot busy-spin at zero.
            let ms = d
                .as_secs()
                .saturating_mul(1000)
                .saturating_add(u64::from(d.subsec_nanos().div_ceil(1_000_000)));
            ms.min(libc::c_int::MAX as u64) as libc::c_int
        }
    }
}

impl Backend for PollFdBackend {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn features(&self) -> Features {
        Features::FDS
    }

    fn add(&mut self, fd: RawFd, ready: Ready, edge: bool) -> io::Result<()> {
        if edge {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "poll backend is level-triggered only",
            ));
        }
        if self.index.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "descriptor already registered",
            ));
        }
        self.index.insert(fd, self.fds.len());
        self.fds.push(libc::pollfd {
            fd,
            events: poll_events(ready),
            revents: 0,
        });
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, ready: Ready, edge: bool) -> io::Result<()> {
        if edge {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "poll backend is level-triggered only",
            ));
        }
        let Some(&pos) = self.index.get(&fd) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "descriptor not registered",
            ));
        };
        self.fds[pos].events = poll_events(ready);
        Ok(())
    }

    fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        let Some(pos) = self.index.remove(&fd) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "descriptor not registered",
            ));
        };
        self.fds.swap_remove(pos);
        if let Some(moved) = self.fds.get(pos) {
            self.index.insert(moved.fd, pos);
        }
        Ok(())
    }

    #[allow(unsafe_code)]
    fn poll(&mut self, out: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> io::Result<()> {
        // SAFETY: the pointer and length describe our owned, initialized
        // pollfd vector for the duration of the call.
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };
        if rc < 0 {
            let error = io::Error::last_os_error();
            if error.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(error);
        }
        if rc == 0 {
            return Ok(());
        }
        for entry in &mut self.fds {
            let revents = entry.revents;
            entry.revents = 0;
            if revents == 0 {
                continue;
            }
            let mut ready = Ready::NONE;
            if revents & (libc::POLLIN | libc::POLLPRI) != 0 {
                ready |= Ready::READABLE;
            }
            if revents & libc::POLLOUT != 0 {
                ready |= Ready::WRITABLE;
            }
            // Error and hangup wake both directions so the owning events
            // run and observe the condition on the descriptor.
            if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                ready = Ready::READABLE | Ready::WRITABLE;
            }
            if !ready.is_empty() {
                out.push(ReadyEvent {
                    fd: entry.fd,
                    ready,
                });
            }
        }
        Ok(())
    }
}
