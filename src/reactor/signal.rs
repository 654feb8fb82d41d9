//! Signal delivery through self-pipes.
//!
//! Each watched signal number owns a nonblocking socket pair. A
//! `signal-hook` handler writes one byte to the write end per delivery;
//! the read end is watched by the base like any other descriptor, so
//! signals wake the poll and dispatch through the normal active queues.
//! Handler chaining in `signal-hook` lets several bases watch the same
//! signal number independently.

use smallvec::SmallVec;
use std::collections::HashMap;
use std::io::{self, Read};
use std::os::raw::c_int;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use signal_hook::low_level::pipe;
use signal_hook::SigId;

struct SignalEntry {
    // `signal-hook` owns the write end of the pair; it is closed when the
    // handler is unregistered.
    sig_id: SigId,
    read_end: UnixStream,
    slots: SmallVec<[usize; 2]>,
}

/// Per-base table of watched signals.
#[derive(Default)]
pub(crate) struct SignalTable {
    entries: HashMap<c_int, SignalEntry>,
    by_fd: HashMap<RawFd, c_int>,
}

impl SignalTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds an event slot to a signal's subscriber list.
    ///
    /// Returns the pipe descriptor the base must start watching when this
    /// is the first subscriber for `signum`.
    pub(crate) fn subscribe(&mut self, signum: c_int, slot: usize) -> io::Result<Option<RawFd>> {
        if let Some(entry) = self.entries.get_mut(&signum) {
            debug_assert!(!entry.slots.contains(&slot));
            entry.slots.push(slot);
            return Ok(None);
        }
        let entry = Self::new_entry(signum, slot)?;
        let read_fd = entry.read_end.as_raw_fd();
        self.by_fd.insert(read_fd, signum);
        self.entries.insert(signum, entry);
        tracing::debug!(signum, "signal pipe registered");
        Ok(Some(read_fd))
    }

    /// Removes an event slot from a signal's subscriber list.
    ///
    /// Returns the pipe descriptor the base must stop watching when the
    /// last subscriber leaves; the handler is unregistered before the
    /// pipe is dropped.
    pub(crate) fn unsubscribe(&mut self, signum: c_int, slot: usize) -> Option<RawFd> {
        let entry = self.entries.get_mut(&signum)?;
        entry.slots.retain(|s| *s != slot);
        if !entry.slots.is_empty() {
            return None;
        }
        let entry = self.entries.remove(&signum)?;
        let read_fd = entry.read_end.as_raw_fd();
        self.by_fd.remove(&read_fd);
        signal_hook::low_level::unregister(entry.sig_id);
        tracing::debug!(signum, "signal pipe unregistered");
        Some(read_fd)
    }

    /// True when `fd` is one of the table's pipe read ends.
    pub(crate) fn owns_fd(&self, fd: RawFd) -> bool {
        self.by_fd.contains_key(&fd)
    }

    /// Drains a readable pipe end.
    ///
    /// Returns the signal number and its subscriber slots when at least
    /// one delivery was pending. Multiple deliveries coalesce into one
    /// activation per drain.
    pub(crate) fn drain(&mut self, fd: RawFd) -> Option<(c_int, SmallVec<[usize; 2]>)> {
        let signum = *self.by_fd.get(&fd)?;
        let entry = self.entries.get_mut(&signum)?;
        let mut buf = [0u8; 64];
        let mut total = 0usize;
        loop {
            match entry.read_end.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        if total == 0 {
            return None;
        }
        Some((signum, entry.slots.clone()))
    }

    /// Rebuilds every pipe and handler registration after a fork.
    ///
    /// Returns `(signum, read_fd)` for each watched signal so the base can
    /// rewire its descriptor watches against the rebuilt backend.
    pub(crate) fn reinit(&mut self) -> io::Result<Vec<(c_int, RawFd)>> {
        let old: Vec<(c_int, SmallVec<[usize; 2]>)> = self
            .entries
            .drain()
            .map(|(signum, entry)| {
                signal_hook::low_level::unregister(entry.sig_id);
                (signum, entry.slots)
            })
            .collect();
        self.by_fd.clear();

        let mut rewired = Vec::with_capacity(old.len());
        for (signum, slots) in old {
            let mut entry = Self::new_entry(signum, 0)?;
            entry.slots = slots;
            let read_fd = entry.read_end.as_raw_fd();
            self.by_fd.insert(read_fd, signum);
            self.entries.insert(signum, entry);
            rewired.push((signum, read_fd));
        }
        Ok(rewired)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn new_entry(signum: c_int, slot: usize) -> io::Result<SignalEntry> {
        let (read_end, write_end) = UnixStream::pair()?;
        // The handler write must never block; the reader drains between
        // polls.
        read_end.set_nonblocking(true)?;
        write_end.set_nonblocking(true)?;
        let sig_id = pipe::register(signum, write_end)?;
        let mut slots = SmallVec::new();
        slots.push(slot);
        Ok(SignalEntry {
            sig_id,
            read_end,
            slots,
        })
    }
}

impl Drop for SignalTable {
    fn drop(&mut self) {
        for entry in self.entries.values() {
            signal_hook::low_level::unregister(entry.sig_id);
        }
    }
}
