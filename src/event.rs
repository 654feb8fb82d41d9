//! Event descriptors: a single registration of interest with a typed
//! callback.
//!
//! An [`Event`] is a handle into its base's slot table, validated by a
//! generation counter. Freeing the slot (from anywhere, including the
//! event's own callback) leaves every outstanding handle stale; stale
//! handles report not-pending and fail registration calls instead of
//! touching a recycled slot.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Weak;
use std::time::Duration;

use crate::error::RegistrationError;
use crate::reactor::{BaseInner, EventBase, EventKind};

/// Condition mask for event registration and callback delivery.
///
/// The bit values match the conventional constants: TIMEOUT `0x01`,
/// READ `0x02`, WRITE `0x04`, SIGNAL `0x08`, PERSIST `0x10`, ET `0x20`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct What(u8);

impl What {
    /// No conditions; a pure-timer registration.
    pub const NONE: What = What(0);
    /// Timeout expired. Set on delivery; implied on `add` with a timeout.
    pub const TIMEOUT: What = What(0x01);
    /// Descriptor became readable.
    pub const READ: What = What(0x02);
    /// Descriptor became writable.
    pub const WRITE: What = What(0x04);
    /// Signal delivered.
    pub const SIGNAL: What = What(0x08);
    /// Stay pending after the callback runs.
    pub const PERSIST: What = What(0x10);
    /// Edge-triggered readiness, where the backend supports it.
    pub const ET: What = What(0x20);

    /// The bits that describe deliverable conditions (everything except
    /// PERSIST and ET).
    pub const fn conditions() -> Self {
        What(Self::TIMEOUT.0 | Self::READ.0 | Self::WRITE.0 | Self::SIGNAL.0)
    }

    /// Returns true if no bits are set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: What) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if `self` and `other` share any bit.
    #[must_use]
    pub const fn intersects(self, other: What) -> bool {
        self.0 & other.0 != 0
    }

    /// Combines condition bits.
    #[must_use]
    pub const fn add(self, other: What) -> Self {
        What(self.0 | other.0)
    }

    /// Removes condition bits.
    #[must_use]
    pub const fn remove(self, other: What) -> Self {
        What(self.0 & !other.0)
    }

    /// True if the READ bit is set.
    #[must_use]
    pub const fn is_read(self) -> bool {
        self.intersects(Self::READ)
    }

    /// True if the WRITE bit is set.
    #[must_use]
    pub const fn is_write(self) -> bool {
        self.intersects(Self::WRITE)
    }

    /// True if the SIGNAL bit is set.
    #[must_use]
    pub const fn is_signal(self) -> bool {
        self.intersects(Self::SIGNAL)
    }

    /// True if the TIMEOUT bit is set.
    #[must_use]
    pub const fn is_timeout(self) -> bool {
        self.intersects(Self::TIMEOUT)
    }

    /// True if the PERSIST bit is set.
    #[must_use]
    pub const fn is_persistent(self) -> bool {
        self.intersects(Self::PERSIST)
    }

    /// True if the ET bit is set.
    #[must_use]
    pub const fn is_edge_triggered(self) -> bool {
        self.intersects(Self::ET)
    }
}

impl std::ops::BitOr for What {
    type Output = What;

    fn bitor(self, rhs: What) -> What {
        self.add(rhs)
    }
}

impl std::ops::BitOrAssign for What {
    fn bitor_assign(&mut self, rhs: What) {
        *self = self.add(rhs);
    }
}

impl std::fmt::Debug for What {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (bit, name) in [
            (Self::TIMEOUT, "TIMEOUT"),
            (Self::READ, "READ"),
            (Self::WRITE, "WRITE"),
            (Self::SIGNAL, "SIGNAL"),
            (Self::PERSIST, "PERSIST"),
            (Self::ET, "ET"),
        ] {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Callback invoked when an event activates. Receives a handle to the
/// activating event (safe to `add`, `remove` or `free` from inside) and the
/// conditions that fired.
pub type EventCallback = Box<dyn FnMut(&Event, What)>;

/// A single registration of interest owned by one [`EventBase`].
///
/// Handles are cheap to clone; all clones refer to the same registration
/// and all go stale together when it is freed.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use evio::{Event, EventBase, What};
///
/// let base = EventBase::new()?;
/// let timer = Event::timer(&base, |_ev, what| {
///     assert!(what.is_timeout());
/// })?;
/// timer.add(Some(Duration::from_millis(100)))?;
/// base.dispatch()?;
/// # Ok::<(), evio::Error>(())
/// ```
#[derive(Clone)]
pub struct Event {
    base: Weak<RefCell<BaseInner>>,
    slot: usize,
    gen: u64,
}

impl Event {
    /// Registers interest in `what` on descriptor `fd`.
    ///
    /// A negative `fd` makes a pure-timer event. If `what` contains SIGNAL,
    /// `fd` is interpreted as a signal number instead and must not carry
    /// READ or WRITE. The event starts non-pending; call [`Event::add`].
    pub fn new<F>(base: &EventBase, fd: RawFd, what: What, callback: F) -> crate::Result<Self>
    where
        F: FnMut(&Event, What) + 'static,
    {
        let kind = Self::kind_for(fd, what)?;
        let (slot, gen) = base.register(kind, what, Box::new(callback))?;
        Ok(Self {
            base: base.weak(),
            slot,
            gen,
        })
    }

    /// Registers a pure-timer event. Arm it with [`Event::add`] and a
    /// timeout.
    pub fn timer<F>(base: &EventBase, callback: F) -> crate::Result<Self>
    where
        F: FnMut(&Event, What) + 'static,
    {
        Self::new(base, -1, What::NONE, callback)
    }

    /// Registers a persistent watcher for signal `signum`.
    pub fn signal<F>(base: &EventBase, signum: i32, callback: F) -> crate::Result<Self>
    where
        F: FnMut(&Event, What) + 'static,
    {
        Self::new(base, signum, What::SIGNAL | What::PERSIST, callback)
    }

    /// Makes the event pending, with an optional timeout.
    ///
    /// On an already-pending event, a timeout re-arms the deadline and
    /// nothing else changes; without a timeout the call is a no-op. The
    /// condition mask is fixed at construction — change it through
    /// [`Event::reconfigure`].
    pub fn add(&self, timeout: Option<Duration>) -> crate::Result<()> {
        self.with_inner(|inner| inner.event_add(self.slot, self.gen, timeout))
    }

    /// Forces the event non-pending. Pending timeouts and readiness
    /// registrations are withdrawn before the next poll.
    pub fn remove(&self) -> crate::Result<()> {
        self.with_inner(|inner| inner.event_del(self.slot, self.gen))
    }

    /// Releases the registration. All clones of this handle go stale; the
    /// callback is dropped and will never fire again. Safe to call from
    /// the event's own callback, and safe to call twice (the second call
    /// finds a stale handle and does nothing).
    pub fn free(&self) {
        if let Some(rc) = self.base.upgrade() {
            rc.borrow_mut().event_free(self.slot, self.gen);
        }
    }

    /// Returns true if the event is pending (or currently active) for any
    /// condition in `what`. Stale handles report false.
    #[must_use]
    pub fn is_pending(&self, what: What) -> bool {
        match self.base.upgrade() {
            Some(rc) => rc.borrow().event_is_pending(self.slot, self.gen, what),
            None => false,
        }
    }

    /// Assigns a dispatch priority; 0 is most urgent. Takes effect the next
    /// time the event activates.
    pub fn set_priority(&self, priority: usize) -> crate::Result<()> {
        self.with_inner(|inner| inner.event_set_priority(self.slot, self.gen, priority))
    }

    /// Marks the event active with `what` as if the conditions had been
    /// observed, queueing its callback for the running (or next) dispatch.
    pub fn activate(&self, what: What) -> crate::Result<()> {
        self.with_inner(|inner| inner.event_activate(self.slot, self.gen, what))
    }

    /// Rebinds this handle to a fresh registration: new base, descriptor,
    /// mask and callback. Rejected while the current registration is
    /// pending; on success the old registration is freed.
    pub fn reconfigure<F>(
        &mut self,
        base: &EventBase,
        fd: RawFd,
        what: What,
        callback: F,
    ) -> crate::Result<()>
    where
        F: FnMut(&Event, What) + 'static,
    {
        let kind = Self::kind_for(fd, what)?;
        if let Some(rc) = self.base.upgrade() {
            let mut inner = rc.borrow_mut();
            if inner.event_is_pending(self.slot, self.gen, What::conditions()) {
                return Err(RegistrationError::Pending.into());
            }
            inner.event_free(self.slot, self.gen);
        }
        let (slot, gen) = base.register(kind, what, Box::new(callback))?;
        self.base = base.weak();
        self.slot = slot;
        self.gen = gen;
        Ok(())
    }

    pub(crate) fn from_parts(base: Weak<RefCell<BaseInner>>, slot: usize, gen: u64) -> Self {
        Self { base, slot, gen }
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    fn kind_for(fd: RawFd, what: What) -> Result<EventKind, RegistrationError> {
        if what.is_signal() {
            if what.intersects(What::READ | What::WRITE) {
                return Err(RegistrationError::InvalidMask(
                    "SIGNAL cannot be combined with READ or WRITE",
                ));
            }
            if fd < 1 {
                return Err(RegistrationError::InvalidMask(
                    "signal events need a positive signal number",
                ));
            }
            return Ok(EventKind::Signal(fd));
        }
        if fd < 0 {
            if what.intersects(What::READ | What::WRITE) {
                return Err(RegistrationError::InvalidMask(
                    "READ/WRITE events need a descriptor",
                ));
            }
            return Ok(EventKind::Timer);
        }
        Ok(EventKind::Io(fd))
    }

    fn with_inner<T>(
        &self,
        f: impl FnOnce(&mut BaseInner) -> Result<T, RegistrationError>,
    ) -> crate::Result<T> {
        let Some(rc) = self.base.upgrade() else {
            return Err(RegistrationError::Stale.into());
        };
        let mut inner = rc.borrow_mut();
        f(&mut inner).map_err(Into::into)
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("slot", &self.slot)
            .field("gen", &self.gen)
            .field("attached", &(self.base.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_values_match_convention() {
        assert_eq!(What::TIMEOUT.0, 0x01);
        assert_eq!(What::READ.0, 0x02);
        assert_eq!(What::WRITE.0, 0x04);
        assert_eq!(What::SIGNAL.0, 0x08);
        assert_eq!(What::PERSIST.0, 0x10);
        assert_eq!(What::ET.0, 0x20);
    }

    #[test]
    fn mask_set_operations() {
        let rw = What::READ | What::WRITE;
        assert!(rw.is_read());
        assert!(rw.is_write());
        assert!(!rw.is_signal());
        assert!(rw.contains(What::READ));
        assert!(!rw.contains(What::READ | What::SIGNAL));
        assert!(rw.intersects(What::READ | What::SIGNAL));

        let r = rw.remove(What::WRITE);
        assert_eq!(r, What::READ);
        assert!(What::NONE.is_empty());
    }

    #[test]
    fn mask_debug_lists_bits() {
        let what = What::READ | What::PERSIST;
        assert_eq!(format!("{what:?}"), "READ|PERSIST");
        assert_eq!(format!("{:?}", What::NONE), "NONE");
    }

    #[test]
    fn conditions_exclude_modifiers() {
        let c = What::conditions();
        assert!(c.contains(What::READ | What::WRITE | What::SIGNAL | What::TIMEOUT));
        assert!(!c.intersects(What::PERSIST));
        assert!(!c.intersects(What::ET));
    }
}
