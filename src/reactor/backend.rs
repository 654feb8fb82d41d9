//! Polling backend abstraction.
//!
//! The event base drives one [`Backend`] for all descriptor readiness. A
//! backend owns the OS-level multiplexer and reports which descriptors
//! became readable or writable; everything above it (masks, timers,
//! signals, priorities) lives in the base.
//!
//! # Backends
//!
//! | Name | Mechanism | Features |
//! |-----------|----------------------|-------------|
//! | `polling` | `polling::Poller` | `O1 \| ET` |
//! | `poll` | `libc::poll` | `FDS` |
//!
//! Candidates are tried in the order above; [`Config`] can reorder, skip,
//! or feature-filter them before one is constructed.

use crate::config::{Config, Features};
use crate::error::Error;
use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::pollfd::PollFdBackend;
use super::poller::PollerBackend;

/// Readiness directions a backend watches and reports.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Ready(u8);

impl Ready {
    pub(crate) const NONE: Self = Self(0);
    pub(crate) const READABLE: Self = Self(0x01);
    pub(crate) const WRITABLE: Self = Self(0x02);

    #[must_use]
    pub(crate) const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub(crate) const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    #[must_use]
    pub(crate) const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    #[must_use]
    pub(crate) const fn add(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for Ready {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.add(rhs)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.add(rhs);
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => write!(f, "Ready(READABLE|WRITABLE)"),
            (true, false) => write!(f, "Ready(READABLE)"),
            (false, true) => write!(f, "Ready(WRITABLE)"),
            (false, false) => write!(f, "Ready(NONE)"),
        }
    }
}

/// One readiness notification out of [`Backend::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadyEvent {
    pub(crate) fd: RawFd,
    pub(crate) ready: Ready,
}

/// OS readiness multiplexer driven by the event base.
///
/// One registration per descriptor; the base aggregates all events
/// watching the same descriptor into a single `Ready` mask and keeps the
/// backend in sync through `add`/`modify`/`delete`. Error and hangup are
/// reported as readable plus writable so the owning events run and
/// observe the condition through the descriptor itself.
pub(crate) trait Backend {
    /// Selection name, as matched by `avoid_method`/`prefer_method`.
    fn name(&self) -> &'static str;

    /// Capability mask advertised to `require_features`.
    fn features(&self) -> Features;

    /// Starts watching a descriptor. The descriptor must not already be
    /// registered.
    fn add(&mut self, fd: RawFd, ready: Ready, edge: bool) -> io::Result<()>;

    /// Replaces the watched directions of a registered descriptor.
    fn modify(&mut self, fd: RawFd, ready: Ready, edge: bool) -> io::Result<()>;

    /// Stops watching a descriptor.
    ///
    /// May fail if the descriptor was closed before removal; callers treat
    /// that as already-gone.
    fn delete(&mut self, fd: RawFd) -> io::Result<()>;

    /// Blocks until readiness or timeout, appending results to `out`.
    ///
    /// `None` blocks indefinitely; `Some(ZERO)` polls without blocking.
    /// Returns normally with no events on `EINTR`.
    fn poll(&mut self, out: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> io::Result<()>;
}

type BackendCtor = fn() -> io::Result<Box<dyn Backend>>;

/// Built-in candidate order, strongest first.
const CANDIDATES: &[(&str, Features, BackendCtor)] = &[
    ("polling", Features::ET.add(Features::O1), new_poller),
    ("poll", Features::FDS, new_pollfd),
];

fn new_poller() -> io::Result<Box<dyn Backend>> {
    Ok(Box::new(PollerBackend::new()?))
}

fn new_pollfd() -> io::Result<Box<dyn Backend>> {
    Ok(Box::new(PollFdBackend::new()?))
}

/// Names of every compiled-in backend, in default selection order.
pub(crate) fn method_names() -> Vec<&'static str> {
    CANDIDATES.iter().map(|(name, _, _)| *name).collect()
}

/// Picks and constructs the first candidate the configuration allows.
pub(crate) fn select(config: &Config) -> Result<Box<dyn Backend>, Error> {
    let mut order: Vec<&(&str, Features, BackendCtor)> = CANDIDATES.iter().collect();
    // Later prefer_method calls outrank earlier ones, so walk in reverse
    // and move each match to the front.
    for name in config.preferred.iter().rev() {
        if let Some(pos) = order.iter().position(|(n, _, _)| n == name) {
            let entry = order.remove(pos);
            order.insert(0, entry);
        }
    }

    let mut last_error: Option<io::Error> = None;
    for (name, features, ctor) in order {
        if config.avoided.iter().any(|avoided| avoided == name) {
            continue;
        }
        if !features.contains(config.required_features) {
            continue;
        }
        match ctor() {
            Ok(backend) => {
                tracing::debug!(method = name, features = ?features, "backend selected");
                return Ok(backend);
            }
            Err(error) => {
                tracing::warn!(method = name, %error, "backend construction failed");
                last_error = Some(error);
            }
        }
    }

    let reason = match last_error {
        Some(error) => format!("no usable backend: last candidate failed: {error}"),
        None => "no backend satisfies the avoid/require constraints".to_string(),
    };
    Err(Error::Config { reason })
}
