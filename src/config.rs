//! Reactor construction options.
//!
//! A [`Config`] is consumed once by
//! [`EventBase::with_config`](crate::reactor::EventBase::with_config). It
//! narrows which polling backends may be chosen, requires backend features,
//! sets base-wide flags, and bounds how long one drain of the active queues
//! may run before the loop re-polls.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `avoided` | empty (no backend excluded) |
//! | `preferred` | empty (built-in order) |
//! | `required_features` | [`Features::NONE`] |
//! | `flags` | [`BaseFlags::NONE`] |
//! | `dispatch.max_interval` | `None` (unbounded) |
//! | `dispatch.max_callbacks` | `None` (unbounded) |
//! | `dispatch.min_priority` | 1 (priority 0 never throttled) |

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

/// Backend capability mask.
///
/// Each polling backend advertises the features it supports;
/// [`Config::require_features`] filters candidates against this mask at
/// base construction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Features(u8);

impl Features {
    /// No required capability.
    pub const NONE: Self = Self(0);
    /// Edge-triggered readiness is available.
    pub const ET: Self = Self(0x01);
    /// Adding and deleting a descriptor is O(1).
    pub const O1: Self = Self(0x02);
    /// Arbitrary descriptors (not just sockets) can be watched.
    pub const FDS: Self = Self(0x04);

    /// Builds a mask from its raw bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x07)
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True when no capability bit is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two masks.
    #[must_use]
    pub const fn add(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for Features {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.add(rhs)
    }
}

impl BitOrAssign for Features {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.add(rhs);
    }
}

impl fmt::Debug for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "Features(NONE)");
        }
        let mut first = true;
        write!(f, "Features(")?;
        for (bit, name) in [(Self::ET, "ET"), (Self::O1, "O1"), (Self::FDS, "FDS")] {
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

/// Base-wide behavior flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BaseFlags(u8);

impl BaseFlags {
    /// No flag set.
    pub const NONE: Self = Self(0);
    /// Skip internal locking. The base is single-threaded, so this is
    /// accepted for compatibility and changes nothing.
    pub const NOLOCK: Self = Self(0x01);
    /// Re-sample the clock after every callback instead of once per loop
    /// iteration.
    pub const NO_CACHE_TIME: Self = Self(0x08);

    /// Builds a flag set from its raw bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x09)
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

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

impl BitOr for BaseFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.add(rhs)
    }
}

impl BitOrAssign for BaseFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.add(rhs);
    }
}

impl fmt::Debug for BaseFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "BaseFlags(NONE)");
        }
        let mut first = true;
        write!(f, "BaseFlags(")?;
        for (bit, name) in [(Self::NOLOCK, "NOLOCK"), (Self::NO_CACHE_TIME, "NO_CACHE_TIME")] {
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

/// Bound on one drain of the active queues.
///
/// When either limit trips, the loop stops draining and re-polls the
/// backend, so newly ready high-priority work is not starved by a long
/// run of low-priority callbacks. Queues with priority numerically below
/// `min_priority` are exempt and always drain fully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchLimit {
    /// Longest wall-clock stretch one drain may run.
    pub max_interval: Option<Duration>,
    /// Most callbacks one drain may invoke.
    pub max_callbacks: Option<usize>,
    /// First priority level the limits apply to.
    pub min_priority: usize,
}

impl Default for DispatchLimit {
    fn default() -> Self {
        Self {
            max_interval: None,
            max_callbacks: None,
            min_priority: 1,
        }
    }
}

impl DispatchLimit {
    pub(crate) fn is_unbounded(&self) -> bool {
        self.max_interval.is_none() && self.max_callbacks.is_none()
    }
}

/// Options consumed by [`EventBase::with_config`](crate::reactor::EventBase::with_config).
///
/// # Example
///
/// ```no_run
/// use evio::{Config, EventBase, Features};
///
/// let config = Config::new()
///     .avoid_method("poll")
///     .require_features(Features::O1);
/// let base = EventBase::with_config(config)?;
/// assert_eq!(base.method(), "polling");
/// # Ok::<(), evio::Error>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub(crate) avoided: Vec<String>,
    pub(crate) preferred: Vec<String>,
    pub(crate) required_features: Features,
    pub(crate) flags: BaseFlags,
    pub(crate) dispatch: DispatchLimit,
}

impl Config {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Excludes a backend by name from selection.
    ///
    /// Unknown names are kept and simply never match.
    #[must_use]
    pub fn avoid_method(mut self, name: impl Into<String>) -> Self {
        self.avoided.push(name.into());
        self
    }

    /// Moves a backend to the front of the candidate order.
    ///
    /// Later calls take precedence over earlier ones. Avoidance wins over
    /// preference for the same name.
    #[must_use]
    pub fn prefer_method(mut self, name: impl Into<String>) -> Self {
        self.preferred.push(name.into());
        self
    }

    /// Requires backend features; candidates missing any bit are skipped.
    #[must_use]
    pub fn require_features(mut self, features: Features) -> Self {
        self.required_features |= features;
        self
    }

    /// Sets base-wide flags.
    #[must_use]
    pub fn set_flag(mut self, flag: BaseFlags) -> Self {
        self.flags |= flag;
        self
    }

    /// Bounds one drain of the active queues.
    ///
    /// `max_interval` caps wall-clock time, `max_callbacks` caps invocation
    /// count; `None` leaves the respective axis unbounded. Queues with
    /// priority numerically below `min_priority` always drain fully.
    #[must_use]
    pub fn set_max_dispatch_interval(
        mut self,
        max_interval: Option<Duration>,
        max_callbacks: Option<usize>,
        min_priority: usize,
    ) -> Self {
        self.dispatch = DispatchLimit {
            max_interval,
            max_callbacks,
            min_priority,
        };
        self
    }
}
