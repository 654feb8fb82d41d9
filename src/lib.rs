//! evio: a callback-driven event loop for nonblocking I/O.
//!
//! # Overview
//!
//! evio multiplexes descriptor readiness, timers, and POSIX signals
//! through one single-threaded dispatch loop. Applications register
//! [`Event`]s against an [`EventBase`] and get their callbacks invoked
//! in priority order as conditions arrive. Two higher layers build on
//! that core: [`BufferEvent`] pairs an input and output [`Buffer`] with
//! a socket so callers only ever touch buffered bytes, and [`Listener`]
//! turns a listening socket into one accept callback per connection.
//!
//! # Core Behaviors
//!
//! - **Priority dispatch**: Each loop iteration runs only the highest
//!   nonempty priority queue, so urgent callbacks preempt bulk work
//! - **Persistent events**: A `PERSIST` event stays registered across
//!   fires and re-arms its timeout on every activation
//! - **Safe teardown**: Freeing an event from inside any callback is
//!   harmless; stale activations are skipped, never misdelivered
//! - **Watermarked buffering**: Buffer events pause reading at the high
//!   watermark and hold callbacks until the low watermark is met
//!
//! # Module Structure
//!
//! - [`buffer`]: Segmented byte queue with search, freezing, and locking
//! - [`event`]: Event handles and the condition mask
//! - [`reactor`]: The event base, its backends, timers, and signal plumbing
//! - [`bufferevent`]: Buffered stream endpoints, filters, and pairs
//! - [`listener`]: Accepting listeners for stream sockets
//! - [`config`]: Base construction knobs and dispatch limits
//! - [`error`]: Error types

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod buffer;
pub mod bufferevent;
pub mod config;
pub mod error;
pub mod event;
pub mod listener;
pub mod reactor;

mod util;

// Re-exports for convenient access to core types
pub use buffer::{Buffer, BufferError, End, EolStyle};
pub use bufferevent::{
    BevEvent, BevOptions, BufferEvent, DataCallback, FilteredTransport, NegotiateStatus,
    SocketTransport, StatusCallback, Transport, TransportFilter,
};
pub use config::{BaseFlags, Config, DispatchLimit, Features};
pub use error::{Error, RegistrationError, Result};
pub use event::{Event, EventCallback, What};
pub use listener::{AcceptCallback, Listener, ListenerErrorCallback, ListenerOptions};
pub use reactor::{EventBase, ExitReason, LoopFlags};
