//! Buffered stream endpoints driven by the event base.
//!
//! A [`BufferEvent`] owns an input and an output [`Buffer`] and keeps a
//! pair of persistent descriptor events registered with its base. The
//! base drains `output` into the transport whenever the descriptor turns
//! writable and fills `input` whenever it turns readable; the
//! application only ever touches the buffers and hears about progress
//! through callbacks gated by watermarks.
//!
//! ```text
//!    write() --> [ output Buffer ] --writable--> Transport --> fd
//!                                                              |
//!    read()  <-- [ input Buffer ] <--readable-- Transport <----+
//!                       |
//!                 watermarks --> read/write/status callbacks
//! ```
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`BufferEvent`] | Buffered endpoint bound to one base |
//! | [`BevEvent`]    | Status bits handed to the status callback |
//! | [`BevOptions`]  | Construction flags (close-on-free, locking, deferral) |
//! | [`Transport`]   | Byte stream under the buffers |
//! | [`TransportFilter`] | Byte rewriter stacked on a transport |
//!
//! Connected pairs made with [`BufferEvent::pair`] shuttle bytes in
//! memory instead of through a descriptor; their callbacks always run
//! deferred, from the base's next loop iteration.

mod filter;
mod pair;
mod transport;

pub use filter::{FilteredTransport, TransportFilter};
pub use transport::{NegotiateStatus, SocketTransport, Transport};

use crate::buffer::Buffer;
use crate::error::{Error, RegistrationError};
use crate::event::{Event, What};
use crate::reactor::EventBase;
use socket2::{Socket, Type};
use std::cell::RefCell;
use std::fmt;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use transport::{TransportReader, TransportWriter};

/// Most bytes pulled off a transport per readiness wakeup. Keeps one
/// fast peer from starving the rest of the loop.
const READ_MAX: usize = 16384;

/// Size of one read into the input buffer.
const READ_STEP: usize = 4096;

/// Status bits reported to a status callback.
///
/// A report combines a direction bit (`READING` or `WRITING`) with what
/// happened (`EOF`, `ERROR`, `TIMEOUT`); `CONNECTED` arrives alone when
/// a connect or negotiation finishes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BevEvent(u8);

impl BevEvent {
    /// Empty report.
    pub const NONE: BevEvent = BevEvent(0);
    /// The read side triggered this report.
    pub const READING: BevEvent = BevEvent(0x01);
    /// The write side triggered this report.
    pub const WRITING: BevEvent = BevEvent(0x02);
    /// The peer closed the stream.
    pub const EOF: BevEvent = BevEvent(0x10);
    /// A transport error; see [`BufferEvent::last_socket_errno`].
    pub const ERROR: BevEvent = BevEvent(0x20);
    /// A read or write timeout expired.
    pub const TIMEOUT: BevEvent = BevEvent(0x40);
    /// A connect or transport negotiation completed.
    pub const CONNECTED: BevEvent = BevEvent(0x80);

    const ALL: u8 = 0xf3;

    /// Builds a report from raw bits, ignoring undefined ones.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL)
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True when no bits are set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: BevEvent) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when `self` and `other` share any bit.
    #[must_use]
    pub const fn intersects(self, other: BevEvent) -> bool {
        self.0 & other.0 != 0
    }

    /// Union of `self` and `other`.
    #[must_use]
    pub const fn add(self, other: BevEvent) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for BevEvent {
    type Output = BevEvent;

    fn bitor(self, rhs: BevEvent) -> BevEvent {
        self.add(rhs)
    }
}

impl std::ops::BitOrAssign for BevEvent {
    fn bitor_assign(&mut self, rhs: BevEvent) {
        *self = self.add(rhs);
    }
}

impl fmt::Debug for BevEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::READING, "READING"),
            (Self::WRITING, "WRITING"),
            (Self::EOF, "EOF"),
            (Self::ERROR, "ERROR"),
            (Self::TIMEOUT, "TIMEOUT"),
            (Self::CONNECTED, "CONNECTED"),
        ];
        write!(f, "BevEvent(")?;
        let mut first = true;
        for (bit, name) in names {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        write!(f, ")")
    }
}

/// Construction flags for a [`BufferEvent`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BevOptions(u8);

impl BevOptions {
    /// No options.
    pub const NONE: BevOptions = BevOptions(0);
    /// Close the underlying descriptor when the buffer event is freed.
    /// Pairs ignore this; they own no descriptor.
    pub const CLOSE_ON_FREE: BevOptions = BevOptions(0x01);
    /// Guard both buffers with a lock so other threads may inspect them.
    pub const THREADSAFE: BevOptions = BevOptions(0x02);
    /// Run user callbacks from the base's deferred queue instead of
    /// inline with the triggering I/O.
    pub const DEFER_CALLBACKS: BevOptions = BevOptions(0x04);
    /// Accepted for compatibility; callbacks already run with no lock
    /// held, so this changes nothing.
    pub const UNLOCK_CALLBACKS: BevOptions = BevOptions(0x08);

    const ALL: u8 = 0x0f;

    /// Builds options from raw bits, ignoring undefined ones.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL)
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True when every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: BevOptions) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of `self` and `other`.
    #[must_use]
    pub const fn add(self, other: BevOptions) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for BevOptions {
    type Output = BevOptions;

    fn bitor(self, rhs: BevOptions) -> BevOptions {
        self.add(rhs)
    }
}

impl fmt::Debug for BevOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::CLOSE_ON_FREE, "CLOSE_ON_FREE"),
            (Self::THREADSAFE, "THREADSAFE"),
            (Self::DEFER_CALLBACKS, "DEFER_CALLBACKS"),
            (Self::UNLOCK_CALLBACKS, "UNLOCK_CALLBACKS"),
        ];
        write!(f, "BevOptions(")?;
        let mut first = true;
        for (bit, name) in names {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        write!(f, ")")
    }
}

/// Callback fired when a buffer crosses its watermark.
pub type DataCallback = Box<dyn FnMut(&BufferEvent)>;

/// Callback fired on connection, end-of-stream, error, and timeout.
pub type StatusCallback = Box<dyn FnMut(&BufferEvent, BevEvent)>;

/// What the buffer event is currently attached to.
enum Link {
    /// No stream yet, or it was closed.
    Detached,
    /// A socket whose nonblocking `connect` has not completed.
    Connecting(Socket),
    /// A live transport carrying bytes.
    Transport(Box<dyn Transport>),
    /// The other half of an in-memory pair.
    Pair(Weak<RefCell<BevInner>>),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum LinkState {
    Unconnected,
    Connecting,
    Connected,
    Closed,
}

struct BevInner {
    base: EventBase,
    link: Link,
    input: Buffer,
    output: Buffer,
    read_event: Option<Event>,
    write_event: Option<Event>,
    enabled: What,
    read_low: usize,
    /// 0 means unlimited.
    read_high: usize,
    write_low: usize,
    /// Recorded but not enforced; the output buffer grows as written.
    write_high: usize,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    read_cb: Option<DataCallback>,
    write_cb: Option<DataCallback>,
    status_cb: Option<StatusCallback>,
    options: BevOptions,
    state: LinkState,
    last_errno: i32,
    /// Read event parked because `input` reached the high watermark.
    read_suspended: bool,
    priority: Option<usize>,
}

impl BevInner {
    fn arm_read(&self) -> crate::Result<()> {
        match &self.read_event {
            Some(ev) => ev.add(self.read_timeout),
            None => Ok(()),
        }
    }

    fn arm_write(&self) -> crate::Result<()> {
        match &self.write_event {
            Some(ev) => ev.add(self.write_timeout),
            None => Ok(()),
        }
    }

    fn disarm_read(&self) {
        if let Some(ev) = &self.read_event {
            let _ = ev.remove();
        }
    }

    fn disarm_write(&self) {
        if let Some(ev) = &self.write_event {
            let _ = ev.remove();
        }
    }

    fn record_errno(&mut self, e: &io::Error) {
        self.last_errno = e.raw_os_error().unwrap_or(0);
    }
}

impl Drop for BevInner {
    fn drop(&mut self) {
        if let Some(ev) = self.read_event.take() {
            ev.free();
        }
        if let Some(ev) = self.write_event.take() {
            ev.free();
        }
        if !self.options.contains(BevOptions::CLOSE_ON_FREE) {
            if let Link::Transport(t) = mem::replace(&mut self.link, Link::Detached) {
                let _ = t.release();
            }
        }
    }
}

/// A buffered stream endpoint bound to one [`EventBase`].
///
/// Clones share the same endpoint. Reading starts disabled and writing
/// enabled, so a fresh buffer event flushes writes but will not invoke
/// the read callback until [`BufferEvent::enable`] is called with
/// [`What::READ`].
#[derive(Clone)]
pub struct BufferEvent {
    inner: Rc<RefCell<BevInner>>,
}

impl BufferEvent {
    fn bare(base: &EventBase, options: BevOptions) -> Self {
        let inner = Rc::new(RefCell::new(BevInner {
            base: base.clone(),
            link: Link::Detached,
            input: Buffer::new(),
            output: Buffer::new(),
            read_event: None,
            write_event: None,
            enabled: What::WRITE,
            read_low: 0,
            read_high: 0,
            write_low: 0,
            write_high: 0,
            read_timeout: None,
            write_timeout: None,
            read_cb: None,
            write_cb: None,
            status_cb: None,
            options,
            state: LinkState::Unconnected,
            last_errno: 0,
            read_suspended: false,
            priority: None,
        }));
        if options.contains(BevOptions::THREADSAFE) {
            let mut b = inner.borrow_mut();
            b.input.enable_locking();
            b.output.enable_locking();
        }
        Self { inner }
    }

    /// Wraps an already connected socket. The socket is switched to
    /// nonblocking mode.
    pub fn socket(base: &EventBase, socket: Socket, options: BevOptions) -> crate::Result<Self> {
        socket.set_nonblocking(true)?;
        let fd = socket.as_raw_fd();
        let bev = Self::bare(base, options);
        {
            let mut b = bev.inner.borrow_mut();
            b.link = Link::Transport(Box::new(SocketTransport::new(socket)));
            b.state = LinkState::Connected;
        }
        bev.wire_events(fd)?;
        Ok(bev)
    }

    /// Builds an unconnected buffer event; attach a stream later with
    /// [`BufferEvent::connect`]. Bytes written before the connection
    /// completes are queued and flushed once it does.
    #[must_use]
    pub fn new(base: &EventBase, options: BevOptions) -> Self {
        Self::bare(base, options)
    }

    /// Wraps an arbitrary [`Transport`]. The transport must expose a
    /// descriptor for the base to watch. If its negotiation is not
    /// immediately ready the buffer event starts in the connecting state
    /// and reports [`BevEvent::CONNECTED`] once the handshake finishes.
    pub fn from_transport(
        base: &EventBase,
        transport: Box<dyn Transport>,
        options: BevOptions,
    ) -> crate::Result<Self> {
        let Some(fd) = transport.as_raw_fd() else {
            return Err(Error::Config {
                reason: "transport exposes no descriptor to watch".to_string(),
            });
        };
        let bev = Self::bare(base, options);
        {
            let mut b = bev.inner.borrow_mut();
            b.link = Link::Transport(transport);
            b.state = LinkState::Connecting;
        }
        bev.wire_events(fd)?;
        let verdict = {
            let mut b = bev.inner.borrow_mut();
            match &mut b.link {
                Link::Transport(t) => t.poll_negotiate(),
                _ => Ok(NegotiateStatus::Ready),
            }
        };
        match verdict {
            Ok(NegotiateStatus::Ready) => {
                bev.inner.borrow_mut().state = LinkState::Connected;
            }
            Ok(NegotiateStatus::WantRead) => {
                bev.inner.borrow().arm_read()?;
            }
            Ok(NegotiateStatus::WantWrite) => {
                bev.inner.borrow().arm_write()?;
            }
            Err(e) => {
                bev.inner.borrow_mut().record_errno(&e);
                return Err(e.into());
            }
        }
        Ok(bev)
    }

    /// Starts a nonblocking connect to `address` (`ip:port` or
    /// `unix:path`). Completion is reported through the status callback:
    /// [`BevEvent::CONNECTED`] on success, [`BevEvent::ERROR`] on
    /// failure, even when the connect finishes immediately.
    pub fn connect(&self, address: &str) -> crate::Result<()> {
        {
            let b = self.inner.borrow();
            if !matches!(b.link, Link::Detached) || b.state != LinkState::Unconnected {
                return Err(Error::Config {
                    reason: "buffer event already has a stream attached".to_string(),
                });
            }
        }
        let (addr, domain) = crate::util::parse_addr(address)?;
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_nonblocking(true)?;
        match socket.connect(&addr) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {}
            Err(e) => {
                self.inner.borrow_mut().record_errno(&e);
                return Err(e.into());
            }
        }
        let fd = socket.as_raw_fd();
        {
            let mut b = self.inner.borrow_mut();
            b.link = Link::Connecting(socket);
            b.state = LinkState::Connecting;
        }
        self.wire_events(fd)?;
        // Completion always reports through the write event, even when
        // the connect succeeded before we got here.
        self.inner.borrow().arm_write()?;
        tracing::debug!(address, fd, "connect started");
        Ok(())
    }

    /// Installs the three user callbacks, replacing any previous set.
    /// `None` clears that slot. Replacing callbacks from inside a
    /// running callback takes effect immediately.
    pub fn set_callbacks(
        &self,
        read: Option<DataCallback>,
        write: Option<DataCallback>,
        status: Option<StatusCallback>,
    ) {
        let mut b = self.inner.borrow_mut();
        b.read_cb = read;
        b.write_cb = write;
        b.status_cb = status;
    }

    /// Enables the given directions. Only [`What::READ`] and
    /// [`What::WRITE`] are accepted.
    pub fn enable(&self, what: What) -> crate::Result<()> {
        check_direction_mask(what)?;
        let pull = {
            let mut b = self.inner.borrow_mut();
            b.enabled = b.enabled.add(what);
            let mut pull = false;
            match &b.link {
                Link::Transport(t) if b.state == LinkState::Connected => {
                    if what.is_read() && !b.read_suspended {
                        b.arm_read()?;
                    }
                    if what.is_write() && (!b.output.is_empty() || t.has_buffered_output()) {
                        b.arm_write()?;
                    }
                }
                Link::Pair(_) if what.is_read() => pull = true,
                _ => {}
            }
            pull
        };
        if pull {
            // Reading just opened up; collect anything the peer had
            // stalled behind our watermark or disabled state.
            self.after_input_drain();
        }
        Ok(())
    }

    /// Disables the given directions, leaving buffered bytes in place.
    pub fn disable(&self, what: What) -> crate::Result<()> {
        check_direction_mask(what)?;
        let mut b = self.inner.borrow_mut();
        b.enabled = b.enabled.remove(what);
        if what.is_read() {
            b.disarm_read();
        }
        if what.is_write() {
            b.disarm_write();
        }
        Ok(())
    }

    /// Currently enabled directions.
    #[must_use]
    pub fn enabled(&self) -> What {
        self.inner.borrow().enabled
    }

    /// Sets watermarks for one or both directions.
    ///
    /// For reads, the callback fires only once `input` holds at least
    /// `low` bytes, and filling pauses once it holds `high` (0 means
    /// unlimited). For writes, the callback fires when `output` drains
    /// to `low` or fewer bytes; `high` is recorded but not enforced.
    pub fn set_watermark(&self, what: What, low: usize, high: usize) {
        let mut b = self.inner.borrow_mut();
        if what.is_read() {
            b.read_low = low;
            b.read_high = high;
            let over = high > 0 && b.input.len() >= high;
            if b.read_suspended && !over {
                b.read_suspended = false;
                if b.enabled.is_read()
                    && b.state == LinkState::Connected
                    && matches!(b.link, Link::Transport(_))
                {
                    if let Err(e) = b.arm_read() {
                        tracing::debug!(error = %e, "re-arming reads after watermark change failed");
                    }
                }
            } else if !b.read_suspended && over && matches!(b.link, Link::Transport(_)) {
                b.read_suspended = true;
                b.disarm_read();
            }
        }
        if what.is_write() {
            b.write_low = low;
            b.write_high = high;
        }
    }

    /// Sets inactivity timeouts. A direction that stays idle past its
    /// timeout reports [`BevEvent::TIMEOUT`] and is disabled until
    /// re-enabled. `None` clears. Pairs have no descriptor and never
    /// time out.
    pub fn set_timeouts(
        &self,
        read: Option<Duration>,
        write: Option<Duration>,
    ) -> crate::Result<()> {
        let mut b = self.inner.borrow_mut();
        b.read_timeout = read;
        b.write_timeout = write;
        if let Some(ev) = &b.read_event {
            if ev.is_pending(What::READ) {
                ev.remove()?;
                ev.add(b.read_timeout)?;
            }
        }
        if let Some(ev) = &b.write_event {
            if ev.is_pending(What::WRITE) {
                ev.remove()?;
                ev.add(b.write_timeout)?;
            }
        }
        Ok(())
    }

    /// Removes up to `max` bytes from the input buffer.
    pub fn read(&self, max: usize) -> crate::Result<Vec<u8>> {
        let out = self.inner.borrow_mut().input.read(max)?;
        self.after_input_drain();
        Ok(out)
    }

    /// Moves the whole input buffer into `target`, returning the byte
    /// count.
    pub fn read_buffer(&self, target: &mut Buffer) -> crate::Result<usize> {
        let moved = {
            let mut b = self.inner.borrow_mut();
            target.append_buffer(&mut b.input)?
        };
        self.after_input_drain();
        Ok(moved)
    }

    /// Queues `bytes` for transmission.
    pub fn write(&self, bytes: &[u8]) -> crate::Result<()> {
        self.inner.borrow_mut().output.append(bytes)?;
        self.after_output_push()
    }

    /// Moves the whole of `source` into the output buffer, returning the
    /// byte count.
    pub fn write_buffer(&self, source: &mut Buffer) -> crate::Result<usize> {
        let moved = {
            let mut b = self.inner.borrow_mut();
            b.output.append_buffer(source)?
        };
        self.after_output_push()?;
        Ok(moved)
    }

    /// Runs `f` with direct access to the input buffer.
    pub fn with_input<R>(&self, f: impl FnOnce(&mut Buffer) -> R) -> R {
        let mut buf = mem::take(&mut self.inner.borrow_mut().input);
        let out = f(&mut buf);
        {
            let mut b = self.inner.borrow_mut();
            // Bytes that arrived while the buffer was out keep their
            // place behind the ones the closure saw.
            let _ = buf.append_buffer(&mut b.input);
            b.input = buf;
        }
        self.after_input_drain();
        out
    }

    /// Runs `f` with direct access to the output buffer, then schedules
    /// a flush if it grew.
    pub fn with_output<R>(&self, f: impl FnOnce(&mut Buffer) -> R) -> R {
        let mut buf = mem::take(&mut self.inner.borrow_mut().output);
        let out = f(&mut buf);
        {
            let mut b = self.inner.borrow_mut();
            let _ = buf.append_buffer(&mut b.output);
            b.output = buf;
        }
        if let Err(e) = self.after_output_push() {
            tracing::debug!(error = %e, "arming writes after output access failed");
        }
        out
    }

    /// Bytes waiting in the input buffer.
    #[must_use]
    pub fn input_len(&self) -> usize {
        self.inner.borrow().input.len()
    }

    /// Bytes waiting in the output buffer.
    #[must_use]
    pub fn output_len(&self) -> usize {
        self.inner.borrow().output.len()
    }

    /// Forwards `priority` to both internal events and applies it to
    /// events created later.
    pub fn set_priority(&self, priority: usize) -> crate::Result<()> {
        let mut b = self.inner.borrow_mut();
        b.priority = Some(priority);
        if let Some(ev) = &b.read_event {
            ev.set_priority(priority)?;
        }
        if let Some(ev) = &b.write_event {
            ev.set_priority(priority)?;
        }
        Ok(())
    }

    /// The descriptor behind this buffer event, if any.
    #[must_use]
    pub fn fd(&self) -> Option<RawFd> {
        match &self.inner.borrow().link {
            Link::Transport(t) => t.as_raw_fd(),
            Link::Connecting(s) => Some(s.as_raw_fd()),
            _ => None,
        }
    }

    /// OS error code from the most recent transport failure, or 0.
    #[must_use]
    pub fn last_socket_errno(&self) -> i32 {
        self.inner.borrow().last_errno
    }

    /// Closes the stream now, regardless of
    /// [`BevOptions::CLOSE_ON_FREE`]. Buffered input stays readable;
    /// queued output is discarded.
    pub fn close(&self) {
        let mut b = self.inner.borrow_mut();
        if let Some(ev) = b.read_event.take() {
            ev.free();
        }
        if let Some(ev) = b.write_event.take() {
            ev.free();
        }
        b.link = Link::Detached;
        b.state = LinkState::Closed;
    }

    /// Tears the buffer event down: events are freed, callbacks dropped,
    /// and the stream is closed or released per
    /// [`BevOptions::CLOSE_ON_FREE`]. Without that option the descriptor
    /// stays open and the caller keeps ownership of it.
    ///
    /// Dropping the last handle does the same, but `free` also clears
    /// the callbacks, which is what breaks the cycle when a callback
    /// captures its own buffer event.
    pub fn free(&self) {
        let mut b = self.inner.borrow_mut();
        if let Some(ev) = b.read_event.take() {
            ev.free();
        }
        if let Some(ev) = b.write_event.take() {
            ev.free();
        }
        let link = mem::replace(&mut b.link, Link::Detached);
        if let Link::Transport(t) = link {
            if b.options.contains(BevOptions::CLOSE_ON_FREE) {
                drop(t);
            } else {
                let _ = t.release();
            }
        }
        b.read_cb = None;
        b.write_cb = None;
        b.status_cb = None;
        b.state = LinkState::Closed;
    }

    fn wire_events(&self, fd: RawFd) -> crate::Result<()> {
        let (base, priority) = {
            let b = self.inner.borrow();
            (b.base.clone(), b.priority)
        };
        {
            let mut b = self.inner.borrow_mut();
            if let Some(ev) = b.read_event.take() {
                ev.free();
            }
            if let Some(ev) = b.write_event.take() {
                ev.free();
            }
        }
        let weak = Rc::downgrade(&self.inner);
        let read_ev = Event::new(&base, fd, What::READ.add(What::PERSIST), move |_ev, what| {
            on_read_ready(&weak, what);
        })?;
        let weak = Rc::downgrade(&self.inner);
        let write_ev = Event::new(&base, fd, What::WRITE.add(What::PERSIST), move |_ev, what| {
            on_write_ready(&weak, what);
        })?;
        if let Some(p) = priority {
            read_ev.set_priority(p)?;
            write_ev.set_priority(p)?;
        }
        let mut b = self.inner.borrow_mut();
        b.read_event = Some(read_ev);
        b.write_event = Some(write_ev);
        Ok(())
    }

    fn after_output_push(&self) -> crate::Result<()> {
        let shuttle = {
            let b = self.inner.borrow();
            match &b.link {
                Link::Transport(_)
                    if b.state == LinkState::Connected
                        && b.enabled.is_write()
                        && !b.output.is_empty() =>
                {
                    b.arm_write()?;
                    false
                }
                Link::Pair(_) => true,
                _ => false,
            }
        };
        if shuttle {
            pair::shuttle(&self.inner);
        }
        Ok(())
    }

    fn after_input_drain(&self) {
        let peer = {
            let mut b = self.inner.borrow_mut();
            match &b.link {
                Link::Pair(peer) => peer.upgrade(),
                _ => {
                    if b.read_suspended && (b.read_high == 0 || b.input.len() < b.read_high) {
                        b.read_suspended = false;
                        if b.enabled.is_read() && b.state == LinkState::Connected {
                            if let Err(e) = b.arm_read() {
                                tracing::debug!(error = %e, "re-arming reads after drain failed");
                            }
                        }
                    }
                    None
                }
            }
        };
        if let Some(peer) = peer {
            // Our input has room again; pull what the peer stalled.
            pair::shuttle(&peer);
        }
    }
}

impl fmt::Debug for BufferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.inner.borrow();
        f.debug_struct("BufferEvent")
            .field("state", &b.state)
            .field("enabled", &b.enabled)
            .field("input_len", &b.input.len())
            .field("output_len", &b.output.len())
            .finish()
    }
}

fn check_direction_mask(what: What) -> crate::Result<()> {
    if what.is_empty() || !What::READ.add(What::WRITE).contains(what) {
        return Err(RegistrationError::InvalidMask("only READ and WRITE apply to a buffer event").into());
    }
    Ok(())
}

fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS)
}

fn on_read_ready(weak: &Weak<RefCell<BevInner>>, what: What) {
    let Some(rc) = weak.upgrade() else { return };
    let state = rc.borrow().state;
    match state {
        LinkState::Connecting => step_connecting(&rc, what),
        LinkState::Connected => {
            if what.is_read() {
                socket_read(&rc);
            } else if what.is_timeout() {
                direction_timeout(&rc, BevEvent::READING);
            }
        }
        _ => {}
    }
}

fn on_write_ready(weak: &Weak<RefCell<BevInner>>, what: What) {
    let Some(rc) = weak.upgrade() else { return };
    let state = rc.borrow().state;
    match state {
        LinkState::Connecting => step_connecting(&rc, what),
        LinkState::Connected => {
            if what.is_write() {
                socket_write(&rc);
            } else if what.is_timeout() {
                direction_timeout(&rc, BevEvent::WRITING);
            }
        }
        _ => {}
    }
}

fn step_connecting(rc: &Rc<RefCell<BevInner>>, what: What) {
    if what.is_timeout() && !what.is_read() && !what.is_write() {
        {
            let mut b = rc.borrow_mut();
            b.disarm_read();
            b.disarm_write();
            b.link = Link::Detached;
            b.state = LinkState::Unconnected;
        }
        emit_status(rc, BevEvent::WRITING.add(BevEvent::TIMEOUT));
        return;
    }
    let raw_connect = matches!(rc.borrow().link, Link::Connecting(_));
    if raw_connect {
        finish_connect(rc);
    } else {
        step_negotiation(rc);
    }
}

fn finish_connect(rc: &Rc<RefCell<BevInner>>) {
    let failed = {
        let mut b = rc.borrow_mut();
        let Link::Connecting(socket) = mem::replace(&mut b.link, Link::Detached) else {
            return;
        };
        match socket.take_error() {
            Ok(None) => {
                b.link = Link::Transport(Box::new(SocketTransport::new(socket)));
                false
            }
            Ok(Some(err)) | Err(err) => {
                b.record_errno(&err);
                b.state = LinkState::Unconnected;
                b.disarm_read();
                b.disarm_write();
                true
            }
        }
    };
    if failed {
        emit_status(rc, BevEvent::ERROR);
    } else {
        step_negotiation(rc);
    }
}

fn step_negotiation(rc: &Rc<RefCell<BevInner>>) {
    let verdict = {
        let mut b = rc.borrow_mut();
        match &mut b.link {
            Link::Transport(t) => t.poll_negotiate(),
            _ => return,
        }
    };
    match verdict {
        Ok(NegotiateStatus::Ready) => {
            {
                let mut b = rc.borrow_mut();
                b.state = LinkState::Connected;
                if b.enabled.is_read() && !b.read_suspended {
                    if let Err(e) = b.arm_read() {
                        tracing::debug!(error = %e, "arming reads after connect failed");
                    }
                } else {
                    b.disarm_read();
                }
                let want_write = match &b.link {
                    Link::Transport(t) => !b.output.is_empty() || t.has_buffered_output(),
                    _ => false,
                };
                if b.enabled.is_write() && want_write {
                    if let Err(e) = b.arm_write() {
                        tracing::debug!(error = %e, "arming writes after connect failed");
                    }
                } else {
                    b.disarm_write();
                }
            }
            emit_status(rc, BevEvent::CONNECTED);
        }
        Ok(NegotiateStatus::WantRead) => {
            let b = rc.borrow();
            if let Err(e) = b.arm_read() {
                tracing::debug!(error = %e, "arming reads for negotiation failed");
            }
            b.disarm_write();
        }
        Ok(NegotiateStatus::WantWrite) => {
            let b = rc.borrow();
            if let Err(e) = b.arm_write() {
                tracing::debug!(error = %e, "arming writes for negotiation failed");
            }
            b.disarm_read();
        }
        Err(e) => {
            {
                let mut b = rc.borrow_mut();
                b.record_errno(&e);
                b.disarm_read();
                b.disarm_write();
                b.state = LinkState::Closed;
            }
            emit_status(rc, BevEvent::ERROR);
        }
    }
}

fn socket_read(rc: &Rc<RefCell<BevInner>>) {
    let mut fire_read = false;
    let mut eof = false;
    let mut error: Option<io::Error> = None;
    {
        let mut guard = rc.borrow_mut();
        let inner = &mut *guard;
        let Link::Transport(transport) = &mut inner.link else {
            return;
        };
        let mut got = 0usize;
        loop {
            let room = if inner.read_high > 0 {
                inner.read_high.saturating_sub(inner.input.len())
            } else {
                usize::MAX
            };
            let step = room.min(READ_MAX - got).min(READ_STEP);
            if step == 0 {
                break;
            }
            let mut reader = TransportReader(transport.as_mut());
            match inner.input.read_from(&mut reader, step) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }
        fire_read = got > 0 && inner.input.len() >= inner.read_low;
        if inner.read_high > 0 && inner.input.len() >= inner.read_high {
            inner.read_suspended = true;
            inner.disarm_read();
        }
        if eof || error.is_some() {
            inner.enabled = inner.enabled.remove(What::READ);
            inner.disarm_read();
            if let Some(e) = &error {
                inner.record_errno(e);
            }
        }
    }
    if fire_read {
        emit_read(rc);
    }
    if eof {
        emit_status(rc, BevEvent::READING.add(BevEvent::EOF));
    } else if error.is_some() {
        emit_status(rc, BevEvent::READING.add(BevEvent::ERROR));
    }
}

fn socket_write(rc: &Rc<RefCell<BevInner>>) {
    let mut fire_write = false;
    let mut error: Option<io::Error> = None;
    {
        let mut guard = rc.borrow_mut();
        let inner = &mut *guard;
        let Link::Transport(transport) = &mut inner.link else {
            return;
        };
        let len = inner.output.len();
        let mut progressed = false;
        if len > 0 {
            let mut writer = TransportWriter(transport.as_mut());
            match inner.output.write_to(&mut writer, len) {
                Ok(n) => progressed = n > 0,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => error = Some(e),
            }
        }
        if error.is_none() {
            match transport.flush() {
                Ok(()) => {}
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => error = Some(e),
            }
        }
        if inner.output.is_empty() && !transport.has_buffered_output() {
            inner.disarm_write();
        }
        fire_write = progressed && inner.output.len() <= inner.write_low && inner.enabled.is_write();
        if let Some(e) = &error {
            inner.record_errno(e);
            inner.enabled = inner.enabled.remove(What::WRITE);
            inner.disarm_write();
        }
    }
    if fire_write {
        emit_write(rc);
    }
    if error.is_some() {
        emit_status(rc, BevEvent::WRITING.add(BevEvent::ERROR));
    }
}

fn direction_timeout(rc: &Rc<RefCell<BevInner>>, direction: BevEvent) {
    {
        let mut b = rc.borrow_mut();
        if direction.contains(BevEvent::READING) {
            b.enabled = b.enabled.remove(What::READ);
            b.disarm_read();
        } else {
            b.enabled = b.enabled.remove(What::WRITE);
            b.disarm_write();
        }
    }
    emit_status(rc, direction.add(BevEvent::TIMEOUT));
}

fn emit_read(rc: &Rc<RefCell<BevInner>>) {
    let (defer, base) = {
        let b = rc.borrow();
        (
            b.options.contains(BevOptions::DEFER_CALLBACKS),
            b.base.clone(),
        )
    };
    if defer {
        let weak = Rc::downgrade(rc);
        base.defer(Box::new(move || {
            if let Some(rc) = weak.upgrade() {
                invoke_read(&rc);
            }
        }));
    } else {
        invoke_read(rc);
    }
}

fn emit_write(rc: &Rc<RefCell<BevInner>>) {
    let (defer, base) = {
        let b = rc.borrow();
        (
            b.options.contains(BevOptions::DEFER_CALLBACKS),
            b.base.clone(),
        )
    };
    if defer {
        let weak = Rc::downgrade(rc);
        base.defer(Box::new(move || {
            if let Some(rc) = weak.upgrade() {
                invoke_write(&rc);
            }
        }));
    } else {
        invoke_write(rc);
    }
}

fn emit_status(rc: &Rc<RefCell<BevInner>>, what: BevEvent) {
    let (defer, base) = {
        let b = rc.borrow();
        (
            b.options.contains(BevOptions::DEFER_CALLBACKS),
            b.base.clone(),
        )
    };
    if defer {
        let weak = Rc::downgrade(rc);
        base.defer(Box::new(move || {
            if let Some(rc) = weak.upgrade() {
                invoke_status(&rc, what);
            }
        }));
    } else {
        invoke_status(rc, what);
    }
}

// Callbacks are taken out of the slot while they run so they may call
// back into the buffer event; a replacement installed mid-callback wins
// over the restore.

fn invoke_read(rc: &Rc<RefCell<BevInner>>) {
    let cb = rc.borrow_mut().read_cb.take();
    if let Some(mut cb) = cb {
        let handle = BufferEvent {
            inner: Rc::clone(rc),
        };
        cb(&handle);
        let mut b = rc.borrow_mut();
        if b.read_cb.is_none() {
            b.read_cb = Some(cb);
        }
    }
}

fn invoke_write(rc: &Rc<RefCell<BevInner>>) {
    let cb = rc.borrow_mut().write_cb.take();
    if let Some(mut cb) = cb {
        let handle = BufferEvent {
            inner: Rc::clone(rc),
        };
        cb(&handle);
        let mut b = rc.borrow_mut();
        if b.write_cb.is_none() {
            b.write_cb = Some(cb);
        }
    }
}

fn invoke_status(rc: &Rc<RefCell<BevInner>>, what: BevEvent) {
    let cb = rc.borrow_mut().status_cb.take();
    if let Some(mut cb) = cb {
        let handle = BufferEvent {
            inner: Rc::clone(rc),
        };
        cb(&handle, what);
        let mut b = rc.borrow_mut();
        if b.status_cb.is_none() {
            b.status_cb = Some(cb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::LoopFlags;
    use std::os::unix::net::UnixStream;

    fn unix_socket_pair() -> (Socket, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        (Socket::from(a), b)
    }

    #[test]
    fn status_bits_match_wire_values() {
        assert_eq!(BevEvent::READING.bits(), 0x01);
        assert_eq!(BevEvent::WRITING.bits(), 0x02);
        assert_eq!(BevEvent::EOF.bits(), 0x10);
        assert_eq!(BevEvent::ERROR.bits(), 0x20);
        assert_eq!(BevEvent::TIMEOUT.bits(), 0x40);
        assert_eq!(BevEvent::CONNECTED.bits(), 0x80);
        assert_eq!(BevEvent::from_bits(0xff).bits(), 0xf3);
        assert_eq!(
            format!("{:?}", BevEvent::READING | BevEvent::EOF),
            "BevEvent(READING|EOF)"
        );
    }

    #[test]
    fn option_bits_match_wire_values() {
        assert_eq!(BevOptions::CLOSE_ON_FREE.bits(), 1);
        assert_eq!(BevOptions::THREADSAFE.bits(), 2);
        assert_eq!(BevOptions::DEFER_CALLBACKS.bits(), 4);
        assert_eq!(BevOptions::UNLOCK_CALLBACKS.bits(), 8);
        let all = BevOptions::CLOSE_ON_FREE | BevOptions::THREADSAFE;
        assert!(all.contains(BevOptions::THREADSAFE));
        assert!(!all.contains(BevOptions::DEFER_CALLBACKS));
    }

    #[test]
    fn writing_starts_enabled_and_reading_does_not() {
        let base = EventBase::new().unwrap();
        let bev = BufferEvent::new(&base, BevOptions::NONE);
        assert!(bev.enabled().is_write());
        assert!(!bev.enabled().is_read());
    }

    #[test]
    fn enable_rejects_non_direction_bits() {
        let base = EventBase::new().unwrap();
        let bev = BufferEvent::new(&base, BevOptions::NONE);
        assert!(bev.enable(What::SIGNAL).is_err());
        assert!(bev.enable(What::NONE).is_err());
        assert!(bev.enable(What::READ).is_ok());
    }

    #[test]
    fn writes_queue_while_unconnected() {
        let base = EventBase::new().unwrap();
        let bev = BufferEvent::new(&base, BevOptions::NONE);
        bev.write(b"queued until connect").unwrap();
        assert_eq!(bev.output_len(), 20);
        assert!(bev.fd().is_none());
    }

    #[test]
    fn connect_rejects_unparseable_address() {
        let base = EventBase::new().unwrap();
        let bev = BufferEvent::new(&base, BevOptions::NONE);
        assert!(bev.connect("not an address").is_err());
    }

    #[test]
    fn socket_bev_reports_descriptor_until_closed() {
        let base = EventBase::new().unwrap();
        let (sock, _peer) = unix_socket_pair();
        let bev = BufferEvent::socket(&base, sock, BevOptions::CLOSE_ON_FREE).unwrap();
        assert!(bev.fd().is_some());
        bev.close();
        assert!(bev.fd().is_none());
        assert_eq!(bev.enabled(), What::WRITE);
    }

    #[test]
    fn close_on_free_shuts_the_peer_stream() {
        use std::io::Read;

        let base = EventBase::new().unwrap();
        let (sock, peer) = unix_socket_pair();
        let bev = BufferEvent::socket(&base, sock, BevOptions::CLOSE_ON_FREE).unwrap();
        bev.free();
        drop(bev);

        let mut buf = [0u8; 4];
        assert_eq!((&peer).read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn free_without_close_on_free_leaves_descriptor_open() {
        use std::io::Read;

        let base = EventBase::new().unwrap();
        let (sock, peer) = unix_socket_pair();
        peer.set_nonblocking(true).unwrap();
        let fd = sock.as_raw_fd();
        let bev = BufferEvent::socket(&base, sock, BevOptions::NONE).unwrap();
        bev.free();
        drop(bev);

        let mut buf = [0u8; 4];
        let err = (&peer).read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        // Reclaim the released descriptor so the test cleans up.
        #[allow(unsafe_code)]
        // SAFETY: free() released ownership of fd and nothing else holds it.
        let _owned = unsafe { <Socket as std::os::unix::io::FromRawFd>::from_raw_fd(fd) };
    }

    #[test]
    fn socket_write_flushes_queued_output() {
        use std::io::Read;

        let base = EventBase::new().unwrap();
        let (sock, mut peer) = unix_socket_pair();
        let bev = BufferEvent::socket(&base, sock, BevOptions::CLOSE_ON_FREE).unwrap();
        bev.write(b"over the wire").unwrap();

        base.run(LoopFlags::ONCE).unwrap();
        assert_eq!(bev.output_len(), 0);

        let mut buf = [0u8; 32];
        let n = peer.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"over the wire");
        bev.free();
    }

    #[test]
    fn socket_read_fills_input_and_fires_callback() {
        use std::io::Write;

        let base = EventBase::new().unwrap();
        let (sock, mut peer) = unix_socket_pair();
        let bev = BufferEvent::socket(&base, sock, BevOptions::CLOSE_ON_FREE).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        bev.set_callbacks(
            Some(Box::new(move |b| {
                let bytes = b.read(usize::MAX).unwrap();
                sink.borrow_mut().extend_from_slice(&bytes);
            })),
            None,
            None,
        );
        bev.enable(What::READ).unwrap();

        peer.write_all(b"inbound").unwrap();
        base.run(LoopFlags::ONCE).unwrap();

        assert_eq!(seen.borrow().as_slice(), b"inbound");
        bev.free();
    }

    #[test]
    fn eof_reported_after_peer_closes() {
        let base = EventBase::new().unwrap();
        let (sock, peer) = unix_socket_pair();
        let bev = BufferEvent::socket(&base, sock, BevOptions::CLOSE_ON_FREE).unwrap();

        let status = Rc::new(RefCell::new(BevEvent::NONE));
        let sink = Rc::clone(&status);
        bev.set_callbacks(
            None,
            None,
            Some(Box::new(move |_b, what| {
                *sink.borrow_mut() |= what;
            })),
        );
        bev.enable(What::READ).unwrap();
        drop(peer);

        base.run(LoopFlags::ONCE).unwrap();

        let what = *status.borrow();
        assert!(what.contains(BevEvent::EOF));
        assert!(what.contains(BevEvent::READING));
        // The read side shut itself off.
        assert!(!bev.enabled().is_read());
        bev.free();
    }
}
