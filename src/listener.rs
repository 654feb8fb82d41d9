//! Accepting listeners for stream sockets.
//!
//! A [`Listener`] owns a listening socket and a persistent read event on
//! its base. Each readiness wakeup drains the accept queue, handing
//! every new connection to the accept callback as a ready
//! [`socket2::Socket`] plus the peer address. Accept failures that are
//! not transient go to an optional error callback.
//!
//! # Defaults
//!
//! | Knob | Default |
//! |------|---------|
//! | backlog (negative requested) | 128 |
//! | accepted sockets | nonblocking unless [`ListenerOptions::LEAVE_SOCKETS_BLOCKING`] |
//! | state after construction | enabled |

use crate::error::Error;
use crate::event::{Event, What};
use crate::reactor::EventBase;
use socket2::{SockAddr, Socket, Type};
use std::cell::RefCell;
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::rc::{Rc, Weak};

/// Listen backlog used when the caller passes a negative one.
const DEFAULT_BACKLOG: i32 = 128;

/// Construction flags for a [`Listener`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ListenerOptions(u8);

impl ListenerOptions {
    /// No options.
    pub const NONE: ListenerOptions = ListenerOptions(0);
    /// Hand accepted sockets over still in blocking mode.
    pub const LEAVE_SOCKETS_BLOCKING: ListenerOptions = ListenerOptions(0x01);
    /// Close the listening socket when the listener is freed.
    pub const CLOSE_ON_FREE: ListenerOptions = ListenerOptions(0x02);
    /// Set close-on-exec on the listening socket.
    pub const CLOSE_ON_EXEC: ListenerOptions = ListenerOptions(0x04);
    /// Allow rebinding the address without waiting out `TIME_WAIT`.
    pub const REUSEABLE: ListenerOptions = ListenerOptions(0x08);
    /// Accepted for compatibility; callbacks already run from the single
    /// loop thread, so this changes nothing.
    pub const THREADSAFE: ListenerOptions = ListenerOptions(0x10);

    const ALL: u8 = 0x1f;

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
    pub const fn contains(self, other: ListenerOptions) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of `self` and `other`.
    #[must_use]
    pub const fn add(self, other: ListenerOptions) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for ListenerOptions {
    type Output = ListenerOptions;

    fn bitor(self, rhs: ListenerOptions) -> ListenerOptions {
        self.add(rhs)
    }
}

impl fmt::Debug for ListenerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::LEAVE_SOCKETS_BLOCKING, "LEAVE_SOCKETS_BLOCKING"),
            (Self::CLOSE_ON_FREE, "CLOSE_ON_FREE"),
            (Self::CLOSE_ON_EXEC, "CLOSE_ON_EXEC"),
            (Self::REUSEABLE, "REUSEABLE"),
            (Self::THREADSAFE, "THREADSAFE"),
        ];
        write!(f, "ListenerOptions(")?;
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

/// Callback fired once per accepted connection.
pub type AcceptCallback = Box<dyn FnMut(&Listener, Socket, SockAddr)>;

/// Callback fired when accepting fails with a non-transient error.
pub type ListenerErrorCallback = Box<dyn FnMut(&Listener, io::Error)>;

struct ListenerInner {
    socket: Option<Socket>,
    event: Option<Event>,
    accept_cb: Option<AcceptCallback>,
    error_cb: Option<ListenerErrorCallback>,
    options: ListenerOptions,
    enabled: bool,
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        if let Some(ev) = self.event.take() {
            ev.free();
        }
        if !self.options.contains(ListenerOptions::CLOSE_ON_FREE) {
            if let Some(socket) = self.socket.take() {
                let _ = socket.into_raw_fd();
            }
        }
    }
}

/// A listening socket whose accept queue is drained by the base.
///
/// Clones share the same listener. Construction leaves it enabled;
/// connections arriving while it is disabled wait in the kernel backlog.
#[derive(Clone)]
pub struct Listener {
    inner: Rc<RefCell<ListenerInner>>,
}

impl Listener {
    /// Binds a fresh socket to `address` (`ip:port` or `unix:path`),
    /// listens, and registers it with `base`. A negative `backlog` picks
    /// the default.
    pub fn bind<F>(
        base: &EventBase,
        address: &str,
        options: ListenerOptions,
        backlog: i32,
        callback: F,
    ) -> crate::Result<Self>
    where
        F: FnMut(&Listener, Socket, SockAddr) + 'static,
    {
        let (addr, domain) = crate::util::parse_addr(address)?;
        let socket = Socket::new(domain, Type::STREAM, None)?;
        if options.contains(ListenerOptions::REUSEABLE) {
            socket.set_reuse_address(true)?;
        }
        if options.contains(ListenerOptions::CLOSE_ON_EXEC) {
            socket.set_cloexec(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr)?;
        let backlog = if backlog < 0 { DEFAULT_BACKLOG } else { backlog };
        socket.listen(backlog)?;
        tracing::debug!(
            address = %crate::util::format_addr(&addr),
            backlog,
            "listener bound"
        );
        Self::attach(base, socket, options, Box::new(callback))
    }

    /// Registers an already listening socket with `base`. The socket is
    /// switched to nonblocking mode.
    pub fn from_socket<F>(
        base: &EventBase,
        socket: Socket,
        options: ListenerOptions,
        callback: F,
    ) -> crate::Result<Self>
    where
        F: FnMut(&Listener, Socket, SockAddr) + 'static,
    {
        socket.set_nonblocking(true)?;
        Self::attach(base, socket, options, Box::new(callback))
    }

    fn attach(
        base: &EventBase,
        socket: Socket,
        options: ListenerOptions,
        callback: AcceptCallback,
    ) -> crate::Result<Self> {
        let fd = socket.as_raw_fd();
        let inner = Rc::new(RefCell::new(ListenerInner {
            socket: Some(socket),
            event: None,
            accept_cb: Some(callback),
            error_cb: None,
            options,
            enabled: true,
        }));
        let weak = Rc::downgrade(&inner);
        let event = Event::new(base, fd, What::READ.add(What::PERSIST), move |_ev, _what| {
            accept_ready(&weak);
        })?;
        event.add(None)?;
        inner.borrow_mut().event = Some(event);
        Ok(Self { inner })
    }

    /// Resumes accepting.
    pub fn enable(&self) -> crate::Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.enabled = true;
        if let Some(ev) = &inner.event {
            ev.add(None)?;
        }
        Ok(())
    }

    /// Stops accepting; pending connections stay in the kernel backlog.
    pub fn disable(&self) -> crate::Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.enabled = false;
        if let Some(ev) = &inner.event {
            ev.remove()?;
        }
        Ok(())
    }

    /// Replaces the accept callback. Takes effect for the next
    /// connection, even mid-drain.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: FnMut(&Listener, Socket, SockAddr) + 'static,
    {
        self.inner.borrow_mut().accept_cb = Some(Box::new(callback));
    }

    /// Installs a callback for non-transient accept failures.
    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: FnMut(&Listener, io::Error) + 'static,
    {
        self.inner.borrow_mut().error_cb = Some(Box::new(callback));
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> crate::Result<SockAddr> {
        let inner = self.inner.borrow();
        let Some(socket) = &inner.socket else {
            return Err(Error::Config {
                reason: "listener socket is closed".to_string(),
            });
        };
        Ok(socket.local_addr()?)
    }

    /// The listening descriptor, if the listener is still open.
    #[must_use]
    pub fn fd(&self) -> Option<RawFd> {
        self.inner
            .borrow()
            .socket
            .as_ref()
            .map(|s| s.as_raw_fd())
    }

    /// Tears the listener down: the event is freed, callbacks dropped,
    /// and the socket closed or released per
    /// [`ListenerOptions::CLOSE_ON_FREE`]. Without that option the
    /// descriptor stays open and the caller keeps ownership of it.
    pub fn free(&self) {
        let mut inner = self.inner.borrow_mut();
        if let Some(ev) = inner.event.take() {
            ev.free();
        }
        if let Some(socket) = inner.socket.take() {
            if inner.options.contains(ListenerOptions::CLOSE_ON_FREE) {
                drop(socket);
            } else {
                let _ = socket.into_raw_fd();
            }
        }
        inner.accept_cb = None;
        inner.error_cb = None;
        inner.enabled = false;
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Listener")
            .field("fd", &inner.socket.as_ref().map(|s| s.as_raw_fd()))
            .field("enabled", &inner.enabled)
            .field("options", &inner.options)
            .finish()
    }
}

/// Drains the accept queue, one callback per connection.
fn accept_ready(weak: &Weak<RefCell<ListenerInner>>) {
    let Some(rc) = weak.upgrade() else { return };
    loop {
        {
            let inner = rc.borrow();
            if !inner.enabled || inner.socket.is_none() {
                return;
            }
        }
        let result = {
            let inner = rc.borrow();
            match &inner.socket {
                Some(socket) => socket.accept(),
                None => return,
            }
        };
        match result {
            Ok((socket, addr)) => {
                let leave_blocking = rc
                    .borrow()
                    .options
                    .contains(ListenerOptions::LEAVE_SOCKETS_BLOCKING);
                if !leave_blocking {
                    if let Err(e) = socket.set_nonblocking(true) {
                        tracing::debug!(error = %e, "accepted socket kept blocking mode");
                    }
                }
                tracing::trace!(peer = %crate::util::format_addr(&addr), "connection accepted");
                invoke_accept(&rc, socket, addr);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.raw_os_error() == Some(libc::ECONNABORTED) => {}
            Err(e) => {
                invoke_error(&rc, e);
                return;
            }
        }
    }
}

fn invoke_accept(rc: &Rc<RefCell<ListenerInner>>, socket: Socket, addr: SockAddr) {
    let cb = rc.borrow_mut().accept_cb.take();
    if let Some(mut cb) = cb {
        let handle = Listener {
            inner: Rc::clone(rc),
        };
        cb(&handle, socket, addr);
        let mut inner = rc.borrow_mut();
        if inner.accept_cb.is_none() {
            inner.accept_cb = Some(cb);
        }
    }
}

fn invoke_error(rc: &Rc<RefCell<ListenerInner>>, error: io::Error) {
    let cb = rc.borrow_mut().error_cb.take();
    match cb {
        Some(mut cb) => {
            let handle = Listener {
                inner: Rc::clone(rc),
            };
            cb(&handle, error);
            let mut inner = rc.borrow_mut();
            if inner.error_cb.is_none() {
                inner.error_cb = Some(cb);
            }
        }
        None => {
            tracing::debug!(error = %error, "accept failed with no error callback installed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::LoopFlags;
    use std::net::TcpStream;

    #[test]
    fn option_bits_match_wire_values() {
        assert_eq!(ListenerOptions::LEAVE_SOCKETS_BLOCKING.bits(), 1);
        assert_eq!(ListenerOptions::CLOSE_ON_FREE.bits(), 2);
        assert_eq!(ListenerOptions::CLOSE_ON_EXEC.bits(), 4);
        assert_eq!(ListenerOptions::REUSEABLE.bits(), 8);
        assert_eq!(ListenerOptions::THREADSAFE.bits(), 16);
        assert_eq!(ListenerOptions::from_bits(0xff).bits(), 0x1f);
    }

    #[test]
    fn bound_listener_reports_real_port() {
        let base = EventBase::new().unwrap();
        let listener = Listener::bind(
            &base,
            "127.0.0.1:0",
            ListenerOptions::CLOSE_ON_FREE,
            -1,
            |_l, _s, _a| {},
        )
        .unwrap();
        let addr = listener.local_addr().unwrap().as_socket().unwrap();
        assert_ne!(addr.port(), 0);
        listener.free();
    }

    #[test]
    fn accepts_a_connection_and_hands_over_a_usable_socket() {
        use std::io::Read;

        let base = EventBase::new().unwrap();
        let accepted = Rc::new(RefCell::new(0u32));
        let count = Rc::clone(&accepted);
        let listener = Listener::bind(
            &base,
            "127.0.0.1:0",
            ListenerOptions::CLOSE_ON_FREE | ListenerOptions::REUSEABLE,
            -1,
            move |_l, socket, _addr| {
                *count.borrow_mut() += 1;
                socket.send(b"welcome").unwrap();
            },
        )
        .unwrap();

        let addr = listener.local_addr().unwrap().as_socket().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        base.run(LoopFlags::ONCE).unwrap();

        assert_eq!(*accepted.borrow(), 1);
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"welcome");
        listener.free();
    }

    #[test]
    fn disabled_listener_defers_connections_to_the_backlog() {
        let base = EventBase::new().unwrap();
        let accepted = Rc::new(RefCell::new(0u32));
        let count = Rc::clone(&accepted);
        let listener = Listener::bind(
            &base,
            "127.0.0.1:0",
            ListenerOptions::CLOSE_ON_FREE,
            -1,
            move |_l, _s, _a| {
                *count.borrow_mut() += 1;
            },
        )
        .unwrap();
        listener.disable().unwrap();

        let addr = listener.local_addr().unwrap().as_socket().unwrap();
        let _client = TcpStream::connect(addr).unwrap();

        base.run(LoopFlags::NONBLOCK).unwrap();
        assert_eq!(*accepted.borrow(), 0);

        listener.enable().unwrap();
        base.run(LoopFlags::ONCE).unwrap();
        assert_eq!(*accepted.borrow(), 1);
        listener.free();
    }

    #[test]
    fn free_with_close_on_free_refuses_new_connections() {
        let base = EventBase::new().unwrap();
        let listener = Listener::bind(
            &base,
            "127.0.0.1:0",
            ListenerOptions::CLOSE_ON_FREE,
            -1,
            |_l, _s, _a| {},
        )
        .unwrap();
        let addr = listener.local_addr().unwrap().as_socket().unwrap();
        listener.free();
        assert!(listener.fd().is_none());
        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn accepts_over_unix_domain() {
        use std::os::unix::net::UnixStream;

        let base = EventBase::new().unwrap();
        let path = std::env::temp_dir().join(format!("evio-listener-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let address = format!("unix:{}", path.display());

        let accepted = Rc::new(RefCell::new(0u32));
        let count = Rc::clone(&accepted);
        let listener = Listener::bind(
            &base,
            &address,
            ListenerOptions::CLOSE_ON_FREE,
            -1,
            move |_l, _s, _a| {
                *count.borrow_mut() += 1;
            },
        )
        .unwrap();

        let _client = UnixStream::connect(&path).unwrap();
        base.run(LoopFlags::ONCE).unwrap();
        assert_eq!(*accepted.borrow(), 1);

        listener.free();
        let _ = std::fs::remove_file(&path);
    }
}
