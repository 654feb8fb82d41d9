//! Byte transports underneath a buffer event.
//!
//! Anything that can move bytes and surface would-block can sit under a
//! [`BufferEvent`](super::BufferEvent): a nonblocking socket, or a
//! [`FilteredTransport`](super::FilteredTransport) stacked on one. Reads
//! and writes follow `std::io` conventions (`Ok(0)` on a read is
//! end-of-stream, `WouldBlock` means retry on the next readiness).

use socket2::Socket;
use std::io;
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

/// Progress of a transport's post-connect negotiation.
///
/// Plain sockets are [`Ready`](NegotiateStatus::Ready) from the start;
/// filters report which direction they need to continue a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiateStatus {
    /// Negotiation finished; the transport carries application bytes.
    Ready,
    /// Blocked until the descriptor is readable.
    WantRead,
    /// Blocked until the descriptor is writable.
    WantWrite,
}

/// Byte stream driven by descriptor readiness.
pub trait Transport {
    /// Reads into `buf`. `Ok(0)` is end-of-stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes from `buf`, returning how many bytes were accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Pushes internally buffered bytes onward. `WouldBlock` when some
    /// remain.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Shuts down both directions of the stream.
    fn shutdown(&mut self) -> io::Result<()>;

    /// The descriptor whose readiness drives this transport, if any.
    fn as_raw_fd(&self) -> Option<RawFd> {
        None
    }

    /// Advances any handshake this transport performs after the raw
    /// connection exists.
    fn poll_negotiate(&mut self) -> io::Result<NegotiateStatus> {
        Ok(NegotiateStatus::Ready)
    }

    /// True while bytes already accepted by [`Transport::write`] still sit
    /// inside the transport waiting for the descriptor.
    fn has_buffered_output(&self) -> bool {
        false
    }

    /// Gives up ownership of the descriptor without closing it. `None`
    /// when the transport has nothing to hand over.
    fn release(self: Box<Self>) -> Option<RawFd> {
        None
    }
}

/// A nonblocking stream socket as a [`Transport`].
pub struct SocketTransport {
    socket: Socket,
}

impl SocketTransport {
    /// Wraps a socket. The caller has already put it into nonblocking
    /// mode.
    #[must_use]
    pub fn new(socket: Socket) -> Self {
        Self { socket }
    }

    /// The wrapped socket.
    #[must_use]
    pub fn socket(&self) -> &Socket {
        &self.socket
    }
}

impl Transport for SocketTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &self.socket, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &self.socket, buf)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.socket.shutdown(Shutdown::Both)
    }

    fn as_raw_fd(&self) -> Option<RawFd> {
        Some(self.socket.as_raw_fd())
    }

    fn release(self: Box<Self>) -> Option<RawFd> {
        Some(self.socket.into_raw_fd())
    }
}

/// `io::Read` view over a transport, for [`Buffer::read_from`].
///
/// [`Buffer::read_from`]: crate::buffer::Buffer::read_from
pub(super) struct TransportReader<'a>(pub(super) &'a mut dyn Transport);

impl io::Read for TransportReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// `io::Write` view over a transport, for [`Buffer::write_to`].
///
/// [`Buffer::write_to`]: crate::buffer::Buffer::write_to
pub(super) struct TransportWriter<'a>(pub(super) &'a mut dyn Transport);

impl io::Write for TransportWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}
