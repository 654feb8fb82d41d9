//! Byte-rewriting filters stacked on a transport.
//!
//! A [`TransportFilter`] translates between wire bytes and application
//! bytes: compression, framing, or a handshake protocol. Wrapping a
//! transport in a [`FilteredTransport`] gives the buffer event the plain
//! view while the filter speaks the wire format underneath.
//!
//! ```text
//!   buffer event <-> FilteredTransport <-> inner Transport <-> fd
//!                     decode ^ | encode
//!                            | v
//!                       TransportFilter
//! ```

use crate::buffer::Buffer;
use crate::bufferevent::transport::{NegotiateStatus, Transport};
use std::io;
use std::os::unix::io::RawFd;

/// Size of one pull from the inner transport while decoding.
const RAW_CHUNK: usize = 4096;

/// Translates between wire bytes and application bytes.
///
/// Both translation hooks consume from their source buffer and append to
/// their destination. A filter holding back bytes until a full frame
/// arrives simply leaves them in the source buffer.
pub trait TransportFilter {
    /// Advances a handshake over the inner transport. Called while the
    /// buffer event is connecting; the stream carries application data
    /// only once this returns [`NegotiateStatus::Ready`].
    fn poll_negotiate(&mut self, inner: &mut dyn Transport) -> io::Result<NegotiateStatus> {
        let _ = inner;
        Ok(NegotiateStatus::Ready)
    }

    /// Turns wire bytes from `raw` into application bytes on `decoded`.
    fn decode(&mut self, raw: &mut Buffer, decoded: &mut Buffer) -> io::Result<()>;

    /// Turns application bytes from `plain` into wire bytes on `encoded`.
    fn encode(&mut self, plain: &mut Buffer, encoded: &mut Buffer) -> io::Result<()>;
}

/// A transport that routes all bytes through a [`TransportFilter`].
///
/// Writes are encoded eagerly and parked in an internal wire buffer, so
/// [`Transport::has_buffered_output`] stays true until the inner
/// transport has drained it.
pub struct FilteredTransport {
    inner: Box<dyn Transport>,
    filter: Box<dyn TransportFilter>,
    raw_in: Buffer,
    decoded: Buffer,
    raw_out: Buffer,
}

impl FilteredTransport {
    /// Stacks `filter` on top of `inner`.
    #[must_use]
    pub fn new(inner: Box<dyn Transport>, filter: Box<dyn TransportFilter>) -> Self {
        Self {
            inner,
            filter,
            raw_in: Buffer::new(),
            decoded: Buffer::new(),
            raw_out: Buffer::new(),
        }
    }

    fn decode_pending(&mut self) -> io::Result<()> {
        self.filter.decode(&mut self.raw_in, &mut self.decoded)
    }

    fn flush_raw_out(&mut self) -> io::Result<()> {
        struct InnerWriter<'a>(&'a mut dyn Transport);
        impl io::Write for InnerWriter<'_> {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.write(buf)
            }
            fn flush(&mut self) -> io::Result<()> {
                self.0.flush()
            }
        }

        let len = self.raw_out.len();
        if len > 0 {
            let mut writer = InnerWriter(self.inner.as_mut());
            match self.raw_out.write_to(&mut writer, len) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        self.inner.flush()
    }
}

impl Transport for FilteredTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.decoded.is_empty() {
                let chunk = self.decoded.copy_out(buf.len());
                buf[..chunk.len()].copy_from_slice(&chunk);
                self.decoded
                    .drain(chunk.len())
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                return Ok(chunk.len());
            }
            let mut scratch = [0u8; RAW_CHUNK];
            let n = self.inner.read(&mut scratch)?;
            if n == 0 {
                // Stream ended; give the filter one last look at what is
                // left, then report end-of-stream if nothing came out.
                self.decode_pending()?;
                if self.decoded.is_empty() {
                    return Ok(0);
                }
                continue;
            }
            self.raw_in
                .append(&scratch[..n])
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            self.decode_pending()?;
            // A partial frame leaves decoded empty; loop for more wire
            // bytes until the inner transport would block.
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut plain = Buffer::from(buf);
        self.filter.encode(&mut plain, &mut self.raw_out)?;
        // The bytes are committed to the wire buffer either way; a full
        // inner transport just leaves them for the next flush.
        match self.flush_raw_out() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_raw_out()?;
        if self.raw_out.is_empty() {
            Ok(())
        } else {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown()
    }

    fn as_raw_fd(&self) -> Option<RawFd> {
        self.inner.as_raw_fd()
    }

    fn poll_negotiate(&mut self) -> io::Result<NegotiateStatus> {
        self.filter.poll_negotiate(self.inner.as_mut())
    }

    fn has_buffered_output(&self) -> bool {
        !self.raw_out.is_empty() || self.inner.has_buffered_output()
    }

    fn release(self: Box<Self>) -> Option<RawFd> {
        self.inner.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// In-memory transport: reads pop from `incoming`, writes push to a
    /// shared `outgoing` the test can inspect, and an empty `incoming`
    /// reports would-block.
    struct MemoryTransport {
        incoming: VecDeque<u8>,
        outgoing: Rc<RefCell<Vec<u8>>>,
        eof: bool,
    }

    impl MemoryTransport {
        fn new() -> Self {
            Self {
                incoming: VecDeque::new(),
                outgoing: Rc::new(RefCell::new(Vec::new())),
                eof: false,
            }
        }
    }

    impl Transport for MemoryTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.incoming.is_empty() {
                if self.eof {
                    return Ok(0);
                }
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let mut n = 0;
            while n < buf.len() {
                match self.incoming.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outgoing.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn shutdown(&mut self) -> io::Result<()> {
            self.eof = true;
            Ok(())
        }
    }

    /// XORs every byte with a key; a stand-in for a real codec.
    struct XorFilter(u8);

    impl XorFilter {
        fn apply(key: u8, src: &mut Buffer, dst: &mut Buffer) -> io::Result<()> {
            let bytes = src.read(src.len()).unwrap();
            let masked: Vec<u8> = bytes.iter().map(|b| b ^ key).collect();
            dst.append(&masked).unwrap();
            Ok(())
        }
    }

    impl TransportFilter for XorFilter {
        fn decode(&mut self, raw: &mut Buffer, decoded: &mut Buffer) -> io::Result<()> {
            Self::apply(self.0, raw, decoded)
        }

        fn encode(&mut self, plain: &mut Buffer, encoded: &mut Buffer) -> io::Result<()> {
            Self::apply(self.0, plain, encoded)
        }
    }

    #[test]
    fn write_encodes_onto_the_wire() {
        let inner = MemoryTransport::new();
        let wire = Rc::clone(&inner.outgoing);
        let mut transport =
            FilteredTransport::new(Box::new(inner), Box::new(XorFilter(0xff)));

        assert_eq!(transport.write(b"\x00\x01").unwrap(), 2);
        assert_eq!(wire.borrow().as_slice(), &[0xff, 0xfe]);
        assert!(!transport.has_buffered_output());
    }

    #[test]
    fn read_decodes_wire_bytes() {
        let mut inner = MemoryTransport::new();
        inner.incoming.extend(b"hello".iter().map(|b| b ^ 0x20));
        let mut transport =
            FilteredTransport::new(Box::new(inner), Box::new(XorFilter(0x20)));

        let mut buf = [0u8; 16];
        let n = transport.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        let err = transport.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn eof_passes_through_after_final_decode() {
        let mut inner = MemoryTransport::new();
        inner.eof = true;
        let mut transport =
            FilteredTransport::new(Box::new(inner), Box::new(XorFilter(0)));
        let mut buf = [0u8; 8];
        assert_eq!(transport.read(&mut buf).unwrap(), 0);
    }

    /// Holds bytes until a two-byte length prefix worth of payload has
    /// arrived, exercising the partial-frame path.
    struct FrameFilter;

    impl TransportFilter for FrameFilter {
        fn decode(&mut self, raw: &mut Buffer, decoded: &mut Buffer) -> io::Result<()> {
            loop {
                let header = raw.copy_out(2);
                if header.len() < 2 {
                    return Ok(());
                }
                let need = usize::from(u16::from_be_bytes([header[0], header[1]]));
                if raw.len() < 2 + need {
                    return Ok(());
                }
                raw.drain(2).unwrap();
                let payload = raw.read(need).unwrap();
                decoded.append(&payload).unwrap();
            }
        }

        fn encode(&mut self, plain: &mut Buffer, encoded: &mut Buffer) -> io::Result<()> {
            let payload = plain.read(plain.len()).unwrap();
            let len = u16::try_from(payload.len()).unwrap();
            encoded.append(&len.to_be_bytes()).unwrap();
            encoded.append(&payload).unwrap();
            Ok(())
        }
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut inner = MemoryTransport::new();
        // Frame says 4 payload bytes but only 2 have arrived.
        inner.incoming.extend([0, 4, b'a', b'b']);
        let mut transport = FilteredTransport::new(Box::new(inner), Box::new(FrameFilter));

        let mut buf = [0u8; 8];
        let err = transport.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    /// Negotiator that needs a fixed number of polls before it is ready.
    struct SlowNegotiator {
        rounds_left: u32,
    }

    impl TransportFilter for SlowNegotiator {
        fn poll_negotiate(&mut self, _inner: &mut dyn Transport) -> io::Result<NegotiateStatus> {
            if self.rounds_left == 0 {
                return Ok(NegotiateStatus::Ready);
            }
            self.rounds_left -= 1;
            Ok(NegotiateStatus::WantRead)
        }

        fn decode(&mut self, raw: &mut Buffer, decoded: &mut Buffer) -> io::Result<()> {
            decoded.append_buffer(raw).map(|_| ()).map_err(|e| {
                io::Error::new(io::ErrorKind::Other, e)
            })
        }

        fn encode(&mut self, plain: &mut Buffer, encoded: &mut Buffer) -> io::Result<()> {
            encoded.append_buffer(plain).map(|_| ()).map_err(|e| {
                io::Error::new(io::ErrorKind::Other, e)
            })
        }
    }

    #[test]
    fn negotiation_reports_progress() {
        let mut transport = FilteredTransport::new(
            Box::new(MemoryTransport::new()),
            Box::new(SlowNegotiator { rounds_left: 2 }),
        );
        assert_eq!(transport.poll_negotiate().unwrap(), NegotiateStatus::WantRead);
        assert_eq!(transport.poll_negotiate().unwrap(), NegotiateStatus::WantRead);
        assert_eq!(transport.poll_negotiate().unwrap(), NegotiateStatus::Ready);
    }
}
