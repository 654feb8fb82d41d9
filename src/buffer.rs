//! Chunked byte queue with cheap append/drain at the ends.
//!
//! [`Buffer`] stores bytes as a ring of segments so that appending at the
//! back and draining at the front never shuffle the middle. Whole-segment
//! moves between buffers are pointer swaps, not copies.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::lock_api::ArcReentrantMutexGuard;
use parking_lot::{RawMutex, RawThreadId, ReentrantMutex};
use thiserror::Error;

/// Owning guard for the internal lock; holds the `Arc`, not a borrow, so it
/// can live across mutations of the buffer itself.
type HeldLock = ArcReentrantMutexGuard<RawMutex, RawThreadId, ()>;

/// Default capacity of a freshly allocated segment.
const SEGMENT_SIZE: usize = 4096;

/// One backing segment. Bytes before `start` have been drained.
#[derive(Debug)]
struct Chunk {
    data: Vec<u8>,
    start: usize,
}

impl Chunk {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            start: 0,
        }
    }

    fn from_vec(data: Vec<u8>) -> Self {
        Self { data, start: 0 }
    }

    #[inline]
    fn live(&self) -> &[u8] {
        &self.data[self.start..]
    }

    #[inline]
    fn live_len(&self) -> usize {
        self.data.len() - self.start
    }

    #[inline]
    fn spare(&self) -> usize {
        self.data.capacity() - self.data.len()
    }
}

/// Which end of a buffer an operation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    /// The drain end. Guards `prepend`, `drain`, `read`, `read_line`,
    /// `write_to`, and the source side of `move_from`.
    Front,
    /// The append end. Guards `append`, `read_from`, and the destination
    /// side of `move_from`.
    Back,
}

/// End-of-line recognition styles for [`Buffer::read_line`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EolStyle {
    /// Any run of consecutive CR and LF bytes terminates the line; the whole
    /// run is consumed.
    Any,
    /// An LF, optionally preceded by a CR.
    CrLf,
    /// Exactly the two-byte CR LF sequence.
    CrLfStrict,
    /// A lone LF.
    Lf,
}

/// A rejected buffer operation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// The touched end is frozen; unfreeze it first.
    #[error("buffer is frozen at the {0:?} end")]
    Frozen(End),
}

/// Guard returned by [`Buffer::lock`]; the lock is held until drop.
pub struct BufferLockGuard {
    _guard: ArcReentrantMutexGuard<RawMutex, RawThreadId, ()>,
}

impl std::fmt::Debug for BufferLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferLockGuard").finish_non_exhaustive()
    }
}

/// Growable chunked byte queue.
///
/// Bytes live in a deque of segments. `append` fills the spare tail of the
/// last segment before allocating; `drain` releases whole segments as their
/// last byte leaves. `move_from` splices whole segments across buffers
/// without copying.
///
/// All operations are defined on an empty buffer: reads return empty,
/// searches return `None`, drains drain nothing. The only failable calls are
/// those that hit a frozen end.
///
/// # Examples
///
/// ```
/// use evio::buffer::{Buffer, EolStyle};
///
/// let mut buf = Buffer::new();
/// buf.append(b"GET / HTTP/1.0\r\nHost: x\r\n").unwrap();
/// let line = buf.read_line(EolStyle::CrLf).unwrap();
/// assert_eq!(line.as_deref(), Some(&b"GET / HTTP/1.0"[..]));
/// assert_eq!(buf.len(), 8);
/// ```
pub struct Buffer {
    chunks: VecDeque<Chunk>,
    len: usize,
    frozen_front: bool,
    frozen_back: bool,
    lock: Option<Arc<ReentrantMutex<()>>>,
}

impl Buffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
            frozen_front: false,
            frozen_back: false,
            lock: None,
        }
    }

    /// Creates an empty buffer with one pre-allocated segment of at least
    /// `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let mut buf = Self::new();
        buf.reserve(capacity);
        buf
    }

    /// Total number of unread bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no unread bytes remain.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Length of the contiguous run at the front of the buffer.
    ///
    /// Bytes up to this length can be viewed without linearizing.
    #[must_use]
    pub fn front_len(&self) -> usize {
        self.chunks.front().map_or(0, Chunk::live_len)
    }

    /// Appends `bytes` at the back.
    ///
    /// Fills the spare tail of the last segment, then allocates one segment
    /// for the remainder.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let _held = self.hold_lock();
        if self.frozen_back {
            return Err(BufferError::Frozen(End::Back));
        }
        self.append_unchecked(bytes);
        Ok(())
    }

    /// Inserts `bytes` before the current front.
    ///
    /// Reuses drained space at the head of the front segment when it fits,
    /// otherwise pushes a new front segment.
    pub fn prepend(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let _held = self.hold_lock();
        if self.frozen_front {
            return Err(BufferError::Frozen(End::Front));
        }
        if bytes.is_empty() {
            return Ok(());
        }
        if let Some(front) = self.chunks.front_mut() {
            if front.start >= bytes.len() {
                let at = front.start - bytes.len();
                front.data[at..front.start].copy_from_slice(bytes);
                front.start = at;
                self.len += bytes.len();
                return Ok(());
            }
        }
        self.chunks.push_front(Chunk::from_vec(bytes.to_vec()));
        self.len += bytes.len();
        Ok(())
    }

    /// Discards up to `n` bytes from the front; returns how many went.
    pub fn drain(&mut self, n: usize) -> Result<usize, BufferError> {
        let _held = self.hold_lock();
        if self.frozen_front {
            return Err(BufferError::Frozen(End::Front));
        }
        Ok(self.drain_unchecked(n))
    }

    /// Removes and returns up to `max` bytes from the front.
    pub fn read(&mut self, max: usize) -> Result<Vec<u8>, BufferError> {
        let _held = self.hold_lock();
        if self.frozen_front {
            return Err(BufferError::Frozen(End::Front));
        }
        let take = max.min(self.len);
        let out = self.copy_range(0, take);
        self.drain_unchecked(take);
        Ok(out)
    }

    /// Copies up to `max` bytes from the front without draining them.
    #[must_use]
    pub fn copy_out(&self, max: usize) -> Vec<u8> {
        let _held = self.hold_lock();
        self.copy_range(0, max.min(self.len))
    }

    /// Copies `len` bytes starting at offset `start` (clamped to the
    /// available range). `None` takes everything from `start` on.
    #[must_use]
    pub fn substr(&self, start: usize, len: Option<usize>) -> Vec<u8> {
        let _held = self.hold_lock();
        let start = start.min(self.len);
        let avail = self.len - start;
        self.copy_range(start, len.unwrap_or(avail).min(avail))
    }

    /// Copies the whole content. Mostly useful in tests.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.copy_out(self.len)
    }

    /// Moves up to `n` bytes from the front of `src` to the back of `self`.
    ///
    /// Whole segments are spliced without copying; at most one partial
    /// segment is copied. Returns the number of bytes moved.
    ///
    /// # Examples
    ///
    /// ```
    /// use evio::buffer::Buffer;
    ///
    /// let mut a = Buffer::new();
    /// a.append(b"hello world").unwrap();
    /// let mut b = Buffer::new();
    /// b.move_from(&mut a, 5).unwrap();
    /// assert_eq!(b.to_vec(), b"hello");
    /// assert_eq!(a.to_vec(), b" world");
    /// ```
    pub fn move_from(&mut self, src: &mut Buffer, n: usize) -> Result<usize, BufferError> {
        let _held = self.hold_lock();
        let _src_held = src.hold_lock();
        if self.frozen_back {
            return Err(BufferError::Frozen(End::Back));
        }
        if src.frozen_front {
            return Err(BufferError::Frozen(End::Front));
        }
        let mut remaining = n.min(src.len);
        let moved = remaining;
        while remaining > 0 {
            let front_len = match src.chunks.front() {
                Some(chunk) => chunk.live_len(),
                None => break,
            };
            if front_len <= remaining {
                if let Some(chunk) = src.chunks.pop_front() {
                    src.len -= front_len;
                    remaining -= front_len;
                    self.len += front_len;
                    self.chunks.push_back(chunk);
                }
            } else if let Some(front) = src.chunks.front_mut() {
                let take = remaining;
                self.append_unchecked(&front.live()[..take]);
                front.start += take;
                src.len -= take;
                remaining = 0;
            }
        }
        Ok(moved)
    }

    /// Moves everything from `src` to the back of `self`.
    pub fn append_buffer(&mut self, src: &mut Buffer) -> Result<usize, BufferError> {
        let n = src.len;
        self.move_from(src, n)
    }

    /// Finds the first occurrence of `pattern` in `[start, end)`, scanning
    /// front to back. Offsets are absolute positions among the unread bytes.
    /// An empty pattern matches at `start`.
    #[must_use]
    pub fn search(&self, pattern: &[u8], start: usize, end: Option<usize>) -> Option<usize> {
        let _held = self.hold_lock();
        let window_end = end.unwrap_or(self.len).min(self.len);
        if pattern.is_empty() {
            return (start <= window_end).then_some(start);
        }
        if start >= window_end || window_end - start < pattern.len() {
            return None;
        }
        let last = window_end - pattern.len();
        let (mut ci, mut off) = self.locate(start);
        for pos in start..=last {
            let (sci, soff) = self.skip_empty(ci, off);
            ci = sci;
            off = soff;
            if self.matches_at(ci, off, pattern) {
                return Some(pos);
            }
            off += 1;
        }
        None
    }

    /// Finds the next line terminator at or after `start`.
    ///
    /// Returns the terminator's position and width, so the line occupies
    /// `[start, pos)` and the terminator `[pos, pos + width)`.
    #[must_use]
    pub fn search_eol(&self, start: usize, style: EolStyle) -> Option<(usize, usize)> {
        let _held = self.hold_lock();
        match style {
            EolStyle::Lf => self.search(b"\n", start, None).map(|p| (p, 1)),
            EolStyle::CrLfStrict => self.search(b"\r\n", start, None).map(|p| (p, 2)),
            EolStyle::CrLf => {
                let p = self.search(b"\n", start, None)?;
                if p > start && self.byte_at(p - 1) == Some(b'\r') {
                    Some((p - 1, 2))
                } else {
                    Some((p, 1))
                }
            }
            EolStyle::Any => {
                let mut pos = start;
                while pos < self.len {
                    match self.byte_at(pos) {
                        Some(b'\r' | b'\n') => {
                            let mut run = 1;
                            while matches!(self.byte_at(pos + run), Some(b'\r' | b'\n')) {
                                run += 1;
                            }
                            return Some((pos, run));
                        }
                        Some(_) => pos += 1,
                        None => break,
                    }
                }
                None
            }
        }
    }

    /// Removes and returns one line, excluding its terminator; the
    /// terminator is consumed. Returns `None` (buffer untouched) when no
    /// complete line is present.
    pub fn read_line(&mut self, style: EolStyle) -> Result<Option<Vec<u8>>, BufferError> {
        let _held = self.hold_lock();
        if self.frozen_front {
            return Err(BufferError::Frozen(End::Front));
        }
        let Some((pos, width)) = self.search_eol(0, style) else {
            return Ok(None);
        };
        let line = self.copy_range(0, pos);
        self.drain_unchecked(pos + width);
        Ok(Some(line))
    }

    /// Makes the first `size` bytes (all of them for `None`) contiguous and
    /// returns them as one slice.
    ///
    /// May copy up to `size` bytes into a fresh front segment; treat as
    /// expensive and keep `size` bounded on hot paths.
    pub fn linearize(&mut self, size: Option<usize>) -> &[u8] {
        let _held = self.hold_lock();
        let want = size.unwrap_or(self.len).min(self.len);
        if want == 0 {
            return &[];
        }
        let need_merge = self.chunks.front().map_or(true, |c| c.live_len() < want);
        if need_merge {
            let merged = self.copy_range(0, want);
            self.drain_unchecked(want);
            self.chunks.push_front(Chunk::from_vec(merged));
            self.len += want;
        }
        match self.chunks.front() {
            Some(front) => &front.live()[..want],
            None => &[],
        }
    }

    /// Ensures at least `n` bytes of contiguous spare space at the back.
    pub fn reserve(&mut self, n: usize) {
        let _held = self.hold_lock();
        if n == 0 {
            return;
        }
        let spare = self.chunks.back().map_or(0, Chunk::spare);
        if spare < n {
            self.chunks.push_back(Chunk::with_capacity(n.max(SEGMENT_SIZE)));
        }
    }

    /// Rejects mutations at one end until [`Buffer::unfreeze`].
    pub fn freeze(&mut self, end: End) {
        match end {
            End::Front => self.frozen_front = true,
            End::Back => self.frozen_back = true,
        }
    }

    /// Lifts a freeze set by [`Buffer::freeze`].
    pub fn unfreeze(&mut self, end: End) {
        match end {
            End::Front => self.frozen_front = false,
            End::Back => self.frozen_back = false,
        }
    }

    /// Reads once from `reader` into spare space at the back, at most `max`
    /// bytes. Returns the byte count from the underlying read (0 means EOF).
    pub fn read_from<R: io::Read>(&mut self, reader: &mut R, max: usize) -> io::Result<usize> {
        let _held = self.hold_lock();
        if self.frozen_back {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                BufferError::Frozen(End::Back),
            ));
        }
        if max == 0 {
            return Ok(0);
        }
        if self.chunks.back().map_or(0, Chunk::spare) < max {
            self.chunks.push_back(Chunk::with_capacity(max.max(SEGMENT_SIZE)));
        }
        let Some(tail) = self.chunks.back_mut() else {
            return Ok(0);
        };
        let old = tail.data.len();
        tail.data.resize(old + max, 0);
        match reader.read(&mut tail.data[old..old + max]) {
            Ok(n) => {
                tail.data.truncate(old + n);
                self.len += n;
                Ok(n)
            }
            Err(err) => {
                tail.data.truncate(old);
                Err(err)
            }
        }
    }

    /// Writes up to `max` bytes from the front into `writer`, draining what
    /// was written. A would-block after partial progress reports the partial
    /// count as success.
    pub fn write_to<W: io::Write>(&mut self, writer: &mut W, max: usize) -> io::Result<usize> {
        let _held = self.hold_lock();
        if self.frozen_front {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                BufferError::Frozen(End::Front),
            ));
        }
        let mut written = 0;
        while written < max && self.len > 0 {
            let (take, result) = match self.chunks.front() {
                Some(front) => {
                    let live = front.live();
                    let take = live.len().min(max - written);
                    (take, writer.write(&live[..take]))
                }
                None => break,
            };
            match result {
                Ok(0) => break,
                Ok(n) => {
                    self.drain_unchecked(n);
                    written += n;
                    if n < take {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock && written > 0 => break,
                Err(err) => return Err(err),
            }
        }
        Ok(written)
    }

    /// Switches the buffer to locked mode: every later operation acquires an
    /// internal reentrant lock, and [`Buffer::lock`] hands out explicit
    /// guards. Irreversible, like the original API.
    pub fn enable_locking(&mut self) {
        if self.lock.is_none() {
            self.lock = Some(Arc::new(ReentrantMutex::new(())));
        }
    }

    /// Acquires the buffer lock for an explicit multi-operation scope.
    /// Returns `None` unless [`Buffer::enable_locking`] was called.
    #[must_use]
    pub fn lock(&self) -> Option<BufferLockGuard> {
        self.lock.as_ref().map(|lock| BufferLockGuard {
            _guard: lock.lock_arc(),
        })
    }

    /// Shared handle to the lock, for owners that hold it across callbacks.
    pub(crate) fn shared_lock(&self) -> Option<Arc<ReentrantMutex<()>>> {
        self.lock.clone()
    }

    fn hold_lock(&self) -> Option<HeldLock> {
        self.lock.as_ref().map(|lock| lock.lock_arc())
    }

    fn append_unchecked(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut rest = bytes;
        if let Some(tail) = self.chunks.back_mut() {
            let take = tail.spare().min(rest.len());
            if take > 0 {
                tail.data.extend_from_slice(&rest[..take]);
                rest = &rest[take..];
            }
        }
        if !rest.is_empty() {
            let mut chunk = Chunk::with_capacity(rest.len().max(SEGMENT_SIZE));
            chunk.data.extend_from_slice(rest);
            self.chunks.push_back(chunk);
        }
        self.len += bytes.len();
    }

    fn drain_unchecked(&mut self, n: usize) -> usize {
        let mut remaining = n.min(self.len);
        let drained = remaining;
        while remaining > 0 {
            let front_len = match self.chunks.front() {
                Some(chunk) => chunk.live_len(),
                None => break,
            };
            if front_len <= remaining {
                self.chunks.pop_front();
                remaining -= front_len;
            } else if let Some(front) = self.chunks.front_mut() {
                front.start += remaining;
                remaining = 0;
            }
        }
        self.len -= drained;
        drained
    }

    /// Copies `n` bytes starting at absolute offset `start`. Caller clamps.
    fn copy_range(&self, start: usize, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n);
        let (mut ci, mut off) = self.locate(start);
        while out.len() < n && ci < self.chunks.len() {
            let live = self.chunks[ci].live();
            if off < live.len() {
                let take = (n - out.len()).min(live.len() - off);
                out.extend_from_slice(&live[off..off + take]);
            }
            ci += 1;
            off = 0;
        }
        out
    }

    /// Maps an absolute offset to (chunk index, offset inside chunk).
    fn locate(&self, mut at: usize) -> (usize, usize) {
        for (i, chunk) in self.chunks.iter().enumerate() {
            let l = chunk.live_len();
            if at < l {
                return (i, at);
            }
            at -= l;
        }
        (self.chunks.len(), 0)
    }

    fn skip_empty(&self, mut ci: usize, mut off: usize) -> (usize, usize) {
        while ci < self.chunks.len() && off >= self.chunks[ci].live_len() {
            off -= self.chunks[ci].live_len();
            ci += 1;
        }
        (ci, off)
    }

    fn byte_at(&self, at: usize) -> Option<u8> {
        if at >= self.len {
            return None;
        }
        let (ci, off) = self.locate(at);
        self.chunks.get(ci).map(|chunk| chunk.live()[off])
    }

    /// Compares `pattern` against bytes beginning at (chunk `ci`, offset
    /// `off`), advancing across segment boundaries.
    fn matches_at(&self, mut ci: usize, mut off: usize, pattern: &[u8]) -> bool {
        for &expected in pattern {
            let (nci, noff) = self.skip_empty(ci, off);
            ci = nci;
            off = noff;
            match self.chunks.get(ci) {
                Some(chunk) if chunk.live()[off] == expected => off += 1,
                _ => return false,
            }
        }
        true
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        let mut buf = Self::new();
        let len = data.len();
        if len > 0 {
            buf.chunks.push_back(Chunk::from_vec(data));
            buf.len = len;
        }
        buf
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Self::from(data.to_vec())
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("segments", &self.chunks.len())
            .field("frozen_front", &self.frozen_front)
            .field("frozen_back", &self.frozen_back)
            .finish()
    }
}
