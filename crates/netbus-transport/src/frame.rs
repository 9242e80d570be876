//! Length-prefixed framing over non-blocking byte transports.
//!
//! Every message on the wire, stream or datagram, is one frame:
//!
//! ```text
//! [4 bytes BE: payload length N][N bytes of payload]
//! ```
//!
//! A non-blocking stream can hand back any number of bytes per call, so
//! both directions are small state machines. [`FrameAssembler`] remembers
//! how much of the header and body it has seen; [`OutboundQueue`]
//! remembers how far into the head frame the last write got. Both are
//! written against [`StreamIo`] / [`DatagramIo`] so tests can feed them a
//! transport that moves one byte at a time.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use crate::Status;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Largest payload a stream frame may declare (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Largest UDP payload over IPv4. A whole frame must fit in one datagram.
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Upper bound on a single body read.
pub const READ_CHUNK: usize = 1024;

// ---------------------------------------------------------------------------
// I/O traits
// ---------------------------------------------------------------------------

/// A non-blocking byte stream. Both calls return `WouldBlock` instead of
/// waiting.
pub trait StreamIo {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// A non-blocking datagram endpoint. Takes `&self` because one socket can
/// be shared by several peers.
pub trait DatagramIo {
    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn send_datagram(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
}

impl StreamIo for tokio::net::TcpStream {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_read(buf)
    }

    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.try_write(buf)
    }
}

impl DatagramIo for tokio::net::UdpSocket {
    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.try_recv_from(buf)
    }

    fn send_datagram(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.try_send_to(buf, target)
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Prefixes `payload` with its big-endian length.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Extracts the payload of a datagram that holds exactly one frame.
///
/// Returns `None` when the datagram is shorter than a header or its
/// declared length doesn't match what arrived.
pub fn parse_datagram(datagram: &[u8]) -> Option<&[u8]> {
    let (header, body) = datagram.split_first_chunk::<HEADER_LEN>()?;
    let declared = u32::from_be_bytes(*header) as usize;
    (declared == body.len()).then_some(body)
}

// ---------------------------------------------------------------------------
// FrameAssembler
// ---------------------------------------------------------------------------

/// Rebuilds frames from a stream, across as many reads as it takes.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    header: [u8; HEADER_LEN],
    header_read: usize,
    expected: Option<usize>,
    body: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` when part of a frame has been read but not all of it.
    pub fn in_progress(&self) -> bool {
        self.header_read > 0
    }

    /// Reads until one frame is complete or the stream has nothing more.
    ///
    /// - `(Done, Some(payload))`: a frame was completed.
    /// - `(NotReady, None)`: no bytes of a new frame are buffered.
    /// - `(Partial, None)`: a frame is half-read; call again later.
    /// - `(Disconnected | Error, None)`: the stream is finished. A declared
    ///   length above [`MAX_FRAME_LEN`] is an `Error`.
    pub fn receive<S: StreamIo>(&mut self, io: &mut S) -> (Status, Option<Vec<u8>>) {
        loop {
            let expected = match self.expected {
                Some(len) => len,
                None => {
                    match io.read_some(&mut self.header[self.header_read..]) {
                        Ok(0) => return (Status::Disconnected, None),
                        Ok(n) => self.header_read += n,
                        Err(e) => return (self.waiting(&e), None),
                    }
                    if self.header_read < HEADER_LEN {
                        continue;
                    }
                    let len = u32::from_be_bytes(self.header) as usize;
                    if len > MAX_FRAME_LEN {
                        tracing::warn!(len, max = MAX_FRAME_LEN, "frame length exceeds limit");
                        return (Status::Error, None);
                    }
                    self.expected = Some(len);
                    self.body.reserve(len);
                    len
                }
            };

            if self.body.len() == expected {
                let payload = std::mem::take(&mut self.body);
                self.reset();
                return (Status::Done, Some(payload));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let want = (expected - self.body.len()).min(READ_CHUNK);
            match io.read_some(&mut chunk[..want]) {
                Ok(0) => return (Status::Disconnected, None),
                Ok(n) => self.body.extend_from_slice(&chunk[..n]),
                Err(e) => return (self.waiting(&e), None),
            }
        }
    }

    fn waiting(&self, err: &io::Error) -> Status {
        match Status::from_io_error(err) {
            Status::NotReady if self.in_progress() => Status::Partial,
            status => status,
        }
    }

    fn reset(&mut self) {
        self.header_read = 0;
        self.expected = None;
        self.body = Vec::new();
    }
}

/// Reads one datagram and extracts its frame.
///
/// A malformed datagram is dropped and reported as `(Done, None)`, so the
/// caller moves on to the next one.
pub fn receive_datagram<D: DatagramIo>(io: &D) -> (Status, Option<(Vec<u8>, SocketAddr)>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    match io.recv_datagram(&mut buf) {
        Ok((n, from)) => match parse_datagram(&buf[..n]) {
            Some(payload) => (Status::Done, Some((payload.to_vec(), from))),
            None => {
                tracing::warn!(%from, len = n, "dropping malformed datagram");
                (Status::Done, None)
            }
        },
        Err(e) => (Status::from_io_error(&e), None),
    }
}

// ---------------------------------------------------------------------------
// OutboundQueue
// ---------------------------------------------------------------------------

/// Encoded frames waiting to be written, plus the partial-send cursor.
///
/// The cursor is only non-zero while the head frame is half-written.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    frames: VecDeque<Vec<u8>>,
    cursor: usize,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Vec<u8>) {
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Bytes of the head frame already written.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.cursor = 0;
    }

    /// Writes queued frames until the queue is empty or the stream pushes
    /// back.
    ///
    /// Returns `Done` once everything is written, `Partial` when the head
    /// frame is half-written, `NotReady` when nothing could be written at
    /// all. On `Disconnected`/`Error` the whole queue is discarded.
    pub fn flush_stream<S: StreamIo>(&mut self, io: &mut S) -> Status {
        while let Some(frame) = self.frames.front() {
            match io.write_some(&frame[self.cursor..]) {
                Ok(0) => {
                    self.clear();
                    return Status::Disconnected;
                }
                Ok(n) => {
                    self.cursor += n;
                    if self.cursor < frame.len() {
                        return Status::Partial;
                    }
                    self.frames.pop_front();
                    self.cursor = 0;
                }
                Err(e) => {
                    let status = Status::from_io_error(&e);
                    if status.is_terminal() {
                        self.clear();
                        return status;
                    }
                    return if self.cursor > 0 {
                        Status::Partial
                    } else {
                        Status::NotReady
                    };
                }
            }
        }
        Status::Done
    }

    /// Sends each queued frame as exactly one datagram to `target`.
    ///
    /// Frames over [`MAX_DATAGRAM_SIZE`] are dropped with a warning.
    pub fn flush_datagrams<D: DatagramIo>(&mut self, io: &D, target: SocketAddr) -> Status {
        while let Some(frame) = self.frames.front() {
            if frame.len() > MAX_DATAGRAM_SIZE {
                tracing::warn!(
                    len = frame.len(),
                    max = MAX_DATAGRAM_SIZE,
                    %target,
                    "dropping oversized datagram"
                );
                self.frames.pop_front();
                continue;
            }
            match io.send_datagram(frame, target) {
                Ok(_) => {
                    self.frames.pop_front();
                }
                Err(e) => {
                    let status = Status::from_io_error(&e);
                    if status.is_terminal() {
                        self.clear();
                    }
                    return status;
                }
            }
        }
        self.cursor = 0;
        Status::Done
    }
}
