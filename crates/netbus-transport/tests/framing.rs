//! Framing state machines driven through in-memory transports.
//!
//! The mocks hand out bytes in arbitrary slices and interleave
//! `WouldBlock`, which is exactly what a non-blocking socket does to us.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use netbus_transport::frame::{
    self, DatagramIo, FrameAssembler, HEADER_LEN, MAX_DATAGRAM_SIZE, MAX_FRAME_LEN, OutboundQueue,
    READ_CHUNK, StreamIo,
};
use netbus_transport::Status;
use proptest::prelude::*;

// =========================================================================
// Mocks
// =========================================================================

/// A stream that reads `inbound` in the given chunk sizes (cycling), with a
/// `WouldBlock` between chunks, and accepts at most `write_limit` bytes per
/// write.
struct MockStream {
    inbound: VecDeque<u8>,
    chunks: Vec<usize>,
    next_chunk: usize,
    block_next: bool,
    closed: bool,
    written: Vec<u8>,
    write_limit: usize,
    fail_writes_with: Option<io::ErrorKind>,
}

impl MockStream {
    fn with_input(bytes: &[u8], chunks: Vec<usize>) -> Self {
        Self {
            inbound: bytes.iter().copied().collect(),
            chunks,
            next_chunk: 0,
            block_next: false,
            closed: false,
            written: Vec::new(),
            write_limit: usize::MAX,
            fail_writes_with: None,
        }
    }

    fn writer(write_limit: usize) -> Self {
        let mut stream = Self::with_input(&[], vec![1]);
        stream.write_limit = write_limit;
        stream
    }
}

impl StreamIo for MockStream {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.inbound.is_empty() {
            return if self.closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        if self.block_next {
            self.block_next = false;
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.block_next = true;

        let chunk = self.chunks[self.next_chunk % self.chunks.len()];
        self.next_chunk += 1;
        let n = chunk.min(buf.len()).min(self.inbound.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.inbound.pop_front().unwrap();
        }
        Ok(n)
    }

    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(kind) = self.fail_writes_with {
            return Err(kind.into());
        }
        if self.write_limit == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.write_limit);
        self.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

/// A datagram endpoint that records what was sent and replays `inbound`.
#[derive(Default)]
struct MockDatagrams {
    sent: RefCell<Vec<(Vec<u8>, SocketAddr)>>,
    inbound: RefCell<VecDeque<(Vec<u8>, SocketAddr)>>,
}

impl DatagramIo for MockDatagrams {
    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self.inbound.borrow_mut().pop_front() {
            Some((bytes, from)) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok((bytes.len(), from))
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn send_datagram(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.sent.borrow_mut().push((buf.to_vec(), target));
        Ok(buf.len())
    }
}

fn target() -> SocketAddr {
    "127.0.0.1:7001".parse().unwrap()
}

/// Calls `receive` until `count` frames come out or the stream stops.
fn collect_frames(stream: &mut MockStream, count: usize) -> Vec<Vec<u8>> {
    let mut assembler = FrameAssembler::new();
    let mut frames = Vec::new();
    let mut idle = 0;
    while frames.len() < count && idle < 1_000_000 {
        match assembler.receive(stream) {
            (Status::Done, Some(frame)) => frames.push(frame),
            (Status::NotReady | Status::Partial, None) => idle += 1,
            other => panic!("unexpected receive result {other:?}"),
        }
    }
    frames
}

// =========================================================================
// Receive
// =========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn frames_survive_arbitrary_chunk_boundaries(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..3000), 1..6),
        chunks in prop::collection::vec(1usize..700, 1..8),
    ) {
        let mut wire = Vec::new();
        for payload in &payloads {
            wire.extend(frame::encode_frame(payload));
        }

        let mut stream = MockStream::with_input(&wire, chunks);
        let frames = collect_frames(&mut stream, payloads.len());
        prop_assert_eq!(frames, payloads);
    }

    #[test]
    fn partial_sends_resume_where_they_stopped(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..500), 1..6),
        limit in 1usize..64,
    ) {
        let mut queue = OutboundQueue::new();
        let mut expected = Vec::new();
        for payload in &payloads {
            let encoded = frame::encode_frame(payload);
            expected.extend_from_slice(&encoded);
            queue.push(encoded);
        }

        let mut stream = MockStream::writer(limit);
        let mut calls = 0;
        while queue.flush_stream(&mut stream) != Status::Done {
            calls += 1;
            prop_assert!(calls < 100_000);
        }
        prop_assert_eq!(stream.written, expected);
        prop_assert_eq!(queue.cursor(), 0);
    }
}

#[test]
fn test_receive_zero_length_frame_is_done() {
    let mut stream = MockStream::with_input(&[0, 0, 0, 0], vec![4]);
    let frames = collect_frames(&mut stream, 1);
    assert_eq!(frames, vec![Vec::<u8>::new()]);
}

#[test]
fn test_receive_payloads_around_read_chunk_are_exact() {
    for len in [READ_CHUNK - 1, READ_CHUNK, READ_CHUNK + 1, 2 * READ_CHUNK + 1] {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let wire = frame::encode_frame(&payload);

        for chunks in [vec![READ_CHUNK], vec![HEADER_LEN + READ_CHUNK], vec![HEADER_LEN, 1]] {
            let mut stream = MockStream::with_input(&wire, chunks.clone());
            let frames = collect_frames(&mut stream, 1);
            assert_eq!(frames, vec![payload.clone()], "len {len}, chunks {chunks:?}");
        }
    }
}

#[test]
fn test_receive_datagram_sized_payload_over_stream() {
    let payload: Vec<u8> = (0..MAX_DATAGRAM_SIZE).map(|i| (i % 256) as u8).collect();
    let mut wire = frame::encode_frame(&payload);
    wire.extend(frame::encode_frame(b"after"));

    let mut stream = MockStream::with_input(&wire, vec![READ_CHUNK]);
    let frames = collect_frames(&mut stream, 2);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0], payload);
    assert_eq!(frames[1], b"after");
}

#[test]
fn test_receive_oversized_header_is_error() {
    let declared = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
    let mut stream = MockStream::with_input(&declared, vec![4]);
    let mut assembler = FrameAssembler::new();
    assert_eq!(assembler.receive(&mut stream), (Status::Error, None));
}

#[test]
fn test_receive_closed_stream_is_disconnected() {
    let mut stream = MockStream::with_input(&[0, 0], vec![2]);
    stream.closed = true;
    let mut assembler = FrameAssembler::new();

    // Half a header arrives, then the remote closes.
    assert_eq!(assembler.receive(&mut stream), (Status::Disconnected, None));
}

#[test]
fn test_receive_nothing_buffered_is_not_ready() {
    let mut stream = MockStream::with_input(&[], vec![1]);
    let mut assembler = FrameAssembler::new();
    assert_eq!(assembler.receive(&mut stream), (Status::NotReady, None));
    assert!(!assembler.in_progress());
}

// =========================================================================
// Send
// =========================================================================

#[test]
fn test_flush_partial_keeps_head_frame_and_cursor() {
    let mut queue = OutboundQueue::new();
    queue.push(frame::encode_frame(b"hello"));

    let mut stream = MockStream::writer(3);
    assert_eq!(queue.flush_stream(&mut stream), Status::Partial);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.cursor(), 3);

    assert_eq!(queue.flush_stream(&mut stream), Status::Partial);
    assert_eq!(queue.cursor(), 6);

    assert_eq!(queue.flush_stream(&mut stream), Status::Done);
    assert!(queue.is_empty());
    assert_eq!(queue.cursor(), 0);
    assert_eq!(stream.written, frame::encode_frame(b"hello"));
}

#[test]
fn test_flush_blocked_before_any_byte_is_not_ready() {
    let mut queue = OutboundQueue::new();
    queue.push(frame::encode_frame(b"x"));
    let mut stream = MockStream::writer(0);
    assert_eq!(queue.flush_stream(&mut stream), Status::NotReady);
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_flush_reset_clears_queue() {
    let mut queue = OutboundQueue::new();
    queue.push(frame::encode_frame(b"a"));
    queue.push(frame::encode_frame(b"b"));

    let mut stream = MockStream::writer(1);
    assert_eq!(queue.flush_stream(&mut stream), Status::Partial);

    stream.fail_writes_with = Some(io::ErrorKind::ConnectionReset);
    assert_eq!(queue.flush_stream(&mut stream), Status::Disconnected);
    assert!(queue.is_empty());
    assert_eq!(queue.cursor(), 0);
}

#[test]
fn test_flush_datagrams_one_frame_per_datagram() {
    let mut queue = OutboundQueue::new();
    queue.push(frame::encode_frame(b"one"));
    queue.push(frame::encode_frame(b"two"));

    let io = MockDatagrams::default();
    assert_eq!(queue.flush_datagrams(&io, target()), Status::Done);

    let sent = io.sent.borrow();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], (frame::encode_frame(b"one"), target()));
    assert_eq!(sent[1].0, frame::encode_frame(b"two"));
}

#[test]
fn test_flush_datagrams_drops_oversized_frame() {
    let mut queue = OutboundQueue::new();
    queue.push(frame::encode_frame(&vec![0u8; MAX_DATAGRAM_SIZE]));
    queue.push(frame::encode_frame(b"small"));

    let io = MockDatagrams::default();
    assert_eq!(queue.flush_datagrams(&io, target()), Status::Done);

    let sent = io.sent.borrow();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, frame::encode_frame(b"small"));
}

#[test]
fn test_datagram_at_size_limit_is_sent_and_received() {
    let payload = vec![7u8; MAX_DATAGRAM_SIZE - HEADER_LEN];
    let mut queue = OutboundQueue::new();
    queue.push(frame::encode_frame(&payload));
    // One byte over the limit.
    queue.push(frame::encode_frame(&vec![7u8; MAX_DATAGRAM_SIZE - HEADER_LEN + 1]));

    let io = MockDatagrams::default();
    assert_eq!(queue.flush_datagrams(&io, target()), Status::Done);
    let sent = io.sent.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.len(), MAX_DATAGRAM_SIZE);

    io.inbound.borrow_mut().extend(sent);
    let (status, received) = frame::receive_datagram(&io);
    assert_eq!(status, Status::Done);
    assert_eq!(received, Some((payload, target())));
}

#[test]
fn test_receive_datagram_parses_single_frame() {
    let io = MockDatagrams::default();
    io.inbound
        .borrow_mut()
        .push_back((frame::encode_frame(b"ping"), target()));
    io.inbound.borrow_mut().push_back((vec![0, 0, 0, 9, 1], target()));

    let (status, received) = frame::receive_datagram(&io);
    assert_eq!(status, Status::Done);
    assert_eq!(received, Some((b"ping".to_vec(), target())));

    // Declared length doesn't match: dropped, but not an error.
    assert_eq!(frame::receive_datagram(&io), (Status::Done, None));
    assert_eq!(frame::receive_datagram(&io), (Status::NotReady, None));
}
