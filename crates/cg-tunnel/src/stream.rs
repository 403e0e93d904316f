//! Logical byte streams carried by a tunnel session
//!
//! Each direction of a stream has a credit window of [`STREAM_WINDOW`]
//! bytes. A writer spends credit per `Data` frame and parks when it runs
//! out; the reader hands credit back with `WindowUpdate` once the
//! application has consumed half a window. The session reader therefore
//! never waits on a slow stream: a peer that sends past its window gets
//! that stream reset.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::{PollSemaphore, PollSender};

use cg_protocol::{Frame, Message, StreamId};

/// Largest payload put into a single `Data` frame
pub const MAX_CHUNK_SIZE: usize = 32 * 1024;

/// Bytes one side may send on a stream before the other side grants more
pub const STREAM_WINDOW: usize = 256 * 1024;

/// Receiving end of a stream as seen by the session reader
pub(crate) struct StreamSlot {
    data_tx: mpsc::UnboundedSender<Bytes>,
    /// Delivered bytes not yet credited back to the remote writer
    unacked: Arc<AtomicUsize>,
    send_credit: Arc<Semaphore>,
    /// Completed by the peer's `Connected` answer
    pub(crate) connect_tx: Option<oneshot::Sender<Option<String>>>,
}

impl StreamSlot {
    /// Queue an inbound chunk without waiting. False when the remote writer
    /// went past its window.
    pub(crate) fn deliver(&self, bytes: Bytes) -> bool {
        let len = bytes.len();
        if self.unacked.fetch_add(len, Ordering::AcqRel) + len > STREAM_WINDOW {
            return false;
        }
        // a dropped receiver means the local end already closed
        let _ = self.data_tx.send(bytes);
        true
    }

    /// Add send credit from a `WindowUpdate`. False when the grant would
    /// push the window past its size.
    pub(crate) fn grant(&self, increment: u32) -> bool {
        let increment = increment as usize;
        if self.send_credit.available_permits() + increment > STREAM_WINDOW {
            return false;
        }
        self.send_credit.add_permits(increment);
        true
    }
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        // wakes a writer parked on credit
        self.send_credit.close();
    }
}

pub(crate) type StreamMap = DashMap<StreamId, StreamSlot>;

/// Queue a frame from a context that cannot wait for queue space
pub(crate) fn send_detached(frames: &mpsc::Sender<Frame>, frame: Frame) {
    match frames.try_send(frame) {
        Err(TrySendError::Full(frame)) => {
            let frames = frames.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = frames.send(frame).await;
                });
            }
        }
        Ok(()) | Err(TrySendError::Closed(_)) => {}
    }
}

/// Removes the slot and tells the remote end when the stream goes away
struct StreamGuard {
    id: StreamId,
    streams: Arc<StreamMap>,
    frames: mpsc::Sender<Frame>,
    close_sent: bool,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.streams.remove(&self.id);
        if !self.close_sent {
            send_detached(&self.frames, Frame::new(self.id, Message::close()));
        }
    }
}

/// One multiplexed stream inside a tunnel session.
///
/// Reads yield the remote end's `Data` frames in order and hit EOF when the
/// remote end closes the stream. Writes are split into `Data` frames of at
/// most [`MAX_CHUNK_SIZE`] bytes and wait for window credit. Shutting down
/// or dropping the stream sends `Close`.
pub struct TunnelStream {
    id: StreamId,
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
    unacked: Arc<AtomicUsize>,
    /// Bytes handed to the application since the last `WindowUpdate`
    consumed: usize,
    credit: PollSemaphore,
    /// Credit taken from the window but not yet spent on a frame
    credit_held: usize,
    tx: PollSender<Frame>,
    guard: StreamGuard,
}

impl TunnelStream {
    /// Register a slot for `id` in `streams` and return the local end
    pub(crate) fn open(
        id: StreamId,
        connect_tx: Option<oneshot::Sender<Option<String>>>,
        frames: mpsc::Sender<Frame>,
        streams: Arc<StreamMap>,
    ) -> Self {
        let (data_tx, rx) = mpsc::unbounded_channel();
        let unacked = Arc::new(AtomicUsize::new(0));
        let send_credit = Arc::new(Semaphore::new(STREAM_WINDOW));
        streams.insert(
            id,
            StreamSlot {
                data_tx,
                unacked: Arc::clone(&unacked),
                send_credit: Arc::clone(&send_credit),
                connect_tx,
            },
        );

        Self {
            id,
            rx,
            pending: Bytes::new(),
            unacked,
            consumed: 0,
            credit: PollSemaphore::new(send_credit),
            credit_held: 0,
            tx: PollSender::new(frames.clone()),
            guard: StreamGuard {
                id,
                streams,
                frames,
                close_sent: false,
            },
        }
    }

    /// Stream identifier within its session
    pub fn id(&self) -> StreamId {
        self.id
    }

    fn broken_pipe() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "tunnel stream closed")
    }

    fn release_window(&mut self, n: usize) {
        self.consumed += n;
        if self.consumed < STREAM_WINDOW / 2 || self.guard.close_sent {
            return;
        }
        self.unacked.fetch_sub(self.consumed, Ordering::AcqRel);
        send_detached(
            &self.guard.frames,
            Frame::new(
                self.id,
                Message::WindowUpdate {
                    increment: self.consumed as u32,
                },
            ),
        );
        self.consumed = 0;
    }
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream").field("id", &self.id).finish()
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = buf.remaining().min(this.pending.len());
                buf.put_slice(&this.pending.split_to(n));
                this.release_window(n);
                return Poll::Ready(Ok(()));
            }
            match ready!(this.rx.poll_recv(cx)) {
                Some(chunk) => this.pending = chunk,
                // remote closed the stream
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.guard.close_sent {
            return Poll::Ready(Err(Self::broken_pipe()));
        }
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if this.credit_held == 0 {
            let want = data.len().min(MAX_CHUNK_SIZE);
            match ready!(this.credit.poll_acquire_many(cx, want as u32)) {
                Some(permit) => {
                    permit.forget();
                    this.credit_held = want;
                }
                // slot removed: remote closed or the session ended
                None => return Poll::Ready(Err(Self::broken_pipe())),
            }
        }
        ready!(this.tx.poll_reserve(cx)).map_err(|_| Self::broken_pipe())?;

        let n = data.len().min(this.credit_held);
        let frame = Frame::new(this.id, Message::Data(Bytes::copy_from_slice(&data[..n])));
        this.tx.send_item(frame).map_err(|_| Self::broken_pipe())?;
        this.credit_held -= n;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // frames are flushed by the session writer
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.guard.close_sent {
            return Poll::Ready(Ok(()));
        }
        if ready!(this.tx.poll_reserve(cx)).is_ok() {
            let _ = this.tx.send_item(Frame::new(this.id, Message::close()));
        }
        this.guard.close_sent = true;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const ID: StreamId = StreamId(3);

    fn stream_pair() -> (TunnelStream, mpsc::Receiver<Frame>, Arc<StreamMap>) {
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let streams = Arc::new(StreamMap::new());
        let stream = TunnelStream::open(ID, None, frame_tx, Arc::clone(&streams));
        (stream, frame_rx, streams)
    }

    fn deliver(streams: &StreamMap, bytes: Bytes) -> bool {
        streams.get(&ID).map(|slot| slot.deliver(bytes)).unwrap_or(false)
    }

    #[tokio::test]
    async fn test_read_across_chunks_then_eof() {
        let (mut stream, _frames, streams) = stream_pair();
        assert!(deliver(&streams, Bytes::from_static(b"hel")));
        assert!(deliver(&streams, Bytes::from_static(b"lo")));
        streams.clear();

        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_write_is_chunked() {
        let (mut stream, mut frames, _streams) = stream_pair();
        let payload = vec![7u8; MAX_CHUNK_SIZE + 10];
        stream.write_all(&payload).await.unwrap();

        let first = frames.recv().await.unwrap();
        let second = frames.recv().await.unwrap();
        match (first.message, second.message) {
            (Message::Data(a), Message::Data(b)) => {
                assert_eq!(a.len(), MAX_CHUNK_SIZE);
                assert_eq!(b.len(), 10);
            }
            other => panic!("unexpected frames: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_waits_for_window_credit() {
        let (mut stream, mut frames, streams) = stream_pair();
        stream.write_all(&vec![1u8; STREAM_WINDOW]).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), stream.write_all(b"more")).await;
        assert!(blocked.is_err(), "write past the window must wait");

        assert!(streams.get(&ID).unwrap().grant(MAX_CHUNK_SIZE as u32));
        stream.write_all(b"more").await.unwrap();

        let mut sent = 0;
        let mut last = Bytes::new();
        while let Ok(frame) = frames.try_recv() {
            if let Message::Data(bytes) = frame.message {
                sent += bytes.len();
                last = bytes;
            }
        }
        assert_eq!(sent, STREAM_WINDOW + 4);
        assert_eq!(last, Bytes::from_static(b"more"));
    }

    #[tokio::test]
    async fn test_reading_half_a_window_grants_credit() {
        let (mut stream, mut frames, streams) = stream_pair();
        for _ in 0..(STREAM_WINDOW / 2 / MAX_CHUNK_SIZE) {
            assert!(deliver(&streams, Bytes::from(vec![0u8; MAX_CHUNK_SIZE])));
        }
        assert!(frames.try_recv().is_err());

        let mut buf = vec![0u8; STREAM_WINDOW / 2];
        stream.read_exact(&mut buf).await.unwrap();

        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.stream_id, ID);
        assert_eq!(
            frame.message,
            Message::WindowUpdate {
                increment: (STREAM_WINDOW / 2) as u32
            }
        );

        // the credited half is available again
        for _ in 0..(STREAM_WINDOW / MAX_CHUNK_SIZE) {
            assert!(deliver(&streams, Bytes::from(vec![0u8; MAX_CHUNK_SIZE])));
        }
    }

    #[tokio::test]
    async fn test_delivery_past_window_is_refused() {
        let (_stream, _frames, streams) = stream_pair();
        assert!(deliver(&streams, Bytes::from(vec![0u8; STREAM_WINDOW])));
        assert!(!deliver(&streams, Bytes::from_static(b"x")));
    }

    #[tokio::test]
    async fn test_grant_past_window_is_refused() {
        let (_stream, _frames, streams) = stream_pair();
        assert!(!streams.get(&ID).unwrap().grant(1));
    }

    #[tokio::test]
    async fn test_remote_close_fails_parked_writer() {
        let (mut stream, _frames, streams) = stream_pair();
        stream.write_all(&vec![1u8; STREAM_WINDOW]).await.unwrap();

        let writer = tokio::spawn(async move { stream.write_all(b"more").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        streams.remove(&ID);

        let err = writer.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_shutdown_sends_close_once() {
        let (mut stream, mut frames, streams) = stream_pair();
        stream.shutdown().await.unwrap();
        assert!(stream.write_all(b"late").await.is_err());
        drop(stream);

        assert_eq!(frames.recv().await.unwrap().message, Message::close());
        assert!(frames.try_recv().is_err());
        assert!(streams.is_empty());
    }

    #[tokio::test]
    async fn test_drop_sends_close() {
        let (stream, mut frames, streams) = stream_pair();
        drop(stream);

        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.stream_id, ID);
        assert_eq!(frame.message, Message::close());
        assert!(streams.is_empty());
    }
}
