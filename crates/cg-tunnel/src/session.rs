//! Multiplexed tunnel sessions
//!
//! A session owns one upgraded connection and runs three tasks over it: a
//! frame reader, a frame writer and a heartbeat monitor. Either end may open
//! streams; the accepting end of a registration uses odd stream ids, the
//! dialing end even ones.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use cg_core::config::HeartbeatConfig;
use cg_protocol::{Frame, FrameCodec, Message, StreamId};

use crate::error::TunnelError;
use crate::handler::{ConnectRequest, SessionHandler};
use crate::stream::{send_detached, StreamMap, TunnelStream};

/// Outbound frame queue depth per session
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// Which side of the registration this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted the upgrade (manager side)
    Server,
    /// Performed the upgrade (agent or linking replica)
    Client,
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between heartbeats
    pub heartbeat_interval: Duration,
    /// Silence after which the session is closed
    pub heartbeat_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&HeartbeatConfig::default())
    }
}

impl From<&HeartbeatConfig> for SessionConfig {
    fn from(config: &HeartbeatConfig) -> Self {
        Self {
            heartbeat_interval: config.interval,
            heartbeat_timeout: config.timeout,
        }
    }
}

/// A live tunnel connection multiplexing many streams
pub struct Session {
    label: String,
    role: Role,
    frames: mpsc::Sender<Frame>,
    streams: Arc<StreamMap>,
    next_stream_id: AtomicU64,
    cancel: CancellationToken,
    started: Instant,
    /// Milliseconds after `started` at which the last frame arrived
    last_seen: AtomicU64,
}

impl Session {
    /// Start a session over an established connection.
    ///
    /// `label` only appears in logs. `handler` decides what to do with
    /// streams the remote end opens.
    pub fn spawn<IO>(
        io: IO,
        role: Role,
        label: impl Into<String>,
        handler: Arc<dyn SessionHandler>,
        config: SessionConfig,
    ) -> Arc<Session>
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let reader = FramedRead::new(read_half, FrameCodec::new());
        let writer = FramedWrite::new(write_half, FrameCodec::new());
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);

        let first_stream_id = match role {
            Role::Server => 1,
            Role::Client => 2,
        };

        let session = Arc::new(Session {
            label: label.into(),
            role,
            frames: frame_tx,
            streams: Arc::new(StreamMap::new()),
            next_stream_id: AtomicU64::new(first_stream_id),
            cancel: CancellationToken::new(),
            started: Instant::now(),
            last_seen: AtomicU64::new(0),
        });

        tracing::debug!(session = %session.label, ?role, "Tunnel session started");

        tokio::spawn(write_loop(writer, frame_rx, session.cancel.clone()));
        tokio::spawn(Arc::clone(&session).read_loop(reader, handler));
        tokio::spawn(Arc::clone(&session).heartbeat_loop(config));

        session
    }

    /// Log label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Side of the registration
    pub fn role(&self) -> Role {
        self.role
    }

    /// Number of open streams
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Whether the session has shut down
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the session has shut down
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Shut the session down. Open streams see EOF.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(session = %self.label, "Closing tunnel session");
        }
        self.cancel.cancel();
        self.streams.clear();
    }

    /// Ask the remote end to open a stream to `address`.
    ///
    /// With `client_key` set the remote end (a sibling replica) forwards the
    /// stream through its local session for that key instead of dialing.
    pub async fn dial(
        &self,
        address: &str,
        client_key: Option<&str>,
        timeout: Duration,
    ) -> Result<TunnelStream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }

        let id = self.allocate_stream_id()?;
        let (connect_tx, connect_rx) = oneshot::channel();
        let stream = self.open_stream(id, Some(connect_tx));

        self.frames
            .send(Frame::new(
                id,
                Message::Connect {
                    address: address.to_string(),
                    client_key: client_key.map(str::to_string),
                },
            ))
            .await
            .map_err(|_| TunnelError::SessionClosed)?;

        match tokio::time::timeout(timeout, connect_rx).await {
            Ok(Ok(None)) => {
                tracing::trace!(session = %self.label, stream = %id, address = %address, "Stream connected");
                Ok(stream)
            }
            Ok(Ok(Some(reason))) => Err(TunnelError::DialFailed {
                address: address.to_string(),
                reason,
            }),
            Ok(Err(_)) => Err(TunnelError::SessionClosed),
            Err(_) => Err(TunnelError::DialTimeout(address.to_string())),
        }
    }

    /// Queue a control-stream message. Fails only when the session is gone
    /// or its queue is full.
    pub fn send_control(&self, message: Message) -> bool {
        self.frames.try_send(Frame::control(message)).is_ok()
    }

    /// Next id of this side's parity. Id 0 belongs to the control stream, so
    /// running past `u32::MAX` ends the session instead of wrapping.
    fn allocate_stream_id(&self) -> Result<StreamId, TunnelError> {
        let next = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
        match u32::try_from(next) {
            Ok(id) => Ok(StreamId::new(id)),
            Err(_) => {
                tracing::warn!(session = %self.label, "Stream ids exhausted, closing tunnel session");
                self.close();
                Err(TunnelError::StreamIdsExhausted)
            }
        }
    }

    fn open_stream(
        &self,
        id: StreamId,
        connect_tx: Option<oneshot::Sender<Option<String>>>,
    ) -> TunnelStream {
        TunnelStream::open(id, connect_tx, self.frames.clone(), Arc::clone(&self.streams))
    }

    /// Drop one stream after a remote protocol violation, leaving the rest
    /// of the session running
    fn reset_stream(&self, id: StreamId, reason: &str) {
        tracing::warn!(session = %self.label, stream = %id, "Resetting stream: {}", reason);
        self.streams.remove(&id);
        send_detached(
            &self.frames,
            Frame::new(
                id,
                Message::Close {
                    reason: Some(reason.to_string()),
                },
            ),
        );
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_seen.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_seen.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    async fn read_loop<R>(
        self: Arc<Self>,
        mut reader: FramedRead<R, FrameCodec>,
        handler: Arc<dyn SessionHandler>,
    ) where
        R: AsyncRead + Unpin,
    {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = reader.next() => match next {
                    Some(Ok(frame)) => {
                        self.touch();
                        self.dispatch(frame, &handler);
                    }
                    Some(Err(e)) => {
                        tracing::warn!(session = %self.label, "Tunnel read error: {}", e);
                        break;
                    }
                    None => {
                        tracing::debug!(session = %self.label, "Tunnel connection closed by remote");
                        break;
                    }
                },
            }
        }
        self.close();
    }

    /// Handle one inbound frame. Never waits, so one stream cannot hold up
    /// the others.
    fn dispatch(self: &Arc<Self>, frame: Frame, handler: &Arc<dyn SessionHandler>) {
        let id = frame.stream_id;
        match frame.message {
            Message::Data(bytes) => {
                let delivered = match self.streams.get(&id) {
                    Some(slot) => slot.deliver(bytes),
                    None => {
                        tracing::trace!(session = %self.label, stream = %id, "Data for unknown stream");
                        true
                    }
                };
                if !delivered {
                    self.reset_stream(id, "flow control window exceeded");
                }
            }
            Message::WindowUpdate { increment } => {
                let granted = self
                    .streams
                    .get(&id)
                    .map(|slot| slot.grant(increment))
                    .unwrap_or(true);
                if !granted {
                    self.reset_stream(id, "window update past window size");
                }
            }
            Message::Connect { address, client_key } => {
                self.accept_stream(id, ConnectRequest { address, client_key }, Arc::clone(handler));
            }
            Message::Connected { error } => {
                if let Some(mut slot) = self.streams.get_mut(&id) {
                    if let Some(tx) = slot.connect_tx.take() {
                        let _ = tx.send(error);
                    }
                }
            }
            Message::Close { reason } => {
                if let Some(reason) = reason {
                    tracing::debug!(session = %self.label, stream = %id, "Stream closed by remote: {}", reason);
                }
                self.streams.remove(&id);
            }
            Message::Heartbeat { timestamp } => {
                self.send_control(Message::HeartbeatAck { timestamp });
            }
            Message::HeartbeatAck { timestamp } => {
                let rtt = unix_millis().saturating_sub(timestamp);
                tracing::trace!(session = %self.label, rtt_ms = rtt, "Heartbeat acknowledged");
            }
            Message::AddClient { key } => handler.on_add_client(key),
            Message::RemoveClient { key } => handler.on_remove_client(key),
            Message::Error { code, message } => {
                tracing::warn!(session = %self.label, stream = %id, ?code, "Remote error: {}", message);
                if !id.is_control() {
                    self.streams.remove(&id);
                }
            }
        }
    }

    fn accept_stream(
        self: &Arc<Self>,
        id: StreamId,
        request: ConnectRequest,
        handler: Arc<dyn SessionHandler>,
    ) {
        let mut stream = self.open_stream(id, None);
        let session = Arc::clone(self);

        tokio::spawn(async move {
            let address = request.address.clone();
            match handler.on_connect(request).await {
                Ok(mut target) => {
                    if session
                        .frames
                        .send(Frame::new(id, Message::Connected { error: None }))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    match tokio::io::copy_bidirectional(&mut stream, &mut target).await {
                        Ok((up, down)) => tracing::trace!(
                            session = %session.label, stream = %id, up, down, "Stream finished"
                        ),
                        Err(e) => tracing::debug!(
                            session = %session.label, stream = %id, "Stream ended with error: {}", e
                        ),
                    }
                }
                Err(reason) => {
                    tracing::debug!(session = %session.label, stream = %id, address = %address, "Refusing stream: {}", reason);
                    let _ = session
                        .frames
                        .send(Frame::new(id, Message::Connected { error: Some(reason) }))
                        .await;
                }
            }
        });
    }

    async fn heartbeat_loop(self: Arc<Self>, config: SessionConfig) {
        let mut ticker = tokio::time::interval(config.heartbeat_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.idle_for() > config.heartbeat_timeout {
                        tracing::warn!(
                            session = %self.label,
                            "No traffic for {:?}, closing tunnel session",
                            config.heartbeat_timeout
                        );
                        self.close();
                        break;
                    }
                    self.send_control(Message::Heartbeat { timestamp: unix_millis() });
                }
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("label", &self.label)
            .field("role", &self.role)
            .field("streams", &self.streams.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn write_loop<W>(
    mut writer: FramedWrite<W, FrameCodec>,
    mut frames: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.send(frame).await {
                        tracing::warn!("Tunnel write error: {}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = writer.close().await;
    cancel.cancel();
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
