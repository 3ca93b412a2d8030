//! Per-connection session.
//!
//! Each session runs two tasks over its own half of the stream:
//! - read loop: decodes lines and forwards them to the dispatcher
//! - write loop: drains the outbound queue, writing and flushing each line
//!
//! Neither loop touches the registry. A failure in either is reported to the
//! dispatcher once as a [`SessionEvent::Failed`]; the dispatcher then removes
//! the session and cancels whichever loop is still running. A peer that only
//! half-closes is the exception: its write loop is left to flush what is
//! already queued.

use crate::error::{ReadFailure, RelayError, Result, WriteFailure};
use crate::relay::codec::LineCodec;
use crate::relay::message::Message;
use crate::relay::queue::{OutboundQueue, OverflowPolicy, Push};
use crate::relay::registry::ConnectionId;
use crate::relay::transport::{PeerAddr, Transport};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

/// Session I/O limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub outbound_capacity: usize,
    pub overflow: OverflowPolicy,
    pub max_line_length: usize,
    pub idle_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            overflow: OverflowPolicy::Disconnect,
            max_line_length: 8 * 1024,
            idle_timeout: None,
            write_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// What a session reports to the dispatcher.
#[derive(Debug)]
pub enum SessionEvent {
    /// A complete line arrived.
    Inbound(Message),
    /// One of the loops stopped with an error.
    Failed { id: ConnectionId, cause: RelayError },
}

/// The dispatcher's handle on a running session.
pub struct SessionHandle {
    id: ConnectionId,
    identity: String,
    peer: PeerAddr,
    queue: Arc<OutboundQueue>,
    cancel: CancellationToken,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn set_identity(&mut self, name: impl Into<String>) {
        self.identity = name.into();
    }

    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    /// Queue a line for delivery. Never waits.
    ///
    /// A session whose queue is closed (failed, overflowed or removed)
    /// refuses the line with an error rather than dropping it silently.
    pub fn send(&self, line: Bytes) -> Result<Push> {
        self.queue.push(line)
    }

    /// Lines waiting for the write loop.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Refuse further sends and stop both loops.
    pub fn close(&self) {
        self.queue.close();
        self.cancel.cancel();
    }

    /// Refuse further sends but let the write loop flush the queue first.
    pub fn finish(&self) {
        self.queue.close();
    }

    /// A handle with no loops behind it.
    #[cfg(test)]
    pub(crate) fn detached(id: ConnectionId, identity: &str, settings: &SessionSettings) -> Self {
        Self {
            id,
            identity: identity.to_string(),
            peer: PeerAddr::Unknown,
            queue: Arc::new(OutboundQueue::new(
                settings.outbound_capacity,
                settings.overflow,
            )),
            cancel: CancellationToken::new(),
        }
    }
}

/// Line-at-a-time reader over one half of a stream.
pub struct LineReader<R> {
    frames: FramedRead<R, LineCodec>,
    idle_timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, settings: &SessionSettings) -> Self {
        Self {
            frames: FramedRead::new(reader, LineCodec::new(settings.max_line_length)),
            idle_timeout: settings.idle_timeout,
        }
    }

    /// Wait for the next complete line.
    ///
    /// End of stream is `ReadFailure::Closed`; so is every other way the
    /// stream can stop producing lines.
    pub async fn receive(&mut self) -> std::result::Result<String, ReadFailure> {
        let next = match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, self.frames.next())
                .await
                .map_err(|_| ReadFailure::Idle(limit.as_secs()))?,
            None => self.frames.next().await,
        };
        next.unwrap_or(Err(ReadFailure::Closed))
    }
}

/// Start a session's loops over `stream` and return its handle.
#[allow(clippy::too_many_arguments)]
pub fn spawn<S: Transport>(
    id: ConnectionId,
    identity: String,
    peer: PeerAddr,
    stream: S,
    settings: &SessionSettings,
    events: mpsc::Sender<SessionEvent>,
    tracker: &TaskTracker,
    parent: &CancellationToken,
) -> SessionHandle {
    let (reader, writer) = tokio::io::split(stream);
    let queue = Arc::new(OutboundQueue::new(
        settings.outbound_capacity,
        settings.overflow,
    ));
    let cancel = parent.child_token();

    tracker.spawn(read_loop(
        id,
        LineReader::new(reader, settings),
        Arc::clone(&queue),
        events.clone(),
        cancel.clone(),
    ));
    tracker.spawn(write_loop(
        id,
        FramedWrite::new(writer, LineCodec::new(settings.max_line_length)),
        Arc::clone(&queue),
        settings.write_timeout,
        events,
        cancel.clone(),
    ));

    SessionHandle {
        id,
        identity,
        peer,
        queue,
        cancel,
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    id: ConnectionId,
    mut reader: LineReader<R>,
    queue: Arc<OutboundQueue>,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    let cause = loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => {
                trace!(conn = %id, "Read loop cancelled");
                return;
            }
            received = reader.receive() => received,
        };

        match received {
            Ok(text) => {
                trace!(conn = %id, len = text.len(), "Line received");
                let event = SessionEvent::Inbound(Message::from_session(id, text));
                if !report(&events, &cancel, event).await {
                    return;
                }
            }
            Err(cause) => break cause,
        }
    };

    debug!(conn = %id, cause = %cause, "Read loop stopped");
    // A clean end of input still leaves the peer's read side open.
    if !matches!(cause, ReadFailure::Closed) {
        queue.close();
    }
    report(
        &events,
        &cancel,
        SessionEvent::Failed {
            id,
            cause: cause.into(),
        },
    )
    .await;
}

async fn write_loop<W: AsyncWrite + Unpin>(
    id: ConnectionId,
    mut writer: FramedWrite<W, LineCodec>,
    queue: Arc<OutboundQueue>,
    write_timeout: Option<Duration>,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    let cause = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                trace!(conn = %id, "Write loop cancelled");
                return;
            }
            next = queue.pop() => next,
        };

        // Closed by whoever failed or removed the session; they report it.
        let Some(line) = next else {
            trace!(conn = %id, "Outbound queue closed");
            return;
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => {
                trace!(conn = %id, "Write loop cancelled mid-write");
                return;
            }
            written = write_line(&mut writer, line, write_timeout) => written,
        };

        if let Err(cause) = written {
            break cause;
        }
    };

    debug!(conn = %id, cause = %cause, "Write loop stopped");
    queue.close();
    report(
        &events,
        &cancel,
        SessionEvent::Failed {
            id,
            cause: cause.into(),
        },
    )
    .await;
}

/// Write one line and flush it.
async fn write_line<W: AsyncWrite + Unpin>(
    writer: &mut FramedWrite<W, LineCodec>,
    line: Bytes,
    limit: Option<Duration>,
) -> std::result::Result<(), WriteFailure> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, writer.send(line))
            .await
            .map_err(|_| WriteFailure::Timeout(limit))?,
        None => writer.send(line).await,
    }
}

/// Hand an event to the dispatcher. Returns false if the session was
/// cancelled or the dispatcher is gone.
async fn report(
    events: &mpsc::Sender<SessionEvent>,
    cancel: &CancellationToken,
    event: SessionEvent,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}
