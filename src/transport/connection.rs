//! WebSocket connection handle.
//!
//! [`ConnectionHandle`] wraps one WebSocket stream and is shared between the
//! receive loop and any number of senders.
//!
//! # Concurrency
//!
//! | Side | Lock | Holder |
//! |------|------|--------|
//! | Write | per-connection async mutex | One sender at a time; frames never interleave |
//! | Read | per-connection async mutex | The connection's receive loop |
//!
//! Reads and writes proceed in parallel (full duplex).
//!
//! # Reads
//!
//! The WebSocket layer hands over complete messages. [`ConnectionHandle::receive`]
//! copies them out piecewise, so callers can read a message in chunks of
//! their choosing and learn where it ends.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;

// ============================================================================
// Types
// ============================================================================

type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
type WsSource = Pin<Box<dyn Stream<Item = std::result::Result<Message, WsError>> + Send>>;

// ============================================================================
// FrameKind
// ============================================================================

/// Kind of a WebSocket data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Binary message.
    Binary,
    /// UTF-8 text message.
    Text,
    /// Close frame.
    Close,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary => f.write_str("binary"),
            Self::Text => f.write_str("text"),
            Self::Close => f.write_str("close"),
        }
    }
}

// ============================================================================
// CloseStatus
// ============================================================================

/// Close code and reason sent by the peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseStatus {
    /// Close code, if the frame carried one.
    pub code: Option<u16>,
    /// Close reason.
    pub reason: String,
}

fn close_status(frame: Option<CloseFrame>) -> CloseStatus {
    frame
        .map(|f| CloseStatus {
            code: Some(u16::from(f.code)),
            reason: f.reason.as_str().to_owned(),
        })
        .unwrap_or_default()
}

// ============================================================================
// ReceiveResult
// ============================================================================

/// Result of one [`FrameReader::receive`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveResult {
    /// Bytes written into the buffer.
    pub count: usize,
    /// The last byte of the current message was read.
    pub end_of_message: bool,
    /// Kind of the current message.
    pub kind: FrameKind,
    /// Close status, for close frames.
    pub close: Option<CloseStatus>,
}

impl ReceiveResult {
    /// Result for a received close frame.
    #[must_use]
    pub fn close(status: CloseStatus) -> Self {
        Self {
            count: 0,
            end_of_message: true,
            kind: FrameKind::Close,
            close: Some(status),
        }
    }
}

// ============================================================================
// FrameReader
// ============================================================================

/// Source of WebSocket message bytes for the codec.
#[async_trait]
pub trait FrameReader: Send + Sync {
    /// Identity of the connection being read.
    fn connection_id(&self) -> ConnectionId;

    /// Reads the next bytes of the current message into `buf`.
    async fn receive(&self, buf: &mut [u8]) -> Result<ReceiveResult>;
}

// ============================================================================
// ConnectionState
// ============================================================================

/// Close handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Open in both directions.
    Open,
    /// We sent a close frame.
    CloseSent,
    /// The peer sent a close frame.
    CloseReceived,
    /// Handshake complete or the socket failed.
    Closed,
}

// ============================================================================
// ConnectionHandle
// ============================================================================

/// Reassembled message being copied out to the reader.
struct CurrentMessage {
    kind: FrameKind,
    data: Vec<u8>,
    offset: usize,
}

struct Writer {
    sink: WsSink,
    /// Fragments of a message sent with `is_final == false`.
    partial: Vec<u8>,
}

struct Reader {
    stream: WsSource,
    current: Option<CurrentMessage>,
}

struct ConnectionInner {
    id: ConnectionId,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    writer: AsyncMutex<Writer>,
    reader: AsyncMutex<Reader>,
    state: Mutex<ConnectionState>,
    close_status: Mutex<Option<CloseStatus>>,
}

/// Thread-safe handle to one WebSocket connection.
///
/// Cheap to clone; all clones refer to the same socket.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ConnectionHandle {}

// ============================================================================
// ConnectionHandle - Constructor
// ============================================================================

impl ConnectionHandle {
    /// Wraps an established WebSocket stream.
    pub fn new<S>(
        stream: WebSocketStream<S>,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = stream.split();
        let id = ConnectionId::next();

        debug!(connection = %id, ?remote_addr, "Connection opened");

        Self {
            inner: Arc::new(ConnectionInner {
                id,
                local_addr,
                remote_addr,
                writer: AsyncMutex::new(Writer {
                    sink: Box::pin(sink),
                    partial: Vec::new(),
                }),
                reader: AsyncMutex::new(Reader {
                    stream: Box::pin(source),
                    current: None,
                }),
                state: Mutex::new(ConnectionState::Open),
                close_status: Mutex::new(None),
            }),
        }
    }
}

// ============================================================================
// ConnectionHandle - Accessors
// ============================================================================

impl ConnectionHandle {
    /// Connection identity.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Local socket address, if known.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// Remote socket address, if known.
    #[inline]
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// Close handshake progress.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Returns `true` while no close frame has been sent or received.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Returns `true` once the socket can no longer be read.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Close code and reason of the peer's close frame, once one was read.
    #[must_use]
    pub fn close_status(&self) -> Option<CloseStatus> {
        self.inner.close_status.lock().clone()
    }

    fn mark_close_sent(&self) {
        let mut state = self.inner.state.lock();
        *state = match *state {
            ConnectionState::Open => ConnectionState::CloseSent,
            _ => ConnectionState::Closed,
        };
    }

    fn mark_close_received(&self) {
        let mut state = self.inner.state.lock();
        *state = match *state {
            ConnectionState::Open => ConnectionState::CloseReceived,
            _ => ConnectionState::Closed,
        };
    }

    fn mark_closed(&self) {
        *self.inner.state.lock() = ConnectionState::Closed;
    }
}

// ============================================================================
// ConnectionHandle - Send
// ============================================================================

impl ConnectionHandle {
    /// Sends one fragment of a message.
    ///
    /// Fragments are buffered until `is_final`, then written as one message.
    /// Non-final fragments of one message must come from a single sender.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if a close frame was already exchanged
    /// - [`Error::WebSocket`] if the write fails
    pub async fn send(&self, buf: &[u8], kind: FrameKind, is_final: bool) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        writer.partial.extend_from_slice(buf);

        if !is_final {
            return Ok(());
        }

        let data = std::mem::take(&mut writer.partial);
        self.write(&mut writer, kind, data).await
    }

    /// Sends `parts` as one message, holding the write lock throughout.
    ///
    /// # Errors
    ///
    /// Same as [`ConnectionHandle::send`].
    pub async fn send_sequence(&self, parts: &[&[u8]], kind: FrameKind) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;

        let mut data = std::mem::take(&mut writer.partial);
        data.reserve(parts.iter().map(|p| p.len()).sum());
        for part in parts {
            data.extend_from_slice(part);
        }

        self.write(&mut writer, kind, data).await
    }

    async fn write(&self, writer: &mut Writer, kind: FrameKind, data: Vec<u8>) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }

        let message = match kind {
            FrameKind::Binary => Message::Binary(data.into()),
            FrameKind::Text => {
                let text = String::from_utf8(data)
                    .map_err(|e| Error::connection(format!("text message is not UTF-8: {e}")))?;
                Message::Text(text.into())
            }
            FrameKind::Close => Message::Close(None),
        };

        let length = message.len();
        if let Err(e) = writer.sink.send(message).await {
            if matches!(e, WsError::ConnectionClosed | WsError::AlreadyClosed) {
                self.mark_closed();
            }
            return Err(e.into());
        }

        trace!(connection = %self.inner.id, %kind, length, "Message written");
        Ok(())
    }

    /// Starts the close handshake without waiting for the peer.
    ///
    /// No-op once a close frame was sent or the socket is closed. Write
    /// failures are swallowed.
    pub async fn close_output(&self, reason: &str) {
        let mut writer = self.inner.writer.lock().await;

        match self.state() {
            ConnectionState::Open | ConnectionState::CloseReceived => {}
            _ => return,
        }

        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_owned().into(),
        };
        if let Err(e) = writer.sink.send(Message::Close(Some(frame))).await {
            trace!(connection = %self.inner.id, error = %e, "Close frame not sent");
            self.mark_closed();
            return;
        }

        self.mark_close_sent();
        debug!(connection = %self.inner.id, reason, "Close frame sent");
    }

    /// Closes the connection.
    ///
    /// Sends a close frame if none was sent, then waits for the peer's close
    /// frame unless the receive loop is reading it. Bound the call with a
    /// timeout; a hung peer is never awaited by this method alone.
    pub async fn close(&self, reason: &str) {
        self.close_output(reason).await;

        if let Ok(mut reader) = self.inner.reader.try_lock() {
            while !self.is_closed() {
                match reader.stream.next().await {
                    Some(Ok(Message::Close(frame))) => {
                        self.mark_close_received();
                        *self.inner.close_status.lock() = Some(close_status(frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => self.mark_closed(),
                }
            }
        }

        let mut writer = self.inner.writer.lock().await;
        let _ = writer.sink.close().await;
        self.mark_closed();
    }
}

// ============================================================================
// ConnectionHandle - Receive
// ============================================================================

#[async_trait]
impl FrameReader for ConnectionHandle {
    fn connection_id(&self) -> ConnectionId {
        self.inner.id
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<ReceiveResult> {
        let mut reader = self.inner.reader.lock().await;

        loop {
            if let Some(current) = reader.current.as_mut() {
                let remaining = &current.data[current.offset..];
                let count = remaining.len().min(buf.len());
                buf[..count].copy_from_slice(&remaining[..count]);
                current.offset += count;

                let kind = current.kind;
                let end_of_message = current.offset == current.data.len();
                if end_of_message {
                    reader.current = None;
                }

                return Ok(ReceiveResult {
                    count,
                    end_of_message,
                    kind,
                    close: None,
                });
            }

            let (kind, data) = match reader.stream.next().await {
                Some(Ok(Message::Binary(data))) => (FrameKind::Binary, data.to_vec()),
                Some(Ok(Message::Text(text))) => (FrameKind::Text, text.as_str().as_bytes().to_vec()),
                Some(Ok(Message::Close(frame))) => {
                    self.mark_close_received();
                    let status = close_status(frame);
                    debug!(connection = %self.inner.id, ?status, "Close frame received");
                    *self.inner.close_status.lock() = Some(status.clone());
                    return Ok(ReceiveResult::close(status));
                }
                // Ping/Pong are answered by the WebSocket layer.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.mark_closed();
                    return Err(e.into());
                }
                None => {
                    self.mark_closed();
                    return Ok(ReceiveResult::close(CloseStatus::default()));
                }
            };

            reader.current = Some(CurrentMessage {
                kind,
                data,
                offset: 0,
            });
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
