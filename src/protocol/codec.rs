//! WOOF frame codec.
//!
//! Encodes messages into `[meta length][metadata][payload]` frames and
//! decodes them back, verifying signatures on the way in.
//!
//! # Decode Steps
//!
//! Each step may end the decode early:
//!
//! | Step | Failure |
//! |------|---------|
//! | Read the 1-byte metadata length | Close frame, non-binary frame, header incomplete |
//! | Read the metadata block | Close frame, header incomplete |
//! | Parse metadata | Invalid metadata |
//! | Look up the type | Unknown type (payload drained first) |
//! | Check the receive limit | Length exceeded (payload left unread) |
//! | Read the payload | Message incomplete |
//! | Deserialize and verify | Payload error; bad signatures only clear `signature_valid` |
//!
//! A zero-length payload decodes to the type's default value without
//! signature checking.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::auth::AuthenticationProvider;
use crate::buffer::GrowableBuffer;
use crate::error::{Error, Result};
use crate::identifiers::{MessageId, TypeId};
use crate::session::SessionRegistry;
use crate::transport::{CloseStatus, ConnectionHandle, FrameKind, FrameReader};

use super::message::MessageSet;
use super::metadata::Metadata;
use super::outcome::{DecodeOutcome, Incoming};
use super::payload::{BincodePayload, PayloadCodec};
use super::registry::{MessageTypeDescriptor, MessageTypes};
use super::signing::SigningKey;

// ============================================================================
// Constants
// ============================================================================

/// WebSocket subprotocol name negotiated during the handshake.
pub const SUBPROTOCOL: &str = "WOOF";

/// Initial payload buffer size; larger payloads grow into place.
const PAYLOAD_INITIAL_CAPACITY: usize = 8192;

/// Scratch size used when discarding the rest of a message.
const SKIP_CHUNK: usize = 4096;

// ============================================================================
// EncodedFrame
// ============================================================================

/// One encoded frame, split into header and payload segments.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Message id written into the metadata.
    pub id: MessageId,
    /// Length prefix followed by the metadata block.
    header: Vec<u8>,
    /// Serialized payload, possibly empty.
    payload: Vec<u8>,
}

impl EncodedFrame {
    /// Segments to send, omitting an empty payload.
    #[must_use]
    pub fn parts(&self) -> Vec<&[u8]> {
        if self.payload.is_empty() {
            vec![&self.header]
        } else {
            vec![&self.header, &self.payload]
        }
    }

    /// Header segment.
    #[inline]
    #[must_use]
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Payload segment.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whole frame as one buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.header.len() + self.payload.len());
        bytes.extend_from_slice(&self.header);
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

// ============================================================================
// Read Helpers
// ============================================================================

/// Result of reading a fixed-size block.
enum Fill {
    Complete { ended: bool },
    Short { ended: bool },
    Close(CloseStatus),
    WrongKind(FrameKind),
}

/// Result of reading a payload.
enum PayloadRead {
    Read { bytes: Vec<u8>, ended: bool },
    Close(CloseStatus),
    WrongKind(FrameKind),
}

/// Reads until `buf` is full or the message ends.
async fn fill<R: FrameReader + ?Sized>(reader: &R, buf: &mut [u8]) -> Result<Fill> {
    let mut filled = 0;
    let mut ended = false;

    while filled < buf.len() {
        let received = reader.receive(&mut buf[filled..]).await?;
        match received.kind {
            FrameKind::Binary => {}
            FrameKind::Close => return Ok(Fill::Close(received.close.unwrap_or_default())),
            kind => return Ok(Fill::WrongKind(kind)),
        }

        filled += received.count;
        if received.end_of_message {
            ended = true;
            break;
        }
        if received.count == 0 {
            break;
        }
    }

    if filled < buf.len() {
        Ok(Fill::Short { ended })
    } else {
        Ok(Fill::Complete { ended })
    }
}

/// Reads up to `length` payload bytes into a growable buffer.
async fn read_payload<R: FrameReader + ?Sized>(reader: &R, length: usize) -> Result<PayloadRead> {
    if length == 0 {
        return Ok(PayloadRead::Read {
            bytes: Vec::new(),
            ended: false,
        });
    }

    let mut buffer = GrowableBuffer::new(length.min(PAYLOAD_INITIAL_CAPACITY), Some(length));
    let mut ended = false;

    loop {
        let received = reader.receive(buffer.spare_mut()).await?;
        match received.kind {
            FrameKind::Binary => {}
            FrameKind::Close => {
                return Ok(PayloadRead::Close(received.close.unwrap_or_default()));
            }
            kind => return Ok(PayloadRead::WrongKind(kind)),
        }

        let done = received.end_of_message
            || received.count == 0
            || buffer.len() + received.count == length;
        buffer.advance(received.count, done)?;

        if done {
            ended = received.end_of_message;
            break;
        }
    }

    Ok(PayloadRead::Read {
        bytes: buffer.into_vec(),
        ended,
    })
}

/// Discards the rest of the current message.
async fn skip_rest<R: FrameReader + ?Sized>(reader: &R) -> Result<()> {
    let mut scratch = [0u8; SKIP_CHUNK];
    let mut skipped = 0usize;

    loop {
        let received = reader.receive(&mut scratch).await?;
        skipped += received.count;
        if received.end_of_message || received.kind == FrameKind::Close || received.count == 0 {
            break;
        }
    }

    trace!(connection = %reader.connection_id(), skipped, "Skipped message remainder");
    Ok(())
}

// ============================================================================
// WoofCodec
// ============================================================================

/// Encoder/decoder for the WOOF subprotocol.
///
/// Owns the message type registry built from `M` and the payload codec `P`.
pub struct WoofCodec<M, P = BincodePayload> {
    types: MessageTypes<M, P>,
    payload: P,
    auth: Option<Arc<dyn AuthenticationProvider>>,
}

impl<M, P: fmt::Debug> fmt::Debug for WoofCodec<M, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WoofCodec")
            .field("types", &self.types)
            .field("payload", &self.payload)
            .field("auth", &self.auth.is_some())
            .finish()
    }
}

impl<M, P> WoofCodec<M, P>
where
    M: MessageSet,
    P: PayloadCodec,
{
    /// Creates a codec, registering every type of `M`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateTypeId`] if two types share an id.
    pub fn new(payload: P, auth: Option<Arc<dyn AuthenticationProvider>>) -> Result<Self> {
        let types = MessageTypes::build()?;
        debug!(types = types.len(), "Message types registered");
        Ok(Self {
            types,
            payload,
            auth,
        })
    }

    /// Registered message types.
    #[inline]
    #[must_use]
    pub fn types(&self) -> &MessageTypes<M, P> {
        &self.types
    }

    /// Payload codec.
    #[inline]
    #[must_use]
    pub fn payload_codec(&self) -> &P {
        &self.payload
    }

    /// Authentication provider used for sign-in requests.
    #[inline]
    #[must_use]
    pub fn auth(&self) -> Option<&Arc<dyn AuthenticationProvider>> {
        self.auth.as_ref()
    }

    // ========================================================================
    // Decode
    // ========================================================================

    /// Reads and decodes one message.
    ///
    /// Framing problems come back as [`DecodeOutcome::Error`]; only I/O
    /// failures of the reader are returned as `Err`.
    ///
    /// # Arguments
    ///
    /// * `reader` - Source of the message
    /// * `sessions` - Registry holding the signing key of the connection
    /// * `size_limit` - Largest accepted payload, `None` for unlimited
    pub async fn decode<R>(
        &self,
        reader: &R,
        sessions: &SessionRegistry,
        size_limit: Option<usize>,
    ) -> Result<DecodeOutcome<M>>
    where
        R: FrameReader + ?Sized,
    {
        let mut prefix = [0u8; 1];
        let head = reader.receive(&mut prefix).await?;

        match head.kind {
            FrameKind::Binary => {}
            FrameKind::Close => {
                return Ok(DecodeOutcome::Close(head.close.unwrap_or_default()));
            }
            kind => {
                if !head.end_of_message {
                    skip_rest(reader).await?;
                }
                return Ok(DecodeOutcome::error(None, Error::UnexpectedFrameKind { kind }));
            }
        }

        if head.count == 0 || head.end_of_message {
            if !head.end_of_message {
                skip_rest(reader).await?;
            }
            return Ok(DecodeOutcome::error(None, Error::HeaderIncomplete));
        }

        let mut block = vec![0u8; usize::from(prefix[0])];
        let ended = match fill(reader, &mut block).await? {
            Fill::Complete { ended } => ended,
            Fill::Short { ended } => {
                if !ended {
                    skip_rest(reader).await?;
                }
                return Ok(DecodeOutcome::error(None, Error::HeaderIncomplete));
            }
            Fill::Close(status) => return Ok(DecodeOutcome::Close(status)),
            Fill::WrongKind(kind) => {
                return Ok(DecodeOutcome::error(None, Error::UnexpectedFrameKind { kind }));
            }
        };

        let metadata = match Metadata::decode(&block) {
            Ok(metadata) => metadata,
            Err(error) => {
                if !ended {
                    skip_rest(reader).await?;
                }
                return Ok(DecodeOutcome::error(None, error));
            }
        };
        let id = metadata.id;

        let Some(descriptor) = self.types.get(metadata.type_id) else {
            return self.drain_unknown(reader, metadata, ended).await;
        };

        if let Some(limit) = size_limit
            && metadata.payload_length > limit
        {
            warn!(
                connection = %reader.connection_id(),
                message_id = %id,
                length = metadata.payload_length,
                limit,
                "Message length exceeds receive limit"
            );
            return Ok(DecodeOutcome::error(
                Some(id),
                Error::LengthExceeded {
                    length: metadata.payload_length,
                    limit,
                },
            ));
        }

        if metadata.payload_length == 0 {
            if !ended {
                skip_rest(reader).await?;
            }
            return Ok(DecodeOutcome::Message(Incoming {
                message: descriptor.empty(),
                message_id: id,
                type_id: descriptor.type_id,
                is_error: descriptor.error,
                signature_required: false,
                signature_valid: false,
                sign_in_key: None,
            }));
        }

        if ended {
            return Ok(DecodeOutcome::error(
                Some(id),
                Error::MessageIncomplete {
                    expected: metadata.payload_length,
                    received: 0,
                },
            ));
        }

        let payload = match read_payload(reader, metadata.payload_length).await? {
            PayloadRead::Read { bytes, ended } if bytes.len() == metadata.payload_length => {
                if !ended {
                    skip_rest(reader).await?;
                }
                bytes
            }
            PayloadRead::Read { bytes, .. } => {
                return Ok(DecodeOutcome::error(
                    Some(id),
                    Error::MessageIncomplete {
                        expected: metadata.payload_length,
                        received: bytes.len(),
                    },
                ));
            }
            PayloadRead::Close(status) => return Ok(DecodeOutcome::Close(status)),
            PayloadRead::WrongKind(kind) => {
                return Ok(DecodeOutcome::error(Some(id), Error::UnexpectedFrameKind { kind }));
            }
        };

        let message = match descriptor.decode(&self.payload, &payload) {
            Ok(message) => message,
            Err(error) => return Ok(DecodeOutcome::error(Some(id), error)),
        };

        let mut signature_valid = false;
        let mut sign_in_key = None;

        if descriptor.signed
            && let Some(signature) = metadata.signature.as_deref()
        {
            let key = if descriptor.sign_in {
                self.resolve_sign_in_key(&message).await
            } else {
                sessions.key(reader.connection_id())
            };

            if let Some(key) = key {
                signature_valid = key.verify(&payload, signature);
                if descriptor.sign_in {
                    sign_in_key = Some(key);
                }
            }
        }

        trace!(
            connection = %reader.connection_id(),
            message_id = %id,
            type_id = %descriptor.type_id,
            length = payload.len(),
            signature_valid,
            "Message decoded"
        );

        Ok(DecodeOutcome::Message(Incoming {
            message,
            message_id: id,
            type_id: descriptor.type_id,
            is_error: descriptor.error,
            signature_required: descriptor.signed && !descriptor.sign_in,
            signature_valid,
            sign_in_key,
        }))
    }

    /// Drains the payload of an unregistered type to keep frames aligned.
    async fn drain_unknown<R>(
        &self,
        reader: &R,
        metadata: Metadata,
        ended: bool,
    ) -> Result<DecodeOutcome<M>>
    where
        R: FrameReader + ?Sized,
    {
        let raw = if ended {
            Vec::new()
        } else {
            match read_payload(reader, metadata.payload_length).await? {
                PayloadRead::Read { bytes, ended } => {
                    if !ended && bytes.len() == metadata.payload_length {
                        skip_rest(reader).await?;
                    }
                    bytes
                }
                PayloadRead::Close(status) => return Ok(DecodeOutcome::Close(status)),
                PayloadRead::WrongKind(kind) => {
                    return Ok(DecodeOutcome::error(
                        Some(metadata.id),
                        Error::UnexpectedFrameKind { kind },
                    ));
                }
            }
        };

        debug!(
            connection = %reader.connection_id(),
            message_id = %metadata.id,
            type_id = %metadata.type_id,
            drained = raw.len(),
            "Unknown message type"
        );

        Ok(DecodeOutcome::error(
            Some(metadata.id),
            Error::UnknownType {
                type_id: metadata.type_id,
                raw,
            },
        ))
    }

    async fn resolve_sign_in_key(&self, message: &M) -> Option<SigningKey> {
        let auth = self.auth.as_ref()?;
        let credential = message.credential()?;
        auth.resolve_key(credential).await
    }

    // ========================================================================
    // Encode
    // ========================================================================

    /// Encodes a message.
    ///
    /// The payload is signed with `key` only if the type is signed and the
    /// payload is not empty. A `None` id generates a fresh one.
    ///
    /// # Errors
    ///
    /// - [`Error::UnregisteredType`] if the variant is not registered
    /// - [`Error::MetadataTooLong`] if the metadata overflows its prefix
    /// - Payload codec errors
    pub fn encode(
        &self,
        message: &M,
        id: Option<MessageId>,
        key: Option<&SigningKey>,
    ) -> Result<EncodedFrame> {
        let descriptor = self.descriptor_of(message)?;
        let payload = message.serialize_payload(&self.payload)?;
        let key = if descriptor.signed { key } else { None };
        build_frame(descriptor.type_id, payload, id, key)
    }

    /// Encodes a frame from a raw type id and pre-serialized payload.
    ///
    /// Signs with `key` whenever one is given and the payload is not empty.
    pub fn encode_raw(
        &self,
        type_id: TypeId,
        payload: Vec<u8>,
        id: Option<MessageId>,
        key: Option<&SigningKey>,
    ) -> Result<EncodedFrame> {
        build_frame(type_id, payload, id, key)
    }

    /// Encodes a message and sends it as one binary WebSocket message.
    ///
    /// Sending on a closed connection is a silent no-op.
    ///
    /// # Returns
    ///
    /// The message id written into the frame.
    pub async fn send_encoded(
        &self,
        connection: &ConnectionHandle,
        sessions: &SessionRegistry,
        message: &M,
        id: Option<MessageId>,
    ) -> Result<MessageId> {
        let id = id.unwrap_or_else(MessageId::generate);

        if !connection.is_open() {
            trace!(connection = %connection.id(), message_id = %id, "Send skipped, connection closed");
            return Ok(id);
        }

        let descriptor = self.descriptor_of(message)?;
        let key = if descriptor.signed {
            sessions.key(connection.id())
        } else {
            None
        };

        let frame = self.encode(message, Some(id), key.as_ref())?;
        self.send_frame(connection, &frame).await?;

        trace!(
            connection = %connection.id(),
            message_id = %id,
            type_id = %descriptor.type_id,
            signed = key.is_some(),
            "Message sent"
        );

        Ok(id)
    }

    /// Sends an already encoded frame.
    ///
    /// A connection closing underneath the send is not an error.
    pub async fn send_frame(&self, connection: &ConnectionHandle, frame: &EncodedFrame) -> Result<()> {
        match connection.send_sequence(&frame.parts(), FrameKind::Binary).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_closed() => {
                debug!(connection = %connection.id(), message_id = %frame.id, "Send raced connection close");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn descriptor_of(&self, message: &M) -> Result<&MessageTypeDescriptor<M, P>> {
        let type_id = message.message_type();
        self.types
            .get(type_id)
            .ok_or(Error::UnregisteredType { type_id })
    }
}

/// Assembles header and payload segments.
fn build_frame(
    type_id: TypeId,
    payload: Vec<u8>,
    id: Option<MessageId>,
    key: Option<&SigningKey>,
) -> Result<EncodedFrame> {
    let signature = match key {
        Some(key) if !payload.is_empty() => Some(key.sign(&payload)?),
        _ => None,
    };

    let metadata = Metadata {
        id: id.unwrap_or_else(MessageId::generate),
        type_id,
        payload_length: payload.len(),
        signature,
    };

    Ok(EncodedFrame {
        id: metadata.id,
        header: metadata.encode_prefixed()?,
        payload,
    })
}

// ============================================================================
// Tests
// ============================================================================
