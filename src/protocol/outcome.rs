//! Decode results.

// ============================================================================
// Imports
// ============================================================================

use crate::error::Error;
use crate::identifiers::{MessageId, TypeId};
use crate::protocol::signing::SigningKey;
use crate::transport::CloseStatus;

// ============================================================================
// Incoming
// ============================================================================

/// A successfully decoded message.
#[derive(Debug)]
pub struct Incoming<M> {
    /// Decoded message.
    pub message: M,
    /// Correlation id from the metadata.
    pub message_id: MessageId,
    /// Wire type id.
    pub type_id: TypeId,
    /// Type is flagged as an error report.
    pub is_error: bool,
    /// Type is signed and not a sign-in request.
    pub signature_required: bool,
    /// Signature was present and matched the resolved key.
    pub signature_valid: bool,
    /// Key resolved for a sign-in request by the authentication provider.
    pub sign_in_key: Option<SigningKey>,
}

impl<M> Incoming<M> {
    /// Returns `true` if a valid signature was required but not found.
    ///
    /// The codec does not reject such messages; replying with a denial is up
    /// to the handler.
    #[inline]
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        self.signature_required && !self.signature_valid
    }
}

// ============================================================================
// DecodeOutcome
// ============================================================================

/// Result of one decode call.
#[derive(Debug)]
pub enum DecodeOutcome<M> {
    /// A complete message.
    Message(Incoming<M>),
    /// The peer sent a close frame.
    Close(CloseStatus),
    /// The frame could not be decoded.
    ///
    /// `message_id` is set once the metadata was read, so a failure can be
    /// routed to the request it answers.
    Error {
        /// Correlation id, if the metadata was readable.
        message_id: Option<MessageId>,
        /// Cause.
        error: Error,
    },
}

impl<M> DecodeOutcome<M> {
    /// Creates an error outcome.
    #[inline]
    pub(crate) fn error(message_id: Option<MessageId>, error: Error) -> Self {
        Self::Error { message_id, error }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn incoming(required: bool, valid: bool) -> Incoming<()> {
        Incoming {
            message: (),
            message_id: MessageId::nil(),
            type_id: TypeId::new(1),
            is_error: false,
            signature_required: required,
            signature_valid: valid,
            sign_in_key: None,
        }
    }

    #[test]
    fn test_is_unauthorized() {
        assert!(incoming(true, false).is_unauthorized());
        assert!(!incoming(true, true).is_unauthorized());
        assert!(!incoming(false, false).is_unauthorized());
    }
}
