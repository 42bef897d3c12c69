//! Message definitions.
//!
//! Every application message is a plain serde struct implementing
//! [`Message`]. The messages of one API are gathered into a closed enum with
//! [`message_set!`](crate::message_set), which dispatches by variant instead
//! of by runtime type inspection.
//!
//! # Example
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use woof_websocket::{Message, TypeId, message_set};
//!
//! #[derive(Debug, Default, Clone, Serialize, Deserialize)]
//! pub struct PingRequest {}
//!
//! impl Message for PingRequest {
//!     const TYPE_ID: TypeId = TypeId::new(7);
//! }
//!
//! #[derive(Debug, Default, Clone, Serialize, Deserialize)]
//! pub struct PingResponse {}
//!
//! impl Message for PingResponse {
//!     const TYPE_ID: TypeId = TypeId::new(8);
//! }
//!
//! message_set! {
//!     #[derive(Debug)]
//!     pub enum Api {
//!         PingRequest(PingRequest),
//!         PingResponse(PingResponse),
//!     }
//! }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt::Debug;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::identifiers::TypeId;

use super::payload::PayloadCodec;
use super::registry::MessageTypes;

// ============================================================================
// Message
// ============================================================================

/// A single registered message type.
///
/// | Constant | Meaning |
/// |----------|---------|
/// | `TYPE_ID` | Wire type id, unique within a [`MessageSet`] |
/// | `SIGNED` | Payload carries an HMAC signature |
/// | `SIGN_IN` | Key is resolved from [`Message::credential`], not the session |
/// | `ERROR` | Error report; unmatched ones release all pending requests |
///
/// A zero-length payload decodes to `Default::default()`.
pub trait Message:
    Serialize + DeserializeOwned + Default + Debug + Send + Sync + 'static
{
    /// Wire type id.
    const TYPE_ID: TypeId;

    /// Whether the payload is signed.
    const SIGNED: bool = false;

    /// Whether this is a sign-in request.
    const SIGN_IN: bool = false;

    /// Whether this message reports an error.
    const ERROR: bool = false;

    /// Credential used to resolve the signing key of a sign-in request.
    fn credential(&self) -> Option<&[u8]> {
        None
    }
}

// ============================================================================
// MessageSet
// ============================================================================

/// Closed set of messages exchanged over one transport.
///
/// Implemented by [`message_set!`](crate::message_set); hand-written impls
/// must keep `message_type` consistent with what `register` installs.
pub trait MessageSet: Debug + Send + Sync + Sized + 'static {
    /// Type id of the wrapped message.
    fn message_type(&self) -> TypeId;

    /// Variant name of the wrapped message.
    fn type_name(&self) -> &'static str;

    /// Serializes the wrapped message with `codec`.
    fn serialize_payload<P: PayloadCodec>(&self, codec: &P) -> Result<Vec<u8>>;

    /// Credential of the wrapped message, for sign-in requests.
    fn credential(&self) -> Option<&[u8]>;

    /// Registers every message type of the set.
    fn register<P: PayloadCodec>(types: &mut MessageTypes<Self, P>) -> Result<()>;
}

// ============================================================================
// message_set!
// ============================================================================

/// Declares a closed message enum and implements [`MessageSet`] for it.
///
/// Each variant wraps exactly one [`Message`] type. The macro also generates
/// `From<T> for Enum` and `TryFrom<Enum> for T` (returning the enum back on
/// mismatch), which is what `send_and_receive` uses to check response types.
///
/// [`MessageSet`]: crate::protocol::MessageSet
/// [`Message`]: crate::protocol::Message
#[macro_export]
macro_rules! message_set {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $variant:ident ( $ty:ty ) ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $( $variant($ty), )+
        }

        $(
            impl ::core::convert::From<$ty> for $name {
                #[inline]
                fn from(message: $ty) -> Self {
                    Self::$variant(message)
                }
            }

            impl ::core::convert::TryFrom<$name> for $ty {
                type Error = $name;

                #[allow(unreachable_patterns)]
                fn try_from(message: $name) -> ::core::result::Result<Self, $name> {
                    match message {
                        $name::$variant(inner) => ::core::result::Result::Ok(inner),
                        other => ::core::result::Result::Err(other),
                    }
                }
            }
        )+

        impl $crate::protocol::MessageSet for $name {
            fn message_type(&self) -> $crate::TypeId {
                match self {
                    $( Self::$variant(_) => <$ty as $crate::protocol::Message>::TYPE_ID, )+
                }
            }

            fn type_name(&self) -> &'static str {
                match self {
                    $( Self::$variant(_) => ::core::stringify!($variant), )+
                }
            }

            fn serialize_payload<P: $crate::protocol::PayloadCodec>(
                &self,
                codec: &P,
            ) -> $crate::Result<::std::vec::Vec<u8>> {
                match self {
                    $( Self::$variant(inner) => codec.serialize(inner), )+
                }
            }

            fn credential(&self) -> ::core::option::Option<&[u8]> {
                match self {
                    $( Self::$variant(inner) => <$ty as $crate::protocol::Message>::credential(inner), )+
                }
            }

            fn register<P: $crate::protocol::PayloadCodec>(
                types: &mut $crate::protocol::MessageTypes<Self, P>,
            ) -> $crate::Result<()> {
                $( types.register::<$ty>()?; )+
                ::core::result::Result::Ok(())
            }
        }
    };
}

// ============================================================================
// Tests
// ============================================================================
