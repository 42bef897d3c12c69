//! Message type registry.
//!
//! Maps each wire [`TypeId`] to a [`MessageTypeDescriptor`] holding the
//! type's flags and a decode function that produces the enum variant.
//! Built once when the codec is constructed and immutable afterwards.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::marker::PhantomData;

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::identifiers::TypeId;

use super::message::{Message, MessageSet};
use super::payload::PayloadCodec;

// ============================================================================
// Types
// ============================================================================

/// Decodes a payload into a message set variant.
type DecodeFn<M, P> = fn(&P, &[u8]) -> Result<M>;

/// Produces the default instance of a variant (zero-length payload).
type EmptyFn<M> = fn() -> M;

// ============================================================================
// MessageTypeDescriptor
// ============================================================================

/// Flags and decoder for one registered message type.
pub struct MessageTypeDescriptor<M, P> {
    /// Wire type id.
    pub type_id: TypeId,
    /// Rust type name, for diagnostics.
    pub name: &'static str,
    /// Payload is signed.
    pub signed: bool,
    /// Sign-in request.
    pub sign_in: bool,
    /// Error report.
    pub error: bool,
    decode: DecodeFn<M, P>,
    empty: EmptyFn<M>,
}

impl<M, P> MessageTypeDescriptor<M, P> {
    /// Deserializes `payload` into the registered type.
    #[inline]
    pub fn decode(&self, codec: &P, payload: &[u8]) -> Result<M> {
        (self.decode)(codec, payload)
    }

    /// Returns the default instance of the registered type.
    #[inline]
    #[must_use]
    pub fn empty(&self) -> M {
        (self.empty)()
    }
}

impl<M, P> fmt::Debug for MessageTypeDescriptor<M, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageTypeDescriptor")
            .field("type_id", &self.type_id)
            .field("name", &self.name)
            .field("signed", &self.signed)
            .field("sign_in", &self.sign_in)
            .field("error", &self.error)
            .finish()
    }
}

fn decode_as<T, M, P>(codec: &P, payload: &[u8]) -> Result<M>
where
    T: Message + Into<M>,
    P: PayloadCodec,
{
    codec.deserialize::<T>(payload).map(Into::into)
}

fn empty_as<T, M>() -> M
where
    T: Message + Into<M>,
{
    T::default().into()
}

// ============================================================================
// MessageTypes
// ============================================================================

/// Registry of every message type in a [`MessageSet`].
pub struct MessageTypes<M, P> {
    descriptors: FxHashMap<TypeId, MessageTypeDescriptor<M, P>>,
    _codec: PhantomData<fn() -> P>,
}

impl<M, P> fmt::Debug for MessageTypes<M, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.descriptors.iter().map(|(id, d)| (id, d.name)))
            .finish()
    }
}

impl<M, P> MessageTypes<M, P>
where
    M: MessageSet,
    P: PayloadCodec,
{
    /// Builds the registry for `M`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateTypeId`] if two types share an id.
    pub fn build() -> Result<Self> {
        let mut types = Self {
            descriptors: FxHashMap::default(),
            _codec: PhantomData,
        };
        M::register(&mut types)?;
        Ok(types)
    }

    /// Registers one message type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateTypeId`] if the id is already taken.
    pub fn register<T>(&mut self) -> Result<()>
    where
        T: Message + Into<M>,
    {
        let name = std::any::type_name::<T>();

        if let Some(existing) = self.descriptors.get(&T::TYPE_ID) {
            return Err(Error::DuplicateTypeId {
                type_id: T::TYPE_ID,
                first: existing.name,
                second: name,
            });
        }

        self.descriptors.insert(
            T::TYPE_ID,
            MessageTypeDescriptor {
                type_id: T::TYPE_ID,
                name,
                signed: T::SIGNED,
                sign_in: T::SIGN_IN,
                error: T::ERROR,
                decode: decode_as::<T, M, P>,
                empty: empty_as::<T, M>,
            },
        );

        Ok(())
    }
}

impl<M, P> MessageTypes<M, P> {
    /// Looks up a descriptor by type id.
    #[inline]
    #[must_use]
    pub fn get(&self, type_id: TypeId) -> Option<&MessageTypeDescriptor<M, P>> {
        self.descriptors.get(&type_id)
    }

    /// Number of registered types.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Returns `true` if nothing is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
