//! Message type identification.
//!
//! Every message exchanged over the wire carries a 64-bit type id in its
//! envelope header so the receiving side can route it to the right handler
//! without a shared schema registry. The id is derived from the type's
//! name with xxhash64 under a fixed seed, which makes it stable across
//! builds and platforms. Collisions between two registered types on the
//! same endpoint are a configuration error and are rejected at
//! registration time (see `Dispatcher`).

use serde::de::DeserializeOwned;
use serde::Serialize;
use twox_hash::XxHash64;

/// Seed for the type-name hash. Changing this value changes every type id
/// on the wire, so it is part of the protocol.
const TYPE_HASH_SEED: u64 = 0x6d73_6777_6972_6500;

/// Derives the stable 64-bit id for a message type name.
pub fn type_hash(name: &str) -> u64 {
    XxHash64::oneshot(TYPE_HASH_SEED, name.as_bytes())
}

/// A message that can travel over a peer connection.
///
/// Implementors must serialize as a MessagePack array of their fields in
/// declaration order, which is what `rmp_serde`'s positional encoding does
/// for any plain `#[derive(Serialize, Deserialize)]` struct. Use the
/// [`message_type!`](crate::message_type) macro to attach the wire name:
///
/// ```
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// struct HelloRequest {
///     msg: String,
/// }
///
/// msgwire::message_type!(HelloRequest);
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    /// The name the type id is derived from. Two endpoints must agree on
    /// this string for a message to route.
    const NAME: &'static str;

    /// The 64-bit wire id of this type.
    fn type_hash() -> u64 {
        type_hash(Self::NAME)
    }
}

/// Implements [`Message`] for a type, deriving the wire name from the type
/// name (or from an explicit string literal for renamed types).
#[macro_export]
macro_rules! message_type {
    ($ty:ty) => {
        impl $crate::Message for $ty {
            const NAME: &'static str = stringify!($ty);
        }
    };
    ($ty:ty, $name:literal) => {
        impl $crate::Message for $ty {
            const NAME: &'static str = $name;
        }
    };
}
