//! Opaque identifiers for deliveries, leases and scopes.
//!
//! All three wrap a UUIDv7, so ids minted later sort later and log lines can
//! be correlated by time without a separate timestamp.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Declares a `Copy` UUID-backed identifier with parsing, display and serde.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident $(, $extra:ident)*) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize $(, $extra)*)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Mint a fresh id from the current time.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::from_str(s).map(Self).map_err(|e| {
                    CoreError::invalid_id(format!("{}: {e}", stringify!($name)))
                })
            }
        }
    };
}

uuid_id! {
    /// Identifier of a single message, stable across its redeliveries.
    MessageId, PartialOrd, Ord
}

uuid_id! {
    /// Identifier of a lease granted by a transport.
    ///
    /// A redelivered message gets a fresh lease, so a stale `LeaseId` can never
    /// dispose of a newer delivery.
    LeaseId
}

uuid_id! {
    /// Identifier of an execution scope (used for log correlation).
    ScopeId
}
