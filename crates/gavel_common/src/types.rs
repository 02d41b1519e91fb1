//! Canonical, cross-crate identifier types.
//!
//! This module is **dependency-light** and **stable**, making it safe to be
//! imported by every crate in the workspace.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Simple aliases
// ----------------------------------------------------------------------------

/// Unix timestamp in milliseconds (UTC).
pub type TimestampMs = i64;

/// Bid / balance amount in the platform's smallest denomination.
///
/// Amounts are integral everywhere; fractional inputs are rejected at the
/// (de)serialisation boundary by this very type.
pub type Amount = i64;

// ----------------------------------------------------------------------------
// Identifier new-types
// ----------------------------------------------------------------------------

/// Per-user integer identifier, supplied by the authentication collaborator
/// on every call that acts on behalf of a user.
#[derive(
    Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct UserId(pub i64);

impl UserId {
    /// External (wire) form of the identifier.
    pub fn external(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for UserId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

/// Opaque auction identifier.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AuctionId(Uuid);

/// Opaque round identifier.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoundId(Uuid);

macro_rules! uuid_id {
    ($name:ident) => {
        impl $name {
            #[allow(clippy::new_without_default)]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::from_str(raw)?))
            }
        }
    };
}

uuid_id!(AuctionId);
uuid_id!(RoundId);
