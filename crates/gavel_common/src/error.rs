//! Centralised error handling for the Gavel platform.
//!
//! All crates in the workspace depend on `gavel_common` and use
//! `gavel_common::error::{Error, Result}` instead of rolling their own
//! top-level error types.  Errors are classified at a single boundary and
//! never leak implementation detail: each [`ErrorKind`] maps to one HTTP
//! class and one stable wire string, and the original message rides along as
//! context.
//!
//! Bid placement has its own closed taxonomy, [`BidReject`], because those
//! rejections are part of the product contract (clients branch on them).

use serde::Serialize;
use thiserror::Error;

use crate::types::Amount;

/// A convenient `Result` alias tied to [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/* -------------------------------------------------------------------------- */
/*                               Classification                               */
/* -------------------------------------------------------------------------- */

/// Category of a failure; the only thing the transport layer looks at.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or out-of-range inputs.
    Validation,
    /// Precondition on state unmet (not LIVE, round ended, wrong status).
    State,
    /// Wrong creator / forbidden role.
    Authorization,
    /// Referenced auction/round/user absent.
    NotFound,
    /// Insufficient balance.
    Capacity,
    /// Write conflict or idempotent replay.
    Conflict,
    /// Store unreachable, command failed.
    Internal,
}

impl ErrorKind {
    /// The HTTP status class used by the transport boundary.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::Authorization => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::State | ErrorKind::Capacity | ErrorKind::Conflict => 409,
            ErrorKind::Internal => 500,
        }
    }
}

/* -------------------------------------------------------------------------- */
/*                                Top-level error                             */
/* -------------------------------------------------------------------------- */

/// Top-level platform error: a category plus human-readable context.
///
/// Specialised subsystems keep their own enums (`DurableError`,
/// [`BidReject`]) and convert at the component boundary.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::State, message)
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authorization, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/* -------------------------------------------------------------------------- */
/*                              Bid rejections                                */
/* -------------------------------------------------------------------------- */

/// Closed taxonomy of bid-placement rejections.
///
/// The `kind_str` values are part of the wire contract and must never change.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "error", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BidReject {
    #[error("auction is not live")]
    AuctionNotLive,
    #[error("round has already ended")]
    RoundEnded,
    #[error("current round not found")]
    RoundNotFound,
    #[error("total {total} is below the round minimum {min_bid}")]
    BelowMinBid { min_bid: Amount, total: Amount },
    #[error("add_to_existing set but no bid exists in this round")]
    NoExistingBid,
    #[error("first-place holders may not add to their bid")]
    AlreadyFirstPlace,
    #[error("bid already inside the winning top (place {place} of {winners_per_round})")]
    AlreadyInWinningTop { place: u32, winners_per_round: u32 },
    #[error("insufficient balance ({balance} available, {required} required)")]
    InsufficientBalance { balance: Amount, required: Amount },
    #[error("a bid already exists for this round")]
    BidExists,
}

impl BidReject {
    /// Stable wire string for the `{error: <kind>}` envelope.
    pub fn kind_str(&self) -> &'static str {
        match self {
            BidReject::AuctionNotLive => "AUCTION_NOT_LIVE",
            BidReject::RoundEnded => "ROUND_ENDED",
            BidReject::RoundNotFound => "ROUND_NOT_FOUND",
            BidReject::BelowMinBid { .. } => "BELOW_MIN_BID",
            BidReject::NoExistingBid => "NO_EXISTING_BID",
            BidReject::AlreadyFirstPlace => "ALREADY_FIRST_PLACE",
            BidReject::AlreadyInWinningTop { .. } => "ALREADY_IN_WINNING_TOP",
            BidReject::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            BidReject::BidExists => "BID_EXISTS",
        }
    }

    /// Classification for the transport boundary table.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            BidReject::AuctionNotLive
            | BidReject::RoundEnded
            | BidReject::AlreadyFirstPlace
            | BidReject::AlreadyInWinningTop { .. }
            | BidReject::NoExistingBid => ErrorKind::State,
            BidReject::RoundNotFound => ErrorKind::NotFound,
            BidReject::BelowMinBid { .. } => ErrorKind::Validation,
            BidReject::InsufficientBalance { .. } => ErrorKind::Capacity,
            BidReject::BidExists => ErrorKind::Conflict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_classes_follow_the_boundary_table() {
        assert_eq!(ErrorKind::Validation.http_status(), 400);
        assert_eq!(ErrorKind::Authorization.http_status(), 403);
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::State.http_status(), 409);
        assert_eq!(ErrorKind::Capacity.http_status(), 409);
        assert_eq!(ErrorKind::Internal.http_status(), 500);
    }

    #[test]
    fn reject_kind_strings_are_stable() {
        assert_eq!(BidReject::AuctionNotLive.kind_str(), "AUCTION_NOT_LIVE");
        assert_eq!(
            BidReject::BelowMinBid { min_bid: 115, total: 100 }.kind_str(),
            "BELOW_MIN_BID"
        );
        assert_eq!(
            BidReject::InsufficientBalance { balance: 10, required: 100 }.kind_str(),
            "INSUFFICIENT_BALANCE"
        );
    }

    #[test]
    fn reject_serialises_with_error_tag() {
        let json = serde_json::to_value(BidReject::AlreadyInWinningTop {
            place: 2,
            winners_per_round: 3,
        })
        .unwrap();
        assert_eq!(json["error"], "ALREADY_IN_WINNING_TOP");
        assert_eq!(json["place"], 2);
        assert_eq!(json["winners_per_round"], 3);
    }
}
