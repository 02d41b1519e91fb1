//! Gavel – Common primitives & domain model
//!
//! This crate is the canonical place for types shared by every Gavel crate:
//! identifiers, the auction domain model, and the error taxonomy.  Keeping
//! them in an isolated crate avoids cyclic dependencies and makes sure we
//! never end up with two incompatible versions of the same `AuctionId` or
//! `BidReject` floating around in the dependency graph.
//!
//! The crate purposefully stays *lightweight*: only foundational types live
//! here.  Anything specific to a single component (the hot-store command set,
//! the fan-out payloads) belongs to the respective crate.

#![forbid(unsafe_code)]

pub mod error;
pub mod model;
pub mod types;

pub use error::{BidReject, Error, ErrorKind, Result};
pub use model::{
    Auction, AuctionParams, AuctionStatus, Bid, Delivery, DeliveryStatus, Round, UserAccount,
};
pub use types::{Amount, AuctionId, RoundId, TimestampMs, UserId};
