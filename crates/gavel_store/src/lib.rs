//! Gavel – storage layer.
//!
//! Two stores with sharply different roles:
//!
//! * [`hot`] — authoritative for in-flight bids and balances while an auction
//!   is LIVE.  Every mutating command executes as one indivisible unit, the
//!   in-process analog of a scripted single-threaded KV server.
//! * [`durable`] — sled-backed system of record for auctions, rounds,
//!   deliveries and the eventual mirror of bids/balances, with an ordered
//!   change feed the lifecycle manager subscribes to.
//!
//! Dependency order is leaves-first: `durable` knows nothing about `hot`,
//! and neither knows about the components above them.

#![forbid(unsafe_code)]

pub mod durable;
pub mod hot;

pub use durable::{ChangeEvent, ChangeOp, Collection, DurableError, DurableStore};
pub use hot::{
    BidRecord, CarryTask, HotConfig, HotStore, PlaceCommand, PlaceOutcome, PlacedBid, RankedBid,
    RoundContext,
};
