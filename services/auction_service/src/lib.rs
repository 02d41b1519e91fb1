//! Gavel – Auction Service
//! -----------------------
//! This service is the engine behind the auction mini-app:
//!   • atomic bid placement and augmentation under high concurrency
//!   • the auction lifecycle state machine (DRAFT → RELEASED → LIVE →
//!     FINISHED) with round timers, anti-sniping and cross-round carry
//!   • real-time fan-out of auction state to subscribed viewers
//!   • the hot → durable synchroniser that keeps the system of record warm
//!
//! The implementation purposefully focuses on composability: components are
//! long-lived structs wired together once at startup and communicate through
//! channels, never through ad-hoc shared mutable state.

#![forbid(unsafe_code)]

pub mod bid_engine;
pub mod config;
pub mod error;
pub mod fanout;
pub mod lifecycle;
pub mod sync;

pub use bid_engine::{BidEngine, PlaceBidRequest, PlaceBidResponse};
pub use config::GavelConfig;
pub use error::ServiceError;
pub use fanout::{BroadcastRequest, FanoutRegistry};
pub use lifecycle::{LifecycleManager, SnipeRequest};
pub use sync::SyncWorker;
