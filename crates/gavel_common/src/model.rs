//! Auction domain model.
//!
//! Responsibilities
//! ----------------
//! 1. The persisted shapes of auctions, rounds, bids, user accounts and
//!    deliveries.
//! 2. Derived quantities that every component agrees on: winners per round,
//!    the per-round minimum bid, a round's effective end.
//! 3. The auction status DFA and creation-time validation.
//!
//! Anything that *mutates* these records lives in the lifecycle manager or
//! the stores; this module only knows what the records mean.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    types::{Amount, AuctionId, RoundId, UserId},
};

/* -------------------------------------------------------------------------- */
/*                                  Auction                                   */
/* -------------------------------------------------------------------------- */

/// Lifecycle states of an auction.
///
/// Transitions are monotonic: `Draft → Released → Live → Finished`, with
/// `Deleted` reachable only from `Draft` (soft delete). No back-transitions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuctionStatus {
    Draft,
    Released,
    Live,
    Finished,
    Deleted,
}

impl AuctionStatus {
    /// Table-driven definition of allowed edges.
    pub fn can_transition(self, next: AuctionStatus) -> bool {
        use AuctionStatus::*;
        matches!(
            (self, next),
            (Draft, Released) | (Released, Live) | (Live, Finished) | (Draft, Deleted)
        )
    }
}

impl std::fmt::Display for AuctionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuctionStatus::Draft => "DRAFT",
            AuctionStatus::Released => "RELEASED",
            AuctionStatus::Live => "LIVE",
            AuctionStatus::Finished => "FINISHED",
            AuctionStatus::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// A multi-round sealed-bid auction.
///
/// Immutable after `Released` except for `status`, `current_round_idx` and
/// `remaining_items_count`, all of which are owned by the lifecycle manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Auction {
    pub id: AuctionId,
    pub name: Option<String>,
    pub creator_id: UserId,
    pub item_name: String,
    /// Base minimum bid for round 0; later rounds scale it up 5 % per index.
    pub min_bid: Amount,
    /// Total items distributed over the whole auction (N).
    pub winners_count_total: u32,
    /// Number of rounds (R).
    pub rounds_count: u32,
    /// Round 0 may run on its own clock (e.g. a longer opening round).
    pub first_round_duration_ms: Option<i64>,
    pub round_duration_ms: i64,
    pub start_datetime: DateTime<Utc>,
    pub status: AuctionStatus,
    /// 0-based index of the round currently running (meaningful while LIVE).
    pub current_round_idx: u32,
    /// Items not yet awarded; starts at `winners_count_total`.
    pub remaining_items_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters supplied by the creation collaborator.
#[derive(Clone, Debug, Deserialize)]
pub struct AuctionParams {
    pub name: Option<String>,
    pub item_name: String,
    pub min_bid: Amount,
    pub winners_count_total: u32,
    pub rounds_count: u32,
    pub first_round_duration_ms: Option<i64>,
    pub round_duration_ms: i64,
    pub start_datetime: DateTime<Utc>,
}

impl AuctionParams {
    /// Creation- and update-time validation: structural bounds plus a
    /// future start time.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.rounds_count < 1 {
            return Err(Error::validation("rounds_count must be >= 1"));
        }
        if self.winners_count_total < 1 {
            return Err(Error::validation("winners_count_total must be >= 1"));
        }
        if self.min_bid < 1 {
            return Err(Error::validation("min_bid must be >= 1"));
        }
        if self.round_duration_ms <= 0 {
            return Err(Error::validation("round_duration_ms must be positive"));
        }
        if matches!(self.first_round_duration_ms, Some(ms) if ms <= 0) {
            return Err(Error::validation("first_round_duration_ms must be positive"));
        }
        if self.item_name.trim().is_empty() {
            return Err(Error::validation("item_name must not be empty"));
        }
        if self.start_datetime <= now {
            return Err(Error::validation("start_datetime must be in the future"));
        }
        Ok(())
    }
}

impl Auction {
    /// Build a DRAFT auction from validated parameters.
    pub fn from_params(creator_id: UserId, params: AuctionParams, now: DateTime<Utc>) -> Result<Self> {
        params.validate(now)?;
        Ok(Self {
            id: AuctionId::new(),
            name: params.name,
            creator_id,
            item_name: params.item_name,
            min_bid: params.min_bid,
            winners_count_total: params.winners_count_total,
            rounds_count: params.rounds_count,
            first_round_duration_ms: params.first_round_duration_ms,
            round_duration_ms: params.round_duration_ms,
            start_datetime: params.start_datetime,
            status: AuctionStatus::Draft,
            current_round_idx: 0,
            remaining_items_count: params.winners_count_total,
            created_at: now,
            updated_at: now,
        })
    }

    /// `round(N / R)` — items awarded at the end of each round.
    pub fn winners_per_round(&self) -> u32 {
        let ratio = f64::from(self.winners_count_total) / f64::from(self.rounds_count);
        ratio.round() as u32
    }

    /// Minimum acceptable total for a bid in round `idx`:
    /// `round(min_bid * (1 + 0.05 * idx))`.
    pub fn min_bid_for_round(&self, idx: u32) -> Amount {
        let scaled = self.min_bid as f64 * (1.0 + 0.05 * f64::from(idx));
        scaled.round() as Amount
    }

    /// Duration of round `idx` in milliseconds.
    pub fn round_duration_for(&self, idx: u32) -> i64 {
        if idx == 0 {
            self.first_round_duration_ms.unwrap_or(self.round_duration_ms)
        } else {
            self.round_duration_ms
        }
    }

    /// End time the auction would reach if no round is ever extended.
    pub fn planned_end_datetime(&self) -> DateTime<Utc> {
        let mut total_ms = 0i64;
        for idx in 0..self.rounds_count {
            total_ms += self.round_duration_for(idx);
        }
        self.start_datetime + Duration::milliseconds(total_ms)
    }

    /// Whether `idx` is the last round of the auction.
    pub fn is_final_round(&self, idx: u32) -> bool {
        idx + 1 >= self.rounds_count
    }
}

/* -------------------------------------------------------------------------- */
/*                                   Round                                    */
/* -------------------------------------------------------------------------- */

/// One round of an auction. Created by the lifecycle manager at each
/// boundary, never mutated after its effective end is reached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub auction_id: AuctionId,
    /// 0-based position; `(auction_id, idx)` is unique.
    pub idx: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Set by anti-sniping; monotonically increasing.
    pub extended_until: Option<DateTime<Utc>>,
}

impl Round {
    pub fn new(auction_id: AuctionId, idx: u32, started_at: DateTime<Utc>, duration_ms: i64) -> Self {
        Self {
            id: RoundId::new(),
            auction_id,
            idx,
            started_at,
            ended_at: started_at + Duration::milliseconds(duration_ms),
            extended_until: None,
        }
    }

    /// The actual deadline: `extended_until` when set, `ended_at` otherwise.
    pub fn effective_end(&self) -> DateTime<Utc> {
        self.extended_until.unwrap_or(self.ended_at)
    }

    /// Bids are accepted strictly before the effective end.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        now < self.effective_end()
    }
}

/* -------------------------------------------------------------------------- */
/*                                    Bid                                     */
/* -------------------------------------------------------------------------- */

/// A user's bid within one round. `amount` is the sum of all augmentations
/// since the round started (carried value included); it only ever grows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub auction_id: AuctionId,
    pub round_id: RoundId,
    pub round_idx: u32,
    pub user_id: UserId,
    pub amount: Amount,
    /// 1-based rank within the round; recomputed by the synchroniser.
    pub place_id: Option<u32>,
    /// Set when this bid triggered an anti-sniping extension.
    pub is_top3_sniping_bid: bool,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/* -------------------------------------------------------------------------- */
/*                                    User                                    */
/* -------------------------------------------------------------------------- */

/// Durable mirror of a user's balance. The authoritative counter lives in
/// the hot store while any auction is active.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: UserId,
    pub balance: Amount,
    pub updated_at: DateTime<Utc>,
}

/* -------------------------------------------------------------------------- */
/*                                  Delivery                                  */
/* -------------------------------------------------------------------------- */

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

/// Delivery record produced per winner per round.
/// `(auction_id, round_id, winner_user_id)` is unique.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub auction_id: AuctionId,
    pub round_id: RoundId,
    pub winner_user_id: UserId,
    pub item_name: String,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/* -------------------------------------------------------------------------- */
/*                                   Tests                                    */
/* -------------------------------------------------------------------------- */
