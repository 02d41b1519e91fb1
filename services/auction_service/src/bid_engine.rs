//! Bid engine: validated, atomic placement and augmentation of bids.
//!
//! The engine owns none of the data — it reads auction/round state (hot
//! cache falling through to the durable store), delegates the indivisible
//! part to the hot store's placement script, and fires the best-effort
//! post-commit steps: anti-sniping requests toward the lifecycle manager and
//! forced broadcasts toward the fan-out.  Both travel over channels; the
//! engine never blocks on either.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use gavel_common::{
    error::{BidReject, Error as DomainError},
    model::{Auction, AuctionStatus, Round},
    types::{Amount, AuctionId, UserId},
};
use gavel_store::{
    BidRecord, DurableStore, HotStore, PlaceCommand, PlaceOutcome, RankedBid, RoundContext,
};

use crate::{
    config::{AntiSnipeSection, FanoutSection},
    error::ServiceError,
    fanout::BroadcastRequest,
    lifecycle::SnipeRequest,
};

/* -------------------------------------------------------------------------- */
/*                                 DTOs / API                                 */
/* -------------------------------------------------------------------------- */

#[derive(Clone, Debug)]
pub struct PlaceBidRequest {
    pub auction_id: AuctionId,
    pub user_id: UserId,
    pub amount: Amount,
    pub idempotency_key: String,
    pub add_to_existing: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct PlaceBidResponse {
    pub bid: BidRecord,
    pub place: u32,
    pub remaining_balance: Amount,
    /// True when this response replays a previously committed placement.
    pub replayed: bool,
}

/* -------------------------------------------------------------------------- */
/*                                  BidEngine                                 */
/* -------------------------------------------------------------------------- */

pub struct BidEngine {
    hot: Arc<HotStore>,
    durable: Arc<DurableStore>,
    anti_snipe: AntiSnipeSection,
    fanout: FanoutSection,
    snipe_tx: mpsc::UnboundedSender<SnipeRequest>,
    broadcast_tx: mpsc::UnboundedSender<BroadcastRequest>,
}

impl BidEngine {
    pub fn new(
        hot: Arc<HotStore>,
        durable: Arc<DurableStore>,
        anti_snipe: AntiSnipeSection,
        fanout: FanoutSection,
        snipe_tx: mpsc::UnboundedSender<SnipeRequest>,
        broadcast_tx: mpsc::UnboundedSender<BroadcastRequest>,
    ) -> Self {
        Self { hot, durable, anti_snipe, fanout, snipe_tx, broadcast_tx }
    }

    /* ----------------------------- Placement ------------------------------ */

    pub fn place_bid(&self, req: PlaceBidRequest) -> Result<PlaceBidResponse, ServiceError> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();

        // Replays short-circuit before any state gate so a retried request
        // still gets its original payload after the round has moved on.
        if let Some(prior) = self.hot.lookup_idempotent(&req.idempotency_key, now_ms) {
            debug!(key = %req.idempotency_key, "idempotent replay served");
            return Ok(response(prior, true));
        }

        let auction = self
            .load_auction(req.auction_id, now_ms)?
            .ok_or_else(|| DomainError::not_found("auction not found"))?;
        if auction.status != AuctionStatus::Live {
            return Err(BidReject::AuctionNotLive.into());
        }

        let round = self
            .load_round(&auction, auction.current_round_idx, now_ms)?
            .ok_or(BidReject::RoundNotFound)?;
        if !round.is_open(now) {
            return Err(BidReject::RoundEnded.into());
        }

        // Input validation comes after the state gates: a bad amount against
        // a dead auction still reports the auction, not the amount.
        if req.amount <= 0 {
            return Err(DomainError::validation("amount must be a positive integer").into());
        }
        if req.idempotency_key.trim().is_empty() {
            return Err(DomainError::validation("idempotency_key must not be empty").into());
        }

        let ctx = RoundContext {
            auction_id: auction.id,
            round_id: round.id,
            round_idx: round.idx,
            min_bid_for_round: auction.min_bid_for_round(round.idx),
            winners_per_round: auction.winners_per_round(),
            effective_end_ms: round.effective_end().timestamp_millis(),
        };
        let outcome = self.hot.place_bid(
            &ctx,
            PlaceCommand {
                user_id: req.user_id,
                amount: req.amount,
                idempotency_key: req.idempotency_key,
                add_to_existing: req.add_to_existing,
                now_ms,
            },
        )?;

        match outcome {
            PlaceOutcome::Replayed(prior) => Ok(response(prior, true)),
            PlaceOutcome::Placed(placed) => {
                self.post_commit(&auction, &round, &placed, now_ms);
                Ok(response(placed, false))
            }
        }
    }

    /// Best-effort steps after the script committed.  Failures here never
    /// fail the placement.
    fn post_commit(
        &self,
        auction: &Auction,
        round: &Round,
        placed: &gavel_store::PlacedBid,
        now_ms: i64,
    ) {
        let snipe_eligible_round = !self.anti_snipe.first_round_only || round.idx == 0;
        let window_ms = self.anti_snipe.window.as_millis() as i64;
        let remaining_ms = round.effective_end().timestamp_millis() - now_ms;
        // Only a *rebid* by a top-3 user inside the closing window extends
        // the round; a fresh bid never does.
        if snipe_eligible_round && placed.augmented && placed.place <= 3 && remaining_ms <= window_ms
        {
            let request = SnipeRequest {
                auction_id: auction.id,
                round_id: round.id,
                round_idx: round.idx,
                user_id: placed.bid.user_id,
            };
            if self.snipe_tx.send(request).is_err() {
                warn!(auction_id = %auction.id, "anti-snipe channel closed");
            }
        }

        let _ = self
            .broadcast_tx
            .send(BroadcastRequest { auction_id: auction.id, force: true });
    }

    /* ------------------------------- Reads --------------------------------- */

    /// Top-k of the current round.
    pub fn top_bids(&self, auction_id: AuctionId, k: usize) -> Result<Vec<RankedBid>, ServiceError> {
        let now_ms = Utc::now().timestamp_millis();
        let Some(auction) = self.load_auction(auction_id, now_ms)? else {
            return Ok(Vec::new());
        };
        let Some(round) = self.load_round(&auction, auction.current_round_idx, now_ms)? else {
            return Ok(Vec::new());
        };
        let hot = self.hot.top(auction.id, round.id, k, now_ms);
        if !hot.is_empty() {
            return Ok(hot);
        }
        // Fall through to the durable mirror (hot TTLs may have expired).
        let mut bids = self.durable.bids_for_round(auction.id, round.id)?;
        bids.sort_by(|a, b| b.amount.cmp(&a.amount).then(a.created_at.cmp(&b.created_at)));
        Ok(bids
            .into_iter()
            .take(k)
            .enumerate()
            .map(|(rank, bid)| RankedBid {
                user_id: bid.user_id,
                amount: bid.amount,
                place: rank as u32 + 1,
            })
            .collect())
    }

    /// 1-based place of a user in the current round.
    pub fn user_place(
        &self,
        auction_id: AuctionId,
        user: UserId,
    ) -> Result<Option<u32>, ServiceError> {
        let now_ms = Utc::now().timestamp_millis();
        let Some(auction) = self.load_auction(auction_id, now_ms)? else {
            return Ok(None);
        };
        let Some(round) = self.load_round(&auction, auction.current_round_idx, now_ms)? else {
            return Ok(None);
        };
        if let Some(place) = self.hot.place_of(auction.id, round.id, user) {
            return Ok(Some(place));
        }
        Ok(self
            .durable
            .get_bid(auction.id, round.id, user)?
            .and_then(|bid| bid.place_id))
    }

    /// The user's bid in the current round, if any.
    pub fn user_bid(
        &self,
        auction_id: AuctionId,
        user: UserId,
    ) -> Result<Option<BidRecord>, ServiceError> {
        let now_ms = Utc::now().timestamp_millis();
        let Some(auction) = self.load_auction(auction_id, now_ms)? else {
            return Ok(None);
        };
        let Some(round) = self.load_round(&auction, auction.current_round_idx, now_ms)? else {
            return Ok(None);
        };
        if let Some(record) = self.hot.bid_of(auction.id, round.id, user) {
            return Ok(Some(record));
        }
        Ok(self.durable.get_bid(auction.id, round.id, user)?.map(|bid| BidRecord {
            auction_id: bid.auction_id,
            round_id: bid.round_id,
            round_idx: bid.round_idx,
            user_id: bid.user_id,
            amount: bid.amount,
            is_top3_sniping_bid: bid.is_top3_sniping_bid,
            created_at_ms: bid.created_at.timestamp_millis(),
            updated_at_ms: bid.updated_at.timestamp_millis(),
        }))
    }

    /// Minimum acceptable total for round `idx` of an auction.
    pub fn min_bid_for_round(
        &self,
        auction_id: AuctionId,
        idx: u32,
    ) -> Result<Amount, ServiceError> {
        let now_ms = Utc::now().timestamp_millis();
        let auction = self
            .load_auction(auction_id, now_ms)?
            .ok_or_else(|| DomainError::not_found("auction not found"))?;
        Ok(auction.min_bid_for_round(idx))
    }

    pub fn snapshot_top_limit(&self) -> usize {
        self.fanout.top_bids_limit
    }

    /* ------------------------------ Loaders -------------------------------- */

    fn load_auction(
        &self,
        id: AuctionId,
        now_ms: i64,
    ) -> Result<Option<Auction>, ServiceError> {
        if let Some(auction) = self.hot.cached_auction(id, now_ms) {
            return Ok(Some(auction));
        }
        let Some(auction) = self.durable.get_auction(id)? else {
            return Ok(None);
        };
        self.hot.cache_auction(auction.clone(), now_ms);
        Ok(Some(auction))
    }

    fn load_round(
        &self,
        auction: &Auction,
        idx: u32,
        now_ms: i64,
    ) -> Result<Option<Round>, ServiceError> {
        if let Some(round) = self.hot.cached_round(auction.id, idx, now_ms) {
            return Ok(Some(round));
        }
        let Some(round) = self.durable.get_round(auction.id, idx)? else {
            return Ok(None);
        };
        self.hot.cache_round(round.clone(), now_ms);
        Ok(Some(round))
    }
}

fn response(placed: gavel_store::PlacedBid, replayed: bool) -> PlaceBidResponse {
    PlaceBidResponse {
        bid: placed.bid,
        place: placed.place,
        remaining_balance: placed.remaining_balance,
        replayed,
    }
}

/* -------------------------------------------------------------------------- */
/*                                    Tests                                   */
/* -------------------------------------------------------------------------- */
