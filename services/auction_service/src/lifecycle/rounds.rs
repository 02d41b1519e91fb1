//! Round boundaries: going live, finishing rounds, carrying losing bids
//! forward, final refunds and delivery emission.
//!
//! Everything here is driven by [`LifecycleManager::reconcile`] and the carry
//! worker; no function in this file is reachable from a user-facing call
//! path.  Failures are retried through the queue and the reconciler, and the
//! idempotency keys / unique indexes below make retries at-most-once.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use gavel_common::{
    error::Error as DomainError,
    model::{Auction, AuctionStatus, Bid, Delivery, DeliveryStatus, Round},
    types::{Amount, AuctionId, RoundId, UserId},
};
use gavel_store::{CarryTask, RoundContext};

use crate::{error::ServiceError, sync};

use super::LifecycleManager;

/// A bid as the boundary logic needs it, regardless of which store it came
/// from: `(user, amount, staked-at-ms)` in place order.
#[derive(Clone, Debug)]
struct RankedEntry {
    user_id: UserId,
    amount: Amount,
    created_at_ms: i64,
}

impl LifecycleManager {
    /* ------------------------------ Go live -------------------------------- */

    pub(super) fn go_live(
        &self,
        auction: &mut Auction,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        if !auction.status.can_transition(AuctionStatus::Live) {
            return Err(DomainError::state("auction cannot go live from its current status").into());
        }
        auction.status = AuctionStatus::Live;
        self.start_round(auction, 0, now)?;
        info!(auction_id = %auction.id, "auction is live");
        Ok(())
    }

    /// Create round `idx` (idempotently), point the auction at it, arm its
    /// timer and broadcast the new state.
    pub(super) fn start_round(
        &self,
        auction: &mut Auction,
        idx: u32,
        now: DateTime<Utc>,
    ) -> Result<Round, ServiceError> {
        let duration_ms = auction.round_duration_for(idx);
        let (round, created) = self
            .durable
            .create_round(&Round::new(auction.id, idx, now, duration_ms))?;
        if !created {
            debug!(auction_id = %auction.id, idx, "round already existed; proceeding with it");
        }

        auction.current_round_idx = idx;
        auction.updated_at = now;
        self.durable.upsert_auction(auction)?;
        self.hot.invalidate_auction(auction.id);
        self.hot.invalidate_round(auction.id, idx);

        self.arm_timer(auction.id, round.effective_end());
        self.broadcast(auction.id);
        Ok(round)
    }

    /* ---------------------------- Finish round ------------------------------ */

    /// Close a round whose effective end has passed: pick winners, consume
    /// inventory, emit deliveries, then either start the next round (and
    /// enqueue the carry) or finish the auction.
    pub(super) fn finish_round(
        &self,
        auction: &mut Auction,
        round: &Round,
    ) -> Result<(), ServiceError> {
        if auction.status != AuctionStatus::Live || auction.current_round_idx != round.idx {
            return Ok(());
        }
        let now = Utc::now();

        // Freeze the round into the durable store before acting on it.
        sync::mirror_round(&self.hot, &self.durable, auction.id, round.id)?;
        let ranked = self.ranked_for_round(auction.id, round.id)?;

        let winners_per_round = auction.winners_per_round() as usize;
        if ranked.is_empty() {
            // Unbid round: inventory is untouched and carries forward
            // implicitly because no decrement occurs.
            debug!(auction_id = %auction.id, idx = round.idx, "round finished without bids");
        } else {
            let winners = &ranked[..winners_per_round.min(ranked.len())];
            let served = winners.len().min(auction.remaining_items_count as usize);
            auction.remaining_items_count -= served as u32;

            for winner in &winners[..served] {
                let delivery = Delivery {
                    auction_id: auction.id,
                    round_id: round.id,
                    winner_user_id: winner.user_id,
                    item_name: auction.item_name.clone(),
                    status: DeliveryStatus::Pending,
                    created_at: now,
                    updated_at: now,
                };
                // The unique key absorbs replays of this boundary.
                if self.durable.create_delivery(&delivery)? {
                    self.spawn_fulfillment(delivery);
                }
            }
            info!(
                auction_id = %auction.id,
                idx = round.idx,
                winners = winners.len(),
                served,
                remaining = auction.remaining_items_count,
                "round finished"
            );
        }

        if auction.is_final_round(round.idx) {
            self.finish_auction(auction)?;
        } else {
            let next = self.start_round(auction, round.idx + 1, now)?;
            if !ranked.is_empty() {
                self.hot.push_carry(CarryTask {
                    auction_id: auction.id,
                    current_round_id: round.id,
                    current_round_idx: round.idx,
                    next_round_id: next.id,
                    next_round_idx: next.idx,
                    winners_per_round: winners_per_round as u32,
                });
            }
        }
        self.broadcast(auction.id);
        Ok(())
    }

    /* -------------------------------- Carry --------------------------------- */

    /// Process one carry task. A `(current, next)` pair is carried at most
    /// once per process; on failure the membership is released and the task
    /// re-enters the queue.
    pub fn process_carry_task(&self, task: &CarryTask) -> Result<(), ServiceError> {
        let pair = (task.current_round_id, task.next_round_id);
        if !self.processed_carries.lock().insert(pair) {
            debug!(auction_id = %task.auction_id, "duplicate carry task ignored");
            return Ok(());
        }
        let result = self.carry_inner(task);
        if result.is_err() {
            self.processed_carries.lock().remove(&pair);
            self.hot.push_carry(task.clone());
        }
        result
    }

    fn carry_inner(&self, task: &CarryTask) -> Result<(), ServiceError> {
        let now_ms = Utc::now().timestamp_millis();
        let auction = self
            .durable
            .get_auction(task.auction_id)?
            .ok_or_else(|| DomainError::not_found("auction vanished before carry"))?;

        let ranked = self.ranked_for_round(auction.id, task.current_round_id)?;
        let losers: Vec<&RankedEntry> =
            ranked.iter().skip(task.winners_per_round as usize).collect();
        if losers.is_empty() {
            return Ok(());
        }

        let ctx = RoundContext {
            auction_id: auction.id,
            round_id: task.next_round_id,
            round_idx: task.next_round_idx,
            min_bid_for_round: auction.min_bid_for_round(task.next_round_idx),
            winners_per_round: task.winners_per_round,
            // Carry is unconditional; it is not subject to the deadline.
            effective_end_ms: i64::MAX,
        };

        let mut carried = 0usize;
        for loser in losers {
            let transfer_key = format!(
                "transfer-{}-{}-{}",
                task.current_round_id, loser.user_id, loser.created_at_ms
            );
            let Some(record) = self.hot.apply_carry(
                &ctx,
                loser.user_id,
                loser.amount,
                loser.created_at_ms,
                &transfer_key,
                now_ms,
            ) else {
                continue; // replayed transfer, already merged
            };
            let bid = Bid {
                auction_id: record.auction_id,
                round_id: record.round_id,
                round_idx: record.round_idx,
                user_id: record.user_id,
                amount: record.amount,
                place_id: None,
                is_top3_sniping_bid: record.is_top3_sniping_bid,
                idempotency_key: Some(transfer_key),
                created_at: from_ms(record.created_at_ms),
                updated_at: from_ms(record.updated_at_ms),
            };
            self.durable.upsert_bid(&bid)?;
            carried += 1;
        }
        // Places in the next round follow from the ranking set; mirror them.
        sync::mirror_round(&self.hot, &self.durable, auction.id, task.next_round_id)?;
        self.broadcast(auction.id);
        info!(
            auction_id = %auction.id,
            from_idx = task.current_round_idx,
            to_idx = task.next_round_idx,
            carried,
            "losing bids carried forward"
        );
        Ok(())
    }

    /* ----------------------------- Finish auction --------------------------- */

    /// Final-round epilogue: snapshot hot state into the durable store,
    /// refund every loser's new money, flip to FINISHED.
    pub(super) fn finish_auction(&self, auction: &mut Auction) -> Result<(), ServiceError> {
        sync::mirror_auction(&self.hot, &self.durable, auction)?;

        let now = Utc::now();
        let refunds = self.compute_refunds(auction)?;
        for (user, amount) in refunds {
            if amount <= 0 {
                continue;
            }
            self.hot.credit(user, amount);
            // Refund failures are logged per user and replayed operationally;
            // the auction still finishes.
            if let Err(err) = self.durable.credit_user(user, amount, now) {
                error!(user_id = %user, amount, error = %err, "refund write failed");
                continue;
            }
            debug!(user_id = %user, amount, "refunded new money");
        }

        auction.status = AuctionStatus::Finished;
        auction.updated_at = now;
        self.durable.upsert_auction(auction)?;
        self.hot.invalidate_auction(auction.id);
        self.cancel_timer(auction.id);
        self.broadcast(auction.id);
        info!(auction_id = %auction.id, "auction finished");
        Ok(())
    }

    /// Per-user refund of *new money*: walk the user's bids in round order,
    /// accumulate `max(0, amount − carried_in)`, and reset the accumulator
    /// whenever the user wins a round (that stake was consumed).  Amounts
    /// that merely carried forward contribute nothing, final-round winners
    /// naturally come out at zero.
    fn compute_refunds(&self, auction: &Auction) -> Result<Vec<(UserId, Amount)>, ServiceError> {
        struct Walk {
            acc: Amount,
            prev: Amount,
        }

        let winners_per_round = auction.winners_per_round() as usize;
        let mut walks: HashMap<UserId, Walk> = HashMap::new();

        for round in self.durable.rounds_for_auction(auction.id)? {
            let mut bids = self.durable.bids_for_round(auction.id, round.id)?;
            bids.sort_by(|a, b| b.amount.cmp(&a.amount).then(a.created_at.cmp(&b.created_at)));
            let winner_set: HashSet<UserId> = bids
                .iter()
                .take(winners_per_round)
                .map(|bid| bid.user_id)
                .collect();

            for bid in &bids {
                let walk = walks
                    .entry(bid.user_id)
                    .or_insert(Walk { acc: 0, prev: 0 });
                walk.acc += (bid.amount - walk.prev).max(0);
                if winner_set.contains(&bid.user_id) {
                    walk.acc = 0;
                    walk.prev = 0;
                } else {
                    walk.prev = bid.amount;
                }
            }
        }

        Ok(walks
            .into_iter()
            .filter(|(_, walk)| walk.acc > 0)
            .map(|(user, walk)| (user, walk.acc))
            .collect())
    }

    /* ------------------------------ Deliveries ------------------------------ */

    /// Placeholder fulfillment: flip PENDING → DELIVERED after a bounded
    /// delay.
    fn spawn_fulfillment(&self, mut delivery: Delivery) {
        let durable = self.durable.clone();
        let delay = self.cfg.delivery.fulfillment_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            delivery.status = DeliveryStatus::Delivered;
            delivery.updated_at = Utc::now();
            if let Err(err) = durable.update_delivery(&delivery) {
                warn!(
                    auction_id = %delivery.auction_id,
                    user_id = %delivery.winner_user_id,
                    error = %err,
                    "delivery status update failed"
                );
            }
        });
    }

    /* ------------------------------- Helpers -------------------------------- */

    fn ranked_for_round(
        &self,
        auction_id: AuctionId,
        round_id: RoundId,
    ) -> Result<Vec<RankedEntry>, ServiceError> {
        let hot = self.hot.round_bids(auction_id, round_id);
        if !hot.is_empty() {
            return Ok(hot
                .into_iter()
                .map(|record| RankedEntry {
                    user_id: record.user_id,
                    amount: record.amount,
                    created_at_ms: record.created_at_ms,
                })
                .collect());
        }
        // Hot TTLs expired (or restart): fall back to the durable mirror.
        let mut bids = self.durable.bids_for_round(auction_id, round_id)?;
        bids.sort_by(|a, b| b.amount.cmp(&a.amount).then(a.created_at.cmp(&b.created_at)));
        Ok(bids
            .into_iter()
            .map(|bid| RankedEntry {
                user_id: bid.user_id,
                amount: bid.amount,
                created_at_ms: bid.created_at.timestamp_millis(),
            })
            .collect())
    }
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}
