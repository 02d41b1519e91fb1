//! Cross-store synchroniser: one-way hot → durable while auctions are LIVE.
//!
//! Every cadence tick the worker scans the hot ranking sets of LIVE
//! auctions, upserts bid rows with recomputed `place_id`, and writes balance
//! deltas.  On process startup the direction briefly reverses: balances are
//! primed hot ← durable so the placement script starts from the system of
//! record.
//!
//! The mirror helpers are free functions because the lifecycle manager calls
//! them directly at round and auction boundaries — a finished auction is
//! snapshotted into the durable store instead of waiting on background
//! timing.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{sync::watch, task::JoinHandle, time};
use tracing::{debug, error, info};

use gavel_common::{
    model::{Auction, AuctionStatus, Bid, UserAccount},
    types::{AuctionId, RoundId},
};
use gavel_store::{DurableError, DurableStore, HotStore};

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// Mirror one round's hot bids into the durable store, recomputing places.
/// Returns how many rows were written.
pub fn mirror_round(
    hot: &HotStore,
    durable: &DurableStore,
    auction_id: AuctionId,
    round_id: RoundId,
) -> Result<usize, DurableError> {
    let records = hot.round_bids(auction_id, round_id);
    for (rank, record) in records.iter().enumerate() {
        let bid = Bid {
            auction_id: record.auction_id,
            round_id: record.round_id,
            round_idx: record.round_idx,
            user_id: record.user_id,
            amount: record.amount,
            place_id: Some(rank as u32 + 1),
            is_top3_sniping_bid: record.is_top3_sniping_bid,
            idempotency_key: None,
            created_at: from_ms(record.created_at_ms),
            updated_at: from_ms(record.updated_at_ms),
        };
        durable.upsert_bid(&bid)?;
    }
    Ok(records.len())
}

/// Write hot balances that diverge from their durable mirror.
pub fn mirror_balances(hot: &HotStore, durable: &DurableStore) -> Result<usize, DurableError> {
    let now = Utc::now();
    let mut written = 0;
    for (user, balance) in hot.balances_snapshot() {
        let mirrored = durable.get_user(user)?.map(|account| account.balance);
        if mirrored != Some(balance) {
            durable.upsert_user(&UserAccount { user_id: user, balance, updated_at: now })?;
            written += 1;
        }
    }
    Ok(written)
}

/// Snapshot every round of an auction plus all balances.
pub fn mirror_auction(
    hot: &HotStore,
    durable: &DurableStore,
    auction: &Auction,
) -> Result<(), DurableError> {
    for round in durable.rounds_for_auction(auction.id)? {
        mirror_round(hot, durable, auction.id, round.id)?;
    }
    mirror_balances(hot, durable)?;
    Ok(())
}

/* -------------------------------------------------------------------------- */
/*                                 SyncWorker                                 */
/* -------------------------------------------------------------------------- */

pub struct SyncWorker {
    hot: Arc<HotStore>,
    durable: Arc<DurableStore>,
    cadence: Duration,
}

impl SyncWorker {
    pub fn new(hot: Arc<HotStore>, durable: Arc<DurableStore>, cadence: Duration) -> Self {
        Self { hot, durable, cadence }
    }

    /// Prime hot balances from the durable store; called once at startup.
    pub fn prime_balances(&self) -> Result<usize, DurableError> {
        let accounts = self.durable.all_users()?;
        let count = accounts.len();
        for account in accounts {
            self.hot.prime_balance(account.user_id, account.balance);
        }
        info!(count, "primed hot balances from durable store");
        Ok(count)
    }

    /// One mirror pass over every LIVE auction.
    pub fn mirror_live(&self) -> Result<(), DurableError> {
        for auction in self.durable.auctions_by_status(AuctionStatus::Live)? {
            mirror_auction(&self.hot, &self.durable, &auction)?;
        }
        Ok(())
    }

    /// Periodic mirror task.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.cadence);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.mirror_live() {
                            error!(error = %err, "hot → durable mirror pass failed");
                        } else {
                            debug!("mirror pass complete");
                        }
                    }
                }
            }
        })
    }
}

/* -------------------------------------------------------------------------- */
/*                                    Tests                                   */
/* -------------------------------------------------------------------------- */
