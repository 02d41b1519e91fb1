//! Durable system-of-record for the Gavel platform.
//!
//! Backed by `sled` with one tree per collection and bincode-encoded values.
//! Uniqueness constraints are carried by key construction: rounds are keyed
//! `(auction_id, idx)`, bids and deliveries `(auction_id, round_id, user_id)`,
//! and a dedicated tree maps idempotency keys to the bid they created.
//! Composite keys use big-endian integers so prefix scans come back in
//! logical order.
//!
//! Every successful write publishes a [`ChangeEvent`] on a broadcast channel.
//! The lifecycle manager subscribes to this feed; a lagging or detached
//! subscriber loses nothing durable because the periodic reconciler re-reads
//! authoritative state.

use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use sled::{Db, IVec, Tree};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

use gavel_common::{
    model::{Auction, AuctionStatus, Bid, Delivery, Round, UserAccount},
    types::{Amount, AuctionId, RoundId, UserId},
};

const FEED_CAPACITY: usize = 1024;

/* -------------------------------------------------------------------------- */
/*                                 Change feed                                */
/* -------------------------------------------------------------------------- */

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Collection {
    Auctions,
    Rounds,
    Bids,
    Users,
    Deliveries,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
}

/// Notification emitted after every successful write.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub collection: Collection,
    pub op: ChangeOp,
    /// Auction the write belongs to, when attributable.
    pub auction_id: Option<AuctionId>,
}

/* -------------------------------------------------------------------------- */
/*                                   Errors                                   */
/* -------------------------------------------------------------------------- */

#[derive(Debug, Error)]
pub enum DurableError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("unique constraint violated: {0}")]
    Conflict(String),
}

pub type Result<T, E = DurableError> = std::result::Result<T, E>;

/* -------------------------------------------------------------------------- */
/*                                 Key layout                                 */
/* -------------------------------------------------------------------------- */

fn round_key(auction: AuctionId, idx: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(20);
    key.extend_from_slice(auction.as_bytes());
    key.extend_from_slice(&idx.to_be_bytes());
    key
}

fn bid_key(auction: AuctionId, round: RoundId, user: UserId) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(auction.as_bytes());
    key.extend_from_slice(round.as_bytes());
    key.extend_from_slice(&user.0.to_be_bytes());
    key
}

fn user_key(user: UserId) -> [u8; 8] {
    user.0.to_be_bytes()
}

fn decode<T: DeserializeOwned>(bytes: &IVec) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/* -------------------------------------------------------------------------- */
/*                                DurableStore                                */
/* -------------------------------------------------------------------------- */

pub struct DurableStore {
    db: Db,
    auctions: Tree,
    rounds: Tree,
    bids: Tree,
    bid_keys: Tree,
    users: Tree,
    deliveries: Tree,
    feed: broadcast::Sender<ChangeEvent>,
}

impl DurableStore {
    /// Open or create the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// An ephemeral store for tests and local development.
    pub fn temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self> {
        let auctions = db.open_tree("auctions")?;
        let rounds = db.open_tree("rounds")?;
        let bids = db.open_tree("bids")?;
        let bid_keys = db.open_tree("bid_idempotency_keys")?;
        let users = db.open_tree("users")?;
        let deliveries = db.open_tree("deliveries")?;
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Ok(Self { db, auctions, rounds, bids, bid_keys, users, deliveries, feed })
    }

    /// Subscribe to the ordered change feed.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe()
    }

    fn publish(&self, collection: Collection, op: ChangeOp, auction_id: Option<AuctionId>) {
        // No listeners is fine; the reconciler covers the gap.
        let _ = self.feed.send(ChangeEvent { collection, op, auction_id });
        trace!(?collection, ?op, "durable change published");
    }

    /* ------------------------------- Auctions ------------------------------ */

    pub fn upsert_auction(&self, auction: &Auction) -> Result<()> {
        let previous = self
            .auctions
            .insert(auction.id.as_bytes(), encode(auction)?)?;
        self.db.flush()?;
        let op = if previous.is_none() { ChangeOp::Insert } else { ChangeOp::Update };
        self.publish(Collection::Auctions, op, Some(auction.id));
        Ok(())
    }

    pub fn get_auction(&self, id: AuctionId) -> Result<Option<Auction>> {
        self.auctions.get(id.as_bytes())?.map(|v| decode(&v)).transpose()
    }

    pub fn all_auctions(&self) -> Result<Vec<Auction>> {
        let mut out = Vec::new();
        for item in self.auctions.iter() {
            let (_, value) = item?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    pub fn auctions_by_status(&self, status: AuctionStatus) -> Result<Vec<Auction>> {
        Ok(self
            .all_auctions()?
            .into_iter()
            .filter(|a| a.status == status)
            .collect())
    }

    /* -------------------------------- Rounds ------------------------------- */

    /// Create a round, enforcing `(auction_id, idx)` uniqueness.
    ///
    /// On a concurrent creation the compare-and-swap loses, the existing row
    /// is read back and returned with `created = false` so the caller can
    /// proceed against it.
    pub fn create_round(&self, round: &Round) -> Result<(Round, bool)> {
        let key = round_key(round.auction_id, round.idx);
        let encoded = encode(round)?;
        match self
            .rounds
            .compare_and_swap(&key, None as Option<&[u8]>, Some(encoded))?
        {
            Ok(()) => {
                self.publish(Collection::Rounds, ChangeOp::Insert, Some(round.auction_id));
                Ok((round.clone(), true))
            }
            Err(cas) => {
                let current = cas
                    .current
                    .ok_or_else(|| DurableError::Conflict("round vanished mid-create".into()))?;
                Ok((decode(&current)?, false))
            }
        }
    }

    pub fn get_round(&self, auction: AuctionId, idx: u32) -> Result<Option<Round>> {
        self.rounds
            .get(round_key(auction, idx))?
            .map(|v| decode(&v))
            .transpose()
    }

    /// All rounds of an auction in index order.
    pub fn rounds_for_auction(&self, auction: AuctionId) -> Result<Vec<Round>> {
        let mut out = Vec::new();
        for item in self.rounds.scan_prefix(auction.as_bytes()) {
            let (_, value) = item?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    /// Rewrite a round (anti-sniping extension). Rounds are only mutated
    /// before their effective end; callers own that invariant.
    pub fn update_round(&self, round: &Round) -> Result<()> {
        self.rounds
            .insert(round_key(round.auction_id, round.idx), encode(round)?)?;
        self.publish(Collection::Rounds, ChangeOp::Update, Some(round.auction_id));
        Ok(())
    }

    /* --------------------------------- Bids -------------------------------- */

    /// Insert or update the durable mirror of a bid.
    ///
    /// When the bid carries an idempotency key, a dedicated tree enforces its
    /// global uniqueness: a second bid claiming the same key is a conflict.
    pub fn upsert_bid(&self, bid: &Bid) -> Result<()> {
        let key = bid_key(bid.auction_id, bid.round_id, bid.user_id);
        if let Some(idem) = &bid.idempotency_key {
            match self
                .bid_keys
                .compare_and_swap(idem.as_bytes(), None as Option<&[u8]>, Some(key.clone()))?
            {
                Ok(()) => {}
                Err(cas) => {
                    let owner = cas.current.unwrap_or_default();
                    if owner.as_ref() != key.as_slice() {
                        return Err(DurableError::Conflict(format!(
                            "idempotency key {idem} already bound to another bid"
                        )));
                    }
                }
            }
        }
        let previous = self.bids.insert(key, encode(bid)?)?;
        let op = if previous.is_none() { ChangeOp::Insert } else { ChangeOp::Update };
        self.publish(Collection::Bids, op, Some(bid.auction_id));
        Ok(())
    }

    pub fn get_bid(
        &self,
        auction: AuctionId,
        round: RoundId,
        user: UserId,
    ) -> Result<Option<Bid>> {
        self.bids
            .get(bid_key(auction, round, user))?
            .map(|v| decode(&v))
            .transpose()
    }

    pub fn bids_for_round(&self, auction: AuctionId, round: RoundId) -> Result<Vec<Bid>> {
        let mut prefix = Vec::with_capacity(32);
        prefix.extend_from_slice(auction.as_bytes());
        prefix.extend_from_slice(round.as_bytes());
        let mut out = Vec::new();
        for item in self.bids.scan_prefix(prefix) {
            let (_, value) = item?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    /* -------------------------------- Users -------------------------------- */

    pub fn upsert_user(&self, account: &UserAccount) -> Result<()> {
        let previous = self
            .users
            .insert(user_key(account.user_id), encode(account)?)?;
        let op = if previous.is_none() { ChangeOp::Insert } else { ChangeOp::Update };
        self.publish(Collection::Users, op, None);
        Ok(())
    }

    pub fn get_user(&self, user: UserId) -> Result<Option<UserAccount>> {
        self.users.get(user_key(user))?.map(|v| decode(&v)).transpose()
    }

    pub fn all_users(&self) -> Result<Vec<UserAccount>> {
        let mut out = Vec::new();
        for item in self.users.iter() {
            let (_, value) = item?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    /// Credit a balance (refunds); creates the account when absent.
    pub fn credit_user(
        &self,
        user: UserId,
        delta: Amount,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Amount> {
        let mut account = self.get_user(user)?.unwrap_or(UserAccount {
            user_id: user,
            balance: 0,
            updated_at: now,
        });
        account.balance += delta;
        account.updated_at = now;
        self.upsert_user(&account)?;
        Ok(account.balance)
    }

    /* ------------------------------ Deliveries ------------------------------ */

    /// Create a delivery record; `(auction, round, winner)` uniqueness makes
    /// retried round-finishes harmless. Returns whether a row was created.
    pub fn create_delivery(&self, delivery: &Delivery) -> Result<bool> {
        let key = bid_key(delivery.auction_id, delivery.round_id, delivery.winner_user_id);
        let encoded = encode(delivery)?;
        match self
            .deliveries
            .compare_and_swap(&key, None as Option<&[u8]>, Some(encoded))?
        {
            Ok(()) => {
                self.publish(Collection::Deliveries, ChangeOp::Insert, Some(delivery.auction_id));
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    pub fn update_delivery(&self, delivery: &Delivery) -> Result<()> {
        let key = bid_key(delivery.auction_id, delivery.round_id, delivery.winner_user_id);
        self.deliveries.insert(key, encode(delivery)?)?;
        self.publish(Collection::Deliveries, ChangeOp::Update, Some(delivery.auction_id));
        Ok(())
    }

    pub fn deliveries_for_auction(&self, auction: AuctionId) -> Result<Vec<Delivery>> {
        let mut out = Vec::new();
        for item in self.deliveries.scan_prefix(auction.as_bytes()) {
            let (_, value) = item?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }
}

/* -------------------------------------------------------------------------- */
/*                                    Tests                                   */
/* -------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use gavel_common::model::{AuctionParams, DeliveryStatus};

    fn sample_auction() -> Auction {
        Auction::from_params(
            UserId(1),
            AuctionParams {
                name: Some("weekly drop".into()),
                item_name: "ticket".into(),
                min_bid: 100,
                winners_count_total: 2,
                rounds_count: 2,
                first_round_duration_ms: None,
                round_duration_ms: 5_000,
                start_datetime: Utc::now() + Duration::seconds(30),
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn auction_roundtrip_and_feed() {
        let store = DurableStore::temporary().unwrap();
        let mut feed = store.subscribe();

        let auction = sample_auction();
        store.upsert_auction(&auction).unwrap();

        let loaded = store.get_auction(auction.id).unwrap().unwrap();
        assert_eq!(loaded.id, auction.id);
        assert_eq!(loaded.status, AuctionStatus::Draft);

        let event = feed.try_recv().unwrap();
        assert_eq!(event.collection, Collection::Auctions);
        assert_eq!(event.op, ChangeOp::Insert);
        assert_eq!(event.auction_id, Some(auction.id));
    }

    #[test]
    fn round_uniqueness_resolves_to_first_writer() {
        let store = DurableStore::temporary().unwrap();
        let auction = sample_auction();

        let first = Round::new(auction.id, 0, Utc::now(), 5_000);
        let second = Round::new(auction.id, 0, Utc::now(), 5_000);

        let (created, fresh) = store.create_round(&first).unwrap();
        assert!(fresh);
        assert_eq!(created.id, first.id);

        let (existing, fresh) = store.create_round(&second).unwrap();
        assert!(!fresh);
        assert_eq!(existing.id, first.id, "loser reads the winner's row");
    }

    #[test]
    fn rounds_scan_in_index_order() {
        let store = DurableStore::temporary().unwrap();
        let auction = sample_auction();
        for idx in [2u32, 0, 1] {
            let round = Round::new(auction.id, idx, Utc::now(), 5_000);
            store.create_round(&round).unwrap();
        }
        let indices: Vec<u32> = store
            .rounds_for_auction(auction.id)
            .unwrap()
            .iter()
            .map(|r| r.idx)
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn bid_idempotency_key_is_globally_unique() {
        let store = DurableStore::temporary().unwrap();
        let auction = sample_auction();
        let round = Round::new(auction.id, 0, Utc::now(), 5_000);
        let now = Utc::now();

        let bid = |user: i64, key: &str| Bid {
            auction_id: auction.id,
            round_id: round.id,
            round_idx: 0,
            user_id: UserId(user),
            amount: 100,
            place_id: None,
            is_top3_sniping_bid: false,
            idempotency_key: Some(key.into()),
            created_at: now,
            updated_at: now,
        };

        store.upsert_bid(&bid(1, "K")).unwrap();
        // Same bid, same key: an upsert, not a conflict.
        store.upsert_bid(&bid(1, "K")).unwrap();
        // Different bid claiming the same key: rejected.
        let err = store.upsert_bid(&bid(2, "K")).unwrap_err();
        assert!(matches!(err, DurableError::Conflict(_)));
    }

    #[test]
    fn delivery_created_at_most_once() {
        let store = DurableStore::temporary().unwrap();
        let auction = sample_auction();
        let round = Round::new(auction.id, 0, Utc::now(), 5_000);
        let delivery = Delivery {
            auction_id: auction.id,
            round_id: round.id,
            winner_user_id: UserId(9),
            item_name: "ticket".into(),
            status: DeliveryStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert!(store.create_delivery(&delivery).unwrap());
        assert!(!store.create_delivery(&delivery).unwrap());
        assert_eq!(store.deliveries_for_auction(auction.id).unwrap().len(), 1);
    }

    #[test]
    fn credit_user_accumulates() {
        let store = DurableStore::temporary().unwrap();
        let now = Utc::now();
        assert_eq!(store.credit_user(UserId(5), 100, now).unwrap(), 100);
        assert_eq!(store.credit_user(UserId(5), 50, now).unwrap(), 150);
        assert_eq!(store.get_user(UserId(5)).unwrap().unwrap().balance, 150);
    }
}
