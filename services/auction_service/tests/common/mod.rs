//! Shared harness for the integration suites: an in-process wiring of the
//! hot store, an ephemeral durable store, the lifecycle manager and the bid
//! engine — everything the binary assembles, minus the listener.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;

use auction_service::{
    bid_engine::{BidEngine, PlaceBidRequest, PlaceBidResponse},
    config::GavelConfig,
    error::ServiceError,
    fanout::BroadcastRequest,
    lifecycle::LifecycleManager,
};
use gavel_common::{
    model::{Auction, AuctionParams},
    types::{Amount, AuctionId, UserId},
};
use gavel_store::{DurableStore, HotConfig, HotStore};

pub struct Harness {
    pub hot: Arc<HotStore>,
    pub durable: Arc<DurableStore>,
    pub lifecycle: Arc<LifecycleManager>,
    pub engine: Arc<BidEngine>,
    pub cfg: GavelConfig,
    /// Kept alive so forced broadcasts have a live receiver.
    pub broadcast_rx: mpsc::UnboundedReceiver<BroadcastRequest>,
}

impl Harness {
    pub fn new() -> Self {
        let mut cfg = GavelConfig::default();
        cfg.lifecycle.reconcile_interval = Duration::from_millis(100);
        cfg.lifecycle.carry_poll_interval = Duration::from_millis(50);
        cfg.delivery.fulfillment_delay = Duration::from_millis(50);
        Self::with_config(cfg)
    }

    pub fn with_config(cfg: GavelConfig) -> Self {
        let hot = Arc::new(HotStore::new(HotConfig::from(&cfg.hot)));
        let durable = Arc::new(DurableStore::temporary().unwrap());
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();
        let lifecycle =
            LifecycleManager::new(hot.clone(), durable.clone(), cfg.clone(), broadcast_tx.clone());
        let engine = Arc::new(BidEngine::new(
            hot.clone(),
            durable.clone(),
            cfg.anti_snipe.clone(),
            cfg.fanout.clone(),
            lifecycle.snipe_sender(),
            broadcast_tx,
        ));
        Self { hot, durable, lifecycle, engine, cfg, broadcast_rx }
    }

    /// Fund a user in both stores.
    pub fn prime_user(&self, user: i64, balance: Amount) {
        self.hot.prime_balance(UserId(user), balance);
        self.durable
            .upsert_user(&gavel_common::model::UserAccount {
                user_id: UserId(user),
                balance,
                updated_at: Utc::now(),
            })
            .unwrap();
    }

    pub fn params(
        winners: u32,
        rounds: u32,
        min_bid: Amount,
        round_duration_ms: i64,
    ) -> AuctionParams {
        AuctionParams {
            name: None,
            item_name: "ticket".into(),
            min_bid,
            winners_count_total: winners,
            rounds_count: rounds,
            first_round_duration_ms: None,
            round_duration_ms,
            start_datetime: Utc::now() + ChronoDuration::milliseconds(40),
        }
    }

    /// Create, release and bring an auction LIVE (round 0 running).
    pub async fn live_auction(&self, creator: i64, params: AuctionParams) -> Auction {
        let auction = self.lifecycle.create_auction(UserId(creator), params).unwrap();
        self.lifecycle.release_auction(auction.id, UserId(creator)).unwrap();
        // Let the start time pass, then converge.
        tokio::time::sleep(Duration::from_millis(80)).await;
        self.lifecycle.reconcile(auction.id).unwrap();
        let live = self.durable.get_auction(auction.id).unwrap().unwrap();
        assert_eq!(live.status, gavel_common::model::AuctionStatus::Live);
        live
    }

    /// Pull the current round's deadline into the past and converge —
    /// drives the boundary deterministically instead of waiting it out.
    pub fn end_current_round(&self, auction_id: AuctionId) {
        let auction = self.durable.get_auction(auction_id).unwrap().unwrap();
        let mut round = self
            .durable
            .get_round(auction_id, auction.current_round_idx)
            .unwrap()
            .unwrap();
        round.ended_at = Utc::now() - ChronoDuration::milliseconds(5);
        round.extended_until = None;
        self.durable.update_round(&round).unwrap();
        self.hot.invalidate_round(auction_id, round.idx);
        self.lifecycle.reconcile(auction_id).unwrap();
    }

    /// Drain the carry queue synchronously.
    pub fn drain_carries(&self) {
        while let Some(task) = self.hot.pop_carry() {
            self.lifecycle.process_carry_task(&task).unwrap();
        }
    }

    pub fn place(
        &self,
        auction: AuctionId,
        user: i64,
        amount: Amount,
        key: &str,
        add_to_existing: bool,
    ) -> Result<PlaceBidResponse, ServiceError> {
        self.engine.place_bid(PlaceBidRequest {
            auction_id: auction,
            user_id: UserId(user),
            amount,
            idempotency_key: key.into(),
            add_to_existing,
        })
    }

    pub fn auction(&self, id: AuctionId) -> Auction {
        self.durable.get_auction(id).unwrap().unwrap()
    }

    pub fn balance(&self, user: i64) -> Amount {
        self.hot.balance(UserId(user))
    }
}
