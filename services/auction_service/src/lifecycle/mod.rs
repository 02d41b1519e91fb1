//! Auction lifecycle manager.
//!
//! Owns every auction from the moment it is RELEASED: the status machine
//! (DRAFT → RELEASED → LIVE → FINISHED), round timers, anti-sniping
//! extensions, the carry worker and final refunds.
//!
//! Event model
//! -----------
//! Change-feed notifications, timer firings and reconciler ticks all collapse
//! into one event type, [`LifecycleEvent`]; the handler re-reads
//! authoritative state instead of trusting the event payload.  A single
//! consumer task drains the event channel, which serialises all boundary
//! handling per process — there is exactly one pending timer per auction and
//! re-arming aborts the previous one.
//!
//! The 10-second reconciler makes the manager correct even when the change
//! feed is lost entirely: overdue RELEASED → LIVE transitions and overdue
//! round boundaries are picked up with bounded latency.

mod rounds;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};
use tracing::{debug, error, info, warn};

use gavel_common::{
    error::Error as DomainError,
    model::{Auction, AuctionParams, AuctionStatus},
    types::{AuctionId, RoundId, UserId},
};
use gavel_store::{Collection, DurableStore, HotStore};

use crate::{config::GavelConfig, error::ServiceError, fanout::BroadcastRequest};

/* -------------------------------------------------------------------------- */
/*                                   Events                                   */
/* -------------------------------------------------------------------------- */

/// Why the handler is being asked to look at an auction. Purely diagnostic:
/// the handler re-reads authoritative state either way.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LifecycleHint {
    ChangeFeed,
    TimerFired,
    ReconcileTick,
}

#[derive(Copy, Clone, Debug)]
pub struct LifecycleEvent {
    pub auction_id: AuctionId,
    pub hint: LifecycleHint,
}

/// Request from the bid engine to extend a round (anti-sniping).
#[derive(Copy, Clone, Debug)]
pub struct SnipeRequest {
    pub auction_id: AuctionId,
    pub round_id: RoundId,
    pub round_idx: u32,
    pub user_id: UserId,
}

struct ActiveTimer {
    deadline_ms: i64,
    handle: JoinHandle<()>,
}

/* -------------------------------------------------------------------------- */
/*                              LifecycleManager                              */
/* -------------------------------------------------------------------------- */

pub struct LifecycleManager {
    hot: Arc<HotStore>,
    durable: Arc<DurableStore>,
    cfg: GavelConfig,
    events_tx: mpsc::UnboundedSender<LifecycleEvent>,
    events_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<LifecycleEvent>>>,
    snipe_tx: mpsc::UnboundedSender<SnipeRequest>,
    snipe_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<SnipeRequest>>>,
    broadcast_tx: mpsc::UnboundedSender<BroadcastRequest>,
    /// One pending timer per auction; re-arming aborts the previous task.
    timers: parking_lot::Mutex<HashMap<AuctionId, ActiveTimer>>,
    /// Carry tasks already picked up, keyed `(current_round, next_round)`.
    /// Membership is held forever so duplicate enqueues stay no-ops.
    processed_carries: parking_lot::Mutex<HashSet<(RoundId, RoundId)>>,
}

impl LifecycleManager {
    pub fn new(
        hot: Arc<HotStore>,
        durable: Arc<DurableStore>,
        cfg: GavelConfig,
        broadcast_tx: mpsc::UnboundedSender<BroadcastRequest>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snipe_tx, snipe_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            hot,
            durable,
            cfg,
            events_tx,
            events_rx: parking_lot::Mutex::new(Some(events_rx)),
            snipe_tx,
            snipe_rx: parking_lot::Mutex::new(Some(snipe_rx)),
            broadcast_tx,
            timers: parking_lot::Mutex::new(HashMap::new()),
            processed_carries: parking_lot::Mutex::new(HashSet::new()),
        })
    }

    /// Sender the bid engine uses for anti-sniping requests.
    pub fn snipe_sender(&self) -> mpsc::UnboundedSender<SnipeRequest> {
        self.snipe_tx.clone()
    }

    /* --------------------------- Auction CRUD ----------------------------- */

    pub fn create_auction(
        &self,
        creator: UserId,
        params: AuctionParams,
    ) -> Result<Auction, ServiceError> {
        let auction = Auction::from_params(creator, params, Utc::now())?;
        self.durable.upsert_auction(&auction)?;
        info!(auction_id = %auction.id, "auction created");
        Ok(auction)
    }

    pub fn update_auction(
        &self,
        id: AuctionId,
        caller: UserId,
        params: AuctionParams,
    ) -> Result<Auction, ServiceError> {
        let mut auction = self.draft_owned_by(id, caller)?;
        let now = Utc::now();
        params.validate(now)?;
        auction.name = params.name;
        auction.item_name = params.item_name;
        auction.min_bid = params.min_bid;
        auction.winners_count_total = params.winners_count_total;
        auction.rounds_count = params.rounds_count;
        auction.first_round_duration_ms = params.first_round_duration_ms;
        auction.round_duration_ms = params.round_duration_ms;
        auction.start_datetime = params.start_datetime;
        auction.remaining_items_count = params.winners_count_total;
        auction.updated_at = now;
        self.durable.upsert_auction(&auction)?;
        self.hot.invalidate_auction(id);
        Ok(auction)
    }

    pub fn delete_auction(&self, id: AuctionId, caller: UserId) -> Result<(), ServiceError> {
        let mut auction = self.draft_owned_by(id, caller)?;
        auction.status = AuctionStatus::Deleted;
        auction.updated_at = Utc::now();
        self.durable.upsert_auction(&auction)?;
        self.hot.invalidate_auction(id);
        Ok(())
    }

    pub fn release_auction(&self, id: AuctionId, caller: UserId) -> Result<Auction, ServiceError> {
        let mut auction = self.draft_owned_by(id, caller)?;
        if !auction.status.can_transition(AuctionStatus::Released) {
            return Err(DomainError::state("auction cannot be released").into());
        }
        auction.status = AuctionStatus::Released;
        auction.updated_at = Utc::now();
        self.durable.upsert_auction(&auction)?;
        self.hot.invalidate_auction(id);
        info!(auction_id = %id, start = %auction.start_datetime, "auction released");
        Ok(auction)
    }

    fn draft_owned_by(&self, id: AuctionId, caller: UserId) -> Result<Auction, ServiceError> {
        let auction = self
            .durable
            .get_auction(id)?
            .ok_or_else(|| DomainError::not_found("auction not found"))?;
        if auction.creator_id != caller {
            return Err(DomainError::authorization("only the creator may modify an auction").into());
        }
        if auction.status != AuctionStatus::Draft {
            return Err(DomainError::state("auction is no longer editable").into());
        }
        Ok(auction)
    }

    /* ----------------------------- Reconcile ------------------------------- */

    /// The uniform handler behind every event source: re-read authoritative
    /// state and converge timers / boundaries toward it.
    pub fn reconcile(&self, auction_id: AuctionId) -> Result<(), ServiceError> {
        let Some(mut auction) = self.durable.get_auction(auction_id)? else {
            self.cancel_timer(auction_id);
            return Ok(());
        };
        let now = Utc::now();

        match auction.status {
            AuctionStatus::Draft | AuctionStatus::Deleted | AuctionStatus::Finished => {
                self.cancel_timer(auction_id);
            }
            AuctionStatus::Released => {
                if now >= auction.start_datetime {
                    self.go_live(&mut auction, now)?;
                } else {
                    self.arm_timer(auction_id, auction.start_datetime);
                }
            }
            AuctionStatus::Live => {
                match self.durable.get_round(auction_id, auction.current_round_idx)? {
                    Some(round) => {
                        if now >= round.effective_end() {
                            self.finish_round(&mut auction, &round)?;
                        } else {
                            self.arm_timer(auction_id, round.effective_end());
                        }
                    }
                    // Crash window between the status flip and the round
                    // write; recreate the missing round.
                    None => {
                        let idx = auction.current_round_idx;
                        warn!(auction_id = %auction_id, idx, "live auction missing its round; recreating");
                        self.start_round(&mut auction, idx, now)?;
                    }
                }
            }
        }
        Ok(())
    }

    /* ------------------------------ Timers --------------------------------- */

    fn arm_timer(&self, auction_id: AuctionId, deadline: DateTime<Utc>) {
        let deadline_ms = deadline.timestamp_millis();
        let mut timers = self.timers.lock();
        if let Some(existing) = timers.get(&auction_id) {
            if existing.deadline_ms == deadline_ms && !existing.handle.is_finished() {
                return;
            }
            existing.handle.abort();
        }
        let events_tx = self.events_tx.clone();
        let handle = tokio::spawn(async move {
            let now_ms = Utc::now().timestamp_millis();
            let wait = (deadline_ms - now_ms).max(0) as u64;
            time::sleep(std::time::Duration::from_millis(wait)).await;
            let _ = events_tx.send(LifecycleEvent {
                auction_id,
                hint: LifecycleHint::TimerFired,
            });
        });
        timers.insert(auction_id, ActiveTimer { deadline_ms, handle });
        debug!(auction_id = %auction_id, deadline_ms, "timer armed");
    }

    fn cancel_timer(&self, auction_id: AuctionId) {
        if let Some(timer) = self.timers.lock().remove(&auction_id) {
            timer.handle.abort();
        }
    }

    /* ---------------------------- Anti-sniping ------------------------------ */

    /// Apply a qualifying extension: `extended_until = max(current, now +
    /// extension)`, monotonically. Re-arms the timer and re-broadcasts.
    pub fn handle_snipe(&self, req: &SnipeRequest) -> Result<(), ServiceError> {
        let now = Utc::now();
        let Some(auction) = self.durable.get_auction(req.auction_id)? else {
            return Ok(());
        };
        if auction.status != AuctionStatus::Live || auction.current_round_idx != req.round_idx {
            return Ok(());
        }
        if self.cfg.anti_snipe.first_round_only && req.round_idx != 0 {
            return Ok(());
        }
        let Some(mut round) = self.durable.get_round(req.auction_id, req.round_idx)? else {
            return Ok(());
        };
        if round.id != req.round_id || !round.is_open(now) {
            return Ok(());
        }
        // The trigger must still be in the top three.
        match self.hot.place_of(auction.id, round.id, req.user_id) {
            Some(place) if place <= 3 => {}
            _ => return Ok(()),
        }

        let extension = chrono::Duration::from_std(self.cfg.anti_snipe.extension)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let candidate = now + extension;
        if candidate <= round.effective_end() {
            return Ok(());
        }

        round.extended_until = Some(candidate);
        self.durable.update_round(&round)?;
        self.hot.invalidate_round(auction.id, round.idx);
        self.hot.mark_sniping_bid(auction.id, round.id, req.user_id);
        self.arm_timer(auction.id, candidate);
        self.broadcast(auction.id);
        info!(
            auction_id = %auction.id,
            round_idx = round.idx,
            user_id = %req.user_id,
            extended_until = %candidate,
            "round extended by anti-sniping"
        );
        Ok(())
    }

    fn broadcast(&self, auction_id: AuctionId) {
        let _ = self
            .broadcast_tx
            .send(BroadcastRequest { auction_id, force: true });
    }

    /* --------------------------- Background tasks --------------------------- */

    /// Spawn the event loop, reconciler, change-feed reader, carry worker
    /// and anti-snipe consumer. Call once.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Single consumer: serialises all boundary handling.
        {
            let manager = self.clone();
            let mut rx = self
                .events_rx
                .lock()
                .take()
                .expect("lifecycle event loop spawned twice");
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        event = rx.recv() => match event {
                            Some(event) => {
                                if let Err(err) = manager.reconcile(event.auction_id) {
                                    error!(
                                        auction_id = %event.auction_id,
                                        hint = ?event.hint,
                                        error = %err,
                                        "lifecycle event handling failed"
                                    );
                                }
                            }
                            None => break,
                        },
                    }
                }
                info!("lifecycle event loop stopped");
            }));
        }

        // Reconciler: catches up anything the feed missed.
        {
            let manager = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = time::interval(manager.cfg.lifecycle.reconcile_interval);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => manager.reconcile_tick(),
                    }
                }
            }));
        }

        // Change-feed reader.
        {
            let manager = self.clone();
            let mut feed = self.durable.subscribe();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        msg = feed.recv() => match msg {
                            Ok(change) => {
                                if matches!(change.collection, Collection::Auctions | Collection::Rounds) {
                                    if let Some(auction_id) = change.auction_id {
                                        let _ = manager.events_tx.send(LifecycleEvent {
                                            auction_id,
                                            hint: LifecycleHint::ChangeFeed,
                                        });
                                    }
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "change feed lagged; reconciler covers the gap");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            }));
        }

        // Carry worker: drains the transfer queue one task at a time.
        {
            let manager = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = time::sleep(manager.cfg.lifecycle.carry_poll_interval) => {
                            while let Some(task) = manager.hot.pop_carry() {
                                if let Err(err) = manager.process_carry_task(&task) {
                                    error!(
                                        auction_id = %task.auction_id,
                                        error = %err,
                                        "carry task failed; re-queued"
                                    );
                                    break;
                                }
                            }
                        }
                    }
                }
            }));
        }

        // Anti-snipe consumer.
        {
            let manager = self.clone();
            let mut rx = self
                .snipe_rx
                .lock()
                .take()
                .expect("anti-snipe consumer spawned twice");
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        req = rx.recv() => match req {
                            Some(req) => {
                                if let Err(err) = manager.handle_snipe(&req) {
                                    error!(auction_id = %req.auction_id, error = %err, "anti-snipe handling failed");
                                }
                            }
                            None => break,
                        },
                    }
                }
            }));
        }

        handles
    }

    fn reconcile_tick(&self) {
        for status in [AuctionStatus::Released, AuctionStatus::Live] {
            match self.durable.auctions_by_status(status) {
                Ok(auctions) => {
                    for auction in auctions {
                        let _ = self.events_tx.send(LifecycleEvent {
                            auction_id: auction.id,
                            hint: LifecycleHint::ReconcileTick,
                        });
                    }
                }
                Err(err) => error!(error = %err, "reconciler scan failed"),
            }
        }
    }
}
