//! Real-time fan-out: subscription registry, snapshot broadcasting and time
//! ticks.
//!
//! Every subscriber owns a channel receiver; the registry pushes serialized
//! JSON frames into it and the WebSocket layer drains them onto the wire.
//! Two independent tickers drive outbound traffic:
//!
//! 1. a lightweight **time tick** (~100 ms) carrying only countdowns, and
//! 2. a **snapshot tick** (~100 ms) plus on-demand forced broadcasts from
//!    the bid engine.
//!
//! Snapshots are deduplicated by a blake3 content hash over the top-10
//! ranking and the total bid count: unchanged state inside the dedup window
//! is suppressed unless the broadcast was forced.  This bounds outbound
//! traffic without risking a stale UI.

pub mod ws;

use std::{
    collections::HashMap,
    sync::Arc,
    time::Instant,
};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use gavel_common::{
    model::{Auction, AuctionStatus, Round},
    types::{AuctionId, UserId},
};
use gavel_store::{DurableStore, HotStore, RankedBid};

use crate::{config::FanoutSection, error::ServiceError};

/* -------------------------------------------------------------------------- */
/*                                  Requests                                  */
/* -------------------------------------------------------------------------- */

/// On-demand broadcast, typically enqueued by the bid engine post-commit.
#[derive(Copy, Clone, Debug)]
pub struct BroadcastRequest {
    pub auction_id: AuctionId,
    pub force: bool,
}

/* -------------------------------------------------------------------------- */
/*                                 Registry                                   */
/* -------------------------------------------------------------------------- */

struct Subscriber {
    user_id: Option<UserId>,
    tx: mpsc::UnboundedSender<String>,
}

struct LastBroadcast {
    hash: [u8; 32],
    at: Instant,
}

pub struct FanoutRegistry {
    hot: Arc<HotStore>,
    durable: Arc<DurableStore>,
    cfg: FanoutSection,
    subs: RwLock<HashMap<AuctionId, HashMap<Uuid, Subscriber>>>,
    last: Mutex<HashMap<AuctionId, LastBroadcast>>,
}

impl FanoutRegistry {
    pub fn new(hot: Arc<HotStore>, durable: Arc<DurableStore>, cfg: FanoutSection) -> Arc<Self> {
        Arc::new(Self {
            hot,
            durable,
            cfg,
            subs: RwLock::new(HashMap::new()),
            last: Mutex::new(HashMap::new()),
        })
    }

    /// Register a viewer. The returned receiver immediately yields a full
    /// state snapshot, then every subsequent broadcast.
    pub fn subscribe(
        &self,
        auction_id: AuctionId,
        user_id: Option<UserId>,
    ) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.subs
            .write()
            .entry(auction_id)
            .or_default()
            .insert(id, Subscriber { user_id, tx: tx.clone() });

        match self.render_snapshot(auction_id, user_id) {
            Ok(Some(snapshot)) => {
                let _ = tx.send(snapshot);
            }
            Ok(None) => {
                let _ = tx.send(
                    json!({ "type": "error", "error": "NOT_FOUND" }).to_string(),
                );
            }
            Err(err) => warn!(auction_id = %auction_id, error = %err, "initial snapshot failed"),
        }
        (id, rx)
    }

    pub fn unsubscribe(&self, auction_id: AuctionId, id: Uuid) {
        let mut subs = self.subs.write();
        if let Some(per_auction) = subs.get_mut(&auction_id) {
            per_auction.remove(&id);
            if per_auction.is_empty() {
                subs.remove(&auction_id);
            }
        }
    }

    pub fn subscriber_count(&self, auction_id: AuctionId) -> usize {
        self.subs
            .read()
            .get(&auction_id)
            .map(|per_auction| per_auction.len())
            .unwrap_or(0)
    }

    fn watched_auctions(&self) -> Vec<AuctionId> {
        self.subs.read().keys().copied().collect()
    }

    /* ------------------------------ Broadcast ------------------------------- */

    /// Re-send the full snapshot unless the content hash is unchanged and
    /// the last send is fresher than the dedup interval. `force` overrides
    /// suppression (used by the bid engine post-commit path).
    pub fn broadcast_auction(&self, auction_id: AuctionId, force: bool) -> Result<(), ServiceError> {
        if self.subscriber_count(auction_id) == 0 {
            return Ok(());
        }
        let Some((base, hash)) = self.snapshot_with_hash(auction_id)? else {
            return Ok(());
        };

        {
            let mut last = self.last.lock();
            if let Some(previous) = last.get(&auction_id) {
                let fresh = previous.at.elapsed() < self.cfg.dedup_interval;
                if !force && previous.hash == hash && fresh {
                    return Ok(());
                }
            }
            last.insert(auction_id, LastBroadcast { hash, at: Instant::now() });
        }

        self.send_personalized(auction_id, &base);
        Ok(())
    }

    fn send_personalized(&self, auction_id: AuctionId, base: &Value) {
        let mut dead = Vec::new();
        {
            let subs = self.subs.read();
            let Some(per_auction) = subs.get(&auction_id) else { return };
            for (id, subscriber) in per_auction {
                let frame = self.personalize(base, auction_id, subscriber.user_id);
                if subscriber.tx.send(frame.to_string()).is_err() {
                    dead.push(*id);
                }
            }
        }
        // Closed channels mean closed sockets; collect the garbage.
        for id in dead {
            self.unsubscribe(auction_id, id);
        }
    }

    fn personalize(&self, base: &Value, auction_id: AuctionId, viewer: Option<UserId>) -> Value {
        let mut frame = base.clone();
        if let (Some(user), Some(object)) = (viewer, frame.as_object_mut()) {
            if let Some(round_id) = object
                .get("round")
                .and_then(|round| round.get("id"))
                .and_then(Value::as_str)
                .and_then(|raw| raw.parse().ok())
            {
                if let Some(bid) = self.hot.bid_of(auction_id, round_id, user) {
                    object.insert("my_bid".into(), json!({
                        "amount": bid.amount,
                        "is_top3_sniping_bid": bid.is_top3_sniping_bid,
                    }));
                }
                if let Some(place) = self.hot.place_of(auction_id, round_id, user) {
                    object.insert("my_place".into(), json!(place));
                }
            }
        }
        frame
    }

    /* ------------------------------ Snapshots ------------------------------- */

    /// Build the viewer-specific snapshot frame (subscribe path).
    pub fn render_snapshot(
        &self,
        auction_id: AuctionId,
        viewer: Option<UserId>,
    ) -> Result<Option<String>, ServiceError> {
        Ok(self
            .snapshot_with_hash(auction_id)?
            .map(|(base, _)| self.personalize(&base, auction_id, viewer).to_string()))
    }

    fn snapshot_with_hash(
        &self,
        auction_id: AuctionId,
    ) -> Result<Option<(Value, [u8; 32])>, ServiceError> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let Some(auction) = self.load_auction(auction_id, now_ms)? else {
            return Ok(None);
        };
        let round = self.durable.get_round(auction_id, auction.current_round_idx)?;

        let mut payload = json!({
            "type": "snapshot",
            "auction": {
                "id": auction.id.to_string(),
                "name": auction.name,
                "item_name": auction.item_name,
                "status": auction.status.to_string(),
                "current_round_idx": auction.current_round_idx,
                "rounds_count": auction.rounds_count,
                "remaining_items_count": auction.remaining_items_count,
                "base_min_bid": auction.min_bid,
                "min_bid_for_round": auction.min_bid_for_round(auction.current_round_idx),
            },
        });
        let object = payload.as_object_mut().expect("snapshot root is an object");

        if auction.status == AuctionStatus::Released {
            let until = (auction.start_datetime.timestamp_millis() - now_ms).max(0);
            object["auction"]
                .as_object_mut()
                .expect("auction section is an object")
                .insert("time_until_start_ms".into(), json!(until));
        }

        let mut top = Vec::new();
        let mut total = 0usize;
        if let Some(round) = &round {
            let remaining = (round.effective_end().timestamp_millis() - now_ms).max(0);
            object.insert("round".into(), json!({
                "id": round.id.to_string(),
                "idx": round.idx,
                "started_at": round.started_at,
                "ended_at": round.ended_at,
                "extended_until": round.extended_until,
                "time_remaining_ms": remaining,
            }));

            top = self.ranked(auction.id, round, self.cfg.top_bids_limit, now_ms)?;
            let all = self.ranked(auction.id, round, usize::MAX, now_ms)?;
            total = all.len();
            object.insert("top_bids".into(), ranked_json(&top));
            object.insert("all_bids".into(), ranked_json(&all));
        }

        let hash = content_hash(&top, total);
        Ok(Some((payload, hash)))
    }

    fn ranked(
        &self,
        auction_id: AuctionId,
        round: &Round,
        k: usize,
        now_ms: i64,
    ) -> Result<Vec<RankedBid>, ServiceError> {
        let hot = if k == usize::MAX {
            self.hot.all_ranked(auction_id, round.id)
        } else {
            self.hot.top(auction_id, round.id, k, now_ms)
        };
        if !hot.is_empty() {
            return Ok(hot);
        }
        let mut bids = self.durable.bids_for_round(auction_id, round.id)?;
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

    fn load_auction(&self, id: AuctionId, now_ms: i64) -> Result<Option<Auction>, ServiceError> {
        if let Some(auction) = self.hot.cached_auction(id, now_ms) {
            return Ok(Some(auction));
        }
        let Some(auction) = self.durable.get_auction(id)? else {
            return Ok(None);
        };
        self.hot.cache_auction(auction.clone(), now_ms);
        Ok(Some(auction))
    }

    /* ------------------------------ Time tick ------------------------------- */

    /// Lightweight countdown frames; no ranking data.
    pub fn time_tick(&self) {
        let now_ms = Utc::now().timestamp_millis();
        for auction_id in self.watched_auctions() {
            let frame = match self.time_frame(auction_id, now_ms) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(err) => {
                    debug!(auction_id = %auction_id, error = %err, "time tick skipped");
                    continue;
                }
            };
            let mut dead = Vec::new();
            {
                let subs = self.subs.read();
                let Some(per_auction) = subs.get(&auction_id) else { continue };
                for (id, subscriber) in per_auction {
                    if subscriber.tx.send(frame.clone()).is_err() {
                        dead.push(*id);
                    }
                }
            }
            for id in dead {
                self.unsubscribe(auction_id, id);
            }
        }
    }

    fn time_frame(
        &self,
        auction_id: AuctionId,
        now_ms: i64,
    ) -> Result<Option<String>, ServiceError> {
        let Some(auction) = self.load_auction(auction_id, now_ms)? else {
            return Ok(None);
        };
        let frame = match auction.status {
            AuctionStatus::Released => {
                let until = (auction.start_datetime.timestamp_millis() - now_ms).max(0);
                json!({
                    "type": "time_update",
                    "auction_id": auction.id.to_string(),
                    "time_until_start_ms": until,
                })
            }
            AuctionStatus::Live => {
                let Some(round) = self.durable.get_round(auction_id, auction.current_round_idx)?
                else {
                    return Ok(None);
                };
                let remaining = (round.effective_end().timestamp_millis() - now_ms).max(0);
                json!({
                    "type": "time_update",
                    "auction_id": auction.id.to_string(),
                    "round": { "idx": round.idx, "time_remaining_ms": remaining },
                })
            }
            _ => return Ok(None),
        };
        Ok(Some(frame.to_string()))
    }

    /* --------------------------- Background tasks --------------------------- */

    /// Spawn the time ticker, the snapshot ticker and the on-demand request
    /// consumer.
    pub fn spawn(
        self: &Arc<Self>,
        mut requests: mpsc::UnboundedReceiver<BroadcastRequest>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        {
            let registry = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = time::interval(registry.cfg.time_tick);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => registry.time_tick(),
                    }
                }
            }));
        }

        {
            let registry = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = time::interval(registry.cfg.snapshot_tick);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            for auction_id in registry.watched_auctions() {
                                if let Err(err) = registry.broadcast_auction(auction_id, false) {
                                    error!(auction_id = %auction_id, error = %err, "snapshot broadcast failed");
                                }
                            }
                        }
                    }
                }
            }));
        }

        {
            let registry = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        request = requests.recv() => match request {
                            Some(request) => {
                                if let Err(err) =
                                    registry.broadcast_auction(request.auction_id, request.force)
                                {
                                    error!(
                                        auction_id = %request.auction_id,
                                        error = %err,
                                        "forced broadcast failed"
                                    );
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
}

/* -------------------------------------------------------------------------- */
/*                                  Helpers                                   */
/* -------------------------------------------------------------------------- */

fn ranked_json(ranked: &[RankedBid]) -> Value {
    Value::Array(
        ranked
            .iter()
            .map(|bid| {
                json!({
                    "user_id": bid.user_id.external(),
                    "amount": bid.amount,
                    "place_id": bid.place,
                })
            })
            .collect(),
    )
}

/// Hash over the top-10 ranking plus total bid count; the dedup fingerprint.
fn content_hash(top: &[RankedBid], total: usize) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for bid in top {
        hasher.update(&bid.user_id.0.to_be_bytes());
        hasher.update(&bid.amount.to_be_bytes());
        hasher.update(&bid.place.to_be_bytes());
    }
    hasher.update(&(total as u64).to_be_bytes());
    *hasher.finalize().as_bytes()
}

/* -------------------------------------------------------------------------- */
/*                                    Tests                                   */
/* -------------------------------------------------------------------------- */
