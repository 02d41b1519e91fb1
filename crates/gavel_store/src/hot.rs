//! In-process hot store: the authoritative home of in-flight bids and
//! balances while an auction is LIVE.
//!
//! Responsibilities
//! ----------------
//! 1. Execute the bid placement script as one indivisible unit: balance
//!    debit, bid upsert, ranking insert and idempotency marker either all
//!    happen or none do.
//! 2. Maintain per-round ranking sets ordered by amount-desc / time-asc.
//! 3. Host the FIFO carry queue and the short-TTL read caches.
//!
//! Concurrency
//! -----------
//! Every keyspace lives behind a single [`parking_lot::Mutex`], so mutating
//! commands execute one at a time — the in-process analog of a scripted
//! single-threaded KV server.  No await point can interleave with a command;
//! two bids against the same `(round, user)` are serialized here and the
//! later one sees the earlier's effect.
//!
//! Expiry
//! ------
//! Records carry absolute expiry timestamps that are checked lazily on read.
//! A periodic evictor task (see [`HotStore::spawn_evictor`]) sweeps what lazy
//! reads never touch, which keeps the maps bounded without a background
//! thread per key.

use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time;
use tracing::debug;

use gavel_common::{
    error::BidReject,
    model::{Auction, Round},
    types::{Amount, AuctionId, RoundId, UserId},
};

/// Multiplier that packs the amount into the high bits of a ranking score.
/// Leaves room for millisecond timestamps in the low bits.
const SCORE_AMOUNT_FACTOR: i128 = 1_000_000_000_000;

/// Ranking score: primary order by higher amount, ties by earlier timestamp.
/// Lower score ranks first.
fn score(amount: Amount, ts_ms: i64) -> i128 {
    -(amount as i128) * SCORE_AMOUNT_FACTOR + ts_ms as i128
}

/* -------------------------------------------------------------------------- */
/*                               Configuration                                */
/* -------------------------------------------------------------------------- */

#[derive(Clone, Debug)]
pub struct HotConfig {
    /// TTL for bid records and ranking sets.
    pub bid_ttl: Duration,
    /// TTL for idempotency markers.
    pub idempotency_ttl: Duration,
    /// TTL for the auction / round read caches.
    pub cache_ttl: Duration,
    /// TTL for the cached top-k view.
    pub top_cache_ttl: Duration,
    /// Cadence of the background expiry sweep.
    pub evictor_interval: Duration,
}

impl Default for HotConfig {
    fn default() -> Self {
        Self {
            bid_ttl: Duration::from_secs(24 * 60 * 60),
            idempotency_ttl: Duration::from_secs(60 * 60),
            cache_ttl: Duration::from_secs(1),
            top_cache_ttl: Duration::from_secs(5),
            evictor_interval: Duration::from_secs(30),
        }
    }
}

/* -------------------------------------------------------------------------- */
/*                                  Records                                   */
/* -------------------------------------------------------------------------- */

/// A bid as the hot store sees it. Mirrored into the durable store by the
/// synchroniser; `created_at_ms` doubles as the ranking tie-breaker origin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidRecord {
    pub auction_id: AuctionId,
    pub round_id: RoundId,
    pub round_idx: u32,
    pub user_id: UserId,
    pub amount: Amount,
    pub is_top3_sniping_bid: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// One entry of a round ranking, in place order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedBid {
    pub user_id: UserId,
    pub amount: Amount,
    /// 1-based.
    pub place: u32,
}

/// Task enqueued at a round boundary to carry losing bids forward.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarryTask {
    pub auction_id: AuctionId,
    pub current_round_id: RoundId,
    pub current_round_idx: u32,
    pub next_round_id: RoundId,
    pub next_round_idx: u32,
    pub winners_per_round: u32,
}

/* -------------------------------------------------------------------------- */
/*                            Script inputs/outputs                           */
/* -------------------------------------------------------------------------- */

/// Validated round context the engine hands to the placement script.
/// The script trusts these values but re-checks everything time- and
/// bid-dependent under its own lock.
#[derive(Clone, Debug)]
pub struct RoundContext {
    pub auction_id: AuctionId,
    pub round_id: RoundId,
    pub round_idx: u32,
    pub min_bid_for_round: Amount,
    pub winners_per_round: u32,
    pub effective_end_ms: i64,
}

/// Arguments of one placement command.
#[derive(Clone, Debug)]
pub struct PlaceCommand {
    pub user_id: UserId,
    pub amount: Amount,
    pub idempotency_key: String,
    pub add_to_existing: bool,
    pub now_ms: i64,
}

/// The committed result of a placement, also stored under the idempotency
/// marker so replays return byte-identical payloads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedBid {
    pub bid: BidRecord,
    pub place: u32,
    pub remaining_balance: Amount,
    /// Whether this command augmented an existing bid (a "rebid") rather
    /// than creating one.  Only rebids qualify for anti-sniping.
    pub augmented: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlaceOutcome {
    /// The command took effect.
    Placed(PlacedBid),
    /// The idempotency key was already committed; prior result returned.
    Replayed(PlacedBid),
}

/* -------------------------------------------------------------------------- */
/*                               Internal state                               */
/* -------------------------------------------------------------------------- */

#[derive(Clone, Debug)]
struct Expiring<T> {
    value: T,
    expires_at_ms: i64,
}

impl<T> Expiring<T> {
    fn live(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Ordered set plus per-user score index, the sorted-set analog.
#[derive(Default)]
struct Ranking {
    set: BTreeSet<(i128, UserId)>,
    index: HashMap<UserId, i128>,
}

impl Ranking {
    fn upsert(&mut self, user: UserId, new_score: i128) {
        if let Some(old) = self.index.insert(user, new_score) {
            self.set.remove(&(old, user));
        }
        self.set.insert((new_score, user));
    }

    /// 1-based place of `user`, if ranked.
    fn place_of(&self, user: UserId) -> Option<u32> {
        let target = *self.index.get(&user)?;
        let rank = self
            .set
            .iter()
            .position(|entry| *entry == (target, user))
            .unwrap_or_default();
        Some(rank as u32 + 1)
    }

    fn iter_users(&self) -> impl Iterator<Item = UserId> + '_ {
        self.set.iter().map(|(_, user)| *user)
    }
}

#[derive(Default)]
struct HotState {
    balances: HashMap<UserId, Amount>,
    bids: HashMap<(AuctionId, RoundId, UserId), Expiring<BidRecord>>,
    rankings: HashMap<(AuctionId, RoundId), Expiring<Ranking>>,
    idempotency: HashMap<String, Expiring<PlacedBid>>,
    carried_keys: HashSet<String>,
    transfer_queue: VecDeque<CarryTask>,
    auction_cache: HashMap<AuctionId, Expiring<Auction>>,
    round_cache: HashMap<(AuctionId, u32), Expiring<Round>>,
    top_cache: HashMap<(AuctionId, RoundId, usize), Expiring<Vec<RankedBid>>>,
}

/* -------------------------------------------------------------------------- */
/*                                  HotStore                                  */
/* -------------------------------------------------------------------------- */

pub struct HotStore {
    state: Mutex<HotState>,
    cfg: HotConfig,
}

impl HotStore {
    pub fn new(cfg: HotConfig) -> Self {
        Self { state: Mutex::new(HotState::default()), cfg }
    }

    /* ------------------------------ Balances ------------------------------ */

    pub fn balance(&self, user: UserId) -> Amount {
        self.state.lock().balances.get(&user).copied().unwrap_or(0)
    }

    /// Overwrite a balance; used when priming hot ← durable on startup.
    pub fn prime_balance(&self, user: UserId, amount: Amount) {
        self.state.lock().balances.insert(user, amount);
    }

    /// Credit (refund) a balance; returns the new value.
    pub fn credit(&self, user: UserId, delta: Amount) -> Amount {
        let mut state = self.state.lock();
        let entry = state.balances.entry(user).or_insert(0);
        *entry += delta;
        *entry
    }

    /// Snapshot of every known balance, for the durable mirror.
    pub fn balances_snapshot(&self) -> Vec<(UserId, Amount)> {
        self.state
            .lock()
            .balances
            .iter()
            .map(|(user, amount)| (*user, *amount))
            .collect()
    }

    /* ----------------------------- Bid script ----------------------------- */

    /// Look up a previously committed placement by idempotency key without
    /// touching any other state. Lets the engine serve replays even after
    /// the round (or auction) has moved on.
    pub fn lookup_idempotent(&self, key: &str, now_ms: i64) -> Option<PlacedBid> {
        let state = self.state.lock();
        state
            .idempotency
            .get(key)
            .filter(|entry| entry.live(now_ms))
            .map(|entry| entry.value.clone())
    }

    /// The bid placement script. Runs start to finish under the store lock;
    /// checks and effects are indivisible.
    pub fn place_bid(
        &self,
        ctx: &RoundContext,
        cmd: PlaceCommand,
    ) -> Result<PlaceOutcome, BidReject> {
        let mut state = self.state.lock();
        let now_ms = cmd.now_ms;

        // Committed before? Return the prior result, no effects.
        if let Some(prior) = state.idempotency.get(&cmd.idempotency_key) {
            if prior.live(now_ms) {
                return Ok(PlaceOutcome::Replayed(prior.value.clone()));
            }
        }

        if now_ms >= ctx.effective_end_ms {
            return Err(BidReject::RoundEnded);
        }

        let bid_key = (ctx.auction_id, ctx.round_id, cmd.user_id);
        let existing = state
            .bids
            .get(&bid_key)
            .filter(|entry| entry.live(now_ms))
            .map(|entry| entry.value.clone());

        if cmd.add_to_existing && existing.is_none() {
            return Err(BidReject::NoExistingBid);
        }
        if !cmd.add_to_existing && existing.is_some() {
            return Err(BidReject::BidExists);
        }

        let total = existing.as_ref().map(|bid| bid.amount).unwrap_or(0) + cmd.amount;
        if total < ctx.min_bid_for_round {
            return Err(BidReject::BelowMinBid { min_bid: ctx.min_bid_for_round, total });
        }

        // Winning-top lockout applies only to augmentations.
        if existing.is_some() {
            let place = state
                .rankings
                .get(&(ctx.auction_id, ctx.round_id))
                .and_then(|ranking| ranking.value.place_of(cmd.user_id));
            if let Some(place) = place {
                if place == 1 {
                    return Err(BidReject::AlreadyFirstPlace);
                }
                let top3_exempt = ctx.round_idx == 0 && place <= 3;
                if place <= ctx.winners_per_round && !top3_exempt {
                    return Err(BidReject::AlreadyInWinningTop {
                        place,
                        winners_per_round: ctx.winners_per_round,
                    });
                }
            }
        }

        let balance = state.balances.get(&cmd.user_id).copied().unwrap_or(0);
        if balance < cmd.amount {
            return Err(BidReject::InsufficientBalance { balance, required: cmd.amount });
        }

        // All checks passed — apply effects.
        let new_balance = balance - cmd.amount;
        state.balances.insert(cmd.user_id, new_balance);

        let augmented = existing.is_some();
        let record = match existing {
            Some(mut bid) => {
                bid.amount = total;
                bid.updated_at_ms = now_ms;
                bid
            }
            None => BidRecord {
                auction_id: ctx.auction_id,
                round_id: ctx.round_id,
                round_idx: ctx.round_idx,
                user_id: cmd.user_id,
                amount: total,
                is_top3_sniping_bid: false,
                created_at_ms: now_ms,
                updated_at_ms: now_ms,
            },
        };
        let bid_expiry = now_ms + self.cfg.bid_ttl.as_millis() as i64;
        state
            .bids
            .insert(bid_key, Expiring { value: record.clone(), expires_at_ms: bid_expiry });

        let ranking = state
            .rankings
            .entry((ctx.auction_id, ctx.round_id))
            .or_insert_with(|| Expiring { value: Ranking::default(), expires_at_ms: bid_expiry });
        ranking.expires_at_ms = bid_expiry;
        ranking.value.upsert(cmd.user_id, score(total, now_ms));
        let place = ranking
            .value
            .place_of(cmd.user_id)
            .unwrap_or(1);

        let placed = PlacedBid { bid: record, place, remaining_balance: new_balance, augmented };
        state.idempotency.insert(
            cmd.idempotency_key,
            Expiring {
                value: placed.clone(),
                expires_at_ms: now_ms + self.cfg.idempotency_ttl.as_millis() as i64,
            },
        );
        state.top_cache.retain(|key, _| !(key.0 == ctx.auction_id && key.1 == ctx.round_id));

        Ok(PlaceOutcome::Placed(placed))
    }

    /// Merge a carried amount into the next round. No balance debit — the
    /// funds were taken when originally staked.  `transfer_key` makes the
    /// operation replay-safe; `ranking_ts_ms` preserves the source bid's
    /// tie-breaking priority.
    pub fn apply_carry(
        &self,
        ctx: &RoundContext,
        user: UserId,
        add_amount: Amount,
        ranking_ts_ms: i64,
        transfer_key: &str,
        now_ms: i64,
    ) -> Option<BidRecord> {
        let mut state = self.state.lock();
        if !state.carried_keys.insert(transfer_key.to_owned()) {
            return None;
        }

        let bid_key = (ctx.auction_id, ctx.round_id, user);
        let bid_expiry = now_ms + self.cfg.bid_ttl.as_millis() as i64;
        let record = match state.bids.get(&bid_key).filter(|entry| entry.live(now_ms)) {
            Some(existing) => {
                let mut bid = existing.value.clone();
                bid.amount += add_amount;
                bid.updated_at_ms = now_ms;
                bid
            }
            None => BidRecord {
                auction_id: ctx.auction_id,
                round_id: ctx.round_id,
                round_idx: ctx.round_idx,
                user_id: user,
                amount: add_amount,
                is_top3_sniping_bid: false,
                created_at_ms: ranking_ts_ms,
                updated_at_ms: now_ms,
            },
        };
        state
            .bids
            .insert(bid_key, Expiring { value: record.clone(), expires_at_ms: bid_expiry });

        let ranking = state
            .rankings
            .entry((ctx.auction_id, ctx.round_id))
            .or_insert_with(|| Expiring { value: Ranking::default(), expires_at_ms: bid_expiry });
        ranking.expires_at_ms = bid_expiry;
        ranking
            .value
            .upsert(user, score(record.amount, record.created_at_ms));
        state.top_cache.retain(|key, _| !(key.0 == ctx.auction_id && key.1 == ctx.round_id));

        Some(record)
    }

    /// Flag the bid that triggered an anti-sniping extension.
    pub fn mark_sniping_bid(&self, auction: AuctionId, round: RoundId, user: UserId) -> bool {
        let mut state = self.state.lock();
        match state.bids.get_mut(&(auction, round, user)) {
            Some(entry) => {
                entry.value.is_top3_sniping_bid = true;
                true
            }
            None => false,
        }
    }

    /* ------------------------------- Ranking ------------------------------- */

    /// 1-based place of a user within a round.
    pub fn place_of(&self, auction: AuctionId, round: RoundId, user: UserId) -> Option<u32> {
        let state = self.state.lock();
        state
            .rankings
            .get(&(auction, round))
            .and_then(|ranking| ranking.value.place_of(user))
    }

    pub fn bid_of(&self, auction: AuctionId, round: RoundId, user: UserId) -> Option<BidRecord> {
        let state = self.state.lock();
        state
            .bids
            .get(&(auction, round, user))
            .map(|entry| entry.value.clone())
    }

    /// Full round ranking in place order.
    pub fn all_ranked(&self, auction: AuctionId, round: RoundId) -> Vec<RankedBid> {
        let state = self.state.lock();
        ranked_locked(&state, auction, round)
    }

    /// Top-k of a round, served from a short-TTL cache.
    pub fn top(
        &self,
        auction: AuctionId,
        round: RoundId,
        k: usize,
        now_ms: i64,
    ) -> Vec<RankedBid> {
        let mut state = self.state.lock();
        if let Some(cached) = state.top_cache.get(&(auction, round, k)) {
            if cached.live(now_ms) {
                return cached.value.clone();
            }
        }
        let mut ranked = ranked_locked(&state, auction, round);
        ranked.truncate(k);
        state.top_cache.insert(
            (auction, round, k),
            Expiring {
                value: ranked.clone(),
                expires_at_ms: now_ms + self.cfg.top_cache_ttl.as_millis() as i64,
            },
        );
        ranked
    }

    /// Bid records of a round in place order (ranking joined with records).
    pub fn round_bids(&self, auction: AuctionId, round: RoundId) -> Vec<BidRecord> {
        let state = self.state.lock();
        let Some(ranking) = state.rankings.get(&(auction, round)) else {
            return Vec::new();
        };
        ranking
            .value
            .iter_users()
            .filter_map(|user| {
                state
                    .bids
                    .get(&(auction, round, user))
                    .map(|entry| entry.value.clone())
            })
            .collect()
    }

    /* ----------------------------- Carry queue ----------------------------- */

    pub fn push_carry(&self, task: CarryTask) {
        self.state.lock().transfer_queue.push_back(task);
    }

    pub fn pop_carry(&self) -> Option<CarryTask> {
        self.state.lock().transfer_queue.pop_front()
    }

    pub fn carry_queue_len(&self) -> usize {
        self.state.lock().transfer_queue.len()
    }

    /* ------------------------------- Caches -------------------------------- */

    pub fn cache_auction(&self, auction: Auction, now_ms: i64) {
        let expires_at_ms = now_ms + self.cfg.cache_ttl.as_millis() as i64;
        self.state
            .lock()
            .auction_cache
            .insert(auction.id, Expiring { value: auction, expires_at_ms });
    }

    pub fn cached_auction(&self, id: AuctionId, now_ms: i64) -> Option<Auction> {
        let state = self.state.lock();
        state
            .auction_cache
            .get(&id)
            .filter(|entry| entry.live(now_ms))
            .map(|entry| entry.value.clone())
    }

    pub fn invalidate_auction(&self, id: AuctionId) {
        self.state.lock().auction_cache.remove(&id);
    }

    pub fn cache_round(&self, round: Round, now_ms: i64) {
        let expires_at_ms = now_ms + self.cfg.cache_ttl.as_millis() as i64;
        self.state
            .lock()
            .round_cache
            .insert((round.auction_id, round.idx), Expiring { value: round, expires_at_ms });
    }

    pub fn cached_round(&self, auction: AuctionId, idx: u32, now_ms: i64) -> Option<Round> {
        let state = self.state.lock();
        state
            .round_cache
            .get(&(auction, idx))
            .filter(|entry| entry.live(now_ms))
            .map(|entry| entry.value.clone())
    }

    pub fn invalidate_round(&self, auction: AuctionId, idx: u32) {
        self.state.lock().round_cache.remove(&(auction, idx));
    }

    /* ------------------------------- Expiry -------------------------------- */

    /// Sweep expired entries; returns how many were removed.
    pub fn evict_expired(&self, now_ms: i64) -> usize {
        let mut state = self.state.lock();
        let before = state.bids.len()
            + state.rankings.len()
            + state.idempotency.len()
            + state.top_cache.len()
            + state.auction_cache.len()
            + state.round_cache.len();
        state.bids.retain(|_, entry| entry.live(now_ms));
        state.rankings.retain(|_, entry| entry.live(now_ms));
        state.idempotency.retain(|_, entry| entry.live(now_ms));
        state.top_cache.retain(|_, entry| entry.live(now_ms));
        state.auction_cache.retain(|_, entry| entry.live(now_ms));
        state.round_cache.retain(|_, entry| entry.live(now_ms));
        before
            - (state.bids.len()
                + state.rankings.len()
                + state.idempotency.len()
                + state.top_cache.len()
                + state.auction_cache.len()
                + state.round_cache.len())
    }

    /// Background sweep, mirroring the lazy checks on the read path.
    pub fn spawn_evictor(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.cfg.evictor_interval;
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                ticker.tick().await;
                let now_ms = chrono::Utc::now().timestamp_millis();
                let evicted = self.evict_expired(now_ms);
                if evicted > 0 {
                    debug!(count = evicted, "evicted expired hot-store entries");
                }
            }
        })
    }
}

fn ranked_locked(state: &HotState, auction: AuctionId, round: RoundId) -> Vec<RankedBid> {
    let Some(ranking) = state.rankings.get(&(auction, round)) else {
        return Vec::new();
    };
    ranking
        .value
        .iter_users()
        .enumerate()
        .filter_map(|(rank, user)| {
            state
                .bids
                .get(&(auction, round, user))
                .map(|entry| RankedBid {
                    user_id: user,
                    amount: entry.value.amount,
                    place: rank as u32 + 1,
                })
        })
        .collect()
}

/* -------------------------------------------------------------------------- */
/*                                    Tests                                   */
/* -------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(min_bid: Amount, winners: u32, round_idx: u32, end_ms: i64) -> RoundContext {
        RoundContext {
            auction_id: AuctionId::new(),
            round_id: RoundId::new(),
            round_idx,
            min_bid_for_round: min_bid,
            winners_per_round: winners,
            effective_end_ms: end_ms,
        }
    }

    fn place(
        store: &HotStore,
        ctx: &RoundContext,
        user: i64,
        amount: Amount,
        key: &str,
        add: bool,
        now_ms: i64,
    ) -> Result<PlaceOutcome, BidReject> {
        store.place_bid(
            ctx,
            PlaceCommand {
                user_id: UserId(user),
                amount,
                idempotency_key: key.into(),
                add_to_existing: add,
                now_ms,
            },
        )
    }

    fn store_with_balances(users: &[(i64, Amount)]) -> HotStore {
        let store = HotStore::new(HotConfig::default());
        for (user, balance) in users {
            store.prime_balance(UserId(*user), *balance);
        }
        store
    }

    #[test]
    fn ranking_orders_amount_desc_then_time_asc() {
        let store = store_with_balances(&[(1, 1_000), (2, 1_000), (3, 1_000)]);
        let ctx = ctx(100, 2, 0, 100_000);

        place(&store, &ctx, 1, 100, "k1", false, 1_000).unwrap();
        place(&store, &ctx, 2, 200, "k2", false, 2_000).unwrap();
        place(&store, &ctx, 3, 150, "k3", false, 3_000).unwrap();

        let ranked = store.all_ranked(ctx.auction_id, ctx.round_id);
        let users: Vec<i64> = ranked.iter().map(|r| r.user_id.0).collect();
        assert_eq!(users, vec![2, 3, 1]);
        assert_eq!(ranked[0].place, 1);
        assert_eq!(ranked[2].place, 3);
    }

    #[test]
    fn tie_on_amount_ranks_earlier_bid_first() {
        let store = store_with_balances(&[(1, 1_000), (2, 1_000)]);
        let ctx = ctx(100, 1, 0, 100_000);

        place(&store, &ctx, 2, 300, "k2", false, 1_000).unwrap();
        place(&store, &ctx, 1, 300, "k1", false, 2_000).unwrap();

        let ranked = store.all_ranked(ctx.auction_id, ctx.round_id);
        assert_eq!(ranked[0].user_id, UserId(2));
        assert_eq!(ranked[1].user_id, UserId(1));
    }

    #[test]
    fn debit_and_remaining_balance() {
        let store = store_with_balances(&[(7, 500)]);
        let ctx = ctx(100, 1, 0, 100_000);

        let PlaceOutcome::Placed(placed) =
            place(&store, &ctx, 7, 200, "k", false, 1_000).unwrap()
        else {
            panic!("expected a fresh placement");
        };
        assert_eq!(placed.remaining_balance, 300);
        assert_eq!(store.balance(UserId(7)), 300);
        assert_eq!(placed.bid.amount, 200);
    }

    #[test]
    fn insufficient_balance_leaves_state_untouched() {
        let store = store_with_balances(&[(7, 100)]);
        let ctx = ctx(100, 1, 0, 100_000);

        let err = place(&store, &ctx, 7, 200, "k", false, 1_000).unwrap_err();
        assert!(matches!(err, BidReject::InsufficientBalance { balance: 100, required: 200 }));
        assert_eq!(store.balance(UserId(7)), 100);
        assert!(store.bid_of(ctx.auction_id, ctx.round_id, UserId(7)).is_none());
    }

    #[test]
    fn replay_returns_identical_payload_without_effects() {
        let store = store_with_balances(&[(7, 500)]);
        let ctx = ctx(100, 1, 0, 100_000);

        let first = place(&store, &ctx, 7, 200, "K", false, 1_000).unwrap();
        let PlaceOutcome::Placed(original) = first else { panic!() };

        let second = place(&store, &ctx, 7, 200, "K", false, 5_000).unwrap();
        let PlaceOutcome::Replayed(replayed) = second else {
            panic!("expected a replay");
        };
        assert_eq!(replayed, original);
        assert_eq!(store.balance(UserId(7)), 300); // debited once
    }

    #[test]
    fn bid_at_effective_end_is_rejected() {
        let store = store_with_balances(&[(1, 1_000)]);
        let ctx = ctx(100, 1, 0, 10_000);

        // One millisecond before the deadline still lands.
        assert!(place(&store, &ctx, 1, 100, "a", false, 9_999).is_ok());
        // At the deadline it does not.
        let err = place(&store, &ctx, 1, 100, "b", true, 10_000).unwrap_err();
        assert_eq!(err, BidReject::RoundEnded);
    }

    #[test]
    fn first_place_holder_cannot_add() {
        let store = store_with_balances(&[(1, 1_000)]);
        let ctx = ctx(100, 1, 1, 100_000);

        place(&store, &ctx, 1, 200, "a", false, 1_000).unwrap();
        let err = place(&store, &ctx, 1, 50, "b", true, 2_000).unwrap_err();
        assert_eq!(err, BidReject::AlreadyFirstPlace);
        assert_eq!(store.balance(UserId(1)), 800); // second call did not debit
    }

    #[test]
    fn winning_top_locked_outside_first_round() {
        let store = store_with_balances(&[(1, 1_000), (2, 1_000), (3, 1_000)]);
        let ctx = ctx(100, 2, 1, 100_000);

        place(&store, &ctx, 1, 300, "a", false, 1_000).unwrap();
        place(&store, &ctx, 2, 200, "b", false, 2_000).unwrap();
        place(&store, &ctx, 3, 100, "c", false, 3_000).unwrap();

        // User 2 sits at place 2 of 2 — locked in round 1.
        let err = place(&store, &ctx, 2, 50, "d", true, 4_000).unwrap_err();
        assert_eq!(err, BidReject::AlreadyInWinningTop { place: 2, winners_per_round: 2 });

        // User 3 is outside the winning top and may augment.
        assert!(place(&store, &ctx, 3, 250, "e", true, 5_000).is_ok());
    }

    #[test]
    fn first_round_top3_may_still_add() {
        let store = store_with_balances(&[(1, 2_000), (2, 2_000), (3, 2_000)]);
        let ctx = ctx(100, 3, 0, 100_000);

        place(&store, &ctx, 1, 300, "a", false, 1_000).unwrap();
        place(&store, &ctx, 2, 200, "b", false, 2_000).unwrap();
        place(&store, &ctx, 3, 150, "c", false, 3_000).unwrap();

        // Place 2 in round 0 is within the top-3 exemption.
        let outcome = place(&store, &ctx, 2, 500, "d", true, 4_000).unwrap();
        let PlaceOutcome::Placed(placed) = outcome else { panic!() };
        assert_eq!(placed.bid.amount, 700);
        assert_eq!(placed.place, 1);
    }

    #[test]
    fn below_min_augmentation_is_rejected_then_accepted() {
        // Round 3: base 100 → minimum 115.
        let store = store_with_balances(&[(1, 1_000), (2, 1_000)]);
        let ctx = ctx(115, 1, 3, 100_000);

        // Carried-over 50 arrives below the minimum, which is allowed.
        store.apply_carry(&ctx, UserId(1), 50, 500, "transfer-r2-1-500", 1_000);
        // A stronger bid keeps user 1 outside the winning top.
        place(&store, &ctx, 2, 200, "top", false, 1_500).unwrap();

        let err = place(&store, &ctx, 1, 50, "a", true, 2_000).unwrap_err();
        assert_eq!(err, BidReject::BelowMinBid { min_bid: 115, total: 100 });

        let outcome = place(&store, &ctx, 1, 100, "b", true, 3_000).unwrap();
        let PlaceOutcome::Placed(placed) = outcome else { panic!() };
        assert_eq!(placed.bid.amount, 150);
    }

    #[test]
    fn add_to_existing_flags_enforced() {
        let store = store_with_balances(&[(1, 1_000)]);
        let ctx = ctx(100, 1, 0, 100_000);

        let err = place(&store, &ctx, 1, 100, "a", true, 1_000).unwrap_err();
        assert_eq!(err, BidReject::NoExistingBid);

        place(&store, &ctx, 1, 100, "b", false, 2_000).unwrap();
        let err = place(&store, &ctx, 1, 100, "c", false, 3_000).unwrap_err();
        assert_eq!(err, BidReject::BidExists);
    }

    #[test]
    fn carry_is_replay_safe_and_skips_balance() {
        let store = store_with_balances(&[(1, 0)]);
        let ctx = ctx(105, 1, 1, 100_000);

        let first = store.apply_carry(&ctx, UserId(1), 100, 500, "transfer-r0-1-500", 1_000);
        assert_eq!(first.unwrap().amount, 100);

        // Replay with the same transfer key is a no-op.
        let replay = store.apply_carry(&ctx, UserId(1), 100, 500, "transfer-r0-1-500", 2_000);
        assert!(replay.is_none());

        let ranked = store.all_ranked(ctx.auction_id, ctx.round_id);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].amount, 100);
        assert_eq!(store.balance(UserId(1)), 0);
    }

    #[test]
    fn carried_bid_keeps_original_tiebreak_priority() {
        let store = store_with_balances(&[(1, 0), (2, 1_000)]);
        let ctx = ctx(100, 1, 1, 100_000);

        // Carried 200 staked originally at t=500.
        store.apply_carry(&ctx, UserId(1), 200, 500, "transfer-r0-1-500", 10_000);
        // Fresh 200 placed at t=20_000 ties on amount but loses on time.
        place(&store, &ctx, 2, 200, "k", false, 20_000).unwrap();

        let ranked = store.all_ranked(ctx.auction_id, ctx.round_id);
        assert_eq!(ranked[0].user_id, UserId(1));
    }

    #[test]
    fn eviction_drops_expired_idempotency_markers() {
        let store = HotStore::new(HotConfig {
            idempotency_ttl: Duration::from_millis(100),
            ..HotConfig::default()
        });
        store.prime_balance(UserId(1), 1_000);
        let ctx = ctx(100, 1, 0, i64::MAX);

        place(&store, &ctx, 1, 100, "short", false, 1_000).unwrap();
        assert!(store.lookup_idempotent("short", 1_050).is_some());
        assert!(store.lookup_idempotent("short", 2_000).is_none());

        let evicted = store.evict_expired(2_000);
        assert!(evicted >= 1);
    }

    #[test]
    fn carry_queue_is_fifo() {
        let store = HotStore::new(HotConfig::default());
        let auction = AuctionId::new();
        let (r0, r1, r2) = (RoundId::new(), RoundId::new(), RoundId::new());
        let task = |cur: RoundId, next: RoundId, idx: u32| CarryTask {
            auction_id: auction,
            current_round_id: cur,
            current_round_idx: idx,
            next_round_id: next,
            next_round_idx: idx + 1,
            winners_per_round: 1,
        };

        store.push_carry(task(r0, r1, 0));
        store.push_carry(task(r1, r2, 1));
        assert_eq!(store.pop_carry().unwrap().current_round_idx, 0);
        assert_eq!(store.pop_carry().unwrap().current_round_idx, 1);
        assert!(store.pop_carry().is_none());
    }
}
