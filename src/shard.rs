use crate::keepalive::LiveConnection;
use crate::types::TradingPair;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Assigned pairs of one shard plus the connection currently serving them.
///
/// Shared between the owning [`ShardSet`](crate::ShardSet) and the shard's job.
/// The lock is never held across an await.
#[derive(Debug)]
pub(crate) struct ShardSlot {
    index: usize,
    state: Mutex<SlotState>,
}

#[derive(Debug)]
struct SlotState {
    pairs: BTreeSet<TradingPair>,
    live: Option<LiveConnection>,
}

impl ShardSlot {
    pub(crate) fn new(index: usize, pairs: BTreeSet<TradingPair>) -> Self {
        Self {
            index,
            state: Mutex::new(SlotState { pairs, live: None }),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn trading_pairs(&self) -> BTreeSet<TradingPair> {
        self.state.lock().pairs.clone()
    }

    pub(crate) fn pair_count(&self) -> usize {
        self.state.lock().pairs.len()
    }

    /// Replace the assignment and push it into the live connection, if any.
    pub(crate) fn update_trading_pairs(&self, pairs: BTreeSet<TradingPair>) {
        let mut state = self.state.lock();
        if let Some(live) = &state.live {
            live.set_trading_pairs(pairs.clone());
        }
        state.pairs = pairs;
    }

    /// Make `live` the shard's connection. The connection is resynced with the
    /// assignment under the same lock, so a rebalance that landed between
    /// building the stream and attaching it is not lost.
    pub(crate) fn attach(&self, live: LiveConnection) {
        let mut state = self.state.lock();
        live.set_trading_pairs(state.pairs.clone());
        state.live = Some(live);
    }

    pub(crate) fn detach(&self) {
        self.state.lock().live = None;
    }

    pub(crate) fn is_live(&self) -> bool {
        self.state.lock().live.is_some()
    }
}

/// Outcome of [`plan_rebalance`]: what each shard should hold afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalancePlan {
    /// New assignment for existing shards whose membership changed
    pub updates: BTreeMap<usize, BTreeSet<TradingPair>>,
    /// Assignments for shards to create, in index order after the existing ones
    pub new_shards: Vec<BTreeSet<TradingPair>>,
    pub pairs_added: usize,
    pub pairs_removed: usize,
}

impl RebalancePlan {
    pub fn is_noop(&self) -> bool {
        self.updates.is_empty() && self.new_shards.is_empty()
    }
}

/// Deduplicate `pairs`, keeping first occurrences in order.
pub(crate) fn dedup_ordered(pairs: &[TradingPair]) -> Vec<TradingPair> {
    let mut seen = HashSet::with_capacity(pairs.len());
    pairs
        .iter()
        .filter(|p| seen.insert(*p))
        .cloned()
        .collect()
}

/// Split `desired` into consecutive chunks of at most `capacity` pairs.
pub fn partition(desired: &[TradingPair], capacity: usize) -> Vec<BTreeSet<TradingPair>> {
    dedup_ordered(desired)
        .chunks(capacity.max(1))
        .map(|chunk| chunk.iter().cloned().collect())
        .collect()
}

/// Least-loaded shard that still has room. Lowest index wins ties.
pub fn select_shard(planned: &[BTreeSet<TradingPair>], capacity: usize) -> Option<usize> {
    planned
        .iter()
        .enumerate()
        .filter(|(_, pairs)| pairs.len() < capacity)
        .min_by_key(|(index, pairs)| (pairs.len(), *index))
        .map(|(index, _)| index)
}

/// Plan the move from `current` assignments to `desired`.
///
/// Pairs no longer desired are dropped in place; pairs already assigned never
/// move. Each new pair goes to the least-loaded shard of the *planned* state,
/// so placement within one pass respects `capacity`. When no shard has room a
/// new shard is opened and takes part in later placements.
pub fn plan_rebalance(
    current: &[BTreeSet<TradingPair>],
    desired: &[TradingPair],
    capacity: usize,
) -> RebalancePlan {
    let capacity = capacity.max(1);
    let desired_set: HashSet<&TradingPair> = desired.iter().collect();

    let mut planned: Vec<BTreeSet<TradingPair>> = current
        .iter()
        .map(|pairs| {
            pairs
                .iter()
                .filter(|p| desired_set.contains(p))
                .cloned()
                .collect()
        })
        .collect();

    let pairs_removed: usize = current
        .iter()
        .zip(&planned)
        .map(|(before, after)| before.len() - after.len())
        .sum();

    let assigned: HashSet<&TradingPair> = current.iter().flatten().collect();
    let additions: Vec<TradingPair> = dedup_ordered(desired)
        .into_iter()
        .filter(|p| !assigned.contains(p))
        .collect();

    for pair in &additions {
        match select_shard(&planned, capacity) {
            Some(index) => {
                planned[index].insert(pair.clone());
            }
            None => planned.push(BTreeSet::from([pair.clone()])),
        }
    }

    let new_shards = planned.split_off(current.len());
    let updates = planned
        .into_iter()
        .enumerate()
        .filter(|(index, pairs)| *pairs != current[*index])
        .collect();

    RebalancePlan {
        updates,
        new_shards,
        pairs_added: additions.len(),
        pairs_removed,
    }
}
