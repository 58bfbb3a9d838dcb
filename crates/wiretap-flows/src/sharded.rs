//! Flow table split into independently locked shards
//!
//! Each pipeline worker owns one shard, and packets are routed by
//! `shard_for`, so a flow is only ever touched by a single worker.

use crate::flow::{Flow, FlowKey};
use crate::table::{FlowTable, FlowTableConfig};
use parking_lot::{Mutex, MutexGuard};

pub struct ShardedFlowTable<S> {
    shards: Vec<Mutex<FlowTable<S>>>,
}

impl<S> ShardedFlowTable<S> {
    /// `config.max_flows` is the total across all shards
    pub fn new(config: FlowTableConfig, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let per_shard = config.max_flows.div_ceil(shard_count).max(1);
        let shards = (0..shard_count)
            .map(|i| {
                let cfg = FlowTableConfig {
                    max_flows: per_shard,
                    ..config.clone()
                };
                Mutex::new(FlowTable::with_ids(cfg, i as u64 + 1, shard_count as u64))
            })
            .collect();
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard responsible for a flow
    pub fn shard_for(&self, key: &FlowKey) -> usize {
        (key.shard_hash() % self.shards.len() as u64) as usize
    }

    pub fn lock(&self, shard: usize) -> MutexGuard<'_, FlowTable<S>> {
        self.shards[shard % self.shards.len()].lock()
    }

    /// Total tracked flows
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every flow from every shard
    pub fn drain_all(&self) -> Vec<Flow<S>> {
        self.shards
            .iter()
            .flat_map(|shard| shard.lock().drain())
            .collect()
    }
}
