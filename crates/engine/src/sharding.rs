//! Shard ownership.
//!
//! The reconciliation workload is partitioned by business id into
//! `total` shards. A [`ShardingStrategy`] tells an instance which shards it
//! should try to work; the distributed lock still arbitrates each shard, so
//! overlapping assignments are safe, only wasteful.

/// One partition of the reconciliation workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardId {
    pub index: u32,
    pub total: u32,
}

impl ShardId {
    /// `total` is clamped to at least one and `index` into `0..total`.
    pub fn new(index: u32, total: u32) -> Self {
        let total = total.max(1);
        Self {
            index: index.min(total - 1),
            total,
        }
    }

    /// Modulus to use in storage queries; never zero.
    pub fn modulus(&self) -> i64 {
        self.total.max(1) as i64
    }

    /// Whether rows of `biz_id` belong to this shard.
    pub fn contains(&self, biz_id: i64) -> bool {
        shard_of(biz_id, self.total) == self.index
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.index)
    }
}

/// Shard index of a business id. Business ids are positive, which keeps this
/// consistent with SQL `MOD(biz_id, total)`.
pub fn shard_of(biz_id: i64, total: u32) -> u32 {
    biz_id.rem_euclid(total.max(1) as i64) as u32
}

pub trait ShardingStrategy: Send + Sync {
    /// Shards this instance currently owns.
    fn owned_shards(&self) -> Vec<ShardId>;
}

/// Static round-robin assignment: instance `i` of `n` owns every shard `s`
/// with `s % n == i`.
#[derive(Debug, Clone)]
pub struct StaticSharding {
    instance_index: u32,
    instance_count: u32,
    total_shards: u32,
}

impl StaticSharding {
    pub fn new(instance_index: u32, instance_count: u32, total_shards: u32) -> Self {
        Self {
            instance_index,
            instance_count: instance_count.max(1),
            total_shards: total_shards.max(1),
        }
    }

    /// A single instance owning every shard.
    pub fn single(total_shards: u32) -> Self {
        Self::new(0, 1, total_shards)
    }
}

impl ShardingStrategy for StaticSharding {
    fn owned_shards(&self) -> Vec<ShardId> {
        (0..self.total_shards)
            .filter(|shard| shard % self.instance_count == self.instance_index)
            .map(|shard| ShardId::new(shard, self.total_shards))
            .collect()
    }
}
