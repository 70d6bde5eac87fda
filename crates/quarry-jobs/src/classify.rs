//! Partition-count policy for a query.
//!
//! Rows only keep a global order when they are read back through a single
//! partition. A query mentioning `ORDER BY` anywhere is read through one
//! partition; everything else is read in parallel.
//!
//! This is a textual heuristic. `ORDER BY` inside a subquery or a window
//! function also forces a single partition, which costs throughput but never
//! correctness.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ORDER_BY_RE: Regex = Regex::new(r"(?ims)\border\s+by\b").expect("valid regex");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionPolicy {
    RequiresSingleOrderedPartition,
    AllowsParallelPartitions,
}

impl PartitionPolicy {
    /// Partitions to request from a read session.
    pub fn partition_count(self, max_parallel: u32) -> u32 {
        match self {
            PartitionPolicy::RequiresSingleOrderedPartition => 1,
            PartitionPolicy::AllowsParallelPartitions => max_parallel.max(1),
        }
    }
}

pub fn classify_query(sql: &str) -> PartitionPolicy {
    if ORDER_BY_RE.is_match(sql) {
        PartitionPolicy::RequiresSingleOrderedPartition
    } else {
        PartitionPolicy::AllowsParallelPartitions
    }
}
