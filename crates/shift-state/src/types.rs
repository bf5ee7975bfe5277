//! Domain types persisted in the ledger.

use serde::{Deserialize, Serialize};

/// The set of tenants that share one identifier space: every site built
/// from `upstream`, on `stage`, for directory table `table`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationScope {
    pub upstream: String,
    pub stage: String,
    pub table: String,
}

impl AllocationScope {
    pub fn new(upstream: &str, stage: &str, table: &str) -> Self {
        Self {
            upstream: upstream.to_string(),
            stage: stage.to_string(),
            table: table.to_string(),
        }
    }

    /// Prefix shared by every key in this scope.
    pub fn key_prefix(&self) -> String {
        format!("{}/{}/{}:", self.upstream, self.stage, self.table)
    }

    pub fn key_for(&self, site: &str) -> String {
        format!("{}{site}", self.key_prefix())
    }
}

/// Inclusive identifier range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub start: u64,
    pub end: u64,
}

impl IdRange {
    /// Block `index` of `block_size` identifiers; block 0 starts at 1.
    /// `None` when the block does not fit in `u64`.
    pub fn block(index: u64, block_size: u64) -> Option<Self> {
        let end = index.checked_add(1)?.checked_mul(block_size)?;
        Some(Self {
            start: end.checked_sub(block_size)? + 1,
            end,
        })
    }

    /// Number of identifiers in the range.
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, id: u64) -> bool {
        (self.start..=self.end).contains(&id)
    }

    pub fn overlaps(&self, other: &IdRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// One site's block in a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeAllocation {
    pub site: String,
    pub block: u64,
    pub range: IdRange,
    /// Unix timestamp (seconds) of the allocation.
    pub allocated_at: u64,
    /// Auto-increment value last written to the site, if any.
    pub applied_auto_increment: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_adjacent() {
        assert_eq!(IdRange::block(0, 10), Some(IdRange { start: 1, end: 10 }));
        assert_eq!(IdRange::block(3, 10), Some(IdRange { start: 31, end: 40 }));
        assert_eq!(IdRange::block(3, 10).map(|r| r.size()), Some(10));
    }

    #[test]
    fn oversized_block_is_none() {
        assert_eq!(IdRange::block(1, u64::MAX), None);
        assert_eq!(IdRange::block(u64::MAX, 1), None);
    }
}
