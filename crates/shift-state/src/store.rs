//! LedgerStore — redb-backed persistence of identifier-range allocations.
//!
//! All values are JSON-serialized into redb's `&[u8]` value column. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe ledger backed by redb.
#[derive(Clone)]
pub struct LedgerStore {
    db: Arc<Database>,
}

impl LedgerStore {
    /// Open (or create) a persistent ledger at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "ledger opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory ledger (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory ledger opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get the allocation of one site, if it has one.
    pub fn get_allocation(
        &self,
        scope: &AllocationScope,
        site: &str,
    ) -> StateResult<Option<RangeAllocation>> {
        let key = scope.key_for(site);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let alloc: RangeAllocation =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(alloc))
            }
            None => Ok(None),
        }
    }

    /// List every allocation in a scope, ordered by block.
    pub fn list_allocations(&self, scope: &AllocationScope) -> StateResult<Vec<RangeAllocation>> {
        let prefix = scope.key_prefix();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let alloc: RangeAllocation =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(alloc);
            }
        }
        results.sort_by_key(|a| a.block);
        Ok(results)
    }

    /// Give every site in `sites` a block, in list order.
    ///
    /// Sites that already hold a block keep it. New sites take the next
    /// block after the highest one handed out in the scope, never one of
    /// the first `reserved_blocks`. A scope keeps the block size of its
    /// first allocation; any other `block_size` is refused. Everything happens in one write
    /// transaction, so a re-run sees either all or none of a previous run.
    pub fn allocate(
        &self,
        scope: &AllocationScope,
        sites: &[String],
        block_size: u64,
        reserved_blocks: u64,
        now: u64,
    ) -> StateResult<Vec<RangeAllocation>> {
        if block_size == 0 {
            return Err(StateError::Policy("block_size must be positive".to_string()));
        }
        let prefix = scope.key_prefix();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut out = Vec::with_capacity(sites.len());
        {
            let mut table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;

            let mut next_block = reserved_blocks;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                if key.value().starts_with(&prefix) {
                    let alloc: RangeAllocation =
                        serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                    if alloc.range.size() != block_size {
                        return Err(StateError::Policy(format!(
                            "{} was allocated with block_size {}, not {block_size}",
                            scope.key_prefix().trim_end_matches(':'),
                            alloc.range.size()
                        )));
                    }
                    next_block = next_block.max(alloc.block.saturating_add(1));
                }
            }

            for site in sites {
                let key = scope.key_for(site);
                let existing = match table.get(key.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => Some(
                        serde_json::from_slice::<RangeAllocation>(guard.value())
                            .map_err(map_err!(Deserialize))?,
                    ),
                    None => None,
                };
                let alloc = match existing {
                    Some(alloc) => alloc,
                    None => {
                        let range = IdRange::block(next_block, block_size).ok_or_else(|| {
                            StateError::Policy(format!(
                                "block {next_block} of size {block_size} exceeds the identifier space"
                            ))
                        })?;
                        let alloc = RangeAllocation {
                            site: site.clone(),
                            block: next_block,
                            range,
                            allocated_at: now,
                            applied_auto_increment: None,
                        };
                        next_block += 1;
                        let value = serde_json::to_vec(&alloc).map_err(map_err!(Serialize))?;
                        table
                            .insert(key.as_str(), value.as_slice())
                            .map_err(map_err!(Write))?;
                        info!(%site, start = alloc.range.start, end = alloc.range.end, "range allocated");
                        alloc
                    }
                };
                out.push(alloc);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(out)
    }

    /// Record the auto-increment value written to a site.
    pub fn mark_applied(
        &self,
        scope: &AllocationScope,
        site: &str,
        auto_increment: u64,
    ) -> StateResult<()> {
        let key = scope.key_for(site);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
            let mut alloc: RangeAllocation = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(scope.key_for(site))),
            };
            alloc.applied_auto_increment = Some(auto_increment);
            let value = serde_json::to_vec(&alloc).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%site, auto_increment, "allocation applied");
        Ok(())
    }

    /// Forget a site's allocation. Returns true if it existed.
    pub fn release(&self, scope: &AllocationScope, site: &str) -> StateResult<bool> {
        let key = scope.key_for(site);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ALLOCATIONS).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "allocation released");
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> AllocationScope {
        AllocationScope::new("wpms-upstream", "live", "wp_blogs")
    }

    fn sites(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn allocate_assigns_contiguous_blocks_in_order() {
        let store = LedgerStore::open_in_memory().unwrap();
        let allocs = store
            .allocate(&scope(), &sites(&["a", "b", "c"]), 100_000, 1, 1000)
            .unwrap();

        assert_eq!(allocs[0].range, IdRange { start: 100_001, end: 200_000 });
        assert_eq!(allocs[1].range, IdRange { start: 200_001, end: 300_000 });
        assert_eq!(allocs[2].range, IdRange { start: 300_001, end: 400_000 });
        assert!(!allocs[0].range.overlaps(&allocs[1].range));
    }

    #[test]
    fn allocate_is_idempotent() {
        let store = LedgerStore::open_in_memory().unwrap();
        let first = store
            .allocate(&scope(), &sites(&["a", "b"]), 1000, 1, 1000)
            .unwrap();
        let second = store
            .allocate(&scope(), &sites(&["a", "b"]), 1000, 1, 2000)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn allocate_new_site_after_existing_regardless_of_order() {
        let store = LedgerStore::open_in_memory().unwrap();
        store
            .allocate(&scope(), &sites(&["b", "c"]), 1000, 1, 1000)
            .unwrap();
        // "a" sorts first in the inventory but must not steal an existing block.
        let allocs = store
            .allocate(&scope(), &sites(&["a", "b", "c"]), 1000, 1, 2000)
            .unwrap();
        assert_eq!(allocs[0].site, "a");
        assert_eq!(allocs[0].block, 3);
        assert_eq!(allocs[1].block, 1);
        assert_eq!(allocs[2].block, 2);
    }

    #[test]
    fn scopes_are_independent() {
        let store = LedgerStore::open_in_memory().unwrap();
        let other = AllocationScope::new("wpms-upstream", "dev", "wp_blogs");
        store.allocate(&scope(), &sites(&["a"]), 1000, 1, 1000).unwrap();
        let allocs = store.allocate(&other, &sites(&["a"]), 1000, 1, 1000).unwrap();
        assert_eq!(allocs[0].block, 1);
        assert_eq!(store.list_allocations(&scope()).unwrap().len(), 1);
    }

    #[test]
    fn zero_block_size_rejected() {
        let store = LedgerStore::open_in_memory().unwrap();
        let err = store.allocate(&scope(), &sites(&["a"]), 0, 1, 1000);
        assert!(matches!(err, Err(StateError::Policy(_))));
    }

    #[test]
    fn changed_block_size_is_refused() {
        let store = LedgerStore::open_in_memory().unwrap();
        store
            .allocate(&scope(), &sites(&["a", "b"]), 100_000, 1, 1000)
            .unwrap();

        let err = store.allocate(&scope(), &sites(&["c"]), 50_000, 1, 2000);
        assert!(matches!(err, Err(StateError::Policy(_))), "{err:?}");
        assert!(store.get_allocation(&scope(), "c").unwrap().is_none());

        let allocs = store
            .allocate(&scope(), &sites(&["a", "b", "c"]), 100_000, 1, 2000)
            .unwrap();
        for (i, x) in allocs.iter().enumerate() {
            for y in &allocs[i + 1..] {
                assert!(!x.range.overlaps(&y.range), "{:?} overlaps {:?}", x.range, y.range);
            }
        }
    }

    #[test]
    fn block_past_identifier_space_is_refused() {
        let store = LedgerStore::open_in_memory().unwrap();
        let err = store.allocate(&scope(), &sites(&["a"]), u64::MAX / 2, 4, 1000);
        assert!(matches!(err, Err(StateError::Policy(_))), "{err:?}");
    }

    #[test]
    fn mark_applied_and_release() {
        let store = LedgerStore::open_in_memory().unwrap();
        store.allocate(&scope(), &sites(&["a"]), 1000, 1, 1000).unwrap();

        store.mark_applied(&scope(), "a", 1001).unwrap();
        let alloc = store.get_allocation(&scope(), "a").unwrap().unwrap();
        assert_eq!(alloc.applied_auto_increment, Some(1001));

        assert!(matches!(
            store.mark_applied(&scope(), "zzz", 1),
            Err(StateError::NotFound(_))
        ));

        assert!(store.release(&scope(), "a").unwrap());
        assert!(!store.release(&scope(), "a").unwrap());
        assert!(store.get_allocation(&scope(), "a").unwrap().is_none());
    }

    #[test]
    fn ledger_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.redb");
        {
            let store = LedgerStore::open(&path).unwrap();
            store.allocate(&scope(), &sites(&["a"]), 1000, 1, 1000).unwrap();
        }
        let store = LedgerStore::open(&path).unwrap();
        let allocs = store.list_allocations(&scope()).unwrap();
        assert_eq!(allocs.len(), 1);
        assert_eq!(allocs[0].range.start, 1001);
    }
}
