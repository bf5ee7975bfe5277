//! redb table definitions for the ledger.

use redb::TableDefinition;

/// Range allocations keyed by `{upstream}/{stage}/{table}:{site}`.
pub const ALLOCATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("allocations");
