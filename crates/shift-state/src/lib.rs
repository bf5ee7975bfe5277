//! shift-state — persistent ledger for coordinated identifier ranges.
//!
//! Backed by [redb](https://docs.rs/redb). Each tenant site sharing an
//! upstream receives a disjoint block of row identifiers for one directory
//! table; the ledger remembers every block it has handed out so re-running
//! the coordination step never reassigns an existing range.
//!
//! # Architecture
//!
//! Allocations are JSON-serialized into redb's `&[u8]` value column under
//! composite keys `{upstream}/{stage}/{table}:{site}`, which keeps all
//! allocations of one scope adjacent for prefix scans.
//!
//! The `LedgerStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`).

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::LedgerStore;
pub use types::*;
