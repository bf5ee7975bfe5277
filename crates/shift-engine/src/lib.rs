//! shift-engine — moves one tenant of a multi-tenant site to another site.
//!
//! A move copies the tenant's tables, its routing row, and its uploaded
//! files from a source environment to a destination environment. The
//! platform and MySQL are reached through the traits in [`directory`];
//! the file servers through rsync and sftp child processes.
//!
//! # Architecture
//!
//! - [`context::ShiftContext`] owns the run-scoped caches
//!   ([`wake::EnvironmentWakeCache`], [`registry::ConnectionRegistry`]) and
//!   the collaborators. Components borrow it.
//! - [`tables::TableTransferEngine`] discovers, copies and re-points tables.
//! - [`sync::ManifestFileSync`] runs the enumerate/count/transfer file sync.
//! - [`coordinate::CoordinationPlanner`] hands out identifier ranges.
//! - [`mover`] sequences a full move and runs batches of them.
//! - [`process`] spawns every external tool with a deadline and a
//!   cancellation token, killing the whole process group on either.
//!
//! Unix only: child process groups are required.

pub mod context;
pub mod coordinate;
pub mod directory;
pub mod error;
pub mod mover;
pub mod mysql;
pub mod process;
pub mod progress;
pub mod registry;
pub mod sync;
pub mod tables;
pub mod terminus;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod wake;

pub use context::{ShiftContext, ShiftContextBuilder};
pub use coordinate::{CoordinationPlanner, CoordinationReport, ProbeStatus};
pub use error::{ShiftError, ShiftResult};
pub use mover::{MoveOptions, MoveReport, TenantMover, move_many};
pub use progress::{Reporter, TerminalReporter, lines_completed};
pub use registry::ConnectionRegistry;
pub use sync::{ManifestFileSync, SyncPhase, SyncReport};
pub use tables::TableTransferEngine;
pub use wake::{EnvironmentWakeCache, WakeOutcome};
