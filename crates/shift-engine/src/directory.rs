//! Collaborator seams: environment lookup, tenant inventory, database
//! access, and bulk table copy.
//!
//! The engine only talks to the hosting platform and to MySQL through
//! these traits. Real implementations live in [`crate::terminus`],
//! [`crate::mysql`] and [`crate::tables`]; in-memory ones in
//! [`crate::testing`].

use std::sync::Arc;

use async_trait::async_trait;
use shift_core::{ConnectionInfo, EnvironmentRef, RoutingRow, SqlIdent, TableSet, TenantId};
use tokio_util::sync::CancellationToken;

use crate::error::ShiftResult;

/// Resolves environments to connection details and wakes them.
#[async_trait]
pub trait EnvironmentDirectory: Send + Sync {
    /// Fetch fresh connection details. Not cached by the engine.
    async fn connection_info(&self, env: &EnvironmentRef) -> ShiftResult<ConnectionInfo>;

    /// Ask the platform to bring a possibly sleeping environment up.
    async fn wake(&self, env: &EnvironmentRef) -> ShiftResult<()>;
}

/// Lists the tenant sites provisioned from one upstream.
#[async_trait]
pub trait TenantInventory: Send + Sync {
    async fn list_sites(&self, upstream: &str, stage: &str) -> ShiftResult<Vec<String>>;
}

/// An open database handle for one environment.
#[async_trait]
pub trait TenantDatabase: Send + Sync {
    /// Table names matching a `LIKE` pattern (`\` escapes), catalog order.
    async fn tables_like(&self, pattern: &str) -> ShiftResult<Vec<String>>;

    /// The row whose `key` column equals the tenant id.
    async fn fetch_row(
        &self,
        table: &SqlIdent,
        key: &SqlIdent,
        tenant: &TenantId,
    ) -> ShiftResult<Option<RoutingRow>>;

    /// Insert `row`, replacing any row with the same primary key.
    async fn replace_row(&self, table: &SqlIdent, row: &RoutingRow) -> ShiftResult<()>;

    /// Largest value in `column`, `None` for an empty table.
    async fn max_id(&self, table: &SqlIdent, column: &SqlIdent) -> ShiftResult<Option<u64>>;

    /// Set the next auto-increment value of `table`.
    async fn set_auto_increment(&self, table: &SqlIdent, next: u64) -> ShiftResult<()>;
}

/// Opens database handles from connection details.
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    async fn connect(&self, info: &ConnectionInfo) -> ShiftResult<Arc<dyn TenantDatabase>>;
}

/// Copies a set of tables from one environment's database to another's.
#[async_trait]
pub trait TableCopier: Send + Sync {
    async fn copy_tables(
        &self,
        source: &ConnectionInfo,
        dest: &ConnectionInfo,
        tables: &TableSet,
        cancel: &CancellationToken,
    ) -> ShiftResult<()>;
}
