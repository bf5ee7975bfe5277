//! [`TenantDatabase`] over a sqlx MySQL pool.
//!
//! A failed query is logged at `warn` and returned as
//! [`ShiftError::Database`]; it never takes the process down, so one
//! unreachable tenant does not end a long coordination run.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shift_core::{ConnectionInfo, RoutingRow, SqlIdent, SqlValue, TenantId};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row};
use tracing::{debug, warn};

use crate::directory::{DatabaseConnector, TenantDatabase};
use crate::error::{ShiftError, ShiftResult};

/// Opens a small pool per environment.
pub struct MySqlConnector {
    connect_timeout: Duration,
    query_timeout: Duration,
}

impl MySqlConnector {
    pub fn new(connect_timeout: Duration, query_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            query_timeout,
        }
    }
}

#[async_trait]
impl DatabaseConnector for MySqlConnector {
    async fn connect(&self, info: &ConnectionInfo) -> ShiftResult<Arc<dyn TenantDatabase>> {
        let db = &info.database;
        let options = MySqlConnectOptions::new()
            .host(&db.host)
            .port(db.port)
            .username(&db.username)
            .password(&db.password)
            .database(&db.database);
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(self.connect_timeout)
            .connect_with(options)
            .await
            .map_err(|e| {
                warn!(env = %info.env, host = %db.host, error = %e, "database connect failed");
                ShiftError::Database {
                    env: info.env.to_string(),
                    message: e.to_string(),
                }
            })?;
        Ok(Arc::new(MySqlDatabase {
            env: info.env.to_string(),
            pool,
            timeout: self.query_timeout,
        }))
    }
}

pub struct MySqlDatabase {
    env: String,
    pool: MySqlPool,
    timeout: Duration,
}

impl MySqlDatabase {
    /// Apply the query deadline and turn failures into logged warnings.
    async fn guarded<T>(
        &self,
        what: &str,
        fut: impl Future<Output = Result<T, sqlx::Error>>,
    ) -> ShiftResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => {
                warn!(env = %self.env, query = what, error = %e, "query failed");
                Err(ShiftError::Database {
                    env: self.env.clone(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                warn!(env = %self.env, query = what, "query timed out");
                Err(ShiftError::TimedOut {
                    tool: format!("mysql ({what})"),
                    after: self.timeout,
                })
            }
        }
    }
}

/// An empty result is not an error for lookups that may find nothing.
fn optional<T>(result: Result<T, sqlx::Error>) -> Result<Option<T>, sqlx::Error> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(sqlx::Error::RowNotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Read every column of a text-protocol row as raw bytes.
fn row_from_text(env: &str, row: &MySqlRow) -> ShiftResult<RoutingRow> {
    let mut columns = Vec::with_capacity(row.columns().len());
    for (i, column) in row.columns().iter().enumerate() {
        let raw: Option<Vec<u8>> =
            row.try_get_unchecked(i)
                .map_err(|e| ShiftError::Database {
                    env: env.to_string(),
                    message: format!("column {}: {e}", column.name()),
                })?;
        columns.push((column.name().to_string(), SqlValue::from_bytes(raw)));
    }
    Ok(RoutingRow::new(columns))
}

#[async_trait]
impl TenantDatabase for MySqlDatabase {
    async fn tables_like(&self, pattern: &str) -> ShiftResult<Vec<String>> {
        let rows = self
            .guarded(
                "tables_like",
                sqlx::query(
                    "SELECT TABLE_NAME FROM information_schema.TABLES \
                     WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME LIKE ? \
                     ORDER BY TABLE_NAME",
                )
                .bind(pattern)
                .fetch_all(&self.pool),
            )
            .await?;
        rows.iter()
            .map(|row| {
                row.try_get_unchecked::<String, _>(0)
                    .map_err(|e| ShiftError::Database {
                        env: self.env.clone(),
                        message: e.to_string(),
                    })
            })
            .collect()
    }

    async fn fetch_row(
        &self,
        table: &SqlIdent,
        key: &SqlIdent,
        tenant: &TenantId,
    ) -> ShiftResult<Option<RoutingRow>> {
        // Text protocol so every column decodes as its string form. The
        // tenant id is alphanumeric, so the literal cannot break out.
        let sql = format!(
            "SELECT * FROM {} WHERE {} = '{}' LIMIT 1",
            table.quoted(),
            key.quoted(),
            tenant
        );
        let row = self
            .guarded("fetch_row", async {
                optional(sqlx::raw_sql(&sql).fetch_one(&self.pool).await)
            })
            .await?;
        row.map(|row| row_from_text(&self.env, &row)).transpose()
    }

    async fn replace_row(&self, table: &SqlIdent, row: &RoutingRow) -> ShiftResult<()> {
        let mut columns = Vec::new();
        for name in row.column_names() {
            columns.push(SqlIdent::parse(name)?.quoted());
        }
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "REPLACE INTO {} ({}) VALUES ({placeholders})",
            table.quoted(),
            columns.join(", ")
        );
        let mut query = sqlx::query(&sql);
        for value in row.values() {
            query = match value {
                SqlValue::Null => query.bind(None::<String>),
                SqlValue::Text(s) => query.bind(s.clone()),
                SqlValue::Bytes(b) => query.bind(b.clone()),
            };
        }
        let done = self.guarded("replace_row", query.execute(&self.pool)).await?;
        debug!(env = %self.env, %table, affected = done.rows_affected(), "row replaced");
        Ok(())
    }

    async fn max_id(&self, table: &SqlIdent, column: &SqlIdent) -> ShiftResult<Option<u64>> {
        let sql = format!(
            "SELECT CAST(MAX({}) AS UNSIGNED) FROM {}",
            column.quoted(),
            table.quoted()
        );
        self.guarded(
            "max_id",
            sqlx::query_scalar::<_, Option<u64>>(&sql).fetch_one(&self.pool),
        )
        .await
    }

    async fn set_auto_increment(&self, table: &SqlIdent, next: u64) -> ShiftResult<()> {
        let sql = format!("ALTER TABLE {} AUTO_INCREMENT = {next}", table.quoted());
        self.guarded("set_auto_increment", sqlx::raw_sql(&sql).execute(&self.pool))
            .await?;
        debug!(env = %self.env, %table, next, "auto-increment set");
        Ok(())
    }
}
