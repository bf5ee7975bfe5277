//! Database handles keyed by environment.
//!
//! A handle is opened on first use and reused for the rest of the run.
//! The map lock is held across the open, so concurrent first callers for
//! one environment share a single connection.

use std::collections::HashMap;
use std::sync::Arc;

use shift_core::EnvironmentRef;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::directory::{DatabaseConnector, EnvironmentDirectory, TenantDatabase};
use crate::error::ShiftResult;

pub struct ConnectionRegistry {
    directory: Arc<dyn EnvironmentDirectory>,
    connector: Arc<dyn DatabaseConnector>,
    handles: Mutex<HashMap<String, Arc<dyn TenantDatabase>>>,
}

impl ConnectionRegistry {
    pub fn new(
        directory: Arc<dyn EnvironmentDirectory>,
        connector: Arc<dyn DatabaseConnector>,
    ) -> Self {
        Self {
            directory,
            connector,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// The handle for `env`, opening it if needed.
    pub async fn get(&self, env: &EnvironmentRef) -> ShiftResult<Arc<dyn TenantDatabase>> {
        let key = env.to_string();
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(&key) {
            debug!(%env, "reusing database handle");
            return Ok(handle.clone());
        }

        let info = self.directory.connection_info(env).await?;
        let handle = self.connector.connect(&info).await?;
        info!(%env, host = %info.database.host, "database handle opened");
        handles.insert(key, handle.clone());
        Ok(handle)
    }

    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handles.lock().await.is_empty()
    }
}
