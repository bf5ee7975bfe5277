//! Run-scoped state shared by every engine component.
//!
//! One `ShiftContext` is built per process invocation. It owns the wake
//! memo and the connection registry, so neither is a global; components
//! borrow it, and the batch mover shares it behind an `Arc`.

use std::sync::Arc;

use shift_core::ShiftConfig;
use shift_core::config::Timeouts;
use tokio_util::sync::CancellationToken;

use crate::directory::{DatabaseConnector, EnvironmentDirectory, TableCopier, TenantInventory};
use crate::error::ShiftResult;
use crate::mysql::MySqlConnector;
use crate::progress::{Reporter, TerminalReporter};
use crate::registry::ConnectionRegistry;
use crate::tables::DumpImportCopier;
use crate::terminus::TerminusDirectory;
use crate::wake::EnvironmentWakeCache;

pub struct ShiftContext {
    pub config: ShiftConfig,
    pub timeouts: Timeouts,
    pub directory: Arc<dyn EnvironmentDirectory>,
    pub inventory: Arc<dyn TenantInventory>,
    pub wake: EnvironmentWakeCache,
    pub registry: ConnectionRegistry,
    pub copier: Arc<dyn TableCopier>,
    pub reporter: Arc<dyn Reporter>,
    pub cancel: CancellationToken,
}

impl ShiftContext {
    pub fn builder(config: ShiftConfig) -> ShiftContextBuilder {
        ShiftContextBuilder {
            config,
            directory: None,
            inventory: None,
            connector: None,
            copier: None,
            reporter: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Assembles a [`ShiftContext`]. Unset collaborators default to the real
/// ones: terminus for lookup and inventory, sqlx for queries, and
/// mysqldump piped into mysql for table copies.
pub struct ShiftContextBuilder {
    config: ShiftConfig,
    directory: Option<Arc<dyn EnvironmentDirectory>>,
    inventory: Option<Arc<dyn TenantInventory>>,
    connector: Option<Arc<dyn DatabaseConnector>>,
    copier: Option<Arc<dyn TableCopier>>,
    reporter: Option<Arc<dyn Reporter>>,
    cancel: CancellationToken,
}

impl ShiftContextBuilder {
    pub fn directory(mut self, directory: Arc<dyn EnvironmentDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn inventory(mut self, inventory: Arc<dyn TenantInventory>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn DatabaseConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn copier(mut self, copier: Arc<dyn TableCopier>) -> Self {
        self.copier = Some(copier);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> ShiftResult<ShiftContext> {
        self.config.validate()?;
        let timeouts = self.config.timeouts.parse()?;
        let ttl = self.config.wake.ttl()?;

        let terminus = Arc::new(TerminusDirectory::new(
            &self.config.tools.terminus,
            self.config.remote.clone(),
            timeouts.lookup,
            self.cancel.clone(),
        ));
        let directory = self.directory.unwrap_or_else(|| terminus.clone());
        let inventory = self.inventory.unwrap_or(terminus);
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(MySqlConnector::new(timeouts.lookup, timeouts.database)));
        let copier = self.copier.unwrap_or_else(|| {
            Arc::new(DumpImportCopier::new(
                &self.config.tools.mysqldump,
                &self.config.tools.mysql,
                timeouts.database,
            ))
        });

        Ok(ShiftContext {
            wake: EnvironmentWakeCache::new(directory.clone(), ttl),
            registry: ConnectionRegistry::new(directory.clone(), connector),
            directory,
            inventory,
            copier,
            reporter: self.reporter.unwrap_or_else(|| Arc::new(TerminalReporter)),
            cancel: self.cancel,
            timeouts,
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryCluster, MemoryDirectory};

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = ShiftConfig::default();
        config.timeouts.transfer = "forever".to_string();
        assert!(ShiftContext::builder(config).build().is_err());
    }

    #[tokio::test]
    async fn overrides_are_used() {
        let cluster = MemoryCluster::new();
        let env = shift_core::EnvironmentRef::parse("a.live").unwrap();
        cluster.database(&env);
        let directory = Arc::new(MemoryDirectory::new());
        let ctx = ShiftContext::builder(ShiftConfig::default())
            .directory(directory.clone())
            .connector(Arc::new(cluster.connector()))
            .build()
            .unwrap();

        ctx.registry.get(&env).await.unwrap();
        assert_eq!(directory.lookup_count(&env), 1);
        assert_eq!(ctx.timeouts, Timeouts::default());
    }
}
