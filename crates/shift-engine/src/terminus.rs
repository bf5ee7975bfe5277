//! Environment lookup and inventory through the `terminus` CLI.
//!
//! Commands used:
//! - `terminus env:connection-info <site>.<stage> --format=json`
//! - `terminus site:info <site> --field=id`
//! - `terminus env:wake <site>.<stage>`
//! - `terminus site:list --upstream=<id> --fields=name --format=json`

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use shift_core::config::RemoteConfig;
use shift_core::{ConnectionInfo, DatabaseEndpoint, EnvironmentRef, FileEndpoint};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::directory::{EnvironmentDirectory, TenantInventory};
use crate::error::{ShiftError, ShiftResult};
use crate::process::{self, CommandSpec, RunControl};

pub struct TerminusDirectory {
    program: String,
    remote: RemoteConfig,
    timeout: Duration,
    cancel: CancellationToken,
}

impl TerminusDirectory {
    pub fn new(
        program: &str,
        remote: RemoteConfig,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            program: program.to_string(),
            remote,
            timeout,
            cancel,
        }
    }

    fn control(&self) -> RunControl {
        RunControl::new(self.timeout, self.cancel.clone())
    }

    async fn terminus(&self, args: &[String]) -> ShiftResult<Vec<u8>> {
        let spec = CommandSpec::new(&self.program).args(args.iter().cloned());
        process::capture(&spec, &self.control()).await
    }

    async fn site_uuid(&self, env: &EnvironmentRef) -> ShiftResult<String> {
        let out = self
            .terminus(&[
                "site:info".to_string(),
                env.site().to_string(),
                "--field=id".to_string(),
            ])
            .await
            .map_err(|e| lookup_error(env, e))?;
        let uuid = String::from_utf8_lossy(&out).trim().to_string();
        if uuid.is_empty() {
            return Err(ShiftError::Lookup {
                env: env.to_string(),
                message: "terminus returned an empty site id".to_string(),
            });
        }
        Ok(uuid)
    }
}

#[async_trait]
impl EnvironmentDirectory for TerminusDirectory {
    async fn connection_info(&self, env: &EnvironmentRef) -> ShiftResult<ConnectionInfo> {
        let uuid = self.site_uuid(env).await?;
        let out = self
            .terminus(&[
                "env:connection-info".to_string(),
                env.to_string(),
                "--format=json".to_string(),
            ])
            .await
            .map_err(|e| lookup_error(env, e))?;
        let info = parse_connection_info(&out, env, &uuid, &self.remote)?;
        debug!(%env, host = %info.database.host, "connection info resolved");
        Ok(info)
    }

    async fn wake(&self, env: &EnvironmentRef) -> ShiftResult<()> {
        info!(%env, "waking environment");
        self.terminus(&["env:wake".to_string(), env.to_string()])
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl TenantInventory for TerminusDirectory {
    async fn list_sites(&self, upstream: &str, stage: &str) -> ShiftResult<Vec<String>> {
        let out = self
            .terminus(&[
                "site:list".to_string(),
                format!("--upstream={upstream}"),
                "--fields=name".to_string(),
                "--format=json".to_string(),
            ])
            .await?;
        let sites = parse_site_list(&out).map_err(|message| ShiftError::Lookup {
            env: format!("{upstream} ({stage})"),
            message,
        })?;
        info!(%upstream, count = sites.len(), "sites listed");
        Ok(sites)
    }
}

fn lookup_error(env: &EnvironmentRef, e: ShiftError) -> ShiftError {
    match e {
        ShiftError::Cancelled(_) | ShiftError::TimedOut { .. } => e,
        other => ShiftError::Lookup {
            env: env.to_string(),
            message: other.to_string(),
        },
    }
}

#[derive(Debug, Deserialize)]
struct ConnectionInfoJson {
    mysql_host: String,
    #[serde(deserialize_with = "port_from_any")]
    mysql_port: u16,
    mysql_database: String,
    mysql_username: String,
    mysql_password: String,
}

/// terminus prints ports as numbers or strings depending on version.
fn port_from_any<'de, D: Deserializer<'de>>(de: D) -> Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }
    match Port::deserialize(de)? {
        Port::Number(n) => Ok(n),
        Port::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

pub(crate) fn parse_connection_info(
    json: &[u8],
    env: &EnvironmentRef,
    uuid: &str,
    remote: &RemoteConfig,
) -> ShiftResult<ConnectionInfo> {
    let raw: ConnectionInfoJson = serde_json::from_slice(json).map_err(|e| ShiftError::Lookup {
        env: env.to_string(),
        message: format!("unexpected connection-info output: {e}"),
    })?;
    Ok(ConnectionInfo {
        env: env.clone(),
        uuid: uuid.to_string(),
        database: DatabaseEndpoint {
            host: raw.mysql_host,
            port: raw.mysql_port,
            database: raw.mysql_database,
            username: raw.mysql_username,
            password: raw.mysql_password,
        },
        files: FileEndpoint {
            user: remote.user_for(env.stage(), uuid),
            host: remote.host_for(env.stage(), uuid),
            port: remote.ssh_port,
        },
    })
}

/// Accepts a JSON list of `{"name": ..}` rows or an object keyed by site id.
/// Sites come back in the order terminus listed them.
pub(crate) fn parse_site_list(json: &[u8]) -> Result<Vec<String>, String> {
    let value: serde_json::Value =
        serde_json::from_slice(json).map_err(|e| format!("unexpected site:list output: {e}"))?;
    let rows: Vec<&serde_json::Value> = match &value {
        serde_json::Value::Array(items) => items.iter().collect(),
        serde_json::Value::Object(map) => map.values().collect(),
        _ => return Err("site:list output is neither a list nor an object".to_string()),
    };
    rows.into_iter()
        .map(|row| {
            row.get("name")
                .and_then(|n| n.as_str())
                .map(str::to_string)
                .ok_or_else(|| format!("site:list row without a name: {row}"))
        })
        .collect()
}
