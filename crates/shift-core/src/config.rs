//! shift.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::SqlIdent;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShiftConfig {
    pub tools: ToolsConfig,
    pub remote: RemoteConfig,
    pub staging: StagingConfig,
    pub database: DatabaseConfig,
    pub wake: WakeConfig,
    pub timeouts: TimeoutsConfig,
    pub coordination: CoordinationConfig,
    pub batch: BatchConfig,
}

/// External binaries. Each entry is a program name or an absolute path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub terminus: String,
    pub rsync: String,
    pub mysqldump: String,
    pub mysql: String,
    pub sftp: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            terminus: "terminus".to_string(),
            rsync: "rsync".to_string(),
            mysqldump: "mysqldump".to_string(),
            mysql: "mysql".to_string(),
            sftp: "sftp".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub ssh_port: u16,
    /// `{stage}` and `{uuid}` are substituted.
    pub host_template: String,
    pub user_template: String,
    /// Remote directory holding one sub-directory per tenant.
    pub files_root: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            ssh_port: 2222,
            host_template: "appserver.{stage}.{uuid}.drush.in".to_string(),
            user_template: "{stage}.{uuid}".to_string(),
            files_root: "files/sites".to_string(),
        }
    }
}

impl RemoteConfig {
    pub fn host_for(&self, stage: &str, uuid: &str) -> String {
        render(&self.host_template, stage, uuid)
    }

    pub fn user_for(&self, stage: &str, uuid: &str) -> String {
        render(&self.user_template, stage, uuid)
    }
}

fn render(template: &str, stage: &str, uuid: &str) -> String {
    template.replace("{stage}", stage).replace("{uuid}", uuid)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    pub root: PathBuf,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/tmp/files"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub table_prefix: String,
    /// Directory table name without the prefix.
    pub routing_table: String,
    pub routing_key: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            table_prefix: "wp_".to_string(),
            routing_table: "blogs".to_string(),
            routing_key: "blog_id".to_string(),
        }
    }
}

impl DatabaseConfig {
    /// Fully prefixed name of the directory table, e.g. `wp_blogs`.
    pub fn routing_table_ident(&self) -> CoreResult<SqlIdent> {
        SqlIdent::parse(&format!("{}{}", self.table_prefix, self.routing_table))
    }

    pub fn routing_key_ident(&self) -> CoreResult<SqlIdent> {
        SqlIdent::parse(&self.routing_key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    /// How long a wake stays trusted. `0s` never expires.
    pub ttl: String,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            ttl: "15m".to_string(),
        }
    }
}

impl WakeConfig {
    pub fn ttl(&self) -> CoreResult<Option<Duration>> {
        let ttl = parse_duration(&self.ttl)?;
        Ok((!ttl.is_zero()).then_some(ttl))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub enumerate: String,
    pub transfer: String,
    pub database: String,
    pub lookup: String,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            enumerate: "2h".to_string(),
            transfer: "12h".to_string(),
            database: "6h".to_string(),
            lookup: "2m".to_string(),
        }
    }
}

/// Parsed form of [`TimeoutsConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub enumerate: Duration,
    pub transfer: Duration,
    pub database: Duration,
    pub lookup: Duration,
}

impl TimeoutsConfig {
    pub fn parse(&self) -> CoreResult<Timeouts> {
        Ok(Timeouts {
            enumerate: parse_duration(&self.enumerate)?,
            transfer: parse_duration(&self.transfer)?,
            database: parse_duration(&self.database)?,
            lookup: parse_duration(&self.lookup)?,
        })
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        // Default strings are known-good.
        TimeoutsConfig::default().parse().unwrap_or(Timeouts {
            enumerate: Duration::from_secs(7200),
            transfer: Duration::from_secs(43_200),
            database: Duration::from_secs(21_600),
            lookup: Duration::from_secs(120),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Identifiers per tenant range.
    pub block_size: u64,
    /// Leading blocks left to identifiers created before coordination.
    pub reserved_blocks: u64,
    /// redb file recording allocated ranges.
    pub ledger: PathBuf,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            block_size: 100_000,
            reserved_blocks: 1,
            ledger: PathBuf::from("shift-ledger.redb"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_parallel: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_parallel: 2 }
    }
}

impl ShiftConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| CoreError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> CoreResult<Self> {
        if path.is_file() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> CoreResult<Self> {
        let config: ShiftConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would only fail later, mid-move.
    pub fn validate(&self) -> CoreResult<()> {
        self.timeouts.parse()?;
        self.wake.ttl()?;
        self.database.routing_table_ident()?;
        self.database.routing_key_ident()?;
        Ok(())
    }
}

/// Parse `<n>ms`, `<n>s`, `<n>m` or `<n>h`.
pub fn parse_duration(s: &str) -> CoreResult<Duration> {
    let s = s.trim();
    let err = || CoreError::InvalidDuration(s.to_string());
    let (digits, unit) = s
        .find(|c: char| !c.is_ascii_digit())
        .map(|i| s.split_at(i))
        .ok_or_else(err)?;
    let n: u64 = digits.parse().map_err(|_| err())?;
    let secs = |per: u64| n.checked_mul(per).map(Duration::from_secs).ok_or_else(err);
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => secs(60),
        "h" => secs(3600),
        _ => Err(err()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = ShiftConfig::from_toml("").unwrap();
        assert_eq!(config.remote.ssh_port, 2222);
        assert_eq!(config.database.table_prefix, "wp_");
        assert_eq!(config.coordination.block_size, 100_000);
        assert_eq!(config.staging.root, PathBuf::from("/tmp/files"));
    }

    #[test]
    fn test_parse_partial_section() {
        let toml_str = r#"
[tools]
rsync = "/usr/local/bin/rsync"

[wake]
ttl = "0s"
"#;
        let config = ShiftConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.tools.rsync, "/usr/local/bin/rsync");
        assert_eq!(config.tools.mysql, "mysql");
        assert_eq!(config.wake.ttl().unwrap(), None);
    }

    #[test]
    fn test_rejects_bad_duration() {
        let err = ShiftConfig::from_toml("[timeouts]\ntransfer = \"forever\"\n").unwrap_err();
        assert!(err.to_string().contains("forever"));
    }

    #[test]
    fn test_rejects_bad_routing_table() {
        assert!(ShiftConfig::from_toml("[database]\nrouting_table = \"blogs; --\"\n").is_err());
    }

    #[test]
    fn test_parse_duration_values() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("12h").unwrap(), Duration::from_secs(43_200));
        assert!(parse_duration("12").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("3d").is_err());
        assert!(parse_duration(&format!("{}h", u64::MAX)).is_err());
        assert!(parse_duration(&format!("{}m", u64::MAX / 30)).is_err());
    }

    #[test]
    fn test_remote_templates() {
        let remote = RemoteConfig::default();
        assert_eq!(
            remote.host_for("live", "abc-123"),
            "appserver.live.abc-123.drush.in"
        );
        assert_eq!(remote.user_for("live", "abc-123"), "live.abc-123");
    }

    #[test]
    fn test_routing_table_ident() {
        let db = DatabaseConfig::default();
        assert_eq!(db.routing_table_ident().unwrap().as_str(), "wp_blogs");
    }
}
