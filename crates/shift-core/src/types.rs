//! Shared types used across the shift crates.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::environment::EnvironmentRef;
use crate::error::CoreError;

/// One tenant's namespace inside a shared multi-tenant installation.
///
/// The id is spliced into table-name patterns and remote paths, so only
/// ASCII letters and digits are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CoreError::InvalidTenant(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name prefix shared by every table of this tenant, e.g. `wp_5_`.
    pub fn table_prefix(&self, prefix: &str) -> String {
        format!("{prefix}{}_", self.0)
    }

    /// `LIKE` pattern selecting this tenant's tables.
    ///
    /// `_` is a single-character wildcard in `LIKE`, so every literal
    /// underscore is escaped; otherwise `wp_12_%` would also match
    /// `wp_123_posts`.
    pub fn like_pattern(&self, prefix: &str) -> String {
        format!("{}%", escape_like(&self.table_prefix(prefix)))
    }

    /// Exact ownership test for a table name.
    pub fn owns_table(&self, prefix: &str, table: &str) -> bool {
        let own = self.table_prefix(prefix);
        table.len() > own.len() && table.starts_with(&own)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

impl std::str::FromStr for TenantId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Escape `\`, `%` and `_` for use inside a `LIKE` pattern.
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// A table or column name that is safe to splice into SQL text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SqlIdent(String);

impl SqlIdent {
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        if s.is_empty()
            || s.len() > 64
            || !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        {
            return Err(CoreError::InvalidIdentifier(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Backtick-quoted form.
    pub fn quoted(&self) -> String {
        format!("`{}`", self.0)
    }
}

impl fmt::Display for SqlIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The tables belonging to one tenant, in catalog order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSet(Vec<String>);

impl TableSet {
    pub fn new(tables: Vec<String>) -> Self {
        Self(tables)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// How to reach an environment's database.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseEndpoint {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for DatabaseEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Secure-shell endpoint used by the remote-copy tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEndpoint {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl FileEndpoint {
    /// `user@host`
    pub fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Everything the engine needs to talk to one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub env: EnvironmentRef,
    /// Site UUID used to build remote host names.
    pub uuid: String,
    pub database: DatabaseEndpoint,
    pub files: FileEndpoint,
}

/// A single column value, carried in the server's text representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    pub fn from_bytes(bytes: Option<Vec<u8>>) -> Self {
        match bytes {
            None => SqlValue::Null,
            Some(b) => match String::from_utf8(b) {
                Ok(s) => SqlValue::Text(s),
                Err(e) => SqlValue::Bytes(e.into_bytes()),
            },
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// The directory record for one tenant, columns in table order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRow {
    pub columns: Vec<(String, SqlValue)>,
}

impl RoutingRow {
    pub fn new(columns: Vec<(String, SqlValue)>) -> Self {
        Self { columns }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, v)| v)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &SqlValue> {
        self.columns.iter().map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_rejects_injection() {
        assert!(TenantId::parse("5").is_ok());
        assert!(TenantId::parse("abc42").is_ok());
        assert!(TenantId::parse("").is_err());
        assert!(TenantId::parse("5; DROP TABLE wp_blogs").is_err());
        assert!(TenantId::parse("../6").is_err());
        assert!(TenantId::parse("5_").is_err());
    }

    #[test]
    fn test_like_pattern_escapes_underscores() {
        let id = TenantId::parse("12").unwrap();
        assert_eq!(id.like_pattern("wp_"), r"wp\_12\_%");
    }

    #[test]
    fn test_owns_table_is_exact() {
        let id = TenantId::parse("12").unwrap();
        assert!(id.owns_table("wp_", "wp_12_posts"));
        assert!(!id.owns_table("wp_", "wp_123_posts"));
        assert!(!id.owns_table("wp_", "wp_12_"));
        assert!(!id.owns_table("wp_", "wp_1_posts"));
    }

    #[test]
    fn test_sql_ident() {
        assert_eq!(SqlIdent::parse("wp_blogs").unwrap().quoted(), "`wp_blogs`");
        assert!(SqlIdent::parse("wp blogs").is_err());
        assert!(SqlIdent::parse("x`; --").is_err());
    }

    #[test]
    fn test_sql_value_from_bytes() {
        assert_eq!(SqlValue::from_bytes(None), SqlValue::Null);
        assert_eq!(
            SqlValue::from_bytes(Some(b"a.example".to_vec())),
            SqlValue::Text("a.example".to_string())
        );
        assert_eq!(
            SqlValue::from_bytes(Some(vec![0xff, 0x00])),
            SqlValue::Bytes(vec![0xff, 0x00])
        );
    }

    #[test]
    fn test_password_not_in_debug() {
        let db = DatabaseEndpoint {
            host: "db".into(),
            port: 3306,
            database: "pantheon".into(),
            username: "pantheon".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{db:?}").contains("hunter2"));
    }
}
