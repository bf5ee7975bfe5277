//! `<site>.<stage>` environment references.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A (site, deployment stage) pair such as `mysite.live`.
///
/// Caches keyed by environment compare the rendered `site.stage` string, so
/// two references are the same environment exactly when they print the same.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EnvironmentRef {
    site: String,
    stage: String,
}

impl EnvironmentRef {
    pub fn new(site: &str, stage: &str) -> Result<Self, CoreError> {
        if !valid_segment(site) || !valid_segment(stage) {
            return Err(CoreError::InvalidEnvironment(format!("{site}.{stage}")));
        }
        Ok(Self {
            site: site.to_string(),
            stage: stage.to_string(),
        })
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let (site, stage) = s
            .split_once('.')
            .ok_or_else(|| CoreError::InvalidEnvironment(s.to_string()))?;
        Self::new(site, stage).map_err(|_| CoreError::InvalidEnvironment(s.to_string()))
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }
}

/// Site and stage names are lowercase slugs on the hosting platform.
fn valid_segment(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl fmt::Display for EnvironmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.site, self.stage)
    }
}

impl FromStr for EnvironmentRef {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EnvironmentRef {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<EnvironmentRef> for String {
    fn from(env: EnvironmentRef) -> Self {
        env.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_site_and_stage() {
        let env = EnvironmentRef::parse("mysite.live").unwrap();
        assert_eq!(env.site(), "mysite");
        assert_eq!(env.stage(), "live");
        assert_eq!(env.to_string(), "mysite.live");
    }

    #[test]
    fn test_parse_rejects_missing_stage() {
        assert!(EnvironmentRef::parse("mysite").is_err());
        assert!(EnvironmentRef::parse("mysite.").is_err());
        assert!(EnvironmentRef::parse(".live").is_err());
    }

    #[test]
    fn test_parse_rejects_extra_segments() {
        assert!(EnvironmentRef::parse("my.site.live").is_err());
        assert!(EnvironmentRef::parse("mysite.live;rm").is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let env = EnvironmentRef::parse("a-site.dev").unwrap();
        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(json, "\"a-site.dev\"");
        let back: EnvironmentRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }
}
