//! Parsing of configuration key paths.
//!
//! Keys look like `datadog/<org_id>/<PRODUCT>/<config_id>/<name>`,
//! `employee/<PRODUCT>/<config_id>/<name>`, or more generally
//! `<org>[/<n>]/<PRODUCT>/<config_id>/<name>`.

use std::fmt;
use std::hash::{Hash, Hasher};

use thiserror::Error;

use crate::product::Product;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigKeyError {
    #[error("config key '{0}' has wrong format")]
    WrongFormat(String),
    #[error("config key '{path}' has an empty {segment} segment")]
    EmptySegment { path: String, segment: &'static str },
}

/// One parsed configuration key. Equality and hashing use the raw path.
#[derive(Debug, Clone)]
pub struct ConfigKey {
    path: String,
    org: String,
    version: Option<u64>,
    product_name: String,
    product: Product,
    config_id: String,
    name: String,
}

impl ConfigKey {
    pub fn parse(path: &str) -> Result<Self, ConfigKeyError> {
        let segments: Vec<&str> = path.split('/').collect();
        let (org, version, rest) = match segments.as_slice() {
            [org, version, rest @ ..] if rest.len() == 3 => {
                let version: u64 = version
                    .parse()
                    .map_err(|_| ConfigKeyError::WrongFormat(path.to_string()))?;
                (*org, Some(version), rest)
            }
            [org, rest @ ..] if rest.len() == 3 => (*org, None, rest),
            _ => return Err(ConfigKeyError::WrongFormat(path.to_string())),
        };

        for (segment, value) in [
            ("org", org),
            ("product", rest[0]),
            ("config id", rest[1]),
            ("name", rest[2]),
        ] {
            if value.is_empty() {
                return Err(ConfigKeyError::EmptySegment {
                    path: path.to_string(),
                    segment,
                });
            }
        }

        Ok(Self {
            path: path.to_string(),
            org: org.to_string(),
            version,
            product_name: rest[0].to_string(),
            product: Product::from_name(rest[0]),
            config_id: rest[1].to_string(),
            name: rest[2].to_string(),
        })
    }

    /// Full key path, as sent by the server and used to look up targets.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    /// Numeric segment following the org (the org id for `datadog/<n>/..` keys).
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    /// Product segment exactly as written in the path.
    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    pub fn product(&self) -> Product {
        self.product
    }

    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for ConfigKey {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for ConfigKey {}

impl Hash for ConfigKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_datadog_keys() {
        let key = ConfigKey::parse("datadog/12345/APM_TRACING/config/pkg1.json").unwrap();
        assert_eq!(key.org(), "datadog");
        assert_eq!(key.version(), Some(12345));
        assert_eq!(key.product(), Product::ApmTracing);
        assert_eq!(key.config_id(), "config");
        assert_eq!(key.name(), "pkg1.json");
    }

    #[test]
    fn parses_employee_and_generic_keys() {
        let key = ConfigKey::parse("employee/ASM_DD/rules/config").unwrap();
        assert_eq!(key.org(), "employee");
        assert_eq!(key.version(), None);
        assert_eq!(key.product(), Product::AsmDd);

        let key = ConfigKey::parse("cfg/PRODUCT_X/id1/config").unwrap();
        assert_eq!(key.product_name(), "PRODUCT_X");
        assert!(key.product().is_unknown());
        assert_eq!(key.config_id(), "id1");
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(matches!(
            ConfigKey::parse("datadog/APM_TRACING/config"),
            Err(ConfigKeyError::WrongFormat(_))
        ));
        assert!(matches!(
            ConfigKey::parse("datadog/abc/APM_TRACING/config/name"),
            Err(ConfigKeyError::WrongFormat(_))
        ));
        assert!(matches!(
            ConfigKey::parse("employee//id/config"),
            Err(ConfigKeyError::EmptySegment {
                segment: "product",
                ..
            })
        ));
    }

    #[test]
    fn equality_follows_the_raw_path() {
        let a = ConfigKey::parse("employee/ASM/a/config").unwrap();
        let b = ConfigKey::parse("employee/ASM/a/config").unwrap();
        let c = ConfigKey::parse("employee/ASM/b/config").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "employee/ASM/a/config");
    }
}
