use std::collections::BTreeMap;
use std::path::Path;

use kvmap_model::FetchStrategy;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Datastore-wide settings.
///
/// ```toml
/// default_fetch = "eager"
/// first_level_cache = true
///
/// [connection]
/// host = "localhost"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatastoreConfig {
    /// Fetch strategy for collection associations that do not declare one.
    pub default_fetch: FetchStrategy,
    /// Whether sessions keep objects in an identity map between operations.
    pub first_level_cache: bool,
    /// Connection details merged under those passed to `connect`.
    pub connection: BTreeMap<String, String>,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            default_fetch: FetchStrategy::Lazy,
            first_level_cache: true,
            connection: BTreeMap::new(),
        }
    }
}

impl DatastoreConfig {
    pub fn from_toml_str(s: &str) -> EngineResult<Self> {
        toml::from_str(s).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> EngineResult<String> {
        toml::to_string(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// `details` layered over the configured connection defaults.
    pub fn merged_connection(&self, details: BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut merged = self.connection.clone();
        merged.extend(details);
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = DatastoreConfig::default();
        assert_eq!(config.default_fetch, FetchStrategy::Lazy);
        assert!(config.first_level_cache);
        assert!(config.connection.is_empty());
    }

    #[test]
    fn parses_partial_toml() {
        let config = DatastoreConfig::from_toml_str(
            r#"
            default_fetch = "eager"

            [connection]
            host = "localhost"
            "#,
        )
        .unwrap();
        assert_eq!(config.default_fetch, FetchStrategy::Eager);
        assert!(config.first_level_cache);
        assert_eq!(config.connection["host"], "localhost");
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        let err = DatastoreConfig::from_toml_str("default_fetch = \"sometimes\"").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn loads_from_file_and_round_trips() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "first_level_cache = false").unwrap();
        let config = DatastoreConfig::load(file.path()).unwrap();
        assert!(!config.first_level_cache);

        let text = config.to_toml_string().unwrap();
        assert_eq!(DatastoreConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn explicit_details_win() {
        let mut config = DatastoreConfig::default();
        config.connection.insert("host".into(), "a".into());
        config.connection.insert("port".into(), "1".into());
        let merged =
            config.merged_connection(BTreeMap::from([("host".to_string(), "b".to_string())]));
        assert_eq!(merged["host"], "b");
        assert_eq!(merged["port"], "1");
    }
}
