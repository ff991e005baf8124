//! YAML configuration for the MDM core.
//!
//! One file carries the matching rules, the link storage backend and the
//! logging setup:
//!
//! ```yaml
//! version: "1.0"
//! name: patient-matching
//!
//! rules:
//!   mdm_types: [Patient]
//!   candidate_search_params:
//!     - { resource_type: Patient, search_params: [given, family] }
//!   candidate_filter_params:
//!     - { resource_type: Patient, search_param: active, fixed_value: "true" }
//!   eid_systems:
//!     Patient: http://company.io/fhir/NamingSystem/custom-eid-system
//!   match_threshold: 0.8
//!   possible_match_threshold: 0.5
//!   match_fields:
//!     - name: given
//!       resource_type: Patient
//!       resource_path: name.given
//!       matcher: { algorithm: SIMILARITY, metric: JARO_WINKLER, match_threshold: 0.8 }
//!     - name: family
//!       resource_type: Patient
//!       resource_path: name.family
//!       matcher: { algorithm: STRING }
//!   match_result_map:
//!     "given,family": MATCH
//!
//! storage:
//!   backend: redb
//!   path: /data/links.redb
//!
//! logging:
//!   level: info
//!   json: false
//! ```

use std::fs;
use std::path::Path;

use link::{LinkBackendConfig, LinkError, MdmRules};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when loading YAML configuration files
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported config version: {0}")]
    UnsupportedVersion(String),
}

impl From<LinkError> for ConfigLoadError {
    fn from(err: LinkError) -> Self {
        ConfigLoadError::Validation(err.to_string())
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdmConfig {
    /// Configuration format version
    pub version: String,

    #[serde(default)]
    pub name: Option<String>,

    pub rules: MdmRules,

    /// Link storage; in memory unless configured.
    #[serde(default)]
    pub storage: LinkBackendConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MdmConfig {
    /// Configuration with in-memory storage and default logging.
    pub fn new(rules: MdmRules) -> Self {
        Self {
            version: "1.0".to_string(),
            name: None,
            rules,
            storage: LinkBackendConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load a YAML configuration file from the given path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse YAML configuration from a string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigLoadError> {
        let config: MdmConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        match self.version.as_str() {
            "1.0" | "1" => Ok(()),
            v => Err(ConfigLoadError::UnsupportedVersion(v.to_string())),
        }?;

        self.rules.validate()?;
        self.logging.validate()?;
        if let LinkBackendConfig::Redb { path } = &self.storage {
            if path.trim().is_empty() {
                return Err(ConfigLoadError::Validation(
                    "storage.path must not be empty for the redb backend".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Log output settings. `RUST_LOG` takes precedence over `level`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,

    /// One JSON object per event instead of human-readable lines.
    #[serde(default)]
    pub json: bool,
}

impl LoggingConfig {
    fn validate(&self) -> Result<(), ConfigLoadError> {
        match self.level.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" | "off" => Ok(()),
            other => Err(ConfigLoadError::Validation(format!(
                "logging.level `{other}` is not one of trace, debug, info, warn, error, off"
            ))),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use matcher::{MatchResult, MatcherKind, SimilarityMetric};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const PATIENT_YAML: &str = r#"
version: "1.0"
name: "patient matching"
rules:
  mdm_types: [Patient]
  candidate_search_params:
    - { resource_type: Patient, search_params: [given, family] }
  candidate_filter_params:
    - { resource_type: Patient, search_param: active, fixed_value: "true" }
  eid_systems:
    Patient: http://company.io/fhir/NamingSystem/custom-eid-system
  match_threshold: 0.9
  match_fields:
    - name: given
      resource_type: Patient
      resource_path: name.given
      matcher: { algorithm: SIMILARITY, metric: JARO_WINKLER, match_threshold: 0.8 }
    - name: family
      resource_type: Patient
      resource_path: name.family
      matcher: { algorithm: STRING }
  match_result_map:
    "given,family": MATCH
storage:
  backend: redb
  path: /data/links.redb
logging:
  level: debug
  json: true
"#;

    #[test]
    fn test_load_valid_yaml() {
        let config = MdmConfig::from_yaml(PATIENT_YAML).unwrap();
        assert_eq!(config.name.as_deref(), Some("patient matching"));
        assert_eq!(config.rules.mdm_types, vec!["Patient".to_string()]);
        assert_eq!(config.rules.match_rules.match_threshold, 0.9);
        assert_eq!(config.rules.match_rules.possible_match_threshold, 0.5);
        assert_eq!(
            config.rules.match_rules.match_fields[0].matcher,
            MatcherKind::Similarity {
                metric: SimilarityMetric::JaroWinkler,
                match_threshold: 0.8
            }
        );
        assert_eq!(
            config.rules.match_rules.match_result_map.get("given,family"),
            Some(&MatchResult::Match)
        );
        assert_eq!(
            config.rules.eid_system("Patient"),
            Some("http://company.io/fhir/NamingSystem/custom-eid-system")
        );
        assert_eq!(config.storage, LinkBackendConfig::redb("/data/links.redb"));
        assert!(config.logging.json);
    }

    #[test]
    fn test_load_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(PATIENT_YAML.as_bytes()).unwrap();

        let config = MdmConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.version, "1.0");
    }

    #[test]
    fn test_defaults_for_storage_and_logging() {
        let yaml = r#"
version: "1"
rules:
  mdm_types: [Patient]
  match_fields:
    - { name: family, resource_path: name.family, matcher: { algorithm: EXACT } }
"#;
        let config = MdmConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.storage, LinkBackendConfig::InMemory);
        assert_eq!(config.logging, LoggingConfig::default());
        assert_eq!(config.rules.max_commit_retries, 3);
    }

    #[test]
    fn test_unsupported_version() {
        let yaml = PATIENT_YAML.replace("version: \"1.0\"", "version: \"2.0\"");
        let err = MdmConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigLoadError::UnsupportedVersion(v) if v == "2.0"));
    }

    #[test]
    fn test_rules_validation() {
        let yaml = r#"
version: "1.0"
rules:
  mdm_types: [Patient]
  match_threshold: 0.3
  possible_match_threshold: 0.6
  match_fields:
    - { name: family, resource_path: name.family, matcher: { algorithm: EXACT } }
"#;
        let err = MdmConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigLoadError::Validation(_)));
    }

    #[test]
    fn test_unknown_search_param_fails_fast() {
        let yaml = r#"
version: "1.0"
rules:
  mdm_types: [Patient]
  candidate_search_params:
    - { resource_type: Patient, search_params: [shoe-size] }
  match_fields:
    - { name: family, resource_path: name.family, matcher: { algorithm: EXACT } }
"#;
        let err = MdmConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("shoe-size"));
    }

    #[test]
    fn test_logging_level_validation() {
        let yaml = PATIENT_YAML.replace("level: debug", "level: loud");
        let err = MdmConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("logging.level"));
    }
}
