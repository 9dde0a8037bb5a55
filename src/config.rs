//! Process configuration.
//!
//! Listener addresses, event retention defaults, command execution limits and
//! the optional initial matching/provisioning state loaded at start-up.

use crate::matching::MatchingConfig;
use crate::provision::Provision;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;

/// Main configuration for the mock server process.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ProcessConfig {
    /// Admin plane listener
    #[serde(default)]
    pub admin: AdminSettings,

    /// Traffic plane listener
    #[serde(default)]
    pub traffic: TrafficSettings,

    /// Event store retention defaults
    #[serde(default)]
    pub events: EventSettings,

    /// External command execution
    #[serde(default)]
    pub commands: CommandSettings,

    /// Initial matching configuration, same document as the admin API accepts
    #[serde(default)]
    pub matching: Option<Value>,

    /// Initial provisions, same documents as the admin API accepts
    #[serde(default)]
    pub provisions: Vec<Value>,

    /// Initial global variables
    #[serde(default)]
    pub global_variables: BTreeMap<String, Value>,
}

impl ProcessConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.admin.validate()?;
        self.traffic.validate()?;
        self.commands.validate()?;

        let matching = match &self.matching {
            Some(document) => MatchingConfig::from_json(document)
                .map_err(|e| anyhow::anyhow!("matching: {}", e))?,
            None => MatchingConfig::default(),
        };
        for (i, document) in self.provisions.iter().enumerate() {
            Provision::from_json(document, matching.uses_regex_uris())
                .map_err(|e| anyhow::anyhow!("provision {}: {}", i, e))?;
        }
        for (name, value) in &self.global_variables {
            if !(value.is_string() || value.is_number() || value.is_boolean()) {
                anyhow::bail!("global variable '{}' must be a scalar", name);
            }
        }
        Ok(())
    }

    /// Initial global variables as a JSON object.
    pub fn global_variables_json(&self) -> Value {
        Value::Object(
            self.global_variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

fn validate_api_path(path: &str) -> anyhow::Result<()> {
    if !path.starts_with('/') {
        anyhow::bail!("api_path '{}' must start with '/'", path);
    }
    Ok(())
}

/// Admin plane settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminSettings {
    #[serde(default = "default_admin_listen")]
    pub listen: SocketAddr,

    /// Path prefix of every admin operation
    #[serde(default = "default_admin_api_path")]
    pub api_path: String,
}

impl AdminSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_api_path(&self.api_path)
    }
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
            api_path: default_admin_api_path(),
        }
    }
}

fn default_admin_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8074))
}

fn default_admin_api_path() -> String {
    "/admin/v1".to_string()
}

/// Traffic plane settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrafficSettings {
    #[serde(default = "default_traffic_listen")]
    pub listen: SocketAddr,

    /// Optional prefix every traffic URI must carry
    #[serde(default)]
    pub api_path: Option<String>,

    #[serde(default = "default_true")]
    pub receive_request_body: bool,

    #[serde(default = "default_true")]
    pub pre_reserve_request_body: bool,
}

impl TrafficSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.api_path {
            validate_api_path(path)?;
        }
        Ok(())
    }
}

impl Default for TrafficSettings {
    fn default() -> Self {
        Self {
            listen: default_traffic_listen(),
            api_path: None,
            receive_request_body: true,
            pre_reserve_request_body: true,
        }
    }
}

fn default_traffic_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

/// Event store retention defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventSettings {
    #[serde(default = "default_true")]
    pub store_events: bool,

    #[serde(default = "default_true")]
    pub store_events_key_history: bool,

    #[serde(default = "default_true")]
    pub purge_execution: bool,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            store_events: true,
            store_events_key_history: true,
            purge_execution: true,
        }
    }
}

/// External command execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Commands allowed to run at the same time
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_command_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_shell")]
    pub shell: String,
}

impl CommandSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent == 0 {
            anyhow::bail!("commands.max_concurrent must be at least 1");
        }
        if self.timeout_ms == 0 {
            anyhow::bail!("commands.timeout_ms must be greater than 0");
        }
        if self.shell.is_empty() {
            anyhow::bail!("commands.shell cannot be empty");
        }
        Ok(())
    }
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: default_max_concurrent(),
            timeout_ms: default_command_timeout_ms(),
            shell: default_shell(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    4
}

fn default_command_timeout_ms() -> u64 {
    5000
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_minimal_config() {
        let config: ProcessConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.admin.api_path, "/admin/v1");
        assert_eq!(config.traffic.listen.port(), 8000);
        assert!(config.events.store_events_key_history);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
admin:
  listen: 127.0.0.1:9074
  api_path: /provision/v1
traffic:
  listen: 127.0.0.1:9000
  api_path: /app/v1
events:
  store_events_key_history: false
commands:
  max_concurrent: 2
  timeout_ms: 100
matching:
  algorithm: FullMatchingRegexReplace
  rgx: "(/app/v1/foo)/[0-9]+"
  fmt: "$1"
provisions:
  - requestMethod: GET
    requestUri: /app/v1/foo
    responseCode: 200
    responseBody:
      foo: bar
global_variables:
  greeting: hello
  answer: 42
"#;
        let config: ProcessConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.admin.api_path, "/provision/v1");
        assert_eq!(config.traffic.api_path.as_deref(), Some("/app/v1"));
        assert!(!config.events.store_events_key_history);
        assert_eq!(config.commands.max_concurrent, 2);
        assert_eq!(config.provisions.len(), 1);
        assert_eq!(
            config.global_variables_json(),
            serde_json::json!({"greeting": "hello", "answer": 42})
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let parsed: Result<ProcessConfig, _> = serde_yaml::from_str("stubs: []");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_provision() {
        let yaml = r#"
provisions:
  - requestMethod: GET
    requestUri: /x
"#;
        let config: ProcessConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_matching_and_limits() {
        let yaml = r#"
matching:
  algorithm: FullMatching
  rgx: "a"
"#;
        let config: ProcessConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());

        let config: ProcessConfig =
            serde_yaml::from_str("commands: { max_concurrent: 0 }").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "admin:\n  api_path: /admin/v2").unwrap();

        let config = ProcessConfig::from_file(file.path()).unwrap();
        assert_eq!(config.admin.api_path, "/admin/v2");
    }

    #[test]
    fn test_bundled_default_config_is_valid() {
        let config: ProcessConfig =
            serde_yaml::from_str(include_str!("../config/default-config.yaml")).unwrap();
        config.validate().unwrap();
    }
}
