use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub search: Search,
    #[serde(default)]
    pub secrets: Secrets,
    pub host: Host,
    #[serde(default)]
    pub command: Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
    /// Externally reachable base URL that button callbacks are sent to.
    pub public_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Search {
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,
    pub api_key: String,
    #[serde(default = "default_rating")]
    pub rating: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secrets {
    #[serde(default = "default_secret_ttl_seconds")]
    pub ttl_seconds: u64,
}

impl Default for Secrets {
    fn default() -> Self {
        Self {
            ttl_seconds: default_secret_ttl_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub api_url: String,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    #[serde(default = "default_trigger")]
    pub trigger: String,
}

impl Default for Command {
    fn default() -> Self {
        Self {
            trigger: default_trigger(),
        }
    }
}

fn default_search_endpoint() -> String {
    "https://api.giphy.com/v1/gifs/translate".to_string()
}

fn default_rating() -> String {
    "g".to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_secret_ttl_seconds() -> u64 {
    30 * 60
}

fn default_trigger() -> String {
    "giphy".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

/// Checks that schema validation cannot express. Also run on reconfiguration.
pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.command.trigger.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "command.trigger must not be empty".to_string(),
        ));
    }
    if cfg.search.api_key.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "search.api_key must not be empty".to_string(),
        ));
    }
    if cfg.search.timeout_ms == 0 || cfg.host.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "search.timeout_ms and host.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.secrets.ttl_seconds == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "secrets.ttl_seconds must be >= 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("shufflebot-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"
  public_url: "http://localhost:8065/plugins/giphy"

store:
  type: "memory"

search:
  api_key: "k"
  rating: "pg"

host:
  api_url: "http://localhost:8066/api/v4"
"#
        .to_string()
    }

    #[test]
    fn applies_defaults_for_optional_sections() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("base config should be accepted");
        assert_eq!(cfg.secrets.ttl_seconds, 1800);
        assert_eq!(cfg.command.trigger, "giphy");
        assert_eq!(cfg.search.rating, "pg");
        assert_eq!(
            cfg.search.endpoint,
            "https://api.giphy.com/v1/gifs/translate"
        );
    }

    #[test]
    fn supports_sqlite_store_type_with_path() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"sqlite\"\n  sqlite_path: \"./a.db\"",
        ));
        let cfg = load_and_validate(&path).expect("sqlite config should be accepted");
        assert_eq!(cfg.store.kind, "sqlite");
        assert_eq!(cfg.store.sqlite_path.as_deref(), Some("./a.db"));
    }

    #[test]
    fn rejects_sqlite_path_even_when_memory() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"memory\"\n  sqlite_path: \"./a.db\"",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_empty_trigger() {
        let path = write_temp_config(&format!("{}\ncommand:\n  trigger: \"\"\n", base_yaml()));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_empty_api_key() {
        let path = write_temp_config(&base_yaml().replace("api_key: \"k\"", "api_key: \"\""));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_unknown_rating() {
        let path = write_temp_config(&base_yaml().replace("rating: \"pg\"", "rating: \"nsfw\""));
        let err = load_and_validate(&path).expect_err("expected schema failure");
        assert!(matches!(err, ConfigError::SchemaValidation(_)));
    }
}
