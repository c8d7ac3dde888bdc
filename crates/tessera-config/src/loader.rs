//! Layered configuration loading.
//!
//! Layers apply in call order, each one overriding only the keys it sets:
//! a preset, then files or strings, then `PREFIX__SECTION__KEY`
//! environment variables when [`ConfigLoader::load`] runs.

use std::env;
use std::fs;
use std::path::Path;

use serde_json::{Map, Number, Value};

use crate::config::TesseraConfig;
use crate::error::ConfigError;

/// Builder that layers configuration sources.
///
/// ```no_run
/// use tessera_config::ConfigLoader;
///
/// # fn main() -> Result<(), tessera_config::ConfigError> {
/// let config = ConfigLoader::new()
///     .with_file("tessera.toml")?
///     .with_env_prefix("TESSERA")
///     .load()?;
/// println!("listening on {}", config.server.http_addr);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config: TesseraConfig,
    env_prefix: Option<String>,
    file_loaded: bool,
}

impl ConfigLoader {
    /// Start from the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from [`TesseraConfig::development`].
    pub fn with_development(mut self) -> Self {
        self.config = TesseraConfig::development();
        self
    }

    /// Start from [`TesseraConfig::production`].
    pub fn with_production(mut self) -> Self {
        self.config = TesseraConfig::production();
        self
    }

    /// Layer a `.toml` or `.json` file.
    ///
    /// # Errors
    ///
    /// Fails when the file is missing or unreadable, has another
    /// extension, does not parse, or names an unknown field.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::file_not_found(path));
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::read_error(path, e))?;
        let layer = Self::parse_file(&content, path)?;
        self.merge_layer(layer)?;
        self.file_loaded = true;
        Ok(self)
    }

    /// Layer a file if it exists.
    pub fn with_optional_file(self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            self.with_file(path)
        } else {
            Ok(self)
        }
    }

    /// Layer configuration text in `format` (`toml` or `json`).
    ///
    /// ```
    /// use tessera_config::ConfigLoader;
    ///
    /// let config = ConfigLoader::new()
    ///     .with_string("[server]\nhttp_addr = \"127.0.0.1:3000\"", "toml")
    ///     .unwrap()
    ///     .load()
    ///     .unwrap();
    /// assert_eq!(config.server.http_addr, "127.0.0.1:3000");
    /// ```
    pub fn with_string(mut self, content: &str, format: &str) -> Result<Self, ConfigError> {
        let layer = Self::parse_format(content, &format.to_lowercase())?;
        self.merge_layer(layer)?;
        Ok(self)
    }

    /// Read environment overrides named `PREFIX__SECTION__KEY` at load time.
    ///
    /// Nested sections add segments:
    /// `TESSERA__TELEMETRY__LOGGING__LEVEL=debug`. List values are
    /// comma-separated: `TESSERA__MANAGER__PROTOCOLS=chat,echo`.
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_uppercase());
        self
    }

    /// Load variables from a `.env` file in the working directory, if any.
    pub fn with_dotenv(self) -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(_) => Ok(self),
            Err(e) if e.not_found() => Ok(self),
            Err(e) => Err(ConfigError::DotenvError(e.to_string())),
        }
    }

    /// Whether a file layer was applied.
    pub fn file_loaded(&self) -> bool {
        self.file_loaded
    }

    /// Apply environment overrides and validate.
    pub fn load(mut self) -> Result<TesseraConfig, ConfigError> {
        if let Some(prefix) = self.env_prefix.take() {
            self.apply_env_overrides(&prefix)?;
        }

        self.config.validate()?;
        Ok(self.config)
    }

    /// The layered configuration, without environment overrides or validation.
    pub fn load_unvalidated(self) -> TesseraConfig {
        self.config
    }

    fn parse_file(content: &str, path: &Path) -> Result<Value, ConfigError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "toml" | "json" => Self::parse_format(content, &extension),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }

    fn parse_format(content: &str, format: &str) -> Result<Value, ConfigError> {
        match format {
            "toml" => Ok(toml::from_str(content)?),
            "json" => Ok(serde_json::from_str(content)?),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    fn merge_layer(&mut self, layer: Value) -> Result<(), ConfigError> {
        let mut base = serde_json::to_value(&self.config)?;
        merge_values(&mut base, layer);
        self.config = serde_json::from_value(base)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self, prefix: &str) -> Result<(), ConfigError> {
        let marker = format!("{prefix}__");
        let mut vars: Vec<(String, String)> =
            env::vars().filter(|(k, _)| k.starts_with(&marker)).collect();
        vars.sort();

        for (key, value) in vars {
            self.apply_env_var(&key, &value, prefix)?;
        }
        Ok(())
    }

    fn apply_env_var(&mut self, key: &str, value: &str, prefix: &str) -> Result<(), ConfigError> {
        let path: Vec<String> = key
            .strip_prefix(prefix)
            .and_then(|k| k.strip_prefix("__"))
            .ok_or_else(|| ConfigError::env_parse_error(key, "invalid key format"))?
            .split("__")
            .map(str::to_lowercase)
            .collect();
        if path.iter().any(String::is_empty) {
            return Err(ConfigError::env_parse_error(key, "empty key segment"));
        }

        let mut base = serde_json::to_value(&self.config)?;
        set_path(&mut base, &path, value).map_err(|reason| ConfigError::env_parse_error(key, reason))?;
        self.config = serde_json::from_value(base)
            .map_err(|e| ConfigError::env_parse_error(key, e.to_string()))?;
        Ok(())
    }
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn set_path(root: &mut Value, path: &[String], raw: &str) -> Result<(), String> {
    let Some((leaf, sections)) = path.split_last() else {
        return Err("empty key".to_string());
    };

    let mut node = root;
    for section in sections {
        let Value::Object(map) = node else {
            return Err(format!("{section} is not a section"));
        };
        node = map
            .entry(section.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    let Value::Object(map) = node else {
        return Err(format!("{leaf} is not inside a section"));
    };
    let typed = typed_value(map.get(leaf), raw)?;
    map.insert(leaf.clone(), typed);
    Ok(())
}

// Interpret `raw` with the type of the value it replaces.
fn typed_value(existing: Option<&Value>, raw: &str) -> Result<Value, String> {
    match existing {
        Some(Value::Bool(_)) => parse_bool(raw)
            .map(Value::Bool)
            .ok_or_else(|| "expected boolean".to_string()),
        Some(Value::Number(n)) if n.is_f64() => parse_float(raw),
        Some(Value::Number(_)) => raw
            .trim()
            .parse::<u64>()
            .map(Value::from)
            .map_err(|_| "expected integer".to_string()),
        Some(Value::Array(items)) => {
            let numeric = items.first().is_some_and(Value::is_number);
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|item| {
                    if numeric {
                        parse_float(item)
                    } else {
                        Ok(Value::String(item.to_string()))
                    }
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        Some(Value::Object(_)) => Err("names a section, not a value".to_string()),
        _ => Ok(Value::String(raw.to_string())),
    }
}

fn parse_float(raw: &str) -> Result<Value, String> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| "expected number".to_string())
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tessera_telemetry::LogFormat;
    use tessera_ws::{CompressionMethod, EngineKind};

    #[test]
    fn test_loader_new() {
        let config = ConfigLoader::new().load().unwrap();
        assert_eq!(config.server.http_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_loader_with_string_toml() {
        let toml = r#"
            [server]
            http_addr = "127.0.0.1:3000"

            [websocket]
            fragment_size = 4096
            close_timeout_ms = 250
            compression = "deflate"
            engine = "tungstenite"

            [manager]
            protocols = ["chat", "echo"]
            watchdog_interval_ms = 5000
        "#;

        let config = ConfigLoader::new().with_string(toml, "toml").unwrap().load().unwrap();

        assert_eq!(config.server.http_addr, "127.0.0.1:3000");
        assert_eq!(config.websocket.fragment_size, 4096);
        assert_eq!(config.websocket.close_timeout, Duration::from_millis(250));
        assert_eq!(config.websocket.compression, CompressionMethod::Deflate);
        assert_eq!(config.websocket.engine, EngineKind::Tungstenite);
        assert_eq!(config.manager.protocols, vec!["chat", "echo"]);
        assert_eq!(config.manager.watchdog_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_loader_with_string_json() {
        let json = r#"{"server": {"http_addr": "127.0.0.1:3000"}}"#;
        let config = ConfigLoader::new().with_string(json, "json").unwrap().load().unwrap();
        assert_eq!(config.server.http_addr, "127.0.0.1:3000");
    }

    #[test]
    fn test_unsupported_format() {
        let err = ConfigLoader::new().with_string("a: 1", "yaml").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_layers_keep_unset_keys() {
        let config = ConfigLoader::new()
            .with_development()
            .with_string("[telemetry.logging]\nlevel = \"trace\"", "toml")
            .unwrap()
            .load()
            .unwrap();

        assert_eq!(config.telemetry.logging.level, "trace");
        assert_eq!(config.telemetry.logging.format, LogFormat::Pretty);
        assert!(!config.telemetry.metrics.enabled);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ConfigLoader::new()
            .with_string("[websocket]\nmax_frame = 10", "toml")
            .unwrap_err();
        assert!(err.to_string().contains("max_frame"));

        assert!(ConfigLoader::new().with_string("[listener]\nport = 1", "toml").is_err());
    }

    #[test]
    fn test_loader_with_file_not_found() {
        let err = ConfigLoader::new().with_file("/nonexistent/tessera.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_loader_with_optional_file_not_found() {
        let loader = ConfigLoader::new().with_optional_file("/nonexistent/tessera.toml").unwrap();
        assert!(!loader.file_loaded());
        assert_eq!(loader.load().unwrap().server.http_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_load_validates() {
        let result = ConfigLoader::new()
            .with_string("[websocket]\nfragment_size = 0", "toml")
            .unwrap()
            .load();
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_apply_env_var_typed_by_existing_value() {
        let mut loader = ConfigLoader::new();
        loader.apply_env_var("T__SERVER__HTTP_ADDR", "10.0.0.1:9000", "T").unwrap();
        loader.apply_env_var("T__WEBSOCKET__FRAGMENT_SIZE", "512", "T").unwrap();
        loader.apply_env_var("T__WEBSOCKET__EMIT_PING_MESSAGES", "yes", "T").unwrap();
        loader.apply_env_var("T__WEBSOCKET__KEEP_ALIVE_INTERVAL_MS", "0", "T").unwrap();
        loader.apply_env_var("T__MANAGER__PROTOCOLS", "chat, echo", "T").unwrap();
        loader.apply_env_var("T__TELEMETRY__LOGGING__FORMAT", "pretty", "T").unwrap();
        loader.apply_env_var("T__TELEMETRY__METRICS__SIZE_BUCKETS", "10, 100.5", "T").unwrap();

        let config = loader.load_unvalidated();
        assert_eq!(config.server.http_addr, "10.0.0.1:9000");
        assert_eq!(config.websocket.fragment_size, 512);
        assert!(config.websocket.emit_ping_messages);
        assert!(config.websocket.keep_alive_interval.is_zero());
        assert_eq!(config.manager.protocols, vec!["chat", "echo"]);
        assert_eq!(config.telemetry.logging.format, LogFormat::Pretty);
        assert_eq!(config.telemetry.metrics.size_buckets, vec![10.0, 100.5]);
    }

    #[test]
    fn test_apply_env_var_errors() {
        let mut loader = ConfigLoader::new();
        assert!(loader.apply_env_var("T__WEBSOCKET__FRAGMENT_SIZE", "big", "T").is_err());
        assert!(loader.apply_env_var("T__WEBSOCKET__EMIT_PING_MESSAGES", "maybe", "T").is_err());
        assert!(loader.apply_env_var("T__WEBSOCKET__NO_SUCH_KEY", "1", "T").is_err());
        assert!(loader.apply_env_var("T__WEBSOCKET", "1", "T").is_err());
        assert!(loader.apply_env_var("T__TELEMETRY__LOGGING__FORMAT", "xml", "T").is_err());
        assert!(loader.apply_env_var("T____LEVEL", "info", "T").is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_merge_values_is_deep() {
        let mut base = serde_json::json!({"a": {"b": 1, "c": 2}, "d": [1, 2]});
        merge_values(&mut base, serde_json::json!({"a": {"c": 3}, "d": [4]}));
        assert_eq!(base, serde_json::json!({"a": {"b": 1, "c": 3}, "d": [4]}));
    }
}
