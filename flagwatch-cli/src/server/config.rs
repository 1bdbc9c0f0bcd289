use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Top-level flagwatch.toml configuration
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct FlagwatchConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WatchConfig {
    /// The features JSON file served and kept in sync.
    #[serde(default = "default_features_file")]
    pub config: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Default value functions ──────────────────────────

fn default_port() -> u16 {
    15000
}

fn default_hostname() -> String {
    "0.0.0.0".to_string()
}

fn default_features_file() -> String {
    "features.json".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            hostname: default_hostname(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            config: default_features_file(),
            enabled: default_enabled(),
            debounce_ms: default_debounce_ms(),
            log_level: default_log_level(),
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl FlagwatchConfig {
    /// Load configuration from a TOML file, falling back to defaults if the file
    /// doesn't exist or cannot be parsed.
    ///
    /// Runs before logging is set up, so problems go straight to stderr.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: failed to parse {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Apply `FLAGWATCH_*` environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("FLAGWATCH_PORT") {
            match val.parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(_) => eprintln!("Warning: invalid FLAGWATCH_PORT value: {}", val),
            }
        }

        if let Some(val) = lookup("FLAGWATCH_HOSTNAME") {
            self.server.hostname = val;
        }

        if let Some(val) = lookup("FLAGWATCH_CONFIG") {
            self.watch.config = val;
        }

        if let Some(val) = lookup("FLAGWATCH_DEBOUNCE_MS") {
            match val.parse::<u64>() {
                Ok(ms) => self.watch.debounce_ms = ms,
                Err(_) => eprintln!("Warning: invalid FLAGWATCH_DEBOUNCE_MS value: {}", val),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults_when_missing() {
        let config = FlagwatchConfig::load(Path::new("/nonexistent/flagwatch.toml"));
        assert_eq!(config, FlagwatchConfig::default());
        assert_eq!(config.server.port, 15000);
        assert_eq!(config.watch.config, "features.json");
        assert!(config.watch.enabled);
        assert_eq!(config.watch.debounce(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flagwatch.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 8088

[watch]
config = "/etc/flagwatch/features.json"
enabled = false
"#,
        )
        .unwrap();

        let config = FlagwatchConfig::load(&path);
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.server.hostname, "0.0.0.0");
        assert_eq!(config.watch.config, "/etc/flagwatch/features.json");
        assert!(!config.watch.enabled);
        assert_eq!(config.watch.debounce_ms, 100);
        assert_eq!(config.watch.log_level, "info");
    }

    #[test]
    fn test_malformed_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flagwatch.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        assert_eq!(FlagwatchConfig::load(&path), FlagwatchConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let vars = HashMap::from([
            ("FLAGWATCH_PORT", "9000"),
            ("FLAGWATCH_HOSTNAME", "127.0.0.1"),
            ("FLAGWATCH_CONFIG", "flags.json"),
            ("FLAGWATCH_DEBOUNCE_MS", "not-a-number"),
        ]);
        let mut config = FlagwatchConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.hostname, "127.0.0.1");
        assert_eq!(config.watch.config, "flags.json");
        // unparseable values leave the previous setting
        assert_eq!(config.watch.debounce_ms, 100);
    }
}
