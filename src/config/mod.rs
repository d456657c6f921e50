//! Configuration management module
//!
//! Handles loading, validation, and management of application configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

use crate::remote::types::Credentials;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Logging level
    pub log_level: String,

    /// File-based logging configuration
    pub log: LogConfig,

    /// Build server connection
    pub server: ServerConfig,

    /// Interactive terminal behaviour
    pub terminal: TerminalConfig,

    /// Framed command execution
    pub exec: ExecConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    Basic,
    Bearer,
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base HTTP(S) URL of the build server
    pub url: String,

    /// User name for basic authentication
    pub username: Option<String>,

    /// API token (basic auth password or bearer token)
    pub api_token: Option<String>,

    /// How credentials are attached to requests
    pub auth: AuthScheme,

    /// HTTP request timeout in seconds
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Seconds between keepalive pings
    pub keepalive_interval_secs: u64,

    /// Upper bound on a single outbound write
    pub write_timeout_secs: u64,

    /// Size used when the local terminal size is unknown
    pub default_cols: u16,
    pub default_rows: u16,

    /// Poll period for platforms without resize signals
    pub resize_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Overall deadline for a framed command
    pub timeout_secs: u64,

    /// Wait for the shell banner before sending anyway
    pub ready_timeout_ms: u64,

    /// Pause between the banner and the command
    pub settle_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Absolute or relative path to the log file
    pub file_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log: LogConfig::default(),
            server: ServerConfig::default(),
            terminal: TerminalConfig::default(),
            exec: ExecConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            username: None,
            api_token: None,
            auth: AuthScheme::Basic,
            request_timeout_seconds: 10,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("api_token", &self.api_token.as_ref().map(|_| "***"))
            .field("auth", &self.auth)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .finish()
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 60,
            write_timeout_secs: 10,
            default_cols: 80,
            default_rows: 24,
            resize_poll_interval_ms: 250,
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            ready_timeout_ms: 500,
            settle_delay_ms: 100,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file_path: "logs/agentsh.log".to_string(),
        }
    }
}

impl ServerConfig {
    /// Credentials to attach to session requests
    pub fn credentials(&self) -> Credentials {
        match (self.auth, &self.username, &self.api_token) {
            (AuthScheme::Bearer, _, Some(token)) => Credentials::Bearer(token.clone()),
            (AuthScheme::Basic, Some(username), Some(token)) => Credentials::Basic {
                username: username.clone(),
                token: token.clone(),
            },
            _ => Credentials::Anonymous,
        }
    }
}

impl Config {
    /// Load configuration from file with environment variable overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config = Self::parse_with_overrides(&content, path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults only when the file does
    /// not exist. An unreadable or malformed file is an error. The result is
    /// not validated so that command-line overrides can be applied first.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse_with_overrides(&content, path),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}, using defaults", path.display());
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
            Err(err) => Err(err)
                .with_context(|| format!("Failed to read config file: {}", path.display())),
        }
    }

    fn parse_with_overrides(content: &str, path: &Path) -> Result<Self> {
        let mut config: Config = toml::from_str(content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        // Apply environment variable overrides
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| lookup(key).and_then(|value| value.trim().parse::<u64>().ok());

        // AGENTSH_LOG_LEVEL - logging level
        if let Some(log_level) = lookup("AGENTSH_LOG_LEVEL") {
            self.log_level = log_level;
        }

        // AGENTSH_LOG_FILE_PATH - logging destination file
        if let Some(file_path) = lookup("AGENTSH_LOG_FILE_PATH") {
            if !file_path.trim().is_empty() {
                self.log.file_path = file_path;
            }
        }

        // AGENTSH_SERVER_URL - build server base URL
        if let Some(url) = lookup("AGENTSH_SERVER_URL") {
            self.server.url = url;
        }

        // AGENTSH_USERNAME / AGENTSH_API_TOKEN - credentials
        if let Some(username) = lookup("AGENTSH_USERNAME") {
            self.server.username = Some(username);
        }
        if let Some(token) = lookup("AGENTSH_API_TOKEN") {
            self.server.api_token = Some(token);
        }

        // AGENTSH_AUTH - basic or bearer
        if let Some(auth) = lookup("AGENTSH_AUTH") {
            match auth.trim().to_ascii_lowercase().as_str() {
                "basic" => self.server.auth = AuthScheme::Basic,
                "bearer" => self.server.auth = AuthScheme::Bearer,
                other => tracing::warn!("Ignoring unknown AGENTSH_AUTH value: {}", other),
            }
        }

        if let Some(value) = parsed("AGENTSH_REQUEST_TIMEOUT_SECONDS") {
            self.server.request_timeout_seconds = value;
        }
        if let Some(value) = parsed("AGENTSH_KEEPALIVE_INTERVAL_SECS") {
            self.terminal.keepalive_interval_secs = value;
        }
        if let Some(value) = parsed("AGENTSH_WRITE_TIMEOUT_SECS") {
            self.terminal.write_timeout_secs = value;
        }
        if let Some(value) = parsed("AGENTSH_EXEC_TIMEOUT_SECS") {
            self.exec.timeout_secs = value;
        }
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.server.url)
            .with_context(|| format!("Invalid server URL: {}", self.server.url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("Server URL must use http or https: {}", self.server.url);
        }

        if self.server.request_timeout_seconds == 0 {
            anyhow::bail!("server.request_timeout_seconds must be greater than 0");
        }

        match (self.server.auth, &self.server.username, &self.server.api_token) {
            (AuthScheme::Bearer, _, None) => {
                anyhow::bail!("Bearer authentication requires server.api_token")
            }
            (AuthScheme::Basic, Some(_), None) | (AuthScheme::Basic, None, Some(_)) => {
                anyhow::bail!("Basic authentication requires both server.username and server.api_token")
            }
            _ => {}
        }

        if self.terminal.keepalive_interval_secs == 0 {
            anyhow::bail!("terminal.keepalive_interval_secs must be greater than 0");
        }

        if self.terminal.write_timeout_secs == 0 {
            anyhow::bail!("terminal.write_timeout_secs must be greater than 0");
        }

        if self.terminal.default_cols == 0 || self.terminal.default_rows == 0 {
            anyhow::bail!("terminal.default_cols and terminal.default_rows must be greater than 0");
        }

        if self.terminal.resize_poll_interval_ms == 0 {
            anyhow::bail!("terminal.resize_poll_interval_ms must be greater than 0");
        }

        if self.exec.timeout_secs == 0 {
            anyhow::bail!("exec.timeout_secs must be greater than 0");
        }

        if self.log.file_path.trim().is_empty() {
            anyhow::bail!("Log file path must not be empty");
        }

        Ok(())
    }

    /// Copy with the API token masked, for display
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.server.api_token.is_some() {
            config.server.api_token = Some("***".to_string());
        }
        config
    }

    /// Display formatted configuration
    pub fn display(&self) -> Result<()> {
        let content =
            toml::to_string_pretty(&self.redacted()).context("Failed to serialize configuration")?;
        println!("{}", content);
        Ok(())
    }

    /// Display configuration management help
    pub fn display_help() -> Result<()> {
        println!("Configuration management commands:");
        println!("  agentsh config show    - Show current configuration");
        println!("  agentsh config reset   - Show the default configuration");
        Ok(())
    }

    /// Handle configuration command
    pub fn handle_command(&self, action: &Option<crate::cli::ConfigAction>) -> Result<()> {
        match action {
            Some(crate::cli::ConfigAction::Show) => self.display()?,
            Some(crate::cli::ConfigAction::Reset) => Config::default().display()?,
            None => Config::display_help()?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.terminal.keepalive_interval_secs, 60);
        assert_eq!(config.terminal.write_timeout_secs, 10);
        assert_eq!(config.exec.ready_timeout_ms, 500);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(config.server.url, deserialized.server.url);
        assert_eq!(config.exec.timeout_secs, deserialized.exec.timeout_secs);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            url = "https://ci.example.com"
            username = "alice"
            api_token = "secret"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.terminal.default_cols, 80);
        assert!(matches!(config.server.credentials(), Credentials::Basic { .. }));
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = Config::default();
        config.server.url = "https://ci.example.com".to_string();
        let temp_file = NamedTempFile::new().unwrap();

        config.save_to_file(temp_file.path()).unwrap();

        let loaded_config = Config::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded_config.server.url, "https://ci.example.com");
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("AGENTSH_SERVER_URL", "https://override.example.com"),
            ("AGENTSH_API_TOKEN", "tkn"),
            ("AGENTSH_AUTH", "Bearer"),
            ("AGENTSH_EXEC_TIMEOUT_SECS", "5"),
            ("AGENTSH_KEEPALIVE_INTERVAL_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.url, "https://override.example.com");
        assert_eq!(config.server.auth, AuthScheme::Bearer);
        assert_eq!(config.exec.timeout_secs, 5);
        assert_eq!(config.terminal.keepalive_interval_secs, 60);
        assert!(matches!(config.server.credentials(), Credentials::Bearer(ref t) if t == "tkn"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.server.url = "ftp://ci.example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.auth = AuthScheme::Bearer;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.username = Some("alice".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.exec.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.terminal.default_cols, 80);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "[server").unwrap();

        let err = Config::load_or_default(temp_file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_invalid_file_loads_but_fails_validation() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(
            temp_file,
            "[server]\nurl = \"https://ci.example.com\"\nauth = \"bearer\"\n"
        )
        .unwrap();

        let config = Config::load_or_default(temp_file.path()).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("api_token"));
        assert!(Config::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_redacted_hides_token() {
        let mut config = Config::default();
        config.server.api_token = Some("very-secret".to_string());
        let shown = toml::to_string(&config.redacted()).unwrap();
        assert!(!shown.contains("very-secret"));
        assert!(format!("{:?}", config.server).contains("***"));
    }
}
