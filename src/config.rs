//! Configuration file parser for `<app dir>/config.toml`.
//!
//! A missing file yields `Config::default()` (the binary writes a commented
//! template first so the user has something to edit). Unknown keys are
//! accepted but logged as possible typos.
use secrecy::SecretString;
use serde::Deserialize;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

use crate::mail::BodyFormat;
use crate::storage::DEFAULT_DESC_LENGTH;

/// Environment variable that overrides `smtp.password`.
pub const SMTP_PASSWORD_ENV: &str = "FEEDMAILER_SMTP_PASSWORD";

/// Written by [`Config::write_default`] when no config file exists.
pub const DEFAULT_CONFIG: &str = r#"# feedmailer configuration

# Default recipient for `feedmailer add` when --email is not given
# email = "you@example.com"

# Deliver new articles as one digest mail per subscription by default
digest = false

# Maximum description length in delivered mail (characters)
desc_length = 300

# "plain" or "html"
content_type = "plain"

sender_name = "Feed Mailer"

[smtp]
# Delivery is disabled until a host is set.
# host = "smtp.example.com"
port = 25
# user = "you@example.com"
# password = "..."   # or set FEEDMAILER_SMTP_PASSWORD
auth = false
ssl = false
starttls = false
timeout_secs = 30
"#;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default recipient for new subscriptions.
    pub email: Option<String>,

    /// Default digest flag for new subscriptions.
    pub digest: bool,

    /// Default description length for new subscriptions.
    pub desc_length: u32,

    pub content_type: BodyFormat,

    /// Display name on the From header.
    pub sender_name: String,

    pub smtp: SmtpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            email: None,
            digest: false,
            desc_length: DEFAULT_DESC_LENGTH,
            content_type: BodyFormat::Plain,
            sender_name: "Feed Mailer".to_string(),
            smtp: SmtpConfig::default(),
        }
    }
}

/// `[smtp]` table.
///
/// Custom Debug impl masks `password` to keep it out of logs.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// Relay host. `None` disables delivery.
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<SecretString>,
    /// Sender address; falls back to `user`.
    pub from: Option<String>,
    pub auth: bool,
    /// Implicit TLS from the first byte.
    pub ssl: bool,
    /// Upgrade a plaintext connection with STARTTLS.
    pub starttls: bool,
    pub timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 25,
            user: None,
            password: None,
            from: None,
            auth: false,
            ssl: false,
            starttls: false,
            timeout_secs: 30,
        }
    }
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("from", &self.from)
            .field("auth", &self.auth)
            .field("ssl", &self.ssl)
            .field("starttls", &self.starttls)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl SmtpConfig {
    /// Whether a relay host has been configured.
    pub fn is_configured(&self) -> bool {
        self.host.as_deref().is_some_and(|h| !h.trim().is_empty())
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 6] = [
        "email",
        "digest",
        "desc_length",
        "content_type",
        "sender_name",
        "smtp",
    ];

    const KNOWN_SMTP_KEYS: [&'static str; 9] = [
        "host",
        "port",
        "user",
        "password",
        "from",
        "auth",
        "ssl",
        "starttls",
        "timeout_secs",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML or an unknown `content_type` → `Err(ConfigError::Parse)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            smtp_configured = config.smtp.is_configured(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Write [`DEFAULT_CONFIG`] to `path` unless a file is already there.
    ///
    /// The template goes to a temporary sibling first and is renamed into
    /// place, so a crash never leaves a truncated config behind.
    ///
    /// Returns `true` if the file was created.
    pub fn write_default(path: &Path) -> Result<bool, ConfigError> {
        if path.exists() {
            return Ok(false);
        }

        let temp_path = path.with_extension(format!("tmp.{}", std::process::id()));
        let result = (|| {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp_path)?;
            file.write_all(DEFAULT_CONFIG.as_bytes())?;
            file.sync_all()?;
            drop(file);
            std::fs::rename(&temp_path, path)
        })();

        if let Err(e) = result {
            let _ = std::fs::remove_file(&temp_path);
            return Err(ConfigError::Io(e));
        }

        tracing::info!(path = %path.display(), "Wrote default configuration");
        Ok(true)
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    for key in raw.keys() {
        if !Config::KNOWN_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
        }
    }
    if let Some(toml::Value::Table(smtp)) = raw.get("smtp") {
        for key in smtp.keys() {
            if !Config::KNOWN_SMTP_KEYS.contains(&key.as_str()) {
                tracing::warn!(key = %key, "Unknown key in [smtp], ignoring");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
