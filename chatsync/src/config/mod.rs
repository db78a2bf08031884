//! Configuration system for the `chatsync` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/chatsync/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A value is out of its accepted range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending key.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    identity: IdentityFileConfig,
    storage: StorageFileConfig,
    sync: SyncFileConfig,
}

/// `[identity]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct IdentityFileConfig {
    user_id: Option<String>,
}

/// `[storage]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    data_dir: Option<PathBuf>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    cache_capacity: Option<usize>,
    page_size: Option<usize>,
    send_timeout_secs: Option<u64>,
    backoff_base_ms: Option<u64>,
    backoff_max_secs: Option<u64>,
    event_buffer: Option<usize>,
    command_buffer: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Tunables of the synchronization core (cache, queue, coordinator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Messages kept per conversation in the local cache.
    pub cache_capacity: usize,
    /// Messages per history page.
    pub page_size: usize,
    /// Deadline for a single remote send.
    pub send_timeout: Duration,
    /// Delay before the first automatic retry.
    pub backoff_base: Duration,
    /// Upper bound on the retry delay.
    pub backoff_max: Duration,
    /// Buffer of each coordinator's event channel.
    pub event_buffer: usize,
    /// Buffer of the outbound queue command channel.
    pub command_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 50,
            page_size: 50,
            send_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            event_buffer: 64,
            command_buffer: 256,
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identity of the local user.
    pub user_id: String,
    /// Directory holding the cache and the outbound queue.
    pub data_dir: PathBuf,
    /// Synchronization tunables.
    pub sync: SyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_id: "me".to_string(),
            data_dir: default_data_dir(),
            sync: SyncConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. If no `--config` is given, the default path
    /// (`~/.config/chatsync/config.toml`) is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if a value is out of range.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let sync = &file.sync;

        Self {
            user_id: cli
                .user_id
                .clone()
                .or_else(|| file.identity.user_id.clone())
                .unwrap_or(defaults.user_id),
            data_dir: cli
                .data_dir
                .clone()
                .or_else(|| file.storage.data_dir.clone())
                .unwrap_or(defaults.data_dir),
            sync: SyncConfig {
                cache_capacity: sync
                    .cache_capacity
                    .unwrap_or(defaults.sync.cache_capacity),
                page_size: cli
                    .page_size
                    .or(sync.page_size)
                    .unwrap_or(defaults.sync.page_size),
                send_timeout: sync
                    .send_timeout_secs
                    .map_or(defaults.sync.send_timeout, Duration::from_secs),
                backoff_base: sync
                    .backoff_base_ms
                    .map_or(defaults.sync.backoff_base, Duration::from_millis),
                backoff_max: sync
                    .backoff_max_secs
                    .map_or(defaults.sync.backoff_max, Duration::from_secs),
                event_buffer: sync.event_buffer.unwrap_or(defaults.sync.event_buffer),
                command_buffer: sync
                    .command_buffer
                    .unwrap_or(defaults.sync.command_buffer),
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.user_id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "identity.user_id",
                reason: "must not be empty",
            });
        }
        let positive = [
            ("sync.cache_capacity", self.sync.cache_capacity),
            ("sync.page_size", self.sync.page_size),
            ("sync.event_buffer", self.sync.event_buffer),
            ("sync.command_buffer", self.sync.command_buffer),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero",
                });
            }
        }
        if self.sync.backoff_base > self.sync.backoff_max {
            return Err(ConfigError::Invalid {
                field: "sync.backoff_base_ms",
                reason: "must not exceed sync.backoff_max_secs",
            });
        }
        Ok(())
    }

    /// The synchronization tunables handed to the library.
    #[must_use]
    pub fn sync_config(&self) -> SyncConfig {
        self.sync.clone()
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Offline-first chat synchronization core")]
pub struct CliArgs {
    /// What to run (default: `demo`).
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Local user identity.
    #[arg(long, env = "CHATSYNC_USER")]
    pub user_id: Option<String>,

    /// Directory for the cache and outbound queue.
    #[arg(long, env = "CHATSYNC_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Messages per history page.
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Path to config file (default: `~/.config/chatsync/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CHATSYNC_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/chatsync.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Subcommands of the `chatsync` binary.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run a scripted offline/online session against an in-process remote.
    Demo,
    /// Print a conversation's cached timeline and the outbound queue.
    Inspect {
        /// Conversation to print.
        conversation: String,
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn default_data_dir() -> PathBuf {
    dirs::data_dir().map_or_else(|| std::env::temp_dir().join("chatsync"), |d| d.join("chatsync"))
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("chatsync").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
