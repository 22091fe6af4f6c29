//! Server configuration
//!
//! Settings come from three layers, later layers winning:
//! 1. Built-in defaults
//! 2. An optional JSON file (`--config <path>`)
//! 3. Command line flags

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

// ============================================================================
// Defaults
// ============================================================================

/// Default listening port
pub const DEFAULT_PORT: u16 = 8080;

/// Maximum number of simultaneously connected clients
pub const DEFAULT_MAX_CLIENTS: usize = 30;

/// Number of log lines replayed to a client on login
pub const DEFAULT_HISTORY_LINES: usize = 20;

/// Usernames and group names must be shorter than this
pub const DEFAULT_USERNAME_MAX_LEN: usize = 50;

/// Longest inbound line accepted before the connection is dropped
pub const DEFAULT_MAX_LINE_LEN: usize = 1024;

/// Outbound bytes a slow reader may have queued before it is disconnected
pub const DEFAULT_MAX_OUTBOUND_BYTES: usize = 64 * 1024;

const DEFAULT_CHAT_LOG: &str = "chat_log.txt";
const DEFAULT_ALLOWED_USERS: &str = "config/users.txt";
const DEFAULT_GROUPS: &str = "config/groups.txt";

// ============================================================================
// Errors
// ============================================================================

/// Errors while assembling the server configuration
#[derive(Debug)]
pub enum ConfigError {
    /// Config file could not be read
    Io { path: PathBuf, source: std::io::Error },
    /// Config file is not valid JSON for `ServerConfig`
    Parse { path: PathBuf, source: serde_json::Error },
    /// A command line flag had a bad or missing value
    InvalidArg { flag: String, value: String },
    /// Settings parsed but are not usable together
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "cannot read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {}", path.display(), source)
            }
            ConfigError::InvalidArg { flag, value } => {
                write!(f, "invalid value {:?} for {}", value, flag)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

/// Everything the server needs to start serving
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub bind_addr: SocketAddr,
    /// Connection table capacity
    pub max_clients: usize,
    /// Replay buffer size
    pub history_lines: usize,
    /// Exclusive upper bound on username and group name length
    pub username_max_len: usize,
    /// Longest accepted inbound line (without the terminator)
    pub max_line_len: usize,
    /// Per-connection outbound queue bound
    pub max_outbound_bytes: usize,
    /// Append-only chat log
    pub chat_log: PathBuf,
    /// Allow-list file, one username per line
    pub allowed_users: PathBuf,
    /// Group file, `name:member1,member2,...` per line
    pub groups: PathBuf,
    /// Refuse a login whose username is already active on another connection
    pub reject_duplicate_usernames: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_clients: DEFAULT_MAX_CLIENTS,
            history_lines: DEFAULT_HISTORY_LINES,
            username_max_len: DEFAULT_USERNAME_MAX_LEN,
            max_line_len: DEFAULT_MAX_LINE_LEN,
            max_outbound_bytes: DEFAULT_MAX_OUTBOUND_BYTES,
            chat_log: PathBuf::from(DEFAULT_CHAT_LOG),
            allowed_users: PathBuf::from(DEFAULT_ALLOWED_USERS),
            groups: PathBuf::from(DEFAULT_GROUPS),
            reject_duplicate_usernames: false,
        }
    }
}

impl ServerConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build the configuration from command line arguments.
    ///
    /// `args[0]` is the program name. Recognized flags:
    ///
    /// ```text
    /// --config <path>        JSON config file (applied first)
    /// --bind <addr:port>     Listen address
    /// --port <port>          Listen port (keeps the bind IP)
    /// --max-clients <n>      Connection table capacity
    /// --history-lines <n>    Lines replayed on login
    /// --chat-log <path>      Chat log file
    /// --users <path>         Allow-list file
    /// --groups <path>        Group definition file
    /// --reject-duplicates    Refuse a second login under an active name
    /// ```
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut config = match parse_arg(args, "--config") {
            Some(path) => ServerConfig::from_file(Path::new(&path))?,
            None => ServerConfig::default(),
        };

        if let Some(v) = parse_arg(args, "--bind") {
            config.bind_addr = parse_value("--bind", &v)?;
        }
        if let Some(v) = parse_arg(args, "--port") {
            let port: u16 = parse_value("--port", &v)?;
            config.bind_addr.set_port(port);
        }
        if let Some(v) = parse_arg(args, "--max-clients") {
            config.max_clients = parse_value("--max-clients", &v)?;
        }
        if let Some(v) = parse_arg(args, "--history-lines") {
            config.history_lines = parse_value("--history-lines", &v)?;
        }
        if let Some(v) = parse_arg(args, "--chat-log") {
            config.chat_log = PathBuf::from(v);
        }
        if let Some(v) = parse_arg(args, "--users") {
            config.allowed_users = PathBuf::from(v);
        }
        if let Some(v) = parse_arg(args, "--groups") {
            config.groups = PathBuf::from(v);
        }
        if args.iter().any(|a| a == "--reject-duplicates") {
            config.reject_duplicate_usernames = true;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be at least 1".into()));
        }
        if self.history_lines == 0 {
            return Err(ConfigError::Invalid("history_lines must be at least 1".into()));
        }
        if self.username_max_len < 2 {
            return Err(ConfigError::Invalid("username_max_len must be at least 2".into()));
        }
        if self.max_line_len < self.username_max_len {
            return Err(ConfigError::Invalid(format!(
                "max_line_len ({}) must not be below username_max_len ({})",
                self.max_line_len, self.username_max_len
            )));
        }
        Ok(())
    }
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidArg {
        flag: flag.to_string(),
        value: value.to_string(),
    })
}
