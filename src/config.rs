use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::agent_id::generate_agent_id;

/// Default config file template with comments, used by `--init-config`.
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# edge agent configuration file

# Operator connection
# [operator]
# url = "wss://operator.example.com/agent"
# heartbeat_interval_secs = 30
# reconnect_initial_backoff_secs = 1
# reconnect_max_backoff_secs = 60
# command_timeout_secs = 30

# Agent identity
# [agent]
# id = "pi-a1b2c3d4"
# agent_type = "raspberry-pi"
# hostname = "my-device"
# tags = ["garage", "sensor"]

# Telemetry
# [telemetry]
# enabled = true
# metrics_interval_secs = 30
# report_system_metrics = true

# Task executor
# [executor]
# max_concurrent_tasks = 4
# allowed_commands = []
# blocked_commands = ["rm -rf /", "dd if="]

# Logging
# [logging]
# level = "info"
# file = "/var/log/agentd.log"
# format = "pretty"
"#;

// ---------------------------------------------------------------------------
// Config structs (parsed from TOML)
// ---------------------------------------------------------------------------

/// Represents the parsed TOML config file. All fields optional.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigFile {
    pub operator: OperatorConfig,
    pub agent: AgentConfig,
    pub telemetry: TelemetryConfig,
    pub executor: ExecutorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OperatorConfig {
    pub url: Option<String>,
    pub heartbeat_interval_secs: Option<u64>,
    pub reconnect_initial_backoff_secs: Option<u64>,
    pub reconnect_max_backoff_secs: Option<u64>,
    pub reconnect_max_attempts: Option<u32>,
    pub ping_interval_secs: Option<u64>,
    pub ping_timeout_secs: Option<u64>,
    pub command_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    pub id: Option<String>,
    pub agent_type: Option<String>,
    pub hostname: Option<String>,
    pub display_name: Option<String>,
    pub tags: Option<Vec<String>>,
    pub capabilities: Option<Vec<String>>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: Option<bool>,
    pub metrics_interval_secs: Option<u64>,
    pub report_system_metrics: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_concurrent_tasks: Option<usize>,
    pub task_timeout_secs: Option<u64>,
    pub allowed_commands: Option<Vec<String>>,
    pub blocked_commands: Option<Vec<String>>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub file: Option<String>,
    pub format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved config (all defaults filled in)
// ---------------------------------------------------------------------------

/// Fully resolved configuration with all defaults filled in.
#[derive(Debug, Serialize)]
pub struct ResolvedConfig {
    pub config_path: Option<PathBuf>,
    pub operator: ResolvedOperator,
    pub agent: ResolvedAgent,
    pub telemetry: ResolvedTelemetry,
    pub executor: ResolvedExecutor,
    pub logging: ResolvedLogging,
}

#[derive(Debug, Serialize)]
pub struct ResolvedOperator {
    pub url: String,
    pub heartbeat_interval_secs: u64,
    pub reconnect_initial_backoff_secs: u64,
    pub reconnect_max_backoff_secs: u64,
    pub reconnect_max_attempts: u32,
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedAgent {
    pub id: String,
    pub agent_type: String,
    pub hostname: String,
    pub display_name: String,
    pub tags: Vec<String>,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ResolvedTelemetry {
    pub enabled: bool,
    pub metrics_interval_secs: u64,
    pub report_system_metrics: bool,
}

#[derive(Debug, Serialize)]
pub struct ResolvedExecutor {
    pub max_concurrent_tasks: usize,
    pub task_timeout_secs: u64,
    pub allowed_commands: Vec<String>,
    pub blocked_commands: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ResolvedLogging {
    pub level: String,
    pub file: Option<String>,
    pub format: String,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    /// I/O error reading/writing config file.
    Io(std::io::Error),
    /// Config file already exists (for `--init-config`).
    AlreadyExists(PathBuf),
    /// Could not determine config directory.
    NoConfigDir,
    /// `operator.url` missing and no override supplied on the command line or environment.
    MissingOperatorUrl,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config file error: {e}"),
            Self::AlreadyExists(p) => {
                write!(f, "config file already exists: {}", p.display())
            }
            Self::NoConfigDir => write!(f, "could not determine config directory"),
            Self::MissingOperatorUrl => {
                write!(f, "operator.url is required (config file, --operator-url, or AGENT_OPERATOR_URL)")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Config file search
// ---------------------------------------------------------------------------

/// Find the first config file that exists, checking locations in priority order.
///
/// Search order:
/// 1. `explicit_path` (from `--config` flag)
/// 2. `$AGENT_CONFIG` environment variable
/// 3. `./.agentd.toml` (project-local)
/// 4. `<config_dir>/agentd/config.toml` (XDG / platform config dir)
/// 5. `~/.agentd.toml` (home directory fallback)
#[must_use]
pub fn find_config_file(explicit_path: Option<&Path>) -> Option<PathBuf> {
    find_config_file_with(explicit_path, std::env::var("AGENT_CONFIG").ok())
}

/// Testable variant of [`find_config_file`] that accepts an explicit env value.
#[must_use]
pub fn find_config_file_with(
    explicit_path: Option<&Path>,
    env_config: Option<String>,
) -> Option<PathBuf> {
    if let Some(p) = explicit_path {
        if p.exists() {
            return Some(p.to_path_buf());
        }
    }

    if let Some(env_path) = env_config {
        let p = PathBuf::from(env_path);
        if p.exists() {
            return Some(p);
        }
    }

    let local = PathBuf::from(".agentd.toml");
    if local.exists() {
        return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("agentd").join("config.toml");
        if xdg.exists() {
            return Some(xdg);
        }
    }

    if let Some(home) = dirs::home_dir() {
        let home_config = home.join(".agentd.toml");
        if home_config.exists() {
            return Some(home_config);
        }
    }

    None
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Load and parse a config file. Returns the file path (if found) and the parsed config.
///
/// On parse errors, prints a warning to stderr and returns `ConfigFile::default()`.
#[must_use]
pub fn load_config(explicit_path: Option<&Path>) -> (Option<PathBuf>, ConfigFile) {
    let path = find_config_file(explicit_path);
    match &path {
        Some(p) => {
            let config = load_config_from(p);
            (path, config)
        }
        None => (None, ConfigFile::default()),
    }
}

/// Load and parse a config file from a specific path.
///
/// On parse errors, prints a warning to stderr and returns `ConfigFile::default()`.
#[must_use]
pub fn load_config_from(path: &Path) -> ConfigFile {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!(
                "warning: could not read config file {}: {e}",
                path.display()
            );
            return ConfigFile::default();
        }
    };

    parse_config(&contents, path)
}

/// Parse TOML content into a `ConfigFile`.
///
/// Uses a two-pass strategy: first tries strict parsing (to detect unknown keys),
/// then falls back to lenient parsing if strict fails due to unknown fields.
#[must_use]
pub fn parse_config(contents: &str, path: &Path) -> ConfigFile {
    match toml::from_str::<StrictConfigFile>(contents) {
        Ok(strict) => strict.into(),
        Err(strict_err) => match toml::from_str::<ConfigFile>(contents) {
            Ok(config) => {
                eprintln!(
                    "warning: unknown keys in config file {}: {strict_err}",
                    path.display()
                );
                config
            }
            Err(parse_err) => {
                eprintln!(
                    "warning: could not parse config file {}: {parse_err}",
                    path.display()
                );
                ConfigFile::default()
            }
        },
    }
}

/// Strict variant used for the first-pass parse to detect unknown keys.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictConfigFile {
    #[serde(default)]
    operator: StrictOperatorConfig,
    #[serde(default)]
    agent: StrictAgentConfig,
    #[serde(default)]
    telemetry: StrictTelemetryConfig,
    #[serde(default)]
    executor: StrictExecutorConfig,
    #[serde(default)]
    logging: StrictLoggingConfig,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictOperatorConfig {
    url: Option<String>,
    heartbeat_interval_secs: Option<u64>,
    reconnect_initial_backoff_secs: Option<u64>,
    reconnect_max_backoff_secs: Option<u64>,
    reconnect_max_attempts: Option<u32>,
    ping_interval_secs: Option<u64>,
    ping_timeout_secs: Option<u64>,
    command_timeout_secs: Option<u64>,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictAgentConfig {
    id: Option<String>,
    agent_type: Option<String>,
    hostname: Option<String>,
    display_name: Option<String>,
    tags: Option<Vec<String>>,
    capabilities: Option<Vec<String>>,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictTelemetryConfig {
    enabled: Option<bool>,
    metrics_interval_secs: Option<u64>,
    report_system_metrics: Option<bool>,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictExecutorConfig {
    max_concurrent_tasks: Option<usize>,
    task_timeout_secs: Option<u64>,
    allowed_commands: Option<Vec<String>>,
    blocked_commands: Option<Vec<String>>,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictLoggingConfig {
    level: Option<String>,
    file: Option<String>,
    format: Option<String>,
}

impl From<StrictConfigFile> for ConfigFile {
    fn from(s: StrictConfigFile) -> Self {
        Self {
            operator: OperatorConfig {
                url: s.operator.url,
                heartbeat_interval_secs: s.operator.heartbeat_interval_secs,
                reconnect_initial_backoff_secs: s.operator.reconnect_initial_backoff_secs,
                reconnect_max_backoff_secs: s.operator.reconnect_max_backoff_secs,
                reconnect_max_attempts: s.operator.reconnect_max_attempts,
                ping_interval_secs: s.operator.ping_interval_secs,
                ping_timeout_secs: s.operator.ping_timeout_secs,
                command_timeout_secs: s.operator.command_timeout_secs,
            },
            agent: AgentConfig {
                id: s.agent.id,
                agent_type: s.agent.agent_type,
                hostname: s.agent.hostname,
                display_name: s.agent.display_name,
                tags: s.agent.tags,
                capabilities: s.agent.capabilities,
            },
            telemetry: TelemetryConfig {
                enabled: s.telemetry.enabled,
                metrics_interval_secs: s.telemetry.metrics_interval_secs,
                report_system_metrics: s.telemetry.report_system_metrics,
            },
            executor: ExecutorConfig {
                max_concurrent_tasks: s.executor.max_concurrent_tasks,
                task_timeout_secs: s.executor.task_timeout_secs,
                allowed_commands: s.executor.allowed_commands,
                blocked_commands: s.executor.blocked_commands,
            },
            logging: LoggingConfig {
                level: s.logging.level,
                file: s.logging.file,
                format: s.logging.format,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

/// Applies `AGENT_*` environment overrides on top of a parsed file.
fn apply_environment_overrides(mut file: ConfigFile) -> ConfigFile {
    if let Ok(v) = std::env::var("AGENT_OPERATOR_URL") {
        file.operator.url = Some(v);
    }
    if let Ok(v) = std::env::var("AGENT_ID") {
        file.agent.id = Some(v);
    }
    if let Ok(v) = std::env::var("AGENT_TYPE") {
        file.agent.agent_type = Some(v);
    }
    if let Ok(v) = std::env::var("AGENT_HOSTNAME") {
        file.agent.hostname = Some(v);
    }
    if let Ok(v) = std::env::var("AGENT_HEARTBEAT_INTERVAL") {
        if let Ok(secs) = v.parse() {
            file.operator.heartbeat_interval_secs = Some(secs);
        }
    }
    if let Ok(v) = std::env::var("AGENT_LOG_LEVEL") {
        file.logging.level = Some(v);
    }
    file
}

// ---------------------------------------------------------------------------
// Config resolution
// ---------------------------------------------------------------------------

const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const DEFAULT_RECONNECT_INITIAL_BACKOFF_SECS: u64 = 1;
const DEFAULT_RECONNECT_MAX_BACKOFF_SECS: u64 = 60;
/// 0 means retry forever.
const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 0;
const DEFAULT_PING_INTERVAL_SECS: u64 = 20;
const DEFAULT_PING_TIMEOUT_SECS: u64 = 10;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_CONCURRENT_TASKS: usize = 4;
const DEFAULT_TASK_TIMEOUT_SECS: u64 = 30;
const DEFAULT_METRICS_INTERVAL_SECS: u64 = 30;

/// Commands the executor refuses to run regardless of config.
fn default_blocked_commands() -> Vec<String> {
    vec![
        "rm -rf /".to_string(),
        "dd if=".to_string(),
        "mkfs".to_string(),
        ":(){ :|:& };:".to_string(),
    ]
}

/// Resolve a config file (with environment overrides already applied) into a
/// fully-populated `ResolvedConfig`.
///
/// # Errors
///
/// Returns [`ConfigError::MissingOperatorUrl`] when no operator URL is
/// configured anywhere (a missing operator URL is a fatal
/// startup error, not a silently-disabled feature).
pub fn resolve_config(
    file: &ConfigFile,
    config_path: Option<PathBuf>,
) -> Result<ResolvedConfig, ConfigError> {
    let file = apply_environment_overrides(file.clone());

    let url = file.operator.url.clone().ok_or(ConfigError::MissingOperatorUrl)?;

    let mut blocked_commands = default_blocked_commands();
    if let Some(extra) = &file.executor.blocked_commands {
        for cmd in extra {
            if !blocked_commands.contains(cmd) {
                blocked_commands.push(cmd.clone());
            }
        }
    }

    Ok(ResolvedConfig {
        config_path,
        operator: ResolvedOperator {
            url,
            heartbeat_interval_secs: file
                .operator
                .heartbeat_interval_secs
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            reconnect_initial_backoff_secs: file
                .operator
                .reconnect_initial_backoff_secs
                .unwrap_or(DEFAULT_RECONNECT_INITIAL_BACKOFF_SECS),
            reconnect_max_backoff_secs: file
                .operator
                .reconnect_max_backoff_secs
                .unwrap_or(DEFAULT_RECONNECT_MAX_BACKOFF_SECS),
            reconnect_max_attempts: file
                .operator
                .reconnect_max_attempts
                .unwrap_or(DEFAULT_RECONNECT_MAX_ATTEMPTS),
            ping_interval_secs: file
                .operator
                .ping_interval_secs
                .unwrap_or(DEFAULT_PING_INTERVAL_SECS),
            ping_timeout_secs: file
                .operator
                .ping_timeout_secs
                .unwrap_or(DEFAULT_PING_TIMEOUT_SECS),
            command_timeout_secs: file
                .operator
                .command_timeout_secs
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
        },
        agent: ResolvedAgent {
            id: file.agent.id.clone().unwrap_or_else(generate_agent_id),
            agent_type: file
                .agent
                .agent_type
                .clone()
                .unwrap_or_else(|| "generic".to_string()),
            hostname: file.agent.hostname.clone().unwrap_or_else(hostname_fallback),
            display_name: file
                .agent
                .display_name
                .clone()
                .unwrap_or_else(|| file.agent.hostname.clone().unwrap_or_else(hostname_fallback)),
            tags: file.agent.tags.clone().unwrap_or_default(),
            capabilities: file.agent.capabilities.clone().unwrap_or_default(),
        },
        telemetry: ResolvedTelemetry {
            enabled: file.telemetry.enabled.unwrap_or(true),
            metrics_interval_secs: file
                .telemetry
                .metrics_interval_secs
                .unwrap_or(DEFAULT_METRICS_INTERVAL_SECS),
            report_system_metrics: file.telemetry.report_system_metrics.unwrap_or(true),
        },
        executor: ResolvedExecutor {
            max_concurrent_tasks: file
                .executor
                .max_concurrent_tasks
                .unwrap_or(DEFAULT_MAX_CONCURRENT_TASKS),
            task_timeout_secs: file
                .executor
                .task_timeout_secs
                .unwrap_or(DEFAULT_TASK_TIMEOUT_SECS),
            allowed_commands: file.executor.allowed_commands.clone().unwrap_or_default(),
            blocked_commands,
        },
        logging: ResolvedLogging {
            level: file.logging.level.clone().unwrap_or_else(|| "info".to_string()),
            file: file.logging.file.clone(),
            format: file.logging.format.clone().unwrap_or_else(|| "pretty".to_string()),
        },
    })
}

fn hostname_fallback() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .unwrap_or_else(|| "unknown-host".to_string())
}

// ---------------------------------------------------------------------------
// Config init
// ---------------------------------------------------------------------------

/// Default path for `--init-config`: `<config_dir>/agentd/config.toml`.
///
/// # Errors
///
/// Returns `ConfigError::NoConfigDir` if the platform config directory cannot be determined.
pub fn default_init_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|d| d.join("agentd").join("config.toml"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Create a default config file at the given path (or the default XDG path).
///
/// # Errors
///
/// - `ConfigError::AlreadyExists` if the file already exists
/// - `ConfigError::Io` on I/O failure
/// - `ConfigError::NoConfigDir` if no target path and platform config dir unknown
pub fn init_config(target_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let path = match target_path {
        Some(p) => p.to_path_buf(),
        None => default_init_path()?,
    };

    init_config_to(&path)
}

/// Testable variant of [`init_config`] that writes to an explicit path.
///
/// # Errors
///
/// - `ConfigError::AlreadyExists` if the file already exists
/// - `ConfigError::Io` on I/O failure
pub fn init_config_to(path: &Path) -> Result<PathBuf, ConfigError> {
    if path.exists() {
        return Err(ConfigError::AlreadyExists(path.to_path_buf()));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(path.to_path_buf())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
