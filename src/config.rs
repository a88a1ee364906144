use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::DEFAULT_QUEUE_CAPACITY;
use crate::pattern::{builtin_rules, PatternEngine, PatternError, RuleSpec};
use crate::recorder::RecordingOptions;
use crate::session::SessionLimits;

/// Host configuration, loaded from TOML. Every section and field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sessions: SessionsConfig,
    pub patterns: PatternsConfig,
    pub monitor: MonitorConfig,
    pub bridge: BridgeConfig,
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Required for non-loopback binds; generated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 7681)),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// `0` lifts the limit.
    pub max_sessions: usize,
    pub output_buffer_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_shell: Option<String>,
    pub rows: u16,
    pub cols: u16,
    pub allowed_shells: Vec<String>,
    /// End a terminal client's sessions when its connection drops.
    pub terminate_on_disconnect: bool,
    pub exit_drain_grace_ms: u64,
    pub kill_grace_ms: u64,
    pub input_history: usize,
    /// How long a session left running by a dropped client waits to be
    /// attached again. `0` keeps it until shutdown.
    pub detached_ttl_ms: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        let limits = SessionLimits::default();
        Self {
            max_sessions: limits.max_sessions.unwrap_or(0),
            output_buffer_bytes: limits.output_buffer_bytes,
            default_shell: None,
            rows: limits.default_rows,
            cols: limits.default_cols,
            allowed_shells: Vec::new(),
            terminate_on_disconnect: true,
            exit_drain_grace_ms: limits.exit_drain_grace.as_millis() as u64,
            kill_grace_ms: limits.kill_grace.as_millis() as u64,
            input_history: limits.input_history,
            detached_ttl_ms: limits
                .detached_ttl
                .map_or(0, |ttl| ttl.as_millis() as u64),
        }
    }
}

impl SessionsConfig {
    pub fn limits(&self) -> SessionLimits {
        SessionLimits {
            max_sessions: (self.max_sessions > 0).then_some(self.max_sessions),
            output_buffer_bytes: self.output_buffer_bytes,
            default_shell: self.default_shell.clone(),
            default_rows: self.rows,
            default_cols: self.cols,
            allowed_shells: self.allowed_shells.clone(),
            exit_drain_grace: Duration::from_millis(self.exit_drain_grace_ms),
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            input_history: self.input_history,
            detached_ttl: (self.detached_ttl_ms > 0)
                .then(|| Duration::from_millis(self.detached_ttl_ms)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternsConfig {
    /// Include the built-in rule set.
    pub builtin: bool,
    /// Trailing-context window in bytes.
    pub window: usize,
    /// Detections remembered per session for context queries.
    pub recent: usize,
    pub rules: Vec<RuleSpec>,
}

impl Default for PatternsConfig {
    fn default() -> Self {
        Self {
            builtin: true,
            window: PatternEngine::DEFAULT_WINDOW,
            recent: PatternEngine::DEFAULT_RECENT_LIMIT,
            rules: Vec::new(),
        }
    }
}

impl PatternsConfig {
    /// Built-ins (when enabled) followed by the configured rules.
    pub fn rule_specs(&self) -> Vec<RuleSpec> {
        let mut specs = if self.builtin { builtin_rules() } else { Vec::new() };
        specs.extend(self.rules.iter().cloned());
        specs
    }

    pub fn engine(&self) -> Result<PatternEngine, PatternError> {
        Ok(PatternEngine::from_specs(&self.rule_specs())?
            .with_window(self.window)
            .with_recent_limit(self.recent))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub history_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Per-client delivery queue; a client that falls this far behind is
    /// dropped from the affected subscription.
    pub queue_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// JSON Lines file every session event is appended to. Unset disables
    /// recording.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub include_input: bool,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            path: None,
            include_input: true,
        }
    }
}

impl RecordingConfig {
    pub fn options(&self) -> Option<RecordingOptions> {
        self.path.clone().map(|path| RecordingOptions {
            path,
            include_input: self.include_input,
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid pattern rules: {0}")]
    Patterns(#[from] PatternError),
}

impl Config {
    /// `$XDG_CONFIG_HOME/termbridge/config.toml` or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("termbridge").join("config.toml"))
    }

    /// Load config from a TOML file. Returns `None` if the file doesn't exist.
    ///
    /// Rules are compiled once here so a bad regex fails at startup rather
    /// than on the first session.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(Some(config))
    }

    /// Missing file means defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Ok(Self::load(path)?.unwrap_or_default()),
            None => Ok(Self::default()),
        }
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.patterns.engine()?;
        Ok(config)
    }
}

/// Warn if a config file holding a token is world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let mode = metadata.permissions().mode();
    if !is_world_readable(mode) {
        return;
    }
    let has_token = std::fs::read_to_string(path)
        .ok()
        .and_then(|s| toml::from_str::<Config>(&s).ok())
        .is_some_and(|c| c.server.token.is_some());
    if has_token {
        tracing::warn!(
            "config file {} is world-readable (mode {:o}) and contains a token; \
             consider restricting permissions to 600",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.bind.port(), 7681);
        assert!(config.server.bind.ip().is_loopback());
        assert!(config.patterns.builtin);
        assert!(config.sessions.terminate_on_disconnect);
        assert_eq!(config.bridge.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert!(config.recording.options().is_none());
        assert_eq!(
            config.sessions.limits().detached_ttl,
            Some(Duration::from_secs(300))
        );
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [server]
            bind = "0.0.0.0:9000"
            token = "secret"

            [sessions]
            max_sessions = 4
            default_shell = "/bin/sh"
            allowed_shells = ["/bin/sh", "/bin/bash"]
            terminate_on_disconnect = false
            kill_grace_ms = 250
            detached_ttl_ms = 0

            [patterns]
            builtin = false
            window = 128

            [[patterns.rules]]
            name = "deploy-done"
            pattern = "deployed to \\w+"
            severity = "info"
            action = "open-dashboard"
            label = "Open dashboard ({match})"

            [monitor]
            history_capacity = 200

            [bridge]
            queue_capacity = 16

            [recording]
            path = "/var/log/termbridge.jsonl"
            include_input = false
        "#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.server.token.as_deref(), Some("secret"));
        let limits = config.sessions.limits();
        assert_eq!(limits.max_sessions, Some(4));
        assert_eq!(limits.kill_grace, Duration::from_millis(250));
        assert_eq!(limits.allowed_shells.len(), 2);
        assert!(!config.sessions.terminate_on_disconnect);
        assert_eq!(limits.detached_ttl, None);

        let engine = config.patterns.engine().unwrap();
        assert_eq!(engine.rules().len(), 1);
        assert_eq!(engine.window(), 128);
        assert_eq!(config.monitor.history_capacity, 200);
        assert_eq!(config.bridge.queue_capacity, 16);
        let recording = config.recording.options().unwrap();
        assert_eq!(recording.path, PathBuf::from("/var/log/termbridge.jsonl"));
        assert!(!recording.include_input);
    }

    #[test]
    fn zero_max_sessions_means_unlimited() {
        let config = Config::parse("[sessions]\nmax_sessions = 0\n").unwrap();
        assert_eq!(config.sessions.limits().max_sessions, None);
    }

    #[test]
    fn configured_rules_extend_builtins() {
        let config = Config::parse(
            r#"
            [[patterns.rules]]
            name = "custom"
            pattern = "boom"
            "#,
        )
        .unwrap();
        let specs = config.patterns.rule_specs();
        assert_eq!(specs.len(), builtin_rules().len() + 1);
        assert_eq!(specs.last().map(|s| s.name.as_str()), Some("custom"));
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let err = Config::parse(
            r#"
            [[patterns.rules]]
            name = "broken"
            pattern = "(unclosed"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Patterns(PatternError::InvalidRegex { .. })));
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn duplicate_builtin_name_is_rejected() {
        let err = Config::parse(
            r#"
            [[patterns.rules]]
            name = "shell-prompt"
            pattern = "> $"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Patterns(PatternError::DuplicateName(_))));
    }

    #[test]
    fn missing_file_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(Config::load(&path).unwrap().is_none());
        let config = Config::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.monitor.history_capacity, 1000);
    }

    #[test]
    fn parse_error_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[server\nbind = 1").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn world_readable_bits() {
        assert!(is_world_readable(0o644));
        assert!(is_world_readable(0o755));
        assert!(!is_world_readable(0o600));
        assert!(!is_world_readable(0o700));
    }

    #[cfg(unix)]
    #[test]
    fn check_permissions_on_world_readable_token_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\ntoken = \"t\"\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        // Only warns; loading still succeeds.
        check_config_permissions(&path);
        let config = Config::load(&path).unwrap().unwrap();
        assert_eq!(config.server.token.as_deref(), Some("t"));
    }
}
