use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Env var that overrides `--config`.
pub const CONFIG_ENV: &str = "SUPERVISOR_CONFIG";

/// Token in `health_url` replaced with the child's effective port.
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Top‑level supervisor configuration: loop settings plus the service set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

fn default_tick_interval_ms() -> u64 {
    500
}
fn default_probe_interval_ms() -> u64 {
    1000
}
fn default_probe_timeout_ms() -> u64 {
    1000
}
fn default_probe_workers() -> usize {
    4
}
fn default_unhealthy_threshold() -> u32 {
    3
}
fn default_settle_period_ms() -> u64 {
    2000
}
fn default_grace_period_ms() -> u64 {
    5000
}
fn default_port_scan_window() -> u16 {
    10
}
fn default_backoff_ceiling_secs() -> u64 {
    300
}
fn default_log_tail_bytes() -> usize {
    16 * 1024
}
fn default_readiness_timeout_secs() -> f64 {
    30.0
}

/// Loop timing and resource bounds shared by every child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Upper bound on concurrently running health probes.
    #[serde(default = "default_probe_workers")]
    pub probe_workers: usize,
    /// Consecutive non-healthy probes that flip `Ready` to `Unhealthy`.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    /// Run time after which a child without a health URL counts as ready.
    #[serde(default = "default_settle_period_ms")]
    pub settle_period_ms: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_port_scan_window")]
    pub port_scan_window: u16,
    #[serde(default = "default_backoff_ceiling_secs")]
    pub backoff_ceiling_secs: u64,
    /// Byte cap of each captured stdout/stderr ring.
    #[serde(default = "default_log_tail_bytes")]
    pub log_tail_bytes: usize,
    pub report_path: Option<PathBuf>,
    pub control_socket: Option<PathBuf>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_workers: default_probe_workers(),
            unhealthy_threshold: default_unhealthy_threshold(),
            settle_period_ms: default_settle_period_ms(),
            grace_period_ms: default_grace_period_ms(),
            port_scan_window: default_port_scan_window(),
            backoff_ceiling_secs: default_backoff_ceiling_secs(),
            log_tail_bytes: default_log_tail_bytes(),
            report_path: None,
            control_socket: None,
        }
    }
}

impl SupervisorSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn settle_period(&self) -> Duration {
        Duration::from_millis(self.settle_period_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_secs(self.backoff_ceiling_secs)
    }

    /// Control socket location: configured path, else `<runtime_dir>/devsup.sock`,
    /// else the temp dir.
    pub fn control_socket_path(&self) -> PathBuf {
        if let Some(path) = &self.control_socket {
            return path.clone();
        }
        dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("devsup.sock")
    }
}

/// How a conflict on `desired_port` is resolved before spawn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortResolution {
    /// Refuse to start if the port is taken.
    #[default]
    RequireExact,
    /// Terminate whatever listens on the port, then start.
    KillConflicting,
    /// Use the first free port at or above the desired one.
    FindNextFree,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    None,
    Linear,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicySpec {
    pub max_restarts: u32,
    pub cooldown_seconds: f64,
    pub backoff: Backoff,
}

impl Default for RestartPolicySpec {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            cooldown_seconds: 1.0,
            backoff: Backoff::Exponential,
        }
    }
}

impl RestartPolicySpec {
    /// Saturates for values `validate` would have rejected.
    pub fn cooldown(&self) -> Duration {
        Duration::try_from_secs_f64(self.cooldown_seconds).unwrap_or(Duration::MAX)
    }
}

/// On‑disk description of a single managed service. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub desired_port: Option<u16>,
    #[serde(default)]
    pub port_resolution: PortResolution,
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: f64,
    #[serde(default)]
    pub restart_policy: RestartPolicySpec,
    #[serde(default)]
    pub start_order: i64,
    /// A `Dead` required service blocks every later tier.
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub restart_on_unhealthy: bool,
}

impl ServiceSpec {
    /// Minimal spec with defaults everywhere but name and argv.
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
            working_directory: None,
            environment: HashMap::new(),
            desired_port: None,
            port_resolution: PortResolution::default(),
            health_url: None,
            readiness_timeout_secs: default_readiness_timeout_secs(),
            restart_policy: RestartPolicySpec::default(),
            start_order: 0,
            required: false,
            restart_on_unhealthy: false,
        }
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.readiness_timeout_secs).unwrap_or(Duration::MAX)
    }

    /// Health URL with `{port}` substituted by the effective port.
    pub fn health_url_for(&self, effective_port: Option<u16>) -> Option<String> {
        let url = self.health_url.as_ref()?;
        match effective_port {
            Some(port) => Some(url.replace(PORT_PLACEHOLDER, &port.to_string())),
            None => Some(url.clone()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.command.first().is_none_or(|program| program.is_empty()) {
            return Err(ConfigError::EmptyCommand(self.name.clone()));
        }
        if self.desired_port == Some(0) {
            return Err(ConfigError::InvalidPort {
                name: self.name.clone(),
                port: 0,
            });
        }
        if let Some(dir) = &self.working_directory
            && !dir.is_absolute()
        {
            return Err(ConfigError::RelativeWorkingDirectory {
                name: self.name.clone(),
                path: dir.clone(),
            });
        }
        // Must be representable as a `Duration`; huge finite values are not.
        if Duration::try_from_secs_f64(self.readiness_timeout_secs).is_err()
            || self.readiness_timeout_secs <= 0.0
        {
            return Err(ConfigError::InvalidDuration {
                name: self.name.clone(),
                field: "readiness_timeout_secs",
            });
        }
        if Duration::try_from_secs_f64(self.restart_policy.cooldown_seconds).is_err() {
            return Err(ConfigError::InvalidDuration {
                name: self.name.clone(),
                field: "restart_policy.cooldown_seconds",
            });
        }
        if let Some(url) = &self.health_url {
            self.validate_health_url(url)?;
        }
        Ok(())
    }

    fn validate_health_url(&self, raw: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidHealthUrl {
            name: self.name.clone(),
            url: raw.to_string(),
            reason: reason.to_string(),
        };
        if raw.contains(PORT_PLACEHOLDER) && self.desired_port.is_none() {
            return Err(invalid("uses {port} but the service declares no desired_port"));
        }
        // Any valid port works for a syntax check.
        let parsed = url::Url::parse(&raw.replace(PORT_PLACEHOLDER, "1"))
            .map_err(|e| invalid(&e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        if parsed.host_str().is_none() {
            return Err(invalid("missing host"));
        }
        Ok(())
    }
}

impl SupervisorConfig {
    /// Read, parse and validate a TOML service set.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw, path)
    }

    /// `origin` is only used in error messages.
    pub fn from_toml_str(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let cfg: SupervisorConfig = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.supervisor;
        if s.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidSetting("tick_interval_ms"));
        }
        if s.probe_interval_ms == 0 {
            return Err(ConfigError::InvalidSetting("probe_interval_ms"));
        }
        if s.probe_timeout_ms == 0 {
            return Err(ConfigError::InvalidSetting("probe_timeout_ms"));
        }
        if s.probe_workers == 0 {
            return Err(ConfigError::InvalidSetting("probe_workers"));
        }
        if s.unhealthy_threshold == 0 {
            return Err(ConfigError::InvalidSetting("unhealthy_threshold"));
        }
        if s.port_scan_window == 0 {
            return Err(ConfigError::InvalidSetting("port_scan_window"));
        }
        if s.log_tail_bytes == 0 {
            return Err(ConfigError::InvalidSetting("log_tail_bytes"));
        }

        if self.services.is_empty() {
            return Err(ConfigError::NoServices);
        }

        let mut names = HashSet::new();
        let mut exact_ports: HashMap<u16, &str> = HashMap::new();
        for svc in &self.services {
            svc.validate()?;
            if !names.insert(svc.name.as_str()) {
                return Err(ConfigError::DuplicateName(svc.name.clone()));
            }
            if let Some(port) = svc.desired_port
                && svc.port_resolution == PortResolution::RequireExact
                && let Some(first) = exact_ports.insert(port, svc.name.as_str())
            {
                return Err(ConfigError::ConflictingExactPort {
                    port,
                    first: first.to_string(),
                    second: svc.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Config path precedence: `SUPERVISOR_CONFIG`, then `--config`, then
/// `./devsup.toml`, then the per-user config dir.
pub fn resolve_config_path(cli_path: Option<PathBuf>) -> PathBuf {
    if let Some(env_path) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(env_path);
    }
    if let Some(path) = cli_path {
        return path;
    }
    let local = PathBuf::from("devsup.toml");
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("devsup").join("devsup.toml"))
        .unwrap_or(local)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<SupervisorConfig, ConfigError> {
        SupervisorConfig::from_toml_str(raw, Path::new("test.toml"))
    }

    #[test]
    fn parses_full_service_entry() {
        let cfg = parse(
            r#"
            [supervisor]
            tick_interval_ms = 100
            report_path = "/tmp/report.json"

            [[services]]
            name = "api"
            command = ["python", "-m", "http.server"]
            working_directory = "/srv/api"
            environment = { MODE = "dev" }
            desired_port = 8000
            port_resolution = "kill_conflicting"
            health_url = "http://127.0.0.1:{port}/health"
            readiness_timeout_secs = 5
            start_order = 1
            required = true
            restart_policy = { max_restarts = 2, cooldown_seconds = 0.5, backoff = "linear" }
            "#,
        )
        .unwrap();

        assert_eq!(cfg.supervisor.tick_interval_ms, 100);
        assert_eq!(cfg.supervisor.probe_interval_ms, 1000);
        let api = &cfg.services[0];
        assert_eq!(api.port_resolution, PortResolution::KillConflicting);
        assert_eq!(api.restart_policy.backoff, Backoff::Linear);
        assert_eq!(api.restart_policy.max_restarts, 2);
        assert_eq!(api.environment.get("MODE").map(String::as_str), Some("dev"));
        assert_eq!(api.readiness_timeout(), Duration::from_secs(5));
        assert!(api.required);
        assert!(!api.restart_on_unhealthy);
        assert_eq!(
            api.health_url_for(Some(8002)).as_deref(),
            Some("http://127.0.0.1:8002/health")
        );
    }

    #[test]
    fn defaults_apply_to_minimal_entry() {
        let cfg = parse(
            r#"
            [[services]]
            name = "web"
            command = ["npm", "run", "dev"]
            "#,
        )
        .unwrap();
        let web = &cfg.services[0];
        assert_eq!(web.port_resolution, PortResolution::RequireExact);
        assert_eq!(web.restart_policy, RestartPolicySpec::default());
        assert_eq!(web.start_order, 0);
        assert!(web.desired_port.is_none());
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = parse(
            r#"
            [[services]]
            name = "api"
            command = ["a"]
            [[services]]
            name = "api"
            command = ["b"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName(name) if name == "api"));
    }

    #[test]
    fn rejects_two_exact_claims_on_one_port() {
        let err = parse(
            r#"
            [[services]]
            name = "api"
            command = ["a"]
            desired_port = 8000
            [[services]]
            name = "admin"
            command = ["b"]
            desired_port = 8000
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ConflictingExactPort { port: 8000, .. }
        ));
    }

    #[test]
    fn shared_port_is_fine_when_one_side_can_move() {
        parse(
            r#"
            [[services]]
            name = "api"
            command = ["a"]
            desired_port = 8000
            [[services]]
            name = "admin"
            command = ["b"]
            desired_port = 8000
            port_resolution = "find_next_free"
            "#,
        )
        .unwrap();
    }

    #[test]
    fn rejects_out_of_range_ports() {
        let zero = parse(
            r#"
            [[services]]
            name = "api"
            command = ["a"]
            desired_port = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(zero, ConfigError::InvalidPort { port: 0, .. }));

        let too_big = parse(
            r#"
            [[services]]
            name = "api"
            command = ["a"]
            desired_port = 70000
            "#,
        )
        .unwrap_err();
        assert!(matches!(too_big, ConfigError::Parse { .. }));
    }

    #[test]
    fn rejects_bad_health_urls() {
        let relative = parse(
            r#"
            [[services]]
            name = "api"
            command = ["a"]
            health_url = "/health"
            "#,
        )
        .unwrap_err();
        assert!(matches!(relative, ConfigError::InvalidHealthUrl { .. }));

        let placeholder_without_port = parse(
            r#"
            [[services]]
            name = "api"
            command = ["a"]
            health_url = "http://localhost:{port}/"
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            placeholder_without_port,
            ConfigError::InvalidHealthUrl { .. }
        ));

        let ftp = parse(
            r#"
            [[services]]
            name = "api"
            command = ["a"]
            health_url = "ftp://localhost/"
            "#,
        )
        .unwrap_err();
        assert!(matches!(ftp, ConfigError::InvalidHealthUrl { .. }));
    }

    #[test]
    fn rejects_relative_working_directory_and_empty_command() {
        let rel = parse(
            r#"
            [[services]]
            name = "api"
            command = ["a"]
            working_directory = "srv/api"
            "#,
        )
        .unwrap_err();
        assert!(matches!(rel, ConfigError::RelativeWorkingDirectory { .. }));

        let empty = parse(
            r#"
            [[services]]
            name = "api"
            command = []
            "#,
        )
        .unwrap_err();
        assert!(matches!(empty, ConfigError::EmptyCommand(_)));
    }

    #[test]
    fn rejects_negative_cooldown() {
        let err = parse(
            r#"
            [[services]]
            name = "api"
            command = ["a"]
            restart_policy = { cooldown_seconds = -1 }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration { .. }));
    }

    #[test]
    fn rejects_durations_too_large_to_represent() {
        let readiness = parse(
            r#"
            [[services]]
            name = "api"
            command = ["a"]
            readiness_timeout_secs = 1e20
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            readiness,
            ConfigError::InvalidDuration { field: "readiness_timeout_secs", .. }
        ));

        let cooldown = parse(
            r#"
            [[services]]
            name = "api"
            command = ["a"]
            restart_policy = { cooldown_seconds = 1e20 }
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            cooldown,
            ConfigError::InvalidDuration { field: "restart_policy.cooldown_seconds", .. }
        ));
    }

    #[test]
    fn large_but_representable_durations_are_accepted() {
        let cfg = parse(
            r#"
            [supervisor]
            grace_period_ms = 9223372036854775807

            [[services]]
            name = "api"
            command = ["a"]
            readiness_timeout_secs = 1e9
            restart_policy = { cooldown_seconds = 1e9 }
            "#,
        )
        .unwrap();
        let api = &cfg.services[0];
        assert_eq!(api.readiness_timeout(), Duration::from_secs(1_000_000_000));
        assert_eq!(api.restart_policy.cooldown(), Duration::from_secs(1_000_000_000));
    }

    #[test]
    fn rejects_empty_service_set() {
        assert!(matches!(parse(""), Err(ConfigError::NoServices)));
    }
}
