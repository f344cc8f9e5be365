use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".tether";

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7682
}

fn default_poll_interval_millis() -> u64 {
    500
}

fn default_idle_debounce_millis() -> u64 {
    2000
}

fn default_step_delay_millis() -> u64 {
    50
}

fn default_pending_expiry_secs() -> u64 {
    600
}

fn default_pending_sweep_interval_secs() -> u64 {
    30
}

fn default_lease_ttl_secs() -> u64 {
    15
}

fn default_lease_heartbeat_secs() -> u64 {
    5
}

fn default_lease_sweep_interval_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Expose `/dev/inject/{session}` for pushing synthetic events.
    #[serde(default)]
    pub dev_endpoints: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            dev_endpoints: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TranscriptConfig {
    /// Root of the per-project conversation logs; `~/.claude/projects` when unset.
    #[serde(default)]
    pub projects_dir: Option<PathBuf>,
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,
    #[serde(default = "default_idle_debounce_millis")]
    pub idle_debounce_millis: u64,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            projects_dir: None,
            poll_interval_millis: default_poll_interval_millis(),
            idle_debounce_millis: default_idle_debounce_millis(),
        }
    }
}

impl TranscriptConfig {
    pub fn projects_dir(&self) -> PathBuf {
        self.projects_dir
            .clone()
            .unwrap_or_else(paths::default_projects_dir)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis.max(1))
    }

    pub fn idle_debounce(&self) -> Duration {
        Duration::from_millis(self.idle_debounce_millis)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_step_delay_millis")]
    pub step_delay_millis: u64,
    /// Prepended to session ids to form tmux session names.
    #[serde(default)]
    pub tmux_prefix: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            step_delay_millis: default_step_delay_millis(),
            tmux_prefix: String::new(),
        }
    }
}

impl DeliveryConfig {
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_millis)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PendingConfig {
    #[serde(default = "default_pending_expiry_secs")]
    pub expiry_secs: u64,
    #[serde(default = "default_pending_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            expiry_secs: default_pending_expiry_secs(),
            sweep_interval_secs: default_pending_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LeaseConfig {
    #[serde(default = "default_lease_ttl_secs")]
    pub ttl_secs: u64,
    /// Interval clients are told to heartbeat at, sent in every heartbeat ack.
    #[serde(default = "default_lease_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_lease_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lease_ttl_secs(),
            heartbeat_secs: default_lease_heartbeat_secs(),
            sweep_interval_secs: default_lease_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transcripts: TranscriptConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub pending: PendingConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.tether/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .tether/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<22} {value}\n"));
}

/// Grouped, human-readable view of the effective configuration.
pub fn render_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Server\n");
    push_kv(&mut output, "bind", &config.server.bind);
    push_kv(&mut output, "port", config.server.port);
    push_kv(&mut output, "dev_endpoints", config.server.dev_endpoints);
    output.push('\n');

    output.push_str("Transcripts\n");
    push_kv(
        &mut output,
        "projects_dir",
        config.transcripts.projects_dir().display(),
    );
    push_kv(
        &mut output,
        "poll_interval",
        format!("{}ms", config.transcripts.poll_interval_millis),
    );
    push_kv(
        &mut output,
        "idle_debounce",
        format!("{}ms", config.transcripts.idle_debounce_millis),
    );
    output.push('\n');

    output.push_str("Delivery\n");
    push_kv(
        &mut output,
        "step_delay",
        format!("{}ms", config.delivery.step_delay_millis),
    );
    let prefix = if config.delivery.tmux_prefix.is_empty() {
        "(none)"
    } else {
        config.delivery.tmux_prefix.as_str()
    };
    push_kv(&mut output, "tmux_prefix", prefix);
    output.push('\n');

    output.push_str("Pending Requests\n");
    push_kv(&mut output, "expiry", format!("{}s", config.pending.expiry_secs));
    push_kv(
        &mut output,
        "sweep_interval",
        format!("{}s", config.pending.sweep_interval_secs),
    );
    output.push('\n');

    output.push_str("Device Lease\n");
    push_kv(&mut output, "ttl", format!("{}s", config.lease.ttl_secs));
    push_kv(&mut output, "heartbeat", format!("{}s", config.lease.heartbeat_secs));
    push_kv(
        &mut output,
        "sweep_interval",
        format!("{}s", config.lease.sweep_interval_secs),
    );
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));
    output
}

pub fn render_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let mut payload = serde_json::to_value(config).context("failed to serialize config")?;
    payload["transcripts"]["projects_dir"] =
        serde_json::json!(config.transcripts.projects_dir().display().to_string());
    payload["source_path"] = serde_json::json!(config_source_label(config_path));
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = ProjectConfig::default();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 7682);
        assert!(!config.server.dev_endpoints);
        assert!(config.transcripts.projects_dir.is_none());
        assert_eq!(
            config.transcripts.poll_interval(),
            Duration::from_millis(500)
        );
        assert_eq!(config.transcripts.idle_debounce(), Duration::from_secs(2));
        assert_eq!(config.delivery.step_delay(), Duration::from_millis(50));
        assert!(config.delivery.tmux_prefix.is_empty());
        assert_eq!(config.pending.expiry_secs, 600);
        assert_eq!(config.pending.sweep_interval_secs, 30);
        assert_eq!(config.lease.ttl_secs, 15);
        assert_eq!(config.lease.heartbeat_secs, 5);
        assert_eq!(config.lease.sweep_interval_secs, 5);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[server]
bind = "0.0.0.0"
port = 9000
dev_endpoints = true

[transcripts]
projects_dir = "/var/logs/agent"
poll_interval_millis = 250
idle_debounce_millis = 1500

[delivery]
step_delay_millis = 80
tmux_prefix = "agent-"

[pending]
expiry_secs = 120
sweep_interval_secs = 10

[lease]
ttl_secs = 30
heartbeat_secs = 10
sweep_interval_secs = 3
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert!(config.server.dev_endpoints);
        assert_eq!(
            config.transcripts.projects_dir(),
            PathBuf::from("/var/logs/agent")
        );
        assert_eq!(
            config.transcripts.poll_interval(),
            Duration::from_millis(250)
        );
        assert_eq!(
            config.transcripts.idle_debounce(),
            Duration::from_millis(1500)
        );
        assert_eq!(config.delivery.step_delay_millis, 80);
        assert_eq!(config.delivery.tmux_prefix, "agent-");
        assert_eq!(config.pending.expiry_secs, 120);
        assert_eq!(config.pending.sweep_interval_secs, 10);
        assert_eq!(config.lease.ttl_secs, 30);
        assert_eq!(config.lease.heartbeat_secs, 10);
        assert_eq!(config.lease.sweep_interval_secs, 3);
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[server]
port = 8080
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.transcripts.idle_debounce_millis, 2000);
        assert_eq!(config.lease.ttl_secs, 15);
    }

    #[test]
    fn zero_poll_interval_is_clamped() {
        let toml = r#"
[transcripts]
poll_interval_millis = 0
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.transcripts.poll_interval(), Duration::from_millis(1));
    }

    #[test]
    fn load_from_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".tether");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("config.toml"),
            r#"
[delivery]
tmux_prefix = "cc-"
"#,
        )
        .unwrap();

        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert!(path.is_some());
        assert_eq!(config.delivery.tmux_prefix, "cc-");
    }

    #[test]
    fn load_returns_default_when_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.server.port, 7682);
    }

    #[test]
    fn load_walks_up_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".tether");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("config.toml"),
            r#"
[server]
port = 7700
"#,
        )
        .unwrap();

        let nested = tmp.path().join("src").join("deep").join("nested");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = ProjectConfig::load(&nested).unwrap();
        assert!(path.is_some());
        assert_eq!(config.server.port, 7700);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".tether");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config.toml"), "[server\nport = ").unwrap();

        let err = ProjectConfig::load(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn render_human_groups_sections() {
        let config = ProjectConfig::default();
        let rendered = render_human(&config, None);
        for section in ["Server", "Transcripts", "Delivery", "Pending Requests", "Device Lease"] {
            assert!(rendered.contains(section), "missing {section}");
        }
        assert!(rendered.contains("7682"));
        assert!(rendered.contains("(none)"));
        assert!(rendered.contains("no .tether/config.toml found"));
    }

    #[test]
    fn render_json_includes_resolved_paths() {
        let config = ProjectConfig::default();
        let rendered = render_json(&config, Some(Path::new("/work/.tether/config.toml"))).unwrap();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["server"]["port"], 7682);
        assert_eq!(value["lease"]["ttl_secs"], 15);
        assert!(value["transcripts"]["projects_dir"].is_string());
        assert_eq!(value["source_path"], "/work/.tether/config.toml");
    }
}
