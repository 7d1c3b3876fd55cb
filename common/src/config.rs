// Configuration management
// Service settings are layered (file, local file, env); the agent CONFIG.json lives in the secure root.

use crate::errors::ConfigFileError;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Name of the agent installation directory under the platform data root
pub const INSTALL_DIR_NAME: &str = "EndpointPilot";

/// Main settings structure containing all service configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub agent: AgentSettings,
    pub scheduler: SchedulerSettings,
    pub executor: ExecutorSettings,
    pub operations: OperationsSettings,
    pub signing: SigningSettings,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Directory under which all trusted scripts and manifests must reside
    pub secure_root: PathBuf,
    pub config_file: String,
    pub manifest_file: String,
    /// Shared automation entrypoint run in both contexts
    pub entry_script: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            secure_root: default_secure_root(),
            config_file: "CONFIG.json".to_string(),
            manifest_file: "SYSTEM-OPS.json".to_string(),
            entry_script: "MAIN.PS1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Pause between the user phase and the elevated phase of a dual-context run
    pub inter_phase_delay_seconds: u64,
    /// First-fire delay of the system operations timer
    pub system_initial_delay_seconds: u64,
    /// How long stop waits for in-flight runs before abandoning them
    pub shutdown_grace_seconds: u64,
    pub heartbeat_seconds: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            inter_phase_delay_seconds: 30,
            system_initial_delay_seconds: 120,
            shutdown_grace_seconds: 30,
            heartbeat_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    /// Optional command prefix used to place a child process into a user session.
    /// `{session}` is replaced with the resolved session id.
    pub session_launcher: Option<Vec<String>>,
    pub allowed_scripts: Vec<String>,
    pub denied_patterns: Vec<String>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            interpreter: "powershell.exe".to_string(),
            interpreter_args: vec![
                "-NoProfile".to_string(),
                "-NonInteractive".to_string(),
                "-ExecutionPolicy".to_string(),
                "Bypass".to_string(),
                "-File".to_string(),
            ],
            session_launcher: None,
            allowed_scripts: crate::executor::safety::DEFAULT_ALLOWED_SCRIPTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            denied_patterns: crate::executor::safety::DEFAULT_DENIED_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationsSettings {
    pub installer: String,
    pub service_control: String,
    pub registry_tool: String,
    pub default_install_arguments: String,
    /// Private cache for downloaded sources; defaults to a temp subdirectory
    pub download_cache_dir: Option<PathBuf>,
    pub download_timeout_seconds: u64,
}

impl Default for OperationsSettings {
    fn default() -> Self {
        Self {
            installer: "msiexec.exe".to_string(),
            service_control: "sc.exe".to_string(),
            registry_tool: "reg.exe".to_string(),
            default_install_arguments: "/quiet /norestart".to_string(),
            download_cache_dir: None,
            download_timeout_seconds: 600,
        }
    }
}

impl OperationsSettings {
    pub fn cache_dir(&self) -> PathBuf {
        self.download_cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(INSTALL_DIR_NAME))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningSettings {
    pub user_store_dir: Option<PathBuf>,
    pub machine_store_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub json_logs: bool,
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
            metrics_port: None,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Host-local overrides, never shipped
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("AGENT")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.agent.secure_root.as_os_str().is_empty() {
            return Err("Agent secure_root cannot be empty".to_string());
        }
        if self.agent.manifest_file.is_empty() {
            return Err("Agent manifest_file cannot be empty".to_string());
        }
        if self.agent.entry_script.is_empty() {
            return Err("Agent entry_script cannot be empty".to_string());
        }
        if self.executor.interpreter.is_empty() {
            return Err("Executor interpreter cannot be empty".to_string());
        }
        if self.executor.allowed_scripts.is_empty() {
            return Err("Executor allowed_scripts cannot be empty".to_string());
        }
        if let Some(launcher) = &self.executor.session_launcher {
            if launcher.is_empty() {
                return Err("Executor session_launcher must not be an empty list".to_string());
            }
        }
        if self.operations.installer.is_empty()
            || self.operations.service_control.is_empty()
            || self.operations.registry_tool.is_empty()
        {
            return Err("Operations tool programs cannot be empty".to_string());
        }
        if self.operations.download_timeout_seconds == 0 {
            return Err("Operations download_timeout_seconds must be greater than 0".to_string());
        }
        if self.scheduler.heartbeat_seconds == 0 {
            return Err("Scheduler heartbeat_seconds must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn config_file_path(&self) -> PathBuf {
        self.agent.secure_root.join(&self.agent.config_file)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.agent.secure_root.join(&self.agent.manifest_file)
    }

    pub fn entry_script_path(&self) -> PathBuf {
        self.agent.secure_root.join(&self.agent.entry_script)
    }
}

fn default_secure_root() -> PathBuf {
    if cfg!(windows) {
        let data_root =
            std::env::var_os("ProgramData").unwrap_or_else(|| "C:\\ProgramData".into());
        PathBuf::from(data_root).join(INSTALL_DIR_NAME)
    } else {
        PathBuf::from("/var/lib").join(INSTALL_DIR_NAME)
    }
}

// ============================================================================
// Agent configuration file (CONFIG.json)
// ============================================================================

pub const DEFAULT_REFRESH_MINUTES: u64 = 120;
pub const DEFAULT_USER_REFRESH_MINUTES: u64 = 30;
pub const DEFAULT_SYSTEM_REFRESH_MINUTES: u64 = 60;

/// How the scheduler lays out its timers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    /// One timer runs the entrypoint as user then elevated
    #[default]
    Dual,
    /// Separate user and system timers on their own intervals
    Split,
}

/// Per-feature skip flags consumed by the automation scripts and the agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkipFlags {
    #[serde(rename = "SkipFileOps")]
    pub file_ops: bool,
    #[serde(rename = "SkipRegOps")]
    pub reg_ops: bool,
    #[serde(rename = "SkipDriveOps")]
    pub drive_ops: bool,
    #[serde(rename = "SkipRoamOps")]
    pub roam_ops: bool,
    #[serde(rename = "SkipSchedTsk")]
    pub scheduled_tasks: bool,
    #[serde(rename = "SkipTelemetry")]
    pub telemetry: bool,
    #[serde(rename = "SkipUserCustom")]
    pub user_custom: bool,
    #[serde(rename = "SkipMaint")]
    pub maintenance: bool,
    #[serde(rename = "SkipSystemOps")]
    pub system_ops: bool,
}

/// Model for the CONFIG.json file in the secure root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    #[serde(rename = "OrgName", alias = "OrganizationName")]
    pub org_name: String,
    #[serde(rename = "Refresh_Interval", skip_serializing_if = "Option::is_none")]
    pub refresh_interval: Option<u64>,
    #[serde(rename = "UserRefreshMinutes", skip_serializing_if = "Option::is_none")]
    pub user_refresh_minutes: Option<u64>,
    #[serde(rename = "SystemRefreshMinutes", skip_serializing_if = "Option::is_none")]
    pub system_refresh_minutes: Option<u64>,
    #[serde(rename = "ScheduleMode")]
    pub schedule_mode: ScheduleMode,
    #[serde(rename = "NetworkScriptRootPath")]
    pub network_script_root_path: String,
    #[serde(rename = "CopyLogFileToNetwork")]
    pub copy_log_file_to_network: bool,
    #[serde(rename = "RoamFiles")]
    pub roam_files: bool,
    #[serde(rename = "NetworkLogFile")]
    pub network_log_file: String,
    #[serde(rename = "NetworkRoamFolder")]
    pub network_roam_folder: String,
    #[serde(flatten)]
    pub skip: SkipFlags,
}

impl AgentConfig {
    /// Read and parse CONFIG.json
    pub async fn load(path: &Path) -> Result<Self, ConfigFileError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigFileError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    /// Read CONFIG.json, falling back to built-in defaults on any failure
    pub async fn load_or_default(path: &Path) -> Self {
        match Self::load(path).await {
            Ok(config) => {
                debug!(path = %path.display(), "Agent configuration loaded");
                config
            }
            Err(ConfigFileError::NotFound(_)) => {
                warn!(path = %path.display(), "Agent configuration not found, using defaults");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Agent configuration unreadable, using defaults");
                Self::default()
            }
        }
    }

    /// Interval of the dual-context timer
    pub fn refresh_interval(&self) -> Duration {
        minutes_or(self.refresh_interval, DEFAULT_REFRESH_MINUTES)
    }

    /// Interval of the user timer in split mode
    pub fn user_interval(&self) -> Duration {
        minutes_or(self.user_refresh_minutes, DEFAULT_USER_REFRESH_MINUTES)
    }

    /// Interval of the system operations timer
    pub fn system_interval(&self) -> Duration {
        minutes_or(self.system_refresh_minutes, DEFAULT_SYSTEM_REFRESH_MINUTES)
    }
}

fn minutes_or(value: Option<u64>, default: u64) -> Duration {
    let minutes = value.filter(|m| *m > 0).unwrap_or(default);
    Duration::from_secs(minutes.saturating_mul(60))
}
