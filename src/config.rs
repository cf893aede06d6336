use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::resilience::{BackoffStrategy, CircuitBreakerConfig, RetryConfig};

/// Main configuration structure for the simulation pipeline
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MqiConfig {
    pub database: DatabaseConfig,
    /// Cluster connection and batch job settings
    pub hpc: HpcConfig,
    pub paths: PathsConfig,
    /// Local tools run before upload and after download
    pub executables: ExecutablesConfig,
    pub processing: ProcessingConfig,
    pub gpu: GpuConfig,
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub observability: ObservabilityConfig,
    /// Parameters written into every generated `moqui_tps.in`
    pub tps: TpsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite connection string
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HpcConfig {
    pub host: String,
    pub user: String,
    pub port: u16,
    /// Private key passed to ssh with `-i`
    pub key_file: Option<String>,
    pub connect_timeout_seconds: u64,
    /// Upper bound on a single remote command or transfer
    pub command_timeout_seconds: u64,
    /// Remote case root; `{case_id}` and `{beam_id}` are substituted when present
    pub remote_case_path_template: String,
    pub moqui_binary: String,
    pub partition: String,
    /// Slurm `--time` limit, e.g. `02:00:00`
    pub time_limit: String,
    pub poll_interval_seconds: u64,
    pub job_timeout_seconds: u64,
    /// Directory holding the ssh ControlMaster sockets
    pub control_dir: String,
    pub ssh_binary: String,
    pub scp_binary: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Local result root; `{case_id}` is substituted
    pub final_dicom_directory: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutablesConfig {
    pub python_interpreter: String,
    /// Input interpreter script; preprocessing is skipped when unset
    pub mqi_interpreter: Option<String>,
    /// Placeholders: `{beam_dir}`, `{output_dir}`
    pub mqi_interpreter_args: Vec<String>,
    pub raw_to_dcm: Option<String>,
    /// Placeholders: `{input_file}`, `{output_dir}`, `{beam_dir}`
    pub raw_to_dcm_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub local_execution_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GpuConfig {
    pub monitor_interval_seconds: u64,
    pub stop_timeout_seconds: u64,
    pub min_memory_mb: i64,
    pub query_command: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub strategy: BackoffStrategy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON log lines instead of plain text
    pub json: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TpsConfig {
    pub parameters: BTreeMap<String, String>,
}

impl Default for MqiConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            hpc: HpcConfig::default(),
            paths: PathsConfig::default(),
            executables: ExecutablesConfig::default(),
            processing: ProcessingConfig::default(),
            gpu: GpuConfig::default(),
            retry: RetrySettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            observability: ObservabilityConfig::default(),
            tps: TpsConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/mqi.db".to_string(),
            max_connections: 10,
            auto_migrate: true,
        }
    }
}

impl Default for HpcConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            user: "mqi".to_string(),
            port: 22,
            key_file: None,
            connect_timeout_seconds: 30,
            command_timeout_seconds: 300,
            remote_case_path_template: "/home/mqi/cases".to_string(),
            moqui_binary: "/opt/moqui/bin/moqui".to_string(),
            partition: "gpu".to_string(),
            time_limit: "02:00:00".to_string(),
            poll_interval_seconds: 30,
            job_timeout_seconds: 3600, // 1 hour
            control_dir: "/tmp".to_string(),
            ssh_binary: "ssh".to_string(),
            scp_binary: "scp".to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            final_dicom_directory: "data/results/{case_id}".to_string(),
        }
    }
}

impl Default for ExecutablesConfig {
    fn default() -> Self {
        Self {
            python_interpreter: "python3".to_string(),
            mqi_interpreter: None,
            mqi_interpreter_args: vec![
                "{beam_dir}".to_string(),
                "--output_dir".to_string(),
                "{output_dir}".to_string(),
            ],
            raw_to_dcm: None,
            raw_to_dcm_args: vec![
                "--input".to_string(),
                "{input_file}".to_string(),
                "--output".to_string(),
                "{output_dir}".to_string(),
                "--case".to_string(),
                "{beam_dir}".to_string(),
            ],
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            local_execution_timeout_seconds: 300,
        }
    }
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            monitor_interval_seconds: 30,
            stop_timeout_seconds: 10,
            min_memory_mb: 1000,
            query_command: "nvidia-smi --query-gpu=uuid,name,memory.total,memory.used,memory.free,temperature.gpu,utilization.gpu --format=csv,noheader,nounits".to_string(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_seconds: 60,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

impl HpcConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(1))
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    /// Remote directory for one beam's inputs and outputs
    pub fn remote_beam_dir(&self, case_id: &str, beam_id: &str) -> String {
        let template = &self.remote_case_path_template;
        if template.contains("{case_id}") || template.contains("{beam_id}") {
            let root = template.replace("{case_id}", case_id).replace("{beam_id}", beam_id);
            if template.contains("{beam_id}") {
                return root;
            }
            return format!("{}/{}", root.trim_end_matches('/'), beam_id);
        }
        format!("{}/{}/{}", template.trim_end_matches('/'), case_id, beam_id)
    }
}

impl PathsConfig {
    pub fn result_dir(&self, case_id: &str) -> std::path::PathBuf {
        std::path::PathBuf::from(self.final_dicom_directory.replace("{case_id}", case_id))
    }
}

impl GpuConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_seconds.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        RetryConfig {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            strategy: settings.strategy,
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        CircuitBreakerConfig {
            failure_threshold: settings.failure_threshold.max(1),
            timeout: Duration::from_secs(settings.timeout_seconds),
        }
    }
}

impl MqiConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (mqi.toml, .mqi-rc)
    /// 3. Environment variables (prefixed with MQI_, sections split on `__`)
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path));
            }
            None => {
                if Path::new("mqi.toml").exists() {
                    builder = builder.add_source(File::with_name("mqi"));
                }
                if Path::new(".mqi-rc").exists() {
                    builder = builder
                        .add_source(File::new(".mqi-rc", config::FileFormat::Toml));
                }
            }
        }

        // Override with environment variables
        builder = builder.add_source(
            Environment::with_prefix("MQI")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let mqi_config: MqiConfig = config.try_deserialize()?;
        Ok(mqi_config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
