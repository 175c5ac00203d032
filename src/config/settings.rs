//! TOML-based configuration for forms2xml.
//!
//! Supports a config file (forms2xml.toml) with environment variable expansion
//! in worker arguments and environment.
//!
//! Example configuration:
//! ```toml
//! [worker]
//! transport = "pipe"
//! program = "java"
//! args = ["-cp", "${FORMS_CLASSPATH}", "unosoft.forms.Serve"]
//! concurrency = 4
//! max_retries = 3
//! retry_backoff = "1s"
//! respawn_backoff = "3s"
//!
//! [worker.env]
//! ORACLE_HOME = "/u01/app/oracle/product/11.1.2/fmw"
//!
//! [remote]
//! decode_url = "http://localhost:8008"
//!
//! [rewrite]
//! cell_width = 12
//! cell_height = 24
//!
//! [pipeline]
//! suffix = "-v11"
//! snapshots = true
//! max_concurrent_jobs = 8
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::convert::RetryPolicy;
use crate::pipeline::BatchOptions;
use crate::rewrite::RewriteConfig;
use crate::worker::{PoolConfig, TransportKind, WorkerCommand};

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid duration format: {0}")]
    InvalidDuration(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Converter worker processes.
    pub worker: WorkerSettings,

    /// Remote converter endpoints.
    pub remote: RemoteSettings,

    /// XML rewrite rules.
    pub rewrite: RewriteSettings,

    /// Job pipeline.
    pub pipeline: PipelineSettings,
}

/// Worker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// How the pool talks to a worker: "pipe" or "http".
    pub transport: TransportKind,

    /// Program to start.
    pub program: String,

    /// Arguments placed before the transport address (supports ${ENV_VAR}).
    pub args: Vec<String>,

    /// Extra environment for the worker process (values support ${ENV_VAR}).
    pub env: HashMap<String, String>,

    /// Number of worker slots.
    pub concurrency: usize,

    /// Attempts per call.
    pub max_retries: u32,

    /// Per-attempt backoff step (e.g., "1s").
    pub retry_backoff: String,

    /// Wait between failed spawns (e.g., "3s").
    pub respawn_backoff: String,

    /// Time allowed for an http worker to start listening.
    pub startup_timeout: String,

    /// Directory for spooled payloads and worker output.
    pub work_dir: Option<PathBuf>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            transport: TransportKind::Pipe,
            program: "java".to_string(),
            args: vec![
                "-cp".to_string(),
                "${FORMS_CLASSPATH}".to_string(),
                "unosoft.forms.Serve".to_string(),
            ],
            env: HashMap::new(),
            concurrency: 4,
            max_retries: 3,
            retry_backoff: "1s".to_string(),
            respawn_backoff: "3s".to_string(),
            startup_timeout: "60s".to_string(),
            work_dir: None,
        }
    }
}

impl WorkerSettings {
    /// Build the worker command with environment variables expanded.
    pub fn to_command(&self) -> Result<WorkerCommand, SettingsError> {
        let args = self
            .args
            .iter()
            .map(|arg| expand_env_vars(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let env = self
            .env
            .iter()
            .map(|(key, value)| Ok((key.clone(), expand_env_vars(value)?)))
            .collect::<Result<Vec<_>, SettingsError>>()?;

        Ok(WorkerCommand {
            program: PathBuf::from(expand_env_vars(&self.program)?),
            args,
            env,
            current_dir: Some(self.resolved_work_dir()),
        })
    }

    /// Pool configuration with the given retry bound.
    pub fn to_pool_config(&self, max_retries: u32) -> Result<PoolConfig, SettingsError> {
        Ok(PoolConfig {
            concurrency: self.concurrency,
            retry: RetryPolicy {
                max_retries,
                backoff_step: parse_duration(&self.retry_backoff)?,
            },
            respawn_backoff: parse_duration(&self.respawn_backoff)?,
            work_dir: self.resolved_work_dir(),
        })
    }

    /// Startup timeout for http workers.
    pub fn startup_timeout(&self) -> Result<Duration, SettingsError> {
        parse_duration(&self.startup_timeout)
    }

    /// Configured work directory or the system temp dir.
    pub fn resolved_work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(env::temp_dir)
    }
}

/// Remote endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// Endpoint converting forms to XML.
    pub decode_url: Option<String>,

    /// Endpoint converting XML to forms.
    pub encode_url: Option<String>,

    /// Attempts per call.
    pub max_retries: u32,

    /// Per-attempt backoff step.
    pub retry_backoff: String,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            decode_url: None,
            encode_url: None,
            max_retries: 3,
            retry_backoff: "1s".to_string(),
        }
    }
}

impl RemoteSettings {
    /// Retry policy for remote calls.
    pub fn retry_policy(&self) -> Result<RetryPolicy, SettingsError> {
        Ok(RetryPolicy {
            max_retries: self.max_retries,
            backoff_step: parse_duration(&self.retry_backoff)?,
        })
    }
}

/// Rewrite rule parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RewriteSettings {
    /// Pixels per character cell, horizontally.
    pub cell_width: i64,

    /// Pixels per character cell, vertically.
    pub cell_height: i64,

    /// Visual attributes every module must declare.
    pub required_visual_attributes: Vec<String>,

    /// Module parameters every module must declare.
    pub required_parameters: Vec<String>,
}

impl Default for RewriteSettings {
    fn default() -> Self {
        let defaults = RewriteConfig::default();
        Self {
            cell_width: defaults.cell_width,
            cell_height: defaults.cell_height,
            required_visual_attributes: defaults.required_visual_attributes,
            required_parameters: defaults.required_parameters,
        }
    }
}

impl RewriteSettings {
    pub fn to_config(&self) -> RewriteConfig {
        RewriteConfig {
            cell_width: self.cell_width,
            cell_height: self.cell_height,
            required_visual_attributes: self.required_visual_attributes.clone(),
            required_parameters: self.required_parameters.clone(),
        }
    }
}

/// Job pipeline configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Appended to the source stem when deriving a roundtrip destination.
    pub suffix: String,

    /// Run the rewrite stage during roundtrips.
    pub rewrite: bool,

    /// Keep intermediate XML next to source and destination.
    pub snapshots: bool,

    /// Pool retry bound when the pool serves the pipeline.
    pub max_retries: u32,

    /// Jobs in flight during a batch.
    pub max_concurrent_jobs: usize,

    /// Whole-job attempts during a batch.
    pub job_retries: u32,

    /// Linear backoff step between whole-job attempts.
    pub job_retry_backoff: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            suffix: "-v11".to_string(),
            rewrite: true,
            snapshots: true,
            max_retries: 2,
            max_concurrent_jobs: 8,
            job_retries: 10,
            job_retry_backoff: "1s".to_string(),
        }
    }
}

impl PipelineSettings {
    /// Limits for the batch runner; `max_concurrent_jobs` overrides the file.
    pub fn batch_options(
        &self,
        max_concurrent_jobs: Option<usize>,
    ) -> Result<BatchOptions, SettingsError> {
        Ok(BatchOptions {
            max_concurrent_jobs: max_concurrent_jobs.unwrap_or(self.max_concurrent_jobs),
            job_retries: self.job_retries,
            job_retry_backoff: parse_duration(&self.job_retry_backoff)?,
        })
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `FORMS2XML_CONFIG`
    /// 2. `./forms2xml.toml`
    /// 3. `~/.config/forms2xml/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("FORMS2XML_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("forms2xml.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("forms2xml").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }
}

/// Parse a duration such as `"250ms"`, `"3s"`, `"5m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, SettingsError> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| SettingsError::InvalidDuration(s.to_string()))?;
    let (amount, unit) = s.split_at(split);
    let amount: u64 = amount
        .parse()
        .map_err(|_| SettingsError::InvalidDuration(s.to_string()))?;

    match unit {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 3600)),
        _ => Err(SettingsError::InvalidDuration(s.to_string())),
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if !(ch.is_alphanumeric() || ch == '_') {
                    break;
                }
                var_name.push(ch);
                chars.next();
            }
            if var_name.is_empty() {
                // Just a lone $, keep it
                result.push('$');
                continue;
            }
        }

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
