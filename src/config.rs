//! Global configuration parsing, validation, and environment overrides.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::session::registry::RegistryConfig;
use crate::session::{SpawnSpec, Termination};
use crate::workers::llama::{LlamaSettings, DEFAULT_LLAMA_CLI};
use crate::workers::profile::WorkerProfile;
use crate::workers::vision::{VisionFamily, VisionWorker, DEFAULT_DEVICE};
use crate::{AppError, Result};

/// Environment variable overriding [`GlobalConfig::python_venv_path`].
pub const PYTHON_VENV_PATH_ENV: &str = "PYTHON_VENV_PATH";

/// Session registry tunables.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RegistrySettings {
    /// Fallback interval between output checks while waiting.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Time a closing worker gets before it is terminated.
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
        }
    }
}

impl RegistrySettings {
    /// Registry tunables as durations.
    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_seconds),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_shutdown_grace_seconds() -> u64 {
    5
}

fn default_ready_timeout_seconds() -> u64 {
    180
}

fn default_response_timeout_seconds() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_python() -> String {
    "python3".into()
}

fn default_llama_cli() -> String {
    DEFAULT_LLAMA_CLI.into()
}

fn default_device() -> String {
    DEFAULT_DEVICE.into()
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("python/models/vision")
}

/// How a configured worker is launched.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerLaunch {
    /// Any program speaking the marker/sentinel protocol.
    Command {
        /// Executable.
        program: String,
        /// Arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Readiness marker.
        ready_marker: String,
        /// Response sentinel.
        sentinel: String,
        /// Shutdown signal.
        #[serde(default)]
        termination: Termination,
        /// Whether stderr is captured.
        #[serde(default = "default_true")]
        capture_stderr: bool,
    },
    /// Interactive `llama-cli` serving a GGUF model.
    Llama {
        /// `llama-cli` executable.
        #[serde(default = "default_llama_cli")]
        binary: String,
        /// Model file.
        model_path: String,
        /// CPU threads; 0 leaves the default.
        #[serde(default)]
        threads: usize,
        /// Tokens per answer; 0 leaves the default.
        #[serde(default)]
        n_predict: u32,
        /// Batch size; 0 leaves the default.
        #[serde(default)]
        batch_size: u32,
        /// Disable memory mapping.
        #[serde(default)]
        no_mmap: bool,
    },
    /// Python vision model script.
    Vision {
        /// Model family.
        family: VisionFamily,
        /// Model directory.
        model_path: String,
        /// Compute device.
        #[serde(default = "default_device")]
        device: String,
        /// Directory holding the family scripts.
        #[serde(default = "default_scripts_dir")]
        scripts_dir: PathBuf,
    },
}

/// One named worker entry under `[workers.<name>]`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkerConfig {
    /// Cache key; defaults to the model path, or the worker name for commands.
    #[serde(default)]
    pub key: Option<String>,
    /// Readiness window.
    #[serde(default = "default_ready_timeout_seconds")]
    pub ready_timeout_seconds: u64,
    /// Per-response window.
    #[serde(default = "default_response_timeout_seconds")]
    pub response_timeout_seconds: u64,
    /// Working directory for the worker process.
    #[serde(default)]
    pub current_dir: Option<PathBuf>,
    /// Launch description.
    #[serde(flatten)]
    pub launch: WorkerLaunch,
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Python interpreter used for vision workers.
    #[serde(default = "default_python")]
    pub python_venv_path: String,
    /// Session registry tunables.
    #[serde(default)]
    pub registry: RegistrySettings,
    /// Named workers.
    #[serde(default)]
    pub workers: HashMap<String, WorkerConfig>,
}

impl GlobalConfig {
    /// Load configuration from a TOML file and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(python) = lookup(PYTHON_VENV_PATH_ENV).filter(|v| !v.is_empty()) {
            info!(python, "python interpreter overridden from environment");
            self.python_venv_path = python;
        }
    }

    /// Build the profile of the worker configured under `name`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no such worker is configured.
    pub fn profile(&self, name: &str) -> Result<WorkerProfile> {
        let worker = self
            .workers
            .get(name)
            .ok_or_else(|| AppError::Config(format!("unknown worker: {name}")))?;

        let mut profile = match &worker.launch {
            WorkerLaunch::Command {
                program,
                args,
                ready_marker,
                sentinel,
                termination,
                capture_stderr,
            } => {
                let spec = SpawnSpec::new(program.clone())
                    .args(args.iter().cloned())
                    .termination(*termination)
                    .capture_stderr(*capture_stderr);
                WorkerProfile::new(name, spec, ready_marker.clone(), sentinel.clone())
            }
            WorkerLaunch::Llama {
                binary,
                model_path,
                threads,
                n_predict,
                batch_size,
                no_mmap,
            } => LlamaSettings {
                model_path: model_path.clone(),
                threads: *threads,
                n_predict: *n_predict,
                batch_size: *batch_size,
                no_mmap: *no_mmap,
                prompt: None,
            }
            .profile(binary),
            WorkerLaunch::Vision {
                family,
                model_path,
                device,
                scripts_dir,
            } => {
                let mut vision = VisionWorker::new(
                    *family,
                    self.python_venv_path.clone(),
                    scripts_dir,
                    model_path.clone(),
                );
                vision.device.clone_from(device);
                vision.profile()
            }
        };

        if let Some(key) = &worker.key {
            profile.key.clone_from(key);
        }
        if let Some(dir) = &worker.current_dir {
            profile.spec.current_dir = Some(dir.clone());
        }
        Ok(profile.with_timeouts(
            Duration::from_secs(worker.ready_timeout_seconds),
            Duration::from_secs(worker.response_timeout_seconds),
        ))
    }

    fn validate(&self) -> Result<()> {
        if self.registry.poll_interval_ms == 0 {
            return Err(AppError::Config(
                "registry.poll_interval_ms must be greater than zero".into(),
            ));
        }

        for (name, worker) in &self.workers {
            if let WorkerLaunch::Command {
                program,
                ready_marker,
                sentinel,
                ..
            } = &worker.launch
            {
                if program.is_empty() {
                    return Err(AppError::Config(format!(
                        "workers.{name}.program must not be empty"
                    )));
                }
                if ready_marker.is_empty() || sentinel.is_empty() {
                    return Err(AppError::Config(format!(
                        "workers.{name} needs a non-empty ready_marker and sentinel"
                    )));
                }
            }
            if worker.response_timeout_seconds == 0 {
                return Err(AppError::Config(format!(
                    "workers.{name}.response_timeout_seconds must be greater than zero"
                )));
            }
        }

        Ok(())
    }
}
