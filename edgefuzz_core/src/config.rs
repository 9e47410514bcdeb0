use crate::corpus::CrashDedup;
use crate::executor::{CommandExecutorConfig, InputDelivery};
use crate::scheduler::SchedulerKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigInputDelivery {
    #[default]
    StdIn,
    File {
        template: String,
    },
}

impl From<ConfigInputDelivery> for InputDelivery {
    fn from(delivery: ConfigInputDelivery) -> Self {
        match delivery {
            ConfigInputDelivery::StdIn => InputDelivery::StdIn,
            ConfigInputDelivery::File { template } => InputDelivery::File(template),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorSettings {
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub input_delivery: ConfigInputDelivery,
    pub working_dir: Option<PathBuf>,
    pub harness_error_exit_code: Option<i32>,
    pub instrumented_edges_file: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    pub corpus_dir: Option<PathBuf>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    pub coverage_dir: Option<PathBuf>,
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for CorpusSettings {
    fn default() -> Self {
        Self {
            corpus_dir: None,
            output_dir: default_output_dir(),
            coverage_dir: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    pub max_runs: Option<u64>,
    pub max_time_secs: Option<u64>,
    #[serde(default = "default_max_crashes")]
    pub max_crashes: u64,
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default = "default_mutation_depth")]
    pub mutation_depth: usize,
    #[serde(default = "default_len_control_factor")]
    pub len_control_factor: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub seed: Option<u64>,
    #[serde(default)]
    pub scheduler: SchedulerKind,
    #[serde(default)]
    pub crash_dedup: CrashDedup,
    #[serde(default)]
    pub allowed_failures: Vec<String>,
    #[serde(default)]
    pub dictionary: Vec<String>,
    #[serde(default)]
    pub dictionary_files: Vec<PathBuf>,
}

pub fn default_max_crashes() -> u64 {
    100
}
pub fn default_max_len() -> usize {
    1024
}
pub fn default_mutation_depth() -> usize {
    5
}
pub fn default_len_control_factor() -> u64 {
    200
}
pub fn default_timeout_ms() -> u64 {
    3000
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_runs: None,
            max_time_secs: None,
            max_crashes: default_max_crashes(),
            max_len: default_max_len(),
            mutation_depth: default_mutation_depth(),
            len_control_factor: default_len_control_factor(),
            timeout_ms: default_timeout_ms(),
            seed: None,
            scheduler: SchedulerKind::default(),
            crash_dedup: CrashDedup::default(),
            allowed_failures: Vec::new(),
            dictionary: Vec::new(),
            dictionary_files: Vec::new(),
        }
    }
}

impl FuzzerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn max_time(&self) -> Option<Duration> {
        self.max_time_secs.map(Duration::from_secs)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EdgefuzzConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub corpus: CorpusSettings,
    #[serde(default)]
    pub executor: ExecutorSettings,
}

impl EdgefuzzConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        Self::from_toml(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e))
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Builds the command executor settings, or `None` if no target command is configured.
    pub fn command_executor_config(&self) -> Option<CommandExecutorConfig> {
        if self.executor.command.is_empty() {
            return None;
        }
        Some(CommandExecutorConfig {
            command: self.executor.command.clone(),
            input_delivery: self.executor.input_delivery.clone().into(),
            working_dir: self.executor.working_dir.clone(),
            harness_error_exit_code: self.executor.harness_error_exit_code,
            allowed_failures: self.fuzzer.allowed_failures.iter().cloned().collect(),
            instrumented_edges_file: self.executor.instrumented_edges_file.clone(),
        })
    }
}
