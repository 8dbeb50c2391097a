//! Application configuration for codevec.
//!
//! User config lives at `~/.codevec/codevec.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CodevecError, Result};
use crate::types::Granularity;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "codevec.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".codevec";

// ---------------------------------------------------------------------------
// Config structs (matching codevec.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Reference dataset: vocabulary tables and the inference model.
    #[serde(default)]
    pub dataset: DatasetConfig,

    /// Extraction subprocess settings.
    #[serde(default)]
    pub extract: ExtractConfig,

    /// Normalization subprocess settings.
    #[serde(default)]
    pub preprocess: PreprocessConfig,

    /// Inference subprocess settings.
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Shared vocabulary segment settings.
    #[serde(default)]
    pub segment: SegmentConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Default output root for pipeline artifacts.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Work-unit granularity: "flat" or "grouped".
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Source file extension selected by discovery.
    #[serde(default = "default_source_ext")]
    pub source_ext: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            mode: default_mode(),
            source_ext: default_source_ext(),
        }
    }
}

fn default_output_dir() -> String {
    "results".into()
}
fn default_mode() -> String {
    "grouped".into()
}
fn default_source_ext() -> String {
    "js".into()
}

/// `[dataset]` section — where the three vocabulary tables and the
/// reference model live, and the caps applied when loading them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Dataset name; also names the shared segment.
    #[serde(default = "default_dataset_name")]
    pub name: String,

    /// Directory holding `<name>.histo.{ori,path,tgt}.c2v`.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Reference model location for the inference subprocess.
    #[serde(default = "default_model_path")]
    pub model_path: String,

    /// Context window size: every normalized line has `1 + max_contexts` fields.
    #[serde(default = "default_max_contexts")]
    pub max_contexts: usize,

    /// Token vocabulary cap.
    #[serde(default = "default_word_vocab_size")]
    pub word_vocab_size: usize,

    /// Path-shape vocabulary cap.
    #[serde(default = "default_path_vocab_size")]
    pub path_vocab_size: usize,

    /// Target-label vocabulary cap.
    #[serde(default = "default_target_vocab_size")]
    pub target_vocab_size: usize,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            name: default_dataset_name(),
            data_dir: default_data_dir(),
            model_path: default_model_path(),
            max_contexts: default_max_contexts(),
            word_vocab_size: default_word_vocab_size(),
            path_vocab_size: default_path_vocab_size(),
            target_vocab_size: default_target_vocab_size(),
        }
    }
}

fn default_dataset_name() -> String {
    "js_dataset_min5".into()
}
fn default_data_dir() -> String {
    "data".into()
}
fn default_model_path() -> String {
    "models/js_dataset_min5/saved_model_iter19.release".into()
}
fn default_max_contexts() -> usize {
    200
}
fn default_word_vocab_size() -> usize {
    1_301_136
}
fn default_path_vocab_size() -> usize {
    911_417
}
fn default_target_vocab_size() -> usize {
    261_245
}

/// `[extract]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    /// Extractor argv prefix; unit arguments are appended.
    #[serde(default = "default_extract_command")]
    pub command: Vec<String>,

    /// Maximum syntactic path length.
    #[serde(default = "default_max_path_length")]
    pub max_path_length: u32,

    /// Maximum syntactic path width.
    #[serde(default = "default_max_path_width")]
    pub max_path_width: u32,

    /// Wall-clock budget per file, in seconds.
    #[serde(default = "default_extract_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            command: default_extract_command(),
            max_path_length: default_max_path_length(),
            max_path_width: default_max_path_width(),
            timeout_secs: default_extract_timeout_secs(),
        }
    }
}

fn default_extract_command() -> Vec<String> {
    vec!["python3".into(), "JSExtractor/extract.py".into()]
}
fn default_max_path_length() -> u32 {
    8
}
fn default_max_path_width() -> u32 {
    2
}
fn default_extract_timeout_secs() -> u64 {
    600
}

/// `[preprocess]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Normalizer argv prefix; unit arguments are appended.
    #[serde(default = "default_preprocess_command")]
    pub command: Vec<String>,

    /// Bounded retry count on normalizer failure.
    #[serde(default = "default_preprocess_retries")]
    pub retries: u32,

    /// Backoff between retries, in milliseconds.
    #[serde(default = "default_preprocess_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            command: default_preprocess_command(),
            retries: default_preprocess_retries(),
            backoff_ms: default_preprocess_backoff_ms(),
        }
    }
}

fn default_preprocess_command() -> Vec<String> {
    vec!["python3".into(), "preprocess_test.py".into()]
}
fn default_preprocess_retries() -> u32 {
    3
}
fn default_preprocess_backoff_ms() -> u64 {
    2_000
}

/// `[inference]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Inference argv prefix; unit arguments are appended.
    #[serde(default = "default_inference_command")]
    pub command: Vec<String>,

    /// Hard wall-clock budget per file, in seconds.
    #[serde(default = "default_inference_timeout_secs")]
    pub timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL, in seconds.
    #[serde(default = "default_inference_grace_secs")]
    pub grace_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            command: default_inference_command(),
            timeout_secs: default_inference_timeout_secs(),
            grace_secs: default_inference_grace_secs(),
        }
    }
}

fn default_inference_command() -> Vec<String> {
    vec!["python3".into(), "code2vec_only.py".into()]
}
fn default_inference_timeout_secs() -> u64 {
    600
}
fn default_inference_grace_secs() -> u64 {
    10
}

/// `[segment]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Registry directory; defaults to `~/.codevec/segments`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<String>,

    /// Bounded descriptor poll: attempt count.
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,

    /// Bounded descriptor poll: fixed interval, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            poll_attempts: default_poll_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_poll_attempts() -> u32 {
    30
}
fn default_poll_interval_ms() -> u64 {
    1_000
}

// ---------------------------------------------------------------------------
// Runtime pipeline config (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Paths of the three raw vocabulary tables for a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramPaths {
    /// Token vocabulary (`<dataset>.histo.ori.c2v`).
    pub word: PathBuf,
    /// Path-shape vocabulary (`<dataset>.histo.path.c2v`).
    pub path: PathBuf,
    /// Target-label vocabulary (`<dataset>.histo.tgt.c2v`).
    pub target: PathBuf,
}

impl HistogramPaths {
    /// Derive the conventional table file names for `dataset` under `data_dir`.
    pub fn derive(data_dir: &Path, dataset: &str) -> Self {
        Self {
            word: data_dir.join(format!("{dataset}.histo.ori.c2v")),
            path: data_dir.join(format!("{dataset}.histo.path.c2v")),
            target: data_dir.join(format!("{dataset}.histo.tgt.c2v")),
        }
    }

    /// All three paths, for existence checks and fingerprinting.
    pub fn all(&self) -> [&Path; 3] {
        [&self.word, &self.path, &self.target]
    }
}

/// The fixed configuration bundle the dispatcher propagates to every worker —
/// merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Corpus root directory.
    pub root: PathBuf,
    /// Output root for all group directories and run artifacts.
    pub output_root: PathBuf,
    /// Unit granularity.
    pub granularity: Granularity,
    /// Explicit concurrency override; `None` derives from core count.
    pub jobs: Option<usize>,
    /// Source file extension selected by discovery.
    pub source_ext: String,
    /// Dataset name; also names the shared segment.
    pub dataset: String,
    /// Raw vocabulary table locations.
    pub histograms: HistogramPaths,
    /// Reference model location.
    pub model_path: PathBuf,
    /// Context window size.
    pub max_contexts: usize,
    pub word_vocab_size: usize,
    pub path_vocab_size: usize,
    pub target_vocab_size: usize,
    pub extract: ExtractConfig,
    pub preprocess: PreprocessConfig,
    pub inference: InferenceConfig,
    /// Segment registry directory.
    pub segment_state_dir: PathBuf,
    pub poll_attempts: u32,
    pub poll_interval: Duration,
}

impl PipelineConfig {
    /// Build the runtime bundle from the loaded config and the corpus root.
    /// CLI flags mutate the returned value before the run starts.
    pub fn from_app(config: &AppConfig, root: PathBuf) -> Result<Self> {
        let granularity: Granularity = config
            .defaults
            .mode
            .parse()
            .map_err(CodevecError::config)?;
        let data_dir = PathBuf::from(&config.dataset.data_dir);
        let segment_state_dir = match &config.segment.state_dir {
            Some(dir) => PathBuf::from(dir),
            None => config_dir()?.join("segments"),
        };
        Ok(Self {
            root,
            output_root: PathBuf::from(&config.defaults.output_dir),
            granularity,
            jobs: None,
            source_ext: config.defaults.source_ext.clone(),
            dataset: config.dataset.name.clone(),
            histograms: HistogramPaths::derive(&data_dir, &config.dataset.name),
            model_path: PathBuf::from(&config.dataset.model_path),
            max_contexts: config.dataset.max_contexts,
            word_vocab_size: config.dataset.word_vocab_size,
            path_vocab_size: config.dataset.path_vocab_size,
            target_vocab_size: config.dataset.target_vocab_size,
            extract: config.extract.clone(),
            preprocess: config.preprocess.clone(),
            inference: config.inference.clone(),
            segment_state_dir,
            poll_attempts: config.segment.poll_attempts,
            poll_interval: Duration::from_millis(config.segment.poll_interval_ms),
        })
    }

    /// Validate everything a run needs before any unit work starts.
    ///
    /// Missing root, missing reference tables, and a missing reference model
    /// are all fatal configuration errors.
    pub fn validate_references(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(CodevecError::config(format!(
                "corpus root not found: {}",
                self.root.display()
            )));
        }
        for table in self.histograms.all() {
            if !table.is_file() {
                return Err(CodevecError::config(format!(
                    "vocabulary table not found: {}",
                    table.display()
                )));
            }
        }
        if !reference_model_present(&self.model_path) {
            return Err(CodevecError::config(format!(
                "reference model not found: {}",
                self.model_path.display()
            )));
        }
        Ok(())
    }
}

/// A reference model may be a file, a directory, or a checkpoint prefix
/// (`saved_model_iter19.release` naming sibling files).
pub fn reference_model_present(path: &Path) -> bool {
    if path.exists() {
        return true;
    }
    let (Some(parent), Some(stem)) = (path.parent(), path.file_name()) else {
        return false;
    };
    let Some(stem) = stem.to_str() else {
        return false;
    };
    let Ok(entries) = std::fs::read_dir(parent) else {
        return false;
    };
    entries
        .flatten()
        .any(|e| e.file_name().to_string_lossy().starts_with(stem))
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.codevec/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CodevecError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.codevec/codevec.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CodevecError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| CodevecError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CodevecError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CodevecError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CodevecError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
