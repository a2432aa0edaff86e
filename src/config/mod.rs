// * Pipeline Configuration
// * One immutable struct, built once at startup and handed to every component

pub mod constants;

use constants::*;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Root configuration for a pipeline run.
///
/// Every section has defaults, so a JSON file only needs the keys it overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub storage: StorageConfig,
    pub image: FilterConfig,
    pub classifier: ClassifierConfig,
    pub dedup: DedupConfig,
    pub download: DownloadConfig,
    pub run: RunConfig,
}

impl PipelineConfig {
    /// Loads and validates a JSON config file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Parses and validates a JSON document
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values no component can run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.download.threads == 0 {
            return Err(invalid("download.threads", "must be at least 1"));
        }
        if self.download.per_site_concurrency == 0 {
            return Err(invalid("download.per_site_concurrency", "must be at least 1"));
        }
        if !(1..=100).contains(&self.storage.jpeg_quality) {
            return Err(invalid("storage.jpeg_quality", "must be within 1..=100"));
        }
        let band = self.image.watermark.band_ratio;
        if self.image.watermark.enable && !(band > 0.0 && band <= 0.5) {
            return Err(invalid("image.watermark.band_ratio", "must be within (0, 0.5]"));
        }
        if self.storage.root.as_os_str().is_empty() {
            return Err(invalid("storage.root", "must not be empty"));
        }
        Ok(())
    }

    /// Capacity of the bounded work queue
    pub fn queue_capacity(&self) -> usize {
        self.download.threads * QUEUE_SLOTS_PER_THREAD
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

/// How accepted images are encoded on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveFormat {
    /// Always re-encode as JPEG
    Jpeg,
    /// Keep the format implied by the URL extension when it is allow-listed
    Original,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
    /// Scratch directory for in-progress writes; defaults to `<root>.staging`
    pub scratch_dir: Option<PathBuf>,
    pub save_format: SaveFormat,
    pub jpeg_quality: u8,
    pub extensions: Vec<String>,
    /// Storage tree budget in MiB, 0 disables it
    pub max_folder_size_mb: u64,
}

impl StorageConfig {
    /// Resolves the scratch directory, which must sit outside the storage tree
    pub fn scratch_dir(&self) -> PathBuf {
        if let Some(dir) = &self.scratch_dir {
            return dir.clone();
        }
        let name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string());
        let staging = format!("{}.staging", name);
        match self.root.parent() {
            Some(parent) => parent.join(staging),
            None => PathBuf::from(staging),
        }
    }

    pub fn max_folder_bytes(&self) -> Option<u64> {
        (self.max_folder_size_mb > 0).then(|| self.max_folder_size_mb * 1024 * 1024)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./dataset"),
            scratch_dir: None,
            save_format: SaveFormat::Jpeg,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            max_folder_size_mb: 0,
        }
    }
}

/// Required image orientation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    All,
    Square,
    Portrait,
    Landscape,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub min_side: u32,
    pub accept_bw: bool,
    pub orientation: Orientation,
    pub watermark: WatermarkConfig,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_side: DEFAULT_MIN_SIDE,
            accept_bw: false,
            orientation: Orientation::All,
            watermark: WatermarkConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatermarkConfig {
    pub enable: bool,
    /// Fraction of the image height sampled at the top and at the bottom
    pub band_ratio: f64,
    /// Luma gradient counted as an edge
    pub edge_threshold: u8,
    /// Edge density at or above which a band is treated as watermarked
    pub edge_density: f64,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            enable: false,
            band_ratio: DEFAULT_WATERMARK_BAND_RATIO,
            edge_threshold: DEFAULT_WATERMARK_EDGE_THRESHOLD,
            edge_density: DEFAULT_WATERMARK_EDGE_DENSITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Scores below this are rejected, <= 0 disables the stage
    pub threshold: f32,
    /// Use the built-in heuristic scorer when no external classifier is supplied
    pub heuristic: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CLASSIFIER_THRESHOLD,
            heuristic: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enable: bool,
    /// Near-duplicate distance, 0 keeps only the exact-match check
    pub hamming_threshold: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enable: true,
            hamming_threshold: DEFAULT_HAMMING_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub enabled: bool,
    pub threshold: u32,
    pub cooldown_secs: u64,
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_BREAKER_THRESHOLD,
            cooldown_secs: DEFAULT_BREAKER_COOLDOWN_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub threads: usize,
    pub per_site_concurrency: usize,
    /// Optional request quota per domain, 0 disables it
    pub max_requests_per_second_per_site: u32,
    pub request_delay_secs: f64,
    pub max_retries: u32,
    pub backoff_base: f64,
    pub timeout_secs: u64,
    pub max_image_bytes: usize,
    pub user_agents: Vec<String>,
    pub skip_watermarked_urls: bool,
    pub watermark_keywords: Vec<String>,
    pub circuit_breaker: BreakerConfig,
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            per_site_concurrency: DEFAULT_PER_SITE_CONCURRENCY,
            max_requests_per_second_per_site: 0,
            request_delay_secs: DEFAULT_REQUEST_DELAY_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            skip_watermarked_urls: true,
            watermark_keywords: DEFAULT_WATERMARK_KEYWORDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            circuit_breaker: BreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Total dataset size to stop at (existing + new), 0 means unbounded
    pub target: u64,
    /// Wall-clock limit for diagnostic runs, 0 disables it
    pub run_seconds: u64,
    pub heartbeat_secs: u64,
    pub metrics_port: Option<u16>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            target: 0,
            run_seconds: 0,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            metrics_port: None,
        }
    }
}
