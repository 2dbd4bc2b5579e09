use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config as config_rs;
use serde::Deserialize;
use tts_engine::DevicePolicy;

const ENV_PREFIX: &str = "TTS_GATEWAY";

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_app_version")]
    pub app_version: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "TtsConfig::default_model")]
    pub default_model: String,
    #[serde(default)]
    pub device: DevicePolicy,
    #[serde(default = "TtsConfig::default_available_models")]
    pub available_models: Vec<String>,
    /// Bundled voice that `POST /tts` always clones.
    #[serde(default = "TtsConfig::default_reference_audio")]
    pub reference_audio: PathBuf,
    #[serde(default = "TtsConfig::default_language")]
    pub default_language: String,
    #[serde(default = "TtsConfig::default_voice_conversion_model")]
    pub voice_conversion_model: String,
    /// Upper bound on resident models; unbounded when unset.
    #[serde(default)]
    pub max_resident_models: Option<usize>,
    /// Models loaded on startup when `--warmup` is passed.
    #[serde(default)]
    pub preload_models: Vec<String>,
    #[serde(default)]
    pub python_package_path: Option<PathBuf>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            default_model: Self::default_model(),
            device: DevicePolicy::default(),
            available_models: Self::default_available_models(),
            reference_audio: Self::default_reference_audio(),
            default_language: Self::default_language(),
            voice_conversion_model: Self::default_voice_conversion_model(),
            max_resident_models: None,
            preload_models: Vec::new(),
            python_package_path: None,
        }
    }
}

impl TtsConfig {
    fn default_model() -> String {
        "tts_models/multilingual/multi-dataset/xtts_v2".to_string()
    }

    fn default_available_models() -> Vec<String> {
        [
            "tts_models/en/ljspeech/tacotron2-DDC",
            "tts_models/en/ljspeech/glow-tts",
            "tts_models/en/ljspeech/speedy-speech",
            "tts_models/en/ljspeech/tacotron2-DCA",
            "tts_models/en/ljspeech/vits",
            "tts_models/en/vctk/vits",
            "tts_models/en/vctk/fast_pitch",
            "tts_models/multilingual/multi-dataset/xtts_v2",
            "tts_models/multilingual/multi-dataset/your_tts",
            "tts_models/multilingual/multi-dataset/bark",
            "voice_conversion_models/multilingual/vctk/freevc24",
        ]
        .into_iter()
        .map(str::to_string)
        .collect()
    }

    fn default_reference_audio() -> PathBuf {
        PathBuf::from("assets/harvard.wav")
    }

    fn default_language() -> String {
        "en".to_string()
    }

    fn default_voice_conversion_model() -> String {
        "voice_conversion_models/multilingual/vctk/freevc24".to_string()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "StorageConfig::default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "StorageConfig::default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: Self::default_cache_dir(),
            output_dir: Self::default_output_dir(),
        }
    }
}

impl StorageConfig {
    fn default_cache_dir() -> PathBuf {
        PathBuf::from("./cache")
    }

    fn default_output_dir() -> PathBuf {
        PathBuf::from("./outputs")
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
    /// Extensions a caller may request. Coqui writes WAV bytes for all of
    /// them; responses label the content type by the bytes.
    #[serde(default = "default_allowed_audio_formats")]
    pub allowed_audio_formats: Vec<String>,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            max_text_length: default_max_text_length(),
            allowed_audio_formats: default_allowed_audio_formats(),
            max_workers: default_max_workers(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CleanupConfig {
    /// Period of the background sweep.
    #[serde(default = "CleanupConfig::default_interval_secs")]
    pub interval_secs: u64,
    /// Age threshold used by the background sweep.
    #[serde(default = "CleanupConfig::default_max_age_hours")]
    pub max_age_hours: u64,
    /// Age threshold for `DELETE /cleanup` when the caller omits one.
    #[serde(default = "CleanupConfig::default_on_demand_hours")]
    pub default_on_demand_hours: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: Self::default_interval_secs(),
            max_age_hours: Self::default_max_age_hours(),
            default_on_demand_hours: Self::default_on_demand_hours(),
        }
    }
}

impl CleanupConfig {
    fn default_interval_secs() -> u64 {
        3600
    }

    fn default_max_age_hours() -> u64 {
        1
    }

    fn default_on_demand_hours() -> u64 {
        24
    }
}

fn default_app_name() -> String {
    "Coqui TTS API".to_string()
}

fn default_app_version() -> String {
    "1.0.0".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_text_length() -> usize {
    1000
}

fn default_allowed_audio_formats() -> Vec<String> {
    vec!["wav".to_string(), "mp3".to_string(), "flac".to_string()]
}

fn default_max_workers() -> usize {
    1
}

impl AppConfig {
    /// Loads settings from an optional TOML file layered under
    /// `TTS_GATEWAY__*` environment variables. Relative paths resolve against
    /// the file's directory, or the working directory without a file.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_dir = path
            .as_ref()
            .and_then(|p| p.parent())
            .map(|p| p.to_path_buf())
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));

        let mut builder = config_rs::Config::builder();
        if let Some(ref file) = path {
            builder = builder.add_source(config_rs::File::from(file.clone()));
        }
        builder = builder.add_source(
            config_rs::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("tts.available_models")
                .with_list_parse_key("tts.preload_models")
                .with_list_parse_key("api.allowed_audio_formats")
                .try_parsing(true),
        );

        let source_label = path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "environment".to_string());
        let cfg = builder
            .build()
            .with_context(|| format!("failed to load configuration from {source_label}"))?;

        let mut app_cfg: AppConfig = cfg
            .try_deserialize()
            .context("failed to deserialize configuration")?;
        app_cfg.validate()?;
        app_cfg.rebase_paths(&config_dir);
        Ok(app_cfg)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.storage.output_dir.join(".staging")
    }

    /// Creates the output, staging and cache directories.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.storage.output_dir,
            &self.staging_dir(),
            &self.storage.cache_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.tts.available_models.is_empty(),
            "tts.available_models must list at least one model"
        );
        anyhow::ensure!(
            self.api.max_text_length > 0,
            "api.max_text_length must be positive"
        );
        anyhow::ensure!(
            !self.api.allowed_audio_formats.is_empty(),
            "api.allowed_audio_formats must not be empty"
        );
        anyhow::ensure!(
            self.cleanup.interval_secs > 0,
            "cleanup.interval_secs must be positive"
        );
        Ok(())
    }

    fn rebase_paths(&mut self, base: &Path) {
        self.storage.cache_dir = absolute_path(base, &self.storage.cache_dir);
        self.storage.output_dir = absolute_path(base, &self.storage.output_dir);
        self.tts.reference_audio = normalize_optional(base, &self.tts.reference_audio);
        if let Some(ref mut python_path) = self.tts.python_package_path {
            *python_path = normalize_optional(base, python_path);
        }
    }
}

fn normalize_optional(base: &Path, path: &Path) -> PathBuf {
    let candidate = absolute_path(base, path);
    candidate.canonicalize().unwrap_or(candidate)
}

fn absolute_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
