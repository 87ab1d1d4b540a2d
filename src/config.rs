use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use transform_bus::{DecoderSettings, EncoderSettings};

/// Environment variable naming the configuration file when no argument is given.
pub const CONFIG_ENV: &str = "HW_TRANSCODE_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Elementary stream to decode, Annex B or length-prefixed.
    pub input: PathBuf,
    /// Annex B elementary stream to write.
    pub output: PathBuf,
    /// Codec configuration record (avcC/hvcC) for length-prefixed input.
    pub codec_config: Option<PathBuf>,
    pub decoder: DecoderSettings,
    /// Width and height are taken from the decoded frames.
    pub encoder: EncoderSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("input.h264"),
            output: PathBuf::from("output.h264"),
            codec_config: None,
            decoder: DecoderSettings::default(),
            encoder: EncoderSettings::default(),
        }
    }
}

impl AppConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("invalid configuration")
    }

    /// Reads `path`, or returns the defaults when no path is configured.
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            log::info!("no configuration file, using defaults");
            return Ok(Self::default());
        };
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = Self::from_json(&json)?;
        log::info!("configuration loaded from {}", path.display());
        Ok(config)
    }
}

fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os(CONFIG_ENV))
        .map(PathBuf::from)
}

pub fn config() -> anyhow::Result<&'static AppConfig> {
    static CONFIG: LazyLock<Result<AppConfig, String>> =
        LazyLock::new(|| AppConfig::load(config_path()).map_err(|e| format!("{:#}", e)));
    CONFIG.as_ref().map_err(|e| anyhow::anyhow!("{}", e))
}
