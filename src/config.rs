use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::IseError;
use crate::streaming::AudioEncoding;

pub const DEFAULT_HOST: &str = "ise-api.xfyun.cn";
pub const DEFAULT_PATH: &str = "/v2/open-ise";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IseConfig {
    /// Evaluation service host (also signed into the URL).
    pub host: String,

    /// Request path of the streaming endpoint.
    pub path: String,

    pub app_id: String,

    /// Only needed when URLs are signed locally.
    pub api_key: String,

    /// Only needed when URLs are signed locally.
    pub api_secret: String,

    /// Language/engine tag, e.g. `cn_vip` or `en_vip`.
    pub ent: String,

    /// Evaluation category, e.g. `read_syllable`, `read_word`, `read_sentence`, `read_chapter`.
    pub category: String,

    pub encoding: AudioEncoding,

    /// Learner group used by the scoring model.
    pub group: String,

    /// Scheduler period between frames.
    pub tick_interval_ms: u64,

    /// Delay between the socket opening and the first frame.
    pub settle_delay_ms: u64,

    /// Upper bound on queued chunks; `None` leaves the queue unbounded.
    pub max_queued_chunks: Option<usize>,
}

impl Default for IseConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            path: DEFAULT_PATH.to_string(),
            app_id: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            ent: "cn_vip".to_string(),
            category: "read_sentence".to_string(),
            encoding: AudioEncoding::Raw,
            group: "pupil".to_string(),
            tick_interval_ms: 40,
            settle_delay_ms: 500,
            max_queued_chunks: None,
        }
    }
}

impl IseConfig {
    /// Defaults overlaid with `XFYUN_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        if let Some(v) = var("XFYUN_APP_ID") {
            config.app_id = v;
        }
        if let Some(v) = var("XFYUN_API_KEY") {
            config.api_key = v;
        }
        if let Some(v) = var("XFYUN_API_SECRET") {
            config.api_secret = v;
        }
        if let Some(v) = var("XFYUN_ISE_HOST") {
            config.host = v;
        }
        if let Some(v) = var("XFYUN_ISE_ENT") {
            config.ent = v;
        }
        if let Some(v) = var("XFYUN_ISE_CATEGORY") {
            config.category = v;
        }
        config
    }

    pub fn validate(&self) -> Result<(), IseError> {
        if self.tick_interval_ms == 0 {
            return Err(IseError::Config(
                "tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_queued_chunks == Some(0) {
            return Err(IseError::Config(
                "max_queued_chunks must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

pub fn load_config(path: &Path) -> IseConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<IseConfig>(&contents) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Config: failed to parse {:?}: {}", path, e);
                IseConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => IseConfig::default(),
        Err(e) => {
            log::warn!("Config: failed to read {:?}: {}", path, e);
            IseConfig::default()
        }
    }
}

pub fn save_config(path: &Path, config: &IseConfig) -> Result<(), IseError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            IseError::Config(format!("Failed to create config directory {:?}: {}", parent, e))
        })?;
    }

    let contents = serde_json::to_string_pretty(config)
        .map_err(|e| IseError::Config(format!("Serialize config: {}", e)))?;

    // Write to a sibling temp file, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| IseError::Config(format!("Write temp config {:?}: {}", tmp_path, e)))?;

    // rename() does not replace an existing file on Windows
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(IseError::Config(format!(
                    "Remove existing config file {:?}: {}",
                    path, e
                )));
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|e| {
        IseError::Config(format!(
            "Rename temp config {:?} to {:?}: {}",
            tmp_path, path, e
        ))
    })?;
    Ok(())
}
