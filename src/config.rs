use std::env;
use std::path::PathBuf;

pub const DEFAULT_MODEL_ID: &str = "Xenova/clip-vit-base-patch16";
pub const DEFAULT_MODEL_BASE_URL: &str = "https://huggingface.co";

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub model_dir: PathBuf,
    pub model_id: String,
    pub model_base_url: String,
    pub auto_download: bool,
    pub use_gpu: bool,
    pub intra_threads: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for: {0}")]
    InvalidValue(&'static str),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Ok(Config {
            host: var("HOST", "0.0.0.0"),
            port: var("PORT", "8000")
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidValue("PORT"))?,
            model_dir: PathBuf::from(var("MODEL_DIR", "./models")),
            model_id: var("MODEL_ID", DEFAULT_MODEL_ID),
            model_base_url: var("MODEL_BASE_URL", DEFAULT_MODEL_BASE_URL),
            auto_download: parse_bool(&var("MODEL_AUTO_DOWNLOAD", "true"))
                .ok_or(ConfigError::InvalidValue("MODEL_AUTO_DOWNLOAD"))?,
            use_gpu: parse_bool(&var("USE_GPU", "false"))
                .ok_or(ConfigError::InvalidValue("USE_GPU"))?,
            intra_threads: var("INTRA_THREADS", "4")
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidValue("INTRA_THREADS"))?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
