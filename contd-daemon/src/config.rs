//! Daemon configuration: bind addresses, log sink, default container log
//! root. Deliberately small — image/resource/persistence management are
//! out of scope — but loaded and overridden the way `devolutions-gateway`
//! layers its own (much larger) `Config` on top of a TOML file.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

fn default_api_bind() -> String {
    "0.0.0.0:9000".to_owned()
}

fn default_streaming_bind() -> String {
    "0.0.0.0:9001".to_owned()
}

fn default_log_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("/var/log/contd")
}

fn default_log_filter() -> String {
    "info".to_owned()
}

fn default_container_log_root() -> Utf8PathBuf {
    Utf8PathBuf::from("/var/log/cont")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContdConfig {
    #[serde(default = "default_api_bind")]
    pub api_bind: String,
    #[serde(default = "default_streaming_bind")]
    pub streaming_bind: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: Utf8PathBuf,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default = "default_container_log_root")]
    pub container_log_root: Utf8PathBuf,
}

impl Default for ContdConfig {
    fn default() -> Self {
        Self {
            api_bind: default_api_bind(),
            streaming_bind: default_streaming_bind(),
            log_dir: default_log_dir(),
            log_filter: default_log_filter(),
            container_log_root: default_container_log_root(),
        }
    }
}

impl ContdConfig {
    /// Loads the TOML file at `path` if it exists, then applies
    /// `CONTD_*` environment variable overrides on top.
    pub fn load(path: Option<&camino::Utf8Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text)?
            }
            _ => Self::default(),
        };

        if let Ok(value) = std::env::var("CONTD_API_BIND") {
            config.api_bind = value;
        }
        if let Ok(value) = std::env::var("CONTD_STREAMING_BIND") {
            config.streaming_bind = value;
        }
        if let Ok(value) = std::env::var("CONTD_LOG_DIR") {
            config.log_dir = Utf8PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("CONTD_LOG_FILTER") {
            config.log_filter = value;
        }
        if let Ok(value) = std::env::var("CONTD_CONTAINER_LOG_ROOT") {
            config.container_log_root = Utf8PathBuf::from(value);
        }

        Ok(config)
    }
}

impl contd_log::StaticLogConfig for ContdConfig {
    const MAX_BYTES_PER_LOG_FILE: u64 = 10 * 1024 * 1024;
    const MAX_LOG_FILES: usize = 10;
    const LOG_FILE_PREFIX: &'static str = "contd";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_without_a_file_falls_back_to_defaults() {
        let config = ContdConfig::load(None).unwrap();
        assert_eq!(config.api_bind, "0.0.0.0:9000");
        assert_eq!(config.streaming_bind, "0.0.0.0:9001");
    }

    #[test]
    fn load_ignores_a_path_that_does_not_exist() {
        let missing = camino::Utf8Path::new("/nonexistent/contd.toml");
        let config = ContdConfig::load(Some(missing)).unwrap();
        assert_eq!(config, ContdConfig::default());
    }
}
