use serde::Deserialize;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub timelapse: TimelapseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Seconds a place's cooldown window stays open. The default sits a few
    /// seconds under ten minutes so that submitters polling on a fixed
    /// ten-minute interval never land just inside the previous window.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Mean-squared-error score a candidate must strictly exceed against the
    /// last accepted frame to be stored (8-bit channel scale).
    #[serde(default = "default_dissimilarity_threshold")]
    pub dissimilarity_threshold: f64,
    /// Place ids whose submissions are rejected outright.
    #[serde(default)]
    pub blacklist: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimelapseConfig {
    /// Per-frame display delay in centiseconds.
    #[serde(default = "default_delay_cs")]
    pub default_delay_cs: u16,
    #[serde(default = "default_min_frames")]
    pub min_frames: usize,
    /// GIF replay count. When unset the animation replays once per frame,
    /// matching the historical behavior.
    #[serde(default)]
    pub repeat: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            dissimilarity_threshold: default_dissimilarity_threshold(),
            blacklist: Vec::new(),
        }
    }
}

impl Default for TimelapseConfig {
    fn default() -> Self {
        Self {
            default_delay_cs: default_delay_cs(),
            min_frames: default_min_frames(),
            repeat: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        debug!(
            path = path.display().to_string(),
            port = config.server.port,
            cooldown_secs = config.pipeline.cooldown_secs,
            "configuration loaded"
        );
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

// Default value functions
fn default_port() -> u16 {
    9899
}
fn default_db_path() -> String {
    "data/placelog.db".into()
}
fn default_cooldown_secs() -> u64 {
    580
}
fn default_dissimilarity_threshold() -> f64 {
    10.0
}
fn default_delay_cs() -> u16 {
    20
}
fn default_min_frames() -> usize {
    3
}
fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 9899);
        assert_eq!(config.pipeline.cooldown_secs, 580);
        assert_eq!(config.pipeline.dissimilarity_threshold, 10.0);
        assert!(config.pipeline.blacklist.is_empty());
        assert_eq!(config.timelapse.default_delay_cs, 20);
        assert_eq!(config.timelapse.min_frames, 3);
        assert_eq!(config.timelapse.repeat, None);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            "[pipeline]\ncooldown_secs = 2\nblacklist = [7]\n\n[timelapse]\nrepeat = 0\n",
        )
        .unwrap();
        assert_eq!(config.pipeline.cooldown_secs, 2);
        assert_eq!(config.pipeline.blacklist, vec![7]);
        assert_eq!(config.pipeline.dissimilarity_threshold, 10.0);
        assert_eq!(config.timelapse.repeat, Some(0));
        assert_eq!(config.server.port, 9899);
    }

    #[test]
    fn load_reads_file_and_reports_missing() {
        let path = std::env::temp_dir().join("placelog-config-load-test.toml");
        std::fs::write(&path, "[server]\nport = 1234\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 1234);
        assert_eq!(config.pipeline.cooldown_secs, 580);
        std::fs::remove_file(&path).unwrap();

        let missing = std::env::temp_dir().join("placelog-config-does-not-exist.toml");
        assert!(matches!(
            Config::load(&missing),
            Err(ConfigError::ReadFile(..))
        ));
    }
}
