// System configuration for the judgehost, loaded from TOML
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub host_name: String,
    #[serde(default)]
    pub endpoint_name: String,
    pub endpoint_url: String,
    #[serde(default)]
    pub endpoint_user: String,
    #[serde(default)]
    pub endpoint_password: String,
    #[serde(default = "default_judge_root")]
    pub judge_root: PathBuf,
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,
    pub docker_image: String,
    /// Empty means local defaults (unix socket / DOCKER_HOST).
    #[serde(default)]
    pub docker_server: String,
    /// Container memory cap in bytes for judgings without a declared limit.
    #[serde(rename = "root_mem", default = "default_root_mem")]
    pub root_memory: i64,
    #[serde(default = "default_max_worker")]
    pub max_worker: usize,
    #[serde(default = "default_run_user")]
    pub run_user: String,
    /// Seconds.
    #[serde(default = "default_build_time_limit")]
    pub build_time_limit: u64,
    /// Bytes.
    #[serde(default = "default_build_output_limit")]
    pub build_output_limit: u64,
    /// Seconds.
    #[serde(default = "default_judge_time_limit")]
    pub judge_time_limit: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
}

fn default_judge_root() -> PathBuf {
    PathBuf::from("judge_root")
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("cache_root")
}

fn default_root_mem() -> i64 {
    512 * 1024 * 1024
}

pub fn host_cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_max_worker() -> usize {
    host_cpu_count()
}

fn default_run_user() -> String {
    "root".to_string()
}

fn default_build_time_limit() -> u64 {
    30
}

fn default_build_output_limit() -> u64 {
    64 * 1024 * 1024
}

fn default_judge_time_limit() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    2500
}

fn default_max_retry() -> u32 {
    3
}

impl SystemConfig {
    /// Load and validate a config file. Relative roots are resolved against the current directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let cwd = std::env::current_dir()
            .map_err(|e| ConfigError::Invalid(format!("cannot determine current directory: {}", e)))?;
        config.resolve_relative(&cwd);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn resolve_relative(&mut self, base: &Path) {
        if self.judge_root.is_relative() {
            self.judge_root = base.join(&self.judge_root);
        }
        if self.cache_root.is_relative() {
            self.cache_root = base.join(&self.cache_root);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host_name.trim().is_empty() {
            return Err(ConfigError::Invalid("host_name must not be empty".into()));
        }
        if self.endpoint_url.trim().is_empty() {
            return Err(ConfigError::Invalid("endpoint_url must not be empty".into()));
        }
        if self.docker_image.trim().is_empty() {
            return Err(ConfigError::Invalid("docker_image must not be empty".into()));
        }
        if self.max_worker == 0 {
            return Err(ConfigError::Invalid("max_worker must be at least 1".into()));
        }
        Ok(())
    }

    pub fn build_time_limit(&self) -> Duration {
        Duration::from_secs(self.build_time_limit)
    }

    pub fn judge_time_limit(&self) -> Duration {
        Duration::from_secs(self.judge_time_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
host_name = "judge-01"
endpoint_url = "http://localhost:8080/api"
docker_image = "judgehost/sandbox:latest"
"#;

    #[test]
    fn test_defaults_applied() {
        let config = SystemConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.run_user, "root");
        assert_eq!(config.build_time_limit, 30);
        assert_eq!(config.judge_time_limit(), Duration::from_secs(30));
        assert_eq!(config.max_worker, host_cpu_count());
        assert_eq!(config.root_memory, 512 * 1024 * 1024);
        assert!(config.docker_server.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_full_config() {
        let config = SystemConfig::from_toml(
            r#"
host_name = "judge-02"
endpoint_name = "contest"
endpoint_url = "http://endpoint/api"
endpoint_user = "judgehost"
endpoint_password = "secret"
judge_root = "/srv/judge"
cache_root = "cache"
docker_image = "sandbox"
docker_server = "unix:///var/run/docker.sock"
root_mem = 1073741824
max_worker = 2
build_time_limit = 60
"#,
        )
        .unwrap();
        assert_eq!(config.max_worker, 2);
        assert_eq!(config.root_memory, 1 << 30);
        assert_eq!(config.build_time_limit(), Duration::from_secs(60));
        assert_eq!(config.judge_root, PathBuf::from("/srv/judge"));
    }

    #[test]
    fn test_relative_roots_resolved() {
        let mut config = SystemConfig::from_toml(MINIMAL).unwrap();
        config.judge_root = PathBuf::from("/abs/judge");
        config.resolve_relative(Path::new("/home/judge"));
        assert_eq!(config.judge_root, PathBuf::from("/abs/judge"));
        assert_eq!(config.cache_root, PathBuf::from("/home/judge/cache_root"));
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let mut config = SystemConfig::from_toml(MINIMAL).unwrap();
        config.max_worker = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_required_field() {
        assert!(SystemConfig::from_toml("host_name = \"x\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = SystemConfig::load(&path).unwrap();
        assert!(config.judge_root.is_absolute());
        assert!(config.cache_root.is_absolute());

        let missing = SystemConfig::load(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
