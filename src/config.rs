//! YAML configuration, validated at load time.
//!
//! Field names and defaults follow the network/base config sections of the
//! system this crate replaces: `network.*`, `base.buffer.*`, `base.jwt.*`.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EpollMode {
    Lt,
    Et,
}

impl Default for EpollMode {
    fn default() -> Self {
        EpollMode::Lt
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    pub thread_num: usize,
    pub queue_size: usize,
    pub keep_alive_time: u64,
    pub max_idle_threads: usize,
    pub min_idle_threads: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        ThreadPoolConfig {
            thread_num: 4,
            queue_size: 1000,
            keep_alive_time: 60,
            max_idle_threads: 4,
            min_idle_threads: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SslConfig {
    pub enabled: bool,
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub epoll_mode: EpollMode,
    pub idle_timeout: u64,
    pub thread_pool: ThreadPoolConfig,
    pub ssl: SslConfig,
    pub reuse_port: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 8080,
            epoll_mode: EpollMode::Lt,
            idle_timeout: 30,
            thread_pool: ThreadPoolConfig::default(),
            ssl: SslConfig::default(),
            reuse_port: false,
        }
    }
}

impl NetworkConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(1024..=65535).contains(&self.port) {
            return Err(ConfigError::Invalid(format!(
                "network.port {} out of range 1024-65535",
                self.port
            )));
        }
        let tp = &self.thread_pool;
        if tp.thread_num > 32 {
            return Err(ConfigError::Invalid(format!(
                "network.thread_pool.thread_num {} exceeds 32",
                tp.thread_num
            )));
        }
        if tp.queue_size > 10_000 {
            return Err(ConfigError::Invalid(format!(
                "network.thread_pool.queue_size {} exceeds 10000",
                tp.queue_size
            )));
        }
        if tp.keep_alive_time > 3600 {
            return Err(ConfigError::Invalid(format!(
                "network.thread_pool.keep_alive_time {} exceeds 3600",
                tp.keep_alive_time
            )));
        }
        if !(tp.min_idle_threads <= tp.max_idle_threads && tp.max_idle_threads <= tp.thread_num) {
            return Err(ConfigError::Invalid(
                "network.thread_pool: require min_idle_threads <= max_idle_threads <= thread_num".into(),
            ));
        }
        if self.ssl.enabled && (self.ssl.cert_path.is_empty() || self.ssl.key_path.is_empty()) {
            return Err(ConfigError::Invalid(
                "network.ssl.enabled is true but cert_path/key_path is empty".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub initial_size: usize,
    pub max_size: usize,
    pub growth_factor: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            initial_size: 1024,
            max_size: 65536,
            growth_factor: 2.0,
        }
    }
}

impl BufferConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_size > self.max_size {
            return Err(ConfigError::Invalid(
                "base.buffer.initial_size must be <= max_size".into(),
            ));
        }
        if self.growth_factor <= 1.0 {
            return Err(ConfigError::Invalid(
                "base.buffer.growth_factor must be > 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    pub secret: String,
    pub expire_seconds: u64,
    pub issuer: String,
}

impl Default for JwtConfig {
    fn default() -> Self {
        JwtConfig {
            secret: String::new(),
            expire_seconds: 3600,
            issuer: "webserver".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BaseConfig {
    pub buffer: BufferConfig,
    pub jwt: JwtConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    pub fn as_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub directory: String,
    pub r#async: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: LogLevel::Info,
            directory: "logs".to_string(),
            r#async: true,
        }
    }
}

/// The full, validated configuration document.
///
/// Distributed to the reactor as `Arc<AppConfig>` snapshots; a future
/// hot-reload watcher swaps the `Arc` held by the server, never mutates one
/// in place.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub base: BaseConfig,
    pub log: LogConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network.validate()?;
        self.base.buffer.validate()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Arc<AppConfig>, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let cfg: AppConfig = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        cfg.validate()?;
        Ok(Arc::new(cfg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_port() {
        let mut cfg = AppConfig::default();
        cfg.network.port = 80;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_buffer_bounds() {
        let mut cfg = AppConfig::default();
        cfg.base.buffer.initial_size = 100;
        cfg.base.buffer.max_size = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_max_idle_threads_above_thread_num() {
        let mut cfg = AppConfig::default();
        cfg.network.thread_pool.thread_num = 4;
        cfg.network.thread_pool.max_idle_threads = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_yaml() {
        let yaml = r#"
network:
  ip: "0.0.0.0"
  port: 9090
  thread_pool:
    thread_num: 2
"#;
        let cfg: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.network.port, 9090);
        assert_eq!(cfg.network.thread_pool.thread_num, 2);
        cfg.validate().unwrap();
    }

    #[test]
    fn load_reads_and_validates_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "network:\n  port: 9000\n").unwrap();
        let cfg = AppConfig::load(file.path()).unwrap();
        assert_eq!(cfg.network.port, 9000);
    }

    #[test]
    fn load_reports_parse_error_for_bad_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"not: [valid: yaml").unwrap();
        assert!(matches!(AppConfig::load(file.path()), Err(ConfigError::Parse { .. })));
    }
}
