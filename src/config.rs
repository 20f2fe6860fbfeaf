use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{StokerError, StokerResult};

/// Server configuration, loadable from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen port (1024..=65535)
    pub port: u16,

    /// Trigger mode 0..=3: bit 0 puts connections in edge-triggered mode,
    /// bit 1 the listener (0 = both level-triggered, 3 = both edge-triggered)
    pub trigger_mode: u8,

    /// Per-connection idle timeout in milliseconds; 0 disables eviction
    pub timeout_ms: u64,

    /// Enable SO_LINGER{on, 1s} on the listener
    pub linger: bool,

    /// Resource root the request paths resolve against
    pub src_dir: PathBuf,

    /// PostgreSQL endpoint and credentials
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,

    /// Database handle pool size; 0 disables the pool entirely (form auth
    /// then always fails)
    pub db_pool_size: usize,

    /// Worker thread count; 0 means one per core
    pub worker_threads: usize,

    /// Logging switch and level (trace|debug|info|warn|error)
    pub log_enable: bool,
    pub log_level: String,
}

impl ServerConfig {
    /// Load from environment variables (with .env support), falling back to
    /// the defaults below.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            port: env_parse("STOKER_PORT", 1316),
            trigger_mode: env_parse("STOKER_TRIGGER_MODE", 3),
            timeout_ms: env_parse("STOKER_TIMEOUT_MS", 60_000),
            linger: env_parse("STOKER_LINGER", false),
            src_dir: std::env::var("STOKER_SRC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_src_dir()),
            db_host: std::env::var("STOKER_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            db_port: env_parse("STOKER_DB_PORT", 5432),
            db_user: std::env::var("STOKER_DB_USER").unwrap_or_else(|_| "stoker".to_string()),
            db_password: std::env::var("STOKER_DB_PASSWORD").unwrap_or_default(),
            db_name: std::env::var("STOKER_DB_NAME").unwrap_or_else(|_| "stoker".to_string()),
            db_pool_size: env_parse("STOKER_DB_POOL_SIZE", 8),
            worker_threads: env_parse("STOKER_WORKER_THREADS", 8),
            log_enable: env_parse("STOKER_LOG_ENABLE", true),
            log_level: std::env::var("STOKER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }

    pub fn validate(&self) -> StokerResult<()> {
        if self.port < 1024 {
            return Err(StokerError::Config(format!(
                "port {} is reserved; use 1024..=65535",
                self.port
            )));
        }
        if self.trigger_mode > 3 {
            return Err(StokerError::Config(format!(
                "trigger mode {} out of range 0..=3",
                self.trigger_mode
            )));
        }
        Ok(())
    }

    /// Worker count with the one-per-core fallback applied.
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }

    /// Edge-triggered flag for connection fds.
    pub fn conn_edge_triggered(&self) -> bool {
        self.trigger_mode & 0b01 != 0
    }

    /// Edge-triggered flag for the listening fd.
    pub fn listen_edge_triggered(&self) -> bool {
        self.trigger_mode & 0b10 != 0
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 1316,
            trigger_mode: 3,
            timeout_ms: 60_000,
            linger: false,
            src_dir: default_src_dir(),
            db_host: "localhost".to_string(),
            db_port: 5432,
            db_user: "stoker".to_string(),
            db_password: String::new(),
            db_name: "stoker".to_string(),
            db_pool_size: 8,
            worker_threads: 8,
            log_enable: true,
            log_level: "info".to_string(),
        }
    }
}

fn default_src_dir() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("resources")
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
