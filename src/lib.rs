pub mod advisor;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::{AppConfig, JobDefinition, TransferDirection};
pub use core::{JobOutcome, RunOptions, SyncEngine};
pub use error::{StorageError, SyncError};

/// 数据目录定位
pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }
    }

    /// 默认数据目录：配置、检查点、报告和日志都放在这里
    pub fn default_data_dir() -> PathBuf {
        config_dir()
            .map(|p| p.join("otcs-sync"))
            .unwrap_or_else(|| PathBuf::from(".otcs-sync"))
    }

    pub fn log_dir(data_dir: &std::path::Path) -> PathBuf {
        data_dir.join("logs")
    }
}
