//! 错误类型
//!
//! `StorageError` 描述单次存储 I/O 的失败，并决定是否可以重试；
//! `SyncError` 是同步流程各阶段对外暴露的错误。

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// 存储提供者错误
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("节点不存在: {0}")]
    NotFound(String),

    #[error("已存在: {0}")]
    AlreadyExists(String),

    #[error("非法名称: {0}")]
    InvalidName(String),

    #[error("会话已失效，需要重新认证")]
    SessionExpired,

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl StorageError {
    /// 是否值得重试
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::NotFound(_)
            | StorageError::AlreadyExists(_)
            | StorageError::InvalidName(_)
            | StorageError::SessionExpired => false,
            StorageError::Http { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            StorageError::Io(_) | StorageError::Other(_) => true,
        }
    }

    /// 会话丢失对整个任务是致命的
    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::SessionExpired)
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status.as_u16() == 401 => StorageError::SessionExpired,
            Some(status) => StorageError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => StorageError::Other(e.to_string()),
        }
    }
}

/// 同步流程错误
#[derive(Error, Debug)]
pub enum SyncError {
    /// 任一侧枚举失败，整个任务中止
    #[error("扫描{side}失败: {source}")]
    Discovery {
        side: String,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("会话已失效，任务中止")]
    SessionExpired,

    #[error("检查点错误: {0}")]
    Checkpoint(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("冲突顾问错误: {0}")]
    Advisor(String),

    #[error("报告错误: {0}")]
    Report(String),

    #[error("操作已取消")]
    Cancelled,

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    pub fn discovery(side: &str, source: StorageError) -> Self {
        if source.is_fatal() {
            return SyncError::SessionExpired;
        }
        SyncError::Discovery {
            side: side.to_string(),
            source,
        }
    }
}
