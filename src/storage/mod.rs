pub mod local;
pub mod otcs;
pub mod remote;

use crate::config::{AppConfig, JobDefinition, TransferDirection};
use crate::error::{StorageError, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use local::LocalStorage;
pub use otcs::OtcsClient;
pub use remote::{ChildPage, ContentServer, RemoteNode, RemoteStorage};

// ============ 公共常量 ============

/// 远程子节点分页大小
pub const DEFAULT_PAGE_SIZE: usize = 100;
/// HTTP 请求超时（秒）
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 节点标识：本地为绝对路径，远程为 Content Server 节点 ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "origin", content = "id", rename_all = "lowercase")]
pub enum NodeId {
    Local(PathBuf),
    Remote(i64),
}

impl NodeId {
    pub fn as_remote(&self) -> Option<i64> {
        match self {
            NodeId::Remote(id) => Some(*id),
            NodeId::Local(_) => None,
        }
    }

    pub fn as_local(&self) -> Option<&Path> {
        match self {
            NodeId::Local(p) => Some(p),
            NodeId::Remote(_) => None,
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeId::Local(p) => write!(f, "{}", p.display()),
            NodeId::Remote(id) => write!(f, "node:{}", id),
        }
    }
}

/// 扫描时的条目快照，只会被新的扫描取代，不会被修改
///
/// 比较算法只使用公共字段（路径、大小、时间），不区分来源。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    /// 相对任务根目录的路径，使用 `/` 分隔，是两侧的连接键
    pub relative_path: String,
    pub name: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub mime_type: String,
    pub is_dir: bool,
}

impl Entry {
    /// 跨系统比较使用的键（大小写不敏感）
    pub fn join_key(&self) -> String {
        self.relative_path.to_lowercase()
    }
}

/// 存储提供者接口，本地文件系统与远程仓库各实现一次
#[async_trait]
pub trait Storage: Send + Sync {
    /// 任务根容器
    fn root(&self) -> NodeId;

    /// 列出容器的直接子项，`prefix` 是该容器相对根目录的路径
    async fn list(&self, dir: &NodeId, prefix: &str) -> Result<Vec<Entry>, StorageError>;

    /// 读取整个文件
    async fn read(&self, id: &NodeId) -> Result<Vec<u8>, StorageError>;

    /// 在容器下创建新文件，返回新节点标识
    async fn write(
        &self,
        parent: &NodeId,
        name: &str,
        data: Vec<u8>,
        mime: &str,
    ) -> Result<NodeId, StorageError>;

    /// 替换已存在的文件内容（远程为新增版本）
    async fn overwrite(
        &self,
        id: &NodeId,
        name: &str,
        data: Vec<u8>,
        mime: &str,
    ) -> Result<NodeId, StorageError>;

    /// 创建单级目录
    async fn mkdir(&self, parent: &NodeId, name: &str) -> Result<NodeId, StorageError>;

    /// 获取元数据，不存在时返回 None
    async fn stat(&self, id: &NodeId) -> Result<Option<Entry>, StorageError>;

    /// 按名称查找直接子项（大小写不敏感）
    async fn find_child(&self, parent: &NodeId, name: &str) -> Result<Option<Entry>, StorageError> {
        let wanted = name.to_lowercase();
        Ok(self
            .list(parent, "")
            .await?
            .into_iter()
            .find(|e| e.name.to_lowercase() == wanted))
    }

    /// 逐级创建目录路径，已存在的目录直接复用
    async fn ensure_dir(&self, base: &NodeId, path: &str) -> Result<NodeId, StorageError> {
        let mut current = base.clone();
        for part in path.split('/').filter(|s| !s.is_empty()) {
            current = match self.find_child(&current, part).await? {
                Some(existing) if existing.is_dir => existing.id,
                Some(_) => {
                    return Err(StorageError::AlreadyExists(format!(
                        "{} 已存在且不是目录",
                        part
                    )))
                }
                None => match self.mkdir(&current, part).await {
                    Ok(id) => id,
                    Err(StorageError::AlreadyExists(_)) => self
                        .find_child(&current, part)
                        .await?
                        .map(|e| e.id)
                        .ok_or_else(|| StorageError::NotFound(part.to_string()))?,
                    Err(e) => return Err(e),
                },
            };
        }
        Ok(current)
    }

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 拼接相对路径
pub fn join_relative(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), name)
    }
}

/// 相对路径的父目录，根目录下的条目返回空串
pub fn parent_of(relative_path: &str) -> &str {
    relative_path
        .rsplit_once('/')
        .map(|(parent, _)| parent)
        .unwrap_or("")
}

pub fn path_depth(relative_path: &str) -> usize {
    relative_path.matches('/').count()
}

/// 根据扩展名推断 MIME 类型
pub fn mime_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "csv" => "text/csv",
        "htm" | "html" => "text/html",
        "md" => "text/markdown",
        "xml" => "application/xml",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "msg" => "application/vnd.ms-outlook",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}

/// 根据任务方向创建源和目标存储
pub async fn create_storages(
    job: &JobDefinition,
    config: &AppConfig,
) -> Result<(Arc<dyn Storage>, Arc<dyn Storage>), SyncError> {
    let client = Arc::new(OtcsClient::from_config(&config.otcs)?);
    let page_size = config.otcs.page_size;

    match job.direction {
        TransferDirection::LocalToOtcs => {
            let path = job.source.local_path()?;
            let node = job.destination.remote_id()?;
            tracing::info!("初始化上传: {} -> {} 节点 {}", path.display(), client.base_url(), node);
            let source = LocalStorage::new(&path)?;
            let dest = RemoteStorage::new(client, node).with_page_size(page_size);
            Ok((Arc::new(source), Arc::new(dest)))
        }
        TransferDirection::OtcsToLocal => {
            let node = job.source.remote_id()?;
            let path = job.destination.local_path()?;
            tracing::info!("初始化下载: {} 节点 {} -> {}", client.base_url(), node, path.display());
            let source = RemoteStorage::new(client, node).with_page_size(page_size);
            let dest = LocalStorage::create(&path)?;
            Ok((Arc::new(source), Arc::new(dest)))
        }
    }
}
