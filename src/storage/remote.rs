//! 远程文档仓库存储
//!
//! `ContentServer` 是仓库节点 API 的最小接口（分页列举、内容读写、
//! 目录创建、元数据查询），`RemoteStorage` 在其上实现 `Storage`。

use super::{join_relative, Entry, NodeId, Storage, DEFAULT_PAGE_SIZE};
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// 远程节点元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteNode {
    pub id: i64,
    pub parent_id: i64,
    pub name: String,
    pub node_type: i32,
    pub container: bool,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub mime_type: Option<String>,
}

impl RemoteNode {
    pub const FOLDER: i32 = 0;
    pub const DOCUMENT: i32 = 144;

    pub fn is_dir(&self) -> bool {
        self.container || self.node_type == Self::FOLDER
    }

    fn into_entry(self, prefix: &str) -> Entry {
        let is_dir = self.is_dir();
        let mime_type = if is_dir {
            String::new()
        } else {
            self.mime_type
                .clone()
                .unwrap_or_else(|| super::mime_for(&self.name).to_string())
        };
        Entry {
            id: NodeId::Remote(self.id),
            parent_id: Some(NodeId::Remote(self.parent_id)),
            relative_path: join_relative(prefix, &self.name),
            size: if is_dir { 0 } else { self.size },
            modified_at: self.modified_at,
            mime_type,
            is_dir,
            name: self.name,
        }
    }
}

/// 一页子节点
#[derive(Debug, Clone, Default)]
pub struct ChildPage {
    pub nodes: Vec<RemoteNode>,
    /// 容器中子节点总数，服务器未返回分页信息时为 None
    pub total: Option<usize>,
}

/// 文档仓库节点 API
#[async_trait]
pub trait ContentServer: Send + Sync {
    /// 分页列出子节点，页码从 1 开始
    async fn list_children(
        &self,
        parent: i64,
        page: usize,
        page_size: usize,
    ) -> Result<ChildPage, StorageError>;

    async fn get_node(&self, id: i64) -> Result<Option<RemoteNode>, StorageError>;

    async fn download(&self, id: i64) -> Result<Vec<u8>, StorageError>;

    async fn upload_document(
        &self,
        parent: i64,
        name: &str,
        data: Vec<u8>,
        mime: &str,
    ) -> Result<i64, StorageError>;

    /// 为已有文档添加新版本
    async fn add_version(
        &self,
        id: i64,
        name: &str,
        data: Vec<u8>,
        mime: &str,
    ) -> Result<i64, StorageError>;

    async fn create_folder(&self, parent: i64, name: &str) -> Result<i64, StorageError>;

    fn base_url(&self) -> &str;
}

pub struct RemoteStorage {
    server: Arc<dyn ContentServer>,
    root: i64,
    page_size: usize,
    name: String,
}

impl RemoteStorage {
    pub fn new(server: Arc<dyn ContentServer>, root: i64) -> Self {
        let name = format!("otcs://{}/{}", server.base_url().trim_end_matches('/'), root);
        Self {
            server,
            root,
            page_size: DEFAULT_PAGE_SIZE,
            name,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn node_id(id: &NodeId) -> Result<i64, StorageError> {
        id.as_remote()
            .ok_or_else(|| StorageError::Other(format!("不是远程节点: {}", id)))
    }
}

#[async_trait]
impl Storage for RemoteStorage {
    fn root(&self) -> NodeId {
        NodeId::Remote(self.root)
    }

    async fn list(&self, dir: &NodeId, prefix: &str) -> Result<Vec<Entry>, StorageError> {
        let parent = Self::node_id(dir)?;
        let mut entries = Vec::new();
        let mut page = 1;

        loop {
            let result = self
                .server
                .list_children(parent, page, self.page_size)
                .await?;
            let fetched = result.nodes.len();
            entries.extend(result.nodes.into_iter().map(|n| n.into_entry(prefix)));

            // 不知道总数时，只要本页满了就继续请求下一页
            let complete = match result.total {
                Some(total) => entries.len() >= total,
                None => fetched < self.page_size,
            };
            if fetched == 0 || complete {
                break;
            }
            page += 1;
        }

        debug!("列出节点 {} 的 {} 个子项 ({} 页)", parent, entries.len(), page);
        Ok(entries)
    }

    async fn read(&self, id: &NodeId) -> Result<Vec<u8>, StorageError> {
        self.server.download(Self::node_id(id)?).await
    }

    async fn write(
        &self,
        parent: &NodeId,
        name: &str,
        data: Vec<u8>,
        mime: &str,
    ) -> Result<NodeId, StorageError> {
        let id = self
            .server
            .upload_document(Self::node_id(parent)?, name, data, mime)
            .await?;
        Ok(NodeId::Remote(id))
    }

    async fn overwrite(
        &self,
        id: &NodeId,
        name: &str,
        data: Vec<u8>,
        mime: &str,
    ) -> Result<NodeId, StorageError> {
        let id = self
            .server
            .add_version(Self::node_id(id)?, name, data, mime)
            .await?;
        Ok(NodeId::Remote(id))
    }

    async fn mkdir(&self, parent: &NodeId, name: &str) -> Result<NodeId, StorageError> {
        let id = self
            .server
            .create_folder(Self::node_id(parent)?, name)
            .await?;
        Ok(NodeId::Remote(id))
    }

    async fn stat(&self, id: &NodeId) -> Result<Option<Entry>, StorageError> {
        Ok(self
            .server
            .get_node(Self::node_id(id)?)
            .await?
            .map(|node| node.into_entry("")))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
