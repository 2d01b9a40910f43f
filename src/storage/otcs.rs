//! OpenText Content Server REST 客户端
//!
//! 认证使用 `POST /api/v1/auth` 获取 OTCSTicket，之后每个请求携带该票据。
//! 票据失效（401）时返回 `StorageError::SessionExpired`，由上层中止任务。

use super::remote::{ChildPage, ContentServer, RemoteNode};
use super::IO_TIMEOUT_SECS;
use crate::config::OtcsConfig;
use crate::error::{StorageError, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct OtcsClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    ticket: Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    ticket: String,
}

#[derive(Debug, Deserialize)]
struct NodeProperties {
    id: i64,
    #[serde(default)]
    parent_id: Option<serde_json::Value>,
    name: String,
    #[serde(rename = "type", default)]
    node_type: i32,
    #[serde(default)]
    container: bool,
    #[serde(default)]
    size: Option<serde_json::Value>,
    #[serde(default)]
    modify_date: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NodeData {
    properties: NodeProperties,
}

#[derive(Debug, Deserialize)]
struct NodeResult {
    data: NodeData,
}

#[derive(Debug, Deserialize)]
struct Paging {
    #[serde(default)]
    total_count: usize,
}

#[derive(Debug, Deserialize)]
struct Collection {
    paging: Paging,
}

#[derive(Debug, Deserialize)]
struct ChildrenResponse {
    #[serde(default)]
    results: Vec<NodeResult>,
    collection: Option<Collection>,
}

#[derive(Debug, Deserialize)]
struct SingleNodeResponse {
    results: NodeResult,
}

impl From<NodeProperties> for RemoteNode {
    fn from(p: NodeProperties) -> Self {
        let is_container = p.container || p.node_type == RemoteNode::FOLDER;
        RemoteNode {
            id: p.id,
            parent_id: p.parent_id.as_ref().and_then(json_i64).unwrap_or(0),
            name: p.name,
            node_type: p.node_type,
            container: p.container,
            // 容器的 size 是子项数量，不是字节数
            size: if is_container {
                0
            } else {
                p.size.as_ref().and_then(json_u64).unwrap_or(0)
            },
            modified_at: p
                .modify_date
                .as_deref()
                .and_then(parse_otcs_date)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            mime_type: p.mime_type.filter(|m| !m.is_empty()),
        }
    }
}

fn json_i64(v: &serde_json::Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_str()?.parse().ok())
}

fn json_u64(v: &serde_json::Value) -> Option<u64> {
    v.as_u64().or_else(|| v.as_str()?.parse().ok())
}

/// 解析 Content Server 的时间（带或不带时区，不带时按 UTC）
pub fn parse_otcs_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|n| Utc.from_utc_datetime(&n))
        })
}

/// 解析子节点列表响应
fn parse_children(body: &str) -> Result<ChildPage, StorageError> {
    let resp: ChildrenResponse = serde_json::from_str(body)
        .map_err(|e| StorageError::Other(format!("子节点响应无法解析: {}", e)))?;
    let nodes: Vec<RemoteNode> = resp
        .results
        .into_iter()
        .map(|r| r.data.properties.into())
        .collect();
    let total = resp.collection.map(|c| c.paging.total_count);
    Ok(ChildPage { nodes, total })
}

/// 新建节点的 ID，兼容 v1 (`{"id": ..}`) 和 v2 响应
fn parse_created_id(body: &str) -> Result<i64, StorageError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| StorageError::Other(format!("创建响应无法解析: {}", e)))?;
    value
        .get("id")
        .and_then(json_i64)
        .or_else(|| value.pointer("/results/data/properties/id").and_then(json_i64))
        .ok_or_else(|| StorageError::Other("创建响应缺少节点 ID".to_string()))
}

/// 从错误响应中提取消息
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

async fn check(resp: Response) -> Result<Response, StorageError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let message = error_message(&body);
    Err(match status.as_u16() {
        401 => StorageError::SessionExpired,
        404 => StorageError::NotFound(message),
        _ if message.to_lowercase().contains("already exists") => {
            StorageError::AlreadyExists(message)
        }
        code => StorageError::Http {
            status: code,
            message,
        },
    })
}

impl OtcsClient {
    pub fn new(
        base_url: &str,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("HTTP 客户端创建失败: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            ticket: Mutex::new(None),
        })
    }

    pub fn from_config(config: &OtcsConfig) -> Result<Self, SyncError> {
        if config.base_url.is_empty() {
            return Err(SyncError::Config("未配置 otcs.baseUrl".to_string()));
        }
        let timeout = if config.timeout_secs == 0 {
            IO_TIMEOUT_SECS
        } else {
            config.timeout_secs
        };
        Self::new(
            &config.base_url,
            &config.username,
            &config.resolve_password()?,
            Duration::from_secs(timeout),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 获取（必要时申请）认证票据
    async fn ticket(&self) -> Result<String, StorageError> {
        let mut guard = self.ticket.lock().await;
        if let Some(ticket) = guard.as_ref() {
            return Ok(ticket.clone());
        }

        info!("登录 Content Server: {} ({})", self.base_url, self.username);
        let resp = self
            .http
            .post(self.url("/api/v1/auth"))
            .form(&[("username", &self.username), ("password", &self.password)])
            .send()
            .await?;
        let resp = check(resp).await?;
        let auth: AuthResponse = resp.json().await?;
        *guard = Some(auth.ticket.clone());
        Ok(auth.ticket)
    }

    /// 带票据发送请求，401 时清除缓存的票据
    async fn send(&self, req: RequestBuilder) -> Result<Response, StorageError> {
        let ticket = self.ticket().await?;
        let resp = req.header("OTCSTicket", ticket).send().await?;
        match check(resp).await {
            Err(StorageError::SessionExpired) => {
                *self.ticket.lock().await = None;
                Err(StorageError::SessionExpired)
            }
            other => other,
        }
    }

    fn file_part(name: &str, data: Vec<u8>, mime: &str) -> Result<Part, StorageError> {
        Part::bytes(data)
            .file_name(name.to_string())
            .mime_str(mime)
            .map_err(|e| StorageError::Other(format!("无效的 MIME 类型 {}: {}", mime, e)))
    }
}

#[async_trait]
impl ContentServer for OtcsClient {
    async fn list_children(
        &self,
        parent: i64,
        page: usize,
        page_size: usize,
    ) -> Result<ChildPage, StorageError> {
        let req = self
            .http
            .get(self.url(&format!("/api/v2/nodes/{}/nodes", parent)))
            .query(&[
                ("page", page.to_string()),
                ("limit", page_size.to_string()),
                ("fields", "properties".to_string()),
            ]);
        let body = self.send(req).await?.text().await?;
        parse_children(&body)
    }

    async fn get_node(&self, id: i64) -> Result<Option<RemoteNode>, StorageError> {
        let req = self
            .http
            .get(self.url(&format!("/api/v2/nodes/{}", id)))
            .query(&[("fields", "properties")]);
        match self.send(req).await {
            Ok(resp) => {
                let node: SingleNodeResponse = resp.json().await?;
                Ok(Some(node.results.data.properties.into()))
            }
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn download(&self, id: i64) -> Result<Vec<u8>, StorageError> {
        let req = self
            .http
            .get(self.url(&format!("/api/v1/nodes/{}/content", id)));
        let bytes = self.send(req).await?.bytes().await?;
        debug!("下载节点 {} 完成: {} 字节", id, bytes.len());
        Ok(bytes.to_vec())
    }

    async fn upload_document(
        &self,
        parent: i64,
        name: &str,
        data: Vec<u8>,
        mime: &str,
    ) -> Result<i64, StorageError> {
        let form = Form::new()
            .text("type", RemoteNode::DOCUMENT.to_string())
            .text("parent_id", parent.to_string())
            .text("name", name.to_string())
            .part("file", Self::file_part(name, data, mime)?);
        let req = self.http.post(self.url("/api/v2/nodes")).multipart(form);
        let body = self.send(req).await?.text().await?;
        parse_created_id(&body)
    }

    async fn add_version(
        &self,
        id: i64,
        name: &str,
        data: Vec<u8>,
        mime: &str,
    ) -> Result<i64, StorageError> {
        let form = Form::new().part("file", Self::file_part(name, data, mime)?);
        let req = self
            .http
            .post(self.url(&format!("/api/v1/nodes/{}/versions", id)))
            .multipart(form);
        self.send(req).await?;
        Ok(id)
    }

    async fn create_folder(&self, parent: i64, name: &str) -> Result<i64, StorageError> {
        let req = self.http.post(self.url("/api/v2/nodes")).form(&[
            ("type", RemoteNode::FOLDER.to_string()),
            ("parent_id", parent.to_string()),
            ("name", name.to_string()),
        ]);
        let body = self.send(req).await?.text().await?;
        parse_created_id(&body)
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }
}
