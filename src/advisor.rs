//! 外部文本生成协作者：冲突决策与报告摘要
//!
//! 两者都被视为不可靠的外部调用，失败只会降级，不会让任务失败。

use crate::config::AdvisorConfig;
use crate::core::conflict::ConflictDescriptor;
use crate::core::report::Report;
use crate::error::SyncError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// 对一批冲突给出逐文件决策，返回原始文本，由调用方解析
#[async_trait]
pub trait ConflictAdvisor: Send + Sync {
    async fn advise(&self, conflicts: &[ConflictDescriptor]) -> Result<String, SyncError>;
}

/// 为完成的报告生成可读摘要
#[async_trait]
pub trait ReportNarrator: Send + Sync {
    async fn summarize(&self, report: &Report) -> Result<String, SyncError>;
}

const CONFLICT_INSTRUCTIONS: &str = "You review file conflicts in a document migration. \
For each file decide one of: \"skip\", \"overwrite\", or \"rename:<new file name>\". \
Only choose overwrite when the source is clearly the newer revision. \
Answer with a single JSON object mapping each relativePath to its decision and nothing else.";

const REPORT_INSTRUCTIONS: &str = "Write a short executive summary (at most 8 sentences) \
of this document migration run for a project manager. Mention totals, failures, \
conflicts and verification problems. Plain text, no markdown.";

/// 冲突提示词
pub fn conflict_prompt(conflicts: &[ConflictDescriptor]) -> Result<String, SyncError> {
    Ok(format!(
        "Conflicts ({}):\n{}",
        conflicts.len(),
        serde_json::to_string_pretty(conflicts)?
    ))
}

/// OpenAI 兼容的 `/chat/completions` 客户端
pub struct HttpAdvisor {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpAdvisor {
    pub fn new(endpoint: &str, model: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Advisor(format!("无法创建 HTTP 客户端: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }

    pub fn from_config(config: &AdvisorConfig) -> Result<Self, SyncError> {
        let api_key = std::env::var(&config.api_key_env).ok();
        Self::new(
            &config.endpoint,
            &config.model,
            api_key,
            Duration::from_secs(config.timeout_secs),
        )
    }

    async fn complete(&self, system: &str, user: String) -> Result<String, SyncError> {
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| SyncError::Advisor(format!("请求失败: {}", e)))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| SyncError::Advisor(format!("读取响应失败: {}", e)))?;
        if !status.is_success() {
            return Err(SyncError::Advisor(format!("HTTP {}: {}", status.as_u16(), text)));
        }
        debug!("顾问响应 {} 字节", text.len());
        extract_content(&text)
    }
}

/// 取出 `choices[0].message.content`
fn extract_content(body: &str) -> Result<String, SyncError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| SyncError::Advisor(format!("响应不是 JSON: {}", e)))?;
    value["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| SyncError::Advisor("响应中缺少 message.content".to_string()))
}

#[async_trait]
impl ConflictAdvisor for HttpAdvisor {
    async fn advise(&self, conflicts: &[ConflictDescriptor]) -> Result<String, SyncError> {
        self.complete(CONFLICT_INSTRUCTIONS, conflict_prompt(conflicts)?)
            .await
    }
}

#[async_trait]
impl ReportNarrator for HttpAdvisor {
    async fn summarize(&self, report: &Report) -> Result<String, SyncError> {
        // 文件明细可能很大，只发送汇总部分
        let digest = json!({
            "job": report.job_name,
            "direction": report.direction,
            "dryRun": report.dry_run,
            "cancelled": report.cancelled,
            "strategy": report.strategy,
            "totals": report.totals,
            "conflicts": report.conflicts.len(),
            "orphans": report.orphans.len(),
            "verification": report.verification.as_ref().map(|v| &v.summary),
            "errors": report.errors.iter().take(20).collect::<Vec<_>>(),
        });
        self.complete(REPORT_INSTRUCTIONS, serde_json::to_string_pretty(&digest)?)
            .await
    }
}
