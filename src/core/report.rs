//! 任务报告
//!
//! `build_report` 只做汇总，不做任何 I/O；保存和上传由 `ReportWriter` 负责。

use crate::config::{JobDefinition, TransferDirection};
use crate::core::comparator::{ItemStatus, Manifest};
use crate::core::conflict::ConflictStrategy;
use crate::core::transfer::{TransferAction, TransferResult, TransferSummary};
use crate::core::verify::{VerificationItem, VerificationReport};
use crate::error::{StorageError, SyncError};
use crate::storage::{NodeId, Storage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// 报告中单个文件的最终状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Transferred,
    Skipped,
    Failed,
    /// 已传输且校验通过
    Verified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRow {
    pub relative_path: String,
    pub status: FileStatus,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renamed_to: Option<String>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRow {
    pub relative_path: String,
    pub reason: String,
    pub strategy: ConflictStrategy,
    /// 实际结果；检查点中已完成或被取消的条目为 None
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<TransferAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renamed_to: Option<String>,
    pub resolution: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportTotals {
    pub source_files: usize,
    pub new: usize,
    pub existing: usize,
    pub modified: usize,
    pub orphans: usize,
    pub transferred: usize,
    pub skipped: usize,
    pub failed: usize,
    pub already_completed: usize,
    pub verified: usize,
    pub verification_failed: usize,
    pub transferred_bytes: u64,
    pub elapsed_ms: u64,
    pub files_per_sec: f64,
    pub mb_per_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub run_id: Uuid,
    pub job_name: String,
    pub direction: TransferDirection,
    pub source: String,
    pub destination: String,
    pub generated_at: DateTime<Utc>,
    pub dry_run: bool,
    pub cancelled: bool,
    pub strategy: ConflictStrategy,
    pub totals: ReportTotals,
    pub files: Vec<FileRow>,
    pub conflicts: Vec<ConflictRow>,
    pub orphans: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationReport>,
    /// 外部生成的文字摘要
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narrative: Option<String>,
    pub errors: Vec<String>,
}

impl Report {
    /// 报告文件名：`<slug>-<yyyymmdd_HHMMSS>.json`
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}.json",
            crate::config::slugify(&self.job_name),
            self.generated_at.format("%Y%m%d_%H%M%S")
        )
    }

    pub fn summary_line(&self) -> String {
        let t = &self.totals;
        format!(
            "传输 {}, 跳过 {}, 失败 {}, 孤儿 {}, 校验失败 {}, {:.2} MB/s",
            t.transferred, t.skipped, t.failed, t.orphans, t.verification_failed, t.mb_per_sec
        )
    }
}

/// 汇总一次运行的全部结果
pub fn build_report(
    job: &JobDefinition,
    manifest: &Manifest,
    summary: &TransferSummary,
    verification: Option<&VerificationReport>,
) -> Report {
    let checks: HashMap<&str, &VerificationItem> = verification
        .map(|v| {
            v.items
                .iter()
                .map(|i| (i.relative_path.as_str(), i))
                .collect()
        })
        .unwrap_or_default();

    let mut errors = Vec::new();
    let files: Vec<FileRow> = summary
        .results
        .iter()
        .map(|r| {
            let check = checks.get(r.dest_relative_path().as_str()).copied();
            let status = match (r.action, check) {
                (TransferAction::Transferred, Some(c)) if c.passed => FileStatus::Verified,
                (TransferAction::Transferred, _) => FileStatus::Transferred,
                (TransferAction::Skipped, _) => FileStatus::Skipped,
                (TransferAction::Failed, _) => FileStatus::Failed,
            };
            let error = r
                .error
                .clone()
                .or_else(|| check.and_then(|c| c.error.clone()));
            if let Some(e) = &error {
                errors.push(format!("{}: {}", r.relative_path(), e));
            }
            FileRow {
                relative_path: r.relative_path().to_string(),
                status,
                size: r.item.source.size,
                renamed_to: r.renamed_to.clone(),
                reason: r.reason.clone(),
                error,
            }
        })
        .collect();

    let by_path: HashMap<&str, &TransferResult> = summary
        .results
        .iter()
        .map(|r| (r.relative_path(), r))
        .collect();
    let conflicts = manifest
        .items_with_status(ItemStatus::Modified)
        .map(|item| {
            let result = by_path.get(item.relative_path()).copied();
            ConflictRow {
                relative_path: item.relative_path().to_string(),
                reason: item.conflict_reason.clone().unwrap_or_default(),
                strategy: summary.strategy,
                action: result.map(|r| r.action),
                renamed_to: result.and_then(|r| r.renamed_to.clone()),
                resolution: result
                    .map(|r| r.reason.clone())
                    .unwrap_or_else(|| "not processed in this run".to_string()),
            }
        })
        .collect();

    let orphans = manifest
        .items_with_status(ItemStatus::Orphan)
        .map(|i| i.relative_path().to_string())
        .collect();

    let s = &manifest.summary;
    let totals = ReportTotals {
        source_files: s.source_files,
        new: s.new,
        existing: s.existing,
        modified: s.modified,
        orphans: s.orphan,
        transferred: summary.count(TransferAction::Transferred),
        skipped: summary.count(TransferAction::Skipped),
        failed: summary.count(TransferAction::Failed),
        already_completed: summary.already_completed,
        verified: verification.map(|v| v.summary.passed).unwrap_or(0),
        verification_failed: verification.map(|v| v.summary.failed).unwrap_or(0),
        transferred_bytes: summary.stats.transferred_bytes,
        elapsed_ms: summary.stats.elapsed_ms,
        files_per_sec: summary.stats.files_per_sec,
        mb_per_sec: summary.stats.mb_per_sec,
    };

    Report {
        run_id: Uuid::new_v4(),
        job_name: job.name.clone(),
        direction: job.direction,
        source: job.source.to_string(),
        destination: job.destination.to_string(),
        generated_at: Utc::now(),
        dry_run: summary.dry_run,
        cancelled: summary.cancelled,
        strategy: summary.strategy,
        totals,
        files,
        conflicts,
        orphans,
        verification: verification.cloned(),
        narrative: None,
        errors,
    }
}

/// 报告持久化
pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    /// 报告保存在 `<data_dir>/reports`
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("reports"),
        }
    }

    pub async fn save(&self, report: &Report) -> Result<PathBuf, SyncError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SyncError::Report(format!("无法创建 {}: {}", self.dir.display(), e)))?;
        let path = self.dir.join(report.file_name());
        let content = serde_json::to_vec_pretty(report)?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| SyncError::Report(format!("无法写入 {}: {}", path.display(), e)))?;
        info!("报告已保存: {}", path.display());
        Ok(path)
    }

    /// 通过目标存储上传报告，`folder` 为相对目标根目录的路径
    pub async fn upload(
        &self,
        report: &Report,
        dest: &dyn Storage,
        folder: Option<&str>,
    ) -> Result<NodeId, StorageError> {
        let parent = dest
            .ensure_dir(&dest.root(), folder.unwrap_or_default())
            .await?;
        let content = serde_json::to_vec_pretty(report)
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let id = dest
            .write(&parent, &report.file_name(), content, "application/json")
            .await?;
        info!("报告已上传到 {}: {}", dest.name(), id);
        Ok(id)
    }
}
