//! 差异比较 - 构建源与目标的统一清单

use crate::config::{JobDefinition, TransferDirection};
use crate::core::scanner::{FileScanner, ScanConfig};
use crate::error::Result;
use crate::storage::{Entry, NodeId, Storage};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// 修改时间容差（毫秒），吸收两个系统之间的时钟和精度差异
pub const MTIME_TOLERANCE_MS: i64 = 1000;

/// 清单条目状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// 只存在于源
    New,
    /// 两边相同
    Existing,
    /// 两边都有但大小或时间不同
    Modified,
    /// 只存在于目标
    Orphan,
}

/// 清单条目
///
/// 孤儿条目没有源，`source` 存放目标条目作为占位。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestItem {
    pub source: Entry,
    pub dest: Option<Entry>,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_reason: Option<String>,
}

impl ManifestItem {
    pub fn relative_path(&self) -> &str {
        &self.source.relative_path
    }
}

/// 清单统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSummary {
    pub source_files: usize,
    pub source_dirs: usize,
    pub dest_files: usize,
    pub dest_dirs: usize,
    pub new: usize,
    pub existing: usize,
    pub modified: usize,
    pub orphan: usize,
    /// 源文件总字节数
    pub total_bytes: u64,
    /// 新增和修改文件的字节数
    pub pending_bytes: u64,
}

/// 一个任务的完整比较结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub job_name: String,
    pub direction: TransferDirection,
    /// 源侧全部条目（含目录）
    pub source_items: Vec<Entry>,
    /// 目标侧全部条目（含目录）
    pub dest_items: Vec<Entry>,
    /// 只包含文件，按相对路径排序
    pub items: Vec<ManifestItem>,
    pub summary: ManifestSummary,
}

impl Manifest {
    pub fn items_with_status(&self, status: ItemStatus) -> impl Iterator<Item = &ManifestItem> {
        self.items.iter().filter(move |i| i.status == status)
    }
}

/// 文件比较器
pub struct FileComparator {
    time_tolerance_ms: i64,
}

impl FileComparator {
    pub fn new(time_tolerance_ms: i64) -> Self {
        Self { time_tolerance_ms }
    }

    /// 比较源与目标中同一路径的文件
    pub fn classify(&self, source: &Entry, dest: &Entry) -> (ItemStatus, Option<String>) {
        if source.size != dest.size {
            return (
                ItemStatus::Modified,
                Some(format!(
                    "size mismatch: source={} bytes, dest={} bytes",
                    source.size, dest.size
                )),
            );
        }

        let diff_ms = (source.modified_at - dest.modified_at)
            .num_milliseconds()
            .abs();
        if diff_ms > self.time_tolerance_ms {
            return (
                ItemStatus::Modified,
                Some(format!(
                    "modified time mismatch: source={}, dest={} ({} ms apart)",
                    source.modified_at.to_rfc3339(),
                    dest.modified_at.to_rfc3339(),
                    diff_ms
                )),
            );
        }

        (ItemStatus::Existing, None)
    }

    /// 由两侧扫描结果构建清单
    pub fn build_manifest(
        &self,
        job: &JobDefinition,
        source_items: Vec<Entry>,
        dest_items: Vec<Entry>,
    ) -> Manifest {
        // 目标文件按小写路径索引；大小写冲突时保留第一个
        let mut dest_index: HashMap<String, &Entry> = HashMap::new();
        for entry in dest_items.iter().filter(|e| !e.is_dir) {
            dest_index.entry(entry.join_key()).or_insert(entry);
        }

        let mut matched: HashSet<&NodeId> = HashSet::new();
        let mut items = Vec::new();

        for source in source_items.iter().filter(|e| !e.is_dir) {
            let key = source.join_key();
            let item = match dest_index.get(&key) {
                None => ManifestItem {
                    source: source.clone(),
                    dest: None,
                    status: ItemStatus::New,
                    conflict_reason: None,
                },
                Some(dest) => {
                    matched.insert(&dest.id);
                    let (status, conflict_reason) = self.classify(source, dest);
                    if let Some(reason) = &conflict_reason {
                        debug!("冲突: {} - {}", source.relative_path, reason);
                    }
                    ManifestItem {
                        source: source.clone(),
                        dest: Some((*dest).clone()),
                        status,
                        conflict_reason,
                    }
                }
            };
            items.push(item);
        }

        // 大小写重复的目标文件只有第一个参与匹配，其余视为孤儿
        for dest in dest_items.iter().filter(|e| !e.is_dir) {
            if !matched.contains(&dest.id) {
                items.push(ManifestItem {
                    source: dest.clone(),
                    dest: Some(dest.clone()),
                    status: ItemStatus::Orphan,
                    conflict_reason: None,
                });
            }
        }

        items.sort_by(|a, b| {
            a.source
                .relative_path
                .cmp(&b.source.relative_path)
                .then_with(|| (a.status as u8).cmp(&(b.status as u8)))
        });

        let summary = Self::summarize(&source_items, &dest_items, &items);

        Manifest {
            job_name: job.name.clone(),
            direction: job.direction,
            source_items,
            dest_items,
            items,
            summary,
        }
    }

    fn summarize(source: &[Entry], dest: &[Entry], items: &[ManifestItem]) -> ManifestSummary {
        let mut summary = ManifestSummary {
            source_files: source.iter().filter(|e| !e.is_dir).count(),
            source_dirs: source.iter().filter(|e| e.is_dir).count(),
            dest_files: dest.iter().filter(|e| !e.is_dir).count(),
            dest_dirs: dest.iter().filter(|e| e.is_dir).count(),
            total_bytes: source.iter().filter(|e| !e.is_dir).map(|e| e.size).sum(),
            ..Default::default()
        };

        for item in items {
            match item.status {
                ItemStatus::New => {
                    summary.new += 1;
                    summary.pending_bytes += item.source.size;
                }
                ItemStatus::Modified => {
                    summary.modified += 1;
                    summary.pending_bytes += item.source.size;
                }
                ItemStatus::Existing => summary.existing += 1,
                ItemStatus::Orphan => summary.orphan += 1,
            }
        }

        summary
    }
}

impl Default for FileComparator {
    fn default() -> Self {
        Self::new(MTIME_TOLERANCE_MS)
    }
}

/// 扫描两侧并构建清单
///
/// 任一侧扫描失败时整个发现阶段失败，不产生部分清单。
pub async fn discover(
    job: &JobDefinition,
    source: &dyn Storage,
    dest: &dyn Storage,
    scanner: &FileScanner,
) -> Result<Manifest> {
    let source_items = scanner.scan_storage(source, "源").await?;
    let dest_items = scanner.scan_storage(dest, "目标").await?;

    let manifest = FileComparator::default().build_manifest(job, source_items, dest_items);
    let s = &manifest.summary;
    info!(
        "比较完成 [{}]: 新增 {}, 相同 {}, 修改 {}, 孤儿 {}",
        job.name, s.new, s.existing, s.modified, s.orphan
    );
    Ok(manifest)
}

/// 根据任务定义创建扫描器
pub fn scanner_for(job: &JobDefinition) -> FileScanner {
    FileScanner::with_config(
        job.concurrency.clamp(1, 16),
        ScanConfig::for_job(job.recursive, job.extensions.as_deref()),
    )
}
