//! 传输执行器
//!
//! 先按深度预建目标目录树，再以固定大小的批次并发传输文件。
//! 下一批总是在上一批全部结束后才开始，检查点只通过 `CheckpointStore` 修改。

use crate::core::checkpoint::{Checkpoint, CheckpointStore};
use crate::core::comparator::{ItemStatus, Manifest, ManifestItem};
use crate::core::conflict::{ConflictResolver, ConflictStrategy};
use crate::core::progress::{ProgressSnapshot, ProgressTracker};
use crate::core::retry::{Clock, RetryPolicy, TokioClock};
use crate::error::{StorageError, SyncError};
use crate::storage::{mime_for, parent_of, path_depth, Entry, NodeId, Storage};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 单批最大并发
pub const MAX_BATCH_SIZE: usize = 100;
/// 每处理多少个条目保存一次检查点
pub const CHECKPOINT_EVERY: usize = 100;

/// 单个条目的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferAction {
    Transferred,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    pub item: ManifestItem,
    pub success: bool,
    pub action: TransferAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_id: Option<NodeId>,
    /// 以新名称写入时的文件名
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renamed_to: Option<String>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl TransferResult {
    pub fn relative_path(&self) -> &str {
        self.item.relative_path()
    }

    /// 目标侧最终的相对路径（考虑重命名）
    pub fn dest_relative_path(&self) -> String {
        match &self.renamed_to {
            Some(name) => crate::storage::join_relative(parent_of(self.relative_path()), name),
            None => self.relative_path().to_string(),
        }
    }
}

/// 执行选项
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub dry_run: bool,
    /// 非递归任务只为待传输文件建父目录，不复制空的子目录
    pub recursive: bool,
    pub concurrency: usize,
    /// 每个文件的总尝试次数
    pub retries: u32,
    pub retry_base_delay: Duration,
    pub checkpoint_every: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            recursive: true,
            concurrency: 4,
            retries: 3,
            retry_base_delay: Duration::from_secs(1),
            checkpoint_every: CHECKPOINT_EVERY,
        }
    }
}

impl TransferOptions {
    pub fn batch_size(&self) -> usize {
        self.concurrency.clamp(1, MAX_BATCH_SIZE)
    }
}

/// 一次传输的汇总
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSummary {
    pub results: Vec<TransferResult>,
    pub stats: ProgressSnapshot,
    pub checkpoint: Checkpoint,
    pub strategy: ConflictStrategy,
    /// 因检查点中已完成而跳过的条目数
    pub already_completed: usize,
    pub cancelled: bool,
    pub dry_run: bool,
}

impl TransferSummary {
    pub fn count(&self, action: TransferAction) -> usize {
        self.results.iter().filter(|r| r.action == action).count()
    }

    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|r| r.action == TransferAction::Failed)
    }
}

struct ItemOutcome {
    result: TransferResult,
    session_lost: bool,
}

/// 传输执行器，作用域为一次任务运行
pub struct TransferExecutor {
    source: Arc<dyn Storage>,
    dest: Arc<dyn Storage>,
    resolver: ConflictResolver,
    checkpoint: Arc<CheckpointStore>,
    options: TransferOptions,
    clock: Arc<dyn Clock>,
    cancelled: Arc<AtomicBool>,
    progress_tx: Option<mpsc::Sender<ProgressSnapshot>>,
}

impl TransferExecutor {
    pub fn new(
        source: Arc<dyn Storage>,
        dest: Arc<dyn Storage>,
        resolver: ConflictResolver,
        checkpoint: Arc<CheckpointStore>,
        options: TransferOptions,
    ) -> Self {
        Self {
            source,
            dest,
            resolver,
            checkpoint,
            options,
            clock: Arc::new(TokioClock),
            cancelled: Arc::new(AtomicBool::new(false)),
            progress_tx: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancel(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = cancelled;
        self
    }

    pub fn with_progress(mut self, tx: mpsc::Sender<ProgressSnapshot>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.options.retries).with_base_delay(self.options.retry_base_delay)
    }

    /// 执行传输
    ///
    /// 只有会话失效会返回错误；单个文件的失败记录在结果和检查点中。
    pub async fn run(&self, manifest: &Manifest) -> Result<TransferSummary, SyncError> {
        let prior = self.checkpoint.snapshot().await;
        let candidates: Vec<&ManifestItem> = manifest
            .items
            .iter()
            .filter(|i| i.status != ItemStatus::Orphan)
            .collect();
        let pending: Vec<&ManifestItem> = candidates
            .iter()
            .copied()
            .filter(|i| !prior.is_completed(i.relative_path()))
            .collect();
        let already_completed = candidates.len() - pending.len();
        if already_completed > 0 {
            info!("检查点中已完成 {} 个文件，本次跳过", already_completed);
        }

        let folders = if self.options.dry_run {
            let missing = missing_folders(manifest, self.options.recursive).len();
            info!("[dry run] 需要创建 {} 个目录", missing);
            HashMap::new()
        } else {
            self.prepare_folders(manifest).await?
        };

        let total_bytes = pending.iter().map(|i| i.source.size).sum();
        let tracker = ProgressTracker::new(pending.len() as u64, total_bytes);
        let batch_size = self.options.batch_size();
        let every = self.options.checkpoint_every.max(1);

        info!(
            "开始传输: {} 个条目, 批大小 {}, 策略 {}{}",
            pending.len(),
            batch_size,
            self.resolver.strategy(),
            if self.options.dry_run { " (dry run)" } else { "" }
        );

        let mut results = Vec::with_capacity(pending.len());
        let mut processed = 0usize;
        let mut cancelled = false;
        let mut session_lost = false;

        for batch in pending.chunks(batch_size) {
            if self.cancelled.load(Ordering::SeqCst) {
                warn!("传输已取消，剩余 {} 个条目未处理", pending.len() - processed);
                cancelled = true;
                break;
            }

            let outcomes = join_all(
                batch
                    .iter()
                    .map(|item| self.process_item(item, &folders, &tracker)),
            )
            .await;

            for outcome in outcomes {
                session_lost |= outcome.session_lost;
                results.push(outcome.result);
            }

            let before = processed;
            processed += batch.len();
            if processed / every > before / every {
                self.flush_checkpoint().await;
            }

            if let Some(tx) = &self.progress_tx {
                let _ = tx.send(tracker.snapshot()).await;
            }

            if session_lost {
                break;
            }
        }

        self.flush_checkpoint().await;

        if session_lost {
            error!("会话已失效，任务在处理 {} 个条目后中止", processed);
            return Err(SyncError::SessionExpired);
        }

        let stats = tracker.snapshot();
        info!(
            "传输完成: 成功 {}, 跳过 {}, 失败 {}",
            stats.completed, stats.skipped, stats.failed
        );

        Ok(TransferSummary {
            results,
            stats,
            checkpoint: self.checkpoint.snapshot().await,
            strategy: self.resolver.strategy(),
            already_completed,
            cancelled,
            dry_run: self.options.dry_run,
        })
    }

    async fn flush_checkpoint(&self) {
        if self.options.dry_run {
            return;
        }
        if let Err(e) = self.checkpoint.flush().await {
            warn!("保存检查点失败: {}", e);
        }
    }

    /// 预建目录树，返回 小写相对路径 -> 目标目录 的映射（"" 为根）
    ///
    /// 已存在的目录直接复用；创建时遇到已存在错误则重新查找。
    async fn prepare_folders(
        &self,
        manifest: &Manifest,
    ) -> Result<HashMap<String, NodeId>, SyncError> {
        let mut folders = existing_folders(manifest, self.dest.root());
        let missing = missing_folders(manifest, self.options.recursive);
        if !missing.is_empty() {
            info!("预建 {} 个目标目录", missing.len());
        }

        let policy = self.retry_policy();
        for path in missing {
            let key = path.to_lowercase();
            if folders.contains_key(&key) {
                continue;
            }
            let Some(parent) = folders.get(&parent_of(&key).to_string()).cloned() else {
                warn!("父目录不可用，跳过创建: {}", path);
                continue;
            };
            let name = path.rsplit('/').next().unwrap_or(path.as_str());

            let dest = &self.dest;
            let parent_ref = &parent;
            let created = policy
                .run(self.clock.as_ref(), &format!("创建目录 {}", path), move |_| async move {
                    match dest.mkdir(parent_ref, name).await {
                        Err(StorageError::AlreadyExists(_)) => dest
                            .find_child(parent_ref, name)
                            .await?
                            .filter(|e| e.is_dir)
                            .map(|e| e.id)
                            .ok_or_else(|| {
                                StorageError::AlreadyExists(format!("{} 已存在且不是目录", name))
                            }),
                        other => other,
                    }
                })
                .await;

            match created {
                Ok(id) => {
                    debug!("目录就绪: {}", path);
                    folders.insert(key, id);
                }
                Err(e) if e.is_fatal() => return Err(SyncError::SessionExpired),
                // 目录下的文件会在传输阶段各自失败
                Err(e) => warn!("创建目录 {} 失败: {}", path, e),
            }
        }

        Ok(folders)
    }

    async fn process_item(
        &self,
        item: &ManifestItem,
        folders: &HashMap<String, NodeId>,
        tracker: &ProgressTracker,
    ) -> ItemOutcome {
        let started = Instant::now();
        let path = item.relative_path();
        let decision = self.resolver.resolve(item);

        let result = |action, success, dest_id, error: Option<String>| TransferResult {
            item: item.clone(),
            success,
            action,
            dest_id,
            renamed_to: decision.rename.clone(),
            reason: decision.reason.clone(),
            error,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        if !decision.transfer {
            debug!("跳过 {}: {}", path, decision.reason);
            tracker.record_skipped();
            return ItemOutcome {
                result: result(TransferAction::Skipped, true, None, None),
                session_lost: false,
            };
        }

        if self.options.dry_run {
            tracker.record_completed(item.source.size);
            return ItemOutcome {
                result: result(TransferAction::Transferred, true, None, None),
                session_lost: false,
            };
        }

        let parent_key = parent_of(path).to_lowercase();
        let Some(parent) = folders.get(&parent_key) else {
            let message = format!("目标目录不可用: {}", parent_of(path));
            self.checkpoint.mark_failed(path, &message).await;
            tracker.record_failed();
            return ItemOutcome {
                result: result(TransferAction::Failed, false, None, Some(message)),
                session_lost: false,
            };
        };

        match self.copy_item(item, parent, decision.rename.as_deref()).await {
            Ok(dest_id) => {
                self.checkpoint
                    .mark_completed(path, dest_id.as_remote())
                    .await;
                tracker.record_completed(item.source.size);
                debug!("完成 {} -> {}", path, dest_id);
                ItemOutcome {
                    result: result(TransferAction::Transferred, true, Some(dest_id), None),
                    session_lost: false,
                }
            }
            Err(e) => {
                let message = e.to_string();
                error!("传输失败 {}: {}", path, message);
                self.checkpoint.mark_failed(path, &message).await;
                tracker.record_failed();
                ItemOutcome {
                    result: result(TransferAction::Failed, false, None, Some(message)),
                    session_lost: e.is_fatal(),
                }
            }
        }
    }

    /// 读源并写目标，只重试这一对 I/O 调用
    async fn copy_item(
        &self,
        item: &ManifestItem,
        parent: &NodeId,
        rename: Option<&str>,
    ) -> Result<NodeId, StorageError> {
        let name = rename.unwrap_or(&item.source.name);
        let mime = if item.source.mime_type.is_empty() {
            mime_for(name)
        } else {
            item.source.mime_type.as_str()
        };
        // 重命名时保留目标原文件，否则已存在的目标文件整体替换
        let existing: Option<&Entry> = match rename {
            Some(_) => None,
            None => item.dest.as_ref(),
        };

        let source = &self.source;
        let dest = &self.dest;
        let source_id = &item.source.id;

        self.retry_policy()
            .run(
                self.clock.as_ref(),
                &format!("传输 {}", item.relative_path()),
                move |_| async move {
                    let data = source.read(source_id).await?;
                    match existing {
                        Some(entry) => dest.overwrite(&entry.id, name, data, mime).await,
                        None => dest.write(parent, name, data, mime).await,
                    }
                },
            )
            .await
    }
}

/// 目标侧已有的目录
fn existing_folders(manifest: &Manifest, root: NodeId) -> HashMap<String, NodeId> {
    let mut folders: HashMap<String, NodeId> = manifest
        .dest_items
        .iter()
        .filter(|e| e.is_dir)
        .map(|e| (e.join_key(), e.id.clone()))
        .collect();
    folders.insert(String::new(), root);
    folders
}

/// 源目录树中目标侧缺少的目录，按深度升序
fn missing_folders(manifest: &Manifest, recursive: bool) -> Vec<String> {
    let existing: std::collections::HashSet<String> = manifest
        .dest_items
        .iter()
        .filter(|e| e.is_dir)
        .map(|e| e.join_key())
        .collect();

    // 键为小写路径，值保留源侧的大小写
    let mut wanted: BTreeMap<String, String> = BTreeMap::new();
    let dirs = manifest
        .source_items
        .iter()
        .filter(|e| recursive && e.is_dir)
        .map(|e| e.relative_path.as_str());
    let parents = manifest
        .items
        .iter()
        .filter(|i| i.status != ItemStatus::Orphan)
        .map(|i| parent_of(i.relative_path()));

    for dir in dirs.chain(parents) {
        let mut current = dir;
        while !current.is_empty() {
            wanted
                .entry(current.to_lowercase())
                .or_insert_with(|| current.to_string());
            current = parent_of(current);
        }
    }

    let mut missing: Vec<String> = wanted
        .into_iter()
        .filter(|(key, _)| !existing.contains(key))
        .map(|(_, path)| path)
        .collect();
    missing.sort_by(|a, b| path_depth(a).cmp(&path_depth(b)).then_with(|| a.cmp(b)));
    missing
}
