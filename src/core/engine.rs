//! 同步引擎 - 串联发现、冲突解决、传输、校验和报告

use crate::advisor::{ConflictAdvisor, ReportNarrator};
use crate::config::JobDefinition;
use crate::core::checkpoint::CheckpointStore;
use crate::core::comparator::{discover, scanner_for, Manifest, ManifestSummary};
use crate::core::conflict::{
    conflict_descriptors, parse_agent_response, AgentDecisions, ConflictResolver,
    ConflictStrategy,
};
use crate::core::progress::ProgressSnapshot;
use crate::core::report::{build_report, Report, ReportWriter};
use crate::core::retry::{Clock, TokioClock};
use crate::core::transfer::{TransferExecutor, TransferOptions, TransferSummary, MAX_BATCH_SIZE};
use crate::core::verify::{VerificationReport, Verifier};
use crate::error::Result;
use crate::storage::Storage;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// 单次运行的选项
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub resume: bool,
    pub dry_run: bool,
    pub progress_tx: Option<mpsc::Sender<ProgressSnapshot>>,
}

/// 一次任务运行的结果
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub manifest: ManifestSummary,
    pub transfer: TransferSummary,
    pub verification: Option<VerificationReport>,
    pub report: Option<Report>,
    pub report_path: Option<PathBuf>,
    pub orphans: usize,
}

impl JobOutcome {
    /// 没有失败文件、校验全部通过且未被取消
    pub fn succeeded(&self) -> bool {
        !self.transfer.has_failures()
            && !self.transfer.cancelled
            && self
                .verification
                .as_ref()
                .map(|v| v.all_passed())
                .unwrap_or(true)
    }
}

/// 同步引擎
pub struct SyncEngine {
    data_dir: PathBuf,
    advisor: Option<Arc<dyn ConflictAdvisor>>,
    narrator: Option<Arc<dyn ReportNarrator>>,
    clock: Arc<dyn Clock>,
    retry_base_delay: Duration,
    cancelled: Arc<AtomicBool>,
}

impl SyncEngine {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            advisor: None,
            narrator: None,
            clock: Arc::new(TokioClock),
            retry_base_delay: Duration::from_secs(1),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn ConflictAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn with_narrator(mut self, narrator: Arc<dyn ReportNarrator>) -> Self {
        self.narrator = Some(narrator);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// 取消标志，置位后不再开始新的批次
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn checkpoint_path(&self, job: &JobDefinition) -> PathBuf {
        CheckpointStore::path_for(&self.data_dir, job)
    }

    /// 只做发现和比较
    pub async fn analyze(
        &self,
        job: &JobDefinition,
        source: &dyn Storage,
        dest: &dyn Storage,
    ) -> Result<Manifest> {
        let scanner = scanner_for(job).with_cancel(self.cancelled.clone());
        discover(job, source, dest, &scanner).await
    }

    /// 运行任务
    ///
    /// 只有发现失败和会话失效会返回错误，其余失败都记录在结果中。
    pub async fn run_job(
        &self,
        job: &JobDefinition,
        source: Arc<dyn Storage>,
        dest: Arc<dyn Storage>,
        options: RunOptions,
    ) -> Result<JobOutcome> {
        let started = Utc::now();
        info!(
            "开始任务: {} ({}, 策略 {}{}{})",
            job.name,
            job.direction,
            job.conflict_strategy,
            if options.resume { ", 续传" } else { "" },
            if options.dry_run { ", dry run" } else { "" }
        );

        let manifest = self.analyze(job, source.as_ref(), dest.as_ref()).await?;

        let (strategy, decisions) = match job.conflict_strategy {
            ConflictStrategy::Agent => match self.agent_decisions(&manifest).await {
                Some(decisions) => (ConflictStrategy::Agent, Some(decisions)),
                None => (ConflictStrategy::Skip, None),
            },
            other => (other, None),
        };
        let resolver = ConflictResolver::new(strategy, decisions, started);

        let checkpoint_path = self.checkpoint_path(job);
        let checkpoint = if options.dry_run {
            let initial = if options.resume {
                CheckpointStore::read(&checkpoint_path).await?
            } else {
                Default::default()
            };
            CheckpointStore::detached(initial)
        } else {
            CheckpointStore::open(checkpoint_path, options.resume).await?
        };

        let transfer_options = TransferOptions {
            dry_run: options.dry_run,
            recursive: job.recursive,
            concurrency: job.concurrency,
            retries: job.retries,
            retry_base_delay: self.retry_base_delay,
            ..Default::default()
        };
        let mut executor = TransferExecutor::new(
            source,
            dest.clone(),
            resolver,
            Arc::new(checkpoint),
            transfer_options,
        )
        .with_clock(self.clock.clone())
        .with_cancel(self.cancelled.clone());
        if let Some(tx) = options.progress_tx {
            executor = executor.with_progress(tx);
        }

        let transfer = executor.run(&manifest).await?;

        let verification = if job.verify && !options.dry_run {
            let verifier = Verifier::new(dest.clone())
                .with_node_ids(transfer.checkpoint.node_id_map.clone())
                .with_concurrency(job.concurrency.clamp(1, MAX_BATCH_SIZE));
            Some(verifier.verify(&transfer.results).await)
        } else {
            None
        };

        let (report, report_path) = if job.generate_report {
            let (report, path) = self
                .write_report(
                    job,
                    &manifest,
                    &transfer,
                    verification.as_ref(),
                    dest.as_ref(),
                    options.dry_run,
                )
                .await;
            (Some(report), path)
        } else {
            (None, None)
        };

        let outcome = JobOutcome {
            manifest: manifest.summary.clone(),
            orphans: manifest.summary.orphan,
            transfer,
            verification,
            report,
            report_path,
        };
        info!(
            "任务结束: {} - {}",
            job.name,
            if outcome.succeeded() { "成功" } else { "存在失败项" }
        );
        Ok(outcome)
    }

    /// 一次性向顾问请求全部冲突的决策；失败时返回 None，调用方降级为 skip
    async fn agent_decisions(&self, manifest: &Manifest) -> Option<AgentDecisions> {
        let conflicts = conflict_descriptors(manifest);
        if conflicts.is_empty() {
            return Some(AgentDecisions::default());
        }

        let Some(advisor) = &self.advisor else {
            warn!("未配置冲突顾问，{} 个冲突按 skip 处理", conflicts.len());
            return None;
        };

        info!("请求冲突顾问: {} 个冲突", conflicts.len());
        let decisions = match advisor.advise(&conflicts).await {
            Ok(text) => parse_agent_response(&text),
            Err(e) => Err(e),
        };
        match decisions {
            Ok(decisions) => {
                info!("收到 {} 条冲突决策", decisions.len());
                Some(decisions)
            }
            Err(e) => {
                warn!("冲突顾问不可用，策略降级为 skip: {}", e);
                None
            }
        }
    }

    /// 生成并保存报告，任何失败都只记录到报告的 errors 中
    async fn write_report(
        &self,
        job: &JobDefinition,
        manifest: &Manifest,
        transfer: &TransferSummary,
        verification: Option<&VerificationReport>,
        dest: &dyn Storage,
        dry_run: bool,
    ) -> (Report, Option<PathBuf>) {
        let mut report = build_report(job, manifest, transfer, verification);

        if let Some(narrator) = &self.narrator {
            match narrator.summarize(&report).await {
                Ok(text) => report.narrative = Some(text),
                Err(e) => {
                    warn!("生成报告摘要失败: {}", e);
                    report.errors.push(format!("narrative: {}", e));
                }
            }
        }

        let writer = ReportWriter::new(&self.data_dir);
        if job.upload_report && !dry_run {
            if let Err(e) = writer
                .upload(&report, dest, job.report_folder.as_deref())
                .await
            {
                warn!("上传报告失败: {}", e);
                report.errors.push(format!("report upload: {}", e));
            }
        }

        let path = match writer.save(&report).await {
            Ok(path) => Some(path),
            Err(e) => {
                error!("保存报告失败: {}", e);
                None
            }
        };
        (report, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conflict::ConflictDescriptor;
    use crate::storage::LocalStorage;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FixedAdvisor {
        reply: std::result::Result<String, String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConflictAdvisor for FixedAdvisor {
        async fn advise(&self, _: &[ConflictDescriptor]) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .clone()
                .map_err(crate::error::SyncError::Advisor)
        }
    }

    fn job(src: &std::path::Path, dst: &std::path::Path, strategy: &str) -> JobDefinition {
        // 两侧都用本地目录，方向只影响报告中的显示
        serde_json::from_value(serde_json::json!({
            "name": "engine test",
            "direction": "local-to-otcs",
            "source": src.to_string_lossy(),
            "destination": dst.to_string_lossy(),
            "conflictStrategy": strategy,
        }))
        .unwrap()
    }

    /// 源和目标都有 a.txt 但大小不同
    fn fixture() -> (tempfile::TempDir, tempfile::TempDir, tempfile::TempDir) {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"newer content").unwrap();
        std::fs::write(dst.path().join("a.txt"), b"old").unwrap();
        (src, dst, data)
    }

    fn storages(src: &std::path::Path, dst: &std::path::Path) -> (Arc<dyn Storage>, Arc<dyn Storage>) {
        (
            Arc::new(LocalStorage::new(src).unwrap()),
            Arc::new(LocalStorage::new(dst).unwrap()),
        )
    }

    #[tokio::test]
    async fn test_agent_overwrite_decision_is_applied() {
        let (src, dst, data) = fixture();
        let (source, dest) = storages(src.path(), dst.path());
        let advisor = Arc::new(FixedAdvisor {
            reply: Ok(r#"Sure: {"a.txt": "overwrite"}"#.into()),
            calls: AtomicUsize::new(0),
        });
        let engine = SyncEngine::new(data.path().to_path_buf()).with_advisor(advisor.clone());

        let outcome = engine
            .run_job(&job(src.path(), dst.path(), "agent"), source, dest, RunOptions::default())
            .await
            .unwrap();

        assert_eq!(advisor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.transfer.strategy, ConflictStrategy::Agent);
        assert_eq!(std::fs::read(dst.path().join("a.txt")).unwrap(), b"newer content");
        assert!(outcome.succeeded());
        assert!(outcome.report_path.unwrap().exists());
    }

    #[tokio::test]
    async fn test_agent_rename_never_replaces_or_escapes_destination() {
        let (src, dst, data) = fixture();
        std::fs::write(dst.path().join("keep.txt"), b"precious").unwrap();
        let (source, dest) = storages(src.path(), dst.path());
        let advisor = Arc::new(FixedAdvisor {
            reply: Ok(r#"{"a.txt": "rename:keep.txt"}"#.into()),
            calls: AtomicUsize::new(0),
        });
        let engine = SyncEngine::new(data.path().to_path_buf()).with_advisor(advisor);

        let outcome = engine
            .run_job(&job(src.path(), dst.path(), "agent"), source, dest, RunOptions::default())
            .await
            .unwrap();

        assert_eq!(std::fs::read(dst.path().join("keep.txt")).unwrap(), b"precious");
        assert_eq!(std::fs::read(dst.path().join("a.txt")).unwrap(), b"old");
        assert!(outcome.transfer.has_failures());
        assert!(outcome.transfer.checkpoint.failed.contains_key("a.txt"));

        // 越出目标目录的名称改用时间戳名称
        let outside = tempfile::tempdir().unwrap();
        let dst = outside.path().join("dst");
        std::fs::create_dir_all(&dst).unwrap();
        std::fs::write(dst.join("a.txt"), b"old").unwrap();
        let (source, dest) = storages(src.path(), &dst);
        let advisor = Arc::new(FixedAdvisor {
            reply: Ok(r#"{"a.txt": "rename:../escaped.txt"}"#.into()),
            calls: AtomicUsize::new(0),
        });
        let engine = SyncEngine::new(data.path().to_path_buf()).with_advisor(advisor);

        let outcome = engine
            .run_job(&job(src.path(), &dst, "agent"), source, dest, RunOptions::default())
            .await
            .unwrap();

        assert!(!outside.path().join("escaped.txt").exists());
        let renamed = outcome.transfer.results[0].renamed_to.clone().unwrap();
        assert!(renamed.starts_with("a_") && renamed.ends_with(".txt"));
        assert_eq!(std::fs::read(dst.join(&renamed)).unwrap(), b"newer content");
        assert_eq!(std::fs::read(dst.join("a.txt")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_unparseable_advice_degrades_to_skip() {
        let (src, dst, data) = fixture();
        let (source, dest) = storages(src.path(), dst.path());
        let advisor = Arc::new(FixedAdvisor {
            reply: Ok("overwrite everything!".into()),
            calls: AtomicUsize::new(0),
        });
        let engine = SyncEngine::new(data.path().to_path_buf()).with_advisor(advisor);

        let outcome = engine
            .run_job(&job(src.path(), dst.path(), "agent"), source, dest, RunOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.transfer.strategy, ConflictStrategy::Skip);
        assert_eq!(std::fs::read(dst.path().join("a.txt")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_dry_run_writes_report_but_no_checkpoint() {
        let (src, dst, data) = fixture();
        let (source, dest) = storages(src.path(), dst.path());
        let engine = SyncEngine::new(data.path().to_path_buf());
        let job = job(src.path(), dst.path(), "overwrite");

        let outcome = engine
            .run_job(
                &job,
                source,
                dest,
                RunOptions {
                    dry_run: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(outcome.verification.is_none());
        assert!(outcome.report.as_ref().unwrap().dry_run);
        assert!(!engine.checkpoint_path(&job).exists());
        assert_eq!(std::fs::read(dst.path().join("a.txt")).unwrap(), b"old");
    }
}
