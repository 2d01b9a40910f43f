use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use otcs_sync_lib::advisor::HttpAdvisor;
use otcs_sync_lib::core::checkpoint::CheckpointStore;
use otcs_sync_lib::core::progress::{format_bytes, format_duration, ProgressSnapshot};
use otcs_sync_lib::core::ItemStatus;
use otcs_sync_lib::logging::init_logging;
use otcs_sync_lib::storage::create_storages;
use otcs_sync_lib::{dirs, AppConfig, JobDefinition, RunOptions, SyncEngine, SyncError};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "otcs-sync")]
#[command(about = "Migrate documents between a local file system and OpenText Content Server", long_about = None)]
#[command(version)]
struct Cli {
    /// Data directory holding config.json, checkpoints, reports and logs
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a migration job
    Run {
        /// Path to the job definition (JSON)
        job: PathBuf,

        /// Continue from the job's checkpoint
        #[arg(long)]
        resume: bool,

        /// Classify and report without touching either side
        #[arg(long)]
        dry_run: bool,
    },

    /// Compare source and destination without transferring
    Analyze {
        /// Path to the job definition (JSON)
        job: PathBuf,

        /// Include every manifest item in the output
        #[arg(long)]
        list: bool,
    },

    /// Show the saved checkpoint of a job
    Checkpoint {
        /// Path to the job definition (JSON)
        job: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.clone().unwrap_or_else(dirs::default_data_dir);

    let config = match AppConfig::load(&data_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };
    let _guard = init_logging(&dirs::log_dir(&data_dir), &config.log, cli.verbose);

    match execute(cli.command, &data_dir, &config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_status(&e))
        }
    }
}

/// 配置错误（包括任务文件）退出码为 2，其余失败为 1
fn exit_status(e: &anyhow::Error) -> u8 {
    let is_config = e
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<SyncError>(), Some(SyncError::Config(_))));
    if is_config {
        2
    } else {
        1
    }
}

async fn execute(command: Commands, data_dir: &Path, config: &AppConfig) -> Result<ExitCode> {
    match command {
        Commands::Run {
            job,
            resume,
            dry_run,
        } => run(&job, data_dir, config, resume, dry_run).await,
        Commands::Analyze { job, list } => analyze(&job, data_dir, config, list).await,
        Commands::Checkpoint { job } => {
            let job = load_job(&job)?;
            let checkpoint = CheckpointStore::read(&CheckpointStore::path_for(data_dir, &job)).await?;
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_job(path: &Path) -> Result<JobDefinition> {
    JobDefinition::load(path).with_context(|| format!("加载任务失败: {}", path.display()))
}

async fn run(
    job_path: &Path,
    data_dir: &Path,
    config: &AppConfig,
    resume: bool,
    dry_run: bool,
) -> Result<ExitCode> {
    let job = load_job(job_path)?;
    let (source, dest) = create_storages(&job, config)
        .await
        .context("初始化存储失败")?;

    let mut engine = SyncEngine::new(data_dir.to_path_buf());
    if let Some(advisor_config) = &config.advisor {
        let advisor = Arc::new(HttpAdvisor::from_config(advisor_config)?);
        engine = engine
            .with_advisor(advisor.clone())
            .with_narrator(advisor);
    }

    // Ctrl-C 只阻止新批次开始，当前批次会正常结束
    let cancel = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，当前批次完成后停止");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressSnapshot>(32);
    let progress_handle = tokio::spawn(async move {
        while let Some(p) = progress_rx.recv().await {
            info!(
                "进度 {}/{}: 成功 {}, 跳过 {}, 失败 {}, {} ({:.2} MB/s), 剩余 {}",
                p.processed,
                p.total_files,
                p.completed,
                p.skipped,
                p.failed,
                format_bytes(p.transferred_bytes),
                p.mb_per_sec,
                p.eta_secs
                    .map(format_duration)
                    .unwrap_or_else(|| "-".to_string())
            );
        }
    });

    let result = engine
        .run_job(
            &job,
            source,
            dest,
            RunOptions {
                resume,
                dry_run,
                progress_tx: Some(progress_tx),
            },
        )
        .await;
    let _ = progress_handle.await;
    let outcome = result?;

    let summary = serde_json::json!({
        "job": job.name,
        "dryRun": dry_run,
        "cancelled": outcome.transfer.cancelled,
        "manifest": outcome.manifest,
        "transfer": outcome.transfer.stats,
        "alreadyCompleted": outcome.transfer.already_completed,
        "orphans": outcome.orphans,
        "verification": outcome.verification.as_ref().map(|v| &v.summary),
        "report": outcome.report_path,
        "narrative": outcome.report.as_ref().and_then(|r| r.narrative.as_ref()),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let Some(report) = &outcome.report {
        info!("{}", report.summary_line());
    }

    Ok(if outcome.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn analyze(job_path: &Path, data_dir: &Path, config: &AppConfig, list: bool) -> Result<ExitCode> {
    let job = load_job(job_path)?;
    let (source, dest) = create_storages(&job, config)
        .await
        .context("初始化存储失败")?;

    let engine = SyncEngine::new(data_dir.to_path_buf());
    let manifest = engine.analyze(&job, source.as_ref(), dest.as_ref()).await?;

    let conflicts: Vec<_> = manifest
        .items_with_status(ItemStatus::Modified)
        .map(|i| {
            serde_json::json!({
                "relativePath": i.relative_path(),
                "reason": i.conflict_reason,
            })
        })
        .collect();

    let mut output = serde_json::json!({
        "job": job.name,
        "direction": job.direction,
        "summary": manifest.summary,
        "conflicts": conflicts,
    });
    if list {
        output["items"] = serde_json::to_value(&manifest.items)?;
    }
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(ExitCode::SUCCESS)
}
