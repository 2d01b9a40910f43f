//! 端到端流程：本地目录 <-> 内存 Content Server

mod common;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use common::{remote_storage, write_file, InstantClock, MemoryServer, ROOT};
use otcs_sync_lib::advisor::ConflictAdvisor;
use otcs_sync_lib::core::checkpoint::CheckpointStore;
use otcs_sync_lib::core::conflict::{ConflictDescriptor, ConflictStrategy};
use otcs_sync_lib::core::report::FileStatus;
use otcs_sync_lib::core::transfer::TransferAction;
use otcs_sync_lib::storage::{LocalStorage, Storage};
use otcs_sync_lib::{JobDefinition, RunOptions, SyncEngine, SyncError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn upload_job(src: &Path, strategy: &str, concurrency: usize) -> JobDefinition {
    serde_json::from_value(serde_json::json!({
        "name": "Finance Upload",
        "direction": "local-to-otcs",
        "source": src.to_string_lossy(),
        "destination": ROOT,
        "concurrency": concurrency,
        "conflictStrategy": strategy,
    }))
    .unwrap()
}

fn engine(data: &Path, clock: Arc<InstantClock>) -> SyncEngine {
    SyncEngine::new(data.to_path_buf()).with_clock(clock)
}

fn local(path: &Path) -> Arc<dyn Storage> {
    Arc::new(LocalStorage::new(path).unwrap())
}

#[tokio::test]
async fn new_file_is_uploaded_and_checkpointed() {
    let src = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    write_file(src.path(), "a.txt", &[b'a'; 100]);
    let server = MemoryServer::new();
    let job = upload_job(src.path(), "skip", 4);
    let engine = engine(data.path(), Arc::default());

    let outcome = engine
        .run_job(&job, local(src.path()), remote_storage(&server), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.manifest.new, 1);
    assert_eq!(outcome.transfer.count(TransferAction::Transferred), 1);
    let node = server.child(ROOT, "a.txt").unwrap();
    assert_eq!(server.content(node.id).unwrap().len(), 100);

    let saved = CheckpointStore::read(&engine.checkpoint_path(&job)).await.unwrap();
    assert!(saved.completed.contains("a.txt"));
    assert_eq!(saved.node_id_map["a.txt"], node.id);

    let verification = outcome.verification.as_ref().unwrap();
    assert_eq!(verification.summary.passed, 1);
    assert!(outcome.succeeded());
    let report = outcome.report.unwrap();
    assert_eq!(report.files[0].status, FileStatus::Verified);
}

#[tokio::test]
async fn folder_tree_is_created_once_and_existing_folders_reused() {
    let src = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    write_file(src.path(), "docs/2024/q1/report.pdf", b"pdf");
    write_file(src.path(), "docs/readme.txt", b"hi");
    std::fs::create_dir_all(src.path().join("empty")).unwrap();
    let server = MemoryServer::new();
    let existing_docs = server.add_folder(ROOT, "DOCS");

    let outcome = engine(data.path(), Arc::default())
        .run_job(
            &upload_job(src.path(), "skip", 4),
            local(src.path()),
            remote_storage(&server),
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.transfer.count(TransferAction::Transferred), 2);
    let mut root_children = server.children(ROOT);
    root_children.sort();
    assert_eq!(root_children, vec!["DOCS", "empty"]);
    let year = server.child(existing_docs, "2024").unwrap();
    let quarter = server.child(year.id, "q1").unwrap();
    assert!(server.child(quarter.id, "report.pdf").is_some());
}

#[tokio::test]
async fn rename_strategy_keeps_original_destination() {
    let src = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    write_file(src.path(), "b.pdf", &[b'n'; 200]);
    let server = MemoryServer::new();
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let original = server.add_document(ROOT, "b.pdf", &[b'o'; 150], at);

    let outcome = engine(data.path(), Arc::default())
        .run_job(
            &upload_job(src.path(), "rename", 4),
            local(src.path()),
            remote_storage(&server),
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.manifest.modified, 1);
    let report = outcome.report.as_ref().unwrap();
    assert!(report.conflicts[0].reason.contains("size mismatch"));
    assert_eq!(report.conflicts[0].strategy, ConflictStrategy::Rename);

    // 原文件未被改动
    assert_eq!(server.content(original).unwrap(), vec![b'o'; 150]);
    assert_eq!(server.versions(original), 1);

    let renamed: Vec<String> = server
        .children(ROOT)
        .into_iter()
        .filter(|n| n != "b.pdf")
        .collect();
    assert_eq!(renamed.len(), 1);
    assert!(renamed[0].starts_with("b_") && renamed[0].ends_with(".pdf"));
    assert_eq!(renamed[0].len(), "b_20240101_000000.pdf".len());
    assert_eq!(
        outcome.transfer.results[0].renamed_to.as_deref(),
        Some(renamed[0].as_str())
    );
    assert_eq!(outcome.verification.unwrap().summary.passed, 1);
}

#[tokio::test]
async fn overwrite_strategy_adds_a_version() {
    let src = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    write_file(src.path(), "b.pdf", &[b'n'; 200]);
    let server = MemoryServer::new();
    let original = server.add_document(ROOT, "b.pdf", &[b'o'; 150], Utc::now());

    engine(data.path(), Arc::default())
        .run_job(
            &upload_job(src.path(), "overwrite", 4),
            local(src.path()),
            remote_storage(&server),
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(server.versions(original), 2);
    assert_eq!(server.content(original).unwrap(), vec![b'n'; 200]);
    assert_eq!(server.children(ROOT).len(), 1);
}

#[tokio::test]
async fn verification_reports_size_mismatch() {
    let src = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    write_file(src.path(), "a.txt", &[b'a'; 100]);
    let server = MemoryServer::new();
    server.report_size("a.txt", 99);

    let outcome = engine(data.path(), Arc::default())
        .run_job(
            &upload_job(src.path(), "skip", 4),
            local(src.path()),
            remote_storage(&server),
            RunOptions::default(),
        )
        .await
        .unwrap();

    let verification = outcome.verification.as_ref().unwrap();
    assert_eq!(verification.summary.failed, 1);
    assert!(!verification.items[0].passed);
    assert_eq!(
        verification.items[0].error.as_deref(),
        Some("size mismatch: expected 100 bytes, found 99 bytes")
    );
    // 校验失败不回滚传输
    assert_eq!(outcome.transfer.count(TransferAction::Transferred), 1);
    assert!(!outcome.succeeded());
}

#[tokio::test]
async fn exhausted_retries_fail_only_that_file() {
    let src = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    for name in ["a.txt", "b.txt", "c.txt"] {
        write_file(src.path(), name, name.as_bytes());
    }
    let server = MemoryServer::new();
    server.fail_always("b.txt");
    server.fail_transiently("c.txt", 1);
    let clock = Arc::new(InstantClock::default());

    let outcome = engine(data.path(), clock.clone())
        .run_job(
            &upload_job(src.path(), "skip", 4),
            local(src.path()),
            remote_storage(&server),
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.transfer.count(TransferAction::Transferred), 2);
    assert_eq!(outcome.transfer.count(TransferAction::Failed), 1);
    // 默认 3 次尝试
    assert_eq!(server.attempts("b.txt"), 3);
    assert_eq!(server.attempts("c.txt"), 2);
    assert!(outcome.transfer.checkpoint.failed["b.txt"].contains("HTTP 500"));

    let mut sleeps = clock.sleeps.lock().unwrap().clone();
    sleeps.sort();
    assert_eq!(
        sleeps,
        vec![Duration::from_secs(1), Duration::from_secs(1), Duration::from_secs(2)]
    );
}

#[tokio::test]
async fn resume_attempts_only_remaining_items() {
    let src = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    for i in 0..5 {
        write_file(src.path(), &format!("f{}.txt", i), b"payload");
    }
    let server = MemoryServer::new();
    server.fail_always("f3.txt");
    let job = upload_job(src.path(), "skip", 2);
    let engine = engine(data.path(), Arc::default());

    let first = engine
        .run_job(&job, local(src.path()), remote_storage(&server), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(first.transfer.checkpoint.completed.len(), 4);
    let writes_before = server.total_writes();

    server.clear_faults();
    let second = engine
        .run_job(
            &job,
            local(src.path()),
            remote_storage(&server),
            RunOptions {
                resume: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(second.transfer.already_completed, 4);
    assert_eq!(second.transfer.results.len(), 1);
    assert_eq!(second.transfer.results[0].relative_path(), "f3.txt");
    assert_eq!(server.total_writes() - writes_before, 1);

    let saved = CheckpointStore::read(&engine.checkpoint_path(&job)).await.unwrap();
    assert_eq!(saved.completed.len(), 5);
    assert!(saved.failed.is_empty());
}

#[tokio::test]
async fn in_flight_transfers_never_exceed_concurrency() {
    let src = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    for i in 0..20 {
        write_file(src.path(), &format!("file{:02}.bin", i), &[0u8; 64]);
    }
    let server = MemoryServer::new();

    let outcome = engine(data.path(), Arc::default())
        .run_job(
            &upload_job(src.path(), "skip", 3),
            local(src.path()),
            remote_storage(&server),
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.transfer.count(TransferAction::Transferred), 20);
    assert!(server.max_in_flight() <= 3);
    assert!(server.max_in_flight() >= 1);
}

#[tokio::test]
async fn session_loss_aborts_job_after_flushing_checkpoint() {
    let src = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    for name in ["a.txt", "b.txt", "c.txt"] {
        write_file(src.path(), name, b"x");
    }
    let server = MemoryServer::new();
    server.lose_session_on("b.txt");
    let job = upload_job(src.path(), "skip", 1);
    let engine = engine(data.path(), Arc::default());

    let result = engine
        .run_job(&job, local(src.path()), remote_storage(&server), RunOptions::default())
        .await;

    assert!(matches!(result, Err(SyncError::SessionExpired)));
    assert_eq!(server.attempts("b.txt"), 1);
    assert!(server.child(ROOT, "c.txt").is_none());

    let saved = CheckpointStore::read(&engine.checkpoint_path(&job)).await.unwrap();
    assert!(saved.completed.contains("a.txt"));
    assert!(saved.failed.contains_key("b.txt"));
}

#[tokio::test]
async fn orphans_are_reported_but_never_transferred() {
    let src = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    write_file(src.path(), "keep.txt", b"keep");
    let server = MemoryServer::new();
    let orphan = server.add_document(ROOT, "legacy.doc", b"old", Utc::now());

    let outcome = engine(data.path(), Arc::default())
        .run_job(
            &upload_job(src.path(), "overwrite", 4),
            local(src.path()),
            remote_storage(&server),
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.orphans, 1);
    assert!(outcome
        .transfer
        .results
        .iter()
        .all(|r| r.relative_path() != "legacy.doc"));
    assert_eq!(outcome.report.unwrap().orphans, vec!["legacy.doc"]);
    assert_eq!(server.versions(orphan), 1);
}

#[tokio::test]
async fn download_writes_remote_tree_to_local_directory() {
    let dst = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let server = MemoryServer::new();
    let docs = server.add_folder(ROOT, "Docs");
    server.add_document(docs, "x.txt", b"remote x", Utc::now());
    server.add_document(ROOT, "y.txt", b"remote y", Utc::now());

    let job: JobDefinition = serde_json::from_value(serde_json::json!({
        "name": "Finance Download",
        "direction": "otcs-to-local",
        "source": ROOT,
        "destination": dst.path().to_string_lossy(),
    }))
    .unwrap();
    job.validate().unwrap();

    let outcome = engine(data.path(), Arc::default())
        .run_job(&job, remote_storage(&server), local(dst.path()), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.transfer.count(TransferAction::Transferred), 2);
    assert_eq!(std::fs::read(dst.path().join("Docs/x.txt")).unwrap(), b"remote x");
    assert_eq!(std::fs::read(dst.path().join("y.txt")).unwrap(), b"remote y");
    assert_eq!(outcome.verification.unwrap().summary.passed, 2);
    // 下载不记录远程节点 ID
    assert!(outcome.transfer.checkpoint.node_id_map.is_empty());
}

struct ScriptedAdvisor(&'static str);

#[async_trait]
impl ConflictAdvisor for ScriptedAdvisor {
    async fn advise(&self, conflicts: &[ConflictDescriptor]) -> Result<String, SyncError> {
        assert_eq!(conflicts.len(), 2);
        Ok(self.0.to_string())
    }
}

#[tokio::test]
async fn agent_decisions_apply_and_missing_ones_skip() {
    let src = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    write_file(src.path(), "b.pdf", &[b'n'; 20]);
    write_file(src.path(), "c.pdf", &[b'n'; 30]);
    let server = MemoryServer::new();
    let b = server.add_document(ROOT, "b.pdf", b"old", Utc::now());
    let c = server.add_document(ROOT, "c.pdf", b"old", Utc::now());

    let outcome = engine(data.path(), Arc::default())
        .with_advisor(Arc::new(ScriptedAdvisor(
            r#"[{"path": "b.pdf", "decision": "rename:b-v2.pdf"}]"#,
        )))
        .run_job(
            &upload_job(src.path(), "agent", 4),
            local(src.path()),
            remote_storage(&server),
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.transfer.strategy, ConflictStrategy::Agent);
    let renamed = server.child(ROOT, "b-v2.pdf").unwrap();
    assert_eq!(server.content(renamed.id).unwrap().len(), 20);
    assert_eq!(server.content(b).unwrap(), b"old");
    assert_eq!(server.content(c).unwrap(), b"old");

    let c_result = outcome
        .transfer
        .results
        .iter()
        .find(|r| r.relative_path() == "c.pdf")
        .unwrap();
    assert_eq!(c_result.action, TransferAction::Skipped);
}
