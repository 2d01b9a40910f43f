//! 任务检查点
//!
//! 批内各个传输并发完成，所有修改都经过同一把锁串行化；
//! 落盘时先写临时文件再重命名，避免中断后留下半个 JSON。

use crate::config::JobDefinition;
use crate::error::SyncError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// 检查点文件内容
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Checkpoint {
    pub completed: BTreeSet<String>,
    /// 相对路径 -> 最后一次错误
    pub failed: BTreeMap<String, String>,
    /// 相对路径 -> 上传后得到的远程节点 ID
    #[serde(alias = "nodeIDMap")]
    pub node_id_map: BTreeMap<String, i64>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn is_completed(&self, relative_path: &str) -> bool {
        self.completed.contains(relative_path)
    }
}

/// 检查点存储
pub struct CheckpointStore {
    path: Option<PathBuf>,
    state: Mutex<Checkpoint>,
}

impl CheckpointStore {
    /// `<data_dir>/checkpoints/<slug>.json`
    pub fn path_for(data_dir: &Path, job: &JobDefinition) -> PathBuf {
        data_dir
            .join("checkpoints")
            .join(format!("{}.json", job.slug()))
    }

    /// 打开检查点；不续传时从空状态开始，旧文件保留到下次落盘覆盖
    pub async fn open(path: PathBuf, resume: bool) -> Result<Self, SyncError> {
        let state = if resume {
            Self::read(&path).await?
        } else {
            Checkpoint::default()
        };
        if resume {
            info!(
                "从检查点续传: 已完成 {}, 失败 {}",
                state.completed.len(),
                state.failed.len()
            );
        }
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// 只在内存中记录，从不落盘（dry run）
    pub fn detached(initial: Checkpoint) -> Self {
        Self {
            path: None,
            state: Mutex::new(initial),
        }
    }

    /// 读取检查点文件，不存在时返回空状态
    pub async fn read(path: &Path) -> Result<Checkpoint, SyncError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                SyncError::Checkpoint(format!("{} 格式错误: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Checkpoint::default()),
            Err(e) => Err(SyncError::Checkpoint(format!(
                "无法读取 {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn mark_completed(&self, relative_path: &str, remote_id: Option<i64>) {
        let mut state = self.state.lock().await;
        state.failed.remove(relative_path);
        state.completed.insert(relative_path.to_string());
        if let Some(id) = remote_id {
            state.node_id_map.insert(relative_path.to_string(), id);
        }
    }

    pub async fn mark_failed(&self, relative_path: &str, error: &str) {
        let mut state = self.state.lock().await;
        state
            .failed
            .insert(relative_path.to_string(), error.to_string());
    }

    pub async fn snapshot(&self) -> Checkpoint {
        self.state.lock().await.clone()
    }

    /// 写入磁盘；游离的存储什么也不做
    pub async fn flush(&self) -> Result<(), SyncError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let content = {
            let mut state = self.state.lock().await;
            state.timestamp = Some(Utc::now());
            serde_json::to_vec_pretty(&*state)?
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &content).await?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            SyncError::Checkpoint(format!("无法写入 {}: {}", path.display(), e))
        })?;
        debug!("检查点已保存: {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_flush_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints/finance.json");

        let store = CheckpointStore::open(path.clone(), false).await.unwrap();
        store.mark_failed("a.txt", "timeout").await;
        store.mark_completed("a.txt", Some(501)).await;
        store.mark_failed("b.txt", "HTTP 500").await;
        store.flush().await.unwrap();

        let resumed = CheckpointStore::open(path.clone(), true).await.unwrap();
        let state = resumed.snapshot().await;
        assert!(state.is_completed("a.txt"));
        assert!(!state.failed.contains_key("a.txt"));
        assert_eq!(state.failed["b.txt"], "HTTP 500");
        assert_eq!(state.node_id_map["a.txt"], 501);
        assert!(state.timestamp.is_some());

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(json.get("nodeIdMap").is_some());
    }

    #[tokio::test]
    async fn test_fresh_run_ignores_existing_file_until_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(&path, r#"{"completed": ["old.txt"]}"#).unwrap();

        let store = CheckpointStore::open(path.clone(), false).await.unwrap();
        assert!(store.snapshot().await.completed.is_empty());
        assert!(std::fs::read_to_string(&path).unwrap().contains("old.txt"));
    }

    #[tokio::test]
    async fn test_detached_store_never_writes() {
        let store = CheckpointStore::detached(Checkpoint::default());
        store.mark_completed("a.txt", None).await;
        store.flush().await.unwrap();
        assert!(store.path().is_none());
        assert!(store.snapshot().await.timestamp.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_marks_are_serialized() {
        let store = Arc::new(CheckpointStore::detached(Checkpoint::default()));
        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.mark_completed(&format!("f{}.txt", i), Some(i)).await;
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        let state = store.snapshot().await;
        assert_eq!(state.completed.len(), 50);
        assert_eq!(state.node_id_map.len(), 50);
    }

    #[test]
    fn test_accepts_legacy_key_spelling() {
        let state: Checkpoint =
            serde_json::from_str(r#"{"completed": [], "nodeIDMap": {"a.txt": 9}}"#).unwrap();
        assert_eq!(state.node_id_map["a.txt"], 9);
    }
}
