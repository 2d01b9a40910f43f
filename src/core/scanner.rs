use crate::error::SyncError;
use crate::storage::{Entry, NodeId, Storage};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// 文件扫描器配置
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// 是否递归子目录（否则只列出根目录的直接子项）
    pub recursive: bool,
    /// 排除规则（glob patterns）
    pub exclude_patterns: Vec<String>,
    /// 仅包含的扩展名（空表示不限制）
    pub include_extensions: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            recursive: true,
            exclude_patterns: vec![
                // 系统和编辑器的临时文件
                "Thumbs.db".to_string(),
                "desktop.ini".to_string(),
                "*.tmp".to_string(),
                "~$*".to_string(),
            ],
            include_extensions: vec![],
        }
    }
}

impl ScanConfig {
    pub fn for_job(recursive: bool, extensions: Option<&[String]>) -> Self {
        Self {
            recursive,
            include_extensions: extensions
                .unwrap_or_default()
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            ..Default::default()
        }
    }
}

/// 文件扫描器
///
/// 逐层遍历目录，同一层的目录并发列举；任何一次列举失败都会中止扫描，
/// 不会返回不完整的结果。
pub struct FileScanner {
    max_concurrent: usize,
    config: ScanConfig,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl FileScanner {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            config: ScanConfig::default(),
            cancel_flag: None,
        }
    }

    pub fn with_config(max_concurrent: usize, config: ScanConfig) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            config,
            cancel_flag: None,
        }
    }

    pub fn with_cancel(mut self, cancel_flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(cancel_flag);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .map(|f| f.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// 检查文件是否应该被排除
    fn should_exclude(&self, entry: &Entry) -> bool {
        if self
            .config
            .exclude_patterns
            .iter()
            .any(|p| matches_pattern(&entry.name, p))
        {
            return true;
        }

        if entry.is_dir || self.config.include_extensions.is_empty() {
            return false;
        }

        let ext = std::path::Path::new(&entry.name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        !self.config.include_extensions.iter().any(|e| *e == ext)
    }

    /// 扫描存储，返回所有条目（包括目录）
    pub async fn scan_storage(
        &self,
        storage: &dyn Storage,
        side: &str,
    ) -> Result<Vec<Entry>, SyncError> {
        info!("开始扫描{}: {}", side, storage.name());

        let mut entries = Vec::new();
        let mut level: Vec<(NodeId, String)> = vec![(storage.root(), String::new())];
        let mut excluded_count = 0usize;

        while !level.is_empty() {
            if self.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let listed: Vec<Vec<Entry>> = stream::iter(level.iter())
                .map(|(id, prefix)| storage.list(id, prefix))
                .buffered(self.max_concurrent)
                .try_collect()
                .await
                .map_err(|e| SyncError::discovery(side, e))?;

            let mut next = Vec::new();
            for entry in listed.into_iter().flatten() {
                if self.should_exclude(&entry) {
                    debug!("排除: {}", entry.relative_path);
                    excluded_count += 1;
                    continue;
                }
                if entry.is_dir && self.config.recursive {
                    next.push((entry.id.clone(), entry.relative_path.clone()));
                }
                entries.push(entry);
            }
            level = next;
        }

        let dir_count = entries.iter().filter(|e| e.is_dir).count();
        info!(
            "扫描{}完成: {} 个文件, {} 个目录, {} 个被排除",
            side,
            entries.len() - dir_count,
            dir_count,
            excluded_count
        );

        Ok(entries)
    }
}

impl Default for FileScanner {
    fn default() -> Self {
        Self::new(8)
    }
}

/// 简单的通配符匹配（`*` 匹配任意字符，大小写不敏感）
fn matches_pattern(name: &str, pattern: &str) -> bool {
    let name = name.to_lowercase();
    let pattern = pattern.to_lowercase();

    if !pattern.contains('*') {
        return name == pattern;
    }

    let regex_pattern = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");

    regex::Regex::new(&format!("^{}$", regex_pattern))
        .map(|re| re.is_match(&name))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs/2024")).unwrap();
        std::fs::write(dir.path().join("root.pdf"), b"1").unwrap();
        std::fs::write(dir.path().join("docs/a.txt"), b"22").unwrap();
        std::fs::write(dir.path().join("docs/2024/b.PDF"), b"333").unwrap();
        std::fs::write(dir.path().join("docs/~$lock.docx"), b"x").unwrap();
        dir
    }

    fn paths(entries: &[Entry]) -> Vec<String> {
        let mut paths: Vec<_> = entries.iter().map(|e| e.relative_path.clone()).collect();
        paths.sort();
        paths
    }

    #[tokio::test]
    async fn test_recursive_scan_includes_dirs_and_excludes_temp_files() {
        let dir = fixture();
        let storage = LocalStorage::new(dir.path()).unwrap();
        let entries = FileScanner::default()
            .scan_storage(&storage, "源")
            .await
            .unwrap();
        assert_eq!(
            paths(&entries),
            vec!["docs", "docs/2024", "docs/2024/b.PDF", "docs/a.txt", "root.pdf"]
        );
    }

    #[tokio::test]
    async fn test_non_recursive_sees_only_root_children() {
        let dir = fixture();
        let storage = LocalStorage::new(dir.path()).unwrap();
        let scanner = FileScanner::with_config(4, ScanConfig::for_job(false, None));
        let entries = scanner.scan_storage(&storage, "源").await.unwrap();
        assert_eq!(paths(&entries), vec!["docs", "root.pdf"]);
    }

    #[tokio::test]
    async fn test_extension_filter_is_case_insensitive() {
        let dir = fixture();
        let storage = LocalStorage::new(dir.path()).unwrap();
        let exts = vec![".pdf".to_string()];
        let scanner = FileScanner::with_config(4, ScanConfig::for_job(true, Some(&exts)));
        let entries = scanner.scan_storage(&storage, "源").await.unwrap();
        let files: Vec<_> = entries.iter().filter(|e| !e.is_dir).collect();
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_scan_returns_error() {
        let dir = fixture();
        let storage = LocalStorage::new(dir.path()).unwrap();
        let flag = Arc::new(AtomicBool::new(true));
        let result = FileScanner::default()
            .with_cancel(flag)
            .scan_storage(&storage, "源")
            .await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[test]
    fn test_matches_pattern() {
        assert!(matches_pattern("Thumbs.db", "thumbs.db"));
        assert!(matches_pattern("draft.TMP", "*.tmp"));
        assert!(matches_pattern("~$report.docx", "~$*"));
        assert!(!matches_pattern("report.docx", "~$*"));
    }
}
