//! 传输进度统计

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 某一时刻的进度快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    /// 已处理条目（三者之和）
    pub processed: u64,
    pub total_files: u64,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub elapsed_ms: u64,
    pub files_per_sec: f64,
    pub mb_per_sec: f64,
    /// 剩余时间估计，尚无速度数据时为 None
    pub eta_secs: Option<u64>,
}

/// 单次任务运行的计数器，可在批内并发更新
#[derive(Debug)]
pub struct ProgressTracker {
    started: Instant,
    total_files: u64,
    total_bytes: u64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    transferred_bytes: AtomicU64,
}

impl ProgressTracker {
    pub fn new(total_files: u64, total_bytes: u64) -> Self {
        Self {
            started: Instant::now(),
            total_files,
            total_bytes,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            transferred_bytes: AtomicU64::new(0),
        }
    }

    pub fn record_completed(&self, bytes: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.transferred_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.stats_at(self.started.elapsed())
    }

    /// 按给定耗时计算吞吐量和 ETA
    pub fn stats_at(&self, elapsed: Duration) -> ProgressSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let skipped = self.skipped.load(Ordering::Relaxed);
        let transferred_bytes = self.transferred_bytes.load(Ordering::Relaxed);
        let processed = completed + failed + skipped;

        let secs = elapsed.as_secs_f64();
        let (files_per_sec, bytes_per_sec) = if secs > 0.0 {
            (processed as f64 / secs, transferred_bytes as f64 / secs)
        } else {
            (0.0, 0.0)
        };

        // 优先按字节估计，没有字节数据时按文件数
        let remaining_bytes = self.total_bytes.saturating_sub(transferred_bytes);
        let remaining_files = self.total_files.saturating_sub(processed);
        let eta_secs = if remaining_files == 0 {
            Some(0)
        } else if bytes_per_sec > 0.0 && remaining_bytes > 0 {
            Some((remaining_bytes as f64 / bytes_per_sec).ceil() as u64)
        } else if files_per_sec > 0.0 {
            Some((remaining_files as f64 / files_per_sec).ceil() as u64)
        } else {
            None
        };

        ProgressSnapshot {
            completed,
            failed,
            skipped,
            processed,
            total_files: self.total_files,
            transferred_bytes,
            total_bytes: self.total_bytes,
            elapsed_ms: elapsed.as_millis() as u64,
            files_per_sec,
            mb_per_sec: bytes_per_sec / (1024.0 * 1024.0),
            eta_secs,
        }
    }
}

/// 格式化字节数
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// 格式化秒数
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
