//! 传输后校验
//!
//! 只比较大小，远程侧没有可用的校验和。校验独立于传输，
//! 可以单独重跑或省略，不会修改检查点。

use crate::core::transfer::{TransferAction, TransferResult};
use crate::storage::{NodeId, Storage};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationItem {
    pub relative_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_id: Option<NodeId>,
    pub expected_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_size: Option<u64>,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// 未传输（跳过或失败）而不参与校验的结果数
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub items: Vec<VerificationItem>,
    pub summary: VerificationSummary,
}

impl VerificationReport {
    pub fn all_passed(&self) -> bool {
        self.summary.failed == 0
    }
}

pub struct Verifier {
    dest: Arc<dyn Storage>,
    node_ids: BTreeMap<String, i64>,
    concurrency: usize,
}

impl Verifier {
    pub fn new(dest: Arc<dyn Storage>) -> Self {
        Self {
            dest,
            node_ids: BTreeMap::new(),
            concurrency: 4,
        }
    }

    /// 检查点里记录的远程节点 ID，结果中没有目标 ID 时使用
    pub fn with_node_ids(mut self, node_ids: BTreeMap<String, i64>) -> Self {
        self.node_ids = node_ids;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn verify(&self, results: &[TransferResult]) -> VerificationReport {
        let (transferred, others): (Vec<&TransferResult>, Vec<&TransferResult>) = results
            .iter()
            .partition(|r| r.success && r.action == TransferAction::Transferred);

        let mut items: Vec<VerificationItem> = stream::iter(transferred)
            .map(|r| self.verify_one(r))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        items.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        let passed = items.iter().filter(|i| i.passed).count();
        let summary = VerificationSummary {
            total: items.len(),
            passed,
            failed: items.len() - passed,
            skipped: others.len(),
        };
        info!(
            "校验完成: 通过 {}, 失败 {}, 未校验 {}",
            summary.passed, summary.failed, summary.skipped
        );

        VerificationReport { items, summary }
    }

    async fn verify_one(&self, result: &TransferResult) -> VerificationItem {
        let relative_path = result.dest_relative_path();
        let expected_size = result.item.source.size;
        let dest_id = result.dest_id.clone().or_else(|| {
            self.node_ids
                .get(result.relative_path())
                .map(|id| NodeId::Remote(*id))
        });

        let item = |actual_size, error: Option<String>| VerificationItem {
            relative_path: relative_path.clone(),
            dest_id: dest_id.clone(),
            expected_size,
            actual_size,
            passed: error.is_none(),
            error,
        };

        let Some(id) = &dest_id else {
            return item(None, Some("destination not found: no destination id recorded".into()));
        };

        match self.dest.stat(id).await {
            Ok(Some(entry)) if entry.size == expected_size => item(Some(entry.size), None),
            Ok(Some(entry)) => {
                warn!("校验失败 {}: 大小不一致", relative_path);
                item(
                    Some(entry.size),
                    Some(format!(
                        "size mismatch: expected {} bytes, found {} bytes",
                        expected_size, entry.size
                    )),
                )
            }
            Ok(None) => item(None, Some(format!("destination not found: {}", id))),
            Err(e) => item(None, Some(format!("stat failed: {}", e))),
        }
    }
}
