//! 冲突解决
//!
//! `resolve` 是纯函数：相同的条目、策略和决策表总是得到相同的结果。
//! agent 策略需要的决策表在进入逐文件循环之前一次性获取。

use crate::core::comparator::{ItemStatus, Manifest, ManifestItem};
use crate::error::SyncError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// 冲突解决策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// 不传输修改过的文件
    #[default]
    Skip,
    /// 覆盖目标
    Overwrite,
    /// 以带时间戳的新名称传输，保留目标原文件
    Rename,
    /// 使用外部顾问给出的逐文件决策
    Agent,
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictStrategy::Skip => write!(f, "skip"),
            ConflictStrategy::Overwrite => write!(f, "overwrite"),
            ConflictStrategy::Rename => write!(f, "rename"),
            ConflictStrategy::Agent => write!(f, "agent"),
        }
    }
}

/// 顾问对单个文件的决策
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentDecision {
    Skip,
    Overwrite,
    Rename(String),
}

impl FromStr for AgentDecision {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_lowercase().as_str() {
            "skip" => Ok(AgentDecision::Skip),
            "overwrite" => Ok(AgentDecision::Overwrite),
            lower if lower.starts_with("rename:") => {
                Ok(AgentDecision::Rename(s["rename:".len()..].trim().to_string()))
            }
            "rename" => Ok(AgentDecision::Rename(String::new())),
            _ => Err(SyncError::Advisor(format!("无法识别的决策: {}", s))),
        }
    }
}

/// 按相对路径索引的决策表
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentDecisions {
    decisions: HashMap<String, AgentDecision>,
}

impl AgentDecisions {
    pub fn insert(&mut self, path: &str, decision: AgentDecision) {
        self.decisions.insert(path.to_lowercase(), decision);
    }

    pub fn get(&self, path: &str) -> Option<&AgentDecision> {
        self.decisions.get(&path.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }
}

#[derive(Deserialize)]
struct DecisionRow {
    #[serde(alias = "relativePath", alias = "file")]
    path: String,
    #[serde(alias = "action")]
    decision: String,
}

/// 解析顾问返回的文本
///
/// 接受 `{"路径": "决策"}` 或 `[{"path": .., "decision": ..}]`，允许前后夹杂说明文字。
pub fn parse_agent_response(text: &str) -> Result<AgentDecisions, SyncError> {
    let json = extract_json(text)
        .ok_or_else(|| SyncError::Advisor("响应中没有 JSON".to_string()))?;
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| SyncError::Advisor(format!("响应 JSON 无效: {}", e)))?;

    let value = match value {
        serde_json::Value::Object(mut map) if map.contains_key("decisions") => {
            map.remove("decisions").unwrap_or_default()
        }
        other => other,
    };

    let mut decisions = AgentDecisions::default();
    match value {
        serde_json::Value::Object(map) => {
            for (path, decision) in map {
                let decision = decision
                    .as_str()
                    .ok_or_else(|| SyncError::Advisor(format!("{} 的决策不是字符串", path)))?;
                decisions.insert(&path, decision.parse()?);
            }
        }
        serde_json::Value::Array(_) => {
            let rows: Vec<DecisionRow> = serde_json::from_value(value)
                .map_err(|e| SyncError::Advisor(format!("决策列表无效: {}", e)))?;
            for row in rows {
                decisions.insert(&row.path, row.decision.parse()?);
            }
        }
        _ => return Err(SyncError::Advisor("决策必须是对象或数组".to_string())),
    }
    Ok(decisions)
}

fn extract_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let closing = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(closing)?;
    (end > start).then(|| &text[start..=end])
}

/// 单个条目的传输决定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub transfer: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rename: Option<String>,
    pub reason: String,
}

impl Decision {
    fn transfer(reason: &str) -> Self {
        Self {
            transfer: true,
            rename: None,
            reason: reason.to_string(),
        }
    }

    fn skip(reason: &str) -> Self {
        Self {
            transfer: false,
            rename: None,
            reason: reason.to_string(),
        }
    }

    fn rename(name: String, reason: &str) -> Self {
        Self {
            transfer: true,
            rename: Some(name),
            reason: reason.to_string(),
        }
    }
}

/// 给文件名加时间戳后缀：`b.pdf` -> `b_20240101_120000.pdf`
pub fn rename_with_timestamp(name: &str, stamp: &str) -> String {
    match name.rfind('.') {
        Some(pos) if pos > 0 => {
            let (base, ext) = name.split_at(pos);
            format!("{}_{}{}", base, stamp, ext)
        }
        _ => format!("{}_{}", name, stamp),
    }
}

/// 顾问给出的新名称只能是同一目录下的另一个文件名
fn usable_rename<'a>(name: &'a str, original: &str) -> Option<&'a str> {
    let name = name.trim();
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.eq_ignore_ascii_case(original);
    (!invalid).then_some(name)
}

/// 解析单个条目
pub fn resolve(
    item: &ManifestItem,
    strategy: ConflictStrategy,
    decisions: Option<&AgentDecisions>,
    stamp: &str,
) -> Decision {
    match item.status {
        ItemStatus::New => return Decision::transfer("new file"),
        ItemStatus::Existing => return Decision::skip("unchanged"),
        ItemStatus::Orphan => return Decision::skip("orphan (destination only)"),
        ItemStatus::Modified => {}
    }

    let timestamped = || rename_with_timestamp(&item.source.name, stamp);

    match strategy {
        ConflictStrategy::Skip => Decision::skip("conflict: strategy skip"),
        ConflictStrategy::Overwrite => Decision::transfer("conflict: strategy overwrite"),
        ConflictStrategy::Rename => Decision::rename(timestamped(), "conflict: strategy rename"),
        ConflictStrategy::Agent => match decisions.and_then(|d| d.get(item.relative_path())) {
            Some(AgentDecision::Overwrite) => Decision::transfer("conflict: agent overwrite"),
            Some(AgentDecision::Rename(name)) => match usable_rename(name, &item.source.name) {
                Some(name) => Decision::rename(name.to_string(), "conflict: agent rename"),
                None if name.trim().is_empty() => {
                    Decision::rename(timestamped(), "conflict: agent rename")
                }
                None => Decision::rename(
                    timestamped(),
                    &format!("conflict: agent rename to {:?} rejected, using timestamped name", name),
                ),
            },
            Some(AgentDecision::Skip) => Decision::skip("conflict: agent skip"),
            None => Decision::skip("conflict: no agent decision, defaulting to skip"),
        },
    }
}

/// 一次任务内共享的解决器
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
    decisions: Option<AgentDecisions>,
    stamp: String,
}

impl ConflictResolver {
    /// `run_started` 决定 rename 策略使用的时间戳，整个任务保持一致
    pub fn new(
        strategy: ConflictStrategy,
        decisions: Option<AgentDecisions>,
        run_started: DateTime<Utc>,
    ) -> Self {
        Self {
            strategy,
            decisions,
            stamp: run_started.format("%Y%m%d_%H%M%S").to_string(),
        }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    pub fn resolve(&self, item: &ManifestItem) -> Decision {
        resolve(item, self.strategy, self.decisions.as_ref(), &self.stamp)
    }
}

/// 交给冲突顾问的冲突描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDescriptor {
    pub relative_path: String,
    pub source_size: u64,
    pub dest_size: u64,
    pub source_modified: DateTime<Utc>,
    pub dest_modified: DateTime<Utc>,
    pub reason: String,
}

/// 收集清单中的全部冲突
pub fn conflict_descriptors(manifest: &Manifest) -> Vec<ConflictDescriptor> {
    manifest
        .items_with_status(ItemStatus::Modified)
        .filter_map(|item| {
            let dest = item.dest.as_ref()?;
            Some(ConflictDescriptor {
                relative_path: item.source.relative_path.clone(),
                source_size: item.source.size,
                dest_size: dest.size,
                source_modified: item.source.modified_at,
                dest_modified: dest.modified_at,
                reason: item.conflict_reason.clone().unwrap_or_default(),
            })
        })
        .collect()
}
