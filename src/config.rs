//! 应用配置与任务定义

use crate::core::conflict::ConflictStrategy;
use crate::error::SyncError;
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Content Server 连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OtcsConfig {
    pub base_url: String,
    pub username: String,
    /// 明文密码（优先使用 password_env）
    pub password: Option<String>,
    /// 保存密码的环境变量名
    pub password_env: Option<String>,
    pub page_size: usize,
    pub timeout_secs: u64,
}

impl Default for OtcsConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: String::new(),
            password: None,
            password_env: Some("OTCS_PASSWORD".to_string()),
            page_size: crate::storage::DEFAULT_PAGE_SIZE,
            timeout_secs: crate::storage::IO_TIMEOUT_SECS,
        }
    }
}

impl OtcsConfig {
    pub fn resolve_password(&self) -> Result<String, SyncError> {
        if let Some(value) = self
            .password_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
        {
            return Ok(value);
        }
        self.password
            .clone()
            .ok_or_else(|| SyncError::Config("未配置 Content Server 密码".to_string()))
    }
}

/// 冲突顾问（LLM）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdvisorConfig {
    /// OpenAI 兼容接口地址，例如 https://api.openai.com/v1
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 120,
        }
    }
}

/// config.json 的完整内容
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub log: LogConfig,
    pub otcs: OtcsConfig,
    /// 未配置时 agent 策略降级为 skip
    pub advisor: Option<AdvisorConfig>,
}

impl AppConfig {
    /// 从数据目录加载配置，文件不存在时使用默认值
    pub fn load(data_dir: &Path) -> Result<Self, SyncError> {
        let config_file = data_dir.join("config.json");
        if !config_file.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&config_file)?;
        serde_json::from_str(&content).map_err(|e| {
            SyncError::Config(format!("{} 格式错误: {}", config_file.display(), e))
        })
    }
}

/// 同步方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    #[serde(rename = "local-to-otcs")]
    LocalToOtcs,
    #[serde(rename = "otcs-to-local")]
    OtcsToLocal,
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferDirection::LocalToOtcs => write!(f, "local-to-otcs"),
            TransferDirection::OtcsToLocal => write!(f, "otcs-to-local"),
        }
    }
}

/// 源或目标位置：本地路径或远程节点 ID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobLocation {
    NodeId(i64),
    Path(String),
}

impl JobLocation {
    pub fn remote_id(&self) -> Result<i64, SyncError> {
        match self {
            JobLocation::NodeId(id) => Ok(*id),
            JobLocation::Path(s) => s
                .trim()
                .parse()
                .map_err(|_| SyncError::Config(format!("远程位置必须是节点 ID: {}", s))),
        }
    }

    pub fn local_path(&self) -> Result<PathBuf, SyncError> {
        match self {
            JobLocation::Path(s) if !s.trim().is_empty() => Ok(PathBuf::from(s)),
            other => Err(SyncError::Config(format!(
                "本地位置必须是目录路径: {:?}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for JobLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobLocation::NodeId(id) => write!(f, "{}", id),
            JobLocation::Path(p) => write!(f, "{}", p),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    4
}

fn default_retries() -> u32 {
    3
}

/// 迁移任务定义（只读）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    pub name: String,
    pub direction: TransferDirection,
    pub source: JobLocation,
    pub destination: JobLocation,
    #[serde(default = "default_true")]
    pub recursive: bool,
    /// 扩展名白名单（不含点，大小写不敏感）
    #[serde(default)]
    pub extensions: Option<Vec<String>>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default = "default_true")]
    pub generate_report: bool,
    /// 是否把报告上传到目标存储
    #[serde(default)]
    pub upload_report: bool,
    /// 报告上传目录（相对目标根目录）
    #[serde(default)]
    pub report_folder: Option<String>,
}

impl JobDefinition {
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let content = fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("无法读取 {}: {}", path.display(), e)))?;
        let job: JobDefinition = serde_json::from_str(&content)
            .map_err(|e| SyncError::Config(format!("{} 格式错误: {}", path.display(), e)))?;
        job.validate()?;
        Ok(job)
    }

    /// 检查源和目标与方向是否匹配
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.name.trim().is_empty() {
            return Err(SyncError::Config("任务名称不能为空".to_string()));
        }
        match self.direction {
            TransferDirection::LocalToOtcs => {
                self.source.local_path()?;
                self.destination.remote_id()?;
            }
            TransferDirection::OtcsToLocal => {
                self.source.remote_id()?;
                self.destination.local_path()?;
            }
        }
        Ok(())
    }

    /// 检查点与报告使用的文件名
    pub fn slug(&self) -> String {
        slugify(&self.name)
    }
}

/// 转换为文件系统安全的名称
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "job".to_string()
    } else {
        slug
    }
}
