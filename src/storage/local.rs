use super::{join_relative, mime_for, Entry, NodeId, Storage};
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use walkdir::WalkDir;

pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
}

impl LocalStorage {
    /// 打开已存在的目录（作为源）
    pub fn new(path: &Path) -> Result<Self, StorageError> {
        if !path.is_dir() {
            return Err(StorageError::NotFound(format!(
                "本地目录不存在: {}",
                path.display()
            )));
        }
        Ok(Self::at(path))
    }

    /// 打开目录，不存在时创建（作为目标）
    pub fn create(path: &Path) -> Result<Self, StorageError> {
        if !path.exists() {
            std::fs::create_dir_all(path)?;
        }
        Ok(Self::at(path))
    }

    fn at(path: &Path) -> Self {
        Self {
            base_path: path.to_path_buf(),
            name: format!("local:{}", path.display()),
        }
    }

    fn local_path<'a>(&self, id: &'a NodeId) -> Result<&'a Path, StorageError> {
        id.as_local()
            .ok_or_else(|| StorageError::Other(format!("不是本地节点: {}", id)))
    }

    /// 父目录下的子路径，名称必须是单个路径分量
    fn child_path(&self, parent: &NodeId, name: &str) -> Result<PathBuf, StorageError> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) if !name.contains(['/', '\\']) => {
                Ok(self.local_path(parent)?.join(name))
            }
            _ => Err(StorageError::InvalidName(name.to_string())),
        }
    }

    /// 相对根目录的路径（统一使用 /）
    fn relative_of(&self, path: &Path) -> String {
        path.strip_prefix(&self.base_path)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|_| path.to_string_lossy().replace('\\', "/"))
    }

    fn entry_for(&self, path: &Path, metadata: &std::fs::Metadata) -> Entry {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let modified_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH);
        let is_dir = metadata.is_dir();

        Entry {
            id: NodeId::Local(path.to_path_buf()),
            parent_id: path.parent().map(|p| NodeId::Local(p.to_path_buf())),
            relative_path: self.relative_of(path),
            mime_type: if is_dir {
                String::new()
            } else {
                mime_for(&name).to_string()
            },
            name,
            size: if is_dir { 0 } else { metadata.len() },
            modified_at,
            is_dir,
        }
    }

    /// 先写临时文件，再原子重命名
    async fn write_atomic(path: &Path, data: Vec<u8>) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp_path = path.with_file_name(format!(".{}.part", file_name));
        fs::write(&temp_path, data).await?;
        fs::rename(&temp_path, path).await?;
        Ok(())
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

#[async_trait]
impl Storage for LocalStorage {
    fn root(&self) -> NodeId {
        NodeId::Local(self.base_path.clone())
    }

    async fn list(&self, dir: &NodeId, prefix: &str) -> Result<Vec<Entry>, StorageError> {
        let dir_path = self.local_path(dir)?.to_path_buf();
        let prefix = prefix.to_string();

        // 使用 spawn_blocking 避免阻塞 async runtime
        let listed: Vec<(PathBuf, std::fs::Metadata)> = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for entry in WalkDir::new(&dir_path)
                .follow_links(false)
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
            {
                let entry = entry.map_err(|e| {
                    StorageError::Io(e.into_io_error().unwrap_or_else(|| {
                        std::io::Error::new(std::io::ErrorKind::Other, "目录遍历失败")
                    }))
                })?;

                // 跳过隐藏文件
                if is_hidden(&entry.file_name().to_string_lossy()) {
                    continue;
                }

                let metadata = entry
                    .metadata()
                    .map_err(|e| StorageError::Other(e.to_string()))?;
                out.push((entry.into_path(), metadata));
            }
            Ok::<_, StorageError>(out)
        })
        .await
        .map_err(|e| StorageError::Other(e.to_string()))??;

        Ok(listed
            .iter()
            .map(|(path, metadata)| {
                let mut entry = self.entry_for(path, metadata);
                if !prefix.is_empty() {
                    entry.relative_path = join_relative(&prefix, &entry.name);
                }
                entry
            })
            .collect())
    }

    async fn read(&self, id: &NodeId) -> Result<Vec<u8>, StorageError> {
        let path = self.local_path(id)?;
        match fs::read(path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(
        &self,
        parent: &NodeId,
        name: &str,
        data: Vec<u8>,
        _mime: &str,
    ) -> Result<NodeId, StorageError> {
        let full_path = self.child_path(parent, name)?;
        // 只创建新文件，替换已有文件必须走 overwrite
        if fs::symlink_metadata(&full_path).await.is_ok() {
            return Err(StorageError::AlreadyExists(full_path.display().to_string()));
        }
        Self::write_atomic(&full_path, data).await?;
        Ok(NodeId::Local(full_path))
    }

    async fn overwrite(
        &self,
        id: &NodeId,
        _name: &str,
        data: Vec<u8>,
        _mime: &str,
    ) -> Result<NodeId, StorageError> {
        let full_path = self.local_path(id)?.to_path_buf();
        Self::write_atomic(&full_path, data).await?;
        Ok(NodeId::Local(full_path))
    }

    async fn mkdir(&self, parent: &NodeId, name: &str) -> Result<NodeId, StorageError> {
        let full_path = self.child_path(parent, name)?;
        fs::create_dir_all(&full_path).await?;
        Ok(NodeId::Local(full_path))
    }

    async fn stat(&self, id: &NodeId) -> Result<Option<Entry>, StorageError> {
        let full_path = self.local_path(id)?;

        match fs::metadata(full_path).await {
            Ok(metadata) => Ok(Some(self.entry_for(full_path, &metadata))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_child(&self, parent: &NodeId, name: &str) -> Result<Option<Entry>, StorageError> {
        self.stat(&NodeId::Local(self.child_path(parent, name)?))
            .await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
