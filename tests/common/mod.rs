//! 集成测试用的内存 Content Server 和即时时钟
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use otcs_sync_lib::core::retry::Clock;
use otcs_sync_lib::error::StorageError;
use otcs_sync_lib::storage::{ChildPage, ContentServer, RemoteNode, RemoteStorage, Storage};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ROOT: i64 = 2000;

struct StoredNode {
    node: RemoteNode,
    content: Vec<u8>,
    versions: usize,
}

#[derive(Default)]
struct Faults {
    /// 文件名 -> 剩余的瞬时失败次数
    transient: HashMap<String, usize>,
    always: HashSet<String>,
    session_lost_on: HashSet<String>,
    /// get_node 返回的伪造大小
    reported_size: HashMap<String, u64>,
}

/// 内存中的仓库，行为与真实服务一致：同名节点报 AlreadyExists
pub struct MemoryServer {
    nodes: Mutex<BTreeMap<i64, StoredNode>>,
    next_id: AtomicUsize,
    faults: Mutex<Faults>,
    attempts: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    io_delay: Duration,
}

impl MemoryServer {
    pub fn new() -> Arc<Self> {
        let server = Self {
            nodes: Mutex::new(BTreeMap::new()),
            next_id: AtomicUsize::new(ROOT as usize + 1),
            faults: Mutex::new(Faults::default()),
            attempts: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            io_delay: Duration::from_millis(5),
        };
        server.insert(ROOT, 0, "Enterprise", true, Vec::new(), Utc::now());
        Arc::new(server)
    }

    fn insert(
        &self,
        id: i64,
        parent: i64,
        name: &str,
        container: bool,
        content: Vec<u8>,
        modified_at: DateTime<Utc>,
    ) {
        let node = RemoteNode {
            id,
            parent_id: parent,
            name: name.to_string(),
            node_type: if container { RemoteNode::FOLDER } else { RemoteNode::DOCUMENT },
            container,
            size: content.len() as u64,
            modified_at,
            mime_type: None,
        };
        self.nodes.lock().unwrap().insert(
            id,
            StoredNode {
                node,
                content,
                versions: 1,
            },
        );
    }

    fn allocate(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) as i64
    }

    pub fn add_folder(&self, parent: i64, name: &str) -> i64 {
        let id = self.allocate();
        self.insert(id, parent, name, true, Vec::new(), Utc::now());
        id
    }

    pub fn add_document(&self, parent: i64, name: &str, content: &[u8], modified_at: DateTime<Utc>) -> i64 {
        let id = self.allocate();
        self.insert(id, parent, name, false, content.to_vec(), modified_at);
        id
    }

    pub fn fail_transiently(&self, name: &str, times: usize) {
        self.faults.lock().unwrap().transient.insert(name.to_string(), times);
    }

    pub fn fail_always(&self, name: &str) {
        self.faults.lock().unwrap().always.insert(name.to_string());
    }

    pub fn clear_faults(&self) {
        *self.faults.lock().unwrap() = Faults::default();
    }

    pub fn lose_session_on(&self, name: &str) {
        self.faults.lock().unwrap().session_lost_on.insert(name.to_string());
    }

    pub fn report_size(&self, name: &str, size: u64) {
        self.faults.lock().unwrap().reported_size.insert(name.to_string(), size);
    }

    pub fn child(&self, parent: i64, name: &str) -> Option<RemoteNode> {
        self.nodes
            .lock()
            .unwrap()
            .values()
            .find(|n| n.node.parent_id == parent && n.node.name.eq_ignore_ascii_case(name))
            .map(|n| n.node.clone())
    }

    pub fn children(&self, parent: i64) -> Vec<String> {
        self.nodes
            .lock()
            .unwrap()
            .values()
            .filter(|n| n.node.parent_id == parent)
            .map(|n| n.node.name.clone())
            .collect()
    }

    pub fn content(&self, id: i64) -> Option<Vec<u8>> {
        self.nodes.lock().unwrap().get(&id).map(|n| n.content.clone())
    }

    pub fn versions(&self, id: i64) -> usize {
        self.nodes.lock().unwrap().get(&id).map(|n| n.versions).unwrap_or(0)
    }

    /// 按文件名统计的写入尝试次数
    pub fn attempts(&self, name: &str) -> usize {
        self.attempts.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn total_writes(&self) -> usize {
        self.attempts.lock().unwrap().values().sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn check_faults(&self, name: &str) -> Result<(), StorageError> {
        *self.attempts.lock().unwrap().entry(name.to_string()).or_default() += 1;

        let mut faults = self.faults.lock().unwrap();
        if faults.session_lost_on.contains(name) {
            return Err(StorageError::SessionExpired);
        }
        if faults.always.contains(name) {
            return Err(StorageError::Http {
                status: 500,
                message: "internal error".into(),
            });
        }
        if let Some(remaining) = faults.transient.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StorageError::Other("connection reset".into()));
            }
        }
        Ok(())
    }

    async fn simulate_io(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.io_delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContentServer for MemoryServer {
    async fn list_children(
        &self,
        parent: i64,
        page: usize,
        page_size: usize,
    ) -> Result<ChildPage, StorageError> {
        let nodes = self.nodes.lock().unwrap();
        if !nodes.contains_key(&parent) {
            return Err(StorageError::NotFound(parent.to_string()));
        }
        let children: Vec<RemoteNode> = nodes
            .values()
            .filter(|n| n.node.parent_id == parent && n.node.id != parent)
            .map(|n| n.node.clone())
            .collect();
        Ok(ChildPage {
            total: Some(children.len()),
            nodes: children
                .into_iter()
                .skip((page - 1) * page_size)
                .take(page_size)
                .collect(),
        })
    }

    async fn get_node(&self, id: i64) -> Result<Option<RemoteNode>, StorageError> {
        let node = self.nodes.lock().unwrap().get(&id).map(|n| n.node.clone());
        let faults = self.faults.lock().unwrap();
        Ok(node.map(|mut n| {
            if let Some(size) = faults.reported_size.get(&n.name) {
                n.size = *size;
            }
            n
        }))
    }

    async fn download(&self, id: i64) -> Result<Vec<u8>, StorageError> {
        self.simulate_io().await;
        self.content(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn upload_document(
        &self,
        parent: i64,
        name: &str,
        data: Vec<u8>,
        _mime: &str,
    ) -> Result<i64, StorageError> {
        self.simulate_io().await;
        self.check_faults(name)?;
        if self.child(parent, name).is_some() {
            return Err(StorageError::AlreadyExists(name.to_string()));
        }
        Ok(self.add_document(parent, name, &data, Utc::now()))
    }

    async fn add_version(
        &self,
        id: i64,
        name: &str,
        data: Vec<u8>,
        _mime: &str,
    ) -> Result<i64, StorageError> {
        self.simulate_io().await;
        self.check_faults(name)?;
        let mut nodes = self.nodes.lock().unwrap();
        let stored = nodes
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        stored.node.size = data.len() as u64;
        stored.node.modified_at = Utc::now();
        stored.content = data;
        stored.versions += 1;
        Ok(id)
    }

    async fn create_folder(&self, parent: i64, name: &str) -> Result<i64, StorageError> {
        if self.child(parent, name).is_some() {
            return Err(StorageError::AlreadyExists(name.to_string()));
        }
        Ok(self.add_folder(parent, name))
    }

    fn base_url(&self) -> &str {
        "memory://otcs"
    }
}

/// 以小页大小包装成存储，顺带覆盖分页
pub fn remote_storage(server: &Arc<MemoryServer>) -> Arc<dyn Storage> {
    Arc::new(RemoteStorage::new(server.clone(), ROOT).with_page_size(3))
}

/// 不真正等待、只记录等待时长的时钟
#[derive(Default)]
pub struct InstantClock {
    pub sleeps: Mutex<Vec<Duration>>,
}

#[async_trait]
impl Clock for InstantClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

pub fn write_file(root: &Path, relative: &str, content: &[u8]) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}
