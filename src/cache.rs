use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::Result;
use crate::fs::{Authority, FileSystem};

/// 缓存键：scheme + authority
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub scheme: String,
    pub authority: Authority,
}

impl CacheKey {
    pub fn new(scheme: impl Into<String>, authority: Authority) -> Self {
        Self {
            scheme: scheme.into(),
            authority,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.authority)
    }
}

type Slot = Arc<OnceCell<Arc<FileSystem>>>;

/// 文件系统实例缓存
///
/// 每个键最多只有一个存活实例。并发的首次请求共享同一个初始化过程，
/// 初始化失败不会被缓存，下一次请求会重新尝试。
#[derive(Default)]
pub struct FileSystemCache {
    slots: Mutex<HashMap<CacheKey, Slot>>,
}

impl FileSystemCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &CacheKey) -> Slot {
        crate::watch::lock(&self.slots)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// 获取实例，不存在时调用 `create` 创建
    pub async fn get_or_create<F, Fut>(&self, key: &CacheKey, create: F) -> Result<Arc<FileSystem>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Arc<FileSystem>>>,
    {
        loop {
            let slot = self.slot(key);
            let fs = slot.get_or_try_init(&create).await?.clone();
            if fs.is_open() {
                return Ok(fs);
            }
            // 已关闭但还未移除的实例
            debug!("缓存中的实例已关闭: {}", key);
            self.remove(key, &fs);
        }
    }

    /// 已创建且仍然打开的实例
    pub fn get(&self, key: &CacheKey) -> Option<Arc<FileSystem>> {
        let slot = crate::watch::lock(&self.slots).get(key)?.clone();
        slot.get().filter(|fs| fs.is_open()).cloned()
    }

    /// 仅当缓存中的就是 `fs` 这个实例时才移除
    pub fn remove(&self, key: &CacheKey, fs: &Arc<FileSystem>) -> bool {
        let mut slots = crate::watch::lock(&self.slots);
        let matches = slots
            .get(key)
            .and_then(|slot| slot.get())
            .map(|cached| Arc::ptr_eq(cached, fs))
            .unwrap_or(false);
        if matches {
            slots.remove(key);
            debug!("删除缓存: {}", key);
        }
        matches
    }

    /// 清空缓存，返回所有已创建的实例
    pub fn drain(&self) -> Vec<Arc<FileSystem>> {
        let mut slots = crate::watch::lock(&self.slots);
        let count = slots.len();
        let drained: Vec<_> = slots.drain().filter_map(|(_, slot)| slot.get().cloned()).collect();
        info!("清空缓存: {} 个条目", count);
        drained
    }

    pub fn stats(&self) -> CacheStats {
        let slots = crate::watch::lock(&self.slots);
        let mut stats = CacheStats::default();
        for slot in slots.values() {
            stats.total += 1;
            match slot.get() {
                Some(fs) if fs.is_open() => stats.open += 1,
                Some(_) => stats.closed += 1,
                None => stats.pending += 1,
            }
        }
        stats
    }
}

impl fmt::Debug for FileSystemCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSystemCache")
            .field("stats", &self.stats().to_string())
            .finish()
    }
}

/// 缓存统计信息
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub total: usize,
    pub open: usize,
    pub closed: usize,
    pub pending: usize,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "缓存统计: 总计={}, 打开={}, 已关闭={}, 创建中={}",
            self.total, self.open, self.closed, self.pending
        )
    }
}
