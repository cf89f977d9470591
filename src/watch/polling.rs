use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::bytes::ByteString;
use crate::error::{FsError, NativeSyscallError, Result};
use crate::fs::{child_path, FileSystemBackend};
use crate::posix::FileTime;

use super::{lock, WatchEvent, WatchEventKind, WatchKey, WatchQueue, WatchService};

type Snapshot = HashMap<ByteString, (FileTime, u64)>;

async fn snapshot(backend: &dyn FileSystemBackend, dir: &[u8]) -> Result<Snapshot> {
    let mut entries = HashMap::new();
    for entry in backend.list_directory(dir).await? {
        let child = child_path(dir, &entry.name);
        // 列出与 stat 之间被删除的条目留到下一轮处理
        if let Ok(attrs) = backend.read_attributes(&child, false).await {
            entries.insert(entry.name, (attrs.last_modified, attrs.size));
        }
    }
    Ok(entries)
}

fn diff(previous: &Snapshot, current: &Snapshot, key: &WatchKey) {
    for (name, stamp) in current {
        match previous.get(name) {
            None => key.signal(WatchEvent::new(WatchEventKind::Create, Some(name.clone()))),
            Some(old) if old != stamp => {
                key.signal(WatchEvent::new(WatchEventKind::Modify, Some(name.clone())))
            }
            Some(_) => {}
        }
    }
    for name in previous.keys() {
        if !current.contains_key(name) {
            key.signal(WatchEvent::new(WatchEventKind::Delete, Some(name.clone())));
        }
    }
}

/// 轮询监听服务，用于没有内核通知的后端：每个 key 一个任务，按固定间隔列目录并比较差异
pub struct PollingWatchService {
    backend: Arc<dyn FileSystemBackend>,
    interval: Duration,
    capacity: usize,
    queue: Arc<WatchQueue>,
    keys: Mutex<HashMap<ByteString, WatchKey>>,
    open: AtomicBool,
}

impl PollingWatchService {
    pub fn new(backend: Arc<dyn FileSystemBackend>, interval: Duration, capacity: usize) -> Self {
        Self {
            backend,
            interval,
            capacity,
            queue: WatchQueue::new(),
            keys: Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
        }
    }
}

impl fmt::Debug for PollingWatchService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingWatchService")
            .field("interval", &self.interval)
            .field("keys", &lock(&self.keys).len())
            .finish()
    }
}

#[async_trait]
impl WatchService for PollingWatchService {
    async fn register(&self, path: &[u8], kinds: &[WatchEventKind]) -> Result<WatchKey> {
        if !self.is_open() {
            return Err(FsError::ClosedWatchService);
        }
        let path = ByteString::from(path);
        if let Some(existing) = lock(&self.keys).get(&path) {
            if existing.is_valid() {
                existing.add_kinds(kinds);
                return Ok(existing.clone());
            }
        }

        let attrs = self.backend.read_attributes(&path, true).await?;
        if !attrs.is_directory() {
            return Err(NativeSyscallError::new(libc::ENOTDIR, "watch")
                .with_path(path.to_string_lossy())
                .into());
        }
        let initial = snapshot(self.backend.as_ref(), &path).await?;

        let key = WatchKey::new(path.clone(), kinds, self.capacity, &self.queue);
        let task_key = key.clone();
        let backend = self.backend.clone();
        let interval = self.interval;
        let task = tokio::spawn(async move {
            let mut previous = initial;
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !task_key.is_valid() {
                    break;
                }
                match snapshot(backend.as_ref(), task_key.path()).await {
                    Ok(current) => {
                        diff(&previous, &current, &task_key);
                        previous = current;
                    }
                    Err(e) => {
                        warn!("polling {} failed, cancelling key: {}", task_key.path(), e);
                        task_key.cancel();
                        break;
                    }
                }
            }
        });
        let abort = task.abort_handle();
        key.set_cancel_hook(move || abort.abort());

        lock(&self.keys).insert(path, key.clone());
        debug!("polling watch registered: {} every {:?}", key.path(), self.interval);
        Ok(key)
    }

    fn poll(&self) -> Option<WatchKey> {
        self.queue.poll()
    }

    async fn take(&self) -> Result<WatchKey> {
        self.queue.take().await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let keys: Vec<WatchKey> = lock(&self.keys).drain().map(|(_, key)| key).collect();
        for key in keys {
            key.cancel();
        }
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalBackend;
    use crate::config::WatchConfig;
    use std::os::unix::ffi::OsStrExt;
    use tempfile::TempDir;

    fn service(capacity: usize) -> PollingWatchService {
        let backend: Arc<dyn FileSystemBackend> = Arc::new(LocalBackend::new(WatchConfig::default()));
        PollingWatchService::new(backend, Duration::from_millis(50), capacity)
    }

    #[tokio::test]
    async fn test_synthesizes_create_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("old"), b"").unwrap();
        let service = service(32);
        let key = service
            .register(temp_dir.path().as_os_str().as_bytes(), &WatchEventKind::ALL)
            .await
            .unwrap();

        std::fs::write(temp_dir.path().join("new"), b"").unwrap();
        std::fs::remove_file(temp_dir.path().join("old")).unwrap();

        let mut seen = Vec::new();
        while seen.len() < 2 {
            let signalled = tokio::time::timeout(Duration::from_secs(5), service.take())
                .await
                .unwrap()
                .unwrap();
            seen.extend(signalled.poll_events());
        }
        assert!(seen.contains(&WatchEvent::new(WatchEventKind::Create, Some(ByteString::from("new")))));
        assert!(seen.contains(&WatchEvent::new(WatchEventKind::Delete, Some(ByteString::from("old")))));
        service.close().await;
    }

    #[tokio::test]
    async fn test_rewrite_is_modify() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("f"), b"a").unwrap();
        let service = service(32);
        let key = service
            .register(temp_dir.path().as_os_str().as_bytes(), &[WatchEventKind::Modify])
            .await
            .unwrap();

        // 大小变化，不依赖 mtime 精度
        std::fs::write(temp_dir.path().join("f"), b"longer").unwrap();
        tokio::time::timeout(Duration::from_secs(5), service.take())
            .await
            .unwrap()
            .unwrap();
        let events = key.poll_events();
        assert!(!events.is_empty());
        let expected = WatchEvent::new(WatchEventKind::Modify, Some(ByteString::from("f")));
        assert!(events.iter().all(|e| *e == expected));
        service.close().await;
    }

    #[tokio::test]
    async fn test_overflow_when_capacity_exceeded() {
        let temp_dir = TempDir::new().unwrap();
        let service = service(2);
        let key = service
            .register(temp_dir.path().as_os_str().as_bytes(), &WatchEventKind::ALL)
            .await
            .unwrap();

        for i in 0..10 {
            std::fs::write(temp_dir.path().join(format!("f{}", i)), b"").unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), service.take())
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(key.poll_events(), vec![WatchEvent::overflow()]);
        service.close().await;
    }

    #[tokio::test]
    async fn test_reregistration_merges_kinds() {
        let temp_dir = TempDir::new().unwrap();
        let service = service(8);
        let path = temp_dir.path().as_os_str().as_bytes();
        let first = service.register(path, &[WatchEventKind::Create]).await.unwrap();
        let second = service.register(path, &[WatchEventKind::Delete]).await.unwrap();
        assert_eq!(first, second);
        assert!(first.wants(WatchEventKind::Create));
        assert!(first.wants(WatchEventKind::Delete));
        assert!(!first.wants(WatchEventKind::Modify));
        service.close().await;
    }

    #[tokio::test]
    async fn test_register_rejects_files() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("plain");
        std::fs::write(&file, b"").unwrap();

        let err = service(8)
            .register(file.as_os_str().as_bytes(), &WatchEventKind::ALL)
            .await
            .unwrap_err();
        assert_eq!(err.errno(), Some(libc::ENOTDIR));
    }

    #[tokio::test]
    async fn test_cancel_stops_polling() {
        let temp_dir = TempDir::new().unwrap();
        let service = service(8);
        let key = service
            .register(temp_dir.path().as_os_str().as_bytes(), &WatchEventKind::ALL)
            .await
            .unwrap();
        key.cancel();

        std::fs::write(temp_dir.path().join("late"), b"").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(service.poll().is_none());
        assert!(key.poll_events().is_empty());
    }
}
