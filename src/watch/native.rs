use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use rustix::fs::inotify::WatchFlags;
use tracing::{debug, error, warn};

use crate::bytes::ByteString;
use crate::error::{FsError, Result};
use crate::posix::{Inotify, InotifyEvent};

use super::{lock, WatchEvent, WatchEventKind, WatchKey, WatchQueue, WatchService};

const READ_TIMEOUT_MS: i32 = 200;

fn mask_for(kinds: &[WatchEventKind]) -> WatchFlags {
    let mut mask = WatchFlags::ONLYDIR | WatchFlags::MASK_ADD;
    for kind in kinds {
        mask |= match kind {
            WatchEventKind::Create => WatchFlags::CREATE,
            WatchEventKind::Delete => WatchFlags::DELETE,
            WatchEventKind::Modify => WatchFlags::MODIFY | WatchFlags::ATTRIB | WatchFlags::CLOSE_WRITE,
            WatchEventKind::Rename => WatchFlags::MOVED_FROM | WatchFlags::MOVED_TO,
            WatchEventKind::Overflow => WatchFlags::empty(),
        };
    }
    mask
}

fn kind_for(event: &InotifyEvent) -> Option<WatchEventKind> {
    if event.has(libc::IN_CREATE) {
        Some(WatchEventKind::Create)
    } else if event.has(libc::IN_DELETE) {
        Some(WatchEventKind::Delete)
    } else if event.has(libc::IN_MOVED_FROM | libc::IN_MOVED_TO) {
        Some(WatchEventKind::Rename)
    } else if event.has(libc::IN_MODIFY | libc::IN_ATTRIB | libc::IN_CLOSE_WRITE) {
        Some(WatchEventKind::Modify)
    } else {
        None
    }
}

struct NativeInner {
    inotify: Inotify,
    keys: Mutex<HashMap<i32, WatchKey>>,
    queue: Arc<WatchQueue>,
    capacity: usize,
    closed: AtomicBool,
}

impl NativeInner {
    fn dispatch(&self, event: InotifyEvent) {
        if event.has(libc::IN_Q_OVERFLOW) {
            warn!("inotify queue overflow, signalling every key");
            let keys: Vec<WatchKey> = lock(&self.keys).values().cloned().collect();
            for key in keys {
                key.signal(WatchEvent::overflow());
            }
            return;
        }

        if event.has(libc::IN_IGNORED) {
            let removed = lock(&self.keys).remove(&event.watch_descriptor);
            if let Some(key) = removed {
                key.cancel();
            }
            return;
        }

        let key = lock(&self.keys).get(&event.watch_descriptor).cloned();
        let (Some(key), Some(kind)) = (key, kind_for(&event)) else {
            return;
        };
        key.signal(WatchEvent {
            kind,
            name: event.name,
            cookie: event.cookie,
        });
    }

    fn run(self: Arc<Self>) {
        while !self.closed.load(Ordering::Acquire) {
            match self.inotify.read_events(READ_TIMEOUT_MS) {
                Ok(events) => {
                    for event in events {
                        self.dispatch(event);
                    }
                }
                Err(e) => {
                    error!("inotify read failed: {}", e);
                    break;
                }
            }
        }
        debug!("inotify reader stopped");
    }
}

/// 基于 inotify 的监听服务：一个 inotify 实例，每个目录一个描述符，读线程把事件分发到 key
pub struct NativeWatchService {
    inner: Arc<NativeInner>,
}

impl NativeWatchService {
    pub fn new(capacity: usize) -> Result<Self> {
        let inner = Arc::new(NativeInner {
            inotify: Inotify::init()?,
            keys: Mutex::new(HashMap::new()),
            queue: WatchQueue::new(),
            capacity,
            closed: AtomicBool::new(false),
        });
        let reader = inner.clone();
        std::thread::Builder::new()
            .name("unifs-inotify".to_string())
            .spawn(move || reader.run())?;
        Ok(Self { inner })
    }
}

impl fmt::Debug for NativeWatchService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeWatchService")
            .field("keys", &lock(&self.inner.keys).len())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl WatchService for NativeWatchService {
    async fn register(&self, path: &[u8], kinds: &[WatchEventKind]) -> Result<WatchKey> {
        if !self.is_open() {
            return Err(FsError::ClosedWatchService);
        }
        // 同一目录重复注册时内核掩码取并集，返回同一个 key
        let wd = self.inner.inotify.add_watch(path, mask_for(kinds))?;

        let mut keys = lock(&self.inner.keys);
        if let Some(existing) = keys.get(&wd) {
            if existing.is_valid() {
                existing.add_kinds(kinds);
                return Ok(existing.clone());
            }
        }
        let key = WatchKey::new(ByteString::from(path), kinds, self.inner.capacity, &self.inner.queue);
        let weak: Weak<NativeInner> = Arc::downgrade(&self.inner);
        key.set_cancel_hook(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner.keys).remove(&wd);
                // 内核已移除该 watch 时返回 EINVAL
                if let Err(e) = inner.inotify.remove_watch(wd) {
                    debug!("inotify_rm_watch({}): {}", wd, e);
                }
            }
        });
        keys.insert(wd, key.clone());
        debug!("native watch registered: wd={} path={}", wd, key.path());
        Ok(key)
    }

    fn poll(&self) -> Option<WatchKey> {
        self.inner.queue.poll()
    }

    async fn take(&self) -> Result<WatchKey> {
        self.inner.queue.take().await
    }

    fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let keys: Vec<WatchKey> = lock(&self.inner.keys).drain().map(|(_, key)| key).collect();
        for key in keys {
            key.cancel();
        }
        self.inner.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::WatchKeyState;
    use std::os::unix::ffi::OsStrExt;
    use std::time::Duration;
    use tempfile::TempDir;

    fn dir_bytes(dir: &TempDir) -> Vec<u8> {
        dir.path().as_os_str().as_bytes().to_vec()
    }

    #[tokio::test]
    async fn test_create_and_delete_events() {
        let temp_dir = TempDir::new().unwrap();
        let service = NativeWatchService::new(64).unwrap();
        let key = service
            .register(&dir_bytes(&temp_dir), &[WatchEventKind::Create, WatchEventKind::Delete])
            .await
            .unwrap();

        std::fs::write(temp_dir.path().join("a"), b"1").unwrap();
        let signalled = tokio::time::timeout(Duration::from_secs(5), service.take())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signalled, key);
        let events = key.poll_events();
        assert_eq!(events[0].kind, WatchEventKind::Create);
        assert_eq!(events[0].name.as_deref(), Some(&b"a"[..]));

        std::fs::remove_file(temp_dir.path().join("a")).unwrap();
        tokio::time::timeout(Duration::from_secs(5), service.take())
            .await
            .unwrap()
            .unwrap();
        assert!(key.poll_events().iter().any(|e| e.kind == WatchEventKind::Delete));
        service.close().await;
    }

    #[tokio::test]
    async fn test_reregistration_merges_kinds() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("pre"), b"").unwrap();
        let service = NativeWatchService::new(64).unwrap();
        let first = service
            .register(&dir_bytes(&temp_dir), &[WatchEventKind::Create])
            .await
            .unwrap();
        let second = service
            .register(&dir_bytes(&temp_dir), &[WatchEventKind::Delete])
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.kinds(), vec![WatchEventKind::Create, WatchEventKind::Delete]);

        std::fs::write(temp_dir.path().join("a"), b"").unwrap();
        std::fs::remove_file(temp_dir.path().join("pre")).unwrap();

        let mut kinds = Vec::new();
        while kinds.len() < 2 {
            tokio::time::timeout(Duration::from_secs(5), service.take())
                .await
                .unwrap()
                .unwrap();
            kinds.extend(first.poll_events().into_iter().map(|e| e.kind));
        }
        assert_eq!(kinds, vec![WatchEventKind::Create, WatchEventKind::Delete]);
        service.close().await;
    }

    #[tokio::test]
    async fn test_overflow_when_capacity_exceeded() {
        let temp_dir = TempDir::new().unwrap();
        let service = NativeWatchService::new(4).unwrap();
        let key = service
            .register(&dir_bytes(&temp_dir), &[WatchEventKind::Create])
            .await
            .unwrap();

        for i in 0..20 {
            std::fs::write(temp_dir.path().join(format!("f{}", i)), b"").unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), service.take())
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let events = key.poll_events();
        assert_eq!(events, vec![WatchEvent::overflow()]);
        service.close().await;
    }

    #[tokio::test]
    async fn test_cancel_releases_descriptor() {
        let temp_dir = TempDir::new().unwrap();
        let service = NativeWatchService::new(16).unwrap();
        let key = service
            .register(&dir_bytes(&temp_dir), &WatchEventKind::ALL)
            .await
            .unwrap();

        std::fs::write(temp_dir.path().join("queued"), b"").unwrap();
        tokio::time::timeout(Duration::from_secs(5), service.take())
            .await
            .unwrap()
            .unwrap();
        key.cancel();

        assert_eq!(key.state(), WatchKeyState::Cancelled);
        assert!(key.poll_events().is_empty());
        assert!(lock(&service.inner.keys).is_empty());
    }

    #[tokio::test]
    async fn test_close_cancels_keys() {
        let temp_dir = TempDir::new().unwrap();
        let service = NativeWatchService::new(16).unwrap();
        let key = service
            .register(&dir_bytes(&temp_dir), &WatchEventKind::ALL)
            .await
            .unwrap();
        service.close().await;

        assert!(!key.is_valid());
        assert!(matches!(service.take().await, Err(FsError::ClosedWatchService)));
        assert!(service.register(&dir_bytes(&temp_dir), &WatchEventKind::ALL).await.is_err());
    }
}
