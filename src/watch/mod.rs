//! 目录变化通知
//!
//! 各后端通过 [`WatchService`] 发放 [`WatchKey`]。key 在事件到达前为 READY，
//! 被 [`WatchKey::poll_events`] 取走之前为 SIGNALLED；被取消或所属服务、文件系统关闭后为 CANCELLED，且不再改变。

mod native;
mod polling;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::bytes::ByteString;
use crate::error::{FsError, Result};

pub use native::NativeWatchService;
pub use polling::PollingWatchService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchEventKind {
    Create,
    Delete,
    Modify,
    Rename,
    /// 事件已丢失，需要重新扫描目录
    Overflow,
}

impl WatchEventKind {
    pub const ALL: [WatchEventKind; 4] = [
        WatchEventKind::Create,
        WatchEventKind::Delete,
        WatchEventKind::Modify,
        WatchEventKind::Rename,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub name: Option<ByteString>,
    /// 关联重命名的两个事件，其他情况为 0
    pub cookie: u32,
}

impl WatchEvent {
    pub fn new(kind: WatchEventKind, name: Option<ByteString>) -> Self {
        Self {
            kind,
            name,
            cookie: 0,
        }
    }

    pub fn overflow() -> Self {
        Self::new(WatchEventKind::Overflow, None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchKeyState {
    Ready,
    Signalled,
    Cancelled,
}

struct KeyState {
    status: WatchKeyState,
    events: VecDeque<WatchEvent>,
    overflowed: bool,
}

type CancelHook = Box<dyn FnOnce() + Send>;

struct KeyInner {
    id: u64,
    path: ByteString,
    kinds: Mutex<Vec<WatchEventKind>>,
    capacity: usize,
    state: Mutex<KeyState>,
    queue: Weak<WatchQueue>,
    on_cancel: Mutex<Option<CancelHook>>,
}

/// 对一个目录的监听注册
#[derive(Clone)]
pub struct WatchKey {
    inner: Arc<KeyInner>,
}

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

impl WatchKey {
    pub fn new(
        path: ByteString,
        kinds: &[WatchEventKind],
        capacity: usize,
        queue: &Arc<WatchQueue>,
    ) -> Self {
        Self {
            inner: Arc::new(KeyInner {
                id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
                path,
                kinds: Mutex::new(kinds.to_vec()),
                capacity: capacity.max(1),
                state: Mutex::new(KeyState {
                    status: WatchKeyState::Ready,
                    events: VecDeque::new(),
                    overflowed: false,
                }),
                queue: Arc::downgrade(queue),
                on_cancel: Mutex::new(None),
            }),
        }
    }

    /// 设置取消时释放描述符或轮询任务的回调，已取消时立即执行
    pub fn set_cancel_hook(&self, hook: impl FnOnce() + Send + 'static) {
        if !self.is_valid() {
            hook();
            return;
        }
        *lock(&self.inner.on_cancel) = Some(Box::new(hook));
        // cancel() 可能与上面的写入并发
        if !self.is_valid() {
            if let Some(hook) = lock(&self.inner.on_cancel).take() {
                hook();
            }
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn path(&self) -> &ByteString {
        &self.inner.path
    }

    pub fn state(&self) -> WatchKeyState {
        lock(&self.inner.state).status
    }

    pub fn is_valid(&self) -> bool {
        self.state() != WatchKeyState::Cancelled
    }

    pub fn wants(&self, kind: WatchEventKind) -> bool {
        kind == WatchEventKind::Overflow || lock(&self.inner.kinds).contains(&kind)
    }

    /// 同一目录重复注册时合并事件类型
    pub fn add_kinds(&self, kinds: &[WatchEventKind]) {
        let mut wanted = lock(&self.inner.kinds);
        for kind in kinds {
            if !wanted.contains(kind) {
                wanted.push(*kind);
            }
        }
    }

    pub fn kinds(&self) -> Vec<WatchEventKind> {
        lock(&self.inner.kinds).clone()
    }

    /// 加入事件。队列满时合并为一个 OVERFLOW，之后的事件在下次取走前全部丢弃
    pub fn signal(&self, event: WatchEvent) {
        if !self.wants(event.kind) {
            return;
        }
        let enqueue = {
            let mut state = lock(&self.inner.state);
            if state.status == WatchKeyState::Cancelled || state.overflowed {
                return;
            }
            if event.kind == WatchEventKind::Overflow || state.events.len() >= self.inner.capacity {
                state.events.clear();
                state.events.push_back(WatchEvent::overflow());
                state.overflowed = true;
            } else {
                state.events.push_back(event);
            }
            let was_ready = state.status == WatchKeyState::Ready;
            state.status = WatchKeyState::Signalled;
            was_ready
        };
        if enqueue {
            if let Some(queue) = self.inner.queue.upgrade() {
                queue.push(self.clone());
            }
        }
    }

    /// 取走待处理事件并回到 READY。已取消的 key 不返回任何事件，包括取消前已排队的
    pub fn poll_events(&self) -> Vec<WatchEvent> {
        let mut state = lock(&self.inner.state);
        if state.status == WatchKeyState::Cancelled {
            return Vec::new();
        }
        state.overflowed = false;
        state.status = WatchKeyState::Ready;
        state.events.drain(..).collect()
    }

    pub fn cancel(&self) {
        {
            let mut state = lock(&self.inner.state);
            if state.status == WatchKeyState::Cancelled {
                return;
            }
            state.status = WatchKeyState::Cancelled;
            state.events.clear();
        }
        debug!("watch key {} cancelled: {}", self.inner.id, self.inner.path);
        if let Some(hook) = lock(&self.inner.on_cancel).take() {
            hook();
        }
    }
}

impl PartialEq for WatchKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for WatchKey {}

impl fmt::Debug for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchKey")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 等待消费的已触发 key
#[derive(Default)]
pub struct WatchQueue {
    keys: Mutex<VecDeque<WatchKey>>,
    notify: Notify,
    closed: AtomicBool,
}

impl WatchQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, key: WatchKey) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        lock(&self.keys).push_back(key);
        self.notify.notify_one();
    }

    pub fn poll(&self) -> Option<WatchKey> {
        let mut keys = lock(&self.keys);
        while let Some(key) = keys.pop_front() {
            if key.state() == WatchKeyState::Signalled {
                return Some(key);
            }
        }
        None
    }

    pub async fn take(&self) -> Result<WatchKey> {
        loop {
            if self.is_closed() {
                return Err(FsError::ClosedWatchService);
            }
            if let Some(key) = self.poll() {
                return Ok(key);
            }
            self.notify.notified().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        lock(&self.keys).clear();
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

#[async_trait]
pub trait WatchService: Send + Sync + fmt::Debug {
    async fn register(&self, path: &[u8], kinds: &[WatchEventKind]) -> Result<WatchKey>;

    /// 下一个已触发的 key（如果有）
    fn poll(&self) -> Option<WatchKey>;

    /// 等待下一个已触发的 key，服务关闭后返回错误
    async fn take(&self) -> Result<WatchKey>;

    fn is_open(&self) -> bool;

    /// 取消所有 key 并唤醒等待者
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(capacity: usize) -> (Arc<WatchQueue>, WatchKey) {
        let queue = WatchQueue::new();
        let key = WatchKey::new(ByteString::from("/dir"), &WatchEventKind::ALL, capacity, &queue);
        (queue, key)
    }

    fn created(name: &str) -> WatchEvent {
        WatchEvent::new(WatchEventKind::Create, Some(ByteString::from(name)))
    }

    #[test]
    fn test_state_transitions() {
        let (queue, key) = key(8);
        assert_eq!(key.state(), WatchKeyState::Ready);
        assert!(queue.poll().is_none());

        key.signal(created("a"));
        key.signal(created("b"));
        assert_eq!(key.state(), WatchKeyState::Signalled);
        assert_eq!(queue.poll(), Some(key.clone()));
        assert!(queue.poll().is_none());

        let events = key.poll_events();
        assert_eq!(events, vec![created("a"), created("b")]);
        assert_eq!(key.state(), WatchKeyState::Ready);

        key.signal(created("c"));
        assert_eq!(queue.poll(), Some(key.clone()));
    }

    #[test]
    fn test_cancel_discards_queued_events() {
        let (queue, key) = key(8);
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        key.set_cancel_hook(move || flag.store(true, Ordering::SeqCst));

        key.signal(created("a"));
        key.cancel();
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(key.state(), WatchKeyState::Cancelled);
        assert!(key.poll_events().is_empty());

        key.signal(created("b"));
        assert!(key.poll_events().is_empty());
        assert!(queue.poll().is_none());
    }

    #[test]
    fn test_overflow_coalesces() {
        let (_queue, key) = key(4);
        for i in 0..20 {
            key.signal(created(&format!("f{}", i)));
        }
        assert_eq!(key.poll_events(), vec![WatchEvent::overflow()]);

        key.signal(created("after"));
        assert_eq!(key.poll_events(), vec![created("after")]);
    }

    #[test]
    fn test_unwanted_kinds_ignored() {
        let queue = WatchQueue::new();
        let key = WatchKey::new(ByteString::from("/d"), &[WatchEventKind::Delete], 4, &queue);
        key.signal(created("x"));
        assert_eq!(key.state(), WatchKeyState::Ready);
        key.signal(WatchEvent::overflow());
        assert_eq!(key.state(), WatchKeyState::Signalled);
    }

    #[test]
    fn test_hook_after_cancel_runs_immediately() {
        let (_queue, key) = key(4);
        key.cancel();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        key.set_cancel_hook(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_take_wakes_and_close_fails() {
        let (queue, key) = key(4);
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take().await })
        };
        tokio::task::yield_now().await;
        key.signal(created("x"));
        let taken = waiter.await.unwrap().unwrap();
        assert_eq!(taken, key);

        queue.close();
        assert!(matches!(queue.take().await, Err(FsError::ClosedWatchService)));
    }
}
