use std::fmt;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::error::RemoteFileSystemError;
use crate::watch::lock;

use super::protocol::{Handle, Operation, Reply};
use super::transport::Transport;

/// 有效性依赖存活连接的对象
pub trait Liveness {
    fn is_alive(&self) -> bool;
}

/// 特权进程句柄表中一个对象的存根
#[derive(Clone)]
pub struct RemoteObject {
    transport: Arc<dyn Transport>,
    handle: Handle,
}

impl RemoteObject {
    pub fn new(transport: Arc<dyn Transport>, handle: Handle) -> Self {
        Self { transport, handle }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// 同一连接上的另一个存根
    pub fn with_handle(&self, handle: Handle) -> Self {
        Self::new(self.transport.clone(), handle)
    }

    pub async fn call(&self, op: Operation) -> Result<Reply, RemoteFileSystemError> {
        self.transport.call(self.handle, op).await
    }
}

impl Liveness for RemoteObject {
    fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("handle", &self.handle)
            .field("alive", &self.is_alive())
            .finish()
    }
}

type ConnectResult<T> = Result<T, RemoteFileSystemError>;
type ConnectFuture<T> = Shared<BoxFuture<'static, ConnectResult<T>>>;
type Connector<T> = Arc<dyn Fn() -> BoxFuture<'static, ConnectResult<T>> + Send + Sync>;

enum Slot<T> {
    Empty,
    Bound(T),
    Connecting(ConnectFuture<T>),
}

/// 延迟绑定到远端存根的本地句柄
///
/// 存根存活时 `get` 直接返回缓存，否则执行一次连接器，并发调用者共享这一次尝试
pub struct RemoteInterface<T> {
    connector: Connector<T>,
    slot: Mutex<Slot<T>>,
}

impl<T> RemoteInterface<T>
where
    T: Liveness + Clone + Send + Sync + 'static,
{
    pub fn new<F>(connector: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, ConnectResult<T>> + Send + Sync + 'static,
    {
        Self {
            connector: Arc::new(connector),
            slot: Mutex::new(Slot::Empty),
        }
    }

    pub async fn get(&self) -> ConnectResult<T> {
        let attempt = {
            let mut slot = lock(&self.slot);
            match &*slot {
                Slot::Bound(stub) if stub.is_alive() => return Ok(stub.clone()),
                Slot::Connecting(attempt) => attempt.clone(),
                _ => {
                    debug!("remote stub missing or dead, connecting");
                    let attempt = (self.connector)().shared();
                    *slot = Slot::Connecting(attempt.clone());
                    attempt
                }
            }
        };

        let result = attempt.clone().await;
        let mut slot = lock(&self.slot);
        if let Slot::Connecting(current) = &*slot {
            if current.ptr_eq(&attempt) {
                *slot = match &result {
                    Ok(stub) => Slot::Bound(stub.clone()),
                    Err(_) => Slot::Empty,
                };
            }
        }
        result
    }

    /// 已绑定的存根，不触发连接
    pub fn peek(&self) -> Option<T> {
        match &*lock(&self.slot) {
            Slot::Bound(stub) => Some(stub.clone()),
            _ => None,
        }
    }

    /// 用别处得到的存根填充（例如批量回复）
    pub fn bind(&self, stub: T) {
        *lock(&self.slot) = Slot::Bound(stub);
    }

    /// 丢弃缓存的存根，下一次 `get` 重新连接
    pub fn invalidate(&self) {
        *lock(&self.slot) = Slot::Empty;
    }
}

impl<T> fmt::Debug for RemoteInterface<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*lock(&self.slot) {
            Slot::Empty => "empty",
            Slot::Bound(_) => "bound",
            Slot::Connecting(_) => "connecting",
        };
        f.debug_struct("RemoteInterface").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Debug)]
    struct FakeStub {
        generation: usize,
        alive: Arc<AtomicBool>,
    }

    impl Liveness for FakeStub {
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    fn interface(connects: Arc<AtomicUsize>, fail: bool) -> RemoteInterface<FakeStub> {
        RemoteInterface::new(move || {
            let connects = connects.clone();
            async move {
                let generation = connects.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
                if fail {
                    return Err(RemoteFileSystemError::Connection("refused".into()));
                }
                Ok(FakeStub {
                    generation,
                    alive: Arc::new(AtomicBool::new(true)),
                })
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_reuses_live_stub() {
        let connects = Arc::new(AtomicUsize::new(0));
        let remote = interface(connects.clone(), false);
        let a = remote.get().await.unwrap();
        let b = remote.get().await.unwrap();
        assert_eq!(a.generation, b.generation);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_reconnect_after_death() {
        let connects = Arc::new(AtomicUsize::new(0));
        let remote = interface(connects.clone(), false);
        let first = remote.get().await.unwrap();
        first.alive.store(false, Ordering::SeqCst);

        let (a, b) = tokio::join!(remote.get(), remote.get());
        assert_eq!(a.unwrap().generation, 2);
        assert_eq!(b.unwrap().generation, 2);
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_cached() {
        let connects = Arc::new(AtomicUsize::new(0));
        let remote = interface(connects.clone(), true);
        let (a, b) = tokio::join!(remote.get(), remote.get());
        assert!(matches!(a, Err(RemoteFileSystemError::Connection(_))));
        assert_eq!(a.unwrap_err(), b.unwrap_err());
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        assert!(remote.get().await.is_err());
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert!(remote.peek().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_forces_reconnect() {
        let connects = Arc::new(AtomicUsize::new(0));
        let remote = interface(connects.clone(), false);
        remote.get().await.unwrap();
        remote.invalidate();
        assert_eq!(remote.get().await.unwrap().generation, 2);
    }
}
