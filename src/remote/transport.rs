use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::RemoteFileSystemError;
use crate::service::RootFileService;
use crate::watch::lock;

use super::protocol::{read_frame, write_frame, Handle, Operation, Reply, Request, Response};

/// 到特权服务的已绑定连接
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn call(&self, handle: Handle, op: Operation) -> Result<Reply, RemoteFileSystemError>;

    fn is_alive(&self) -> bool;

    async fn shutdown(&self);
}

/// 直接调用同进程内的服务
pub struct InProcessTransport {
    service: Arc<RootFileService>,
    alive: AtomicBool,
    next_id: AtomicU64,
}

impl InProcessTransport {
    pub fn new(service: Arc<RootFileService>) -> Arc<Self> {
        Arc::new(Self {
            service,
            alive: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn service(&self) -> &Arc<RootFileService> {
        &self.service
    }

    /// 模拟特权进程退出
    pub fn disconnect(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for InProcessTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessTransport")
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn call(&self, handle: Handle, op: Operation) -> Result<Reply, RemoteFileSystemError> {
        if !self.is_alive() {
            return Err(RemoteFileSystemError::Disconnected("in-process service stopped".to_string()));
        }
        let request = Request {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            handle,
            op,
        };
        self.service
            .dispatch(request)
            .await
            .result
            .map_err(RemoteFileSystemError::Fault)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.disconnect();
        self.service.release_all().await;
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// 在字节流（子进程标准输入输出或 Unix 套接字）上复用分帧请求与响应
pub struct StreamTransport {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Pending,
    alive: Arc<AtomicBool>,
    next_id: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
    child: Mutex<Option<Child>>,
}

impl StreamTransport {
    pub fn new<R, W>(reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(Self::read_loop(reader, pending.clone(), alive.clone()));
        Arc::new(Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            alive,
            next_id: AtomicU64::new(1),
            reader: Mutex::new(Some(task)),
            child: Mutex::new(None),
        })
    }

    /// 通过标准输入输出与启动的守护进程通信，transport 关闭或 drop 时杀掉子进程
    pub fn from_child(mut child: Child) -> Result<Arc<Self>, RemoteFileSystemError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RemoteFileSystemError::Connection("daemon stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RemoteFileSystemError::Connection("daemon stdout not piped".to_string()))?;
        let transport = Self::new(stdout, stdin);
        *lock(&transport.child) = Some(child);
        Ok(transport)
    }

    async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, pending: Pending, alive: Arc<AtomicBool>) {
        loop {
            match read_frame::<_, Response>(&mut reader).await {
                Ok(Some(response)) => match lock(&pending).remove(&response.id) {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => warn!("response for unknown request {}", response.id),
                },
                Ok(None) => {
                    debug!("privileged stream closed");
                    break;
                }
                Err(e) => {
                    warn!("privileged stream failed: {}", e);
                    break;
                }
            }
        }
        alive.store(false, Ordering::SeqCst);
        // 丢弃等待者，调用方收到 Disconnected
        lock(&pending).clear();
    }
}

impl fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTransport")
            .field("alive", &self.is_alive())
            .field("pending", &lock(&self.pending).len())
            .finish()
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn call(&self, handle: Handle, op: Operation) -> Result<Reply, RemoteFileSystemError> {
        let disconnected = || RemoteFileSystemError::Disconnected("privileged stream closed".to_string());
        if !self.is_alive() {
            return Err(disconnected());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        // 读循环可能刚好在插入前清空了等待表
        if !self.is_alive() {
            lock(&self.pending).remove(&id);
            return Err(disconnected());
        }

        let request = Request { id, handle, op };
        let written = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &request).await
        };
        if let Err(e) = written {
            lock(&self.pending).remove(&id);
            self.alive.store(false, Ordering::SeqCst);
            return Err(RemoteFileSystemError::Disconnected(e.to_string()));
        }

        let response = rx.await.map_err(|_| disconnected())?;
        response.result.map_err(RemoteFileSystemError::Fault)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(task) = lock(&self.reader).take() {
            task.abort();
        }
        lock(&self.pending).clear();
        let child = lock(&self.child).take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                debug!("daemon already gone: {}", e);
            }
        }
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.reader).take() {
            task.abort();
        }
    }
}
