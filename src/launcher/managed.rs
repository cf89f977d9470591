use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, OnceCell};
use tracing::{debug, info};

use crate::error::RemoteFileSystemError;
use crate::remote::Transport;

use super::{LaunchChannel, LaunchResult, ServiceState, StateTracker};

/// 系统级特权代理，例如需要授权的 shell 服务
#[async_trait]
pub trait PrivilegeBroker: Send + Sync + fmt::Debug {
    /// 代理是否已安装并运行，每个通道只探测一次
    async fn is_available(&self) -> bool;

    async fn has_permission(&self) -> bool;

    /// 向用户展示授权请求。通过 [`PermissionRequest::grant`] 或
    /// [`PermissionRequest::deny`] 恰好处理一次，未处理就丢弃视为取消启动
    fn request_permission(&self, request: PermissionRequest);

    /// 通过代理启动特权服务并连接
    async fn bind(&self) -> Result<Arc<dyn Transport>, RemoteFileSystemError>;
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// 待处理的授权请求
pub struct PermissionRequest {
    id: u64,
    reply: oneshot::Sender<bool>,
}

impl PermissionRequest {
    fn new() -> (Self, oneshot::Receiver<bool>) {
        let (reply, decision) = oneshot::channel();
        let request = Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            reply,
        };
        (request, decision)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// 请求展示期间启动已被取消
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    pub fn grant(self) {
        debug!("permission request {} granted", self.id);
        if self.reply.send(true).is_err() {
            debug!("permission request {} was abandoned", self.id);
        }
    }

    pub fn deny(self) {
        debug!("permission request {} denied", self.id);
        if self.reply.send(false).is_err() {
            debug!("permission request {} was abandoned", self.id);
        }
    }
}

impl fmt::Debug for PermissionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionRequest").field("id", &self.id).finish()
    }
}

/// 经由 [`PrivilegeBroker`] 的通道
pub struct ManagedChannel {
    broker: Option<Arc<dyn PrivilegeBroker>>,
    available: OnceCell<bool>,
    bind_timeout: Duration,
}

impl ManagedChannel {
    pub fn new(broker: Arc<dyn PrivilegeBroker>, bind_timeout: Duration) -> Self {
        Self {
            broker: Some(broker),
            available: OnceCell::new(),
            bind_timeout,
        }
    }

    /// 没有代理的通道，每次启动都返回 `Unavailable`
    pub fn unavailable(bind_timeout: Duration) -> Self {
        Self {
            broker: None,
            available: OnceCell::new_with(Some(false)),
            bind_timeout,
        }
    }

    /// 缓存的可用性探测
    pub async fn is_available(&self) -> bool {
        let broker = match &self.broker {
            Some(broker) => broker,
            None => return false,
        };
        *self
            .available
            .get_or_init(|| async {
                let available = broker.is_available().await;
                info!("privilege broker available: {}", available);
                available
            })
            .await
    }

    fn broker(&self) -> Result<&Arc<dyn PrivilegeBroker>, RemoteFileSystemError> {
        self.broker
            .as_ref()
            .ok_or_else(|| RemoteFileSystemError::Unavailable("no privilege broker configured".to_string()))
    }
}

impl fmt::Debug for ManagedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedChannel")
            .field("broker", &self.broker)
            .field("available", &self.available.get())
            .field("bind_timeout", &self.bind_timeout)
            .finish()
    }
}

#[async_trait]
impl LaunchChannel for ManagedChannel {
    fn name(&self) -> &str {
        "managed"
    }

    async fn open(&self, state: &StateTracker) -> LaunchResult {
        let broker = self.broker()?;
        if !self.is_available().await {
            return Err(RemoteFileSystemError::Unavailable(
                "privilege broker is not running".to_string(),
            ));
        }

        if !broker.has_permission().await {
            let (request, decision) = PermissionRequest::new();
            info!("requesting privilege permission ({})", request.id());
            broker.request_permission(request);
            match decision.await {
                Ok(true) => {}
                Ok(false) => return Err(RemoteFileSystemError::PermissionDenied),
                Err(_) => return Err(RemoteFileSystemError::Cancelled),
            }
        }

        state.set(ServiceState::Connecting);
        tokio::time::timeout(self.bind_timeout, broker.bind())
            .await
            .map_err(|_| RemoteFileSystemError::Timeout(self.bind_timeout))?
    }
}
