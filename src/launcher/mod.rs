//! 特权服务的启动与绑定
//!
//! 两条独立的 [`LaunchChannel`]：系统特权代理（[`ManagedChannel`]）和直接启动的守护进程
//! （[`DaemonChannel`]）。调用方选择其一，一条失败不会转用另一条。

mod daemon;
mod managed;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{AbortHandle, Abortable, BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{ChannelKind, LauncherConfig};
use crate::error::RemoteFileSystemError;
use crate::remote::{Handle, Operation, Transport};
use crate::watch::lock;

pub use daemon::{DaemonChannel, DaemonMode};
pub use managed::{ManagedChannel, PermissionRequest, PrivilegeBroker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Idle,
    /// 等待通道：授权请求或守护进程启动
    Requested,
    Connecting,
    Bound,
    Disconnected,
    TimedOut,
    Failed,
}

/// 发布启动器状态变化
#[derive(Clone)]
pub struct StateTracker {
    sender: Arc<watch::Sender<ServiceState>>,
}

impl StateTracker {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(ServiceState::Idle);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn set(&self, state: ServiceState) {
        let previous = self.sender.send_replace(state);
        if previous != state {
            debug!("privileged service: {:?} -> {:?}", previous, state);
        }
    }

    pub fn get(&self) -> ServiceState {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.sender.subscribe()
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateTracker").field(&self.get()).finish()
    }
}

pub type LaunchResult = Result<Arc<dyn Transport>, RemoteFileSystemError>;

/// 获得特权服务连接的一种方式
#[async_trait]
pub trait LaunchChannel: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// 获取权限并连接，通过 `state` 报告进度
    async fn open(&self, state: &StateTracker) -> LaunchResult;
}

type PendingLaunch = Shared<BoxFuture<'static, LaunchResult>>;

#[derive(Default)]
struct LaunchSlot {
    bound: Option<Arc<dyn Transport>>,
    pending: Option<(PendingLaunch, AbortHandle)>,
}

/// 单飞启动器：同一时间最多一次尝试，并发调用者共享其结果
pub struct ServiceLauncher {
    channel: Arc<dyn LaunchChannel>,
    version: String,
    bind_timeout: Duration,
    state: StateTracker,
    slot: Mutex<LaunchSlot>,
}

impl ServiceLauncher {
    pub fn new(channel: Arc<dyn LaunchChannel>, version: impl Into<String>, bind_timeout: Duration) -> Self {
        Self {
            channel,
            version: version.into(),
            bind_timeout,
            state: StateTracker::new(),
            slot: Mutex::new(LaunchSlot::default()),
        }
    }

    /// 按 `config` 选择通道。managed 通道需要代理，没有时报告 `Unavailable`
    pub fn from_config(config: &LauncherConfig, broker: Option<Arc<dyn PrivilegeBroker>>) -> Self {
        let channel: Arc<dyn LaunchChannel> = match (config.channel, broker) {
            (ChannelKind::Managed, Some(broker)) => Arc::new(ManagedChannel::new(broker, config.bind_timeout())),
            (ChannelKind::Managed, None) => Arc::new(ManagedChannel::unavailable(config.bind_timeout())),
            (ChannelKind::Daemon, _) => Arc::new(DaemonChannel::from_config(config)),
        };
        Self::new(channel, config.version.clone(), config.bind_timeout())
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn channel(&self) -> &Arc<dyn LaunchChannel> {
        &self.channel
    }

    pub fn state(&self) -> ServiceState {
        let slot = lock(&self.slot);
        if let Some(transport) = &slot.bound {
            if !transport.is_alive() {
                self.state.set(ServiceState::Disconnected);
            }
        }
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    /// 已绑定的连接，必要时启动服务
    pub async fn launch(&self) -> LaunchResult {
        let attempt = {
            let mut slot = lock(&self.slot);
            if let Some(transport) = slot.bound.clone() {
                if transport.is_alive() {
                    return Ok(transport);
                }
                info!("privileged service gone, relaunching");
                self.state.set(ServiceState::Disconnected);
                slot.bound = None;
            }
            match &slot.pending {
                Some((attempt, _)) => attempt.clone(),
                None => {
                    let (attempt, abort) = self.start();
                    slot.pending = Some((attempt.clone(), abort));
                    attempt
                }
            }
        };

        let result = attempt.clone().await;
        let mut slot = lock(&self.slot);
        let current = matches!(&slot.pending, Some((pending, _)) if pending.ptr_eq(&attempt));
        if current {
            slot.pending = None;
            if let Ok(transport) = &result {
                slot.bound = Some(transport.clone());
            }
        }
        result
    }

    fn start(&self) -> (PendingLaunch, AbortHandle) {
        let channel = self.channel.clone();
        let version = self.version.clone();
        let timeout = self.bind_timeout;
        let state = self.state.clone();
        let (abort, registration) = AbortHandle::new_pair();

        info!("launching privileged service via {}", channel.name());
        let work = async move {
            state.set(ServiceState::Requested);
            let result = match channel.open(&state).await {
                Ok(transport) => match handshake(transport.as_ref(), &version, timeout).await {
                    Ok(()) => Ok(transport),
                    Err(e) => {
                        transport.shutdown().await;
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };
            state.set(match &result {
                Ok(_) => ServiceState::Bound,
                Err(RemoteFileSystemError::Timeout(_)) => ServiceState::TimedOut,
                Err(RemoteFileSystemError::Cancelled) => ServiceState::Disconnected,
                Err(_) => ServiceState::Failed,
            });
            match &result {
                Ok(_) => info!("privileged service bound"),
                Err(e) => warn!("privileged service launch failed: {}", e),
            }
            result
        };

        let cancelled_state = self.state.clone();
        let attempt = Abortable::new(work, registration)
            .map(move |outcome| match outcome {
                Ok(result) => result,
                Err(_aborted) => {
                    cancelled_state.set(ServiceState::Disconnected);
                    Err(RemoteFileSystemError::Cancelled)
                }
            })
            .boxed()
            .shared();
        (attempt, abort)
    }

    /// 中止进行中的尝试。调用者收到 `Cancelled`，已启动的守护进程被杀掉，授权请求被丢弃
    pub fn cancel(&self) {
        let pending = lock(&self.slot).pending.take();
        if let Some((_, abort)) = pending {
            info!("privileged service launch cancelled");
            abort.abort();
            self.state.set(ServiceState::Disconnected);
        }
    }

    /// 取消尝试并断开已绑定的服务
    pub async fn shutdown(&self) {
        self.cancel();
        let bound = lock(&self.slot).bound.take();
        if let Some(transport) = bound {
            transport.shutdown().await;
            self.state.set(ServiceState::Disconnected);
        }
    }
}

impl fmt::Debug for ServiceLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceLauncher")
            .field("channel", &self.channel.name())
            .field("version", &self.version)
            .field("state", &self.state.get())
            .finish()
    }
}

/// 交换版本号，版本不同的远端不复用
async fn handshake(transport: &dyn Transport, version: &str, timeout: Duration) -> Result<(), RemoteFileSystemError> {
    let hello = Operation::Hello {
        version: version.to_string(),
    };
    let reply = tokio::time::timeout(timeout, transport.call(Handle::ROOT, hello))
        .await
        .map_err(|_| RemoteFileSystemError::Timeout(timeout))??;
    let remote = reply.into_hello()?;
    if remote != version {
        return Err(RemoteFileSystemError::VersionMismatch {
            local: version.to_string(),
            remote,
        });
    }
    Ok(())
}
