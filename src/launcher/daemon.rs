use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::LauncherConfig;
use crate::error::RemoteFileSystemError;
use crate::lock::{remove_if_exists, terminate, wait_for_exit, LockInfo};
use crate::remote::StreamTransport;

use super::{LaunchChannel, LaunchResult, ServiceState, StateTracker};

const SOCKET_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonMode {
    /// 每个客户端一个守护进程，通过标准输入输出通信
    Stdio,
    /// 共享守护进程，监听 Unix 套接字并记录在锁文件中
    Socket { socket_path: PathBuf, lock_path: PathBuf },
}

/// 直接启动的特权守护进程，例如 `su -c "unifsd --stdio"`
pub struct DaemonChannel {
    command: Vec<String>,
    mode: DaemonMode,
    version: String,
    bind_timeout: Duration,
}

impl DaemonChannel {
    pub fn new(command: Vec<String>, mode: DaemonMode, version: impl Into<String>, bind_timeout: Duration) -> Self {
        Self {
            command,
            mode,
            version: version.into(),
            bind_timeout,
        }
    }

    /// 同时配置了套接字和锁文件路径时使用套接字模式
    pub fn from_config(config: &LauncherConfig) -> Self {
        let mode = match (&config.socket_path, &config.lock_path) {
            (Some(socket_path), Some(lock_path)) => DaemonMode::Socket {
                socket_path: socket_path.clone(),
                lock_path: lock_path.clone(),
            },
            _ => DaemonMode::Stdio,
        };
        Self::new(
            config.daemon_command.clone(),
            mode,
            config.version.clone(),
            config.bind_timeout(),
        )
    }

    pub fn mode(&self) -> &DaemonMode {
        &self.mode
    }

    fn command(&self) -> Result<Command, RemoteFileSystemError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| RemoteFileSystemError::Unavailable("no daemon command configured".to_string()))?;
        let mut command = Command::new(program);
        command.args(args).stderr(Stdio::inherit());
        Ok(command)
    }

    fn spawn(&self, mut command: Command) -> Result<Child, RemoteFileSystemError> {
        let child = command.spawn().map_err(|e| {
            RemoteFileSystemError::Connection(format!("spawning {:?} failed: {}", self.command, e))
        })?;
        info!("spawned privileged daemon {:?} (pid {:?})", self.command, child.id());
        Ok(child)
    }

    async fn open_stdio(&self, state: &StateTracker) -> LaunchResult {
        let mut command = self.command()?;
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        let child = self.spawn(command)?;
        state.set(ServiceState::Connecting);
        Ok(StreamTransport::from_child(child)?)
    }

    async fn open_socket(&self, socket_path: &Path, lock_path: &Path, state: &StateTracker) -> LaunchResult {
        if let Some(stream) = self.reuse(lock_path).await {
            state.set(ServiceState::Connecting);
            let (reader, writer) = stream.into_split();
            return Ok(StreamTransport::new(reader, writer));
        }
        self.tear_down(socket_path, lock_path).await;

        let mut command = self.command()?;
        command.stdin(Stdio::null()).stdout(Stdio::null());
        let mut guard = ChildGuard(Some(self.spawn(command)?));
        state.set(ServiceState::Connecting);

        let stream = tokio::time::timeout(self.bind_timeout, wait_for_socket(&mut guard, socket_path))
            .await
            .map_err(|_| RemoteFileSystemError::Timeout(self.bind_timeout))??;
        // 守护进程在客户端之后继续运行
        guard.disarm();
        let (reader, writer) = stream.into_split();
        Ok(StreamTransport::new(reader, writer))
    }

    /// 锁文件记录的守护进程存活且版本一致时直接连接
    async fn reuse(&self, lock_path: &Path) -> Option<UnixStream> {
        let info = match LockInfo::read(lock_path) {
            Ok(Some(info)) => info,
            Ok(None) => return None,
            Err(e) => {
                warn!("unreadable daemon lock {:?}: {}", lock_path, e);
                return None;
            }
        };
        if !info.is_alive() {
            debug!("daemon pid {} from lock is gone", info.pid);
            return None;
        }
        if info.version != self.version {
            warn!(
                "daemon pid {} runs version {}, expected {}; replacing it",
                info.pid, info.version, self.version
            );
            return None;
        }
        match UnixStream::connect(&info.socket).await {
            Ok(stream) => {
                info!("reusing privileged daemon pid {} at {:?}", info.pid, info.socket);
                Some(stream)
            }
            Err(e) => {
                warn!("daemon pid {} not accepting on {:?}: {}", info.pid, info.socket, e);
                None
            }
        }
    }

    async fn tear_down(&self, socket_path: &Path, lock_path: &Path) {
        if let Ok(Some(info)) = LockInfo::read(lock_path) {
            if info.is_alive() && info.pid != std::process::id() {
                warn!("terminating stale daemon pid {}", info.pid);
                if !terminate(info.pid) || !wait_for_exit(info.pid, Duration::from_secs(2)).await {
                    // 无权限时由新守护进程自己替换旧进程
                    debug!("stale daemon pid {} left for the new daemon to replace", info.pid);
                }
            }
        }
        for path in [lock_path, socket_path] {
            if let Err(e) = remove_if_exists(path) {
                debug!("{}", e);
            }
        }
    }
}

impl fmt::Debug for DaemonChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonChannel")
            .field("command", &self.command)
            .field("mode", &self.mode)
            .field("version", &self.version)
            .finish()
    }
}

#[async_trait]
impl LaunchChannel for DaemonChannel {
    fn name(&self) -> &str {
        match self.mode {
            DaemonMode::Stdio => "daemon (stdio)",
            DaemonMode::Socket { .. } => "daemon (socket)",
        }
    }

    async fn open(&self, state: &StateTracker) -> LaunchResult {
        match &self.mode {
            DaemonMode::Stdio => self.open_stdio(state).await,
            DaemonMode::Socket { socket_path, lock_path } => self.open_socket(socket_path, lock_path, state).await,
        }
    }
}

/// 未解除时在 drop 中杀掉启动的守护进程，中止的启动不留残余
struct ChildGuard(Option<Child>);

impl ChildGuard {
    fn disarm(mut self) {
        self.0.take();
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(child) = self.0.as_mut() {
            debug!("killing unbound daemon pid {:?}", child.id());
            if let Err(e) = child.start_kill() {
                debug!("killing daemon failed: {}", e);
            }
        }
    }
}

async fn wait_for_socket(guard: &mut ChildGuard, socket_path: &Path) -> Result<UnixStream, RemoteFileSystemError> {
    let mut exited = false;
    loop {
        if !exited {
            if let Some(child) = guard.0.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) if !status.success() => {
                        return Err(RemoteFileSystemError::Connection(format!(
                            "daemon exited before listening: {}",
                            status
                        )));
                    }
                    // 启动器可能已把守护进程放到后台
                    Ok(Some(_)) => exited = true,
                    Ok(None) => {}
                    Err(e) => debug!("waiting on daemon: {}", e),
                }
            }
        }
        match UnixStream::connect(socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(e) => debug!("daemon socket {:?} not ready: {}", socket_path, e),
        }
        tokio::time::sleep(SOCKET_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::launcher::ServiceLauncher;
    use crate::registry::Registry;
    use crate::service::RootFileService;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    fn socket_channel(dir: &Path, command: &[&str]) -> DaemonChannel {
        DaemonChannel::new(
            command.iter().map(|s| s.to_string()).collect(),
            DaemonMode::Socket {
                socket_path: dir.join("unifsd.sock"),
                lock_path: dir.join("unifsd.lock"),
            },
            "1.0",
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn test_reuses_running_daemon() {
        let temp_dir = TempDir::new().unwrap();
        let socket = temp_dir.path().join("unifsd.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let registry = Registry::with_defaults(Config::default());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (reader, writer) = stream.into_split();
                let service = Arc::new(RootFileService::new(registry.clone(), "1.0"));
                tokio::spawn(service.serve(reader, writer));
            }
        });
        let info = LockInfo::current("1.0", &socket);
        std::fs::write(temp_dir.path().join("unifsd.lock"), serde_json::to_string(&info).unwrap()).unwrap();

        // 不应启动新进程
        let channel = socket_channel(temp_dir.path(), &["false"]);
        let launcher = ServiceLauncher::new(Arc::new(channel), "1.0", Duration::from_secs(2));
        let transport = launcher.launch().await.unwrap();
        assert!(transport.is_alive());
        assert_eq!(launcher.state(), ServiceState::Bound);
    }

    #[tokio::test]
    async fn test_mismatched_daemon_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("unifsd.lock");
        let info = LockInfo::current("0.9", &temp_dir.path().join("unifsd.sock"));
        std::fs::write(&lock_path, serde_json::to_string(&info).unwrap()).unwrap();

        let channel = socket_channel(temp_dir.path(), &["false"]);
        let err = channel.open(&StateTracker::new()).await.unwrap_err();
        assert!(matches!(err, RemoteFileSystemError::Connection(_)));
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn test_socket_wait_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let channel = DaemonChannel::new(
            vec!["sleep".to_string(), "30".to_string()],
            DaemonMode::Socket {
                socket_path: temp_dir.path().join("unifsd.sock"),
                lock_path: temp_dir.path().join("unifsd.lock"),
            },
            "1.0",
            Duration::from_millis(200),
        );
        let err = channel.open(&StateTracker::new()).await.unwrap_err();
        assert_eq!(err, RemoteFileSystemError::Timeout(Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn test_stdio_daemon_that_exits() {
        let channel = DaemonChannel::new(
            vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
            DaemonMode::Stdio,
            "1.0",
            Duration::from_secs(2),
        );
        let launcher = ServiceLauncher::new(Arc::new(channel), "1.0", Duration::from_secs(2));
        let err = launcher.launch().await.unwrap_err();
        assert!(matches!(err, RemoteFileSystemError::Disconnected(_)));
        assert_eq!(launcher.state(), ServiceState::Failed);
    }

    #[tokio::test]
    async fn test_missing_command() {
        let channel = DaemonChannel::new(Vec::new(), DaemonMode::Stdio, "1.0", Duration::from_secs(1));
        assert!(matches!(
            channel.open(&StateTracker::new()).await,
            Err(RemoteFileSystemError::Unavailable(_))
        ));

        let channel = DaemonChannel::new(
            vec!["/nonexistent/unifsd".to_string()],
            DaemonMode::Stdio,
            "1.0",
            Duration::from_secs(1),
        );
        assert!(matches!(
            channel.open(&StateTracker::new()).await,
            Err(RemoteFileSystemError::Connection(_))
        ));
    }
}
