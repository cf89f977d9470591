use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// 守护进程锁文件内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    /// 进程 ID
    pub pid: u32,
    /// 主机名
    pub hostname: String,
    /// 守护进程的构建版本，客户端据此判断能否复用
    pub version: String,
    /// 监听的套接字
    pub socket: PathBuf,
    pub started_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn current(version: &str, socket: &Path) -> Self {
        Self {
            pid: process::id(),
            hostname: whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_string()),
            version: version.to_string(),
            socket: socket.to_path_buf(),
            started_at: Utc::now(),
        }
    }

    /// 读取锁信息；锁文件不存在时返回 `None`
    pub fn read(lock_file: &Path) -> Result<Option<Self>> {
        let mut file = match File::open(lock_file) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(anyhow!("打开锁文件失败 {:?}: {}", lock_file, e)),
        };
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let info: LockInfo = serde_json::from_str(&contents)?;
        Ok(Some(info))
    }

    pub fn is_alive(&self) -> bool {
        is_process_running(self.pid)
    }
}

/// 特权守护进程持有的锁文件，记录 pid 与版本供客户端复用或清理
pub struct DaemonLock {
    path: PathBuf,
    info: LockInfo,
    locked: bool,
}

impl DaemonLock {
    /// 获取锁。已有锁文件属于仍在运行的进程时失败；过期的锁会被清理
    pub fn acquire(path: &Path, version: &str, socket: &Path) -> Result<Self> {
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let info = LockInfo::current(version, socket);
                    let json = serde_json::to_string_pretty(&info)?;
                    file.write_all(json.as_bytes())?;
                    file.sync_all()?;
                    info!("成功获取守护进程锁: {:?}", path);
                    return Ok(Self {
                        path: path.to_path_buf(),
                        info,
                        locked: true,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match LockInfo::read(path) {
                        Ok(Some(info)) if info.is_alive() => {
                            return Err(anyhow!(
                                "守护进程已在运行: PID {} @ {} (版本 {}, 启动于 {})\n锁文件: {:?}",
                                info.pid,
                                info.hostname,
                                info.version,
                                info.started_at,
                                path
                            ));
                        }
                        Ok(_) => warn!("检测到过期锁文件，正在清理: {:?}", path),
                        Err(e) => warn!("无法读取锁文件信息，可能已损坏: {:?}", e),
                    }
                    remove_if_exists(path)?;
                }
                Err(e) => return Err(anyhow!("创建锁文件失败 {:?}: {}", path, e)),
            }
        }
        Err(anyhow!("无法获取守护进程锁: {:?}", path))
    }

    /// 与 `acquire` 相同，但持有锁的进程版本不同时先终止它
    pub async fn acquire_replacing(path: &Path, version: &str, socket: &Path) -> Result<Self> {
        if let Ok(Some(info)) = LockInfo::read(path) {
            if info.version != version && info.is_alive() && info.pid != process::id() {
                warn!("终止旧版本守护进程: PID {} (版本 {})", info.pid, info.version);
                terminate(info.pid);
                wait_for_exit(info.pid, std::time::Duration::from_secs(2)).await;
            }
        }
        Self::acquire(path, version, socket)
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// 释放锁，只删除属于当前进程的锁文件
    pub fn release(&mut self) -> Result<()> {
        if !self.locked {
            return Ok(());
        }
        match LockInfo::read(&self.path) {
            Ok(Some(info)) if info.pid == process::id() => {
                std::fs::remove_file(&self.path)?;
                info!("已释放守护进程锁: {:?}", self.path);
            }
            Ok(Some(_)) => warn!("锁文件不属于当前进程，跳过: {:?}", self.path),
            Ok(None) => {}
            Err(e) => warn!("读取锁文件失败: {}", e),
        }
        self.locked = false;
        Ok(())
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        if self.locked {
            if let Err(e) = self.release() {
                error!("释放守护进程锁失败: {}", e);
            }
        }
    }
}

pub fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow!("删除文件失败 {:?}: {}", path, e)),
    }
}

/// 检查进程是否在运行
pub fn is_process_running(pid: u32) -> bool {
    // 发送信号 0 来检查进程是否存在
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// 向进程发送 SIGTERM
pub fn terminate(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, libc::SIGTERM) == 0 }
}

/// 等待进程退出，返回是否在超时前退出
pub async fn wait_for_exit(pid: u32, timeout: std::time::Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while is_process_running(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_release() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("unifsd.lock");
        let socket = temp_dir.path().join("unifsd.sock");

        let mut lock = DaemonLock::acquire(&path, "1.0", &socket).unwrap();
        assert!(lock.is_locked());
        let info = LockInfo::read(&path).unwrap().unwrap();
        assert_eq!(info.pid, process::id());
        assert_eq!(info.version, "1.0");
        assert_eq!(info.socket, socket);

        // 当前进程仍在运行，第二次获取失败
        assert!(DaemonLock::acquire(&path, "1.0", &socket).is_err());

        lock.release().unwrap();
        assert!(LockInfo::read(&path).unwrap().is_none());
        assert!(DaemonLock::acquire(&path, "1.0", &socket).is_ok());
    }

    #[test]
    fn test_stale_lock_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("unifsd.lock");
        let socket = temp_dir.path().join("unifsd.sock");

        let mut stale = LockInfo::current("0.9", &socket);
        stale.pid = i32::MAX as u32;
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();
        assert!(!stale.is_alive());

        let lock = DaemonLock::acquire(&path, "1.0", &socket).unwrap();
        assert_eq!(lock.info().version, "1.0");

        std::fs::write(&path, "garbage").unwrap();
        drop(lock);
        assert!(DaemonLock::acquire(&path, "1.0", &socket).is_ok());
    }
}
