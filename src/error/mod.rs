use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("scheme already registered: {0}")]
    SchemeAlreadyRegistered(String),

    #[error("file system is closed")]
    ClosedFileSystem,

    #[error("watch service is closed")]
    ClosedWatchService,

    #[error(transparent)]
    NativeSyscall(#[from] NativeSyscallError),

    #[error("remote file system error: {0}")]
    Remote(#[from] RemoteFileSystemError),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("read-only file system")]
    ReadOnly,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl FsError {
    /// 返回底层 errno（包括跨进程边界包装过的系统调用错误）
    pub fn errno(&self) -> Option<i32> {
        match self {
            FsError::NativeSyscall(e) => Some(e.errno),
            FsError::Remote(RemoteFileSystemError::Fault(fault)) => match fault.kind {
                FaultKind::Syscall { errno } => Some(errno),
                _ => None,
            },
            FsError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// 把错误归类为可以跨进程传递的故障描述
    pub fn to_fault(&self) -> RemoteFault {
        let kind = match self {
            FsError::NativeSyscall(e) => FaultKind::Syscall { errno: e.errno },
            FsError::Io(e) => match e.raw_os_error() {
                Some(errno) => FaultKind::Syscall { errno },
                None => FaultKind::Other,
            },
            FsError::UnsupportedScheme(_) => FaultKind::UnsupportedScheme,
            FsError::ClosedFileSystem => FaultKind::ClosedFileSystem,
            FsError::ClosedWatchService => FaultKind::ClosedWatchService,
            FsError::NotFound(_) => FaultKind::NotFound,
            FsError::ReadOnly => FaultKind::ReadOnly,
            FsError::InvalidPath(_) | FsError::InvalidOperation(_) => FaultKind::InvalidArgument,
            // 嵌套的远程错误保持原分类
            FsError::Remote(RemoteFileSystemError::Fault(fault)) => return fault.clone(),
            FsError::SchemeAlreadyRegistered(_) | FsError::Remote(_) => FaultKind::Other,
        };
        RemoteFault {
            kind,
            message: self.to_string(),
        }
    }
}

/// 失败的系统调用，带原始 errno
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct NativeSyscallError {
    pub errno: i32,
    pub syscall: &'static str,
    pub path: Option<String>,
}

impl NativeSyscallError {
    pub fn new(errno: i32, syscall: &'static str) -> Self {
        Self {
            errno,
            syscall,
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn from_errno(errno: rustix::io::Errno, syscall: &'static str) -> Self {
        Self::new(errno.raw_os_error(), syscall)
    }

    /// 读取当前线程的 errno
    pub fn last_os_error(syscall: &'static str) -> Self {
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO);
        Self::new(errno, syscall)
    }
}

impl fmt::Display for NativeSyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = std::io::Error::from_raw_os_error(self.errno);
        match &self.path {
            Some(path) => write!(f, "{}({}): {}", self.syscall, path, description),
            None => write!(f, "{}: {}", self.syscall, description),
        }
    }
}

/// 特权端或连接通道产生的错误
///
/// 可克隆：一次连接失败要交给所有等待中的调用者
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteFileSystemError {
    #[error("failed to connect to privileged service: {0}")]
    Connection(String),

    #[error("privileged service disconnected: {0}")]
    Disconnected(String),

    #[error("timed out after {0:?} binding privileged service")]
    Timeout(Duration),

    #[error("permission denied by user")]
    PermissionDenied,

    #[error("privileged service launch cancelled")]
    Cancelled,

    #[error("privilege channel unavailable: {0}")]
    Unavailable(String),

    #[error("version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: String, remote: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Fault(RemoteFault),
}

/// 特权端故障分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    Syscall { errno: i32 },
    UnsupportedScheme,
    ClosedFileSystem,
    ClosedWatchService,
    NotFound,
    ReadOnly,
    InvalidArgument,
    InvalidHandle,
    Panic,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFault {
    pub kind: FaultKind,
    pub message: String,
}

impl RemoteFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<FsError> for RemoteFault {
    fn from(e: FsError) -> Self {
        e.to_fault()
    }
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remote fault ({:?}): {}", self.kind, self.message)
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
