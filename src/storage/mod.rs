//! 具体后端：本地 POSIX 存储、可嵌套在任意路径中的 tar 归档，以及网络协议文件系统的通用框架

mod archive;
mod local;
mod network;

pub use archive::{ArchiveBackend, ArchiveProvider};
pub use local::{LocalBackend, LocalByteChannel, LocalFileStore, LocalProvider};
pub use network::{NetworkProvider, SessionConnector};

use crate::error::{FsError, Result};

/// 在阻塞线程池中执行闭包
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FsError::InvalidOperation(format!("blocking task failed: {}", e)))?
}
