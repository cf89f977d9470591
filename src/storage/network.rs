use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::bytes::ByteString;
use crate::error::{FsError, Result};
use crate::fs::{format_network, parse_network, Authority, FileSystemBackend, FileSystemProvider};

/// 为一个 authority 打开协议会话（SFTP、FTP、SMB、WebDAV 等）
///
/// 注册表保证每个存活的 `(scheme, authority)` 最多调用一次 `connect`，实现方无需自行缓存
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, authority: &Authority) -> Result<Arc<dyn FileSystemBackend>>;
}

/// 包装连接器的层级 `scheme://user@host:port/path` provider
pub struct NetworkProvider {
    scheme: String,
    default_port: u16,
    connector: Arc<dyn SessionConnector>,
}

impl NetworkProvider {
    pub fn new(scheme: impl Into<String>, default_port: u16, connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            scheme: scheme.into(),
            default_port,
            connector,
        }
    }

    pub fn sftp(connector: Arc<dyn SessionConnector>) -> Self {
        Self::new("sftp", 22, connector)
    }

    pub fn ftp(connector: Arc<dyn SessionConnector>) -> Self {
        Self::new("ftp", 21, connector)
    }

    pub fn smb(connector: Arc<dyn SessionConnector>) -> Self {
        Self::new("smb", 445, connector)
    }

    pub fn webdav(connector: Arc<dyn SessionConnector>) -> Self {
        Self::new("webdav", 80, connector)
    }

    pub fn default_port(&self) -> u16 {
        self.default_port
    }
}

impl fmt::Debug for NetworkProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkProvider")
            .field("scheme", &self.scheme)
            .field("default_port", &self.default_port)
            .finish()
    }
}

#[async_trait]
impl FileSystemProvider for NetworkProvider {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    async fn new_file_system(&self, authority: &Authority) -> Result<Arc<dyn FileSystemBackend>> {
        if !matches!(authority, Authority::Network { .. }) {
            return Err(FsError::InvalidPath(format!("{}: expects host authority, got {}", self.scheme, authority)));
        }
        info!("connecting {} session to {}", self.scheme, authority);
        self.connector.connect(authority).await
    }

    fn parse_uri(&self, rest: &str) -> Result<(Authority, ByteString)> {
        parse_network(rest, self.default_port)
    }

    fn format_uri(&self, authority: &Authority, path: &[u8]) -> String {
        format_network(&self.scheme, authority, path, self.default_port)
    }
}
