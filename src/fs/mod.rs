//! 与后端无关的文件系统模型
//!
//! [`FileSystem`] 是某个 [`FileSystemProvider`] 针对一个 [`Authority`] 的存活会话。
//! 由它签发的 [`Path`] 把所有操作转发给 [`FileSystemBackend`]，后端路径是规范化的绝对字节串。

mod attributes;
mod authority;
mod path;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::bytes::ByteString;
use crate::error::{FsError, Result};
use crate::posix::{FileTime, FileType};
use crate::watch::WatchService;

pub use attributes::{permissions_string, PosixFileAttributes, PosixPrincipal};
pub use authority::{decode_path, encode_path, format_network, parse_network, Authority};
pub use path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: ByteString,
    pub file_type: FileType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyOptions {
    pub replace_existing: bool,
    pub copy_attributes: bool,
    pub follow_links: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub create_new: bool,
    pub truncate: bool,
    pub mode: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            create: false,
            create_new: false,
            truncate: false,
            mode: 0o666,
        }
    }
}

impl OpenOptions {
    pub fn read() -> Self {
        Self::default()
    }

    /// 创建或截断后写入
    pub fn write() -> Self {
        Self {
            read: false,
            write: true,
            create: true,
            truncate: true,
            ..Self::default()
        }
    }

    pub fn is_writing(&self) -> bool {
        self.write || self.append || self.create || self.create_new || self.truncate
    }
}

/// 打开文件上的可定位字节通道
#[async_trait]
pub trait ByteChannel: Send + Sync + fmt::Debug {
    /// 从当前位置读取至多 `len` 字节，返回空表示文件结束
    async fn read(&self, len: usize) -> Result<Vec<u8>>;
    async fn write(&self, data: &[u8]) -> Result<usize>;
    async fn position(&self) -> Result<u64>;
    async fn seek(&self, position: u64) -> Result<()>;
    async fn size(&self) -> Result<u64>;
    async fn truncate(&self, size: u64) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

pub const CHANNEL_CHUNK: usize = 64 * 1024;

/// 单次 read 返回的字节数上限，更大的请求按此截断
pub const MAX_READ_LEN: usize = 1024 * 1024;

pub async fn read_to_end(channel: &dyn ByteChannel) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    loop {
        let chunk = channel.read(CHANNEL_CHUNK).await?;
        if chunk.is_empty() {
            return Ok(data);
        }
        data.extend_from_slice(&chunk);
    }
}

pub async fn write_all(channel: &dyn ByteChannel, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        let n = channel.write(&data[..data.len().min(CHANNEL_CHUNK)]).await?;
        if n == 0 {
            return Err(FsError::Io(std::io::ErrorKind::WriteZero.into()));
        }
        data = &data[n..];
    }
    Ok(())
}

/// 一个卷的容量信息，每次调用都重新读取
#[async_trait]
pub trait FileStore: Send + Sync + fmt::Debug {
    async fn name(&self) -> Result<String>;
    async fn kind(&self) -> Result<String>;
    async fn is_read_only(&self) -> Result<bool>;
    async fn total_space(&self) -> Result<u64>;
    async fn usable_space(&self) -> Result<u64>;
    async fn unallocated_space(&self) -> Result<u64>;
    async fn block_size(&self) -> Result<u64>;
}

/// 读取或修改单个文件的属性
#[async_trait]
pub trait PosixFileAttributeView: Send + Sync + fmt::Debug {
    async fn read_attributes(&self) -> Result<PosixFileAttributes>;
    async fn set_mode(&self, mode: u32) -> Result<()>;
    async fn set_owner(&self, uid: u32) -> Result<()>;
    async fn set_group(&self, gid: u32) -> Result<()>;
    /// `None` 表示不修改对应时间戳
    async fn set_times(&self, last_modified: Option<FileTime>, last_access: Option<FileTime>) -> Result<()>;
}

#[async_trait]
pub trait FileSystemBackend: Send + Sync + fmt::Debug {
    async fn root_directory(&self) -> Result<ByteString> {
        Ok(ByteString::from("/"))
    }

    async fn read_attributes<'a>(&'a self, path: &'a [u8], follow_links: bool) -> Result<PosixFileAttributes>;
    async fn create_directory<'a>(&'a self, path: &'a [u8], mode: u32) -> Result<()>;
    async fn create_symbolic_link<'a>(&'a self, link: &'a [u8], target: &'a [u8]) -> Result<()>;
    async fn delete<'a>(&'a self, path: &'a [u8]) -> Result<()>;
    async fn copy<'a>(&'a self, source: &'a [u8], target: &'a [u8], options: CopyOptions) -> Result<()>;
    async fn move_file<'a>(&'a self, source: &'a [u8], target: &'a [u8], options: CopyOptions) -> Result<()>;
    async fn list_directory<'a>(&'a self, path: &'a [u8]) -> Result<Vec<DirectoryEntry>>;
    async fn open_byte_channel<'a>(&'a self, path: &'a [u8], options: OpenOptions) -> Result<Box<dyn ByteChannel>>;
    async fn file_stores(&self) -> Result<Vec<Arc<dyn FileStore>>>;
    async fn file_store<'a>(&'a self, path: &'a [u8]) -> Result<Arc<dyn FileStore>>;
    async fn attribute_view<'a>(&'a self, path: &'a [u8], follow_links: bool) -> Result<Arc<dyn PosixFileAttributeView>>;
    async fn new_watch_service(&self) -> Result<Arc<dyn WatchService>>;

    /// 与底层数据重新同步
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// 一个后端，注册在一个 URI scheme 下
#[async_trait]
pub trait FileSystemProvider: Send + Sync + fmt::Debug {
    fn scheme(&self) -> &str;

    /// 为 `authority` 打开新会话，每个存活的键最多调用一次
    async fn new_file_system(&self, authority: &Authority) -> Result<Arc<dyn FileSystemBackend>>;

    /// 解析 `scheme:` 之后的部分
    fn parse_uri(&self, rest: &str) -> Result<(Authority, ByteString)>;

    fn format_uri(&self, authority: &Authority, path: &[u8]) -> String;
}

/// 拼接目录路径和条目名
pub fn child_path(dir: &[u8], name: &[u8]) -> ByteString {
    let mut path = dir.to_vec();
    if !path.ends_with(b"/") {
        path.push(b'/');
    }
    path.extend_from_slice(name);
    ByteString::from(path)
}

/// 存活的文件系统会话
pub struct FileSystem {
    id: Uuid,
    authority: Authority,
    provider: Arc<dyn FileSystemProvider>,
    backend: Arc<dyn FileSystemBackend>,
    open: AtomicBool,
    watch_services: Mutex<Vec<Arc<dyn WatchService>>>,
}

impl FileSystem {
    pub fn new(
        provider: Arc<dyn FileSystemProvider>,
        authority: Authority,
        backend: Arc<dyn FileSystemBackend>,
    ) -> Arc<Self> {
        let fs = Arc::new(Self {
            id: Uuid::new_v4(),
            authority,
            provider,
            backend,
            open: AtomicBool::new(true),
            watch_services: Mutex::new(Vec::new()),
        });
        debug!("file system opened: {} {}", fs.scheme(), fs.authority);
        fs
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn scheme(&self) -> &str {
        self.provider.scheme()
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn provider(&self) -> &Arc<dyn FileSystemProvider> {
        &self.provider
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// 返回后端，实例关闭后返回 `ClosedFileSystem`
    pub fn backend(&self) -> Result<&Arc<dyn FileSystemBackend>> {
        if self.is_open() {
            Ok(&self.backend)
        } else {
            Err(FsError::ClosedFileSystem)
        }
    }

    pub fn path(self: &Arc<Self>, path: impl Into<ByteString>) -> Path {
        Path::new(self.clone(), path.into())
    }

    pub async fn root_directory(self: &Arc<Self>) -> Result<Path> {
        let root = self.backend()?.root_directory().await?;
        Ok(self.path(root))
    }

    pub async fn file_stores(&self) -> Result<Vec<Arc<dyn FileStore>>> {
        self.backend()?.file_stores().await
    }

    /// 新建监听服务，随文件系统一起关闭
    pub async fn new_watch_service(&self) -> Result<Arc<dyn WatchService>> {
        let service = self.backend()?.new_watch_service().await?;
        // 后端创建服务期间可能已经 close()
        let accepted = {
            let mut services = self.watch_services.lock().unwrap_or_else(|p| p.into_inner());
            if self.is_open() {
                services.push(service.clone());
            }
            self.is_open()
        };
        if !accepted {
            service.close().await;
            return Err(FsError::ClosedFileSystem);
        }
        Ok(service)
    }

    pub async fn refresh(&self) -> Result<()> {
        self.backend()?.refresh().await
    }

    pub fn to_uri(&self, path: &[u8]) -> String {
        self.provider.format_uri(&self.authority, path)
    }

    /// 关闭会话，可重复调用，并取消这里签发的所有 watch key
    pub async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let services: Vec<_> = self
            .watch_services
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for service in services {
            service.close().await;
        }
        info!("file system closed: {} {}", self.scheme(), self.authority);
        self.backend.close().await
    }
}

impl fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSystem")
            .field("id", &self.id)
            .field("scheme", &self.scheme())
            .field("authority", &self.authority)
            .field("open", &self.is_open())
            .finish()
    }
}
