//! 特权进程中对象的客户端代理
//!
//! 每个代理持有一个 [`RemoteInterface`]，其连接器通过父对象重新解析，
//! 特权进程重启后下一次调用会重新绑定。

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::bytes::ByteString;
use crate::config::WatchConfig;
use crate::error::{FsError, NativeSyscallError, RemoteFileSystemError, Result};
use crate::fs::{
    encode_path, Authority, ByteChannel, CopyOptions, DirectoryEntry, FileStore, FileSystemBackend,
    FileSystemProvider, OpenOptions, PosixFileAttributeView, PosixFileAttributes,
};
use crate::launcher::ServiceLauncher;
use crate::posix::FileTime;
use crate::watch::{lock, WatchEventKind, WatchKey, WatchQueue, WatchService};

use super::interface::{Liveness, RemoteInterface, RemoteObject};
use super::protocol::{Handle, Operation, Reply};
use super::transport::Transport;

type Stub = Arc<RemoteInterface<RemoteObject>>;

/// 对 `parent` 解析出的对象调用 `op` 得到的子对象，回复必须带新对象的句柄
fn child_interface<F>(parent: Stub, op: F) -> Stub
where
    F: Fn() -> Operation + Send + Sync + 'static,
{
    Arc::new(RemoteInterface::new(move || {
        let parent = parent.clone();
        let op = op();
        async move {
            let stub = parent.get().await?;
            let handle = stub.call(op).await?.into_handle()?;
            Ok(stub.with_handle(handle))
        }
        .boxed()
    }))
}

/// 在同步上下文中尽量释放已绑定的句柄
fn release_later(remote: &RemoteInterface<RemoteObject>) {
    let stub = match remote.peek() {
        Some(stub) if stub.is_alive() => stub,
        _ => return,
    };
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            if let Err(e) = stub.call(Operation::Release).await {
                debug!("releasing handle {} failed: {}", stub.handle().0, e);
            }
        });
    }
}

async fn call(remote: &RemoteInterface<RemoteObject>, op: Operation) -> Result<Reply> {
    let stub = remote.get().await?;
    Ok(stub.call(op).await?)
}

/// `root:///absolute/path`：在另一个进程中以特权访问本地文件系统
pub struct PrivilegedProvider {
    root: Stub,
    watch: WatchConfig,
}

impl PrivilegedProvider {
    pub fn new(root: Stub, watch: WatchConfig) -> Self {
        Self { root, watch }
    }

    /// 通过 `launcher` 绑定，首次使用及服务消失后都会重新启动
    pub fn with_launcher(launcher: Arc<ServiceLauncher>, watch: WatchConfig) -> Self {
        let root = Arc::new(RemoteInterface::new(move || {
            let launcher = launcher.clone();
            async move {
                let transport = launcher.launch().await?;
                Ok(RemoteObject::new(transport, Handle::ROOT))
            }
            .boxed()
        }));
        Self::new(root, watch)
    }

    /// 绑定到已连接的 transport
    pub fn with_transport(transport: Arc<dyn Transport>, watch: WatchConfig) -> Self {
        let root = Arc::new(RemoteInterface::new(move || {
            let stub = RemoteObject::new(transport.clone(), Handle::ROOT);
            async move { Ok(stub) }.boxed()
        }));
        Self::new(root, watch)
    }

    pub fn root(&self) -> &Stub {
        &self.root
    }

    /// 让特权端重新读取 `archive_uri` 处已打开的归档
    pub async fn refresh_archive(&self, archive_uri: &str) -> Result<()> {
        call(
            &self.root,
            Operation::RefreshArchive {
                archive: archive_uri.to_string(),
            },
        )
        .await?
        .into_unit()?;
        Ok(())
    }
}

impl fmt::Debug for PrivilegedProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivilegedProvider").field("root", &self.root).finish()
    }
}

#[async_trait]
impl FileSystemProvider for PrivilegedProvider {
    fn scheme(&self) -> &str {
        "root"
    }

    async fn new_file_system(&self, authority: &Authority) -> Result<Arc<dyn FileSystemBackend>> {
        if *authority != Authority::Local {
            return Err(FsError::InvalidPath(format!("root: does not take an authority: {}", authority)));
        }
        let fs = child_interface(self.root.clone(), || Operation::NewFileSystem {
            scheme: "file".to_string(),
            authority: Authority::Local,
        });
        // 立即绑定，启动失败直接反馈给调用方
        fs.get().await?;
        Ok(Arc::new(RemoteFileSystemBackend::new(fs, self.watch.clone())))
    }

    fn parse_uri(&self, rest: &str) -> Result<(Authority, ByteString)> {
        let path = rest.strip_prefix("//").unwrap_or(rest);
        if !path.starts_with('/') {
            return Err(FsError::InvalidPath(format!("root:{}", rest)));
        }
        Ok((Authority::Local, crate::fs::decode_path(path)))
    }

    fn format_uri(&self, _authority: &Authority, path: &[u8]) -> String {
        format!("root://{}", encode_path(path))
    }
}

/// 由特权进程提供的文件系统
pub struct RemoteFileSystemBackend {
    fs: Stub,
    watch: WatchConfig,
}

impl RemoteFileSystemBackend {
    pub fn new(fs: Stub, watch: WatchConfig) -> Self {
        Self { fs, watch }
    }

    async fn call(&self, op: Operation) -> Result<Reply> {
        call(&self.fs, op).await
    }

    async fn child(&self, op: impl Fn() -> Operation + Send + Sync + 'static) -> Result<Stub> {
        let remote = child_interface(self.fs.clone(), op);
        remote.get().await?;
        Ok(remote)
    }
}

impl fmt::Debug for RemoteFileSystemBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFileSystemBackend").field("fs", &self.fs).finish()
    }
}

#[async_trait]
impl FileSystemBackend for RemoteFileSystemBackend {
    async fn root_directory(&self) -> Result<ByteString> {
        Ok(self.call(Operation::GetRootDirectory).await?.into_path()?)
    }

    async fn read_attributes<'a>(&'a self, path: &'a [u8], follow_links: bool) -> Result<PosixFileAttributes> {
        let reply = self
            .call(Operation::ReadAttributes {
                path: path.into(),
                follow_links,
            })
            .await?;
        Ok(reply.into_attributes()?)
    }

    async fn create_directory<'a>(&'a self, path: &'a [u8], mode: u32) -> Result<()> {
        self.call(Operation::CreateDirectory { path: path.into(), mode })
            .await?
            .into_unit()?;
        Ok(())
    }

    async fn create_symbolic_link<'a>(&'a self, link: &'a [u8], target: &'a [u8]) -> Result<()> {
        self.call(Operation::CreateSymbolicLink {
            link: link.into(),
            target: target.into(),
        })
        .await?
        .into_unit()?;
        Ok(())
    }

    async fn delete<'a>(&'a self, path: &'a [u8]) -> Result<()> {
        self.call(Operation::Delete { path: path.into() }).await?.into_unit()?;
        Ok(())
    }

    async fn copy<'a>(&'a self, source: &'a [u8], target: &'a [u8], options: CopyOptions) -> Result<()> {
        self.call(Operation::Copy {
            source: source.into(),
            target: target.into(),
            options,
        })
        .await?
        .into_unit()?;
        Ok(())
    }

    async fn move_file<'a>(&'a self, source: &'a [u8], target: &'a [u8], options: CopyOptions) -> Result<()> {
        self.call(Operation::Move {
            source: source.into(),
            target: target.into(),
            options,
        })
        .await?
        .into_unit()?;
        Ok(())
    }

    async fn list_directory<'a>(&'a self, path: &'a [u8]) -> Result<Vec<DirectoryEntry>> {
        let reply = self.call(Operation::NewDirectoryStream { path: path.into() }).await?;
        Ok(reply.into_entries()?)
    }

    async fn open_byte_channel<'a>(&'a self, path: &'a [u8], options: OpenOptions) -> Result<Box<dyn ByteChannel>> {
        let channel = RemoteByteChannel::new(self.fs.clone(), ByteString::from(path), options);
        channel.remote.get().await?;
        Ok(Box::new(channel))
    }

    async fn file_stores(&self) -> Result<Vec<Arc<dyn FileStore>>> {
        let stub = self.fs.get().await?;
        let handles = stub.call(Operation::GetFileStores).await?.into_handles()?;
        let stores = handles
            .into_iter()
            .enumerate()
            .map(|(index, handle)| {
                let remote = Arc::new(file_store_by_index(self.fs.clone(), index));
                remote.bind(stub.with_handle(handle));
                Arc::new(RemoteFileStore { remote }) as Arc<dyn FileStore>
            })
            .collect();
        Ok(stores)
    }

    async fn file_store<'a>(&'a self, path: &'a [u8]) -> Result<Arc<dyn FileStore>> {
        let path = ByteString::from(path);
        let remote = self
            .child(move || Operation::GetFileStore { path: path.clone() })
            .await?;
        Ok(Arc::new(RemoteFileStore { remote }))
    }

    async fn attribute_view<'a>(&'a self, path: &'a [u8], follow_links: bool) -> Result<Arc<dyn PosixFileAttributeView>> {
        let path = ByteString::from(path);
        let remote = self
            .child(move || Operation::GetAttributeView {
                path: path.clone(),
                follow_links,
            })
            .await?;
        Ok(Arc::new(RemoteAttributeView { remote }))
    }

    async fn new_watch_service(&self) -> Result<Arc<dyn WatchService>> {
        let remote = self.child(|| Operation::NewWatchService).await?;
        Ok(Arc::new(RemoteWatchService::new(
            remote,
            self.watch.poll_interval(),
            self.watch.queue_capacity,
        )))
    }

    async fn close(&self) -> Result<()> {
        if let Some(stub) = self.fs.peek() {
            if stub.is_alive() {
                if let Err(e) = stub.call(Operation::Release).await {
                    debug!("releasing remote file system: {}", e);
                }
            }
        }
        self.fs.invalidate();
        Ok(())
    }
}

/// 重新解析父文件系统的第 `index` 个存储
fn file_store_by_index(fs: Stub, index: usize) -> RemoteInterface<RemoteObject> {
    RemoteInterface::new(move || {
        let fs = fs.clone();
        async move {
            let stub = fs.get().await?;
            let handles = stub.call(Operation::GetFileStores).await?.into_handles()?;
            let handle = handles.get(index).copied().ok_or_else(|| {
                RemoteFileSystemError::Protocol(format!("file store #{} no longer exists", index))
            })?;
            for other in handles.into_iter().filter(|h| *h != handle) {
                // 多余的句柄立即释放
                if let Err(e) = stub.with_handle(other).call(Operation::Release).await {
                    debug!("releasing file store handle {} failed: {}", other.0, e);
                }
            }
            Ok(stub.with_handle(handle))
        }
        .boxed()
    })
}

pub struct RemoteFileStore {
    remote: Stub,
}

impl RemoteFileStore {
    async fn number(&self, op: Operation) -> Result<u64> {
        Ok(call(&self.remote, op).await?.into_number()?)
    }

    async fn info(&self) -> Result<super::protocol::StoreInfo> {
        Ok(call(&self.remote, Operation::GetStoreInfo).await?.into_store_info()?)
    }
}

impl fmt::Debug for RemoteFileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFileStore").field("remote", &self.remote).finish()
    }
}

impl Drop for RemoteFileStore {
    fn drop(&mut self) {
        release_later(&self.remote);
    }
}

#[async_trait]
impl FileStore for RemoteFileStore {
    async fn name(&self) -> Result<String> {
        Ok(self.info().await?.name)
    }

    async fn kind(&self) -> Result<String> {
        Ok(self.info().await?.kind)
    }

    async fn is_read_only(&self) -> Result<bool> {
        Ok(self.info().await?.read_only)
    }

    async fn total_space(&self) -> Result<u64> {
        self.number(Operation::GetTotalSpace).await
    }

    async fn usable_space(&self) -> Result<u64> {
        self.number(Operation::GetUsableSpace).await
    }

    async fn unallocated_space(&self) -> Result<u64> {
        self.number(Operation::GetUnallocatedSpace).await
    }

    async fn block_size(&self) -> Result<u64> {
        self.number(Operation::GetBlockSize).await
    }
}

pub struct RemoteAttributeView {
    remote: Stub,
}

impl RemoteAttributeView {
    async fn unit(&self, op: Operation) -> Result<()> {
        call(&self.remote, op).await?.into_unit()?;
        Ok(())
    }
}

impl fmt::Debug for RemoteAttributeView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAttributeView").field("remote", &self.remote).finish()
    }
}

impl Drop for RemoteAttributeView {
    fn drop(&mut self) {
        release_later(&self.remote);
    }
}

#[async_trait]
impl PosixFileAttributeView for RemoteAttributeView {
    async fn read_attributes(&self) -> Result<PosixFileAttributes> {
        Ok(call(&self.remote, Operation::ReadViewAttributes).await?.into_attributes()?)
    }

    async fn set_mode(&self, mode: u32) -> Result<()> {
        self.unit(Operation::SetMode { mode }).await
    }

    async fn set_owner(&self, uid: u32) -> Result<()> {
        self.unit(Operation::SetOwner { uid }).await
    }

    async fn set_group(&self, gid: u32) -> Result<()> {
        self.unit(Operation::SetGroup { gid }).await
    }

    async fn set_times(&self, last_modified: Option<FileTime>, last_access: Option<FileTime>) -> Result<()> {
        self.unit(Operation::SetTimes {
            last_modified,
            last_access,
        })
        .await
    }
}

/// 特权端的字节通道。重连后不截断地重新打开文件，并恢复到最后的位置
pub struct RemoteByteChannel {
    remote: Stub,
    position: Arc<AtomicU64>,
    append: bool,
    closed: AtomicBool,
}

impl RemoteByteChannel {
    fn new(fs: Stub, path: ByteString, options: OpenOptions) -> Self {
        let position = Arc::new(AtomicU64::new(0));
        let reopened = AtomicBool::new(false);
        let restore = position.clone();
        let remote = Arc::new(RemoteInterface::new(move || {
            let fs = fs.clone();
            let path = path.clone();
            let position = restore.load(Ordering::SeqCst);
            let mut options = options;
            if reopened.swap(true, Ordering::SeqCst) {
                options.truncate = false;
                options.create_new = false;
            }
            async move {
                let stub = fs.get().await?;
                let handle = stub
                    .call(Operation::NewByteChannel { path, options })
                    .await?
                    .into_handle()?;
                let channel = stub.with_handle(handle);
                if position > 0 && !options.append {
                    channel.call(Operation::Seek { position }).await?.into_unit()?;
                }
                Ok(channel)
            }
            .boxed()
        }));
        Self {
            remote,
            position,
            append: options.append,
            closed: AtomicBool::new(false),
        }
    }

    async fn stub(&self, syscall: &'static str) -> Result<RemoteObject> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NativeSyscallError::new(libc::EBADF, syscall).into());
        }
        Ok(self.remote.get().await?)
    }
}

impl fmt::Debug for RemoteByteChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteByteChannel")
            .field("position", &self.position.load(Ordering::SeqCst))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for RemoteByteChannel {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            release_later(&self.remote);
        }
    }
}

#[async_trait]
impl ByteChannel for RemoteByteChannel {
    async fn read(&self, len: usize) -> Result<Vec<u8>> {
        let data = self
            .stub("read")
            .await?
            .call(Operation::Read { len })
            .await?
            .into_bytes()?;
        self.position.fetch_add(data.len() as u64, Ordering::SeqCst);
        Ok(data.into_vec())
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        let stub = self.stub("write").await?;
        let written = stub
            .call(Operation::Write { data: data.into() })
            .await?
            .into_number()?;
        if self.append {
            let position = stub.call(Operation::Position).await?.into_number()?;
            self.position.store(position, Ordering::SeqCst);
        } else {
            self.position.fetch_add(written, Ordering::SeqCst);
        }
        Ok(written as usize)
    }

    async fn position(&self) -> Result<u64> {
        let position = self
            .stub("lseek")
            .await?
            .call(Operation::Position)
            .await?
            .into_number()?;
        self.position.store(position, Ordering::SeqCst);
        Ok(position)
    }

    async fn seek(&self, position: u64) -> Result<()> {
        self.stub("lseek")
            .await?
            .call(Operation::Seek { position })
            .await?
            .into_unit()?;
        self.position.store(position, Ordering::SeqCst);
        Ok(())
    }

    async fn size(&self) -> Result<u64> {
        Ok(self
            .stub("fstat")
            .await?
            .call(Operation::Size)
            .await?
            .into_number()?)
    }

    async fn truncate(&self, size: u64) -> Result<()> {
        self.stub("ftruncate")
            .await?
            .call(Operation::Truncate { size })
            .await?
            .into_unit()?;
        self.position.fetch_min(size, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(stub) = self.remote.peek() {
            if stub.is_alive() {
                stub.call(Operation::Release).await?.into_unit()?;
            }
        }
        self.remote.invalidate();
        Ok(())
    }
}

/// 特权端的监听服务。每次注册对应一个本地 key，按固定间隔取走远端 key 的事件
pub struct RemoteWatchService {
    remote: Stub,
    interval: Duration,
    capacity: usize,
    queue: Arc<WatchQueue>,
    keys: Mutex<Vec<WatchKey>>,
    open: AtomicBool,
}

impl RemoteWatchService {
    pub fn new(remote: Stub, interval: Duration, capacity: usize) -> Self {
        Self {
            remote,
            interval,
            capacity,
            queue: WatchQueue::new(),
            keys: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        }
    }
}

impl fmt::Debug for RemoteWatchService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteWatchService")
            .field("interval", &self.interval)
            .field("keys", &lock(&self.keys).len())
            .field("open", &self.is_open())
            .finish()
    }
}

#[async_trait]
impl WatchService for RemoteWatchService {
    async fn register(&self, path: &[u8], kinds: &[WatchEventKind]) -> Result<WatchKey> {
        if !self.is_open() {
            return Err(FsError::ClosedWatchService);
        }
        let service = self.remote.get().await?;
        let handle = service
            .call(Operation::Register {
                path: path.into(),
                kinds: kinds.to_vec(),
            })
            .await?
            .into_handle()?;
        let remote_key = service.with_handle(handle);

        let key = WatchKey::new(ByteString::from(path), kinds, self.capacity, &self.queue);
        let task_key = key.clone();
        let task_remote = remote_key.clone();
        let interval = self.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !task_key.is_valid() {
                    break;
                }
                let drained = match task_remote.call(Operation::PollEvents).await {
                    Ok(reply) => reply.into_events(),
                    Err(e) => Err(e),
                };
                match drained {
                    Ok((true, events)) => {
                        for event in events {
                            task_key.signal(event);
                        }
                    }
                    Ok((false, _)) => {
                        debug!("remote watch key {} cancelled", task_key.path());
                        task_key.cancel();
                        break;
                    }
                    Err(e) => {
                        warn!("remote watch on {} lost: {}", task_key.path(), e);
                        task_key.cancel();
                        break;
                    }
                }
            }
        });

        let abort = task.abort_handle();
        key.set_cancel_hook(move || {
            abort.abort();
            if !remote_key.is_alive() {
                return;
            }
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(e) = remote_key.call(Operation::CancelKey).await {
                        warn!("cancelling remote watch key {} failed: {}", remote_key.handle().0, e);
                    }
                    if let Err(e) = remote_key.call(Operation::Release).await {
                        debug!("releasing remote watch key {} failed: {}", remote_key.handle().0, e);
                    }
                });
            }
        });

        lock(&self.keys).push(key.clone());
        debug!("remote watch registered: {}", key.path());
        Ok(key)
    }

    fn poll(&self) -> Option<WatchKey> {
        self.queue.poll()
    }

    async fn take(&self) -> Result<WatchKey> {
        self.queue.take().await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let keys: Vec<WatchKey> = lock(&self.keys).drain(..).collect();
        for key in keys {
            key.cancel();
        }
        self.queue.close();
        if let Some(stub) = self.remote.peek() {
            if stub.is_alive() {
                if let Err(e) = stub.call(Operation::Release).await {
                    debug!("releasing remote watch service: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::FaultKind;
    use crate::registry::Registry;
    use crate::remote::InProcessTransport;
    use crate::service::RootFileService;
    use std::os::unix::ffi::OsStrExt;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn fast_watch() -> WatchConfig {
        WatchConfig {
            poll_interval_ms: 50,
            ..WatchConfig::default()
        }
    }

    fn in_process() -> Arc<InProcessTransport> {
        let service = RootFileService::new(Registry::with_defaults(Config::default()), "1.0");
        InProcessTransport::new(Arc::new(service))
    }

    /// `root` provider 每次连接都新建进程内服务，返回连接计数和最新的 transport
    fn restartable() -> (Arc<Registry>, Arc<AtomicUsize>, Arc<Mutex<Option<Arc<InProcessTransport>>>>) {
        let connects = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(Mutex::new(None));
        let root = {
            let connects = connects.clone();
            let current = current.clone();
            Arc::new(RemoteInterface::new(move || {
                connects.fetch_add(1, Ordering::SeqCst);
                let transport = in_process();
                *lock(&current) = Some(transport.clone());
                async move { Ok(RemoteObject::new(transport, Handle::ROOT)) }.boxed()
            }))
        };
        let registry = Registry::with_defaults(Config::default());
        registry
            .register(Arc::new(PrivilegedProvider::new(root, fast_watch())))
            .unwrap();
        (registry, connects, current)
    }

    fn uri(path: &std::path::Path) -> String {
        format!("root://{}", encode_path(path.as_os_str().as_bytes()))
    }

    #[tokio::test]
    async fn test_missing_file_is_remote_enoent() {
        let registry = Registry::with_defaults(Config::default());
        registry
            .register(Arc::new(PrivilegedProvider::with_transport(in_process(), fast_watch())))
            .unwrap();

        let err = registry
            .parse_path("root:///data/missing")
            .await
            .unwrap()
            .read_attributes(true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FsError::Remote(RemoteFileSystemError::Fault(ref fault))
                if fault.kind == FaultKind::Syscall { errno: libc::ENOENT }
        ));
        assert_eq!(err.errno(), Some(libc::ENOENT));
    }

    #[tokio::test]
    async fn test_file_operations_through_service() {
        let temp_dir = TempDir::new().unwrap();
        let (registry, _, _) = restartable();
        let dir = registry.parse_path(&uri(temp_dir.path())).await.unwrap();
        assert_eq!(dir.to_uri_string(), uri(temp_dir.path()));

        let sub = dir.join(b"sub");
        sub.create_directory(0o755).await.unwrap();
        let file = sub.join(b"data.bin");
        file.write_all(b"privileged bytes").await.unwrap();
        assert_eq!(file.read_all().await.unwrap(), b"privileged bytes");
        assert_eq!(std::fs::read(temp_dir.path().join("sub/data.bin")).unwrap(), b"privileged bytes");

        let names: Vec<_> = sub.read_dir().await.unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec![ByteString::from("data.bin")]);

        let view = file.attribute_view(true).await.unwrap();
        view.set_mode(0o600).await.unwrap();
        assert_eq!(view.read_attributes().await.unwrap().permissions(), 0o600);

        let store = file.file_store().await.unwrap();
        assert!(store.total_space().await.unwrap() > 0);

        file.delete().await.unwrap();
        assert!(!file.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_reconnects_once_after_service_death() {
        let temp_dir = TempDir::new().unwrap();
        let (registry, connects, current) = restartable();
        let dir = registry.parse_path(&uri(temp_dir.path())).await.unwrap();
        dir.read_attributes(true).await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        let dead = lock(&current).clone().unwrap();
        dead.disconnect();

        assert!(dir.read_attributes(true).await.unwrap().is_directory());
        assert!(dir.read_dir().await.unwrap().is_empty());
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_channel_survives_reconnect() {
        let temp_dir = TempDir::new().unwrap();
        let (registry, _, current) = restartable();
        let file = registry
            .parse_path(&uri(&temp_dir.path().join("log")))
            .await
            .unwrap();

        let channel = file.open_byte_channel(OpenOptions::write()).await.unwrap();
        channel.write(b"hello").await.unwrap();
        lock(&current).clone().unwrap().disconnect();

        channel.write(b" world").await.unwrap();
        assert_eq!(channel.position().await.unwrap(), 11);
        channel.close().await.unwrap();
        assert_eq!(std::fs::read(temp_dir.path().join("log")).unwrap(), b"hello world");

        let err = channel.read(1).await.unwrap_err();
        assert_eq!(err.errno(), Some(libc::EBADF));
    }

    #[tokio::test]
    async fn test_remote_watch_delivers_events() {
        let temp_dir = TempDir::new().unwrap();
        let (registry, _, current) = restartable();
        let dir = registry.parse_path(&uri(temp_dir.path())).await.unwrap();
        let service = dir.file_system().new_watch_service().await.unwrap();
        let key = dir.register(service.as_ref(), &WatchEventKind::ALL).await.unwrap();

        std::fs::write(temp_dir.path().join("fresh"), b"x").unwrap();
        let signalled = tokio::time::timeout(Duration::from_secs(5), service.take())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signalled, key);
        let events = key.poll_events();
        assert!(events
            .iter()
            .any(|e| e.kind == WatchEventKind::Create && e.name == Some(ByteString::from("fresh"))));

        // 特权进程退出后本地 key 失效
        lock(&current).clone().unwrap().disconnect();
        for _ in 0..100 {
            if !key.is_valid() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!key.is_valid());
        service.close().await;
    }

    #[tokio::test]
    async fn test_rejects_foreign_authority() {
        let provider = PrivilegedProvider::with_transport(in_process(), fast_watch());
        let err = provider
            .new_file_system(&Authority::network("host", 22, None))
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::InvalidPath(_)));
        assert!(provider.parse_uri("relative").is_err());
        provider.refresh_archive("file:///nothing.tar").await.unwrap();
    }
}
