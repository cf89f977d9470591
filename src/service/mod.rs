//! 特权端：存活对象的句柄表，以及对其执行 [`Request`] 的分发函数

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{FaultKind, FsError, RemoteFault};
use crate::fs::{Authority, ByteChannel, FileStore, FileSystem, PosixFileAttributeView, MAX_READ_LEN};
use crate::registry::Registry;
use crate::remote::{
    encode_frame, read_frame, Handle, Operation, Reply, Request, Response, StoreInfo, MAX_FRAME_LEN,
};
use crate::watch::{lock, WatchKey, WatchService};

type Outcome = std::result::Result<Reply, RemoteFault>;

#[derive(Clone)]
enum Object {
    FileSystem(Arc<FileSystem>),
    FileStore(Arc<dyn FileStore>),
    AttributeView(Arc<dyn PosixFileAttributeView>),
    WatchService(Arc<dyn WatchService>),
    WatchKey(WatchKey),
    ByteChannel(Arc<dyn ByteChannel>),
}

impl Object {
    fn kind(&self) -> &'static str {
        match self {
            Object::FileSystem(_) => "file system",
            Object::FileStore(_) => "file store",
            Object::AttributeView(_) => "attribute view",
            Object::WatchService(_) => "watch service",
            Object::WatchKey(_) => "watch key",
            Object::ByteChannel(_) => "byte channel",
        }
    }

    async fn release(self) {
        match self {
            Object::ByteChannel(channel) => {
                if let Err(e) = channel.close().await {
                    debug!("closing released channel: {}", e);
                }
            }
            Object::WatchService(service) => service.close().await,
            Object::WatchKey(key) => key.cancel(),
            _ => {}
        }
    }
}

fn invalid_handle(handle: Handle, expected: &str) -> RemoteFault {
    RemoteFault::new(
        FaultKind::InvalidHandle,
        format!("handle {} is not a live {}", handle.0, expected),
    )
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 单个客户端连接的服务端对象表
pub struct RootFileService {
    registry: Arc<Registry>,
    version: String,
    objects: Mutex<HashMap<Handle, Object>>,
    // 同一个 FileSystem 始终对应同一个句柄
    file_systems: Mutex<HashMap<Uuid, Handle>>,
    next_handle: AtomicU64,
}

impl RootFileService {
    pub fn new(registry: Arc<Registry>, version: impl Into<String>) -> Self {
        Self {
            registry,
            version: version.into(),
            objects: Mutex::new(HashMap::new()),
            file_systems: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn live_handles(&self) -> usize {
        lock(&self.objects).len()
    }

    fn insert(&self, object: Object) -> Handle {
        let handle = Handle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        lock(&self.objects).insert(handle, object);
        handle
    }

    fn file_system_handle(&self, fs: Arc<FileSystem>) -> Handle {
        let mut handles = lock(&self.file_systems);
        if let Some(handle) = handles.get(&fs.id()) {
            if lock(&self.objects).contains_key(handle) {
                return *handle;
            }
        }
        let id = fs.id();
        let handle = self.insert(Object::FileSystem(fs));
        handles.insert(id, handle);
        handle
    }

    fn object(&self, handle: Handle) -> Option<Object> {
        lock(&self.objects).get(&handle).cloned()
    }

    fn file_system(&self, handle: Handle) -> std::result::Result<Arc<FileSystem>, RemoteFault> {
        match self.object(handle) {
            Some(Object::FileSystem(fs)) => Ok(fs),
            _ => Err(invalid_handle(handle, "file system")),
        }
    }

    /// 执行一个请求，错误和 panic 都转为 [`RemoteFault`]
    pub async fn dispatch(&self, request: Request) -> Response {
        let name = request.op.name();
        debug!("dispatch {} on handle {}", name, request.handle.0);
        let outcome = AssertUnwindSafe(self.execute(request.handle, request.op))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("{} panicked: {}", name, message);
                Err(RemoteFault::new(FaultKind::Panic, message))
            }
        };
        if let Err(fault) = &result {
            debug!("{} failed: {}", name, fault);
        }
        Response {
            id: request.id,
            result,
        }
    }

    async fn execute(&self, handle: Handle, op: Operation) -> Outcome {
        match op {
            Operation::Hello { version } => {
                if version != self.version {
                    warn!("client version {} differs from {}", version, self.version);
                }
                Ok(Reply::Hello {
                    version: self.version.clone(),
                })
            }
            Operation::NewFileSystem { scheme, authority } => {
                let fs = self.registry.get_or_create_file_system(&scheme, &authority).await?;
                Ok(Reply::Handle(self.file_system_handle(fs)))
            }
            Operation::GetFileSystem { scheme, authority } => {
                let fs = self.registry.get_file_system(&scheme, &authority)?;
                Ok(Reply::Handle(self.file_system_handle(fs)))
            }
            Operation::RefreshArchive { archive } => {
                match self.registry.get_file_system("archive", &Authority::archive(archive)) {
                    Ok(fs) => fs.refresh().await?,
                    Err(FsError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(Reply::Unit)
            }
            Operation::Release => {
                let object = lock(&self.objects).remove(&handle);
                match object {
                    Some(object) => {
                        if let Object::FileSystem(fs) = &object {
                            lock(&self.file_systems).remove(&fs.id());
                        }
                        object.release().await;
                        Ok(Reply::Unit)
                    }
                    None => Err(invalid_handle(handle, "object")),
                }
            }
            op => self.execute_on_object(handle, op).await,
        }
    }

    async fn execute_on_object(&self, handle: Handle, op: Operation) -> Outcome {
        let object = self.object(handle).ok_or_else(|| invalid_handle(handle, "object"))?;
        match object {
            Object::FileSystem(fs) => self.execute_file_system(&fs, op).await,
            Object::FileStore(store) => execute_file_store(store.as_ref(), op).await,
            Object::AttributeView(view) => execute_attribute_view(view.as_ref(), op).await,
            Object::WatchService(service) => match op {
                Operation::Register { path, kinds } => {
                    let key = service.register(&path, &kinds).await?;
                    Ok(Reply::Handle(self.insert(Object::WatchKey(key))))
                }
                other => Err(unsupported(&other, "watch service")),
            },
            Object::WatchKey(key) => match op {
                Operation::PollEvents => {
                    let events = key.poll_events();
                    Ok(Reply::Events {
                        valid: key.is_valid(),
                        events,
                    })
                }
                Operation::CancelKey => {
                    key.cancel();
                    Ok(Reply::Unit)
                }
                other => Err(unsupported(&other, "watch key")),
            },
            Object::ByteChannel(channel) => execute_byte_channel(channel.as_ref(), op).await,
        }
    }

    async fn execute_file_system(&self, fs: &Arc<FileSystem>, op: Operation) -> Outcome {
        let backend = fs.backend()?;
        match op {
            Operation::GetRootDirectory => Ok(Reply::Path(backend.root_directory().await?)),
            Operation::GetFileStores => {
                let stores = backend.file_stores().await?;
                let handles = stores
                    .into_iter()
                    .map(|store| self.insert(Object::FileStore(store)))
                    .collect();
                Ok(Reply::Handles(handles))
            }
            Operation::GetFileStore { path } => {
                let store = backend.file_store(&path).await?;
                Ok(Reply::Handle(self.insert(Object::FileStore(store))))
            }
            Operation::ReadAttributes { path, follow_links } => {
                Ok(Reply::Attributes(backend.read_attributes(&path, follow_links).await?))
            }
            Operation::CreateDirectory { path, mode } => {
                backend.create_directory(&path, mode).await?;
                Ok(Reply::Unit)
            }
            Operation::CreateSymbolicLink { link, target } => {
                backend.create_symbolic_link(&link, &target).await?;
                Ok(Reply::Unit)
            }
            Operation::Delete { path } => {
                backend.delete(&path).await?;
                Ok(Reply::Unit)
            }
            Operation::Copy { source, target, options } => {
                backend.copy(&source, &target, options).await?;
                Ok(Reply::Unit)
            }
            Operation::Move { source, target, options } => {
                backend.move_file(&source, &target, options).await?;
                Ok(Reply::Unit)
            }
            Operation::NewDirectoryStream { path } => Ok(Reply::Entries(backend.list_directory(&path).await?)),
            Operation::NewWatchService => {
                let service = fs.new_watch_service().await?;
                Ok(Reply::Handle(self.insert(Object::WatchService(service))))
            }
            Operation::NewByteChannel { path, options } => {
                let channel: Arc<dyn ByteChannel> = Arc::from(backend.open_byte_channel(&path, options).await?);
                Ok(Reply::Handle(self.insert(Object::ByteChannel(channel))))
            }
            Operation::GetAttributeView { path, follow_links } => {
                let view = backend.attribute_view(&path, follow_links).await?;
                Ok(Reply::Handle(self.insert(Object::AttributeView(view))))
            }
            other => Err(unsupported(&other, "file system")),
        }
    }

    /// 释放所有句柄，关闭通道和监听服务
    pub async fn release_all(&self) {
        let objects: Vec<Object> = lock(&self.objects).drain().map(|(_, object)| object).collect();
        lock(&self.file_systems).clear();
        if !objects.is_empty() {
            info!("releasing {} handles", objects.len());
        }
        for object in objects {
            object.release().await;
        }
    }

    /// 处理分帧请求直到对端断开。请求并发执行，完成即写回响应
    pub async fn serve<R, W>(self: Arc<Self>, mut reader: R, writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        loop {
            let request: Request = match read_frame(&mut reader).await {
                Ok(Some(request)) => request,
                Ok(None) => {
                    info!("client disconnected");
                    break;
                }
                Err(e) => {
                    warn!("bad frame from client: {}", e);
                    break;
                }
            };
            let service = self.clone();
            let writer = writer.clone();
            tokio::spawn(async move {
                let response = service.dispatch(request).await;
                let id = response.id;
                let frame = match response_frame(&response, MAX_FRAME_LEN) {
                    Some(frame) => frame,
                    None => return,
                };
                let mut writer = writer.lock().await;
                let written = match writer.write_all(&frame).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    warn!("writing response {} failed: {}", id, e);
                }
            });
        }
        self.release_all().await;
    }
}

impl fmt::Debug for RootFileService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootFileService")
            .field("version", &self.version)
            .field("handles", &self.live_handles())
            .finish()
    }
}

/// 编码 `response`。无法成帧的回复改为同一 id 的故障响应，调用方不会一直等待
fn response_frame(response: &Response, limit: usize) -> Option<Vec<u8>> {
    let e = match encode_frame(response, limit) {
        Ok(frame) => return Some(frame),
        Err(e) => e,
    };
    warn!("response {} cannot be sent: {}", response.id, e);
    let fault = Response {
        id: response.id,
        result: Err(RemoteFault::new(FaultKind::Other, format!("response too large: {}", e))),
    };
    match encode_frame(&fault, limit) {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!("fault for response {} cannot be sent: {}", response.id, e);
            None
        }
    }
}

fn unsupported(op: &Operation, target: &str) -> RemoteFault {
    RemoteFault::new(
        FaultKind::InvalidArgument,
        format!("{} is not supported on a {}", op.name(), target),
    )
}

async fn execute_file_store(store: &dyn FileStore, op: Operation) -> Outcome {
    match op {
        Operation::GetStoreInfo => Ok(Reply::StoreInfo(StoreInfo {
            name: store.name().await?,
            kind: store.kind().await?,
            read_only: store.is_read_only().await?,
        })),
        Operation::GetTotalSpace => Ok(Reply::Number(store.total_space().await?)),
        Operation::GetUsableSpace => Ok(Reply::Number(store.usable_space().await?)),
        Operation::GetUnallocatedSpace => Ok(Reply::Number(store.unallocated_space().await?)),
        Operation::GetBlockSize => Ok(Reply::Number(store.block_size().await?)),
        other => Err(unsupported(&other, "file store")),
    }
}

async fn execute_attribute_view(view: &dyn PosixFileAttributeView, op: Operation) -> Outcome {
    match op {
        Operation::ReadViewAttributes => Ok(Reply::Attributes(view.read_attributes().await?)),
        Operation::SetMode { mode } => {
            view.set_mode(mode).await?;
            Ok(Reply::Unit)
        }
        Operation::SetOwner { uid } => {
            view.set_owner(uid).await?;
            Ok(Reply::Unit)
        }
        Operation::SetGroup { gid } => {
            view.set_group(gid).await?;
            Ok(Reply::Unit)
        }
        Operation::SetTimes { last_modified, last_access } => {
            view.set_times(last_modified, last_access).await?;
            Ok(Reply::Unit)
        }
        other => Err(unsupported(&other, "attribute view")),
    }
}

async fn execute_byte_channel(channel: &dyn ByteChannel, op: Operation) -> Outcome {
    match op {
        Operation::Read { len } => Ok(Reply::Bytes(channel.read(len.min(MAX_READ_LEN)).await?.into())),
        Operation::Write { data } => Ok(Reply::Number(channel.write(&data).await? as u64)),
        Operation::Position => Ok(Reply::Number(channel.position().await?)),
        Operation::Seek { position } => {
            channel.seek(position).await?;
            Ok(Reply::Unit)
        }
        Operation::Size => Ok(Reply::Number(channel.size().await?)),
        Operation::Truncate { size } => {
            channel.truncate(size).await?;
            Ok(Reply::Unit)
        }
        other => Err(unsupported(&other, "byte channel")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fs::OpenOptions;
    use crate::remote::{StreamTransport, Transport};
    use crate::watch::WatchEventKind;
    use std::os::unix::ffi::OsStrExt;
    use tempfile::TempDir;

    fn service() -> RootFileService {
        RootFileService::new(Registry::with_defaults(Config::default()), "1.0")
    }

    async fn call(service: &RootFileService, handle: Handle, op: Operation) -> Outcome {
        service
            .dispatch(Request { id: 1, handle, op })
            .await
            .result
    }

    async fn local(service: &RootFileService) -> Handle {
        call(
            service,
            Handle::ROOT,
            Operation::NewFileSystem {
                scheme: "file".into(),
                authority: Authority::Local,
            },
        )
        .await
        .unwrap()
        .into_handle()
        .unwrap()
    }

    #[tokio::test]
    async fn test_file_system_handle_identity() {
        let service = service();
        let a = local(&service).await;
        let b = local(&service).await;
        assert_eq!(a, b);
        let c = call(
            &service,
            Handle::ROOT,
            Operation::GetFileSystem {
                scheme: "file".into(),
                authority: Authority::Local,
            },
        )
        .await
        .unwrap()
        .into_handle()
        .unwrap();
        assert_eq!(a, c);
    }

    #[tokio::test]
    async fn test_faults_are_classified() {
        let service = service();
        let fs = local(&service).await;

        let fault = call(
            &service,
            fs,
            Operation::ReadAttributes {
                path: "/data/missing".into(),
                follow_links: true,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(fault.kind, FaultKind::Syscall { errno: libc::ENOENT });

        let fault = call(
            &service,
            Handle::ROOT,
            Operation::NewFileSystem {
                scheme: "gopher".into(),
                authority: Authority::Local,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(fault.kind, FaultKind::UnsupportedScheme);

        let fault = call(&service, Handle(999), Operation::Size).await.unwrap_err();
        assert_eq!(fault.kind, FaultKind::InvalidHandle);

        let fault = call(&service, fs, Operation::PollEvents).await.unwrap_err();
        assert_eq!(fault.kind, FaultKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_byte_channel_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("f");
        let service = service();
        let fs = local(&service).await;

        let channel = call(
            &service,
            fs,
            Operation::NewByteChannel {
                path: file.as_os_str().as_bytes().into(),
                options: OpenOptions::write(),
            },
        )
        .await
        .unwrap()
        .into_handle()
        .unwrap();
        let written = call(&service, channel, Operation::Write { data: "abc".into() })
            .await
            .unwrap()
            .into_number()
            .unwrap();
        assert_eq!(written, 3);
        assert_eq!(call(&service, channel, Operation::Size).await.unwrap(), Reply::Number(3));

        call(&service, channel, Operation::Release).await.unwrap();
        let fault = call(&service, channel, Operation::Size).await.unwrap_err();
        assert_eq!(fault.kind, FaultKind::InvalidHandle);
        assert_eq!(std::fs::read(&file).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_watch_through_handles() {
        let temp_dir = TempDir::new().unwrap();
        let service = service();
        let fs = local(&service).await;
        let watcher = call(&service, fs, Operation::NewWatchService)
            .await
            .unwrap()
            .into_handle()
            .unwrap();
        let key = call(
            &service,
            watcher,
            Operation::Register {
                path: temp_dir.path().as_os_str().as_bytes().into(),
                kinds: WatchEventKind::ALL.to_vec(),
            },
        )
        .await
        .unwrap()
        .into_handle()
        .unwrap();

        std::fs::write(temp_dir.path().join("new"), b"").unwrap();
        let mut events = Vec::new();
        for _ in 0..100 {
            let (valid, batch) = call(&service, key, Operation::PollEvents)
                .await
                .unwrap()
                .into_events()
                .unwrap();
            assert!(valid);
            events.extend(batch);
            if !events.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(events[0].kind, WatchEventKind::Create);

        call(&service, key, Operation::CancelKey).await.unwrap();
        let (valid, _) = call(&service, key, Operation::PollEvents)
            .await
            .unwrap()
            .into_events()
            .unwrap();
        assert!(!valid);
    }

    #[tokio::test]
    async fn test_release_all() {
        let service = service();
        local(&service).await;
        assert_eq!(service.live_handles(), 1);
        service.release_all().await;
        assert_eq!(service.live_handles(), 0);
    }

    #[test]
    fn test_unframeable_response_becomes_fault() {
        let response = Response {
            id: 9,
            result: Ok(Reply::Bytes(vec![0xffu8; 4096].into())),
        };
        let frame = response_frame(&response, 1024).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        let got: Response = serde_json::from_slice(&frame[4..]).unwrap();
        assert_eq!(got.id, 9);
        assert_eq!(got.result.unwrap_err().kind, FaultKind::Other);
    }

    #[tokio::test]
    async fn test_huge_read_over_stream() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("big");
        std::fs::write(&file, vec![0xffu8; MAX_READ_LEN * 3]).unwrap();

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        tokio::spawn(Arc::new(service()).serve(server_read, server_write));
        let (client_read, client_write) = tokio::io::split(client);
        let transport = StreamTransport::new(client_read, client_write);

        let fs = transport
            .call(
                Handle::ROOT,
                Operation::NewFileSystem {
                    scheme: "file".into(),
                    authority: Authority::Local,
                },
            )
            .await
            .unwrap()
            .into_handle()
            .unwrap();
        let channel = transport
            .call(
                fs,
                Operation::NewByteChannel {
                    path: file.as_os_str().as_bytes().into(),
                    options: OpenOptions::read(),
                },
            )
            .await
            .unwrap()
            .into_handle()
            .unwrap();

        // 请求长度远超帧上限，服务端按上限截断
        let data = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            transport.call(channel, Operation::Read { len: 17_000_000 }),
        )
        .await
        .unwrap()
        .unwrap()
        .into_bytes()
        .unwrap();
        assert_eq!(data.len(), MAX_READ_LEN);
        assert!(transport.is_alive());
        let position = transport.call(channel, Operation::Position).await.unwrap();
        assert_eq!(position, Reply::Number(MAX_READ_LEN as u64));
    }
}
