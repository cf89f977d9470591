//! 非特权客户端与特权服务之间的线路格式
//!
//! 每帧为 4 字节大端长度加一个 JSON 文档

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bytes::ByteString;
use crate::error::{RemoteFault, RemoteFileSystemError};
use crate::fs::{Authority, CopyOptions, DirectoryEntry, OpenOptions, PosixFileAttributes};
use crate::posix::FileTime;
use crate::watch::{WatchEvent, WatchEventKind};

pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// 服务句柄表中的一个对象
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub u64);

impl Handle {
    /// 服务本身
    pub const ROOT: Handle = Handle(0);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    // 服务
    Hello { version: String },
    NewFileSystem { scheme: String, authority: Authority },
    GetFileSystem { scheme: String, authority: Authority },
    RefreshArchive { archive: String },

    // 文件系统
    GetRootDirectory,
    GetFileStores,
    GetFileStore { path: ByteString },
    ReadAttributes { path: ByteString, follow_links: bool },
    CreateDirectory { path: ByteString, mode: u32 },
    CreateSymbolicLink { link: ByteString, target: ByteString },
    Delete { path: ByteString },
    Copy { source: ByteString, target: ByteString, options: CopyOptions },
    Move { source: ByteString, target: ByteString, options: CopyOptions },
    NewDirectoryStream { path: ByteString },
    NewWatchService,
    NewByteChannel { path: ByteString, options: OpenOptions },
    GetAttributeView { path: ByteString, follow_links: bool },

    // 存储
    GetStoreInfo,
    GetTotalSpace,
    GetUsableSpace,
    GetUnallocatedSpace,
    GetBlockSize,

    // 属性视图
    ReadViewAttributes,
    SetMode { mode: u32 },
    SetOwner { uid: u32 },
    SetGroup { gid: u32 },
    SetTimes { last_modified: Option<FileTime>, last_access: Option<FileTime> },

    // 监听服务 / key
    Register { path: ByteString, kinds: Vec<WatchEventKind> },
    PollEvents,
    CancelKey,

    // 字节通道
    Read { len: usize },
    Write { data: ByteString },
    Position,
    Seek { position: u64 },
    Size,
    Truncate { size: u64 },

    Release,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Hello { .. } => "hello",
            Operation::NewFileSystem { .. } => "new_file_system",
            Operation::GetFileSystem { .. } => "get_file_system",
            Operation::RefreshArchive { .. } => "refresh_archive",
            Operation::GetRootDirectory => "get_root_directory",
            Operation::GetFileStores => "get_file_stores",
            Operation::GetFileStore { .. } => "get_file_store",
            Operation::ReadAttributes { .. } => "read_attributes",
            Operation::CreateDirectory { .. } => "create_directory",
            Operation::CreateSymbolicLink { .. } => "create_symbolic_link",
            Operation::Delete { .. } => "delete",
            Operation::Copy { .. } => "copy",
            Operation::Move { .. } => "move",
            Operation::NewDirectoryStream { .. } => "new_directory_stream",
            Operation::NewWatchService => "new_watch_service",
            Operation::NewByteChannel { .. } => "new_byte_channel",
            Operation::GetAttributeView { .. } => "get_attribute_view",
            Operation::GetStoreInfo => "get_store_info",
            Operation::GetTotalSpace => "get_total_space",
            Operation::GetUsableSpace => "get_usable_space",
            Operation::GetUnallocatedSpace => "get_unallocated_space",
            Operation::GetBlockSize => "get_block_size",
            Operation::ReadViewAttributes => "read_view_attributes",
            Operation::SetMode { .. } => "set_mode",
            Operation::SetOwner { .. } => "set_owner",
            Operation::SetGroup { .. } => "set_group",
            Operation::SetTimes { .. } => "set_times",
            Operation::Register { .. } => "register",
            Operation::PollEvents => "poll_events",
            Operation::CancelKey => "cancel_key",
            Operation::Read { .. } => "read",
            Operation::Write { .. } => "write",
            Operation::Position => "position",
            Operation::Seek { .. } => "seek",
            Operation::Size => "size",
            Operation::Truncate { .. } => "truncate",
            Operation::Release => "release",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfo {
    pub name: String,
    pub kind: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", content = "value", rename_all = "snake_case")]
pub enum Reply {
    Unit,
    Hello { version: String },
    Handle(Handle),
    Handles(Vec<Handle>),
    Path(ByteString),
    Attributes(PosixFileAttributes),
    Entries(Vec<DirectoryEntry>),
    StoreInfo(StoreInfo),
    Number(u64),
    Bytes(ByteString),
    Events { valid: bool, events: Vec<WatchEvent> },
}

fn unexpected(expected: &str, reply: &Reply) -> RemoteFileSystemError {
    RemoteFileSystemError::Protocol(format!("expected {} reply, got {:?}", expected, reply))
}

type ReplyResult<T> = std::result::Result<T, RemoteFileSystemError>;

impl Reply {
    pub fn into_unit(self) -> ReplyResult<()> {
        match self {
            Reply::Unit => Ok(()),
            other => Err(unexpected("unit", &other)),
        }
    }

    pub fn into_hello(self) -> ReplyResult<String> {
        match self {
            Reply::Hello { version } => Ok(version),
            other => Err(unexpected("hello", &other)),
        }
    }

    pub fn into_handle(self) -> ReplyResult<Handle> {
        match self {
            Reply::Handle(handle) => Ok(handle),
            other => Err(unexpected("handle", &other)),
        }
    }

    pub fn into_handles(self) -> ReplyResult<Vec<Handle>> {
        match self {
            Reply::Handles(handles) => Ok(handles),
            other => Err(unexpected("handles", &other)),
        }
    }

    pub fn into_path(self) -> ReplyResult<ByteString> {
        match self {
            Reply::Path(path) => Ok(path),
            other => Err(unexpected("path", &other)),
        }
    }

    pub fn into_attributes(self) -> ReplyResult<PosixFileAttributes> {
        match self {
            Reply::Attributes(attrs) => Ok(attrs),
            other => Err(unexpected("attributes", &other)),
        }
    }

    pub fn into_entries(self) -> ReplyResult<Vec<DirectoryEntry>> {
        match self {
            Reply::Entries(entries) => Ok(entries),
            other => Err(unexpected("entries", &other)),
        }
    }

    pub fn into_store_info(self) -> ReplyResult<StoreInfo> {
        match self {
            Reply::StoreInfo(info) => Ok(info),
            other => Err(unexpected("store info", &other)),
        }
    }

    pub fn into_number(self) -> ReplyResult<u64> {
        match self {
            Reply::Number(n) => Ok(n),
            other => Err(unexpected("number", &other)),
        }
    }

    pub fn into_bytes(self) -> ReplyResult<ByteString> {
        match self {
            Reply::Bytes(bytes) => Ok(bytes),
            other => Err(unexpected("bytes", &other)),
        }
    }

    pub fn into_events(self) -> ReplyResult<(bool, Vec<WatchEvent>)> {
        match self {
            Reply::Events { valid, events } => Ok((valid, events)),
            other => Err(unexpected("events", &other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub handle: Handle,
    pub op: Operation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: std::result::Result<Reply, RemoteFault>,
}

/// 带长度前缀的帧，内容超过 `limit` 时拒绝
pub fn encode_frame<T: Serialize>(message: &T, limit: usize) -> std::io::Result<Vec<u8>> {
    let body = serde_json::to_vec(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    if body.len() > limit {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", body.len()),
        ));
    }
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(message, MAX_FRAME_LEN)?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// 读取下一帧，流正常结束时返回 `None`
pub async fn read_frame<R, T>(reader: &mut R) -> std::io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", len),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultKind;

    #[tokio::test]
    async fn test_frames_survive_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let request = Request {
            id: 7,
            handle: Handle(3),
            op: Operation::ReadAttributes {
                path: ByteString::from(&b"/tmp/\xff"[..]),
                follow_links: false,
            },
        };
        write_frame(&mut client, &request).await.unwrap();
        let response = Response {
            id: 7,
            result: Err(RemoteFault::new(FaultKind::Syscall { errno: libc::ENOENT }, "stat")),
        };
        write_frame(&mut client, &response).await.unwrap();
        drop(client);

        let got: Request = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(got, request);
        let got: Response = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(got, response);
        assert!(read_frame::<_, Request>(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let err = read_frame::<_, Request>(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_reply_shape_mismatch() {
        assert!(Reply::Unit.into_handle().is_err());
        assert_eq!(Reply::Number(4).into_number().unwrap(), 4);
    }
}
