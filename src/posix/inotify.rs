use std::ffi::CString;
use std::os::fd::OwnedFd;

use rustix::event::{PollFd, PollFlags};
use rustix::fs::inotify::{self, CreateFlags, WatchFlags};
use rustix::io::Errno;

use crate::bytes::ByteString;
use crate::error::NativeSyscallError;

// struct inotify_event { int wd; u32 mask; u32 cookie; u32 len; char name[]; }
const HEADER_SIZE: usize = 16;
const READ_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InotifyEvent {
    pub watch_descriptor: i32,
    pub mask: u32,
    pub cookie: u32,
    pub name: Option<ByteString>,
}

impl InotifyEvent {
    pub fn has(&self, flag: u32) -> bool {
        self.mask & flag != 0
    }
}

/// 解码从 inotify 描述符读出的记录
pub fn decode_inotify_events(buf: &[u8]) -> Vec<InotifyEvent> {
    let mut events = Vec::new();
    let mut pos = 0;
    while pos + HEADER_SIZE <= buf.len() {
        let header = &buf[pos..pos + HEADER_SIZE];
        let watch_descriptor = i32::from_ne_bytes(header[0..4].try_into().unwrap_or_default());
        let mask = u32::from_ne_bytes(header[4..8].try_into().unwrap_or_default());
        let cookie = u32::from_ne_bytes(header[8..12].try_into().unwrap_or_default());
        let len = u32::from_ne_bytes(header[12..16].try_into().unwrap_or_default()) as usize;
        let name_start = pos + HEADER_SIZE;
        if name_start + len > buf.len() {
            break;
        }
        let raw_name = &buf[name_start..name_start + len];
        let name_len = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
        let name = (name_len > 0).then(|| ByteString::from(&raw_name[..name_len]));
        events.push(InotifyEvent {
            watch_descriptor,
            mask,
            cookie,
            name,
        });
        pos = name_start + len;
    }
    events
}

/// inotify 实例，drop 时关闭描述符
#[derive(Debug)]
pub struct Inotify {
    fd: OwnedFd,
}

impl Inotify {
    pub fn init() -> Result<Self, NativeSyscallError> {
        let fd = inotify::init(CreateFlags::NONBLOCK | CreateFlags::CLOEXEC)
            .map_err(|e| NativeSyscallError::from_errno(e, "inotify_init1"))?;
        Ok(Self { fd })
    }

    /// 带 `WatchFlags::MASK_ADD` 时合并同一 inode 上已有的掩码，而不是替换
    pub fn add_watch(&self, path: &[u8], mask: WatchFlags) -> Result<i32, NativeSyscallError> {
        let c_path = CString::new(path).map_err(|_| NativeSyscallError::new(libc::EINVAL, "inotify_add_watch"))?;
        inotify::add_watch(&self.fd, c_path.as_c_str(), mask).map_err(|e| {
            NativeSyscallError::from_errno(e, "inotify_add_watch").with_path(String::from_utf8_lossy(path))
        })
    }

    pub fn remove_watch(&self, wd: i32) -> Result<(), NativeSyscallError> {
        inotify::remove_watch(&self.fd, wd).map_err(|e| NativeSyscallError::from_errno(e, "inotify_rm_watch"))
    }

    /// 最多等待 `timeout_ms` 毫秒，返回空表示没有事件
    pub fn read_events(&self, timeout_ms: i32) -> Result<Vec<InotifyEvent>, NativeSyscallError> {
        let mut fds = [PollFd::new(&self.fd, PollFlags::IN)];
        match rustix::event::poll(&mut fds, timeout_ms) {
            Ok(0) => return Ok(Vec::new()),
            Ok(_) => {}
            Err(Errno::INTR) => return Ok(Vec::new()),
            Err(e) => return Err(NativeSyscallError::from_errno(e, "poll")),
        }

        let mut buf = vec![0u8; READ_BUFFER];
        match rustix::io::read(&self.fd, &mut buf) {
            Ok(n) => Ok(decode_inotify_events(&buf[..n])),
            Err(Errno::AGAIN) | Err(Errno::INTR) => Ok(Vec::new()),
            Err(e) => Err(NativeSyscallError::from_errno(e, "read")),
        }
    }
}
