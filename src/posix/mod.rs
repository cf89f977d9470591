//! POSIX 调用的类型化封装
//!
//! 这里不做任何策略：每个函数把一个系统原语映射为类型化的值，或带 errno 的 [`NativeSyscallError`]

mod dirent;
mod inotify;
mod passwd;

use std::ffi::CString;
use std::os::fd::OwnedFd;

use rustix::fs::{AtFlags, Mode, OFlags, Timespec, Timestamps, CWD, UTIME_OMIT};
use rustix::process::{Gid, Uid};
use serde::{Deserialize, Serialize};

use crate::bytes::ByteString;
use crate::error::NativeSyscallError;

pub use dirent::{decode_dirents, read_dir_entries, DirEntryIter, RawDirEntry};
pub use inotify::{decode_inotify_events, Inotify, InotifyEvent};
pub use passwd::{group_by_gid, group_by_name, passwd_by_name, passwd_by_uid, Group, Passwd};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Unknown,
}

impl FileType {
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFREG => FileType::Regular,
            libc::S_IFDIR => FileType::Directory,
            libc::S_IFLNK => FileType::Symlink,
            libc::S_IFCHR => FileType::CharDevice,
            libc::S_IFBLK => FileType::BlockDevice,
            libc::S_IFIFO => FileType::Fifo,
            libc::S_IFSOCK => FileType::Socket,
            _ => FileType::Unknown,
        }
    }

    pub fn from_dirent_type(d_type: u8) -> Self {
        match d_type {
            libc::DT_REG => FileType::Regular,
            libc::DT_DIR => FileType::Directory,
            libc::DT_LNK => FileType::Symlink,
            libc::DT_CHR => FileType::CharDevice,
            libc::DT_BLK => FileType::BlockDevice,
            libc::DT_FIFO => FileType::Fifo,
            libc::DT_SOCK => FileType::Socket,
            _ => FileType::Unknown,
        }
    }
}

/// Unix 纪元以来的秒和纳秒
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileTime {
    pub seconds: i64,
    pub nanos: u32,
}

impl FileTime {
    pub fn new(seconds: i64, nanos: u32) -> Self {
        Self { seconds, nanos }
    }
}

/// 原始 `stat` 字段，已抹平平台宽度差异
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawStat {
    pub device: u64,
    pub mode: u32,
    pub inode: u64,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub last_access: FileTime,
    pub last_modified: FileTime,
    pub status_changed: FileTime,
}

fn c_path(path: &[u8], syscall: &'static str) -> Result<CString, NativeSyscallError> {
    CString::new(path).map_err(|_| NativeSyscallError::new(libc::EINVAL, syscall))
}

fn with_path(err: rustix::io::Errno, syscall: &'static str, path: &[u8]) -> NativeSyscallError {
    NativeSyscallError::from_errno(err, syscall).with_path(String::from_utf8_lossy(path))
}

pub fn stat(path: &[u8], follow_links: bool) -> Result<RawStat, NativeSyscallError> {
    let syscall = if follow_links { "stat" } else { "lstat" };
    let p = c_path(path, syscall)?;
    let flags = if follow_links { AtFlags::empty() } else { AtFlags::SYMLINK_NOFOLLOW };
    let st = rustix::fs::statat(CWD, p.as_c_str(), flags).map_err(|e| with_path(e, syscall, path))?;
    Ok(RawStat {
        device: st.st_dev as u64,
        mode: st.st_mode as u32,
        inode: st.st_ino as u64,
        nlink: st.st_nlink as u64,
        uid: st.st_uid as u32,
        gid: st.st_gid as u32,
        size: st.st_size as u64,
        last_access: FileTime::new(st.st_atime as i64, st.st_atime_nsec as u32),
        last_modified: FileTime::new(st.st_mtime as i64, st.st_mtime_nsec as u32),
        status_changed: FileTime::new(st.st_ctime as i64, st.st_ctime_nsec as u32),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawStatVfs {
    pub block_size: u64,
    pub fragment_size: u64,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub read_only: bool,
}

pub fn statvfs(path: &[u8]) -> Result<RawStatVfs, NativeSyscallError> {
    let p = c_path(path, "statvfs")?;
    let st = rustix::fs::statvfs(p.as_c_str()).map_err(|e| with_path(e, "statvfs", path))?;
    Ok(RawStatVfs {
        block_size: st.f_bsize,
        fragment_size: st.f_frsize,
        blocks: st.f_blocks,
        blocks_free: st.f_bfree,
        blocks_available: st.f_bavail,
        read_only: st.f_flag.contains(rustix::fs::StatVfsMountFlags::RDONLY),
    })
}

pub fn open(path: &[u8], flags: OFlags, mode: u32) -> Result<OwnedFd, NativeSyscallError> {
    let p = c_path(path, "open")?;
    rustix::fs::open(p.as_c_str(), flags | OFlags::CLOEXEC, Mode::from_raw_mode(mode))
        .map_err(|e| with_path(e, "open", path))
}

pub fn mkdir(path: &[u8], mode: u32) -> Result<(), NativeSyscallError> {
    let p = c_path(path, "mkdir")?;
    rustix::fs::mkdir(p.as_c_str(), Mode::from_raw_mode(mode)).map_err(|e| with_path(e, "mkdir", path))
}

pub fn unlink(path: &[u8]) -> Result<(), NativeSyscallError> {
    let p = c_path(path, "unlink")?;
    rustix::fs::unlink(p.as_c_str()).map_err(|e| with_path(e, "unlink", path))
}

pub fn rmdir(path: &[u8]) -> Result<(), NativeSyscallError> {
    let p = c_path(path, "rmdir")?;
    rustix::fs::rmdir(p.as_c_str()).map_err(|e| with_path(e, "rmdir", path))
}

pub fn rename(from: &[u8], to: &[u8]) -> Result<(), NativeSyscallError> {
    let f = c_path(from, "rename")?;
    let t = c_path(to, "rename")?;
    rustix::fs::rename(f.as_c_str(), t.as_c_str()).map_err(|e| with_path(e, "rename", from))
}

pub fn symlink(target: &[u8], link: &[u8]) -> Result<(), NativeSyscallError> {
    let t = c_path(target, "symlink")?;
    let l = c_path(link, "symlink")?;
    rustix::fs::symlink(t.as_c_str(), l.as_c_str()).map_err(|e| with_path(e, "symlink", link))
}

pub fn readlink(path: &[u8]) -> Result<ByteString, NativeSyscallError> {
    let p = c_path(path, "readlink")?;
    let target = rustix::fs::readlink(p.as_c_str(), Vec::new()).map_err(|e| with_path(e, "readlink", path))?;
    Ok(ByteString::from(target.into_bytes()))
}

pub fn chmod(path: &[u8], mode: u32) -> Result<(), NativeSyscallError> {
    let p = c_path(path, "chmod")?;
    rustix::fs::chmod(p.as_c_str(), Mode::from_raw_mode(mode)).map_err(|e| with_path(e, "chmod", path))
}

pub fn chown(path: &[u8], uid: Option<u32>, gid: Option<u32>, follow_links: bool) -> Result<(), NativeSyscallError> {
    let p = c_path(path, "chown")?;
    let flags = if follow_links { AtFlags::empty() } else { AtFlags::SYMLINK_NOFOLLOW };
    let uid = uid.map(|u| unsafe { Uid::from_raw(u) });
    let gid = gid.map(|g| unsafe { Gid::from_raw(g) });
    rustix::fs::chownat(CWD, p.as_c_str(), uid, gid, flags).map_err(|e| with_path(e, "chown", path))
}

/// `None` 表示不修改对应时间戳
pub fn set_times(
    path: &[u8],
    last_modified: Option<FileTime>,
    last_access: Option<FileTime>,
    follow_links: bool,
) -> Result<(), NativeSyscallError> {
    let p = c_path(path, "utimensat")?;
    let to_timespec = |t: Option<FileTime>| match t {
        Some(t) => Timespec {
            tv_sec: t.seconds as _,
            tv_nsec: t.nanos as _,
        },
        None => Timespec {
            tv_sec: 0,
            tv_nsec: UTIME_OMIT,
        },
    };
    let times = Timestamps {
        last_access: to_timespec(last_access),
        last_modification: to_timespec(last_modified),
    };
    let flags = if follow_links { AtFlags::empty() } else { AtFlags::SYMLINK_NOFOLLOW };
    rustix::fs::utimensat(CWD, p.as_c_str(), &times, flags).map_err(|e| with_path(e, "utimensat", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::ffi::OsStrExt;
    use tempfile::TempDir;

    fn bytes(path: &std::path::Path) -> Vec<u8> {
        path.as_os_str().as_bytes().to_vec()
    }

    #[test]
    fn test_stat_missing() {
        let err = stat(b"/data/missing", true).unwrap_err();
        assert_eq!(err.errno, libc::ENOENT);
        assert_eq!(err.path.as_deref(), Some("/data/missing"));
    }

    #[test]
    fn test_mkdir_chmod_stat() {
        let temp_dir = TempDir::new().unwrap();
        let dir = bytes(&temp_dir.path().join("d"));
        mkdir(&dir, 0o700).unwrap();
        chmod(&dir, 0o750).unwrap();

        let st = stat(&dir, true).unwrap();
        assert_eq!(FileType::from_mode(st.mode), FileType::Directory);
        assert_eq!(st.mode & 0o7777, 0o750);

        let err = mkdir(&dir, 0o700).unwrap_err();
        assert_eq!(err.errno, libc::EEXIST);
        rmdir(&dir).unwrap();
    }

    #[test]
    fn test_symlink_and_times() {
        let temp_dir = TempDir::new().unwrap();
        let target = bytes(&temp_dir.path().join("target"));
        let link = bytes(&temp_dir.path().join("link"));
        std::fs::write(temp_dir.path().join("target"), b"hello").unwrap();
        symlink(b"target", &link).unwrap();

        assert_eq!(readlink(&link).unwrap().as_bytes(), b"target");
        assert_eq!(FileType::from_mode(stat(&link, false).unwrap().mode), FileType::Symlink);
        assert_eq!(stat(&link, true).unwrap().size, 5);

        set_times(&target, Some(FileTime::new(1_000_000, 0)), None, true).unwrap();
        assert_eq!(stat(&target, true).unwrap().last_modified.seconds, 1_000_000);
    }

    #[test]
    fn test_statvfs() {
        let st = statvfs(b"/").unwrap();
        assert!(st.blocks > 0);
        assert!(st.blocks_available <= st.blocks);
    }
}
