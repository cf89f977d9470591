use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd};

use rustix::fs::{Mode, OFlags};

use crate::bytes::ByteString;
use crate::error::NativeSyscallError;

use super::FileType;

// struct linux_dirent64 { u64 d_ino; i64 d_off; u16 d_reclen; u8 d_type; char d_name[]; }
const NAME_OFFSET: usize = 19;
const BUFFER_SIZE: usize = 32 * 1024;

/// `getdents64` 返回的一条记录，名称字节原样保留
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDirEntry {
    pub inode: u64,
    pub offset: i64,
    pub record_length: u16,
    pub entry_type: u8,
    pub name: ByteString,
}

impl RawDirEntry {
    pub fn file_type(&self) -> FileType {
        FileType::from_dirent_type(self.entry_type)
    }

    pub fn is_dot_or_dot_dot(&self) -> bool {
        matches!(self.name.as_bytes(), b"." | b"..")
    }
}

/// 解码 `getdents64` 填充的缓冲区，忽略末尾不完整的记录
pub fn decode_dirents(buf: &[u8]) -> Vec<RawDirEntry> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos + NAME_OFFSET <= buf.len() {
        let record = &buf[pos..];
        let inode = u64::from_ne_bytes(record[0..8].try_into().unwrap_or_default());
        let offset = i64::from_ne_bytes(record[8..16].try_into().unwrap_or_default());
        let record_length = u16::from_ne_bytes(record[16..18].try_into().unwrap_or_default());
        let entry_type = record[18];
        let reclen = record_length as usize;
        if reclen < NAME_OFFSET || reclen > record.len() {
            break;
        }
        let raw_name = &record[NAME_OFFSET..reclen];
        let name_len = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
        entries.push(RawDirEntry {
            inode,
            offset,
            record_length,
            entry_type,
            name: ByteString::from(&raw_name[..name_len]),
        });
        pos += reclen;
    }
    entries
}

fn open_directory(path: &[u8]) -> Result<OwnedFd, NativeSyscallError> {
    let os_path = ByteString::from(path);
    rustix::fs::open(
        os_path.as_path(),
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| NativeSyscallError::from_errno(e, "open").with_path(os_path.to_string_lossy()))
}

/// 按 `getdents64` 批次流式读取一个目录描述符
pub struct DirEntryIter {
    fd: OwnedFd,
    path: ByteString,
    buf: Vec<u8>,
    pending: VecDeque<RawDirEntry>,
    done: bool,
}

impl DirEntryIter {
    pub fn open(path: &[u8]) -> Result<Self, NativeSyscallError> {
        Ok(Self {
            fd: open_directory(path)?,
            path: ByteString::from(path),
            buf: vec![0u8; BUFFER_SIZE],
            pending: VecDeque::new(),
            done: false,
        })
    }

    fn fill(&mut self) -> Result<(), NativeSyscallError> {
        loop {
            let n = unsafe {
                libc::syscall(
                    libc::SYS_getdents64,
                    self.fd.as_raw_fd(),
                    self.buf.as_mut_ptr(),
                    self.buf.len(),
                )
            };
            if n < 0 {
                let err = NativeSyscallError::last_os_error("getdents64");
                if err.errno == libc::EINTR {
                    continue;
                }
                return Err(err.with_path(self.path.to_string_lossy()));
            }
            if n == 0 {
                self.done = true;
            } else {
                self.pending.extend(decode_dirents(&self.buf[..n as usize]));
            }
            return Ok(());
        }
    }
}

impl Iterator for DirEntryIter {
    type Item = Result<RawDirEntry, NativeSyscallError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pending.is_empty() && !self.done {
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.pending.pop_front().map(Ok)
    }
}

/// 读取目录的全部条目，包括 `.` 和 `..`
pub fn read_dir_entries(path: &[u8]) -> Result<Vec<RawDirEntry>, NativeSyscallError> {
    DirEntryIter::open(path)?.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    use tempfile::TempDir;

    fn encode(inode: u64, offset: i64, entry_type: u8, name: &[u8]) -> Vec<u8> {
        let reclen = (NAME_OFFSET + name.len() + 1 + 7) & !7;
        let mut record = vec![0u8; reclen];
        record[0..8].copy_from_slice(&inode.to_ne_bytes());
        record[8..16].copy_from_slice(&offset.to_ne_bytes());
        record[16..18].copy_from_slice(&(reclen as u16).to_ne_bytes());
        record[18] = entry_type;
        record[NAME_OFFSET..NAME_OFFSET + name.len()].copy_from_slice(name);
        record
    }

    #[test]
    fn test_decode_records() {
        let mut buf = encode(42, 1, libc::DT_REG, b"a.txt");
        buf.extend(encode(43, 2, libc::DT_DIR, b"sub"));

        let entries = decode_dirents(&buf);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].inode, 42);
        assert_eq!(entries[0].name.as_bytes(), b"a.txt");
        assert_eq!(entries[0].file_type(), FileType::Regular);
        assert_eq!(entries[1].offset, 2);
        assert_eq!(entries[1].file_type(), FileType::Directory);
        assert_eq!(entries[1].record_length as usize % 8, 0);
    }

    #[test]
    fn test_truncated_buffer() {
        let buf = encode(1, 1, libc::DT_REG, b"whole");
        assert!(decode_dirents(&buf[..buf.len() - 4]).is_empty());
    }

    #[test]
    fn test_non_utf8_names_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let name: &[u8] = b"caf\xe9-\xff\xfe.bin";
        std::fs::write(temp_dir.path().join(OsStr::from_bytes(name)), b"x").unwrap();

        let dir = temp_dir.path().as_os_str().as_bytes();
        let entries = read_dir_entries(dir).unwrap();
        let found: Vec<_> = entries.iter().filter(|e| !e.is_dot_or_dot_dot()).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name.as_bytes(), name);
        assert!(entries.iter().any(|e| e.name.as_bytes() == b"."));
    }

    #[test]
    fn test_missing_directory() {
        let err = read_dir_entries(b"/definitely/not/here").unwrap_err();
        assert_eq!(err.errno, libc::ENOENT);
        assert_eq!(err.syscall, "open");
    }

    #[test]
    fn test_iterator_spans_batches() {
        let temp_dir = TempDir::new().unwrap();
        // 名字足够长，确保需要多次 getdents64
        for i in 0..400 {
            std::fs::write(temp_dir.path().join(format!("{:0>120}", i)), b"").unwrap();
        }
        let iter = DirEntryIter::open(temp_dir.path().as_os_str().as_bytes()).unwrap();
        let names: Vec<_> = iter
            .map(|e| e.unwrap())
            .filter(|e| !e.is_dot_or_dot_dot())
            .collect();
        assert_eq!(names.len(), 400);
    }
}
