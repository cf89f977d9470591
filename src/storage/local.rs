use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustix::fs::OFlags;
use tracing::debug;

use crate::bytes::ByteString;
use crate::config::WatchConfig;
use crate::error::{FsError, NativeSyscallError, Result};
use crate::fs::{
    encode_path, Authority, ByteChannel, CopyOptions, DirectoryEntry, FileStore, FileSystemBackend,
    FileSystemProvider, OpenOptions, PosixFileAttributeView, PosixFileAttributes, PosixPrincipal, MAX_READ_LEN,
};
use crate::posix::{self, FileTime, FileType, RawStat};
use crate::watch::{NativeWatchService, PollingWatchService, WatchService};

use super::blocking;

const MOUNTS: &str = "/proc/self/mounts";

fn lossy(path: &[u8]) -> String {
    String::from_utf8_lossy(path).into_owned()
}

fn principal_names(st: &RawStat) -> (Option<ByteString>, Option<ByteString>) {
    // 名字解析失败不影响属性读取
    let owner = posix::passwd_by_uid(st.uid).ok().flatten().map(|p| p.name);
    let group = posix::group_by_gid(st.gid).ok().flatten().map(|g| g.name);
    (owner, group)
}

pub(crate) fn attributes_of(path: &[u8], follow_links: bool) -> Result<PosixFileAttributes> {
    let st = posix::stat(path, follow_links)?;
    let file_type = FileType::from_mode(st.mode);
    let symlink_target = if file_type == FileType::Symlink {
        Some(posix::readlink(path)?)
    } else {
        None
    };
    let (owner, group) = principal_names(&st);
    Ok(PosixFileAttributes {
        file_type,
        size: st.size,
        mode: st.mode,
        owner: PosixPrincipal::new(st.uid, owner),
        group: PosixPrincipal::new(st.gid, group),
        last_modified: st.last_modified,
        last_access: st.last_access,
        status_changed: st.status_changed,
        inode: st.inode,
        link_count: st.nlink,
        symlink_target,
    })
}

fn remove(path: &[u8], st: &RawStat) -> Result<()> {
    if FileType::from_mode(st.mode) == FileType::Directory {
        posix::rmdir(path)?;
    } else {
        posix::unlink(path)?;
    }
    Ok(())
}

fn copy_contents(source: &[u8], target: &[u8], mode: u32) -> Result<()> {
    let mut from = File::from(posix::open(source, OFlags::RDONLY, 0)?);
    let mut to = File::from(posix::open(
        target,
        OFlags::WRONLY | OFlags::CREATE | OFlags::EXCL,
        mode & 0o7777,
    )?);
    std::io::copy(&mut from, &mut to)?;
    Ok(())
}

fn copy_blocking(source: &[u8], target: &[u8], options: CopyOptions) -> Result<()> {
    let st = posix::stat(source, options.follow_links)?;
    match posix::stat(target, false) {
        Ok(existing) => {
            if !options.replace_existing {
                return Err(NativeSyscallError::new(libc::EEXIST, "copy").with_path(lossy(target)).into());
            }
            remove(target, &existing)?;
        }
        Err(e) if e.errno == libc::ENOENT => {}
        Err(e) => return Err(e.into()),
    }

    let file_type = FileType::from_mode(st.mode);
    match file_type {
        FileType::Directory => posix::mkdir(target, st.mode & 0o7777)?,
        FileType::Symlink => posix::symlink(&posix::readlink(source)?, target)?,
        FileType::Regular => copy_contents(source, target, st.mode)?,
        _ => {
            return Err(NativeSyscallError::new(libc::ENOTSUP, "copy").with_path(lossy(source)).into());
        }
    }

    if options.copy_attributes {
        let follow = file_type != FileType::Symlink;
        if follow {
            posix::chmod(target, st.mode & 0o7777)?;
        }
        posix::set_times(target, Some(st.last_modified), Some(st.last_access), follow)?;
        // 非特权进程无法改属主
        match posix::chown(target, Some(st.uid), Some(st.gid), follow) {
            Err(e) if e.errno == libc::EPERM => debug!("copy: keeping owner of {}", lossy(target)),
            other => other?,
        }
    }
    Ok(())
}

fn move_blocking(source: &[u8], target: &[u8], options: CopyOptions) -> Result<()> {
    if !options.replace_existing && posix::stat(target, false).is_ok() {
        return Err(NativeSyscallError::new(libc::EEXIST, "move").with_path(lossy(target)).into());
    }
    match posix::rename(source, target) {
        Err(e) if e.errno == libc::EXDEV => {
            debug!("move across devices, copying {}", lossy(source));
            let st = posix::stat(source, false)?;
            copy_blocking(
                source,
                target,
                CopyOptions {
                    replace_existing: options.replace_existing,
                    copy_attributes: true,
                    follow_links: false,
                },
            )?;
            remove(source, &st)
        }
        other => Ok(other?),
    }
}

fn list_blocking(path: &[u8]) -> Result<Vec<DirectoryEntry>> {
    let mut entries = Vec::new();
    for raw in posix::read_dir_entries(path)? {
        if raw.name.as_bytes() == b"." || raw.name.as_bytes() == b".." {
            continue;
        }
        let mut file_type = FileType::from_dirent_type(raw.entry_type);
        // 部分文件系统不填 d_type
        if file_type == FileType::Unknown {
            let child = crate::fs::child_path(path, &raw.name);
            if let Ok(st) = posix::stat(&child, false) {
                file_type = FileType::from_mode(st.mode);
            }
        }
        entries.push(DirectoryEntry {
            name: raw.name,
            file_type,
        });
    }
    Ok(entries)
}

/// `/proc/self/mounts` 中的一行
#[derive(Debug, Clone, PartialEq, Eq)]
struct MountEntry {
    device: String,
    mount_point: ByteString,
    fs_type: String,
}

/// 还原内核对挂载字段做的八进制转义（空格为 `\040`）
fn unescape_mount_field(field: &str) -> Vec<u8> {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b)) {
            let value = (bytes[i + 1] - b'0') as u32 * 64 + (bytes[i + 2] - b'0') as u32 * 8 + (bytes[i + 3] - b'0') as u32;
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    out
}

fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountEntry {
                device: device.to_string(),
                mount_point: ByteString::from(unescape_mount_field(mount_point)),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

fn read_mounts() -> Result<Vec<MountEntry>> {
    Ok(parse_mounts(&std::fs::read_to_string(MOUNTS)?))
}

/// 已挂载的卷，每次查询都用 `statvfs` 重新读取容量
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    name: String,
    kind: String,
    mount_point: ByteString,
}

impl LocalFileStore {
    fn from_mount(mount: MountEntry) -> Self {
        Self {
            name: mount.device,
            kind: mount.fs_type,
            mount_point: mount.mount_point,
        }
    }

    pub fn mount_point(&self) -> &ByteString {
        &self.mount_point
    }

    async fn statvfs(&self) -> Result<posix::RawStatVfs> {
        let mount_point = self.mount_point.clone();
        blocking(move || Ok(posix::statvfs(&mount_point)?)).await
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn name(&self) -> Result<String> {
        Ok(self.name.clone())
    }

    async fn kind(&self) -> Result<String> {
        Ok(self.kind.clone())
    }

    async fn is_read_only(&self) -> Result<bool> {
        Ok(self.statvfs().await?.read_only)
    }

    async fn total_space(&self) -> Result<u64> {
        let st = self.statvfs().await?;
        Ok(st.blocks * st.fragment_size)
    }

    async fn usable_space(&self) -> Result<u64> {
        let st = self.statvfs().await?;
        Ok(st.blocks_available * st.fragment_size)
    }

    async fn unallocated_space(&self) -> Result<u64> {
        let st = self.statvfs().await?;
        Ok(st.blocks_free * st.fragment_size)
    }

    async fn block_size(&self) -> Result<u64> {
        Ok(self.statvfs().await?.block_size)
    }
}

#[derive(Debug, Clone)]
struct LocalAttributeView {
    path: ByteString,
    follow_links: bool,
}

#[async_trait]
impl PosixFileAttributeView for LocalAttributeView {
    async fn read_attributes(&self) -> Result<PosixFileAttributes> {
        let (path, follow) = (self.path.clone(), self.follow_links);
        blocking(move || attributes_of(&path, follow)).await
    }

    async fn set_mode(&self, mode: u32) -> Result<()> {
        let path = self.path.clone();
        blocking(move || Ok(posix::chmod(&path, mode & 0o7777)?)).await
    }

    async fn set_owner(&self, uid: u32) -> Result<()> {
        let (path, follow) = (self.path.clone(), self.follow_links);
        blocking(move || Ok(posix::chown(&path, Some(uid), None, follow)?)).await
    }

    async fn set_group(&self, gid: u32) -> Result<()> {
        let (path, follow) = (self.path.clone(), self.follow_links);
        blocking(move || Ok(posix::chown(&path, None, Some(gid), follow)?)).await
    }

    async fn set_times(&self, last_modified: Option<FileTime>, last_access: Option<FileTime>) -> Result<()> {
        let (path, follow) = (self.path.clone(), self.follow_links);
        blocking(move || Ok(posix::set_times(&path, last_modified, last_access, follow)?)).await
    }
}

/// 基于已打开描述符的定位读写通道
#[derive(Debug)]
pub struct LocalByteChannel {
    path: ByteString,
    file: Mutex<Option<Arc<File>>>,
    position: tokio::sync::Mutex<u64>,
    append: bool,
}

impl LocalByteChannel {
    fn new(path: ByteString, file: File, append: bool) -> Self {
        Self {
            path,
            file: Mutex::new(Some(Arc::new(file))),
            position: tokio::sync::Mutex::new(0),
            append,
        }
    }

    fn file(&self) -> Result<Arc<File>> {
        crate::watch::lock(&self.file)
            .clone()
            .ok_or_else(|| NativeSyscallError::new(libc::EBADF, "channel").with_path(self.path.to_string_lossy()).into())
    }
}

#[async_trait]
impl ByteChannel for LocalByteChannel {
    async fn read(&self, len: usize) -> Result<Vec<u8>> {
        let file = self.file()?;
        let mut position = self.position.lock().await;
        let offset = *position;
        let len = len.min(MAX_READ_LEN);
        let data = blocking(move || {
            let mut buf = vec![0u8; len];
            let n = file.read_at(&mut buf, offset)?;
            buf.truncate(n);
            Ok(buf)
        })
        .await?;
        *position += data.len() as u64;
        Ok(data)
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        let file = self.file()?;
        let mut position = self.position.lock().await;
        let offset = *position;
        let append = self.append;
        let data = data.to_vec();
        let (written, end) = blocking(move || {
            if append {
                // O_APPEND 忽略偏移
                let n = (&*file).write(&data)?;
                Ok((n, file.metadata()?.len()))
            } else {
                let n = file.write_at(&data, offset)?;
                Ok((n, offset + n as u64))
            }
        })
        .await?;
        *position = end;
        Ok(written)
    }

    async fn position(&self) -> Result<u64> {
        self.file()?;
        Ok(*self.position.lock().await)
    }

    async fn seek(&self, position: u64) -> Result<()> {
        self.file()?;
        *self.position.lock().await = position;
        Ok(())
    }

    async fn size(&self) -> Result<u64> {
        let file = self.file()?;
        blocking(move || Ok(file.metadata()?.len())).await
    }

    async fn truncate(&self, size: u64) -> Result<()> {
        let file = self.file()?;
        let mut position = self.position.lock().await;
        blocking(move || {
            if size < file.metadata()?.len() {
                file.set_len(size)?;
            }
            Ok(())
        })
        .await?;
        if *position > size {
            *position = size;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        crate::watch::lock(&self.file).take();
        Ok(())
    }
}

fn open_flags(options: &OpenOptions) -> OFlags {
    let mut flags = match (options.read, options.write || options.append) {
        (true, true) => OFlags::RDWR,
        (false, true) => OFlags::WRONLY,
        _ => OFlags::RDONLY,
    };
    if options.append {
        flags |= OFlags::APPEND;
    }
    if options.create_new {
        flags |= OFlags::CREATE | OFlags::EXCL;
    } else if options.create {
        flags |= OFlags::CREATE;
    }
    if options.truncate {
        flags |= OFlags::TRUNC;
    }
    flags
}

/// 本地 POSIX 文件系统，直接通过系统调用访问
#[derive(Debug, Clone)]
pub struct LocalBackend {
    watch: WatchConfig,
}

impl LocalBackend {
    pub fn new(watch: WatchConfig) -> Self {
        Self { watch }
    }
}

#[async_trait]
impl FileSystemBackend for LocalBackend {
    async fn read_attributes<'a>(&'a self, path: &'a [u8], follow_links: bool) -> Result<PosixFileAttributes> {
        let path = path.to_vec();
        blocking(move || attributes_of(&path, follow_links)).await
    }

    async fn create_directory<'a>(&'a self, path: &'a [u8], mode: u32) -> Result<()> {
        debug!("create_directory: {}", lossy(path));
        let path = path.to_vec();
        blocking(move || Ok(posix::mkdir(&path, mode)?)).await
    }

    async fn create_symbolic_link<'a>(&'a self, link: &'a [u8], target: &'a [u8]) -> Result<()> {
        let (link, target) = (link.to_vec(), target.to_vec());
        blocking(move || Ok(posix::symlink(&target, &link)?)).await
    }

    async fn delete<'a>(&'a self, path: &'a [u8]) -> Result<()> {
        let path = path.to_vec();
        blocking(move || {
            let st = posix::stat(&path, false)?;
            remove(&path, &st)
        })
        .await
    }

    async fn copy<'a>(&'a self, source: &'a [u8], target: &'a [u8], options: CopyOptions) -> Result<()> {
        let (source, target) = (source.to_vec(), target.to_vec());
        blocking(move || copy_blocking(&source, &target, options)).await
    }

    async fn move_file<'a>(&'a self, source: &'a [u8], target: &'a [u8], options: CopyOptions) -> Result<()> {
        let (source, target) = (source.to_vec(), target.to_vec());
        blocking(move || move_blocking(&source, &target, options)).await
    }

    async fn list_directory<'a>(&'a self, path: &'a [u8]) -> Result<Vec<DirectoryEntry>> {
        let path = path.to_vec();
        blocking(move || list_blocking(&path)).await
    }

    async fn open_byte_channel<'a>(&'a self, path: &'a [u8], options: OpenOptions) -> Result<Box<dyn ByteChannel>> {
        let flags = open_flags(&options);
        let owned = path.to_vec();
        let fd = blocking(move || Ok(posix::open(&owned, flags, options.mode)?)).await?;
        Ok(Box::new(LocalByteChannel::new(ByteString::from(path), File::from(fd), options.append)))
    }

    async fn file_stores(&self) -> Result<Vec<Arc<dyn FileStore>>> {
        let mounts = blocking(read_mounts).await?;
        Ok(mounts
            .into_iter()
            .map(|m| Arc::new(LocalFileStore::from_mount(m)) as Arc<dyn FileStore>)
            .collect())
    }

    async fn file_store<'a>(&'a self, path: &'a [u8]) -> Result<Arc<dyn FileStore>> {
        let path = path.to_vec();
        let store = blocking(move || {
            let device = posix::stat(&path, true)?.device;
            // 后挂载的覆盖先挂载的
            let found = read_mounts()?.into_iter().rev().find(|m| {
                posix::stat(&m.mount_point, true)
                    .map(|st| st.device == device)
                    .unwrap_or(false)
            });
            found.ok_or_else(|| FsError::NotFound(format!("no mount for {}", lossy(&path))))
        })
        .await?;
        Ok(Arc::new(LocalFileStore::from_mount(store)))
    }

    async fn attribute_view<'a>(&'a self, path: &'a [u8], follow_links: bool) -> Result<Arc<dyn PosixFileAttributeView>> {
        Ok(Arc::new(LocalAttributeView {
            path: ByteString::from(path),
            follow_links,
        }))
    }

    async fn new_watch_service(&self) -> Result<Arc<dyn WatchService>> {
        if self.watch.is_native("file") {
            Ok(Arc::new(NativeWatchService::new(self.watch.queue_capacity)?))
        } else {
            Ok(Arc::new(PollingWatchService::new(
                Arc::new(self.clone()),
                self.watch.poll_interval(),
                self.watch.queue_capacity,
            )))
        }
    }
}

/// `file:///absolute/path`
#[derive(Debug, Clone)]
pub struct LocalProvider {
    watch: WatchConfig,
}

impl LocalProvider {
    pub fn new(watch: WatchConfig) -> Self {
        Self { watch }
    }
}

#[async_trait]
impl FileSystemProvider for LocalProvider {
    fn scheme(&self) -> &str {
        "file"
    }

    async fn new_file_system(&self, authority: &Authority) -> Result<Arc<dyn FileSystemBackend>> {
        match authority {
            Authority::Local => Ok(Arc::new(LocalBackend::new(self.watch.clone()))),
            other => Err(FsError::InvalidPath(format!("file: does not take an authority: {}", other))),
        }
    }

    fn parse_uri(&self, rest: &str) -> Result<(Authority, ByteString)> {
        let path = rest.strip_prefix("//").unwrap_or(rest);
        if !path.starts_with('/') {
            return Err(FsError::InvalidPath(format!("file:{}", rest)));
        }
        Ok((Authority::Local, crate::fs::decode_path(path)))
    }

    fn format_uri(&self, _authority: &Authority, path: &[u8]) -> String {
        format!("file://{}", encode_path(path))
    }
}
