//! 基于 tar 归档的只读文件系统。外层归档可以是注册表能解析的任意 [`Path`]，
//! 因此归档可以嵌套在远程、特权或本地文件系统中。

use std::collections::{BTreeSet, HashMap};
use std::io::Cursor;
use std::ops::Range;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use tar::EntryType;
use tracing::{debug, info};

use crate::bytes::ByteString;
use crate::config::WatchConfig;
use crate::error::{FsError, NativeSyscallError, Result};
use crate::fs::{
    decode_path, encode_path, Authority, ByteChannel, CopyOptions, DirectoryEntry, FileStore,
    FileSystemBackend, FileSystemProvider, OpenOptions, Path, PosixFileAttributeView, PosixFileAttributes,
    PosixPrincipal, MAX_READ_LEN,
};
use crate::posix::{FileTime, FileType};
use crate::registry::Registry;
use crate::watch::{PollingWatchService, WatchService};

const MAX_SYMLINK_HOPS: usize = 40;

/// 把 `.`、`..` 和空组件规范成绝对路径
fn clean(path: &[u8]) -> ByteString {
    let mut parts: Vec<&[u8]> = Vec::new();
    for part in path.split(|&b| b == b'/') {
        match part {
            b"" | b"." => {}
            b".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let mut out = Vec::with_capacity(path.len() + 1);
    for part in &parts {
        out.push(b'/');
        out.extend_from_slice(part);
    }
    if out.is_empty() {
        out.push(b'/');
    }
    ByteString::from(out)
}

fn split_parent(path: &[u8]) -> (ByteString, ByteString) {
    match path.iter().rposition(|&b| b == b'/') {
        Some(0) => (ByteString::from("/"), ByteString::from(&path[1..])),
        Some(i) => (ByteString::from(&path[..i]), ByteString::from(&path[i + 1..])),
        None => (ByteString::from("/"), ByteString::from(path)),
    }
}

fn not_found(path: &[u8]) -> FsError {
    NativeSyscallError::new(libc::ENOENT, "archive")
        .with_path(String::from_utf8_lossy(path))
        .into()
}

#[derive(Debug, Clone)]
struct ArchiveEntry {
    attrs: PosixFileAttributes,
    data: Range<usize>,
}

/// 一次归档快照解析出的成员表
#[derive(Debug)]
struct ArchiveIndex {
    data: Arc<Vec<u8>>,
    entries: HashMap<ByteString, ArchiveEntry>,
    children: HashMap<ByteString, BTreeSet<ByteString>>,
    next_inode: u64,
}

impl ArchiveIndex {
    fn build(data: Vec<u8>, outer: &PosixFileAttributes) -> Result<Self> {
        let data = Arc::new(data);
        let mut index = Self {
            data: data.clone(),
            entries: HashMap::new(),
            children: HashMap::new(),
            next_inode: 1,
        };
        let root = index.directory_attrs(outer);
        index.entries.insert(ByteString::from("/"), ArchiveEntry { attrs: root, data: 0..0 });

        let mut hard_links = Vec::new();
        let mut archive = tar::Archive::new(Cursor::new(data.as_slice()));
        for entry in archive.entries()? {
            let entry = entry?;
            let path = clean(&entry.path_bytes());
            if path.as_bytes() == b"/" {
                continue;
            }
            let header = entry.header();
            let entry_type = header.entry_type();
            let file_type = match entry_type {
                EntryType::Regular | EntryType::Continuous => FileType::Regular,
                EntryType::Directory => FileType::Directory,
                EntryType::Symlink => FileType::Symlink,
                EntryType::Char => FileType::CharDevice,
                EntryType::Block => FileType::BlockDevice,
                EntryType::Fifo => FileType::Fifo,
                EntryType::Link => {
                    if let Some(target) = entry.link_name_bytes() {
                        hard_links.push((path, clean(&target)));
                    }
                    continue;
                }
                // pax/GNU 扩展头已由 tar 合并
                _ => continue,
            };

            let mode = header.mode().unwrap_or(0o644) & 0o7777;
            let type_bits = match file_type {
                FileType::Directory => libc::S_IFDIR,
                FileType::Symlink => libc::S_IFLNK,
                FileType::CharDevice => libc::S_IFCHR,
                FileType::BlockDevice => libc::S_IFBLK,
                FileType::Fifo => libc::S_IFIFO,
                _ => libc::S_IFREG,
            };
            let mtime = FileTime::new(header.mtime().unwrap_or(0) as i64, 0);
            let size = if file_type == FileType::Regular { entry.size() } else { 0 };
            let start = entry.raw_file_position() as usize;
            let symlink_target = if file_type == FileType::Symlink {
                entry.link_name_bytes().map(|t| ByteString::from(t.into_owned()))
            } else {
                None
            };
            let inode = index.allocate_inode();
            let attrs = PosixFileAttributes {
                file_type,
                size,
                mode: type_bits | mode,
                owner: PosixPrincipal::new(
                    header.uid().unwrap_or(0) as u32,
                    header.username_bytes().map(ByteString::from),
                ),
                group: PosixPrincipal::new(
                    header.gid().unwrap_or(0) as u32,
                    header.groupname_bytes().map(ByteString::from),
                ),
                last_modified: mtime,
                last_access: mtime,
                status_changed: mtime,
                inode,
                link_count: 1,
                symlink_target,
            };
            index.insert(
                path,
                ArchiveEntry {
                    attrs,
                    data: start..start + size as usize,
                },
                outer,
            );
        }

        for (path, target) in hard_links {
            match index.entries.get(&target).cloned() {
                Some(entry) => index.insert(path, entry, outer),
                None => debug!("archive: dangling hard link {} -> {}", path, target),
            }
        }
        Ok(index)
    }

    fn allocate_inode(&mut self) -> u64 {
        let inode = self.next_inode;
        self.next_inode += 1;
        inode
    }

    fn directory_attrs(&mut self, outer: &PosixFileAttributes) -> PosixFileAttributes {
        PosixFileAttributes {
            file_type: FileType::Directory,
            size: 0,
            mode: libc::S_IFDIR | 0o555,
            owner: outer.owner.clone(),
            group: outer.group.clone(),
            last_modified: outer.last_modified,
            last_access: outer.last_access,
            status_changed: outer.status_changed,
            inode: self.allocate_inode(),
            link_count: 2,
            symlink_target: None,
        }
    }

    /// 插入条目，并补齐归档中隐含的目录
    fn insert(&mut self, path: ByteString, entry: ArchiveEntry, outer: &PosixFileAttributes) {
        let mut current = path.clone();
        while current.as_bytes() != b"/" {
            let (parent, name) = split_parent(&current);
            self.children.entry(parent.clone()).or_default().insert(name);
            if self.entries.contains_key(&parent) {
                break;
            }
            let attrs = self.directory_attrs(outer);
            self.entries.insert(parent.clone(), ArchiveEntry { attrs, data: 0..0 });
            current = parent;
        }
        self.entries.insert(path, entry);
    }

    fn lookup(&self, path: &[u8], follow_links: bool) -> Result<(ByteString, &ArchiveEntry)> {
        let mut path = clean(path);
        for _ in 0..MAX_SYMLINK_HOPS {
            let entry = self.entries.get(&path).ok_or_else(|| not_found(&path))?;
            match (&entry.attrs.symlink_target, follow_links) {
                (Some(target), true) => {
                    path = if target.starts_with(b"/") {
                        clean(target)
                    } else {
                        let (parent, _) = split_parent(&path);
                        clean(&crate::fs::child_path(&parent, target))
                    };
                }
                _ => return Ok((path, entry)),
            }
        }
        Err(NativeSyscallError::new(libc::ELOOP, "archive")
            .with_path(String::from_utf8_lossy(&path))
            .into())
    }
}

#[derive(Debug)]
struct ArchiveInner {
    outer: Path,
    watch: WatchConfig,
    index: RwLock<Arc<ArchiveIndex>>,
}

/// 只读挂载的 tar 归档。成员表在打开时生成快照，由 `refresh` 替换
#[derive(Debug, Clone)]
pub struct ArchiveBackend {
    inner: Arc<ArchiveInner>,
}

impl ArchiveBackend {
    pub async fn open(outer: Path, watch: WatchConfig) -> Result<Self> {
        let index = Self::load(&outer).await?;
        info!("archive opened: {} ({} entries)", outer, index.entries.len());
        Ok(Self {
            inner: Arc::new(ArchiveInner {
                outer,
                watch,
                index: RwLock::new(Arc::new(index)),
            }),
        })
    }

    async fn load(outer: &Path) -> Result<ArchiveIndex> {
        let attrs = outer.read_attributes(true).await?;
        let data = outer.read_all().await?;
        tokio::task::spawn_blocking(move || ArchiveIndex::build(data, &attrs))
            .await
            .map_err(|e| FsError::InvalidOperation(format!("archive index task failed: {}", e)))?
    }

    pub fn outer(&self) -> &Path {
        &self.inner.outer
    }

    fn index(&self) -> Arc<ArchiveIndex> {
        self.inner
            .index
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl FileSystemBackend for ArchiveBackend {
    async fn read_attributes<'a>(&'a self, path: &'a [u8], follow_links: bool) -> Result<PosixFileAttributes> {
        let index = self.index();
        let (_, entry) = index.lookup(path, follow_links)?;
        Ok(entry.attrs.clone())
    }

    async fn create_directory<'a>(&'a self, _path: &'a [u8], _mode: u32) -> Result<()> {
        Err(FsError::ReadOnly)
    }

    async fn create_symbolic_link<'a>(&'a self, _link: &'a [u8], _target: &'a [u8]) -> Result<()> {
        Err(FsError::ReadOnly)
    }

    async fn delete<'a>(&'a self, _path: &'a [u8]) -> Result<()> {
        Err(FsError::ReadOnly)
    }

    async fn copy<'a>(&'a self, _source: &'a [u8], _target: &'a [u8], _options: CopyOptions) -> Result<()> {
        Err(FsError::ReadOnly)
    }

    async fn move_file<'a>(&'a self, _source: &'a [u8], _target: &'a [u8], _options: CopyOptions) -> Result<()> {
        Err(FsError::ReadOnly)
    }

    async fn list_directory<'a>(&'a self, path: &'a [u8]) -> Result<Vec<DirectoryEntry>> {
        let index = self.index();
        let (resolved, entry) = index.lookup(path, true)?;
        if !entry.attrs.is_directory() {
            return Err(NativeSyscallError::new(libc::ENOTDIR, "archive")
                .with_path(resolved.to_string_lossy())
                .into());
        }
        let names = match index.children.get(&resolved) {
            Some(names) => names,
            None => return Ok(Vec::new()),
        };
        Ok(names
            .iter()
            .map(|name| {
                let child = crate::fs::child_path(&resolved, name);
                let file_type = index
                    .entries
                    .get(&child)
                    .map(|e| e.attrs.file_type)
                    .unwrap_or(FileType::Unknown);
                DirectoryEntry {
                    name: name.clone(),
                    file_type,
                }
            })
            .collect())
    }

    async fn open_byte_channel<'a>(&'a self, path: &'a [u8], options: OpenOptions) -> Result<Box<dyn ByteChannel>> {
        if options.is_writing() {
            return Err(FsError::ReadOnly);
        }
        let index = self.index();
        let (resolved, entry) = index.lookup(path, true)?;
        if entry.attrs.is_directory() {
            return Err(NativeSyscallError::new(libc::EISDIR, "archive")
                .with_path(resolved.to_string_lossy())
                .into());
        }
        Ok(Box::new(ArchiveByteChannel {
            data: index.data.clone(),
            range: entry.data.clone(),
            position: tokio::sync::Mutex::new(0),
            open: std::sync::atomic::AtomicBool::new(true),
        }))
    }

    async fn file_stores(&self) -> Result<Vec<Arc<dyn FileStore>>> {
        Ok(vec![self.file_store(b"/").await?])
    }

    async fn file_store<'a>(&'a self, _path: &'a [u8]) -> Result<Arc<dyn FileStore>> {
        Ok(Arc::new(ArchiveFileStore {
            name: self.inner.outer.to_uri_string(),
            size: self.index().data.len() as u64,
        }))
    }

    async fn attribute_view<'a>(&'a self, path: &'a [u8], follow_links: bool) -> Result<Arc<dyn PosixFileAttributeView>> {
        Ok(Arc::new(ArchiveAttributeView {
            backend: self.clone(),
            path: ByteString::from(path),
            follow_links,
        }))
    }

    async fn new_watch_service(&self) -> Result<Arc<dyn WatchService>> {
        let watch = &self.inner.watch;
        Ok(Arc::new(PollingWatchService::new(
            Arc::new(self.clone()),
            watch.poll_interval(),
            watch.queue_capacity,
        )))
    }

    /// 重新读取外层文件并替换成员表
    async fn refresh(&self) -> Result<()> {
        let index = Self::load(&self.inner.outer).await?;
        debug!("archive refreshed: {} ({} entries)", self.inner.outer, index.entries.len());
        *self.inner.index.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(index);
        Ok(())
    }
}

#[derive(Debug)]
struct ArchiveByteChannel {
    data: Arc<Vec<u8>>,
    range: Range<usize>,
    position: tokio::sync::Mutex<u64>,
    open: std::sync::atomic::AtomicBool,
}

impl ArchiveByteChannel {
    fn check_open(&self) -> Result<()> {
        if self.open.load(std::sync::atomic::Ordering::Acquire) {
            Ok(())
        } else {
            Err(NativeSyscallError::new(libc::EBADF, "channel").into())
        }
    }
}

#[async_trait]
impl ByteChannel for ArchiveByteChannel {
    async fn read(&self, len: usize) -> Result<Vec<u8>> {
        self.check_open()?;
        let mut position = self.position.lock().await;
        let size = self.range.len() as u64;
        if *position >= size {
            return Ok(Vec::new());
        }
        let start = self.range.start + *position as usize;
        let end = start.saturating_add(len.min(MAX_READ_LEN)).min(self.range.end);
        *position += (end - start) as u64;
        Ok(self.data[start..end].to_vec())
    }

    async fn write(&self, _data: &[u8]) -> Result<usize> {
        Err(FsError::ReadOnly)
    }

    async fn position(&self) -> Result<u64> {
        self.check_open()?;
        Ok(*self.position.lock().await)
    }

    async fn seek(&self, position: u64) -> Result<()> {
        self.check_open()?;
        *self.position.lock().await = position;
        Ok(())
    }

    async fn size(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.range.len() as u64)
    }

    async fn truncate(&self, _size: u64) -> Result<()> {
        Err(FsError::ReadOnly)
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, std::sync::atomic::Ordering::Release);
        Ok(())
    }
}

#[derive(Debug)]
struct ArchiveFileStore {
    name: String,
    size: u64,
}

#[async_trait]
impl FileStore for ArchiveFileStore {
    async fn name(&self) -> Result<String> {
        Ok(self.name.clone())
    }

    async fn kind(&self) -> Result<String> {
        Ok("tar".to_string())
    }

    async fn is_read_only(&self) -> Result<bool> {
        Ok(true)
    }

    async fn total_space(&self) -> Result<u64> {
        Ok(self.size)
    }

    async fn usable_space(&self) -> Result<u64> {
        Ok(0)
    }

    async fn unallocated_space(&self) -> Result<u64> {
        Ok(0)
    }

    async fn block_size(&self) -> Result<u64> {
        Ok(512)
    }
}

#[derive(Debug)]
struct ArchiveAttributeView {
    backend: ArchiveBackend,
    path: ByteString,
    follow_links: bool,
}

#[async_trait]
impl PosixFileAttributeView for ArchiveAttributeView {
    async fn read_attributes(&self) -> Result<PosixFileAttributes> {
        self.backend.read_attributes(&self.path, self.follow_links).await
    }

    async fn set_mode(&self, _mode: u32) -> Result<()> {
        Err(FsError::ReadOnly)
    }

    async fn set_owner(&self, _uid: u32) -> Result<()> {
        Err(FsError::ReadOnly)
    }

    async fn set_group(&self, _gid: u32) -> Result<()> {
        Err(FsError::ReadOnly)
    }

    async fn set_times(&self, _last_modified: Option<FileTime>, _last_access: Option<FileTime>) -> Result<()> {
        Err(FsError::ReadOnly)
    }
}

/// `archive:<percent-encoded outer URI>!/inner/path`
#[derive(Debug)]
pub struct ArchiveProvider {
    registry: Weak<Registry>,
    watch: WatchConfig,
}

impl ArchiveProvider {
    pub fn new(registry: Weak<Registry>, watch: WatchConfig) -> Self {
        Self { registry, watch }
    }
}

#[async_trait]
impl FileSystemProvider for ArchiveProvider {
    fn scheme(&self) -> &str {
        "archive"
    }

    async fn new_file_system(&self, authority: &Authority) -> Result<Arc<dyn FileSystemBackend>> {
        let outer_uri = match authority {
            Authority::Archive { archive } => archive,
            other => return Err(FsError::InvalidPath(format!("archive: expects an outer URI, got {}", other))),
        };
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| FsError::InvalidOperation("registry dropped".to_string()))?;
        let outer = registry.parse_path(outer_uri).await?;
        Ok(Arc::new(ArchiveBackend::open(outer, self.watch.clone()).await?))
    }

    fn parse_uri(&self, rest: &str) -> Result<(Authority, ByteString)> {
        let (outer, inner) = match rest.split_once('!') {
            Some((outer, inner)) => (outer, inner),
            None => (rest, "/"),
        };
        if outer.is_empty() {
            return Err(FsError::InvalidPath(format!("archive:{}", rest)));
        }
        let outer = urlencoding::decode(outer).map_err(|e| FsError::InvalidPath(e.to_string()))?;
        let inner = if inner.is_empty() { "/" } else { inner };
        Ok((Authority::archive(outer.into_owned()), clean(&decode_path(inner))))
    }

    fn format_uri(&self, authority: &Authority, path: &[u8]) -> String {
        let outer = match authority {
            Authority::Archive { archive } => archive.as_str(),
            _ => "",
        };
        format!("archive:{}!{}", urlencoding::encode(outer), encode_path(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fs::read_to_end;
    use tempfile::TempDir;

    fn build_tar(dir: &std::path::Path) -> std::path::PathBuf {
        let file = dir.join("bundle.tar");
        let mut builder = tar::Builder::new(std::fs::File::create(&file).unwrap());

        let mut header = tar::Header::new_gnu();
        header.set_size(11);
        header.set_mode(0o640);
        header.set_mtime(1_700_000_000);
        header.set_cksum();
        builder.append_data(&mut header, "docs/readme.txt", &b"hello world"[..]).unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder.append_link(&mut header, "docs/latest", "readme.txt").unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, "empty/", &b""[..]).unwrap();

        builder.into_inner().unwrap();
        file
    }

    async fn open(temp_dir: &TempDir) -> (Arc<Registry>, Arc<crate::fs::FileSystem>) {
        let tar_path = build_tar(temp_dir.path());
        let registry = Registry::with_defaults(Config::default());
        let outer = format!("file://{}", encode_path(tar_path.to_str().unwrap().as_bytes()));
        let fs = registry
            .get_or_create_file_system("archive", &Authority::archive(outer))
            .await
            .unwrap();
        (registry, fs)
    }

    #[tokio::test]
    async fn test_lists_and_reads_members() {
        let temp_dir = TempDir::new().unwrap();
        let (_registry, fs) = open(&temp_dir).await;

        let root: Vec<_> = fs.path("/").read_dir().await.unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(root, vec![ByteString::from("docs"), ByteString::from("empty")]);

        let readme = fs.path("/docs/readme.txt");
        let attrs = readme.read_attributes(true).await.unwrap();
        assert_eq!(attrs.size, 11);
        assert_eq!(attrs.permissions(), 0o640);
        assert_eq!(attrs.last_modified.seconds, 1_700_000_000);

        let channel = readme.open_byte_channel(OpenOptions::read()).await.unwrap();
        channel.seek(6).await.unwrap();
        assert_eq!(read_to_end(channel.as_ref()).await.unwrap(), b"world");

        // 符号链接相对其所在目录解析
        assert_eq!(fs.path("/docs/latest").read_all().await.unwrap(), b"hello world");
        assert!(fs.path("/docs/latest").read_attributes(false).await.unwrap().is_symbolic_link());
    }

    #[tokio::test]
    async fn test_oversized_read_is_clamped() {
        let temp_dir = TempDir::new().unwrap();
        let (_registry, fs) = open(&temp_dir).await;

        let channel = fs.path("/docs/readme.txt").open_byte_channel(OpenOptions::read()).await.unwrap();
        channel.seek(6).await.unwrap();
        assert_eq!(channel.read(usize::MAX).await.unwrap(), b"world");
        assert_eq!(channel.position().await.unwrap(), 11);
        assert!(channel.read(usize::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_writes_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let (_registry, fs) = open(&temp_dir).await;

        assert!(matches!(fs.path("/new").create_directory(0o755).await, Err(FsError::ReadOnly)));
        assert!(matches!(fs.path("/docs/readme.txt").delete().await, Err(FsError::ReadOnly)));
        assert!(matches!(
            fs.path("/docs/readme.txt").open_byte_channel(OpenOptions::write()).await,
            Err(FsError::ReadOnly)
        ));
        let store = fs.path("/").file_store().await.unwrap();
        assert!(store.is_read_only().await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_member() {
        let temp_dir = TempDir::new().unwrap();
        let (_registry, fs) = open(&temp_dir).await;
        let err = fs.path("/nope").read_attributes(true).await.unwrap_err();
        assert_eq!(err.errno(), Some(libc::ENOENT));
        assert!(!fs.path("/nope").exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_picks_up_new_members() {
        let temp_dir = TempDir::new().unwrap();
        let (_registry, fs) = open(&temp_dir).await;

        let file = temp_dir.path().join("bundle.tar");
        let mut builder = tar::Builder::new(std::fs::File::create(&file).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "fresh.txt", &b"new"[..]).unwrap();
        builder.into_inner().unwrap();

        assert!(!fs.path("/fresh.txt").exists().await.unwrap());
        fs.refresh().await.unwrap();
        assert_eq!(fs.path("/fresh.txt").read_all().await.unwrap(), b"new");
        assert!(!fs.path("/docs").exists().await.unwrap());
    }

    #[test]
    fn test_uri_round_trip() {
        let provider = ArchiveProvider::new(Weak::new(), WatchConfig::default());
        let uri = provider.format_uri(&Authority::archive("file:///tmp/a!b.tar"), b"/x y");
        let rest = uri.strip_prefix("archive:").unwrap();
        let (authority, path) = provider.parse_uri(rest).unwrap();
        assert_eq!(authority, Authority::archive("file:///tmp/a!b.tar"));
        assert_eq!(path.as_bytes(), b"/x y");
    }

    #[test]
    fn test_clean() {
        assert_eq!(clean(b"./a//b/../c/").as_bytes(), b"/a/c");
        assert_eq!(clean(b"..").as_bytes(), b"/");
    }
}
