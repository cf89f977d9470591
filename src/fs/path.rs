use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tracing::debug;

use crate::bytes::ByteString;
use crate::error::Result;
use crate::posix::FileType;
use crate::watch::{WatchEventKind, WatchKey, WatchService};

use super::{
    read_to_end, write_all, ByteChannel, CopyOptions, DirectoryEntry, FileStore, FileSystem,
    OpenOptions, PosixFileAttributeView, PosixFileAttributes, CHANNEL_CHUNK,
};

/// 绑定到签发它的文件系统的路径
///
/// 不同文件系统实例的路径永不相等，也没有先后顺序
#[derive(Clone)]
pub struct Path {
    fs: Arc<FileSystem>,
    bytes: ByteString,
}

/// 合并重复分隔符，去掉 `.` 和末尾斜杠
fn normalize_separators(raw: &[u8]) -> ByteString {
    let absolute = raw.first() == Some(&b'/');
    let components: Vec<&[u8]> = raw
        .split(|&b| b == b'/')
        .filter(|c| !c.is_empty() && *c != b".")
        .collect();
    let mut out = Vec::with_capacity(raw.len());
    if absolute {
        out.push(b'/');
    }
    out.extend_from_slice(&components.join(&b'/'));
    ByteString::from(out)
}

impl Path {
    pub fn new(fs: Arc<FileSystem>, bytes: ByteString) -> Self {
        Self {
            fs,
            bytes: normalize_separators(&bytes),
        }
    }

    pub fn file_system(&self) -> &Arc<FileSystem> {
        &self.fs
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_bytes()
    }

    pub fn is_absolute(&self) -> bool {
        self.bytes.first() == Some(&b'/')
    }

    pub fn components(&self) -> Vec<&[u8]> {
        self.bytes
            .split(|&b| b == b'/')
            .filter(|c| !c.is_empty())
            .collect()
    }

    pub fn file_name(&self) -> Option<&[u8]> {
        self.components().last().copied()
    }

    pub fn parent(&self) -> Option<Path> {
        let components = self.components();
        if components.is_empty() {
            return None;
        }
        if components.len() == 1 && !self.is_absolute() {
            return None;
        }
        let mut parent = Vec::new();
        if self.is_absolute() {
            parent.push(b'/');
        }
        parent.extend_from_slice(&components[..components.len() - 1].join(&b'/'));
        Some(Path::new(self.fs.clone(), ByteString::from(parent)))
    }

    /// 相对本路径解析 `other`，绝对路径直接替换
    pub fn join(&self, other: &[u8]) -> Path {
        if other.first() == Some(&b'/') {
            return Path::new(self.fs.clone(), ByteString::from(other));
        }
        Path::new(self.fs.clone(), super::child_path(&self.bytes, other))
    }

    /// 按字面解析 `..`
    pub fn normalize(&self) -> Path {
        let mut stack: Vec<&[u8]> = Vec::new();
        for component in self.components() {
            if component == b".." {
                match stack.last() {
                    Some(last) if *last != b".." => {
                        stack.pop();
                    }
                    _ if self.is_absolute() => {}
                    _ => stack.push(component),
                }
            } else {
                stack.push(component);
            }
        }
        let mut out = Vec::new();
        if self.is_absolute() {
            out.push(b'/');
        }
        out.extend_from_slice(&stack.join(&b'/'));
        Path::new(self.fs.clone(), ByteString::from(out))
    }

    pub fn starts_with(&self, other: &Path) -> bool {
        if !Arc::ptr_eq(&self.fs, &other.fs) || self.is_absolute() != other.is_absolute() {
            return false;
        }
        let mine = self.components();
        let theirs = other.components();
        theirs.len() <= mine.len() && mine[..theirs.len()] == theirs[..]
    }

    pub fn to_uri_string(&self) -> String {
        self.fs.to_uri(&self.bytes)
    }

    pub async fn read_attributes(&self, follow_links: bool) -> Result<PosixFileAttributes> {
        self.fs.backend()?.read_attributes(&self.bytes, follow_links).await
    }

    pub async fn exists(&self) -> Result<bool> {
        match self.read_attributes(true).await {
            Ok(_) => Ok(true),
            Err(e) if e.errno() == Some(libc::ENOENT) => Ok(false),
            Err(crate::error::FsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn create_directory(&self, mode: u32) -> Result<()> {
        self.fs.backend()?.create_directory(&self.bytes, mode).await
    }

    pub async fn create_symbolic_link(&self, target: &[u8]) -> Result<()> {
        self.fs.backend()?.create_symbolic_link(&self.bytes, target).await
    }

    pub async fn delete(&self) -> Result<()> {
        self.fs.backend()?.delete(&self.bytes).await
    }

    pub async fn read_dir(&self) -> Result<Vec<DirectoryEntry>> {
        self.fs.backend()?.list_directory(&self.bytes).await
    }

    pub async fn children(&self) -> Result<Vec<Path>> {
        Ok(self
            .read_dir()
            .await?
            .into_iter()
            .map(|entry| self.join(&entry.name))
            .collect())
    }

    pub async fn open_byte_channel(&self, options: OpenOptions) -> Result<Box<dyn ByteChannel>> {
        self.fs.backend()?.open_byte_channel(&self.bytes, options).await
    }

    pub async fn read_all(&self) -> Result<Vec<u8>> {
        let channel = self.open_byte_channel(OpenOptions::read()).await?;
        let data = read_to_end(channel.as_ref()).await;
        channel.close().await?;
        data
    }

    pub async fn write_all(&self, data: &[u8]) -> Result<()> {
        let channel = self.open_byte_channel(OpenOptions::write()).await?;
        let written = write_all(channel.as_ref(), data).await;
        channel.close().await?;
        written
    }

    /// 复制到 `target`，跨文件系统时通过字节通道流式复制
    pub async fn copy_to(&self, target: &Path, options: CopyOptions) -> Result<()> {
        if Arc::ptr_eq(&self.fs, &target.fs) {
            return self.fs.backend()?.copy(&self.bytes, &target.bytes, options).await;
        }
        debug!("cross file system copy: {} -> {}", self, target);
        let attrs = self.read_attributes(options.follow_links).await?;
        if attrs.is_directory() {
            return target.create_directory(attrs.permissions()).await;
        }
        let mut open = OpenOptions::write();
        if !options.replace_existing {
            open.create_new = true;
        }
        open.mode = attrs.permissions();
        let source = self.open_byte_channel(OpenOptions::read()).await?;
        let sink = target.open_byte_channel(open).await?;
        loop {
            let chunk = source.read(CHANNEL_CHUNK).await?;
            if chunk.is_empty() {
                break;
            }
            write_all(sink.as_ref(), &chunk).await?;
        }
        source.close().await?;
        sink.close().await?;
        if options.copy_attributes {
            target
                .attribute_view(true)
                .await?
                .set_times(Some(attrs.last_modified), Some(attrs.last_access))
                .await?;
        }
        Ok(())
    }

    pub async fn move_to(&self, target: &Path, options: CopyOptions) -> Result<()> {
        if Arc::ptr_eq(&self.fs, &target.fs) {
            return self.fs.backend()?.move_file(&self.bytes, &target.bytes, options).await;
        }
        self.copy_to(target, CopyOptions { copy_attributes: true, ..options }).await?;
        self.delete().await
    }

    pub async fn file_store(&self) -> Result<Arc<dyn FileStore>> {
        self.fs.backend()?.file_store(&self.bytes).await
    }

    pub async fn attribute_view(&self, follow_links: bool) -> Result<Arc<dyn PosixFileAttributeView>> {
        self.fs.backend()?.attribute_view(&self.bytes, follow_links).await
    }

    pub async fn register(&self, service: &dyn WatchService, kinds: &[WatchEventKind]) -> Result<WatchKey> {
        self.fs.backend()?;
        service.register(&self.bytes, kinds).await
    }

    pub async fn file_type(&self) -> Result<FileType> {
        Ok(self.read_attributes(false).await?.file_type)
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.fs, &other.fs) && self.bytes == other.bytes
    }
}

impl Eq for Path {}

impl PartialOrd for Path {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if Arc::ptr_eq(&self.fs, &other.fs) {
            Some(self.bytes.cmp(&other.bytes))
        } else {
            None
        }
    }
}

impl Hash for Path {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fs.id().hash(state);
        self.bytes.hash(state);
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({})", self.to_uri_string())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uri_string())
    }
}

#[cfg(test)]
mod tests {
    use crate::bytes::ByteString;
    use crate::config::Config;
    use crate::error::FsError;
    use crate::fs::Authority;
    use crate::registry::Registry;
    use std::os::unix::ffi::OsStrExt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_normalization_and_components() {
        let registry = Registry::with_defaults(Config::default());
        let fs = registry.get_or_create_file_system("file", &Authority::Local).await.unwrap();

        let path = fs.path("//a/./b//c/");
        assert_eq!(path.as_bytes(), b"/a/b/c");
        assert_eq!(path.components(), vec![&b"a"[..], &b"b"[..], &b"c"[..]]);
        assert_eq!(path.file_name(), Some(&b"c"[..]));
        assert_eq!(path.parent().unwrap().as_bytes(), b"/a/b");
        assert_eq!(fs.path("/").parent(), None);
        assert_eq!(fs.path("/a").parent().unwrap().as_bytes(), b"/");
        assert_eq!(fs.path("/a/b/../../../c").normalize().as_bytes(), b"/c");
        assert_eq!(fs.path("x/../../y").normalize().as_bytes(), b"../y");
        assert_eq!(path.join(b"d").as_bytes(), b"/a/b/c/d");
        assert_eq!(path.join(b"/abs").as_bytes(), b"/abs");
        assert!(path.starts_with(&fs.path("/a/b")));
        assert!(!path.starts_with(&fs.path("/a/bc")));
    }

    #[tokio::test]
    async fn test_paths_from_different_file_systems_are_incomparable() {
        let registry = Registry::with_defaults(Config::default());
        let local = registry.get_or_create_file_system("file", &Authority::Local).await.unwrap();
        registry.remove_file_system(&local).await.unwrap();
        let other = registry.get_or_create_file_system("file", &Authority::Local).await.unwrap();

        let a = local.path("/tmp");
        let b = other.path("/tmp");
        assert_ne!(a, b);
        assert_eq!(a.partial_cmp(&b), None);
        assert!(!a.starts_with(&b));
    }

    #[tokio::test]
    async fn test_closed_file_system_rejects_operations() {
        let registry = Registry::with_defaults(Config::default());
        let fs = registry.get_or_create_file_system("file", &Authority::Local).await.unwrap();
        let path = fs.path("/");
        registry.remove_file_system(&fs).await.unwrap();

        assert!(matches!(path.read_attributes(true).await, Err(FsError::ClosedFileSystem)));
        assert!(matches!(path.read_dir().await, Err(FsError::ClosedFileSystem)));
    }

    #[tokio::test]
    async fn test_read_write_and_children() {
        let temp_dir = TempDir::new().unwrap();
        let registry = Registry::with_defaults(Config::default());
        let fs = registry.get_or_create_file_system("file", &Authority::Local).await.unwrap();
        let dir = fs.path(ByteString::from(temp_dir.path().as_os_str().as_bytes()));

        let file = dir.join(b"hello.txt");
        file.write_all(b"hello world").await.unwrap();
        assert_eq!(file.read_all().await.unwrap(), b"hello world");
        assert!(file.exists().await.unwrap());
        assert!(!dir.join(b"nope").exists().await.unwrap());

        let children = dir.children().await.unwrap();
        assert_eq!(children, vec![file.clone()]);
    }
}
