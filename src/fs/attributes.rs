use serde::{Deserialize, Serialize};

use crate::bytes::ByteString;
use crate::posix::{FileTime, FileType};

/// 用户或组：数字 ID 加上解析出的名称（如果有）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosixPrincipal {
    pub id: u32,
    pub name: Option<ByteString>,
}

impl PosixPrincipal {
    pub fn new(id: u32, name: Option<ByteString>) -> Self {
        Self { id, name }
    }
}

/// 不可变的属性快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosixFileAttributes {
    pub file_type: FileType,
    pub size: u64,
    pub mode: u32,
    pub owner: PosixPrincipal,
    pub group: PosixPrincipal,
    pub last_modified: FileTime,
    pub last_access: FileTime,
    pub status_changed: FileTime,
    pub inode: u64,
    pub link_count: u64,
    pub symlink_target: Option<ByteString>,
}

impl PosixFileAttributes {
    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_regular_file(&self) -> bool {
        self.file_type == FileType::Regular
    }

    pub fn is_symbolic_link(&self) -> bool {
        self.file_type == FileType::Symlink
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// 按 `ls -l` 的格式显示权限位
pub fn permissions_string(mode: u32) -> String {
    let bits = [
        (0o400, 'r'), (0o200, 'w'), (0o100, 'x'),
        (0o040, 'r'), (0o020, 'w'), (0o010, 'x'),
        (0o004, 'r'), (0o002, 'w'), (0o001, 'x'),
    ];
    bits.iter()
        .map(|&(bit, c)| if mode & bit != 0 { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permissions_string() {
        assert_eq!(permissions_string(0o755), "rwxr-xr-x");
        assert_eq!(permissions_string(0o100640), "rw-r-----");
    }
}
