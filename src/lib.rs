pub mod bytes;
pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod launcher;
pub mod lock;
pub mod posix;
pub mod registry;
pub mod remote;
pub mod service;
pub mod storage;
pub mod watch;

pub use bytes::ByteString;
pub use config::Config;
pub use error::{FsError, NativeSyscallError, RemoteFileSystemError, Result};
pub use fs::{Authority, FileSystem, FileSystemProvider, Path};
pub use launcher::{ServiceLauncher, ServiceState};
pub use registry::Registry;
pub use remote::{PrivilegedProvider, RemoteInterface};
pub use service::RootFileService;
pub use watch::{WatchEvent, WatchEventKind, WatchKey, WatchService};
