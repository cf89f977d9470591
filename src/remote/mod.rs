//! 访问特权进程中的对象

mod client;
mod interface;
mod protocol;
mod transport;

pub use client::{
    PrivilegedProvider, RemoteAttributeView, RemoteByteChannel, RemoteFileStore, RemoteFileSystemBackend,
    RemoteWatchService,
};
pub use interface::{Liveness, RemoteInterface, RemoteObject};
pub use protocol::{
    encode_frame, read_frame, write_frame, Handle, Operation, Reply, Request, Response, StoreInfo, MAX_FRAME_LEN,
};
pub use transport::{InProcessTransport, StreamTransport, Transport};
