use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use unifs::config::Config;
use unifs::lock::{remove_if_exists, DaemonLock};
use unifs::registry::Registry;
use unifs::service::RootFileService;

/// 特权文件服务守护进程
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 通过标准输入输出为单个客户端服务
    #[arg(long, conflicts_with = "socket")]
    stdio: bool,

    /// 监听的 Unix 套接字
    #[arg(short, long, requires = "lock")]
    socket: Option<PathBuf>,

    /// 守护进程锁文件
    #[arg(short, long)]
    lock: Option<PathBuf>,

    /// 套接字归属的用户 ID（发起启动的非特权用户）
    #[arg(long)]
    owner: Option<u32>,
}

#[tokio::main]
async fn main() {
    // 标准输出是协议通道，日志只能写到标准错误
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("unifsd 退出: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::from_env().context("加载配置失败")?;
    let version = config.launcher.version.clone();
    let registry = Registry::with_defaults(config);

    match (args.stdio, args.socket, args.lock) {
        (true, _, _) => serve_stdio(registry.clone(), &version).await,
        (false, Some(socket), Some(lock)) => serve_socket(registry.clone(), &version, socket, lock, args.owner).await?,
        _ => return Err(anyhow!("需要 --stdio 或者 --socket 与 --lock")),
    }

    registry.shutdown().await;
    Ok(())
}

async fn serve_stdio(registry: Arc<Registry>, version: &str) {
    info!("unifsd {} 通过标准输入输出服务", version);
    let service = Arc::new(RootFileService::new(registry, version));
    tokio::select! {
        _ = service.serve(tokio::io::stdin(), tokio::io::stdout()) => info!("客户端已断开"),
        _ = shutdown_signal() => info!("接收到终止信号"),
    }
}

async fn serve_socket(
    registry: Arc<Registry>,
    version: &str,
    socket: PathBuf,
    lock: PathBuf,
    owner: Option<u32>,
) -> Result<()> {
    let mut daemon_lock = DaemonLock::acquire_replacing(&lock, version, &socket).await?;
    remove_if_exists(&socket)?;
    let listener = UnixListener::bind(&socket).with_context(|| format!("监听 {:?} 失败", socket))?;
    // 仅允许属主连接
    std::fs::set_permissions(&socket, std::fs::Permissions::from_mode(0o600))?;
    if let Some(uid) = owner {
        unifs::posix::chown(socket.as_os_str().as_bytes(), Some(uid), None, true)?;
    }
    info!("unifsd {} 监听 {:?} (pid {})", version, socket, daemon_lock.info().pid);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    info!("新客户端连接");
                    let (reader, writer) = stream.into_split();
                    let service = Arc::new(RootFileService::new(registry.clone(), version));
                    tokio::spawn(service.serve(reader, writer));
                }
                Err(e) => warn!("接受连接失败: {}", e),
            },
            _ = &mut shutdown => {
                info!("接收到终止信号，停止监听");
                break;
            }
        }
    }

    drop(listener);
    if let Err(e) = remove_if_exists(&socket) {
        warn!("{}", e);
    }
    daemon_lock.release()?;
    Ok(())
}

async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("无法监听 SIGTERM: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("无法监听 Ctrl+C 信号: {}", e);
            }
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
