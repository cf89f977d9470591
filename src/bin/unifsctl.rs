use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use unifs::config::Config;
use unifs::fs::{permissions_string, PosixFileAttributes};
use unifs::launcher::ServiceLauncher;
use unifs::posix::{FileTime, FileType};
use unifs::registry::Registry;
use unifs::remote::PrivilegedProvider;
use unifs::watch::WatchEventKind;

/// 统一文件系统检查工具，例如 `unifsctl ls file:///tmp`
#[derive(Parser, Debug)]
#[command(author, version, about = "unifs inspection tool", long_about = None)]
struct Args {
    /// 注册 root:// scheme，首次使用时启动特权服务
    #[arg(long, global = true)]
    root: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 列出目录内容
    Ls { uri: String },
    /// 显示文件属性
    Stat {
        uri: String,
        /// 不跟随符号链接
        #[arg(long)]
        no_follow: bool,
    },
    /// 显示文件所在存储的容量
    Df { uri: String },
    /// 输出文件内容
    Cat { uri: String },
    /// 监听目录变化
    Watch {
        uri: String,
        /// 收到指定数量的事件后退出
        #[arg(short, long)]
        count: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = Config::from_env().context("加载配置失败")?;
    let registry = Registry::with_defaults(config.clone());

    let launcher = if args.root {
        let launcher = Arc::new(ServiceLauncher::from_config(&config.launcher, None));
        registry.register(Arc::new(PrivilegedProvider::with_launcher(
            launcher.clone(),
            config.watch.clone(),
        )))?;
        Some(launcher)
    } else {
        None
    };

    let result = run(&registry, args.command).await;

    registry.shutdown().await;
    if let Some(launcher) = launcher {
        launcher.shutdown().await;
    }
    result
}

async fn run(registry: &Registry, command: Command) -> Result<()> {
    match command {
        Command::Ls { uri } => {
            let dir = registry.parse_path(&uri).await?;
            let mut children = dir.children().await?;
            children.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
            for child in children {
                match child.read_attributes(false).await {
                    Ok(attrs) => println!("{}", long_line(&attrs, child.file_name().unwrap_or_default())),
                    Err(e) => warn!("{}: {}", child, e),
                }
            }
        }
        Command::Stat { uri, no_follow } => {
            let path = registry.parse_path(&uri).await?;
            let attrs = path.read_attributes(!no_follow).await?;
            println!("  File: {}", path);
            println!("  Type: {:?}", attrs.file_type);
            println!("  Size: {}", attrs.size);
            println!("  Mode: {:o} ({})", attrs.permissions(), permissions_string(attrs.mode));
            println!(" Owner: {} ({})", principal(&attrs.owner.name), attrs.owner.id);
            println!(" Group: {} ({})", principal(&attrs.group.name), attrs.group.id);
            println!(" Inode: {}  Links: {}", attrs.inode, attrs.link_count);
            println!("Modify: {}", time(attrs.last_modified));
            println!("Access: {}", time(attrs.last_access));
            println!("Change: {}", time(attrs.status_changed));
            if let Some(target) = &attrs.symlink_target {
                println!("  Link: {}", target);
            }
        }
        Command::Df { uri } => {
            let path = registry.parse_path(&uri).await?;
            let store = path.file_store().await?;
            let total = store.total_space().await?;
            let usable = store.usable_space().await?;
            let free = store.unallocated_space().await?;
            println!("{:<24} {:<10} {:>16} {:>16} {:>16}", "Store", "Type", "Total", "Free", "Available");
            println!(
                "{:<24} {:<10} {:>16} {:>16} {:>16}{}",
                store.name().await?,
                store.kind().await?,
                total,
                free,
                usable,
                if store.is_read_only().await? { " (ro)" } else { "" }
            );
        }
        Command::Cat { uri } => {
            use std::io::Write;
            let data = registry.parse_path(&uri).await?.read_all().await?;
            std::io::stdout().write_all(&data)?;
        }
        Command::Watch { uri, count } => {
            let dir = registry.parse_path(&uri).await?;
            let service = dir.file_system().new_watch_service().await?;
            dir.register(service.as_ref(), &WatchEventKind::ALL).await?;
            info!("监听 {}", dir);

            let mut seen = 0;
            while count.map_or(true, |count| seen < count) {
                let key = tokio::select! {
                    key = service.take() => key?,
                    _ = tokio::signal::ctrl_c() => break,
                };
                for event in key.poll_events() {
                    let name = event.name.map(|n| n.to_string_lossy()).unwrap_or_default();
                    println!("{:<8} {}", format!("{:?}", event.kind), name);
                    seen += 1;
                }
                if !key.is_valid() {
                    warn!("watch key 已失效: {}", key.path());
                    break;
                }
            }
            service.close().await;
            // 留出时间让后台释放远程句柄
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
    Ok(())
}

fn long_line(attrs: &PosixFileAttributes, name: &[u8]) -> String {
    let kind = match attrs.file_type {
        FileType::Directory => 'd',
        FileType::Symlink => 'l',
        FileType::CharDevice => 'c',
        FileType::BlockDevice => 'b',
        FileType::Fifo => 'p',
        FileType::Socket => 's',
        _ => '-',
    };
    let mut line = format!(
        "{}{} {:>3} {:<8} {:<8} {:>12} {} {}",
        kind,
        permissions_string(attrs.mode),
        attrs.link_count,
        principal(&attrs.owner.name),
        principal(&attrs.group.name),
        attrs.size,
        time(attrs.last_modified),
        String::from_utf8_lossy(name),
    );
    if let Some(target) = &attrs.symlink_target {
        line.push_str(" -> ");
        line.push_str(&target.to_string_lossy());
    }
    line
}

fn principal(name: &Option<unifs::bytes::ByteString>) -> String {
    name.as_ref().map(|n| n.to_string_lossy()).unwrap_or_else(|| "?".to_string())
}

fn time(time: FileTime) -> String {
    DateTime::from_timestamp(time.seconds, time.nanos)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}
