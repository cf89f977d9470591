use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// 配置文件路径的环境变量
pub const CONFIG_ENV: &str = "UNIFS_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub launcher: LauncherConfig,
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// 由系统级特权代理托管的通道
    Managed,
    /// 直接启动的特权守护进程
    Daemon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// 与特权进程协商的构建版本
    pub version: String,
    pub channel: ChannelKind,
    pub bind_timeout_ms: u64,
    /// 启动守护进程的命令，例如 `["su", "-c", "unifsd --stdio"]`
    pub daemon_command: Vec<String>,
    /// 套接字模式：守护进程监听的路径
    pub socket_path: Option<PathBuf>,
    /// 套接字模式：守护进程锁文件
    pub lock_path: Option<PathBuf>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            channel: ChannelKind::Daemon,
            bind_timeout_ms: 10_000,
            daemon_command: vec![
                "su".to_string(),
                "-c".to_string(),
                "unifsd --stdio".to_string(),
            ],
            socket_path: None,
            lock_path: None,
        }
    }
}

impl LauncherConfig {
    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// 每个 watch key 的待处理事件上限
    pub queue_capacity: usize,
    pub poll_interval_ms: u64,
    /// 使用内核通知（inotify）的 scheme，其余 scheme 使用轮询
    pub native_schemes: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 512,
            poll_interval_ms: 2_000,
            native_schemes: vec!["file".to_string()],
        }
    }
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn is_native(&self, scheme: &str) -> bool {
        self.native_schemes.iter().any(|s| s == scheme)
    }
}

impl Config {
    /// 从 JSON 文件加载配置，缺失字段使用默认值
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| {
            crate::error::FsError::InvalidOperation(format!("配置文件解析失败 {:?}: {}", path, e))
        })
    }

    /// 读取 `UNIFS_CONFIG` 指向的配置；未设置时返回默认配置
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_config_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"watch": {{"poll_interval_ms": 250}}}}"#).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.watch.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.watch.queue_capacity, 512);
        assert_eq!(config.launcher.channel, ChannelKind::Daemon);
        assert!(config.watch.is_native("file"));
        assert!(!config.watch.is_native("sftp"));
    }

    #[test]
    fn test_invalid_config() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
