//! Scheme → provider table plus the per-authority FileSystem identity cache.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheStats, FileSystemCache};
use crate::config::Config;
use crate::error::{FsError, Result};
use crate::fs::{Authority, FileSystem, FileSystemProvider, Path};
use crate::storage::{ArchiveProvider, LocalProvider};

#[derive(Debug)]
pub struct Registry {
    config: Config,
    providers: RwLock<HashMap<String, Arc<dyn FileSystemProvider>>>,
    cache: FileSystemCache,
}

impl Registry {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            providers: RwLock::new(HashMap::new()),
            cache: FileSystemCache::new(),
        }
    }

    /// 预装 `file` 与 `archive` provider 的注册表
    pub fn with_defaults(config: Config) -> Arc<Self> {
        let registry = Arc::new(Self::new(config));
        let watch = registry.config.watch.clone();
        let defaults: [Arc<dyn FileSystemProvider>; 2] = [
            Arc::new(LocalProvider::new(watch.clone())),
            Arc::new(ArchiveProvider::new(Arc::downgrade(&registry), watch)),
        ];
        for provider in defaults {
            // 新建的表不会冲突
            if let Err(e) = registry.register(provider) {
                warn!("default provider skipped: {}", e);
            }
        }
        registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn register(&self, provider: Arc<dyn FileSystemProvider>) -> Result<()> {
        let scheme = provider.scheme().to_string();
        let mut providers = self.providers.write().unwrap_or_else(|p| p.into_inner());
        if providers.contains_key(&scheme) {
            return Err(FsError::SchemeAlreadyRegistered(scheme));
        }
        info!("provider registered: {}", scheme);
        providers.insert(scheme, provider);
        Ok(())
    }

    pub fn provider(&self, scheme: &str) -> Result<Arc<dyn FileSystemProvider>> {
        self.providers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(scheme)
            .cloned()
            .ok_or_else(|| FsError::UnsupportedScheme(scheme.to_string()))
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<_> = self
            .providers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        schemes.sort();
        schemes
    }

    /// 获取 `(scheme, authority)` 对应的 FileSystem，首次使用时创建
    /// 并发的首次调用共享同一次创建
    pub async fn get_or_create_file_system(&self, scheme: &str, authority: &Authority) -> Result<Arc<FileSystem>> {
        let provider = self.provider(scheme)?;
        let key = CacheKey::new(scheme, authority.clone());
        self.cache
            .get_or_create(&key, || {
                let provider = provider.clone();
                let authority = authority.clone();
                async move {
                    debug!("constructing file system {}:{}", provider.scheme(), authority);
                    let backend = provider.new_file_system(&authority).await?;
                    Ok(FileSystem::new(provider, authority, backend))
                }
            })
            .await
    }

    /// 只查找，缓存中没有时返回 `NotFound`
    pub fn get_file_system(&self, scheme: &str, authority: &Authority) -> Result<Arc<FileSystem>> {
        self.provider(scheme)?;
        self.cache
            .get(&CacheKey::new(scheme, authority.clone()))
            .ok_or_else(|| FsError::NotFound(format!("{}:{}", scheme, authority)))
    }

    /// 从缓存移除 `fs`（仍是缓存中的实例时）并关闭
    pub async fn remove_file_system(&self, fs: &Arc<FileSystem>) -> Result<()> {
        let key = CacheKey::new(fs.scheme(), fs.authority().clone());
        if self.cache.remove(&key, fs) {
            debug!("file system evicted: {}", key);
        }
        fs.close().await
    }

    /// 把 `scheme:rest` 解析为对应 FileSystem 上的 Path
    pub async fn parse_path(&self, uri: &str) -> Result<Path> {
        let (scheme, rest) = uri
            .split_once(':')
            .ok_or_else(|| FsError::InvalidPath(format!("missing scheme: {}", uri)))?;
        let provider = self.provider(scheme)?;
        let (authority, path) = provider.parse_uri(rest)?;
        let fs = self.get_or_create_file_system(scheme, &authority).await?;
        Ok(fs.path(path))
    }

    /// 关闭所有缓存的 FileSystem
    pub async fn shutdown(&self) {
        let file_systems = self.cache.drain();
        info!("registry shutdown: closing {} file systems", file_systems.len());
        for fs in file_systems {
            if let Err(e) = fs.close().await {
                warn!("closing {:?} failed: {}", fs, e);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
