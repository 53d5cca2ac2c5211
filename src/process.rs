//! Owning-process lookup.
//!
//! The platform lookup itself lives behind [`ProcessDumper`]; this module
//! caches its answers and normalises executable paths so rule patterns and
//! looked-up paths compare equal.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::error::Result;
use crate::types::Network;

/// Default LRU cache size for process lookups
pub const DEFAULT_PROCESS_CACHE_SIZE: usize = 1024;

const DELETED_SUFFIX: &str = " (deleted)";

/// Process owning a socket.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Process {
    /// Executable path
    pub path: String,
    pub pid: u32,
    pub uid: u32,
}

impl Process {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Platform process-by-socket lookup.
pub trait ProcessDumper: Send + Sync {
    fn process_name(
        &self,
        network: Network,
        source: SocketAddr,
        destination: SocketAddr,
    ) -> Result<Process>;
}

type CacheKey = (Network, SocketAddr, SocketAddr);

/// [`ProcessDumper`] front with an LRU cache of successful lookups.
pub struct ProcessCache {
    dumper: Arc<dyn ProcessDumper>,
    cache: Mutex<LruCache<CacheKey, Process>>,
}

impl ProcessCache {
    pub fn new(dumper: Arc<dyn ProcessDumper>, cache_size: usize) -> Self {
        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            dumper,
            cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    /// First process found for `source` against each candidate destination,
    /// in order.
    ///
    /// The cache lock is never held while the dumper runs.
    pub fn lookup(
        &self,
        network: Network,
        source: SocketAddr,
        destinations: &[SocketAddr],
    ) -> Option<Process> {
        for destination in destinations {
            let key = (network, source, *destination);

            if let Some(cached) = self.cache.lock().get(&key) {
                return Some(cached.clone());
            }

            if let Ok(process) = self.dumper.process_name(network, source, *destination) {
                self.cache.lock().put(key, process.clone());
                return Some(process);
            }
        }
        None
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

/// Drop the trailing ` (deleted)` the kernel appends to replaced binaries.
pub fn trim_deleted(path: &str) -> &str {
    path.strip_suffix(DELETED_SUFFIX).unwrap_or(path)
}

/// Canonical form of an executable path for the path trie.
///
/// Trims ` (deleted)`, turns `\` into `/`, drops empty and `.` segments
/// and the leading separator: `/usr//bin/./curl` becomes `usr/bin/curl`,
/// `C:\Tools\app.exe` becomes `C:/Tools/app.exe`.
pub fn normalize_process_path(path: &str) -> String {
    let path = trim_deleted(path.trim()).replace('\\', "/");
    path.split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}
