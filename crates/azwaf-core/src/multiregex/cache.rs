//! Persistent cache for prepared regex databases
//!
//! Databases are keyed by a SHA-1 fingerprint over every `(id, expression, flags)`
//! triple. Blobs are versioned; unreadable or mismatching blobs are ignored
//! and the database is rebuilt.

use super::backref::BackrefRegex;
use super::Pattern;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::io;
use std::path::{Path, PathBuf};

const CACHE_FORMAT_VERSION: u32 = 1;

/// Directory name next to the executable
pub const CACHE_DIR_NAME: &str = "hyperscancache";

/// One pattern after PCRE normalisation and backreference rewriting
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedPattern {
    pub id: usize,
    pub expr: String,
    pub backref: Option<BackrefRegex>,
}

#[derive(Serialize, Deserialize)]
struct CachedDatabase {
    version: u32,
    cache_id: String,
    patterns: Vec<PreparedPattern>,
}

/// File system operations the cache needs
pub trait CacheFilesystem: Send + Sync {
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    fn create_dir_all(&self, dir: &Path) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn cache_dir(&self) -> PathBuf;
}

/// Cache directory co-located with the running executable
#[derive(Clone, Debug, Default)]
pub struct OsCacheFilesystem {
    dir_override: Option<PathBuf>,
}

impl OsCacheFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit directory instead of the executable-relative one
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir_override: Some(dir.into()),
        }
    }
}

impl CacheFilesystem for OsCacheFilesystem {
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        std::fs::write(path, data)
    }

    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        std::fs::create_dir_all(dir)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.dir_override {
            return dir.clone();
        }
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_default();
        exe_dir.join(CACHE_DIR_NAME)
    }
}

/// Cache of prepared regex databases
pub struct DbCache {
    fs: Box<dyn CacheFilesystem>,
}

impl DbCache {
    pub fn new(fs: Box<dyn CacheFilesystem>) -> Self {
        Self { fs }
    }

    /// 40 hex character fingerprint of a pattern set
    pub fn cache_id(patterns: &[Pattern], flags: u32) -> String {
        let mut hasher = Sha1::new();
        for p in patterns {
            hasher.update(p.id.to_string().as_bytes());
            hasher.update(p.expr.as_bytes());
            hasher.update(flags.to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn load(&self, cache_id: &str) -> Option<Vec<PreparedPattern>> {
        let dir = self.fs.cache_dir();
        if !self.fs.exists(&dir) {
            return None;
        }

        let bytes = self.fs.read_file(&dir.join(cache_id)).ok()?;
        let cached: CachedDatabase = serde_json::from_slice(&bytes).ok()?;
        if cached.version != CACHE_FORMAT_VERSION || cached.cache_id != cache_id {
            return None;
        }

        Some(cached.patterns)
    }

    pub fn save(&self, cache_id: &str, patterns: &[PreparedPattern]) {
        let dir = self.fs.cache_dir();
        if let Err(e) = self.fs.create_dir_all(&dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "Failed to create regex cache directory");
            return;
        }

        let blob = CachedDatabase {
            version: CACHE_FORMAT_VERSION,
            cache_id: cache_id.to_string(),
            patterns: patterns.to_vec(),
        };
        let bytes = match serde_json::to_vec(&blob) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize regex database");
                return;
            }
        };

        if let Err(e) = self.fs.write_file(&dir.join(cache_id), &bytes) {
            tracing::warn!(cache_id, error = %e, "Failed to write regex database to cache");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub(crate) struct MemoryCacheFilesystem {
        pub files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
    }

    impl CacheFilesystem for MemoryCacheFilesystem {
        fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
            self.files
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "not found"))
        }

        fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
            self.files.lock().unwrap().insert(path.to_path_buf(), data.to_vec());
            Ok(())
        }

        fn create_dir_all(&self, _dir: &Path) -> io::Result<()> {
            Ok(())
        }

        fn exists(&self, _path: &Path) -> bool {
            true
        }

        fn cache_dir(&self) -> PathBuf {
            PathBuf::from("/cache")
        }
    }

    fn patterns() -> Vec<Pattern> {
        vec![
            Pattern { id: 1, expr: "abc".into() },
            Pattern { id: 2, expr: "de+f".into() },
        ]
    }

    #[test]
    fn test_cache_id_stable() {
        let a = DbCache::cache_id(&patterns(), 0);
        let b = DbCache::cache_id(&patterns(), 0);
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
        assert_ne!(a, DbCache::cache_id(&patterns(), 8));
        assert_ne!(a, DbCache::cache_id(&patterns()[..1], 0));
    }

    #[test]
    fn test_save_and_load() {
        let fs = MemoryCacheFilesystem::default();
        let cache = DbCache::new(Box::new(fs.clone()));
        let id = DbCache::cache_id(&patterns(), 0);
        let prepared = vec![PreparedPattern { id: 1, expr: "abc".into(), backref: None }];

        assert!(cache.load(&id).is_none());
        cache.save(&id, &prepared);
        assert_eq!(cache.load(&id), Some(prepared));
    }

    #[test]
    fn test_corrupt_blob_is_ignored() {
        let fs = MemoryCacheFilesystem::default();
        let id = DbCache::cache_id(&patterns(), 0);
        fs.files
            .lock()
            .unwrap()
            .insert(PathBuf::from("/cache").join(&id), b"\x00garbage".to_vec());

        let cache = DbCache::new(Box::new(fs));
        assert!(cache.load(&id).is_none());
    }
}
