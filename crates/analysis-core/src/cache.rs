//! Symbol Cache (§2 item 8, §5): a bounded LRU of per-file symbol lists.
//! Invalidated per file on buffer edit; flushed entirely on session rebuild.

use std::path::{Path, PathBuf};

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use crate::facade::ResolvedSymbol;

const CAPACITY: usize = 128;

pub struct SymbolCache {
    inner: Mutex<LruCache<PathBuf, Vec<ResolvedSymbol>>>,
}

impl Default for SymbolCache {
    fn default() -> Self {
        SymbolCache {
            inner: Mutex::new(LruCache::new(NonZeroUsize::new(CAPACITY).unwrap())),
        }
    }
}

impl SymbolCache {
    pub fn get(&self, path: &Path) -> Option<Vec<ResolvedSymbol>> {
        self.inner.lock().unwrap().get(&path.to_path_buf()).cloned()
    }

    pub fn put(&self, path: PathBuf, symbols: Vec<ResolvedSymbol>) {
        self.inner.lock().unwrap().put(path, symbols);
    }

    /// Invalidation on buffer update removes exactly one entry (§5).
    pub fn invalidate(&self, path: &Path) {
        self.inner.lock().unwrap().pop(&path.to_path_buf());
    }

    /// Flushed entirely on session rebuild (§4.9).
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
