//! Thread-safe cache of emitted output hashes.
//!
//! The dev loop records every build's outputs here. Files whose content
//! differs from the previous build (or that disappeared) are marked dirty
//! and drained into the `changed` list of the next `do-update`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use crate::host::EmittedSource;
use crate::utils::stable_hash_8_bytes;

/// Output hashes keyed by emitted file name, with dirty tracking.
#[derive(Debug, Clone, Default)]
pub struct OutputCache {
    inner: Arc<RwLock<HashMap<String, String>>>,
    /// Files modified since the last `take_changed`.
    dirty: Arc<RwLock<BTreeSet<String>>>,
}

impl OutputCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the content of `file`. Returns whether it changed.
    pub fn record(&self, file: &str, content: &[u8]) -> bool {
        let hash = stable_hash_8_bytes(content);
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if map.get(file) == Some(&hash) {
            return false;
        }
        map.insert(file.to_string(), hash);
        self.dirty
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(file.to_string());
        true
    }

    /// Record a whole build. Files absent from `files` are dropped and
    /// marked dirty. Returns how many files changed.
    pub fn record_build(&self, files: &BTreeMap<String, EmittedSource>) -> usize {
        let mut changed = 0;
        for (name, source) in files {
            if self.record(name, source.as_bytes()) {
                changed += 1;
            }
        }

        let removed: Vec<String> = {
            let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            map.keys()
                .filter(|name| !files.contains_key(*name))
                .cloned()
                .collect()
        };
        for name in removed {
            self.invalidate(&name);
            changed += 1;
        }
        changed
    }

    /// Forget a file and mark it dirty.
    pub fn invalidate(&self, file: &str) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut dirty = self.dirty.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(file);
        dirty.insert(file.to_string());
    }

    /// Drain the dirty set, sorted.
    pub fn take_changed(&self) -> Vec<String> {
        let mut dirty = self.dirty.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *dirty).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
