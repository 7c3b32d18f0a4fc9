use tokio::sync::RwLock;

use super::CacheKey;

const DEFAULT_STRIPES: usize = 64;

/// Fixed set of read/write locks; each key maps to one stripe by hash.
pub(super) struct KeyLocks {
    stripes: Vec<RwLock<()>>,
}

impl KeyLocks {
    pub(super) fn new() -> Self {
        Self::with_stripes(DEFAULT_STRIPES)
    }

    pub(super) fn with_stripes(count: usize) -> Self {
        let count = count.max(1);
        Self {
            stripes: (0..count).map(|_| RwLock::new(())).collect(),
        }
    }

    pub(super) fn stripe(&self, key: &CacheKey) -> &RwLock<()> {
        &self.stripes[self.index(key)]
    }

    fn index(&self, key: &CacheKey) -> usize {
        let hash = blake3::hash(key.as_str().as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash.as_bytes()[..8]);
        (u64::from_le_bytes(prefix) % self.stripes.len() as u64) as usize
    }
}
