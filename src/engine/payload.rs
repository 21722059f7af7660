use bytes::Bytes;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Distinct buffers kept per chunk size. Upload workers cycle through the
/// variants so the server cannot benefit from caching a single body.
const POOL_VARIANTS: usize = 4;

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * 1024;

/// Pool of pseudo-random payload chunks, generated once per size and shared
/// across all upload workers via cheap `Bytes` clones. Generating a 2 MiB
/// buffer per POST would dominate CPU at gigabit rates; the pool makes
/// payload supply O(1) after first use.
pub struct PayloadPool {
    cache: Mutex<HashMap<usize, Arc<Vec<Bytes>>>>,
}

impl Default for PayloadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadPool {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Chunk variants of `size` bytes, generating and caching on first use.
    pub fn chunks(&self, size: usize) -> Arc<Vec<Bytes>> {
        let mut cache = self.cache.lock().expect("payload cache poisoned");
        cache
            .entry(size)
            .or_insert_with(|| {
                let variants = (0..POOL_VARIANTS).map(|_| random_chunk(size)).collect();
                Arc::new(variants)
            })
            .clone()
    }
}

fn random_chunk(size: usize) -> Bytes {
    let mut buf = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut buf);
    Bytes::from(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_have_requested_size() {
        let pool = PayloadPool::new();
        let chunks = pool.chunks(64 * KIB);
        assert_eq!(chunks.len(), POOL_VARIANTS);
        assert!(chunks.iter().all(|c| c.len() == 64 * KIB));
    }

    #[test]
    fn pool_reuses_buffers_per_size() {
        let pool = PayloadPool::new();
        let a = pool.chunks(128 * KIB);
        let b = pool.chunks(128 * KIB);
        assert!(Arc::ptr_eq(&a, &b));
        let c = pool.chunks(256 * KIB);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn variants_differ() {
        let pool = PayloadPool::new();
        let chunks = pool.chunks(4 * KIB);
        assert_ne!(chunks[0], chunks[1]);
    }
}
