//! LRU cache for decoded raster tiles.

use std::sync::Arc;

use lru::LruCache;
use serde::Serialize;
use tokio::sync::Mutex;

/// Cache key: (source slot, band, tile index within the band).
///
/// The slot tells apart the member files of a VRT sharing one cache; a
/// standalone GeoTIFF uses slot 0.
pub type TileKey = (usize, usize, usize);

/// One handle's cache, shared by every source that handle reads through.
pub type SharedTileCache = Arc<Mutex<TileCache>>;

/// Decoded tile samples, shared with readers.
pub type TileData = Arc<Vec<f64>>;

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TileCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub memory_bytes: u64,
    pub evictions: u64,
}

/// LRU cache for decoded tiles with memory-bounded eviction.
///
/// Owned by a single raster handle; never shared across handles. A VRT
/// handle shares its one budget among all of its members.
pub struct TileCache {
    cache: LruCache<TileKey, TileData>,
    memory_limit: usize,
    current_memory: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl std::fmt::Debug for TileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileCache")
            .field("entries", &self.cache.len())
            .field("memory_bytes", &self.current_memory)
            .field("memory_limit", &self.memory_limit)
            .finish()
    }
}

fn tile_bytes(data: &TileData) -> usize {
    data.len() * std::mem::size_of::<f64>()
}

impl TileCache {
    /// Create a cache holding at most `memory_limit` bytes of samples.
    pub fn new(memory_limit: usize) -> Self {
        Self {
            cache: LruCache::unbounded(),
            memory_limit,
            current_memory: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn shared(memory_limit: usize) -> SharedTileCache {
        Arc::new(Mutex::new(Self::new(memory_limit)))
    }

    pub fn get(&mut self, key: &TileKey) -> Option<TileData> {
        match self.cache.get(key) {
            Some(data) => {
                self.hits += 1;
                Some(Arc::clone(data))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert a tile, evicting least recently used tiles to make room.
    /// Tiles larger than the whole budget are not cached.
    pub fn insert(&mut self, key: TileKey, data: TileData) {
        let size = tile_bytes(&data);
        if size > self.memory_limit {
            return;
        }

        if let Some(previous) = self.cache.pop(&key) {
            self.current_memory = self.current_memory.saturating_sub(tile_bytes(&previous));
        }

        while self.current_memory + size > self.memory_limit {
            match self.cache.pop_lru() {
                Some((_, evicted)) => {
                    self.current_memory = self.current_memory.saturating_sub(tile_bytes(&evicted));
                    self.evictions += 1;
                }
                None => break,
            }
        }

        self.cache.put(key, data);
        self.current_memory += size;
    }

    pub fn stats(&self) -> TileCacheStats {
        TileCacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.cache.len(),
            memory_bytes: self.current_memory as u64,
            evictions: self.evictions,
        }
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.current_memory = 0;
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
