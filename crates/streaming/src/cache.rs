use std::collections::BTreeMap;
use std::time::Instant;

use bytes::Bytes;
use foundation::GeoBoundingBox;

/// Horizontal quantization step (degrees).
pub const HORIZONTAL_STEP_DEG: f64 = 0.05;
/// Vertical quantization step (meters).
pub const VERTICAL_STEP_M: f64 = 500.0;

pub const DEFAULT_CACHE_CAPACITY: usize = 4;

/// Key of a cached volume window.
///
/// Built from the window quantized to a fixed grid, so continuous camera motion
/// maps onto a finite set of windows: boxes closer than one grid step share a
/// key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey(String);

fn quantize(value: f64, step: f64) -> i64 {
    (value / step).round() as i64
}

impl CacheKey {
    /// `levels` are expected to be normalized (sorted, de-duplicated).
    pub fn for_window(
        bbox: &GeoBoundingBox,
        levels: &[u32],
        resolution_m: f64,
        valid_time: Option<&str>,
    ) -> Self {
        let h = |v: f64| quantize(v, HORIZONTAL_STEP_DEG);
        let v = |v: f64| quantize(v, VERTICAL_STEP_M);
        let levels = levels
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let time = valid_time.unwrap_or("-");

        Self(format!(
            "{}:{}:{}:{}:{}:{}|{}|{}|{}",
            h(bbox.west),
            h(bbox.south),
            h(bbox.east),
            h(bbox.north),
            v(bbox.bottom),
            v(bbox.top),
            levels,
            resolution_m.round() as i64,
            time
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    data: Bytes,
    inserted_at: Instant,
    last_used_tick: u64,
}

/// Small LRU cache of raw VolumePack payloads.
///
/// Capacity is an entry count: each entry may be several megabytes, so this is
/// meant to absorb camera hovering and back-and-forth motion across window
/// boundaries, not to be a long-term store.
///
/// Eviction is LRU by `last_used_tick`; `get` counts as a use.
#[derive(Debug)]
pub struct VolumeCache {
    capacity: usize,
    tick: u64,
    entries: BTreeMap<CacheKey, CacheEntry>,
}

impl Default for VolumeCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl VolumeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Presence check that does not count as a use.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&mut self, key: &CacheKey) -> Option<Bytes> {
        self.tick += 1;
        let entry = self.entries.get_mut(key)?;
        entry.last_used_tick = self.tick;
        Some(entry.data.clone())
    }

    /// When the entry was stored (not when it was last used).
    pub fn inserted_at(&self, key: &CacheKey) -> Option<Instant> {
        self.entries.get(key).map(|e| e.inserted_at)
    }

    /// Insert or replace an entry, returning the keys evicted to stay within capacity.
    pub fn set(&mut self, key: CacheKey, data: Bytes) -> Vec<CacheKey> {
        self.tick += 1;
        self.entries.insert(
            key.clone(),
            CacheEntry {
                data,
                inserted_at: Instant::now(),
                last_used_tick: self.tick,
            },
        );

        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .filter(|(k, _)| **k != key)
                .min_by_key(|(_, e)| e.last_used_tick)
                .map(|(k, _)| k.clone());
            let Some(oldest) = oldest else {
                break;
            };
            self.entries.remove(&oldest);
            evicted.push(oldest);
        }
        evicted
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
