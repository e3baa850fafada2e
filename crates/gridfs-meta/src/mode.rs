//! Path mode resolution
//!
//! Maps a namespace path to the mode of the most specific configured prefix.
//! Rules are immutable after construction; results are memoized in bounded
//! LRU caches keyed by path.

use gridfs_common::{FsMode, FsPath};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of paths remembered by each resolver cache
pub const MODE_CACHE_CAPACITY: usize = 1000;

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 { 0.0 } else { hits / total }
    }
}

struct LruState<K, V> {
    /// Least recently used first
    order: VecDeque<K>,
    values: HashMap<K, V>,
    capacity: usize,
}

/// Bounded least-recently-used map
struct LruCache<K, V> {
    state: Mutex<LruState<K, V>>,
    stats: CacheStats,
}

impl<K: Clone + Eq + Hash, V: Clone> LruCache<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LruState {
                order: VecDeque::with_capacity(capacity),
                values: HashMap::with_capacity(capacity),
                capacity,
            }),
            stats: CacheStats::default(),
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock();
        let Some(value) = state.values.get(key).cloned() else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        state.order.retain(|k| k != key);
        state.order.push_back(key.clone());
        drop(state);

        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    fn insert(&self, key: K, value: V) {
        let mut state = self.state.lock();
        if state.values.insert(key.clone(), value).is_some() {
            state.order.retain(|k| k != &key);
        }
        state.order.push_back(key);

        while state.values.len() > state.capacity {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.values.remove(&oldest);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn len(&self) -> usize {
        self.state.lock().values.len()
    }
}

/// Resolves the operating mode of namespace paths
pub struct ModeResolver {
    default_mode: FsMode,
    /// Most specific prefix first
    modes: Vec<(FsPath, FsMode)>,
    mode_cache: LruCache<FsPath, FsMode>,
    children_cache: LruCache<FsPath, BTreeSet<FsMode>>,
}

impl ModeResolver {
    pub fn new(default_mode: FsMode, mut modes: Vec<(FsPath, FsMode)>) -> Self {
        modes.sort_by(|a, b| b.0.depth().cmp(&a.0.depth()));

        Self {
            default_mode,
            modes,
            mode_cache: LruCache::new(MODE_CACHE_CAPACITY),
            children_cache: LruCache::new(MODE_CACHE_CAPACITY),
        }
    }

    #[must_use]
    pub const fn default_mode(&self) -> FsMode {
        self.default_mode
    }

    /// Rules ordered from the most to the least specific prefix
    #[must_use]
    pub fn modes_ordered(&self) -> &[(FsPath, FsMode)] {
        &self.modes
    }

    /// Mode of the longest configured prefix of `path`
    pub fn resolve_mode(&self, path: &FsPath) -> FsMode {
        if self.modes.is_empty() {
            return self.default_mode;
        }

        if let Some(mode) = self.mode_cache.get(path) {
            return mode;
        }

        let mode = self
            .modes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix))
            .map_or(self.default_mode, |(_, mode)| *mode);

        self.mode_cache.insert(path.clone(), mode);
        mode
    }

    /// Modes that apply to `path` and to anything below it
    pub fn resolve_children_modes(&self, path: &FsPath) -> BTreeSet<FsMode> {
        if self.modes.is_empty() {
            return BTreeSet::from([self.default_mode]);
        }

        if let Some(modes) = self.children_cache.get(path) {
            return modes;
        }

        let mut children = BTreeSet::new();
        let mut path_default = self.default_mode;

        for (prefix, mode) in &self.modes {
            if path.starts_with(prefix) {
                // Rules are ordered, the first covering prefix is the path's own mode
                path_default = *mode;
                break;
            } else if prefix.starts_with(path) {
                children.insert(*mode);
            }
        }

        children.insert(path_default);

        self.children_cache.insert(path.clone(), children.clone());
        children
    }

    /// Statistics of the single path cache
    #[must_use]
    pub fn cache_stats(&self) -> &CacheStats {
        &self.mode_cache.stats
    }

    #[must_use]
    pub fn cached_paths(&self) -> usize {
        self.mode_cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> FsPath {
        FsPath::new(s).unwrap()
    }

    fn resolver() -> ModeResolver {
        ModeResolver::new(
            FsMode::DualAsync,
            vec![
                (p("/a"), FsMode::DualSync),
                (p("/a/b"), FsMode::Primary),
                (p("/c"), FsMode::Proxy),
            ],
        )
    }

    #[test]
    fn test_longest_prefix_wins() {
        let r = resolver();
        assert_eq!(r.resolve_mode(&p("/a/b/c")), FsMode::Primary);
        assert_eq!(r.resolve_mode(&p("/a/b")), FsMode::Primary);
        assert_eq!(r.resolve_mode(&p("/a/x")), FsMode::DualSync);
        assert_eq!(r.resolve_mode(&p("/a")), FsMode::DualSync);
        assert_eq!(r.resolve_mode(&p("/ab")), FsMode::DualAsync);
        assert_eq!(r.resolve_mode(&FsPath::root()), FsMode::DualAsync);
    }

    #[test]
    fn test_rules_sorted_most_specific_first() {
        let r = resolver();
        assert_eq!(r.modes_ordered()[0].0, p("/a/b"));
    }

    #[test]
    fn test_resolution_is_deterministic_and_cached() {
        let r = resolver();
        for _ in 0..3 {
            assert_eq!(r.resolve_mode(&p("/a/b/c")), FsMode::Primary);
        }
        assert_eq!(r.cache_stats().misses.load(Ordering::Relaxed), 1);
        assert_eq!(r.cache_stats().hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_children_modes() {
        let r = resolver();
        assert_eq!(
            r.resolve_children_modes(&p("/a")),
            BTreeSet::from([FsMode::Primary, FsMode::DualSync])
        );
        assert_eq!(
            r.resolve_children_modes(&FsPath::root()),
            BTreeSet::from([
                FsMode::Primary,
                FsMode::DualSync,
                FsMode::DualAsync,
                FsMode::Proxy
            ])
        );
        assert_eq!(
            r.resolve_children_modes(&p("/a/b/c")),
            BTreeSet::from([FsMode::Primary])
        );
    }

    #[test]
    fn test_cache_is_bounded() {
        let r = resolver();
        for i in 0..(MODE_CACHE_CAPACITY + 10) {
            r.resolve_mode(&p(&format!("/x/{i}")));
        }
        assert_eq!(r.cached_paths(), MODE_CACHE_CAPACITY);
        assert_eq!(r.cache_stats().evictions.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_no_rules_uses_default() {
        let r = ModeResolver::new(FsMode::Primary, Vec::new());
        assert_eq!(r.resolve_mode(&p("/any")), FsMode::Primary);
        assert_eq!(
            r.resolve_children_modes(&p("/any")),
            BTreeSet::from([FsMode::Primary])
        );
    }
}
