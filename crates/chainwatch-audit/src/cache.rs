//! Audit cache.
//!
//! Bounded, strictly least-recently-used map from group to audit history:
//! - `put` replaces a group's whole history in one step
//! - eviction is by access order only, never by age
//! - the lock is held for map bookkeeping only, never across I/O
//!
//! Recency is tracked with a monotonically increasing tick per access and a
//! tick-ordered index, so lookups and evictions stay logarithmic without a
//! linked list.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chainwatch_types::model::{AuditHistory, GroupId};

struct Entry {
    history: Arc<AuditHistory>,
    tick: u64,
}

struct LruState {
    capacity: usize,
    next_tick: u64,
    entries: HashMap<GroupId, Entry>,
    /// Access tick to group, oldest first.
    order: BTreeMap<u64, GroupId>,
}

impl LruState {
    fn touch(&mut self, group_id: &GroupId) -> Option<Arc<AuditHistory>> {
        let tick = self.next_tick;
        let entry = self.entries.get_mut(group_id)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, group_id.clone());
        self.next_tick += 1;
        Some(Arc::clone(&entry.history))
    }

    fn evict_overflow(&mut self) -> Vec<GroupId> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            evicted.push(oldest);
        }
        evicted
    }
}

/// LRU cache of per-group audit histories.
///
/// Histories are handed out as `Arc` snapshots; callers build a new history
/// and `put` it rather than mutating in place.
pub struct AuditCache {
    inner: Mutex<LruState>,
}

impl AuditCache {
    /// Create a cache holding at most `capacity` groups (minimum one).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruState {
                capacity: capacity.max(1),
                next_tick: 0,
                entries: HashMap::new(),
                order: BTreeMap::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LruState> {
        // Every critical section leaves the maps consistent, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch a group's history, marking it most recently used.
    pub fn get(&self, group_id: &GroupId) -> Option<Arc<AuditHistory>> {
        self.state().touch(group_id)
    }

    /// Fetch a group's history without changing its recency.
    pub fn peek(&self, group_id: &GroupId) -> Option<Arc<AuditHistory>> {
        self.state()
            .entries
            .get(group_id)
            .map(|entry| Arc::clone(&entry.history))
    }

    /// Replace a group's history, returning any groups evicted to make room.
    pub fn put(&self, group_id: GroupId, history: AuditHistory) -> Vec<GroupId> {
        let mut state = self.state();
        let tick = state.next_tick;
        state.next_tick += 1;

        if let Some(previous) = state.entries.insert(
            group_id.clone(),
            Entry {
                history: Arc::new(history),
                tick,
            },
        ) {
            state.order.remove(&previous.tick);
        }
        state.order.insert(tick, group_id);

        let evicted = state.evict_overflow();
        for group in &evicted {
            tracing::debug!(group_id = %group, "evicted audit history from cache");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.state().capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(name: &str) -> AuditHistory {
        AuditHistory::new(GroupId::new(name), false)
    }

    fn gid(name: &str) -> GroupId {
        GroupId::new(name)
    }

    #[test]
    fn test_get_missing_group() {
        let cache = AuditCache::new(2);
        assert!(cache.get(&gid("a")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_replaces_whole_entry() {
        let cache = AuditCache::new(2);
        cache.put(gid("a"), history("a"));

        let mut updated = history("a");
        updated.public = true;
        cache.put(gid("a"), updated.clone());

        assert_eq!(cache.len(), 1);
        assert_eq!(*cache.get(&gid("a")).unwrap(), updated);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = AuditCache::new(2);
        cache.put(gid("a"), history("a"));
        cache.put(gid("b"), history("b"));

        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.get(&gid("a")).is_some());

        let evicted = cache.put(gid("c"), history("c"));
        assert_eq!(evicted, vec![gid("b")]);
        assert!(cache.get(&gid("a")).is_some());
        assert!(cache.get(&gid("b")).is_none());
        assert!(cache.get(&gid("c")).is_some());
    }

    #[test]
    fn test_peek_does_not_refresh_recency() {
        let cache = AuditCache::new(2);
        cache.put(gid("a"), history("a"));
        cache.put(gid("b"), history("b"));

        assert!(cache.peek(&gid("a")).is_some());
        let evicted = cache.put(gid("c"), history("c"));
        assert_eq!(evicted, vec![gid("a")]);
    }

    #[test]
    fn test_reput_refreshes_recency() {
        let cache = AuditCache::new(2);
        cache.put(gid("a"), history("a"));
        cache.put(gid("b"), history("b"));
        cache.put(gid("a"), history("a"));

        let evicted = cache.put(gid("c"), history("c"));
        assert_eq!(evicted, vec![gid("b")]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache = AuditCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.put(gid("a"), history("a"));
        cache.put(gid("b"), history("b"));
        assert_eq!(cache.len(), 1);
        assert!(cache.peek(&gid("b")).is_some());
    }

    #[test]
    fn test_concurrent_puts_on_distinct_groups() {
        let cache = Arc::new(AuditCache::new(64));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..8 {
                        let name = format!("g-{t}-{i}");
                        cache.put(GroupId::new(name.clone()), history(&name));
                        assert!(cache.get(&GroupId::new(name)).is_some());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 64);
    }
}
