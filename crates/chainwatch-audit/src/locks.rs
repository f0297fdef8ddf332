//! Per-group audit locks.
//!
//! A keyed table of async mutexes so audits of one group run one at a time
//! while audits of different groups never share a lock. Idle entries are
//! evicted least-recently-used once the table outgrows its capacity; an
//! entry someone holds or waits on is never evicted.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use chainwatch_types::model::GroupId;

struct Slot {
    lock: Arc<AsyncMutex<()>>,
    last_used: u64,
}

struct LockTable {
    capacity: usize,
    next_tick: u64,
    slots: HashMap<GroupId, Slot>,
    /// `last_used` tick to group, oldest first.
    order: BTreeMap<u64, GroupId>,
}

impl LockTable {
    /// Return the group's lock, creating it if needed, and mark it most recently used.
    fn touch(&mut self, group_id: &GroupId) -> Arc<AsyncMutex<()>> {
        let tick = self.next_tick;
        self.next_tick += 1;

        let slot = self.slots.entry(group_id.clone()).or_insert_with(|| Slot {
            lock: Arc::new(AsyncMutex::new(())),
            last_used: tick,
        });
        self.order.remove(&slot.last_used);
        slot.last_used = tick;
        self.order.insert(tick, group_id.clone());
        Arc::clone(&slot.lock)
    }

    /// Drop idle slots, oldest first, until the table fits its capacity.
    ///
    /// Walks the tick order and stops as soon as enough slots are gone.
    fn evict_idle(&mut self, keep: &GroupId) {
        let mut excess = self.slots.len().saturating_sub(self.capacity);
        if excess == 0 {
            return;
        }
        let mut evict = Vec::with_capacity(excess);
        for (tick, id) in &self.order {
            if excess == 0 {
                break;
            }
            if id == keep {
                continue;
            }
            // Only the table references an idle lock; holders and waiters keep a clone.
            if self
                .slots
                .get(id)
                .is_some_and(|slot| Arc::strong_count(&slot.lock) == 1)
            {
                evict.push(*tick);
                excess -= 1;
            }
        }
        for tick in evict {
            if let Some(id) = self.order.remove(&tick) {
                self.slots.remove(&id);
            }
        }
    }
}

/// Table of per-group audit locks.
pub struct GroupLocks {
    table: Mutex<LockTable>,
}

impl GroupLocks {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Mutex::new(LockTable {
                capacity: capacity.max(1),
                next_tick: 0,
                slots: HashMap::new(),
                order: BTreeMap::new(),
            }),
        }
    }

    fn handle(&self, group_id: &GroupId) -> Arc<AsyncMutex<()>> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = table.touch(group_id);
        table.evict_idle(group_id);
        lock
    }

    /// Wait for exclusive access to `group_id`'s audit section.
    pub async fn lock(&self, group_id: &GroupId) -> OwnedMutexGuard<()> {
        self.handle(group_id).lock_owned().await
    }

    /// Number of groups with a lock slot, held or idle.
    pub fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .slots
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_group_is_exclusive() {
        let locks = Arc::new(GroupLocks::new(8));
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let locks = Arc::clone(&locks);
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&GroupId::new("g")).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_groups_do_not_block() {
        let locks = GroupLocks::new(8);
        let _a = locks.lock(&GroupId::new("a")).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&GroupId::new("b"))).await;
        assert!(b.is_ok(), "lock for a different group should not wait");
    }

    #[tokio::test]
    async fn test_idle_locks_are_evicted() {
        let locks = GroupLocks::new(2);
        for name in ["a", "b", "c", "d"] {
            let _guard = locks.lock(&GroupId::new(name)).await;
        }
        assert!(locks.len() <= 2);
    }

    #[tokio::test]
    async fn test_held_locks_survive_eviction() {
        let locks = GroupLocks::new(1);
        let guard = locks.lock(&GroupId::new("held")).await;
        for name in ["x", "y", "z"] {
            let _g = locks.lock(&GroupId::new(name)).await;
        }

        // "held" must still be the same mutex: a second locker has to wait.
        let waiting =
            tokio::time::timeout(Duration::from_millis(50), locks.lock(&GroupId::new("held"))).await;
        assert!(waiting.is_err(), "held lock was evicted and replaced");

        drop(guard);
        let reacquired =
            tokio::time::timeout(Duration::from_millis(100), locks.lock(&GroupId::new("held"))).await;
        assert!(reacquired.is_ok());
    }

    fn has_slot(locks: &GroupLocks, name: &str) -> bool {
        locks
            .table
            .lock()
            .unwrap()
            .slots
            .contains_key(&GroupId::new(name))
    }

    #[tokio::test]
    async fn test_least_recently_used_idle_lock_goes_first() {
        let locks = GroupLocks::new(2);
        drop(locks.lock(&GroupId::new("a")).await);
        drop(locks.lock(&GroupId::new("b")).await);
        drop(locks.lock(&GroupId::new("a")).await);
        drop(locks.lock(&GroupId::new("c")).await);

        assert!(has_slot(&locks, "a"));
        assert!(!has_slot(&locks, "b"));
        assert!(has_slot(&locks, "c"));
    }

    #[tokio::test]
    async fn test_order_index_tracks_slots() {
        let locks = GroupLocks::new(3);
        let _held = locks.lock(&GroupId::new("held")).await;
        for round in 0..20 {
            let name = format!("g{}", round % 7);
            drop(locks.lock(&GroupId::new(&name)).await);
        }

        let table = locks.table.lock().unwrap();
        assert_eq!(table.order.len(), table.slots.len());
        assert!(table.slots.len() <= 3);
        for (tick, id) in &table.order {
            assert_eq!(table.slots[id].last_used, *tick);
        }
    }
}
