//! The LEB lock tree: reader/writer locks scoped to individual `(vol_id, lnum)` pairs.
//!
//! Only LEBs that somebody is currently locking (or waiting on) have an entry. Entries live in an
//! ordered map guarded by a short-held mutex that covers lookup-or-insert and removal; the per-LEB
//! lock itself is acquired after that mutex is released, so a contended LEB never holds up any
//! other LEB. Each entry counts its users (holders plus waiters) and is removed when the last one
//! lets go.
//!
//! Locks are released by dropping (or calling `unlock` on) the returned guard.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::warn;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

type LebKey = (u32, u32);

#[derive(Debug)]
struct LtreeEntry {
    users: usize,
    lock: Arc<RwLock<()>>,
}

/// The per-device registry of locked LEBs
#[derive(Debug, Default)]
pub struct LockTree {
    entries: Mutex<BTreeMap<LebKey, LtreeEntry>>,
}

/// Shared lock on one LEB; released on drop
#[must_use = "the LEB is unlocked as soon as the guard is dropped"]
pub struct LebReadGuard<'a> {
    tree: &'a LockTree,
    key: LebKey,
    guard: Option<ArcRwLockReadGuard<RawRwLock, ()>>,
}

/// Exclusive lock on one LEB; released on drop
#[must_use = "the LEB is unlocked as soon as the guard is dropped"]
pub struct LebWriteGuard<'a> {
    tree: &'a LockTree,
    key: LebKey,
    guard: Option<ArcRwLockWriteGuard<RawRwLock, ()>>,
}

impl LockTree {
    pub fn new() -> Self {
        Default::default()
    }

    /// Find or create the entry for `key`, registering one more user of it
    fn add_user(&self, key: LebKey) -> Arc<RwLock<()>> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key).or_insert_with(|| LtreeEntry {
            users: 0,
            lock: Default::default(),
        });
        entry.users += 1;
        entry.lock.clone()
    }

    /// Drop one user of the entry for `key`, removing the entry once nobody uses it
    fn release(&self, key: LebKey) {
        let mut entries = self.entries.lock();
        match entries.get_mut(&key) {
            Some(entry) => {
                entry.users -= 1;
                if entry.users == 0 {
                    entries.remove(&key);
                }
            }
            None => {
                debug_assert!(false, "LEB {}:{} unlocked but never locked", key.0, key.1);
                warn!("LEB {}:{} unlocked but never locked", key.0, key.1);
            }
        }
    }

    /// Block until a shared lock on the LEB is held
    pub fn read_lock(&self, vol_id: u32, lnum: u32) -> LebReadGuard<'_> {
        let key = (vol_id, lnum);
        let lock = self.add_user(key);
        LebReadGuard {
            tree: self,
            key,
            guard: Some(lock.read_arc()),
        }
    }

    /// Block until an exclusive lock on the LEB is held
    pub fn write_lock(&self, vol_id: u32, lnum: u32) -> LebWriteGuard<'_> {
        let key = (vol_id, lnum);
        let lock = self.add_user(key);
        LebWriteGuard {
            tree: self,
            key,
            guard: Some(lock.write_arc()),
        }
    }

    /// Take the exclusive lock only if that is possible without waiting.
    ///
    /// On contention this returns `None` and leaves no trace in the tree.
    pub fn try_write_lock(&self, vol_id: u32, lnum: u32) -> Option<LebWriteGuard<'_>> {
        let key = (vol_id, lnum);
        let lock = self.add_user(key);
        match lock.try_write_arc() {
            Some(guard) => Some(LebWriteGuard {
                tree: self,
                key,
                guard: Some(guard),
            }),
            None => {
                drop(lock);
                self.release(key);
                None
            }
        }
    }

    /// How many users (holders and waiters) the LEB has right now
    pub fn users(&self, vol_id: u32, lnum: u32) -> usize {
        self.entries
            .lock()
            .get(&(vol_id, lnum))
            .map_or(0, |entry| entry.users)
    }

    /// How many LEBs currently have an entry
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LebReadGuard<'_> {
    pub fn unlock(self) {}
}

impl LebWriteGuard<'_> {
    pub fn unlock(self) {}
}

impl Drop for LebReadGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.tree.release(self.key);
    }
}

impl Drop for LebWriteGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.tree.release(self.key);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_entries_come_and_go() {
        let tree = LockTree::new();
        assert!(tree.is_empty());

        let r1 = tree.read_lock(1, 5);
        let r2 = tree.read_lock(1, 5);
        let w = tree.write_lock(1, 6);
        assert_eq!(tree.users(1, 5), 2);
        assert_eq!(tree.users(1, 6), 1);
        assert_eq!(tree.len(), 2);

        r1.unlock();
        assert_eq!(tree.users(1, 5), 1);
        drop(r2);
        drop(w);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_try_write_lock() {
        let tree = LockTree::new();

        let r = tree.read_lock(0, 0);
        assert_eq!(tree.users(0, 0), 1);
        assert!(tree.try_write_lock(0, 0).is_none());
        assert_eq!(tree.users(0, 0), 1);
        drop(r);

        let w = tree.try_write_lock(0, 0).expect("uncontended");
        assert!(tree.try_write_lock(0, 0).is_none());
        assert_eq!(tree.users(0, 0), 1);

        // An unrelated LEB of the same volume is unaffected
        assert!(tree.try_write_lock(0, 1).is_some());
        drop(w);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_readers_share() {
        let tree = LockTree::new();
        let held = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let _guard = tree.read_lock(3, 3);
                    let now = held.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(50));
                    held.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        assert!(peak.load(Ordering::SeqCst) > 1);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_writer_excludes_reader() {
        let tree = LockTree::new();
        let writing = AtomicBool::new(false);
        let (tx, rx) = channel();

        thread::scope(|s| {
            let w = tree.write_lock(2, 9);
            writing.store(true, Ordering::SeqCst);

            s.spawn(|| {
                let _r = tree.read_lock(2, 9);
                tx.send(writing.load(Ordering::SeqCst)).unwrap();
            });

            // The reader registers as a waiter but cannot get in
            while tree.users(2, 9) < 2 {
                thread::yield_now();
            }
            thread::sleep(Duration::from_millis(50));
            assert!(rx.try_recv().is_err());

            writing.store(false, Ordering::SeqCst);
            drop(w);
            assert!(!rx.recv().unwrap());
        });

        assert!(tree.is_empty());
    }
}
