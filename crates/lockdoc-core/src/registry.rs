use std::collections::{BTreeMap, HashMap};

use log::debug;

use crate::{
    error::{Diagnostics, FatalError, Inconsistency, report},
    ids::IdCounter,
    lock::{Lock, LockKind, LockVariant, SubLock},
};

/// A stable handle of a lock in a [`LockRegistry`].
///
/// Keys are never reused, so a handle to a lock that has been purged simply
/// stops resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey(u64);

impl LockKey {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Where a new lock lives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockPlacement {
    /// The allocation whose address range contains the lock.
    pub allocation: Option<u64>,
    /// The name of the variable holding a statically allocated lock.
    pub var_name: Option<String>,
}

/// Owns every live lock, keyed by its address.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: HashMap<LockKey, Lock>,
    by_address: BTreeMap<u64, LockKey>,
    keys: IdCounter,
    sub_lock_ids: IdCounter,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock at `address`, creating it if there is none.
    ///
    /// `place` is only called for new locks. The returned flag is `true` if the
    /// lock was created by this call.
    pub fn acquire_or_create(
        &mut self,
        address: u64,
        label: &str,
        place: impl FnOnce(u64) -> LockPlacement,
    ) -> Result<(LockKey, bool), FatalError> {
        if let Some(key) = self.by_address.get(&address) {
            return Ok((*key, false));
        }

        let kind = LockKind::classify(label).ok_or_else(|| FatalError::UnknownLockType {
            address,
            label: label.to_string(),
        })?;
        let variant = LockVariant::init_ids(kind, &mut self.sub_lock_ids);

        let mut placement = place(address);
        if let Some(name) = Lock::pseudo_lock_name(address) {
            placement.var_name = Some(name.to_string());
        }

        let key = LockKey(self.keys.next_id());
        let lock = Lock::new(
            address,
            variant,
            label.to_string(),
            placement.allocation,
            placement.var_name,
        );
        debug!("New {} lock '{}' at {:#x}", lock.kind(), label, address);

        self.locks.insert(key, lock);
        self.by_address.insert(address, key);

        Ok((key, true))
    }

    pub fn find(&self, address: u64) -> Option<LockKey> {
        self.by_address.get(&address).copied()
    }

    pub fn get(&self, key: LockKey) -> Option<&Lock> {
        self.locks.get(&key)
    }

    pub fn get_mut(&mut self, key: LockKey) -> Option<&mut Lock> {
        self.locks.get_mut(&key)
    }

    /// Removes every lock in `[base, base + size)`.
    ///
    /// Returns the number of removed locks. Removing a held lock is reported.
    pub fn release_by_address_range(
        &mut self,
        base: u64,
        size: u64,
        ts: u64,
        diagnostics: &mut Diagnostics,
    ) -> usize {
        let end = base.saturating_add(size);
        let doomed: Vec<(u64, LockKey)> = self
            .by_address
            .range(base..end)
            .map(|(address, key)| (*address, *key))
            .collect();

        for (address, key) in &doomed {
            self.by_address.remove(address);
            let Some(lock) = self.locks.remove(key) else {
                continue;
            };

            if lock.is_held() {
                let side = if lock.writer_count() > 0 {
                    SubLock::Writer
                } else {
                    SubLock::Reader
                };
                report!(
                    diagnostics,
                    Inconsistency::HeldLockFreed {
                        lock: lock.describe(side),
                        ts,
                        base,
                    }
                );
            }
        }

        doomed.len()
    }

    /// The number of live locks.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// The number of sub-lock ids handed out so far.
    pub fn sub_lock_count(&self) -> u64 {
        self.sub_lock_ids.peek() - 1
    }
}
