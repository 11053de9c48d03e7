use std::collections::{BTreeMap, HashSet};

use log::trace;

use crate::{
    error::{Diagnostics, FatalError, Inconsistency, report},
    ids::{IdCounter, Interner},
    sink::{AllocationRecord, DataTypeRecord, RecordSink},
};

/// An active allocation of the traced kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub id: u64,
    pub type_id: u64,
    pub base: u64,
    pub size: u64,
    pub start: u64,
}

impl Allocation {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address - self.base < self.size
    }

    fn record(&self, end: Option<u64>) -> AllocationRecord {
        AllocationRecord {
            id: self.id,
            type_id: self.type_id,
            base: self.base,
            size: self.size,
            start: self.start,
            end,
        }
    }
}

/// Keeps track of the active allocations, keyed by their base address.
#[derive(Default)]
pub struct AllocationTracker {
    active: BTreeMap<u64, Allocation>,
    ids: IdCounter,
    types: Interner<String>,
    tracked_types: Option<HashSet<String>>,
}

impl AllocationTracker {
    /// Creates a tracker. With `tracked_types`, allocations of any other data
    /// type are rejected.
    pub fn new(tracked_types: Option<Vec<String>>) -> Self {
        Self {
            tracked_types: tracked_types.map(|types| types.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Registers the allocation `[base, base + size)`.
    ///
    /// Returns the id of the new allocation, or `None` if it was rejected.
    pub fn alloc<S: RecordSink>(
        &mut self,
        base: u64,
        size: u64,
        type_name: &str,
        ts: u64,
        diagnostics: &mut Diagnostics,
        sink: &mut S,
    ) -> Result<Option<u64>, FatalError> {
        if self.active.contains_key(&base) {
            report!(diagnostics, Inconsistency::DuplicateAllocation { base, ts });
            return Ok(None);
        }

        if let Some(tracked) = &self.tracked_types
            && !tracked.contains(type_name)
        {
            report!(
                diagnostics,
                Inconsistency::UnknownDataType {
                    name: type_name.to_string(),
                    ts,
                }
            );
            return Ok(None);
        }

        let name = type_name.to_string();
        let (type_id, new_type) = self.types.intern(&name);
        if new_type {
            sink.data_type(DataTypeRecord { id: type_id, name })?;
        }

        let id = self.ids.next_id();
        trace!("Allocation {id} at {base:#x} ({size} bytes, type {type_id})");
        self.active.insert(
            base,
            Allocation {
                id,
                type_id,
                base,
                size,
                start: ts,
            },
        );

        Ok(Some(id))
    }

    /// Closes the allocation starting at `base` and emits its row.
    pub fn free<S: RecordSink>(
        &mut self,
        base: u64,
        ts: u64,
        diagnostics: &mut Diagnostics,
        sink: &mut S,
    ) -> Result<Option<Allocation>, FatalError> {
        let Some(allocation) = self.active.remove(&base) else {
            report!(diagnostics, Inconsistency::UnknownFree { base, ts });
            return Ok(None);
        };

        sink.allocation(allocation.record(Some(ts)))?;

        Ok(Some(allocation))
    }

    /// The active allocation whose range contains `address`.
    pub fn containing(&self, address: u64) -> Option<&Allocation> {
        self.active
            .range(..=address)
            .next_back()
            .map(|(_, allocation)| allocation)
            .filter(|allocation| allocation.contains(address))
    }

    /// Emits every allocation that is still active, without an end.
    pub fn finish<S: RecordSink>(&mut self, sink: &mut S) -> Result<(), FatalError> {
        for (_, allocation) in std::mem::take(&mut self.active) {
            sink.allocation(allocation.record(None))?;
        }

        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// The number of allocations handed out so far.
    pub fn total_count(&self) -> u64 {
        self.ids.peek() - 1
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }
}
