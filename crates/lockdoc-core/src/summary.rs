use std::{collections::BTreeMap, io::Read};

use anyhow::Error;
use serde::{Deserialize, Serialize};

use crate::{engine::EngineStats, error::Diagnostics, event::Operation};

/// How many events of each kind a trace contained.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy, Default)]
pub struct EventCounts {
    pub total: u64,
    pub allocs: u64,
    pub frees: u64,
    pub acquires: u64,
    pub releases: u64,
    pub reads: u64,
    pub writes: u64,
    /// Lock events on lock types that are not modeled.
    pub ignored: u64,
}

impl EventCounts {
    pub fn record(&mut self, operation: &Operation) {
        self.total += 1;
        match operation {
            Operation::Alloc { .. } => self.allocs += 1,
            Operation::Free => self.frees += 1,
            Operation::Acquire { .. } => self.acquires += 1,
            Operation::Release { .. } => self.releases += 1,
            Operation::Read { .. } => self.reads += 1,
            Operation::Write { .. } => self.writes += 1,
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy, Default)]
pub struct TxnCounts {
    pub opened: u64,
    pub emitted: u64,
    pub suppressed: u64,
    pub reopened: u64,
    pub locks_held: u64,
}

impl From<EngineStats> for TxnCounts {
    fn from(stats: EngineStats) -> Self {
        Self {
            opened: stats.opened,
            emitted: stats.emitted,
            suppressed: stats.suppressed,
            reopened: stats.reopened,
            locks_held: stats.held_records,
        }
    }
}

/// What a conversion read, wrote and found suspicious.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct ConversionSummary {
    pub events: EventCounts,
    pub txns: TxnCounts,
    pub sub_locks: u64,
    pub allocations: u64,
    pub data_types: u64,
    pub accesses: u64,
    pub discarded_accesses: u64,
    pub inconsistencies: BTreeMap<String, u64>,
}

impl ConversionSummary {
    pub(crate) fn fill_inconsistencies(&mut self, diagnostics: &Diagnostics) {
        self.inconsistencies = diagnostics
            .iter()
            .map(|(kind, count)| (kind.to_string(), count))
            .collect();
    }

    /// The number of inconsistencies of all kinds.
    pub fn inconsistency_count(&self) -> u64 {
        self.inconsistencies.values().sum()
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(&self).map_err(Error::from)
    }

    pub fn from_json<R: Read>(reader: R) -> Result<Self, Error> {
        serde_json::from_reader(reader).map_err(Error::from)
    }
}
