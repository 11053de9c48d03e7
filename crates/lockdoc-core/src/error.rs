use std::{collections::BTreeMap, io};

use lockdoc_error::exit;
use thiserror::Error;

use crate::{
    lock::LockOp,
    txn::{ContextId, TxnId},
};

/// Conditions that stop a conversion.
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("Unknown lock type '{label}' for lock at {address:#x}")]
    UnknownLockType { address: u64, label: String },

    #[error(
        "Invalid state on lock {lock} (op={op}, ts={ts}): held by {readers} readers and {writers} writers"
    )]
    ContradictoryState {
        lock: String,
        op: LockOp,
        ts: u64,
        readers: u32,
        writers: u32,
    },

    #[error("Cannot decode trace: {0:#}")]
    Input(anyhow::Error),

    #[error("Cannot write output tables: {0}")]
    Output(#[from] io::Error),
}

impl FatalError {
    /// The process exit code this error terminates with.
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalError::UnknownLockType { .. } => exit::UNKNOWN_LOCK_TYPE,
            FatalError::ContradictoryState { .. } => exit::CONTRADICTORY_STATE,
            FatalError::Input(_) => exit::INPUT,
            FatalError::Output(_) => exit::OUTPUT,
        }
    }
}

/// Recoverable problems found in a trace.
///
/// These are never returned as errors. They are reported through [`report!`],
/// which logs them and counts them in [`Diagnostics`], and the conversion
/// carries on with a best-effort recovery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Inconsistency {
    #[error("{lock} ({op}, ts={ts}, ctx={ctx}): other side is already being held")]
    OtherSideHeld {
        lock: String,
        op: LockOp,
        ts: u64,
        ctx: ContextId,
    },

    #[error("{lock} ({op}, ts={ts}, ctx={ctx}): cannot flush the other side, no TXN found")]
    FlushFailed {
        lock: String,
        op: LockOp,
        ts: u64,
        ctx: ContextId,
    },

    #[error("{lock} ({op}, ts={ts}, ctx={ctx}): lock is already being held")]
    AlreadyHeld {
        lock: String,
        op: LockOp,
        ts: u64,
        ctx: ContextId,
    },

    #[error("{lock} ({op}, ts={ts}, ctx={ctx}): lock has already been released")]
    AlreadyReleased {
        lock: String,
        op: LockOp,
        ts: u64,
        ctx: ContextId,
    },

    #[error("{lock} ({op}, ts={ts}, ctx={ctx}): no last locking position known, cannot pop")]
    EmptyHistory {
        lock: String,
        op: LockOp,
        ts: u64,
        ctx: ContextId,
    },

    #[error("{lock} ({op}, ts={ts}, ctx={ctx}): TXN: V() but no running TXN")]
    NoRunningTxn {
        lock: String,
        op: LockOp,
        ts: u64,
        ctx: ContextId,
    },

    #[error("{lock} ({op}, ts={ts}, ctx={ctx}): operation does not apply to this kind of lock")]
    UnsupportedSide {
        lock: String,
        op: LockOp,
        ts: u64,
        ctx: ContextId,
    },

    #[error("{lock} (ts={ts}): inconsistent count, {residual} acquisitions without position")]
    InconsistentCount { lock: String, ts: u64, residual: i64 },

    #[error("{lock} (ts={ts}, txn={txn}): lock is part of the TXN hierarchy but not held")]
    LockNotHeld { lock: String, ts: u64, txn: TxnId },

    #[error("{lock} (ts={ts}, txn={txn}): lock is held but has no locking position")]
    MissingPosition { lock: String, ts: u64, txn: TxnId },

    #[error("TXN {txn} (ts={ts}) references a lock whose memory has been freed")]
    DanglingLock { ts: u64, txn: TxnId },

    #[error("{lock} (ts={ts}, txn={txn}): sub-lock does not match the released one")]
    SideMismatch { lock: String, ts: u64, txn: TxnId },

    #[error("{lock} (ts={ts}, ctx={ctx}): multiple active TXNs for one writer lock")]
    MultipleWriterTxns {
        lock: String,
        ts: u64,
        ctx: ContextId,
    },

    #[error("{lock} (ts={ts}): lock is being freed but held (allocation at {base:#x})")]
    HeldLockFreed { lock: String, ts: u64, base: u64 },

    #[error("Found active allocation at address {base:#x} (ts={ts})")]
    DuplicateAllocation { base: u64, ts: u64 },

    #[error("Didn't find active allocation for address {base:#x} (ts={ts})")]
    UnknownFree { base: u64, ts: u64 },

    #[error("Found unknown datatype '{name}' (ts={ts})")]
    UnknownDataType { name: String, ts: u64 },
}

impl Inconsistency {
    /// A stable name for this kind of inconsistency.
    pub fn kind(&self) -> &'static str {
        match self {
            Inconsistency::OtherSideHeld { .. } => "other_side_held",
            Inconsistency::FlushFailed { .. } => "flush_failed",
            Inconsistency::AlreadyHeld { .. } => "already_held",
            Inconsistency::AlreadyReleased { .. } => "already_released",
            Inconsistency::EmptyHistory { .. } => "empty_history",
            Inconsistency::NoRunningTxn { .. } => "no_running_txn",
            Inconsistency::UnsupportedSide { .. } => "unsupported_side",
            Inconsistency::InconsistentCount { .. } => "inconsistent_count",
            Inconsistency::LockNotHeld { .. } => "lock_not_held",
            Inconsistency::MissingPosition { .. } => "missing_position",
            Inconsistency::DanglingLock { .. } => "dangling_lock",
            Inconsistency::SideMismatch { .. } => "side_mismatch",
            Inconsistency::MultipleWriterTxns { .. } => "multiple_writer_txns",
            Inconsistency::HeldLockFreed { .. } => "held_lock_freed",
            Inconsistency::DuplicateAllocation { .. } => "duplicate_allocation",
            Inconsistency::UnknownFree { .. } => "unknown_free",
            Inconsistency::UnknownDataType { .. } => "unknown_data_type",
        }
    }
}

/// Counts the inconsistencies reported during a conversion.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    counts: BTreeMap<&'static str, u64>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, inconsistency: &Inconsistency) {
        *self.counts.entry(inconsistency.kind()).or_default() += 1;
    }

    pub fn count(&self, kind: &str) -> u64 {
        self.counts.get(kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Iterates over (kind, count) pairs, ordered by kind.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.counts.iter().map(|(kind, count)| (*kind, *count))
    }
}

/// Logs an [`Inconsistency`] and counts it in a [`Diagnostics`].
///
/// A macro rather than a function so the log record carries the file and
/// line where the inconsistency was detected.
macro_rules! report {
    ($diagnostics:expr, $inconsistency:expr) => {{
        let inconsistency: $crate::error::Inconsistency = $inconsistency;
        ::log::warn!(target: "lockdoc::inconsistency", "{}", inconsistency);
        $diagnostics.record(&inconsistency);
    }};
}

pub(crate) use report;

#[cfg(test)]
mod tests {
    use lockdoc_error::exit;

    use super::{Diagnostics, FatalError, Inconsistency};
    use crate::lock::LockOp;

    #[test]
    fn fatal_errors_map_to_exit_codes() {
        let unknown = FatalError::UnknownLockType {
            address: 0x1000,
            label: String::from("seqlock_t"),
        };
        assert_eq!(unknown.exit_code(), exit::UNKNOWN_LOCK_TYPE);
        assert_eq!(
            unknown.to_string(),
            "Unknown lock type 'seqlock_t' for lock at 0x1000"
        );

        let contradictory = FatalError::ContradictoryState {
            lock: String::from("RWLock,2,WRITER_LOCK,0x100"),
            op: LockOp::PWrite,
            ts: 7,
            readers: 1,
            writers: 1,
        };
        assert_eq!(contradictory.exit_code(), exit::CONTRADICTORY_STATE);

        let output = FatalError::from(std::io::Error::other("disk full"));
        assert_eq!(output.exit_code(), exit::OUTPUT);

        let input = FatalError::Input(anyhow::anyhow!("Expected 14 columns, found 3"));
        assert_eq!(input.exit_code(), exit::INPUT);
    }

    #[test]
    fn diagnostics_count_by_kind() {
        let mut diagnostics = Diagnostics::new();
        assert!(diagnostics.is_empty());

        report!(
            diagnostics,
            Inconsistency::UnknownFree { base: 0x10, ts: 1 }
        );
        report!(
            diagnostics,
            Inconsistency::UnknownFree { base: 0x20, ts: 2 }
        );
        report!(
            diagnostics,
            Inconsistency::DanglingLock { ts: 3, txn: 4 }
        );

        assert_eq!(diagnostics.count("unknown_free"), 2);
        assert_eq!(diagnostics.count("dangling_lock"), 1);
        assert_eq!(diagnostics.count("already_held"), 0);
        assert_eq!(diagnostics.total(), 3);
        assert_eq!(
            diagnostics.iter().collect::<Vec<_>>(),
            vec![("dangling_lock", 1), ("unknown_free", 2)]
        );
    }
}
