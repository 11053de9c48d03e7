use crate::{
    error::FatalError,
    event::AccessKind,
    lock::{IrqSync, SubLock, SubLockId},
    txn::TxnId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTypeRecord {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    pub id: u64,
    pub type_id: u64,
    pub base: u64,
    pub size: u64,
    pub start: u64,
    /// `None` for allocations that were never freed.
    pub end: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    pub id: u64,
    pub allocation: Option<u64>,
    pub txn: Option<TxnId>,
    pub ts: u64,
    pub kind: AccessKind,
    pub size: u64,
    pub address: u64,
    pub file: String,
    pub line: u32,
    pub function: String,
}

/// One row per sub-lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub id: SubLockId,
    pub address: u64,
    pub allocation: Option<u64>,
    pub label: String,
    pub side: SubLock,
    pub var_name: Option<String>,
    pub flags: u32,
}

/// A lock that was held while a transaction ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHeldRecord {
    pub txn: TxnId,
    pub lock: SubLockId,
    pub start: u64,
    pub file: String,
    pub line: u32,
    pub function: String,
    pub preempt_count: u64,
    pub irq_sync: IrqSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnRecord {
    pub id: TxnId,
    pub start: u64,
    pub end: u64,
}

/// Receives the records a conversion produces.
pub trait RecordSink {
    fn data_type(&mut self, record: DataTypeRecord) -> Result<(), FatalError>;

    fn allocation(&mut self, record: AllocationRecord) -> Result<(), FatalError>;

    fn access(&mut self, record: AccessRecord) -> Result<(), FatalError>;

    fn lock(&mut self, record: LockRecord) -> Result<(), FatalError>;

    fn lock_held(&mut self, record: LockHeldRecord) -> Result<(), FatalError>;

    fn txn(&mut self, record: TxnRecord) -> Result<(), FatalError>;

    /// Called once after the last record.
    fn flush(&mut self) -> Result<(), FatalError> {
        Ok(())
    }
}

/// A sink that keeps every record in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub data_types: Vec<DataTypeRecord>,
    pub allocations: Vec<AllocationRecord>,
    pub accesses: Vec<AccessRecord>,
    pub locks: Vec<LockRecord>,
    pub locks_held: Vec<LockHeldRecord>,
    pub txns: Vec<TxnRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The held-lock records of transaction `txn`.
    pub fn held_during(&self, txn: TxnId) -> Vec<&LockHeldRecord> {
        self.locks_held.iter().filter(|r| r.txn == txn).collect()
    }
}

impl RecordSink for MemorySink {
    fn data_type(&mut self, record: DataTypeRecord) -> Result<(), FatalError> {
        self.data_types.push(record);
        Ok(())
    }

    fn allocation(&mut self, record: AllocationRecord) -> Result<(), FatalError> {
        self.allocations.push(record);
        Ok(())
    }

    fn access(&mut self, record: AccessRecord) -> Result<(), FatalError> {
        self.accesses.push(record);
        Ok(())
    }

    fn lock(&mut self, record: LockRecord) -> Result<(), FatalError> {
        self.locks.push(record);
        Ok(())
    }

    fn lock_held(&mut self, record: LockHeldRecord) -> Result<(), FatalError> {
        self.locks_held.push(record);
        Ok(())
    }

    fn txn(&mut self, record: TxnRecord) -> Result<(), FatalError> {
        self.txns.push(record);
        Ok(())
    }
}
