use crate::{lock::SubLock, registry::LockKey};

/// The unique id of a transaction.
pub type TxnId = u64;

/// An execution context of the traced kernel: a task id or one of the
/// reserved interrupt contexts.
pub type ContextId = i64;

/// The context of code running in hard-IRQ handlers.
pub const CONTEXT_HARDIRQ: ContextId = -2;

/// The context of code running in soft-IRQ handlers.
pub const CONTEXT_SOFTIRQ: ContextId = -1;

/// A transaction: the interval during which one sub-lock is the innermost
/// held lock of its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Txn {
    pub id: TxnId,
    pub start: u64,
    pub lock: LockKey,
    pub side: SubLock,
    pub access_counter: u64,
}

impl Txn {
    pub fn new(id: TxnId, start: u64, lock: LockKey, side: SubLock) -> Self {
        Self {
            id,
            start,
            lock,
            side,
            access_counter: 0,
        }
    }

    pub fn is_anchored_at(&self, lock: LockKey, side: SubLock) -> bool {
        self.lock == lock && self.side == side
    }

    /// Returns a copy that represents a fresh interval starting at `start`.
    pub fn reopened(&self, id: TxnId, start: u64) -> Self {
        Self::new(id, start, self.lock, self.side)
    }
}

/// The active transactions of one context, innermost last.
#[derive(Debug, Clone, Default)]
pub struct TxnStack {
    txns: Vec<Txn>,
}

impl TxnStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, txn: Txn) {
        self.txns.push(txn);
    }

    pub fn pop(&mut self) -> Option<Txn> {
        self.txns.pop()
    }

    /// The innermost transaction.
    pub fn top(&self) -> Option<&Txn> {
        self.txns.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Txn> {
        self.txns.last_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.txns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.txns.len()
    }

    /// Iterates from the outermost to the innermost transaction.
    pub fn iter(&self) -> impl Iterator<Item = &Txn> {
        self.txns.iter()
    }

    pub fn contains(&self, lock: LockKey, side: SubLock) -> bool {
        self.txns.iter().any(|txn| txn.is_anchored_at(lock, side))
    }

    pub fn retain(&mut self, f: impl FnMut(&Txn) -> bool) {
        self.txns.retain(f);
    }
}
