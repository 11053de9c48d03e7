use std::fmt;

use anyhow::{Error, anyhow};

use crate::ids::IdCounter;

// ============================================================================
// Pseudo-locks: synchronization that is not backed by memory is modeled as a
// lock living at a reserved address.
pub const PSEUDOLOCK_ADDR_RCU: u64 = 0x42;
pub const PSEUDOLOCK_ADDR_PREEMPT: u64 = 0x43;
pub const PSEUDOLOCK_ADDR_HARDIRQ: u64 = 0x44;
pub const PSEUDOLOCK_ADDR_SOFTIRQ: u64 = 0x45;

pub const PSEUDOLOCK_NAME_RCU: &str = "rcu";
pub const PSEUDOLOCK_NAME_PREEMPT: &str = "preempt";
pub const PSEUDOLOCK_NAME_HARDIRQ: &str = "hardirq";
pub const PSEUDOLOCK_NAME_SOFTIRQ: &str = "softirq";
// ============================================================================

/// Lock flag: the writer side may be acquired again while it is held.
pub const LOCK_FLAGS_RECURSIVE: u32 = 0x1;

const WRITER_LOCK_TYPES: [&str; 10] = [
    "raw_spinlock_t",
    "spinlock_t",
    "mutex",
    "semaphore",
    "bit_spin_lock",
    "sleep mutex",
    "spin mutex",
    PSEUDOLOCK_NAME_PREEMPT,
    PSEUDOLOCK_NAME_HARDIRQ,
    PSEUDOLOCK_NAME_SOFTIRQ,
];

const READER_LOCK_TYPES: [&str; 1] = [PSEUDOLOCK_NAME_RCU];

const READER_WRITER_LOCK_TYPES: [&str; 7] = [
    "rwlock_t",
    "rw_semaphore",
    "sx",
    "rw",
    "sleepable rm",
    "rm",
    "lockmgr",
];

/// The unique id of one side of a lock.
pub type SubLockId = u64;

/// One side of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubLock {
    Reader,
    Writer,
}

impl SubLock {
    pub fn other(self) -> Self {
        match self {
            SubLock::Reader => SubLock::Writer,
            SubLock::Writer => SubLock::Reader,
        }
    }

    /// The abbreviation used in the locks table.
    pub fn as_char(self) -> char {
        match self {
            SubLock::Reader => 'r',
            SubLock::Writer => 'w',
        }
    }
}

impl fmt::Display for SubLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubLock::Reader => f.write_str("READER_LOCK"),
            SubLock::Writer => f.write_str("WRITER_LOCK"),
        }
    }
}

/// A lock operation as recorded by the instrumented kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    PRead,
    PWrite,
    VRead,
    VWrite,
}

impl LockOp {
    /// Returns the integer the trace uses for this operation
    pub fn id(self) -> u8 {
        match self {
            LockOp::PRead => 0,
            LockOp::PWrite => 1,
            LockOp::VRead => 2,
            LockOp::VWrite => 3,
        }
    }

    pub fn try_from_id(id: i64) -> Result<Self, Error> {
        match id {
            0 => Ok(LockOp::PRead),
            1 => Ok(LockOp::PWrite),
            2 => Ok(LockOp::VRead),
            3 => Ok(LockOp::VWrite),
            _ => Err(anyhow!("Lock operation {id} was not recognized")),
        }
    }

    pub fn acquire(side: SubLock) -> Self {
        match side {
            SubLock::Reader => LockOp::PRead,
            SubLock::Writer => LockOp::PWrite,
        }
    }

    pub fn release(side: SubLock) -> Self {
        match side {
            SubLock::Reader => LockOp::VRead,
            SubLock::Writer => LockOp::VWrite,
        }
    }

    pub fn side(self) -> SubLock {
        match self {
            LockOp::PRead | LockOp::VRead => SubLock::Reader,
            LockOp::PWrite | LockOp::VWrite => SubLock::Writer,
        }
    }

    pub fn is_acquire(self) -> bool {
        matches!(self, LockOp::PRead | LockOp::PWrite)
    }
}

impl fmt::Display for LockOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockOp::PRead => f.write_str("P_READ"),
            LockOp::PWrite => f.write_str("P_WRITE"),
            LockOp::VRead => f.write_str("V_READ"),
            LockOp::VWrite => f.write_str("V_WRITE"),
        }
    }
}

/// How interrupts were synchronized when a lock was acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IrqSync {
    #[default]
    None,
    Irq,
    /// aka irqsave and irqrestore
    IrqNested,
    Bh,
}

impl IrqSync {
    pub fn id(self) -> u8 {
        match self {
            IrqSync::None => 0,
            IrqSync::Irq => 1,
            IrqSync::IrqNested => 2,
            IrqSync::Bh => 3,
        }
    }

    pub fn try_from_id(id: i64) -> Result<Self, Error> {
        match id {
            0 => Ok(IrqSync::None),
            1 => Ok(IrqSync::Irq),
            2 => Ok(IrqSync::IrqNested),
            3 => Ok(IrqSync::Bh),
            _ => Err(anyhow!("IRQ synchronization mode {id} was not recognized")),
        }
    }
}

impl fmt::Display for IrqSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrqSync::None => f.write_str("LOCK_NONE"),
            IrqSync::Irq => f.write_str("LOCK_IRQ"),
            IrqSync::IrqNested => f.write_str("LOCK_IRQ_NESTED"),
            IrqSync::Bh => f.write_str("LOCK_BH"),
        }
    }
}

/// Where and how a lock was acquired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockPos {
    pub side: SubLock,
    pub start: u64,
    pub file: String,
    pub line: u32,
    pub function: String,
    pub preempt_count: u64,
    pub irq_sync: IrqSync,
}

/// The semantics of a lock, derived once from its type label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    ReaderOnly,
    WriterOnly,
    ReaderWriter,
}

impl LockKind {
    /// Classifies a kernel lock-type label.
    ///
    /// Returns `None` for labels the model does not know.
    pub fn classify(label: &str) -> Option<Self> {
        if WRITER_LOCK_TYPES.contains(&label) {
            Some(LockKind::WriterOnly)
        } else if READER_LOCK_TYPES.contains(&label) {
            Some(LockKind::ReaderOnly)
        } else if READER_WRITER_LOCK_TYPES.contains(&label) {
            Some(LockKind::ReaderWriter)
        } else {
            None
        }
    }

    pub fn supports(self, side: SubLock) -> bool {
        match (self, side) {
            (LockKind::ReaderWriter, _) => true,
            (LockKind::ReaderOnly, SubLock::Reader) => true,
            (LockKind::WriterOnly, SubLock::Writer) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::ReaderOnly => f.write_str("RLock"),
            LockKind::WriterOnly => f.write_str("WLock"),
            LockKind::ReaderWriter => f.write_str("RWLock"),
        }
    }
}

/// A lock variant together with the ids of the sub-locks it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockVariant {
    ReaderOnly { read_id: SubLockId },
    WriterOnly { write_id: SubLockId },
    ReaderWriter { read_id: SubLockId, write_id: SubLockId },
}

impl LockVariant {
    /// Assigns fresh ids to the sub-locks a lock of `kind` owns.
    pub fn init_ids(kind: LockKind, ids: &mut IdCounter) -> Self {
        match kind {
            LockKind::ReaderOnly => LockVariant::ReaderOnly {
                read_id: ids.next_id(),
            },
            LockKind::WriterOnly => LockVariant::WriterOnly {
                write_id: ids.next_id(),
            },
            LockKind::ReaderWriter => {
                let read_id = ids.next_id();
                let write_id = ids.next_id();
                LockVariant::ReaderWriter { read_id, write_id }
            }
        }
    }

    pub fn kind(&self) -> LockKind {
        match self {
            LockVariant::ReaderOnly { .. } => LockKind::ReaderOnly,
            LockVariant::WriterOnly { .. } => LockKind::WriterOnly,
            LockVariant::ReaderWriter { .. } => LockKind::ReaderWriter,
        }
    }

    pub fn id(&self, side: SubLock) -> Option<SubLockId> {
        match (self, side) {
            (LockVariant::ReaderOnly { read_id }, SubLock::Reader)
            | (LockVariant::ReaderWriter { read_id, .. }, SubLock::Reader) => Some(*read_id),
            (LockVariant::WriterOnly { write_id }, SubLock::Writer)
            | (LockVariant::ReaderWriter { write_id, .. }, SubLock::Writer) => Some(*write_id),
            _ => None,
        }
    }

    /// All sub-locks of this variant, writer side first.
    pub fn sub_locks(&self) -> Vec<(SubLock, SubLockId)> {
        [SubLock::Writer, SubLock::Reader]
            .into_iter()
            .filter_map(|side| self.id(side).map(|id| (side, id)))
            .collect()
    }
}

/// How an acquisition of one side relates to the current state of the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireState {
    /// Neither side is held.
    Free,
    /// The reader side is held and another reader joins.
    SharedReaders,
    /// The requested writer side is already held.
    WriterHeld,
    /// The opposite side is held.
    OtherSideHeld,
    /// Both sides are held, which no transition can produce.
    Contradictory,
}

/// One lock instance observed in the trace.
#[derive(Debug, Clone)]
pub struct Lock {
    address: u64,
    variant: LockVariant,
    label: String,
    allocation: Option<u64>,
    var_name: Option<String>,
    flags: u32,
    reader_count: u32,
    writer_count: u32,
    history: Vec<LockPos>,
}

impl Lock {
    pub fn new(
        address: u64,
        variant: LockVariant,
        label: String,
        allocation: Option<u64>,
        var_name: Option<String>,
    ) -> Self {
        Self {
            address,
            variant,
            label,
            allocation,
            var_name,
            flags: 0,
            reader_count: 0,
            writer_count: 0,
            history: Vec::new(),
        }
    }

    /// Returns the name of the pseudo-lock living at `address`, if any.
    pub fn pseudo_lock_name(address: u64) -> Option<&'static str> {
        match address {
            PSEUDOLOCK_ADDR_RCU => Some(PSEUDOLOCK_NAME_RCU),
            PSEUDOLOCK_ADDR_PREEMPT => Some(PSEUDOLOCK_NAME_PREEMPT),
            PSEUDOLOCK_ADDR_HARDIRQ => Some(PSEUDOLOCK_NAME_HARDIRQ),
            PSEUDOLOCK_ADDR_SOFTIRQ => Some(PSEUDOLOCK_NAME_SOFTIRQ),
            _ => None,
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn variant(&self) -> &LockVariant {
        &self.variant
    }

    pub fn kind(&self) -> LockKind {
        self.variant.kind()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn allocation(&self) -> Option<u64> {
        self.allocation
    }

    pub fn var_name(&self) -> Option<&str> {
        self.var_name.as_deref()
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// The recursive flag may change between two lock operations.
    pub fn update_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    pub fn is_recursive(&self) -> bool {
        self.flags & LOCK_FLAGS_RECURSIVE != 0
    }

    pub fn id(&self, side: SubLock) -> Option<SubLockId> {
        self.variant.id(side)
    }

    pub fn reader_count(&self) -> u32 {
        self.reader_count
    }

    pub fn writer_count(&self) -> u32 {
        self.writer_count
    }

    pub fn count(&self, side: SubLock) -> u32 {
        match side {
            SubLock::Reader => self.reader_count,
            SubLock::Writer => self.writer_count,
        }
    }

    fn count_mut(&mut self, side: SubLock) -> &mut u32 {
        match side {
            SubLock::Reader => &mut self.reader_count,
            SubLock::Writer => &mut self.writer_count,
        }
    }

    /// Only the sub-locks a variant owns can make it held.
    pub fn is_held(&self) -> bool {
        match self.variant {
            LockVariant::ReaderOnly { .. } => self.reader_count > 0,
            LockVariant::WriterOnly { .. } => self.writer_count > 0,
            LockVariant::ReaderWriter { .. } => self.reader_count > 0 || self.writer_count > 0,
        }
    }

    pub fn acquire_state(&self, side: SubLock) -> AcquireState {
        match (self.count(side) > 0, self.count(side.other()) > 0) {
            (true, true) => AcquireState::Contradictory,
            (false, false) => AcquireState::Free,
            (false, true) => AcquireState::OtherSideHeld,
            (true, false) => match side {
                SubLock::Reader => AcquireState::SharedReaders,
                SubLock::Writer => AcquireState::WriterHeld,
            },
        }
    }

    pub fn history(&self) -> &[LockPos] {
        &self.history
    }

    pub fn top_position(&self) -> Option<&LockPos> {
        self.history.last()
    }

    pub fn pop_position(&mut self) -> Option<LockPos> {
        self.history.pop()
    }

    /// Records one more nested acquisition of `pos.side`.
    pub fn begin_hold(&mut self, pos: LockPos) {
        *self.count_mut(pos.side) += 1;
        self.history.push(pos);
    }

    /// Drops one acquisition of `side`.
    ///
    /// Returns `false`, leaving the count at zero, if `side` was not held.
    pub fn end_hold(&mut self, side: SubLock) -> bool {
        let count = self.count_mut(side);
        if *count == 0 {
            false
        } else {
            *count -= 1;
            true
        }
    }

    /// Forgets every recorded acquisition and releases `side` completely.
    ///
    /// Returns the difference between the count of `side` and the number of
    /// positions that were dropped. Anything but zero means the two were out
    /// of sync; the count is zero afterwards either way.
    pub fn drain(&mut self, side: SubLock) -> i64 {
        let dropped = self.history.len() as i64;
        self.history.clear();

        let count = self.count_mut(side);
        let residual = i64::from(*count) - dropped;
        *count = 0;

        residual
    }

    /// Summarizes this lock's `side` for diagnostics.
    pub fn describe(&self, side: SubLock) -> String {
        let id = self
            .id(side)
            .map_or_else(|| String::from("-"), |id| id.to_string());

        format!("{},{},{},{:#x}", self.kind(), id, side, self.address)
    }
}
