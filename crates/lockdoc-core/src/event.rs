use std::io::{Read, Write};

use anyhow::{Error, anyhow};

use crate::{
    lock::{IrqSync, LockOp, SubLock},
    txn::ContextId,
};

/// Whether a memory access reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

impl AccessKind {
    pub fn as_char(self) -> char {
        match self {
            AccessKind::Read => 'r',
            AccessKind::Write => 'w',
        }
    }
}

/// The generic (format-independent) representation of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Alloc { size: u64 },
    Free,
    Acquire {
        side: SubLock,
        irq_sync: IrqSync,
        flags: u32,
    },
    Release { side: SubLock, flags: u32 },
    Read { size: u64 },
    Write { size: u64 },
}

impl Operation {
    /// Returns the character the trace uses for the type of the operation
    pub fn action(&self) -> char {
        match self {
            Operation::Alloc { .. } => 'a',
            Operation::Free => 'f',
            Operation::Acquire { .. } | Operation::Release { .. } => 'l',
            Operation::Read { .. } => 'r',
            Operation::Write { .. } => 'w',
        }
    }

    /// Builds the lock operation `op` of the trace.
    pub fn from_lock_op(op: LockOp, irq_sync: IrqSync, flags: u32) -> Self {
        if op.is_acquire() {
            Operation::Acquire {
                side: op.side(),
                irq_sync,
                flags,
            }
        } else {
            Operation::Release {
                side: op.side(),
                flags,
            }
        }
    }

    pub fn lock_op(&self) -> Option<LockOp> {
        match self {
            Operation::Acquire { side, .. } => Some(LockOp::acquire(*side)),
            Operation::Release { side, .. } => Some(LockOp::release(*side)),
            _ => None,
        }
    }

    pub fn access(&self) -> Option<(AccessKind, u64)> {
        match self {
            Operation::Read { size } => Some((AccessKind::Read, *size)),
            Operation::Write { size } => Some((AccessKind::Write, *size)),
            _ => None,
        }
    }

    /// Checks that `action` is an operation type this trace format knows.
    pub fn validate_action(action: char) -> Result<char, Error> {
        match action {
            'a' | 'f' | 'l' | 'r' | 'w' => Ok(action),
            _ => Err(anyhow!("Action '{action}' was not recognized")),
        }
    }
}

/// A source location in the traced kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Site {
    pub file: String,
    pub line: u32,
    pub function: String,
}

impl Site {
    pub fn new(file: impl Into<String>, line: u32, function: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line,
            function: function.into(),
        }
    }
}

/// The generic (format-independent) representation of an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub ts: u64,
    pub ctx: ContextId,
    pub operation: Operation,
    /// The lock address, the base of an allocation, or the accessed address.
    pub address: u64,
    /// The lock type of lock events or the data type of allocations.
    pub type_name: String,
    pub site: Site,
    pub preempt_count: u64,
}

impl Event {
    pub fn new(ts: u64, ctx: ContextId, operation: Operation, address: u64) -> Self {
        Self {
            ts,
            ctx,
            operation,
            address,
            type_name: String::new(),
            site: Site::default(),
            preempt_count: 0,
        }
    }

    pub fn with_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = type_name.into();
        self
    }

    pub fn with_site(mut self, site: Site) -> Self {
        self.site = site;
        self
    }

    pub fn with_preempt_count(mut self, preempt_count: u64) -> Self {
        self.preempt_count = preempt_count;
        self
    }
}

/// Shared iterator item type for [`Parser`] and [`Encoder`] implementations.
pub type EventResult = Result<Event, Error>;

/// Common trait for parsers of kernel traces
pub trait Parser {
    type Iter<R: Read>: Iterator<Item = EventResult>;

    /// Parses a kernel trace of some specific format.
    fn parse<R: Read>(&mut self, input: R) -> Result<Self::Iter<R>, Error>;

    /// Returns a string identifying the trace format of this parser.
    fn format(&self) -> &'static str;
}

/// Common trait for encoders of kernel traces
pub trait Encoder {
    /// A constant that indicates the approximate space in bytes an event will occupy.
    const EVENT_SIZE_HINT: usize;

    /// Encodes a kernel trace into some specific format.
    fn encode<W: Write, I: IntoIterator<Item = EventResult>>(
        &mut self,
        input: I,
        output: W,
    ) -> Result<(), Error>;

    /// Returns a string identifying the trace format of this encoder.
    fn format(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::{AccessKind, Operation};
    use crate::lock::{IrqSync, LockOp, SubLock};

    #[test]
    fn fail_on_invalid_action() {
        for action in ['x', 'p', 'v', 'A', '0'] {
            Operation::validate_action(action).unwrap_err();
        }
    }

    #[test]
    fn lock_operations_round_trip_through_lock_ops() {
        for op in [LockOp::PRead, LockOp::PWrite, LockOp::VRead, LockOp::VWrite] {
            let operation = Operation::from_lock_op(op, IrqSync::Bh, 1);
            assert_eq!(operation.action(), 'l');
            assert_eq!(operation.lock_op(), Some(op));
        }

        assert_eq!(
            Operation::from_lock_op(LockOp::VRead, IrqSync::Irq, 0),
            Operation::Release {
                side: SubLock::Reader,
                flags: 0
            }
        );
        assert_eq!(Operation::Free.lock_op(), None);
    }

    #[test]
    fn accesses() {
        assert_eq!(
            Operation::Write { size: 8 }.access(),
            Some((AccessKind::Write, 8))
        );
        assert_eq!(Operation::Alloc { size: 8 }.access(), None);
        assert_eq!(AccessKind::Read.as_char(), 'r');
    }
}
