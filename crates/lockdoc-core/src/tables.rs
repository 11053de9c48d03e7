use std::{
    fmt::Display,
    io::{self, Write},
};

use crate::{
    error::FatalError,
    sink::{
        AccessRecord, AllocationRecord, DataTypeRecord, LockHeldRecord, LockRecord, RecordSink,
        TxnRecord,
    },
};

/// The placeholder the tables use for missing values.
pub const NULL: &str = "\\N";

/// The output tables of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    DataTypes,
    Allocations,
    Accesses,
    Locks,
    LocksHeld,
    Txns,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::DataTypes,
        Table::Allocations,
        Table::Accesses,
        Table::Locks,
        Table::LocksHeld,
        Table::Txns,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Table::DataTypes => "data_types.csv",
            Table::Allocations => "allocations.csv",
            Table::Accesses => "accesses.csv",
            Table::Locks => "locks.csv",
            Table::LocksHeld => "locks_held.csv",
            Table::Txns => "txns.csv",
        }
    }

    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Table::DataTypes => &["id", "name"],
            Table::Allocations => &["id", "type_id", "ptr", "size", "start", "end"],
            Table::Accesses => &[
                "id", "alloc_id", "txn_id", "ts", "type", "size", "address", "file", "line", "fn",
            ],
            Table::Locks => &[
                "id",
                "ptr",
                "embedded_in",
                "locktype",
                "sub_lock",
                "lock_var_name",
                "flags",
            ],
            Table::LocksHeld => &[
                "txn_id",
                "lock_id",
                "start",
                "lastFile",
                "lastLine",
                "lastFn",
                "lastPreemptCount",
                "lastIRQSync",
            ],
            Table::Txns => &["id", "start", "end"],
        }
    }
}

fn nullable<T: Display>(value: Option<T>) -> String {
    value.map_or_else(|| String::from(NULL), |v| v.to_string())
}

/// Writes records as delimited text, one output per [`Table`].
pub struct TableWriter<W: Write> {
    delimiter: char,
    data_types: W,
    allocations: W,
    accesses: W,
    locks: W,
    locks_held: W,
    txns: W,
}

impl<W: Write> TableWriter<W> {
    /// Opens every table through `open` and writes the header rows.
    pub fn new(
        delimiter: char,
        mut open: impl FnMut(Table) -> io::Result<W>,
    ) -> Result<Self, FatalError> {
        let mut writer = Self {
            delimiter,
            data_types: open(Table::DataTypes)?,
            allocations: open(Table::Allocations)?,
            accesses: open(Table::Accesses)?,
            locks: open(Table::Locks)?,
            locks_held: open(Table::LocksHeld)?,
            txns: open(Table::Txns)?,
        };

        for table in Table::ALL {
            let columns: Vec<String> = table.columns().iter().map(|c| c.to_string()).collect();
            writer.write_row(table, &columns)?;
        }

        Ok(writer)
    }

    fn output(&mut self, table: Table) -> &mut W {
        match table {
            Table::DataTypes => &mut self.data_types,
            Table::Allocations => &mut self.allocations,
            Table::Accesses => &mut self.accesses,
            Table::Locks => &mut self.locks,
            Table::LocksHeld => &mut self.locks_held,
            Table::Txns => &mut self.txns,
        }
    }

    fn write_row(&mut self, table: Table, fields: &[String]) -> Result<(), FatalError> {
        let line = fields.join(&self.delimiter.to_string());
        writeln!(self.output(table), "{line}")?;

        Ok(())
    }

    /// Returns the outputs in the order of [`Table::ALL`].
    pub fn into_inner(self) -> [W; 6] {
        [
            self.data_types,
            self.allocations,
            self.accesses,
            self.locks,
            self.locks_held,
            self.txns,
        ]
    }
}

impl<W: Write> RecordSink for TableWriter<W> {
    fn data_type(&mut self, record: DataTypeRecord) -> Result<(), FatalError> {
        self.write_row(Table::DataTypes, &[record.id.to_string(), record.name])
    }

    fn allocation(&mut self, record: AllocationRecord) -> Result<(), FatalError> {
        self.write_row(
            Table::Allocations,
            &[
                record.id.to_string(),
                record.type_id.to_string(),
                record.base.to_string(),
                record.size.to_string(),
                record.start.to_string(),
                nullable(record.end),
            ],
        )
    }

    fn access(&mut self, record: AccessRecord) -> Result<(), FatalError> {
        self.write_row(
            Table::Accesses,
            &[
                record.id.to_string(),
                nullable(record.allocation),
                nullable(record.txn),
                record.ts.to_string(),
                record.kind.as_char().to_string(),
                record.size.to_string(),
                record.address.to_string(),
                record.file,
                record.line.to_string(),
                record.function,
            ],
        )
    }

    fn lock(&mut self, record: LockRecord) -> Result<(), FatalError> {
        self.write_row(
            Table::Locks,
            &[
                record.id.to_string(),
                record.address.to_string(),
                nullable(record.allocation),
                record.label,
                record.side.as_char().to_string(),
                nullable(record.var_name),
                record.flags.to_string(),
            ],
        )
    }

    fn lock_held(&mut self, record: LockHeldRecord) -> Result<(), FatalError> {
        self.write_row(
            Table::LocksHeld,
            &[
                record.txn.to_string(),
                record.lock.to_string(),
                record.start.to_string(),
                record.file,
                record.line.to_string(),
                record.function,
                record.preempt_count.to_string(),
                record.irq_sync.to_string(),
            ],
        )
    }

    fn txn(&mut self, record: TxnRecord) -> Result<(), FatalError> {
        self.write_row(
            Table::Txns,
            &[
                record.id.to_string(),
                record.start.to_string(),
                record.end.to_string(),
            ],
        )
    }

    fn flush(&mut self) -> Result<(), FatalError> {
        for table in Table::ALL {
            self.output(table).flush()?;
        }

        Ok(())
    }
}
