/// Utilities to parse kernel traces in delimited text format.
pub mod parser;

/// Utilities to encode kernel traces to delimited text format.
pub mod encoder;

// ============================================================================
// Statics, which are relevant for reading and writing delimited traces:
pub const DEFAULT_DELIMITER: char = ';';

/// The literal that marks a missing value.
const NULL: &str = "NULL";

const COLUMNS: [&str; 14] = [
    "ts",
    "ctx",
    "action",
    "ptr",
    "size",
    "type",
    "lock_member",
    "lock_op",
    "file",
    "line",
    "fn",
    "preempt_count",
    "irq_sync",
    "flags",
];

const COL_TS: usize = 0;
const COL_CTX: usize = 1;
const COL_ACTION: usize = 2;
const COL_PTR: usize = 3;
const COL_SIZE: usize = 4;
const COL_TYPE: usize = 5;
const COL_LOCK_OP: usize = 7;
const COL_FILE: usize = 8;
const COL_LINE: usize = 9;
const COL_FN: usize = 10;
const COL_PREEMPT_COUNT: usize = 11;
const COL_IRQ_SYNC: usize = 12;
const COL_FLAGS: usize = 13;
// ============================================================================
