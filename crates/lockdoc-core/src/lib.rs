use std::io::Read;

use anyhow::Error;
use log::info;

use crate::{event::Parser, sink::RecordSink, symbols::SymbolLookup};

/// Allocation bookkeeping of traced data types
pub mod alloc;

/// Kernel traces in delimited text format
pub mod delimited;

/// Routing of trace events to the allocation tracker and the transaction engine
pub mod dispatch;

/// The per-context transaction stacks and the lock state machine
pub mod engine;

pub mod error;

/// Generic types of trace events as well as parsing and encoding traits
pub mod event;

pub mod ids;

pub mod lock;
pub mod registry;

/// Output records and the tabular writer
pub mod sink;
pub mod tables;

pub mod summary;
pub mod symbols;
pub mod txn;

pub use delimited::{encoder::DelimitedEncoder, parser::DelimitedParser};
pub use dispatch::{ConvertConfig, Dispatcher};
pub use error::{FatalError, Inconsistency};
pub use summary::ConversionSummary;

/// Reconstructs the lock transactions of a kernel trace and writes them to `sink`.
///
/// A [`FatalError`] ends the conversion. It is returned inside the
/// [`anyhow::Error`] so callers can downcast it for its exit code.
pub fn convert<P: Parser, I: Read, L: SymbolLookup, S: RecordSink>(
    parser: &mut P,
    input: I,
    config: ConvertConfig,
    symbols: L,
    sink: &mut S,
) -> Result<ConversionSummary, Error> {
    info!("Reading {} trace", parser.format());

    let mut dispatcher = Dispatcher::new(config, symbols);
    for event in parser.parse(input).map_err(FatalError::Input)? {
        dispatcher.dispatch(event.map_err(FatalError::Input)?, sink)?;
    }

    let summary = dispatcher.finish(sink)?;
    info!(
        "Converted {} events into {} TXNs",
        summary.events.total, summary.txns.emitted
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use anyhow::Error;

    use crate::{
        ConvertConfig, DelimitedParser, FatalError, convert, sink::MemorySink,
        symbols::NoSymbols,
    };

    const TRACE: &str = "\
ts;ctx;action;ptr;size;type;lock_member;lock_op;file;line;fn;preempt_count;irq_sync;flags
1;1;a;1000;64;inode;NULL;NULL;fs/inode.c;1;alloc_inode;0;NULL;NULL
2;1;l;1008;NULL;spinlock_t;i_lock;1;fs/inode.c;2;iput;0;0;0
3;1;w;1010;8;NULL;NULL;NULL;fs/inode.c;3;iput;1;NULL;NULL
4;1;l;1008;NULL;spinlock_t;i_lock;3;fs/inode.c;4;iput;1;0;0
5;1;f;1000;NULL;NULL;NULL;NULL;NULL;NULL;NULL;NULL;NULL;NULL
";

    #[test]
    fn convert_delimited_trace() -> Result<(), Error> {
        let mut sink = MemorySink::new();
        let summary = convert(
            &mut DelimitedParser::default(),
            TRACE.as_bytes(),
            ConvertConfig::default(),
            NoSymbols,
            &mut sink,
        )?;

        assert_eq!(summary.events.total, 5);
        assert_eq!(summary.txns.emitted, 1);
        assert_eq!(sink.txns.len(), 1);
        assert_eq!(sink.held_during(1).len(), 1);
        assert_eq!(sink.accesses[0].txn, Some(1));

        Ok(())
    }

    #[test]
    fn fatal_errors_can_be_downcast() {
        let trace = TRACE.replace("spinlock_t", "frobnicator");
        let mut sink = MemorySink::new();

        let err = convert(
            &mut DelimitedParser::default(),
            trace.as_bytes(),
            ConvertConfig::default(),
            NoSymbols,
            &mut sink,
        )
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<FatalError>(),
            Some(FatalError::UnknownLockType { .. })
        ));
    }

    #[test]
    fn malformed_lines_are_input_errors() {
        let trace = format!("{TRACE}6;1;r;1000\n");
        let mut sink = MemorySink::new();

        let err = convert(
            &mut DelimitedParser::default(),
            trace.as_bytes(),
            ConvertConfig::default(),
            NoSymbols,
            &mut sink,
        )
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<FatalError>(),
            Some(FatalError::Input(_))
        ));
        assert!(format!("{err}").contains("line 7"));
    }
}
