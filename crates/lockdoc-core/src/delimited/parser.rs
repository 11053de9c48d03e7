use std::{
    io::{BufRead, BufReader, Lines, Read},
    str::FromStr,
};

use anyhow::{Context, Error, anyhow, ensure};
use log::warn;

use crate::{
    event::{Event, EventResult, Operation, Parser, Site},
    lock::{IrqSync, LockOp},
};

use super::{
    COL_ACTION, COL_CTX, COL_FILE, COL_FLAGS, COL_FN, COL_IRQ_SYNC, COL_LINE, COL_LOCK_OP,
    COL_PREEMPT_COUNT, COL_PTR, COL_SIZE, COL_TS, COL_TYPE, COLUMNS, DEFAULT_DELIMITER, NULL,
};

/// A parser for kernel traces in delimited text format.
pub struct DelimitedParser {
    delimiter: char,
}

impl DelimitedParser {
    pub fn new(delimiter: char) -> Self {
        Self { delimiter }
    }
}

impl Default for DelimitedParser {
    fn default() -> Self {
        Self::new(DEFAULT_DELIMITER)
    }
}

impl Parser for DelimitedParser {
    type Iter<R: Read> = DelimitedIterator<R>;

    fn parse<R: Read>(&mut self, input: R) -> Result<Self::Iter<R>, Error> {
        Ok(DelimitedIterator::new(input, self.delimiter))
    }

    fn format(&self) -> &'static str {
        "Delimited"
    }
}

pub struct DelimitedIterator<R: Read> {
    lines: Lines<BufReader<R>>,
    delimiter: char,
    line_no: usize,
}

impl<R: Read> DelimitedIterator<R> {
    fn new(input: R, delimiter: char) -> Self {
        Self {
            lines: BufReader::new(input).lines(),
            delimiter,
            line_no: 0,
        }
    }

    fn inner_next(&mut self) -> Result<Option<Event>, Error> {
        loop {
            let Some(line) = self.lines.next() else {
                return Ok(None);
            };
            self.line_no += 1;
            let line = line.with_context(|| format!("Cannot read line {}", self.line_no))?;
            let line = line.strip_suffix('\r').unwrap_or(&line);

            if self.line_no == 1 {
                if !line.starts_with(|c: char| c.is_ascii_digit()) {
                    // Header line
                    continue;
                }
                warn!("First line starts with a digit, assuming the trace has no header");
            }

            if line.is_empty() {
                continue;
            }

            return parse_line(line, self.delimiter)
                .with_context(|| format!("Malformed event in line {}", self.line_no))
                .map(Some);
        }
    }
}

impl<R: Read> Iterator for DelimitedIterator<R> {
    type Item = EventResult;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner_next().transpose()
    }
}

fn is_null(field: &str) -> bool {
    field == NULL
}

fn decimal<T: FromStr + Default>(field: &str, column: usize) -> Result<T, Error>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if is_null(field) {
        return Ok(T::default());
    }

    field
        .parse()
        .with_context(|| format!("Invalid value '{field}' in column '{}'", COLUMNS[column]))
}

fn hex(field: &str, column: usize) -> Result<u64, Error> {
    if is_null(field) {
        return Ok(0);
    }

    let digits = field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
        .unwrap_or(field);

    u64::from_str_radix(digits, 16)
        .with_context(|| format!("Invalid value '{field}' in column '{}'", COLUMNS[column]))
}

fn text(field: &str) -> String {
    if is_null(field) {
        String::new()
    } else {
        field.to_string()
    }
}

fn parse_line(line: &str, delimiter: char) -> Result<Event, Error> {
    let fields: Vec<&str> = line.split(delimiter).collect();
    ensure!(
        fields.len() == COLUMNS.len(),
        "Expected {} columns, found {}",
        COLUMNS.len(),
        fields.len()
    );

    let ts = decimal(fields[COL_TS], COL_TS)?;
    let ctx = decimal(fields[COL_CTX], COL_CTX)?;
    let address = hex(fields[COL_PTR], COL_PTR)?;
    let size = decimal(fields[COL_SIZE], COL_SIZE)?;

    let mut action = fields[COL_ACTION].chars();
    let action = match (action.next(), action.next()) {
        (Some(action), None) => Operation::validate_action(action)?,
        _ => return Err(anyhow!("Invalid action '{}'", fields[COL_ACTION])),
    };

    let operation = match action {
        'a' => Operation::Alloc { size },
        'f' => Operation::Free,
        'r' => Operation::Read { size },
        'w' => Operation::Write { size },
        _ => {
            ensure!(!is_null(fields[COL_LOCK_OP]), "Lock event without lock_op");
            let op = LockOp::try_from_id(decimal(fields[COL_LOCK_OP], COL_LOCK_OP)?)?;
            let irq_sync = IrqSync::try_from_id(decimal(fields[COL_IRQ_SYNC], COL_IRQ_SYNC)?)?;
            let flags = u32::try_from(hex_or_decimal(fields[COL_FLAGS], COL_FLAGS)?)?;
            Operation::from_lock_op(op, irq_sync, flags)
        }
    };

    let site = Site::new(
        text(fields[COL_FILE]),
        decimal(fields[COL_LINE], COL_LINE)?,
        text(fields[COL_FN]),
    );

    Ok(Event::new(ts, ctx, operation, address)
        .with_type(text(fields[COL_TYPE]))
        .with_site(site)
        .with_preempt_count(hex(fields[COL_PREEMPT_COUNT], COL_PREEMPT_COUNT)?))
}

fn hex_or_decimal(field: &str, column: usize) -> Result<u64, Error> {
    if field.starts_with("0x") || field.starts_with("0X") {
        hex(field, column)
    } else {
        decimal(field, column)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;

    use super::DelimitedParser;
    use crate::{
        event::{Event, Operation, Parser, Site},
        lock::{IrqSync, SubLock},
    };

    const HEADER: &str = "ts;ctx;action;ptr;size;type;lock_member;lock_op;file;line;fn;preempt_count;irq_sync;flags";

    #[test]
    fn parse_valid_trace() -> Result<(), Error> {
        let trace = [
            HEADER,
            "1;7;a;ffff888000001000;64;inode;NULL;NULL;fs/inode.c;120;alloc_inode;0;NULL;NULL",
            "2;7;l;0xffff888000001008;4;spinlock_t;i_lock;1;fs/inode.c;300;iput;1;2;0x1",
            "3;7;w;ffff888000001010;8;NULL;NULL;NULL;fs/inode.c;301;iput;1;NULL;NULL",
            "4;-2;l;42;0;rcu;NULL;2;kernel/rcu/tree.c;10;rcu_core;100;0;0",
            "5;7;f;ffff888000001000;NULL;NULL;NULL;NULL;NULL;NULL;NULL;NULL;NULL;NULL",
        ]
        .join("\n");

        let parsed: Vec<Event> = DelimitedParser::default()
            .parse(trace.as_bytes())?
            .collect::<Result<_, _>>()?;

        let expected = vec![
            Event::new(1, 7, Operation::Alloc { size: 64 }, 0xffff888000001000)
                .with_type("inode")
                .with_site(Site::new("fs/inode.c", 120, "alloc_inode")),
            Event::new(
                2,
                7,
                Operation::Acquire {
                    side: SubLock::Writer,
                    irq_sync: IrqSync::IrqNested,
                    flags: 1,
                },
                0xffff888000001008,
            )
            .with_type("spinlock_t")
            .with_site(Site::new("fs/inode.c", 300, "iput"))
            .with_preempt_count(1),
            Event::new(3, 7, Operation::Write { size: 8 }, 0xffff888000001010)
                .with_site(Site::new("fs/inode.c", 301, "iput"))
                .with_preempt_count(1),
            Event::new(
                4,
                -2,
                Operation::Release {
                    side: SubLock::Reader,
                    flags: 0,
                },
                0x42,
            )
            .with_type("rcu")
            .with_site(Site::new("kernel/rcu/tree.c", 10, "rcu_core"))
            .with_preempt_count(0x100),
            Event::new(5, 7, Operation::Free, 0xffff888000001000),
        ];

        assert_eq!(expected, parsed);

        Ok(())
    }

    #[test]
    fn parse_trace_without_header() -> Result<(), Error> {
        let trace = "1;1;r;1000;4;NULL;NULL;NULL;a.c;1;f;0;NULL;NULL\n";

        let parsed: Vec<Event> = DelimitedParser::default()
            .parse(trace.as_bytes())?
            .collect::<Result<_, _>>()?;

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].operation, Operation::Read { size: 4 });

        Ok(())
    }

    #[test]
    fn honor_delimiter() -> Result<(), Error> {
        let trace = "1,1,f,1000,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL";

        let parsed: Vec<Event> = DelimitedParser::new(',')
            .parse(trace.as_bytes())?
            .collect::<Result<_, _>>()?;

        assert_eq!(parsed, vec![Event::new(1, 1, Operation::Free, 0x1000)]);

        Ok(())
    }

    #[test]
    fn parse_crlf_trace() -> Result<(), Error> {
        let trace = [
            HEADER,
            "1;1;l;1000;NULL;mutex;NULL;1;NULL;NULL;NULL;NULL;0;0x1",
            "2;1;f;1000;NULL;NULL;NULL;NULL;NULL;NULL;NULL;NULL;NULL;NULL",
        ]
        .join("\r\n");

        let parsed: Vec<Event> = DelimitedParser::default()
            .parse(trace.as_bytes())?
            .collect::<Result<_, _>>()?;

        assert_eq!(parsed.len(), 2);
        assert!(matches!(
            parsed[0].operation,
            Operation::Acquire { flags: 1, .. }
        ));

        Ok(())
    }

    #[test]
    fn invalid_utf8_names_the_line() -> Result<(), Error> {
        let mut trace = format!("{HEADER}\n").into_bytes();
        trace.extend_from_slice(b"1;1;f;1000;NULL;\xff;NULL;NULL;NULL;NULL;NULL;NULL;NULL;NULL\n");

        let mut iter = DelimitedParser::default().parse(trace.as_slice())?;
        let err = iter.next().unwrap().unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));

        Ok(())
    }

    #[test]
    fn fail_on_wrong_column_count() -> Result<(), Error> {
        let trace = [HEADER, "1;1;f;1000;NULL"].join("\n");

        let mut iter = DelimitedParser::default().parse(trace.as_bytes())?;
        let err = iter.next().unwrap().unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));

        Ok(())
    }

    #[test]
    fn fail_on_invalid_fields() -> Result<(), Error> {
        let broken = [
            "x;1;f;1000;NULL;NULL;NULL;NULL;NULL;NULL;NULL;NULL;NULL;NULL",
            "1;1;q;1000;NULL;NULL;NULL;NULL;NULL;NULL;NULL;NULL;NULL;NULL",
            "1;1;l;1000;NULL;mutex;NULL;7;NULL;NULL;NULL;NULL;0;0",
            "1;1;l;1000;NULL;mutex;NULL;NULL;NULL;NULL;NULL;NULL;0;0",
            "1;1;l;1000;NULL;mutex;NULL;1;NULL;NULL;NULL;NULL;9;0",
            "1;1;r;zz;4;NULL;NULL;NULL;NULL;NULL;NULL;NULL;NULL;NULL",
        ];

        for line in broken {
            let trace = [HEADER, line].join("\n");
            let mut iter = DelimitedParser::default().parse(trace.as_bytes())?;
            iter.next().unwrap().unwrap_err();
        }

        Ok(())
    }
}
