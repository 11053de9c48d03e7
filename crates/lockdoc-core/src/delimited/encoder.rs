use std::io::Write;

use anyhow::Error;

use crate::event::{Encoder, Event, EventResult, Operation};

use super::{COLUMNS, DEFAULT_DELIMITER, NULL};

/// An encoder to emit kernel traces in delimited text format
pub struct DelimitedEncoder {
    delimiter: char,
}

impl DelimitedEncoder {
    pub fn new(delimiter: char) -> Self {
        Self { delimiter }
    }

    fn text(value: &str) -> String {
        if value.is_empty() {
            String::from(NULL)
        } else {
            value.to_string()
        }
    }

    fn encode_event(&self, event: Event) -> String {
        let null = || String::from(NULL);

        let (size, lock_op, irq_sync, flags) = match event.operation {
            Operation::Alloc { size } | Operation::Read { size } | Operation::Write { size } => {
                (size.to_string(), null(), null(), null())
            }
            Operation::Free => (null(), null(), null(), null()),
            Operation::Acquire {
                irq_sync, flags, ..
            } => (
                null(),
                event.operation.lock_op().map_or_else(null, |op| op.id().to_string()),
                irq_sync.id().to_string(),
                flags.to_string(),
            ),
            Operation::Release { flags, .. } => (
                null(),
                event.operation.lock_op().map_or_else(null, |op| op.id().to_string()),
                String::from("0"),
                flags.to_string(),
            ),
        };

        [
            event.ts.to_string(),
            event.ctx.to_string(),
            event.operation.action().to_string(),
            format!("{:x}", event.address),
            size,
            Self::text(&event.type_name),
            null(),
            lock_op,
            Self::text(&event.site.file),
            event.site.line.to_string(),
            Self::text(&event.site.function),
            format!("{:x}", event.preempt_count),
            irq_sync,
            flags,
        ]
        .join(&self.delimiter.to_string())
    }
}

impl Default for DelimitedEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_DELIMITER)
    }
}

impl Encoder for DelimitedEncoder {
    const EVENT_SIZE_HINT: usize = 96;

    fn encode<W: Write, I: IntoIterator<Item = EventResult>>(
        &mut self,
        input: I,
        mut output: W,
    ) -> Result<(), Error> {
        writeln!(output, "{}", COLUMNS.join(&self.delimiter.to_string()))?;

        for event in input {
            writeln!(output, "{}", self.encode_event(event?))?;
        }

        Ok(())
    }

    fn format(&self) -> &'static str {
        "Delimited"
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;

    use crate::{
        delimited::parser::DelimitedParser,
        event::{Encoder, Event, EventResult, Operation, Parser, Site},
        lock::{IrqSync, SubLock},
    };

    use super::DelimitedEncoder;

    #[test]
    fn encode_valid_trace() -> Result<(), Error> {
        let trace: Vec<EventResult> = vec![
            Event::new(1, 3, Operation::Alloc { size: 64 }, 0x1000).with_type("inode"),
            Event::new(
                2,
                3,
                Operation::Acquire {
                    side: SubLock::Reader,
                    irq_sync: IrqSync::Bh,
                    flags: 0,
                },
                0x1008,
            )
            .with_type("rwlock_t")
            .with_site(Site::new("fs/inode.c", 7, "iput"))
            .with_preempt_count(0x200),
            Event::new(3, 3, Operation::Free, 0x1000),
        ]
        .into_iter()
        .map(Ok)
        .collect();

        let mut buffer = Vec::new();
        DelimitedEncoder::default().encode(trace, &mut buffer)?;

        let encoded = String::from_utf8(buffer)?;
        let expected = [
            "ts;ctx;action;ptr;size;type;lock_member;lock_op;file;line;fn;preempt_count;irq_sync;flags",
            "1;3;a;1000;64;inode;NULL;NULL;NULL;0;NULL;0;NULL;NULL",
            "2;3;l;1008;NULL;rwlock_t;NULL;0;fs/inode.c;7;iput;200;3;0",
            "3;3;f;1000;NULL;NULL;NULL;NULL;NULL;0;NULL;0;NULL;NULL\n",
        ]
        .join("\n");

        assert_eq!(expected, encoded);

        Ok(())
    }

    #[test]
    fn parser_reads_encoded_trace() -> Result<(), Error> {
        let events = vec![
            Event::new(
                10,
                -1,
                Operation::Release {
                    side: SubLock::Writer,
                    flags: 1,
                },
                0x45,
            )
            .with_type("softirq")
            .with_site(Site::new("kernel/softirq.c", 99, "__do_softirq")),
            Event::new(11, 4, Operation::Read { size: 4 }, 0xdead0),
        ];

        let mut buffer = Vec::new();
        DelimitedEncoder::new('|').encode(events.iter().cloned().map(Ok), &mut buffer)?;

        let parsed: Vec<Event> = DelimitedParser::new('|')
            .parse(buffer.as_slice())?
            .collect::<Result<_, _>>()?;

        assert_eq!(events, parsed);

        Ok(())
    }
}
