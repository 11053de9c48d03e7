use log::{debug, info, trace};

use crate::{
    alloc::AllocationTracker,
    delimited::DEFAULT_DELIMITER,
    engine::{Transition, TxnEngine},
    error::{FatalError, Inconsistency, report},
    event::{AccessKind, Event, Operation, Site},
    ids::IdCounter,
    lock::{IrqSync, LockOp},
    registry::LockPlacement,
    sink::{AccessRecord, RecordSink},
    summary::{ConversionSummary, EventCounts},
    symbols::SymbolLookup,
    txn::ContextId,
};

/// Lock types whose events are dropped before they reach the engine.
const IGNORED_LOCK_TYPES: [&str; 2] = ["seqlock_t", "seqcount_t"];

/// Settings of a conversion.
#[derive(Debug, Clone)]
pub struct ConvertConfig {
    /// Whether transactions without memory accesses are left out of the output.
    pub skip_empty_txns: bool,
    /// The column delimiter of the input trace and the output tables.
    pub delimiter: char,
    /// A prefix stripped from the source file paths of the trace.
    pub kernel_dir: Option<String>,
    /// The data types whose allocations are tracked. `None` tracks all of them.
    pub data_types: Option<Vec<String>>,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            skip_empty_txns: true,
            delimiter: DEFAULT_DELIMITER,
            kernel_dir: None,
            data_types: None,
        }
    }
}

/// A memory access waiting to be attributed.
#[derive(Debug, Clone)]
struct PendingAccess {
    ctx: ContextId,
    ts: u64,
    kind: AccessKind,
    size: u64,
    address: u64,
    site: Site,
}

/// Routes decoded trace events to the allocation tracker and the engine.
pub struct Dispatcher<L: SymbolLookup> {
    kernel_dir: Option<String>,
    engine: TxnEngine,
    allocations: AllocationTracker,
    symbols: L,
    pending: Vec<PendingAccess>,
    access_ids: IdCounter,
    discarded_accesses: u64,
    counts: EventCounts,
    last_ts: u64,
}

impl<L: SymbolLookup> Dispatcher<L> {
    pub fn new(config: ConvertConfig, symbols: L) -> Self {
        let kernel_dir = config.kernel_dir.map(|dir| {
            if dir.ends_with('/') {
                dir
            } else {
                format!("{dir}/")
            }
        });

        Self {
            kernel_dir,
            engine: TxnEngine::new(config.skip_empty_txns),
            allocations: AllocationTracker::new(config.data_types),
            symbols,
            pending: Vec::new(),
            access_ids: IdCounter::new(),
            discarded_accesses: 0,
            counts: EventCounts::default(),
            last_ts: 0,
        }
    }

    pub fn engine(&self) -> &TxnEngine {
        &self.engine
    }

    pub fn allocations(&self) -> &AllocationTracker {
        &self.allocations
    }

    /// Processes one event.
    pub fn dispatch<S: RecordSink>(&mut self, event: Event, sink: &mut S) -> Result<(), FatalError> {
        self.counts.record(&event.operation);
        self.last_ts = self.last_ts.max(event.ts);

        if let Some((kind, size)) = event.operation.access() {
            let site = self.strip_kernel_dir(event.site);
            self.pending.push(PendingAccess {
                ctx: event.ctx,
                ts: event.ts,
                kind,
                size,
                address: event.address,
                site,
            });
            return Ok(());
        }

        let lock_op = event.operation.lock_op();
        if lock_op.is_some() && IGNORED_LOCK_TYPES.contains(&event.type_name.as_str()) {
            self.counts.ignored += 1;
            return Ok(());
        }

        self.flush_accesses(lock_op.map(|_| (event.address, event.ctx)), sink)?;

        match event.operation {
            Operation::Alloc { size } => {
                self.allocations.alloc(
                    event.address,
                    size,
                    &event.type_name,
                    event.ts,
                    self.engine.diagnostics_mut(),
                    sink,
                )?;
            }
            Operation::Free => {
                if let Some(allocation) = self.allocations.free(
                    event.address,
                    event.ts,
                    self.engine.diagnostics_mut(),
                    sink,
                )? {
                    let purged = self
                        .engine
                        .free_range(allocation.base, allocation.size, event.ts);
                    if purged > 0 {
                        trace!("Purged {purged} locks at {:#x}", allocation.base);
                    }
                }
            }
            Operation::Acquire {
                side,
                irq_sync,
                flags,
            } => self.lock_event(event, LockOp::acquire(side), irq_sync, flags, sink)?,
            Operation::Release { side, flags } => {
                self.lock_event(event, LockOp::release(side), IrqSync::None, flags, sink)?
            }
            Operation::Read { .. } | Operation::Write { .. } => {}
        }

        Ok(())
    }

    fn lock_event<S: RecordSink>(
        &mut self,
        event: Event,
        op: LockOp,
        irq_sync: IrqSync,
        flags: u32,
        sink: &mut S,
    ) -> Result<(), FatalError> {
        if !op.is_acquire() && self.engine.registry().find(event.address).is_none() {
            report!(
                self.engine.diagnostics_mut(),
                Inconsistency::NoRunningTxn {
                    lock: format!("{},-,{},{:#x}", event.type_name, op.side(), event.address),
                    op,
                    ts: event.ts,
                    ctx: event.ctx,
                }
            );
            return Ok(());
        }

        let allocations = &self.allocations;
        let symbols = &self.symbols;
        let key = self.engine.acquire_or_create(
            event.address,
            &event.type_name,
            flags,
            |address| {
                let allocation = allocations.containing(address).map(|a| a.id);
                let var_name = match allocation {
                    Some(_) => None,
                    None => symbols.symbol_at(address).map(str::to_string),
                };
                LockPlacement {
                    allocation,
                    var_name,
                }
            },
            sink,
        )?;

        let site = self.strip_kernel_dir(event.site);
        let transition = Transition {
            op,
            ctx: event.ctx,
            ts: event.ts,
            site: &site,
            preempt_count: event.preempt_count,
            irq_sync,
            flags,
        };

        self.engine.transition(key, &transition, sink)
    }

    /// Writes the buffered accesses, attributing each to the innermost
    /// transaction of its context.
    ///
    /// `lock` is the address and context of an upcoming lock operation. The
    /// lock implementation's own read-modify-write of that address is dropped.
    fn flush_accesses<S: RecordSink>(
        &mut self,
        lock: Option<(u64, ContextId)>,
        sink: &mut S,
    ) -> Result<(), FatalError> {
        if let Some((address, ctx)) = lock
            && let [.., first, second] = self.pending.as_slice()
            && first.ctx == ctx
            && second.ctx == ctx
            && first.ts == second.ts
            && first.kind == AccessKind::Read
            && second.kind == AccessKind::Write
            && first.address == address
            && second.address == address
            && first.size == second.size
        {
            debug!(
                "Discarding r+w at ts={} of {} bytes at {address:#x}",
                first.ts, first.size
            );
            self.pending.truncate(self.pending.len() - 2);
            self.discarded_accesses += 2;
        }

        for access in std::mem::take(&mut self.pending) {
            let txn = self.engine.count_access(access.ctx);
            let allocation = self.allocations.containing(access.address).map(|a| a.id);

            sink.access(AccessRecord {
                id: self.access_ids.next_id(),
                allocation,
                txn,
                ts: access.ts,
                kind: access.kind,
                size: access.size,
                address: access.address,
                file: access.site.file,
                line: access.site.line,
                function: access.site.function,
            })?;
        }

        Ok(())
    }

    fn strip_kernel_dir(&self, mut site: Site) -> Site {
        if let Some(dir) = &self.kernel_dir
            && let Some(relative) = site.file.strip_prefix(dir.as_str())
        {
            site.file = relative.to_string();
        }

        site
    }

    /// Flushes all remaining state at the end of the trace.
    pub fn finish<S: RecordSink>(mut self, sink: &mut S) -> Result<ConversionSummary, FatalError> {
        self.flush_accesses(None, sink)?;

        if !self.engine.is_idle() {
            info!("Closing the remaining TXNs at ts={}", self.last_ts);
        }
        self.engine.close_all(self.last_ts, sink)?;
        self.allocations.finish(sink)?;
        sink.flush()?;

        let mut summary = ConversionSummary {
            events: self.counts,
            txns: self.engine.stats().into(),
            sub_locks: self.engine.registry().sub_lock_count(),
            allocations: self.allocations.total_count(),
            data_types: self.allocations.type_count() as u64,
            accesses: self.access_ids.peek() - 1,
            discarded_accesses: self.discarded_accesses,
            ..ConversionSummary::default()
        };
        summary.fill_inconsistencies(self.engine.diagnostics());

        Ok(summary)
    }
}
