use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::{debug, info, trace};

use crate::{
    error::{Diagnostics, FatalError, Inconsistency, report},
    event::Site,
    ids::IdCounter,
    lock::{AcquireState, IrqSync, Lock, LockOp, LockPos, SubLock},
    registry::{LockKey, LockPlacement, LockRegistry},
    sink::{LockHeldRecord, LockRecord, RecordSink, TxnRecord},
    txn::{ContextId, Txn, TxnId, TxnStack},
};

/// A lock operation together with where and how it happened.
#[derive(Debug, Clone)]
pub struct Transition<'a> {
    pub op: LockOp,
    pub ctx: ContextId,
    pub ts: u64,
    pub site: &'a Site,
    pub preempt_count: u64,
    pub irq_sync: IrqSync,
    pub flags: u32,
}

/// Counters describing what the engine did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub opened: u64,
    pub emitted: u64,
    pub suppressed: u64,
    pub reopened: u64,
    pub held_records: u64,
}

/// Reconstructs transactions from lock transitions.
///
/// The engine owns the lock registry and one transaction stack per context.
/// Every transaction leaves the engine exactly once, through the
/// [`RecordSink`] passed to the operation that closes it.
#[derive(Debug)]
pub struct TxnEngine {
    registry: LockRegistry,
    stacks: BTreeMap<ContextId, TxnStack>,
    txn_ids: IdCounter,
    skip_empty_txns: bool,
    diagnostics: Diagnostics,
    stats: EngineStats,
}

impl TxnEngine {
    pub fn new(skip_empty_txns: bool) -> Self {
        Self {
            registry: LockRegistry::new(),
            stacks: BTreeMap::new(),
            txn_ids: IdCounter::new(),
            skip_empty_txns,
            diagnostics: Diagnostics::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn registry(&self) -> &LockRegistry {
        &self.registry
    }

    pub fn lock(&self, key: LockKey) -> Option<&Lock> {
        self.registry.get(key)
    }

    pub fn stack(&self, ctx: ContextId) -> Option<&TxnStack> {
        self.stacks.get(&ctx)
    }

    /// The innermost transaction of `ctx`.
    pub fn innermost(&self, ctx: ContextId) -> Option<&Txn> {
        self.stacks.get(&ctx).and_then(|stack| stack.top())
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Returns the lock at `address`, creating it and emitting its rows if
    /// there is none yet.
    pub fn acquire_or_create<S: RecordSink>(
        &mut self,
        address: u64,
        label: &str,
        flags: u32,
        place: impl FnOnce(u64) -> LockPlacement,
        sink: &mut S,
    ) -> Result<LockKey, FatalError> {
        let (key, created) = self.registry.acquire_or_create(address, label, place)?;

        if created && let Some(lock) = self.registry.get_mut(key) {
            lock.update_flags(flags);
            for (side, id) in lock.variant().sub_locks() {
                sink.lock(LockRecord {
                    id,
                    address: lock.address(),
                    allocation: lock.allocation(),
                    label: lock.label().to_string(),
                    side,
                    var_name: lock.var_name().map(str::to_string),
                    flags: lock.flags(),
                })?;
            }
        }

        Ok(key)
    }

    /// Applies one lock operation to the lock `key`.
    pub fn transition<S: RecordSink>(
        &mut self,
        key: LockKey,
        t: &Transition<'_>,
        sink: &mut S,
    ) -> Result<(), FatalError> {
        let Some(lock) = self.registry.get_mut(key) else {
            return Ok(());
        };
        lock.update_flags(t.flags);

        let side = t.op.side();
        if !lock.kind().supports(side) {
            let lock = lock.describe(side);
            report!(
                self.diagnostics,
                Inconsistency::UnsupportedSide {
                    lock,
                    op: t.op,
                    ts: t.ts,
                    ctx: t.ctx,
                }
            );
            return Ok(());
        }

        if t.op.is_acquire() {
            self.acquire(key, side, t, sink)
        } else {
            self.release(key, side, t, sink)
        }
    }

    fn acquire<S: RecordSink>(
        &mut self,
        key: LockKey,
        side: SubLock,
        t: &Transition<'_>,
        sink: &mut S,
    ) -> Result<(), FatalError> {
        let Some(lock) = self.registry.get(key) else {
            return Ok(());
        };
        let desc = lock.describe(side);

        match lock.acquire_state(side) {
            AcquireState::Free | AcquireState::SharedReaders => {}
            AcquireState::Contradictory => {
                return Err(FatalError::ContradictoryState {
                    lock: desc,
                    op: t.op,
                    ts: t.ts,
                    readers: lock.reader_count(),
                    writers: lock.writer_count(),
                });
            }
            AcquireState::OtherSideHeld => {
                report!(
                    self.diagnostics,
                    Inconsistency::OtherSideHeld {
                        lock: desc.clone(),
                        op: t.op,
                        ts: t.ts,
                        ctx: t.ctx,
                    }
                );

                let other = side.other();
                if !self.force_close(key, other, t.ctx, t.ts, true, sink)? {
                    report!(
                        self.diagnostics,
                        Inconsistency::FlushFailed {
                            lock: desc.clone(),
                            op: t.op,
                            ts: t.ts,
                            ctx: t.ctx,
                        }
                    );
                }

                // Holders of the other side may live in further contexts.
                while self.locate_txn(key, other, t.ctx).is_some() {
                    if !self.force_close(key, other, t.ctx, t.ts, true, sink)? {
                        break;
                    }
                }

                // Without the drain the next acquisition would find both
                // sides held.
                if let Some(lock) = self.registry.get_mut(key) {
                    let residual = lock.drain(other);
                    if residual != 0 {
                        report!(
                            self.diagnostics,
                            Inconsistency::InconsistentCount {
                                lock: lock.describe(other),
                                ts: t.ts,
                                residual,
                            }
                        );
                    }
                }
            }
            AcquireState::WriterHeld if lock.is_recursive() => {
                trace!("{desc}: recursive {} in ctx {}", t.op, t.ctx);
            }
            AcquireState::WriterHeld => {
                report!(
                    self.diagnostics,
                    Inconsistency::AlreadyHeld {
                        lock: desc,
                        op: t.op,
                        ts: t.ts,
                        ctx: t.ctx,
                    }
                );

                // The matching V() was probably missed.
                if self.force_close(key, side, t.ctx, t.ts, false, sink)?
                    && let Some(lock) = self.registry.get_mut(key)
                {
                    lock.pop_position();
                    lock.end_hold(side);
                }
            }
        }

        if let Some(lock) = self.registry.get_mut(key) {
            lock.begin_hold(Self::position(side, t));
            debug!("{}: {} in ctx {}", lock.describe(side), t.op, t.ctx);
        }
        self.start_txn(key, side, t.ctx, t.ts);

        Ok(())
    }

    fn release<S: RecordSink>(
        &mut self,
        key: LockKey,
        side: SubLock,
        t: &Transition<'_>,
        sink: &mut S,
    ) -> Result<(), FatalError> {
        let Some(lock) = self.registry.get(key) else {
            return Ok(());
        };
        let desc = lock.describe(side);

        if lock.history().is_empty() {
            report!(
                self.diagnostics,
                Inconsistency::EmptyHistory {
                    lock: desc.clone(),
                    op: t.op,
                    ts: t.ts,
                    ctx: t.ctx,
                }
            );
        } else {
            match self.locate_txn(key, side, t.ctx) {
                Some(owner) => {
                    if owner != t.ctx {
                        debug!(
                            "{desc}: TXN: V() no running TXN in ctx {}, stealing from {owner}",
                            t.ctx
                        );
                    }
                    if self.finish_txn(key, side, owner, t.ts, false, sink)?
                        && let Some(lock) = self.registry.get_mut(key)
                    {
                        lock.pop_position();
                    }
                }
                None => {
                    report!(
                        self.diagnostics,
                        Inconsistency::NoRunningTxn {
                            lock: desc.clone(),
                            op: t.op,
                            ts: t.ts,
                            ctx: t.ctx,
                        }
                    );
                }
            }
        }

        if let Some(lock) = self.registry.get_mut(key) {
            if lock.end_hold(side) {
                debug!("{desc}: {} in ctx {}", t.op, t.ctx);
            } else {
                report!(
                    self.diagnostics,
                    Inconsistency::AlreadyReleased {
                        lock: desc,
                        op: t.op,
                        ts: t.ts,
                        ctx: t.ctx,
                    }
                );
            }
        }

        Ok(())
    }

    /// Finishes the transaction of (`key`, `side`) wherever it lives.
    fn force_close<S: RecordSink>(
        &mut self,
        key: LockKey,
        side: SubLock,
        ctx: ContextId,
        ts: u64,
        purge_readers: bool,
        sink: &mut S,
    ) -> Result<bool, FatalError> {
        match self.locate_txn(key, side, ctx) {
            Some(owner) => self.finish_txn(key, side, owner, ts, purge_readers, sink),
            None => Ok(false),
        }
    }

    fn position(side: SubLock, t: &Transition<'_>) -> LockPos {
        LockPos {
            side,
            start: t.ts,
            file: t.site.file.clone(),
            line: t.site.line,
            function: t.site.function.clone(),
            preempt_count: t.preempt_count,
            irq_sync: t.irq_sync,
        }
    }

    /// Opens a transaction for (`key`, `side`) on top of the stack of `ctx`.
    pub fn start_txn(&mut self, key: LockKey, side: SubLock, ctx: ContextId, ts: u64) -> TxnId {
        let id = self.txn_ids.next_id();
        self.stacks
            .entry(ctx)
            .or_default()
            .push(Txn::new(id, ts, key, side));
        self.stats.opened += 1;
        trace!("TXN {id} on lock #{} opened in ctx {ctx} at ts={ts}", key.raw());

        id
    }

    /// Finds the context whose stack holds a transaction anchored at
    /// (`key`, `side`), looking at `ctx` first.
    pub fn locate_txn(&self, key: LockKey, side: SubLock, ctx: ContextId) -> Option<ContextId> {
        if self
            .stacks
            .get(&ctx)
            .is_some_and(|stack| stack.contains(key, side))
        {
            return Some(ctx);
        }

        self.stacks
            .iter()
            .find(|(_, stack)| stack.contains(key, side))
            .map(|(other, _)| *other)
    }

    /// Closes the transaction anchored at (`key`, `side`) in `ctx`.
    ///
    /// Every transaction above it is emitted and reopened with a new id
    /// starting at `ts`. With `purge_readers` every other reader-side
    /// transaction of the lock below the match is dropped as well.
    ///
    /// Returns whether a matching transaction was found.
    pub fn finish_txn<S: RecordSink>(
        &mut self,
        key: LockKey,
        side: SubLock,
        ctx: ContextId,
        ts: u64,
        purge_readers: bool,
        sink: &mut S,
    ) -> Result<bool, FatalError> {
        let Some(mut stack) = self.stacks.remove(&ctx) else {
            return Ok(false);
        };

        let mut displaced = VecDeque::new();
        let mut found = false;

        while let Some(top) = stack.top().copied() {
            if !self.skip_empty_txns || top.access_counter > 0 {
                self.emit(&top, &stack, ts, sink)?;
            } else {
                self.stats.suppressed += 1;
            }

            if top.is_anchored_at(key, side) {
                stack.pop();
                found = true;
                if purge_readers {
                    self.purge_readers(&mut stack, key, ctx, ts);
                }
                break;
            }

            if top.lock == key {
                let lock = self
                    .registry
                    .get(key)
                    .map_or_else(String::new, |lock| lock.describe(top.side));
                report!(
                    self.diagnostics,
                    Inconsistency::SideMismatch {
                        lock,
                        ts,
                        txn: top.id,
                    }
                );
            }

            stack.pop();
            let id = self.txn_ids.next_id();
            displaced.push_front(top.reopened(id, ts));
            self.stats.reopened += 1;
            trace!("TXN {} displaced in ctx {ctx}, reopened as {id}", top.id);
        }

        if !found {
            let lock = self
                .registry
                .get(key)
                .map_or_else(String::new, |lock| lock.describe(side));
            debug!("{lock},ts={ts}: TXN: V() but no matching TXN in ctx {ctx}");
        }

        for txn in displaced {
            stack.push(txn);
        }
        if !stack.is_empty() {
            self.stacks.insert(ctx, stack);
        }

        Ok(found)
    }

    fn purge_readers(&mut self, stack: &mut TxnStack, key: LockKey, ctx: ContextId, ts: u64) {
        let mut writers = Vec::new();
        stack.retain(|txn| {
            if txn.lock != key {
                true
            } else if txn.side == SubLock::Reader {
                debug!("Flushing TXN {} in ctx {ctx} at ts={ts}", txn.id);
                false
            } else {
                writers.push(txn.id);
                true
            }
        });

        for _ in writers {
            let lock = self
                .registry
                .get(key)
                .map_or_else(String::new, |lock| lock.describe(SubLock::Writer));
            report!(
                self.diagnostics,
                Inconsistency::MultipleWriterTxns { lock, ts, ctx }
            );
        }
    }

    /// Writes `txn` and the locks held while it ran.
    ///
    /// `stack` still contains `txn` on top.
    fn emit<S: RecordSink>(
        &mut self,
        txn: &Txn,
        stack: &TxnStack,
        ts: u64,
        sink: &mut S,
    ) -> Result<(), FatalError> {
        sink.txn(TxnRecord {
            id: txn.id,
            start: txn.start,
            end: ts,
        })?;
        self.stats.emitted += 1;

        let mut seen = BTreeSet::new();
        for below in stack.iter() {
            let Some(lock) = self.registry.get(below.lock) else {
                report!(
                    self.diagnostics,
                    Inconsistency::DanglingLock { ts, txn: txn.id }
                );
                continue;
            };

            if !lock.is_held() {
                report!(
                    self.diagnostics,
                    Inconsistency::LockNotHeld {
                        lock: lock.describe(below.side),
                        ts,
                        txn: txn.id,
                    }
                );
                continue;
            }

            let Some(pos) = lock.top_position() else {
                report!(
                    self.diagnostics,
                    Inconsistency::MissingPosition {
                        lock: lock.describe(below.side),
                        ts,
                        txn: txn.id,
                    }
                );
                continue;
            };

            let Some(id) = lock.id(below.side) else {
                continue;
            };
            // A sub-lock may anchor several nested transactions but is
            // recorded once per transaction.
            if !seen.insert(id) {
                continue;
            }

            sink.lock_held(LockHeldRecord {
                txn: txn.id,
                lock: id,
                start: pos.start,
                file: pos.file.clone(),
                line: pos.line,
                function: pos.function.clone(),
                preempt_count: pos.preempt_count,
                irq_sync: pos.irq_sync,
            })?;
            self.stats.held_records += 1;
        }

        Ok(())
    }

    /// Counts one memory access for the innermost transaction of `ctx`.
    pub fn count_access(&mut self, ctx: ContextId) -> Option<TxnId> {
        let txn = self.stacks.get_mut(&ctx)?.top_mut()?;
        txn.access_counter += 1;

        Some(txn.id)
    }

    /// Forgets every lock in the freed range `[base, base + size)`.
    pub fn free_range(&mut self, base: u64, size: u64, ts: u64) -> usize {
        self.registry
            .release_by_address_range(base, size, ts, &mut self.diagnostics)
    }

    /// Closes every remaining transaction as if a matching V() arrived at `ts`.
    pub fn close_all<S: RecordSink>(&mut self, ts: u64, sink: &mut S) -> Result<(), FatalError> {
        let contexts: Vec<ContextId> = self.stacks.keys().copied().collect();

        for ctx in contexts {
            while let Some(top) = self.innermost(ctx).copied() {
                info!(
                    "TXN: There are still {} TXNs active in ctx {ctx}, flushing the topmost one.",
                    self.stacks.get(&ctx).map_or(0, TxnStack::len)
                );
                self.finish_txn(top.lock, top.side, ctx, ts, false, sink)?;
            }
        }

        Ok(())
    }

    /// Returns whether every context has closed all of its transactions.
    pub fn is_idle(&self) -> bool {
        self.stacks.values().all(TxnStack::is_empty)
    }
}
