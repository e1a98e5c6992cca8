// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Bounded callstack capture as a context field.
//!
//! The callstack is the one field whose length is unknown until it is
//! computed, so sizing does the real capture into a per-CPU arena slot
//! and recording replays the cached entries verbatim. The capture must
//! happen exactly once per event: the user-mode capture primitive can
//! itself re-enter instrumented code, and the recursion guard that
//! suppresses the resulting self-capture only brackets the sizing
//! phase.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::context::{
    ContextError,
    ContextField,
    ContextSet,
    ProbeContext,
};
use crate::ringbuf::{align_padding, EventWriter, MAX_NESTING};
use crate::symbols::SymbolResolver;

/// Hard bound on captured stack entries. A deeper stack is truncated
/// and flagged with a delimiter rather than growing the record without
/// bound inside an allocator that reserves space up front.
pub const MAX_ENTRIES: usize = 128;

/// Sentinel appended after a truncated stack so downstream readers can
/// tell "deep stack, truncated" from "shallow stack, complete".
pub const STACK_DELIMITER: u64 = u64::MAX;

/// Which stack the field captures. Configured per provider at
/// registration; each mode binds to its own host capture primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallstackMode {
    Kernel,
    User,
}

impl CallstackMode {
    /// Host symbol the capture primitive is bound from.
    pub fn symbol(&self) -> &'static str {
        match self {
            CallstackMode::Kernel => "stack_trace_save",
            CallstackMode::User => "stack_trace_save_user",
        }
    }

    /// Context field name for this mode.
    pub fn field_name(&self) -> &'static str {
        match self {
            CallstackMode::Kernel => "callstack_kernel",
            CallstackMode::User => "callstack_user",
        }
    }
}

/// The host capture primitives, bound at configuration time via the
/// symbol resolver. Both return the number of entries stored, never
/// more than the buffer holds.
pub trait StackWalker {
    fn capture_kernel(
        &self,
        entries: &mut [u64],
        skip: usize) -> usize;

    fn capture_user(
        &self,
        entries: &mut [u64]) -> usize;
}

/// One captured stack. Entries beyond `nr_entries` are stale from
/// earlier events at the same nesting depth and are never read.
pub struct StackTrace {
    entries: [u64; MAX_ENTRIES],
    nr_entries: usize,
}

impl Default for StackTrace {
    fn default() -> Self {
        Self {
            entries: [0u64; MAX_ENTRIES],
            nr_entries: 0,
        }
    }
}

/// Per-CPU arena: one scratch trace per nesting depth, so each
/// concurrently-active reservation on a CPU owns a private slot.
struct CallstackArena {
    slots: Vec<RefCell<StackTrace>>,
}

impl CallstackArena {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_NESTING);

        for _ in 0 .. MAX_NESTING {
            slots.push(RefCell::new(StackTrace::default()));
        }

        Self {
            slots,
        }
    }
}

/// Callstack context field. Owns the per-CPU arenas and, for user
/// mode, the per-CPU recursion guard counters.
pub struct CallstackField {
    mode: CallstackMode,
    address: u64,
    walker: Rc<dyn StackWalker>,
    arenas: Vec<CallstackArena>,
    user_nesting: Vec<Cell<u32>>,
}

impl CallstackField {
    /// Creates the field, binding the capture primitive for `mode`.
    ///
    /// # Returns
    /// - `ResolutionFailed` when the host symbol is absent; the field
    ///   cannot be configured and nothing is registered.
    pub fn new(
        mode: CallstackMode,
        cpu_count: usize,
        resolver: &SymbolResolver,
        walker: Rc<dyn StackWalker>) -> Result<Self, ContextError> {
        let symbol = mode.symbol();

        let address = match resolver.resolve(symbol) {
            Some(address) => address,
            None => {
                return Err(ContextError::ResolutionFailed {
                    symbol: symbol.into(),
                });
            },
        };

        let mut arenas = Vec::with_capacity(cpu_count);
        let mut user_nesting = Vec::with_capacity(cpu_count);

        for _ in 0 .. cpu_count {
            arenas.push(CallstackArena::new());
            user_nesting.push(Cell::new(0));
        }

        Ok(Self {
            mode,
            address,
            walker,
            arenas,
            user_nesting,
        })
    }

    /// Resolved address of the bound capture primitive.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Locates the arena slot for the event's CPU and nesting depth.
    ///
    /// Returns `None` when no trace should be gathered: the nesting
    /// depth is at or beyond the cap, or the event fired from inside
    /// the user-mode capture primitive itself. Both phases of one
    /// event make the same decision because depth and guard state are
    /// stable between them.
    fn trace_slot(
        &self,
        probe: &ProbeContext) -> Option<&RefCell<StackTrace>> {
        if self.mode == CallstackMode::User &&
           self.user_nesting.get(probe.cpu())?.get() >= 1 {
            return None;
        }

        let arena = self.arenas.get(probe.cpu())?;
        let depth = probe.nesting_depth().checked_sub(1)?;

        arena.slots.get(depth)
    }

    fn capture(
        &self,
        probe: &ProbeContext,
        trace: &mut StackTrace) {
        /* Reset the count only, stale entries are never read */
        trace.nr_entries = 0;

        match self.mode {
            CallstackMode::Kernel => {
                trace.nr_entries = self.walker.capture_kernel(
                    &mut trace.entries,
                    0);
            },
            CallstackMode::User => {
                let guard = &self.user_nesting[probe.cpu()];

                /*
                 * The guard brackets exactly the primitive's
                 * execution: events it triggers on this CPU see the
                 * raised count and skip their own capture.
                 */
                guard.set(guard.get() + 1);
                trace.nr_entries = self.walker.capture_user(
                    &mut trace.entries);
                guard.set(guard.get() - 1);
            },
        }

        if trace.nr_entries > MAX_ENTRIES {
            trace.nr_entries = MAX_ENTRIES;
        }
    }
}

impl ContextField for CallstackField {
    fn name(&self) -> &str {
        self.mode.field_name()
    }

    fn get_size(
        &self,
        probe: &ProbeContext,
        offset: usize) -> usize {
        let mut size = 0;

        /* Sequence length header */
        size += align_padding(offset, 4) + 4;

        let seq_offset = offset + size;

        match self.trace_slot(probe) {
            Some(slot) => {
                let mut trace = slot.borrow_mut();

                /* The real capture happens here, record replays it */
                self.capture(probe, &mut trace);

                size += align_padding(seq_offset, 8);
                size += 8 * trace.nr_entries;

                /* A full trace carries one extra delimiter entry */
                if trace.nr_entries == MAX_ENTRIES {
                    size += 8;
                }
            },
            None => {
                /* No trace available, aligned empty sequence */
                size += align_padding(seq_offset, 8);
            },
        }

        size
    }

    fn record(
        &self,
        probe: &ProbeContext,
        writer: &mut EventWriter) {
        match self.trace_slot(probe) {
            Some(slot) => {
                let trace = slot.borrow();
                let mut nr_seq_entries = trace.nr_entries as u32;

                if trace.nr_entries == MAX_ENTRIES {
                    nr_seq_entries += 1;
                }

                writer.write(&nr_seq_entries.to_ne_bytes(), 4);
                writer.align(8);

                for entry in &trace.entries[.. trace.nr_entries] {
                    writer.write(&entry.to_ne_bytes(), 1);
                }

                /* Delimiter marks an incomplete stack */
                if trace.nr_entries == MAX_ENTRIES {
                    writer.write(&STACK_DELIMITER.to_ne_bytes(), 1);
                }
            },
            None => {
                /* Align even with no entries to match the sizing */
                writer.write(&0u32.to_ne_bytes(), 4);
                writer.align(8);
            },
        }
    }
}

/// Adds a callstack field for `mode` to the context set.
pub fn add_callstack_to_ctx(
    set: &mut ContextSet,
    mode: CallstackMode,
    cpu_count: usize,
    resolver: &SymbolResolver,
    walker: Rc<dyn StackWalker>) -> Result<(), ContextError> {
    if set.find(mode.field_name()).is_some() {
        return Err(ContextError::AlreadyExists {
            name: mode.field_name().into(),
        });
    }

    let field = CallstackField::new(
        mode,
        cpu_count,
        resolver,
        walker)?;

    set.add_field(Box::new(field))
}
