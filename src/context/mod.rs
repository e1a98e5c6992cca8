// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use thiserror::Error;
use tracing::debug;

use crate::ringbuf::EventWriter;

pub mod fields;

/// Fixed length of the task name array, trailing bytes are zero.
pub const COMM_LENGTH: usize = 16;

/// `TaskSnapshot` captures the current task's attributes once per
/// event, before the size phase begins. Fields that describe the task
/// read from here instead of the live task, keeping both phases of an
/// event consistent with each other.
#[derive(Clone)]
pub struct TaskSnapshot {
    pub pid: i32,
    pub ppid: i32,
    /// Process id as seen from the task's own pid namespace.
    pub vpid: i32,
    /// Thread id as seen from the task's own pid namespace.
    pub vtid: i32,
    pub nice: i32,
    pub uid: u32,
    pub euid: u32,
    pub comm: [u8; COMM_LENGTH],
    /// Mount namespace inode. `None` when the task's namespace proxy
    /// is transiently unavailable (e.g. during task exit).
    pub mnt_ns: Option<u32>,
    /// Time namespace inode, `None` under the same conditions.
    pub time_ns: Option<u32>,
}

impl Default for TaskSnapshot {
    fn default() -> Self {
        Self {
            pid: 0,
            ppid: 0,
            vpid: 0,
            vtid: 0,
            nice: 0,
            uid: 0,
            euid: 0,
            comm: [0u8; COMM_LENGTH],
            mnt_ns: None,
            time_ns: None,
        }
    }
}

impl TaskSnapshot {
    /// Sets the task name, truncating to the fixed array length with a
    /// terminating zero.
    pub fn set_comm(
        &mut self,
        name: &str) {
        self.comm = [0u8; COMM_LENGTH];

        let bytes = name.as_bytes();
        let len = bytes.len().min(COMM_LENGTH - 1);

        self.comm[.. len].copy_from_slice(&bytes[.. len]);
    }

    /// Task name up to the first zero byte.
    pub fn comm_str(&self) -> &str {
        let len = self.comm
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(COMM_LENGTH);

        std::str::from_utf8(&self.comm[.. len]).unwrap_or("")
    }
}

/// `ProbeContext` is the execution-context token the caller supplies
/// for one event. The caller guarantees the CPU and nesting depth stay
/// stable from the first `get_size` call to the last `record` call of
/// that event; fields index per-CPU state through this token rather
/// than re-reading ambient state that could shift between phases.
pub struct ProbeContext<'a> {
    cpu: usize,
    nesting_depth: usize,
    interruptible: i8,
    task: &'a TaskSnapshot,
}

impl<'a> ProbeContext<'a> {
    /// Creates the token for one event.
    ///
    /// # Arguments
    ///
    /// * `cpu` - The CPU the event fires on.
    /// * `nesting_depth` - 1-based count of reservations in flight on
    ///   that CPU, including this event's own.
    /// * `task` - Snapshot of the current task.
    /// * `interruptible` - 1 when interrupts were enabled at the probe
    ///   site, 0 when disabled, -1 when unknown.
    pub fn new(
        cpu: usize,
        nesting_depth: usize,
        task: &'a TaskSnapshot,
        interruptible: i8) -> Self {
        Self {
            cpu,
            nesting_depth,
            interruptible,
            task,
        }
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn nesting_depth(&self) -> usize {
        self.nesting_depth
    }

    pub fn interruptible(&self) -> i8 {
        self.interruptible
    }

    pub fn task(&self) -> &TaskSnapshot {
        self.task
    }
}

/// Out-of-band field value, produced by `get_value` for consumers such
/// as filter predicates. Not on the record path.
#[derive(Clone, Debug, PartialEq)]
pub enum ContextValue {
    Signed(i64),
    Unsigned(u64),
    Text(String),
}

/// Configuration-time failures. Per-event conditions are never errors;
/// affected fields emit a documented empty or sentinel value instead.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("context field already exists: {name}")]
    AlreadyExists { name: String },

    #[error("symbol lookup failed: {symbol}")]
    ResolutionFailed { symbol: String },
}

/// The contract every piece of per-event context implements.
///
/// `get_size` and `record` form a two-phase protocol: `get_size` is
/// called exactly once per event to let the allocator reserve the
/// right number of bytes, and the paired `record` call then writes
/// exactly that many. `get_size` must not write to the buffer, but it
/// may compute the field's content and stash it in provider state for
/// `record` to replay.
pub trait ContextField {
    /// Unique name of the field within a context set.
    fn name(&self) -> &str;

    /// Returns the total bytes this field will occupy, including
    /// alignment padding relative to `offset`.
    fn get_size(
        &self,
        probe: &ProbeContext,
        offset: usize) -> usize;

    /// Writes the field into the reserved region, consuming any state
    /// cached by the paired `get_size` call.
    fn record(
        &self,
        probe: &ProbeContext,
        writer: &mut EventWriter);

    /// Recomputes the field's value independently of the record path.
    /// `None` for fields with no scalar representation.
    fn get_value(
        &self,
        _probe: &ProbeContext) -> Option<ContextValue> {
        None
    }
}

/// `ContextSet` is the ordered, append-only sequence of context fields
/// attached to one channel or event. Registration order defines the
/// on-the-wire field order, and both protocol phases walk the fields
/// in that identical order.
#[derive(Default)]
pub struct ContextSet {
    fields: Vec<Box<dyn ContextField>>,
}

impl ContextSet {
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
        }
    }

    /// Appends a field to the set.
    ///
    /// # Returns
    /// - `AlreadyExists` if a field with the same name is registered;
    ///   the set is left unchanged.
    pub fn add_field(
        &mut self,
        field: Box<dyn ContextField>) -> Result<(), ContextError> {
        if self.find(field.name()).is_some() {
            return Err(ContextError::AlreadyExists {
                name: field.name().into(),
            });
        }

        debug!("Context field added: name={}", field.name());
        self.fields.push(field);

        Ok(())
    }

    /// Looks up a registered field by name.
    pub fn find(
        &self,
        name: &str) -> Option<&dyn ContextField> {
        for field in &self.fields {
            if field.name() == name {
                return Some(field.as_ref());
            }
        }

        None
    }

    pub fn fields(&self) -> &[Box<dyn ContextField>] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Total bytes all fields will occupy for this event, walking the
    /// fields in registration order with a running offset.
    pub fn get_size(
        &self,
        probe: &ProbeContext,
        offset: usize) -> usize {
        let mut size = 0;

        for field in &self.fields {
            size += field.get_size(probe, offset + size);
        }

        size
    }

    /// Records all fields in the same registration order the size
    /// phase used.
    pub fn record(
        &self,
        probe: &ProbeContext,
        writer: &mut EventWriter) {
        for field in &self.fields {
            field.record(probe, writer);
        }
    }
}
