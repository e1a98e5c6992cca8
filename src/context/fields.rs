// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Fixed-size scalar context fields. Each one is a trivial instance of
//! the two-phase protocol: sizing is alignment plus a constant, and
//! recording reads the probe token, so nothing needs to be cached
//! between the phases.

use crate::ringbuf::{align_padding, EventWriter};

use super::{
    ContextError,
    ContextField,
    ContextSet,
    ContextValue,
    ProbeContext,
    COMM_LENGTH,
};

/// CPU the event fired on.
pub struct CpuIdField;

impl ContextField for CpuIdField {
    fn name(&self) -> &str {
        "cpu_id"
    }

    fn get_size(
        &self,
        _probe: &ProbeContext,
        offset: usize) -> usize {
        align_padding(offset, 4) + 4
    }

    fn record(
        &self,
        probe: &ProbeContext,
        writer: &mut EventWriter) {
        let cpu = probe.cpu() as i32;

        writer.write(&cpu.to_ne_bytes(), 4);
    }

    fn get_value(
        &self,
        probe: &ProbeContext) -> Option<ContextValue> {
        Some(ContextValue::Signed(probe.cpu() as i64))
    }
}

/// Process id of the current task.
pub struct PidField;

impl ContextField for PidField {
    fn name(&self) -> &str {
        "pid"
    }

    fn get_size(
        &self,
        _probe: &ProbeContext,
        offset: usize) -> usize {
        align_padding(offset, 4) + 4
    }

    fn record(
        &self,
        probe: &ProbeContext,
        writer: &mut EventWriter) {
        writer.write(&probe.task().pid.to_ne_bytes(), 4);
    }

    fn get_value(
        &self,
        probe: &ProbeContext) -> Option<ContextValue> {
        Some(ContextValue::Signed(probe.task().pid as i64))
    }
}

/// Parent process id of the current task.
pub struct PpidField;

impl ContextField for PpidField {
    fn name(&self) -> &str {
        "ppid"
    }

    fn get_size(
        &self,
        _probe: &ProbeContext,
        offset: usize) -> usize {
        align_padding(offset, 4) + 4
    }

    fn record(
        &self,
        probe: &ProbeContext,
        writer: &mut EventWriter) {
        writer.write(&probe.task().ppid.to_ne_bytes(), 4);
    }

    fn get_value(
        &self,
        probe: &ProbeContext) -> Option<ContextValue> {
        Some(ContextValue::Signed(probe.task().ppid as i64))
    }
}

/// Scheduling niceness of the current task.
pub struct NiceField;

impl ContextField for NiceField {
    fn name(&self) -> &str {
        "nice"
    }

    fn get_size(
        &self,
        _probe: &ProbeContext,
        offset: usize) -> usize {
        align_padding(offset, 4) + 4
    }

    fn record(
        &self,
        probe: &ProbeContext,
        writer: &mut EventWriter) {
        writer.write(&probe.task().nice.to_ne_bytes(), 4);
    }

    fn get_value(
        &self,
        probe: &ProbeContext) -> Option<ContextValue> {
        Some(ContextValue::Signed(probe.task().nice as i64))
    }
}

/// Process id as seen from the task's own pid namespace.
pub struct VpidField;

impl ContextField for VpidField {
    fn name(&self) -> &str {
        "vpid"
    }

    fn get_size(
        &self,
        _probe: &ProbeContext,
        offset: usize) -> usize {
        align_padding(offset, 4) + 4
    }

    fn record(
        &self,
        probe: &ProbeContext,
        writer: &mut EventWriter) {
        writer.write(&probe.task().vpid.to_ne_bytes(), 4);
    }

    fn get_value(
        &self,
        probe: &ProbeContext) -> Option<ContextValue> {
        Some(ContextValue::Signed(probe.task().vpid as i64))
    }
}

/// Thread id as seen from the task's own pid namespace.
pub struct VtidField;

impl ContextField for VtidField {
    fn name(&self) -> &str {
        "vtid"
    }

    fn get_size(
        &self,
        _probe: &ProbeContext,
        offset: usize) -> usize {
        align_padding(offset, 4) + 4
    }

    fn record(
        &self,
        probe: &ProbeContext,
        writer: &mut EventWriter) {
        writer.write(&probe.task().vtid.to_ne_bytes(), 4);
    }

    fn get_value(
        &self,
        probe: &ProbeContext) -> Option<ContextValue> {
        Some(ContextValue::Signed(probe.task().vtid as i64))
    }
}

/// Real user id of the current task.
pub struct UidField;

impl ContextField for UidField {
    fn name(&self) -> &str {
        "uid"
    }

    fn get_size(
        &self,
        _probe: &ProbeContext,
        offset: usize) -> usize {
        align_padding(offset, 4) + 4
    }

    fn record(
        &self,
        probe: &ProbeContext,
        writer: &mut EventWriter) {
        writer.write(&probe.task().uid.to_ne_bytes(), 4);
    }

    fn get_value(
        &self,
        probe: &ProbeContext) -> Option<ContextValue> {
        Some(ContextValue::Unsigned(probe.task().uid as u64))
    }
}

/// Effective user id of the current task.
pub struct EuidField;

impl ContextField for EuidField {
    fn name(&self) -> &str {
        "euid"
    }

    fn get_size(
        &self,
        _probe: &ProbeContext,
        offset: usize) -> usize {
        align_padding(offset, 4) + 4
    }

    fn record(
        &self,
        probe: &ProbeContext,
        writer: &mut EventWriter) {
        writer.write(&probe.task().euid.to_ne_bytes(), 4);
    }

    fn get_value(
        &self,
        probe: &ProbeContext) -> Option<ContextValue> {
        Some(ContextValue::Unsigned(probe.task().euid as u64))
    }
}

/// Name of the current task as a fixed-length array. The snapshot read
/// is racy against the task renaming itself, which only ever yields a
/// torn name, never a torn record.
pub struct ProcnameField;

impl ContextField for ProcnameField {
    fn name(&self) -> &str {
        "procname"
    }

    fn get_size(
        &self,
        _probe: &ProbeContext,
        _offset: usize) -> usize {
        COMM_LENGTH
    }

    fn record(
        &self,
        probe: &ProbeContext,
        writer: &mut EventWriter) {
        writer.write(&probe.task().comm, 1);
    }

    fn get_value(
        &self,
        probe: &ProbeContext) -> Option<ContextValue> {
        Some(ContextValue::Text(probe.task().comm_str().into()))
    }
}

/// Whether interrupts were enabled at the probe site, -1 when unknown.
pub struct InterruptibleField;

impl ContextField for InterruptibleField {
    fn name(&self) -> &str {
        "interruptible"
    }

    fn get_size(
        &self,
        _probe: &ProbeContext,
        _offset: usize) -> usize {
        1
    }

    fn record(
        &self,
        probe: &ProbeContext,
        writer: &mut EventWriter) {
        writer.write(&probe.interruptible().to_ne_bytes(), 1);
    }

    fn get_value(
        &self,
        probe: &ProbeContext) -> Option<ContextValue> {
        Some(ContextValue::Signed(probe.interruptible() as i64))
    }
}

/// Mount namespace inode of the current task. A task whose namespace
/// proxy is transiently unavailable records 0 rather than failing the
/// event.
pub struct MntNsField;

impl ContextField for MntNsField {
    fn name(&self) -> &str {
        "mnt_ns"
    }

    fn get_size(
        &self,
        _probe: &ProbeContext,
        offset: usize) -> usize {
        align_padding(offset, 4) + 4
    }

    fn record(
        &self,
        probe: &ProbeContext,
        writer: &mut EventWriter) {
        let inum = probe.task().mnt_ns.unwrap_or(0);

        writer.write(&inum.to_ne_bytes(), 4);
    }

    fn get_value(
        &self,
        probe: &ProbeContext) -> Option<ContextValue> {
        let inum = probe.task().mnt_ns.unwrap_or(0);

        Some(ContextValue::Unsigned(inum as u64))
    }
}

/// Time namespace inode of the current task, recording 0 when the
/// namespace proxy is transiently unavailable.
pub struct TimeNsField;

impl ContextField for TimeNsField {
    fn name(&self) -> &str {
        "time_ns"
    }

    fn get_size(
        &self,
        _probe: &ProbeContext,
        offset: usize) -> usize {
        align_padding(offset, 4) + 4
    }

    fn record(
        &self,
        probe: &ProbeContext,
        writer: &mut EventWriter) {
        let inum = probe.task().time_ns.unwrap_or(0);

        writer.write(&inum.to_ne_bytes(), 4);
    }

    fn get_value(
        &self,
        probe: &ProbeContext) -> Option<ContextValue> {
        let inum = probe.task().time_ns.unwrap_or(0);

        Some(ContextValue::Unsigned(inum as u64))
    }
}

pub fn add_cpu_id_to_ctx(
    set: &mut ContextSet) -> Result<(), ContextError> {
    set.add_field(Box::new(CpuIdField))
}

pub fn add_pid_to_ctx(
    set: &mut ContextSet) -> Result<(), ContextError> {
    set.add_field(Box::new(PidField))
}

pub fn add_ppid_to_ctx(
    set: &mut ContextSet) -> Result<(), ContextError> {
    set.add_field(Box::new(PpidField))
}

pub fn add_vpid_to_ctx(
    set: &mut ContextSet) -> Result<(), ContextError> {
    set.add_field(Box::new(VpidField))
}

pub fn add_vtid_to_ctx(
    set: &mut ContextSet) -> Result<(), ContextError> {
    set.add_field(Box::new(VtidField))
}

pub fn add_uid_to_ctx(
    set: &mut ContextSet) -> Result<(), ContextError> {
    set.add_field(Box::new(UidField))
}

pub fn add_nice_to_ctx(
    set: &mut ContextSet) -> Result<(), ContextError> {
    set.add_field(Box::new(NiceField))
}

pub fn add_euid_to_ctx(
    set: &mut ContextSet) -> Result<(), ContextError> {
    set.add_field(Box::new(EuidField))
}

pub fn add_procname_to_ctx(
    set: &mut ContextSet) -> Result<(), ContextError> {
    set.add_field(Box::new(ProcnameField))
}

pub fn add_interruptible_to_ctx(
    set: &mut ContextSet) -> Result<(), ContextError> {
    set.add_field(Box::new(InterruptibleField))
}

pub fn add_mnt_ns_to_ctx(
    set: &mut ContextSet) -> Result<(), ContextError> {
    set.add_field(Box::new(MntNsField))
}

pub fn add_time_ns_to_ctx(
    set: &mut ContextSet) -> Result<(), ContextError> {
    set.add_field(Box::new(TimeNsField))
}
