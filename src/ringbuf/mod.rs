// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::ops::Range;

use crate::context::{ContextSet, ProbeContext, TaskSnapshot};

/// Maximum number of reservations that can be in flight on one CPU at
/// once: task context plus nested interrupt contexts. A reservation
/// that would exceed this bound is rejected rather than corrupting
/// the in-flight ones.
pub const MAX_NESTING: usize = 4;

/// Returns the number of padding bytes needed to bring `offset` up to
/// `alignment`, which must be a power of two.
pub fn align_padding(
    offset: usize,
    alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());

    alignment.wrapping_sub(offset) & (alignment - 1)
}

/// `EventWriter` is a cursor over a region of the buffer that was
/// previously reserved for one event. The cursor position is an
/// absolute buffer offset, so alignment padding computed against the
/// running offset during the size phase comes out identical during
/// the record phase.
pub struct EventWriter<'a> {
    data: &'a mut [u8],
    cursor: usize,
    end: usize,
}

impl<'a> EventWriter<'a> {
    /// Creates a writer over `data` with the cursor at `start` and the
    /// reserved region ending at `end`.
    pub fn new(
        data: &'a mut [u8],
        start: usize,
        end: usize) -> Self {
        Self {
            data,
            cursor: start,
            end,
        }
    }

    /// Advances the cursor to the requested alignment without writing.
    /// Needed for fields that degrade to an empty value but still must
    /// consume the padding accounted for during sizing.
    pub fn align(
        &mut self,
        alignment: usize) {
        self.cursor += align_padding(self.cursor, alignment);
    }

    /// Aligns the cursor, then copies `bytes` into the reserved region
    /// and advances past them.
    pub fn write(
        &mut self,
        bytes: &[u8],
        alignment: usize) {
        self.align(alignment);

        let end = self.cursor + bytes.len();
        debug_assert!(end <= self.end);

        self.data[self.cursor .. end].copy_from_slice(bytes);
        self.cursor = end;
    }

    /// Current absolute cursor position.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Bytes left in the reserved region.
    pub fn remaining(&self) -> usize {
        self.end - self.cursor
    }
}

/// `CpuBuffer` is the per-CPU reservation seam the context-field
/// protocol runs against: it tracks the nesting counter, hands out
/// reserved regions, and drives the two-phase size/record protocol.
///
/// The real lock-free allocator sits behind the same operations; this
/// buffer reserves linearly and never wraps. Callers own the
/// exclusivity guarantee (one buffer per CPU, no migration between
/// `emit` entry and exit).
pub struct CpuBuffer {
    data: Vec<u8>,
    head: usize,
    nesting: usize,
    lost: u64,
}

impl CpuBuffer {
    /// Creates a buffer with `capacity` bytes of event storage.
    pub fn new(
        capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            head: 0,
            nesting: 0,
            lost: 0,
        }
    }

    /// Count of reservations currently in flight on this CPU.
    pub fn nesting(&self) -> usize {
        self.nesting
    }

    /// Count of events dropped due to the nesting cap or exhausted
    /// capacity.
    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// All bytes written so far.
    pub fn data(&self) -> &[u8] {
        &self.data[.. self.head]
    }

    fn begin(&mut self) -> Option<usize> {
        if self.nesting >= MAX_NESTING {
            self.lost += 1;
            return None;
        }

        self.nesting += 1;
        Some(self.nesting)
    }

    fn end(&mut self) {
        self.nesting -= 1;
    }

    fn reserve(
        &mut self,
        size: usize) -> Option<Range<usize>> {
        let end = self.head + size;

        if end > self.data.len() {
            return None;
        }

        let start = self.head;
        self.head = end;

        Some(start .. end)
    }

    /// Emits one event's context record: sizes every field of `set` in
    /// registration order, reserves exactly that many bytes, then
    /// records every field in the same order into the reservation.
    ///
    /// The nesting counter is incremented before sizing and
    /// decremented after recording, so the depth every field observes
    /// is stable across both phases of one event.
    ///
    /// # Returns
    /// - The byte range of the record, or `None` if the event was
    ///   dropped (nesting cap reached or capacity exhausted).
    pub fn emit(
        &mut self,
        cpu: usize,
        set: &ContextSet,
        task: &TaskSnapshot,
        interruptible: i8) -> Option<Range<usize>> {
        let depth = self.begin()?;

        let probe = ProbeContext::new(
            cpu,
            depth,
            task,
            interruptible);

        let start = self.head;
        let size = set.get_size(&probe, start);

        let range = match self.reserve(size) {
            Some(range) => {
                let mut writer = EventWriter::new(
                    self.data.as_mut_slice(),
                    range.start,
                    range.end);

                set.record(&probe, &mut writer);

                /* Every field must write exactly what it sized */
                debug_assert_eq!(range.end, writer.cursor());

                Some(range)
            },
            None => {
                self.lost += 1;
                None
            },
        };

        self.end();
        range
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextField, ContextValue};

    struct MarkerField {
        name: String,
        marker: u8,
        len: usize,
    }

    impl MarkerField {
        fn new(
            name: &str,
            marker: u8,
            len: usize) -> Self {
            Self {
                name: name.into(),
                marker,
                len,
            }
        }
    }

    impl ContextField for MarkerField {
        fn name(&self) -> &str {
            &self.name
        }

        fn get_size(
            &self,
            _probe: &ProbeContext,
            offset: usize) -> usize {
            align_padding(offset, 4) + self.len
        }

        fn record(
            &self,
            _probe: &ProbeContext,
            writer: &mut EventWriter) {
            let bytes = vec![self.marker; self.len];
            writer.write(&bytes, 4);
        }

        fn get_value(
            &self,
            _probe: &ProbeContext) -> Option<ContextValue> {
            Some(ContextValue::Unsigned(self.marker as u64))
        }
    }

    #[test]
    fn padding() {
        assert_eq!(0, align_padding(0, 8));
        assert_eq!(7, align_padding(1, 8));
        assert_eq!(1, align_padding(7, 8));
        assert_eq!(0, align_padding(8, 8));
        assert_eq!(3, align_padding(13, 4));
        assert_eq!(0, align_padding(13, 1));
    }

    #[test]
    fn writer_pads_then_writes() {
        let mut data = vec![0u8; 32];
        let mut writer = EventWriter::new(&mut data, 1, 32);

        writer.write(&0xABCDu16.to_ne_bytes(), 2);
        assert_eq!(4, writer.cursor());

        writer.align(8);
        assert_eq!(8, writer.cursor());

        writer.write(&[1, 2, 3], 1);
        assert_eq!(11, writer.cursor());
        assert_eq!(21, writer.remaining());

        assert_eq!(0, data[1]);
        assert_eq!(0xABCDu16, u16::from_ne_bytes(data[2..4].try_into().unwrap()));
        assert_eq!(&[1, 2, 3], &data[8..11]);
    }

    #[test]
    fn emit_writes_exactly_sized_record() {
        let mut set = ContextSet::new();
        set.add_field(Box::new(MarkerField::new("a", 0xAA, 3))).unwrap();
        set.add_field(Box::new(MarkerField::new("b", 0xBB, 8))).unwrap();

        let task = TaskSnapshot::default();
        let mut buffer = CpuBuffer::new(256);

        let range = buffer.emit(0, &set, &task, 1).unwrap();

        /* a: 3 bytes at 0, b: 1 pad then 8 bytes */
        assert_eq!(0 .. 12, range);
        assert_eq!(0, buffer.nesting());

        let data = buffer.data();
        assert_eq!(&[0xAA, 0xAA, 0xAA], &data[0..3]);
        assert_eq!(&[0xBB; 8], &data[4..12]);
    }

    #[test]
    fn emit_preserves_registration_order_across_events() {
        let mut set = ContextSet::new();
        set.add_field(Box::new(MarkerField::new("a", 0xAA, 4))).unwrap();
        set.add_field(Box::new(MarkerField::new("b", 0xBB, 4))).unwrap();
        set.add_field(Box::new(MarkerField::new("c", 0xCC, 4))).unwrap();

        let task = TaskSnapshot::default();
        let mut buffer = CpuBuffer::new(256);

        for _ in 0..3 {
            let range = buffer.emit(0, &set, &task, 1).unwrap();
            let record = &buffer.data()[range.start .. range.end];

            assert_eq!(&[0xAA; 4], &record[0..4]);
            assert_eq!(&[0xBB; 4], &record[4..8]);
            assert_eq!(&[0xCC; 4], &record[8..12]);
        }
    }

    #[test]
    fn emit_rejects_beyond_nesting_cap() {
        let mut set = ContextSet::new();
        set.add_field(Box::new(MarkerField::new("a", 0xAA, 4))).unwrap();

        let task = TaskSnapshot::default();
        let mut buffer = CpuBuffer::new(256);

        /* Simulate a CPU with the maximum reservations in flight */
        buffer.nesting = MAX_NESTING;

        assert!(buffer.emit(0, &set, &task, 1).is_none());
        assert_eq!(1, buffer.lost());
        assert_eq!(MAX_NESTING, buffer.nesting());
    }

    #[test]
    fn emit_rejects_when_capacity_exhausted() {
        let mut set = ContextSet::new();
        set.add_field(Box::new(MarkerField::new("a", 0xAA, 16))).unwrap();

        let task = TaskSnapshot::default();
        let mut buffer = CpuBuffer::new(24);

        assert!(buffer.emit(0, &set, &task, 1).is_some());
        assert!(buffer.emit(0, &set, &task, 1).is_none());

        assert_eq!(1, buffer.lost());
        assert_eq!(0, buffer.nesting());
    }
}
