// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pinned views of caller buffers.

use crate::space::Access;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use v2p_defs::AddressWidth;
use v2p_defs::OUTPUT_ELEMENT_SIZE;

/// Memory locked by an [`AddressSpace`](crate::AddressSpace).
///
/// The lock is held for as long as the object lives and is released when it
/// is dropped.
pub trait PinnedMemory: Send {
    /// The locked bytes, exactly as long as the pinned range.
    fn as_atomic_slice(&self) -> &[AtomicU8];
}

/// A caller buffer that has been access-checked and locked for the lifetime
/// of a request.
///
/// The translation engine only ever touches caller memory through this view.
pub struct PinnedBuffer {
    mem: Option<Box<dyn PinnedMemory>>,
    access: Access,
}

impl std::fmt::Debug for PinnedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedBuffer")
            .field("len", &self.len())
            .field("access", &self.access)
            .finish()
    }
}

impl PinnedBuffer {
    /// Wraps memory locked for `access`.
    pub fn new(mem: Box<dyn PinnedMemory>, access: Access) -> Self {
        Self {
            mem: Some(mem),
            access,
        }
    }

    /// Returns a zero-length buffer that locks nothing.
    pub fn empty(access: Access) -> Self {
        Self { mem: None, access }
    }

    /// The access the buffer was checked for.
    pub fn access(&self) -> Access {
        self.access
    }

    /// The pinned length in bytes.
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    /// Returns true if the buffer is zero length.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of whole `width`-byte elements in the buffer.
    pub fn slot_count(&self, width: usize) -> usize {
        self.len() / width
    }

    fn bytes(&self) -> &[AtomicU8] {
        match &self.mem {
            Some(mem) => mem.as_atomic_slice(),
            None => &[],
        }
    }

    /// Reads the `index`th address from a buffer pinned for read.
    ///
    /// Panics if the slot is out of range.
    pub fn read_address(&self, index: usize, width: AddressWidth) -> u64 {
        assert_eq!(self.access, Access::Read, "buffer not pinned for read");
        let size = width.size();
        let slot = &self.bytes()[index * size..][..size];
        let mut value = [0u8; 8];
        for (dest, src) in value.iter_mut().zip(slot) {
            *dest = src.load(Ordering::Relaxed);
        }
        match width {
            AddressWidth::Bits32 => {
                u32::from_ne_bytes([value[0], value[1], value[2], value[3]]).into()
            }
            AddressWidth::Bits64 => u64::from_ne_bytes(value),
        }
    }

    /// Writes `value` to the `index`th 8-byte slot of a buffer pinned for
    /// write.
    ///
    /// Panics if the slot is out of range.
    pub fn write_u64(&self, index: usize, value: u64) {
        assert_eq!(self.access, Access::Write, "buffer not pinned for write");
        let slot = &self.bytes()[index * OUTPUT_ELEMENT_SIZE..][..OUTPUT_ELEMENT_SIZE];
        for (dest, src) in slot.iter().zip(value.to_ne_bytes()) {
            dest.store(src, Ordering::Relaxed);
        }
    }

    /// Reads back an 8-byte slot regardless of access mode.
    #[cfg(test)]
    pub(crate) fn peek_u64(&self, index: usize) -> u64 {
        let slot = &self.bytes()[index * OUTPUT_ELEMENT_SIZE..][..OUTPUT_ELEMENT_SIZE];
        let mut value = [0u8; 8];
        for (dest, src) in value.iter_mut().zip(slot) {
            *dest = src.load(Ordering::Relaxed);
        }
        u64::from_ne_bytes(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct HeapPin(Box<[AtomicU8]>);

    impl PinnedMemory for HeapPin {
        fn as_atomic_slice(&self) -> &[AtomicU8] {
            &self.0
        }
    }

    fn heap(bytes: &[u8]) -> Box<dyn PinnedMemory> {
        Box::new(HeapPin(bytes.iter().map(|&b| AtomicU8::new(b)).collect()))
    }

    #[test]
    fn empty_buffer_has_no_slots() {
        let buf = PinnedBuffer::empty(Access::Read);
        assert!(buf.is_empty());
        assert_eq!(buf.slot_count(8), 0);
    }

    #[test]
    fn slot_count_ignores_partial_element() {
        let buf = PinnedBuffer::new(heap(&[0; 20]), Access::Read);
        assert_eq!(buf.slot_count(8), 2);
        assert_eq!(buf.slot_count(4), 5);
    }

    #[test]
    fn reads_native_endian_addresses() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x1234_5678_9abc_def0u64.to_ne_bytes());
        bytes.extend_from_slice(&0xfeed_f00du32.to_ne_bytes());
        let buf = PinnedBuffer::new(heap(&bytes), Access::Read);
        assert_eq!(
            buf.read_address(0, AddressWidth::Bits64),
            0x1234_5678_9abc_def0
        );
        assert_eq!(buf.read_address(2, AddressWidth::Bits32), 0xfeed_f00d);
    }

    #[test]
    fn writes_slot() {
        let buf = PinnedBuffer::new(heap(&[0; 16]), Access::Write);
        buf.write_u64(1, 0xdead_beef);
        assert_eq!(buf.peek_u64(0), 0);
        assert_eq!(buf.peek_u64(1), 0xdead_beef);
    }

    #[test]
    #[should_panic(expected = "not pinned for write")]
    fn write_requires_write_access() {
        let buf = PinnedBuffer::new(heap(&[0; 8]), Access::Read);
        buf.write_u64(0, 1);
    }
}
