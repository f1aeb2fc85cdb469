// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-memory address space with explicit page mappings.
//!
//! [`EmulatedAddressSpace`] covers a fixed window of virtual addresses backed
//! by a heap allocation. Pages inside the window can be mapped with a
//! protection and a physical frame number, unmapped, evicted, and locked.
//! Translation results are fully deterministic, which makes it suitable for
//! testing callers of the translation engine.

use crate::error::ContextError;
use crate::error::PinError;
use crate::pin::PinnedMemory;
use crate::request::UserBuffer;
use crate::space::Access;
use crate::space::AddressSpace;
use crate::space::Translator;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use v2p_defs::AddressWidth;

/// Page size of emulated address spaces.
pub const PAGE_SIZE: usize = 4096;
const PAGE_SIZE64: u64 = PAGE_SIZE as u64;

/// The first frame number handed out to mapped pages.
pub const FIRST_PFN: u64 = 0x100;

/// Page protection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Protection {
    /// Mapped but inaccessible.
    NoAccess,
    /// Readable.
    ReadOnly,
    /// Readable and writable.
    ReadWrite,
}

impl Protection {
    fn allows(self, access: Access) -> bool {
        matches!(
            (self, access),
            (Protection::ReadOnly | Protection::ReadWrite, Access::Read)
                | (Protection::ReadWrite, Access::Write)
        )
    }
}

#[derive(Debug)]
struct Page {
    pfn: u64,
    protection: Protection,
    resident: bool,
    locks: usize,
}

#[derive(Debug, Default)]
struct State {
    /// Mapped pages, keyed by virtual page number.
    pages: BTreeMap<u64, Page>,
    next_pfn: u64,
    lock_quota: Option<usize>,
    contexts_exhausted: bool,
    pin_count: u64,
}

impl State {
    fn locked_pages(&self) -> usize {
        self.pages.values().filter(|page| page.locks > 0).count()
    }
}

struct Inner {
    base: u64,
    backing: Box<[AtomicU8]>,
    width: AddressWidth,
    state: Mutex<State>,
}

impl Inner {
    fn window(&self) -> Range<u64> {
        self.base..self.base + self.backing.len() as u64
    }

    fn offset(&self, address: u64, len: usize) -> Option<usize> {
        let end = address.checked_add(len as u64)?;
        let window = self.window();
        (address >= window.start && end <= window.end).then(|| (address - self.base) as usize)
    }

    fn pages(address: u64, len: usize) -> Range<u64> {
        let end = address.saturating_add(len as u64);
        address / PAGE_SIZE64..end.div_ceil(PAGE_SIZE64)
    }
}

/// An emulated address space.
///
/// Cloning returns another handle to the same address space.
#[derive(Clone)]
pub struct EmulatedAddressSpace {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EmulatedAddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let window = self.inner.window();
        f.debug_struct("EmulatedAddressSpace")
            .field("window", &format_args!("{:#x}-{:#x}", window.start, window.end))
            .field("width", &self.inner.width)
            .finish()
    }
}

impl EmulatedAddressSpace {
    /// Creates an address space whose window starts at `base` and spans
    /// `pages` pages, with nothing mapped and native-width addresses.
    ///
    /// Panics if `base` is not page aligned or the window wraps.
    pub fn new(base: u64, pages: usize) -> Self {
        Self::with_address_width(base, pages, AddressWidth::NATIVE)
    }

    /// Like [`Self::new`], but with addresses `width` wide, as for a 32-bit
    /// task on a 64-bit system.
    pub fn with_address_width(base: u64, pages: usize, width: AddressWidth) -> Self {
        assert_eq!(base % PAGE_SIZE64, 0, "unaligned window base");
        let len = pages * PAGE_SIZE;
        assert!(base.checked_add(len as u64).is_some(), "window wraps");
        Self {
            inner: Arc::new(Inner {
                base,
                backing: (0..len).map(|_| AtomicU8::new(0)).collect(),
                width,
                state: Mutex::new(State {
                    next_pfn: FIRST_PFN,
                    ..Default::default()
                }),
            }),
        }
    }

    /// Maps every page touching `address..address + len` with `protection`.
    /// Newly mapped pages get consecutive frame numbers and start resident;
    /// already mapped pages keep their frame and just change protection.
    ///
    /// Panics if the range leaves the window.
    pub fn map(&self, address: u64, len: usize, protection: Protection) {
        self.check_window(address, len);
        let mut state = self.inner.state.lock();
        for vpn in Inner::pages(address, len) {
            if let Some(page) = state.pages.get_mut(&vpn) {
                page.protection = protection;
                continue;
            }
            let pfn = state.next_pfn;
            state.next_pfn += 1;
            state.pages.insert(
                vpn,
                Page {
                    pfn,
                    protection,
                    resident: true,
                    locks: 0,
                },
            );
        }
    }

    /// Changes the protection of mapped pages touching the range.
    pub fn protect(&self, address: u64, len: usize, protection: Protection) {
        let mut state = self.inner.state.lock();
        for vpn in Inner::pages(address, len) {
            if let Some(page) = state.pages.get_mut(&vpn) {
                page.protection = protection;
            }
        }
    }

    /// Unmaps every page touching the range.
    ///
    /// Panics if any of them is locked.
    pub fn unmap(&self, address: u64, len: usize) {
        let mut state = self.inner.state.lock();
        for vpn in Inner::pages(address, len) {
            if let Some(page) = state.pages.remove(&vpn) {
                assert_eq!(page.locks, 0, "unmapping locked page {vpn:#x}");
            }
        }
    }

    /// Marks unlocked pages touching the range as not resident. Locked pages
    /// stay resident.
    pub fn evict(&self, address: u64, len: usize) {
        let mut state = self.inner.state.lock();
        for vpn in Inner::pages(address, len) {
            if let Some(page) = state.pages.get_mut(&vpn) {
                if page.locks == 0 {
                    page.resident = false;
                }
            }
        }
    }

    /// Limits how many distinct pages may be locked at once.
    pub fn set_lock_quota(&self, pages: Option<usize>) {
        self.inner.state.lock().lock_quota = pages;
    }

    /// Makes [`AddressSpace::translator`] fail, as if per-request state could
    /// not be allocated.
    pub fn exhaust_contexts(&self, exhausted: bool) {
        self.inner.state.lock().contexts_exhausted = exhausted;
    }

    /// The number of distinct pages currently locked.
    pub fn locked_pages(&self) -> usize {
        self.inner.state.lock().locked_pages()
    }

    /// The number of successful or failed pin operations so far.
    pub fn pin_count(&self) -> u64 {
        self.inner.state.lock().pin_count
    }

    /// The frame number mapped at `address`, if any.
    pub fn pfn(&self, address: u64) -> Option<u64> {
        let state = self.inner.state.lock();
        state
            .pages
            .get(&(address / PAGE_SIZE64))
            .map(|page| page.pfn)
    }

    /// Writes `data` at `address`, ignoring protection and mappings.
    ///
    /// Panics if the range leaves the window.
    pub fn write_bytes(&self, address: u64, data: &[u8]) {
        let offset = self.check_window(address, data.len());
        for (dest, &src) in self.inner.backing[offset..][..data.len()].iter().zip(data) {
            dest.store(src, Ordering::Relaxed);
        }
    }

    /// Reads into `data` from `address`, ignoring protection and mappings.
    ///
    /// Panics if the range leaves the window.
    pub fn read_bytes(&self, address: u64, data: &mut [u8]) {
        let offset = self.check_window(address, data.len());
        for (dest, src) in data.iter_mut().zip(&self.inner.backing[offset..]) {
            *dest = src.load(Ordering::Relaxed);
        }
    }

    /// Writes `addresses` at `address`, each encoded at this address space's
    /// address width.
    pub fn write_addresses(&self, address: u64, addresses: &[u64]) {
        let bytes: Vec<u8> = match self.inner.width {
            AddressWidth::Bits32 => addresses
                .iter()
                .flat_map(|&va| (va as u32).to_ne_bytes())
                .collect(),
            AddressWidth::Bits64 => addresses.iter().flat_map(|va| va.to_ne_bytes()).collect(),
        };
        self.write_bytes(address, &bytes);
    }

    /// Reads `count` 8-byte slots from `address`.
    pub fn read_u64s(&self, address: u64, count: usize) -> Vec<u64> {
        let mut bytes = vec![0; count * 8];
        self.read_bytes(address, &mut bytes);
        bytes
            .chunks_exact(8)
            .map(|chunk| u64::from_ne_bytes(chunk.try_into().unwrap()))
            .collect()
    }

    fn check_window(&self, address: u64, len: usize) -> usize {
        self.inner.offset(address, len).unwrap_or_else(|| {
            panic!(
                "{address:#x}+{len:#x} outside window {:?}",
                self.inner.window()
            )
        })
    }
}

struct EmulatedPin {
    inner: Arc<Inner>,
    offset: usize,
    len: usize,
    pages: Range<u64>,
}

impl PinnedMemory for EmulatedPin {
    fn as_atomic_slice(&self) -> &[AtomicU8] {
        &self.inner.backing[self.offset..][..self.len]
    }
}

impl Drop for EmulatedPin {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        for vpn in self.pages.clone() {
            // Locked pages cannot be unmapped, so this always finds the page.
            if let Some(page) = state.pages.get_mut(&vpn) {
                page.locks -= 1;
            }
        }
    }
}

impl AddressSpace for EmulatedAddressSpace {
    fn address_width(&self) -> AddressWidth {
        self.inner.width
    }

    fn pin(&self, range: UserBuffer, access: Access) -> Result<Box<dyn PinnedMemory>, PinError> {
        let mut state = self.inner.state.lock();
        state.pin_count += 1;

        let UserBuffer { address, len } = range;
        if address.checked_add(len as u64).is_none() {
            return Err(PinError::Overflow { address, len });
        }
        let pages = Inner::pages(address, len);
        for vpn in pages.clone() {
            let page_address = (vpn * PAGE_SIZE64).max(address);
            let page = state
                .pages
                .get(&vpn)
                .ok_or(PinError::NotMapped {
                    address: page_address,
                })?;
            if !page.protection.allows(access) {
                return Err(PinError::AccessDenied {
                    address: page_address,
                    access,
                });
            }
        }

        if let Some(limit) = state.lock_quota {
            let newly_locked = pages
                .clone()
                .filter(|vpn| state.pages[vpn].locks == 0)
                .count();
            if state.locked_pages() + newly_locked > limit {
                return Err(PinError::QuotaExceeded { limit });
            }
        }

        // Mapped pages are always inside the window.
        let offset = (address - self.inner.base) as usize;
        for vpn in pages.clone() {
            if let Some(page) = state.pages.get_mut(&vpn) {
                page.locks += 1;
                page.resident = true;
            }
        }

        Ok(Box::new(EmulatedPin {
            inner: self.inner.clone(),
            offset,
            len,
            pages,
        }))
    }

    fn translator(&self) -> Result<Box<dyn Translator + '_>, ContextError> {
        if self.inner.state.lock().contexts_exhausted {
            return Err(ContextError::Exhausted);
        }
        Ok(Box::new(EmulatedTranslator { inner: &self.inner }))
    }
}

struct EmulatedTranslator<'a> {
    inner: &'a Inner,
}

impl Translator for EmulatedTranslator<'_> {
    fn translate(&mut self, va: u64) -> Option<u64> {
        let state = self.inner.state.lock();
        let page = state.pages.get(&(va / PAGE_SIZE64))?;
        (page.resident && page.protection != Protection::NoAccess)
            .then(|| page.pfn * PAGE_SIZE64 + va % PAGE_SIZE64)
    }
}
