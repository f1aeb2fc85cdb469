// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The address space of the running process, on Linux.

// UNSAFETY: Calling mlock/munlock/sysconf and viewing caller memory as atomics.
#![expect(unsafe_code)]

use crate::error::ContextError;
use crate::error::PinError;
use crate::pin::PinnedMemory;
use crate::request::UserBuffer;
use crate::space::Access;
use crate::space::AddressSpace;
use crate::space::Translator;
use parking_lot::Mutex;
use procfs::process::MMPermissions;
use procfs::process::Process;
use procfs::ProcError;
use std::collections::BTreeMap;
use std::fs::File;
use std::ops::Range;
use std::os::unix::fs::FileExt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use v2p_defs::AddressWidth;
use zerocopy::IntoBytes;

const PAGEMAP_PRESENT: u64 = 1 << 63;
const PAGEMAP_PFN_MASK: u64 = 0x7f_ffff_ffff_ffff;

/// Lock counts of pages locked by this process through any
/// [`LocalAddressSpace`].
///
/// `mlock` does not nest, so a page is only locked when its count goes from
/// zero to one and unlocked when it drops back to zero. Lock state belongs to
/// the process, so there is one table shared by every instance.
static LOCKS: LockTable = LockTable {
    pages: Mutex::new(BTreeMap::new()),
};

struct LockTable {
    pages: Mutex<BTreeMap<u64, usize>>,
}

impl LockTable {
    fn lock(&self, pages: Range<u64>, page_size: u64) -> Result<(), PinError> {
        let mut counts = self.pages.lock();
        for (n, vpn) in pages.clone().enumerate() {
            let count = counts.entry(vpn).or_default();
            if *count == 0 {
                // SAFETY: mlock only changes residency; an unmapped page
                // is reported as an error.
                let r = unsafe {
                    libc::mlock(
                        (vpn * page_size) as *const libc::c_void,
                        page_size as usize,
                    )
                };
                if r < 0 {
                    let err = std::io::Error::last_os_error();
                    counts.remove(&vpn);
                    drop(counts);
                    self.unlock(pages.start..pages.start + n as u64, page_size);
                    return Err(PinError::Lock(err));
                }
            }
            *count += 1;
        }
        Ok(())
    }

    fn unlock(&self, pages: Range<u64>, page_size: u64) {
        let mut counts = self.pages.lock();
        for vpn in pages {
            let Some(count) = counts.get_mut(&vpn) else {
                continue;
            };
            *count -= 1;
            if *count == 0 {
                counts.remove(&vpn);
                // SAFETY: munlock only changes residency.
                let r = unsafe {
                    libc::munlock(
                        (vpn * page_size) as *const libc::c_void,
                        page_size as usize,
                    )
                };
                if r < 0 {
                    // The caller may have unmapped the page already.
                    tracing::warn!(
                        address = vpn * page_size,
                        error = &std::io::Error::last_os_error() as &dyn std::error::Error,
                        "failed to unlock page"
                    );
                }
            }
        }
    }
}

/// The address space of the running process.
///
/// Pinning checks `/proc/self/maps` for the needed permission on every page
/// of the range and then locks the pages with `mlock`. Translation reads
/// `/proc/self/pagemap`, which only reports frame numbers to processes with
/// `CAP_SYS_ADMIN`; without it every address translates as invalid.
///
/// Pages that this process locked through other means are unlocked when a
/// request pinning them completes.
pub struct LocalAddressSpace {
    page_size: u64,
    pfns_hidden: AtomicBool,
}

impl std::fmt::Debug for LocalAddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAddressSpace")
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl LocalAddressSpace {
    /// Returns the address space of the running process.
    ///
    /// # Safety
    ///
    /// Requests processed against this address space read and write process
    /// memory through raw addresses. The caller must ensure that every buffer
    /// named by such a request is not accessed through Rust references while
    /// the request is in flight, and that no output buffer overlaps memory
    /// that Rust code relies on.
    pub unsafe fn new() -> Self {
        // SAFETY: sysconf has no preconditions.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            page_size: page_size.try_into().unwrap_or(4096),
            pfns_hidden: AtomicBool::new(false),
        }
    }

    /// The page size of the process.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Checks that `start..end` is covered by mappings with `access`.
    fn check_mappings(&self, start: u64, end: u64, access: Access) -> Result<(), PinError> {
        let required = match access {
            Access::Read => MMPermissions::READ,
            Access::Write => MMPermissions::WRITE,
        };
        let maps = Process::myself()
            .and_then(|process| process.maps())
            .map_err(query_error)?;

        let mut cursor = start;
        for map in maps.iter() {
            let (map_start, map_end) = map.address;
            if map_end <= cursor {
                continue;
            }
            if map_start > cursor {
                break;
            }
            if !map.perms.contains(required) {
                return Err(PinError::AccessDenied {
                    address: cursor,
                    access,
                });
            }
            cursor = map_end;
            if cursor >= end {
                return Ok(());
            }
        }
        Err(PinError::NotMapped { address: cursor })
    }
}

/// Reports running out of descriptors or memory while reading the mappings
/// separately from other query failures.
fn query_error(err: ProcError) -> PinError {
    match err {
        ProcError::Io(err, _)
            if matches!(
                err.raw_os_error(),
                Some(libc::EMFILE | libc::ENFILE | libc::ENOMEM)
            ) =>
        {
            PinError::OutOfResources(err)
        }
        err => PinError::Query(err.into()),
    }
}

struct LocalPin {
    pages: Range<u64>,
    page_size: u64,
    address: usize,
    len: usize,
}

impl PinnedMemory for LocalPin {
    fn as_atomic_slice(&self) -> &[AtomicU8] {
        // SAFETY: the range was checked to be mapped with the needed access
        // and is locked until drop. `LocalAddressSpace::new`'s contract
        // guarantees nothing else holds a reference to it.
        unsafe { std::slice::from_raw_parts(self.address as *const AtomicU8, self.len) }
    }
}

impl Drop for LocalPin {
    fn drop(&mut self) {
        LOCKS.unlock(self.pages.clone(), self.page_size);
    }
}

impl AddressSpace for LocalAddressSpace {
    fn address_width(&self) -> AddressWidth {
        AddressWidth::NATIVE
    }

    fn pin(&self, range: UserBuffer, access: Access) -> Result<Box<dyn PinnedMemory>, PinError> {
        let UserBuffer { address, len } = range;
        let end = address
            .checked_add(len as u64)
            .filter(|&end| usize::try_from(end).is_ok())
            .ok_or(PinError::Overflow { address, len })?;

        let pages = address / self.page_size..end.div_ceil(self.page_size);
        self.check_mappings(
            pages.start * self.page_size,
            pages.end.saturating_mul(self.page_size),
            access,
        )?;
        LOCKS.lock(pages.clone(), self.page_size)?;

        tracing::trace!(
            address,
            len,
            %access,
            pages = pages.end - pages.start,
            "locked range"
        );
        Ok(Box::new(LocalPin {
            pages,
            page_size: self.page_size,
            address: address as usize,
            len,
        }))
    }

    fn translator(&self) -> Result<Box<dyn Translator + '_>, ContextError> {
        let pagemap = File::open("/proc/self/pagemap").map_err(ContextError::OpenPagemap)?;
        Ok(Box::new(PagemapTranslator {
            space: self,
            pagemap,
        }))
    }
}

/// The physical address of `va` within frame `pfn`, or `None` if it does not
/// fit in 64 bits.
fn frame_address(pfn: u64, va: u64, page_size: u64) -> Option<u64> {
    pfn.checked_mul(page_size)?.checked_add(va % page_size)
}

struct PagemapTranslator<'a> {
    space: &'a LocalAddressSpace,
    pagemap: File,
}

impl Translator for PagemapTranslator<'_> {
    fn translate(&mut self, va: u64) -> Option<u64> {
        let page_size = self.space.page_size;
        let offset = (va / page_size) * 8;
        let mut entry = 0u64;
        if let Err(err) = self.pagemap.read_exact_at(entry.as_mut_bytes(), offset) {
            // Addresses past the end of the user address space read as EOF.
            tracing::trace!(va, error = &err as &dyn std::error::Error, "no pagemap entry");
            return None;
        }
        if entry & PAGEMAP_PRESENT == 0 {
            return None;
        }
        let pfn = entry & PAGEMAP_PFN_MASK;
        if pfn == 0 {
            if !self.space.pfns_hidden.swap(true, Ordering::Relaxed) {
                tracing::warn!("page frame numbers are hidden; CAP_SYS_ADMIN is required");
            }
            return None;
        }
        frame_address(pfn, va, page_size)
    }
}
