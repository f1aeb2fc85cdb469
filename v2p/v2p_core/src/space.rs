// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The caller's address space, as a capability passed to the handler.

use crate::error::ContextError;
use crate::error::PinError;
use crate::pin::PinnedMemory;
use crate::request::UserBuffer;
use v2p_defs::AddressWidth;

/// The access a pinned buffer is checked for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    /// The buffer is only read from.
    Read,
    /// The buffer is only written to.
    Write,
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Access::Read => "read",
            Access::Write => "write",
        })
    }
}

/// The address space of the task that issued a request.
///
/// Virtual addresses in a request only mean something relative to the task
/// that supplied them, so every operation that interprets one goes through
/// this trait rather than through the current thread's implicit context.
pub trait AddressSpace {
    /// The width of a virtual address in this address space.
    fn address_width(&self) -> AddressWidth;

    /// Checks that every byte of `range` is mapped with `access` permission
    /// and locks it resident until the returned object is dropped.
    ///
    /// `range` is never empty.
    fn pin(&self, range: UserBuffer, access: Access) -> Result<Box<dyn PinnedMemory>, PinError>;

    /// Allocates whatever per-request state is needed to look up
    /// translations.
    fn translator(&self) -> Result<Box<dyn Translator + '_>, ContextError>;
}

/// Looks up the current physical backing of virtual addresses.
pub trait Translator {
    /// Returns the physical address backing `va`, or `None` if `va` does not
    /// currently refer to valid, resident memory.
    ///
    /// The answer is a snapshot; the mapping may change as soon as this
    /// returns.
    fn translate(&mut self, va: u64) -> Option<u64>;
}
