// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::device::ForwardError;
use crate::request::BufferKind;
use crate::space::Access;
use thiserror::Error;
use v2p_defs::NtStatus;

/// A failure to process a request. Each variant maps to the status the
/// request is completed with.
#[derive(Debug, Error)]
pub enum TranslateError {
    /// Per-request state could not be allocated.
    #[error("failed to allocate request state")]
    ResourceExhaustion(#[source] ContextError),
    /// The caller's buffer descriptors are inconsistent.
    #[error("invalid parameter")]
    InvalidParameter(#[from] InvalidParameter),
    /// A buffer could not be pinned for the access it needs.
    #[error("failed to lock {buffer} buffer for {access}")]
    LockFailure {
        /// The buffer that could not be pinned.
        buffer: BufferKind,
        /// The access it was pinned for.
        access: Access,
        /// The cause.
        #[source]
        source: PinError,
    },
    /// A standard request could not be handed to the default queue.
    #[error("failed to forward request")]
    Forward(#[source] ForwardError),
}

impl TranslateError {
    /// The status to complete the request with.
    pub fn status(&self) -> NtStatus {
        match self {
            TranslateError::ResourceExhaustion(_) => NtStatus::INSUFFICIENT_RESOURCES,
            TranslateError::InvalidParameter(_) => NtStatus::INVALID_PARAMETER,
            TranslateError::LockFailure { .. } => NtStatus::ACCESS_VIOLATION,
            TranslateError::Forward(err) => err.status(),
        }
    }
}

/// An inconsistency in the caller's buffer descriptors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidParameter {
    /// A null pointer was paired with a non-zero length.
    #[error("{buffer} buffer is null but has length {len:#x}")]
    NullWithLength {
        /// The offending buffer.
        buffer: BufferKind,
        /// Its declared length.
        len: usize,
    },
    /// A non-null pointer was paired with a zero length.
    #[error("{buffer} buffer at {address:#x} has zero length")]
    ZeroLength {
        /// The offending buffer.
        buffer: BufferKind,
        /// Its pointer.
        address: u64,
    },
    /// The input and output buffers hold different numbers of slots.
    #[error("input has {input} slots but output has {output}")]
    SlotCountMismatch {
        /// Slots in the input buffer.
        input: usize,
        /// Slots in the output buffer.
        output: usize,
    },
}

/// A failure to pin part of the caller's address space.
#[derive(Debug, Error)]
pub enum PinError {
    /// The range wraps past the end of the address space.
    #[error("range at {address:#x} with length {len:#x} overflows")]
    Overflow {
        /// Start of the range.
        address: u64,
        /// Length of the range.
        len: usize,
    },
    /// Part of the range is not mapped.
    #[error("{address:#x} is not mapped")]
    NotMapped {
        /// The first unmapped address found.
        address: u64,
    },
    /// Part of the range is mapped without the needed permission.
    #[error("{address:#x} does not allow {access} access")]
    AccessDenied {
        /// The first offending address found.
        address: u64,
        /// The access that was needed.
        access: Access,
    },
    /// Locking the range would exceed the lockable page limit.
    #[error("lock limit of {limit} pages exceeded")]
    QuotaExceeded {
        /// The limit in pages.
        limit: usize,
    },
    /// The mappings of the address space could not be read.
    #[error("failed to query mappings")]
    Query(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The system ran out of a resource needed to pin the range, such as
    /// file descriptors or memory.
    #[error("out of resources while pinning")]
    OutOfResources(#[source] std::io::Error),
    /// The operating system refused to lock the range.
    #[error("failed to lock pages")]
    Lock(#[source] std::io::Error),
}

/// A failure to set up per-request state.
#[derive(Debug, Error)]
pub enum ContextError {
    /// A pin failed for lack of system resources rather than because of the
    /// caller's range.
    #[error("out of resources while pinning")]
    PinResources(#[source] std::io::Error),
    /// The page map could not be opened.
    #[error("failed to open page map")]
    OpenPagemap(#[source] std::io::Error),
    /// No more translation contexts are available.
    #[error("no translation contexts available")]
    Exhausted,
}
