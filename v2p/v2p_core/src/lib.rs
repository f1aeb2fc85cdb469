// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Caller-context virtual-to-physical address translation.
//!
//! A [`ControlDevice`] receives [`Request`]s on the caller's thread. Requests
//! carrying [`v2p_defs::IOCTL_V2P_TRANSLATE`] as a device control are handled
//! immediately against the caller's [`AddressSpace`]: the raw input and output
//! buffers are pinned, each input address is translated into the matching
//! output slot, and the request is completed with the number of valid bytes.
//! Everything else goes through a sequential default queue that completes
//! the request without doing anything.
//!
//! The caller's address space is an explicit capability. [`LocalAddressSpace`]
//! is the running process on Linux; [`emulated::EmulatedAddressSpace`] is an
//! in-memory address space with explicit page tables.

#![warn(missing_docs)]

mod acquire;
mod classify;
mod device;
pub mod emulated;
mod error;
mod handler;
#[cfg(target_os = "linux")]
mod local;
mod pin;
mod request;
mod space;
mod translate;

#[cfg(test)]
mod test_helpers;

pub use classify::classify;
pub use classify::Route;
pub use device::ControlDevice;
pub use device::ForwardError;
pub use device::IoQueueHandler;
pub use device::PassThroughHandler;
pub use error::ContextError;
pub use error::InvalidParameter;
pub use error::PinError;
pub use error::TranslateError;
pub use handler::translate_in_caller_context;
#[cfg(target_os = "linux")]
pub use local::LocalAddressSpace;
pub use pin::PinnedBuffer;
pub use pin::PinnedMemory;
pub use request::BufferKind;
pub use request::Request;
pub use request::RequestCompletion;
pub use request::RequestContext;
pub use request::RequestParameters;
pub use request::UserBuffer;
pub use space::Access;
pub use space::AddressSpace;
pub use space::Translator;
pub use translate::translate_slots;
pub use translate::TranslationSummary;
