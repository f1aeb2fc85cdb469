// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Requests, their per-request resources, and completion.

use crate::error::TranslateError;
use crate::pin::PinnedBuffer;
use v2p_defs::NtStatus;
use v2p_defs::RequestType;

/// An untrusted pointer/length pair supplied by the caller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UserBuffer {
    /// The virtual address of the buffer in the caller's address space.
    pub address: u64,
    /// The declared length in bytes.
    pub len: usize,
}

impl UserBuffer {
    /// A null buffer.
    pub const NULL: Self = Self { address: 0, len: 0 };

    /// Creates a buffer descriptor.
    pub fn new(address: u64, len: usize) -> Self {
        Self { address, len }
    }

    /// Describes a slice in this process.
    ///
    /// The descriptor carries no lifetime; it is up to the caller to keep the
    /// slice alive and untouched until the request completes.
    pub fn from_slice<T>(data: &[T]) -> Self {
        if data.is_empty() {
            return Self::NULL;
        }
        Self {
            address: data.as_ptr() as u64,
            len: size_of_val(data),
        }
    }

    /// Describes a mutable slice in this process. See [`Self::from_slice`].
    pub fn from_mut_slice<T>(data: &mut [T]) -> Self {
        Self::from_slice(data)
    }

    /// Returns true if the pointer is null.
    pub fn is_null(&self) -> bool {
        self.address == 0
    }
}

/// Which of a request's two buffers something refers to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferKind {
    /// The buffer of virtual addresses.
    Input,
    /// The buffer of physical address slots.
    Output,
}

impl std::fmt::Display for BufferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            BufferKind::Input => "input",
            BufferKind::Output => "output",
        })
    }
}

/// The parameters of a request as delivered by the caller.
#[derive(Debug, Copy, Clone)]
pub struct RequestParameters {
    /// The kind of request.
    pub request_type: RequestType,
    /// The control code, for device control requests.
    pub ioctl_code: u32,
    /// The raw input buffer.
    pub input: UserBuffer,
    /// The raw output buffer.
    pub output: UserBuffer,
}

impl RequestParameters {
    /// Parameters for a device control request.
    pub fn device_control(ioctl_code: u32, input: UserBuffer, output: UserBuffer) -> Self {
        Self {
            request_type: RequestType::DeviceControl,
            ioctl_code,
            input,
            output,
        }
    }
}

/// Receives the final status of a request.
pub trait RequestCompletion: Send {
    /// Reports `status` and the completed byte count `information`.
    fn complete(self: Box<Self>, status: NtStatus, information: u64);
}

impl<F: FnOnce(NtStatus, u64) + Send> RequestCompletion for F {
    fn complete(self: Box<Self>, status: NtStatus, information: u64) {
        (*self)(status, information)
    }
}

/// Resources owned by a request, released when the request completes.
#[derive(Debug, Default)]
pub struct RequestContext {
    /// The pinned input buffer, once acquired.
    pub input: Option<PinnedBuffer>,
    /// The pinned output buffer, once acquired.
    pub output: Option<PinnedBuffer>,
}

impl RequestContext {
    /// Returns true if no buffers are held.
    pub fn is_empty(&self) -> bool {
        self.input.is_none() && self.output.is_none()
    }
}

/// An in-flight request.
///
/// The completion handle fires exactly once: when [`Request::complete`] is
/// called, or with [`NtStatus::CANCELLED`] if the request is dropped without
/// being completed. The request's pinned buffers are released before the
/// handle is invoked.
pub struct Request {
    params: RequestParameters,
    context: RequestContext,
    completion: Option<Box<dyn RequestCompletion>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("params", &self.params)
            .field("context", &self.context)
            .finish()
    }
}

impl Request {
    /// Creates a request that reports its result to `completion`.
    pub fn new(params: RequestParameters, completion: impl 'static + RequestCompletion) -> Self {
        Self {
            params,
            context: RequestContext::default(),
            completion: Some(Box::new(completion)),
        }
    }

    /// The parameters the caller supplied.
    pub fn parameters(&self) -> &RequestParameters {
        &self.params
    }

    /// The resources held by the request.
    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Mutable access to the resources held by the request.
    pub fn context_mut(&mut self) -> &mut RequestContext {
        &mut self.context
    }

    /// Completes the request with the outcome of processing it. On success,
    /// `result` holds the completed byte count.
    pub fn complete(self, result: Result<u64, TranslateError>) {
        match result {
            Ok(information) => self.complete_with_information(NtStatus::SUCCESS, information),
            Err(err) => {
                let status = err.status();
                tracing::debug!(
                    ioctl_code = self.params.ioctl_code,
                    %status,
                    error = &err as &dyn std::error::Error,
                    "request failed"
                );
                self.complete_with_information(status, 0)
            }
        }
    }

    /// Completes the request with an explicit status and byte count.
    pub fn complete_with_information(mut self, status: NtStatus, information: u64) {
        self.finish(status, information);
    }

    fn finish(&mut self, status: NtStatus, information: u64) {
        // Release before reporting, so completion is never observed with
        // buffers still locked.
        self.context = RequestContext::default();
        if let Some(completion) = self.completion.take() {
            completion.complete(status, information);
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if self.completion.is_some() {
            tracing::warn!(
                ioctl_code = self.params.ioctl_code,
                "request dropped without completion"
            );
            self.finish(NtStatus::CANCELLED, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::completion;

    #[test]
    fn user_buffer_from_slice() {
        let data = [1u64, 2, 3];
        let buf = UserBuffer::from_slice(&data);
        assert_eq!(buf.address, data.as_ptr() as u64);
        assert_eq!(buf.len, 24);
        assert_eq!(UserBuffer::from_slice::<u64>(&[]), UserBuffer::NULL);
    }

    #[test]
    fn completes_once() {
        let (result, done) = completion();
        let req = Request::new(
            RequestParameters::device_control(0, UserBuffer::NULL, UserBuffer::NULL),
            done,
        );
        req.complete(Ok(16));
        assert_eq!(result.take(), Some((NtStatus::SUCCESS, 16)));
        assert_eq!(result.count(), 1);
    }

    #[test]
    fn failure_reports_no_information() {
        let (result, done) = completion();
        let req = Request::new(
            RequestParameters::device_control(0, UserBuffer::NULL, UserBuffer::NULL),
            done,
        );
        req.complete(Err(TranslateError::InvalidParameter(
            crate::InvalidParameter::SlotCountMismatch {
                input: 4,
                output: 3,
            },
        )));
        assert_eq!(result.take(), Some((NtStatus::INVALID_PARAMETER, 0)));
    }

    #[test]
    fn pins_released_before_completion() {
        use crate::acquire::pin_buffers;
        use crate::emulated::EmulatedAddressSpace;
        use crate::emulated::Protection;
        use crate::emulated::PAGE_SIZE;
        use crate::space::Access;
        use parking_lot::Mutex;
        use std::sync::Arc;

        const BASE: u64 = 0x10_0000;
        let space = EmulatedAddressSpace::new(BASE, 2);
        space.map(BASE, 2 * PAGE_SIZE, Protection::ReadWrite);

        let observed = Arc::new(Mutex::new(None));
        let mut req = Request::new(
            RequestParameters::device_control(
                v2p_defs::IOCTL_V2P_TRANSLATE,
                UserBuffer::new(BASE, 8),
                UserBuffer::new(BASE + PAGE_SIZE as u64, 8),
            ),
            {
                let space = space.clone();
                let observed = observed.clone();
                move |status: NtStatus, _information: u64| {
                    *observed.lock() = Some((status, space.locked_pages()));
                }
            },
        );
        assert!(req.context().is_empty());

        let params = *req.parameters();
        let (input, output) = pin_buffers(&space, &params, req.context_mut()).unwrap();
        assert_eq!(input.access(), Access::Read);
        assert_eq!(output.access(), Access::Write);
        assert!(!req.context().is_empty());
        assert_eq!(space.locked_pages(), 2);

        req.complete(Ok(8));
        assert_eq!(*observed.lock(), Some((NtStatus::SUCCESS, 0)));
    }

    #[test]
    fn drop_cancels() {
        let (result, done) = completion();
        drop(Request::new(
            RequestParameters::device_control(0, UserBuffer::NULL, UserBuffer::NULL),
            done,
        ));
        assert_eq!(result.take(), Some((NtStatus::CANCELLED, 0)));
        assert_eq!(result.count(), 1);
    }
}
