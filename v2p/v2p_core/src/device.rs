// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The control device: routes requests between the caller-context path and
//! the sequential default queue.

use crate::classify::classify;
use crate::classify::Route;
use crate::error::TranslateError;
use crate::handler::translate_in_caller_context;
use crate::request::Request;
use crate::space::AddressSpace;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use thiserror::Error;
use v2p_defs::NtStatus;

/// Handles requests taken off the default queue.
///
/// Requests are delivered one at a time, each completed before the next is
/// handed over.
pub trait IoQueueHandler: Send + Sync {
    /// Processes and completes `request`.
    fn handle(&self, request: Request);
}

/// The default queue handler: completes every request successfully without
/// doing anything.
#[derive(Debug, Default)]
pub struct PassThroughHandler;

impl IoQueueHandler for PassThroughHandler {
    fn handle(&self, request: Request) {
        request.complete_with_information(NtStatus::SUCCESS, 0);
    }
}

/// A failure to hand a request to the default queue.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The queue has been stopped.
    #[error("default queue is not accepting requests")]
    QueueStopped,
}

impl ForwardError {
    /// The status to complete the request with.
    pub fn status(&self) -> NtStatus {
        match self {
            ForwardError::QueueStopped => NtStatus::INVALID_DEVICE_STATE,
        }
    }
}

struct SequentialQueue {
    handler: Box<dyn IoQueueHandler>,
    dispatch: Mutex<()>,
    accepting: AtomicBool,
}

impl SequentialQueue {
    fn enqueue(&self, request: Request) -> Result<(), (Request, ForwardError)> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err((request, ForwardError::QueueStopped));
        }
        let _dispatch = self.dispatch.lock();
        self.handler.handle(request);
        Ok(())
    }
}

/// The device endpoint that callers submit requests to.
pub struct ControlDevice {
    default_queue: SequentialQueue,
}

impl Default for ControlDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlDevice {
    /// Creates a device whose default queue completes standard requests
    /// without effect.
    pub fn new() -> Self {
        Self::with_default_handler(PassThroughHandler)
    }

    /// Creates a device with a custom default queue handler.
    pub fn with_default_handler(handler: impl 'static + IoQueueHandler) -> Self {
        Self {
            default_queue: SequentialQueue {
                handler: Box::new(handler),
                dispatch: Mutex::new(()),
                accepting: AtomicBool::new(true),
            },
        }
    }

    /// Stops the default queue. Standard requests submitted afterwards fail
    /// with [`NtStatus::INVALID_DEVICE_STATE`]; privileged requests are not
    /// affected.
    pub fn stop_default_queue(&self) {
        self.default_queue.accepting.store(false, Ordering::Release);
    }

    /// Resumes a stopped default queue.
    pub fn start_default_queue(&self) {
        self.default_queue.accepting.store(true, Ordering::Release);
    }

    /// Entry point for every request, called on the submitting thread with
    /// the submitter's address space.
    ///
    /// Privileged requests are processed and completed before this returns.
    /// Standard requests are forwarded to the default queue.
    pub fn io_in_caller_context(&self, caller: &dyn AddressSpace, request: Request) {
        let params = request.parameters();
        let route = classify(params);
        tracing::trace!(
            request_type = ?params.request_type,
            ioctl_code = params.ioctl_code,
            ?route,
            "dispatching request"
        );
        match route {
            Route::Privileged => translate_in_caller_context(caller, request),
            Route::Standard => {
                if let Err((request, err)) = self.default_queue.enqueue(request) {
                    request.complete(Err(TranslateError::Forward(err)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::EmulatedAddressSpace;
    use crate::request::RequestParameters;
    use crate::request::UserBuffer;
    use crate::test_helpers::completion;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use v2p_defs::RequestType;
    use v2p_defs::IOCTL_V2P_TRANSLATE;

    fn space() -> EmulatedAddressSpace {
        EmulatedAddressSpace::new(0x10_0000, 4)
    }

    #[test]
    fn standard_request_succeeds_without_effect() {
        let space = space();
        space.map(0x10_0000, 0x1000, crate::emulated::Protection::ReadWrite);
        space.write_bytes(0x10_0000, &[0x5a; 16]);

        let device = ControlDevice::new();
        let (result, done) = completion();
        device.io_in_caller_context(
            &space,
            Request::new(
                RequestParameters::device_control(
                    IOCTL_V2P_TRANSLATE + 4,
                    UserBuffer::new(0x10_0000, 8),
                    UserBuffer::new(0x10_0008, 8),
                ),
                done,
            ),
        );
        assert_eq!(result.take(), Some((NtStatus::SUCCESS, 0)));
        let mut data = [0; 16];
        space.read_bytes(0x10_0000, &mut data);
        assert_eq!(data, [0x5a; 16]);
        assert_eq!(space.pin_count(), 0);
    }

    #[test]
    fn translate_code_as_read_is_standard() {
        let space = space();
        let device = ControlDevice::new();
        let (result, done) = completion();
        device.io_in_caller_context(
            &space,
            Request::new(
                RequestParameters {
                    request_type: RequestType::Read,
                    ioctl_code: IOCTL_V2P_TRANSLATE,
                    // Would fail validation if it took the privileged path.
                    input: UserBuffer::new(0, 8),
                    output: UserBuffer::NULL,
                },
                done,
            ),
        );
        assert_eq!(result.take(), Some((NtStatus::SUCCESS, 0)));
    }

    #[test]
    fn stopped_queue_fails_standard_requests() {
        let space = space();
        let device = ControlDevice::new();
        device.stop_default_queue();

        let (result, done) = completion();
        device.io_in_caller_context(
            &space,
            Request::new(
                RequestParameters::device_control(0x1234, UserBuffer::NULL, UserBuffer::NULL),
                done,
            ),
        );
        assert_eq!(result.take(), Some((NtStatus::INVALID_DEVICE_STATE, 0)));

        // The privileged path does not go through the queue.
        let (result, done) = completion();
        device.io_in_caller_context(
            &space,
            Request::new(
                RequestParameters::device_control(
                    IOCTL_V2P_TRANSLATE,
                    UserBuffer::NULL,
                    UserBuffer::NULL,
                ),
                done,
            ),
        );
        assert_eq!(result.take(), Some((NtStatus::SUCCESS, 0)));

        device.start_default_queue();
        let (result, done) = completion();
        device.io_in_caller_context(
            &space,
            Request::new(
                RequestParameters::device_control(0x1234, UserBuffer::NULL, UserBuffer::NULL),
                done,
            ),
        );
        assert_eq!(result.take(), Some((NtStatus::SUCCESS, 0)));
    }

    struct Serialized {
        active: AtomicUsize,
        max_active: AtomicUsize,
        handled: AtomicUsize,
    }

    impl IoQueueHandler for Arc<Serialized> {
        fn handle(&self, request: Request) {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            std::thread::yield_now();
            self.handled.fetch_add(1, Ordering::SeqCst);
            self.active.fetch_sub(1, Ordering::SeqCst);
            request.complete_with_information(NtStatus::SUCCESS, 0);
        }
    }

    #[test]
    fn default_queue_is_sequential() {
        let handler = Arc::new(Serialized {
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            handled: AtomicUsize::new(0),
        });
        let device = ControlDevice::with_default_handler(handler.clone());
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let space = space();
                    for _ in 0..50 {
                        let (_result, done) = completion();
                        device.io_in_caller_context(
                            &space,
                            Request::new(
                                RequestParameters::device_control(
                                    0x1234,
                                    UserBuffer::NULL,
                                    UserBuffer::NULL,
                                ),
                                done,
                            ),
                        );
                    }
                });
            }
        });
        assert_eq!(handler.handled.load(Ordering::SeqCst), 200);
        assert_eq!(handler.max_active.load(Ordering::SeqCst), 1);
    }
}
