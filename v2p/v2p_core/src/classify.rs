// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::request::RequestParameters;
use v2p_defs::RequestType;
use v2p_defs::IOCTL_V2P_TRANSLATE;

/// Where a request is processed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Route {
    /// Handled immediately, on the caller's thread and against the caller's
    /// address space, with raw buffers.
    Privileged,
    /// Forwarded to the default queue.
    Standard,
}

/// Decides how a request is routed.
///
/// Only a device control carrying [`IOCTL_V2P_TRANSLATE`] is privileged.
pub fn classify(params: &RequestParameters) -> Route {
    if params.request_type == RequestType::DeviceControl
        && params.ioctl_code == IOCTL_V2P_TRANSLATE
    {
        Route::Privileged
    } else {
        Route::Standard
    }
}
