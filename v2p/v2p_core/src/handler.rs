// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::acquire;
use crate::error::TranslateError;
use crate::request::Request;
use crate::space::AddressSpace;
use crate::translate;
use crate::translate::TranslationSummary;

/// Processes a privileged translation request against the caller's address
/// space and completes it.
///
/// This must run synchronously on behalf of the task that owns `caller`,
/// before the request is queued anywhere, since the raw buffer pointers and
/// the addresses inside them are only meaningful in that address space.
pub fn translate_in_caller_context(caller: &dyn AddressSpace, mut request: Request) {
    let result = process(caller, &mut request);
    if let Ok(summary) = &result {
        tracing::debug!(
            slots = summary.slots,
            valid = summary.valid,
            "translated addresses"
        );
    }
    request.complete(result.map(|summary| summary.information()));
}

fn process(
    caller: &dyn AddressSpace,
    request: &mut Request,
) -> Result<TranslationSummary, TranslateError> {
    let params = *request.parameters();
    let width = caller.address_width();

    acquire::check_buffers(&params, width)?;
    let mut translator = caller
        .translator()
        .map_err(TranslateError::ResourceExhaustion)?;

    let (input, output) = acquire::pin_buffers(caller, &params, request.context_mut())?;
    translate::translate_slots(&mut *translator, input, output, width)
}
