// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The translation engine.

use crate::acquire::SlotCounts;
use crate::error::TranslateError;
use crate::pin::PinnedBuffer;
use crate::space::Translator;
use v2p_defs::AddressWidth;
use v2p_defs::INVALID_PHYSICAL_ADDRESS;
use v2p_defs::OUTPUT_ELEMENT_SIZE;

/// The result of translating a batch of addresses.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TranslationSummary {
    /// Slots written.
    pub slots: usize,
    /// Slots that received a physical address rather than
    /// [`INVALID_PHYSICAL_ADDRESS`].
    pub valid: usize,
}

impl TranslationSummary {
    /// The completed byte count reported for the request.
    pub fn information(&self) -> u64 {
        (self.valid * OUTPUT_ELEMENT_SIZE) as u64
    }
}

/// Translates every address in `input` into the matching slot of `output`,
/// in ascending slot order.
///
/// Fails without writing anything if the buffers hold different numbers of
/// slots.
pub fn translate_slots(
    translator: &mut dyn Translator,
    input: &PinnedBuffer,
    output: &PinnedBuffer,
    width: AddressWidth,
) -> Result<TranslationSummary, TranslateError> {
    let slots = SlotCounts {
        input: input.slot_count(width.size()),
        output: output.slot_count(OUTPUT_ELEMENT_SIZE),
    }
    .check()?;

    let mut valid = 0;
    for index in 0..slots {
        let va = input.read_address(index, width);
        let pa = match translator.translate(va) {
            Some(pa) => {
                valid += 1;
                pa
            }
            None => INVALID_PHYSICAL_ADDRESS,
        };
        tracing::trace!(index, va, pa, "translated slot");
        output.write_u64(index, pa);
    }

    Ok(TranslationSummary { slots, valid })
}
