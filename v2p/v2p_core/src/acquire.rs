// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Turning raw caller buffers into pinned buffers.

use crate::error::ContextError;
use crate::error::InvalidParameter;
use crate::error::PinError;
use crate::error::TranslateError;
use crate::pin::PinnedBuffer;
use crate::request::BufferKind;
use crate::request::RequestContext;
use crate::request::RequestParameters;
use crate::request::UserBuffer;
use crate::space::Access;
use crate::space::AddressSpace;
use v2p_defs::AddressWidth;
use v2p_defs::OUTPUT_ELEMENT_SIZE;

/// Input and output slot counts of a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SlotCounts {
    pub input: usize,
    pub output: usize,
}

impl SlotCounts {
    fn new(input_len: usize, output_len: usize, width: AddressWidth) -> Self {
        Self {
            input: input_len / width.size(),
            output: output_len / OUTPUT_ELEMENT_SIZE,
        }
    }

    pub fn check(self) -> Result<usize, InvalidParameter> {
        if self.input != self.output {
            return Err(InvalidParameter::SlotCountMismatch {
                input: self.input,
                output: self.output,
            });
        }
        Ok(self.input)
    }
}

fn check_pair(buffer: BufferKind, user: UserBuffer) -> Result<(), InvalidParameter> {
    match (user.is_null(), user.len) {
        (true, 0) | (false, 1..) => Ok(()),
        (true, len) => Err(InvalidParameter::NullWithLength { buffer, len }),
        (false, 0) => Err(InvalidParameter::ZeroLength {
            buffer,
            address: user.address,
        }),
    }
}

/// Validates the declared buffers before anything is pinned.
pub fn check_buffers(
    params: &RequestParameters,
    width: AddressWidth,
) -> Result<usize, InvalidParameter> {
    check_pair(BufferKind::Input, params.input)?;
    check_pair(BufferKind::Output, params.output)?;
    SlotCounts::new(params.input.len, params.output.len, width).check()
}

fn pin_one(
    space: &dyn AddressSpace,
    buffer: BufferKind,
    user: UserBuffer,
    access: Access,
) -> Result<PinnedBuffer, TranslateError> {
    if user.len == 0 {
        return Ok(PinnedBuffer::empty(access));
    }
    let mem = space.pin(user, access).map_err(|source| match source {
        PinError::OutOfResources(err) => {
            TranslateError::ResourceExhaustion(ContextError::PinResources(err))
        }
        source => TranslateError::LockFailure {
            buffer,
            access,
            source,
        },
    })?;
    Ok(PinnedBuffer::new(mem, access))
}

/// Pins the input buffer for read and the output buffer for write, storing
/// both in `context`.
///
/// On failure, whatever was pinned stays in `context` and is released when
/// the request completes.
pub fn pin_buffers<'a>(
    space: &dyn AddressSpace,
    params: &RequestParameters,
    context: &'a mut RequestContext,
) -> Result<(&'a PinnedBuffer, &'a PinnedBuffer), TranslateError> {
    let input = context.input.insert(pin_one(
        space,
        BufferKind::Input,
        params.input,
        Access::Read,
    )?);
    let output = context.output.insert(pin_one(
        space,
        BufferKind::Output,
        params.output,
        Access::Write,
    )?);
    tracing::trace!(
        input_len = input.len(),
        output_len = output.len(),
        "pinned buffers"
    );
    Ok((input, output))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(input: UserBuffer, output: UserBuffer) -> RequestParameters {
        RequestParameters::device_control(v2p_defs::IOCTL_V2P_TRANSLATE, input, output)
    }

    #[test]
    fn null_with_length_rejected() {
        let err = check_buffers(
            &params(UserBuffer::new(0, 8), UserBuffer::new(0x1000, 8)),
            AddressWidth::Bits64,
        )
        .unwrap_err();
        assert_eq!(
            err,
            InvalidParameter::NullWithLength {
                buffer: BufferKind::Input,
                len: 8
            }
        );
    }

    #[test]
    fn pointer_without_length_rejected() {
        let err = check_buffers(
            &params(UserBuffer::NULL, UserBuffer::new(0x2000, 0)),
            AddressWidth::Bits64,
        )
        .unwrap_err();
        assert_eq!(
            err,
            InvalidParameter::ZeroLength {
                buffer: BufferKind::Output,
                address: 0x2000
            }
        );
    }

    #[test]
    fn declared_slot_mismatch_rejected() {
        let err = check_buffers(
            &params(UserBuffer::new(0x1000, 32), UserBuffer::new(0x2000, 24)),
            AddressWidth::Bits64,
        )
        .unwrap_err();
        assert_eq!(
            err,
            InvalidParameter::SlotCountMismatch {
                input: 4,
                output: 3
            }
        );
    }

    #[test]
    fn narrow_addresses_use_narrow_slots() {
        let slots = check_buffers(
            &params(UserBuffer::new(0x1000, 12), UserBuffer::new(0x2000, 24)),
            AddressWidth::Bits32,
        )
        .unwrap();
        assert_eq!(slots, 3);
    }

    struct Starved;

    impl AddressSpace for Starved {
        fn address_width(&self) -> AddressWidth {
            AddressWidth::Bits64
        }

        fn pin(
            &self,
            _range: UserBuffer,
            _access: Access,
        ) -> Result<Box<dyn crate::PinnedMemory>, PinError> {
            Err(PinError::OutOfResources(
                std::io::ErrorKind::OutOfMemory.into(),
            ))
        }

        fn translator(&self) -> Result<Box<dyn crate::Translator + '_>, ContextError> {
            Err(ContextError::Exhausted)
        }
    }

    #[test]
    fn pin_out_of_resources_is_exhaustion() {
        let mut context = RequestContext::default();
        let err = pin_buffers(
            &Starved,
            &params(UserBuffer::new(0x1000, 8), UserBuffer::new(0x2000, 8)),
            &mut context,
        )
        .unwrap_err();
        assert!(
            matches!(
                err,
                TranslateError::ResourceExhaustion(ContextError::PinResources(_))
            ),
            "{err:?}"
        );
        assert_eq!(err.status(), v2p_defs::NtStatus::INSUFFICIENT_RESOURCES);
        assert!(context.is_empty());
    }

    #[test]
    fn empty_buffers_accepted() {
        let slots =
            check_buffers(&params(UserBuffer::NULL, UserBuffer::NULL), AddressWidth::Bits64)
                .unwrap();
        assert_eq!(slots, 0);
    }
}
