// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire definitions for the virtual-to-physical translation control device.
//!
//! A client submits [`IOCTL_V2P_TRANSLATE`] with an input buffer holding an
//! array of virtual addresses (each [`AddressWidth`] wide) and an output
//! buffer holding the same number of `u64` slots. Each output slot receives
//! the physical address backing the corresponding input address, or
//! [`INVALID_PHYSICAL_ADDRESS`] when there is none. On success the completion
//! information is the number of valid slots times [`OUTPUT_ELEMENT_SIZE`].

#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![no_std]

/// Value written to an output slot whose address has no valid translation.
pub const INVALID_PHYSICAL_ADDRESS: u64 = !0;

/// Size in bytes of one output slot.
pub const OUTPUT_ELEMENT_SIZE: usize = size_of::<u64>();

/// Device type of the translation control device. Values at or above 0x8000
/// are reserved for vendor devices.
pub const FILE_DEVICE_V2P: u32 = 0x9c40;

/// Buffer transfer method where the raw caller pointers are passed through
/// unmodified.
pub const METHOD_NEITHER: u32 = 3;

/// Access check required to open the device for this control code.
pub const FILE_ANY_ACCESS: u32 = 0;

/// Builds a control code from its fields.
pub const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

/// The single privileged control code: translate a batch of virtual addresses.
pub const IOCTL_V2P_TRANSLATE: u32 =
    ctl_code(FILE_DEVICE_V2P, 0x800, METHOD_NEITHER, FILE_ANY_ACCESS);

/// Returns the transfer method encoded in a control code.
pub const fn ctl_method(code: u32) -> u32 {
    code & 3
}

/// Returns the function number encoded in a control code.
pub const fn ctl_function(code: u32) -> u32 {
    (code >> 2) & 0xfff
}

/// Returns the device type encoded in a control code.
pub const fn ctl_device_type(code: u32) -> u32 {
    code >> 16
}

/// The kind of an I/O request delivered to the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestType {
    /// A device control request carrying a control code.
    DeviceControl,
    /// A kernel-internal device control request.
    InternalDeviceControl,
    /// A read request.
    Read,
    /// A write request.
    Write,
    /// Any other request type.
    Other,
}

/// Width of a virtual address in the caller's address space, which is the
/// width of one input slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddressWidth {
    /// 4-byte addresses.
    Bits32,
    /// 8-byte addresses.
    Bits64,
}

impl AddressWidth {
    /// The width of a pointer in this process.
    pub const NATIVE: Self = if size_of::<usize>() == 4 {
        Self::Bits32
    } else {
        Self::Bits64
    };

    /// The size of one address in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::Bits32 => 4,
            Self::Bits64 => 8,
        }
    }
}

/// A completion status, encoded as an NTSTATUS value.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct NtStatus(pub u32);

impl NtStatus {
    /// The request succeeded.
    pub const SUCCESS: Self = Self(0);
    /// The request was dropped before it was completed.
    pub const CANCELLED: Self = Self(0xc000_0120);
    /// A resource needed to process the request could not be allocated.
    pub const INSUFFICIENT_RESOURCES: Self = Self(0xc000_009a);
    /// A buffer pointer, length, or slot count was inconsistent.
    pub const INVALID_PARAMETER: Self = Self(0xc000_000d);
    /// A buffer could not be locked for the requested access.
    pub const ACCESS_VIOLATION: Self = Self(0xc000_0005);
    /// The device is not accepting requests.
    pub const INVALID_DEVICE_STATE: Self = Self(0xc000_0184);

    /// Returns true for success and informational statuses.
    pub const fn is_success(self) -> bool {
        (self.0 as i32) >= 0
    }

    fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::SUCCESS => "STATUS_SUCCESS",
            Self::CANCELLED => "STATUS_CANCELLED",
            Self::INSUFFICIENT_RESOURCES => "STATUS_INSUFFICIENT_RESOURCES",
            Self::INVALID_PARAMETER => "STATUS_INVALID_PARAMETER",
            Self::ACCESS_VIOLATION => "STATUS_ACCESS_VIOLATION",
            Self::INVALID_DEVICE_STATE => "STATUS_INVALID_DEVICE_STATE",
            _ => return None,
        };
        Some(name)
    }
}

impl core::fmt::Debug for NtStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.name() {
            Some(name) => f.pad(name),
            None => write!(f, "NtStatus({:#010x})", self.0),
        }
    }
}

impl core::fmt::Display for NtStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({:#010x})", self.0),
            None => write!(f, "{:#010x}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_code_layout() {
        assert_eq!(IOCTL_V2P_TRANSLATE, 0x9c40_2003);
        assert_eq!(ctl_method(IOCTL_V2P_TRANSLATE), METHOD_NEITHER);
        assert_eq!(ctl_function(IOCTL_V2P_TRANSLATE), 0x800);
        assert_eq!(ctl_device_type(IOCTL_V2P_TRANSLATE), FILE_DEVICE_V2P);
    }

    #[test]
    fn status_severity() {
        assert!(NtStatus::SUCCESS.is_success());
        assert!(!NtStatus::INVALID_PARAMETER.is_success());
        assert!(!NtStatus::ACCESS_VIOLATION.is_success());
        assert!(!NtStatus::INSUFFICIENT_RESOURCES.is_success());
    }

    #[test]
    fn native_width_matches_pointer() {
        assert_eq!(AddressWidth::NATIVE.size(), size_of::<usize>());
    }
}
