//! Wire-format syscall records
//!
//! Every payload the kernel reads from or writes to user memory is a
//! fixed-layout record defined here, derived with `zerocopy` so the
//! kernel can view raw bytes without hand-written transmutes.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Parameter type tag: `payload` is a user pointer to `size` bytes.
pub const PARAM_ARRAY: u32 = 0;
/// Parameter type tag: `payload` is the primitive value itself.
pub const PARAM_PRIMITIVE: u32 = 1;

/// The argument record passed to PUSH and filled in by PEEK/POP.
///
/// `payload` is the primitive value when `kind == PARAM_PRIMITIVE` and a
/// user pointer when `kind == PARAM_ARRAY`. On PEEK/POP an array payload
/// of 0 asks the kernel to report only the size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SyscallParam {
    /// [`PARAM_ARRAY`] or [`PARAM_PRIMITIVE`].
    pub kind: u32,
    /// Explicit padding; must be zero.
    pub _pad: u32,
    /// Byte length of an array argument (ignored for primitives).
    pub size: u64,
    /// Primitive value or user pointer, per `kind`.
    pub payload: u64,
}

const _: () = assert!(core::mem::size_of::<SyscallParam>() == 24);

impl SyscallParam {
    /// Build a primitive parameter record.
    #[must_use]
    pub const fn primitive(value: u64) -> Self {
        Self { kind: PARAM_PRIMITIVE, _pad: 0, size: 0, payload: value }
    }

    /// Build an array parameter record from a pointer and length.
    #[must_use]
    pub const fn array(ptr: u64, len: u64) -> Self {
        Self { kind: PARAM_ARRAY, _pad: 0, size: len, payload: ptr }
    }

    /// Check whether this record describes an array argument.
    #[inline]
    #[must_use]
    pub const fn is_array(&self) -> bool {
        self.kind == PARAM_ARRAY
    }
}

/// Payload of the METHOD syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MethodData {
    /// Target process id; 0 addresses the kernel interfaces.
    pub target_pid: u64,
    /// Interface id.
    pub iid: u64,
    /// Method id within the interface.
    pub mid: u64,
}

/// Payload of the SIGNAL syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SignalData {
    /// Interface id.
    pub iid: u64,
    /// Signal id within the interface.
    pub sid: u64,
}

/// Payload of the TARGETED_SIGNAL syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TargetedSignalData {
    /// Target process id.
    pub target_pid: u64,
    /// Interface id.
    pub iid: u64,
    /// Signal id within the interface.
    pub sid: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromBytes;

    #[test]
    fn test_param_layout() {
        let param = SyscallParam::array(0x4000, 16);
        let bytes = param.as_bytes();
        assert_eq!(bytes.len(), 24);

        let back = SyscallParam::read_from_bytes(bytes).unwrap();
        assert_eq!(back, param);
        assert!(back.is_array());
    }

    #[test]
    fn test_primitive_record() {
        let param = SyscallParam::primitive(42);
        assert!(!param.is_array());
        assert_eq!(param.payload, 42);
        assert_eq!(param.size, 0);
    }

    #[test]
    fn test_method_data_view() {
        let data = MethodData { target_pid: 7, iid: 1, mid: 0 };
        let bytes = data.as_bytes();
        let back = MethodData::read_from_bytes(bytes).unwrap();
        assert_eq!(back, data);
    }
}
