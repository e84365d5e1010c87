//! Syscall error codes
//!
//! Negative values indicate errors, zero indicates success, and positive
//! values carry identifiers for calls that produce one (for example a
//! pid from the name service).

/// Kernel error codes as seen on the syscall return register.
#[repr(i64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// A required allocation could not be satisfied.
    OutOfMemory = -1,
    /// An address or index fell outside the valid range.
    OutOfRange = -2,
    /// The named object does not exist.
    NotFound = -3,
    /// A malformed or out-of-contract argument.
    InvalidArgument = -4,
    /// The file is not a loadable executable.
    InvalidElf = -5,
    /// A user pointer reached into the kernel half.
    PermissionDenied = -6,
    /// The object already exists.
    AlreadyExists = -7,
    /// The operation is recognised but not provided.
    Unsupported = -8,
}

impl KernelError {
    /// Convert to the raw wire value.
    #[inline]
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self as i64
    }

    /// Try to convert from a raw wire value.
    #[must_use]
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            -1 => Some(Self::OutOfMemory),
            -2 => Some(Self::OutOfRange),
            -3 => Some(Self::NotFound),
            -4 => Some(Self::InvalidArgument),
            -5 => Some(Self::InvalidElf),
            -6 => Some(Self::PermissionDenied),
            -7 => Some(Self::AlreadyExists),
            -8 => Some(Self::Unsupported),
            _ => None,
        }
    }

    /// Get the error name for logging.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::OutOfMemory => "OutOfMemory",
            Self::OutOfRange => "OutOfRange",
            Self::NotFound => "NotFound",
            Self::InvalidArgument => "InvalidArgument",
            Self::InvalidElf => "InvalidElf",
            Self::PermissionDenied => "PermissionDenied",
            Self::AlreadyExists => "AlreadyExists",
            Self::Unsupported => "Unsupported",
        }
    }
}

/// Result type used by kernel entry points that surface on the wire.
pub type SyscallResult<T = i64> = Result<T, KernelError>;

/// Fold a result into the raw register value (`>= 0` success).
#[inline]
#[must_use]
pub fn into_wire(result: SyscallResult) -> i64 {
    match result {
        Ok(value) => value,
        Err(err) => err.as_i64(),
    }
}

/// Check a raw return value and convert to a result.
#[inline]
pub fn check_result(value: i64) -> SyscallResult {
    if value >= 0 {
        Ok(value)
    } else {
        Err(KernelError::from_i64(value).unwrap_or(KernelError::Unsupported))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip() {
        for raw in -8..0 {
            let err = KernelError::from_i64(raw).unwrap();
            assert_eq!(err.as_i64(), raw);
        }
        assert!(KernelError::from_i64(0).is_none());
        assert!(KernelError::from_i64(-9).is_none());
    }

    #[test]
    fn test_check_result() {
        assert_eq!(check_result(7), Ok(7));
        assert_eq!(check_result(0), Ok(0));
        assert_eq!(check_result(-3), Err(KernelError::NotFound));
    }
}
