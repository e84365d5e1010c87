//! Architecture-neutral page permissions

/// Permissions carried by a leaf mapping, translated per architecture.
///
/// On x86_64, `write` sets the writable bit and `cow` a software-reserved
/// bit; on AArch64, absence of `write` sets the read-only attribute and
/// `cow` a software-reserved descriptor bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFlags {
    /// Write permission.
    pub write: bool,
    /// User-accessible permission.
    pub user: bool,
    /// Copy-on-write tag: present but write-protected, duplicated on the
    /// first write fault.
    pub cow: bool,
}

impl PageFlags {
    /// Kernel read-only mapping.
    pub const KERNEL_RO: Self = Self { write: false, user: false, cow: false };
    /// Kernel read-write mapping.
    pub const KERNEL_WRITE: Self = Self { write: true, user: false, cow: false };
    /// User read-only mapping.
    pub const USER_RO: Self = Self { write: false, user: true, cow: false };
    /// User read-write mapping.
    pub const USER_WRITE: Self = Self { write: true, user: true, cow: false };

    /// Convert a writable mapping into its copy-on-write form.
    #[inline]
    #[must_use]
    pub const fn into_cow(self) -> Self {
        Self { write: false, user: self.user, cow: true }
    }

    /// Resolve a copy-on-write mapping back to a private writable one.
    #[inline]
    #[must_use]
    pub const fn from_cow(self) -> Self {
        Self { write: true, user: self.user, cow: false }
    }

    /// Check if this is writable by hardware.
    #[inline]
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.write
    }

    /// Check if this is tagged copy-on-write.
    #[inline]
    #[must_use]
    pub const fn is_cow(&self) -> bool {
        self.cow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cow_roundtrip() {
        let flags = PageFlags::USER_WRITE;
        let cow = flags.into_cow();
        assert!(!cow.write);
        assert!(cow.cow);
        assert!(cow.user);

        let resolved = cow.from_cow();
        assert_eq!(resolved, PageFlags::USER_WRITE);
    }
}
