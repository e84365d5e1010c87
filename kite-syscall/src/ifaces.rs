//! Well-known kernel interface and method ids
//!
//! Interface 0 resolves names to the ids below, so user code only needs
//! these constants to bootstrap; everything else can be discovered at run
//! time through `FindInterface`/`FindMethod`.

/// Kernel interface ids (the `iid` of a METHOD with `target_pid == 0`).
pub mod iface {
    /// Name lookup for the kernel's own interfaces and methods.
    pub const LOCAL_NAME_SERVICE: u64 = 0;
    /// Pid registry for user-space services.
    pub const GLOBAL_NAME_SERVICE: u64 = 1;
    /// Serial-backed standard I/O.
    pub const STDIO: u64 = 2;
}

/// Method ids of the LocalNameService interface.
pub mod local_name_service {
    /// `Array(name)` -> interface id, or -1.
    pub const FIND_INTERFACE: u64 = 0;
    /// `Primitive(iid)`, `Array(name)` -> method id, or -1.
    pub const FIND_METHOD: u64 = 1;
}

/// Method ids of the GlobalNameService interface.
pub mod global_name_service {
    /// `Array(name)` -> pid of the registered service, or -1.
    pub const FIND_DESTINATION: u64 = 0;
    /// `Array(name)`, `Primitive(entry)` -> the caller's pid.
    pub const REGISTER_DESTINATION: u64 = 1;
    /// `Array(name)` -> 0, or -1 when no such service exists.
    pub const UNREGISTER_DESTINATION: u64 = 2;
}

/// Method ids of the Stdio interface.
pub mod stdio {
    /// Not provided by the kernel; always -1.
    pub const READ: u64 = 0;
    /// `Array(bytes)` -> 0; appends to the serial debug sink.
    pub const WRITE: u64 = 1;
    /// -> 0.
    pub const FLUSH: u64 = 2;
}
