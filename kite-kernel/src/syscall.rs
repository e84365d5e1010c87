//! Syscall dispatch
//!
//! The architecture entry path delivers a full frame; the number and
//! payload-pointer registers select the call, and the result lands in
//! the return register. Every payload crossing from user space is
//! bounds-checked against the kernel half before the kernel reads or
//! writes through it.

use alloc::vec::Vec;

use kite_arch::InterruptFrame;
use kite_paging::KERNEL_BASE;
use kite_syscall::param::{
    MethodData, PARAM_ARRAY, PARAM_PRIMITIVE, SignalData, SyscallParam, TargetedSignalData,
};
use kite_syscall::{KernelError, Syscall, SyscallResult, error};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::ipc::{self, IpcParam};
use crate::memory::KernelFrames;
use crate::task::{self, ThreadKey};

/// The syscall hook installed during boot.
pub fn handle(frame: &mut InterruptFrame) {
    let Some(call) = Syscall::from_number(frame.syscall_number()) else {
        frame.set_syscall_result(KernelError::Unsupported.as_i64());
        return;
    };

    if call == Syscall::Exit {
        task::exit_current(frame);
        return;
    }

    let result = dispatch(call, frame.syscall_payload());
    frame.set_syscall_result(error::into_wire(result));
}

fn dispatch(call: Syscall, payload: u64) -> SyscallResult {
    let caller = task::current_thread_key().ok_or(KernelError::NotFound)?;

    match call {
        Syscall::Method => {
            let data: MethodData = read_user_struct(payload)?;
            task::with_tasks(|state| ipc::method(state, caller, &data, &mut KernelFrames))
        }
        Syscall::Signal => {
            let data: SignalData = read_user_struct(payload)?;
            task::with_tasks(|state| ipc::signal(state, caller, &data, &mut KernelFrames))
        }
        Syscall::TargetedSignal => {
            let data: TargetedSignalData = read_user_struct(payload)?;
            task::with_tasks(|state| ipc::targeted_signal(state, caller, &data, &mut KernelFrames))
        }
        Syscall::Push => {
            let record: SyscallParam = read_user_struct(payload)?;
            let param = param_from_user(&record)?;
            task::with_tasks(|state| ipc::push(state, caller, param))
        }
        Syscall::Peek => peek_pop(payload, caller, false),
        Syscall::Pop => peek_pop(payload, caller, true),
        Syscall::Exit => unreachable!("exit handled before dispatch"),
    }
}

/// PEEK and POP share everything except the final removal: the out
/// record is filled from the stack top, array contents are copied to the
/// caller-provided destination when one is given, and only a fully
/// validated POP removes the argument.
///
/// The destination range is checked under the task lock (so a rejected
/// pointer leaves the stack unmodified), but the user-memory copies
/// happen after it is released: a copy-on-write fault on the destination
/// re-enters the task lock.
fn peek_pop(payload: u64, caller: ThreadKey, remove: bool) -> SyscallResult {
    let mut record: SyscallParam = read_user_struct(payload)?;

    let param = task::with_tasks(|state| {
        let top = ipc::peek(state, caller)?.clone();
        if let IpcParam::Array(bytes) = &top
            && record.payload != 0
        {
            check_user_range(record.payload, bytes.len())?;
        }
        if remove {
            ipc::pop(state, caller)?;
        }
        Ok(top)
    })?;

    match &param {
        IpcParam::Primitive(value) => {
            record.kind = PARAM_PRIMITIVE;
            record.size = 0;
            record.payload = *value;
        }
        IpcParam::Array(bytes) => {
            record.kind = PARAM_ARRAY;
            record.size = bytes.len() as u64;
            if record.payload != 0 {
                // SAFETY: Destination range checked against the kernel
                // half above; the process's space is current.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        record.payload as *mut u8,
                        bytes.len(),
                    );
                }
            }
        }
    }

    write_user_struct(payload, &record)?;
    Ok(0)
}

/// Reject null pointers and any range reaching into the kernel half.
fn check_user_range(ptr: u64, len: usize) -> Result<(), KernelError> {
    if ptr == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let end = ptr.checked_add(len as u64).ok_or(KernelError::PermissionDenied)?;
    if end > KERNEL_BASE || ptr >= KERNEL_BASE {
        return Err(KernelError::PermissionDenied);
    }
    Ok(())
}

/// Copy a fixed-layout record in from user memory.
fn read_user_struct<T: FromBytes>(ptr: u64) -> Result<T, KernelError> {
    check_user_range(ptr, core::mem::size_of::<T>())?;
    // SAFETY: The range was checked; FromBytes accepts any bit pattern,
    // and the unaligned read tolerates arbitrary user pointers.
    Ok(unsafe { core::ptr::read_unaligned(ptr as *const T) })
}

/// Copy a fixed-layout record back out to user memory.
fn write_user_struct<T: IntoBytes + Immutable>(ptr: u64, value: &T) -> Result<(), KernelError> {
    let bytes = value.as_bytes();
    check_user_range(ptr, bytes.len())?;
    // SAFETY: The range was checked and byte-wise copies need no
    // alignment.
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
    }
    Ok(())
}

/// Build a kernel-owned parameter from the user's PUSH record: primitive
/// values are taken as-is, array payloads are copied into a kernel
/// buffer.
fn param_from_user(record: &SyscallParam) -> Result<IpcParam, KernelError> {
    match record.kind {
        PARAM_PRIMITIVE => Ok(IpcParam::Primitive(record.payload)),
        PARAM_ARRAY => {
            let len = record.size as usize;
            check_user_range(record.payload, len)?;
            // SAFETY: The range was checked; the process's space is
            // current while its syscall runs.
            let source = unsafe { core::slice::from_raw_parts(record.payload as *const u8, len) };

            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(len)
                .map_err(|_| KernelError::OutOfMemory)?;
            buffer.extend_from_slice(source);
            Ok(IpcParam::Array(buffer))
        }
        _ => Err(KernelError::InvalidArgument),
    }
}
