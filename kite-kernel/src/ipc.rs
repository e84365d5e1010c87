//! IPC core
//!
//! Every thread carries an argument stack of kernel-owned parameters.
//! METHOD moves the caller's stack into a freshly spawned handler thread
//! in the target process; SIGNAL copies it to every registered listener.
//! Nothing here blocks: calls return as soon as the handler threads are
//! queued, and a request/response pair is simply two METHODs.
//!
//! Interface 0 resolves kernel interface and method names, interface 1
//! is the pid registry for user services, interface 2 is the serial
//! sink.

use alloc::string::String;
use alloc::vec::Vec;

use kite_paging::FrameSource;
use kite_syscall::param::{MethodData, SignalData, TargetedSignalData};
use kite_syscall::{KernelError, ifaces};

use crate::task::{Pid, ServiceEntry, TaskState, ThreadKey};

/// One argument on a thread's IPC stack. The kernel owns the memory
/// behind an `Array`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcParam {
    Primitive(u64),
    Array(Vec<u8>),
}

impl IpcParam {
    fn as_array(&self) -> Option<&[u8]> {
        match self {
            Self::Array(bytes) => Some(bytes),
            Self::Primitive(_) => None,
        }
    }

    fn as_primitive(&self) -> Option<u64> {
        match self {
            Self::Primitive(value) => Some(*value),
            Self::Array(_) => None,
        }
    }
}

/// Append a parameter to the caller's argument stack.
pub fn push(state: &mut TaskState, caller: ThreadKey, param: IpcParam) -> Result<i64, KernelError> {
    let thread = state.thread_mut(caller).ok_or(KernelError::NotFound)?;
    thread.ipc_args.push(param);
    Ok(0)
}

/// Borrow the top of the caller's argument stack.
pub fn peek(state: &TaskState, caller: ThreadKey) -> Result<&IpcParam, KernelError> {
    state
        .thread(caller)
        .ok_or(KernelError::NotFound)?
        .ipc_args
        .last()
        .ok_or(KernelError::OutOfRange)
}

/// Remove and return the top of the caller's argument stack.
pub fn pop(state: &mut TaskState, caller: ThreadKey) -> Result<IpcParam, KernelError> {
    state
        .thread_mut(caller)
        .ok_or(KernelError::NotFound)?
        .ipc_args
        .pop()
        .ok_or(KernelError::OutOfRange)
}

/// Spawn a handler thread in `pid` at its registered entry point, with
/// `(iid, selector, caller_pid)` in the first argument registers.
fn spawn_handler(
    state: &mut TaskState,
    pid: Pid,
    iid: u64,
    selector: u64,
    caller_pid: Pid,
    frames: &mut impl FrameSource,
) -> Result<ThreadKey, KernelError> {
    let entry = state
        .processes
        .get(&pid)
        .ok_or(KernelError::NotFound)?
        .ipc_entry
        .ok_or(KernelError::NotFound)?;

    let handler = state.new_thread(pid, entry, true, frames)?;
    state
        .thread_mut(handler)
        .expect("fresh handler thread vanished")
        .context
        .set_entry_args(iid, selector, caller_pid);
    Ok(handler)
}

/// METHOD: dispatch to the kernel when `target_pid` is 0, otherwise
/// start a handler thread in the target and *move* the caller's
/// argument stack into it. Returns without waiting for the handler.
pub fn method(
    state: &mut TaskState,
    caller: ThreadKey,
    data: &MethodData,
    frames: &mut impl FrameSource,
) -> Result<i64, KernelError> {
    if data.target_pid == 0 {
        return kernel_method(state, caller, data.iid, data.mid);
    }

    if state.thread(caller).is_none() {
        return Err(KernelError::NotFound);
    }
    let handler = spawn_handler(state, data.target_pid, data.iid, data.mid, caller.pid, frames)?;

    let args = core::mem::take(
        &mut state
            .thread_mut(caller)
            .expect("caller thread vanished")
            .ipc_args,
    );
    state
        .thread_mut(handler)
        .expect("fresh handler thread vanished")
        .ipc_args = args;
    Ok(0)
}

/// SIGNAL: start a handler thread in every process with a registered
/// entry point except the sender's, each with its own *copy* of the
/// argument stack. The sender's stack is empty afterwards.
pub fn signal(
    state: &mut TaskState,
    caller: ThreadKey,
    data: &SignalData,
    frames: &mut impl FrameSource,
) -> Result<i64, KernelError> {
    let args = state.thread(caller).ok_or(KernelError::NotFound)?.ipc_args.clone();

    let recipients: Vec<Pid> = state
        .processes
        .values()
        .filter(|process| process.id != caller.pid && process.ipc_entry.is_some())
        .map(|process| process.id)
        .collect();

    let mut spawned = Vec::new();
    for pid in recipients {
        match spawn_handler(state, pid, data.iid, data.sid, caller.pid, frames) {
            Ok(handler) => {
                state
                    .thread_mut(handler)
                    .expect("fresh handler thread vanished")
                    .ipc_args = args.clone();
                spawned.push(handler);
            }
            Err(err) => {
                // Undo the partial delivery; the sender's stack is
                // untouched so far.
                for handler in spawned {
                    state.delete_thread(handler, frames, &kite_paging::NoOpInvalidator);
                }
                return Err(err);
            }
        }
    }

    state
        .thread_mut(caller)
        .expect("caller thread vanished")
        .ipc_args
        .clear();
    Ok(0)
}

/// TARGETED_SIGNAL: as SIGNAL, but to exactly one process.
pub fn targeted_signal(
    state: &mut TaskState,
    caller: ThreadKey,
    data: &TargetedSignalData,
    frames: &mut impl FrameSource,
) -> Result<i64, KernelError> {
    let args = state.thread(caller).ok_or(KernelError::NotFound)?.ipc_args.clone();

    let handler = spawn_handler(state, data.target_pid, data.iid, data.sid, caller.pid, frames)?;
    state
        .thread_mut(handler)
        .expect("fresh handler thread vanished")
        .ipc_args = args;

    state
        .thread_mut(caller)
        .expect("caller thread vanished")
        .ipc_args
        .clear();
    Ok(0)
}

// -- Kernel interfaces (METHOD with target_pid == 0)

fn interface_id_by_name(name: &str) -> i64 {
    match name {
        "LocalNameService" => ifaces::iface::LOCAL_NAME_SERVICE as i64,
        "GlobalNameService" => ifaces::iface::GLOBAL_NAME_SERVICE as i64,
        "Stdio" => ifaces::iface::STDIO as i64,
        _ => -1,
    }
}

fn method_id_by_name(iid: u64, name: &str) -> i64 {
    match (iid, name) {
        (ifaces::iface::LOCAL_NAME_SERVICE, "FindInterface") => 0,
        (ifaces::iface::LOCAL_NAME_SERVICE, "FindMethod") => 1,
        (ifaces::iface::GLOBAL_NAME_SERVICE, "FindDestination") => 0,
        (ifaces::iface::GLOBAL_NAME_SERVICE, "RegisterDestination") => 1,
        (ifaces::iface::GLOBAL_NAME_SERVICE, "UnregisterDestination") => 2,
        (ifaces::iface::STDIO, "Read") => 0,
        (ifaces::iface::STDIO, "Write") => 1,
        (ifaces::iface::STDIO, "Flush") => 2,
        _ => -1,
    }
}

/// Handle a METHOD addressed to the kernel. Arguments are consumed from
/// the top of the caller's stack, most recently pushed first; on a type
/// mismatch the stack is left as it was.
fn kernel_method(
    state: &mut TaskState,
    caller: ThreadKey,
    iid: u64,
    mid: u64,
) -> Result<i64, KernelError> {
    use ifaces::{global_name_service as gns, iface, local_name_service as lns, stdio};

    match (iid, mid) {
        (iface::LOCAL_NAME_SERVICE, lns::FIND_INTERFACE) => {
            let name = peek_string(state, caller, 0)?;
            pop_n(state, caller, 1);
            Ok(interface_id_by_name(&name))
        }
        (iface::LOCAL_NAME_SERVICE, lns::FIND_METHOD) => {
            let name = peek_string(state, caller, 0)?;
            let target_iid = peek_primitive(state, caller, 1)?;
            pop_n(state, caller, 2);
            Ok(method_id_by_name(target_iid, &name))
        }
        (iface::GLOBAL_NAME_SERVICE, gns::FIND_DESTINATION) => {
            let name = peek_string(state, caller, 0)?;
            pop_n(state, caller, 1);
            let found = state
                .services
                .iter()
                .find(|(_, service)| service.name == name)
                .map(|(pid, _)| *pid as i64);
            Ok(found.unwrap_or(-1))
        }
        (iface::GLOBAL_NAME_SERVICE, gns::REGISTER_DESTINATION) => {
            let entry = peek_primitive(state, caller, 0)?;
            let name = peek_string(state, caller, 1)?;
            pop_n(state, caller, 2);

            state
                .services
                .insert(caller.pid, ServiceEntry { name, entry });
            let process = state
                .processes
                .get_mut(&caller.pid)
                .ok_or(KernelError::NotFound)?;
            process.ipc_entry = Some(entry);
            Ok(caller.pid as i64)
        }
        (iface::GLOBAL_NAME_SERVICE, gns::UNREGISTER_DESTINATION) => {
            let name = peek_string(state, caller, 0)?;
            pop_n(state, caller, 1);
            let before = state.services.len();
            state.services.retain(|_, service| service.name != name);
            Ok(if state.services.len() < before { 0 } else { -1 })
        }
        (iface::STDIO, stdio::READ) => Ok(-1),
        (iface::STDIO, stdio::WRITE) => {
            let bytes = {
                let thread = state.thread(caller).ok_or(KernelError::NotFound)?;
                let top = thread.ipc_args.last().ok_or(KernelError::InvalidArgument)?;
                Vec::from(top.as_array().ok_or(KernelError::InvalidArgument)?)
            };
            pop_n(state, caller, 1);
            kite_arch::console::put_bytes(&bytes);
            Ok(0)
        }
        (iface::STDIO, stdio::FLUSH) => Ok(0),
        _ => Err(KernelError::Unsupported),
    }
}

/// Read the argument `depth` entries below the stack top as a string,
/// without removing anything.
fn peek_string(state: &TaskState, caller: ThreadKey, depth: usize) -> Result<String, KernelError> {
    let args = &state.thread(caller).ok_or(KernelError::NotFound)?.ipc_args;
    let index = args
        .len()
        .checked_sub(depth + 1)
        .ok_or(KernelError::InvalidArgument)?;
    let bytes = args[index].as_array().ok_or(KernelError::InvalidArgument)?;
    let text = core::str::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument)?;
    Ok(String::from(text))
}

/// Read the argument `depth` entries below the stack top as a
/// primitive, without removing anything.
fn peek_primitive(state: &TaskState, caller: ThreadKey, depth: usize) -> Result<u64, KernelError> {
    let args = &state.thread(caller).ok_or(KernelError::NotFound)?.ipc_args;
    let index = args
        .len()
        .checked_sub(depth + 1)
        .ok_or(KernelError::InvalidArgument)?;
    args[index].as_primitive().ok_or(KernelError::InvalidArgument)
}

/// Discard the top `count` arguments after a method validated them.
fn pop_n(state: &mut TaskState, caller: ThreadKey, count: usize) {
    if let Some(thread) = state.thread_mut(caller) {
        let new_len = thread.ipc_args.len().saturating_sub(count);
        thread.ipc_args.truncate(new_len);
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::task::{STACK_SIZE, TaskState};
    use crate::testutil::TestFrames;
    use kite_paging::space;
    use kite_paging::{AddressSpace, KERNEL_BASE, PageFlags};
    use std::vec::Vec;

    fn fresh_state(frames: &mut TestFrames) -> TaskState {
        let mut state = TaskState::new();
        state.kernel_root = space::create_table(frames).unwrap();
        let kernel_page = crate::testutil::fake_pages(1);
        space::map::<kite_paging::arch::x86_64::X86_64, _>(
            state.kernel_root,
            KERNEL_BASE,
            kernel_page,
            PageFlags::KERNEL_WRITE,
            frames,
        )
        .unwrap();
        state
    }

    fn spawn_process_with_thread(
        state: &mut TaskState,
        frames: &mut TestFrames,
    ) -> (crate::task::Pid, ThreadKey) {
        let space = AddressSpace::new(frames).unwrap();
        AddressSpace::from_root(state.kernel_root)
            .clone_higher_half_into(&space, frames)
            .unwrap();
        let pid = state.create_process(space, None, None);
        let key = state.new_thread(pid, 0x40_0000, false, frames).unwrap();
        (pid, key)
    }

    fn register(state: &mut TaskState, pid: crate::task::Pid, name: &str, entry: u64) {
        state.services.insert(
            pid,
            ServiceEntry { name: String::from(name), entry },
        );
        state.processes.get_mut(&pid).unwrap().ipc_entry = Some(entry);
    }

    #[test]
    fn test_push_pop_roundtrip() {
        let mut frames = TestFrames::new();
        let mut state = fresh_state(&mut frames);
        let (_, key) = spawn_process_with_thread(&mut state, &mut frames);

        let blob: Vec<u8> = (0..4096u32).map(|i| i as u8).collect();
        push(&mut state, key, IpcParam::Primitive(17)).unwrap();
        push(&mut state, key, IpcParam::Array(blob.clone())).unwrap();

        assert_eq!(pop(&mut state, key).unwrap(), IpcParam::Array(blob));
        assert_eq!(pop(&mut state, key).unwrap(), IpcParam::Primitive(17));
        assert_eq!(pop(&mut state, key), Err(KernelError::OutOfRange));
        assert!(state.thread(key).unwrap().ipc_args.is_empty());
    }

    #[test]
    fn test_peek_leaves_top_in_place() {
        let mut frames = TestFrames::new();
        let mut state = fresh_state(&mut frames);
        let (_, key) = spawn_process_with_thread(&mut state, &mut frames);

        push(&mut state, key, IpcParam::Primitive(5)).unwrap();
        assert_eq!(peek(&state, key).unwrap(), &IpcParam::Primitive(5));
        assert_eq!(state.thread(key).unwrap().ipc_args.len(), 1);
    }

    #[test]
    fn test_method_moves_stack_into_handler() {
        let mut frames = TestFrames::new();
        let mut state = fresh_state(&mut frames);
        let (caller_pid, caller) = spawn_process_with_thread(&mut state, &mut frames);
        let (target_pid, _) = spawn_process_with_thread(&mut state, &mut frames);
        register(&mut state, target_pid, "svc", 0x77_0000);

        push(&mut state, caller, IpcParam::Array(Vec::from(&b"payload"[..]))).unwrap();

        let data = MethodData { target_pid, iid: 4, mid: 9 };
        assert_eq!(method(&mut state, caller, &data, &mut frames), Ok(0));

        // The caller's stack moved; a handler thread exists in the
        // target with the entry args loaded.
        assert!(state.thread(caller).unwrap().ipc_args.is_empty());

        let target = &state.processes[&target_pid];
        let handler = target
            .threads
            .values()
            .find(|thread| thread.is_ipc_handler)
            .expect("no handler thread");
        assert_eq!(handler.context.instruction_pointer(), 0x77_0000);
        assert_eq!(handler.context.rdi, 4);
        assert_eq!(handler.context.rsi, 9);
        assert_eq!(handler.context.rdx, caller_pid);
        assert_eq!(handler.ipc_args, std::vec![IpcParam::Array(Vec::from(&b"payload"[..]))]);
    }

    #[test]
    fn test_method_requires_registered_target() {
        let mut frames = TestFrames::new();
        let mut state = fresh_state(&mut frames);
        let (_, caller) = spawn_process_with_thread(&mut state, &mut frames);
        let (target_pid, _) = spawn_process_with_thread(&mut state, &mut frames);

        let missing = MethodData { target_pid: 999, iid: 0, mid: 0 };
        assert_eq!(
            method(&mut state, caller, &missing, &mut frames),
            Err(KernelError::NotFound)
        );

        let unregistered = MethodData { target_pid, iid: 0, mid: 0 };
        assert_eq!(
            method(&mut state, caller, &unregistered, &mut frames),
            Err(KernelError::NotFound)
        );
    }

    #[test]
    fn test_signal_copies_to_every_listener() {
        let mut frames = TestFrames::new();
        let mut state = fresh_state(&mut frames);
        let (_, sender) = spawn_process_with_thread(&mut state, &mut frames);
        let (first_pid, _) = spawn_process_with_thread(&mut state, &mut frames);
        let (second_pid, _) = spawn_process_with_thread(&mut state, &mut frames);
        register(&mut state, first_pid, "a", 0x10_0000);
        register(&mut state, second_pid, "b", 0x20_0000);

        push(&mut state, sender, IpcParam::Primitive(1)).unwrap();
        push(&mut state, sender, IpcParam::Array(Vec::from(&b"sig"[..]))).unwrap();

        let data = SignalData { iid: 2, sid: 3 };
        assert_eq!(signal(&mut state, sender, &data, &mut frames), Ok(0));

        // Two independent handlers, identical stacks; the sender's
        // stack is empty on return.
        let expected = std::vec![
            IpcParam::Primitive(1),
            IpcParam::Array(Vec::from(&b"sig"[..])),
        ];
        for pid in [first_pid, second_pid] {
            let handler = state.processes[&pid]
                .threads
                .values()
                .find(|thread| thread.is_ipc_handler)
                .expect("listener got no handler");
            assert_eq!(handler.ipc_args, expected);
        }
        assert!(state.thread(sender).unwrap().ipc_args.is_empty());
    }

    #[test]
    fn test_signal_skips_sender_and_unregistered() {
        let mut frames = TestFrames::new();
        let mut state = fresh_state(&mut frames);
        let (sender_pid, sender) = spawn_process_with_thread(&mut state, &mut frames);
        let (silent_pid, _) = spawn_process_with_thread(&mut state, &mut frames);
        register(&mut state, sender_pid, "self", 0x1000);

        let data = SignalData { iid: 0, sid: 0 };
        assert_eq!(signal(&mut state, sender, &data, &mut frames), Ok(0));

        // Neither the sender nor the unregistered process got handlers.
        for pid in [sender_pid, silent_pid] {
            assert!(
                state.processes[&pid]
                    .threads
                    .values()
                    .all(|thread| !thread.is_ipc_handler)
            );
        }
    }

    #[test]
    fn test_targeted_signal_reaches_one_process() {
        let mut frames = TestFrames::new();
        let mut state = fresh_state(&mut frames);
        let (_, sender) = spawn_process_with_thread(&mut state, &mut frames);
        let (first_pid, _) = spawn_process_with_thread(&mut state, &mut frames);
        let (second_pid, _) = spawn_process_with_thread(&mut state, &mut frames);
        register(&mut state, first_pid, "a", 0x10_0000);
        register(&mut state, second_pid, "b", 0x20_0000);

        let data = TargetedSignalData { target_pid: second_pid, iid: 7, sid: 8 };
        assert_eq!(targeted_signal(&mut state, sender, &data, &mut frames), Ok(0));

        assert!(
            state.processes[&first_pid]
                .threads
                .values()
                .all(|thread| !thread.is_ipc_handler)
        );
        assert!(
            state.processes[&second_pid]
                .threads
                .values()
                .any(|thread| thread.is_ipc_handler)
        );
    }

    #[test]
    fn test_name_service_register_find_unregister() {
        let mut frames = TestFrames::new();
        let mut state = fresh_state(&mut frames);
        let (pid, key) = spawn_process_with_thread(&mut state, &mut frames);

        // RegisterDestination("svc", entry)
        push(&mut state, key, IpcParam::Array(Vec::from(&b"svc"[..]))).unwrap();
        push(&mut state, key, IpcParam::Primitive(0x55_0000)).unwrap();
        let registered = kernel_method(&mut state, key, 1, 1).unwrap();
        assert_eq!(registered, pid as i64);
        assert_eq!(state.processes[&pid].ipc_entry, Some(0x55_0000));
        assert!(state.thread(key).unwrap().ipc_args.is_empty());

        // FindDestination("svc") from any other process
        let (_, other) = spawn_process_with_thread(&mut state, &mut frames);
        push(&mut state, other, IpcParam::Array(Vec::from(&b"svc"[..]))).unwrap();
        assert_eq!(kernel_method(&mut state, other, 1, 0).unwrap(), pid as i64);

        // Re-registration overwrites name and entry.
        push(&mut state, key, IpcParam::Array(Vec::from(&b"svc2"[..]))).unwrap();
        push(&mut state, key, IpcParam::Primitive(0x66_0000)).unwrap();
        assert_eq!(kernel_method(&mut state, key, 1, 1).unwrap(), pid as i64);
        assert_eq!(state.services.len(), 1);
        assert_eq!(state.services[&pid].name, "svc2");

        // UnregisterDestination
        push(&mut state, other, IpcParam::Array(Vec::from(&b"svc2"[..]))).unwrap();
        assert_eq!(kernel_method(&mut state, other, 1, 2).unwrap(), 0);
        push(&mut state, other, IpcParam::Array(Vec::from(&b"svc2"[..]))).unwrap();
        assert_eq!(kernel_method(&mut state, other, 1, 2).unwrap(), -1);
    }

    #[test]
    fn test_local_name_service_lookups() {
        let mut frames = TestFrames::new();
        let mut state = fresh_state(&mut frames);
        let (_, key) = spawn_process_with_thread(&mut state, &mut frames);

        push(&mut state, key, IpcParam::Array(Vec::from(&b"GlobalNameService"[..]))).unwrap();
        assert_eq!(kernel_method(&mut state, key, 0, 0).unwrap(), 1);

        push(&mut state, key, IpcParam::Array(Vec::from(&b"NoSuchInterface"[..]))).unwrap();
        assert_eq!(kernel_method(&mut state, key, 0, 0).unwrap(), -1);

        // FindMethod(iid=1, "RegisterDestination")
        push(&mut state, key, IpcParam::Primitive(1)).unwrap();
        push(&mut state, key, IpcParam::Array(Vec::from(&b"RegisterDestination"[..]))).unwrap();
        assert_eq!(kernel_method(&mut state, key, 0, 1).unwrap(), 1);
        assert!(state.thread(key).unwrap().ipc_args.is_empty());
    }

    #[test]
    fn test_type_mismatch_leaves_stack_unchanged() {
        let mut frames = TestFrames::new();
        let mut state = fresh_state(&mut frames);
        let (_, key) = spawn_process_with_thread(&mut state, &mut frames);

        push(&mut state, key, IpcParam::Primitive(1)).unwrap();
        assert_eq!(
            kernel_method(&mut state, key, 0, 0),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(state.thread(key).unwrap().ipc_args.len(), 1);

        assert_eq!(
            kernel_method(&mut state, key, 9, 9),
            Err(KernelError::Unsupported)
        );
    }

    #[test]
    fn test_handler_stack_size_is_real() {
        // Guard against the stack placement accidentally colliding for
        // handler threads: two handlers in one process get distinct
        // stacks.
        let mut frames = TestFrames::new();
        let mut state = fresh_state(&mut frames);
        let (_, caller) = spawn_process_with_thread(&mut state, &mut frames);
        let (target_pid, _) = spawn_process_with_thread(&mut state, &mut frames);
        register(&mut state, target_pid, "svc", 0x10_0000);

        let data = MethodData { target_pid, iid: 0, mid: 0 };
        method(&mut state, caller, &data, &mut frames).unwrap();
        method(&mut state, caller, &data, &mut frames).unwrap();

        let tops: Vec<u64> = state.processes[&target_pid]
            .threads
            .values()
            .filter(|thread| thread.is_ipc_handler)
            .map(|thread| thread.user_stack_top)
            .collect();
        assert_eq!(tops.len(), 2);
        assert_ne!(tops[0], tops[1]);
        assert_eq!((tops[0] as i64 - tops[1] as i64).unsigned_abs() as usize, STACK_SIZE);
    }
}
