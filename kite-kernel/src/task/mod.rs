//! Processes, threads and the scheduler
//!
//! One global [`TaskState`] behind the task lock holds every process,
//! the FIFO ready queue and the service table; per-core state lives in
//! [`CoreBase`], reachable in O(1) from any kernel entry through the
//! architecture's core-local register. Scheduling is strict round-robin:
//! each timer tick rotates exactly one thread, and
//! [`TaskState::switch`] is the only place that changes any core's
//! current thread.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use kite_arch::{InterruptFrame, IrqSpinMutex, cpu};
use kite_common::memory::page;
use kite_paging::arch::NativeTlb;
use kite_paging::{AddressSpace, FrameSource, KERNEL_BASE, TlbInvalidate};
use kite_syscall::KernelError;

use crate::elf::{self, ImageRef};
use crate::fs::Vfs;
use crate::ipc::IpcParam;
use crate::memory::KernelFrames;

/// Pages per user stack.
pub const STACK_PAGES: usize = 4;
/// Bytes per user stack.
pub const STACK_SIZE: usize = STACK_PAGES * page::SIZE_4K;

/// Process identifier; pid 0 addresses the kernel itself in IPC.
pub type Pid = u64;
/// Thread identifier, unique within its process.
pub type Tid = u64;

/// Global handle to one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadKey {
    pub pid: Pid,
    pub tid: Tid,
}

/// One thread: its saved context, user stack and IPC argument stack.
pub struct Thread {
    pub id: Tid,
    /// Reaped by the next scheduler pass once set.
    pub exiting: bool,
    /// Created by METHOD/SIGNAL dispatch; owns the argument stack that
    /// was moved or copied into it.
    pub is_ipc_handler: bool,
    pub user_stack_top: u64,
    /// The full saved register state the scheduler swaps in and out.
    pub context: Box<InterruptFrame>,
    /// The kernel-owned IPC argument stack.
    pub ipc_args: Vec<IpcParam>,
}

/// One process: an address space, an executable image, threads and the
/// parent/child tree.
pub struct Process {
    pub id: Pid,
    pub image: Option<ImageRef>,
    pub space: AddressSpace,
    /// Entry point handler threads start at, set by
    /// RegisterDestination.
    pub ipc_entry: Option<u64>,
    pub threads: BTreeMap<Tid, Thread>,
    pub next_tid: Tid,
    pub parent: Option<Pid>,
    pub children: Vec<Pid>,
}

/// A row in the service table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub name: String,
    pub entry: u64,
}

/// Everything the task lock guards.
pub struct TaskState {
    pub processes: BTreeMap<Pid, Process>,
    /// FIFO ready queue; pop at the head, append at the tail.
    pub ready: VecDeque<ThreadKey>,
    /// `pid -> (name, entry)` consulted by the global name service.
    pub services: BTreeMap<Pid, ServiceEntry>,
    /// Root of the kernel's own address space; the kernel half of every
    /// process aliases it.
    pub kernel_root: u64,
    next_pid: Pid,
    /// Scheduling stays off until boot flips this; the first tick after
    /// that performs the first context switch.
    pub enabled: bool,
}

impl TaskState {
    /// Empty state; the kernel root is filled in during boot.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            processes: BTreeMap::new(),
            ready: VecDeque::new(),
            services: BTreeMap::new(),
            kernel_root: 0,
            next_pid: 1,
            enabled: false,
        }
    }

    fn allocate_pid(&mut self) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    /// Look a thread up.
    #[must_use]
    pub fn thread(&self, key: ThreadKey) -> Option<&Thread> {
        self.processes.get(&key.pid)?.threads.get(&key.tid)
    }

    /// Look a thread up mutably.
    pub fn thread_mut(&mut self, key: ThreadKey) -> Option<&mut Thread> {
        self.processes.get_mut(&key.pid)?.threads.get_mut(&key.tid)
    }

    /// Create a process around an already-built address space and
    /// image, without any thread yet.
    pub fn create_process(
        &mut self,
        space: AddressSpace,
        image: Option<ImageRef>,
        parent: Option<Pid>,
    ) -> Pid {
        let pid = self.allocate_pid();
        self.processes.insert(
            pid,
            Process {
                id: pid,
                image,
                space,
                ipc_entry: None,
                threads: BTreeMap::new(),
                next_tid: 1,
                parent,
                children: Vec::new(),
            },
        );
        if let Some(parent) = parent
            && let Some(parent_proc) = self.processes.get_mut(&parent)
        {
            parent_proc.children.push(pid);
        }
        pid
    }

    /// Create a thread in `pid`: a fresh tid, a user stack parked just
    /// below the kernel half, and a user-mode frame at `entry`. The
    /// thread is appended to the ready queue.
    pub fn new_thread(
        &mut self,
        pid: Pid,
        entry: u64,
        is_ipc_handler: bool,
        frames: &mut impl FrameSource,
    ) -> Result<ThreadKey, KernelError> {
        let process = self.processes.get_mut(&pid).ok_or(KernelError::NotFound)?;

        let tid = process.next_tid;
        process.next_tid += 1;

        let run = match frames.allocate_contiguous(STACK_PAGES) {
            Some(run) => run,
            None => {
                process.next_tid -= 1;
                return Err(KernelError::OutOfMemory);
            }
        };
        let stack_base = KERNEL_BASE - (STACK_SIZE as u64) * tid;
        for index in 0..STACK_PAGES {
            let offset = (index * page::SIZE_4K) as u64;
            let mapped = process.space.map(
                stack_base + offset,
                run + offset,
                kite_paging::PageFlags::USER_WRITE,
                frames,
            );
            if mapped.is_err() {
                // Undo the partial stack before reporting.
                for unwind in 0..index {
                    let offset = (unwind * page::SIZE_4K) as u64;
                    process.space.unmap(
                        stack_base + offset,
                        frames,
                        &kite_paging::NoOpInvalidator,
                    );
                }
                for unmapped in index..STACK_PAGES {
                    frames.release_frame(run + (unmapped * page::SIZE_4K) as u64);
                }
                process.next_tid -= 1;
                return Err(KernelError::OutOfMemory);
            }
        }

        let stack_top = stack_base + STACK_SIZE as u64;
        process.threads.insert(
            tid,
            Thread {
                id: tid,
                exiting: false,
                is_ipc_handler,
                user_stack_top: stack_top,
                context: Box::new(InterruptFrame::user(entry, stack_top)),
                ipc_args: Vec::new(),
            },
        );

        let key = ThreadKey { pid, tid };
        self.ready.push_back(key);
        Ok(key)
    }

    /// Remove a thread: off the ready queue, out of its process, its
    /// stack frames released. The argument stack drops with the thread;
    /// a handler thread owns the stack that was moved into it, so the
    /// single drop covers both cases.
    pub fn delete_thread(
        &mut self,
        key: ThreadKey,
        frames: &mut impl FrameSource,
        tlb: &impl TlbInvalidate,
    ) {
        self.ready.retain(|queued| *queued != key);
        let Some(process) = self.processes.get_mut(&key.pid) else {
            return;
        };
        let Some(thread) = process.threads.remove(&key.tid) else {
            return;
        };

        let stack_base = thread.user_stack_top - STACK_SIZE as u64;
        for index in 0..STACK_PAGES {
            process
                .space
                .unmap(stack_base + (index * page::SIZE_4K) as u64, frames, tlb);
        }
    }

    /// Destroy a process: every thread, every descendant, then the
    /// address space.
    pub fn delete_process(
        &mut self,
        pid: Pid,
        frames: &mut impl FrameSource,
        tlb: &impl TlbInvalidate,
    ) {
        let Some(mut process) = self.processes.remove(&pid) else {
            return;
        };

        for (tid, thread) in core::mem::take(&mut process.threads) {
            let key = ThreadKey { pid, tid };
            self.ready.retain(|queued| *queued != key);
            let stack_base = thread.user_stack_top - STACK_SIZE as u64;
            for index in 0..STACK_PAGES {
                process
                    .space
                    .unmap(stack_base + (index * page::SIZE_4K) as u64, frames, tlb);
            }
        }

        for child in core::mem::take(&mut process.children) {
            self.delete_process(child, frames, tlb);
        }

        self.services.remove(&pid);
        if let Some(parent) = process.parent
            && let Some(parent_proc) = self.processes.get_mut(&parent)
        {
            parent_proc.children.retain(|&child| child != pid);
        }

        process.space.teardown(frames);
    }

    /// Fork the process owning `caller` into a child.
    ///
    /// The child gets a fresh root with the kernel half aliased, a
    /// copy-on-write clone of the user portion, the shared image, and a
    /// mirror of the calling thread (tid 1, identical saved context, the
    /// same stack addresses now tagged copy-on-write, an empty argument
    /// stack).
    pub fn fork(
        &mut self,
        caller: ThreadKey,
        frames: &mut impl FrameSource,
        tlb: &impl TlbInvalidate,
    ) -> Result<Pid, KernelError> {
        let kernel_root = self.kernel_root;
        let parent = self.processes.get(&caller.pid).ok_or(KernelError::NotFound)?;
        let thread = parent.threads.get(&caller.tid).ok_or(KernelError::NotFound)?;

        let child_space = AddressSpace::new(frames).ok_or(KernelError::OutOfMemory)?;
        AddressSpace::from_root(kernel_root)
            .clone_higher_half_into(&child_space, frames)
            .map_err(|_| KernelError::OutOfMemory)?;
        parent
            .space
            .fork_cow_into(&child_space, frames, tlb)
            .map_err(|_| KernelError::OutOfMemory)?;

        let image = parent.image.clone();
        let ipc_entry = parent.ipc_entry;
        let context = thread.context.clone();
        let user_stack_top = thread.user_stack_top;

        let child_pid = self.create_process(child_space, image, Some(caller.pid));
        let child = self.processes.get_mut(&child_pid).expect("child process vanished");
        child.ipc_entry = ipc_entry;

        let tid = child.next_tid;
        child.next_tid += 1;
        child.threads.insert(
            tid,
            Thread {
                id: tid,
                exiting: false,
                is_ipc_handler: false,
                user_stack_top,
                context,
                ipc_args: Vec::new(),
            },
        );

        self.ready.push_back(ThreadKey { pid: child_pid, tid });
        Ok(child_pid)
    }

    /// Replace the process image of `caller`'s process with the
    /// executable at `path`.
    ///
    /// Fails with `NotFound` or `InvalidElf` before touching any state.
    /// On success every other thread is gone, the calling thread is tid
    /// 1 on a fresh stack, and the process runs `path`'s image in a
    /// fresh address space. Returns the caller's new key and the new
    /// root for the wrapper to install.
    pub fn exec(
        &mut self,
        vfs: &Vfs,
        caller: ThreadKey,
        path: &str,
        frames: &mut impl FrameSource,
        tlb: &impl TlbInvalidate,
    ) -> Result<(ThreadKey, u64), KernelError> {
        let mut handle = vfs.find_node(path).map_err(|_| KernelError::NotFound)?;
        elf::read_header(vfs, &mut handle).map_err(|_| KernelError::InvalidElf)?;

        if self.thread(caller).is_none() {
            return Err(KernelError::NotFound);
        }

        // Past this point failure means out-of-memory; the half-built
        // process cannot keep running, so it is destroyed instead of
        // left in between images.
        match self.exec_rebuild(vfs, &mut handle, caller, frames, tlb) {
            Ok(result) => Ok(result),
            Err(err) => {
                self.delete_process(caller.pid, frames, tlb);
                Err(err)
            }
        }
    }

    /// The destructive tail of [`exec`]: strip the process to the
    /// calling thread, swap the address space, load the image, rebuild
    /// the thread.
    fn exec_rebuild(
        &mut self,
        vfs: &Vfs,
        handle: &mut crate::fs::FileHandle,
        caller: ThreadKey,
        frames: &mut impl FrameSource,
        tlb: &impl TlbInvalidate,
    ) -> Result<(ThreadKey, u64), KernelError> {
        let kernel_root = self.kernel_root;

        let others: Vec<Tid> = self.processes[&caller.pid]
            .threads
            .keys()
            .copied()
            .filter(|&tid| tid != caller.tid)
            .collect();
        for tid in others {
            self.delete_thread(ThreadKey { pid: caller.pid, tid }, frames, tlb);
        }

        let process = self.processes.get_mut(&caller.pid).expect("caller process vanished");
        let mut thread = process.threads.remove(&caller.tid).expect("caller thread vanished");
        self.ready.retain(|queued| *queued != caller);

        thread.id = 1;
        process.next_tid = 2;
        thread.ipc_args.clear();

        let stack_base = thread.user_stack_top - STACK_SIZE as u64;
        for index in 0..STACK_PAGES {
            process
                .space
                .unmap(stack_base + (index * page::SIZE_4K) as u64, frames, tlb);
        }

        let old_space = process.space;
        let fresh = AddressSpace::new(frames).ok_or(KernelError::OutOfMemory)?;
        AddressSpace::from_root(kernel_root)
            .clone_higher_half_into(&fresh, frames)
            .map_err(|_| KernelError::OutOfMemory)?;
        process.space = fresh;
        old_space.teardown(frames);

        let image = elf::load::<kite_paging::arch::Native, _>(vfs, handle, fresh.root(), frames)
            .map_err(|err| match err {
                elf::ElfError::OutOfMemory => KernelError::OutOfMemory,
                elf::ElfError::InvalidElf => KernelError::InvalidElf,
            })?;

        let entry = image.entry;
        let process = self.processes.get_mut(&caller.pid).expect("caller process vanished");
        process.image = Some(Arc::new(image));
        process.threads.insert(1, thread);

        let key = self.rebuild_thread_stack(caller.pid, entry, frames)?;
        Ok((key, fresh.root()))
    }

    /// Give the surviving exec thread (tid 1) a fresh stack and a frame
    /// landing at the new entry point.
    fn rebuild_thread_stack(
        &mut self,
        pid: Pid,
        entry: u64,
        frames: &mut impl FrameSource,
    ) -> Result<ThreadKey, KernelError> {
        let run = frames
            .allocate_contiguous(STACK_PAGES)
            .ok_or(KernelError::OutOfMemory)?;
        let stack_base = KERNEL_BASE - STACK_SIZE as u64;

        let process = self.processes.get_mut(&pid).ok_or(KernelError::NotFound)?;
        for index in 0..STACK_PAGES {
            let offset = (index * page::SIZE_4K) as u64;
            process
                .space
                .map(
                    stack_base + offset,
                    run + offset,
                    kite_paging::PageFlags::USER_WRITE,
                    frames,
                )
                .map_err(|_| KernelError::OutOfMemory)?;
        }

        let thread = process.threads.get_mut(&1).ok_or(KernelError::NotFound)?;
        thread.user_stack_top = stack_base + STACK_SIZE as u64;
        *thread.context = InterruptFrame::user(entry, thread.user_stack_top);
        Ok(ThreadKey { pid, tid: 1 })
    }

    /// The scheduler pass, run on every timer tick and explicit yield.
    ///
    /// Reaps an exiting current thread; otherwise saves its context and
    /// rotates it to the tail. Pops the head of the queue as the new
    /// current thread and returns its address-space root for the caller
    /// to install. With nothing to run and no current thread, the frame
    /// becomes a synthetic idle frame resuming `idle_entry`.
    pub fn switch(
        &mut self,
        core: &mut CoreBase,
        frame: &mut InterruptFrame,
        idle_entry: u64,
        frames: &mut impl FrameSource,
        tlb: &impl TlbInvalidate,
    ) -> Option<u64> {
        if let Some(current) = core.current {
            let gone = match self.thread(current) {
                Some(thread) => thread.exiting,
                None => true,
            };
            if gone {
                self.delete_thread(current, frames, tlb);
                core.current = None;
            }
        }

        if !self.ready.is_empty() {
            if let Some(current) = core.current {
                if let Some(thread) = self.thread_mut(current) {
                    *thread.context = *frame;
                }
                self.ready.push_back(current);
            }
            if let Some(next) = self.ready.pop_front() {
                let root = self.processes[&next.pid].space.root();
                *frame = *self.thread(next).expect("queued thread vanished").context;
                core.current = Some(next);
                return Some(root);
            }
        } else if core.current.is_none() {
            *frame = InterruptFrame::kernel(idle_entry, core.kernel_stack_top);
        }

        None
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

// -- Per-core state

/// Upper bound on cores the per-core storage supports.
pub const MAX_CORES: usize = 16;

/// Per-core scratch state; the architecture's core-local register points
/// at this, and the syscall entry path reads the two stack slots by
/// fixed offset.
#[derive(Debug)]
#[repr(C)]
pub struct CoreBase {
    pub core_id: u64,
    pub kernel_stack_top: u64,
    pub saved_user_stack: u64,
    /// `None` while this core idles.
    pub current: Option<ThreadKey>,
}

const _: () = {
    assert!(
        core::mem::offset_of!(CoreBase, kernel_stack_top)
            == kite_arch::CORE_LOCAL_KERNEL_STACK_OFFSET
    );
    assert!(
        core::mem::offset_of!(CoreBase, saved_user_stack)
            == kite_arch::CORE_LOCAL_USER_STACK_OFFSET
    );
};

impl CoreBase {
    /// Fresh state for one core.
    #[must_use]
    pub const fn new(core_id: u64, kernel_stack_top: u64) -> Self {
        Self {
            core_id,
            kernel_stack_top,
            saved_user_stack: 0,
            current: None,
        }
    }
}

struct CoreSlot(core::cell::UnsafeCell<CoreBase>);

// SAFETY: Each slot is only ever touched by its own core.
unsafe impl Sync for CoreSlot {}

static CORE_BASES: [CoreSlot; MAX_CORES] =
    [const { CoreSlot(core::cell::UnsafeCell::new(CoreBase::new(0, 0))) }; MAX_CORES];

/// Install this core's [`CoreBase`] and point the core-local register at
/// it.
///
/// # Safety
///
/// Call once per core, with that core's real kernel stack top, before
/// the core can take interrupts or syscalls.
pub unsafe fn init_core(core_id: usize, kernel_stack_top: u64) {
    assert!(core_id < MAX_CORES, "core id {} exceeds per-core storage", core_id);
    let slot = CORE_BASES[core_id].0.get();
    // SAFETY: This core's slot, before any concurrent access.
    unsafe {
        *slot = CoreBase::new(core_id as u64, kernel_stack_top);
        cpu::set_core_local_ptr(slot as *mut u8);
    }
}

/// This core's [`CoreBase`].
///
/// # Panics
///
/// Panics before [`init_core`].
#[must_use]
pub fn core_base() -> &'static mut CoreBase {
    let ptr = cpu::core_local_ptr() as *mut CoreBase;
    assert!(!ptr.is_null(), "core base accessed before init");
    // SAFETY: Only the owning core reaches its slot through the
    // core-local register.
    unsafe { &mut *ptr }
}

// -- Global scheduler entry points

static TASKS: IrqSpinMutex<TaskState> = IrqSpinMutex::new(TaskState::new());

/// Run `f` under the task lock.
pub fn with_tasks<R>(f: impl FnOnce(&mut TaskState) -> R) -> R {
    f(&mut TASKS.lock())
}

/// The key of the thread running on this core.
#[must_use]
pub fn current_thread_key() -> Option<ThreadKey> {
    core_base().current
}

/// Run `f` against the current thread's address space.
pub fn with_current_space<R>(f: impl FnOnce(&AddressSpace) -> R) -> Option<R> {
    let key = current_thread_key()?;
    let guard = TASKS.lock();
    let space = &guard.processes.get(&key.pid)?.space;
    Some(f(space))
}

/// The per-core idle loop, resumed through the synthetic idle frame.
extern "C" fn idle_loop() -> ! {
    loop {
        cpu::wait_for_interrupt();
    }
}

/// Load `/init` into a fresh process with a single thread, ready to run
/// once scheduling is enabled.
///
/// # Panics
///
/// Panics when `/init` is missing or malformed, which halts the boot.
pub fn init() {
    crate::fs::with_vfs(|vfs| {
        let mut state = TASKS.lock();
        state.kernel_root = crate::memory::boot_root();
        let kernel_root = state.kernel_root;

        let mut frames = KernelFrames;
        let space = AddressSpace::new(&mut frames).expect("no memory for the init address space");
        AddressSpace::from_root(kernel_root)
            .clone_higher_half_into(&space, &mut frames)
            .expect("no memory for the init kernel half");

        let mut handle = vfs.find_node("/init").expect("initrd has no /init");
        let image = elf::load::<kite_paging::arch::Native, _>(
            vfs,
            &mut handle,
            space.root(),
            &mut frames,
        )
        .expect("/init is not a loadable executable");

        let entry = image.entry;
        let pid = state.create_process(space, Some(Arc::new(image)), None);
        state
            .new_thread(pid, entry, false, &mut frames)
            .expect("no memory for the init thread");

        log::info!("init process ready (pid {})", pid);
    });
}

/// Start scheduling; the next timer tick performs the first switch.
pub fn enable() {
    TASKS.lock().enabled = true;
}

/// Timer-tick entry: rotate this core to the next runnable thread.
pub fn timer_tick(frame: &mut InterruptFrame) {
    let mut state = TASKS.lock();
    if !state.enabled {
        return;
    }

    let core = core_base();
    let root = state.switch(core, frame, idle_loop as usize as u64, &mut KernelFrames, &NativeTlb);
    if let Some(root) = root {
        // SAFETY: The root came from a live process whose kernel half
        // aliases the boot tables mapping this code.
        unsafe { AddressSpace::from_root(root).make_current() };
    }
}

/// Mark the current thread as exiting and reschedule immediately.
pub fn exit_current(frame: &mut InterruptFrame) {
    let mut state = TASKS.lock();

    let core = core_base();
    if let Some(key) = core.current
        && let Some(thread) = state.thread_mut(key)
    {
        thread.exiting = true;
    }

    let root = state.switch(core, frame, idle_loop as usize as u64, &mut KernelFrames, &NativeTlb);
    if let Some(root) = root {
        // SAFETY: As in `timer_tick`.
        unsafe { AddressSpace::from_root(root).make_current() };
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::fs::FsDriver;
    use crate::fs::ramfs::RamFs;
    use crate::testutil::{self, TestFrames};
    use kite_paging::arch::x86_64::X86_64;
    use kite_paging::{NoOpInvalidator, PageFlags, space};
    use std::vec::Vec;

    const IDLE: u64 = 0xFFFF_FFFF_F900_0000;

    fn fresh_state(frames: &mut TestFrames) -> TaskState {
        let mut state = TaskState::new();
        state.kernel_root = space::create_table(frames).unwrap();
        // A token kernel mapping so the higher-half clone has substance.
        let kernel_page = testutil::fake_pages(1);
        space::map::<X86_64, _>(
            state.kernel_root,
            KERNEL_BASE,
            kernel_page,
            PageFlags::KERNEL_WRITE,
            frames,
        )
        .unwrap();
        state
    }

    fn spawn_process(state: &mut TaskState, frames: &mut TestFrames) -> Pid {
        let space = AddressSpace::new(frames).unwrap();
        AddressSpace::from_root(state.kernel_root)
            .clone_higher_half_into(&space, frames)
            .unwrap();
        state.create_process(space, None, None)
    }

    #[test]
    fn test_new_thread_builds_stack_below_kernel_base() {
        let mut frames = TestFrames::new();
        let mut state = fresh_state(&mut frames);
        let pid = spawn_process(&mut state, &mut frames);

        let key = state.new_thread(pid, 0x40_0000, false, &mut frames).unwrap();
        assert_eq!(key, ThreadKey { pid, tid: 1 });
        assert_eq!(state.ready.len(), 1);

        let thread = state.thread(key).unwrap();
        assert_eq!(thread.user_stack_top, KERNEL_BASE);
        assert_eq!(thread.context.instruction_pointer(), 0x40_0000);
        assert_eq!(thread.context.stack_pointer(), KERNEL_BASE);

        let space = &state.processes[&pid].space;
        for index in 0..STACK_PAGES as u64 {
            let va = KERNEL_BASE - STACK_SIZE as u64 + index * page::SIZE_4K as u64;
            let (_, flags) = space.translate(va).unwrap();
            assert_eq!(flags, PageFlags::USER_WRITE);
        }

        // A second thread's stack stacks below the first.
        let second = state.new_thread(pid, 0x40_0000, false, &mut frames).unwrap();
        let thread = state.thread(second).unwrap();
        assert_eq!(thread.user_stack_top, KERNEL_BASE - STACK_SIZE as u64);
    }

    #[test]
    fn test_switch_rotates_round_robin() {
        let mut frames = TestFrames::new();
        let mut state = fresh_state(&mut frames);
        let pid = spawn_process(&mut state, &mut frames);
        let first = state.new_thread(pid, 0x1000, false, &mut frames).unwrap();
        let second = state.new_thread(pid, 0x2000, false, &mut frames).unwrap();

        let mut core = CoreBase::new(0, 0xFFFF_8000_0000_0000);
        let mut frame = InterruptFrame::default();

        // First tick: the head of the queue runs.
        let root = state.switch(&mut core, &mut frame, IDLE, &mut frames, &NoOpInvalidator);
        assert_eq!(root, Some(state.processes[&pid].space.root()));
        assert_eq!(core.current, Some(first));
        assert_eq!(frame.instruction_pointer(), 0x1000);
        assert_eq!(state.ready.len(), 1);

        // Second tick: the current thread rotates to the tail with its
        // context captured, and the second thread comes in.
        frame.rax = 0xAB;
        state.switch(&mut core, &mut frame, IDLE, &mut frames, &NoOpInvalidator);
        assert_eq!(core.current, Some(second));
        assert_eq!(frame.instruction_pointer(), 0x2000);
        assert_eq!(state.thread(first).unwrap().context.rax, 0xAB);

        // Third tick: back to the first, with its saved context.
        state.switch(&mut core, &mut frame, IDLE, &mut frames, &NoOpInvalidator);
        assert_eq!(core.current, Some(first));
        assert_eq!(frame.rax, 0xAB);

        // Every live thread is either current or queued.
        assert_eq!(state.ready.len() + 1, 2);
    }

    #[test]
    fn test_switch_installs_idle_frame_when_empty() {
        let mut frames = TestFrames::new();
        let mut state = fresh_state(&mut frames);

        let mut core = CoreBase::new(0, 0xFFFF_8000_0000_0000);
        let mut frame = InterruptFrame::default();

        let root = state.switch(&mut core, &mut frame, IDLE, &mut frames, &NoOpInvalidator);
        assert_eq!(root, None);
        assert_eq!(core.current, None);
        assert_eq!(frame.instruction_pointer(), IDLE);
        assert!(!frame.from_user());
        assert_eq!(frame.stack_pointer(), core.kernel_stack_top);
    }

    #[test]
    fn test_exiting_thread_is_reaped_on_switch() {
        let mut frames = TestFrames::new();
        let mut state = fresh_state(&mut frames);
        let pid = spawn_process(&mut state, &mut frames);
        let key = state.new_thread(pid, 0x1000, false, &mut frames).unwrap();

        let mut core = CoreBase::new(0, 0);
        let mut frame = InterruptFrame::default();
        state.switch(&mut core, &mut frame, IDLE, &mut frames, &NoOpInvalidator);
        assert_eq!(core.current, Some(key));

        state.thread_mut(key).unwrap().exiting = true;
        state.switch(&mut core, &mut frame, IDLE, &mut frames, &NoOpInvalidator);

        assert_eq!(core.current, None);
        assert!(state.thread(key).is_none());
        assert_eq!(frame.instruction_pointer(), IDLE);

        // The stack frames came back.
        let space = &state.processes[&pid].space;
        assert!(space.translate(KERNEL_BASE - page::SIZE_4K as u64).is_none());
    }

    #[test]
    fn test_fork_mirrors_thread_and_cow_state() {
        let mut frames = TestFrames::new();
        let mut state = fresh_state(&mut frames);
        let pid = spawn_process(&mut state, &mut frames);
        let key = state.new_thread(pid, 0x40_0000, false, &mut frames).unwrap();

        // A writable data page in the parent.
        let data = testutil::fake_pages(1);
        state.processes.get_mut(&pid).unwrap().space
            .map(0x50_0000, data, PageFlags::USER_WRITE, &mut frames)
            .unwrap();

        state.thread_mut(key).unwrap().context.rax = 0x1234;
        state.thread_mut(key).unwrap().ipc_args.push(IpcParam::Primitive(9));

        let child_pid = state.fork(key, &mut frames, &NoOpInvalidator).unwrap();
        let child_key = ThreadKey { pid: child_pid, tid: 1 };

        let child = &state.processes[&child_pid];
        assert_eq!(child.parent, Some(pid));
        assert!(state.processes[&pid].children.contains(&child_pid));

        let child_thread = state.thread(child_key).unwrap();
        assert_eq!(child_thread.context.rax, 0x1234);
        assert_eq!(
            child_thread.user_stack_top,
            state.thread(key).unwrap().user_stack_top
        );
        assert!(child_thread.ipc_args.is_empty());
        assert!(state.ready.contains(&child_key));

        // Both sides see the data page copy-on-write with refcount 2.
        for owner in [pid, child_pid] {
            let (pa, flags) = state.processes[&owner].space.translate(0x50_0000).unwrap();
            assert_eq!(pa, data);
            assert!(flags.cow);
            assert!(!flags.write);
        }
        assert_eq!(frames.refcount(data), 2);
    }

    #[test]
    fn test_fork_then_delete_child_restores_parent() {
        let mut frames = TestFrames::new();
        let mut state = fresh_state(&mut frames);
        let pid = spawn_process(&mut state, &mut frames);
        let key = state.new_thread(pid, 0x40_0000, false, &mut frames).unwrap();

        let data = testutil::fake_pages(1);
        state.processes.get_mut(&pid).unwrap().space
            .map(0x50_0000, data, PageFlags::USER_WRITE, &mut frames)
            .unwrap();

        let child_pid = state.fork(key, &mut frames, &NoOpInvalidator).unwrap();
        assert_eq!(frames.refcount(data), 2);

        state.delete_process(child_pid, &mut frames, &NoOpInvalidator);

        assert!(state.processes.get(&child_pid).is_none());
        assert!(!state.processes[&pid].children.contains(&child_pid));
        assert_eq!(frames.refcount(data), 1);
        assert!(state.processes[&pid].space.translate(0x50_0000).is_some());
        assert!(state.ready.iter().all(|queued| queued.pid != child_pid));
    }

    #[test]
    fn test_delete_process_destroys_descendants_first() {
        let mut frames = TestFrames::new();
        let mut state = fresh_state(&mut frames);
        let pid = spawn_process(&mut state, &mut frames);
        let key = state.new_thread(pid, 0x1000, false, &mut frames).unwrap();

        let child_pid = state.fork(key, &mut frames, &NoOpInvalidator).unwrap();
        let child_key = ThreadKey { pid: child_pid, tid: 1 };
        let grandchild_pid = state.fork(child_key, &mut frames, &NoOpInvalidator).unwrap();

        state.delete_process(pid, &mut frames, &NoOpInvalidator);

        assert!(state.processes.is_empty());
        assert!(state.ready.is_empty());
        assert!(state.processes.get(&grandchild_pid).is_none());
    }

    #[test]
    fn test_exec_replaces_image_and_threads() {
        let mut frames = TestFrames::new();
        let mut state = fresh_state(&mut frames);
        let pid = spawn_process(&mut state, &mut frames);
        let key = state.new_thread(pid, 0x1000, false, &mut frames).unwrap();
        let extra = state.new_thread(pid, 0x2000, false, &mut frames).unwrap();
        state.thread_mut(key).unwrap().ipc_args.push(IpcParam::Primitive(1));

        let image = testutil::build_elf(
            0x40_0080,
            &[testutil::Segment { vaddr: 0x40_0000, data: std::vec![0x90; 16], memsz: 0x1000 }],
        );
        let mut root_fs = RamFs::new();
        root_fs
            .mkfile(root_fs.root(), "hello", std::boxed::Box::leak(image.into_boxed_slice()))
            .unwrap();
        let mut vfs = Vfs::new();
        vfs.mount("/", std::boxed::Box::new(root_fs));

        let (new_key, new_root) =
            state.exec(&vfs, key, "/hello", &mut frames, &NoOpInvalidator).unwrap();
        assert_eq!(new_key, ThreadKey { pid, tid: 1 });

        let process = &state.processes[&pid];
        assert_eq!(process.space.root(), new_root);
        assert_eq!(process.threads.len(), 1);
        assert!(state.thread(extra).is_none());

        let thread = state.thread(new_key).unwrap();
        assert_eq!(thread.context.instruction_pointer(), 0x40_0080);
        assert!(thread.ipc_args.is_empty());
        assert_eq!(thread.user_stack_top, KERNEL_BASE);

        let (_, flags) = process.space.translate(0x40_0000).unwrap();
        assert_eq!(flags, PageFlags::USER_WRITE);
        assert_eq!(process.image.as_ref().unwrap().entry, 0x40_0080);
    }

    #[test]
    fn test_exec_bad_paths_leave_state_untouched() {
        let mut frames = TestFrames::new();
        let mut state = fresh_state(&mut frames);
        let pid = spawn_process(&mut state, &mut frames);
        let key = state.new_thread(pid, 0x1000, false, &mut frames).unwrap();
        let old_root = state.processes[&pid].space.root();

        let mut root_fs = RamFs::new();
        root_fs.mkfile(root_fs.root(), "junk", b"not an executable").unwrap();
        let mut vfs = Vfs::new();
        vfs.mount("/", std::boxed::Box::new(root_fs));

        assert_eq!(
            state.exec(&vfs, key, "/missing", &mut frames, &NoOpInvalidator).err(),
            Some(KernelError::NotFound)
        );
        assert_eq!(
            state.exec(&vfs, key, "/junk", &mut frames, &NoOpInvalidator).err(),
            Some(KernelError::InvalidElf)
        );

        assert_eq!(state.processes[&pid].space.root(), old_root);
        assert_eq!(state.processes[&pid].threads.len(), 1);
        assert!(state.thread(key).is_some());
        let keys: Vec<ThreadKey> = state.ready.iter().copied().collect();
        assert_eq!(keys, std::vec![key]);
    }
}
