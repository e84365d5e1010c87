//! Kite kernel binary
//!
//! Boot sequencing: console and logging first (the hello banner is the
//! first observable output), then the page-frame allocator, the heap,
//! the filesystem, this core's architecture state, the other cores, and
//! finally the scheduler with `/init` queued. The boot core then idles;
//! the first timer tick after enabling performs the first context
//! switch.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod boot {
    use core::fmt::Write;
    use core::panic::PanicInfo;

    use kite_arch::{console, cpu, hooks};
    use kite_common::boot::BootInfo;
    use kite_common::memory::page;
    use kite_kernel::memory::KernelAllocator;
    use kite_kernel::{fs, logging, memory, smp, syscall, task};

    #[global_allocator]
    static ALLOCATOR: KernelAllocator = KernelAllocator;

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        let _ = writeln!(console::ConsoleWriter, "\nkernel panic: {}", info);
        cpu::halt();
    }

    /// Kernel entry point called by the bootloader.
    ///
    /// # Safety
    ///
    /// The bootloader calls this exactly once with a valid `BootInfo`
    /// pointer, identity-mapped RAM and interrupts masked.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn _start(boot_info: *const BootInfo) -> ! {
        // SAFETY: The bootloader's contract.
        let boot_info = unsafe { &*boot_info };
        kernel_main(boot_info)
    }

    fn kernel_main(boot_info: &BootInfo) -> ! {
        console::init();
        console::puts("Hello world from KiteKernel!\n\n");
        logging::init();

        // SAFETY: Called once, with the bootloader's record, in order.
        unsafe {
            memory::init(boot_info);
            fs::init(boot_info);
        }
        log::info!("memory and filesystem ready");

        let kernel_stack = memory::frame::with(|f| f.alloc_frames(smp::KERNEL_STACK_PAGES))
            .expect("no memory for the boot core stack");
        let stack_top = kernel_stack + (smp::KERNEL_STACK_PAGES * page::SIZE_4K) as u64;

        // SAFETY: One-time bring-up of the boot core with a fresh stack.
        unsafe {
            kite_arch::native::init_core(0, stack_top);
            task::init_core(0, stack_top);
        }

        hooks::set_timer_tick(task::timer_tick);
        hooks::set_syscall(syscall::handle);
        hooks::set_page_fault(memory::fault::page_fault);
        hooks::set_fatal_fault(memory::fault::fatal_fault);
        log::info!("arch ready");

        // SAFETY: Memory, filesystem and this core's tables are up.
        unsafe {
            smp::init(boot_info);
        }

        task::init();
        task::enable();
        log::info!("scheduler enabled");

        cpu::enable_interrupts();
        loop {
            cpu::wait_for_interrupt();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
