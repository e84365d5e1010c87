//! SMP start-up
//!
//! Bring the application processors out of their firmware parking spot
//! one at a time: allocate a kernel stack, point the launch slots at
//! [`ap_main`], kick the core (INIT/SIPI on x86_64, PSCI `CPU_ON` on
//! AArch64) and wait for its ready signal. Every core ends up with its
//! descriptor tables loaded, its local interrupt controller and timer
//! running, interrupts enabled, and halts until the scheduler hands it
//! a thread.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use kite_common::boot::BootInfo;
use kite_common::memory::page;

use crate::memory::frame;
use crate::task;

/// Pages per kernel stack (boot core and APs alike).
pub const KERNEL_STACK_PAGES: usize = 4;

/// Set by each AP once it is fully up.
static AP_READY: AtomicBool = AtomicBool::new(false);

/// Stack top for the AP currently being launched; APs start strictly
/// one at a time.
static AP_STACK_TOP: AtomicU64 = AtomicU64::new(0);

/// Bounded wait for the launching AP.
fn wait_for_ap() -> bool {
    for _ in 0..50_000_000u64 {
        if AP_READY.load(Ordering::Acquire) {
            return true;
        }
        core::hint::spin_loop();
    }
    false
}

/// Allocate a kernel stack and return its top, or `None` when memory is
/// exhausted.
fn allocate_stack() -> Option<u64> {
    let base = frame::with(|f| f.alloc_frames(KERNEL_STACK_PAGES))?;
    Some(base + (KERNEL_STACK_PAGES * page::SIZE_4K) as u64)
}

/// Entry point every secondary core reaches with its kernel index.
extern "C" fn ap_main(core_id: u64) -> ! {
    let stack_top = AP_STACK_TOP.load(Ordering::Acquire);

    // SAFETY: One-time bring-up of this core, stack handed over by the
    // launcher.
    unsafe {
        kite_arch::native::init_core(core_id as usize, stack_top);
        task::init_core(core_id as usize, stack_top);
    }

    #[cfg(target_arch = "x86_64")]
    {
        kite_arch::native::apic::enable_local();
        kite_arch::native::apic::timer_start();
    }
    #[cfg(target_arch = "aarch64")]
    {
        kite_arch::native::gic::enable_local();
        kite_arch::native::timer::start();
    }

    log::info!("core {} online", core_id);
    AP_READY.store(true, Ordering::Release);

    kite_arch::cpu::enable_interrupts();
    loop {
        kite_arch::cpu::wait_for_interrupt();
    }
}

/// Discover and start the application processors, then start the boot
/// core's own timer.
///
/// # Safety
///
/// Memory, filesystem and the boot core's descriptor tables must be up;
/// interrupts must still be masked on the boot core.
#[cfg(target_arch = "x86_64")]
pub unsafe fn init(boot_info: &BootInfo) {
    use kite_arch::native::apic;

    // SAFETY: The boot record carries the firmware tables.
    let madt = unsafe { crate::acpi::find_madt(boot_info) };
    let Some(madt) = madt else {
        log::warn!("no MADT found; staying single-core");
        apic::set_base(0xFEE0_0000);
        apic::enable_local();
        apic::timer_start();
        return;
    };

    apic::set_base(madt.lapic_base);
    apic::enable_local();

    // SAFETY: The boot root identity-maps the trampoline page.
    unsafe {
        apic::install_trampoline(crate::memory::boot_root());
    }

    let bsp = apic::local_id();
    let mut core_id = 1u64;
    for &apic_id in madt.apic_ids.iter().filter(|&&id| id as u32 != bsp) {
        if core_id as usize >= task::MAX_CORES {
            log::warn!("ignoring further processors past core {}", core_id - 1);
            break;
        }
        let Some(stack_top) = allocate_stack() else {
            log::warn!("no memory for core {} stack", core_id);
            break;
        };

        AP_READY.store(false, Ordering::Release);
        AP_STACK_TOP.store(stack_top, Ordering::Release);
        // SAFETY: Trampoline installed; the slots belong to this launch.
        unsafe {
            apic::set_ap_launch(stack_top, core_id, ap_main);
            apic::start_ap(apic_id as u32);
        }

        if wait_for_ap() {
            core_id += 1;
        } else {
            log::warn!("apic id {} did not come online", apic_id);
        }
    }

    log::info!("{} core(s) running", core_id);
    apic::timer_start();
}

/// Discover and start the application processors, then start the boot
/// core's own timer.
///
/// # Safety
///
/// As for the x86_64 variant.
#[cfg(target_arch = "aarch64")]
pub unsafe fn init(_boot_info: &BootInfo) {
    use kite_arch::native::{gic, psci, timer};

    // SAFETY: The GIC sits at its platform addresses, mapped by boot.
    unsafe {
        gic::init(None, None);
    }
    gic::enable_local();

    let mut core_id = 1u64;
    // MPIDR affinity values are sequential on the platforms we boot.
    for target in 1..task::MAX_CORES as u64 {
        let Some(stack_top) = allocate_stack() else {
            break;
        };

        AP_READY.store(false, Ordering::Release);
        AP_STACK_TOP.store(stack_top, Ordering::Release);

        let launch = alloc::boxed::Box::leak(alloc::boxed::Box::new(psci::ApLaunch {
            stack_top,
            core_id,
            entry: ap_main as usize as u64,
        }));

        // SAFETY: The launch block is leaked and the pad is kernel text.
        match unsafe { psci::cpu_on(target, launch) } {
            Ok(()) => {
                if wait_for_ap() {
                    core_id += 1;
                } else {
                    log::warn!("core {} did not come online", target);
                }
            }
            Err(err) => {
                log::debug!("cpu_on({}) refused: {:?}", target, err);
                frame::with(|f| {
                    f.free_frames(stack_top - (KERNEL_STACK_PAGES * page::SIZE_4K) as u64,
                        KERNEL_STACK_PAGES)
                });
                break;
            }
        }
    }

    log::info!("{} core(s) running", core_id);
    timer::start();
}
