//! Per-core descriptor tables
//!
//! Each core gets its own GDT and TSS so ring transitions land on that
//! core's kernel stack. The slot order is load-bearing: the STAR layout
//! used by `sysretq` derives the user selectors from base 0x18, which
//! pins user SS to 0x23 and user CS to 0x2B.

use spin::Once;
use x86_64::VirtAddr;
use x86_64::instructions::segmentation::{CS, SS, Segment};
use x86_64::instructions::tables::load_tss;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;

/// Kernel code selector.
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data selector.
pub const KERNEL_SS: u16 = 0x10;
/// Selector base programmed into STAR for `sysretq`.
pub const SYSRET_BASE: u16 = 0x18;
/// User data selector (RPL 3).
pub const USER_SS: u16 = 0x23;
/// User code selector (RPL 3).
pub const USER_CS: u16 = 0x2B;

/// Upper bound on cores the descriptor-table storage supports.
pub const MAX_CORES: usize = 16;

struct CoreTables {
    gdt: GlobalDescriptorTable,
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    tss: SegmentSelector,
}

static TSS_STORE: [Once<TaskStateSegment>; MAX_CORES] = [const { Once::new() }; MAX_CORES];
static GDT_STORE: [Once<CoreTables>; MAX_CORES] = [const { Once::new() }; MAX_CORES];

/// Build and load this core's GDT and TSS.
///
/// # Safety
///
/// `kernel_stack_top` must be the top of a mapped per-core kernel stack;
/// must be called once per `core_id` before interrupts are enabled.
///
/// # Panics
///
/// Panics if `core_id` exceeds [`MAX_CORES`] or if the slot order ever
/// drifts from the published selector constants.
pub unsafe fn init(core_id: usize, kernel_stack_top: u64) {
    assert!(core_id < MAX_CORES, "core id {} exceeds descriptor storage", core_id);

    let tss = TSS_STORE[core_id].call_once(|| {
        let mut tss = TaskStateSegment::new();
        tss.privilege_stack_table[0] = VirtAddr::new(kernel_stack_top);
        tss
    });

    let tables = GDT_STORE[core_id].call_once(|| {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.add_entry(Descriptor::kernel_code_segment());
        let kernel_data = gdt.add_entry(Descriptor::kernel_data_segment());
        // Placeholder occupying the STAR sysret base slot.
        let sysret_base = gdt.add_entry(Descriptor::user_data_segment());
        let user_data = gdt.add_entry(Descriptor::user_data_segment());
        let user_code = gdt.add_entry(Descriptor::user_code_segment());
        let tss_sel = gdt.add_entry(Descriptor::tss_segment(tss));

        assert!(kernel_code.0 == KERNEL_CS, "kernel code selector moved");
        assert!(kernel_data.0 == KERNEL_SS, "kernel data selector moved");
        assert!(sysret_base.0 & !0x3 == SYSRET_BASE, "sysret base selector moved");
        assert!(user_data.0 == USER_SS, "user data selector moved");
        assert!(user_code.0 == USER_CS, "user code selector moved");

        CoreTables { gdt, kernel_code, kernel_data, tss: tss_sel }
    });

    tables.gdt.load();
    // SAFETY: The selectors were just created against the loaded GDT.
    unsafe {
        CS::set_reg(tables.kernel_code);
        SS::set_reg(tables.kernel_data);
        load_tss(tables.tss);
    }
}
