use core::arch::asm;

use aarch64_cpu::asm::barrier::{self, ISHST, NSH, SY};

/// `dsb ishst`: stores issued so far are visible to the table walker.
#[inline]
pub fn dsb_ishst() {
    barrier::dsb(ISHST);
}

#[inline]
pub fn isb() {
    barrier::isb(SY);
}

/// Full system store barrier (`wmb`).
#[inline]
pub fn wmb() {
    unsafe { asm!("dmb st", options(nostack, preserves_flags)) };
}

/// Full system load barrier (`rmb`).
#[inline]
pub fn rmb() {
    unsafe { asm!("dmb ld", options(nostack, preserves_flags)) };
}

#[inline]
pub fn mb() {
    barrier::dmb(SY);
}

/// Drop the local TLB entry for the last-level translation of `vaddr`.
#[inline]
pub fn flush_tlb_page(vaddr: usize) {
    barrier::dsb(ISHST);
    unsafe {
        asm!(
            "tlbi vale1, {}",
            in(reg) vaddr >> 12,
            options(nostack, preserves_flags)
        );
    }
    barrier::dsb(NSH);
    barrier::isb(SY);
}

#[inline]
pub fn local_irq_disable() {
    unsafe { asm!("msr daifset, #2", options(nostack, preserves_flags)) };
}

#[inline]
pub fn local_irq_enable() {
    unsafe { asm!("msr daifclr, #2", options(nostack, preserves_flags)) };
}

/// Masks IRQs and returns the previous DAIF value.
#[inline]
pub fn local_irq_save() -> usize {
    let flags: usize;
    unsafe {
        asm!(
            "mrs {}, daif",
            "msr daifset, #2",
            out(reg) flags,
            options(nostack, preserves_flags)
        );
    }
    flags
}

#[inline]
pub fn local_irq_restore(flags: usize) {
    unsafe { asm!("msr daif, {}", in(reg) flags, options(nostack, preserves_flags)) };
}

pub fn irqs_disabled() -> bool {
    let flags: usize;
    unsafe { asm!("mrs {}, daif", out(reg) flags, options(nomem, nostack, preserves_flags)) };
    flags & 0x80 != 0
}

pub fn wait_for_interrupt() {
    unsafe { asm!("wfi", options(nomem, nostack)) };
}

/// Powers the domain off through PSCI; parks the core if that returns.
pub fn shutdown() -> ! {
    local_irq_disable();
    let _ = smccc::psci::system_off::<smccc::Hvc>();
    loop {
        wait_for_interrupt();
    }
}
