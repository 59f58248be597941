//! Stand-ins for the aarch64 CPU primitives when the crate is built for the
//! host, so the table builder and GIC driver can run under the test harness.
//!
//! Barriers map onto fences. TLB maintenance is a fence only. The IRQ mask
//! is a plain flag.

use core::sync::atomic::{AtomicBool, Ordering, fence};

#[path = "../aarch64/context.rs"]
pub mod context;

static IRQ_MASKED: AtomicBool = AtomicBool::new(false);

#[inline]
pub fn dsb_ishst() {
    fence(Ordering::SeqCst);
}

#[inline]
pub fn isb() {
    fence(Ordering::SeqCst);
}

#[inline]
pub fn wmb() {
    fence(Ordering::Release);
}

#[inline]
pub fn rmb() {
    fence(Ordering::Acquire);
}

#[inline]
pub fn mb() {
    fence(Ordering::SeqCst);
}

#[inline]
pub fn flush_tlb_page(_vaddr: usize) {
    fence(Ordering::SeqCst);
}

pub fn local_irq_disable() {
    IRQ_MASKED.store(true, Ordering::SeqCst);
}

pub fn local_irq_enable() {
    IRQ_MASKED.store(false, Ordering::SeqCst);
}

pub fn local_irq_save() -> usize {
    usize::from(IRQ_MASKED.swap(true, Ordering::SeqCst)) << 7
}

pub fn local_irq_restore(flags: usize) {
    IRQ_MASKED.store(flags & 0x80 != 0, Ordering::SeqCst);
}

pub fn irqs_disabled() -> bool {
    IRQ_MASKED.load(Ordering::SeqCst)
}

pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

pub fn shutdown() -> ! {
    panic!("kernel shutdown requested");
}
