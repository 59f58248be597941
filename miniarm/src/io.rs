//! Barrier-correct access to memory-mapped device registers.
//!
//! Every read is a 32-bit load followed by a load barrier. Every write is a
//! 32-bit store followed by a store barrier.

use core::ptr::{read_volatile, write_volatile};

use memory_addr::VirtAddr;

use crate::arch;

/// A window of 32-bit device registers addressed by byte offset.
pub trait RegisterBlock {
    fn read32(&self, offset: usize) -> u32;

    fn write32(&self, offset: usize, value: u32);

    /// Non-atomic read-modify-write. Device memory does not support
    /// exclusive accesses, so this relies on a single writer.
    fn modify32(&self, offset: usize, f: impl FnOnce(u32) -> u32) {
        let value = self.read32(offset);
        self.write32(offset, f(value));
    }
}

/// A mapped MMIO window.
#[derive(Debug, Clone, Copy)]
pub struct Mmio {
    base: VirtAddr,
    size: usize,
}

impl Mmio {
    /// # Safety
    ///
    /// `base..base + size` must be mapped with device attributes and must
    /// stay mapped for as long as the window is used.
    pub const unsafe fn new(base: VirtAddr, size: usize) -> Self {
        Self { base, size }
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn reg(&self, offset: usize) -> *mut u32 {
        debug_assert!(offset + 4 <= self.size, "register offset {offset:#x} out of window");
        debug_assert!(offset % 4 == 0, "register offset {offset:#x} misaligned");
        (self.base.as_usize() + offset) as *mut u32
    }
}

impl RegisterBlock for Mmio {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        let value = unsafe { read_volatile(self.reg(offset)) };
        arch::rmb();
        value
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        unsafe { write_volatile(self.reg(offset), value) };
        arch::wmb();
    }
}
