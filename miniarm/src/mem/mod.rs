//! Address-space construction: translation tables, frame sources, the
//! virtual regions and the manager tying them together.

use core::fmt;

use memory_addr::{PhysAddr, VirtAddr};

pub mod descriptor;
pub mod frame;
pub mod mmu;
pub mod space;
pub mod table;
#[cfg(test)]
pub(crate) mod testing;

pub use descriptor::{Descriptor, MemAttr, MemType};
pub use frame::{EarlyFrameSource, FrameSource, FrameSupply, RuntimeFrameSource};
pub use mmu::{BootMemory, MemoryManager};
pub use space::{AddressSpace, Region, RegionKind};
pub use table::{PageTable, Translation};

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// Smallest RAM bank the kernel will run in.
pub const MIN_MEM_SIZE: u64 = 0x40_0000;
/// Largest RAM bank the kernel will map.
pub const MAX_MEM_SIZE: u64 = 1 << 39;

pub const VIRT_KERNEL_AREA: usize = MAX_MEM_SIZE as usize;
pub const VIRT_DEMAND_AREA: usize = (MAX_MEM_SIZE as usize) << 5;
pub const VIRT_HEAP_AREA: usize = (MAX_MEM_SIZE as usize) << 6;
pub const VIRT_HEAP_END: usize = (MAX_MEM_SIZE as usize) << 8;

pub const fn pfn_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) >> PAGE_SHIFT
}

pub const fn pfn_down(addr: u64) -> u64 {
    addr >> PAGE_SHIFT
}

pub const fn pfn_phys(pfn: u64) -> u64 {
    pfn << PAGE_SHIFT
}

pub const fn phys_pfn(addr: u64) -> u64 {
    addr >> PAGE_SHIFT
}

/// The kernel's linear view of physical memory.
///
/// `physical = virtual + offset`, matching the offset the boot code
/// computes while the MMU is being brought up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysMap {
    offset: usize,
}

impl PhysMap {
    pub const fn new(physical_address_offset: usize) -> Self {
        Self {
            offset: physical_address_offset,
        }
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }

    pub fn to_virt(&self, paddr: PhysAddr) -> VirtAddr {
        VirtAddr::from(paddr.as_usize().wrapping_sub(self.offset))
    }

    pub fn to_phys(&self, vaddr: VirtAddr) -> PhysAddr {
        PhysAddr::from(vaddr.as_usize().wrapping_add(self.offset))
    }

    pub fn pfn_to_virt(&self, pfn: u64) -> VirtAddr {
        self.to_virt(PhysAddr::from(pfn_phys(pfn) as usize))
    }

    pub fn virt_to_pfn(&self, vaddr: VirtAddr) -> u64 {
        pfn_down(self.to_phys(vaddr).as_usize() as u64)
    }
}

/// Linker-provided layout of the loaded kernel image.
#[derive(Debug, Clone, Copy)]
pub struct KernelImage {
    /// `_text`
    pub start: VirtAddr,
    /// `_etext`
    pub text_end: VirtAddr,
    /// `_erodata`
    pub rodata_end: VirtAddr,
    /// `_edata`
    pub data_end: VirtAddr,
    /// `_boot_stack`
    pub boot_stack: VirtAddr,
    /// `_end`
    pub end: VirtAddr,
}

impl KernelImage {
    /// An image known only by its bounds. The section marks read as `end`
    /// and the boot stack as `start`.
    pub const fn bounds(start: VirtAddr, end: VirtAddr) -> Self {
        Self {
            start,
            text_end: end,
            rodata_end: end,
            data_end: end,
            boot_stack: start,
            end,
        }
    }
}

impl fmt::Display for KernelImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "    _text:       {:#x}(VA)", self.start.as_usize())?;
        writeln!(f, "    _etext:      {:#x}(VA)", self.text_end.as_usize())?;
        writeln!(f, "    _erodata:    {:#x}(VA)", self.rodata_end.as_usize())?;
        writeln!(f, "    _edata:      {:#x}(VA)", self.data_end.as_usize())?;
        writeln!(f, "    stack start: {:#x}(VA)", self.boot_stack.as_usize())?;
        write!(f, "    _end:        {:#x}(VA)", self.end.as_usize())
    }
}
