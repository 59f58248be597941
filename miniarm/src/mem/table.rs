//! 4-level translation table walker and builder.

use core::ptr::{read_volatile, write_volatile};

use log::{debug, error};
use memory_addr::{PhysAddr, VirtAddr};

use super::descriptor::{Descriptor, LEVELS, MemAttr, level_size, table_index};
use super::frame::FrameSource;
use super::{PAGE_SIZE, PhysMap, pfn_phys};
use crate::{arch, error::KResult, kerr};

/// Where a virtual address currently leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub paddr: PhysAddr,
    /// Level of the leaf descriptor: 1 (1 GiB), 2 (2 MiB) or 3 (4 KiB).
    pub level: usize,
    pub attrs: MemAttr,
}

pub struct PageTable {
    root: PhysAddr,
    phys: PhysMap,
}

impl PageTable {
    /// Takes over a level 0 table the boot code already installed.
    ///
    /// # Safety
    ///
    /// `root` must be a page holding a valid level 0 table, reachable
    /// through `phys`.
    pub unsafe fn from_root(root: PhysAddr, phys: PhysMap) -> Self {
        Self { root, phys }
    }

    pub fn new(phys: PhysMap, frames: &mut impl FrameSource) -> KResult<Self> {
        let root = frames.alloc_frame()?;
        Ok(Self { root, phys })
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    pub fn phys(&self) -> PhysMap {
        self.phys
    }

    fn entry(&self, table: PhysAddr, index: usize) -> *mut u64 {
        (self.phys.to_virt(table).as_usize() as *mut u64).wrapping_add(index)
    }

    fn read_entry(&self, table: PhysAddr, index: usize, level: usize) -> Descriptor {
        Descriptor::decode(unsafe { read_volatile(self.entry(table, index)) }, level)
    }

    fn set_entry(&mut self, table: PhysAddr, index: usize, desc: Descriptor) {
        unsafe { write_volatile(self.entry(table, index), desc.encode()) };
        arch::dsb_ishst();
        arch::isb();
    }

    /// Maps `count` pages starting at frame `start_pfn` to `vaddr`, using
    /// leaves at `level`: 1 for 1 GiB blocks, 2 for 2 MiB blocks, 3 for
    /// pages. Missing intermediate tables are taken from `frames`.
    ///
    /// The range must be aligned to the leaf size at `level`. On `ENOMEM`
    /// the tables built so far stay in place; their unused entries are
    /// still invalid.
    pub fn map_pages(
        &mut self,
        vaddr: VirtAddr,
        start_pfn: u64,
        count: usize,
        attrs: MemAttr,
        level: usize,
        frames: &mut impl FrameSource,
    ) -> KResult<()> {
        if !(1..LEVELS).contains(&level) {
            return Err(kerr!(EINVAL, "leaf level must be 1, 2 or 3"));
        }
        let size = level_size(level);
        let va = vaddr.as_usize();
        let pa = pfn_phys(start_pfn) as usize;
        let len = count * PAGE_SIZE;
        if va % size != 0 || pa % size != 0 || len % size != 0 {
            return Err(kerr!(EINVAL, "range is not aligned to the leaf size"));
        }
        let Some(vend) = va.checked_add(len) else {
            return Err(kerr!(ERANGE, "range wraps the address space"));
        };
        if count == 0 {
            return Ok(());
        }
        self.build(self.root, 0, va, vend, pa, attrs, level, frames)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        &mut self,
        table: PhysAddr,
        level: usize,
        mut va: usize,
        vend: usize,
        mut pa: usize,
        attrs: MemAttr,
        target: usize,
        frames: &mut impl FrameSource,
    ) -> KResult<()> {
        let size = level_size(level);
        while va < vend {
            let next = ((va & !(size - 1)) + size).min(vend);
            let index = table_index(va, level);
            let current = self.read_entry(table, index, level);

            if level == target {
                let leaf = Descriptor::leaf(level, PhysAddr::from(pa), attrs);
                match current {
                    Descriptor::Invalid => self.set_entry(table, index, leaf),
                    existing if existing == leaf => {}
                    existing => {
                        error!(
                            "va {:#x} at level {} is already {:?}, wanted {:?}",
                            va, level, existing, leaf
                        );
                        panic!("remapping a live translation at {:#x}", va);
                    }
                }
            } else {
                let next_table = match current {
                    Descriptor::Table { addr } => addr,
                    Descriptor::Invalid => {
                        let addr = frames.alloc_frame()?;
                        self.set_entry(table, index, Descriptor::Table { addr });
                        addr
                    }
                    leaf => {
                        error!("va {:#x} needs a level {} table but found {:?}", va, level + 1, leaf);
                        panic!("block mapping in the way at {:#x}", va);
                    }
                };
                self.build(next_table, level + 1, va, next, pa, attrs, target, frames)?;
            }

            pa += next - va;
            va = next;
        }
        Ok(())
    }

    /// Maps `size` bytes from `paddr` at `vaddr` with the coarsest leaves
    /// the alignment allows, falling back to finer ones for the edges.
    pub fn map_region(
        &mut self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        size: usize,
        attrs: MemAttr,
        frames: &mut impl FrameSource,
    ) -> KResult<()> {
        let mut va = vaddr.as_usize();
        let mut pa = paddr.as_usize();
        if va % PAGE_SIZE != 0 || pa % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(kerr!(EINVAL, "region is not page aligned"));
        }
        let mut remaining = size;
        while remaining > 0 {
            let level = (1..LEVELS)
                .find(|&l| {
                    let block = level_size(l);
                    va % block == 0 && pa % block == 0 && remaining >= block
                })
                .unwrap_or(LEVELS - 1);
            let block = level_size(level);
            let mut len = remaining - remaining % block;
            if level > 1 {
                // Stop where a coarser leaf may become possible.
                let coarser = level_size(level - 1);
                len = len.min(coarser - va % coarser);
            }
            debug!(
                "map {:#x}..{:#x} -> {:#x} with level {} leaves",
                va,
                va + len,
                pa,
                level
            );
            self.map_pages(
                VirtAddr::from(va),
                (pa / PAGE_SIZE) as u64,
                len / PAGE_SIZE,
                attrs,
                level,
                frames,
            )?;
            va += len;
            pa += len;
            remaining -= len;
        }
        Ok(())
    }

    pub fn translate(&self, vaddr: VirtAddr) -> Option<Translation> {
        let va = vaddr.as_usize();
        let mut table = self.root;
        for level in 0..LEVELS {
            match self.read_entry(table, table_index(va, level), level) {
                Descriptor::Invalid => return None,
                Descriptor::Table { addr } => table = addr,
                Descriptor::Block { addr, attrs } | Descriptor::Page { addr, attrs } => {
                    let offset = va & (level_size(level) - 1);
                    return Some(Translation {
                        paddr: PhysAddr::from(addr.as_usize() + offset),
                        level,
                        attrs,
                    });
                }
            }
        }
        None
    }

    /// Removes the page mapping `vaddr` and drops it from the local TLB.
    /// Returns whether a page was mapped.
    pub fn unmap_page(&mut self, vaddr: VirtAddr) -> KResult<bool> {
        let va = vaddr.as_usize();
        let mut table = self.root;
        for level in 0..LEVELS - 1 {
            match self.read_entry(table, table_index(va, level), level) {
                Descriptor::Invalid => return Ok(false),
                Descriptor::Table { addr } => table = addr,
                _ => return Err(kerr!(EINVAL, "address is covered by a block mapping")),
            }
        }
        let index = table_index(va, LEVELS - 1);
        if !self.read_entry(table, index, LEVELS - 1).is_valid() {
            return Ok(false);
        }
        self.set_entry(table, index, Descriptor::Invalid);
        arch::flush_tlb_page(va & !(PAGE_SIZE - 1));
        Ok(true)
    }

    /// Calls `f(level, vaddr, descriptor)` for every valid entry reachable
    /// from the root, parents before children.
    pub fn visit(&self, f: &mut impl FnMut(usize, VirtAddr, Descriptor)) {
        self.visit_table(self.root, 0, 0, f);
    }

    fn visit_table(
        &self,
        table: PhysAddr,
        level: usize,
        base: usize,
        f: &mut impl FnMut(usize, VirtAddr, Descriptor),
    ) {
        for index in 0..super::descriptor::ENTRIES_PER_TABLE {
            let desc = self.read_entry(table, index, level);
            if !desc.is_valid() {
                continue;
            }
            let va = base + index * level_size(level);
            f(level, VirtAddr::from(va), desc);
            if let Descriptor::Table { addr } = desc {
                self.visit_table(addr, level + 1, va, f);
            }
        }
    }
}
