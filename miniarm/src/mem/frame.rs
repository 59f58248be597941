use buddy_system_allocator::FrameAllocator;
use log::{debug, error};
use memory_addr::PhysAddr;
use spin::Mutex;

use super::{PAGE_SIZE, PhysMap, pfn_phys};
use crate::{arch, error::KResult};

pub const FRAME_ORDER: usize = 32;

/// The kernel's general page allocator, in page-frame-number units.
pub type PageAllocator = Mutex<FrameAllocator<FRAME_ORDER>>;

/// Supplies pages for new translation tables.
pub trait FrameSource {
    /// Returns a zero-filled page whose contents are already visible to
    /// the table walker.
    fn alloc_frame(&mut self) -> KResult<PhysAddr>;
}

fn zero_frame(phys: &PhysMap, paddr: PhysAddr) {
    let page = phys.to_virt(paddr).as_usize() as *mut u8;
    unsafe { core::ptr::write_bytes(page, 0, PAGE_SIZE) };
    arch::dsb_ishst();
}

/// Hands out the pages directly after the kernel image, before the page
/// allocator exists.
#[derive(Debug)]
pub struct EarlyFrameSource {
    next_pfn: u64,
    ceiling_pfn: u64,
    phys: PhysMap,
}

impl EarlyFrameSource {
    pub fn new(phys: PhysMap, first_free_pfn: u64, ceiling_pfn: u64) -> Self {
        Self {
            next_pfn: first_free_pfn,
            ceiling_pfn,
            phys,
        }
    }

    /// First page not yet handed out.
    pub fn first_free_pfn(&self) -> u64 {
        self.next_pfn
    }

    pub fn ceiling_pfn(&self) -> u64 {
        self.ceiling_pfn
    }
}

impl FrameSource for EarlyFrameSource {
    fn alloc_frame(&mut self) -> KResult<PhysAddr> {
        let pfn = self.next_pfn;
        if pfn >= self.ceiling_pfn {
            error!(
                "early page tables exhausted their budget: pfn {:#x}, ceiling {:#x}",
                pfn, self.ceiling_pfn
            );
            panic!("early frame {:#x} crosses min_mem_pfn {:#x}", pfn, self.ceiling_pfn);
        }
        let paddr = PhysAddr::from(pfn_phys(pfn) as usize);
        zero_frame(&self.phys, paddr);
        self.next_pfn += 1;
        Ok(paddr)
    }
}

/// Takes table pages from the page allocator once it is running.
pub struct RuntimeFrameSource<'a> {
    pages: &'a PageAllocator,
    phys: PhysMap,
}

impl<'a> RuntimeFrameSource<'a> {
    pub fn new(pages: &'a PageAllocator, phys: PhysMap) -> Self {
        Self { pages, phys }
    }
}

impl FrameSource for RuntimeFrameSource<'_> {
    fn alloc_frame(&mut self) -> KResult<PhysAddr> {
        // Table pages are not optional: running out here is fatal.
        let Some(pfn) = self.pages.lock().alloc(1) else {
            error!("page allocator exhausted while extending the page tables");
            panic!("out of memory for translation tables");
        };
        let paddr = PhysAddr::from(pfn_phys(pfn as u64) as usize);
        zero_frame(&self.phys, paddr);
        Ok(paddr)
    }
}

/// Where new table pages come from. Starts early and moves to the page
/// allocator exactly once.
pub enum FrameSupply<'a> {
    Early(EarlyFrameSource),
    Runtime(RuntimeFrameSource<'a>),
}

impl<'a> FrameSupply<'a> {
    pub fn is_runtime(&self) -> bool {
        matches!(self, FrameSupply::Runtime(_))
    }

    /// Replaces the early source with the page allocator and returns the
    /// retired early source.
    pub fn switch_to_runtime(&mut self, runtime: RuntimeFrameSource<'a>) -> EarlyFrameSource {
        match core::mem::replace(self, FrameSupply::Runtime(runtime)) {
            FrameSupply::Early(early) => {
                debug!(
                    "frame supply now uses the page allocator (early pfn stopped at {:#x})",
                    early.first_free_pfn()
                );
                early
            }
            FrameSupply::Runtime(_) => panic!("page allocator handed over twice"),
        }
    }
}

impl FrameSource for FrameSupply<'_> {
    fn alloc_frame(&mut self) -> KResult<PhysAddr> {
        match self {
            FrameSupply::Early(early) => early.alloc_frame(),
            FrameSupply::Runtime(runtime) => runtime.alloc_frame(),
        }
    }
}
