//! The kernel's virtual memory manager: boot RAM mapping, device windows,
//! frame mappings and the grant table.

use arrayvec::ArrayVec;
use log::{debug, error, info, warn};
use memory_addr::{PhysAddr, VirtAddr, align_up_4k};

use super::frame::{EarlyFrameSource, FrameSupply, PageAllocator, RuntimeFrameSource};
use super::space::{AddressSpace, Region, RegionKind};
use super::table::{PageTable, Translation};
use super::{
    KernelImage, MAX_MEM_SIZE, MIN_MEM_SIZE, MemAttr, PAGE_MASK, PAGE_SIZE, PhysMap, pfn_down,
    pfn_phys, pfn_up, phys_pfn,
};
use crate::devtree::{DeviceTree, RegEntry};
use crate::error::KResult;
use crate::hypercall::{
    DOMID_SELF, GnttabSetupTable, Hypervisor, XENMAPSPACE_GRANT_TABLE, XenAddToPhysmap, XenPfn,
};
use crate::kerr;

pub const MAX_GRANT_FRAMES: usize = 32;

/// What the page allocator gets to manage once `init_mm` is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootMemory {
    /// First free page after the kernel image and the early page tables.
    pub start_pfn: u64,
    /// End of the free pages. The relocated device tree starts here.
    pub max_pfn: u64,
    /// Linear address of the relocated device tree.
    pub device_tree: VirtAddr,
}

/// Where RAM is and which of its pages are free, before any of it is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RamPlan {
    mem_base: u64,
    mem_size: u64,
    start_pfn: u64,
    max_pfn: u64,
}

impl RamPlan {
    /// `image` is the physical `[_text, _end)` of the kernel.
    fn new(bank: RegEntry, image: (u64, u64)) -> Self {
        if bank.size < MIN_MEM_SIZE {
            error!("{:#x} bytes of RAM, need at least {:#x}", bank.size, MIN_MEM_SIZE);
            panic!("not enough memory");
        }
        let mem_base = bank.base;
        let mem_size = if bank.size > MAX_MEM_SIZE {
            warn!("only using the first {:#x} bytes of RAM", MAX_MEM_SIZE);
            MAX_MEM_SIZE
        } else {
            bank.size & PAGE_MASK as u64
        };
        let mem_end = mem_base + mem_size;

        let (text, end) = image;
        if text < mem_base || end > mem_end {
            error!(
                "kernel image {:#x}..{:#x} lies outside RAM {:#x}..{:#x}",
                text, end, mem_base, mem_end
            );
            panic!("kernel image is not in RAM");
        }

        let start_pfn = pfn_up(end);
        let heap_len = mem_size - (pfn_phys(start_pfn) - mem_base);
        Self {
            mem_base,
            mem_size,
            start_pfn,
            max_pfn: start_pfn + pfn_down(heap_len),
        }
    }
}

pub struct MemoryManager<'a> {
    table: PageTable,
    frames: FrameSupply<'a>,
    space: AddressSpace,
    phys: PhysMap,
    image: KernelImage,
}

fn early_source(phys: PhysMap, image: KernelImage) -> EarlyFrameSource {
    let first_free = pfn_up(phys.to_phys(image.end).as_usize() as u64);
    let min_mem_pfn = pfn_down(phys.to_phys(image.start).as_usize() as u64 + MIN_MEM_SIZE);
    EarlyFrameSource::new(phys, first_free, min_mem_pfn)
}

impl<'a> MemoryManager<'a> {
    /// Starts from an empty level 0 table taken from the early frames.
    pub fn new(phys: PhysMap, image: KernelImage) -> KResult<Self> {
        let mut early = early_source(phys, image);
        let table = PageTable::new(phys, &mut early)?;
        Ok(Self::with_table(table, early, phys, image))
    }

    /// Adopts the level 0 table the boot code is running on.
    ///
    /// # Safety
    ///
    /// `root` must be the live translation table root, reachable through
    /// `phys`. Any leaf it already holds inside the linear map of RAM must
    /// match the block `init_mm` would write there, otherwise `init_mm`
    /// panics instead of overwriting it.
    pub unsafe fn with_root(root: PhysAddr, phys: PhysMap, image: KernelImage) -> Self {
        let table = unsafe { PageTable::from_root(root, phys) };
        Self::with_table(table, early_source(phys, image), phys, image)
    }

    fn with_table(table: PageTable, early: EarlyFrameSource, phys: PhysMap, image: KernelImage) -> Self {
        debug!(
            "early page tables from pfn {:#x}, min_mem_pfn {:#x}",
            early.first_free_pfn(),
            early.ceiling_pfn()
        );
        Self {
            table,
            frames: FrameSupply::Early(early),
            space: AddressSpace::new(),
            phys,
            image,
        }
    }

    pub fn phys(&self) -> PhysMap {
        self.phys
    }

    pub fn page_table(&self) -> &PageTable {
        &self.table
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn heap_region(&self) -> &Region {
        self.space.region(RegionKind::Heap)
    }

    pub fn frame_supply(&self) -> &FrameSupply<'a> {
        &self.frames
    }

    pub fn translate(&self, vaddr: VirtAddr) -> Option<Translation> {
        self.table.translate(vaddr)
    }

    /// Maps the device tree blob at `dtb` into the kernel static area so it
    /// can be read before RAM is mapped.
    pub fn map_device_tree(&mut self, dtb: PhysAddr, size: usize) -> KResult<VirtAddr> {
        let offset = dtb.as_usize() & !PAGE_MASK;
        let len = align_up_4k(offset + size);
        let region = self.space.region_mut(RegionKind::KernelStatic);
        let Some(range) = region.alloc(len, PAGE_SIZE) else {
            return Err(kerr!(ENOMEM, "kernel static area exhausted"));
        };
        self.table.map_pages(
            range.start,
            phys_pfn(dtb.as_usize() as u64),
            len / PAGE_SIZE,
            MemAttr::NORMAL,
            3,
            &mut self.frames,
        )?;
        let va = range.start + offset;
        info!("device tree at {:#x} mapped to {:#x}", dtb.as_usize(), va.as_usize());
        Ok(va)
    }

    /// Maps the first RAM bank of `dt` linearly and moves the device tree
    /// out of the way of the page allocator.
    pub fn init_mm(&mut self, dt: &DeviceTree<'_>) -> BootMemory {
        let to_pa = |va: VirtAddr| self.phys.to_phys(va).as_usize() as u64;
        info!("Kernel image layout:\n{}", self.image);

        let reserved = dt.reserved_entries();
        if reserved != 0 {
            warn!("reserved memory not supported, ignoring {} entries", reserved);
        }

        let Some(bank) = dt.memory_bank() else {
            error!("No memory found in FDT!");
            panic!("device tree has no memory node");
        };
        info!("Found memory at {:#x} (len {:#x})", bank.base, bank.size);
        let image = (to_pa(self.image.start), to_pa(self.image.end));
        let RamPlan {
            mem_base,
            mem_size,
            mut start_pfn,
            mut max_pfn,
        } = RamPlan::new(bank, image);

        let base = PhysAddr::from(mem_base as usize);
        if let Err(err) = self.table.map_region(
            self.phys.to_virt(base),
            base,
            mem_size as usize,
            MemAttr::NORMAL,
            &mut self.frames,
        ) {
            error!("linear map of RAM failed: {}", err);
            panic!("cannot map RAM");
        }
        if let FrameSupply::Early(early) = &self.frames {
            start_pfn = start_pfn.max(early.first_free_pfn());
        }
        info!("Using pages {} to {} as free space for heap.", start_pfn, max_pfn);

        let fdt_size = dt.total_size() as u64;
        let fdt_pa = (pfn_phys(max_pfn) - fdt_size) & PAGE_MASK as u64;
        if fdt_pa < pfn_phys(start_pfn) {
            error!("no room for a {:#x} byte device tree below {:#x}", fdt_size, pfn_phys(max_pfn));
            panic!("device tree does not fit in RAM");
        }
        let new_tree = self.phys.to_virt(PhysAddr::from(fdt_pa as usize));
        // Copy between linear-map addresses so overlap is judged on one view.
        let blob = VirtAddr::from(dt.blob().as_ptr() as usize);
        let src = match self.table.translate(blob) {
            Some(t) => self.phys.to_virt(t.paddr),
            None => blob,
        };
        if src != new_tree {
            debug!(
                "moving device tree {:#x} -> {:#x}",
                self.phys.to_phys(src).as_usize(),
                fdt_pa
            );
            unsafe { core::ptr::copy(src.as_ptr(), new_tree.as_mut_ptr(), fdt_size as usize) };
        }
        max_pfn = pfn_down(fdt_pa);
        debug!("device tree relocated to {:#x}", new_tree.as_usize());

        BootMemory {
            start_pfn,
            max_pfn,
            device_tree: new_tree,
        }
    }

    /// New translation tables come from `pages` from now on.
    pub fn allocator_ready(&mut self, pages: &'a PageAllocator) {
        let early = self
            .frames
            .switch_to_runtime(RuntimeFrameSource::new(pages, self.phys));
        info!(
            "page tables now use the page allocator, early frames ended at pfn {:#x}",
            early.first_free_pfn()
        );
    }

    /// Maps `size` bytes of device memory at `paddr`. The returned address
    /// keeps the sub-page offset of `paddr`.
    pub fn ioremap(&mut self, paddr: PhysAddr, size: usize) -> Option<VirtAddr> {
        if size == 0 {
            warn!("ioremap {:#x}: empty window", paddr.as_usize());
            return None;
        }
        let offset = paddr.as_usize() & !PAGE_MASK;
        let pages = pfn_up((offset + size) as u64) as usize;
        let Some(range) = self
            .space
            .region_mut(RegionKind::Demand)
            .alloc(pages * PAGE_SIZE, PAGE_SIZE)
        else {
            warn!("ioremap {:#x}+{:#x}: demand area exhausted", paddr.as_usize(), size);
            return None;
        };
        if let Err(err) = self.table.map_pages(
            range.start,
            phys_pfn(paddr.as_usize() as u64),
            pages,
            MemAttr::DEVICE,
            3,
            &mut self.frames,
        ) {
            warn!("ioremap {:#x}+{:#x}: {}", paddr.as_usize(), size, err);
            return None;
        }
        let va = range.start + offset;
        debug!("ioremap {:#x}+{:#x} -> {:#x}", paddr.as_usize(), size, va.as_usize());
        Some(va)
    }

    /// Maps machine frame `mfn` into the kernel static area.
    pub fn map_frame_virt(&mut self, mfn: u64) -> VirtAddr {
        let region = self.space.region_mut(RegionKind::KernelStatic);
        let Some(range) = region.alloc(PAGE_SIZE, PAGE_SIZE) else {
            error!("cannot map frame {:#x}: {:?}", mfn, region);
            panic!("kernel static area exhausted");
        };
        if let Err(err) = self
            .table
            .map_pages(range.start, mfn, 1, MemAttr::NORMAL, 3, &mut self.frames)
        {
            error!("cannot map frame {:#x}: {}", mfn, err);
            panic!("map_frame_virt failed");
        }
        range.start
    }

    /// Reserves `n` pages of demand-area address space aligned to
    /// `alignment` pages. Nothing is mapped.
    pub fn allocate_ondemand(&mut self, n: usize, alignment: usize) -> Option<VirtAddr> {
        if !alignment.is_power_of_two() {
            warn!("allocate_ondemand: alignment {} is not a power of two", alignment);
            return None;
        }
        let range = self
            .space
            .region_mut(RegionKind::Demand)
            .alloc(n.checked_mul(PAGE_SIZE)?, alignment.checked_mul(PAGE_SIZE)?)?;
        Some(range.start)
    }

    /// Maps `n` pages at a fresh demand-area address; page `i` maps frame
    /// `frames[i * stride] + i * increment`.
    pub fn map_frames_ex(
        &mut self,
        frames: &[XenPfn],
        n: usize,
        stride: usize,
        increment: u64,
        alignment: usize,
        attrs: MemAttr,
    ) -> Option<VirtAddr> {
        if n == 0 || (n - 1).checked_mul(stride)? >= frames.len() {
            warn!("map_frames_ex: {} frames with stride {} from a list of {}", n, stride, frames.len());
            return None;
        }
        let va = self.allocate_ondemand(n, alignment)?;
        for i in 0..n {
            let mfn = frames[i * stride] + i as u64 * increment;
            let page = va + i * PAGE_SIZE;
            if let Err(err) = self
                .table
                .map_pages(page, mfn, 1, attrs, 3, &mut self.frames)
            {
                warn!("map_frames_ex: frame {:#x} at {:#x}: {}", mfn, page.as_usize(), err);
                self.roll_back(va, i);
                return None;
            }
        }
        Some(va)
    }

    pub fn map_frames(&mut self, frames: &[XenPfn], n: usize) -> Option<VirtAddr> {
        self.map_frames_ex(frames, n, 1, 0, 1, MemAttr::NORMAL)
    }

    /// Mapping at a caller-chosen address is not supported.
    pub fn do_map_frames(
        &mut self,
        _va: VirtAddr,
        _frames: &[XenPfn],
        _stride: usize,
        _increment: u64,
        _attrs: MemAttr,
    ) -> KResult<()> {
        Err(kerr!(ENOSYS, "do_map_frames"))
    }

    /// Undoes the first `n` pages of a failed multi-page mapping.
    fn roll_back(&mut self, va: VirtAddr, n: usize) {
        if let Err(err) = self.unmap_frames(va, n) {
            warn!("cannot roll back {} pages at {:#x}: {}", n, va.as_usize(), err);
        }
    }

    /// Unmaps `n` pages from `va`. The address space is not given back.
    pub fn unmap_frames(&mut self, va: VirtAddr, n: usize) -> KResult<()> {
        for i in 0..n {
            let page = va + i * PAGE_SIZE;
            if !self.table.unmap_page(page)? {
                debug!("unmap_frames: {:#x} was not mapped", page.as_usize());
            }
        }
        Ok(())
    }

    /// Places `nr_frames` grant table frames where the `xen,xen` node
    /// suggests, sets the table up and maps it.
    pub fn init_gnttab(
        &mut self,
        dt: &DeviceTree<'_>,
        hyp: &mut impl Hypervisor,
        nr_frames: usize,
    ) -> VirtAddr {
        let Some(base) = dt
            .compatible_reg(&["xen,xen"])
            .and_then(|reg| reg.first().copied())
        else {
            error!("no usable reg on the xen,xen node");
            panic!("grant table base unknown");
        };
        info!("FDT suggests grant table base {:#x}", base.base);
        if nr_frames == 0 || nr_frames > MAX_GRANT_FRAMES {
            error!("{} grant frames requested, at most {} supported", nr_frames, MAX_GRANT_FRAMES);
            panic!("bad grant table size");
        }

        let base_pfn = phys_pfn(base.base);
        for i in 0..nr_frames as u64 {
            let mut xatp = XenAddToPhysmap {
                domid: DOMID_SELF,
                size: 0,
                space: XENMAPSPACE_GRANT_TABLE,
                idx: i,
                gpfn: base_pfn + i,
            };
            let rc = hyp.add_to_physmap(&mut xatp);
            if rc != 0 {
                error!("add_to_physmap for grant frame {} failed: {}", i, rc);
                panic!("cannot place the grant table");
            }
        }

        let mut frames: ArrayVec<XenPfn, MAX_GRANT_FRAMES> = (0..nr_frames).map(|_| 0).collect();
        let mut setup = GnttabSetupTable {
            dom: DOMID_SELF,
            nr_frames: nr_frames as u32,
            status: 0,
            frame_list: 0,
        };
        let rc = hyp.grant_table_setup(&mut setup, &mut frames[..]);
        if rc != 0 || setup.status != 0 {
            error!("GNTTABOP_setup_table failed; rc = {}, status = {}", rc, setup.status);
            panic!("grant table setup failed");
        }
        debug!("grant frames {:#x?}", frames.as_slice());

        let Some(va) = self.map_frames_ex(&[base_pfn], nr_frames, 0, 1, 1, MemAttr::NORMAL) else {
            panic!("cannot map the grant table");
        };
        va
    }
}
