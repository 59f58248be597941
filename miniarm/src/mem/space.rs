use core::fmt;

use memory_addr::{VirtAddr, VirtAddrRange, align_up, align_up_4k};

use super::{PAGE_SIZE, VIRT_DEMAND_AREA, VIRT_HEAP_AREA, VIRT_HEAP_END, VIRT_KERNEL_AREA};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Single frames mapped for the kernel's own use (shared info page).
    KernelStatic,
    /// MMIO windows, grant frames and other on-demand mappings.
    Demand,
    Heap,
}

impl RegionKind {
    pub const fn name(self) -> &'static str {
        match self {
            RegionKind::KernelStatic => "kernel",
            RegionKind::Demand => "demand",
            RegionKind::Heap => "heap",
        }
    }
}

/// A bump-allocated virtual arena. The cursor only moves forward and never
/// passes the ceiling.
pub struct Region {
    kind: RegionKind,
    start: VirtAddr,
    cursor: VirtAddr,
    ceiling: VirtAddr,
}

impl Region {
    pub fn new(kind: RegionKind, start: VirtAddr, ceiling: VirtAddr) -> Self {
        assert!(start <= ceiling, "{} region starts above its ceiling", kind.name());
        Self {
            kind,
            start,
            cursor: start,
            ceiling,
        }
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn cursor(&self) -> VirtAddr {
        self.cursor
    }

    pub fn ceiling(&self) -> VirtAddr {
        self.ceiling
    }

    pub fn span(&self) -> VirtAddrRange {
        VirtAddrRange::new(self.start, self.ceiling)
    }

    /// Everything handed out so far.
    pub fn used(&self) -> VirtAddrRange {
        VirtAddrRange::new(self.start, self.cursor)
    }

    /// Reserves `size` bytes, rounded up to whole pages, starting at a
    /// multiple of `align`. `None` once the region is exhausted.
    pub fn alloc(&mut self, size: usize, align: usize) -> Option<VirtAddrRange> {
        if size == 0 {
            return None;
        }
        assert!(
            align.is_power_of_two() && align >= PAGE_SIZE,
            "bad region alignment {align:#x}"
        );
        let start = align_up(self.cursor.as_usize(), align);
        let end = start.checked_add(align_up_4k(size))?;
        if end > self.ceiling.as_usize() || start < self.cursor.as_usize() {
            return None;
        }
        self.cursor = VirtAddr::from(end);
        self.check();
        Some(VirtAddrRange::new(VirtAddr::from(start), VirtAddr::from(end)))
    }

    /// Halts if the cursor ever escaped the region.
    pub fn check(&self) {
        if self.cursor < self.start || self.cursor > self.ceiling {
            panic!("{} region cursor escaped: {:?}", self.kind.name(), self);
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:#x}, {:#x}) cursor {:#x}",
            self.kind.name(),
            self.start.as_usize(),
            self.ceiling.as_usize(),
            self.cursor.as_usize()
        )
    }
}

/// The kernel's three virtual arenas, laid out back to back.
pub struct AddressSpace {
    kernel: Region,
    demand: Region,
    heap: Region,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self {
            kernel: Region::new(
                RegionKind::KernelStatic,
                VirtAddr::from(VIRT_KERNEL_AREA),
                VirtAddr::from(VIRT_DEMAND_AREA),
            ),
            demand: Region::new(
                RegionKind::Demand,
                VirtAddr::from(VIRT_DEMAND_AREA),
                VirtAddr::from(VIRT_HEAP_AREA),
            ),
            heap: Region::new(
                RegionKind::Heap,
                VirtAddr::from(VIRT_HEAP_AREA),
                VirtAddr::from(VIRT_HEAP_END),
            ),
        }
    }

    pub fn region(&self, kind: RegionKind) -> &Region {
        match kind {
            RegionKind::KernelStatic => &self.kernel,
            RegionKind::Demand => &self.demand,
            RegionKind::Heap => &self.heap,
        }
    }

    pub fn region_mut(&mut self, kind: RegionKind) -> &mut Region {
        match kind {
            RegionKind::KernelStatic => &mut self.kernel,
            RegionKind::Demand => &mut self.demand,
            RegionKind::Heap => &mut self.heap,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        [&self.kernel, &self.demand, &self.heap].into_iter()
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}
