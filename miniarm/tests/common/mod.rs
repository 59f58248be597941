#![allow(dead_code)]

use memory_addr::PhysAddr;
use miniarm::hypercall::{GnttabSetupTable, Hypervisor, XenAddToPhysmap, XenPfn};
use miniarm::mem::{KernelImage, PAGE_SIZE, PhysMap};

const ALIGN: usize = 2 << 20;

/// Zeroed host memory standing in for `pages` physical pages from `base`,
/// 2 MiB aligned so block mappings line up on both sides.
pub struct Arena {
    _buf: Vec<u8>,
    start: usize,
    base: usize,
    len: usize,
}

impl Arena {
    pub fn new(base: usize, pages: usize) -> Self {
        assert_eq!(base % ALIGN, 0);
        let len = pages * PAGE_SIZE;
        let mut buf = vec![0u8; len + ALIGN];
        let start = (buf.as_mut_ptr() as usize + ALIGN - 1) & !(ALIGN - 1);
        Self {
            _buf: buf,
            start,
            base,
            len,
        }
    }

    pub fn phys(&self) -> PhysMap {
        PhysMap::new(self.base.wrapping_sub(self.start))
    }

    /// An image occupying `[base + from, base + to)`.
    pub fn image(&self, from: usize, to: usize) -> KernelImage {
        let phys = self.phys();
        KernelImage::bounds(
            phys.to_virt(PhysAddr::from(self.base + from)),
            phys.to_virt(PhysAddr::from(self.base + to)),
        )
    }

    pub fn fill(&self, byte: u8) {
        unsafe { std::ptr::write_bytes(self.start as *mut u8, byte, self.len) };
    }

    pub fn write(&self, paddr: usize, data: &[u8]) {
        let offset = paddr - self.base;
        assert!(offset + data.len() <= self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), (self.start + offset) as *mut u8, data.len())
        };
    }

    pub fn bytes(&self, paddr: usize, len: usize) -> &[u8] {
        let offset = paddr - self.base;
        assert!(offset + len <= self.len);
        unsafe { std::slice::from_raw_parts((self.start + offset) as *const u8, len) }
    }
}

const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;

/// Writes version 17 flattened device trees.
#[derive(Default)]
pub struct FdtBuilder {
    structs: Vec<u8>,
    strings: Vec<u8>,
    reserved: Vec<(u64, u64)>,
}

impl FdtBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn word(&mut self, w: u32) {
        self.structs.extend_from_slice(&w.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structs.len() % 4 != 0 {
            self.structs.push(0);
        }
    }

    fn string_offset(&mut self, name: &str) -> u32 {
        let mut at = 0;
        for s in self.strings.split(|&b| b == 0) {
            if s == name.as_bytes() {
                return at as u32;
            }
            at += s.len() + 1;
        }
        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        offset
    }

    pub fn reserve(&mut self, addr: u64, size: u64) -> &mut Self {
        self.reserved.push((addr, size));
        self
    }

    pub fn begin_node(&mut self, name: &str) -> &mut Self {
        self.word(FDT_BEGIN_NODE);
        self.structs.extend_from_slice(name.as_bytes());
        self.structs.push(0);
        self.pad();
        self
    }

    pub fn end_node(&mut self) -> &mut Self {
        self.word(FDT_END_NODE);
        self
    }

    pub fn prop(&mut self, name: &str, value: &[u8]) -> &mut Self {
        let nameoff = self.string_offset(name);
        self.word(FDT_PROP);
        self.word(value.len() as u32);
        self.word(nameoff);
        self.structs.extend_from_slice(value);
        self.pad();
        self
    }

    pub fn prop_u32s(&mut self, name: &str, cells: &[u32]) -> &mut Self {
        let value: Vec<u8> = cells.iter().flat_map(|c| c.to_be_bytes()).collect();
        self.prop(name, &value)
    }

    pub fn prop_strs(&mut self, name: &str, strs: &[&str]) -> &mut Self {
        let mut value = Vec::new();
        for s in strs {
            value.extend_from_slice(s.as_bytes());
            value.push(0);
        }
        self.prop(name, &value)
    }

    pub fn finish(&mut self) -> Vec<u8> {
        self.word(FDT_END);
        let header_len = 40;
        let rsv_len = (self.reserved.len() + 1) * 16;
        let off_struct = header_len + rsv_len;
        let off_strings = off_struct + self.structs.len();
        let total = off_strings + self.strings.len();

        let mut blob = Vec::with_capacity(total);
        for field in [
            0xd00d_feed,
            total as u32,
            off_struct as u32,
            off_strings as u32,
            header_len as u32,
            17,
            16,
            0,
            self.strings.len() as u32,
            self.structs.len() as u32,
        ] {
            blob.extend_from_slice(&u32::to_be_bytes(field));
        }
        for &(addr, size) in self.reserved.iter().chain([(0, 0)].iter()) {
            blob.extend_from_slice(&addr.to_be_bytes());
            blob.extend_from_slice(&size.to_be_bytes());
        }
        blob.extend_from_slice(&self.structs);
        blob.extend_from_slice(&self.strings);
        blob
    }
}

pub const GNTTAB_BASE: u64 = 0x3800_0000;
pub const GICD_BASE: u64 = 0x0300_1000;
pub const GICC_BASE: u64 = 0x0300_2000;

/// A tree shaped like the one Xen hands to an ARM guest.
pub fn guest_tree(ram_base: u64, ram_size: u64) -> Vec<u8> {
    let mut fdt = FdtBuilder::new();
    fdt.begin_node("")
        .prop_u32s("#address-cells", &[2])
        .prop_u32s("#size-cells", &[2])
        .prop_strs("compatible", &["xen,xenvm-4.19", "xen,xenvm"]);
    fdt.begin_node("chosen")
        .prop_strs("bootargs", &["console=hvc0 loglevel=debug gnttab_frames=4"])
        .end_node();
    fdt.begin_node(&format!("memory@{ram_base:x}"))
        .prop_strs("device_type", &["memory"])
        .prop_u32s(
            "reg",
            &[
                (ram_base >> 32) as u32,
                ram_base as u32,
                (ram_size >> 32) as u32,
                ram_size as u32,
            ],
        )
        .end_node();
    fdt.begin_node("hypervisor")
        .prop_strs("compatible", &["xen,xen-4.19", "xen,xen"])
        .prop_u32s("reg", &[0, GNTTAB_BASE as u32, 0, 0x0100_0000])
        .prop_u32s("interrupts", &[1, 15, 0xf08])
        .end_node();
    fdt.begin_node("interrupt-controller@3001000")
        .prop_strs("compatible", &["arm,cortex-a15-gic", "arm,cortex-a9-gic"])
        .prop_u32s("#interrupt-cells", &[3])
        .prop("interrupt-controller", &[])
        .prop_u32s(
            "reg",
            &[0, GICD_BASE as u32, 0, 0x1000, 0, GICC_BASE as u32, 0, 0x2000],
        )
        .end_node();
    fdt.end_node();
    fdt.finish()
}

/// Records hypercalls and answers the grant table setup with consecutive
/// frames from `base_pfn`.
#[derive(Default)]
pub struct MockHypervisor {
    pub physmap_calls: Vec<XenAddToPhysmap>,
    pub setup_calls: Vec<GnttabSetupTable>,
    pub physmap_rc: i64,
    pub setup_status: i16,
    pub base_pfn: XenPfn,
}

impl Hypervisor for MockHypervisor {
    fn add_to_physmap(&mut self, xatp: &mut XenAddToPhysmap) -> i64 {
        self.physmap_calls.push(*xatp);
        self.physmap_rc
    }

    fn grant_table_setup(&mut self, setup: &mut GnttabSetupTable, frames: &mut [XenPfn]) -> i64 {
        assert_eq!(frames.len(), setup.nr_frames as usize);
        for (i, frame) in frames.iter_mut().enumerate() {
            *frame = self.base_pfn + i as u64;
        }
        setup.status = self.setup_status;
        self.setup_calls.push(*setup);
        0
    }
}
