//! Queries over the flattened device tree handed over by the hypervisor.
//!
//! Parsing is done by the `fdt` crate; this module adds the depth-first
//! walk that remembers the parent's `#address-cells`/`#size-cells`, since
//! `reg` can only be decoded with those.

use core::ops::ControlFlow;

use arrayvec::ArrayVec;
use fdt::Fdt;
use fdt::node::FdtNode;
use log::{error, warn};

use crate::{error::KResult, kerr};

const FDT_MAGIC: u32 = 0xd00d_feed;

pub const MAX_REG_ENTRIES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellSizes {
    pub address_cells: usize,
    pub size_cells: usize,
}

impl CellSizes {
    /// What a node without `#address-cells`/`#size-cells` implies for its
    /// children.
    pub const DEFAULT: Self = Self {
        address_cells: 2,
        size_cells: 1,
    };

    fn of(node: &FdtNode<'_, '_>) -> Self {
        let cells = |name| node.property(name).and_then(|p| p.as_usize());
        Self {
            address_cells: cells("#address-cells").unwrap_or(Self::DEFAULT.address_cells),
            size_cells: cells("#size-cells").unwrap_or(Self::DEFAULT.size_cells),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegEntry {
    pub base: u64,
    pub size: u64,
}

pub type RegList = ArrayVec<RegEntry, MAX_REG_ENTRIES>;

fn read_cells(bytes: &[u8]) -> u64 {
    bytes
        .chunks_exact(4)
        .fold(0, |acc, c| (acc << 32) | u64::from(u32::from_be_bytes([c[0], c[1], c[2], c[3]])))
}

/// Decodes a `reg` property laid out with the parent's `cells`. Only the
/// first [`MAX_REG_ENTRIES`] pairs are kept; a trailing partial pair is
/// ignored.
pub fn parse_reg(value: &[u8], cells: CellSizes) -> RegList {
    if cells.address_cells > 2 || cells.size_cells > 2 {
        error!(
            "Unsupported #address-cells: {}, #size-cells: {}",
            cells.address_cells, cells.size_cells
        );
        panic!("reg cells wider than 64 bits");
    }
    let mut list = RegList::new();
    let stride = (cells.address_cells + cells.size_cells) * 4;
    if stride == 0 {
        return list;
    }
    for pair in value.chunks_exact(stride).take(MAX_REG_ENTRIES) {
        let (base, size) = pair.split_at(cells.address_cells * 4);
        list.push(RegEntry {
            base: read_cells(base),
            size: read_cells(size),
        });
    }
    list
}

pub fn is_compatible(node: &FdtNode<'_, '_>, names: &[&str]) -> bool {
    node.compatible()
        .is_some_and(|c| c.all().any(|name| names.iter().any(|n| *n == name)))
}

pub struct DeviceTree<'a> {
    blob: &'a [u8],
    fdt: Fdt<'a>,
}

impl<'a> DeviceTree<'a> {
    pub fn new(blob: &'a [u8]) -> KResult<Self> {
        match Fdt::new(blob) {
            Ok(fdt) => Ok(Self {
                blob: &blob[..fdt.total_size()],
                fdt,
            }),
            Err(e) => {
                warn!("device tree rejected: {:?}", e);
                Err(kerr!(EINVAL, "malformed device tree"))
            }
        }
    }

    /// # Safety
    ///
    /// `ptr` must point at a mapped blob that stays mapped and unmodified
    /// for the rest of the kernel's life.
    pub unsafe fn from_ptr(ptr: *const u8) -> KResult<DeviceTree<'static>> {
        let header = unsafe { core::slice::from_raw_parts(ptr, 8) };
        if read_cells(&header[..4]) as u32 != FDT_MAGIC {
            return Err(kerr!(EINVAL, "no device tree magic"));
        }
        let size = read_cells(&header[4..8]) as usize;
        DeviceTree::new(unsafe { core::slice::from_raw_parts(ptr, size) })
    }

    pub fn total_size(&self) -> usize {
        self.blob.len()
    }

    /// The raw blob, exactly `total_size` bytes long.
    pub fn blob(&self) -> &'a [u8] {
        self.blob
    }

    pub fn reserved_entries(&self) -> usize {
        self.fdt.memory_reservations().count()
    }

    /// Visits every node depth first, together with the cell sizes its
    /// parent declares. Stops early when `f` breaks.
    pub fn walk<'s>(
        &'s self,
        f: &mut impl FnMut(FdtNode<'s, 'a>, CellSizes) -> ControlFlow<()>,
    ) {
        if let Some(root) = self.fdt.find_node("/") {
            let _ = walk_node(root, CellSizes::DEFAULT, f);
        }
    }

    /// First node, in depth-first order, for which `pred` holds.
    pub fn find(
        &self,
        mut pred: impl FnMut(&FdtNode<'_, 'a>) -> bool,
    ) -> Option<(FdtNode<'_, 'a>, CellSizes)> {
        let mut found = None;
        self.walk(&mut |node, cells| {
            if pred(&node) {
                found = Some((node, cells));
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        found
    }

    /// The `reg` pairs of `node`, or `None` if it has no `reg`.
    pub fn reg(node: &FdtNode<'_, 'a>, parent: CellSizes) -> Option<RegList> {
        node.property("reg").map(|p| parse_reg(p.value, parent))
    }

    /// First bank of the `device_type = "memory"` node.
    pub fn memory_bank(&self) -> Option<RegEntry> {
        let (node, cells) = self.find(|node| {
            node.property("device_type").and_then(|p| p.as_str()) == Some("memory")
        })?;
        Self::reg(&node, cells)?.first().copied()
    }

    /// `reg` of the first node compatible with any of `names`.
    pub fn compatible_reg(&self, names: &[&str]) -> Option<RegList> {
        let (node, cells) = self.find(|node| is_compatible(node, names))?;
        Self::reg(&node, cells)
    }

    pub fn bootargs(&self) -> Option<&'a str> {
        self.fdt
            .find_node("/chosen")?
            .property("bootargs")?
            .as_str()
    }
}

fn walk_node<'b, 'a>(
    node: FdtNode<'b, 'a>,
    parent: CellSizes,
    f: &mut impl FnMut(FdtNode<'b, 'a>, CellSizes) -> ControlFlow<()>,
) -> ControlFlow<()> {
    f(node, parent)?;
    let cells = CellSizes::of(&node);
    for child in node.children() {
        walk_node(child, cells, f)?;
    }
    ControlFlow::Continue(())
}
