//! Stage 1 VMSAv8-64 descriptors for the 4 KiB granule.
//!
//! ```text
//!  63    52 51  48 47                    12 11  10  9 8 7 6  5  4   2 1 0
//! +--------+------+------------------------+---+----+---+---+----+-----+-+-+
//! | upper  | res0 | output address [47:12] | nG| AF | SH| AP| NS | IDX |T|V|
//! +--------+------+------------------------+---+----+---+---+----+-----+-+-+
//! ```
//!
//! All shifting and masking of descriptor words happens in this module.

use memory_addr::PhysAddr;

pub const ENTRIES_PER_TABLE: usize = 512;
pub const LEVELS: usize = 4;

const OUTPUT_ADDR_MASK: u64 = 0x0000_ffff_ffff_f000;
const ATTR_MASK: u64 = 0xfff0_0000_0000_0ffc;

const DESC_VALID: u64 = 0b01;
const DESC_TYPE_MASK: u64 = 0b11;
const DESC_TABLE: u64 = 0b11;
const DESC_PAGE: u64 = 0b11;
const DESC_BLOCK: u64 = 0b01;

const ATTR_AF: u64 = 1 << 10;
const ATTR_SH_IS: u64 = 3 << 8;
const ATTR_IDX_SHIFT: u64 = 2;
const ATTR_IDX_MASK: u64 = 7 << ATTR_IDX_SHIFT;

/// Address bits translated by a single entry at `level`.
pub const fn level_shift(level: usize) -> usize {
    39 - 9 * level
}

pub const fn level_size(level: usize) -> usize {
    1 << level_shift(level)
}

pub const fn table_index(vaddr: usize, level: usize) -> usize {
    (vaddr >> level_shift(level)) & (ENTRIES_PER_TABLE - 1)
}

numeric_enum_macro::numeric_enum! {
    #[repr(u64)]
    #[derive(Debug, Eq, PartialEq, Copy, Clone)]
    /// MAIR_EL1 slots as programmed by the boot code.
    pub enum MemType {
        DeviceNGnRnE = 0,
        DeviceNGnRE = 1,
        DeviceGRE = 2,
        NormalNC = 3,
        Normal = 4,
    }
}

/// Attribute bits of a block or page descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAttr(u64);

impl MemAttr {
    pub const NORMAL: Self = Self::inner_shareable(MemType::Normal);
    pub const NORMAL_NC: Self = Self::inner_shareable(MemType::NormalNC);
    pub const DEVICE: Self = Self::inner_shareable(MemType::DeviceNGnRnE);

    const fn inner_shareable(mem_type: MemType) -> Self {
        Self(ATTR_AF | ATTR_SH_IS | ((mem_type as u64) << ATTR_IDX_SHIFT))
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits & ATTR_MASK)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn mem_type(self) -> Option<MemType> {
        MemType::try_from((self.0 & ATTR_IDX_MASK) >> ATTR_IDX_SHIFT).ok()
    }
}

/// A decoded translation table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    Invalid,
    /// Next-level table.
    Table { addr: PhysAddr },
    /// 1 GiB or 2 MiB mapping at level 1 or 2.
    Block { addr: PhysAddr, attrs: MemAttr },
    /// 4 KiB mapping at level 3.
    Page { addr: PhysAddr, attrs: MemAttr },
}

impl Descriptor {
    pub fn encode(self) -> u64 {
        match self {
            Descriptor::Invalid => 0,
            Descriptor::Table { addr } => (addr.as_usize() as u64 & OUTPUT_ADDR_MASK) | DESC_TABLE,
            Descriptor::Block { addr, attrs } => {
                (addr.as_usize() as u64 & OUTPUT_ADDR_MASK) | attrs.bits() | DESC_BLOCK
            }
            Descriptor::Page { addr, attrs } => {
                (addr.as_usize() as u64 & OUTPUT_ADDR_MASK) | attrs.bits() | DESC_PAGE
            }
        }
    }

    /// Interprets `raw` as found in a table at `level`. Encodings the
    /// architecture reserves at that level read back as `Invalid`.
    pub fn decode(raw: u64, level: usize) -> Self {
        if raw & DESC_VALID == 0 {
            return Descriptor::Invalid;
        }
        let attrs = MemAttr::from_bits(raw);
        match (level, raw & DESC_TYPE_MASK) {
            (3, DESC_PAGE) => Descriptor::Page {
                addr: PhysAddr::from((raw & OUTPUT_ADDR_MASK) as usize),
                attrs,
            },
            (0..=2, DESC_TABLE) => Descriptor::Table {
                addr: PhysAddr::from((raw & OUTPUT_ADDR_MASK) as usize),
            },
            (1 | 2, DESC_BLOCK) => Descriptor::Block {
                addr: PhysAddr::from(
                    (raw & OUTPUT_ADDR_MASK & !(level_size(level) as u64 - 1)) as usize,
                ),
                attrs,
            },
            _ => Descriptor::Invalid,
        }
    }

    /// The final mapping at `level` for `addr`: a page at level 3, a block
    /// above it.
    pub fn leaf(level: usize, addr: PhysAddr, attrs: MemAttr) -> Self {
        debug_assert!(addr.as_usize() % level_size(level) == 0);
        if level == LEVELS - 1 {
            Descriptor::Page { addr, attrs }
        } else {
            Descriptor::Block { addr, attrs }
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, Descriptor::Invalid)
    }
}
