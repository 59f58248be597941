//! The Xen hypercalls needed to bring up memory and the grant table.

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
use log::debug;

numeric_enum_macro::numeric_enum! {
    #[repr(u64)]
    #[derive(Debug, Eq, PartialEq, Copy, Clone)]
    pub enum HypercallNr {
        MemoryOp = 12,
        GrantTableOp = 20,
    }
}

numeric_enum_macro::numeric_enum! {
    #[repr(u64)]
    #[derive(Debug, Eq, PartialEq, Copy, Clone)]
    pub enum MemoryOpCmd {
        AddToPhysmap = 7,
    }
}

numeric_enum_macro::numeric_enum! {
    #[repr(u64)]
    #[derive(Debug, Eq, PartialEq, Copy, Clone)]
    pub enum GnttabOpCmd {
        SetupTable = 2,
    }
}

pub const DOMID_SELF: u16 = 0x7ff0;
pub const XENMAPSPACE_GRANT_TABLE: u32 = 1;

pub type XenPfn = u64;

/// `struct xen_add_to_physmap`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XenAddToPhysmap {
    pub domid: u16,
    /// Only meaningful for `XENMAPSPACE_gmfn_range`.
    pub size: u16,
    pub space: u32,
    pub idx: u64,
    pub gpfn: XenPfn,
}

/// `struct gnttab_setup_table`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GnttabSetupTable {
    pub dom: u16,
    pub nr_frames: u32,
    pub status: i16,
    /// Guest handle of the frame list, filled in by the caller.
    pub frame_list: u64,
}

/// The hypervisor, as seen by the memory manager.
pub trait Hypervisor {
    /// `XENMEM_add_to_physmap`. Returns the raw hypercall result.
    fn add_to_physmap(&mut self, xatp: &mut XenAddToPhysmap) -> i64;

    /// `GNTTABOP_setup_table` for one table. Xen writes the frame numbers
    /// into `frames` and a status into `setup.status`.
    fn grant_table_setup(&mut self, setup: &mut GnttabSetupTable, frames: &mut [XenPfn]) -> i64;
}

/// Hypercalls through `hvc #0xEA1`.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
#[derive(Debug, Default)]
pub struct Hvc;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
impl Hvc {
    /// # Safety
    ///
    /// Pointer arguments must reference live memory laid out as Xen expects
    /// for `nr`.
    unsafe fn call(nr: HypercallNr, a0: u64, a1: u64, a2: u64) -> i64 {
        let ret: i64;
        unsafe {
            core::arch::asm!(
                "hvc #0xea1",
                inlateout("x0") a0 => ret,
                inlateout("x1") a1 => _,
                inlateout("x2") a2 => _,
                lateout("x3") _,
                lateout("x4") _,
                inlateout("x16") nr as u64 => _,
                options(nostack),
            );
        }
        ret
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
impl Hypervisor for Hvc {
    fn add_to_physmap(&mut self, xatp: &mut XenAddToPhysmap) -> i64 {
        debug!("hypercall: memory_op add_to_physmap {:x?}", xatp);
        unsafe {
            Self::call(
                HypercallNr::MemoryOp,
                MemoryOpCmd::AddToPhysmap as u64,
                xatp as *mut XenAddToPhysmap as u64,
                0,
            )
        }
    }

    fn grant_table_setup(&mut self, setup: &mut GnttabSetupTable, frames: &mut [XenPfn]) -> i64 {
        setup.frame_list = frames.as_mut_ptr() as u64;
        debug!("hypercall: grant_table_op setup_table {:x?}", setup);
        unsafe {
            Self::call(
                HypercallNr::GrantTableOp,
                GnttabOpCmd::SetupTable as u64,
                setup as *mut GnttabSetupTable as u64,
                1,
            )
        }
    }
}
