use core::fmt::{Display, Formatter, Result};

/// Registers saved by the exception vectors before calling into Rust.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TrapFrame {
    /// General-purpose registers (X0..X29).
    pub x: [u64; 30],
    /// Link register (X30).
    pub lr: u64,
    /// Stack pointer at the time of the exception.
    pub sp: u64,
    /// Exception Link Register (ELR_EL1).
    pub pc: u64,
    /// Saved Process Status Register (SPSR_EL1).
    pub pstate: u64,
}

/// A trap frame together with the fault syndrome registers.
pub struct FaultReport<'a> {
    pub regs: &'a TrapFrame,
    pub esr: u64,
    pub far: u64,
}

impl Display for FaultReport<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let regs = self.regs;
        writeln!(f, "*** Sync exception at PC = {:#x} ***", regs.pc)?;
        writeln!(f, "Thread state:")?;
        for pair in (0..30).step_by(2) {
            writeln!(
                f,
                "\tX{:<2} = {:#018x} X{:<2} = {:#018x}",
                pair,
                regs.x[pair],
                pair + 1,
                regs.x[pair + 1]
            )?;
        }
        writeln!(f, "\tX30 (lr) = {:#018x}", regs.lr)?;
        writeln!(f, "\tsp  = {:#018x}", regs.sp)?;
        writeln!(f, "\tpstate  = {:#018x}", regs.pstate)?;
        writeln!(f, "\tesr_el1 = {:08x}", self.esr)?;
        write!(f, "\tfar_el1 = {:08x}", self.far)
    }
}
