use log::error;

use super::context::{FaultReport, TrapFrame};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum BadModeReason {
    Synchronous = 0,
    Irq = 1,
    Fiq = 2,
    SError = 3,
}

impl BadModeReason {
    fn from_raw(reason: u32) -> Option<Self> {
        match reason {
            0 => Some(Self::Synchronous),
            1 => Some(Self::Irq),
            2 => Some(Self::Fiq),
            3 => Some(Self::SError),
            _ => None,
        }
    }
}

/// Logs a full register dump for an unrecoverable exception.
pub fn dump_regs(regs: &TrapFrame, esr: u64, far: u64) {
    error!("{}", FaultReport { regs, esr, far });
}

/// Vector for exceptions taken from a mode the kernel never expects.
#[unsafe(no_mangle)]
pub extern "C" fn do_bad_mode(regs: &TrapFrame, reason: u32, esr: u64, far: u64) -> ! {
    error!(
        "Bad abort number: {} ({:?})",
        reason,
        BadModeReason::from_raw(reason)
    );
    dump_regs(regs, esr, far);
    super::shutdown()
}

/// Synchronous exceptions are never recoverable here.
#[unsafe(no_mangle)]
pub extern "C" fn do_sync(regs: &TrapFrame, esr: u64, far: u64) -> ! {
    dump_regs(regs, esr, far);
    super::shutdown()
}

#[unsafe(no_mangle)]
pub extern "C" fn handle_irq_exception(_regs: &TrapFrame) {
    crate::gic::handle_irq();
}
