//! GICv2 driver: distributor and CPU interface.
//!
//! Only what a single-vCPU Xen guest needs: the event channel upcall and
//! the virtual timer are routed to CPU 0, everything else is acknowledged
//! and dropped.

use core::ops::ControlFlow;

use log::{debug, error, info, warn};
use memory_addr::{PhysAddr, VirtAddr};
use spin::Once;

use crate::arch;
use crate::devtree::{DeviceTree, RegEntry, is_compatible};
use crate::io::{Mmio, RegisterBlock};
use crate::mem::MemoryManager;

// Distributor
const GICD_CTLR: usize = 0x0;
const GICD_ISENABLER: usize = 0x100;
const GICD_IPRIORITYR: usize = 0x400;
const GICD_ITARGETSR: usize = 0x800;
const GICD_ICFGR: usize = 0xc00;

// CPU interface
const GICC_CTLR: usize = 0x0;
const GICC_PMR: usize = 0x4;
const GICC_IAR: usize = 0xc;
const GICC_EOIR: usize = 0x10;
const GICC_HPPIR: usize = 0x18;

const INTID_MASK: u32 = 0x3ff;

/// Xen's event channel upcall.
pub const EVENTS_IRQ: u32 = 31;
pub const VIRTUALTIMER_IRQ: u32 = 27;

pub const COMPATIBLE: &[&str] = &["arm,cortex-a15-gic", "arm,cortex-a7-gic"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Level,
    Edge,
}

/// How an acknowledged interrupt was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqKind {
    Event,
    Timer,
    /// 1022 or 1023: nothing was acknowledged, so nothing is ended.
    Spurious(u32),
    Other(u32),
}

pub struct Gic<R: RegisterBlock = Mmio> {
    gicd: R,
    gicc: R,
}

impl Gic<Mmio> {
    /// Finds the first compatible `interrupt-controller` in `dt` and maps
    /// its distributor and CPU interface windows.
    pub fn discover(dt: &DeviceTree<'_>, mm: &mut MemoryManager<'_>) -> Self {
        let mut windows = None;
        dt.walk(&mut |node, cells| {
            if node.property("interrupt-controller").is_none() {
                return ControlFlow::Continue(());
            }
            if !is_compatible(&node, COMPATIBLE) {
                info!("Skipping incompatible interrupt-controller node {}", node.name);
                return ControlFlow::Continue(());
            }
            match DeviceTree::reg(&node, cells) {
                Some(reg) if reg.len() >= 2 => {
                    windows = Some((reg[0], reg[1]));
                    ControlFlow::Break(())
                }
                _ => {
                    warn!("interrupt-controller {} lacks gicd/gicc windows", node.name);
                    ControlFlow::Continue(())
                }
            }
        });
        let Some((gicd, gicc)) = windows else {
            error!("GIC not found!");
            panic!("no GICv2 in the device tree");
        };

        let (gicd_base, gicc_base) = (map_window(mm, gicd, "gicd"), map_window(mm, gicc, "gicc"));
        info!(
            "Found GIC: gicd_base = {:#x}, gicc_base = {:#x}",
            gicd_base.as_usize(),
            gicc_base.as_usize()
        );
        arch::wmb();
        unsafe {
            Self::new(
                Mmio::new(gicd_base, gicd.size as usize),
                Mmio::new(gicc_base, gicc.size as usize),
            )
        }
    }
}

fn map_window(mm: &mut MemoryManager<'_>, window: RegEntry, what: &str) -> VirtAddr {
    match mm.ioremap(PhysAddr::from(window.base as usize), window.size as usize) {
        Some(va) => va,
        None => {
            error!("cannot map {} at {:#x}+{:#x}", what, window.base, window.size);
            panic!("GIC window not mapped");
        }
    }
}

impl<R: RegisterBlock> Gic<R> {
    pub fn new(gicd: R, gicc: R) -> Self {
        Self { gicd, gicc }
    }

    pub fn distributor(&self) -> &R {
        &self.gicd
    }

    pub fn cpu_interface(&self) -> &R {
        &self.gicc
    }

    /// Brings both halves up and enables the event and timer lines.
    pub fn init(&self) {
        self.disable_interrupts();
        self.cpu_set_priority(0xff);
        // Forwarding must be on before any line is enabled.
        self.enable_interrupts();
        self.enable_interrupt(EVENTS_IRQ, 0x1, Trigger::Level);
        self.enable_interrupt(VIRTUALTIMER_IRQ, 0x1, Trigger::Level);
    }

    fn byte_lane(&self, base: usize, irq: u32, value: u8) {
        let shift = 8 * (irq & 0x3);
        self.gicd.modify32(base + (irq as usize >> 2) * 4, |old| {
            (old & !(0xff << shift)) | (u32::from(value) << shift)
        });
    }

    pub fn set_priority(&self, irq: u32, priority: u8) {
        self.byte_lane(GICD_IPRIORITYR, irq, priority);
    }

    pub fn route_interrupt(&self, irq: u32, cpu_set: u8) {
        self.byte_lane(GICD_ITARGETSR, irq, cpu_set);
    }

    /// Single-writer only: the trigger bit is updated with a plain
    /// read-modify-write.
    pub fn enable_interrupt(&self, irq: u32, cpu_set: u8, trigger: Trigger) {
        self.set_priority(irq, 0);
        self.route_interrupt(irq, cpu_set);

        let bit = irq as usize * 2 + 1;
        let mask = 1 << (bit & 0x1f);
        self.gicd.modify32(GICD_ICFGR + (bit >> 5) * 4, |cfg| match trigger {
            Trigger::Level => cfg & !mask,
            Trigger::Edge => cfg | mask,
        });
        arch::wmb();

        self.gicd
            .write32(GICD_ISENABLER + (irq as usize >> 5) * 4, 1 << (irq & 0x1f));
        arch::wmb();
        debug!("irq {} enabled for cpus {:#x} ({:?})", irq, cpu_set, trigger);
    }

    pub fn enable_interrupts(&self) {
        self.gicd.write32(GICD_CTLR, 1);
        self.gicc.write32(GICC_CTLR, 1);
    }

    pub fn disable_interrupts(&self) {
        self.gicc.write32(GICC_CTLR, 0);
        self.gicd.write32(GICD_CTLR, 0);
    }

    pub fn cpu_set_priority(&self, priority: u8) {
        self.gicc.write32(GICC_PMR, u32::from(priority));
    }

    /// Acknowledges the highest priority pending interrupt.
    pub fn read_iar(&self) -> u32 {
        self.gicc.read32(GICC_IAR) & INTID_MASK
    }

    pub fn highest_pending(&self) -> u32 {
        self.gicc.read32(GICC_HPPIR) & INTID_MASK
    }

    pub fn eoi(&self, irq: u32) {
        self.gicc.write32(GICC_EOIR, irq & INTID_MASK);
    }

    /// Acknowledges one interrupt, runs `on_event` for the event channel
    /// line and signals end of interrupt unless it was spurious.
    pub fn handle_irq(&self, on_event: impl FnOnce()) -> IrqKind {
        let irq = self.read_iar();
        debug!("IRQ received: {}", irq);
        let kind = match irq {
            EVENTS_IRQ => {
                on_event();
                IrqKind::Event
            }
            // Only needed to wake the CPU from wfi.
            VIRTUALTIMER_IRQ => IrqKind::Timer,
            1022 | 1023 => return IrqKind::Spurious(irq),
            other => {
                debug!("Unhandled irq {}", other);
                IrqKind::Other(other)
            }
        };
        self.eoi(irq);
        kind
    }
}

struct Installed {
    gic: Gic<Mmio>,
    on_event: fn(),
}

static GIC: Once<Installed> = Once::new();

/// Makes `gic` the controller the IRQ vector dispatches through, with
/// `on_event` as the event channel upcall.
pub fn install(gic: Gic<Mmio>, on_event: fn()) -> &'static Gic<Mmio> {
    if GIC.is_completed() {
        panic!("GIC installed twice");
    }
    &GIC.call_once(|| Installed { gic, on_event }).gic
}

pub fn installed() -> Option<&'static Gic<Mmio>> {
    GIC.get().map(|installed| &installed.gic)
}

/// Entry from the IRQ exception vector.
pub fn handle_irq() -> Option<IrqKind> {
    match GIC.get() {
        Some(installed) => Some(installed.gic.handle_irq(installed.on_event)),
        None => {
            warn!("IRQ taken before the GIC was installed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::{Cell, RefCell};
    use std::collections::BTreeMap;
    use std::rc::Rc;
    use std::vec::Vec;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Op {
        Read,
        Write,
    }

    type Trace = Rc<RefCell<Vec<(&'static str, Op, usize, u32)>>>;

    struct Recorder {
        name: &'static str,
        regs: RefCell<BTreeMap<usize, u32>>,
        trace: Trace,
    }

    impl Recorder {
        fn get(&self, offset: usize) -> u32 {
            self.regs.borrow().get(&offset).copied().unwrap_or(0)
        }

        fn set(&self, offset: usize, value: u32) {
            self.regs.borrow_mut().insert(offset, value);
        }
    }

    impl RegisterBlock for Recorder {
        fn read32(&self, offset: usize) -> u32 {
            let value = self.get(offset);
            self.trace.borrow_mut().push((self.name, Op::Read, offset, value));
            value
        }

        fn write32(&self, offset: usize, value: u32) {
            self.trace.borrow_mut().push((self.name, Op::Write, offset, value));
            self.set(offset, value);
        }
    }

    fn gic() -> (Gic<Recorder>, Trace) {
        let trace = Trace::default();
        let block = |name| Recorder {
            name,
            regs: RefCell::default(),
            trace: trace.clone(),
        };
        (Gic::new(block("gicd"), block("gicc")), trace)
    }

    fn writes(trace: &Trace) -> Vec<(&'static str, usize, u32)> {
        trace
            .borrow()
            .iter()
            .filter(|(_, op, _, _)| *op == Op::Write)
            .map(|&(name, _, offset, value)| (name, offset, value))
            .collect()
    }

    #[test]
    fn init_enables_forwarding_before_any_line() {
        let (gic, trace) = gic();
        gic.init();
        let writes = writes(&trace);
        assert_eq!(
            writes[..5],
            [
                ("gicc", GICC_CTLR, 0),
                ("gicd", GICD_CTLR, 0),
                ("gicc", GICC_PMR, 0xff),
                ("gicd", GICD_CTLR, 1),
                ("gicc", GICC_CTLR, 1),
            ]
        );
        let enables: Vec<_> = writes
            .iter()
            .filter(|(_, offset, _)| *offset == GICD_ISENABLER)
            .map(|&(_, _, value)| value)
            .collect();
        assert_eq!(enables, [1 << EVENTS_IRQ, 1 << VIRTUALTIMER_IRQ]);
    }

    #[test]
    fn priority_and_target_touch_one_byte_lane() {
        let (gic, _) = gic();
        gic.distributor().set(0x418, 0xaabb_ccdd);
        gic.distributor().set(0x818, 0x1122_3344);
        gic.set_priority(27, 0x40);
        gic.route_interrupt(27, 0x01);
        assert_eq!(gic.distributor().get(0x418), 0x40bb_ccdd);
        assert_eq!(gic.distributor().get(0x818), 0x0122_3344);

        gic.set_priority(29, 0x80);
        assert_eq!(gic.distributor().get(0x41c), 0x0000_8000);
    }

    #[test]
    fn trigger_bit_is_the_odd_one() {
        let (gic, _) = gic();
        gic.distributor().set(GICD_ICFGR + 4, u32::MAX);
        gic.enable_interrupt(31, 0x1, Trigger::Level);
        assert_eq!(gic.distributor().get(GICD_ICFGR + 4), 0x7fff_ffff);

        gic.enable_interrupt(40, 0x1, Trigger::Edge);
        assert_eq!(gic.distributor().get(GICD_ICFGR + 8), 1 << 17);
        assert_eq!(gic.distributor().get(GICD_ISENABLER + 4), 1 << 8);
    }

    #[test]
    fn line_is_configured_before_it_is_enabled() {
        let (gic, trace) = gic();
        gic.enable_interrupt(EVENTS_IRQ, 0x1, Trigger::Level);
        let offsets: Vec<_> = writes(&trace).iter().map(|&(_, offset, _)| offset).collect();
        assert_eq!(offsets, [0x41c, 0x81c, GICD_ICFGR + 4, GICD_ISENABLER]);
    }

    #[test]
    fn dispatch_table() {
        let (gic, _) = gic();
        let events = Cell::new(0);

        gic.cpu_interface().set(GICC_IAR, EVENTS_IRQ);
        assert_eq!(gic.handle_irq(|| events.set(events.get() + 1)), IrqKind::Event);
        assert_eq!(events.get(), 1);
        assert_eq!(gic.cpu_interface().get(GICC_EOIR), EVENTS_IRQ);

        gic.cpu_interface().set(GICC_IAR, VIRTUALTIMER_IRQ);
        assert_eq!(gic.handle_irq(|| events.set(events.get() + 1)), IrqKind::Timer);
        assert_eq!(events.get(), 1);
        assert_eq!(gic.cpu_interface().get(GICC_EOIR), VIRTUALTIMER_IRQ);

        // The CPU id field of the IAR is not part of the interrupt id.
        gic.cpu_interface().set(GICC_IAR, 0xc00 | 45);
        assert_eq!(gic.handle_irq(|| unreachable!()), IrqKind::Other(45));
        assert_eq!(gic.cpu_interface().get(GICC_EOIR), 45);
    }

    /// Distributor and CPU interface state shared by both halves of
    /// [`Model`]. A pending line is only signalled once it is enabled and
    /// both control registers are on.
    #[derive(Default)]
    struct Lines {
        gicd_ctlr: u32,
        gicc_ctlr: u32,
        enabled: u64,
        pending: u64,
        eois: Vec<u32>,
    }

    struct Model {
        cpu: bool,
        lines: Rc<RefCell<Lines>>,
    }

    impl RegisterBlock for Model {
        fn read32(&self, offset: usize) -> u32 {
            let mut lines = self.lines.borrow_mut();
            match (self.cpu, offset) {
                (true, GICC_IAR) => {
                    let ready = lines.pending & lines.enabled;
                    if lines.gicd_ctlr & 1 == 0 || lines.gicc_ctlr & 1 == 0 || ready == 0 {
                        return 1023;
                    }
                    let irq = ready.trailing_zeros();
                    lines.pending &= !(1 << irq);
                    irq
                }
                _ => 0,
            }
        }

        fn write32(&self, offset: usize, value: u32) {
            let mut lines = self.lines.borrow_mut();
            match (self.cpu, offset) {
                (false, GICD_CTLR) => lines.gicd_ctlr = value,
                (false, GICD_ISENABLER) => lines.enabled |= u64::from(value),
                (false, o) if o == GICD_ISENABLER + 4 => lines.enabled |= u64::from(value) << 32,
                (true, GICC_CTLR) => lines.gicc_ctlr = value,
                (true, GICC_EOIR) => lines.eois.push(value),
                _ => {}
            }
        }
    }

    #[test]
    fn pending_line_waits_for_forwarding() {
        let lines = Rc::new(RefCell::new(Lines {
            pending: 1 << EVENTS_IRQ | 1 << 40,
            ..Default::default()
        }));
        let model = |cpu| Model {
            cpu,
            lines: lines.clone(),
        };
        let gic = Gic::new(model(false), model(true));
        let events = Cell::new(0);

        gic.disable_interrupts();
        gic.enable_interrupt(EVENTS_IRQ, 0x1, Trigger::Level);
        assert_eq!(gic.handle_irq(|| events.set(events.get() + 1)), IrqKind::Spurious(1023));
        assert_eq!(events.get(), 0);
        assert!(lines.borrow().eois.is_empty());

        gic.enable_interrupts();
        assert_eq!(gic.handle_irq(|| events.set(events.get() + 1)), IrqKind::Event);
        assert_eq!(events.get(), 1);
        assert_eq!(lines.borrow().eois, [EVENTS_IRQ]);

        // Line 40 is pending but was never enabled.
        assert_eq!(gic.handle_irq(|| events.set(events.get() + 1)), IrqKind::Spurious(1023));
        assert_eq!(lines.borrow().eois, [EVENTS_IRQ]);
    }

    #[test]
    fn spurious_ids_are_not_ended() {
        let (gic, trace) = gic();
        for id in [1022, 1023] {
            gic.cpu_interface().set(GICC_IAR, id);
            assert_eq!(gic.handle_irq(|| unreachable!()), IrqKind::Spurious(id));
        }
        assert!(writes(&trace).is_empty());
    }
}
