mod common;

use common::{Arena, FdtBuilder, GNTTAB_BASE, MockHypervisor, guest_tree};
use memory_addr::VirtAddr;
use miniarm::devtree::DeviceTree;
use miniarm::hypercall::{DOMID_SELF, XENMAPSPACE_GRANT_TABLE};
use miniarm::mem::{MemAttr, MemoryManager, PAGE_SIZE, VIRT_DEMAND_AREA};

const RAM_BASE: usize = 0x4000_0000;

fn manager(arena: &Arena) -> MemoryManager<'static> {
    MemoryManager::new(arena.phys(), arena.image(0, 0x2000)).unwrap()
}

#[test]
fn four_frames_are_placed_set_up_and_mapped() {
    let arena = Arena::new(RAM_BASE, 32);
    let blob = guest_tree(RAM_BASE as u64, 0x1000_0000);
    let dt = DeviceTree::new(&blob).unwrap();
    let mut mm = manager(&arena);
    let base_pfn = GNTTAB_BASE >> 12;
    let mut hyp = MockHypervisor {
        base_pfn,
        ..Default::default()
    };

    let table = mm.init_gnttab(&dt, &mut hyp, 4);

    assert_eq!(hyp.physmap_calls.len(), 4);
    for (i, xatp) in hyp.physmap_calls.iter().enumerate() {
        assert_eq!(xatp.domid, DOMID_SELF);
        assert_eq!(xatp.space, XENMAPSPACE_GRANT_TABLE);
        assert_eq!(xatp.idx, i as u64);
        assert_eq!(xatp.gpfn, base_pfn + i as u64);
    }
    assert_eq!(hyp.setup_calls.len(), 1);
    assert_eq!(hyp.setup_calls[0].dom, DOMID_SELF);
    assert_eq!(hyp.setup_calls[0].nr_frames, 4);

    assert_eq!(table, VirtAddr::from(VIRT_DEMAND_AREA));
    for i in 0..4 {
        let t = mm.translate(table + i * PAGE_SIZE + 0x10).unwrap();
        assert_eq!(t.paddr.as_usize(), GNTTAB_BASE as usize + i * PAGE_SIZE + 0x10);
        assert_eq!(t.attrs, MemAttr::NORMAL);
    }
    assert!(mm.translate(table + 4 * PAGE_SIZE).is_none());
}

#[test]
#[should_panic(expected = "grant table setup failed")]
fn setup_status_is_checked() {
    let arena = Arena::new(RAM_BASE, 32);
    let blob = guest_tree(RAM_BASE as u64, 0x1000_0000);
    let dt = DeviceTree::new(&blob).unwrap();
    let mut mm = manager(&arena);
    let mut hyp = MockHypervisor {
        setup_status: -1,
        ..Default::default()
    };
    mm.init_gnttab(&dt, &mut hyp, 4);
}

#[test]
#[should_panic(expected = "cannot place the grant table")]
fn physmap_failure_is_fatal() {
    let arena = Arena::new(RAM_BASE, 32);
    let blob = guest_tree(RAM_BASE as u64, 0x1000_0000);
    let dt = DeviceTree::new(&blob).unwrap();
    let mut mm = manager(&arena);
    let mut hyp = MockHypervisor {
        physmap_rc: -22,
        ..Default::default()
    };
    mm.init_gnttab(&dt, &mut hyp, 1);
}

#[test]
#[should_panic(expected = "grant table base unknown")]
fn a_tree_without_xen_is_fatal() {
    let arena = Arena::new(RAM_BASE, 32);
    let mut fdt = FdtBuilder::new();
    fdt.begin_node("").end_node();
    let blob = fdt.finish();
    let dt = DeviceTree::new(&blob).unwrap();
    let mut mm = manager(&arena);
    mm.init_gnttab(&dt, &mut MockHypervisor::default(), 4);
}
