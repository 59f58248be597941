//! Host-side stand-in for a slice of physical memory.

use std::vec;
use std::vec::Vec;

use memory_addr::PhysAddr;

use super::{PAGE_SIZE, PhysMap};

const ALIGN: usize = 2 << 20;

/// Zeroed host memory posing as `pages` physical pages from `base`.
/// The host copy is 2 MiB aligned, so block alignment of physical
/// addresses carries over to their linear-map addresses.
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

    pub fn fill(&self, byte: u8) {
        unsafe { core::ptr::write_bytes(self.start as *mut u8, byte, self.len) };
    }

    pub fn page(&self, paddr: PhysAddr) -> &[u8] {
        let offset = paddr.as_usize() - self.base;
        assert!(offset + PAGE_SIZE <= self.len, "{paddr:?} outside the arena");
        unsafe { core::slice::from_raw_parts((self.start + offset) as *const u8, PAGE_SIZE) }
    }
}
