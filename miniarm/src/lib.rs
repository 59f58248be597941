//! Architecture support for a minimal Xen guest kernel on ARM64: the
//! translation tables and address-space layout, and the GICv2 driver.

#![cfg_attr(not(test), no_std)]

#[cfg_attr(
    all(target_arch = "aarch64", target_os = "none"),
    path = "arch/aarch64/mod.rs"
)]
#[cfg_attr(
    not(all(target_arch = "aarch64", target_os = "none")),
    path = "arch/host/mod.rs"
)]
pub mod arch;
pub mod config;
pub mod devtree;
pub mod error;
pub mod gic;
pub mod hypercall;
pub mod io;
#[cfg(all(target_os = "none", not(test)))]
mod lang_items;
pub mod logger;
pub mod mem;
