pub mod context;
mod cpu;
pub mod trap;

pub use cpu::*;
