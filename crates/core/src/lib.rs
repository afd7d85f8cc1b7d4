//! IA-32 interpreter core.
//!
//! Decodes and executes a subset of the 32-bit x86 instruction set with
//! real-mode, protected-mode and virtual-8086 segmentation, privilege and
//! I/O permission checks, far transfers through call gates, and an x87
//! FPU with 80-bit extended precision. Memory and I/O ports are supplied
//! by the host through [`cpu_ia32::MemoryIa32`].

pub mod cpu_ia32;
pub mod cpu_ia32_protected;
pub mod fault;
pub mod flags;
pub mod fpu;
pub mod logging;

#[cfg(test)]
mod cpu_ia32_tests;

/// A CPU-like component that can be stepped one instruction at a time.
pub trait Cpu {
    fn reset(&mut self);

    /// Execute one instruction. A fault leaves EIP at the faulting
    /// instruction so the host can deliver it and resume.
    fn step(&mut self) -> fault::Result<()>;
}
