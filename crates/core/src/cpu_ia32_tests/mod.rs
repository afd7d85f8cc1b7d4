//! Tests for the IA-32 interpreter core
//!
//! Tests are organized by instruction family:
//! - `tests_alu`: integer ALU, TEST, NOT/NEG, INC/DEC, SETcc, flag ops
//! - `tests_mul_div`: MUL/IMUL/DIV/IDIV and #DE
//! - `tests_stack`: PUSH/POP, PUSHA/POPA
//! - `tests_bits`: BT/BTS/BTR/BTC, BSF/BSR, BSWAP
//! - `tests_shifts`: group 2 shifts and rotates, SHLD/SHRD
//! - `tests_string`: CMPS/SCAS with repeat prefixes
//! - `tests_control`: near jumps, calls, returns and loops
//! - `tests_far`: far transfers, call gates, outer-level returns
//! - `tests_io`: IN/OUT/INS/OUTS and the I/O permission bitmap
//! - `tests_fpu`: x87 instructions and exception handling
//!
//! The helpers below build a real-mode machine or a flat 32-bit
//! protected-mode machine with a small GDT and a TSS.

mod tests_alu;
mod tests_fpu;
mod tests_io;
mod tests_mul_div;
mod tests_string;

use crate::cpu_ia32::{ArrayMemory, CpuIa32};
use crate::cpu_ia32_protected::{SegmentRegister, Seg, CR0_PE};
use crate::fault::Result;

pub(crate) type TestCpu = CpuIa32<ArrayMemory>;

/// Real-mode code is loaded at 0000:1000.
pub(crate) const REAL_CODE: u32 = 0x1000;
/// Protected-mode code is loaded at linear (and flat offset) 0x10000.
pub(crate) const FLAT_CODE: u32 = 0x10000;

pub(crate) const GDT_BASE: u32 = 0x500;
pub(crate) const TSS_BASE: u32 = 0x3000;
/// TSS limit: 104-byte header plus an I/O bitmap for all 65536 ports and
/// the trailing 0xFF byte.
pub(crate) const TSS_LIMIT: u32 = 0x68 + 0x2000;

pub(crate) const SEL_CODE0: u16 = 0x08;
pub(crate) const SEL_DATA0: u16 = 0x10;
pub(crate) const SEL_CODE3: u16 = 0x1B;
pub(crate) const SEL_DATA3: u16 = 0x23;
pub(crate) const SEL_TSS: u16 = 0x28;
pub(crate) const SEL_GATE: u16 = 0x33;
pub(crate) const SEL_CODE16: u16 = 0x38;

/// Call-gate target in the ring-0 code segment.
pub(crate) const GATE_TARGET: u32 = 0x20000;
/// Ring-0 stack pointer stored in the TSS.
pub(crate) const RING0_ESP: u32 = 0x90000;

/// Eight descriptor bytes for a segment.
pub(crate) fn segment_descriptor(base: u32, limit: u32, access: u8, flags: u8) -> [u8; 8] {
    [
        limit as u8,
        (limit >> 8) as u8,
        base as u8,
        (base >> 8) as u8,
        (base >> 16) as u8,
        access,
        (flags << 4) | ((limit >> 16) as u8 & 0x0F),
        (base >> 24) as u8,
    ]
}

/// Eight descriptor bytes for a 32-bit call gate.
pub(crate) fn call_gate(selector: u16, offset: u32, dpl: u8, params: u8) -> [u8; 8] {
    let low = ((selector as u32) << 16) | (offset & 0xFFFF);
    let high = (offset & 0xFFFF_0000) | 0x8000 | ((dpl as u32) << 13) | (0x0C << 8) | (params as u32 & 0x1F);
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&low.to_le_bytes());
    out[4..].copy_from_slice(&high.to_le_bytes());
    out
}

/// Real-mode machine with `program` at CS:IP = 0000:1000 and SS:SP = 0000:8000.
pub(crate) fn real_cpu(program: &[u8]) -> TestCpu {
    let mut mem = ArrayMemory::with_size(0x100000);
    mem.load_program(REAL_CODE, program);
    let mut cpu = CpuIa32::new(mem);
    cpu.load_segment_real(Seg::CS, 0);
    cpu.eip = REAL_CODE;
    cpu.regs[4] = 0x8000;
    cpu
}

/// Flat protected-mode machine at `cpl` (0 or 3) with `program` at
/// 0x10000. The TSS grants every port in its bitmap.
pub(crate) fn flat_cpu(cpl: u8, program: &[u8]) -> TestCpu {
    let mut mem = ArrayMemory::with_size(0x100000);
    let gdt: [[u8; 8]; 8] = [
        [0; 8],
        segment_descriptor(0, 0xFFFFF, 0x9A, 0xC),
        segment_descriptor(0, 0xFFFFF, 0x92, 0xC),
        segment_descriptor(0, 0xFFFFF, 0xFA, 0xC),
        segment_descriptor(0, 0xFFFFF, 0xF2, 0xC),
        segment_descriptor(TSS_BASE, TSS_LIMIT, 0x89, 0x0),
        call_gate(SEL_CODE0, GATE_TARGET, 3, 0),
        segment_descriptor(0, 0xFFFF, 0x9A, 0x0),
    ];
    for (i, desc) in gdt.iter().enumerate() {
        mem.load_program(GDT_BASE + i as u32 * 8, desc);
    }
    // ESP0/SS0 and the bitmap base
    mem.write_u32(TSS_BASE + 4, RING0_ESP);
    mem.write_u16(TSS_BASE + 8, SEL_DATA0);
    mem.write_u16(TSS_BASE + 102, 0x68);
    mem.load_program(TSS_BASE + 0x68 + 0x2000, &[0xFF]);
    mem.load_program(FLAT_CODE, program);

    let mut cpu = CpuIa32::new(mem);
    cpu.gdtr.base = GDT_BASE;
    cpu.gdtr.limit = (gdt.len() * 8 - 1) as u16;
    cpu.cr0 |= CR0_PE;
    let (code, data) = if cpl == 3 { (SEL_CODE3, SEL_DATA3) } else { (SEL_CODE0, SEL_DATA0) };
    load_protected(&mut cpu, Seg::CS, code).expect("code descriptor");
    for seg in [Seg::SS, Seg::DS, Seg::ES, Seg::FS, Seg::GS] {
        load_protected(&mut cpu, seg, data).expect("data descriptor");
    }
    let tss = cpu.read_descriptor(SEL_TSS).expect("tss descriptor");
    cpu.tr = SegmentRegister::from_descriptor(SEL_TSS, &tss);
    cpu.eip = FLAT_CODE;
    cpu.regs[4] = 0x80000;
    cpu
}

/// Load a segment register from the GDT without the architectural checks.
pub(crate) fn load_protected(cpu: &mut TestCpu, seg: Seg, selector: u16) -> Result<()> {
    let desc = cpu.read_descriptor(selector)?;
    cpu.segs[seg as usize] = SegmentRegister::from_descriptor(selector, &desc);
    Ok(())
}

/// Execute `n` instructions, stopping at the first fault.
pub(crate) fn run(cpu: &mut TestCpu, n: usize) -> Result<()> {
    for _ in 0..n {
        cpu.step()?;
    }
    Ok(())
}
