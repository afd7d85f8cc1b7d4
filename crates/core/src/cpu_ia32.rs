//! IA-32 interpreter core
//!
//! A generic, reusable IA-32 execution engine. Systems plug in their
//! memory and port space by implementing `MemoryIa32`; everything else
//! (register file, segment caches, x87 unit, the instruction handlers)
//! lives in `CpuIa32`.
//!
//! `step()` executes exactly one instruction. Handlers report faults by
//! returning `Err(Fault)`; the caller decides how to deliver them.

mod addressing;
mod alu;
mod bits;
mod control;
mod decode;
mod far;
mod io;
mod mul_div;
mod shifts;
mod stack;
mod string;
mod x87_arith;
mod x87_load_store;
mod x87_misc;

pub use addressing::EffectiveAddress;
pub use alu::AluOp;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cpu_ia32_protected::{
    DescriptorTableRegister, Seg, SegmentRegister, CR0_ET, CR0_PE,
};
use crate::fault::{Fault, Result};
use crate::flags::{Operand, FLAG_CF, FLAG_DF, FLAG_RESERVED, FLAG_VM, FLAG_ZF};
use crate::fpu::Fpu;
use crate::logging::{log, LogCategory, LogLevel};

pub const REG_EAX: u8 = 0;
pub const REG_ECX: u8 = 1;
pub const REG_EDX: u8 = 2;
pub const REG_EBX: u8 = 3;
pub const REG_ESP: u8 = 4;
pub const REG_EBP: u8 = 5;
pub const REG_ESI: u8 = 6;
pub const REG_EDI: u8 = 7;

/// Memory and port interface for the IA-32 core
///
/// Addresses are linear; segmentation is applied by the CPU. Paging, if
/// any, lives behind this trait and reports failures as faults. The CPU's
/// segment checks cover limits and rights only, so a multi-byte store
/// goes through `check_write` for the whole range before the first byte
/// is written.
pub trait MemoryIa32 {
    fn read(&self, linear: u32) -> Result<u8>;

    fn write(&mut self, linear: u32, val: u8) -> Result<()>;

    /// Fault that a store of `len` bytes at `linear` would raise. An
    /// implementation that accepts every range leaves a store that faults
    /// in `write` partly done.
    fn check_write(&self, _linear: u32, _len: u32) -> Result<()> {
        Ok(())
    }

    fn io_read_u8(&mut self, _port: u16) -> u8 {
        0xFF
    }

    fn io_read_u16(&mut self, port: u16) -> u16 {
        let lo = self.io_read_u8(port) as u16;
        let hi = self.io_read_u8(port.wrapping_add(1)) as u16;
        (hi << 8) | lo
    }

    fn io_read_u32(&mut self, port: u16) -> u32 {
        let lo = self.io_read_u16(port) as u32;
        let hi = self.io_read_u16(port.wrapping_add(2)) as u32;
        (hi << 16) | lo
    }

    fn io_write_u8(&mut self, _port: u16, _val: u8) {}

    fn io_write_u16(&mut self, port: u16, val: u16) {
        self.io_write_u8(port, val as u8);
        self.io_write_u8(port.wrapping_add(1), (val >> 8) as u8);
    }

    fn io_write_u32(&mut self, port: u16, val: u32) {
        self.io_write_u16(port, val as u16);
        self.io_write_u16(port.wrapping_add(2), (val >> 16) as u16);
    }
}

/// What REP-prefixed BSF/BSR do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RepBitScan {
    /// Log a warning and execute as plain BSF/BSR.
    #[default]
    WarnAndIgnore,
    /// Raise #UD.
    InvalidOpcode,
}

/// Tunables for behaviours where hardware documentation is unclear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub rep_bit_scan: RepBitScan,
    /// FST/FSTP to memory: when the conversion overflowed or underflowed,
    /// the inexact result is not reported and C1 is cleared.
    pub fst_inexact_after_overflow_clears_c1: bool,
    /// FDIV/FDIVR: every zero divisor raises ZE before dividing, so 0/0
    /// reports ZE as well as IE and inf/0 reports ZE. When false only a
    /// finite nonzero dividend raises ZE.
    pub fdiv_any_zero_divisor_raises_ze: bool,
    pub memory_size: usize,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            rep_bit_scan: RepBitScan::WarnAndIgnore,
            fst_inexact_after_overflow_clears_c1: true,
            fdiv_any_zero_divisor_raises_ze: false,
            memory_size: 16 * 1024 * 1024,
        }
    }
}

impl CpuConfig {
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RepPrefix {
    /// F3: REP / REPE
    Rep,
    /// F2: REPNE
    Repne,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Prefixes {
    pub lock: bool,
    pub rep: Option<RepPrefix>,
    pub segment: Option<Seg>,
    pub operand_size: bool,
    pub address_size: bool,
}

/// IA-32 CPU state and execution engine
#[derive(Debug)]
pub struct CpuIa32<M: MemoryIa32> {
    /// EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI
    pub regs: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
    pub cr0: u32,
    /// Segment caches indexed by `Seg`.
    pub segs: [SegmentRegister; 6],
    pub gdtr: DescriptorTableRegister,
    pub idtr: DescriptorTableRegister,
    pub ldtr: SegmentRegister,
    pub tr: SegmentRegister,
    pub fpu: Fpu,
    pub memory: M,
    pub config: CpuConfig,
    /// Instructions retired.
    pub instructions: u64,
    pub(crate) prefixes: Prefixes,
    /// EIP of the first prefix byte of the current instruction.
    pub(crate) old_eip: u32,
}

/// Architectural state as stored in save states.
#[derive(Serialize, Deserialize)]
struct CpuState {
    regs: [u32; 8],
    eip: u32,
    eflags: u32,
    cr0: u32,
    segs: [SegmentRegister; 6],
    gdtr: DescriptorTableRegister,
    idtr: DescriptorTableRegister,
    ldtr: SegmentRegister,
    tr: SegmentRegister,
    fpu: Fpu,
}

impl<M: MemoryIa32> CpuIa32<M> {
    pub fn new(memory: M) -> Self {
        Self::with_config(memory, CpuConfig::default())
    }

    pub fn with_config(memory: M, config: CpuConfig) -> Self {
        let mut cpu = Self {
            regs: [0; 8],
            eip: 0,
            eflags: FLAG_RESERVED,
            cr0: CR0_ET,
            segs: [SegmentRegister::default(); 6],
            gdtr: DescriptorTableRegister::default(),
            idtr: DescriptorTableRegister { base: 0, limit: 0x3FF },
            ldtr: SegmentRegister::null(0),
            tr: SegmentRegister::null(0),
            fpu: Fpu::new(),
            memory,
            config,
            instructions: 0,
            prefixes: Prefixes::default(),
            old_eip: 0,
        };
        cpu.reset();
        cpu
    }

    /// Real-mode power-on state: CS:EIP = F000:FFF0 with the CS base at
    /// 0xF0000.
    pub fn reset(&mut self) {
        self.regs = [0; 8];
        self.eip = 0xFFF0;
        self.eflags = FLAG_RESERVED;
        self.cr0 = CR0_ET;
        for seg in Seg::ALL {
            self.segs[seg as usize] = SegmentRegister::real_mode(0, false);
        }
        self.segs[Seg::CS as usize] = SegmentRegister::real_mode(0xF000, false);
        self.gdtr = DescriptorTableRegister::default();
        self.idtr = DescriptorTableRegister { base: 0, limit: 0x3FF };
        self.ldtr = SegmentRegister::null(0);
        self.tr = SegmentRegister::null(0);
        self.fpu = Fpu::new();
        self.instructions = 0;
        self.prefixes = Prefixes::default();
        self.old_eip = self.eip;
    }

    // Register file

    #[inline]
    pub fn reg8(&self, r: u8) -> u8 {
        let r = r as usize & 7;
        if r < 4 {
            self.regs[r] as u8
        } else {
            (self.regs[r - 4] >> 8) as u8
        }
    }

    #[inline]
    pub fn set_reg8(&mut self, r: u8, val: u8) {
        let r = r as usize & 7;
        if r < 4 {
            self.regs[r] = (self.regs[r] & 0xFFFF_FF00) | val as u32;
        } else {
            self.regs[r - 4] = (self.regs[r - 4] & 0xFFFF_00FF) | ((val as u32) << 8);
        }
    }

    #[inline]
    pub fn reg16(&self, r: u8) -> u16 {
        self.regs[r as usize & 7] as u16
    }

    #[inline]
    pub fn set_reg16(&mut self, r: u8, val: u16) {
        let r = r as usize & 7;
        self.regs[r] = (self.regs[r] & 0xFFFF_0000) | val as u32;
    }

    #[inline]
    pub fn reg32(&self, r: u8) -> u32 {
        self.regs[r as usize & 7]
    }

    #[inline]
    pub fn set_reg32(&mut self, r: u8, val: u32) {
        self.regs[r as usize & 7] = val;
    }

    /// Register `r` viewed at width `W`, zero-extended.
    #[inline]
    pub(crate) fn reg<W: Operand>(&self, r: u8) -> u32 {
        match W::BITS {
            8 => self.reg8(r) as u32,
            16 => self.reg16(r) as u32,
            _ => self.reg32(r),
        }
    }

    #[inline]
    pub(crate) fn set_reg<W: Operand>(&mut self, r: u8, val: u32) {
        match W::BITS {
            8 => self.set_reg8(r, val as u8),
            16 => self.set_reg16(r, val as u16),
            _ => self.set_reg32(r, val),
        }
    }

    // Flags and modes

    #[inline]
    pub fn get_flag(&self, flag: u32) -> bool {
        self.eflags & flag != 0
    }

    #[inline]
    pub fn set_flag(&mut self, flag: u32, value: bool) {
        crate::flags::set_flag(&mut self.eflags, flag, value);
    }

    #[inline]
    pub fn protected_mode(&self) -> bool {
        self.cr0 & CR0_PE != 0
    }

    #[inline]
    pub fn vm86(&self) -> bool {
        self.eflags & FLAG_VM != 0
    }

    /// Protected mode proper: PE set and not in virtual-8086 mode.
    #[inline]
    pub(crate) fn protected_not_vm(&self) -> bool {
        self.protected_mode() && !self.vm86()
    }

    pub fn cpl(&self) -> u8 {
        if !self.protected_mode() {
            0
        } else if self.vm86() {
            3
        } else {
            self.segs[Seg::CS as usize].pl
        }
    }

    pub fn iopl(&self) -> u8 {
        ((self.eflags >> 12) & 3) as u8
    }

    #[inline]
    pub(crate) fn operand32(&self) -> bool {
        self.segs[Seg::CS as usize].is32 ^ self.prefixes.operand_size
    }

    #[inline]
    pub(crate) fn address32(&self) -> bool {
        self.segs[Seg::CS as usize].is32 ^ self.prefixes.address_size
    }

    #[inline]
    pub(crate) fn seg(&self, seg: Seg) -> &SegmentRegister {
        &self.segs[seg as usize]
    }

    /// `default`, unless a segment override prefix is active.
    #[inline]
    pub(crate) fn data_seg(&self, default: Seg) -> Seg {
        self.prefixes.segment.unwrap_or(default)
    }

    #[inline]
    pub(crate) fn check_lock(&self) -> Result<()> {
        if self.prefixes.lock {
            Err(Fault::InvalidOpcode)
        } else {
            Ok(())
        }
    }

    /// Load a segment register the real-mode way (base = selector << 4).
    pub fn load_segment_real(&mut self, seg: Seg, selector: u16) {
        let vm86 = self.vm86();
        self.segs[seg as usize] = SegmentRegister::real_mode(selector, vm86);
    }

    // Segment-relative memory access

    /// Validate an access of `len` bytes at `offset` through `sreg` and
    /// return the linear address.
    pub(crate) fn check_access(
        &self,
        sreg: &SegmentRegister,
        stack: bool,
        offset: u32,
        len: u32,
        write: bool,
    ) -> Result<u32> {
        let limit_fault = if stack {
            Fault::StackFault(0)
        } else {
            Fault::GeneralProtection(0)
        };
        if self.protected_not_vm() {
            if sreg.is_null {
                return Err(Fault::GeneralProtection(0));
            }
            if (write && !sreg.writable) || (!write && !sreg.readable) {
                log(LogCategory::Memory, LogLevel::Debug, || {
                    format!(
                        "{} access denied on selector {:04X} at offset {:08X}",
                        if write { "write" } else { "read" },
                        sreg.selector,
                        offset
                    )
                });
                return Err(Fault::GeneralProtection(0));
            }
        }
        if !sreg.contains(offset, len) {
            log(LogCategory::Memory, LogLevel::Debug, || {
                format!(
                    "limit violation: selector {:04X} offset {:08X} len {} bounds {:08X}..={:08X}",
                    sreg.selector, offset, len, sreg.first_byte, sreg.last_byte
                )
            });
            return Err(limit_fault);
        }
        Ok(sreg.base.wrapping_add(offset))
    }

    #[inline]
    fn linear_for(&self, seg: Seg, offset: u32, len: u32, write: bool) -> Result<u32> {
        self.check_access(self.seg(seg), seg == Seg::SS, offset, len, write)
    }

    pub(crate) fn read_mem<W: Operand>(&self, seg: Seg, offset: u32) -> Result<u32> {
        let linear = self.linear_for(seg, offset, W::BYTES, false)?;
        let mut val = 0u32;
        for i in 0..W::BYTES {
            val |= (self.memory.read(linear.wrapping_add(i))? as u32) << (8 * i);
        }
        Ok(val)
    }

    pub(crate) fn write_mem<W: Operand>(&mut self, seg: Seg, offset: u32, val: u32) -> Result<()> {
        let linear = self.linear_for(seg, offset, W::BYTES, true)?;
        self.memory.check_write(linear, W::BYTES)?;
        for i in 0..W::BYTES {
            self.memory.write(linear.wrapping_add(i), (val >> (8 * i)) as u8)?;
        }
        Ok(())
    }

    pub(crate) fn read_bytes<const N: usize>(&self, seg: Seg, offset: u32) -> Result<[u8; N]> {
        let linear = self.linear_for(seg, offset, N as u32, false)?;
        let mut out = [0u8; N];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.memory.read(linear.wrapping_add(i as u32))?;
        }
        Ok(out)
    }

    pub(crate) fn write_bytes(&mut self, seg: Seg, offset: u32, bytes: &[u8]) -> Result<()> {
        let linear = self.linear_for(seg, offset, bytes.len() as u32, true)?;
        self.memory.check_write(linear, bytes.len() as u32)?;
        for (i, &byte) in bytes.iter().enumerate() {
            self.memory.write(linear.wrapping_add(i as u32), byte)?;
        }
        Ok(())
    }

    pub(crate) fn read_linear_u8(&self, linear: u32) -> Result<u8> {
        self.memory.read(linear)
    }

    pub(crate) fn read_linear_u16(&self, linear: u32) -> Result<u16> {
        let lo = self.memory.read(linear)? as u16;
        let hi = self.memory.read(linear.wrapping_add(1))? as u16;
        Ok((hi << 8) | lo)
    }

    pub(crate) fn read_linear_u32(&self, linear: u32) -> Result<u32> {
        let lo = self.read_linear_u16(linear)? as u32;
        let hi = self.read_linear_u16(linear.wrapping_add(2))? as u32;
        Ok((hi << 16) | lo)
    }

    pub(crate) fn write_linear_u32(&mut self, linear: u32, val: u32) -> Result<()> {
        self.memory.check_write(linear, 4)?;
        for i in 0..4 {
            self.memory.write(linear.wrapping_add(i), (val >> (8 * i)) as u8)?;
        }
        Ok(())
    }

    // Instruction fetch

    pub(crate) fn fetch_u8(&mut self) -> Result<u8> {
        let cs = self.seg(Seg::CS);
        if !cs.contains(self.eip, 1) {
            return Err(Fault::GeneralProtection(0));
        }
        let byte = self.memory.read(cs.base.wrapping_add(self.eip))?;
        self.eip = self.eip.wrapping_add(1);
        Ok(byte)
    }

    pub(crate) fn fetch_u16(&mut self) -> Result<u16> {
        let lo = self.fetch_u8()? as u16;
        let hi = self.fetch_u8()? as u16;
        Ok((hi << 8) | lo)
    }

    pub(crate) fn fetch_u32(&mut self) -> Result<u32> {
        let lo = self.fetch_u16()? as u32;
        let hi = self.fetch_u16()? as u32;
        Ok((hi << 16) | lo)
    }

    /// Immediate of the operand width.
    pub(crate) fn fetch_imm<W: Operand>(&mut self) -> Result<u32> {
        match W::BITS {
            8 => Ok(self.fetch_u8()? as u32),
            16 => Ok(self.fetch_u16()? as u32),
            _ => self.fetch_u32(),
        }
    }

    /// imm8 sign-extended to width `W`.
    pub(crate) fn fetch_simm8<W: Operand>(&mut self) -> Result<u32> {
        let imm = self.fetch_u8()? as u32;
        Ok(W::truncate(u8::sign_extend(imm)))
    }

    // Stack

    #[inline]
    pub(crate) fn stack32(&self) -> bool {
        self.seg(Seg::SS).is32
    }

    /// Current stack pointer at the stack-segment width.
    #[inline]
    pub(crate) fn sp(&self) -> u32 {
        if self.stack32() {
            self.regs[REG_ESP as usize]
        } else {
            self.regs[REG_ESP as usize] & 0xFFFF
        }
    }

    #[inline]
    pub(crate) fn set_sp(&mut self, val: u32) {
        if self.stack32() {
            self.regs[REG_ESP as usize] = val;
        } else {
            self.set_reg16(REG_ESP, val as u16);
        }
    }

    /// Stack pointer moved by `delta`, wrapped to the stack width.
    #[inline]
    pub(crate) fn sp_offset(&self, delta: i32) -> u32 {
        let sp = self.sp().wrapping_add(delta as u32);
        if self.stack32() {
            sp
        } else {
            sp & 0xFFFF
        }
    }

    pub(crate) fn push<W: Operand>(&mut self, val: u32) -> Result<()> {
        let sp = self.sp_offset(-(W::BYTES as i32));
        self.write_mem::<W>(Seg::SS, sp, val)?;
        self.set_sp(sp);
        Ok(())
    }

    pub(crate) fn pop<W: Operand>(&mut self) -> Result<u32> {
        let sp = self.sp();
        let val = self.read_mem::<W>(Seg::SS, sp)?;
        self.set_sp(self.sp_offset(W::BYTES as i32));
        Ok(val)
    }

    // String/loop counters

    /// CX or ECX, by address size.
    pub(crate) fn counter(&self) -> u32 {
        if self.address32() {
            self.regs[REG_ECX as usize]
        } else {
            self.regs[REG_ECX as usize] & 0xFFFF
        }
    }

    /// Decrement CX/ECX and return the new value.
    pub(crate) fn decrement_counter(&mut self) -> u32 {
        if self.address32() {
            let v = self.regs[REG_ECX as usize].wrapping_sub(1);
            self.regs[REG_ECX as usize] = v;
            v
        } else {
            let v = self.reg16(REG_ECX).wrapping_sub(1);
            self.set_reg16(REG_ECX, v);
            v as u32
        }
    }

    /// SI/ESI or DI/EDI, by address size.
    pub(crate) fn index_reg(&self, r: u8) -> u32 {
        if self.address32() {
            self.reg32(r)
        } else {
            self.reg16(r) as u32
        }
    }

    /// Step an index register by `size` bytes in the DF direction.
    pub(crate) fn advance_index(&mut self, r: u8, size: u32) {
        let delta = if self.get_flag(FLAG_DF) {
            size.wrapping_neg()
        } else {
            size
        };
        if self.address32() {
            let v = self.reg32(r).wrapping_add(delta);
            self.set_reg32(r, v);
        } else {
            let v = self.reg16(r).wrapping_add(delta as u16);
            self.set_reg16(r, v);
        }
    }

    /// REPE/REPNE continuation after CMPS/SCAS: count down and re-execute
    /// this instruction while the ZF condition holds.
    pub(crate) fn repeat_while_zf(&mut self) {
        let want_zf = match self.prefixes.rep {
            Some(RepPrefix::Rep) => true,
            Some(RepPrefix::Repne) => false,
            None => return,
        };
        let remaining = self.decrement_counter();
        if remaining != 0 && self.get_flag(FLAG_ZF) == want_zf {
            self.eip = self.old_eip;
        }
    }

    /// REP continuation for INS/OUTS.
    pub(crate) fn repeat(&mut self) {
        if self.prefixes.rep.is_none() {
            return;
        }
        if self.decrement_counter() != 0 {
            self.eip = self.old_eip;
        }
    }

    // Execution

    /// Execute one instruction.
    ///
    /// On a fault EIP is rewound to the first byte of the instruction and
    /// the fault is returned; state committed before it stays committed.
    pub fn step(&mut self) -> Result<()> {
        self.old_eip = self.eip;
        self.prefixes = Prefixes::default();
        let result = self.execute();
        self.prefixes = Prefixes::default();
        match result {
            Ok(()) => {
                self.instructions += 1;
                Ok(())
            }
            Err(fault) => {
                self.eip = self.old_eip;
                match fault {
                    Fault::Unimplemented(what) => {
                        log(LogCategory::Stubs, LogLevel::Error, || {
                            format!(
                                "not implemented at {:04X}:{:08X}: {}",
                                self.seg(Seg::CS).selector,
                                self.old_eip,
                                what
                            )
                        });
                    }
                    _ => {
                        log(LogCategory::Faults, LogLevel::Debug, || {
                            format!(
                                "{} at {:04X}:{:08X}",
                                fault,
                                self.seg(Seg::CS).selector,
                                self.old_eip
                            )
                        });
                    }
                }
                Err(fault)
            }
        }
    }

    fn execute(&mut self) -> Result<()> {
        loop {
            let byte = self.fetch_u8()?;
            match byte {
                0xF0 => self.prefixes.lock = true,
                0xF2 => self.prefixes.rep = Some(RepPrefix::Repne),
                0xF3 => self.prefixes.rep = Some(RepPrefix::Rep),
                0x26 => self.prefixes.segment = Some(Seg::ES),
                0x2E => self.prefixes.segment = Some(Seg::CS),
                0x36 => self.prefixes.segment = Some(Seg::SS),
                0x3E => self.prefixes.segment = Some(Seg::DS),
                0x64 => self.prefixes.segment = Some(Seg::FS),
                0x65 => self.prefixes.segment = Some(Seg::GS),
                0x66 => self.prefixes.operand_size = true,
                0x67 => self.prefixes.address_size = true,
                opcode => {
                    log(LogCategory::CPU, LogLevel::Trace, || {
                        format!(
                            "{:04X}:{:08X} opcode {:02X} EAX={:08X} ECX={:08X} EDX={:08X} EBX={:08X} ESP={:08X} EFLAGS={:08X}",
                            self.seg(Seg::CS).selector,
                            self.old_eip,
                            opcode,
                            self.regs[0],
                            self.regs[1],
                            self.regs[2],
                            self.regs[3],
                            self.regs[4],
                            self.eflags
                        )
                    });
                    return self.execute_opcode(opcode);
                }
            }
        }
    }

    /// Snapshot of the architectural state. Memory is not included.
    pub fn save_state(&self) -> Value {
        let state = CpuState {
            regs: self.regs,
            eip: self.eip,
            eflags: self.eflags,
            cr0: self.cr0,
            segs: self.segs,
            gdtr: self.gdtr,
            idtr: self.idtr,
            ldtr: self.ldtr,
            tr: self.tr,
            fpu: self.fpu.clone(),
        };
        serde_json::to_value(state).expect("CpuState serializes")
    }

    pub fn load_state(&mut self, v: &Value) -> std::result::Result<(), serde_json::Error> {
        let state: CpuState = serde_json::from_value(v.clone())?;
        self.regs = state.regs;
        self.eip = state.eip;
        self.eflags = state.eflags | FLAG_RESERVED;
        self.cr0 = state.cr0;
        self.segs = state.segs;
        self.gdtr = state.gdtr;
        self.idtr = state.idtr;
        self.ldtr = state.ldtr;
        self.tr = state.tr;
        self.fpu = state.fpu;
        self.prefixes = Prefixes::default();
        Ok(())
    }

    /// CF as 0/1.
    #[inline]
    pub(crate) fn carry(&self) -> u32 {
        (self.eflags & FLAG_CF != 0) as u32
    }
}

impl<M: MemoryIa32> crate::Cpu for CpuIa32<M> {
    fn reset(&mut self) {
        CpuIa32::reset(self);
    }

    fn step(&mut self) -> Result<()> {
        CpuIa32::step(self)
    }
}

/// Simple flat memory for tests and benchmarks
#[derive(Debug, Clone)]
pub struct ArrayMemory {
    data: Vec<u8>,
    /// Any access to this linear address raises a page fault.
    pub fault_at: Option<u32>,
    /// Values returned by port reads, and a log of port writes.
    pub io_input: u32,
    pub io_writes: Vec<(u16, u32, u8)>,
}

impl ArrayMemory {
    pub fn new() -> Self {
        Self::with_size(CpuConfig::default().memory_size)
    }

    pub fn with_size(size: usize) -> Self {
        Self {
            data: vec![0; size],
            fault_at: None,
            io_input: 0xFFFF_FFFF,
            io_writes: Vec::new(),
        }
    }

    pub fn with_config(config: &CpuConfig) -> Self {
        Self::with_size(config.memory_size)
    }

    /// Load bytes at a linear address
    pub fn load_program(&mut self, addr: u32, program: &[u8]) {
        let start = addr as usize;
        let end = start + program.len();
        if end <= self.data.len() {
            self.data[start..end].copy_from_slice(program);
        }
    }

    fn peek(&self, addr: u32) -> u8 {
        self.data.get(addr as usize).copied().unwrap_or(0xFF)
    }

    fn poke(&mut self, addr: u32, val: u8) {
        if let Some(byte) = self.data.get_mut(addr as usize) {
            *byte = val;
        }
    }

    pub fn read_u8(&self, addr: u32) -> u8 {
        self.peek(addr)
    }

    pub fn read_u16(&self, addr: u32) -> u16 {
        u16::from_le_bytes([self.peek(addr), self.peek(addr.wrapping_add(1))])
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        (self.read_u16(addr.wrapping_add(2)) as u32) << 16 | self.read_u16(addr) as u32
    }

    pub fn write_u16(&mut self, addr: u32, val: u16) {
        self.poke(addr, val as u8);
        self.poke(addr.wrapping_add(1), (val >> 8) as u8);
    }

    pub fn write_u32(&mut self, addr: u32, val: u32) {
        self.write_u16(addr, val as u16);
        self.write_u16(addr.wrapping_add(2), (val >> 16) as u16);
    }
}

impl Default for ArrayMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIa32 for ArrayMemory {
    fn read(&self, linear: u32) -> Result<u8> {
        if self.fault_at == Some(linear) {
            return Err(Fault::PageFault { linear, code: 0 });
        }
        Ok(self.peek(linear))
    }

    fn write(&mut self, linear: u32, val: u8) -> Result<()> {
        if self.fault_at == Some(linear) {
            return Err(Fault::PageFault { linear, code: 2 });
        }
        self.poke(linear, val);
        Ok(())
    }

    fn check_write(&self, linear: u32, len: u32) -> Result<()> {
        match self.fault_at {
            Some(addr) if addr.wrapping_sub(linear) < len => {
                Err(Fault::PageFault { linear: addr, code: 2 })
            }
            _ => Ok(()),
        }
    }

    fn io_read_u8(&mut self, _port: u16) -> u8 {
        self.io_input as u8
    }

    fn io_read_u16(&mut self, _port: u16) -> u16 {
        self.io_input as u16
    }

    fn io_read_u32(&mut self, _port: u16) -> u32 {
        self.io_input
    }

    fn io_write_u8(&mut self, port: u16, val: u8) {
        self.io_writes.push((port, val as u32, 1));
    }

    fn io_write_u16(&mut self, port: u16, val: u16) {
        self.io_writes.push((port, val as u32, 2));
    }

    fn io_write_u32(&mut self, port: u16, val: u32) {
        self.io_writes.push((port, val, 4));
    }
}
