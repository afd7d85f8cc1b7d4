//! x87 escape decoding (D8..DF), the control instructions and FWAIT.

use super::addressing::split_modrm;
use super::x87_arith::{FpuArith, MemFormat};
use super::x87_load_store::{constant, FloatFormat, IntFormat};
use super::{CpuIa32, MemoryIa32, REG_EAX};
use crate::cpu_ia32_protected::{Seg, CR0_MP, CR0_TS};
use crate::fault::{Fault, Result};
use crate::fpu::{FPU_STATUS_ES, FSAVE32_SIZE};

/// Status bits cleared by FNCLEX: exceptions, SF, ES and B.
const FCLEX_MASK: u16 = 0x80FF;

impl<M: MemoryIa32> CpuIa32<M> {
    /// Escape opcodes D8..DF.
    pub(crate) fn fpu_escape(&mut self, opcode: u8) -> Result<()> {
        let modrm = self.fetch_u8()?;
        let (md, reg, rm) = split_modrm(modrm);
        let esc = opcode & 7;
        let control = if md == 3 {
            self.fpu_escape_reg(esc, modrm, reg, rm)?
        } else {
            self.fpu_escape_mem(esc, modrm, reg)?
        };
        if !control {
            self.fpu.ip_offset = self.old_eip;
            self.fpu.ip_selector = self.seg(Seg::CS).selector;
            self.fpu.opcode = ((esc as u16) << 8) | modrm as u16;
        }
        Ok(())
    }

    /// Memory forms. Returns true for control instructions, which leave
    /// the last-instruction pointer alone.
    fn fpu_escape_mem(&mut self, esc: u8, modrm: u8, reg: u8) -> Result<bool> {
        let arith_fmt = match esc {
            0 => Some(MemFormat::F32),
            2 => Some(MemFormat::I32),
            4 => Some(MemFormat::F64),
            6 => Some(MemFormat::I16),
            _ => None,
        };
        if let Some(fmt) = arith_fmt {
            match FpuArith::from_reg(reg) {
                Some(op) => self.fpu_arith_mem(modrm, op, fmt)?,
                None => self.fcom_mem(modrm, fmt, reg == 3)?,
            }
            return Ok(false);
        }
        match (esc, reg) {
            (1, 0) => self.fld_mem(modrm, FloatFormat::F32)?,
            (1, 2) => self.fst_mem(modrm, FloatFormat::F32, false)?,
            (1, 3) => self.fst_mem(modrm, FloatFormat::F32, true)?,
            (1, 4) => return Err(Fault::Unimplemented("FLDENV")),
            (1, 5) => {
                self.fldcw(modrm)?;
                return Ok(true);
            }
            (1, 6) => return Err(Fault::Unimplemented("FNSTENV")),
            (1, 7) => {
                self.fnstcw(modrm)?;
                return Ok(true);
            }
            (3, 0) => self.fild(modrm, IntFormat::I32)?,
            (3, 2) => self.fist(modrm, IntFormat::I32, false)?,
            (3, 3) => self.fist(modrm, IntFormat::I32, true)?,
            (3, 5) => self.fld_mem(modrm, FloatFormat::F80)?,
            (3, 7) => self.fst_mem(modrm, FloatFormat::F80, true)?,
            (5, 0) => self.fld_mem(modrm, FloatFormat::F64)?,
            (5, 2) => self.fst_mem(modrm, FloatFormat::F64, false)?,
            (5, 3) => self.fst_mem(modrm, FloatFormat::F64, true)?,
            (5, 4) => {
                self.frstor(modrm)?;
                return Ok(true);
            }
            (5, 6) => {
                self.fnsave(modrm)?;
                return Ok(true);
            }
            (5, 7) => {
                self.fnstsw_mem(modrm)?;
                return Ok(true);
            }
            (7, 0) => self.fild(modrm, IntFormat::I16)?,
            (7, 2) => self.fist(modrm, IntFormat::I16, false)?,
            (7, 3) => self.fist(modrm, IntFormat::I16, true)?,
            (7, 4) => return Err(Fault::Unimplemented("FBLD")),
            (7, 5) => self.fild(modrm, IntFormat::I64)?,
            (7, 6) => self.fbstp(modrm)?,
            (7, 7) => self.fist(modrm, IntFormat::I64, true)?,
            _ => return Err(Fault::InvalidOpcode),
        }
        Ok(false)
    }

    /// Register forms (mod = 3).
    fn fpu_escape_reg(&mut self, esc: u8, modrm: u8, reg: u8, rm: u8) -> Result<bool> {
        match esc {
            0 => match FpuArith::from_reg(reg) {
                Some(op) => self.fpu_arith_reg(op, rm, true, false)?,
                None => self.fcom_reg(rm, reg - 2)?,
            },
            1 => self.fpu_d9_reg(modrm, reg, rm)?,
            2 => return Err(Fault::Unimplemented("FCMOVcc/FUCOMPP")),
            3 => match modrm {
                0xE2 => {
                    self.fnclex()?;
                    return Ok(true);
                }
                0xE3 => {
                    self.fninit()?;
                    return Ok(true);
                }
                _ => return Err(Fault::Unimplemented("DB register form")),
            },
            4 => match FpuArith::from_reg(reg) {
                Some(op) => self.fpu_arith_reg(op.swapped(), rm, false, false)?,
                None => return Err(Fault::Unimplemented("DC D0..DF compare alias")),
            },
            5 => match reg {
                0 => self.ffree(rm)?,
                2 => self.fst_reg(rm, false)?,
                3 => self.fst_reg(rm, true)?,
                4 | 5 => return Err(Fault::Unimplemented("FUCOM/FUCOMP")),
                1 => return Err(Fault::Unimplemented("DD C8..CF exchange alias")),
                _ => return Err(Fault::InvalidOpcode),
            },
            6 => match FpuArith::from_reg(reg) {
                Some(op) => self.fpu_arith_reg(op.swapped(), rm, false, true)?,
                None if modrm == 0xD9 => self.fcom_reg(1, 2)?,
                None => return Err(Fault::Unimplemented("DE compare alias")),
            },
            _ => match modrm {
                0xE0 => {
                    self.fnstsw_ax()?;
                    return Ok(true);
                }
                _ => return Err(Fault::Unimplemented("DF register form")),
            },
        }
        Ok(false)
    }

    fn fpu_d9_reg(&mut self, modrm: u8, reg: u8, rm: u8) -> Result<()> {
        match reg {
            0 => return self.fld_reg(rm),
            1 => return self.fxch(rm),
            _ => {}
        }
        if let Some(value) = constant(modrm) {
            return self.fld_constant(value);
        }
        match modrm {
            0xD0 => self.fpu_guard(),
            0xE0 => self.fchs_fabs(false),
            0xE1 => self.fchs_fabs(true),
            0xE4 => self.ftst(),
            0xE5 => self.fxam(),
            0xF0 => self.f2xm1(),
            0xF1 => self.fyl2x(),
            0xF2 | 0xFE | 0xFF => self.ftrig(modrm),
            0xF3 => self.fpatan(),
            0xF8 => self.fprem(),
            0xFA => self.fsqrt(),
            0xFC => self.frndint(),
            0xFD => self.fscale(),
            0xF4 => Err(Fault::Unimplemented("FXTRACT")),
            0xF5 => Err(Fault::Unimplemented("FPREM1")),
            0xF6 | 0xF7 => Err(Fault::Unimplemented("FDECSTP/FINCSTP")),
            0xF9 => Err(Fault::Unimplemented("FYL2XP1")),
            0xFB => Err(Fault::Unimplemented("FSINCOS")),
            0xD8..=0xDF => Err(Fault::Unimplemented("D9 D8..DF store alias")),
            _ => Err(Fault::InvalidOpcode),
        }
    }

    /// FNINIT (DB E3)
    pub(crate) fn fninit(&mut self) -> Result<()> {
        self.fpu_guard_no_wait()?;
        self.fpu.init();
        Ok(())
    }

    /// FNCLEX (DB E2)
    pub(crate) fn fnclex(&mut self) -> Result<()> {
        self.fpu_guard_no_wait()?;
        self.fpu.status &= !FCLEX_MASK;
        Ok(())
    }

    /// FLDCW m16 (D9 /5). Unmasking a pending exception sets ES.
    pub(crate) fn fldcw(&mut self, modrm: u8) -> Result<()> {
        self.fpu_guard()?;
        let ea = self.decode_modrm(modrm)?;
        let (seg, offset) = self.memory_operand(ea)?;
        self.fpu.control = self.read_mem::<u16>(seg, offset)? as u16;
        self.fpu.update_exceptions();
        Ok(())
    }

    /// FNSTCW m16 (D9 /7)
    pub(crate) fn fnstcw(&mut self, modrm: u8) -> Result<()> {
        self.fpu_guard_no_wait()?;
        let ea = self.decode_modrm(modrm)?;
        let (seg, offset) = self.memory_operand(ea)?;
        self.write_mem::<u16>(seg, offset, self.fpu.control as u32)
    }

    /// FNSTSW m16 (DD /7)
    pub(crate) fn fnstsw_mem(&mut self, modrm: u8) -> Result<()> {
        self.fpu_guard_no_wait()?;
        let ea = self.decode_modrm(modrm)?;
        let (seg, offset) = self.memory_operand(ea)?;
        self.write_mem::<u16>(seg, offset, self.fpu.status_word() as u32)
    }

    /// FNSTSW AX (DF E0)
    pub(crate) fn fnstsw_ax(&mut self) -> Result<()> {
        self.fpu_guard_no_wait()?;
        self.set_reg16(REG_EAX, self.fpu.status_word());
        Ok(())
    }

    /// Only the 32-bit protected-mode image layout is supported.
    fn check_fpu_image_mode(&self, what: &'static str) -> Result<()> {
        if self.protected_not_vm() && self.operand32() {
            Ok(())
        } else {
            Err(Fault::Unimplemented(what))
        }
    }

    /// FNSAVE m108 (DD /6): store the full state, then reinitialize.
    pub(crate) fn fnsave(&mut self, modrm: u8) -> Result<()> {
        self.fpu_guard_no_wait()?;
        let ea = self.decode_modrm(modrm)?;
        let (seg, offset) = self.memory_operand(ea)?;
        self.check_fpu_image_mode("FSAVE outside 32-bit protected mode")?;
        let image = self.fpu.save_image32();
        self.write_bytes(seg, offset, &image)?;
        let opcode = self.fpu.opcode;
        self.fpu.init();
        self.fpu.opcode = opcode;
        Ok(())
    }

    /// FRSTOR m108 (DD /4)
    pub(crate) fn frstor(&mut self, modrm: u8) -> Result<()> {
        self.fpu_guard()?;
        let ea = self.decode_modrm(modrm)?;
        let (seg, offset) = self.memory_operand(ea)?;
        self.check_fpu_image_mode("FRSTOR outside 32-bit protected mode")?;
        let image = self.read_bytes::<FSAVE32_SIZE>(seg, offset)?;
        self.fpu.load_image32(&image);
        Ok(())
    }

    /// FWAIT (9B)
    pub(crate) fn fwait(&mut self) -> Result<()> {
        self.check_lock()?;
        if self.cr0 & (CR0_MP | CR0_TS) == CR0_MP | CR0_TS {
            return Err(Fault::DeviceNotAvailable);
        }
        if self.fpu.status & FPU_STATUS_ES != 0 {
            return Err(Fault::Unimplemented("delivery of a pending x87 exception"));
        }
        Ok(())
    }
}
