//! Near control transfers: JMP/CALL/RET near, Jcc, LOOP/LOOPE/LOOPNE,
//! JCXZ and the control-transfer half of group 5 (FF).

use super::addressing::split_modrm;
use super::alu::condition;
use super::{CpuIa32, MemoryIa32, REG_ESP};
use crate::cpu_ia32_protected::Seg;
use crate::fault::{Fault, Result};
use crate::flags::{Operand, FLAG_ZF};

impl<M: MemoryIa32> CpuIa32<M> {
    /// Target truncated to IP width unless the operand size is 32.
    #[inline]
    fn near_target(&self, target: u32) -> u32 {
        if self.operand32() {
            target
        } else {
            target & 0xFFFF
        }
    }

    #[inline]
    fn check_code_limit(&self, target: u32) -> Result<()> {
        if self.seg(Seg::CS).contains(target, 1) {
            Ok(())
        } else {
            Err(Fault::GeneralProtection(0))
        }
    }

    pub(crate) fn jmp_near(&mut self, target: u32) -> Result<()> {
        let target = self.near_target(target);
        self.check_code_limit(target)?;
        self.eip = target;
        Ok(())
    }

    pub(crate) fn call_near(&mut self, target: u32) -> Result<()> {
        let target = self.near_target(target);
        self.check_code_limit(target)?;
        if self.operand32() {
            self.push::<u32>(self.eip)?;
        } else {
            self.push::<u16>(self.eip & 0xFFFF)?;
        }
        self.eip = target;
        Ok(())
    }

    /// JMP rel8 (EB)
    pub(crate) fn jmp_rel8(&mut self) -> Result<()> {
        self.check_lock()?;
        let rel = self.fetch_u8()? as i8 as u32;
        self.jmp_near(self.eip.wrapping_add(rel))
    }

    /// JMP rel16/32 (E9)
    pub(crate) fn jmp_rel<W: Operand>(&mut self) -> Result<()> {
        self.check_lock()?;
        let rel = W::sign_extend(self.fetch_imm::<W>()?);
        self.jmp_near(self.eip.wrapping_add(rel))
    }

    /// CALL rel16/32 (E8)
    pub(crate) fn call_rel<W: Operand>(&mut self) -> Result<()> {
        let rel = W::sign_extend(self.fetch_imm::<W>()?);
        self.check_lock()?;
        self.call_near(self.eip.wrapping_add(rel))
    }

    /// Jcc rel8 (70..7F)
    pub(crate) fn jcc_rel8(&mut self, cc: u8) -> Result<()> {
        self.check_lock()?;
        let rel = self.fetch_u8()? as i8 as u32;
        if condition(self.eflags, cc) {
            self.jmp_near(self.eip.wrapping_add(rel))?;
        }
        Ok(())
    }

    /// Jcc rel16/32 (0F 80..8F)
    pub(crate) fn jcc_rel<W: Operand>(&mut self, cc: u8) -> Result<()> {
        self.check_lock()?;
        let rel = W::sign_extend(self.fetch_imm::<W>()?);
        if condition(self.eflags, cc) {
            self.jmp_near(self.eip.wrapping_add(rel))?;
        }
        Ok(())
    }

    /// LOOPNE (E0), LOOPE (E1), LOOP (E2). The counter is decremented
    /// even when the jump then faults.
    pub(crate) fn loop_rel8(&mut self, opcode: u8) -> Result<()> {
        let rel = self.fetch_u8()? as i8 as u32;
        self.check_lock()?;
        let remaining = self.decrement_counter();
        let zf = self.get_flag(FLAG_ZF);
        let cond = match opcode {
            0xE0 => !zf,
            0xE1 => zf,
            _ => true,
        };
        if remaining != 0 && cond {
            self.jmp_near(self.eip.wrapping_add(rel))?;
        }
        Ok(())
    }

    /// JCXZ/JECXZ (E3)
    pub(crate) fn jcxz_rel8(&mut self) -> Result<()> {
        let rel = self.fetch_u8()? as i8 as u32;
        self.check_lock()?;
        if self.counter() == 0 {
            self.jmp_near(self.eip.wrapping_add(rel))?;
        }
        Ok(())
    }

    /// Pop a near return address, validating it before ESP moves.
    fn ret_near_inner(&mut self) -> Result<()> {
        let sp = self.sp();
        let (target, size) = if self.operand32() {
            (self.read_mem::<u32>(Seg::SS, sp)?, 4)
        } else {
            (self.read_mem::<u16>(Seg::SS, sp)?, 2)
        };
        self.check_code_limit(target)?;
        self.set_sp(self.sp_offset(size));
        self.eip = target;
        Ok(())
    }

    /// RET (C3)
    pub(crate) fn ret_near(&mut self) -> Result<()> {
        self.check_lock()?;
        self.ret_near_inner()
    }

    /// RET imm16 (C2)
    pub(crate) fn ret_near_imm16(&mut self) -> Result<()> {
        let imm = self.fetch_u16()?;
        self.check_lock()?;
        self.ret_near_inner()?;
        self.release_stack(imm);
        Ok(())
    }

    /// Drop `bytes` of stack after a RET imm16.
    pub(crate) fn release_stack(&mut self, bytes: u16) {
        if self.stack32() {
            self.regs[REG_ESP as usize] = self.regs[REG_ESP as usize].wrapping_add(bytes as u32);
        } else {
            let sp = self.reg16(REG_ESP).wrapping_add(bytes);
            self.set_reg16(REG_ESP, sp);
        }
    }

    /// Group 5 (FF): INC, DEC, CALL/JMP near and far indirect, PUSH.
    pub(crate) fn group5<W: Operand>(&mut self) -> Result<()> {
        let modrm = self.fetch_u8()?;
        let (_, reg, _) = split_modrm(modrm);
        let ea = self.decode_modrm(modrm)?;
        match reg {
            0 => self.inc_rm::<W>(ea),
            1 => self.dec_rm::<W>(ea),
            2 | 4 => {
                self.check_lock()?;
                let target = self.read_ea::<W>(ea)?;
                if reg == 2 {
                    self.call_near(target)
                } else {
                    self.jmp_near(target)
                }
            }
            3 | 5 => {
                let (seg, offset) = self.memory_operand(ea)?;
                self.check_lock()?;
                let target = self.read_mem::<W>(seg, offset)?;
                let selector = self.read_mem::<u16>(seg, offset.wrapping_add(W::BYTES))? as u16;
                if reg == 3 {
                    self.call_far(selector, target)
                } else {
                    self.jmp_far(selector, target)
                }
            }
            6 => self.push_rm::<W>(ea),
            _ => Err(Fault::InvalidOpcode),
        }
    }
}
