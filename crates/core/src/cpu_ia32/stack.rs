//! PUSH/POP for registers, immediates and r/m operands, and PUSHA/POPA.
//!
//! Every handler leaves ESP untouched when it faults. LOCK is rejected
//! before the stack is accessed.

use super::addressing::{split_modrm, EffectiveAddress};
use super::{CpuIa32, MemoryIa32, REG_ESP};
use crate::cpu_ia32_protected::Seg;
use crate::fault::{Fault, Result};
use crate::flags::Operand;

impl<M: MemoryIa32> CpuIa32<M> {
    /// PUSH r (50+r). PUSH ESP stores the value from before the push.
    pub(crate) fn push_reg<W: Operand>(&mut self, r: u8) -> Result<()> {
        self.check_lock()?;
        let val = self.reg::<W>(r);
        self.push::<W>(val)
    }

    /// POP r (58+r). POP ESP loads the popped value into ESP.
    pub(crate) fn pop_reg<W: Operand>(&mut self, r: u8) -> Result<()> {
        self.check_lock()?;
        let val = self.pop::<W>()?;
        self.set_reg::<W>(r, val);
        Ok(())
    }

    /// PUSH imm (68) and PUSH simm8 (6A)
    pub(crate) fn push_imm<W: Operand>(&mut self, sext8: bool) -> Result<()> {
        let imm = if sext8 { self.fetch_simm8::<W>()? } else { self.fetch_imm::<W>()? };
        self.check_lock()?;
        self.push::<W>(imm)
    }

    /// PUSH rm (FF /6). The address is formed with ESP from before the push.
    pub(crate) fn push_rm<W: Operand>(&mut self, ea: EffectiveAddress) -> Result<()> {
        self.check_lock()?;
        let val = self.read_ea::<W>(ea)?;
        self.push::<W>(val)
    }

    /// POP rm (8F /0). The destination address is formed with ESP from
    /// after the pop; a fault while storing restores ESP.
    pub(crate) fn pop_rm<W: Operand>(&mut self) -> Result<()> {
        let modrm = self.fetch_u8()?;
        let (_, reg, _) = split_modrm(modrm);
        if reg != 0 {
            return Err(Fault::InvalidOpcode);
        }
        self.check_lock()?;
        let val = self.read_mem::<W>(Seg::SS, self.sp())?;
        let saved = self.regs[REG_ESP as usize];
        self.set_sp(self.sp_offset(W::BYTES as i32));
        let stored = match self.decode_modrm(modrm) {
            Ok(ea) => self.write_ea::<W>(ea, val),
            Err(fault) => Err(fault),
        };
        if stored.is_err() {
            self.regs[REG_ESP as usize] = saved;
        }
        stored
    }

    /// PUSHA (60): AX, CX, DX, BX, the original SP, BP, SI, DI.
    pub(crate) fn pusha<W: Operand>(&mut self) -> Result<()> {
        self.check_lock()?;
        let saved = self.regs[REG_ESP as usize];
        let vals: [u32; 8] = std::array::from_fn(|r| self.reg::<W>(r as u8));
        for val in vals {
            if let Err(fault) = self.push::<W>(val) {
                self.regs[REG_ESP as usize] = saved;
                return Err(fault);
            }
        }
        Ok(())
    }

    /// POPA (61). The stored SP slot is skipped. All eight slots are read
    /// before any register changes.
    pub(crate) fn popa<W: Operand>(&mut self) -> Result<()> {
        self.check_lock()?;
        let mut vals = [0u32; 8];
        for (i, val) in vals.iter_mut().enumerate() {
            let offset = self.sp_offset((i as u32 * W::BYTES) as i32);
            *val = self.read_mem::<W>(Seg::SS, offset)?;
        }
        for (i, val) in vals.into_iter().enumerate() {
            let r = 7 - i as u8;
            if r != REG_ESP {
                self.set_reg::<W>(r, val);
            }
        }
        self.set_sp(self.sp_offset((8 * W::BYTES) as i32));
        Ok(())
    }
}
