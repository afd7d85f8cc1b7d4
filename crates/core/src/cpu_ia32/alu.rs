//! Integer ALU: ADD/OR/ADC/SBB/AND/SUB/XOR/CMP, TEST, NOT/NEG, INC/DEC,
//! SETcc and the single-flag instructions.
//!
//! LOCK placement:
//! - rm destination in memory: lock allowed (CMP rejects it after the read)
//! - rm destination in a register: rejected before anything else
//! - r,rm and accumulator forms: rejected after the operands were decoded

use super::addressing::{split_modrm, EffectiveAddress};
use super::{CpuIa32, MemoryIa32, REG_EAX};
use crate::fault::Result;
use crate::flags::{
    add_flags, dec_flags, inc_flags, logic_flags, sub_flags, Operand, FLAG_CF, FLAG_DF,
    FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF,
};

/// Two-operand ALU operations in ModR/M /reg encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add = 0,
    Or = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

impl AluOp {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }

    pub fn writes_back(self) -> bool {
        self != AluOp::Cmp
    }
}

/// Jcc/SETcc predicate for condition code `cc` (low nibble of the opcode).
pub(crate) fn condition(eflags: u32, cc: u8) -> bool {
    let of = eflags & FLAG_OF != 0;
    let cf = eflags & FLAG_CF != 0;
    let zf = eflags & FLAG_ZF != 0;
    let sf = eflags & FLAG_SF != 0;
    let pf = eflags & FLAG_PF != 0;
    let r = match (cc >> 1) & 7 {
        0 => of,             // O
        1 => cf,             // B
        2 => zf,             // E
        3 => cf || zf,       // BE
        4 => sf,             // S
        5 => pf,             // P
        6 => sf != of,       // L
        _ => zf || sf != of, // LE
    };
    r ^ (cc & 1 != 0)
}

impl<M: MemoryIa32> CpuIa32<M> {
    /// Compute `dst op src` at width `W` and update flags.
    pub(crate) fn alu<W: Operand>(&mut self, op: AluOp, dst: u32, src: u32) -> u32 {
        let dst = W::truncate(dst);
        let src = W::truncate(src);
        match op {
            AluOp::Add => {
                let res = W::truncate(dst.wrapping_add(src));
                add_flags::<W>(&mut self.eflags, dst, src, 0, res);
                res
            }
            AluOp::Adc => {
                let carry = self.carry();
                let res = W::truncate(dst.wrapping_add(src).wrapping_add(carry));
                add_flags::<W>(&mut self.eflags, dst, src, carry, res);
                res
            }
            AluOp::Sub | AluOp::Cmp => {
                let res = W::truncate(dst.wrapping_sub(src));
                sub_flags::<W>(&mut self.eflags, dst, src, res);
                res
            }
            AluOp::Sbb => {
                // dst + ~src + !CF
                let res = W::truncate(
                    dst.wrapping_add(!src & W::MASK)
                        .wrapping_add(1 - self.carry()),
                );
                sub_flags::<W>(&mut self.eflags, dst, src, res);
                res
            }
            AluOp::And => {
                let res = dst & src;
                logic_flags::<W>(&mut self.eflags, res);
                res
            }
            AluOp::Or => {
                let res = dst | src;
                logic_flags::<W>(&mut self.eflags, res);
                res
            }
            AluOp::Xor => {
                let res = dst ^ src;
                logic_flags::<W>(&mut self.eflags, res);
                res
            }
        }
    }

    /// Apply `op` with an already-known source to a ModR/M destination.
    fn alu_rm_src<W: Operand>(&mut self, op: AluOp, ea: EffectiveAddress, src: u32) -> Result<()> {
        match ea {
            EffectiveAddress::Register(r) => {
                self.check_lock()?;
                let dst = self.reg::<W>(r);
                let res = self.alu::<W>(op, dst, src);
                if op.writes_back() {
                    self.set_reg::<W>(r, res);
                }
                Ok(())
            }
            EffectiveAddress::Memory { seg, offset } => {
                let dst = self.read_mem::<W>(seg, offset)?;
                if !op.writes_back() {
                    self.check_lock()?;
                }
                let res = self.alu::<W>(op, dst, src);
                if op.writes_back() {
                    self.write_mem::<W>(seg, offset, res)?;
                }
                Ok(())
            }
        }
    }

    /// op rm, r (00, 01, 08, 09, ...)
    pub(crate) fn alu_rm_r<W: Operand>(&mut self, op: AluOp) -> Result<()> {
        let modrm = self.fetch_u8()?;
        let (_, reg, _) = split_modrm(modrm);
        let ea = self.decode_modrm(modrm)?;
        let src = self.reg::<W>(reg);
        self.alu_rm_src::<W>(op, ea, src)
    }

    /// op r, rm (02, 03, 0A, 0B, ...)
    pub(crate) fn alu_r_rm<W: Operand>(&mut self, op: AluOp) -> Result<()> {
        let modrm = self.fetch_u8()?;
        let (_, reg, _) = split_modrm(modrm);
        let ea = self.decode_modrm(modrm)?;
        self.check_lock()?;
        let src = self.read_ea::<W>(ea)?;
        let dst = self.reg::<W>(reg);
        let res = self.alu::<W>(op, dst, src);
        if op.writes_back() {
            self.set_reg::<W>(reg, res);
        }
        Ok(())
    }

    /// op AL/AX/EAX, imm (04, 05, 0C, 0D, ...)
    pub(crate) fn alu_acc_imm<W: Operand>(&mut self, op: AluOp) -> Result<()> {
        let imm = self.fetch_imm::<W>()?;
        self.check_lock()?;
        let dst = self.reg::<W>(REG_EAX);
        let res = self.alu::<W>(op, dst, imm);
        if op.writes_back() {
            self.set_reg::<W>(REG_EAX, res);
        }
        Ok(())
    }

    /// Group 1 (80, 81, 82, 83): op rm, imm. `sext8` selects the
    /// sign-extended imm8 form.
    pub(crate) fn alu_rm_imm<W: Operand>(&mut self, sext8: bool) -> Result<()> {
        let modrm = self.fetch_u8()?;
        let (_, reg, _) = split_modrm(modrm);
        let ea = self.decode_modrm(modrm)?;
        let imm = if sext8 {
            self.fetch_simm8::<W>()?
        } else {
            self.fetch_imm::<W>()?
        };
        self.alu_rm_src::<W>(AluOp::from_bits(reg), ea, imm)
    }

    fn test_values<W: Operand>(&mut self, a: u32, b: u32) {
        logic_flags::<W>(&mut self.eflags, W::truncate(a & b));
    }

    fn test_rm_src<W: Operand>(&mut self, ea: EffectiveAddress, src: u32) -> Result<()> {
        match ea {
            EffectiveAddress::Register(r) => {
                self.check_lock()?;
                let dst = self.reg::<W>(r);
                self.test_values::<W>(dst, src);
            }
            EffectiveAddress::Memory { seg, offset } => {
                let dst = self.read_mem::<W>(seg, offset)?;
                self.check_lock()?;
                self.test_values::<W>(dst, src);
            }
        }
        Ok(())
    }

    /// TEST rm, r (84, 85)
    pub(crate) fn test_rm_r<W: Operand>(&mut self) -> Result<()> {
        let modrm = self.fetch_u8()?;
        let (_, reg, _) = split_modrm(modrm);
        let ea = self.decode_modrm(modrm)?;
        let src = self.reg::<W>(reg);
        self.test_rm_src::<W>(ea, src)
    }

    /// TEST AL/AX/EAX, imm (A8, A9)
    pub(crate) fn test_acc_imm<W: Operand>(&mut self) -> Result<()> {
        let imm = self.fetch_imm::<W>()?;
        self.check_lock()?;
        let acc = self.reg::<W>(REG_EAX);
        self.test_values::<W>(acc, imm);
        Ok(())
    }

    /// Group 3 (F6, F7): TEST/NOT/NEG here, MUL/IMUL/DIV/IDIV in `mul_div`.
    pub(crate) fn group3<W: Operand>(&mut self) -> Result<()> {
        let modrm = self.fetch_u8()?;
        let (_, reg, _) = split_modrm(modrm);
        let ea = self.decode_modrm(modrm)?;
        match reg {
            0 | 1 => {
                let imm = self.fetch_imm::<W>()?;
                self.test_rm_src::<W>(ea, imm)
            }
            2 => self.unary_rm::<W>(ea, |_, v| W::truncate(!v)),
            3 => self.unary_rm::<W>(ea, |cpu, v| {
                let res = W::truncate(0u32.wrapping_sub(v));
                sub_flags::<W>(&mut cpu.eflags, 0, v, res);
                res
            }),
            4 => self.mul::<W>(ea),
            5 => self.imul_acc::<W>(ea),
            6 => self.div::<W>(ea),
            _ => self.idiv::<W>(ea),
        }
    }

    /// Read-modify-write of a ModR/M operand through `f`.
    pub(crate) fn unary_rm<W: Operand>(
        &mut self,
        ea: EffectiveAddress,
        f: impl FnOnce(&mut Self, u32) -> u32,
    ) -> Result<()> {
        match ea {
            EffectiveAddress::Register(r) => {
                self.check_lock()?;
                let v = self.reg::<W>(r);
                let res = f(self, v);
                self.set_reg::<W>(r, res);
                Ok(())
            }
            EffectiveAddress::Memory { seg, offset } => {
                let v = self.read_mem::<W>(seg, offset)?;
                let res = f(self, v);
                self.write_mem::<W>(seg, offset, res)
            }
        }
    }

    pub(crate) fn inc_rm<W: Operand>(&mut self, ea: EffectiveAddress) -> Result<()> {
        self.unary_rm::<W>(ea, |cpu, v| {
            let res = W::truncate(v.wrapping_add(1));
            inc_flags::<W>(&mut cpu.eflags, v, res);
            res
        })
    }

    pub(crate) fn dec_rm<W: Operand>(&mut self, ea: EffectiveAddress) -> Result<()> {
        self.unary_rm::<W>(ea, |cpu, v| {
            let res = W::truncate(v.wrapping_sub(1));
            dec_flags::<W>(&mut cpu.eflags, v, res);
            res
        })
    }

    /// INC r (40+r)
    pub(crate) fn inc_reg<W: Operand>(&mut self, r: u8) -> Result<()> {
        self.check_lock()?;
        let v = self.reg::<W>(r);
        let res = W::truncate(v.wrapping_add(1));
        inc_flags::<W>(&mut self.eflags, v, res);
        self.set_reg::<W>(r, res);
        Ok(())
    }

    /// DEC r (48+r)
    pub(crate) fn dec_reg<W: Operand>(&mut self, r: u8) -> Result<()> {
        self.check_lock()?;
        let v = self.reg::<W>(r);
        let res = W::truncate(v.wrapping_sub(1));
        dec_flags::<W>(&mut self.eflags, v, res);
        self.set_reg::<W>(r, res);
        Ok(())
    }

    /// Group 4 (FE): INC/DEC rm8.
    pub(crate) fn group4(&mut self) -> Result<()> {
        let modrm = self.fetch_u8()?;
        let (_, reg, _) = split_modrm(modrm);
        let ea = self.decode_modrm(modrm)?;
        match reg {
            0 => self.inc_rm::<u8>(ea),
            1 => self.dec_rm::<u8>(ea),
            _ => Err(crate::fault::Fault::InvalidOpcode),
        }
    }

    /// SETcc rm8 (0F 90..9F)
    pub(crate) fn setcc(&mut self, cc: u8) -> Result<()> {
        let modrm = self.fetch_u8()?;
        let ea = self.decode_modrm(modrm)?;
        self.check_lock()?;
        let val = condition(self.eflags, cc) as u32;
        self.write_ea::<u8>(ea, val)
    }

    /// CLC/STC/CMC/CLD/STD
    pub(crate) fn flag_op(&mut self, opcode: u8) -> Result<()> {
        self.check_lock()?;
        match opcode {
            0xF8 => self.set_flag(FLAG_CF, false),
            0xF9 => self.set_flag(FLAG_CF, true),
            0xF5 => self.eflags ^= FLAG_CF,
            0xFC => self.set_flag(FLAG_DF, false),
            _ => self.set_flag(FLAG_DF, true),
        }
        Ok(())
    }
}
