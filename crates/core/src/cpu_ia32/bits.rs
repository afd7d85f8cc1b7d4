//! BSF/BSR, BSWAP and the BT family.

use super::addressing::{split_modrm, EffectiveAddress};
use super::{CpuIa32, MemoryIa32, RepBitScan};
use crate::fault::{Fault, Result};
use crate::flags::{Operand, FLAG_CF, FLAG_ZF};
use crate::logging::{log, LogCategory, LogLevel};

/// Index of the lowest set bit of each byte, 8 for zero.
static LOWEST_BIT: [u8; 256] = {
    let mut table = [8u8; 256];
    let mut i = 1;
    while i < 256 {
        table[i] = (i as u8).trailing_zeros() as u8;
        i += 1;
    }
    table
};

/// Index of the highest set bit of each byte, 8 for zero.
static HIGHEST_BIT: [u8; 256] = {
    let mut table = [8u8; 256];
    let mut i = 1;
    while i < 256 {
        table[i] = 7 - (i as u8).leading_zeros() as u8;
        i += 1;
    }
    table
};

/// Lowest set bit of a nonzero `W` value, walking bytes upward.
fn scan_forward<W: Operand>(val: u32) -> u32 {
    for byte in 0..W::BYTES {
        let idx = LOWEST_BIT[((val >> (8 * byte)) & 0xFF) as usize];
        if idx != 8 {
            return 8 * byte + idx as u32;
        }
    }
    0
}

/// Highest set bit of a nonzero `W` value, walking bytes downward.
fn scan_reverse<W: Operand>(val: u32) -> u32 {
    for byte in (0..W::BYTES).rev() {
        let idx = HIGHEST_BIT[((val >> (8 * byte)) & 0xFF) as usize];
        if idx != 8 {
            return 8 * byte + idx as u32;
        }
    }
    0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BitOp {
    Test,
    Set,
    Reset,
    Complement,
}

impl BitOp {
    /// From bits 4:3 of the opcode (A3/AB/B3/BB) or the /reg of 0F BA.
    pub(crate) fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => BitOp::Test,
            1 => BitOp::Set,
            2 => BitOp::Reset,
            _ => BitOp::Complement,
        }
    }

    fn apply(self, val: u32, mask: u32) -> u32 {
        match self {
            BitOp::Test => val,
            BitOp::Set => val | mask,
            BitOp::Reset => val & !mask,
            BitOp::Complement => val ^ mask,
        }
    }
}

impl<M: MemoryIa32> CpuIa32<M> {
    /// BSF (0F BC) / BSR (0F BD)
    pub(crate) fn bit_scan<W: Operand>(&mut self, reverse: bool) -> Result<()> {
        let modrm = self.fetch_u8()?;
        let (_, reg, _) = split_modrm(modrm);
        let ea = self.decode_modrm(modrm)?;
        self.check_lock()?;
        if self.prefixes.rep.is_some() {
            match self.config.rep_bit_scan {
                RepBitScan::InvalidOpcode => return Err(Fault::InvalidOpcode),
                RepBitScan::WarnAndIgnore => {
                    log(LogCategory::Stubs, LogLevel::Warn, || {
                        format!(
                            "REP {} at {:08X} executed as plain bit scan",
                            if reverse { "BSR" } else { "BSF" },
                            self.old_eip
                        )
                    });
                }
            }
        }
        let src = self.read_ea::<W>(ea)?;
        if src == 0 {
            self.set_flag(FLAG_ZF, true);
            return Ok(());
        }
        let idx = if reverse {
            scan_reverse::<W>(src)
        } else {
            scan_forward::<W>(src)
        };
        self.set_flag(FLAG_ZF, false);
        self.set_reg::<W>(reg, idx);
        Ok(())
    }

    /// BSWAP r32 (0F C8+r)
    pub(crate) fn bswap(&mut self, r: u8) -> Result<()> {
        self.check_lock()?;
        let v = self.reg32(r);
        self.set_reg32(r, v.swap_bytes());
        Ok(())
    }

    fn bit_op_ea<W: Operand>(
        &mut self,
        op: BitOp,
        ea: EffectiveAddress,
        bit: u32,
    ) -> Result<()> {
        let mask = 1u32 << bit;
        match ea {
            EffectiveAddress::Register(r) => {
                let val = self.reg::<W>(r);
                self.set_flag(FLAG_CF, val & mask != 0);
                if op != BitOp::Test {
                    self.set_reg::<W>(r, op.apply(val, mask));
                }
                Ok(())
            }
            EffectiveAddress::Memory { seg, offset } => {
                let val = self.read_mem::<W>(seg, offset)?;
                self.set_flag(FLAG_CF, val & mask != 0);
                if op != BitOp::Test {
                    self.write_mem::<W>(seg, offset, op.apply(val, mask))?;
                }
                Ok(())
            }
        }
    }

    fn bit_op_lock_check(&self, op: BitOp, ea: &EffectiveAddress) -> Result<()> {
        if op == BitOp::Test || !ea.is_memory() {
            self.check_lock()?;
        }
        Ok(())
    }

    /// BT/BTS/BTR/BTC rm, r. A memory operand is addressed by the signed
    /// bit offset, so the offset selects the containing word or dword.
    pub(crate) fn bit_op_rm_r<W: Operand>(&mut self, op: BitOp) -> Result<()> {
        let modrm = self.fetch_u8()?;
        let (_, reg, _) = split_modrm(modrm);
        let ea = self.decode_modrm(modrm)?;
        self.bit_op_lock_check(op, &ea)?;
        let offset_reg = self.reg::<W>(reg);
        let (ea, bit) = match ea {
            EffectiveAddress::Memory { seg, offset } => {
                let signed = W::sign_extend(offset_reg) as i32;
                let shift = if W::BITS == 16 { 4 } else { 5 };
                let disp = (signed >> shift) << (shift - 3);
                (
                    EffectiveAddress::Memory {
                        seg,
                        offset: offset.wrapping_add(disp as u32),
                    },
                    offset_reg & (W::BITS - 1),
                )
            }
            reg_ea => (reg_ea, offset_reg & (W::BITS - 1)),
        };
        self.bit_op_ea::<W>(op, ea, bit)
    }

    /// Group 8 (0F BA): BT/BTS/BTR/BTC rm, imm8. The immediate offset is
    /// taken modulo the width for both operand kinds.
    pub(crate) fn group8<W: Operand>(&mut self) -> Result<()> {
        let modrm = self.fetch_u8()?;
        let (_, reg, _) = split_modrm(modrm);
        if reg < 4 {
            return Err(Fault::InvalidOpcode);
        }
        let op = BitOp::from_bits(reg);
        let ea = self.decode_modrm(modrm)?;
        let imm = self.fetch_u8()? as u32;
        self.bit_op_lock_check(op, &ea)?;
        self.bit_op_ea::<W>(op, ea, imm & (W::BITS - 1))
    }
}
