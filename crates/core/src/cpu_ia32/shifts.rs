//! Shifts and rotates: group 2 (C0, C1, D0-D3) and SHLD/SHRD.
//!
//! Counts are masked to 5 bits. A masked count of 0 leaves the operand and
//! every flag untouched. Rotates only ever touch CF and OF; shifts set
//! CF/OF/SF/ZF/PF and leave AF alone.

use super::addressing::{split_modrm, EffectiveAddress};
use super::{CpuIa32, MemoryIa32, REG_ECX};
use crate::fault::Result;
use crate::flags::{set_szp, Operand, FLAG_CF, FLAG_OF};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShiftOp {
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    Sar,
}

impl ShiftOp {
    fn from_bits(bits: u8) -> Self {
        match bits & 7 {
            0 => ShiftOp::Rol,
            1 => ShiftOp::Ror,
            2 => ShiftOp::Rcl,
            3 => ShiftOp::Rcr,
            4 | 6 => ShiftOp::Shl, // 6 is the SAL alias
            5 => ShiftOp::Shr,
            _ => ShiftOp::Sar,
        }
    }
}

/// Where a group-2 count comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShiftCount {
    One,
    Cl,
    Imm8,
}

#[inline]
fn bit(val: u32, n: u32) -> bool {
    (val >> n) & 1 != 0
}

impl<M: MemoryIa32> CpuIa32<M> {
    /// Shift or rotate `val` by an already masked `count`. Returns `None`
    /// when nothing changes.
    pub(crate) fn shift<W: Operand>(&mut self, op: ShiftOp, val: u32, count: u32) -> Option<u32> {
        if count == 0 {
            return None;
        }
        let w = W::BITS;
        let val = W::truncate(val);
        let msb = w - 1;
        let res = match op {
            ShiftOp::Shl => {
                let (res, cf) = if count <= w {
                    (W::truncate(((val as u64) << count) as u32), bit(val, w - count))
                } else {
                    (0, false)
                };
                self.set_flag(FLAG_CF, cf);
                if count == 1 {
                    self.set_flag(FLAG_OF, bit(val, msb) ^ bit(val, msb - 1));
                }
                set_szp::<W>(&mut self.eflags, res);
                res
            }
            ShiftOp::Shr => {
                let (res, cf) = if count <= w {
                    (((val as u64) >> count) as u32, bit(val, count - 1))
                } else {
                    (0, false)
                };
                self.set_flag(FLAG_CF, cf);
                if count == 1 {
                    self.set_flag(FLAG_OF, bit(val, msb));
                }
                set_szp::<W>(&mut self.eflags, res);
                res
            }
            ShiftOp::Sar => {
                let signed = W::sign_extend(val) as i32;
                let (res, cf) = if count >= w {
                    let fill = if signed < 0 { W::MASK } else { 0 };
                    (fill, signed < 0)
                } else {
                    (W::truncate((signed >> count) as u32), (signed >> (count - 1)) & 1 != 0)
                };
                self.set_flag(FLAG_CF, cf);
                if count == 1 {
                    self.set_flag(FLAG_OF, false);
                }
                set_szp::<W>(&mut self.eflags, res);
                res
            }
            ShiftOp::Rol => {
                let c = count % w;
                let res = if c == 0 {
                    val
                } else {
                    W::truncate((val << c) | (val >> (w - c)))
                };
                self.set_flag(FLAG_CF, bit(res, 0));
                if count == 1 {
                    self.set_flag(FLAG_OF, bit(val, msb) ^ bit(val, msb - 1));
                }
                res
            }
            ShiftOp::Ror => {
                let c = count % w;
                let res = if c == 0 {
                    val
                } else {
                    W::truncate((val >> c) | (val << (w - c)))
                };
                self.set_flag(FLAG_CF, bit(res, msb));
                if count == 1 {
                    self.set_flag(FLAG_OF, bit(val, msb) ^ bit(val, 0));
                }
                res
            }
            ShiftOp::Rcl | ShiftOp::Rcr => {
                let c = count % (w + 1);
                if c == 0 {
                    return None;
                }
                let old_cf = self.carry() as u64;
                let full = (1u64 << (w + 1)) - 1;
                let wide = val as u64 | (old_cf << w);
                let rotated = if op == ShiftOp::Rcl {
                    ((wide << c) | (wide >> (w + 1 - c))) & full
                } else {
                    ((wide >> c) | (wide << (w + 1 - c))) & full
                };
                let res = (rotated as u32) & W::MASK;
                self.set_flag(FLAG_CF, (rotated >> w) & 1 != 0);
                if count == 1 {
                    let of = if op == ShiftOp::Rcl {
                        bit(val, msb) ^ bit(val, msb - 1)
                    } else {
                        bit(val, msb) ^ (old_cf != 0)
                    };
                    self.set_flag(FLAG_OF, of);
                }
                res
            }
        };
        Some(res)
    }

    /// Group 2: shift/rotate rm by 1, CL or imm8.
    pub(crate) fn group2<W: Operand>(&mut self, source: ShiftCount) -> Result<()> {
        let modrm = self.fetch_u8()?;
        let (_, reg, _) = split_modrm(modrm);
        let ea = self.decode_modrm(modrm)?;
        let count = match source {
            ShiftCount::One => 1,
            ShiftCount::Cl => self.reg8(REG_ECX) as u32,
            ShiftCount::Imm8 => self.fetch_u8()? as u32,
        } & 0x1F;
        self.check_lock()?;
        let op = ShiftOp::from_bits(reg);
        match ea {
            EffectiveAddress::Register(r) => {
                let val = self.reg::<W>(r);
                if let Some(res) = self.shift::<W>(op, val, count) {
                    self.set_reg::<W>(r, res);
                }
            }
            EffectiveAddress::Memory { seg, offset } => {
                let val = self.read_mem::<W>(seg, offset)?;
                if let Some(res) = self.shift::<W>(op, val, count) {
                    self.write_mem::<W>(seg, offset, res)?;
                }
            }
        }
        Ok(())
    }

    /// Double-precision shift of `dst` filled from `src`. `None` unless
    /// `0 < count <= width`.
    pub(crate) fn double_shift<W: Operand>(&mut self, left: bool, dst: u32, src: u32, count: u32) -> Option<u32> {
        let w = W::BITS;
        if count == 0 || count > w {
            return None;
        }
        let dst = W::truncate(dst);
        let src = W::truncate(src) as u64;
        let res = if left {
            let wide = ((dst as u64) << w) | src;
            W::truncate((wide << count >> w) as u32)
        } else {
            let wide = (src << w) | dst as u64;
            W::truncate((wide >> count) as u32)
        };
        let cf = if left {
            bit(dst, w - count)
        } else {
            bit(dst, count - 1)
        };
        self.set_flag(FLAG_CF, cf);
        if count == 1 {
            self.set_flag(FLAG_OF, (res ^ dst) & W::MSB != 0);
        }
        set_szp::<W>(&mut self.eflags, res);
        Some(res)
    }

    /// SHLD (0F A4/A5) and SHRD (0F AC/AD)
    pub(crate) fn shld_shrd<W: Operand>(&mut self, left: bool, by_cl: bool) -> Result<()> {
        let modrm = self.fetch_u8()?;
        let (_, reg, _) = split_modrm(modrm);
        let ea = self.decode_modrm(modrm)?;
        let count = if by_cl {
            self.reg8(REG_ECX) as u32
        } else {
            self.fetch_u8()? as u32
        } & 0x1F;
        self.check_lock()?;
        let src = self.reg::<W>(reg);
        match ea {
            EffectiveAddress::Register(r) => {
                let dst = self.reg::<W>(r);
                if let Some(res) = self.double_shift::<W>(left, dst, src, count) {
                    self.set_reg::<W>(r, res);
                }
            }
            EffectiveAddress::Memory { seg, offset } => {
                let dst = self.read_mem::<W>(seg, offset)?;
                if let Some(res) = self.double_shift::<W>(left, dst, src, count) {
                    self.write_mem::<W>(seg, offset, res)?;
                }
            }
        }
        Ok(())
    }
}
