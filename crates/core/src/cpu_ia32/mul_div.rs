//! MUL/IMUL/DIV/IDIV.
//!
//! The one-operand forms work on the accumulator pair: AX for bytes,
//! DX:AX for words, EDX:EAX for dwords. LOCK is rejected once the operand
//! has been decoded, before it is read.

use super::addressing::{split_modrm, EffectiveAddress};
use super::{CpuIa32, MemoryIa32, REG_EAX, REG_EDX};
use crate::fault::{Fault, Result};
use crate::flags::{Operand, FLAG_CF, FLAG_OF, FLAG_SF};
use crate::logging::{log, LogCategory, LogLevel};

/// `val` as a signed `W` value.
fn signed<W: Operand>(val: u32) -> i64 {
    W::sign_extend(val) as i32 as i64
}

/// Signed product truncated to `W`, and whether the truncation lost bits.
fn imul_truncate<W: Operand>(product: i64) -> (u32, bool) {
    let res = W::truncate(product as u32);
    (res, signed::<W>(res) != product)
}

impl<M: MemoryIa32> CpuIa32<M> {
    /// Double-width accumulator: AX, DX:AX or EDX:EAX.
    fn wide_acc<W: Operand>(&self) -> u64 {
        if W::BITS == 8 {
            self.reg16(REG_EAX) as u64
        } else {
            (self.reg::<W>(REG_EDX) as u64) << W::BITS | self.reg::<W>(REG_EAX) as u64
        }
    }

    /// Write the low half to AL/AX/EAX and the high half to AH/DX/EDX.
    fn set_acc_pair<W: Operand>(&mut self, low: u32, high: u32) {
        if W::BITS == 8 {
            self.set_reg8(0, low as u8);
            self.set_reg8(4, high as u8);
        } else {
            self.set_reg::<W>(REG_EAX, low);
            self.set_reg::<W>(REG_EDX, high);
        }
    }

    fn divide_error<W: Operand>(&self, what: &str) -> Fault {
        log(LogCategory::Faults, LogLevel::Debug, || {
            format!("#DE at {:08X}: {} {}-bit", self.old_eip, what, W::BITS)
        });
        Fault::DivideError
    }

    /// MUL rm (F6/F7 /4). CF and OF report a nonzero high half.
    pub(crate) fn mul<W: Operand>(&mut self, ea: EffectiveAddress) -> Result<()> {
        self.check_lock()?;
        let src = self.read_ea::<W>(ea)? as u64;
        let product = self.reg::<W>(REG_EAX) as u64 * src;
        let high = (product >> W::BITS) as u32;
        self.set_acc_pair::<W>(product as u32, high);
        self.set_flag(FLAG_CF, high != 0);
        self.set_flag(FLAG_OF, high != 0);
        Ok(())
    }

    /// IMUL rm (F6/F7 /5)
    pub(crate) fn imul_acc<W: Operand>(&mut self, ea: EffectiveAddress) -> Result<()> {
        self.check_lock()?;
        let src = signed::<W>(self.read_ea::<W>(ea)?);
        let product = signed::<W>(self.reg::<W>(REG_EAX)) * src;
        let (low, overflow) = imul_truncate::<W>(product);
        self.set_acc_pair::<W>(low, (product >> W::BITS) as u32);
        self.set_flag(FLAG_SF, W::is_negative(low));
        self.set_flag(FLAG_CF, overflow);
        self.set_flag(FLAG_OF, overflow);
        Ok(())
    }

    /// DIV rm (F6/F7 /6). #DE on a zero divisor or a quotient wider than
    /// `W`; nothing is written in either case.
    pub(crate) fn div<W: Operand>(&mut self, ea: EffectiveAddress) -> Result<()> {
        self.check_lock()?;
        let divisor = self.read_ea::<W>(ea)? as u64;
        if divisor == 0 {
            return Err(self.divide_error::<W>("DIV by zero"));
        }
        let dividend = self.wide_acc::<W>();
        let quotient = dividend / divisor;
        if quotient > W::MASK as u64 {
            return Err(self.divide_error::<W>("DIV quotient overflow"));
        }
        self.set_acc_pair::<W>(quotient as u32, (dividend % divisor) as u32);
        Ok(())
    }

    /// IDIV rm (F6/F7 /7). The quotient truncates toward zero and the
    /// remainder takes the dividend's sign.
    pub(crate) fn idiv<W: Operand>(&mut self, ea: EffectiveAddress) -> Result<()> {
        self.check_lock()?;
        let divisor = signed::<W>(self.read_ea::<W>(ea)?);
        if divisor == 0 {
            return Err(self.divide_error::<W>("IDIV by zero"));
        }
        let shift = 64 - 2 * W::BITS;
        let dividend = ((self.wide_acc::<W>() << shift) as i64) >> shift;
        let min = -(1i64 << (W::BITS - 1));
        let max = (1i64 << (W::BITS - 1)) - 1;
        let quotient = match dividend.checked_div(divisor) {
            Some(q) if (min..=max).contains(&q) => q,
            _ => return Err(self.divide_error::<W>("IDIV quotient overflow")),
        };
        let remainder = dividend - quotient * divisor;
        self.set_acc_pair::<W>(quotient as u32, remainder as u32);
        Ok(())
    }

    fn imul_store<W: Operand>(&mut self, reg: u8, a: u32, b: u32) {
        let (res, overflow) = imul_truncate::<W>(signed::<W>(a) * signed::<W>(b));
        self.set_reg::<W>(reg, res);
        self.set_flag(FLAG_SF, W::is_negative(res));
        self.set_flag(FLAG_CF, overflow);
        self.set_flag(FLAG_OF, overflow);
    }

    /// IMUL r, rm (0F AF)
    pub(crate) fn imul_r_rm<W: Operand>(&mut self) -> Result<()> {
        let modrm = self.fetch_u8()?;
        let (_, reg, _) = split_modrm(modrm);
        let ea = self.decode_modrm(modrm)?;
        self.check_lock()?;
        let src = self.read_ea::<W>(ea)?;
        let dst = self.reg::<W>(reg);
        self.imul_store::<W>(reg, dst, src);
        Ok(())
    }

    /// IMUL r, rm, imm (69 with a full immediate, 6B with a sign-extended imm8)
    pub(crate) fn imul_r_rm_imm<W: Operand>(&mut self, sext8: bool) -> Result<()> {
        let modrm = self.fetch_u8()?;
        let (_, reg, _) = split_modrm(modrm);
        let ea = self.decode_modrm(modrm)?;
        let imm = if sext8 { self.fetch_simm8::<W>()? } else { self.fetch_imm::<W>()? };
        self.check_lock()?;
        let src = self.read_ea::<W>(ea)?;
        self.imul_store::<W>(reg, src, imm);
        Ok(())
    }
}
