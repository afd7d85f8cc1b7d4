//! x87 loads and stores: FLD, FILD, the constant loads, FST/FSTP, FIST/FISTP,
//! FBSTP, FXCH and FFREE.

use super::{CpuIa32, MemoryIa32};
use crate::cpu_ia32_protected::Seg;
use crate::fault::Result;
use crate::fpu::{
    F80, FPU_STATUS_C1, FPU_STATUS_DE, FPU_STATUS_IE, FPU_STATUS_OE, FPU_STATUS_PE, FPU_STATUS_UE,
    TAG_EMPTY,
};

/// Largest magnitude FBSTP can encode (18 decimal digits).
const BCD_MAX: i128 = 999_999_999_999_999_999;

/// Constant operands of D9 E8..EE.
pub(crate) fn constant(modrm: u8) -> Option<F80> {
    let (exp, mant) = match modrm {
        0xE8 => return Some(F80::ONE),
        0xE9 => (0x4000, 0xD49A_784B_CD1B_8AFE), // log2(10)
        0xEA => return Some(F80::LOG2_E),
        0xEB => (0x4000, 0xC90F_DAA2_2168_C235), // pi
        0xEC => (0x3FFD, 0x9A20_9A84_FBCF_F799), // log10(2)
        0xED => return Some(F80::LN_2),
        0xEE => return Some(F80::ZERO),
        _ => return None,
    };
    Some(F80 { sign: false, exp, mant })
}

/// Integer memory formats of FILD and FIST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IntFormat {
    I16,
    I32,
    I64,
}

impl IntFormat {
    fn bytes(self) -> usize {
        match self {
            IntFormat::I16 => 2,
            IntFormat::I32 => 4,
            IntFormat::I64 => 8,
        }
    }

    fn range(self) -> (i128, i128) {
        match self {
            IntFormat::I16 => (i16::MIN as i128, i16::MAX as i128),
            IntFormat::I32 => (i32::MIN as i128, i32::MAX as i128),
            IntFormat::I64 => (i64::MIN as i128, i64::MAX as i128),
        }
    }

    /// The "integer indefinite": the most negative value of the format.
    fn indefinite(self) -> i128 {
        self.range().0
    }
}

/// Float memory formats of FLD and FST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FloatFormat {
    F32,
    F64,
    F80,
}

impl<M: MemoryIa32> CpuIa32<M> {
    fn fpu_mem_operand(&mut self, modrm: u8) -> Result<(Seg, u32)> {
        let ea = self.decode_modrm(modrm)?;
        self.memory_operand(ea)
    }

    /// Push `value` after the overflow check has passed.
    fn fpu_push_value(&mut self, value: F80) {
        self.fpu.push();
        self.fpu_store(0, value);
    }

    /// FLD m32fp (D9 /0), m64fp (DD /0), m80fp (DB /5)
    pub(crate) fn fld_mem(&mut self, modrm: u8, fmt: FloatFormat) -> Result<()> {
        self.fpu_guard()?;
        let (seg, offset) = self.fpu_mem_operand(modrm)?;
        let (value, denormal) = match fmt {
            FloatFormat::F32 => {
                let bits = self.read_mem::<u32>(seg, offset)?;
                let denormal = bits & 0x7F80_0000 == 0 && bits & 0x007F_FFFF != 0;
                (F80::from_f32_bits(bits), denormal)
            }
            FloatFormat::F64 => {
                let bits = self.read_u64(seg, offset)?;
                let denormal = bits & 0x7FF0_0000_0000_0000 == 0 && bits & 0x000F_FFFF_FFFF_FFFF != 0;
                (F80::from_f64_bits(bits), denormal)
            }
            FloatFormat::F80 => (F80::from_bytes(&self.read_bytes::<10>(seg, offset)?), false),
        };
        if self.fpu_stack_overflow() {
            return Ok(());
        }
        let value = if fmt != FloatFormat::F80 && value.is_signaling() {
            if self.fpu_raise(FPU_STATUS_IE) {
                return Ok(());
            }
            value.quiet()
        } else {
            value
        };
        if denormal && self.fpu_raise(FPU_STATUS_DE) {
            return Ok(());
        }
        self.fpu_push_value(value);
        Ok(())
    }

    /// FLD ST(i) (D9 C0+i)
    pub(crate) fn fld_reg(&mut self, i: u8) -> Result<()> {
        self.fpu_guard()?;
        if self.fpu_stack_underflow(i) {
            return Ok(());
        }
        let value = self.fpu_value(i);
        if self.fpu_stack_overflow() {
            return Ok(());
        }
        self.fpu_push_value(value);
        Ok(())
    }

    /// FLD1, FLDL2T, FLDL2E, FLDPI, FLDLG2, FLDLN2, FLDZ (D9 E8..EE)
    pub(crate) fn fld_constant(&mut self, value: F80) -> Result<()> {
        self.fpu_guard()?;
        if self.fpu_stack_overflow() {
            return Ok(());
        }
        self.fpu_push_value(value);
        Ok(())
    }

    /// FILD m16int (DF /0), m32int (DB /0), m64int (DF /5)
    pub(crate) fn fild(&mut self, modrm: u8, fmt: IntFormat) -> Result<()> {
        self.fpu_guard()?;
        let (seg, offset) = self.fpu_mem_operand(modrm)?;
        let value = match fmt {
            IntFormat::I16 => self.read_mem::<u16>(seg, offset)? as u16 as i16 as i64,
            IntFormat::I32 => self.read_mem::<u32>(seg, offset)? as i32 as i64,
            IntFormat::I64 => self.read_u64(seg, offset)? as i64,
        };
        if self.fpu_stack_overflow() {
            return Ok(());
        }
        self.fpu_push_value(F80::from_i64(value));
        Ok(())
    }

    /// FIST m16int/m32int (DF /2, DB /2) and FISTP m16/m32/m64int
    /// (DF /3, DB /3, DF /7). Out of range stores the integer indefinite
    /// when IE is masked.
    pub(crate) fn fist(&mut self, modrm: u8, fmt: IntFormat, pop: bool) -> Result<()> {
        self.fpu_guard()?;
        let (seg, offset) = self.fpu_mem_operand(modrm)?;
        if self.fpu_stack_underflow(0) {
            return Ok(());
        }
        let value = self.fpu_value(0);
        let (min, max) = fmt.range();
        let (int, inexact) = value.to_int(self.fpu.rounding());
        let int = match int {
            Some(v) if v >= min && v <= max => {
                if inexact && self.fpu_post(FPU_STATUS_PE) {
                    return Ok(());
                }
                v
            }
            _ => {
                if self.fpu_raise(FPU_STATUS_IE) {
                    return Ok(());
                }
                fmt.indefinite()
            }
        };
        let bytes = (int as i64).to_le_bytes();
        self.write_bytes(seg, offset, &bytes[..fmt.bytes()])?;
        if pop {
            self.fpu.pop();
        }
        Ok(())
    }

    /// FST/FSTP m32fp (D9 /2, /3), m64fp (DD /2, /3) and FSTP m80fp (DB /7)
    pub(crate) fn fst_mem(&mut self, modrm: u8, fmt: FloatFormat, pop: bool) -> Result<()> {
        self.fpu_guard()?;
        let (seg, offset) = self.fpu_mem_operand(modrm)?;
        if self.fpu_stack_underflow(0) {
            return Ok(());
        }
        let value = self.fpu_value(0);
        let rc = self.fpu.rounding();
        let (bytes, len, flags) = match fmt {
            FloatFormat::F32 => {
                let (bits, flags) = value.to_f32_bits(rc);
                let mut out = [0u8; 10];
                out[..4].copy_from_slice(&bits.to_le_bytes());
                (out, 4, flags)
            }
            FloatFormat::F64 => {
                let (bits, flags) = value.to_f64_bits(rc);
                let mut out = [0u8; 10];
                out[..8].copy_from_slice(&bits.to_le_bytes());
                (out, 8, flags)
            }
            FloatFormat::F80 => (value.to_bytes(), 10, 0),
        };
        if self.fst_exceptions(flags) {
            return Ok(());
        }
        self.write_bytes(seg, offset, &bytes[..len])?;
        if pop {
            self.fpu.pop();
        }
        Ok(())
    }

    /// Exceptions of a narrowing store. After an overflow or underflow the
    /// precision exception only clears C1 unless configured otherwise.
    fn fst_exceptions(&mut self, flags: u16) -> bool {
        if flags & FPU_STATUS_IE != 0 && self.fpu_raise(FPU_STATUS_IE) {
            return true;
        }
        let range = flags & (FPU_STATUS_OE | FPU_STATUS_UE);
        if range != 0 {
            if self.fpu_post(range) {
                return true;
            }
            if self.config.fst_inexact_after_overflow_clears_c1 {
                self.fpu.status &= !FPU_STATUS_C1;
                return false;
            }
        }
        self.fpu_post(flags & FPU_STATUS_PE)
    }

    /// FST ST(i) (DD D0+i) and FSTP ST(i) (DD D8+i)
    pub(crate) fn fst_reg(&mut self, i: u8, pop: bool) -> Result<()> {
        self.fpu_guard()?;
        if self.fpu_stack_underflow(0) {
            return Ok(());
        }
        let value = self.fpu_value(0);
        self.fpu_store(i, value);
        if pop {
            self.fpu.pop();
        }
        Ok(())
    }

    /// FBSTP m80bcd (DF /6)
    pub(crate) fn fbstp(&mut self, modrm: u8) -> Result<()> {
        self.fpu_guard()?;
        let (seg, offset) = self.fpu_mem_operand(modrm)?;
        if self.fpu_stack_underflow(0) {
            return Ok(());
        }
        let value = self.fpu_value(0);
        let mut out = [0u8; 10];
        if value.is_nan() || value.is_infinite() {
            if self.fpu_raise(FPU_STATUS_IE) {
                return Ok(());
            }
            out = bcd_indefinite();
        } else {
            let (int, inexact) = value.to_int(self.fpu.rounding());
            if inexact && self.fpu_post(FPU_STATUS_PE) {
                return Ok(());
            }
            match int {
                Some(v) if v.abs() <= BCD_MAX => {
                    let mut magnitude = v.unsigned_abs();
                    for byte in out.iter_mut().take(9) {
                        let lo = (magnitude % 10) as u8;
                        magnitude /= 10;
                        let hi = (magnitude % 10) as u8;
                        magnitude /= 10;
                        *byte = (hi << 4) | lo;
                    }
                    if value.sign {
                        out[9] = 0x80;
                    }
                }
                _ => {
                    if self.fpu_raise(FPU_STATUS_IE) {
                        return Ok(());
                    }
                    out = bcd_indefinite();
                }
            }
        }
        self.write_bytes(seg, offset, &out)?;
        self.fpu.pop();
        Ok(())
    }

    /// FXCH ST(i) (D9 C8+i)
    pub(crate) fn fxch(&mut self, i: u8) -> Result<()> {
        self.fpu_guard()?;
        if self.fpu_stack_underflow(0) || self.fpu_stack_underflow(i) {
            return Ok(());
        }
        let a = self.fpu_value(0);
        let b = self.fpu_value(i);
        self.fpu_store(0, b);
        self.fpu_store(i, a);
        Ok(())
    }

    /// FFREE ST(i) (DD C0+i)
    pub(crate) fn ffree(&mut self, i: u8) -> Result<()> {
        self.fpu_guard()?;
        self.fpu.set_tag(i, TAG_EMPTY);
        Ok(())
    }
}

/// Packed BCD indefinite: FF FF C0 00.. high to low.
fn bcd_indefinite() -> [u8; 10] {
    let mut out = [0u8; 10];
    out[7] = 0xC0;
    out[8] = 0xFF;
    out[9] = 0xFF;
    out
}
