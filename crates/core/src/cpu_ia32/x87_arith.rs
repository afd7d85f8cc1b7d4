//! x87 arithmetic, comparison and transcendental instructions, plus the
//! exception bookkeeping every x87 handler shares.
//!
//! An unmasked exception sets ES and ends the instruction with `Ok(())`:
//! delivery happens at the next waiting x87 instruction, which this core
//! reports as `Fault::Unimplemented`.

use super::{CpuIa32, MemoryIa32};
use crate::cpu_ia32_protected::{Seg, CR0_EM, CR0_TS};
use crate::fault::{Fault, Result};
use crate::fpu::{
    Class, Relation, Rounding, F80, FPU_STATUS_C0, FPU_STATUS_C1, FPU_STATUS_C2, FPU_STATUS_C3,
    FPU_STATUS_DE, FPU_STATUS_ES, FPU_STATUS_IE, FPU_STATUS_OE, FPU_STATUS_PE, FPU_STATUS_SF,
    FPU_STATUS_UE, FPU_STATUS_ZE, TAG_EMPTY,
};
use crate::logging::{log, LogCategory, LogLevel};

/// Exponent at and above which FSIN/FCOS/FPTAN leave the operand alone.
const TRIG_EXP_LIMIT: u16 = 0x3FFF + 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FpuArith {
    Add,
    Mul,
    Sub,
    SubR,
    Div,
    DivR,
}

impl FpuArith {
    /// Operation selected by the /reg field of D8/DA/DC/DE (2 and 3 are
    /// the compares).
    pub(crate) fn from_reg(reg: u8) -> Option<Self> {
        match reg & 7 {
            0 => Some(FpuArith::Add),
            1 => Some(FpuArith::Mul),
            4 => Some(FpuArith::Sub),
            5 => Some(FpuArith::SubR),
            6 => Some(FpuArith::Div),
            7 => Some(FpuArith::DivR),
            _ => None,
        }
    }

    /// The DC/DE register forms encode SUB/SUBR and DIV/DIVR swapped.
    pub(crate) fn swapped(self) -> Self {
        match self {
            FpuArith::Sub => FpuArith::SubR,
            FpuArith::SubR => FpuArith::Sub,
            FpuArith::Div => FpuArith::DivR,
            FpuArith::DivR => FpuArith::Div,
            other => other,
        }
    }
}

/// Memory operand format of an x87 instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemFormat {
    F32,
    F64,
    I16,
    I32,
}

impl<M: MemoryIa32> CpuIa32<M> {
    // Shared bookkeeping

    /// Entry checks of a waiting x87 instruction: LOCK, CR0.EM/TS, a
    /// pending unmasked exception. C1 is cleared afterwards.
    pub(crate) fn fpu_guard(&mut self) -> Result<()> {
        self.fpu_guard_no_wait()?;
        if self.fpu.status & FPU_STATUS_ES != 0 {
            return Err(Fault::Unimplemented("delivery of a pending x87 exception"));
        }
        self.fpu.status &= !FPU_STATUS_C1;
        Ok(())
    }

    /// Entry checks of the non-waiting control instructions.
    pub(crate) fn fpu_guard_no_wait(&mut self) -> Result<()> {
        self.check_lock()?;
        if self.cr0 & (CR0_EM | CR0_TS) != 0 {
            return Err(Fault::DeviceNotAvailable);
        }
        Ok(())
    }

    /// Record exception bits; true when the instruction must stop.
    pub(crate) fn fpu_raise(&mut self, bits: u16) -> bool {
        let stop = self.fpu.raise(bits);
        if stop {
            log(LogCategory::Fpu, LogLevel::Debug, || {
                format!(
                    "unmasked x87 exception {:02X} at {:08X} (control {:04X})",
                    bits & self.fpu.status & 0x3F,
                    self.old_eip,
                    self.fpu.control
                )
            });
        }
        stop
    }

    /// Stack underflow on ST(i). A masked underflow continues with the
    /// indefinite value in place of the empty register.
    pub(crate) fn fpu_stack_underflow(&mut self, i: u8) -> bool {
        if self.fpu.tag(i) != TAG_EMPTY {
            return false;
        }
        self.fpu.status &= !FPU_STATUS_C1;
        self.fpu_raise(FPU_STATUS_IE | FPU_STATUS_SF)
    }

    /// Stack overflow when pushing into a non-empty ST(7).
    pub(crate) fn fpu_stack_overflow(&mut self) -> bool {
        if self.fpu.tag(7) == TAG_EMPTY {
            return false;
        }
        self.fpu.status |= FPU_STATUS_C1;
        self.fpu_raise(FPU_STATUS_IE | FPU_STATUS_SF)
    }

    /// ST(i), or the indefinite value when it is empty.
    pub(crate) fn fpu_value(&self, i: u8) -> F80 {
        if self.fpu.tag(i) == TAG_EMPTY {
            F80::INDEFINITE
        } else {
            self.fpu.st(i)
        }
    }

    /// Store into ST(i) and retag it.
    pub(crate) fn fpu_store(&mut self, i: u8, value: F80) {
        self.fpu.set_st(i, value);
        self.fpu.update_tag(i);
    }

    /// Post-operation exceptions in x87 priority order. PE clears C1.
    pub(crate) fn fpu_post(&mut self, flags: u16) -> bool {
        for bit in [FPU_STATUS_OE, FPU_STATUS_UE, FPU_STATUS_IE, FPU_STATUS_ZE, FPU_STATUS_PE] {
            if flags & bit == 0 {
                continue;
            }
            if bit == FPU_STATUS_PE {
                self.fpu.status &= !FPU_STATUS_C1;
            }
            if self.fpu_raise(bit) {
                return true;
            }
        }
        false
    }

    /// DE for denormal operands, IE for any NaN (the FCOM rule).
    fn fpu_check_operand(&mut self, value: &F80, denormal_source: bool) -> bool {
        if denormal_source || value.is_denormal() {
            self.fpu_raise(FPU_STATUS_DE)
        } else if value.is_nan() {
            self.fpu_raise(FPU_STATUS_IE)
        } else {
            false
        }
    }

    fn fpu_check_denormal(&mut self, value: &F80) -> bool {
        value.is_denormal() && self.fpu_raise(FPU_STATUS_DE)
    }

    /// Read a memory operand; the flag reports a denormal in the source
    /// format.
    pub(crate) fn fpu_read_operand(&self, seg: Seg, offset: u32, fmt: MemFormat) -> Result<(F80, bool)> {
        Ok(match fmt {
            MemFormat::F32 => {
                let bits = self.read_mem::<u32>(seg, offset)?;
                let denormal = bits & 0x7F80_0000 == 0 && bits & 0x007F_FFFF != 0;
                (F80::from_f32_bits(bits), denormal)
            }
            MemFormat::F64 => {
                let bits = self.read_u64(seg, offset)?;
                let denormal = bits & 0x7FF0_0000_0000_0000 == 0 && bits & 0x000F_FFFF_FFFF_FFFF != 0;
                (F80::from_f64_bits(bits), denormal)
            }
            MemFormat::I16 => {
                let v = self.read_mem::<u16>(seg, offset)? as u16 as i16;
                (F80::from_i64(v as i64), false)
            }
            MemFormat::I32 => {
                let v = self.read_mem::<u32>(seg, offset)? as i32;
                (F80::from_i64(v as i64), false)
            }
        })
    }

    pub(crate) fn read_u64(&self, seg: Seg, offset: u32) -> Result<u64> {
        let bytes = self.read_bytes::<8>(seg, offset)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Memory operand of an x87 instruction.
    fn fpu_mem(&mut self, modrm: u8) -> Result<(Seg, u32)> {
        let ea = self.decode_modrm(modrm)?;
        self.memory_operand(ea)
    }

    // Arithmetic

    /// ST(dst) = a op b. True when an unmasked exception stopped it.
    fn fpu_arith_apply(&mut self, op: FpuArith, dst: u8, a: F80, b: F80) -> bool {
        let rc = self.fpu.rounding();
        if let FpuArith::Div | FpuArith::DivR = op {
            let (dividend, divisor) = if op == FpuArith::Div { (a, b) } else { (b, a) };
            let raises_ze = self.config.fdiv_any_zero_divisor_raises_ze
                || matches!(dividend.classify(), Class::Normal | Class::Denormal);
            if divisor.is_zero() && raises_ze && self.fpu_raise(FPU_STATUS_ZE) {
                return true;
            }
        }
        let (res, flags) = match op {
            FpuArith::Add => a.add(b, rc),
            FpuArith::Mul => a.mul(b, rc),
            FpuArith::Sub => a.sub(b, rc),
            FpuArith::SubR => b.sub(a, rc),
            FpuArith::Div => a.div(b, rc),
            FpuArith::DivR => b.div(a, rc),
        };
        self.fpu_store(dst, res);
        self.fpu_post(flags & !FPU_STATUS_ZE)
    }

    /// ST(0) = ST(0) op m32fp/m64fp/m16int/m32int
    pub(crate) fn fpu_arith_mem(&mut self, modrm: u8, op: FpuArith, fmt: MemFormat) -> Result<()> {
        self.fpu_guard()?;
        let (seg, offset) = self.fpu_mem(modrm)?;
        let (src, denormal) = self.fpu_read_operand(seg, offset, fmt)?;
        if self.fpu_stack_underflow(0) {
            return Ok(());
        }
        if denormal && self.fpu_raise(FPU_STATUS_DE) {
            return Ok(());
        }
        let st0 = self.fpu_value(0);
        self.fpu_arith_apply(op, 0, st0, src);
        Ok(())
    }

    /// Register forms: ST(0) = ST(0) op ST(i), or ST(i) = ST(i) op ST(0)
    /// with an optional pop.
    pub(crate) fn fpu_arith_reg(&mut self, op: FpuArith, i: u8, into_st0: bool, pop: bool) -> Result<()> {
        self.fpu_guard()?;
        if self.fpu_stack_underflow(0) || self.fpu_stack_underflow(i) {
            return Ok(());
        }
        let st0 = self.fpu_value(0);
        let sti = self.fpu_value(i);
        let stopped = if into_st0 {
            self.fpu_arith_apply(op, 0, st0, sti)
        } else {
            self.fpu_arith_apply(op, i, sti, st0)
        };
        if !stopped && pop {
            self.fpu.pop();
        }
        Ok(())
    }

    // Comparison

    fn fpu_set_relation(&mut self, relation: Relation) {
        let bits = match relation {
            Relation::Greater => 0,
            Relation::Less => FPU_STATUS_C0,
            Relation::Equal => FPU_STATUS_C3,
            Relation::Unordered => FPU_STATUS_C3 | FPU_STATUS_C2 | FPU_STATUS_C0,
        };
        self.fpu.status &= !(FPU_STATUS_C3 | FPU_STATUS_C2 | FPU_STATUS_C0);
        self.fpu.status |= bits;
    }

    /// FCOM/FCOMP/FICOM/FICOMP with a memory operand.
    pub(crate) fn fcom_mem(&mut self, modrm: u8, fmt: MemFormat, pop: bool) -> Result<()> {
        self.fpu_guard()?;
        let (seg, offset) = self.fpu_mem(modrm)?;
        let (src, denormal) = self.fpu_read_operand(seg, offset, fmt)?;
        self.fpu.status |= FPU_STATUS_C3 | FPU_STATUS_C2 | FPU_STATUS_C0;
        if self.fpu_stack_underflow(0) {
            return Ok(());
        }
        let st0 = self.fpu_value(0);
        if self.fpu_check_operand(&st0, false) || self.fpu_check_operand(&src, denormal) {
            return Ok(());
        }
        self.fpu_set_relation(st0.compare(&src));
        if pop {
            self.fpu.pop();
        }
        Ok(())
    }

    /// FCOM/FCOMP/FCOMPP ST(i); `pops` is 0, 1 or 2.
    pub(crate) fn fcom_reg(&mut self, i: u8, pops: u8) -> Result<()> {
        self.fpu_guard()?;
        if self.fpu_stack_underflow(0) || self.fpu_stack_underflow(i) {
            return Ok(());
        }
        self.fpu.status |= FPU_STATUS_C3 | FPU_STATUS_C2 | FPU_STATUS_C0;
        let st0 = self.fpu_value(0);
        let sti = self.fpu_value(i);
        if self.fpu_check_operand(&st0, false) || self.fpu_check_operand(&sti, false) {
            return Ok(());
        }
        self.fpu_set_relation(st0.compare(&sti));
        for _ in 0..pops {
            self.fpu.pop();
        }
        Ok(())
    }

    /// FTST (D9 E4)
    pub(crate) fn ftst(&mut self) -> Result<()> {
        self.fpu_guard()?;
        self.fpu.status |= FPU_STATUS_C3 | FPU_STATUS_C2 | FPU_STATUS_C0;
        if self.fpu_stack_underflow(0) {
            return Ok(());
        }
        let st0 = self.fpu_value(0);
        if self.fpu_check_operand(&st0, false) {
            return Ok(());
        }
        self.fpu_set_relation(st0.compare(&F80::ZERO));
        Ok(())
    }

    /// FXAM (D9 E5)
    pub(crate) fn fxam(&mut self) -> Result<()> {
        self.fpu_guard()?;
        let value = self.fpu.st(0);
        self.fpu.set_condition(FPU_STATUS_C1, value.sign);
        let bits = if self.fpu.tag(0) == TAG_EMPTY {
            FPU_STATUS_C3 | FPU_STATUS_C0
        } else {
            match value.classify() {
                Class::Unsupported => 0,
                Class::QuietNan | Class::SignalingNan => FPU_STATUS_C0,
                Class::Normal => FPU_STATUS_C2,
                Class::Infinity => FPU_STATUS_C2 | FPU_STATUS_C0,
                Class::Zero => FPU_STATUS_C3,
                Class::Denormal => FPU_STATUS_C3 | FPU_STATUS_C2,
            }
        };
        self.fpu.status &= !(FPU_STATUS_C3 | FPU_STATUS_C2 | FPU_STATUS_C0);
        self.fpu.status |= bits;
        Ok(())
    }

    // Single-operand instructions on ST(0)

    /// FCHS (D9 E0) and FABS (D9 E1)
    pub(crate) fn fchs_fabs(&mut self, abs: bool) -> Result<()> {
        self.fpu_guard()?;
        if self.fpu_stack_underflow(0) {
            return Ok(());
        }
        let v = self.fpu_value(0);
        self.fpu_store(0, if abs { v.abs() } else { v.neg() });
        Ok(())
    }

    /// FSQRT (D9 FA)
    pub(crate) fn fsqrt(&mut self) -> Result<()> {
        self.fpu_guard()?;
        if self.fpu_stack_underflow(0) {
            return Ok(());
        }
        let v = self.fpu_value(0);
        if self.fpu_check_denormal(&v) {
            return Ok(());
        }
        let (res, flags) = v.sqrt(self.fpu.rounding());
        self.fpu_store(0, res);
        self.fpu_post(flags);
        Ok(())
    }

    /// FRNDINT (D9 FC)
    pub(crate) fn frndint(&mut self) -> Result<()> {
        self.fpu_guard()?;
        if self.fpu_stack_underflow(0) {
            return Ok(());
        }
        let v = self.fpu_value(0);
        if v.is_nan() {
            if v.is_signaling() && self.fpu_raise(FPU_STATUS_IE) {
                return Ok(());
            }
            self.fpu_store(0, v.quiet());
            return Ok(());
        }
        if self.fpu_check_denormal(&v) {
            return Ok(());
        }
        let (res, inexact) = v.round_to_int(self.fpu.rounding());
        self.fpu_store(0, res);
        if inexact {
            self.fpu_post(FPU_STATUS_PE);
        }
        Ok(())
    }

    /// FSCALE (D9 FD): ST(0) * 2^trunc(ST(1))
    pub(crate) fn fscale(&mut self) -> Result<()> {
        self.fpu_guard()?;
        if self.fpu_stack_underflow(0) || self.fpu_stack_underflow(1) {
            return Ok(());
        }
        let a = self.fpu_value(0);
        let b = self.fpu_value(1);
        let (res, flags) = if a.is_nan() || b.is_nan() {
            let nan = if a.is_nan() { a } else { b };
            let flags = if a.is_signaling() || b.is_signaling() { FPU_STATUS_IE } else { 0 };
            (nan.quiet(), flags)
        } else if b.is_infinite() {
            match (b.sign, a.is_zero(), a.is_infinite()) {
                (false, true, _) | (true, _, true) => (F80::INDEFINITE, FPU_STATUS_IE),
                (false, false, _) => (F80::infinity(a.sign), 0),
                (true, _, false) => (F80::zero(a.sign), 0),
            }
        } else {
            let n = b.to_int(Rounding::Zero).0.unwrap_or(0).clamp(-70_000, 70_000) as i32;
            a.scale(n, self.fpu.rounding())
        };
        self.fpu_store(0, res);
        self.fpu_post(flags);
        Ok(())
    }

    /// FPREM (D9 F8): partial remainder of ST(0) / ST(1).
    pub(crate) fn fprem(&mut self) -> Result<()> {
        self.fpu_guard()?;
        if self.fpu_stack_underflow(0) || self.fpu_stack_underflow(1) {
            return Ok(());
        }
        let a = self.fpu_value(0);
        let b = self.fpu_value(1);
        if self.fpu_check_denormal(&a) || self.fpu_check_denormal(&b) {
            return Ok(());
        }
        let rem = a.partial_remainder(b);
        if rem.exceptions & FPU_STATUS_IE != 0 && self.fpu_raise(FPU_STATUS_IE) {
            return Ok(());
        }
        self.fpu_store(0, rem.value);
        self.fpu.set_condition(FPU_STATUS_C2, !rem.complete);
        if rem.complete {
            self.fpu.set_condition(FPU_STATUS_C1, rem.quotient & 1 != 0);
            self.fpu.set_condition(FPU_STATUS_C3, rem.quotient & 2 != 0);
            self.fpu.set_condition(FPU_STATUS_C0, rem.quotient & 4 != 0);
        }
        self.fpu_post(rem.exceptions & !FPU_STATUS_IE);
        Ok(())
    }

    // Transcendentals, evaluated in host double precision

    /// Convert a host result back, reporting PE unless it was exact.
    fn fpu_host_result(value: f64, exact: bool) -> (F80, u16) {
        (F80::from_f64(value), if exact { 0 } else { FPU_STATUS_PE })
    }

    /// NaN operands: quiet result, IE when signaling. `None` for numbers.
    fn fpu_nan_result(a: &F80, b: &F80) -> Option<(F80, u16)> {
        if !a.is_nan() && !b.is_nan() {
            return None;
        }
        let nan = if a.is_nan() { *a } else { *b };
        let flags = if a.is_signaling() || b.is_signaling() { FPU_STATUS_IE } else { 0 };
        Some((nan.quiet(), flags))
    }

    /// F2XM1 (D9 F0): ST(0) = 2^ST(0) - 1
    pub(crate) fn f2xm1(&mut self) -> Result<()> {
        self.fpu_guard()?;
        if self.fpu_stack_underflow(0) {
            return Ok(());
        }
        let v = self.fpu_value(0);
        if self.fpu_check_operand(&v, false) {
            return Ok(());
        }
        let (res, flags) = if let Some(nan) = Self::fpu_nan_result(&v, &v) {
            nan
        } else if v.is_infinite() {
            // 2^-inf - 1 = -1, 2^+inf - 1 = +inf
            (if v.sign { F80::ONE.neg() } else { v }, 0)
        } else {
            let x = v.to_f64();
            Self::fpu_host_result((x * std::f64::consts::LN_2).exp_m1(), v.is_zero())
        };
        self.fpu_store(0, res);
        self.fpu_post(flags);
        Ok(())
    }

    /// FSIN (D9 FE), FCOS (D9 FF) and FPTAN (D9 F2)
    pub(crate) fn ftrig(&mut self, kind: u8) -> Result<()> {
        self.fpu_guard()?;
        if self.fpu_stack_underflow(0) {
            return Ok(());
        }
        let is_tan = kind == 0xF2;
        if is_tan && self.fpu_stack_overflow() {
            return Ok(());
        }
        let v = self.fpu_value(0);
        if let Some((nan, flags)) = Self::fpu_nan_result(&v, &v) {
            if flags != 0 && self.fpu_raise(flags) {
                return Ok(());
            }
            self.fpu_store(0, nan);
            if is_tan {
                self.fpu.push();
                self.fpu_store(0, nan);
            }
            return Ok(());
        }
        if v.is_infinite() {
            if self.fpu_raise(FPU_STATUS_IE) {
                return Ok(());
            }
            self.fpu.set_condition(FPU_STATUS_C2, false);
            self.fpu_store(0, F80::INDEFINITE);
            if is_tan {
                self.fpu.push();
                self.fpu_store(0, F80::INDEFINITE);
            }
            return Ok(());
        }
        if v.exp >= TRIG_EXP_LIMIT {
            self.fpu.set_condition(FPU_STATUS_C2, true);
            return Ok(());
        }
        self.fpu.set_condition(FPU_STATUS_C2, false);
        if self.fpu_check_denormal(&v) {
            return Ok(());
        }
        let x = v.to_f64();
        let (res, flags) = match kind {
            0xFE => Self::fpu_host_result(x.sin(), v.is_zero()),
            0xFF => Self::fpu_host_result(x.cos(), v.is_zero()),
            _ => Self::fpu_host_result(x.tan(), v.is_zero()),
        };
        // sin(-0) and tan(-0) keep the sign of zero
        let res = if v.is_zero() && kind != 0xFF { v } else { res };
        self.fpu_store(0, res);
        if self.fpu_post(flags) {
            return Ok(());
        }
        if is_tan {
            self.fpu.push();
            self.fpu_store(0, F80::ONE);
        }
        Ok(())
    }

    /// FYL2X (D9 F1): ST(1) = ST(1) * log2(ST(0)), pop.
    pub(crate) fn fyl2x(&mut self) -> Result<()> {
        self.fpu_guard()?;
        if self.fpu_stack_underflow(0) || self.fpu_stack_underflow(1) {
            return Ok(());
        }
        let x = self.fpu_value(0);
        let y = self.fpu_value(1);
        let (res, flags) = if let Some(nan) = Self::fpu_nan_result(&x, &y) {
            nan
        } else if x.sign && !x.is_zero() {
            (F80::INDEFINITE, FPU_STATUS_IE)
        } else if x.is_zero() {
            if y.is_zero() {
                (F80::INDEFINITE, FPU_STATUS_IE)
            } else {
                if self.fpu_raise(FPU_STATUS_ZE) {
                    return Ok(());
                }
                (F80::infinity(!y.sign), 0)
            }
        } else {
            let exact = x.compare(&F80::ONE) == Relation::Equal || y.is_zero();
            Self::fpu_host_result(y.to_f64() * x.to_f64().log2(), exact)
        };
        if flags & FPU_STATUS_IE != 0 && self.fpu_raise(FPU_STATUS_IE) {
            return Ok(());
        }
        self.fpu_store(1, res);
        if self.fpu_post(flags & !FPU_STATUS_IE) {
            return Ok(());
        }
        self.fpu.pop();
        Ok(())
    }

    /// FPATAN (D9 F3): ST(1) = atan(ST(1) / ST(0)), pop.
    pub(crate) fn fpatan(&mut self) -> Result<()> {
        self.fpu_guard()?;
        if self.fpu_stack_underflow(0) || self.fpu_stack_underflow(1) {
            return Ok(());
        }
        let x = self.fpu_value(0);
        let y = self.fpu_value(1);
        let (res, flags) = if let Some(nan) = Self::fpu_nan_result(&x, &y) {
            nan
        } else {
            let exact = y.is_zero() && !x.sign;
            Self::fpu_host_result(y.to_f64().atan2(x.to_f64()), exact)
        };
        if flags & FPU_STATUS_IE != 0 && self.fpu_raise(FPU_STATUS_IE) {
            return Ok(());
        }
        self.fpu_store(1, res);
        if self.fpu_post(flags & !FPU_STATUS_IE) {
            return Ok(());
        }
        self.fpu.pop();
        Ok(())
    }
}
