//! Software 80-bit extended-precision floating point.
//!
//! Values are stored exactly as the x87 keeps them in its register file: a
//! sign, a 15-bit biased exponent and a 64-bit significand with an explicit
//! integer bit. Arithmetic is exact up to a single final rounding, and every
//! operation reports the IEEE exceptions it raised as x87 status-word bits.

use serde::{Deserialize, Serialize};

use super::{FPU_STATUS_IE, FPU_STATUS_OE, FPU_STATUS_PE, FPU_STATUS_UE, FPU_STATUS_ZE};

const BIAS: i32 = 16383;
const EXP_MAX: u16 = 0x7FFF;
const INT_BIT: u64 = 1 << 63;
const QUIET_BIT: u64 = 1 << 62;
/// Unbiased exponent of the smallest normal.
const EMIN: i32 = 1 - BIAS;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct F80 {
    pub sign: bool,
    pub exp: u16,
    pub mant: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Zero,
    Normal,
    Denormal,
    Infinity,
    QuietNan,
    SignalingNan,
    /// Pseudo-NaNs, pseudo-infinities and unnormals.
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Nearest,
    Down,
    Up,
    Zero,
}

impl Rounding {
    /// Decode the RC field of an x87 control word.
    pub fn from_control(control: u16) -> Self {
        match (control >> 10) & 3 {
            0 => Rounding::Nearest,
            1 => Rounding::Down,
            2 => Rounding::Up,
            _ => Rounding::Zero,
        }
    }
}

/// Destination format of a rounding step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Extended,
    Double,
    Single,
}

impl Format {
    fn precision(self) -> u32 {
        match self {
            Format::Extended => 64,
            Format::Double => 53,
            Format::Single => 24,
        }
    }

    fn emin(self) -> i32 {
        match self {
            Format::Extended => EMIN,
            Format::Double => -1022,
            Format::Single => -126,
        }
    }

    fn emax(self) -> i32 {
        match self {
            Format::Extended => BIAS,
            Format::Double => 1023,
            Format::Single => 127,
        }
    }
}

/// Ordering of two values, including the unordered case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Less,
    Equal,
    Greater,
    Unordered,
}

/// Outcome of one FPREM step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Remainder {
    pub value: F80,
    /// Low bits of the integer quotient (meaningful when `complete`).
    pub quotient: u64,
    /// False when only a partial reduction was done.
    pub complete: bool,
    pub exceptions: u16,
}

/// Drop the low `shift` bits of `sig`, rounding per `rc`. Returns the kept
/// bits (possibly incremented) and whether anything nonzero was dropped.
fn shift_round(sign: bool, sig: u128, shift: u32, rc: Rounding) -> (u128, bool) {
    if shift == 0 {
        return (sig, false);
    }
    let (kept, half, sticky) = if shift > 128 {
        (0, false, sig != 0)
    } else if shift == 128 {
        (0, sig >> 127 != 0, sig << 1 != 0)
    } else {
        let rem = sig & ((1u128 << shift) - 1);
        let half_bit = 1u128 << (shift - 1);
        (sig >> shift, rem & half_bit != 0, rem & (half_bit - 1) != 0)
    };
    let inexact = half || sticky;
    let round_up = match rc {
        Rounding::Nearest => half && (sticky || kept & 1 != 0),
        Rounding::Zero => false,
        Rounding::Up => !sign && inexact,
        Rounding::Down => sign && inexact,
    };
    (kept + round_up as u128, inexact)
}

/// Round `sig * 2^scale` to `fmt` and return it as an (exact) F80 together
/// with the PE/UE/OE bits raised.
///
/// Underflow is reported when the exact result is tiny and the rounding
/// was inexact.
pub(crate) fn round_pack(sign: bool, sig: u128, scale: i32, fmt: Format, rc: Rounding) -> (F80, u16) {
    if sig == 0 {
        return (F80::zero(sign), 0);
    }
    let lz = sig.leading_zeros();
    let sig = sig << lz;
    let scale = scale - lz as i32;
    let e = scale + 127;
    let p = fmt.precision();
    let tiny = e < fmt.emin();
    let mut shift = 128 - p;
    if tiny {
        shift += (fmt.emin() - e).min(200) as u32;
    }
    let (kept, inexact) = shift_round(sign, sig, shift, rc);
    let mut flags = 0;
    if inexact {
        flags |= FPU_STATUS_PE;
        if tiny {
            flags |= FPU_STATUS_UE;
        }
    }
    if kept == 0 {
        return (F80::zero(sign), flags);
    }
    let lsb_scale = scale + shift as i32;
    let top = 127 - kept.leading_zeros() as i32;
    if lsb_scale + top > fmt.emax() {
        flags |= FPU_STATUS_OE | FPU_STATUS_PE;
        let to_infinity = match rc {
            Rounding::Nearest => true,
            Rounding::Zero => false,
            Rounding::Up => !sign,
            Rounding::Down => sign,
        };
        let value = if to_infinity {
            F80::infinity(sign)
        } else {
            F80::from_exact(sign, (1u128 << p) - 1, fmt.emax() - p as i32 + 1)
        };
        return (value, flags);
    }
    (F80::from_exact(sign, kept, lsb_scale), flags)
}

impl F80 {
    pub const ZERO: F80 = F80 { sign: false, exp: 0, mant: 0 };
    pub const ONE: F80 = F80 { sign: false, exp: 0x3FFF, mant: INT_BIT };
    pub const LOG2_E: F80 = F80 { sign: false, exp: 0x3FFF, mant: 0xB8AA_3B29_5C17_F0BC };
    pub const LN_2: F80 = F80 { sign: false, exp: 0x3FFE, mant: 0xB172_17F7_D1CF_79AC };
    /// The QNaN the x87 produces for masked invalid operations.
    pub const INDEFINITE: F80 = F80 { sign: true, exp: EXP_MAX, mant: 0xC000_0000_0000_0000 };

    pub fn zero(sign: bool) -> Self {
        F80 { sign, exp: 0, mant: 0 }
    }

    pub fn infinity(sign: bool) -> Self {
        F80 { sign, exp: EXP_MAX, mant: INT_BIT }
    }

    pub fn from_bytes(bytes: &[u8; 10]) -> Self {
        let mut mant = [0u8; 8];
        mant.copy_from_slice(&bytes[..8]);
        let se = u16::from_le_bytes([bytes[8], bytes[9]]);
        F80 {
            sign: se & 0x8000 != 0,
            exp: se & EXP_MAX,
            mant: u64::from_le_bytes(mant),
        }
    }

    pub fn to_bytes(&self) -> [u8; 10] {
        let mut out = [0u8; 10];
        out[..8].copy_from_slice(&self.mant.to_le_bytes());
        let se = self.exp | if self.sign { 0x8000 } else { 0 };
        out[8..].copy_from_slice(&se.to_le_bytes());
        out
    }

    pub fn classify(&self) -> Class {
        if self.exp == EXP_MAX {
            if self.mant & INT_BIT == 0 {
                Class::Unsupported
            } else if self.mant << 1 == 0 {
                Class::Infinity
            } else if self.mant & QUIET_BIT != 0 {
                Class::QuietNan
            } else {
                Class::SignalingNan
            }
        } else if self.exp == 0 {
            if self.mant == 0 {
                Class::Zero
            } else {
                Class::Denormal
            }
        } else if self.mant & INT_BIT == 0 {
            Class::Unsupported
        } else {
            Class::Normal
        }
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.exp == 0 && self.mant == 0
    }

    #[inline]
    pub fn is_infinite(&self) -> bool {
        self.classify() == Class::Infinity
    }

    #[inline]
    pub fn is_denormal(&self) -> bool {
        self.classify() == Class::Denormal
    }

    /// Any NaN, or an encoding the x87 treats like one.
    #[inline]
    pub fn is_nan(&self) -> bool {
        matches!(
            self.classify(),
            Class::QuietNan | Class::SignalingNan | Class::Unsupported
        )
    }

    /// Operands that raise IE just by being used.
    #[inline]
    pub fn is_signaling(&self) -> bool {
        matches!(self.classify(), Class::SignalingNan | Class::Unsupported)
    }

    /// Tag class "special": NaN, infinity or denormal.
    #[inline]
    pub fn is_special(&self) -> bool {
        !matches!(self.classify(), Class::Zero | Class::Normal)
    }

    pub fn neg(self) -> Self {
        F80 { sign: !self.sign, ..self }
    }

    pub fn abs(self) -> Self {
        F80 { sign: false, ..self }
    }

    pub fn quiet(self) -> Self {
        if self.classify() == Class::Unsupported {
            return F80::INDEFINITE;
        }
        F80 { mant: self.mant | QUIET_BIT, ..self }
    }

    /// Unbiased exponent and significand of a finite value.
    fn unpack(&self) -> (i32, u64) {
        let e = if self.exp == 0 { EMIN } else { self.exp as i32 - BIAS };
        (e, self.mant)
    }

    /// Like `unpack` but with the significand shifted so bit 63 is set.
    fn unpack_normalized(&self) -> (i32, u64) {
        let (e, m) = self.unpack();
        let lz = m.leading_zeros();
        (e - lz as i32, m << lz)
    }

    /// Build the F80 equal to `sig * 2^scale`, which must be representable.
    fn from_exact(sign: bool, sig: u128, scale: i32) -> Self {
        if sig == 0 {
            return F80::zero(sign);
        }
        let top = 127 - sig.leading_zeros() as i32;
        let e = scale + top;
        if e >= EMIN {
            let mant = if top >= 63 {
                (sig >> (top - 63)) as u64
            } else {
                (sig << (63 - top)) as u64
            };
            F80 { sign, exp: (e + BIAS) as u16, mant }
        } else {
            let shift = scale - (EMIN - 63);
            let mant = if shift >= 0 {
                (sig << shift) as u64
            } else {
                (sig >> -shift) as u64
            };
            F80 { sign, exp: 0, mant }
        }
    }

    fn propagate_nan(a: F80, b: F80) -> Option<(F80, u16)> {
        if !a.is_nan() && !b.is_nan() {
            return None;
        }
        let flags = if a.is_signaling() || b.is_signaling() {
            FPU_STATUS_IE
        } else {
            0
        };
        let pick = match (a.is_nan(), b.is_nan()) {
            (true, true) => {
                if (a.mant << 1) >= (b.mant << 1) {
                    a
                } else {
                    b
                }
            }
            (true, false) => a,
            _ => b,
        };
        Some((pick.quiet(), flags))
    }

    pub fn from_i64(value: i64) -> Self {
        F80::from_exact(value < 0, value.unsigned_abs() as u128, 0)
    }

    pub fn from_f64_bits(bits: u64) -> Self {
        let sign = bits >> 63 != 0;
        let exp = ((bits >> 52) & 0x7FF) as i32;
        let frac = bits & ((1 << 52) - 1);
        match exp {
            0x7FF if frac == 0 => F80::infinity(sign),
            0x7FF => F80 { sign, exp: EXP_MAX, mant: INT_BIT | (frac << 11) },
            0 => F80::from_exact(sign, frac as u128, -1074),
            _ => F80 {
                sign,
                exp: (exp - 1023 + BIAS) as u16,
                mant: INT_BIT | (frac << 11),
            },
        }
    }

    pub fn from_f32_bits(bits: u32) -> Self {
        let sign = bits >> 31 != 0;
        let exp = ((bits >> 23) & 0xFF) as i32;
        let frac = (bits & 0x7F_FFFF) as u64;
        match exp {
            0xFF if frac == 0 => F80::infinity(sign),
            0xFF => F80 { sign, exp: EXP_MAX, mant: INT_BIT | (frac << 40) },
            0 => F80::from_exact(sign, frac as u128, -149),
            _ => F80 {
                sign,
                exp: (exp - 127 + BIAS) as u16,
                mant: INT_BIT | (frac << 40),
            },
        }
    }

    pub fn from_f64(value: f64) -> Self {
        F80::from_f64_bits(value.to_bits())
    }

    /// Nearest f64, for evaluating transcendental functions on the host.
    pub fn to_f64(&self) -> f64 {
        f64::from_bits(self.to_ieee_bits(Format::Double, Rounding::Nearest).0)
    }

    pub fn to_f64_bits(&self, rc: Rounding) -> (u64, u16) {
        self.to_ieee_bits(Format::Double, rc)
    }

    pub fn to_f32_bits(&self, rc: Rounding) -> (u32, u16) {
        let (bits, flags) = self.to_ieee_bits(Format::Single, rc);
        (bits as u32, flags)
    }

    fn to_ieee_bits(&self, fmt: Format, rc: Rounding) -> (u64, u16) {
        let (frac_bits, exp_bits) = match fmt {
            Format::Single => (23u32, 8u32),
            _ => (52, 11),
        };
        let exp_all = (1u64 << exp_bits) - 1;
        let frac_mask = (1u64 << frac_bits) - 1;
        let sign_bit = (self.sign as u64) << (frac_bits + exp_bits);
        let quiet = 1u64 << (frac_bits - 1);
        let nan_payload = (self.mant >> (63 - frac_bits)) & frac_mask;
        match self.classify() {
            Class::Zero => (sign_bit, 0),
            Class::Infinity => (sign_bit | (exp_all << frac_bits), 0),
            Class::QuietNan => (sign_bit | (exp_all << frac_bits) | nan_payload | quiet, 0),
            Class::SignalingNan => (
                sign_bit | (exp_all << frac_bits) | nan_payload | quiet,
                FPU_STATUS_IE,
            ),
            Class::Unsupported => {
                let indefinite = (1u64 << (frac_bits + exp_bits)) | (exp_all << frac_bits) | quiet;
                (indefinite, FPU_STATUS_IE)
            }
            Class::Normal | Class::Denormal => {
                let (e, m) = self.unpack();
                let (r, flags) = round_pack(self.sign, m as u128, e - 63, fmt, rc);
                if r.is_zero() {
                    return (sign_bit, flags);
                }
                if r.is_infinite() {
                    return (sign_bit | (exp_all << frac_bits), flags);
                }
                let (re, rm) = r.unpack_normalized();
                let emin = fmt.emin();
                let bits = if re >= emin {
                    let biased = (re - emin + 1) as u64;
                    (biased << frac_bits) | ((rm >> (63 - frac_bits)) & frac_mask)
                } else {
                    rm >> (63 - frac_bits + (emin - re) as u32)
                };
                (sign_bit | bits, flags)
            }
        }
    }

    pub fn add(self, other: F80, rc: Rounding) -> (F80, u16) {
        F80::add_signed(self, other, false, rc)
    }

    pub fn sub(self, other: F80, rc: Rounding) -> (F80, u16) {
        F80::add_signed(self, other, true, rc)
    }

    fn add_signed(a: F80, b: F80, negate_b: bool, rc: Rounding) -> (F80, u16) {
        if let Some(nan) = F80::propagate_nan(a, b) {
            return nan;
        }
        let b_sign = b.sign ^ negate_b;
        match (a.is_infinite(), b.is_infinite()) {
            (true, true) if a.sign != b_sign => return (F80::INDEFINITE, FPU_STATUS_IE),
            (true, _) => return (a, 0),
            (false, true) => return (F80::infinity(b_sign), 0),
            _ => {}
        }
        let exact_zero_sign = rc == Rounding::Down;
        match (a.is_zero(), b.is_zero()) {
            (true, true) => {
                let sign = if a.sign == b_sign { a.sign } else { exact_zero_sign };
                return (F80::zero(sign), 0);
            }
            (true, false) => return (F80 { sign: b_sign, ..b }, 0),
            (false, true) => return (a, 0),
            _ => {}
        }

        let (ea, ma) = a.unpack();
        let (eb, mb) = b.unpack();
        let ((s_big, e_big, m_big), (s_small, e_small, m_small)) = if ea >= eb {
            ((a.sign, ea, ma), (b_sign, eb, mb))
        } else {
            ((b_sign, eb, mb), (a.sign, ea, ma))
        };
        // 62 guard bits below each significand; anything shifted further
        // collapses into a sticky bit.
        let big = (m_big as u128) << 62;
        let small_full = (m_small as u128) << 62;
        let d = (e_big - e_small) as u32;
        let small = if d == 0 {
            small_full
        } else if d >= 127 {
            (small_full != 0) as u128
        } else {
            let s = small_full >> d;
            s | ((s << d != small_full) as u128)
        };
        let scale = e_big - 125;
        if s_big == s_small {
            round_pack(s_big, big + small, scale, Format::Extended, rc)
        } else if big > small {
            round_pack(s_big, big - small, scale, Format::Extended, rc)
        } else if big < small {
            round_pack(s_small, small - big, scale, Format::Extended, rc)
        } else {
            (F80::zero(exact_zero_sign), 0)
        }
    }

    pub fn mul(self, other: F80, rc: Rounding) -> (F80, u16) {
        if let Some(nan) = F80::propagate_nan(self, other) {
            return nan;
        }
        let sign = self.sign ^ other.sign;
        if self.is_infinite() || other.is_infinite() {
            if self.is_zero() || other.is_zero() {
                return (F80::INDEFINITE, FPU_STATUS_IE);
            }
            return (F80::infinity(sign), 0);
        }
        if self.is_zero() || other.is_zero() {
            return (F80::zero(sign), 0);
        }
        let (ea, ma) = self.unpack();
        let (eb, mb) = other.unpack();
        let product = ma as u128 * mb as u128;
        round_pack(sign, product, ea + eb - 126, Format::Extended, rc)
    }

    pub fn div(self, other: F80, rc: Rounding) -> (F80, u16) {
        if let Some(nan) = F80::propagate_nan(self, other) {
            return nan;
        }
        let sign = self.sign ^ other.sign;
        match (self.is_infinite(), other.is_infinite()) {
            (true, true) => return (F80::INDEFINITE, FPU_STATUS_IE),
            (true, false) => return (F80::infinity(sign), 0),
            (false, true) => return (F80::zero(sign), 0),
            _ => {}
        }
        if other.is_zero() {
            if self.is_zero() {
                return (F80::INDEFINITE, FPU_STATUS_IE);
            }
            return (F80::infinity(sign), FPU_STATUS_ZE);
        }
        if self.is_zero() {
            return (F80::zero(sign), 0);
        }
        let (ea, ma) = self.unpack_normalized();
        let (eb, mb) = other.unpack_normalized();
        let divisor = mb as u128;
        let dividend = (ma as u128) << 64;
        let q = dividend / divisor;
        let r = dividend % divisor;
        let q2 = (q << 8) | ((r << 8) / divisor);
        let r2 = (r << 8) % divisor;
        let sig = q2 | (r2 != 0) as u128;
        round_pack(sign, sig, ea - eb - 72, Format::Extended, rc)
    }

    pub fn sqrt(self, rc: Rounding) -> (F80, u16) {
        if self.is_nan() {
            let flags = if self.is_signaling() { FPU_STATUS_IE } else { 0 };
            return (self.quiet(), flags);
        }
        if self.is_zero() {
            return (self, 0);
        }
        if self.sign {
            return (F80::INDEFINITE, FPU_STATUS_IE);
        }
        if self.is_infinite() {
            return (self, 0);
        }
        let (e, m) = self.unpack_normalized();
        let mut t = e - 63;
        let mut radicand = m as u128;
        if t & 1 != 0 {
            radicand <<= 1;
            t -= 1;
        }
        let mut root: u128 = 0;
        let mut rem: u128 = 0;
        // 33 bit pairs of radicand followed by 34 zero pairs
        for i in (0..67).rev() {
            let pair = if i >= 34 { (radicand >> (2 * (i - 34))) & 3 } else { 0 };
            rem = (rem << 2) | pair;
            let trial = (root << 2) | 1;
            if rem >= trial {
                rem -= trial;
                root = (root << 1) | 1;
            } else {
                root <<= 1;
            }
        }
        let sig = root | (rem != 0) as u128;
        round_pack(false, sig, t / 2 - 34, Format::Extended, rc)
    }

    pub fn compare(&self, other: &F80) -> Relation {
        if self.is_nan() || other.is_nan() {
            return Relation::Unordered;
        }
        if self.is_zero() && other.is_zero() {
            return Relation::Equal;
        }
        let neg_a = self.sign && !self.is_zero();
        let neg_b = other.sign && !other.is_zero();
        if neg_a != neg_b {
            return if neg_a { Relation::Less } else { Relation::Greater };
        }
        let key = |v: &F80| if v.is_zero() { 0 } else { ((v.exp as u128) << 64) | v.mant as u128 };
        let mut ord = key(self).cmp(&key(other));
        if neg_a {
            ord = ord.reverse();
        }
        match ord {
            std::cmp::Ordering::Less => Relation::Less,
            std::cmp::Ordering::Equal => Relation::Equal,
            std::cmp::Ordering::Greater => Relation::Greater,
        }
    }

    /// Round to an integral value. Returns the result and whether it was inexact.
    pub fn round_to_int(self, rc: Rounding) -> (F80, bool) {
        if !matches!(self.classify(), Class::Normal | Class::Denormal) {
            return (self, false);
        }
        let (e, m) = self.unpack();
        if e >= 63 {
            return (self, false);
        }
        let shift = (63 - e).min(200) as u32;
        let (kept, inexact) = shift_round(self.sign, m as u128, shift, rc);
        (F80::from_exact(self.sign, kept, 0), inexact)
    }

    /// Integer value under `rc`, or `None` for NaN, infinity or a magnitude
    /// beyond 2^64. The flag reports inexactness.
    pub fn to_int(self, rc: Rounding) -> (Option<i128>, bool) {
        match self.classify() {
            Class::Zero => return (Some(0), false),
            Class::Normal | Class::Denormal => {}
            _ => return (None, false),
        }
        let (rounded, inexact) = self.round_to_int(rc);
        if rounded.is_zero() {
            return (Some(0), inexact);
        }
        let (e, m) = rounded.unpack();
        if e > 63 {
            return (None, inexact);
        }
        let magnitude = (m >> (63 - e)) as i128;
        (Some(if rounded.sign { -magnitude } else { magnitude }), inexact)
    }

    /// `self * 2^n`, rounded.
    pub fn scale(self, n: i32, rc: Rounding) -> (F80, u16) {
        if !matches!(self.classify(), Class::Normal | Class::Denormal) {
            return (self, 0);
        }
        let (e, m) = self.unpack();
        let n = n.clamp(-70000, 70000);
        round_pack(self.sign, m as u128, e - 63 + n, Format::Extended, rc)
    }

    /// One FPREM step: the remainder of truncating division by `divisor`.
    ///
    /// When the exponents differ by 64 or more only a partial reduction is
    /// done and `complete` is false.
    pub fn partial_remainder(self, divisor: F80) -> Remainder {
        let done = |value: F80, exceptions: u16| Remainder {
            value,
            quotient: 0,
            complete: true,
            exceptions,
        };
        if let Some((nan, flags)) = F80::propagate_nan(self, divisor) {
            return done(nan, flags);
        }
        if self.is_infinite() || divisor.is_zero() {
            return done(F80::INDEFINITE, FPU_STATUS_IE);
        }
        if self.is_zero() || divisor.is_infinite() {
            return done(self, 0);
        }
        let (ea, ma) = self.unpack_normalized();
        let (eb, mb) = divisor.unpack_normalized();
        let d = ea - eb;
        if d < 0 {
            return done(self, 0);
        }
        let mb = mb as u128;
        if d < 64 {
            let dividend = (ma as u128) << d;
            let q = dividend / mb;
            let r = dividend % mb;
            Remainder {
                value: F80::from_exact(self.sign, r, eb - 63),
                quotient: q as u64,
                complete: true,
                exceptions: 0,
            }
        } else {
            let dividend = (ma as u128) << 63;
            let r = dividend % mb;
            Remainder {
                value: F80::from_exact(self.sign, r, ea - 126),
                quotient: 0,
                complete: false,
                exceptions: 0,
            }
        }
    }
}
