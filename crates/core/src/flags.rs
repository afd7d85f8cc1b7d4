//! EFLAGS bits and the width-generic flag formulas.
//!
//! Every formula works on values already truncated to the operand width and
//! widened to `u32`; the `Operand` type parameter only supplies the mask and
//! the most-significant bit.

pub const FLAG_CF: u32 = 0x0000_0001; // Carry
pub const FLAG_RESERVED: u32 = 0x0000_0002; // Always 1
pub const FLAG_PF: u32 = 0x0000_0004; // Parity
pub const FLAG_AF: u32 = 0x0000_0010; // Auxiliary carry
pub const FLAG_ZF: u32 = 0x0000_0040; // Zero
pub const FLAG_SF: u32 = 0x0000_0080; // Sign
pub const FLAG_TF: u32 = 0x0000_0100; // Trap
pub const FLAG_IF: u32 = 0x0000_0200; // Interrupt enable
pub const FLAG_DF: u32 = 0x0000_0400; // Direction
pub const FLAG_OF: u32 = 0x0000_0800; // Overflow
pub const FLAG_IOPL: u32 = 0x0000_3000; // I/O privilege level
pub const FLAG_NT: u32 = 0x0000_4000; // Nested task
pub const FLAG_RF: u32 = 0x0001_0000; // Resume
pub const FLAG_VM: u32 = 0x0002_0000; // Virtual-8086 mode
pub const FLAG_AC: u32 = 0x0004_0000; // Alignment check

pub const ARITH_FLAGS: u32 = FLAG_CF | FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF | FLAG_OF;

/// Even parity of each byte value (true = PF set).
pub static PARITY: [bool; 256] = {
    let mut table = [false; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = (i as u8).count_ones() % 2 == 0;
        i += 1;
    }
    table
};

/// An 8, 16 or 32-bit operand width.
pub trait Operand: Copy + Eq + std::fmt::Debug + 'static {
    const BITS: u32;
    const BYTES: u32 = Self::BITS / 8;
    const MASK: u32;
    const MSB: u32 = 1 << (Self::BITS - 1);

    fn truncate(value: u32) -> u32 {
        value & Self::MASK
    }

    /// Sign-extend a value of this width to 32 bits.
    fn sign_extend(value: u32) -> u32 {
        let shift = 32 - Self::BITS;
        (((value << shift) as i32) >> shift) as u32
    }

    fn is_negative(value: u32) -> bool {
        value & Self::MSB != 0
    }
}

impl Operand for u8 {
    const BITS: u32 = 8;
    const MASK: u32 = 0xFF;
}

impl Operand for u16 {
    const BITS: u32 = 16;
    const MASK: u32 = 0xFFFF;
}

impl Operand for u32 {
    const BITS: u32 = 32;
    const MASK: u32 = 0xFFFF_FFFF;
}

#[inline]
fn assign(eflags: &mut u32, flag: u32, set: bool) {
    if set {
        *eflags |= flag;
    } else {
        *eflags &= !flag;
    }
}

/// SF, ZF and PF from a result.
#[inline]
pub fn set_szp<W: Operand>(eflags: &mut u32, res: u32) {
    let res = W::truncate(res);
    assign(eflags, FLAG_SF, res & W::MSB != 0);
    assign(eflags, FLAG_ZF, res == 0);
    assign(eflags, FLAG_PF, PARITY[(res & 0xFF) as usize]);
}

/// Flags after `res = op1 - op2` (CMP, SUB, NEG) or the borrow-adjusted SBB sum.
///
/// CF and AF come out of the inverted-operand identities, so the same
/// formula serves SBB computed as `op1 + !op2 + !CF`.
#[inline]
pub fn sub_flags<W: Operand>(eflags: &mut u32, op1: u32, op2: u32, res: u32) {
    let msb = W::MSB;
    assign(eflags, FLAG_OF, ((op1 ^ op2) & (op1 ^ res)) & msb != 0);
    assign(eflags, FLAG_AF, ((op1 ^ !op2) ^ res) & 0x10 == 0);
    assign(
        eflags,
        FLAG_CF,
        ((op1 & !op2) | ((op1 | !op2) & !res)) & msb == 0,
    );
    set_szp::<W>(eflags, res);
}

/// Flags after DEC: the subtract formula with `op2 = 1`, CF untouched.
#[inline]
pub fn dec_flags<W: Operand>(eflags: &mut u32, op1: u32, res: u32) {
    let cf = *eflags & FLAG_CF;
    sub_flags::<W>(eflags, op1, 1, res);
    *eflags = (*eflags & !FLAG_CF) | cf;
}

/// Flags after `res = op1 + op2 (+ carry_in)`.
#[inline]
pub fn add_flags<W: Operand>(eflags: &mut u32, op1: u32, op2: u32, carry_in: u32, res: u32) {
    let msb = W::MSB;
    let wide = op1 as u64 + op2 as u64 + carry_in as u64;
    assign(eflags, FLAG_OF, ((op1 ^ res) & (op2 ^ res)) & msb != 0);
    assign(eflags, FLAG_AF, (op1 ^ op2 ^ res) & 0x10 != 0);
    assign(eflags, FLAG_CF, wide > W::MASK as u64);
    set_szp::<W>(eflags, res);
}

/// Flags after INC: the add formula with `op2 = 1`, CF untouched.
#[inline]
pub fn inc_flags<W: Operand>(eflags: &mut u32, op1: u32, res: u32) {
    let cf = *eflags & FLAG_CF;
    add_flags::<W>(eflags, op1, 1, 0, res);
    *eflags = (*eflags & !FLAG_CF) | cf;
}

/// Flags after AND/OR/XOR/TEST: OF and CF cleared, AF untouched.
#[inline]
pub fn logic_flags<W: Operand>(eflags: &mut u32, res: u32) {
    *eflags &= !(FLAG_OF | FLAG_CF);
    set_szp::<W>(eflags, res);
}

#[inline]
pub fn set_flag(eflags: &mut u32, flag: u32, set: bool) {
    assign(eflags, flag, set);
}
