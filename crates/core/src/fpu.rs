//! x87 floating-point unit state
//!
//! The register stack, tag word, control and status words and the
//! instruction/data pointers. Instruction semantics live in the
//! `cpu_ia32` x87 handlers; this module only keeps the bookkeeping they
//! share:
//!
//! - physical/stack register mapping through TOP
//! - tag classification
//! - sticky exception bits and the ES summary
//! - the 108-byte FSAVE image

pub mod f80;

use serde::{Deserialize, Serialize};

pub use f80::{Class, F80, Relation, Rounding};

// Status word
pub const FPU_STATUS_IE: u16 = 0x0001; // Invalid operation
pub const FPU_STATUS_DE: u16 = 0x0002; // Denormal operand
pub const FPU_STATUS_ZE: u16 = 0x0004; // Zero divide
pub const FPU_STATUS_OE: u16 = 0x0008; // Overflow
pub const FPU_STATUS_UE: u16 = 0x0010; // Underflow
pub const FPU_STATUS_PE: u16 = 0x0020; // Precision
pub const FPU_STATUS_SF: u16 = 0x0040; // Stack fault
pub const FPU_STATUS_ES: u16 = 0x0080; // Error summary
pub const FPU_STATUS_C0: u16 = 0x0100;
pub const FPU_STATUS_C1: u16 = 0x0200;
pub const FPU_STATUS_C2: u16 = 0x0400;
pub const FPU_STATUS_TOP: u16 = 0x3800;
pub const FPU_STATUS_C3: u16 = 0x4000;
pub const FPU_STATUS_B: u16 = 0x8000; // Busy

pub const FPU_EXCEPTIONS: u16 = 0x003F;

// Control word
pub const FPU_CONTROL_IM: u16 = 0x0001;
pub const FPU_CONTROL_DM: u16 = 0x0002;
pub const FPU_CONTROL_ZM: u16 = 0x0004;
pub const FPU_CONTROL_OM: u16 = 0x0008;
pub const FPU_CONTROL_UM: u16 = 0x0010;
pub const FPU_CONTROL_PM: u16 = 0x0020;
pub const FPU_CONTROL_PC: u16 = 0x0300;
pub const FPU_CONTROL_RC: u16 = 0x0C00;

pub const FPU_CONTROL_DEFAULT: u16 = 0x037F;

pub const TAG_VALID: u8 = 0;
pub const TAG_ZERO: u8 = 1;
pub const TAG_SPECIAL: u8 = 2;
pub const TAG_EMPTY: u8 = 3;

/// Size of the 32-bit protected-mode FSAVE image.
pub const FSAVE32_SIZE: usize = 108;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fpu {
    /// Physical registers R0..R7.
    pub regs: [F80; 8],
    pub control: u16,
    /// Status word with the TOP field kept separately in `top`.
    pub status: u16,
    pub top: u8,
    /// Packed tag word, two bits per physical register.
    pub tag_word: u16,
    pub ip_offset: u32,
    pub ip_selector: u16,
    pub opcode: u16,
    pub dp_offset: u32,
    pub dp_selector: u16,
}

impl Default for Fpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Fpu {
    pub fn new() -> Self {
        Self {
            regs: [F80::ZERO; 8],
            control: FPU_CONTROL_DEFAULT,
            status: 0,
            top: 0,
            tag_word: 0xFFFF,
            ip_offset: 0,
            ip_selector: 0,
            opcode: 0,
            dp_offset: 0,
            dp_selector: 0,
        }
    }

    /// FINIT state. Register contents are left as they were.
    pub fn init(&mut self) {
        self.control = FPU_CONTROL_DEFAULT;
        self.status = 0;
        self.top = 0;
        self.tag_word = 0xFFFF;
        self.ip_offset = 0;
        self.ip_selector = 0;
        self.opcode = 0;
        self.dp_offset = 0;
        self.dp_selector = 0;
    }

    /// Physical register number of ST(i).
    #[inline]
    pub fn phys(&self, i: u8) -> usize {
        ((self.top + i) & 7) as usize
    }

    #[inline]
    pub fn st(&self, i: u8) -> F80 {
        self.regs[self.phys(i)]
    }

    #[inline]
    pub fn set_st(&mut self, i: u8, value: F80) {
        let p = self.phys(i);
        self.regs[p] = value;
    }

    #[inline]
    pub fn tag_phys(&self, p: usize) -> u8 {
        ((self.tag_word >> (p * 2)) & 3) as u8
    }

    #[inline]
    pub fn set_tag_phys(&mut self, p: usize, tag: u8) {
        self.tag_word = (self.tag_word & !(3 << (p * 2))) | ((tag as u16 & 3) << (p * 2));
    }

    #[inline]
    pub fn tag(&self, i: u8) -> u8 {
        self.tag_phys(self.phys(i))
    }

    #[inline]
    pub fn set_tag(&mut self, i: u8, tag: u8) {
        let p = self.phys(i);
        self.set_tag_phys(p, tag);
    }

    /// Re-derive the tag of ST(i) from its contents.
    pub fn update_tag(&mut self, i: u8) {
        let value = self.st(i);
        let tag = Self::classify_tag(&value);
        self.set_tag(i, tag);
    }

    pub fn classify_tag(value: &F80) -> u8 {
        if value.is_zero() {
            TAG_ZERO
        } else if value.is_special() {
            TAG_SPECIAL
        } else {
            TAG_VALID
        }
    }

    /// Move TOP down one slot (the new ST(0) is the old ST(7)).
    pub fn push(&mut self) {
        self.top = self.top.wrapping_sub(1) & 7;
    }

    /// Mark ST(0) empty and move TOP up one slot.
    pub fn pop(&mut self) {
        self.set_tag(0, TAG_EMPTY);
        self.top = (self.top + 1) & 7;
    }

    pub fn rounding(&self) -> Rounding {
        Rounding::from_control(self.control)
    }

    #[inline]
    pub fn set_condition(&mut self, bits: u16, set: bool) {
        if set {
            self.status |= bits;
        } else {
            self.status &= !bits;
        }
    }

    pub fn clear_conditions(&mut self) {
        self.status &= !(FPU_STATUS_C0 | FPU_STATUS_C1 | FPU_STATUS_C2 | FPU_STATUS_C3);
    }

    /// Status word as FSTSW stores it, TOP folded in.
    pub fn status_word(&self) -> u16 {
        (self.status & !FPU_STATUS_TOP) | ((self.top as u16) << 11)
    }

    /// Load a full status word, TOP included.
    pub fn set_status_word(&mut self, word: u16) {
        self.top = ((word >> 11) & 7) as u8;
        self.status = word & !FPU_STATUS_TOP;
    }

    /// Recompute ES (and B) from the sticky bits and the masks.
    pub fn update_exceptions(&mut self) {
        if self.status & !self.control & FPU_EXCEPTIONS != 0 {
            self.status |= FPU_STATUS_ES | FPU_STATUS_B;
        } else {
            self.status &= !(FPU_STATUS_ES | FPU_STATUS_B);
        }
    }

    /// Record exception bits. Returns true when at least one of them is
    /// unmasked, in which case ES is set and the instruction must stop.
    pub fn raise(&mut self, bits: u16) -> bool {
        self.status |= bits;
        if bits & !self.control & FPU_EXCEPTIONS != 0 {
            self.status |= FPU_STATUS_ES | FPU_STATUS_B;
            true
        } else {
            false
        }
    }

    pub fn is_masked(&self, bit: u16) -> bool {
        self.control & bit != 0
    }

    /// Serialize into the 32-bit protected-mode FSAVE layout. Registers are
    /// written in physical order R0..R7.
    pub fn save_image32(&self) -> [u8; FSAVE32_SIZE] {
        let mut out = [0u8; FSAVE32_SIZE];
        let header = [
            self.control as u32,
            self.status_word() as u32,
            self.tag_word as u32,
            self.ip_offset,
            self.ip_selector as u32 | ((self.opcode as u32 & 0x7FF) << 16),
            self.dp_offset,
            self.dp_selector as u32,
        ];
        for (i, dword) in header.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&dword.to_le_bytes());
        }
        for (p, reg) in self.regs.iter().enumerate() {
            let start = 28 + p * 10;
            out[start..start + 10].copy_from_slice(&reg.to_bytes());
        }
        out
    }

    /// Inverse of `save_image32`.
    pub fn load_image32(&mut self, image: &[u8; FSAVE32_SIZE]) {
        let dword = |i: usize| u32::from_le_bytes([image[i * 4], image[i * 4 + 1], image[i * 4 + 2], image[i * 4 + 3]]);
        self.control = dword(0) as u16;
        self.set_status_word(dword(1) as u16);
        self.tag_word = dword(2) as u16;
        self.ip_offset = dword(3);
        self.ip_selector = dword(4) as u16;
        self.opcode = ((dword(4) >> 16) & 0x7FF) as u16;
        self.dp_offset = dword(5);
        self.dp_selector = dword(6) as u16;
        for (p, reg) in self.regs.iter_mut().enumerate() {
            let start = 28 + p * 10;
            let mut bytes = [0u8; 10];
            bytes.copy_from_slice(&image[start..start + 10]);
            *reg = F80::from_bytes(&bytes);
        }
        self.update_exceptions();
    }
}
