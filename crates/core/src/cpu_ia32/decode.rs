//! Opcode dispatch for the one-byte map and the 0F map.
//!
//! Opcodes outside the implemented subset report `Fault::Unimplemented`
//! with the opcode in the message, so a host can tell them apart from a
//! guest #UD.

use super::alu::AluOp;
use super::bits::BitOp;
use super::shifts::ShiftCount;
use super::{CpuIa32, MemoryIa32};
use crate::fault::{Fault, Result};

/// Call a width-generic handler at the current operand size.
macro_rules! sized {
    ($cpu:ident . $method:ident ( $($arg:expr),* )) => {
        if $cpu.operand32() {
            $cpu.$method::<u32>($($arg),*)
        } else {
            $cpu.$method::<u16>($($arg),*)
        }
    };
}

impl<M: MemoryIa32> CpuIa32<M> {
    pub(crate) fn execute_opcode(&mut self, opcode: u8) -> Result<()> {
        match opcode {
            // ADD/OR/ADC/SBB/AND/SUB/XOR/CMP in their six forms
            0x00..=0x3F if opcode & 7 < 6 => {
                let op = AluOp::from_bits(opcode >> 3);
                match opcode & 7 {
                    0 => self.alu_rm_r::<u8>(op),
                    1 => sized!(self.alu_rm_r(op)),
                    2 => self.alu_r_rm::<u8>(op),
                    3 => sized!(self.alu_r_rm(op)),
                    4 => self.alu_acc_imm::<u8>(op),
                    _ => sized!(self.alu_acc_imm(op)),
                }
            }
            0x0F => self.execute_0f(),

            0x40..=0x47 => sized!(self.inc_reg(opcode & 7)),
            0x48..=0x4F => sized!(self.dec_reg(opcode & 7)),

            0x50..=0x57 => sized!(self.push_reg(opcode & 7)),
            0x58..=0x5F => sized!(self.pop_reg(opcode & 7)),
            0x60 => sized!(self.pusha()),
            0x61 => sized!(self.popa()),
            0x68 => sized!(self.push_imm(false)),
            0x69 => sized!(self.imul_r_rm_imm(false)),
            0x6A => sized!(self.push_imm(true)),
            0x6B => sized!(self.imul_r_rm_imm(true)),
            0x6C => self.ins::<u8>(),
            0x6D => sized!(self.ins()),
            0x6E => self.outs::<u8>(),
            0x6F => sized!(self.outs()),

            0x70..=0x7F => self.jcc_rel8(opcode & 0x0F),

            0x80 | 0x82 => self.alu_rm_imm::<u8>(false),
            0x81 => sized!(self.alu_rm_imm(false)),
            0x83 => sized!(self.alu_rm_imm(true)),
            0x84 => self.test_rm_r::<u8>(),
            0x85 => sized!(self.test_rm_r()),

            0x8F => sized!(self.pop_rm()),

            0x9A => sized!(self.call_far_imm()),
            0x9B => self.fwait(),

            0xA6 => self.cmps::<u8>(),
            0xA7 => sized!(self.cmps()),
            0xA8 => self.test_acc_imm::<u8>(),
            0xA9 => sized!(self.test_acc_imm()),
            0xAE => self.scas::<u8>(),
            0xAF => sized!(self.scas()),

            0xC0 => self.group2::<u8>(ShiftCount::Imm8),
            0xC1 => sized!(self.group2(ShiftCount::Imm8)),
            0xC2 => self.ret_near_imm16(),
            0xC3 => self.ret_near(),
            0xCA => self.ret_far_imm16(),
            0xCB => self.ret_far(),

            0xD0 => self.group2::<u8>(ShiftCount::One),
            0xD1 => sized!(self.group2(ShiftCount::One)),
            0xD2 => self.group2::<u8>(ShiftCount::Cl),
            0xD3 => sized!(self.group2(ShiftCount::Cl)),
            0xD8..=0xDF => self.fpu_escape(opcode),

            0xE0..=0xE2 => self.loop_rel8(opcode),
            0xE3 => self.jcxz_rel8(),
            0xE4 => self.in_imm::<u8>(),
            0xE5 => sized!(self.in_imm()),
            0xE6 => self.out_imm::<u8>(),
            0xE7 => sized!(self.out_imm()),
            0xE8 => sized!(self.call_rel()),
            0xE9 => sized!(self.jmp_rel()),
            0xEA => sized!(self.jmp_far_imm()),
            0xEB => self.jmp_rel8(),
            0xEC => self.in_dx::<u8>(),
            0xED => sized!(self.in_dx()),
            0xEE => self.out_dx::<u8>(),
            0xEF => sized!(self.out_dx()),

            0xF5 | 0xF8 | 0xF9 | 0xFC | 0xFD => self.flag_op(opcode),
            0xF6 => self.group3::<u8>(),
            0xF7 => sized!(self.group3()),
            0xFE => self.group4(),
            0xFF => sized!(self.group5()),

            _ => Err(Fault::Unimplemented(one_byte_name(opcode))),
        }
    }

    fn execute_0f(&mut self) -> Result<()> {
        let opcode = self.fetch_u8()?;
        match opcode {
            0x80..=0x8F => sized!(self.jcc_rel(opcode & 0x0F)),
            0x90..=0x9F => self.setcc(opcode & 0x0F),
            0xA3 | 0xAB | 0xB3 | 0xBB => sized!(self.bit_op_rm_r(BitOp::from_bits(opcode >> 3))),
            0xA4 => sized!(self.shld_shrd(true, false)),
            0xA5 => sized!(self.shld_shrd(true, true)),
            0xAC => sized!(self.shld_shrd(false, false)),
            0xAD => sized!(self.shld_shrd(false, true)),
            0xAF => sized!(self.imul_r_rm()),
            0xBA => sized!(self.group8()),
            0xBC => sized!(self.bit_scan(false)),
            0xBD => sized!(self.bit_scan(true)),
            0xC8..=0xCF => self.bswap(opcode & 7),
            _ => Err(Fault::Unimplemented("two-byte opcode outside the supported subset")),
        }
    }
}

/// Diagnostic name for an unsupported one-byte opcode.
fn one_byte_name(opcode: u8) -> &'static str {
    match opcode {
        0x06 | 0x07 | 0x0E | 0x16 | 0x17 | 0x1E | 0x1F => "segment register PUSH/POP",
        0x27 | 0x2F | 0x37 | 0x3F => "decimal adjust",
        0x62 | 0x63 => "BOUND/ARPL",
        0x86..=0x8E => "XCHG/MOV/LEA",
        0x90..=0x99 => "XCHG/NOP/CBW/CWD",
        0x9C..=0x9F => "PUSHF/POPF/SAHF/LAHF",
        0xA0..=0xA5 | 0xAA..=0xAD => "MOV/MOVS/STOS/LODS",
        0xB0..=0xBF => "MOV imm",
        0xC4..=0xC9 => "LES/LDS/MOV imm/ENTER/LEAVE",
        0xCC..=0xCF => "INT/INTO/IRET",
        0xD4..=0xD7 => "AAM/AAD/SALC/XLAT",
        0xF1 => "ICEBP",
        0xF4 => "HLT",
        0xFA | 0xFB => "CLI/STI",
        _ => "one-byte opcode outside the supported subset",
    }
}
