//! Tests for MUL/IMUL/DIV/IDIV

use super::{real_cpu, run};
use crate::fault::Fault;
use crate::flags::{FLAG_CF, FLAG_OF, FLAG_SF};

#[test]
fn test_mul_byte_sets_carry_on_high_half() {
    // MUL BL; MUL BL
    let mut cpu = real_cpu(&[0xF6, 0xE3, 0xF6, 0xE3]);
    cpu.set_reg8(0, 0x80);
    cpu.set_reg8(3, 4);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.reg16(0), 0x0200);
    assert!(cpu.get_flag(FLAG_CF));
    assert!(cpu.get_flag(FLAG_OF));

    cpu.set_reg16(0, 3);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.reg16(0), 12);
    assert!(!cpu.get_flag(FLAG_CF));
    assert!(!cpu.get_flag(FLAG_OF));
}

#[test]
fn test_mul_dword_fills_edx() {
    // MUL ECX
    let mut cpu = real_cpu(&[0x66, 0xF7, 0xE1]);
    cpu.set_reg32(0, 0x8000_0000);
    cpu.set_reg32(1, 4);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.reg32(0), 0);
    assert_eq!(cpu.reg32(2), 2);
    assert!(cpu.get_flag(FLAG_CF));
}

#[test]
fn test_div_by_zero_faults_without_writing() {
    // DIV BL
    let mut cpu = real_cpu(&[0xF6, 0xF3]);
    cpu.set_reg16(0, 0x1234);
    cpu.set_reg8(3, 0);
    assert_eq!(cpu.step(), Err(Fault::DivideError));
    assert_eq!(cpu.eip, 0x1000);
    assert_eq!(cpu.reg16(0), 0x1234);
    assert_eq!(Fault::DivideError.vector(), Some(0));
}

#[test]
fn test_div_quotient_overflow_faults() {
    // DIV BL: 0x1000 / 1 does not fit in AL
    let mut cpu = real_cpu(&[0xF6, 0xF3]);
    cpu.set_reg16(0, 0x1000);
    cpu.set_reg8(3, 1);
    assert_eq!(cpu.step(), Err(Fault::DivideError));
    assert_eq!(cpu.reg16(0), 0x1000);
}

#[test]
fn test_div_word_uses_dx_ax() {
    // DIV CX
    let mut cpu = real_cpu(&[0xF7, 0xF1]);
    cpu.set_reg16(2, 0x0001);
    cpu.set_reg16(0, 0x0005);
    cpu.set_reg16(1, 0x0010);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.reg16(0), 0x1000);
    assert_eq!(cpu.reg16(2), 5);
}

#[test]
fn test_idiv_byte_divides_ax() {
    // IDIV BL; IDIV BL
    let mut cpu = real_cpu(&[0xF6, 0xFB, 0xF6, 0xFB]);
    // -7 / 2 = -3 remainder -1
    cpu.set_reg16(0, 0xFFF9);
    cpu.set_reg8(3, 2);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.reg8(0), 0xFD);
    assert_eq!(cpu.reg8(4), 0xFF);

    // AH is part of the dividend: 254 / 2 = 127
    cpu.set_reg16(0, 0x00FE);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.reg8(0), 127);
    assert_eq!(cpu.reg8(4), 0);
}

#[test]
fn test_idiv_quotient_overflow_faults() {
    // IDIV BL: -32768 / -1
    let mut cpu = real_cpu(&[0xF6, 0xFB]);
    cpu.set_reg16(0, 0x8000);
    cpu.set_reg8(3, 0xFF);
    assert_eq!(cpu.step(), Err(Fault::DivideError));
    assert_eq!(cpu.reg16(0), 0x8000);

    // IDIV ECX with EDX:EAX at the most negative 64-bit value
    let mut cpu = real_cpu(&[0x66, 0xF7, 0xF9]);
    cpu.set_reg32(2, 0x8000_0000);
    cpu.set_reg32(0, 0);
    cpu.set_reg32(1, 0xFFFF_FFFF);
    assert_eq!(cpu.step(), Err(Fault::DivideError));
    assert_eq!(cpu.reg32(2), 0x8000_0000);
}

#[test]
fn test_locked_div_rejected_before_divide() {
    // LOCK DIV BL with a zero divisor
    let mut cpu = real_cpu(&[0xF0, 0xF6, 0xF3]);
    cpu.set_reg8(3, 0);
    assert_eq!(cpu.step(), Err(Fault::InvalidOpcode));
}

#[test]
fn test_imul_one_operand_carry_and_overflow() {
    // IMUL BL; IMUL BL
    let mut cpu = real_cpu(&[0xF6, 0xEB, 0xF6, 0xEB]);
    cpu.set_reg8(0, 0xFE);
    cpu.set_reg8(3, 3);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.reg16(0), 0xFFFA);
    assert!(!cpu.get_flag(FLAG_CF));
    assert!(!cpu.get_flag(FLAG_OF));
    assert!(cpu.get_flag(FLAG_SF));

    // 64 * 2 = 128 does not fit in a signed byte
    cpu.set_reg16(0, 0x0040);
    cpu.set_reg8(3, 2);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.reg16(0), 0x0080);
    assert!(cpu.get_flag(FLAG_CF));
    assert!(cpu.get_flag(FLAG_OF));
}

#[test]
fn test_imul_two_operand_truncates() {
    // IMUL AX, BX
    let mut cpu = real_cpu(&[0x0F, 0xAF, 0xC3]);
    cpu.set_reg16(0, 0x4000);
    cpu.set_reg16(3, 2);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.reg16(0), 0x8000);
    assert!(cpu.get_flag(FLAG_CF));
    assert!(cpu.get_flag(FLAG_OF));
    assert!(cpu.get_flag(FLAG_SF));
}

#[test]
fn test_imul_three_operand_forms() {
    // IMUL CX, BX, -3
    let mut cpu = real_cpu(&[0x6B, 0xCB, 0xFD]);
    cpu.set_reg16(3, 5);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.reg16(1), 0xFFF1);
    assert_eq!(cpu.reg16(3), 5);
    assert!(!cpu.get_flag(FLAG_CF));
    assert!(!cpu.get_flag(FLAG_OF));
    assert_eq!(cpu.eip, 0x1003);

    // IMUL EAX, EAX, 0x10000
    let mut cpu = real_cpu(&[0x66, 0x69, 0xC0, 0x00, 0x00, 0x01, 0x00]);
    cpu.set_reg32(0, 0x10000);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.reg32(0), 0);
    assert!(cpu.get_flag(FLAG_CF));
    assert!(cpu.get_flag(FLAG_OF));
    assert_eq!(cpu.eip, 0x1007);
}
