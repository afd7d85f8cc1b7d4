//! Tests for integer ALU instructions and flag handling

use super::{real_cpu, run};
use crate::fault::Fault;
use crate::flags::{FLAG_AF, FLAG_CF, FLAG_DF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF};

#[test]
fn test_cmp_al_imm_borrow() {
    // CMP AL, 7
    let mut cpu = real_cpu(&[0x3C, 0x07]);
    cpu.set_reg8(0, 5);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.reg8(0), 5);
    assert!(cpu.get_flag(FLAG_CF));
    assert!(!cpu.get_flag(FLAG_ZF));
    assert!(cpu.get_flag(FLAG_SF));
    assert!(!cpu.get_flag(FLAG_OF));
    assert!(cpu.get_flag(FLAG_AF));
    // 0xFE has seven bits set
    assert!(!cpu.get_flag(FLAG_PF));
    assert_eq!(cpu.eip, 0x1002);
}

#[test]
fn test_add_signed_overflow() {
    // ADD AL, 1
    let mut cpu = real_cpu(&[0x04, 0x01]);
    cpu.set_reg8(0, 0x7F);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.reg8(0), 0x80);
    assert!(cpu.get_flag(FLAG_OF));
    assert!(cpu.get_flag(FLAG_SF));
    assert!(cpu.get_flag(FLAG_AF));
    assert!(!cpu.get_flag(FLAG_CF));
}

#[test]
fn test_adc_and_sbb_use_carry() {
    // STC; ADC AX, BX; STC; SBB CX, CX
    let mut cpu = real_cpu(&[0xF9, 0x11, 0xD8, 0xF9, 0x19, 0xC9]);
    cpu.set_reg16(0, 0xFFFF);
    cpu.set_reg16(3, 0x0000);
    cpu.set_reg16(1, 0x1234);
    run(&mut cpu, 4).unwrap();
    assert_eq!(cpu.reg16(0), 0x0000);
    // SBB with equal operands and CF=1 borrows
    assert_eq!(cpu.reg16(1), 0xFFFF);
    assert!(cpu.get_flag(FLAG_CF));
    assert!(cpu.get_flag(FLAG_SF));
}

#[test]
fn test_operand_size_prefix_selects_dword() {
    // ADD EAX, -1 (sign-extended imm8)
    let mut cpu = real_cpu(&[0x66, 0x83, 0xC0, 0xFF]);
    cpu.set_reg32(0, 0x0001_0000);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.reg32(0), 0x0000_FFFF);
    assert!(cpu.get_flag(FLAG_CF));
}

#[test]
fn test_alu_memory_destination() {
    // XOR [BX], AX
    let mut cpu = real_cpu(&[0x31, 0x07]);
    cpu.set_reg16(3, 0x2000);
    cpu.set_reg16(0, 0x00FF);
    cpu.memory.write_u16(0x2000, 0x0F0F);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.memory.read_u16(0x2000), 0x0FF0);
    assert!(!cpu.get_flag(FLAG_CF));
}

#[test]
fn test_lock_placement() {
    // LOCK ADD [BX], AL is legal
    let mut cpu = real_cpu(&[0xF0, 0x00, 0x07]);
    cpu.set_reg16(3, 0x2000);
    cpu.set_reg8(0, 3);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.memory.read_u8(0x2000), 3);

    // LOCK ADD AX, AX targets a register
    let mut cpu = real_cpu(&[0xF0, 0x01, 0xC0]);
    assert_eq!(cpu.step(), Err(Fault::InvalidOpcode));
    assert_eq!(cpu.eip, 0x1000);

    // LOCK CMP [BX], AL does not write
    let mut cpu = real_cpu(&[0xF0, 0x38, 0x07]);
    assert_eq!(cpu.step(), Err(Fault::InvalidOpcode));

    // LOCK AND AX, [BX] has a register destination
    let mut cpu = real_cpu(&[0xF0, 0x23, 0x07]);
    assert_eq!(cpu.step(), Err(Fault::InvalidOpcode));
}

#[test]
fn test_neg_and_not() {
    // NEG AX; NOT BX
    let mut cpu = real_cpu(&[0xF7, 0xD8, 0xF7, 0xD3]);
    cpu.set_reg16(0, 1);
    cpu.set_reg16(3, 0x00F0);
    run(&mut cpu, 2).unwrap();
    assert_eq!(cpu.reg16(0), 0xFFFF);
    assert!(cpu.get_flag(FLAG_CF));
    assert_eq!(cpu.reg16(3), 0xFF0F);

    // NEG of zero clears CF
    let mut cpu = real_cpu(&[0xF6, 0xD8]);
    cpu.set_flag(FLAG_CF, true);
    run(&mut cpu, 1).unwrap();
    assert!(!cpu.get_flag(FLAG_CF));
    assert!(cpu.get_flag(FLAG_ZF));
}

#[test]
fn test_inc_dec_preserve_carry() {
    // STC; INC AX; DEC CX
    let mut cpu = real_cpu(&[0xF9, 0x40, 0x49]);
    cpu.set_reg16(0, 0x7FFF);
    cpu.set_reg16(1, 0x0001);
    run(&mut cpu, 3).unwrap();
    assert_eq!(cpu.reg16(0), 0x8000);
    assert_eq!(cpu.reg16(1), 0);
    assert!(cpu.get_flag(FLAG_CF));
    assert!(cpu.get_flag(FLAG_ZF));
}

#[test]
fn test_group4_inc_byte_and_invalid_reg() {
    // INC BYTE [BX]
    let mut cpu = real_cpu(&[0xFE, 0x07, 0xFE, 0x17]);
    cpu.set_reg16(3, 0x2000);
    cpu.memory.load_program(0x2000, &[0xFF]);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.memory.read_u8(0x2000), 0);
    assert!(cpu.get_flag(FLAG_ZF));
    // FE /2 is not defined
    assert_eq!(cpu.step(), Err(Fault::InvalidOpcode));
}

#[test]
fn test_test_clears_cf_of() {
    // TEST AL, 0x80; TEST AX, BX
    let mut cpu = real_cpu(&[0xA8, 0x80, 0x85, 0xD8]);
    cpu.set_flag(FLAG_CF, true);
    cpu.set_flag(FLAG_OF, true);
    cpu.set_reg16(0, 0x0080);
    cpu.set_reg16(3, 0x0100);
    run(&mut cpu, 1).unwrap();
    assert!(!cpu.get_flag(FLAG_CF));
    assert!(!cpu.get_flag(FLAG_OF));
    assert!(cpu.get_flag(FLAG_SF));
    run(&mut cpu, 1).unwrap();
    assert!(cpu.get_flag(FLAG_ZF));
    assert_eq!(cpu.reg16(0), 0x0080);
}

#[test]
fn test_setcc_and_flag_ops() {
    // STC; CMC; SETB AL; STD; SETE BL
    let mut cpu = real_cpu(&[0xF9, 0xF5, 0x0F, 0x92, 0xC0, 0xFD, 0x0F, 0x94, 0xC3]);
    cpu.set_reg8(0, 0x55);
    cpu.set_reg8(3, 0x55);
    run(&mut cpu, 5).unwrap();
    assert_eq!(cpu.reg8(0), 0);
    assert!(cpu.get_flag(FLAG_DF));
    assert_eq!(cpu.reg8(3), 0);
    assert_eq!(cpu.instructions, 5);
}
