//! Tests for CMPS/SCAS and their repeat prefixes

use super::{real_cpu, run};
use crate::cpu_ia32_protected::Seg;
use crate::fault::Fault;
use crate::flags::{FLAG_CF, FLAG_DF, FLAG_ZF};

#[test]
fn test_cmpsb_single() {
    let mut cpu = real_cpu(&[0xA6]);
    cpu.set_reg16(6, 0x2000);
    cpu.set_reg16(7, 0x3000);
    cpu.memory.load_program(0x2000, &[0x10]);
    cpu.memory.load_program(0x3000, &[0x20]);
    run(&mut cpu, 1).unwrap();
    assert!(cpu.get_flag(FLAG_CF));
    assert!(!cpu.get_flag(FLAG_ZF));
    assert_eq!(cpu.reg16(6), 0x2001);
    assert_eq!(cpu.reg16(7), 0x3001);
    assert_eq!(cpu.eip, 0x1001);
}

#[test]
fn test_repe_cmpsb_resumes_one_iteration_per_step() {
    let mut cpu = real_cpu(&[0xF3, 0xA6]);
    cpu.set_reg16(1, 5);
    cpu.set_reg16(6, 0x2000);
    cpu.set_reg16(7, 0x3000);
    cpu.memory.load_program(0x2000, b"abcXe");
    cpu.memory.load_program(0x3000, b"abcde");

    run(&mut cpu, 2).unwrap();
    // still inside the instruction
    assert_eq!(cpu.eip, 0x1000);
    assert_eq!(cpu.reg16(1), 3);
    assert_eq!(cpu.reg16(6), 0x2002);

    run(&mut cpu, 2).unwrap();
    assert_eq!(cpu.eip, 0x1002);
    assert_eq!(cpu.reg16(1), 1);
    assert!(!cpu.get_flag(FLAG_ZF));
    assert_eq!(cpu.reg16(6), 0x2004);
}

#[test]
fn test_rep_with_zero_count_is_noop() {
    let mut cpu = real_cpu(&[0xF3, 0xA6]);
    cpu.set_reg16(6, 0x2000);
    cpu.set_flag(FLAG_ZF, true);
    let flags = cpu.eflags;
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.eip, 0x1002);
    assert_eq!(cpu.reg16(6), 0x2000);
    assert_eq!(cpu.eflags, flags);
}

#[test]
fn test_repne_scasw_finds_word() {
    let mut cpu = real_cpu(&[0xF2, 0xAF]);
    cpu.set_reg16(0, 0xBEEF);
    cpu.set_reg16(1, 10);
    cpu.set_reg16(7, 0x3000);
    for (i, w) in [0x1111u16, 0x2222, 0xBEEF, 0x3333].iter().enumerate() {
        cpu.memory.write_u16(0x3000 + i as u32 * 2, *w);
    }
    for _ in 0..10 {
        run(&mut cpu, 1).unwrap();
        if cpu.eip != 0x1000 {
            break;
        }
    }
    assert_eq!(cpu.eip, 0x1002);
    assert!(cpu.get_flag(FLAG_ZF));
    assert_eq!(cpu.reg16(1), 7);
    assert_eq!(cpu.reg16(7), 0x3006);
}

#[test]
fn test_scas_backwards_with_df() {
    // SCASB with DF=1
    let mut cpu = real_cpu(&[0xAE]);
    cpu.set_flag(FLAG_DF, true);
    cpu.set_reg8(0, 0x41);
    cpu.set_reg16(7, 0x3000);
    cpu.memory.load_program(0x3000, &[0x41]);
    run(&mut cpu, 1).unwrap();
    assert!(cpu.get_flag(FLAG_ZF));
    assert_eq!(cpu.reg16(7), 0x2FFF);
}

#[test]
fn test_cmps_segment_override_applies_to_source() {
    // ES: CMPSB reads the source through ES
    let mut cpu = real_cpu(&[0x26, 0xA6]);
    cpu.load_segment_real(Seg::ES, 0x0100);
    cpu.set_reg16(6, 0x0000);
    cpu.set_reg16(7, 0x0000);
    cpu.memory.load_program(0x1000, &[0x26]);
    run(&mut cpu, 1).unwrap();
    // both operands come from linear 0x1000
    assert!(cpu.get_flag(FLAG_ZF));
}

#[test]
fn test_cmps_fault_rewinds_without_side_effects() {
    let mut cpu = real_cpu(&[0xF3, 0xA6]);
    cpu.set_reg16(1, 4);
    cpu.set_reg16(6, 0x2000);
    cpu.set_reg16(7, 0x3000);
    cpu.memory.fault_at = Some(0x3000);
    assert_eq!(cpu.step(), Err(Fault::PageFault { linear: 0x3000, code: 0 }));
    assert_eq!(cpu.eip, 0x1000);
    assert_eq!(cpu.reg16(1), 4);
    assert_eq!(cpu.reg16(6), 0x2000);
}
