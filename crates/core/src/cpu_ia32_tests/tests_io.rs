//! Tests for port I/O and the TSS permission bitmap

use super::{flat_cpu, real_cpu, run, TSS_BASE};
use crate::cpu_ia32_protected::Seg;
use crate::fault::Fault;
use crate::flags::FLAG_IOPL;

/// Deny `port` in the TSS bitmap of a `flat_cpu` machine.
fn deny_port(cpu: &mut super::TestCpu, port: u16) {
    let addr = TSS_BASE + 0x68 + (port as u32 >> 3);
    let byte = cpu.memory.read_u8(addr) | (1 << (port & 7));
    cpu.memory.load_program(addr, &[byte]);
}

#[test]
fn test_in_out_real_mode() {
    // IN AL, 60h; IN AX, DX; OUT DX, AL; OUT 80h, AX
    let mut cpu = real_cpu(&[0xE4, 0x60, 0xED, 0xEE, 0xE7, 0x80]);
    cpu.memory.io_input = 0x1234_5678;
    cpu.set_reg16(2, 0x3F8);
    run(&mut cpu, 4).unwrap();
    assert_eq!(cpu.reg16(0), 0x5678);
    assert_eq!(cpu.memory.io_writes, vec![(0x3F8, 0x78, 1), (0x80, 0x5678, 2)]);
}

#[test]
fn test_in_dword() {
    let mut cpu = real_cpu(&[0x66, 0xE5, 0x40]);
    cpu.memory.io_input = 0xCAFE_BABE;
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.reg32(0), 0xCAFE_BABE);
}

#[test]
fn test_bitmap_checked_above_iopl() {
    // OUT 80h, AL at CPL 3, IOPL 0
    let mut cpu = flat_cpu(3, &[0xE6, 0x80, 0xE6, 0x81]);
    deny_port(&mut cpu, 0x80);
    assert_eq!(cpu.step(), Err(Fault::GeneralProtection(0)));
    assert!(cpu.memory.io_writes.is_empty());

    cpu.eip += 2;
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.memory.io_writes.len(), 1);
}

#[test]
fn test_bitmap_covers_every_byte_of_a_wide_access() {
    // OUT DX, EAX on 0x7E..0x81 touches the denied port 0x80
    let mut cpu = flat_cpu(3, &[0xEF]);
    deny_port(&mut cpu, 0x80);
    cpu.set_reg16(2, 0x7E);
    assert_eq!(cpu.step(), Err(Fault::GeneralProtection(0)));

    cpu.set_reg16(2, 0x7C);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.memory.io_writes, vec![(0x7C, 0, 4)]);
}

#[test]
fn test_cpl_within_iopl_skips_bitmap() {
    let mut cpu = flat_cpu(0, &[0xE6, 0x80]);
    deny_port(&mut cpu, 0x80);
    run(&mut cpu, 1).unwrap();

    let mut cpu = flat_cpu(3, &[0xE6, 0x80]);
    deny_port(&mut cpu, 0x80);
    cpu.eflags |= FLAG_IOPL;
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.memory.io_writes.len(), 1);
}

#[test]
fn test_port_past_tss_limit_is_denied() {
    let mut cpu = flat_cpu(3, &[0xE4, 0x10]);
    // shrink the TSS so the bitmap ends before port 0x10
    cpu.tr.last_byte = 0x68;
    assert_eq!(cpu.step(), Err(Fault::GeneralProtection(0)));
}

#[test]
fn test_rep_insb() {
    let mut cpu = real_cpu(&[0xF3, 0x6C]);
    cpu.memory.io_input = 0xAB;
    cpu.set_reg16(1, 3);
    cpu.set_reg16(7, 0x3000);
    run(&mut cpu, 3).unwrap();
    assert_eq!(cpu.eip, 0x1002);
    assert_eq!(cpu.reg16(1), 0);
    assert_eq!(cpu.reg16(7), 0x3003);
    assert_eq!(cpu.memory.read_u8(0x3000), 0xAB);
    assert_eq!(cpu.memory.read_u8(0x3002), 0xAB);
}

#[test]
fn test_ins_write_fault_reads_no_port() {
    let mut cpu = flat_cpu(0, &[0x6C]);
    // ES made read-only: the write check fails before the port is read
    cpu.segs[Seg::ES as usize].writable = false;
    assert_eq!(cpu.step(), Err(Fault::GeneralProtection(0)));
}

#[test]
fn test_outsw_with_segment_override() {
    // ES: OUTSW
    let mut cpu = real_cpu(&[0x26, 0x6F]);
    cpu.load_segment_real(Seg::ES, 0x0200);
    cpu.set_reg16(6, 0x0010);
    cpu.set_reg16(2, 0x1F0);
    cpu.memory.write_u16(0x2010, 0xBEEF);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.memory.io_writes, vec![(0x1F0, 0xBEEF, 2)]);
    assert_eq!(cpu.reg16(6), 0x0012);
}
