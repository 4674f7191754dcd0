//! ARM (32-bit) descriptor and Linux binding.

use crate::arch::{read_abi_regs, ArchDescriptor, OsDescriptor};
use crate::cpu::{Cpu, RegId};
use crate::emu::MachineRef;
use crate::error::EmuError;
use crate::kernel::linux::syscall_num;
use crate::kernel::linux::LinuxKernel;
use crate::kernel::Kernel;

pub mod regs {
    use crate::cpu::RegId;

    pub const R0: RegId = 1;
    pub const R1: RegId = 2;
    pub const R2: RegId = 3;
    pub const R3: RegId = 4;
    pub const R4: RegId = 5;
    pub const R5: RegId = 6;
    pub const R6: RegId = 7;
    pub const R7: RegId = 8;
    pub const R8: RegId = 9;
    pub const R9: RegId = 10;
    pub const R10: RegId = 11;
    pub const R11: RegId = 12;
    pub const R12: RegId = 13;
    pub const LR: RegId = 14;
    pub const SP: RegId = 15;
    pub const PC: RegId = 16;
}

/// EABI syscall arguments (r0..r5); the number travels in r7.
pub const ABI_REGS: [RegId; 6] = [
    regs::R0,
    regs::R1,
    regs::R2,
    regs::R3,
    regs::R4,
    regs::R5,
];

pub static ARCH: ArchDescriptor = ArchDescriptor {
    name: "arm",
    bits: 32,
    pc: regs::PC,
    sp: regs::SP,
    regs: &[
        ("r0", regs::R0),
        ("r1", regs::R1),
        ("r2", regs::R2),
        ("r3", regs::R3),
        ("r4", regs::R4),
        ("r5", regs::R5),
        ("r6", regs::R6),
        ("r7", regs::R7),
        ("r8", regs::R8),
        ("r9", regs::R9),
        ("r10", regs::R10),
        ("r11", regs::R11),
        ("r12", regs::R12),
        ("lr", regs::LR),
        ("sp", regs::SP),
        ("pc", regs::PC),
    ],
    default_regs: &[
        "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12",
    ],
    os: &[OsDescriptor {
        name: "linux",
        kernels: linux_kernels,
        init: linux_init,
        interrupt: linux_interrupt,
    }],
};

fn linux_kernels(machine: &MachineRef, _cpu: &mut dyn Cpu) -> Vec<Box<dyn Kernel>> {
    vec![Box::new(LinuxKernel::new(machine))]
}

fn linux_init(
    machine: &MachineRef,
    cpu: &mut dyn Cpu,
    args: &[String],
    env: &[String],
) -> Result<(), EmuError> {
    crate::kernel::linux::stack_init(machine, cpu, args, env)
}

fn linux_syscall(machine: &MachineRef, cpu: &mut dyn Cpu) {
    let num = cpu.reg_read(regs::R7).unwrap_or(0);
    // the EABI numbers of the calls we virtualise coincide with the classic
    // 32-bit table
    let name = syscall_num::legacy_name(num);
    let args = read_abi_regs(cpu, &ABI_REGS);
    let ret = machine.borrow_mut().syscall(cpu, num, name, args);
    let _ = cpu.reg_write(regs::R0, ret);
}

fn linux_interrupt(machine: &MachineRef, cpu: &mut dyn Cpu, intno: u32) {
    // intno 2 is the svc trap
    if intno == 2 {
        linux_syscall(machine, cpu);
    }
}
