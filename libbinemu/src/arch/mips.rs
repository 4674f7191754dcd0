//! MIPS (o32) descriptor and Linux binding.

use crate::arch::{read_abi_regs, ArchDescriptor, OsDescriptor};
use crate::cpu::{Cpu, RegId};
use crate::emu::MachineRef;
use crate::error::EmuError;
use crate::kernel::linux::syscall_num;
use crate::kernel::linux::LinuxKernel;
use crate::kernel::Kernel;

pub mod regs {
    use crate::cpu::RegId;

    pub const V0: RegId = 1;
    pub const V1: RegId = 2;
    pub const A0: RegId = 3;
    pub const A1: RegId = 4;
    pub const A2: RegId = 5;
    pub const A3: RegId = 6;
    pub const T0: RegId = 7;
    pub const T1: RegId = 8;
    pub const T2: RegId = 9;
    pub const S0: RegId = 10;
    pub const S1: RegId = 11;
    pub const GP: RegId = 12;
    pub const SP: RegId = 13;
    pub const FP: RegId = 14;
    pub const RA: RegId = 15;
    pub const PC: RegId = 16;
}

/// o32 passes the first four syscall arguments in a0..a3, the rest on the
/// stack. The stack slots are not modelled, matching the source.
pub const ABI_REGS: [RegId; 4] = [regs::A0, regs::A1, regs::A2, regs::A3];

pub static ARCH: ArchDescriptor = ArchDescriptor {
    name: "mips",
    bits: 32,
    pc: regs::PC,
    sp: regs::SP,
    regs: &[
        ("v0", regs::V0),
        ("v1", regs::V1),
        ("a0", regs::A0),
        ("a1", regs::A1),
        ("a2", regs::A2),
        ("a3", regs::A3),
        ("t0", regs::T0),
        ("t1", regs::T1),
        ("t2", regs::T2),
        ("s0", regs::S0),
        ("s1", regs::S1),
        ("gp", regs::GP),
        ("sp", regs::SP),
        ("fp", regs::FP),
        ("ra", regs::RA),
        ("pc", regs::PC),
    ],
    default_regs: &["v0", "v1", "a0", "a1", "a2", "a3"],
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
    let num = cpu.reg_read(regs::V0).unwrap_or(0);
    let name = syscall_num::mips_name(num);
    let args = read_abi_regs(cpu, &ABI_REGS);
    let ret = machine.borrow_mut().syscall(cpu, num, name, args);
    let _ = cpu.reg_write(regs::V0, ret);
}

fn linux_interrupt(machine: &MachineRef, cpu: &mut dyn Cpu, cause: u32) {
    let intno = (cause >> 1) & 15;
    if intno == 8 {
        linux_syscall(machine, cpu);
        return;
    }
    machine.borrow_mut().exit(
        cpu,
        EmuError::GuestFault(format!("unhandled MIPS interrupt {}", intno)),
    );
}
