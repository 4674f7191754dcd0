//! ARM64 descriptor and Linux binding.

use crate::arch::{read_abi_regs, ArchDescriptor, OsDescriptor};
use crate::cpu::{Cpu, RegId};
use crate::emu::MachineRef;
use crate::error::EmuError;
use crate::kernel::linux::syscall_num;
use crate::kernel::linux::LinuxKernel;
use crate::kernel::Kernel;

pub mod regs {
    use crate::cpu::RegId;

    pub const X0: RegId = 1;
    pub const X1: RegId = 2;
    pub const X2: RegId = 3;
    pub const X3: RegId = 4;
    pub const X4: RegId = 5;
    pub const X5: RegId = 6;
    pub const X6: RegId = 7;
    pub const X7: RegId = 8;
    pub const X8: RegId = 9;
    pub const X29: RegId = 30;
    pub const X30: RegId = 31;
    pub const SP: RegId = 32;
    pub const PC: RegId = 33;
}

/// AArch64 syscall arguments (x0..x5); the number travels in x8.
pub const ABI_REGS: [RegId; 6] = [
    regs::X0,
    regs::X1,
    regs::X2,
    regs::X3,
    regs::X4,
    regs::X5,
];

pub static ARCH: ArchDescriptor = ArchDescriptor {
    name: "arm64",
    bits: 64,
    pc: regs::PC,
    sp: regs::SP,
    regs: &[
        ("x0", regs::X0),
        ("x1", regs::X1),
        ("x2", regs::X2),
        ("x3", regs::X3),
        ("x4", regs::X4),
        ("x5", regs::X5),
        ("x6", regs::X6),
        ("x7", regs::X7),
        ("x8", regs::X8),
        ("x29", regs::X29),
        ("x30", regs::X30),
        ("sp", regs::SP),
        ("pc", regs::PC),
    ],
    default_regs: &["x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8"],
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
    let num = cpu.reg_read(regs::X8).unwrap_or(0);
    let name = syscall_num::arm64_name(num);
    let args = read_abi_regs(cpu, &ABI_REGS);
    let ret = machine.borrow_mut().syscall(cpu, num, name, args);
    let _ = cpu.reg_write(regs::X0, ret);
}

fn linux_interrupt(machine: &MachineRef, cpu: &mut dyn Cpu, intno: u32) {
    // intno 2 is the svc trap
    if intno == 2 {
        linux_syscall(machine, cpu);
    }
}
