//! 32-bit x86 descriptor and its Linux/Darwin OS bindings.

use crate::arch::{read_abi_regs, ArchDescriptor, OsDescriptor};
use crate::cpu::{Cpu, RegId};
use crate::emu::MachineRef;
use crate::error::EmuError;
use crate::kernel::darwin;
use crate::kernel::linux::syscall_num;
use crate::kernel::linux::LinuxKernel;
use crate::kernel::Kernel;

pub mod regs {
    use crate::cpu::RegId;

    pub const EAX: RegId = 1;
    pub const EBX: RegId = 2;
    pub const ECX: RegId = 3;
    pub const EDX: RegId = 4;
    pub const ESI: RegId = 5;
    pub const EDI: RegId = 6;
    pub const EBP: RegId = 7;
    pub const ESP: RegId = 8;
    pub const EIP: RegId = 9;
    pub const EFLAGS: RegId = 10;
    pub const CS: RegId = 11;
    pub const DS: RegId = 12;
    pub const ES: RegId = 13;
    pub const FS: RegId = 14;
    pub const GS: RegId = 15;
    pub const SS: RegId = 16;
}

/// Classic i386 syscall arguments (ebx, ecx, edx, esi, edi, ebp).
pub const ABI_REGS: [RegId; 6] = [
    regs::EBX,
    regs::ECX,
    regs::EDX,
    regs::ESI,
    regs::EDI,
    regs::EBP,
];

pub static ARCH: ArchDescriptor = ArchDescriptor {
    name: "x86",
    bits: 32,
    pc: regs::EIP,
    sp: regs::ESP,
    regs: &[
        ("eip", regs::EIP),
        ("esp", regs::ESP),
        ("ebp", regs::EBP),
        ("eax", regs::EAX),
        ("ebx", regs::EBX),
        ("ecx", regs::ECX),
        ("edx", regs::EDX),
        ("esi", regs::ESI),
        ("edi", regs::EDI),
        ("eflags", regs::EFLAGS),
        ("cs", regs::CS),
        ("ds", regs::DS),
        ("es", regs::ES),
        ("fs", regs::FS),
        ("gs", regs::GS),
        ("ss", regs::SS),
    ],
    default_regs: &["eax", "ebx", "ecx", "edx", "esi", "edi", "ebp"],
    os: &[
        OsDescriptor {
            name: "linux",
            kernels: linux_kernels,
            init: linux_init,
            interrupt: linux_interrupt,
        },
        OsDescriptor {
            name: "virtual-linux",
            kernels: linux_kernels,
            init: linux_init,
            interrupt: linux_interrupt,
        },
        OsDescriptor {
            name: "darwin",
            kernels: darwin_kernels,
            init: darwin_init,
            interrupt: darwin_interrupt,
        },
    ],
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
    let num = cpu.reg_read(regs::EAX).unwrap_or(0);
    let name = syscall_num::legacy_name(num);
    let args = read_abi_regs(cpu, &ABI_REGS);
    let ret = machine.borrow_mut().syscall(cpu, num, name, args);
    let _ = cpu.reg_write(regs::EAX, ret);
}

fn linux_interrupt(machine: &MachineRef, cpu: &mut dyn Cpu, intno: u32) {
    if intno == 0x80 {
        linux_syscall(machine, cpu);
    }
}

const DW_MACH: u64 = 1;
const DW_UNIX: u64 = 2;
const DW_MDEP: u64 = 3;
const DW_DIAG: u64 = 4;

fn darwin_kernels(_machine: &MachineRef, _cpu: &mut dyn Cpu) -> Vec<Box<dyn Kernel>> {
    // 32-bit Darwin guests have no kernel surface yet
    Vec::new()
}

fn darwin_init(
    _machine: &MachineRef,
    _cpu: &mut dyn Cpu,
    _args: &[String],
    _env: &[String],
) -> Result<(), EmuError> {
    Ok(())
}

/// BSD syscall arguments live on the stack on 32-bit Darwin, starting one
/// word above the return address.
fn stack_args(cpu: &mut dyn Cpu, sp: u64) -> [u64; 6] {
    let mut args = [0u64; 6];
    let mut buf = [0u8; 4];
    for (i, slot) in args.iter_mut().enumerate() {
        if cpu
            .mem_read_into(&mut buf, sp + 4 + (i as u64) * 4)
            .is_err()
        {
            break;
        }
        *slot = u32::from_le_bytes(buf) as u64;
    }
    args
}

fn darwin_syscall(machine: &MachineRef, cpu: &mut dyn Cpu, class: u64) {
    let eax = cpu.reg_read(regs::EAX).unwrap_or(0);
    let num = class << 24 | eax;
    let name = darwin::syscall_name(num);
    let sp = cpu.reg_read(regs::ESP).unwrap_or(0);
    let args = stack_args(cpu, sp);
    let ret = machine.borrow_mut().syscall(cpu, num, name, args);
    let _ = cpu.reg_write(regs::EAX, ret);
}

fn darwin_interrupt(machine: &MachineRef, cpu: &mut dyn Cpu, intno: u32) {
    match intno {
        0x80 => darwin_syscall(machine, cpu, DW_UNIX),
        0x81 => darwin_syscall(machine, cpu, DW_MACH),
        0x82 => darwin_syscall(machine, cpu, DW_MDEP),
        0x83 => darwin_syscall(machine, cpu, DW_DIAG),
        _ => {}
    }
}
