//! SPARC descriptor and (stub) Linux binding.

use crate::arch::{read_abi_regs, ArchDescriptor, OsDescriptor};
use crate::cpu::{Cpu, RegId};
use crate::emu::MachineRef;
use crate::error::EmuError;
use crate::kernel::linux::syscall_num;
use crate::kernel::linux::LinuxKernel;
use crate::kernel::Kernel;

pub mod regs {
    use crate::cpu::RegId;

    pub const G1: RegId = 1;
    pub const O0: RegId = 2;
    pub const O1: RegId = 3;
    pub const O2: RegId = 4;
    pub const O3: RegId = 5;
    pub const O4: RegId = 6;
    pub const O5: RegId = 7;
    pub const SP: RegId = 8;
    pub const FP: RegId = 9;
    pub const PC: RegId = 10;
}

/// TODO: the SPARC syscall argument registers are not bound yet; arguments
/// decode as zero until they are.
pub const ABI_REGS: [RegId; 0] = [];

pub static ARCH: ArchDescriptor = ArchDescriptor {
    name: "sparc",
    bits: 32,
    pc: regs::PC,
    sp: regs::SP,
    regs: &[
        ("g1", regs::G1),
        ("o0", regs::O0),
        ("o1", regs::O1),
        ("o2", regs::O2),
        ("o3", regs::O3),
        ("o4", regs::O4),
        ("o5", regs::O5),
        ("sp", regs::SP),
        ("fp", regs::FP),
        ("pc", regs::PC),
    ],
    default_regs: &["g1", "o0", "o1", "o2", "o3", "o4", "o5"],
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

#[allow(unused)]
fn linux_syscall(machine: &MachineRef, cpu: &mut dyn Cpu) {
    let num = cpu.reg_read(regs::G1).unwrap_or(0);
    let name = syscall_num::legacy_name(num);
    let args = read_abi_regs(cpu, &ABI_REGS);
    let ret = machine.borrow_mut().syscall(cpu, num, name, args);
    let _ = cpu.reg_write(regs::O0, ret);
}

/// The SPARC trap convention is not bound; any interrupt ends the run
/// instead of aborting the process.
fn linux_interrupt(machine: &MachineRef, cpu: &mut dyn Cpu, intno: u32) {
    machine.borrow_mut().exit(
        cpu,
        EmuError::UnhandledSyscall {
            num: intno as u64,
            name: "sparc interrupt".to_string(),
        },
    );
}
