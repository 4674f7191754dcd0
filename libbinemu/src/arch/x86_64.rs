//! x86_64 descriptor and its Linux/Darwin OS bindings.

use crate::arch::{read_abi_regs, ArchDescriptor, OsDescriptor};
use crate::cpu::{insn, Cpu, HookCallback, Prot, RegId};
use crate::emu::MachineRef;
use crate::error::EmuError;
use crate::kernel::darwin::{self, DarwinKernel};
use crate::kernel::linux::syscall_num::LinuxSyscallNum;
use crate::kernel::linux::LinuxKernel;
use crate::kernel::{Kernel, SyscallResult};

pub mod regs {
    use crate::cpu::RegId;

    pub const RAX: RegId = 1;
    pub const RBX: RegId = 2;
    pub const RCX: RegId = 3;
    pub const RDX: RegId = 4;
    pub const RSI: RegId = 5;
    pub const RDI: RegId = 6;
    pub const RBP: RegId = 7;
    pub const RSP: RegId = 8;
    pub const R8: RegId = 9;
    pub const R9: RegId = 10;
    pub const R10: RegId = 11;
    pub const R11: RegId = 12;
    pub const R12: RegId = 13;
    pub const R13: RegId = 14;
    pub const R14: RegId = 15;
    pub const R15: RegId = 16;
    pub const RIP: RegId = 17;
    pub const RFLAGS: RegId = 18;
    pub const CS: RegId = 19;
    pub const SS: RegId = 20;
    pub const DS: RegId = 21;
    pub const ES: RegId = 22;
    pub const FS: RegId = 23;
    pub const GS: RegId = 24;
}

/// Syscall arguments in ABI order (rdi, rsi, rdx, r10, r8, r9).
pub const ABI_REGS: [RegId; 6] = [
    regs::RDI,
    regs::RSI,
    regs::RDX,
    regs::R10,
    regs::R8,
    regs::R9,
];

pub static ARCH: ArchDescriptor = ArchDescriptor {
    name: "x86_64",
    bits: 64,
    pc: regs::RIP,
    sp: regs::RSP,
    regs: &[
        ("rax", regs::RAX),
        ("rbx", regs::RBX),
        ("rcx", regs::RCX),
        ("rdx", regs::RDX),
        ("rsi", regs::RSI),
        ("rdi", regs::RDI),
        ("rbp", regs::RBP),
        ("rsp", regs::RSP),
        ("r8", regs::R8),
        ("r9", regs::R9),
        ("r10", regs::R10),
        ("r11", regs::R11),
        ("r12", regs::R12),
        ("r13", regs::R13),
        ("r14", regs::R14),
        ("r15", regs::R15),
        ("rip", regs::RIP),
        ("rflags", regs::RFLAGS),
        ("cs", regs::CS),
        ("ss", regs::SS),
        ("ds", regs::DS),
        ("es", regs::ES),
        ("fs", regs::FS),
        ("gs", regs::GS),
    ],
    default_regs: &[
        "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "r8", "r9", "r10", "r11", "r12", "r13",
        "r14", "r15",
    ],
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

const VSYSCALL_BASE: u64 = 0xffff_ffff_ff60_0000;

/// Reserves the vsyscall page, writes a near-return at the three conventional
/// offsets and installs a code hook that synthesises the matching syscall
/// before the `ret` executes.
fn setup_vsyscall(machine: &MachineRef, cpu: &mut dyn Cpu) -> Result<(), EmuError> {
    let vgettimeofday = VSYSCALL_BASE;
    let vtime = VSYSCALL_BASE + 0x400;
    let vgetcpu = VSYSCALL_BASE + 0x800;
    {
        let mut m = machine.borrow_mut();
        m.task
            .mem_map(cpu, VSYSCALL_BASE, 0x1000, Prot::READ | Prot::EXEC)?;
        for addr in [vgettimeofday, vtime, vgetcpu] {
            m.task.mem_write(cpu, addr, &[0xc3])?;
        }
    }
    let m = machine.clone();
    cpu.hook_add(
        VSYSCALL_BASE,
        VSYSCALL_BASE + 0x1000,
        HookCallback::Code(Box::new(move |cpu, addr, _size| {
            let (num, name) = match addr {
                a if a == vgettimeofday => (96, "gettimeofday"),
                a if a == vtime => (201, "time"),
                a if a == vgetcpu => (309, "getcpu"),
                other => {
                    log::warn!("unsupported vsyscall trap: {:#x}", other);
                    return;
                }
            };
            let args = read_abi_regs(cpu, &ABI_REGS);
            let ret = m.borrow_mut().syscall(cpu, num, Some(name), args);
            let _ = cpu.reg_write(regs::RAX, ret);
        })),
    )?;
    Ok(())
}

fn linux_kernels(machine: &MachineRef, cpu: &mut dyn Cpu) -> Vec<Box<dyn Kernel>> {
    if let Err(e) = setup_vsyscall(machine, cpu) {
        log::error!("vsyscall page setup failed: {}", e);
    }
    vec![
        Box::new(Amd64Kernel::default()),
        Box::new(LinuxKernel::new(machine)),
    ]
}

fn linux_init(
    machine: &MachineRef,
    cpu: &mut dyn Cpu,
    args: &[String],
    env: &[String],
) -> Result<(), EmuError> {
    crate::kernel::linux::stack_init(machine, cpu, args, env)?;
    abi_init(machine, cpu)
}

/// Hooks the `syscall` and `sysenter` instructions.
fn abi_init(machine: &MachineRef, cpu: &mut dyn Cpu) -> Result<(), EmuError> {
    for insn_id in [insn::X86_SYSCALL, insn::X86_SYSENTER] {
        let m = machine.clone();
        cpu.hook_add(
            1,
            0,
            HookCallback::Instruction(
                insn_id,
                Box::new(move |cpu| {
                    linux_syscall(&m, cpu);
                }),
            ),
        )?;
    }
    Ok(())
}

fn linux_syscall(machine: &MachineRef, cpu: &mut dyn Cpu) {
    let num = cpu.reg_read(regs::RAX).unwrap_or(0);
    let name = LinuxSyscallNum::try_from(num).ok().map(|s| s.name());
    let args = read_abi_regs(cpu, &ABI_REGS);
    let ret = machine.borrow_mut().syscall(cpu, num, name, args);
    let _ = cpu.reg_write(regs::RAX, ret);
}

fn linux_interrupt(machine: &MachineRef, cpu: &mut dyn Cpu, intno: u32) {
    if intno == 0 {
        machine
            .borrow_mut()
            .exit(cpu, EmuError::GuestFault("division by zero".to_string()));
        return;
    }
    if intno == 0x80 {
        linux_syscall(machine, cpu);
    }
}

const ARCH_SET_GS: u64 = 0x1001;
const ARCH_SET_FS: u64 = 0x1002;
const ARCH_GET_FS: u64 = 0x1003;
const ARCH_GET_GS: u64 = 0x1004;

/// AMD64-specific syscalls, first in the Linux kernel chain.
#[derive(Debug, Default)]
pub struct Amd64Kernel;

impl Kernel for Amd64Kernel {
    fn name(&self) -> &'static str {
        "linux-amd64"
    }

    fn dispatch(
        &mut self,
        ctx: &mut crate::kernel::SysCtx<'_>,
        name: &str,
        args: &crate::kernel::SyscallArgs,
    ) -> Option<SyscallResult> {
        if name != "arch_prctl" {
            return None;
        }
        let (code, addr) = (args.arg0(), args.arg1());
        log::debug!("arch_prctl: code {:#x}, addr {:#x}", code, addr);
        const FS_MSR: u32 = 0xC000_0100;
        match code {
            ARCH_SET_FS => match ctx.cpu.msr_write(FS_MSR, addr) {
                Ok(()) => Some(SyscallResult::success(0)),
                Err(e) => {
                    log::error!("arch_prctl(ARCH_SET_FS) failed: {}", e);
                    Some(SyscallResult::minus_one())
                }
            },
            ARCH_SET_GS | ARCH_GET_FS | ARCH_GET_GS => {
                log::error!("arch_prctl code {:#x} not implemented", code);
                Some(SyscallResult::minus_one())
            }
            _ => {
                log::error!("unknown arch_prctl code {:#x}", code);
                Some(SyscallResult::minus_one())
            }
        }
    }
}

fn darwin_kernels(machine: &MachineRef, _cpu: &mut dyn Cpu) -> Vec<Box<dyn Kernel>> {
    vec![Box::new(DarwinKernel::new(machine))]
}

fn darwin_init(
    machine: &MachineRef,
    cpu: &mut dyn Cpu,
    args: &[String],
    env: &[String],
) -> Result<(), EmuError> {
    darwin::stack_init(machine, cpu, args, env)?;
    let m = machine.clone();
    cpu.hook_add(
        1,
        0,
        HookCallback::Instruction(
            insn::X86_SYSCALL,
            Box::new(move |cpu| {
                darwin_syscall(&m, cpu);
            }),
        ),
    )?;
    Ok(())
}

fn darwin_syscall(machine: &MachineRef, cpu: &mut dyn Cpu) {
    let num = cpu.reg_read(regs::RAX).unwrap_or(0);
    let name = darwin::syscall_name(num);
    let args = read_abi_regs(cpu, &ABI_REGS);
    let ret = machine.borrow_mut().syscall(cpu, num, name, args);
    let _ = cpu.reg_write(regs::RAX, ret);
}

fn darwin_interrupt(machine: &MachineRef, cpu: &mut dyn Cpu, intno: u32) {
    if intno == 0x80 {
        darwin_syscall(machine, cpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Registry;
    use crate::cpu::scripted::ScriptedCpu;
    use crate::cpu::Endian;
    use crate::kernel::{SysCtx, SyscallArgs};
    use crate::task::Task;

    #[test]
    fn test_arch_prctl_programs_the_fs_msr() {
        let registry = Registry::builtin();
        let (arch, os) = registry.get("x86_64", "linux").unwrap();
        let mut task = Task::new(arch, os, Endian::Little);
        let mut cpu = ScriptedCpu::new(arch);
        let mut exit = None;
        let mut kernel = Amd64Kernel::default();
        {
            let mut ctx = SysCtx {
                task: &mut task,
                cpu: &mut cpu,
                exe: "/bin/x",
                exit: &mut exit,
            };
            let args = SyscallArgs::new(158, [ARCH_SET_FS, 0x7000_0000, 0, 0, 0, 0]);
            let res = kernel.dispatch(&mut ctx, "arch_prctl", &args).unwrap();
            assert_eq!(res.val(), 0);
            assert!(
                kernel.dispatch(&mut ctx, "write", &args).is_none(),
                "other names must fall through to the next kernel"
            );
        }
        assert_eq!(cpu.msr_read(0xC000_0100), Some(0x7000_0000));
    }
}
