//! The Linux kernel personality.
//!
//! One module per syscall family, in the shape shared by all of them: a
//! struct with the decoded arguments, a `From<&SyscallArgs>` impl binding
//! registers to argument positions, and a [`LinuxSyscallImpl::handle`] that
//! performs the call against the virtual filesystem and the task.

mod access;
mod fake_just_return;
mod info;
mod ioctl;
mod lseek;
mod mman;
mod open;
mod process;
mod read;
mod readlink;
pub(crate) mod stat;
mod statfs;
pub mod syscall_num;
mod thread;
mod time;
mod write;
mod write_v;

pub use stat::Stat;

use crate::cpu::Cpu;
use crate::emu::MachineRef;
use crate::error::EmuError;
use crate::kernel::fd::FdTable;
use crate::kernel::{Kernel, SysCtx, SyscallArgs, SyscallResult};
use crate::task::PAGE_SIZE;
use libramfs::Filesystem;
use linux_libc_auxv::{AuxVar, StackLayoutBuilder};
use std::cell::RefCell;
use std::fmt::Debug;
use std::net::TcpListener;
use std::rc::Rc;

pub const STACK_BASE: u64 = 0xbf80_0000;
pub const STACK_SIZE: u64 = 0x0080_0000;

/// Count of chars in a file name including null byte.
///
/// Source: <https://elixir.bootlin.com/linux/latest/source/include/uapi/linux/limits.h#L13>
#[allow(unused)]
pub const LINUX_NAME_MAX: usize = 255;

pub(crate) trait LinuxSyscallImpl: Debug {
    /// Returns the value for the guest return register.
    fn handle(&self, kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult;
}

#[derive(Debug)]
pub struct LinuxKernel {
    fs: Rc<RefCell<Filesystem>>,
    files: FdTable,
}

impl LinuxKernel {
    pub fn new(machine: &MachineRef) -> Self {
        let m = machine.borrow();
        let files = match m.config.stdio_port {
            Some(port) => match accept_stdio(port) {
                Ok(table) => table,
                Err(e) => {
                    log::error!("stdio redirect to port {} failed: {}", port, e);
                    FdTable::with_stdio()
                }
            },
            None => FdTable::with_stdio(),
        };
        Self {
            fs: m.fs.clone(),
            files,
        }
    }

    pub(crate) fn fs(&self) -> &Rc<RefCell<Filesystem>> {
        &self.fs
    }

    pub(crate) fn files(&mut self) -> &mut FdTable {
        &mut self.files
    }
}

/// Listens on localhost and blocks for the one connection that will carry
/// the guest's stdin/stdout.
fn accept_stdio(port: u16) -> std::io::Result<FdTable> {
    let addr = format!("localhost:{}", port);
    log::info!("listen on {:?} for incoming connection", addr);
    let listener = TcpListener::bind(&addr)?;
    let (stream, peer) = listener.accept()?;
    log::debug!("stdio connection from {}", peer);
    FdTable::with_socket(stream)
}

impl Kernel for LinuxKernel {
    fn name(&self) -> &'static str {
        "linux"
    }

    #[rustfmt::skip]
    fn dispatch(
        &mut self,
        ctx: &mut SysCtx<'_>,
        name: &str,
        args: &SyscallArgs,
    ) -> Option<SyscallResult> {
        use fake_just_return::FakeJustReturnSyscall;
        let res = match name {
            "read" => read::ReadSyscall::from(args).handle(self, ctx),
            "write" => write::WriteSyscall::from(args).handle(self, ctx),
            "writev" => write_v::WriteVSyscall::from(args).handle(self, ctx),
            "open" => open::OpenSyscall::from(args).handle(self, ctx),
            "openat" => open::OpenAtSyscall::from(args).handle(self, ctx),
            "close" => open::CloseSyscall::from(args).handle(self, ctx),
            "lseek" => lseek::LSeekSyscall::from(args).handle(self, ctx),
            "stat" | "lstat" => stat::StatSyscall::from(args).handle(self, ctx),
            "stat64" | "lstat64" => stat::StatSyscall::large(args).handle(self, ctx),
            "fstat" => stat::FstatSyscall::from(args).handle(self, ctx),
            "fstat64" => stat::FstatSyscall::large(args).handle(self, ctx),
            "statfs" => statfs::StatfsSyscall::from(args).handle(self, ctx),
            "access" => access::AccessSyscall::from(args).handle(self, ctx),
            "readlink" => readlink::ReadLinkSyscall::from(args).handle(self, ctx),
            "mmap" => mman::MMapSyscall::from(args).handle(self, ctx),
            "mmap2" => mman::MMapSyscall::page_scaled(args).handle(self, ctx),
            "mprotect" => mman::MProtectSyscall::from(args).handle(self, ctx),
            "munmap" => mman::MUnmapSyscall::from(args).handle(self, ctx),
            "brk" => mman::BrkSyscall::from(args).handle(self, ctx),
            "futex" => thread::FutexSyscall::from(args).handle(self, ctx),
            "uname" => info::UnameSyscall::from(args).handle(self, ctx),
            "getpid" | "gettid" => process::GetPidSyscall::from(args).handle(self, ctx),
            "getuid" | "geteuid" | "getgid" | "getegid" => FakeJustReturnSyscall::from(args).handle(self, ctx),
            "gettimeofday" => time::GetTimeOfDaySyscall::from(args).handle(self, ctx),
            "time" => time::TimeSyscall::from(args).handle(self, ctx),
            "clock_gettime" => time::ClockGetTimeSyscall::from(args).handle(self, ctx),
            "getcpu" => time::GetCpuSyscall::from(args).handle(self, ctx),
            "ioctl" => ioctl::IoctlSyscall::from(args).handle(self, ctx),
            "exit" | "exit_group" => process::ExitSyscall::from(args).handle(self, ctx),
            "rt_sigaction" | "rt_sigprocmask" | "madvise" | "set_tid_address"
            | "set_robust_list" => FakeJustReturnSyscall::from(args).handle(self, ctx),
            _ => return None,
        };
        Some(res)
    }
}

/// Maps the stack and lays out the libc startup block.
///
/// Libc expects argc, the argv and envp pointer arrays and the ELF auxiliary
/// vector at the initial stack pointer, see <https://lwn.net/Articles/631631/>.
pub fn stack_init(
    machine: &MachineRef,
    cpu: &mut dyn Cpu,
    args: &[String],
    env: &[String],
) -> Result<(), EmuError> {
    machine
        .borrow_mut()
        .map_stack(cpu, STACK_BASE, STACK_SIZE, false)?;
    if machine.borrow().task.bits() == 64 {
        stack_init_auxv_builder(machine, cpu, args, env)
    } else {
        stack_init_manual(machine, cpu, args, env)
    }
}

/// 64-bit startup block, serialised by `linux-libc-auxv`.
fn stack_init_auxv_builder(
    machine: &MachineRef,
    cpu: &mut dyn Cpu,
    args: &[String],
    env: &[String],
) -> Result<(), EmuError> {
    let mut m = machine.borrow_mut();
    let phdr = m.loader().and_then(|l| l.phdr_info());
    let exe = m.exe.clone();
    let platform = m.task.arch().name;
    let (base, interp_base, bin_entry) = (m.base, m.interp_base, m.bin_entry);

    let mut builder = StackLayoutBuilder::new();
    for arg in args {
        builder = builder.add_argv(arg.as_str());
    }
    for var in env {
        builder = builder.add_envv(var.as_str());
    }
    builder = builder
        .add_auxv(AuxVar::ExecFn(exe.as_str().into()))
        .add_auxv(AuxVar::Platform(platform.into()))
        .add_auxv(AuxVar::Pagesz(PAGE_SIZE as usize))
        .add_auxv(AuxVar::Base(interp_base as *const u8))
        .add_auxv(AuxVar::Entry(bin_entry as *const u8));
    if let Some(ph) = phdr {
        builder = builder
            .add_auxv(AuxVar::Phdr((base + ph.vaddr) as *const u8))
            .add_auxv(AuxVar::Phent(ph.entry_size as usize))
            .add_auxv(AuxVar::Phnum(ph.count as usize));
    }

    let sp = m.task.reg_read(cpu, m.task.arch().sp)?;
    let total = builder.clone().build(Some(0)).len();
    // argc must end up 16-byte aligned
    let block_base = (sp - total as u64) & !0xf;
    let buf = builder.build(Some(block_base as usize));
    m.task.mem_write(cpu, block_base, &buf)?;
    m.task.reg_write(cpu, m.task.arch().sp, block_base)?;
    log::debug!(
        "stack block: {} bytes at {:#x}, argc={}",
        total,
        block_base,
        args.len()
    );
    Ok(())
}

// auxv keys of the manual path
const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_PAGESZ: u64 = 6;
const AT_BASE: u64 = 7;
const AT_ENTRY: u64 = 9;
const AT_UID: u64 = 11;
const AT_EUID: u64 = 12;
const AT_GID: u64 = 13;
const AT_EGID: u64 = 14;

/// Startup block for narrower guests, pushed word by word in the guest
/// pointer width: string area first, then
/// `argc || argv[] || 0 || envp[] || 0 || auxv`.
fn stack_init_manual(
    machine: &MachineRef,
    cpu: &mut dyn Cpu,
    args: &[String],
    env: &[String],
) -> Result<(), EmuError> {
    let mut m = machine.borrow_mut();
    let phdr = m.loader().and_then(|l| l.phdr_info());
    let (base, interp_base, bin_entry) = (m.base, m.interp_base, m.bin_entry);
    let task = &mut m.task;

    task.push(cpu, 0)?;
    if let Some(argv0) = args.first() {
        // marker copy of argv[0] at the stack top
        task.push_bytes(cpu, &with_nul(argv0))?;
    }
    let mut env_ptrs = Vec::with_capacity(env.len());
    for var in env {
        env_ptrs.push(task.push_bytes(cpu, &with_nul(var))?);
    }
    let mut arg_ptrs = Vec::with_capacity(args.len());
    for arg in args {
        arg_ptrs.push(task.push_bytes(cpu, &with_nul(arg))?);
    }

    let mut auxv: Vec<(u64, u64)> = Vec::new();
    if let Some(ph) = phdr {
        auxv.push((AT_PHDR, base + ph.vaddr));
        auxv.push((AT_PHENT, ph.entry_size));
        auxv.push((AT_PHNUM, ph.count));
    }
    auxv.push((AT_PAGESZ, PAGE_SIZE));
    auxv.push((AT_BASE, interp_base));
    auxv.push((AT_ENTRY, bin_entry));
    for key in [AT_UID, AT_EUID, AT_GID, AT_EGID] {
        auxv.push((key, 0));
    }
    auxv.push((0, 0));

    let mut block = Vec::new();
    block.extend_from_slice(&task.pack_addr(args.len() as u64));
    for ptr in &arg_ptrs {
        block.extend_from_slice(&task.pack_addr(*ptr));
    }
    block.extend_from_slice(&task.pack_addr(0));
    for ptr in &env_ptrs {
        block.extend_from_slice(&task.pack_addr(*ptr));
    }
    block.extend_from_slice(&task.pack_addr(0));
    for (key, val) in &auxv {
        block.extend_from_slice(&task.pack_addr(*key));
        block.extend_from_slice(&task.pack_addr(*val));
    }

    let sp = task.reg_read(cpu, task.arch().sp)?;
    let block_base = (sp - block.len() as u64) & !0xf;
    task.mem_write(cpu, block_base, &block)?;
    task.reg_write(cpu, task.arch().sp, block_base)?;
    Ok(())
}

fn with_nul(s: &str) -> Vec<u8> {
    let mut raw = s.as_bytes().to_vec();
    raw.push(0);
    raw
}
