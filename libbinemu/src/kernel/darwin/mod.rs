//! The Darwin kernel personality. A small BSD-class surface: enough for
//! Mach-O guests that read, write and exit.

use crate::cpu::Cpu;
use crate::emu::MachineRef;
use crate::error::EmuError;
use crate::kernel::fd::{Fd, FdTable, OpenFile};
use crate::kernel::linux::stat::handle_stat;
use crate::kernel::{Kernel, SysCtx, SyscallArgs, SyscallResult};
use libramfs::{Filesystem, OpenFlags};
use std::cell::RefCell;
use std::rc::Rc;

/// BSD syscall class on XNU.
const CLASS_UNIX: u64 = 2 << 24;

/// Maps a trapped number to the canonical handler name.
pub fn syscall_name(num: u64) -> Option<&'static str> {
    Some(match num.checked_sub(CLASS_UNIX)? {
        1 => "exit",
        3 => "read",
        4 => "write",
        5 => "open",
        6 => "close",
        189 => "fstat",
        _ => return None,
    })
}

#[derive(Debug)]
pub struct DarwinKernel {
    fs: Rc<RefCell<Filesystem>>,
    files: FdTable,
}

impl DarwinKernel {
    pub fn new(machine: &MachineRef) -> Self {
        Self {
            fs: machine.borrow().fs.clone(),
            files: FdTable::with_stdio(),
        }
    }

    fn sys_read(&mut self, ctx: &mut SysCtx<'_>, args: &SyscallArgs) -> SyscallResult {
        let (fd, buf, count) = (Fd::from(args.arg0()), args.arg1(), args.arg2());
        let mut tmp = vec![0u8; count as usize];
        let Some(file) = self.files.get_mut(fd) else {
            return SyscallResult::minus_one();
        };
        match file.read(&mut tmp) {
            Ok(n) if ctx.write_bytes(buf, &tmp[..n]).is_ok() => SyscallResult::success(n as u64),
            _ => SyscallResult::minus_one(),
        }
    }

    fn sys_write(&mut self, ctx: &mut SysCtx<'_>, args: &SyscallArgs) -> SyscallResult {
        let (fd, buf, count) = (Fd::from(args.arg0()), args.arg1(), args.arg2());
        let Ok(data) = ctx.read_bytes(buf, count) else {
            return SyscallResult::minus_one();
        };
        let Some(file) = self.files.get_mut(fd) else {
            return SyscallResult::minus_one();
        };
        match file.write(&data) {
            Ok(n) => SyscallResult::success(n as u64),
            Err(_) => SyscallResult::minus_one(),
        }
    }

    fn sys_open(&mut self, ctx: &mut SysCtx<'_>, args: &SyscallArgs) -> SyscallResult {
        let Ok(path) = ctx.read_c_string(args.arg0()) else {
            return SyscallResult::minus_one();
        };
        let flags = OpenFlags::from_bits_truncate(args.arg1() as u32);
        let handle = self
            .fs
            .borrow_mut()
            .open_file(&path, flags, args.arg2() as u16);
        match handle {
            Ok(file) => {
                let fd = self.files.insert(OpenFile::Ram(file));
                SyscallResult::success(fd.val() as u64)
            }
            Err(_) => SyscallResult::minus_one(),
        }
    }

    fn sys_fstat(&mut self, ctx: &mut SysCtx<'_>, args: &SyscallArgs) -> SyscallResult {
        let Some(file) = self.files.get(Fd::from(args.arg0())) else {
            return SyscallResult::minus_one();
        };
        let Some(info) = file.stat() else {
            return SyscallResult::minus_one();
        };
        handle_stat(ctx, &info, args.arg1(), false)
    }
}

impl Kernel for DarwinKernel {
    fn name(&self) -> &'static str {
        "darwin"
    }

    fn dispatch(
        &mut self,
        ctx: &mut SysCtx<'_>,
        name: &str,
        args: &SyscallArgs,
    ) -> Option<SyscallResult> {
        let res = match name {
            "read" => self.sys_read(ctx, args),
            "write" => self.sys_write(ctx, args),
            "open" => self.sys_open(ctx, args),
            "close" => match self.files.remove(Fd::from(args.arg0())) {
                Some(_) => SyscallResult::success(0),
                None => SyscallResult::minus_one(),
            },
            "fstat" => self.sys_fstat(ctx, args),
            "exit" => {
                log::debug!("guest exit({})", args.arg0());
                ctx.exit_with(EmuError::ExitStatus(args.arg0()));
                SyscallResult::success(0)
            }
            _ => return None,
        };
        Some(res)
    }
}

/// Maps the stack and pushes the minimal `argc || argv || 0 || envp || 0`
/// block. No auxiliary vector on this personality.
pub fn stack_init(
    machine: &MachineRef,
    cpu: &mut dyn Cpu,
    args: &[String],
    env: &[String],
) -> Result<(), EmuError> {
    use crate::kernel::linux::{STACK_BASE, STACK_SIZE};

    let mut m = machine.borrow_mut();
    m.map_stack(cpu, STACK_BASE, STACK_SIZE, false)?;
    let task = &mut m.task;

    let push_str = |task: &mut crate::task::Task, cpu: &mut dyn Cpu, s: &str| {
        let mut raw = s.as_bytes().to_vec();
        raw.push(0);
        task.push_bytes(cpu, &raw)
    };
    let mut env_ptrs = Vec::with_capacity(env.len());
    for var in env {
        env_ptrs.push(push_str(task, cpu, var)?);
    }
    let mut arg_ptrs = Vec::with_capacity(args.len());
    for arg in args {
        arg_ptrs.push(push_str(task, cpu, arg)?);
    }

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

    let sp = task.reg_read(cpu, task.arch().sp)?;
    let block_base = (sp - block.len() as u64) & !0xf;
    task.mem_write(cpu, block_base, &block)?;
    task.reg_write(cpu, task.arch().sp, block_base)?;
    Ok(())
}
