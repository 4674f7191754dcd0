//! The virtualised kernel surface.
//!
//! A task carries an ordered chain of kernels. A trapped syscall is mapped
//! through a per-arch table to a name; the first kernel in the chain that
//! exposes a handler for that name wins. A syscall nobody handles surfaces
//! as [`crate::error::EmuError::UnhandledSyscall`] and ends the run.

pub mod codec;
pub mod darwin;
pub mod errno;
pub mod fd;
pub mod linux;

use crate::cpu::Cpu;
use crate::error::EmuError;
use crate::task::Task;
use errno::Errno;
use std::fmt;

/// Raw trap state: the syscall number and the six ABI argument registers.
pub struct SyscallArgs {
    num: u64,
    regs: [u64; 6],
}

impl SyscallArgs {
    pub fn new(num: u64, regs: [u64; 6]) -> Self {
        Self { num, regs }
    }

    pub fn num(&self) -> u64 {
        self.num
    }
    pub fn arg0(&self) -> u64 {
        self.regs[0]
    }
    pub fn arg1(&self) -> u64 {
        self.regs[1]
    }
    pub fn arg2(&self) -> u64 {
        self.regs[2]
    }
    pub fn arg3(&self) -> u64 {
        self.regs[3]
    }
    pub fn arg4(&self) -> u64 {
        self.regs[4]
    }
    pub fn arg5(&self) -> u64 {
        self.regs[5]
    }
}

impl fmt::Debug for SyscallArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyscallArgs")
            .field("num", &self.num)
            .field("arg0", &(self.regs[0] as *const u8))
            .field("arg1", &(self.regs[1] as *const u8))
            .field("arg2", &(self.regs[2] as *const u8))
            .field("arg3", &(self.regs[3] as *const u8))
            .field("arg4", &(self.regs[4] as *const u8))
            .field("arg5", &(self.regs[5] as *const u8))
            .finish()
    }
}

/// Value placed in the guest return register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallResult(i64);

impl SyscallResult {
    pub fn success(value: u64) -> Self {
        Self(value as i64)
    }

    /// The classic POSIX failure encoding.
    pub fn minus_one() -> Self {
        Self(-1)
    }

    pub fn error(errno: Errno) -> Self {
        Self(-errno.val())
    }

    pub fn val(self) -> u64 {
        self.0 as u64
    }
}

/// Handler context. Kernels hold no back-reference to the task; everything
/// they may touch is passed in per invocation.
pub struct SysCtx<'a> {
    pub task: &'a mut Task,
    pub cpu: &'a mut dyn Cpu,
    /// Guest-side path of the main executable.
    pub exe: &'a str,
    /// Exit slot: setting it ends the run loop after the current trap.
    pub exit: &'a mut Option<EmuError>,
}

impl SysCtx<'_> {
    /// Clean guest exit. Stops the engine; the run loop observes the status.
    pub fn exit_with(&mut self, status: EmuError) {
        *self.exit = Some(status);
        self.cpu.stop();
    }
}

impl fmt::Debug for SysCtx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysCtx").field("exe", &self.exe).finish()
    }
}

/// One kernel in the chain.
pub trait Kernel {
    fn name(&self) -> &'static str;

    /// Handles `name` and returns its result, or `None` when this kernel has
    /// no handler of that name and the next kernel in the chain should be
    /// asked.
    fn dispatch(
        &mut self,
        ctx: &mut SysCtx<'_>,
        name: &str,
        args: &SyscallArgs,
    ) -> Option<SyscallResult>;
}

impl fmt::Debug for dyn Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Kernel {}>", self.name())
    }
}
