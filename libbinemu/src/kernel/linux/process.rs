use crate::error::EmuError;
use crate::kernel::linux::{LinuxKernel, LinuxSyscallImpl};
use crate::kernel::{SysCtx, SyscallArgs, SyscallResult};

/// `exit` and `exit_group`: record the status and stop the CPU; the run
/// loop observes the status on its next iteration.
#[derive(Debug)]
pub struct ExitSyscall {
    code: u64,
}

impl From<&SyscallArgs> for ExitSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            code: syscall.arg0(),
        }
    }
}

impl LinuxSyscallImpl for ExitSyscall {
    fn handle(&self, _kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        log::debug!("guest exit({})", self.code);
        ctx.exit_with(EmuError::ExitStatus(self.code));
        SyscallResult::success(0)
    }
}

/// The single-process model has exactly one pid, and its one thread shares
/// the id.
#[derive(Debug)]
pub struct GetPidSyscall;

impl From<&SyscallArgs> for GetPidSyscall {
    fn from(_syscall: &SyscallArgs) -> Self {
        Self
    }
}

impl LinuxSyscallImpl for GetPidSyscall {
    fn handle(&self, _kernel: &mut LinuxKernel, _ctx: &mut SysCtx<'_>) -> SyscallResult {
        SyscallResult::success(1)
    }
}
