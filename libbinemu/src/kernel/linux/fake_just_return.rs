use crate::kernel::linux::{LinuxKernel, LinuxSyscallImpl};
use crate::kernel::{SysCtx, SyscallArgs, SyscallResult};

/// Handler for calls that are accepted and ignored: signal mask bookkeeping,
/// madvise hints, tid bookkeeping and the uid/gid family (the guest always
/// runs as root in its own world).
#[derive(Debug)]
pub struct FakeJustReturnSyscall;

impl From<&SyscallArgs> for FakeJustReturnSyscall {
    fn from(_syscall: &SyscallArgs) -> Self {
        Self
    }
}

impl LinuxSyscallImpl for FakeJustReturnSyscall {
    fn handle(&self, _kernel: &mut LinuxKernel, _ctx: &mut SysCtx<'_>) -> SyscallResult {
        SyscallResult::success(0)
    }
}
