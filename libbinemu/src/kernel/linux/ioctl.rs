use crate::kernel::errno::Errno;
use crate::kernel::linux::{LinuxKernel, LinuxSyscallImpl};
use crate::kernel::{SysCtx, SyscallArgs, SyscallResult};

#[derive(Debug)]
pub struct IoctlSyscall {
    fd: u64,
    request: u64,
}

impl From<&SyscallArgs> for IoctlSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            fd: syscall.arg0(),
            request: syscall.arg1(),
        }
    }
}

impl LinuxSyscallImpl for IoctlSyscall {
    fn handle(&self, _kernel: &mut LinuxKernel, _ctx: &mut SysCtx<'_>) -> SyscallResult {
        // no terminal behind the virtual fds
        log::trace!("ioctl fd={} request={:#x} -> ENOTTY", self.fd, self.request);
        SyscallResult::error(Errno::ENOTTY)
    }
}
