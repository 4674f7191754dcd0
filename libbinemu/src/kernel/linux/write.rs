use crate::kernel::fd::Fd;
use crate::kernel::linux::{LinuxKernel, LinuxSyscallImpl};
use crate::kernel::{SysCtx, SyscallArgs, SyscallResult};

#[derive(Debug)]
pub struct WriteSyscall {
    fd: Fd,
    usr_ptr: u64,
    // number of bytes
    count: u64,
}

impl From<&SyscallArgs> for WriteSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            fd: Fd::from(syscall.arg0()),
            usr_ptr: syscall.arg1(),
            count: syscall.arg2(),
        }
    }
}

impl LinuxSyscallImpl for WriteSyscall {
    fn handle(&self, kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        let Ok(data) = ctx.read_bytes(self.usr_ptr, self.count) else {
            return SyscallResult::minus_one();
        };
        let Some(file) = kernel.files().get_mut(self.fd) else {
            return SyscallResult::minus_one();
        };
        match file.write(&data) {
            Ok(n) => SyscallResult::success(n as u64),
            Err(e) => {
                log::trace!("write to fd {} failed: {}", self.fd.val(), e);
                SyscallResult::minus_one()
            }
        }
    }
}
