use crate::kernel::fd::Fd;
use crate::kernel::linux::{LinuxKernel, LinuxSyscallImpl};
use crate::kernel::{SysCtx, SyscallArgs, SyscallResult};

#[derive(Debug)]
pub struct WriteVSyscall {
    fd: Fd,
    iov: u64,
    count: u64,
}

impl From<&SyscallArgs> for WriteVSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            fd: Fd::from(syscall.arg0()),
            iov: syscall.arg1(),
            count: syscall.arg2(),
        }
    }
}

impl LinuxSyscallImpl for WriteVSyscall {
    fn handle(&self, kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        // iovec width follows the guest bits, entries are concatenated
        let Ok(iovecs) = ctx.read_iovecs(self.iov, self.count) else {
            return SyscallResult::minus_one();
        };
        let mut written = 0u64;
        for vec in iovecs {
            let Ok(data) = ctx.read_bytes(vec.base, vec.len) else {
                return SyscallResult::minus_one();
            };
            let Some(file) = kernel.files().get_mut(self.fd) else {
                return SyscallResult::minus_one();
            };
            match file.write(&data) {
                Ok(n) => written += n as u64,
                Err(_) => return SyscallResult::minus_one(),
            }
        }
        SyscallResult::success(written)
    }
}
