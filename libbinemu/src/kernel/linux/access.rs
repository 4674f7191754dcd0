use crate::kernel::linux::{LinuxKernel, LinuxSyscallImpl};
use crate::kernel::{SysCtx, SyscallArgs, SyscallResult};

#[derive(Debug)]
pub struct AccessSyscall {
    path: u64,
    mode: u32,
}

impl From<&SyscallArgs> for AccessSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            path: syscall.arg0(),
            mode: syscall.arg1() as u32,
        }
    }
}

impl LinuxSyscallImpl for AccessSyscall {
    fn handle(&self, kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        let Ok(path) = ctx.read_c_string(self.path) else {
            return SyscallResult::minus_one();
        };
        let handle = kernel.fs().borrow_mut().open(&path);
        let Ok(file) = handle else {
            return SyscallResult::minus_one();
        };
        let fmode = file.metadata().umode() as u32;
        // X_OK, W_OK, R_OK against the world bits
        for bit in [1u32, 2, 4] {
            if self.mode & bit != 0 && fmode & bit == 0 {
                return SyscallResult::minus_one();
            }
        }
        SyscallResult::success(0)
    }
}
