use crate::kernel::fd::Fd;
use crate::kernel::linux::{LinuxKernel, LinuxSyscallImpl};
use crate::kernel::{SysCtx, SyscallArgs, SyscallResult};

const SEEK_SET: u64 = 0;
const SEEK_CUR: u64 = 1;
const SEEK_END: u64 = 2;

#[derive(Debug)]
pub struct LSeekSyscall {
    fd: Fd,
    offset: i64,
    whence: u64,
}

impl From<&SyscallArgs> for LSeekSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            fd: Fd::from(syscall.arg0()),
            offset: syscall.arg1() as i64,
            whence: syscall.arg2(),
        }
    }
}

impl LinuxSyscallImpl for LSeekSyscall {
    fn handle(&self, kernel: &mut LinuxKernel, _ctx: &mut SysCtx<'_>) -> SyscallResult {
        let Some(file) = kernel.files().get_mut(self.fd) else {
            return SyscallResult::minus_one();
        };
        let base = match self.whence {
            SEEK_SET => 0,
            SEEK_CUR => match file {
                crate::kernel::fd::OpenFile::Ram(f) => f.offset() as i64,
                _ => return SyscallResult::minus_one(),
            },
            SEEK_END => match file {
                crate::kernel::fd::OpenFile::Ram(f) => f.len() as i64,
                _ => return SyscallResult::minus_one(),
            },
            _ => return SyscallResult::minus_one(),
        };
        let target = base + self.offset;
        if target < 0 {
            return SyscallResult::minus_one();
        }
        match file.seek(target as u64) {
            Ok(pos) => SyscallResult::success(pos),
            Err(_) => SyscallResult::minus_one(),
        }
    }
}
