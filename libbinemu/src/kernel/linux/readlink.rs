use crate::kernel::linux::{LinuxKernel, LinuxSyscallImpl};
use crate::kernel::{SysCtx, SyscallArgs, SyscallResult};

#[derive(Debug)]
pub struct ReadLinkSyscall {
    path: u64,
    buf: u64,
    size: u64,
}

impl From<&SyscallArgs> for ReadLinkSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            path: syscall.arg0(),
            buf: syscall.arg1(),
            size: syscall.arg2(),
        }
    }
}

impl LinuxSyscallImpl for ReadLinkSyscall {
    fn handle(&self, _kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        let Ok(path) = ctx.read_c_string(self.path) else {
            return SyscallResult::minus_one();
        };
        // the only link the guest may resolve is its own image
        if path != "/proc/self/exe" {
            log::warn!("readlink {:?} not implemented", path);
            return SyscallResult::minus_one();
        }
        // truncate bytes, not chars: the guest size may split anywhere
        let mut name = ctx.exe.as_bytes().to_vec();
        name.truncate(self.size as usize);
        match ctx.write_bytes(self.buf, &name) {
            Ok(()) => SyscallResult::success(name.len() as u64),
            Err(_) => SyscallResult::minus_one(),
        }
    }
}
