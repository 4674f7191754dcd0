use crate::kernel::linux::{LinuxKernel, LinuxSyscallImpl};
use crate::kernel::{SysCtx, SyscallArgs, SyscallResult};

/// Width of each `utsname` field, including the terminator.
const UTS_FIELD: usize = 65;

#[derive(Debug)]
pub struct UnameSyscall {
    buf: u64,
}

impl From<&SyscallArgs> for UnameSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            buf: syscall.arg0(),
        }
    }
}

impl LinuxSyscallImpl for UnameSyscall {
    fn handle(&self, _kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        let machine = ctx.task.arch().name;
        let mut w = ctx.struct_writer();
        w.fixed_str("Linux", UTS_FIELD)
            .fixed_str("binemu", UTS_FIELD)
            .fixed_str("3.13.0-24-generic", UTS_FIELD)
            .fixed_str("normal copy of Linux minding my business", UTS_FIELD)
            .fixed_str(machine, UTS_FIELD)
            .fixed_str("", UTS_FIELD);
        let raw = w.finish();
        match ctx.write_bytes(self.buf, &raw) {
            Ok(()) => SyscallResult::success(0),
            Err(_) => SyscallResult::minus_one(),
        }
    }
}
