use crate::kernel::fd::{Fd, OpenFile};
use crate::kernel::linux::{LinuxKernel, LinuxSyscallImpl};
use crate::kernel::{SysCtx, SyscallArgs, SyscallResult};
use libramfs::OpenFlags;

#[derive(Debug)]
pub struct OpenSyscall {
    // null terminated file name
    filename: u64,
    flags: u32,
    umode: u64,
}

impl From<&SyscallArgs> for OpenSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            filename: syscall.arg0(),
            flags: syscall.arg1() as u32,
            umode: syscall.arg2(),
        }
    }
}

impl OpenSyscall {
    fn open(&self, kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        let Ok(path) = ctx.read_c_string(self.filename) else {
            return SyscallResult::minus_one();
        };
        let flags = OpenFlags::from_bits_truncate(self.flags);
        let handle = kernel
            .fs()
            .borrow_mut()
            .open_file(&path, flags, self.umode as u16);
        match handle {
            Ok(file) => {
                let fd = kernel.files().insert(OpenFile::Ram(file));
                log::trace!("open {:?} -> fd {}", path, fd.val());
                SyscallResult::success(fd.val() as u64)
            }
            Err(e) => {
                log::trace!("open {:?} failed: {}", path, e);
                SyscallResult::minus_one()
            }
        }
    }
}

impl LinuxSyscallImpl for OpenSyscall {
    fn handle(&self, kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        self.open(kernel, ctx)
    }
}

/// `openat` with the arguments shifted by the directory descriptor, which is
/// ignored: guest paths are absolute in this tree.
#[derive(Debug)]
pub struct OpenAtSyscall {
    dirfd: u64,
    inner: OpenSyscall,
}

impl From<&SyscallArgs> for OpenAtSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            dirfd: syscall.arg0(),
            inner: OpenSyscall {
                filename: syscall.arg1(),
                flags: syscall.arg2() as u32,
                umode: syscall.arg3(),
            },
        }
    }
}

impl LinuxSyscallImpl for OpenAtSyscall {
    fn handle(&self, kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        log::trace!("openat: dirfd {:#x} ignored", self.dirfd);
        self.inner.open(kernel, ctx)
    }
}

#[derive(Debug)]
pub struct CloseSyscall {
    fd: Fd,
}

impl From<&SyscallArgs> for CloseSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            fd: Fd::from(syscall.arg0()),
        }
    }
}

impl LinuxSyscallImpl for CloseSyscall {
    fn handle(&self, kernel: &mut LinuxKernel, _ctx: &mut SysCtx<'_>) -> SyscallResult {
        match kernel.files().remove(self.fd) {
            Some(_) => SyscallResult::success(0),
            None => SyscallResult::minus_one(),
        }
    }
}
