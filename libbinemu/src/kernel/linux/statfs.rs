use crate::kernel::linux::{LinuxKernel, LinuxSyscallImpl};
use crate::kernel::{SysCtx, SyscallArgs, SyscallResult};

/// TMPFS_MAGIC, which is what an in-memory tree is closest to.
const FS_MAGIC: u64 = 0x0102_1994;

#[derive(Debug)]
pub struct StatfsSyscall {
    path: u64,
    buf: u64,
}

impl From<&SyscallArgs> for StatfsSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            path: syscall.arg0(),
            buf: syscall.arg1(),
        }
    }
}

impl LinuxSyscallImpl for StatfsSyscall {
    fn handle(&self, kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        let Ok(path) = ctx.read_c_string(self.path) else {
            return SyscallResult::minus_one();
        };
        if !kernel.fs().borrow().exists(&path) && path != "/" {
            return SyscallResult::minus_one();
        }
        // Linux statfs layout, word-sized fields in the guest width
        let wide = ctx.task.bits() == 64;
        let mut w = ctx.struct_writer();
        let word = |w: &mut crate::kernel::codec::StructWriter, v: u64| {
            if wide {
                w.u64(v);
            } else {
                w.u32(v as u32);
            }
        };
        word(&mut w, FS_MAGIC); // f_type
        word(&mut w, 1024); // f_bsize
        word(&mut w, 0x10000); // f_blocks
        word(&mut w, 0x8000); // f_bfree
        word(&mut w, 0x8000); // f_bavail
        word(&mut w, 0x1000); // f_files
        word(&mut w, 0x800); // f_ffree
        w.u64(0); // f_fsid
        word(&mut w, 255); // f_namelen
        word(&mut w, 1024); // f_frsize
        word(&mut w, 0); // f_flags
        for _ in 0..4 {
            word(&mut w, 0); // f_spare
        }
        let raw = w.finish();
        match ctx.write_bytes(self.buf, &raw) {
            Ok(()) => SyscallResult::success(0),
            Err(_) => SyscallResult::minus_one(),
        }
    }
}
