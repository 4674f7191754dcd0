use crate::kernel::fd::Fd;
use crate::kernel::linux::{LinuxKernel, LinuxSyscallImpl};
use crate::kernel::{SysCtx, SyscallArgs, SyscallResult};

/// Files are drained in 1 KiB chunks so a short read ends the loop without
/// touching guest memory past what the file delivered.
const CHUNK: usize = 1024;

#[derive(Debug)]
pub struct ReadSyscall {
    fd: Fd,
    user_buf: u64,
    count: u64,
}

impl From<&SyscallArgs> for ReadSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            fd: Fd::from(syscall.arg0()),
            user_buf: syscall.arg1(),
            count: syscall.arg2(),
        }
    }
}

impl LinuxSyscallImpl for ReadSyscall {
    fn handle(&self, kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        let mut done = 0u64;
        let mut tmp = [0u8; CHUNK];
        while done < self.count {
            let want = CHUNK.min((self.count - done) as usize);
            let Some(file) = kernel.files().get_mut(self.fd) else {
                return SyscallResult::minus_one();
            };
            let got = match file.read(&mut tmp[..want]) {
                Ok(n) => n,
                Err(_) => return SyscallResult::minus_one(),
            };
            if got > 0 && ctx.write_bytes(self.user_buf + done, &tmp[..got]).is_err() {
                return SyscallResult::minus_one();
            }
            done += got as u64;
            if got < want {
                break;
            }
        }
        SyscallResult::success(done)
    }
}
