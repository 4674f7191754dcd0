//! Memory-management syscalls.

use crate::cpu::Prot;
use crate::kernel::errno::Errno;
use crate::kernel::fd::Fd;
use crate::kernel::linux::{LinuxKernel, LinuxSyscallImpl};
use crate::kernel::{SysCtx, SyscallArgs, SyscallResult};
use crate::mem::FileBacking;
use crate::task::PAGE_SIZE;

bitflags::bitflags! {
    /// <https://elixir.bootlin.com/linux/latest/source/include/uapi/asm-generic/mman-common.h#L12>
    struct MMapProt: u64 {
        /// page can be read
        const READ = 0x1;
        /// page can be written
        const WRITE = 0x2;
        /// page can be executed
        const EXEC = 0x4;
    }
}

bitflags::bitflags! {
    /// <https://elixir.bootlin.com/linux/latest/source/include/uapi/asm-generic/mman-common.h#L22>
    struct MMapFlags: u64 {
        const SHARED = 0x1;
        const PRIVATE = 0x2;
        /// Don't interpret addr as a hint but place the mapping
        /// at exactly that address.
        const FIXED = 0x10;
        const ANONYMOUS = 0x20;
    }
}

/// * <https://man7.org/linux/man-pages/man2/mmap.2.html>
#[derive(Debug)]
pub struct MMapSyscall {
    addr: u64,
    len: u64,
    prot: u64,
    flags: u64,
    fd: i64,
    offset: u64,
    /// `mmap2` passes the offset in pages.
    page_scaled: bool,
}

impl From<&SyscallArgs> for MMapSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            addr: syscall.arg0(),
            len: syscall.arg1(),
            prot: syscall.arg2(),
            flags: syscall.arg3(),
            fd: syscall.arg4() as i64,
            offset: syscall.arg5(),
            page_scaled: false,
        }
    }
}

impl MMapSyscall {
    pub(super) fn page_scaled(syscall: &SyscallArgs) -> Self {
        Self {
            page_scaled: true,
            ..Self::from(syscall)
        }
    }
}

impl LinuxSyscallImpl for MMapSyscall {
    fn handle(&self, kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        let offset = if self.page_scaled {
            self.offset * PAGE_SIZE
        } else {
            self.offset
        };
        let Some(prot_bits) = MMapProt::from_bits(self.prot) else {
            log::warn!("mmap with invalid protection bits {:#x}", self.prot);
            return SyscallResult::minus_one();
        };
        let prot = Prot::from_bits_truncate(prot_bits.bits() as u32);
        let flags = MMapFlags::from_bits_truncate(self.flags);
        log::trace!(
            "mmap: addr={:#x}, len={}, prot={:?}, flags={:?}, fd={}, off={:#x}",
            self.addr,
            self.len,
            prot_bits,
            flags,
            self.fd,
            offset
        );

        // with a file descriptor the contents are copied in before the guest
        // sees the mapping
        let mut size = self.len;
        let mut data = None;
        let mut backing = None;
        if self.fd > 0 {
            let Some(file) = kernel.files().get(Fd::new(self.fd as i32)) else {
                log::warn!("invalid mmap of fd {}", self.fd);
                return SyscallResult::minus_one();
            };
            let Some(stat) = file.stat() else {
                return SyscallResult::minus_one();
            };
            if offset > stat.size {
                return SyscallResult::minus_one();
            }
            backing = Some(FileBacking::new(stat.name.clone(), offset, size));
            if size + offset > stat.size {
                size = stat.size - offset;
            }
            // a duplicate handle leaves the guest's file offset untouched
            let dup = kernel.fs().borrow_mut().open(&stat.name);
            let Ok(mut dup) = dup else {
                return SyscallResult::minus_one();
            };
            dup.seek(offset);
            let mut buf = vec![0u8; size as usize];
            let Ok(n) = dup.read(&mut buf) else {
                return SyscallResult::minus_one();
            };
            buf.truncate(n);
            data = Some(buf);
        }

        let fixed = flags.contains(MMapFlags::FIXED);
        let mut hint = self.addr;
        if hint == 0 && !fixed {
            // don't automap memory within 8 MiB of the current program break
            let brk = match ctx.task.brk(ctx.cpu, 0) {
                Ok(b) => b,
                Err(_) => return SyscallResult::minus_one(),
            };
            hint = brk + 0x80_0000;
        }
        let size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let addr = match ctx
            .task
            .mmap(ctx.cpu, hint, size, prot, fixed, "mmap", backing)
        {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("mmap failed: {}", e);
                return SyscallResult::minus_one();
            }
        };
        if let Some(data) = data {
            if ctx.task.mem_write(ctx.cpu, addr, &data).is_err() {
                return SyscallResult::minus_one();
            }
        }
        SyscallResult::success(addr)
    }
}

#[derive(Debug)]
pub struct MProtectSyscall {
    addr: u64,
    len: u64,
    prot: u64,
}

impl From<&SyscallArgs> for MProtectSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            addr: syscall.arg0(),
            len: syscall.arg1(),
            prot: syscall.arg2(),
        }
    }
}

impl LinuxSyscallImpl for MProtectSyscall {
    fn handle(&self, _kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        let prot = if self.prot == 0 {
            // FIXME prot=0 should revoke access, not grant everything
            Prot::ALL
        } else {
            match MMapProt::from_bits(self.prot) {
                Some(bits) => Prot::from_bits_truncate(bits.bits() as u32),
                None => {
                    log::warn!("mprotect with invalid protection bits {:#x}", self.prot);
                    return SyscallResult::minus_one();
                }
            }
        };
        match ctx.task.mem_protect(ctx.cpu, self.addr, self.len, prot) {
            Ok(()) => SyscallResult::success(0),
            Err(_) => SyscallResult::minus_one(),
        }
    }
}

#[derive(Debug)]
pub struct MUnmapSyscall {
    addr: u64,
    len: u64,
}

impl From<&SyscallArgs> for MUnmapSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            addr: syscall.arg0(),
            len: syscall.arg1(),
        }
    }
}

impl LinuxSyscallImpl for MUnmapSyscall {
    fn handle(&self, _kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        match ctx.task.mem_unmap(ctx.cpu, self.addr, self.len) {
            Ok(()) => SyscallResult::success(0),
            Err(_) => SyscallResult::minus_one(),
        }
    }
}

/// Implementation of <https://man7.org/linux/man-pages/man2/brk.2.html>.
#[derive(Debug)]
pub struct BrkSyscall {
    addr: u64,
}

impl From<&SyscallArgs> for BrkSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            addr: syscall.arg0(),
        }
    }
}

impl LinuxSyscallImpl for BrkSyscall {
    fn handle(&self, _kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        log::trace!("brk  in={:#x}", self.addr);
        let brk = match ctx.task.brk(ctx.cpu, self.addr) {
            Ok(brk) => brk,
            Err(_) => return SyscallResult::error(Errno::ENOMEM),
        };
        log::trace!("brk out={:#x}", brk);
        SyscallResult::success(brk)
    }
}
