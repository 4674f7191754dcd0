//! `stat`-family syscalls and the guest `struct stat` layouts.
//!
//! The inode is derived from the MD5 of the file name (first 8 bytes,
//! big-endian), so repeated stats are stable across a run without the
//! filesystem having to track inode numbers. `blksize` is fixed at 1024.
//!
//! The record is re-encoded in an OS/arch-specific layout: Linux generic,
//! Linux x86 32, Linux x86 32-large, Linux x86 64 or Darwin 64. Field
//! order, widths and padding are part of the guest ABI; the writers below
//! spell them out field by field.

use crate::kernel::codec::StructWriter;
use crate::kernel::fd::{Fd, FileStatInfo};
use crate::kernel::linux::{LinuxKernel, LinuxSyscallImpl};
use crate::kernel::{SysCtx, SyscallArgs, SyscallResult};
use md5::{Digest, Md5};

/// Canonical stat record, widened to the largest layout.
#[derive(Debug, Clone, Default)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: i64,
    pub blksize: i64,
    pub blkcnt: i64,
    pub atime: u64,
    pub atime_nsec: u64,
    pub mtime: u64,
    pub mtime_nsec: u64,
    pub ctime: u64,
    pub ctime_nsec: u64,
}

impl Stat {
    /// The stable record for a named file.
    pub fn for_file(info: &FileStatInfo) -> Self {
        let sum = Md5::digest(info.name.as_bytes());
        let ino = u64::from_be_bytes(sum[..8].try_into().expect("md5 is 16 bytes"));
        Self {
            ino,
            size: info.size as i64,
            blksize: 1024,
            mode: info.mode,
            ..Self::default()
        }
    }
}

/// Picks the guest layout and encodes the record.
pub(crate) fn encode_stat(ctx: &SysCtx<'_>, stat: &Stat, large: bool) -> Vec<u8> {
    let os = ctx.task.os_name();
    let bits = ctx.task.bits();
    let arch = ctx.task.arch().name;
    let mut w = ctx.struct_writer();
    match os {
        "linux" | "virtual-linux" => match arch {
            "x86" | "x86_64" => {
                if bits == 64 {
                    write_stat64_x86(&mut w, stat)
                } else if large {
                    write_stat32_x86_large(&mut w, stat)
                } else {
                    write_stat32_x86(&mut w, stat)
                }
            }
            _ => write_stat_generic(&mut w, stat),
        },
        "darwin" => write_stat_darwin64(&mut w, stat),
        other => {
            log::error!("no stat layout for os {:?}, using the generic one", other);
            write_stat_generic(&mut w, stat)
        }
    }
    w.finish()
}

fn write_stat_generic(w: &mut StructWriter, s: &Stat) {
    w.u32(s.dev as u32)
        .u64(s.ino)
        .u32(s.mode)
        .u32(s.nlink as u32)
        .u32(s.uid)
        .u32(s.gid)
        .u32(s.rdev as u32)
        .pad(4)
        .i64(s.size)
        .u32(s.blksize as u32)
        .pad(4)
        .u64(s.blkcnt as u64)
        .u32(s.atime as u32)
        .u32(s.atime_nsec as u32)
        .u32(s.mtime as u32)
        .u32(s.mtime_nsec as u32)
        .u32(s.ctime as u32)
        .u32(s.ctime_nsec as u32)
        .pad(8);
}

fn write_stat32_x86(w: &mut StructWriter, s: &Stat) {
    w.u32(s.dev as u32)
        .u32(s.ino as u32)
        .u16(s.mode as u16)
        .u16(s.nlink as u16)
        .u32(s.uid)
        .u32(s.gid)
        .u32(s.rdev as u32)
        .u32(s.size as u32)
        .u32(s.blksize as u32)
        .u32(s.blkcnt as u32)
        .u32(s.atime as u32)
        .u32(s.atime_nsec as u32)
        .u32(s.mtime as u32)
        .u32(s.mtime_nsec as u32)
        .u32(s.ctime as u32)
        .u32(s.ctime_nsec as u32)
        .u32(0)
        .u32(0);
}

fn write_stat32_x86_large(w: &mut StructWriter, s: &Stat) {
    w.u64(s.dev)
        .pad(4)
        .u32(s.ino as u32)
        .u32(s.mode)
        .u32(s.nlink as u32)
        .u32(s.uid)
        .u32(s.gid)
        .u64(s.rdev)
        .pad(4)
        .i64(s.size)
        .u32(s.blksize as u32)
        .u64(s.blkcnt as u64)
        .u32(s.atime as u32)
        .u32(s.atime_nsec as u32)
        .u32(s.mtime as u32)
        .u32(s.mtime_nsec as u32)
        .u32(s.ctime as u32)
        .u32(s.ctime_nsec as u32)
        .u64(s.ino);
}

fn write_stat64_x86(w: &mut StructWriter, s: &Stat) {
    w.u64(s.dev)
        .u64(s.ino)
        .u64(s.nlink)
        .u32(s.mode)
        .u32(s.uid)
        .u32(s.gid)
        .pad(4)
        .u64(s.rdev)
        .i64(s.size)
        .i64(s.blksize)
        .i64(s.blkcnt)
        .u64(s.atime)
        .u64(s.atime_nsec)
        .u64(s.mtime)
        .u64(s.mtime_nsec)
        .u64(s.ctime)
        .u64(s.ctime_nsec)
        .pad(24);
}

fn write_stat_darwin64(w: &mut StructWriter, s: &Stat) {
    w.i32(s.dev as i32)
        .u16(s.mode as u16)
        .u16(s.nlink as u16)
        .u64(s.ino)
        .u32(s.uid)
        .u32(s.gid)
        .i32(s.rdev as i32)
        .pad(4)
        .i64(s.atime as i64)
        .i64(s.atime_nsec as i64)
        .i64(s.mtime as i64)
        .i64(s.mtime_nsec as i64)
        .i64(s.ctime as i64)
        .i64(s.ctime_nsec as i64)
        .i64(0) // birthtime
        .i64(0)
        .i64(s.size)
        .i64(s.blkcnt)
        .i32(s.blksize as i32)
        .u32(0) // st_flags
        .u32(0) // st_gen
        .i32(0)
        .pad(16);
}

pub(crate) fn handle_stat(
    ctx: &mut SysCtx<'_>,
    info: &FileStatInfo,
    buf: u64,
    large: bool,
) -> SyscallResult {
    let stat = Stat::for_file(info);
    let raw = encode_stat(ctx, &stat, large);
    match ctx.write_bytes(buf, &raw) {
        Ok(()) => SyscallResult::success(0),
        Err(_) => SyscallResult::minus_one(),
    }
}

#[derive(Debug)]
pub struct StatSyscall {
    path: u64,
    buf: u64,
    large: bool,
}

impl From<&SyscallArgs> for StatSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            path: syscall.arg0(),
            buf: syscall.arg1(),
            large: false,
        }
    }
}

impl StatSyscall {
    pub(super) fn large(syscall: &SyscallArgs) -> Self {
        Self {
            large: true,
            ..Self::from(syscall)
        }
    }
}

impl LinuxSyscallImpl for StatSyscall {
    fn handle(&self, kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        let Ok(path) = ctx.read_c_string(self.path) else {
            return SyscallResult::minus_one();
        };
        let handle = kernel.fs().borrow_mut().open(&path);
        match handle {
            Ok(file) => {
                let meta = file.metadata();
                let info = FileStatInfo {
                    name: meta.path().to_string(),
                    size: meta.size(),
                    mode: meta.umode() as u32,
                };
                handle_stat(ctx, &info, self.buf, self.large)
            }
            Err(_) => SyscallResult::minus_one(),
        }
    }
}

#[derive(Debug)]
pub struct FstatSyscall {
    fd: Fd,
    buf: u64,
    large: bool,
}

impl From<&SyscallArgs> for FstatSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            fd: Fd::from(syscall.arg0()),
            buf: syscall.arg1(),
            large: false,
        }
    }
}

impl FstatSyscall {
    pub(super) fn large(syscall: &SyscallArgs) -> Self {
        Self {
            large: true,
            ..Self::from(syscall)
        }
    }
}

impl LinuxSyscallImpl for FstatSyscall {
    fn handle(&self, kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        let Some(file) = kernel.files().get(self.fd) else {
            return SyscallResult::minus_one();
        };
        let Some(info) = file.stat() else {
            return SyscallResult::minus_one();
        };
        handle_stat(ctx, &info, self.buf, self.large)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str) -> FileStatInfo {
        FileStatInfo {
            name: name.to_string(),
            size: 42,
            mode: 0o644,
        }
    }

    #[test]
    fn test_ino_is_stable_and_distinct() {
        let a1 = Stat::for_file(&info("/a"));
        let a2 = Stat::for_file(&info("/a"));
        let b = Stat::for_file(&info("/b"));
        assert_eq!(a1.ino, a2.ino, "same name must produce the same inode");
        assert_ne!(a1.ino, b.ino, "different names must produce different inodes");
        assert_eq!(a1.blksize, 1024);
        assert_eq!(a1.size, 42);
    }

    #[test]
    fn test_layout_sizes() {
        use crate::cpu::Endian;
        let s = Stat::for_file(&info("/x"));

        let mut w = StructWriter::new(Endian::Little);
        write_stat64_x86(&mut w, &s);
        assert_eq!(w.len(), 144, "x86_64 struct stat is 144 bytes");

        let mut w = StructWriter::new(Endian::Little);
        write_stat32_x86(&mut w, &s);
        assert_eq!(w.len(), 64, "i386 struct stat is 64 bytes");

        let mut w = StructWriter::new(Endian::Little);
        write_stat_darwin64(&mut w, &s);
        assert_eq!(w.len(), 144, "darwin 64-bit struct stat is 144 bytes");
    }
}
