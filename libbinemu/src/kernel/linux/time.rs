//! Time-related syscalls, also reachable through the x86_64 vsyscall page.

use crate::kernel::linux::{LinuxKernel, LinuxSyscallImpl};
use crate::kernel::{SysCtx, SyscallArgs, SyscallResult};
use std::time::{SystemTime, UNIX_EPOCH};

fn now() -> (u64, u64) {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs(), d.subsec_nanos() as u64),
        Err(_) => (0, 0),
    }
}

#[derive(Debug)]
pub struct GetTimeOfDaySyscall {
    tv: u64,
    tz: u64,
}

impl From<&SyscallArgs> for GetTimeOfDaySyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            tv: syscall.arg0(),
            tz: syscall.arg1(),
        }
    }
}

impl LinuxSyscallImpl for GetTimeOfDaySyscall {
    fn handle(&self, _kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        let (secs, nanos) = now();
        if self.tv != 0 {
            let wide = ctx.task.bits() == 64;
            let mut w = ctx.struct_writer();
            if wide {
                w.u64(secs).u64(nanos / 1000);
            } else {
                w.u32(secs as u32).u32((nanos / 1000) as u32);
            }
            let raw = w.finish();
            if ctx.write_bytes(self.tv, &raw).is_err() {
                return SyscallResult::minus_one();
            }
        }
        if self.tz != 0 {
            // the timezone struct is obsolete, zero it
            let zeros = [0u8; 8];
            if ctx.write_bytes(self.tz, &zeros).is_err() {
                return SyscallResult::minus_one();
            }
        }
        SyscallResult::success(0)
    }
}

#[derive(Debug)]
pub struct TimeSyscall {
    tloc: u64,
}

impl From<&SyscallArgs> for TimeSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            tloc: syscall.arg0(),
        }
    }
}

impl LinuxSyscallImpl for TimeSyscall {
    fn handle(&self, _kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        let (secs, _) = now();
        if self.tloc != 0 {
            let raw = ctx.task.pack_addr(secs);
            if ctx.write_bytes(self.tloc, &raw).is_err() {
                return SyscallResult::minus_one();
            }
        }
        SyscallResult::success(secs)
    }
}

#[derive(Debug)]
pub struct ClockGetTimeSyscall {
    clockid: u64,
    tp: u64,
}

impl From<&SyscallArgs> for ClockGetTimeSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            clockid: syscall.arg0(),
            tp: syscall.arg1(),
        }
    }
}

impl LinuxSyscallImpl for ClockGetTimeSyscall {
    fn handle(&self, _kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        log::trace!("clock_gettime({})", self.clockid);
        let (secs, nanos) = now();
        if self.tp != 0 {
            let wide = ctx.task.bits() == 64;
            let mut w = ctx.struct_writer();
            if wide {
                w.u64(secs).u64(nanos);
            } else {
                w.u32(secs as u32).u32(nanos as u32);
            }
            let raw = w.finish();
            if ctx.write_bytes(self.tp, &raw).is_err() {
                return SyscallResult::minus_one();
            }
        }
        SyscallResult::success(0)
    }
}

/// `getcpu`: a single virtual CPU in node 0.
#[derive(Debug)]
pub struct GetCpuSyscall {
    cpu: u64,
    node: u64,
}

impl From<&SyscallArgs> for GetCpuSyscall {
    fn from(syscall: &SyscallArgs) -> Self {
        Self {
            cpu: syscall.arg0(),
            node: syscall.arg1(),
        }
    }
}

impl LinuxSyscallImpl for GetCpuSyscall {
    fn handle(&self, _kernel: &mut LinuxKernel, ctx: &mut SysCtx<'_>) -> SyscallResult {
        let zero = [0u8; 4];
        for ptr in [self.cpu, self.node] {
            if ptr != 0 && ctx.write_bytes(ptr, &zero).is_err() {
                return SyscallResult::minus_one();
            }
        }
        SyscallResult::success(0)
    }
}
