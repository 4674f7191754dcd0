//! Contract between the emulator core and the CPU engine that executes guest
//! instructions.
//!
//! The engine itself is an external collaborator; the core only relies on the
//! [`Cpu`] trait below. Hook callbacks receive the engine as `&mut dyn Cpu`
//! (the engine hands itself to the callback while it is paused on the same
//! stack frame), shared emulator state reaches the callbacks through
//! `Rc<RefCell<..>>` captures.

pub mod scripted;

bitflags::bitflags! {
    /// Page protection bits, shared with the engine.
    pub struct Prot: u32 {
        const NONE = 0;
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
        const ALL = 1 | 2 | 4;
    }
}

/// Register identifier. The numbering is per-architecture, see the tables in
/// [`crate::arch`]; engines treat the value as an opaque key.
pub type RegId = u32;

/// Handle returned by [`Cpu::hook_add`], used to deregister a hook.
pub type HookHandle = usize;

/// Byte order of the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Instruction identifiers for [`HookCallback::Instruction`] hooks.
pub mod insn {
    pub const X86_SYSCALL: u32 = 1;
    pub const X86_SYSENTER: u32 = 2;
}

/// The kind of memory access that raised a memory-error hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccess {
    ReadUnmapped,
    WriteUnmapped,
    FetchUnmapped,
    ReadProt,
    WriteProt,
    FetchProt,
}

impl MemAccess {
    pub fn describe(self) -> &'static str {
        match self {
            Self::ReadUnmapped | Self::ReadProt => "invalid read",
            Self::WriteUnmapped | Self::WriteProt => "invalid write",
            Self::FetchUnmapped | Self::FetchProt => "invalid fetch",
        }
    }
}

/// A mapped region as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegion {
    pub addr: u64,
    pub size: u64,
    pub prot: Prot,
}

pub type CodeHookFn = Box<dyn FnMut(&mut dyn Cpu, u64, u32)>;
pub type InterruptHookFn = Box<dyn FnMut(&mut dyn Cpu, u32)>;
pub type InstructionHookFn = Box<dyn FnMut(&mut dyn Cpu)>;
pub type MemHookFn = Box<dyn FnMut(&mut dyn Cpu, MemAccess, u64, usize, i64)>;
/// Returns `true` if the fault was handled and execution may continue.
pub type MemErrHookFn = Box<dyn FnMut(&mut dyn Cpu, MemAccess, u64, usize, i64) -> bool>;

/// Hook kinds the core requires from an engine.
pub enum HookCallback {
    /// Basic-block entry.
    Block(CodeHookFn),
    /// Every executed instruction (address, size).
    Code(CodeHookFn),
    /// Valid guest memory reads.
    MemRead(MemHookFn),
    /// Valid guest memory writes.
    MemWrite(MemHookFn),
    /// Invalid accesses (unmapped or protection violation).
    MemErr(MemErrHookFn),
    /// CPU interrupt/trap with its number.
    Interrupt(InterruptHookFn),
    /// A specific instruction, identified by an [`insn`] constant.
    Instruction(u32, InstructionHookFn),
}

impl std::fmt::Debug for HookCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Block(_) => "Block",
            Self::Code(_) => "Code",
            Self::MemRead(_) => "MemRead",
            Self::MemWrite(_) => "MemWrite",
            Self::MemErr(_) => "MemErr",
            Self::Interrupt(_) => "Interrupt",
            Self::Instruction(id, _) => return write!(f, "Instruction({})", id),
        };
        f.write_str(kind)
    }
}

/// Opaque register-file snapshot, see [`Cpu::context_save`].
#[derive(Debug, Clone, Default)]
pub struct CpuContext(pub Vec<(RegId, u64)>);

#[derive(Debug, thiserror::Error)]
pub enum CpuError {
    #[error("cannot map {size:#x} bytes at {addr:#x}")]
    Mapping { addr: u64, size: u64 },
    #[error("unmapped guest memory at {0:#x}")]
    Unmapped(u64),
    #[error("protection violation at {0:#x}")]
    Protection(u64),
    #[error("unknown register {0}")]
    Register(RegId),
    #[error("engine does not support {0}")]
    Unsupported(&'static str),
    #[error("nothing left to execute")]
    Exhausted,
}

/// The CPU engine contract.
pub trait Cpu {
    fn mem_map(&mut self, addr: u64, size: u64, prot: Prot) -> Result<(), CpuError>;
    fn mem_protect(&mut self, addr: u64, size: u64, prot: Prot) -> Result<(), CpuError>;
    fn mem_unmap(&mut self, addr: u64, size: u64) -> Result<(), CpuError>;
    fn regions(&self) -> Vec<MemRegion>;

    fn mem_read_into(&mut self, buf: &mut [u8], addr: u64) -> Result<(), CpuError>;
    fn mem_write(&mut self, addr: u64, data: &[u8]) -> Result<(), CpuError>;

    fn reg_read(&self, reg: RegId) -> Result<u64, CpuError>;
    fn reg_write(&mut self, reg: RegId, val: u64) -> Result<(), CpuError>;

    /// Runs the guest from `pc` until `until` is reached, [`Cpu::stop`] is
    /// called from a hook, or an unhandled fault occurs.
    fn start(&mut self, pc: u64, until: u64) -> Result<(), CpuError>;
    fn stop(&mut self);

    fn hook_add(
        &mut self,
        begin: u64,
        end: u64,
        callback: HookCallback,
    ) -> Result<HookHandle, CpuError>;
    fn hook_del(&mut self, handle: HookHandle);

    fn context_save(&self) -> CpuContext;
    fn context_restore(&mut self, ctx: &CpuContext);

    /// Model-specific register write, only meaningful on x86 engines
    /// (`arch_prctl(ARCH_SET_FS)` programs MSR `0xC0000100`).
    fn msr_write(&mut self, _msr: u32, _val: u64) -> Result<(), CpuError> {
        Err(CpuError::Unsupported("msr writes"))
    }
}
