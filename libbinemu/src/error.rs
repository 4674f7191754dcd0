use crate::cpu::CpuError;

/// Error taxonomy of the emulator core.
///
/// Loader, bootstrap and address-space errors surface to the caller of
/// [`crate::emu::Emu::run`]. Syscall handlers never raise: they encode
/// failures as `-1` (or `-errno`) in the guest return register.
/// [`EmuError::ExitStatus`] is not truly an error, it carries the guest exit
/// code up the stack.
#[derive(Debug, thiserror::Error)]
pub enum EmuError {
    #[error("could not identify file magic")]
    UnknownMagic,
    #[error("arch {arch:?} / os {os:?} is not supported")]
    UnsupportedArchOrOs { arch: String, os: String },
    #[error("unable to load image: {0}")]
    LoadError(String),
    #[error("out of guest address space")]
    OutOfAddressSpace,
    #[error("invalid protection bits {0:#x}")]
    InvalidProtection(u32),
    #[error("invalid file descriptor {0}")]
    InvalidFd(i32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no kernel handles syscall {num} ({name})")]
    UnhandledSyscall { num: u64, name: String },
    #[error("guest fault: {0}")]
    GuestFault(String),
    #[error("cpu engine: {0}")]
    Cpu(#[from] CpuError),
    #[error("guest exited with status {0}")]
    ExitStatus(u64),
}

impl EmuError {
    /// The guest exit code, if this is a clean guest exit.
    pub fn exit_code(&self) -> Option<u64> {
        match self {
            Self::ExitStatus(code) => Some(*code),
            _ => None,
        }
    }
}
