//! Architecture descriptors and the registry of supported {arch, os} pairs.
//!
//! The registry is built once at program start and passed explicitly to the
//! loader and the task factory; nothing registers itself into global state.

pub mod arm;
pub mod arm64;
pub mod m68k;
pub mod mips;
pub mod sparc;
pub mod x86;
pub mod x86_16;
pub mod x86_64;

use crate::cpu::{Cpu, RegId};
use crate::emu::MachineRef;
use crate::error::EmuError;
use crate::kernel::Kernel;

/// Builds the kernel chain for a task. Runs before `init`, may already map
/// memory (the x86_64 vsyscall page is created here).
pub type KernelsFn = fn(&MachineRef, &mut dyn Cpu) -> Vec<Box<dyn Kernel>>;
/// OS-specific startup: stack contents and syscall trap hooks.
pub type InitFn = fn(&MachineRef, &mut dyn Cpu, &[String], &[String]) -> Result<(), EmuError>;
/// CPU trap dispatch.
pub type InterruptFn = fn(&MachineRef, &mut dyn Cpu, u32);

pub struct OsDescriptor {
    pub name: &'static str,
    pub kernels: KernelsFn,
    pub init: InitFn,
    pub interrupt: InterruptFn,
}

impl std::fmt::Debug for OsDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<OS {}>", self.name)
    }
}

#[derive(Debug)]
pub struct ArchDescriptor {
    pub name: &'static str,
    pub bits: u32,
    pub pc: RegId,
    pub sp: RegId,
    /// All registers the engine exposes for this arch, for dumps.
    pub regs: &'static [(&'static str, RegId)],
    /// The subset printed by default.
    pub default_regs: &'static [&'static str],
    pub os: &'static [OsDescriptor],
}

impl ArchDescriptor {
    pub fn reg_by_name(&self, name: &str) -> Option<RegId> {
        self.regs
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, id)| *id)
    }

    pub fn reg_name(&self, id: RegId) -> Option<&'static str> {
        self.regs.iter().find(|(_, i)| *i == id).map(|(n, _)| *n)
    }

    /// Reads every known register. `default_only` restricts the dump to
    /// [`Self::default_regs`].
    pub fn reg_dump(&self, cpu: &dyn Cpu, default_only: bool) -> Vec<RegVal> {
        self.regs
            .iter()
            .filter(|(name, _)| !default_only || self.default_regs.contains(name))
            .map(|(name, id)| RegVal {
                name,
                val: cpu.reg_read(*id).unwrap_or(0),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegVal {
    pub name: &'static str,
    pub val: u64,
}

/// The descriptor table of supported {architecture, OS} pairs.
#[derive(Debug)]
pub struct Registry {
    arches: &'static [&'static ArchDescriptor],
}

impl Registry {
    pub fn builtin() -> Self {
        static ARCHES: &[&ArchDescriptor] = &[
            &arm::ARCH,
            &arm64::ARCH,
            &m68k::ARCH,
            &mips::ARCH,
            &sparc::ARCH,
            &x86::ARCH,
            &x86_16::ARCH,
            &x86_64::ARCH,
        ];
        Self { arches: ARCHES }
    }

    pub fn arch(&self, name: &str) -> Option<&'static ArchDescriptor> {
        self.arches.iter().copied().find(|a| a.name == name)
    }

    pub fn get(
        &self,
        arch: &str,
        os: &str,
    ) -> Result<(&'static ArchDescriptor, &'static OsDescriptor), EmuError> {
        let a = self.arch(arch).ok_or_else(|| EmuError::UnsupportedArchOrOs {
            arch: arch.to_string(),
            os: os.to_string(),
        })?;
        let o = a
            .os
            .iter()
            .find(|o| o.name == os)
            .ok_or_else(|| EmuError::UnsupportedArchOrOs {
                arch: arch.to_string(),
                os: os.to_string(),
            })?;
        Ok((a, o))
    }
}

/// Reads the six ABI argument registers. A shorter (or empty) register list
/// yields zeroes for the remaining slots, which matches architectures whose
/// bindings do not name all argument registers.
pub(crate) fn read_abi_regs(cpu: &dyn Cpu, regs: &[RegId]) -> [u64; 6] {
    let mut args = [0u64; 6];
    for (i, reg) in regs.iter().enumerate().take(6) {
        args[i] = cpu.reg_read(*reg).unwrap_or(0);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let registry = Registry::builtin();
        let (arch, os) = registry.get("x86_64", "linux").unwrap();
        assert_eq!(arch.bits, 64);
        assert_eq!(os.name, "linux");
        assert!(registry.get("x86_64", "templeos").is_err());
        assert!(registry.get("z80", "linux").is_err());
    }

    #[test]
    fn test_every_arch_has_pc_and_sp_in_reg_table() {
        let registry = Registry::builtin();
        for name in ["arm", "arm64", "m68k", "mips", "sparc", "x86", "x86_16", "x86_64"] {
            let arch = registry.arch(name).unwrap();
            assert!(
                arch.regs.iter().any(|(_, id)| *id == arch.pc),
                "{}: pc must be part of the register table",
                name
            );
            assert!(
                arch.regs.iter().any(|(_, id)| *id == arch.sp),
                "{}: sp must be part of the register table",
                name
            );
        }
    }

    #[test]
    fn test_default_regs_resolve() {
        let registry = Registry::builtin();
        for arch in ["arm", "x86", "x86_64", "mips"] {
            let a = registry.arch(arch).unwrap();
            for name in a.default_regs {
                assert!(
                    a.reg_by_name(name).is_some(),
                    "{}: default reg {} missing from table",
                    arch,
                    name
                );
            }
        }
    }
}
