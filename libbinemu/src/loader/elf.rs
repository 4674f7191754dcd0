//! ELF loader, built on `elf_rs` program headers.

use crate::cpu::{Endian, Prot};
use crate::error::EmuError;
use crate::loader::{ImageKind, Loader, PhdrInfo, Segment};
use elf_rs::{Elf, ElfFile, ProgramType};
use std::rc::Rc;

const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

pub struct ElfLoader {
    image: Rc<[u8]>,
    arch: &'static str,
    bits: u32,
    order: Endian,
    os: &'static str,
    entry: u64,
    kind: ImageKind,
    interp: Option<String>,
}

impl std::fmt::Debug for ElfLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElfLoader")
            .field("arch", &self.arch)
            .field("bits", &self.bits)
            .field("entry", &(self.entry as *const u8))
            .field("kind", &self.kind)
            .field("interp", &self.interp)
            .finish()
    }
}

impl ElfLoader {
    pub fn new(image: Rc<[u8]>, os_hint: Option<&str>) -> Result<Self, EmuError> {
        Self::with_arch_override(image, os_hint, None)
    }

    /// `arch_override` is used by the CGC loader, whose images always run as
    /// 32-bit x86 regardless of the header.
    pub(super) fn with_arch_override(
        image: Rc<[u8]>,
        os_hint: Option<&str>,
        arch_override: Option<&'static str>,
    ) -> Result<Self, EmuError> {
        if image.len() < 20 {
            return Err(EmuError::LoadError("truncated ELF header".to_string()));
        }
        // class, data and machine come straight from e_ident/e_machine
        let bits = match image[4] {
            1 => 32,
            2 => 64,
            other => {
                return Err(EmuError::LoadError(format!(
                    "bad ELF class {:#x}",
                    other
                )))
            }
        };
        let order = match image[5] {
            1 => Endian::Little,
            2 => Endian::Big,
            other => {
                return Err(EmuError::LoadError(format!(
                    "bad ELF byte order {:#x}",
                    other
                )))
            }
        };
        let read_u16 = |off: usize| -> u16 {
            let raw = [image[off], image[off + 1]];
            match order {
                Endian::Little => u16::from_le_bytes(raw),
                Endian::Big => u16::from_be_bytes(raw),
            }
        };
        let e_type = read_u16(16);
        let e_machine = read_u16(18);

        let kind = match e_type {
            ET_EXEC => ImageKind::Exec,
            ET_DYN => ImageKind::Dyn,
            other => {
                return Err(EmuError::LoadError(format!(
                    "unsupported file load type {:#x}",
                    other
                )))
            }
        };
        let arch = match arch_override {
            Some(a) => a,
            None => machine_to_arch(e_machine).ok_or_else(|| EmuError::UnsupportedArchOrOs {
                arch: format!("elf machine {:#x}", e_machine),
                os: os_hint.unwrap_or("linux").to_string(),
            })?,
        };

        let elf = Elf::from_bytes(&image)
            .map_err(|e| EmuError::LoadError(format!("elf parse failed: {:?}", e)))?;
        let entry = elf.elf_header().entry_point();
        let interp = elf
            .program_header_iter()
            .find(|ph| ph.ph_type() == ProgramType::INTERP)
            .map(|ph| {
                let raw = ph.content();
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                String::from_utf8_lossy(&raw[..end]).into_owned()
            });

        Ok(Self {
            image,
            arch,
            bits,
            order,
            os: intern_os(os_hint),
            entry,
            kind,
            interp,
        })
    }
}

impl Loader for ElfLoader {
    fn arch(&self) -> &'static str {
        self.arch
    }
    fn bits(&self) -> u32 {
        self.bits
    }
    fn byte_order(&self) -> Endian {
        self.order
    }
    fn os(&self) -> &'static str {
        self.os
    }
    fn entry(&self) -> u64 {
        self.entry
    }
    fn kind(&self) -> ImageKind {
        self.kind
    }
    fn interp(&self) -> Option<&str> {
        self.interp.as_deref()
    }

    fn segments(&self) -> Result<Vec<Segment>, EmuError> {
        let elf = Elf::from_bytes(&self.image)
            .map_err(|e| EmuError::LoadError(format!("elf parse failed: {:?}", e)))?;
        let segments = elf
            .program_header_iter()
            .filter(|ph| ph.ph_type() == ProgramType::LOAD)
            .map(|ph| {
                Segment::new(
                    self.image.clone(),
                    ph.vaddr(),
                    ph.memsz(),
                    ph.offset(),
                    ph.filesz(),
                    prot_from_elf_flags(ph.flags().bits() as u32),
                )
            })
            .collect();
        Ok(segments)
    }

    fn phdr_info(&self) -> Option<PhdrInfo> {
        let elf = Elf::from_bytes(&self.image).ok()?;
        let header = elf.elf_header();
        let phoff = header.program_header_offset();
        // the table's virtual address is where a PT_LOAD segment maps its
        // file offset
        let vaddr = elf
            .program_header_iter()
            .filter(|ph| ph.ph_type() == ProgramType::LOAD)
            .find(|ph| ph.offset() <= phoff && phoff < ph.offset() + ph.filesz())
            .map(|ph| ph.vaddr() + (phoff - ph.offset()))?;
        Some(PhdrInfo {
            vaddr,
            entry_size: header.program_header_entry_size() as u64,
            count: header.program_header_entry_num() as u64,
        })
    }
}

/// ELF segment flag bits are X=1, W=2, R=4.
pub(super) fn prot_from_elf_flags(flags: u32) -> Prot {
    let mut prot = Prot::NONE;
    if flags & 4 != 0 {
        prot |= Prot::READ;
    }
    if flags & 2 != 0 {
        prot |= Prot::WRITE;
    }
    if flags & 1 != 0 {
        prot |= Prot::EXEC;
    }
    prot
}

fn machine_to_arch(e_machine: u16) -> Option<&'static str> {
    Some(match e_machine {
        2 => "sparc",
        3 => "x86",
        4 => "m68k",
        8 => "mips",
        40 => "arm",
        62 => "x86_64",
        183 => "arm64",
        _ => return None,
    })
}

fn intern_os(hint: Option<&str>) -> &'static str {
    match hint {
        Some("darwin") => "darwin",
        Some("virtual-linux") => "virtual-linux",
        _ => "linux",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::testimg;

    #[test]
    fn test_static_exec_image() {
        let img = testimg::elf64(ET_EXEC, 62, 0x401000, 0x400000, 4 | 1, b"payload", None);
        let loader = ElfLoader::new(Rc::from(img.into_boxed_slice()), None).unwrap();
        assert_eq!(loader.arch(), "x86_64");
        assert_eq!(loader.bits(), 64);
        assert_eq!(loader.byte_order(), Endian::Little);
        assert_eq!(loader.kind(), ImageKind::Exec);
        assert_eq!(loader.entry(), 0x401000);
        assert!(loader.interp().is_none());

        let segments = loader.segments().unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].addr, 0x400000);
        assert_eq!(segments[0].prot, Prot::READ | Prot::EXEC);
        assert!(segments[0].data().ends_with(b"payload"));
    }

    #[test]
    fn test_dyn_image_with_interp() {
        let img = testimg::elf64(
            ET_DYN,
            62,
            0x1040,
            0x0,
            4 | 1,
            b"code",
            Some("/lib64/ld-linux-x86-64.so.2"),
        );
        let loader = ElfLoader::new(Rc::from(img.into_boxed_slice()), None).unwrap();
        assert_eq!(loader.kind(), ImageKind::Dyn);
        assert_eq!(loader.interp(), Some("/lib64/ld-linux-x86-64.so.2"));
    }

    #[test]
    fn test_phdr_info_points_into_load_segment() {
        let img = testimg::elf64(ET_EXEC, 62, 0x401000, 0x400000, 4, b"x", None);
        let loader = ElfLoader::new(Rc::from(img.into_boxed_slice()), None).unwrap();
        let info = loader.phdr_info().unwrap();
        assert_eq!(info.vaddr, 0x400040, "phdr table sits right after the ehdr");
        assert_eq!(info.entry_size, 56);
        assert_eq!(info.count, 1);
    }

    #[test]
    fn test_unknown_machine_is_unsupported() {
        let img = testimg::elf64(ET_EXEC, 0x1234, 0, 0, 4, b"", None);
        assert!(matches!(
            ElfLoader::new(Rc::from(img.into_boxed_slice()), None),
            Err(EmuError::UnsupportedArchOrOs { .. })
        ));
    }
}
