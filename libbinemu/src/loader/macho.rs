//! Mach-O loader. Single-arch 32/64-bit images, both byte orders.
//!
//! The format is simple enough to read directly: a fixed header followed by
//! load commands, of which only segments, the dynamic linker path and the
//! entry point commands matter here.

use crate::cpu::{Endian, Prot};
use crate::error::EmuError;
use crate::loader::{ImageKind, Loader, Segment};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::rc::Rc;

const MH_MAGIC: u32 = 0xfeed_face;
const MH_MAGIC_64: u32 = 0xfeed_facf;

const MH_EXECUTE: u32 = 2;
const MH_DYLIB: u32 = 6;
const MH_DYLINKER: u32 = 7;
const MH_BUNDLE: u32 = 8;

const LC_SEGMENT: u32 = 0x1;
const LC_UNIXTHREAD: u32 = 0x5;
const LC_LOAD_DYLINKER: u32 = 0xe;
const LC_SEGMENT_64: u32 = 0x19;
const LC_MAIN: u32 = 0x8000_0028;

const CPU_TYPE_X86: u32 = 7;
const CPU_TYPE_X86_64: u32 = 0x0100_0007;
const CPU_TYPE_ARM: u32 = 12;
const CPU_TYPE_ARM64: u32 = 0x0100_000c;

pub struct MachOLoader {
    image: Rc<[u8]>,
    arch: &'static str,
    bits: u32,
    order: Endian,
    entry: u64,
    kind: ImageKind,
    interp: Option<String>,
    segments: Vec<RawSegment>,
}

#[derive(Debug, Clone, Copy)]
struct RawSegment {
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    prot: Prot,
}

impl std::fmt::Debug for MachOLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachOLoader")
            .field("arch", &self.arch)
            .field("bits", &self.bits)
            .field("entry", &(self.entry as *const u8))
            .field("segments", &self.segments.len())
            .finish()
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    big: bool,
}

impl<'a> Reader<'a> {
    fn u32(&self, off: usize) -> Result<u32, EmuError> {
        let raw = self
            .buf
            .get(off..off + 4)
            .ok_or_else(|| EmuError::LoadError("truncated Mach-O".to_string()))?;
        Ok(if self.big {
            BigEndian::read_u32(raw)
        } else {
            LittleEndian::read_u32(raw)
        })
    }

    fn u64(&self, off: usize) -> Result<u64, EmuError> {
        let raw = self
            .buf
            .get(off..off + 8)
            .ok_or_else(|| EmuError::LoadError("truncated Mach-O".to_string()))?;
        Ok(if self.big {
            BigEndian::read_u64(raw)
        } else {
            LittleEndian::read_u64(raw)
        })
    }
}

impl MachOLoader {
    pub fn new(image: Rc<[u8]>) -> Result<Self, EmuError> {
        if image.len() < 28 {
            return Err(EmuError::LoadError("truncated Mach-O header".to_string()));
        }
        let raw_magic = BigEndian::read_u32(&image[..4]);
        let (bits64, big) = match raw_magic {
            MH_MAGIC => (false, true),
            MH_MAGIC_64 => (true, true),
            m if m.swap_bytes() == MH_MAGIC => (false, false),
            m if m.swap_bytes() == MH_MAGIC_64 => (true, false),
            _ => return Err(EmuError::UnknownMagic),
        };
        let r = Reader { buf: &image, big };
        let cputype = r.u32(4)?;
        let filetype = r.u32(12)?;
        let ncmds = r.u32(16)?;
        let (arch, bits) = match cputype {
            CPU_TYPE_X86 => ("x86", 32),
            CPU_TYPE_X86_64 => ("x86_64", 64),
            CPU_TYPE_ARM => ("arm", 32),
            CPU_TYPE_ARM64 => ("arm64", 64),
            other => {
                return Err(EmuError::UnsupportedArchOrOs {
                    arch: format!("mach-o cputype {:#x}", other),
                    os: "darwin".to_string(),
                })
            }
        };
        debug_assert_eq!(bits, if bits64 { 64 } else { 32 });
        let kind = match filetype {
            MH_EXECUTE => ImageKind::Exec,
            MH_DYLIB | MH_DYLINKER | MH_BUNDLE => ImageKind::Dyn,
            other => {
                return Err(EmuError::LoadError(format!(
                    "unsupported mach-o filetype {:#x}",
                    other
                )))
            }
        };

        let header_size = if bits64 { 32 } else { 28 };
        let mut off = header_size;
        let mut segments = Vec::new();
        let mut entry = 0u64;
        let mut entry_is_file_off = false;
        let mut interp = None;
        let mut text_base = None;

        for _ in 0..ncmds {
            let cmd = r.u32(off)?;
            let cmdsize = r.u32(off + 4)? as usize;
            if cmdsize < 8 {
                return Err(EmuError::LoadError("bad load command size".to_string()));
            }
            match cmd {
                LC_SEGMENT | LC_SEGMENT_64 => {
                    let wide = cmd == LC_SEGMENT_64;
                    let name_end = off + 8 + 16;
                    let name = &image[off + 8..name_end];
                    let (vmaddr, vmsize, fileoff, filesize, initprot) = if wide {
                        (
                            r.u64(name_end)?,
                            r.u64(name_end + 8)?,
                            r.u64(name_end + 16)?,
                            r.u64(name_end + 24)?,
                            r.u32(name_end + 36)?,
                        )
                    } else {
                        (
                            r.u32(name_end)? as u64,
                            r.u32(name_end + 4)? as u64,
                            r.u32(name_end + 8)? as u64,
                            r.u32(name_end + 12)? as u64,
                            r.u32(name_end + 20)?,
                        )
                    };
                    if name.starts_with(b"__PAGEZERO") {
                        off += cmdsize;
                        continue;
                    }
                    if name.starts_with(b"__TEXT") {
                        text_base = Some(vmaddr);
                    }
                    if vmsize > 0 {
                        segments.push(RawSegment {
                            vmaddr,
                            vmsize,
                            fileoff,
                            filesize,
                            // VM_PROT bits already match R=1 W=2 X=4
                            prot: Prot::from_bits_truncate(initprot & 7),
                        });
                    }
                }
                LC_MAIN => {
                    // entryoff is a file offset into __TEXT
                    entry = r.u64(off + 8)?;
                    entry_is_file_off = true;
                }
                LC_UNIXTHREAD => {
                    // flavor/count, then the register file; the PC slot
                    // depends on the thread state layout
                    let state = off + 16;
                    entry = if bits64 {
                        // x86_THREAD_STATE64: rip is the 17th u64
                        r.u64(state + 16 * 8)?
                    } else {
                        // i386_THREAD_STATE: eip is the 11th u32
                        r.u32(state + 10 * 4)? as u64
                    };
                }
                LC_LOAD_DYLINKER => {
                    let name_off = r.u32(off + 8)? as usize;
                    let raw = &image[off + name_off..off + cmdsize];
                    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                    interp = Some(String::from_utf8_lossy(&raw[..end]).into_owned());
                }
                _ => {}
            }
            off += cmdsize;
        }

        if entry_is_file_off {
            entry += text_base.unwrap_or(0);
        }

        Ok(Self {
            image,
            arch,
            bits,
            order: if big { Endian::Big } else { Endian::Little },
            entry,
            kind,
            interp,
            segments,
        })
    }
}

impl Loader for MachOLoader {
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
        "darwin"
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
        Ok(self
            .segments
            .iter()
            .map(|s| {
                Segment::new(
                    self.image.clone(),
                    s.vmaddr,
                    s.vmsize,
                    s.fileoff,
                    s.filesize,
                    s.prot,
                )
            })
            .collect())
    }
}
