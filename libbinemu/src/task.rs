//! The task: a guest address space plus register and stack helpers.
//!
//! All engine access goes through the `&mut dyn Cpu` handed into each
//! operation; the task itself only owns bookkeeping state. The memory
//! simulator is kept in sync with every mapping change the engine accepts,
//! and registered map hooks observe those changes.

use crate::arch::{ArchDescriptor, OsDescriptor, RegVal};
use crate::cpu::{Cpu, Endian, Prot, RegId};
use crate::error::EmuError;
use crate::mem::{FileBacking, MemSim, Page, Pages};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::rc::Rc;

/// Unit of all address-space bookkeeping.
pub const PAGE_SIZE: u64 = 0x1000;

/// Where the allocator starts walking when the caller has no address
/// preference.
pub const BASE: u64 = 0x100_0000;

pub type MapCb = Box<dyn Fn(u64, u64, Prot, &str, Option<&FileBacking>)>;
pub type UnmapCb = Box<dyn Fn(u64, u64)>;
pub type ProtCb = Box<dyn Fn(u64, u64, Prot)>;

/// Observer of map/unmap/protect operations. Used by tracing collaborators;
/// the core calls them but does not interpret them.
#[derive(Default)]
pub struct MapHook {
    pub map: Option<MapCb>,
    pub unmap: Option<UnmapCb>,
    pub prot: Option<ProtCb>,
}

impl std::fmt::Debug for MapHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<MapHook>")
    }
}

/// Page-aligns a range: the address rounds down, the end rounds up.
pub(crate) fn align(addr: u64, size: u64) -> (u64, u64) {
    let mask = PAGE_SIZE - 1;
    let to = (addr + size + mask) & !mask;
    let aligned = addr & !mask;
    (aligned, to - aligned)
}

#[derive(Debug)]
pub struct Task {
    arch: &'static ArchDescriptor,
    os: &'static OsDescriptor,
    bits: u32,
    /// Guest pointer width in bytes.
    bsz: usize,
    order: Endian,
    memsim: MemSim,
    map_hooks: Vec<Rc<MapHook>>,
    /// Current program break. 0 until the bootstrap computed it.
    brk: u64,
}

impl Task {
    pub fn new(arch: &'static ArchDescriptor, os: &'static OsDescriptor, order: Endian) -> Self {
        Self {
            arch,
            os,
            bits: arch.bits,
            bsz: arch.bits as usize / 8,
            order,
            memsim: MemSim::new(),
            map_hooks: Vec::new(),
            brk: 0,
        }
    }

    pub fn arch(&self) -> &'static ArchDescriptor {
        self.arch
    }
    pub fn os_name(&self) -> &'static str {
        self.os.name
    }
    pub fn os(&self) -> &'static OsDescriptor {
        self.os
    }
    pub fn bits(&self) -> u32 {
        self.bits
    }
    pub fn bsz(&self) -> usize {
        self.bsz
    }
    pub fn byte_order(&self) -> Endian {
        self.order
    }

    pub fn mappings(&self) -> &Pages {
        self.memsim.mem()
    }

    // ---- mapping ----------------------------------------------------------

    pub fn mem_map(
        &mut self,
        cpu: &mut dyn Cpu,
        addr: u64,
        size: u64,
        prot: Prot,
    ) -> Result<(), EmuError> {
        self.mmap(cpu, addr, size, prot, true, "", None).map(|_| ())
    }

    pub fn mem_protect(
        &mut self,
        cpu: &mut dyn Cpu,
        addr: u64,
        size: u64,
        prot: Prot,
    ) -> Result<(), EmuError> {
        let (addr, size) = align(addr, size);
        self.memsim.prot(addr, size, prot);
        cpu.mem_protect(addr, size, prot)?;
        for hook in self.map_hooks.clone() {
            if let Some(cb) = &hook.prot {
                cb(addr, size, prot);
            }
        }
        Ok(())
    }

    pub fn mem_unmap(&mut self, cpu: &mut dyn Cpu, addr: u64, size: u64) -> Result<(), EmuError> {
        let (addr, size) = align(addr, size);
        cpu.mem_unmap(addr, size)?;
        for hook in self.map_hooks.clone() {
            if let Some(cb) = &hook.unmap {
                cb(addr, size);
            }
        }
        self.memsim.unmap(addr, size);
        Ok(())
    }

    /// Finds a page-aligned range. With `fixed` the range is taken as-is and
    /// any overlap is unmapped first; otherwise the allocator walks upward
    /// from the hint (or [`BASE`]) to the first gap that fits.
    pub fn mem_reserve(
        &mut self,
        cpu: &mut dyn Cpu,
        addr: u64,
        size: u64,
        fixed: bool,
    ) -> Result<Page, EmuError> {
        let addr = if addr == 0 && !fixed { BASE } else { addr };
        let (addr, size) = align(addr, size);
        if fixed {
            // the engine may legitimately have nothing mapped here
            let _ = self.mem_unmap(cpu, addr, size);
            return Ok(Page::new(addr, size, Prot::NONE));
        }
        let last_page = (!0u64 >> (64 - self.bits)) - PAGE_SIZE + 2;
        let mut i = addr;
        while i < last_page {
            if self.memsim.mem().find_range(i, size).is_empty() {
                return Ok(Page::new(i, size, Prot::NONE));
            }
            i += PAGE_SIZE;
        }
        Err(EmuError::OutOfAddressSpace)
    }

    /// Maps a range and records it in the simulator. Returns the address the
    /// range landed on.
    pub fn mmap(
        &mut self,
        cpu: &mut dyn Cpu,
        addr: u64,
        size: u64,
        prot: Prot,
        fixed: bool,
        desc: &'static str,
        file: Option<FileBacking>,
    ) -> Result<u64, EmuError> {
        let (aligned, size) = align(addr, size);
        let file = file.map(|mut f| {
            // re-anchor the backing at the aligned page start
            f.off = f.off.wrapping_sub(addr - aligned);
            f
        });
        let mut page = self.mem_reserve(cpu, aligned, size, fixed)?;
        page.prot = prot;
        page.desc = desc;
        page.file = file;
        cpu.mem_map(page.addr, page.size, prot)?;
        let (page_addr, page_size) = (page.addr, page.size);
        for hook in self.map_hooks.clone() {
            if let Some(cb) = &hook.map {
                cb(page_addr, page_size, prot, desc, page.file.as_ref());
            }
        }
        self.memsim.add(page);
        Ok(page_addr)
    }

    /// Anonymous read/write allocation wherever there is room.
    pub fn malloc(
        &mut self,
        cpu: &mut dyn Cpu,
        size: u64,
        desc: &'static str,
    ) -> Result<u64, EmuError> {
        self.mmap(
            cpu,
            0,
            size,
            Prot::READ | Prot::WRITE,
            false,
            desc,
            None,
        )
    }

    // ---- program break ----------------------------------------------------

    pub fn set_brk(&mut self, brk: u64) {
        self.brk = brk;
    }

    pub fn cur_brk(&self) -> u64 {
        self.brk
    }

    /// `brk(0)` reports the current break; growing maps the missing range
    /// with the protection of the segment containing the break. Shrinking is
    /// silently refused.
    pub fn brk(&mut self, cpu: &mut dyn Cpu, addr: u64) -> Result<u64, EmuError> {
        let cur = self.brk;
        if addr > 0 && addr >= cur {
            let mut prot = Prot::READ | Prot::WRITE;
            let mut base = cur;
            if let Some(page) = self.memsim.mem().find(cur) {
                prot = page.prot;
                base = page.addr + page.size;
            }
            if addr > base {
                self.mmap(cpu, base, addr - base, prot, true, "brk", None)?;
            }
            self.brk = addr;
        }
        Ok(self.brk)
    }

    // ---- guest pointer packing --------------------------------------------

    pub fn pack_addr(&self, n: u64) -> Vec<u8> {
        let mut buf = vec![0u8; self.bsz];
        let n = if self.bsz >= 8 {
            n
        } else {
            n & ((1u64 << (self.bsz * 8)) - 1)
        };
        match self.order {
            Endian::Little => LittleEndian::write_uint(&mut buf, n, self.bsz),
            Endian::Big => BigEndian::write_uint(&mut buf, n, self.bsz),
        }
        buf
    }

    pub fn unpack_addr(&self, buf: &[u8]) -> u64 {
        let n = self.bsz.min(buf.len());
        match self.order {
            Endian::Little => LittleEndian::read_uint(buf, n),
            Endian::Big => BigEndian::read_uint(buf, n),
        }
    }

    // ---- memory access ----------------------------------------------------

    pub fn mem_write(&mut self, cpu: &mut dyn Cpu, addr: u64, p: &[u8]) -> Result<(), EmuError> {
        cpu.mem_write(addr, p)?;
        Ok(())
    }

    pub fn mem_read_into(
        &mut self,
        cpu: &mut dyn Cpu,
        p: &mut [u8],
        addr: u64,
    ) -> Result<(), EmuError> {
        cpu.mem_read_into(p, addr)?;
        Ok(())
    }

    pub fn mem_read(
        &mut self,
        cpu: &mut dyn Cpu,
        addr: u64,
        size: u64,
    ) -> Result<Vec<u8>, EmuError> {
        let mut p = vec![0u8; size as usize];
        self.mem_read_into(cpu, &mut p, addr)?;
        Ok(p)
    }

    // ---- registers and stack ----------------------------------------------

    pub fn reg_read(&self, cpu: &dyn Cpu, reg: RegId) -> Result<u64, EmuError> {
        Ok(cpu.reg_read(reg)?)
    }

    pub fn reg_write(&self, cpu: &mut dyn Cpu, reg: RegId, val: u64) -> Result<(), EmuError> {
        Ok(cpu.reg_write(reg, val)?)
    }

    pub fn reg_dump(&self, cpu: &dyn Cpu) -> Vec<RegVal> {
        self.arch.reg_dump(cpu, true)
    }

    /// Decreases SP by `p.len()`, then writes. Returns the new SP.
    pub fn push_bytes(&mut self, cpu: &mut dyn Cpu, p: &[u8]) -> Result<u64, EmuError> {
        let sp = cpu.reg_read(self.arch.sp)? - p.len() as u64;
        cpu.reg_write(self.arch.sp, sp)?;
        cpu.mem_write(sp, p)?;
        Ok(sp)
    }

    /// Reads at SP, then increments it by `p.len()`.
    pub fn pop_bytes(&mut self, cpu: &mut dyn Cpu, p: &mut [u8]) -> Result<(), EmuError> {
        let sp = cpu.reg_read(self.arch.sp)?;
        cpu.mem_read_into(p, sp)?;
        Ok(cpu.reg_write(self.arch.sp, sp + p.len() as u64)?)
    }

    /// Pushes `n` packed as a `bits/8`-byte unsigned in the task byte order.
    pub fn push(&mut self, cpu: &mut dyn Cpu, n: u64) -> Result<u64, EmuError> {
        let buf = self.pack_addr(n);
        self.push_bytes(cpu, &buf)
    }

    pub fn pop(&mut self, cpu: &mut dyn Cpu) -> Result<u64, EmuError> {
        let mut buf = vec![0u8; self.bsz];
        self.pop_bytes(cpu, &mut buf)?;
        Ok(self.unpack_addr(&buf))
    }

    // ---- map hooks ---------------------------------------------------------

    pub fn hook_map_add(&mut self, hook: MapHook) -> Rc<MapHook> {
        let hook = Rc::new(hook);
        self.map_hooks.push(hook.clone());
        hook
    }

    pub fn hook_map_del(&mut self, hook: &Rc<MapHook>) {
        self.map_hooks.retain(|h| !Rc::ptr_eq(h, hook));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Registry;
    use crate::cpu::scripted::ScriptedCpu;
    use std::cell::RefCell;

    fn task_and_cpu(arch: &str, os: &str) -> (Task, ScriptedCpu) {
        let registry = Registry::builtin();
        let (a, o) = registry.get(arch, os).unwrap();
        let order = if arch == "mips" {
            Endian::Big
        } else {
            Endian::Little
        };
        (Task::new(a, o, order), ScriptedCpu::new(a))
    }

    #[test]
    fn test_align() {
        assert_eq!(align(0x1234, 0x10), (0x1000, 0x1000));
        assert_eq!(align(0x1000, 0x1000), (0x1000, 0x1000));
        assert_eq!(align(0x1fff, 0x2), (0x1000, 0x1000));
        assert_eq!(align(0x1ff0, 0x20), (0x1000, 0x2000));
    }

    #[test]
    fn test_mmap_fixed_and_walk() {
        let (mut task, mut cpu) = task_and_cpu("x86_64", "linux");
        let addr = task
            .mmap(&mut cpu, 0, 0x2000, Prot::ALL, false, "a", None)
            .unwrap();
        assert_eq!(addr, BASE, "first unhinted allocation starts at the base");
        let addr2 = task
            .mmap(&mut cpu, 0, 0x1000, Prot::ALL, false, "b", None)
            .unwrap();
        assert_eq!(addr2, BASE + 0x2000, "allocator walks past the first gap");
        let fixed = task
            .mmap(&mut cpu, BASE, 0x1000, Prot::READ, true, "c", None)
            .unwrap();
        assert_eq!(fixed, BASE, "fixed mapping replaces the overlap");
        assert_eq!(task.mappings().find(BASE).unwrap().prot, Prot::READ);
    }

    #[test]
    fn test_map_unmap_restores_state() {
        let (mut task, mut cpu) = task_and_cpu("x86_64", "linux");
        task.mem_map(&mut cpu, 0x40_0000, 0x3000, Prot::ALL).unwrap();
        let before: Vec<(u64, u64)> = task.mappings().iter().map(|p| (p.addr, p.size)).collect();
        task.mem_map(&mut cpu, 0x50_0000, 0x2000, Prot::READ).unwrap();
        task.mem_unmap(&mut cpu, 0x50_0000, 0x2000).unwrap();
        let after: Vec<(u64, u64)> = task.mappings().iter().map(|p| (p.addr, p.size)).collect();
        assert_eq!(before, after, "map then unmap must revert exactly");
    }

    #[test]
    fn test_protect_fires_hooks_after_engine_accepts() {
        let (mut task, mut cpu) = task_and_cpu("x86_64", "linux");
        task.mem_map(&mut cpu, 0x40_0000, 0x2000, Prot::ALL).unwrap();

        let seen: Rc<RefCell<Vec<(u64, u64, Prot)>>> = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        task.hook_map_add(MapHook {
            prot: Some(Box::new(move |addr, size, prot| {
                seen2.borrow_mut().push((addr, size, prot));
            })),
            ..Default::default()
        });
        task.mem_protect(&mut cpu, 0x40_0000, 0x1000, Prot::READ)
            .unwrap();
        assert_eq!(seen.borrow().as_slice(), &[(0x40_0000, 0x1000, Prot::READ)]);
    }

    #[test]
    fn test_brk_grow_only() {
        let (mut task, mut cpu) = task_and_cpu("x86_64", "linux");
        let b = 0x60_0000;
        task.set_brk(b);
        assert_eq!(task.brk(&mut cpu, 0).unwrap(), b, "brk(0) reports the break");
        let grown = task.brk(&mut cpu, b + 5000).unwrap();
        assert_eq!(grown, b + 5000);
        assert!(
            task.mappings().find(b + 4095).is_some(),
            "the grown range must be mapped"
        );
        assert!(
            task.mappings().find(b + 8200).is_none(),
            "past the rounded break nothing is mapped"
        );
        assert_eq!(
            task.mappings().find(b).unwrap().desc,
            "brk",
            "heap pages carry the brk label"
        );
        assert_eq!(
            task.brk(&mut cpu, b).unwrap(),
            b + 5000,
            "shrinking is silently refused"
        );
    }

    #[test]
    fn test_push_pop_roundtrip_all_widths() {
        for (arch, os, val) in [
            ("x86_64", "linux", 0xdead_beef_cafe_f00du64),
            ("x86", "linux", 0xdead_beefu64),
            ("mips", "linux", 0x1234_5678u64),
        ] {
            let (mut task, mut cpu) = task_and_cpu(arch, os);
            task.mem_map(&mut cpu, 0x7000_0000, 0x10000, Prot::ALL)
                .unwrap();
            cpu.reg_write(task.arch().sp, 0x7000_8000).unwrap();
            task.push(&mut cpu, val).unwrap();
            assert_eq!(
                task.pop(&mut cpu).unwrap(),
                val,
                "{}: push/pop must round-trip",
                arch
            );
            let sp = cpu.reg_read(task.arch().sp).unwrap();
            assert_eq!(sp, 0x7000_8000, "{}: sp must return to start", arch);
        }
    }

    #[test]
    fn test_pack_addr_roundtrip() {
        let (task, _) = task_and_cpu("mips", "linux");
        let buf = task.pack_addr(0x0102_0304);
        assert_eq!(buf, vec![1, 2, 3, 4], "mips packs big-endian");
        assert_eq!(task.unpack_addr(&buf), 0x0102_0304);

        let (task, _) = task_and_cpu("x86_64", "linux");
        for val in [0u64, 1, 0xffff_ffff_ffff_ffff, 0x8000_0000_0000_0000] {
            assert_eq!(task.unpack_addr(&task.pack_addr(val)), val);
        }
    }

    #[test]
    fn test_out_of_address_space() {
        let (mut task, mut cpu) = task_and_cpu("x86", "linux");
        // fill everything from BASE to the 32-bit top
        task.mem_map(&mut cpu, BASE, 0x1_0000_0000 - BASE, Prot::READ)
            .unwrap();
        assert!(matches!(
            task.mmap(&mut cpu, 0, 0x2000, Prot::READ, false, "", None),
            Err(EmuError::OutOfAddressSpace)
        ));
    }

    #[test]
    fn test_file_backing_reanchors_to_page_start() {
        let (mut task, mut cpu) = task_and_cpu("x86_64", "linux");
        let backing = FileBacking::new("/bin/exe", 0x2123, 0x1000);
        task.mmap(
            &mut cpu,
            0x40_0123,
            0x800,
            Prot::READ,
            true,
            "exe",
            Some(backing),
        )
        .unwrap();
        let page = task.mappings().find(0x40_0000).unwrap();
        assert_eq!(
            page.file.as_ref().unwrap().off,
            0x2000,
            "backing offset must follow the page-aligned start"
        );
    }
}
