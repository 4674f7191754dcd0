//! A CPU engine stub.
//!
//! It implements the full memory, register, hook and context contract, but
//! executes no machine code: [`Cpu::start`] consumes a queued list of
//! [`ScriptOp`]s instead. That is enough to drive loaders, the address
//! space, stack setup and the whole syscall surface, which is exactly what
//! the test-suite does. Running real guests needs a hardware engine behind
//! the same trait.

use crate::arch::ArchDescriptor;
use crate::cpu::{
    Cpu, CpuContext, CpuError, HookCallback, HookHandle, MemAccess, MemRegion, Prot, RegId,
};
use crate::mem::{MemSim, Page};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

const PAGE_SIZE: u64 = 0x1000;

/// One scripted step of guest execution.
#[derive(Debug, Clone)]
pub enum ScriptOp {
    /// Fetch at an address: checks EXEC protection and fires code hooks.
    Exec(u64),
    /// Raise a CPU interrupt.
    Intr(u32),
    /// Execute an instruction that has instruction hooks (e.g. `syscall`).
    Insn(u32),
    /// Load a register with an immediate.
    SetReg(RegId, u64),
    /// Guest load of `size` bytes into a register (low bytes, little-endian).
    Load { addr: u64, size: u32, reg: RegId },
    /// Guest store of a register's low `size` bytes.
    Store { addr: u64, size: u32, reg: RegId },
    /// Stop as if the end address was reached.
    Halt,
}

/// Handle for appending script steps while the engine is owned as a boxed
/// [`Cpu`].
#[derive(Debug, Clone)]
pub struct ScriptFeeder(Rc<RefCell<VecDeque<ScriptOp>>>);

impl ScriptFeeder {
    pub fn push(&self, ops: impl IntoIterator<Item = ScriptOp>) {
        self.0.borrow_mut().extend(ops);
    }
}

struct HookEntry {
    begin: u64,
    end: u64,
    callback: Option<HookCallback>,
}

pub struct ScriptedCpu {
    pc_reg: RegId,
    regs: BTreeMap<RegId, u64>,
    sim: MemSim,
    /// Lazily allocated page contents; unwritten mapped pages read as zero.
    chunks: BTreeMap<u64, Box<[u8]>>,
    hooks: BTreeMap<HookHandle, HookEntry>,
    next_hook: HookHandle,
    script: Rc<RefCell<VecDeque<ScriptOp>>>,
    stopped: bool,
    msrs: BTreeMap<u32, u64>,
}

impl std::fmt::Debug for ScriptedCpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedCpu")
            .field("regions", &self.sim.mem().len())
            .field("hooks", &self.hooks.len())
            .field("script", &self.script.borrow().len())
            .finish()
    }
}

impl ScriptedCpu {
    pub fn new(arch: &ArchDescriptor) -> Self {
        Self {
            pc_reg: arch.pc,
            regs: BTreeMap::new(),
            sim: MemSim::new(),
            chunks: BTreeMap::new(),
            hooks: BTreeMap::new(),
            next_hook: 1,
            script: Rc::new(RefCell::new(VecDeque::new())),
            stopped: false,
            msrs: BTreeMap::new(),
        }
    }

    /// Appends steps for the next [`Cpu::start`] to execute.
    pub fn script(&mut self, ops: impl IntoIterator<Item = ScriptOp>) {
        self.script.borrow_mut().extend(ops);
    }

    /// A cloneable handle to the script queue, usable after the engine is
    /// boxed away behind the [`Cpu`] trait.
    pub fn feeder(&self) -> ScriptFeeder {
        ScriptFeeder(self.script.clone())
    }

    pub fn msr_read(&self, msr: u32) -> Option<u64> {
        self.msrs.get(&msr).copied()
    }

    fn page_of(&self, addr: u64) -> Option<&Page> {
        self.sim.mem().find(addr)
    }

    // Hook dispatch takes a callback out of the table while it runs, so the
    // callback can add or remove hooks (including itself) freely.

    fn run_code_hooks(&mut self, addr: u64) {
        let handles: Vec<HookHandle> = self
            .hooks
            .iter()
            .filter(|(_, e)| {
                in_range(e, addr)
                    && matches!(
                        e.callback,
                        Some(HookCallback::Code(_)) | Some(HookCallback::Block(_))
                    )
            })
            .map(|(h, _)| *h)
            .collect();
        for handle in handles {
            let Some(mut cb) = self.hooks.get_mut(&handle).and_then(|e| e.callback.take()) else {
                continue;
            };
            match &mut cb {
                HookCallback::Code(f) | HookCallback::Block(f) => f(self, addr, 1),
                _ => {}
            }
            if let Some(entry) = self.hooks.get_mut(&handle) {
                entry.callback = Some(cb);
            }
        }
    }

    fn run_interrupt_hooks(&mut self, intno: u32) {
        let handles: Vec<HookHandle> = self
            .hooks
            .iter()
            .filter(|(_, e)| matches!(e.callback, Some(HookCallback::Interrupt(_))))
            .map(|(h, _)| *h)
            .collect();
        for handle in handles {
            let Some(mut cb) = self.hooks.get_mut(&handle).and_then(|e| e.callback.take()) else {
                continue;
            };
            if let HookCallback::Interrupt(f) = &mut cb {
                f(self, intno);
            }
            if let Some(entry) = self.hooks.get_mut(&handle) {
                entry.callback = Some(cb);
            }
        }
    }

    fn run_insn_hooks(&mut self, insn: u32) {
        let handles: Vec<HookHandle> = self
            .hooks
            .iter()
            .filter(|(_, e)| match &e.callback {
                Some(HookCallback::Instruction(id, _)) => *id == insn,
                _ => false,
            })
            .map(|(h, _)| *h)
            .collect();
        for handle in handles {
            let Some(mut cb) = self.hooks.get_mut(&handle).and_then(|e| e.callback.take()) else {
                continue;
            };
            if let HookCallback::Instruction(_, f) = &mut cb {
                f(self);
            }
            if let Some(entry) = self.hooks.get_mut(&handle) {
                entry.callback = Some(cb);
            }
        }
    }

    /// Runs the memory-error hooks; `true` means some hook recovered the
    /// fault and execution may continue.
    fn run_mem_err_hooks(&mut self, access: MemAccess, addr: u64, size: usize) -> bool {
        let handles: Vec<HookHandle> = self
            .hooks
            .iter()
            .filter(|(_, e)| matches!(e.callback, Some(HookCallback::MemErr(_))))
            .map(|(h, _)| *h)
            .collect();
        let mut handled = false;
        for handle in handles {
            let Some(mut cb) = self.hooks.get_mut(&handle).and_then(|e| e.callback.take()) else {
                continue;
            };
            if let HookCallback::MemErr(f) = &mut cb {
                handled |= f(self, access, addr, size, 0);
            }
            if let Some(entry) = self.hooks.get_mut(&handle) {
                entry.callback = Some(cb);
            }
        }
        handled
    }

    fn guest_access(
        &mut self,
        addr: u64,
        size: u32,
        need: Prot,
        unmapped: MemAccess,
        prot_err: MemAccess,
    ) -> Result<(), CpuError> {
        let prot = self.page_of(addr).map(|p| p.prot);
        match prot {
            None => {
                if !self.run_mem_err_hooks(unmapped, addr, size as usize) {
                    return Err(CpuError::Unmapped(addr));
                }
            }
            Some(p) if !p.contains(need) => {
                if !self.run_mem_err_hooks(prot_err, addr, size as usize) {
                    return Err(CpuError::Protection(addr));
                }
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn step(&mut self, op: ScriptOp) -> Result<(), CpuError> {
        match op {
            ScriptOp::Exec(addr) => {
                self.reg_write(self.pc_reg, addr)?;
                self.guest_access(
                    addr,
                    1,
                    Prot::EXEC,
                    MemAccess::FetchUnmapped,
                    MemAccess::FetchProt,
                )?;
                self.run_code_hooks(addr);
            }
            ScriptOp::Intr(intno) => self.run_interrupt_hooks(intno),
            ScriptOp::Insn(insn) => self.run_insn_hooks(insn),
            ScriptOp::SetReg(reg, val) => self.reg_write(reg, val)?,
            ScriptOp::Load { addr, size, reg } => {
                self.guest_access(
                    addr,
                    size,
                    Prot::READ,
                    MemAccess::ReadUnmapped,
                    MemAccess::ReadProt,
                )?;
                let mut buf = [0u8; 8];
                self.mem_read_into(&mut buf[..size as usize], addr)?;
                self.reg_write(reg, u64::from_le_bytes(buf))?;
            }
            ScriptOp::Store { addr, size, reg } => {
                self.guest_access(
                    addr,
                    size,
                    Prot::WRITE,
                    MemAccess::WriteUnmapped,
                    MemAccess::WriteProt,
                )?;
                let val = self.reg_read(reg)?.to_le_bytes();
                self.mem_write(addr, &val[..size as usize])?;
            }
            ScriptOp::Halt => self.stopped = true,
        }
        Ok(())
    }
}

fn in_range(entry: &HookEntry, addr: u64) -> bool {
    // begin > end means "all addresses", matching the 1,0 convention
    entry.begin > entry.end || (addr >= entry.begin && addr < entry.end)
}

impl Cpu for ScriptedCpu {
    fn mem_map(&mut self, addr: u64, size: u64, prot: Prot) -> Result<(), CpuError> {
        if addr % PAGE_SIZE != 0 || size == 0 || size % PAGE_SIZE != 0 {
            return Err(CpuError::Mapping { addr, size });
        }
        if !self.sim.mem().find_range(addr, size).is_empty() {
            return Err(CpuError::Mapping { addr, size });
        }
        self.sim.add(Page::new(addr, size, prot));
        Ok(())
    }

    fn mem_protect(&mut self, addr: u64, size: u64, prot: Prot) -> Result<(), CpuError> {
        self.sim.prot(addr, size, prot);
        Ok(())
    }

    fn mem_unmap(&mut self, addr: u64, size: u64) -> Result<(), CpuError> {
        self.sim.unmap(addr, size);
        let doomed: Vec<u64> = self
            .chunks
            .range(addr..addr + size)
            .map(|(a, _)| *a)
            .collect();
        for a in doomed {
            self.chunks.remove(&a);
        }
        Ok(())
    }

    fn regions(&self) -> Vec<MemRegion> {
        self.sim
            .mem()
            .iter()
            .map(|p| MemRegion {
                addr: p.addr,
                size: p.size,
                prot: p.prot,
            })
            .collect()
    }

    fn mem_read_into(&mut self, buf: &mut [u8], addr: u64) -> Result<(), CpuError> {
        let mut pos = 0usize;
        while pos < buf.len() {
            let a = addr + pos as u64;
            if self.page_of(a).is_none() {
                return Err(CpuError::Unmapped(a));
            }
            let page_base = a & !(PAGE_SIZE - 1);
            let off = (a - page_base) as usize;
            let n = ((PAGE_SIZE as usize) - off).min(buf.len() - pos);
            match self.chunks.get(&page_base) {
                Some(chunk) => buf[pos..pos + n].copy_from_slice(&chunk[off..off + n]),
                None => buf[pos..pos + n].fill(0),
            }
            pos += n;
        }
        Ok(())
    }

    fn mem_write(&mut self, addr: u64, data: &[u8]) -> Result<(), CpuError> {
        let mut pos = 0usize;
        while pos < data.len() {
            let a = addr + pos as u64;
            if self.page_of(a).is_none() {
                return Err(CpuError::Unmapped(a));
            }
            let page_base = a & !(PAGE_SIZE - 1);
            let off = (a - page_base) as usize;
            let n = ((PAGE_SIZE as usize) - off).min(data.len() - pos);
            let chunk = self
                .chunks
                .entry(page_base)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            chunk[off..off + n].copy_from_slice(&data[pos..pos + n]);
            pos += n;
        }
        Ok(())
    }

    fn reg_read(&self, reg: RegId) -> Result<u64, CpuError> {
        Ok(self.regs.get(&reg).copied().unwrap_or(0))
    }

    fn reg_write(&mut self, reg: RegId, val: u64) -> Result<(), CpuError> {
        self.regs.insert(reg, val);
        Ok(())
    }

    fn start(&mut self, pc: u64, _until: u64) -> Result<(), CpuError> {
        self.stopped = false;
        self.reg_write(self.pc_reg, pc)?;
        if self.script.borrow().is_empty() {
            return Err(CpuError::Exhausted);
        }
        while !self.stopped {
            let op = self.script.borrow_mut().pop_front();
            let Some(op) = op else {
                break;
            };
            self.step(op)?;
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.stopped = true;
    }

    fn hook_add(
        &mut self,
        begin: u64,
        end: u64,
        callback: HookCallback,
    ) -> Result<HookHandle, CpuError> {
        let handle = self.next_hook;
        self.next_hook += 1;
        self.hooks.insert(
            handle,
            HookEntry {
                begin,
                end,
                callback: Some(callback),
            },
        );
        Ok(handle)
    }

    fn hook_del(&mut self, handle: HookHandle) {
        self.hooks.remove(&handle);
    }

    fn context_save(&self) -> CpuContext {
        CpuContext(self.regs.iter().map(|(r, v)| (*r, *v)).collect())
    }

    fn context_restore(&mut self, ctx: &CpuContext) {
        for (reg, val) in &ctx.0 {
            self.regs.insert(*reg, *val);
        }
    }

    fn msr_write(&mut self, msr: u32, val: u64) -> Result<(), CpuError> {
        self.msrs.insert(msr, val);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn cpu() -> ScriptedCpu {
        ScriptedCpu::new(&x86_64::ARCH)
    }

    #[test]
    fn test_mem_rw_lazy_pages() {
        let mut c = cpu();
        c.mem_map(0x1000, 0x3000, Prot::ALL).unwrap();
        let mut buf = [0xffu8; 8];
        c.mem_read_into(&mut buf, 0x1ffc).unwrap();
        assert_eq!(buf, [0; 8], "unwritten mapped memory reads as zero");
        c.mem_write(0x1ffc, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        c.mem_read_into(&mut buf, 0x1ffc).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8], "writes span page boundaries");
        assert!(c.mem_read_into(&mut buf, 0x4000).is_err());
    }

    #[test]
    fn test_interrupt_hook_dispatch() {
        let mut c = cpu();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        c.hook_add(
            1,
            0,
            HookCallback::Interrupt(Box::new(move |_cpu, intno| {
                seen2.borrow_mut().push(intno);
            })),
        )
        .unwrap();
        c.script([ScriptOp::Intr(0x80), ScriptOp::Intr(3), ScriptOp::Halt]);
        c.start(0, u64::MAX).unwrap();
        assert_eq!(seen.borrow().as_slice(), &[0x80, 3]);
    }

    #[test]
    fn test_code_hook_range() {
        let mut c = cpu();
        c.mem_map(0x1000, 0x2000, Prot::READ | Prot::EXEC).unwrap();
        let hits = Rc::new(RefCell::new(Vec::new()));
        let hits2 = hits.clone();
        c.hook_add(
            0x1000,
            0x2000,
            HookCallback::Code(Box::new(move |_c, addr, _size| {
                hits2.borrow_mut().push(addr);
            })),
        )
        .unwrap();
        c.script([ScriptOp::Exec(0x1800), ScriptOp::Exec(0x2800)]);
        c.start(0x1800, u64::MAX).unwrap();
        assert_eq!(hits.borrow().as_slice(), &[0x1800], "hook only fires in range");
    }

    #[test]
    fn test_unhandled_fetch_fault_stops() {
        let mut c = cpu();
        c.script([ScriptOp::Exec(0xdead_0000)]);
        assert!(matches!(
            c.start(0xdead_0000, u64::MAX),
            Err(CpuError::Unmapped(_))
        ));
    }

    #[test]
    fn test_mem_err_hook_recovers() {
        let mut c = cpu();
        c.hook_add(
            1,
            0,
            HookCallback::MemErr(Box::new(|_c, _access, _addr, _size, _val| true)),
        )
        .unwrap();
        c.script([ScriptOp::Exec(0xdead_0000), ScriptOp::Halt]);
        c.start(0xdead_0000, u64::MAX)
            .expect("handled fault continues");
    }

    #[test]
    fn test_store_respects_prot() {
        let mut c = cpu();
        c.mem_map(0x1000, 0x1000, Prot::READ).unwrap();
        c.reg_write(x86_64::regs::RAX, 0x41).unwrap();
        c.script([ScriptOp::Store {
            addr: 0x1000,
            size: 1,
            reg: x86_64::regs::RAX,
        }]);
        assert!(matches!(
            c.start(0, u64::MAX),
            Err(CpuError::Protection(0x1000))
        ));
    }
}
