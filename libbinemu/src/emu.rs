//! Process bootstrap and the run loop.
//!
//! [`Emu`] owns the CPU engine and the shared [`Machine`] state. Hooks
//! installed on the engine capture the machine behind an `Rc<RefCell<..>>`
//! and receive the engine itself from the callback, so the two never borrow
//! each other.

use crate::arch::{ArchDescriptor, OsDescriptor, Registry};
use crate::cpu::{Cpu, CpuError, HookCallback, Prot};
use crate::error::EmuError;
use crate::kernel::{Kernel, SysCtx, SyscallArgs};
use crate::loader::{loader_for, ImageKind, Loader, Segment};
use crate::mem::FileBacking;
use crate::task::{Task, PAGE_SIZE};
use libramfs::Filesystem;
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

/// The arguments and environment the guest starts with, plus placement
/// knobs.
#[derive(Debug, Default)]
pub struct ExecConfig {
    pub args: Vec<String>,
    pub env: Vec<String>,
    /// OS personality override for ambiguous images.
    pub os_hint: Option<String>,
    /// Forced load bias of the main image (0 = pick one).
    pub force_base: u64,
    /// Forced load bias of the interpreter (raised to `brk + 8 MiB` if too
    /// low).
    pub force_interp_base: u64,
    pub skip_interp: bool,
    /// Redirect guest stdin/stdout to a TCP connection on this port.
    pub stdio_port: Option<u16>,
}

pub type MachineRef = Rc<RefCell<Machine>>;

/// Consulted after every `start` return; may rewrite PC/SP and resume
/// instead of exiting.
pub type RestartFn =
    Box<dyn FnMut(&mut Machine, &mut dyn Cpu, Option<EmuError>) -> Result<(), EmuError>>;

/// Host callback run while the CPU is paused between `start` invocations.
pub type TrampolineFn = Box<dyn FnOnce(&mut Machine, &mut dyn Cpu) -> Result<(), EmuError>>;

/// Shared emulator state: the task, the kernel chain and the process memory
/// landmarks.
pub struct Machine {
    pub task: Task,
    pub config: ExecConfig,
    pub fs: Rc<RefCell<Filesystem>>,
    /// Guest-side path of the main executable.
    pub exe: String,
    pub(crate) kernels: Vec<Box<dyn Kernel>>,
    loader: Option<Box<dyn Loader>>,
    interp_loader: Option<Box<dyn Loader>>,
    /// Load bias of the main image.
    pub base: u64,
    /// Effective entry: the interpreter's if one is mapped.
    pub entry: u64,
    /// Program entry, regardless of any interpreter.
    pub bin_entry: u64,
    /// 0 when no interpreter is mapped.
    pub interp_base: u64,
    pub stack_base: u64,
    pub stack_size: u64,
    exit_status: Option<EmuError>,
    restart: Option<RestartFn>,
    trampolines: Vec<TrampolineFn>,
    running: bool,
    exit_addr: u64,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("exe", &self.exe)
            .field("base", &(self.base as *const u8))
            .field("entry", &(self.entry as *const u8))
            .field("interp_base", &(self.interp_base as *const u8))
            .field("brk", &(self.task.cur_brk() as *const u8))
            .finish()
    }
}

impl Machine {
    pub fn loader(&self) -> Option<&dyn Loader> {
        self.loader.as_deref()
    }

    pub fn interp_loader(&self) -> Option<&dyn Loader> {
        self.interp_loader.as_deref()
    }

    /// Records the exit status and stops the engine; the run loop observes
    /// the status on its next iteration.
    pub fn exit(&mut self, cpu: &mut dyn Cpu, status: EmuError) {
        self.exit_status = Some(status);
        cpu.stop();
    }

    pub fn exit_status(&self) -> Option<&EmuError> {
        self.exit_status.as_ref()
    }

    pub fn set_entry(&mut self, entry: u64) {
        self.entry = entry;
    }

    /// Address that ends the run when execution reaches it.
    pub fn set_exit(&mut self, exit: u64) {
        self.exit_addr = exit;
    }

    /// Replaces the next exit with a resumption callback.
    pub fn restart(&mut self, cpu: &mut dyn Cpu, cb: RestartFn) {
        self.restart = Some(cb);
        cpu.stop();
    }

    /// Runs `f` now if the CPU is paused, otherwise queues it and stops the
    /// engine so the run loop flushes it with PC/SP saved.
    pub fn trampoline(
        &mut self,
        cpu: &mut dyn Cpu,
        f: TrampolineFn,
    ) -> Result<(), EmuError> {
        if self.running {
            self.trampolines.push(f);
            cpu.stop();
            Ok(())
        } else {
            f(self, cpu)
        }
    }

    /// Maps the stack and points SP at its high end. An optional guard page
    /// sits immediately above.
    pub fn map_stack(
        &mut self,
        cpu: &mut dyn Cpu,
        base: u64,
        size: u64,
        guard: bool,
    ) -> Result<(), EmuError> {
        self.stack_base = base;
        self.stack_size = size;
        let addr = self.task.mmap(cpu, base, size, Prot::ALL, true, "stack", None)?;
        let stack_end = addr + size;
        self.task.reg_write(cpu, self.task.arch().sp, stack_end)?;
        if guard {
            self.task
                .mmap(cpu, stack_end, PAGE_SIZE, Prot::NONE, true, "stack guard", None)?;
        }
        Ok(())
    }

    /// Kernel-chain dispatch for one trapped syscall. Returns the value for
    /// the guest return register.
    pub fn syscall(
        &mut self,
        cpu: &mut dyn Cpu,
        num: u64,
        name: Option<&'static str>,
        raw_args: [u64; 6],
    ) -> u64 {
        let Some(name) = name else {
            let err = EmuError::UnhandledSyscall {
                num,
                name: "?".to_string(),
            };
            log::error!("{}", err);
            self.exit(cpu, err);
            return 0;
        };
        let args = SyscallArgs::new(num, raw_args);
        let Machine {
            task,
            kernels,
            exe,
            exit_status,
            ..
        } = self;
        let mut ctx = SysCtx {
            task,
            cpu,
            exe: exe.as_str(),
            exit: exit_status,
        };
        for kernel in kernels.iter_mut() {
            if let Some(res) = kernel.dispatch(&mut ctx, name, &args) {
                log::trace!("{}{:?} = {:#x}", name, args, res.val());
                return res.val();
            }
        }
        let err = EmuError::UnhandledSyscall {
            num,
            name: name.to_string(),
        };
        log::error!("{}", err);
        self.exit(cpu, err);
        0
    }
}

/// Span and placement data of one image, extracted up front so mapping does
/// not hold a borrow of the loader.
struct ImageInfo {
    segments: Vec<Segment>,
    entry: u64,
    dynamic: bool,
    interp: Option<String>,
}

fn image_info(loader: &dyn Loader) -> Result<ImageInfo, EmuError> {
    Ok(ImageInfo {
        segments: loader.segments()?,
        entry: loader.entry(),
        dynamic: loader.kind() == ImageKind::Dyn,
        interp: loader.interp().map(str::to_string),
    })
}

/// Maps an image (and, recursively, its interpreter) into the task.
/// Returns `(interp_base, entry, base, bin_entry)`.
fn map_binary(
    machine: &MachineRef,
    cpu: &mut dyn Cpu,
    image: Rc<[u8]>,
    name: &str,
    is_interp: bool,
) -> Result<(u64, u64, u64, u64), EmuError> {
    let (os_hint, force_base, force_interp_base, skip_interp, brk) = {
        let m = machine.borrow();
        (
            m.config.os_hint.clone(),
            m.config.force_base,
            m.config.force_interp_base,
            m.config.skip_interp,
            m.task.cur_brk(),
        )
    };

    let info = if is_interp {
        let loader = loader_for(image, os_hint.as_deref())?;
        let main_arch = machine.borrow().loader().map(|l| l.arch());
        if Some(loader.arch()) != main_arch {
            return Err(EmuError::LoadError(format!(
                "interpreter arch mismatch: {} != {}",
                loader.arch(),
                main_arch.unwrap_or("?")
            )));
        }
        let info = image_info(loader.as_ref())?;
        machine.borrow_mut().interp_loader = Some(loader);
        info
    } else {
        let m = machine.borrow();
        let loader = m
            .loader()
            .ok_or_else(|| EmuError::LoadError("no image loaded".to_string()))?;
        image_info(loader)?
    };

    // image span over non-empty segments
    let mut low = u64::MAX;
    let mut high = 0u64;
    for seg in info.segments.iter().filter(|s| s.size > 0) {
        low = low.min(seg.addr);
        high = high.max(seg.addr + seg.size);
    }
    if low > high {
        low = high;
    }

    // load bias: dynamic images get relocated as one contiguous block
    let mut load_bias = if is_interp {
        // leave heap room below the interpreter
        force_interp_base.max(brk + 8 * 1024 * 1024)
    } else {
        force_base
    };
    if info.dynamic {
        let map_low = if load_bias > 0 {
            load_bias
        } else if low == 0 {
            0x100_0000
        } else {
            low
        };
        let page = machine
            .borrow_mut()
            .task
            .mem_reserve(cpu, map_low, high - low, false)?;
        load_bias = page.addr - low;
    }

    let desc: &'static str = if is_interp { "interp" } else { "exe" };
    {
        let mut m = machine.borrow_mut();
        for seg in &info.segments {
            let mut prot = seg.prot;
            if prot.is_empty() {
                prot = Prot::ALL;
            }
            let backing = FileBacking::new(name, seg.off, seg.size);
            m.task.mmap(
                cpu,
                load_bias + seg.addr,
                seg.size,
                prot,
                true,
                desc,
                Some(backing),
            )?;
        }
        // segment bytes go through the task write path so observers see
        // them uniformly
        for seg in &info.segments {
            let data = seg.data();
            if !data.is_empty() {
                m.task.mem_write(cpu, load_bias + seg.addr, data)?;
            }
        }
    }
    let entry = load_bias + info.entry;

    if let Some(interp) = info.interp.filter(|_| !is_interp && !skip_interp) {
        let interp_image = read_guest_or_host(machine, &interp)?;
        // heap starts above the main image while the interpreter is placed
        machine.borrow_mut().task.set_brk(high);
        let (_, _, interp_bias, interp_entry) =
            map_binary(machine, cpu, interp_image, &interp, true)?;
        return Ok((interp_bias, interp_entry, load_bias, entry));
    }
    Ok((0, entry, load_bias, entry))
}

/// The interpreter may live in the virtual tree; otherwise it is read from
/// the host.
fn read_guest_or_host(machine: &MachineRef, path: &str) -> Result<Rc<[u8]>, EmuError> {
    let from_fs = {
        let m = machine.borrow();
        let mut fs = m.fs.borrow_mut();
        match fs.open(path) {
            Ok(mut file) => {
                let mut buf = vec![0u8; file.len() as usize];
                file.read(&mut buf)
                    .map_err(|e| EmuError::LoadError(e.to_string()))?;
                Some(buf)
            }
            Err(_) => None,
        }
    };
    let data = match from_fs {
        Some(data) => data,
        None => std::fs::read(path)?,
    };
    Ok(Rc::from(data.into_boxed_slice()))
}

pub struct Emu {
    cpu: Box<dyn Cpu>,
    machine: MachineRef,
    arch: &'static ArchDescriptor,
    os: &'static OsDescriptor,
    image: Rc<[u8]>,
}

impl std::fmt::Debug for Emu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emu")
            .field("arch", &self.arch.name)
            .field("os", &self.os.name)
            .field("machine", &self.machine.borrow())
            .finish()
    }
}

impl Emu {
    /// Reads the executable from the host and prepares a machine for it.
    /// The binary is not mapped yet, call [`Self::load_binary`] next.
    pub fn new(
        cpu: Box<dyn Cpu>,
        exe: &Path,
        registry: &Registry,
        fs: Rc<RefCell<Filesystem>>,
        config: ExecConfig,
    ) -> Result<Self, EmuError> {
        let image: Rc<[u8]> = Rc::from(std::fs::read(exe)?.into_boxed_slice());
        Self::with_image(cpu, exe.display().to_string(), image, registry, fs, config)
    }

    pub fn with_image(
        mut cpu: Box<dyn Cpu>,
        exe: String,
        image: Rc<[u8]>,
        registry: &Registry,
        fs: Rc<RefCell<Filesystem>>,
        config: ExecConfig,
    ) -> Result<Self, EmuError> {
        let loader = loader_for(image.clone(), config.os_hint.as_deref())?;
        let (arch, os) = registry.get(loader.arch(), loader.os())?;
        log::debug!(
            "loaded {:?}: arch={}, os={}, bits={}",
            exe,
            arch.name,
            os.name,
            loader.bits()
        );
        let task = Task::new(arch, os, loader.byte_order());
        let machine = Rc::new(RefCell::new(Machine {
            task,
            config,
            fs,
            exe,
            kernels: Vec::new(),
            loader: Some(loader),
            interp_loader: None,
            base: 0,
            entry: 0,
            bin_entry: 0,
            interp_base: 0,
            stack_base: 0,
            stack_size: 0,
            exit_status: None,
            restart: None,
            trampolines: Vec::new(),
            running: false,
            exit_addr: u64::MAX,
        }));
        let kernels = (os.kernels)(&machine, cpu.as_mut());
        machine.borrow_mut().kernels = kernels;
        Ok(Self {
            cpu,
            machine,
            arch,
            os,
            image,
        })
    }

    pub fn machine(&self) -> &MachineRef {
        &self.machine
    }

    pub fn cpu_mut(&mut self) -> &mut dyn Cpu {
        self.cpu.as_mut()
    }

    /// Maps the binary (and its interpreter), computes the initial program
    /// break and leaves PC at the effective entry point.
    pub fn load_binary(&mut self) -> Result<(), EmuError> {
        let exe = self.machine.borrow().exe.clone();
        let (interp_base, entry, base, bin_entry) = map_binary(
            &self.machine,
            self.cpu.as_mut(),
            self.image.clone(),
            &exe,
            false,
        )?;
        let mut m = self.machine.borrow_mut();
        m.interp_base = interp_base;
        m.entry = entry;
        m.base = base;
        m.bin_entry = bin_entry;

        // the heap starts past the highest writable segment
        let mut brk = 0u64;
        if let Some(loader) = m.loader() {
            for seg in loader.segments()? {
                if seg.prot.contains(Prot::WRITE) {
                    brk = brk.max(base + seg.addr + seg.size);
                }
            }
        }
        if brk > 0 {
            brk = (brk + PAGE_SIZE) & !(PAGE_SIZE - 1);
        }
        m.task.set_brk(brk);

        // make sure PC is set to the entry point for debuggers
        let pc = m.task.arch().pc;
        m.task.reg_write(self.cpu.as_mut(), pc, entry)?;
        log::debug!(
            "mapped: base={:#x}, entry={:#x}, interp_base={:#x}, brk={:#x}",
            base,
            entry,
            interp_base,
            brk
        );
        Ok(())
    }

    /// Installs the diagnostic memory-fault hook and the OS trap hook.
    fn add_hooks(&mut self) -> Result<(), EmuError> {
        self.cpu.hook_add(
            1,
            0,
            HookCallback::MemErr(Box::new(|_cpu, access, addr, size, value| {
                log::error!(
                    "{}: @{:#x}, {:#x} = {:#x}",
                    access.describe(),
                    addr,
                    size,
                    value
                );
                false
            })),
        )?;
        let machine = self.machine.clone();
        let interrupt = self.os.interrupt;
        self.cpu.hook_add(
            1,
            0,
            HookCallback::Interrupt(Box::new(move |cpu, intno| {
                interrupt(&machine, cpu, intno);
            })),
        )?;
        Ok(())
    }

    /// Drives the guest to completion. A clean guest `exit(code)` comes back
    /// as `Ok(code)`.
    pub fn run(&mut self) -> Result<u64, EmuError> {
        let (args, env) = {
            let m = self.machine.borrow();
            (m.config.args.clone(), m.config.env.clone())
        };
        (self.os.init)(&self.machine, self.cpu.as_mut(), &args, &env)?;
        self.add_hooks()?;

        // in case this isn't the first run
        self.machine.borrow_mut().exit_status = None;
        let entry = self.machine.borrow().entry;
        self.cpu.reg_write(self.arch.pc, entry)?;

        loop {
            let pc = self.cpu.reg_read(self.arch.pc)?;
            let exit_addr = self.machine.borrow().exit_addr;
            self.machine.borrow_mut().running = true;
            let res = self.cpu.start(pc, exit_addr);
            self.machine.borrow_mut().running = false;

            let restart = self.machine.borrow_mut().restart.take();
            if let Some(mut cb) = restart {
                let err = res.err().map(EmuError::from);
                cb(&mut self.machine.borrow_mut(), self.cpu.as_mut(), err)?;
            } else if let Err(engine_err) = res {
                if self.machine.borrow().exit_status.is_none() {
                    return Err(guest_fault(engine_err));
                }
            }

            // pending trampolines run with PC/SP saved around the batch
            let trampolines = std::mem::take(&mut self.machine.borrow_mut().trampolines);
            if !trampolines.is_empty() {
                let pc = self.cpu.reg_read(self.arch.pc)?;
                let sp = self.cpu.reg_read(self.arch.sp)?;
                for tramp in trampolines {
                    tramp(&mut self.machine.borrow_mut(), self.cpu.as_mut())?;
                }
                self.cpu.reg_write(self.arch.pc, pc)?;
                self.cpu.reg_write(self.arch.sp, sp)?;
            }

            if let Some(status) = self.machine.borrow_mut().exit_status.take() {
                return match status {
                    EmuError::ExitStatus(code) => Ok(code),
                    err => Err(err),
                };
            }
        }
    }
}

fn guest_fault(err: CpuError) -> EmuError {
    match err {
        CpuError::Unmapped(addr) => {
            EmuError::GuestFault(format!("unmapped access at {:#x}", addr))
        }
        CpuError::Protection(addr) => {
            EmuError::GuestFault(format!("protection violation at {:#x}", addr))
        }
        other => EmuError::Cpu(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::regs;
    use crate::cpu::scripted::{ScriptFeeder, ScriptOp, ScriptedCpu};
    use crate::cpu::{insn, RegId};
    use crate::loader::testimg;

    const ET_EXEC: u16 = 2;
    const ET_DYN: u16 = 3;
    const EM_X86_64: u16 = 62;
    const EM_ARM: u16 = 40;
    const RWX: u32 = 7;
    const RX: u32 = 4 | 1;

    /// Scratch page the scripts use for strings and result spills.
    const SCRATCH: u64 = 0x9000_0000;

    fn emu_with(image: Vec<u8>, fs: Rc<RefCell<Filesystem>>) -> (Emu, ScriptFeeder) {
        let registry = Registry::builtin();
        let image: Rc<[u8]> = Rc::from(image.into_boxed_slice());
        let loader = loader_for(image.clone(), None).unwrap();
        let arch = registry.arch(loader.arch()).unwrap();
        drop(loader);
        let cpu = ScriptedCpu::new(arch);
        let feeder = cpu.feeder();
        let config = ExecConfig {
            args: vec!["/bin/guest".to_string()],
            env: vec!["PATH=/bin".to_string()],
            ..ExecConfig::default()
        };
        let emu = Emu::with_image(
            Box::new(cpu),
            "/bin/guest".to_string(),
            image,
            &registry,
            fs,
            config,
        )
        .unwrap();
        (emu, feeder)
    }

    /// Script steps for one x86_64 `syscall` trap.
    fn sys(num: u64, args: &[u64]) -> Vec<ScriptOp> {
        const ABI: [RegId; 6] = crate::arch::x86_64::ABI_REGS;
        let mut ops = vec![ScriptOp::SetReg(regs::RAX, num)];
        for (i, val) in args.iter().enumerate() {
            ops.push(ScriptOp::SetReg(ABI[i], *val));
        }
        ops.push(ScriptOp::Insn(insn::X86_SYSCALL));
        ops
    }

    fn map_scratch(emu: &mut Emu) {
        let machine = emu.machine().clone();
        let mut m = machine.borrow_mut();
        m.task
            .mem_map(emu.cpu_mut(), SCRATCH, 0x1000, Prot::READ | Prot::WRITE)
            .unwrap();
    }

    fn read_u64(emu: &mut Emu, addr: u64) -> u64 {
        let mut raw = [0u8; 8];
        emu.cpu_mut().mem_read_into(&mut raw, addr).unwrap();
        u64::from_le_bytes(raw)
    }

    #[test]
    fn test_static_hello_world() {
        let fs = Rc::new(RefCell::new(Filesystem::new()));
        let image = testimg::elf64(ET_EXEC, EM_X86_64, 0x401000, 0x400000, RX, b"hello\n", None);
        let (mut emu, feeder) = emu_with(image, fs.clone());
        emu.load_binary().unwrap();
        {
            let m = emu.machine().borrow();
            assert_eq!(m.base, 0, "EXEC images load without bias");
            assert_eq!(m.entry, 0x401000);
            assert_eq!(m.bin_entry, 0x401000);
            assert_eq!(m.interp_base, 0);
        }
        map_scratch(&mut emu);
        // the payload sits behind ehdr + one phdr in the image
        let hello = 0x400000 + 64 + 56;
        emu.cpu_mut().mem_write(SCRATCH + 0x100, b"/out\0").unwrap();

        // open /out, write hello to stdout and the file, close, exit(0)
        feeder.push(sys(2, &[SCRATCH + 0x100, 0o101, 0o644]));
        feeder.push(sys(1, &[1, hello, 6]));
        feeder.push([ScriptOp::Store {
            addr: SCRATCH,
            size: 8,
            reg: regs::RAX,
        }]);
        feeder.push(sys(1, &[3, hello, 6]));
        feeder.push(sys(3, &[3]));
        feeder.push(sys(231, &[0]));

        let code = emu.run().expect("guest must exit cleanly");
        assert_eq!(code, 0);
        assert_eq!(read_u64(&mut emu, SCRATCH), 6, "write(1, ..) must report 6 bytes");

        let mut out = fs.borrow_mut().open("/out").unwrap();
        let mut buf = [0u8; 16];
        let n = out.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello\n");
    }

    #[test]
    fn test_dynamic_image_with_interpreter() {
        let fs = Rc::new(RefCell::new(Filesystem::new()));
        let interp = testimg::elf64(ET_DYN, EM_X86_64, 0x2000, 0x0, RX, b"ld", None);
        {
            let mut fs = fs.borrow_mut();
            let mut f = fs.create("/lib/ld.so").unwrap();
            f.write(&interp).unwrap();
        }
        let prog = testimg::elf64(ET_DYN, EM_X86_64, 0x1040, 0x0, RX, b"code", Some("/lib/ld.so"));
        let (mut emu, _feeder) = emu_with(prog, fs);
        emu.load_binary().unwrap();

        let m = emu.machine().borrow();
        assert_ne!(m.base, 0, "PIE main image must be relocated");
        assert_ne!(m.interp_base, 0, "interpreter must be mapped");
        assert_ne!(m.interp_base, m.base);
        assert_eq!(
            m.entry,
            m.interp_base + 0x2000,
            "effective entry is the interpreter's"
        );
        assert_eq!(
            m.bin_entry,
            m.base + 0x1040,
            "program entry is preserved as bin_entry"
        );
    }

    #[test]
    fn test_interpreter_arch_mismatch_fails() {
        let fs = Rc::new(RefCell::new(Filesystem::new()));
        let interp = testimg::elf64(ET_DYN, EM_ARM, 0x2000, 0x0, RX, b"ld", None);
        {
            let mut fs = fs.borrow_mut();
            let mut f = fs.create("/lib/ld.so").unwrap();
            f.write(&interp).unwrap();
        }
        let prog = testimg::elf64(ET_DYN, EM_X86_64, 0x1040, 0x0, RX, b"code", Some("/lib/ld.so"));
        let (mut emu, _feeder) = emu_with(prog, fs);
        assert!(matches!(
            emu.load_binary(),
            Err(EmuError::LoadError(msg)) if msg.contains("mismatch")
        ));
    }

    #[test]
    fn test_mmap_of_a_file() {
        let fs = Rc::new(RefCell::new(Filesystem::new()));
        {
            let mut fs = fs.borrow_mut();
            let mut f = fs.create("/data.bin").unwrap();
            let mut data = vec![0u8; 4096];
            data[..4].copy_from_slice(&[0, 1, 2, 3]);
            f.write(&data).unwrap();
        }
        let image = testimg::elf64(ET_EXEC, EM_X86_64, 0x401000, 0x400000, RWX, b"x", None);
        let (mut emu, feeder) = emu_with(image, fs);
        emu.load_binary().unwrap();
        map_scratch(&mut emu);
        emu.cpu_mut()
            .mem_write(SCRATCH + 0x100, b"/data.bin\0")
            .unwrap();

        let brk = emu.machine().borrow().task.cur_brk();
        assert!(brk > 0, "a writable segment must have produced a brk");
        let expected = brk + 0x80_0000;

        feeder.push(sys(2, &[SCRATCH + 0x100, 0, 0])); // open -> fd 3
        feeder.push(sys(9, &[0, 4096, 3, 2, 3, 0])); // mmap(0, 4k, RW, PRIVATE, 3, 0)
        feeder.push([ScriptOp::Load {
            addr: expected + 3,
            size: 1,
            reg: regs::RBX,
        }]);
        feeder.push(sys(60, &[0]));

        let code = emu.run().unwrap();
        assert_eq!(code, 0);
        assert_eq!(
            emu.cpu_mut().reg_read(regs::RBX).unwrap(),
            3,
            "byte 3 of the mapped file must be visible"
        );
        let m = emu.machine().borrow();
        let page = m.task.mappings().find(expected).expect("mmap page exists");
        assert_eq!(page.desc, "mmap");
        assert_eq!(page.prot, Prot::READ | Prot::WRITE);
        assert_eq!(page.file.as_ref().unwrap().name, "/data.bin");
    }

    #[test]
    fn test_brk_growth_through_the_kernel() {
        let fs = Rc::new(RefCell::new(Filesystem::new()));
        let image = testimg::elf64(ET_EXEC, EM_X86_64, 0x401000, 0x400000, RWX, b"x", None);
        let (mut emu, _feeder) = emu_with(image, fs);
        emu.load_binary().unwrap();

        let machine = emu.machine().clone();
        let b = machine.borrow().task.cur_brk();
        let r0 = machine
            .borrow_mut()
            .syscall(emu.cpu_mut(), 12, Some("brk"), [0, 0, 0, 0, 0, 0]);
        assert_eq!(r0, b, "brk(0) returns the current break");

        let r1 = machine
            .borrow_mut()
            .syscall(emu.cpu_mut(), 12, Some("brk"), [b + 5000, 0, 0, 0, 0, 0]);
        assert!(
            (b + 5000..=b + 8192).contains(&r1),
            "brk must grow to the request (got {:#x} for base {:#x})",
            r1,
            b
        );
        emu.cpu_mut()
            .mem_write(b + 4095, &[0xaa])
            .expect("write inside the grown heap succeeds");
        assert!(
            emu.cpu_mut().mem_write(b + 8200, &[0xaa]).is_err(),
            "write past the heap faults"
        );
    }

    #[test]
    fn test_stat_determinism_through_the_kernel() {
        let fs = Rc::new(RefCell::new(Filesystem::new()));
        {
            let mut fs = fs.borrow_mut();
            fs.create("/a").unwrap().write(b"aaa").unwrap();
            fs.create("/b").unwrap().write(b"bb").unwrap();
        }
        let image = testimg::elf64(ET_EXEC, EM_X86_64, 0x401000, 0x400000, RWX, b"x", None);
        let (mut emu, _feeder) = emu_with(image, fs);
        emu.load_binary().unwrap();
        map_scratch(&mut emu);
        emu.cpu_mut().mem_write(SCRATCH, b"/a\0").unwrap();
        emu.cpu_mut().mem_write(SCRATCH + 0x10, b"/b\0").unwrap();
        let statbuf = SCRATCH + 0x100;

        let machine = emu.machine().clone();
        let stat_ino = |emu: &mut Emu, path: u64| {
            let ret = machine.borrow_mut().syscall(
                emu.cpu_mut(),
                4,
                Some("stat"),
                [path, statbuf, 0, 0, 0, 0],
            );
            assert_eq!(ret, 0, "stat must succeed");
            // ino is the second u64 of the x86_64 layout
            read_u64(emu, statbuf + 8)
        };
        let a1 = stat_ino(&mut emu, SCRATCH);
        let a2 = stat_ino(&mut emu, SCRATCH);
        let b = stat_ino(&mut emu, SCRATCH + 0x10);
        assert_eq!(a1, a2, "repeated stats must agree on the inode");
        assert_ne!(a1, b, "distinct files must have distinct inodes");
    }

    #[test]
    fn test_vsyscall_page() {
        let fs = Rc::new(RefCell::new(Filesystem::new()));
        let image = testimg::elf64(ET_EXEC, EM_X86_64, 0x401000, 0x400000, RX, b"x", None);
        let (mut emu, feeder) = emu_with(image, fs);
        emu.load_binary().unwrap();

        let base = 0xffff_ffff_ff60_0000u64;
        {
            let m = emu.machine().borrow();
            let page = m.task.mappings().find(base).expect("vsyscall page mapped");
            assert_eq!(page.prot, Prot::READ | Prot::EXEC);
        }
        for off in [0u64, 0x400, 0x800] {
            let mut byte = [0u8; 1];
            emu.cpu_mut().mem_read_into(&mut byte, base + off).unwrap();
            assert_eq!(byte[0], 0xc3, "a near-return sits at each trap offset");
        }

        // calling the page behaves like syscall 96 (gettimeofday)
        emu.cpu_mut().reg_write(regs::RAX, 0x1234).unwrap();
        feeder.push([ScriptOp::SetReg(regs::RDI, 0), ScriptOp::SetReg(regs::RSI, 0)]);
        feeder.push([ScriptOp::Exec(base), ScriptOp::Halt]);
        emu.cpu_mut().start(base, u64::MAX).unwrap();
        let via_vsyscall = emu.cpu_mut().reg_read(regs::RAX).unwrap();

        let machine = emu.machine().clone();
        let direct = machine.borrow_mut().syscall(
            emu.cpu_mut(),
            96,
            Some("gettimeofday"),
            [0, 0, 0, 0, 0, 0],
        );
        assert_eq!(via_vsyscall, direct, "vsyscall and direct syscall agree");
    }

    #[test]
    fn test_unhandled_syscall_surfaces_as_error() {
        let fs = Rc::new(RefCell::new(Filesystem::new()));
        let image = testimg::elf64(ET_EXEC, EM_X86_64, 0x401000, 0x400000, RX, b"x", None);
        let (mut emu, feeder) = emu_with(image, fs);
        emu.load_binary().unwrap();
        // clone(2) has no handler in this kernel chain
        feeder.push(sys(56, &[0]));
        match emu.run() {
            Err(EmuError::UnhandledSyscall { num, .. }) => assert_eq!(num, 56),
            other => panic!("expected UnhandledSyscall, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_trampolines_flush_with_context_saved() {
        let fs = Rc::new(RefCell::new(Filesystem::new()));
        let image = testimg::elf64(ET_EXEC, EM_X86_64, 0x401000, 0x400000, RX, b"x", None);
        let (mut emu, feeder) = emu_with(image, fs);
        emu.load_binary().unwrap();

        let ran = Rc::new(RefCell::new(false));
        {
            let machine = emu.machine().clone();
            let ran = ran.clone();
            let mut m = machine.borrow_mut();
            m.running = true; // as if a hook were queueing this mid-run
            m.trampoline(
                emu.cpu_mut(),
                Box::new(move |_m, _cpu| {
                    *ran.borrow_mut() = true;
                    Ok(())
                }),
            )
            .unwrap();
            m.running = false;
        }
        feeder.push(sys(60, &[7]));
        let code = emu.run().unwrap();
        assert_eq!(code, 7);
        assert!(*ran.borrow(), "queued trampoline must run after start returns");
    }

    /// One kernel-chain dispatch, exactly the path a trapped `syscall`
    /// instruction takes.
    fn call(
        emu: &mut Emu,
        machine: &MachineRef,
        num: u64,
        name: &'static str,
        args: [u64; 6],
    ) -> u64 {
        machine
            .borrow_mut()
            .syscall(emu.cpu_mut(), num, Some(name), args)
    }

    fn read_guest(emu: &mut Emu, addr: u64, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        emu.cpu_mut().mem_read_into(&mut buf, addr).unwrap();
        buf
    }

    const MINUS_ONE: u64 = u64::MAX;

    fn loaded_emu(fs: Rc<RefCell<Filesystem>>) -> (Emu, MachineRef) {
        let image = testimg::elf64(ET_EXEC, EM_X86_64, 0x401000, 0x400000, RWX, b"x", None);
        let (mut emu, _feeder) = emu_with(image, fs);
        emu.load_binary().unwrap();
        map_scratch(&mut emu);
        let machine = emu.machine().clone();
        (emu, machine)
    }

    #[test]
    fn test_mprotect_and_munmap_through_the_kernel() {
        let fs = Rc::new(RefCell::new(Filesystem::new()));
        let (mut emu, machine) = loaded_emu(fs);

        // anonymous private mapping: prot R|W, flags ANONYMOUS|PRIVATE
        let addr = call(&mut emu, &machine, 9, "mmap", [0, 0x2000, 3, 0x22, 0, 0]);
        assert_ne!(addr, MINUS_ONE);
        assert_eq!(
            machine.borrow().task.mappings().find(addr).unwrap().prot,
            Prot::READ | Prot::WRITE
        );

        let ret = call(&mut emu, &machine, 10, "mprotect", [addr, 0x1000, 1, 0, 0, 0]);
        assert_eq!(ret, 0);
        {
            let m = machine.borrow();
            assert_eq!(
                m.task.mappings().find(addr).unwrap().prot,
                Prot::READ,
                "first page downgraded to read-only"
            );
            assert_eq!(
                m.task.mappings().find(addr + 0x1000).unwrap().prot,
                Prot::READ | Prot::WRITE,
                "second page keeps its protection"
            );
        }

        // prot=0 comes back as PROT_ALL (retained compatibility quirk)
        let ret = call(&mut emu, &machine, 10, "mprotect", [addr, 0x1000, 0, 0, 0, 0]);
        assert_eq!(ret, 0);
        assert_eq!(machine.borrow().task.mappings().find(addr).unwrap().prot, Prot::ALL);

        let ret = call(&mut emu, &machine, 11, "munmap", [addr, 0x2000, 0, 0, 0, 0]);
        assert_eq!(ret, 0);
        assert!(
            machine.borrow().task.mappings().find(addr).is_none(),
            "munmap must drop the range"
        );
    }

    #[test]
    fn test_writev_through_the_kernel() {
        let fs = Rc::new(RefCell::new(Filesystem::new()));
        let (mut emu, machine) = loaded_emu(fs.clone());

        emu.cpu_mut().mem_write(SCRATCH + 0x100, b"/v\0").unwrap();
        emu.cpu_mut().mem_write(SCRATCH + 0x40, b"foo").unwrap();
        emu.cpu_mut().mem_write(SCRATCH + 0x50, b"bar!").unwrap();
        // two 64-bit iovec entries
        let mut iov = Vec::new();
        for (base, len) in [(SCRATCH + 0x40, 3u64), (SCRATCH + 0x50, 4)] {
            iov.extend_from_slice(&base.to_le_bytes());
            iov.extend_from_slice(&len.to_le_bytes());
        }
        emu.cpu_mut().mem_write(SCRATCH, &iov).unwrap();

        let fd = call(&mut emu, &machine, 2, "open", [SCRATCH + 0x100, 0o101, 0o644, 0, 0, 0]);
        assert_eq!(fd, 3);
        let ret = call(&mut emu, &machine, 20, "writev", [fd, SCRATCH, 2, 0, 0, 0]);
        assert_eq!(ret, 7, "writev must report the concatenated length");
        let bad = call(&mut emu, &machine, 20, "writev", [99, SCRATCH, 2, 0, 0, 0]);
        assert_eq!(bad, MINUS_ONE, "unknown fd fails");

        let mut out = fs.borrow_mut().open("/v").unwrap();
        let mut buf = [0u8; 8];
        let n = out.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"foobar!");
    }

    #[test]
    fn test_lseek_and_read_through_the_kernel() {
        let fs = Rc::new(RefCell::new(Filesystem::new()));
        fs.borrow_mut()
            .create("/f")
            .unwrap()
            .write(b"0123456789")
            .unwrap();
        let (mut emu, machine) = loaded_emu(fs);
        emu.cpu_mut().mem_write(SCRATCH + 0x100, b"/f\0").unwrap();

        let fd = call(&mut emu, &machine, 2, "open", [SCRATCH + 0x100, 0, 0, 0, 0, 0]);
        assert_eq!(fd, 3);

        // SEEK_SET, then read two bytes through guest memory
        assert_eq!(call(&mut emu, &machine, 8, "lseek", [fd, 4, 0, 0, 0, 0]), 4);
        assert_eq!(call(&mut emu, &machine, 0, "read", [fd, SCRATCH, 2, 0, 0, 0]), 2);
        assert_eq!(read_guest(&mut emu, SCRATCH, 2), b"45");

        // SEEK_CUR from offset 6, SEEK_END, bad whence, bad fd
        let back = (-2i64) as u64;
        assert_eq!(call(&mut emu, &machine, 8, "lseek", [fd, back, 1, 0, 0, 0]), 4);
        assert_eq!(call(&mut emu, &machine, 8, "lseek", [fd, 0, 2, 0, 0, 0]), 10);
        assert_eq!(
            call(&mut emu, &machine, 8, "lseek", [fd, 0, 9, 0, 0, 0]),
            MINUS_ONE
        );
        assert_eq!(
            call(&mut emu, &machine, 8, "lseek", [99, 0, 0, 0, 0, 0]),
            MINUS_ONE
        );
    }

    #[test]
    fn test_access_through_the_kernel() {
        let fs = Rc::new(RefCell::new(Filesystem::new()));
        {
            use libramfs::OpenFlags;
            let mut fs = fs.borrow_mut();
            fs.open_file("/x", OpenFlags::O_CREAT | OpenFlags::O_RDWR, 0o777)
                .unwrap();
            fs.open_file("/r", OpenFlags::O_CREAT | OpenFlags::O_RDWR, 0o444)
                .unwrap();
        }
        let (mut emu, machine) = loaded_emu(fs);
        emu.cpu_mut().mem_write(SCRATCH, b"/x\0").unwrap();
        emu.cpu_mut().mem_write(SCRATCH + 0x10, b"/r\0").unwrap();
        emu.cpu_mut().mem_write(SCRATCH + 0x20, b"/missing\0").unwrap();

        assert_eq!(
            call(&mut emu, &machine, 21, "access", [SCRATCH, 7, 0, 0, 0, 0]),
            0,
            "rwx file passes a rwx check"
        );
        assert_eq!(
            call(&mut emu, &machine, 21, "access", [SCRATCH + 0x10, 4, 0, 0, 0, 0]),
            0,
            "read-only file passes a read check"
        );
        assert_eq!(
            call(&mut emu, &machine, 21, "access", [SCRATCH + 0x10, 2, 0, 0, 0, 0]),
            MINUS_ONE,
            "read-only file fails a write check"
        );
        assert_eq!(
            call(&mut emu, &machine, 21, "access", [SCRATCH + 0x20, 4, 0, 0, 0, 0]),
            MINUS_ONE,
            "missing file fails"
        );
    }

    #[test]
    fn test_readlink_through_the_kernel() {
        let fs = Rc::new(RefCell::new(Filesystem::new()));
        let (mut emu, machine) = loaded_emu(fs);
        emu.cpu_mut().mem_write(SCRATCH, b"/proc/self/exe\0").unwrap();
        emu.cpu_mut().mem_write(SCRATCH + 0x40, b"/etc/hosts\0").unwrap();
        let buf = SCRATCH + 0x200;

        // the configured exe path is "/bin/guest", ten bytes
        let ret = call(&mut emu, &machine, 89, "readlink", [SCRATCH, buf, 64, 0, 0, 0]);
        assert_eq!(ret, 10);
        assert_eq!(read_guest(&mut emu, buf, 10), b"/bin/guest");

        // a short size truncates bytes, it never errors
        let ret = call(&mut emu, &machine, 89, "readlink", [SCRATCH, buf, 3, 0, 0, 0]);
        assert_eq!(ret, 3);
        assert_eq!(read_guest(&mut emu, buf, 3), b"/bi");

        let ret = call(&mut emu, &machine, 89, "readlink", [SCRATCH + 0x40, buf, 64, 0, 0, 0]);
        assert_eq!(ret, MINUS_ONE, "only /proc/self/exe resolves");
    }

    #[test]
    fn test_fstat_through_the_kernel() {
        let fs = Rc::new(RefCell::new(Filesystem::new()));
        fs.borrow_mut().create("/f").unwrap().write(b"hello").unwrap();
        let (mut emu, machine) = loaded_emu(fs);
        emu.cpu_mut().mem_write(SCRATCH + 0x100, b"/f\0").unwrap();
        let statbuf = SCRATCH + 0x200;

        let fd = call(&mut emu, &machine, 2, "open", [SCRATCH + 0x100, 0, 0, 0, 0, 0]);
        assert_eq!(fd, 3);
        let ret = call(&mut emu, &machine, 5, "fstat", [fd, statbuf, 0, 0, 0, 0]);
        assert_eq!(ret, 0);
        // x86_64 layout: size at offset 48, blksize at 56
        assert_eq!(read_u64(&mut emu, statbuf + 48), 5);
        assert_eq!(read_u64(&mut emu, statbuf + 56), 1024);

        let ret = call(&mut emu, &machine, 5, "fstat", [99, statbuf, 0, 0, 0, 0]);
        assert_eq!(ret, MINUS_ONE, "unknown fd fails");
    }

    #[test]
    fn test_uname_getpid_and_ioctl_through_the_kernel() {
        let fs = Rc::new(RefCell::new(Filesystem::new()));
        let (mut emu, machine) = loaded_emu(fs);

        let ret = call(&mut emu, &machine, 63, "uname", [SCRATCH, 0, 0, 0, 0, 0]);
        assert_eq!(ret, 0);
        assert_eq!(read_guest(&mut emu, SCRATCH, 6), b"Linux\0");
        // the machine field is the fifth 65-byte utsname slot
        assert_eq!(read_guest(&mut emu, SCRATCH + 4 * 65, 7), b"x86_64\0");

        assert_eq!(call(&mut emu, &machine, 39, "getpid", [0; 6]), 1);
        assert_eq!(call(&mut emu, &machine, 186, "gettid", [0; 6]), 1);
        assert_eq!(
            call(&mut emu, &machine, 102, "getuid", [0; 6]),
            0,
            "the guest runs as root in its own world"
        );
        assert_eq!(
            call(&mut emu, &machine, 16, "ioctl", [1, 0x5401, 0, 0, 0, 0]),
            (-25i64) as u64,
            "ioctl answers ENOTTY"
        );
    }

    #[test]
    fn test_openat_statfs_and_time_through_the_kernel() {
        let fs = Rc::new(RefCell::new(Filesystem::new()));
        fs.borrow_mut().create("/f").unwrap().write(b"x").unwrap();
        let (mut emu, machine) = loaded_emu(fs);
        emu.cpu_mut().mem_write(SCRATCH + 0x100, b"/f\0").unwrap();

        // AT_FDCWD is ignored, paths are absolute here
        let at_fdcwd = (-100i64) as u64;
        let fd = call(
            &mut emu,
            &machine,
            257,
            "openat",
            [at_fdcwd, SCRATCH + 0x100, 0, 0, 0, 0],
        );
        assert_eq!(fd, 3);

        let ret = call(
            &mut emu,
            &machine,
            137,
            "statfs",
            [SCRATCH + 0x100, SCRATCH + 0x200, 0, 0, 0, 0],
        );
        assert_eq!(ret, 0);
        assert_eq!(
            read_u64(&mut emu, SCRATCH + 0x200),
            0x0102_1994,
            "f_type is the tmpfs magic"
        );

        let secs = call(&mut emu, &machine, 201, "time", [SCRATCH + 0x300, 0, 0, 0, 0, 0]);
        assert!(secs > 0, "the clock is past the epoch");
        assert_eq!(
            read_u64(&mut emu, SCRATCH + 0x300),
            secs,
            "time stores the same seconds it returns"
        );
    }
}
