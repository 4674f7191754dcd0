//! `binemu run`: load a guest binary, place it in a fresh address space and
//! drive it.
//!
//! The in-tree engine stub implements the full CPU contract except
//! instruction execution, so `run` performs the complete load and startup
//! sequence and then reports that no hardware engine is linked in. Wiring a
//! real engine means passing another [`libbinemu::cpu::Cpu`] to
//! [`Emu::new`].

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use libbinemu::arch::Registry;
use libbinemu::cpu::scripted::ScriptedCpu;
use libbinemu::{Emu, ExecConfig};
use libramfs::Filesystem;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

#[derive(Parser)]
#[command(name = "binemu", about = "userspace binary emulator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Loads a guest binary and runs it.
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// The binary that should be emulated.
    exe: PathBuf,
    /// Guest arguments (argv[1..]).
    args: Vec<String>,
    /// Environment entries passed to the guest.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,
    /// Host files copied into the virtual filesystem.
    #[arg(long = "map", value_name = "HOST:GUEST")]
    map: Vec<String>,
    /// OS personality override (linux, virtual-linux, darwin).
    #[arg(long = "os")]
    os: Option<String>,
    /// Redirect guest stdin/stdout to the connection accepted on this port.
    #[arg(long = "stdio-port")]
    stdio_port: Option<u16>,
    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    let Command::Run(args) = cli.command;
    let default_level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
    match run(args) {
        // the exit code mirrors the guest's
        Ok(code) => std::process::exit((code & 0xff) as i32),
        Err(e) => {
            eprintln!("error while running the binary: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn run(args: RunArgs) -> Result<u64> {
    let mut fs = Filesystem::new();
    for spec in &args.map {
        let (host, guest) = spec
            .split_once(':')
            .with_context(|| format!("--map {:?} is not HOST:GUEST", spec))?;
        fs.map_file(host.as_ref(), guest)
            .with_context(|| format!("unable to load {:?} into the virtual fs", host))?;
    }
    let fs = Rc::new(RefCell::new(fs));

    let registry = Registry::builtin();
    let image = std::fs::read(&args.exe)
        .with_context(|| format!("unable to read {}", args.exe.display()))?;
    let loader = libbinemu::loader::loader_for(Rc::from(image.into_boxed_slice()), args.os.as_deref())?;
    let Some(arch) = registry.arch(loader.arch()) else {
        bail!("arch {:?} is not supported", loader.arch());
    };
    drop(loader);

    let mut guest_args = vec![args.exe.display().to_string()];
    guest_args.extend(args.args.iter().cloned());
    let config = ExecConfig {
        args: guest_args,
        env: args.env.clone(),
        os_hint: args.os.clone(),
        stdio_port: args.stdio_port,
        ..ExecConfig::default()
    };

    let cpu = Box::new(ScriptedCpu::new(arch));
    let mut emu = Emu::new(cpu, &args.exe, &registry, fs, config)?;
    emu.load_binary()?;
    {
        let m = emu.machine().borrow();
        log::info!(
            "{}: base={:#x} entry={:#x} interp_base={:#x}",
            m.exe,
            m.base,
            m.entry,
            m.interp_base
        );
        log::debug!("mappings:\n{}", m.task.mappings());
    }
    log::warn!(
        "no hardware CPU engine is linked in; execution will stop at the first instruction"
    );
    let code = emu.run()?;
    Ok(code)
}
