use std::fs;
use std::path::PathBuf;

use clap::Parser;
use lisa_hooks::arch::{ArchId, Profile, Role};
use lisa_hooks::config::HookConfig;
use lisa_hooks::dispatch::Dispatcher;
use lisa_hooks::error::Error;
use lisa_hooks::hex::HexAddr;
use lisa_hooks::image::ImageInfo;
use lisa_hooks::sim::SimEngine;
use lisa_hooks::Abi;
use log::info;

/// Loads an ELF image, installs the library hooks and reports every patched import.
#[derive(clap::Parser)]
struct Args {
    binary: PathBuf,

    /// JSON session configuration. Missing fields keep their defaults.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Interpret the image as this architecture instead of the one in its header.
    #[clap(long)]
    arch: Option<ArchId>,

    #[clap(long)]
    hook_base: Option<HexAddr>,

    #[clap(long)]
    heap_base: Option<HexAddr>,

    #[clap(long)]
    stack_top: Option<HexAddr>,

    /// Imports that must never be called.
    #[clap(long)]
    unbound: Vec<String>,

    /// Print the hook table.
    #[clap(long)]
    list_hooks: bool,

    /// Print the effective configuration as JSON and exit.
    #[clap(long)]
    dump_config: bool,
}

pub fn main() -> Result<(), Error> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => HookConfig::from_path(path)?,
        None => HookConfig::default(),
    };
    if let Some(base) = args.hook_base {
        config.layout.hook_base = base.into();
    }
    if let Some(base) = args.heap_base {
        config.layout.heap_base = base.into();
    }
    if let Some(top) = args.stack_top {
        config.layout.stack_top = top.into();
    }
    config.unbound.extend(args.unbound.iter().cloned());

    if args.dump_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(())
    }

    let data = fs::read(&args.binary)?;
    let mut image = ImageInfo::parse_elf(&data)?;
    if let Some(arch) = args.arch {
        info!("Treating {} image as {arch}", image.arch);
        image.arch = arch;
    }

    let profile = Profile::for_arch(image.arch);
    let layout = config.layout.clone();
    let dispatcher = Dispatcher::<SimEngine>::new(profile, config)?;

    let mut engine = SimEngine::new(image.arch);
    engine.load_image(&image)?;
    engine.map(layout.heap_base, layout.heap_size as usize)?;
    engine.map(layout.stack()?.start, layout.stack_size as usize)?;

    let report = dispatcher.install(&mut engine, &image)?;

    let mut abi = Abi::new(&mut engine, profile)?;
    abi.set_role(Role::Sp, layout.stack_top)?;
    if profile.role(Role::Bp).is_ok() {
        abi.set_role(Role::Bp, layout.stack_top)?;
    }
    abi.set_role(Role::Ip, image.entry_point)?;

    if args.list_hooks {
        println!("Hooks ({}):", dispatcher.table().len());
        for entry in dispatcher.table().iter() {
            println!("  0x{:X}  {:<20} {:?}", entry.addr, entry.name, entry.kind);
        }
    }

    println!("Patched {} location(s):", report.len());
    for patch in report.patches.iter() {
        println!(
            "  0x{:X}  {:<20} {:?}  {} -> 0x{:X}",
            patch.location,
            patch.name,
            patch.source,
            hex::encode(&patch.previous),
            patch.target
        );
    }

    let missing = image
        .relocations
        .iter()
        .filter(|r| !report.is_patched(&r.symbol))
        .map(|r| r.symbol.as_str())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        println!("Imports without a hook: {}", missing.join(", "));
    }

    println!(
        "Ready: {} at entry 0x{:X}, sp=0x{:X}, {} hook address(es)",
        image.arch,
        image.entry_point,
        layout.stack_top,
        dispatcher.hook_addresses().count()
    );

    Ok(())
}
