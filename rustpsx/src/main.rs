use std::path::Path;

use anyhow::{Context, bail};
use clap::{Command, arg, value_parser};
use librustpsx::cpu::{CPU, EmulationBackend};
use librustpsx::r3000a::{Interpreter, JIT};
use librustpsx::{BIOS, Bus, R3000A};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("RustPSX - A Rust, PlayStation R3000A recompiler");
    let arguments = Command::new("RustPSX")
        .version("0.0.1")
        .about("Runs a PlayStation BIOS on the R3000A recompiler")
        .arg(arg!(--bios <VALUE> "Path to a 512 KiB BIOS image").required(true))
        .arg(
            arg!(--backend <VALUE> "Execution backend")
                .value_parser(["jit", "interpreter"])
                .default_value("jit"),
        )
        .arg(arg!(--cycles <COUNT> "Stop after this many guest cycles").value_parser(value_parser!(u64)))
        .arg(arg!(--disasm "Trace the host code of every compiled block"))
        .get_matches();

    let Some(bios_path) = arguments.get_one::<String>("bios") else {
        bail!("No BIOS path provided");
    };
    let bios = BIOS::new(Path::new(bios_path))
        .with_context(|| format!("Failed to load BIOS from {}", bios_path))?;

    let mut cpu = R3000A::new(Bus::new(bios));
    let backend_name = arguments
        .get_one::<String>("backend")
        .map(String::as_str)
        .unwrap_or("jit");

    let mut backend: Box<dyn EmulationBackend<R3000A> + '_> = match backend_name {
        "interpreter" => Box::new(Interpreter::new(cpu)),
        "jit" => {
            let mut jit = JIT::new(&mut cpu).context("Failed to start the recompiler")?;
            jit.set_disassembly(arguments.get_flag("disasm"))?;
            Box::new(jit)
        }
        other => bail!("Unsupported backend: {}", other),
    };

    match arguments.get_one::<u64>("cycles") {
        Some(&cycles) => backend.run_for_cycles(cycles)?,
        None => backend.run()?,
    }

    let cpu = backend.cpu();
    info!(
        "Stopped at pc 0x{:08X} after {} cycles",
        cpu.pc(),
        cpu.elapsed_cycles()
    );
    Ok(())
}
