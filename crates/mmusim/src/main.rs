mod console;
mod trace;

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, Subcommand};
use rayon::prelude::*;
use vmm::{Mmu, MmuConfig};

use crate::console::Console;
use crate::trace::TraceLine;

#[derive(Parser)]
#[command(name = "mmusim")]
#[command(about = "Memory management unit simulator")]
struct Args {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay traces against a simulated MMU, one logical CPU per trace
    Run {
        /// TOML configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Trace files to replay concurrently
        #[arg(required = true)]
        traces: Vec<PathBuf>,
    },
    /// Validate a configuration file and print the machine it describes
    Check {
        /// TOML configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn load_trace(path: &Path) -> Result<(String, Vec<TraceLine>), Box<dyn Error>> {
    let source = fs::read_to_string(path)?;
    let name = path.display().to_string();
    let trace = trace::parse(&source).map_err(|err| format!("{name}: {err}"))?;
    Ok((name, trace))
}

fn run(config: PathBuf, traces: Vec<PathBuf>) -> Result<(), Box<dyn Error>> {
    let config = MmuConfig::load(&config)?;
    let mmu = Mmu::new(config)?;

    let traces = traces
        .iter()
        .map(|path| load_trace(path))
        .collect::<Result<Vec<_>, _>>()?;

    let failures: usize = traces
        .par_iter()
        .map(|(name, trace)| trace::replay(&mmu, name, trace))
        .sum();

    println!("{}", mmu.stats());
    if failures > 0 {
        log::warn!("{failures} operations failed");
    }
    Ok(())
}

fn check(config: PathBuf) -> Result<(), Box<dyn Error>> {
    let config = MmuConfig::load(&config)?;
    let layout = config.layout();

    println!(
        "tlb:    {} entries, {:?}",
        config.tlb.entries, config.tlb.policy
    );
    println!(
        "cache:  {} entries, {:?}",
        config.cache.entries, config.cache.policy
    );
    println!(
        "memory: {} frames of {} bytes, {} bytes of swap",
        config.frame_count(),
        layout.page_size(),
        config.memory.swap_size
    );
    println!(
        "tables: {} levels of {} entries, {} pages per process at most",
        layout.levels(),
        layout.entries_per_table(),
        layout.max_pages().unwrap_or(usize::MAX)
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    Console::init(console::level_for(args.verbose))?;

    match args.command {
        Command::Run { config, traces } => run(config, traces),
        Command::Check { config } => check(config),
    }
}
