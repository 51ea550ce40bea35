// File: src/main.rs
//
// Bytecode runner for the ST virtual machine.
// Loads and validates a compiled .stbc file, optionally enables debug
// state or primary/secondary replication, executes it and reports
// statistics. Exit code 0 on normal termination, nonzero on load,
// validation, runtime or sync errors.

mod bytecode;
mod errors;
mod generator;
mod library;
mod stack;
mod sync;
mod time_lib;
mod value;
mod vm;

use bytecode::BytecodeFile;
use clap::Parser as ClapParser;
use colored::Colorize;
use std::path::PathBuf;
use sync::{SyncConfig, DEFAULT_SYNC_PORT};
use vm::{SyncMode, Vm, VmConfig, VmState};

#[derive(ClapParser)]
#[command(
    name = "stvm",
    about = "ST virtual machine runner",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Path to the .stbc bytecode file
    file: PathBuf,

    /// Emit progress lines while loading and running
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug state (breakpoints, single-step API)
    #[arg(short, long)]
    debug: bool,

    /// Print statistics, memory usage and sync status on exit
    #[arg(short, long)]
    stats: bool,

    /// Total execution-time budget in seconds
    #[arg(short = 't', long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Run as replication primary, bound to this local IP
    #[arg(short = 'P', long, value_name = "IP")]
    sync_primary: Option<String>,

    /// Run as replication secondary, bound to this local IP
    #[arg(short = 'S', long, value_name = "IP")]
    sync_secondary: Option<String>,

    /// Peer IP for the sync modes
    #[arg(long, value_name = "IP")]
    peer: Option<String>,

    /// Sync port
    #[arg(short = 'p', long, default_value_t = DEFAULT_SYNC_PORT)]
    port: u16,

    /// Print the disassembly of the file and exit
    #[arg(long)]
    disasm: bool,
}

fn main() {
    let cli = Cli::parse();

    println!("ST virtual machine runner v{}", env!("CARGO_PKG_VERSION"));

    if cli.sync_primary.is_some() && cli.sync_secondary.is_some() {
        eprintln!("{}", "error: --sync-primary and --sync-secondary are mutually exclusive".red());
        std::process::exit(1);
    }

    if cli.verbose {
        println!("Loading bytecode file: {}", cli.file.display());
    }

    let file = match BytecodeFile::load(&cli.file) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    if cli.disasm {
        print!("{}", file.disassemble());
        return;
    }

    let config = VmConfig {
        enable_debug: cli.debug,
        max_execution_time_ms: cli.timeout.map(|secs| secs * 1000).unwrap_or(0),
    };
    let mut machine = Vm::new(config);

    // Validation happens inside load; a malformed file never executes
    if let Err(e) = machine.load(&file) {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    let sync_requested = cli.sync_primary.is_some() || cli.sync_secondary.is_some();
    if sync_requested {
        let peer_ip = match cli.peer {
            Some(ref peer) => peer.clone(),
            None => {
                eprintln!("{}", "error: sync modes require --peer IP".red());
                std::process::exit(1);
            }
        };
        let (local_ip, mode) = match (&cli.sync_primary, &cli.sync_secondary) {
            (Some(ip), _) => (ip.clone(), SyncMode::Primary),
            (_, Some(ip)) => (ip.clone(), SyncMode::Secondary),
            _ => unreachable!(),
        };
        let sync_config = SyncConfig {
            local_ip,
            peer_ip,
            port: cli.port,
            ..SyncConfig::default()
        };
        if let Err(e) = machine.enable_sync(sync_config, mode) {
            eprintln!("{}", e);
            std::process::exit(1);
        }
        if cli.verbose {
            println!(
                "Sync enabled: {} mode, port {}",
                if mode == SyncMode::Primary { "primary" } else { "secondary" },
                cli.port
            );
        }
    }

    if cli.verbose {
        println!("Executing program...");
    }

    let result = machine.execute();

    if cli.verbose && machine.state() == VmState::Stopped {
        println!("Program finished");
    }

    if cli.stats {
        machine.print_statistics();
        machine.print_memory_info();
        if sync_requested {
            machine.print_sync_status();
        }
    }

    if let Err(e) = result {
        eprintln!("{}", e);
        if cli.debug {
            machine.print_stack();
            machine.print_call_stack();
            machine.print_variables();
        }
        std::process::exit(1);
    }
}
