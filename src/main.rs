use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use betatron::sim::config::SimConfig;
use betatron::sim::stats::{print_json, print_plain};
use betatron::sim::top::{PhaseInfo, SimTop};

#[derive(Parser)]
#[command(version, about = "A trace-driven simulator for multi-core CPU memory hierarchies")]
struct Args {
    /// Read all traces using the CloudSuite format.
    #[arg(short = 'c', long)]
    cloudsuite: bool,

    /// Hide the heartbeat output.
    #[arg(long)]
    hide_heartbeat: bool,

    /// The number of instructions in the warmup phase.
    #[arg(short = 'w', long = "warmup-instructions", default_value_t = 0)]
    warmup_instructions: u64,

    /// The number of instructions in the detailed phase. If not specified,
    /// run to the end of the trace.
    #[arg(short = 'i', long = "simulation-instructions")]
    simulation_instructions: Option<u64>,

    /// TOML configuration file; built-in defaults are used without one.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write JSON output to the given file, or stdout with no file name.
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    json: Option<String>,

    /// The paths to the traces, one per CPU.
    #[arg(required = true)]
    traces: Vec<PathBuf>,
}

fn run(args: Args) -> Result<()> {
    let config = SimConfig::load(args.config.as_deref())?;

    // traces repeat only when a fixed instruction count can outrun them
    let repeat = args.simulation_instructions.is_some();
    let simulation_instructions = args.simulation_instructions.unwrap_or(u64::MAX);

    let mut top = SimTop::new(&config, &args.traces, args.cloudsuite, repeat)?;
    if args.hide_heartbeat {
        top.hide_heartbeat();
    }

    println!();
    println!("*** betatron multi-core memory-hierarchy simulator ***");
    println!();
    println!("Warmup instructions: {}", args.warmup_instructions);
    if args.simulation_instructions.is_some() {
        println!("Simulation instructions: {simulation_instructions}");
    } else {
        println!("Simulation instructions: trace length");
    }
    println!("Number of CPUs: {}", config.num_cpus);
    println!("Page size: {}", betatron::constants::PAGE_SIZE);
    println!();

    let phases = vec![
        PhaseInfo {
            name: "Warmup".to_string(),
            is_warmup: true,
            length: args.warmup_instructions,
        },
        PhaseInfo {
            name: "Simulation".to_string(),
            is_warmup: false,
            length: simulation_instructions,
        },
    ];

    let mut phase_stats = Vec::new();
    for phase in &phases {
        phase_stats.push(top.run_phase(phase));
    }

    let stdout = std::io::stdout();
    print_plain(&mut stdout.lock(), &phase_stats)?;

    if let Some(json_target) = args.json {
        if json_target.is_empty() {
            print_json(&mut stdout.lock(), &phase_stats)?;
        } else {
            let mut file = File::create(&json_target)
                .with_context(|| format!("cannot create JSON output file {json_target}"))?;
            print_json(&mut file, &phase_stats)?;
            file.flush()?;
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
