//! metajit CLI
//!
//! Runs bytecode programs (JSON) through the specializing dispatcher.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use metajit::bytecode::Program;
use metajit::jit::{Dispatcher, JitConfig};
use metajit::runtime::{Effects, Value};
use metajit::VERSION;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "metajit")]
#[command(author, version, about = "An adaptive meta-tracing specialization engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program
    Run {
        /// The program to run (JSON)
        file: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,

        /// Print dispatch statistics after the run
        #[arg(long)]
        stats: bool,

        /// Print every dispatch state change after the run
        #[arg(long)]
        events: bool,

        /// Report wall-clock time
        #[arg(short, long)]
        profile: bool,
    },

    /// Print a program's instructions
    Disasm {
        /// The program to disassemble (JSON)
        file: PathBuf,
    },

    /// Run a program interpreted and specialized and check both agree
    Compare {
        /// The program to run (JSON)
        file: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,
    },
}

#[derive(Args)]
struct EngineArgs {
    /// Values returned by successive `input` instructions
    #[arg(short, long, value_delimiter = ',', allow_hyphen_values = true)]
    input: Vec<i64>,

    /// Engine configuration (JSON)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Hotness threshold for merge points and promotion sites
    #[arg(short, long)]
    threshold: Option<u64>,

    /// Interpret only
    #[arg(long)]
    no_jit: bool,
}

impl EngineArgs {
    fn config(&self) -> anyhow::Result<JitConfig> {
        let mut config = match &self.config {
            Some(path) => JitConfig::from_json_file(path)
                .with_context(|| format!("cannot load config '{}'", path.display()))?,
            None => JitConfig::default(),
        };
        if let Some(threshold) = self.threshold {
            config = config.with_threshold(threshold);
        }
        if self.no_jit {
            config = config.with_enabled(false);
        }
        config.validate()?;
        Ok(config)
    }

    fn effects(&self) -> Effects {
        Effects::with_input(self.input.iter().copied().map(Value::Int))
    }
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    tracing::debug!(version = VERSION, "metajit starting");

    let result = match cli.command {
        Commands::Run {
            file,
            engine,
            stats,
            events,
            profile,
        } => run_file(&file, &engine, stats, events, profile),
        Commands::Disasm { file } => show_disassembly(&file),
        Commands::Compare { file, engine } => compare(&file, &engine),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn load(path: &Path) -> anyhow::Result<Arc<Program>> {
    let program = Program::from_json_file(path)
        .with_context(|| format!("cannot load program '{}'", path.display()))?;
    Ok(Arc::new(program))
}

fn run_file(
    path: &Path,
    engine: &EngineArgs,
    stats: bool,
    events: bool,
    profile: bool,
) -> anyhow::Result<()> {
    let program = load(path)?;
    let config = engine.config()?.with_record_events(events);
    let mut dispatcher = Dispatcher::new(program, config)?;
    let mut effects = engine.effects();

    let start = Instant::now();
    let result = dispatcher.run_program(&mut effects)?;
    let elapsed = start.elapsed();

    for value in effects.output() {
        println!("{}", value);
    }
    println!("=> {}", result);

    if events {
        for event in dispatcher.events() {
            eprintln!("{}", event);
        }
    }
    if stats {
        eprint!("{}", dispatcher.stats());
        eprintln!("Installed merge point units: {}", dispatcher.cache().merge_point_units());
    }
    if profile {
        eprintln!("Total time: {:?}", elapsed);
    }
    Ok(())
}

fn show_disassembly(path: &Path) -> anyhow::Result<()> {
    let program = load(path)?;
    print!("{}", program.disassemble());
    Ok(())
}

fn compare(path: &Path, engine: &EngineArgs) -> anyhow::Result<()> {
    let program = load(path)?;
    let config = engine.config()?;

    let mut interpreted = Dispatcher::new(program.clone(), config.clone().with_enabled(false))?;
    let mut plain_effects = engine.effects();
    let plain = interpreted.run_program(&mut plain_effects);

    let mut specialized = Dispatcher::new(program, config.with_enabled(true))?;
    let mut jit_effects = engine.effects();
    let jit = specialized.run_program(&mut jit_effects);

    let same_result = match (&plain, &jit) {
        (Ok(a), Ok(b)) => a == b,
        (Err(a), Err(b)) => a.to_string() == b.to_string(),
        _ => false,
    };
    if !same_result || plain_effects.output() != jit_effects.output() {
        bail!(
            "executions differ: interpreted {:?} with {} outputs, specialized {:?} with {} outputs",
            plain.map(|v| v.to_string()),
            plain_effects.output().len(),
            jit.map(|v| v.to_string()),
            jit_effects.output().len()
        );
    }

    println!(
        "identical: {} outputs, {} units compiled",
        jit_effects.output().len(),
        specialized.stats().units_compiled
    );
    Ok(())
}
