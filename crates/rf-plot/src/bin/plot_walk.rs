//! Plot Walk - inspect a JSON plan
//!
//! Usage:
//!   plot-walk plan.json                     - Print the realized walk
//!   plot-walk plan.json --format stages     - Print stage labels
//!   plot-walk plan.json --format steps      - Print step labels
//!
//! Loop conditions are bound to counters: each one holds for
//! `--loop-rounds` evaluations, then fails.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};

use rf_plot::{
    Callback, GamePlot, LoopCondition, Navigation, PlanBindings, PlanConfig, Position,
    SequenceFormat,
};

#[derive(Parser)]
#[command(name = "plot-walk", about = "Inspect a game plot plan")]
struct Cli {
    /// Plan document (JSON)
    plan: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value = "walk")]
    format: Format,

    /// Seed for flexible placements
    #[arg(short, long)]
    seed: Option<u64>,

    /// Evaluations for which every loop condition holds
    #[arg(long, default_value_t = 0)]
    loop_rounds: u32,

    /// Stop the walk after this many positions
    #[arg(long, default_value_t = 1000)]
    max_steps: usize,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    /// Every position from the start to the end of the plan
    Walk,
    /// One label per stage
    Stages,
    /// One label per step
    Steps,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let json = fs::read_to_string(&cli.plan)
        .with_context(|| format!("Failed to read {}", cli.plan.display()))?;
    let config = PlanConfig::from_json(&json).context("Failed to parse plan")?;

    let mut bindings = PlanBindings::new().default_callback(Callback::noop());
    if let Some(seed) = cli.seed {
        bindings = bindings.seed(seed);
    }
    for name in config.condition_names() {
        let counter = Arc::new(AtomicU32::new(0));
        let limit = cli.loop_rounds;
        bindings = bindings.condition(
            name,
            LoopCondition::new(move || counter.fetch_add(1, Ordering::Relaxed) < limit),
        );
    }

    let mut stager = config.build(&bindings).context("Failed to build plan")?;
    stager.finalize().context("Failed to finalize plan")?;
    log::info!("Loaded plan '{}' from {}", config.name, cli.plan.display());

    match cli.format {
        Format::Stages => print_lines(stager.get_sequence(SequenceFormat::Stages)),
        Format::Steps => print_lines(stager.get_sequence(SequenceFormat::Steps)),
        Format::Walk => walk(GamePlot::new(stager)?, cli.max_steps)?,
    }
    Ok(())
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{}", line);
    }
}

fn walk(mut plot: GamePlot, max_steps: usize) -> Result<()> {
    let mut current = Position::start();
    for _ in 0..max_steps {
        match plot.next(&current) {
            Navigation::At(next) => {
                let step = plot.get_step(&next).map(|s| s.id.as_str()).unwrap_or("?");
                let stage = plot
                    .get_sequence_object(&next)
                    .map(|e| e.id.as_str())
                    .unwrap_or("?");
                println!("{:<10} {}.{}", next.to_string(), stage, step);
                current = next;
            }
            end => {
                println!("{}", end.tag().unwrap_or("(stopped)"));
                return Ok(());
            }
        }
    }
    bail!("Walk did not end within {} positions", max_steps)
}
