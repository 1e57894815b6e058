#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use ndarray::array;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;

use diffmap::io::{CsvShardSource, load_mask};
use diffmap::progress::{SolveProgressObserver, SolveStage};
use diffmap::solver::IterationRecord;
use diffmap::{
    ConjugateGradient, DenseOperator, GainTable, MapmakingConfig, NormalOperator,
    OperatorStrategy, SolverConfig, SolverState, run_mapmaking,
};

#[derive(Parser)]
#[command(
    name = "diffmap",
    about = "Preconditioned conjugate-gradient map-making for differencing radiometers",
    long_about = "Builds sky maps from pre-decoded differenced samples by solving the \
                 weighted least-squares normal equations with a Jacobi-preconditioned \
                 conjugate-gradient solver."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Solve for a map from pre-decoded shard files
    #[command(about = "Solve for a sky map (outputs: <prefix>.map.tsv, <prefix>.trace.tsv)")]
    Solve {
        /// TOML configuration with band, pixelization and solver settings
        #[arg(long, value_name = "PATH")]
        config: PathBuf,

        /// Processing mask with one 0/1 entry per pixel (default: all usable)
        #[arg(long, value_name = "PATH")]
        mask: Option<PathBuf>,

        /// Prefix of the output files
        #[arg(long, value_name = "PREFIX")]
        output: PathBuf,

        /// Abort on the first shard that fails to load or validate
        #[arg(long)]
        strict: bool,

        /// Override the operator strategy from the configuration
        #[arg(long, value_name = "STRATEGY", value_parser = parse_strategy)]
        strategy: Option<OperatorStrategy>,

        /// Worker pool size (default: number of logical CPUs)
        #[arg(long, value_name = "N")]
        threads: Option<usize>,

        /// Shard files with columns pixel_a,pixel_b,usable,signal,noise[,polarization,psi_a,psi_b]
        #[arg(value_name = "SHARD", required = true)]
        shards: Vec<PathBuf>,
    },

    /// Print the built-in gain-imbalance table
    #[command(about = "Print the built-in gain-imbalance table")]
    Bands,

    /// Solve a small reference system and report the result
    #[command(about = "Check the solver on a 2x2 reference system")]
    Selftest,

    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

fn parse_strategy(value: &str) -> Result<OperatorStrategy, String> {
    match value {
        "explicit" => Ok(OperatorStrategy::Explicit),
        "implicit" => Ok(OperatorStrategy::Implicit),
        other => Err(format!(
            "unknown strategy '{other}', expected 'explicit' or 'implicit'"
        )),
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

/// Terminal progress bars, one per stage.
#[derive(Default)]
struct TerminalProgress {
    bar: Option<ProgressBar>,
}

impl SolveProgressObserver for TerminalProgress {
    fn on_stage_start(&mut self, stage: SolveStage, total: usize) {
        self.bar = Some(create_progress_bar(total as u64, stage.describe()));
    }

    fn on_stage_advance(&mut self, _: SolveStage, completed: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(completed as u64);
        }
    }

    fn on_stage_finish(&mut self, _: SolveStage) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }

    fn on_iteration(&mut self, record: &IterationRecord) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("delta_new = {:.3e}", record.delta_new));
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Solve {
            config,
            mask,
            output,
            strict,
            strategy,
            threads,
            shards,
        }) => run_solve(config, mask, output, strict, strategy, threads, shards),
        Some(Commands::Bands) => {
            print_bands();
            Ok(())
        }
        Some(Commands::Selftest) => run_selftest(),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(|err| Box::new(err) as Box<dyn std::error::Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_solve(
    config_path: PathBuf,
    mask_path: Option<PathBuf>,
    output: PathBuf,
    strict: bool,
    strategy: Option<OperatorStrategy>,
    threads: Option<usize>,
    shards: Vec<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = MapmakingConfig::load(&config_path)?;
    config.solver.strict |= strict;
    if let Some(strategy) = strategy {
        config.solver.strategy = strategy;
    }
    if threads.is_some() {
        config.solver.threads = threads;
    }

    let mask = mask_path.as_deref().map(load_mask).transpose()?;
    let sources: Vec<CsvShardSource> = shards.into_iter().map(CsvShardSource::new).collect();

    let mut progress = TerminalProgress::default();
    let run = run_mapmaking(&config, &sources, mask, &mut progress, None)?;

    for failure in &run.failures {
        eprintln!("Skipped {failure}");
    }
    let paths = run.write_outputs(&output)?;

    println!(
        "Band {}: {:?} after {} iterations (delta_0 = {:.3e}, final delta = {:.3e})",
        config.band,
        run.outcome.state,
        run.outcome.iterations,
        run.outcome.delta_0,
        run.outcome.final_delta()
    );
    println!(
        "{} shards used, {} skipped; {} of {} pixels observed",
        run.shards_used,
        run.failures.len(),
        run.map.observed_count(),
        run.map.n_pixels()
    );
    println!("Map written to {}", paths.map.display());
    println!("Trace written to {}", paths.trace.display());
    Ok(())
}

fn print_bands() {
    println!("band\txbar\tdxbar");
    for (band, gain) in GainTable::wmap_nine_year().iter() {
        println!("{band}\t{:.6}\t{:.6}", gain.xbar, gain.dxbar);
    }
}

fn run_selftest() -> Result<(), Box<dyn std::error::Error>> {
    let operator = DenseOperator::new(array![[3.0, 2.0], [2.0, 6.0]])?;
    let rhs = array![2.0, -8.0];
    let preconditioner = array![1.0, 1.0];
    let config = SolverConfig {
        eps: 1e-10,
        ..SolverConfig::default()
    };
    let outcome =
        ConjugateGradient::new(&config)?.solve(&operator, rhs.view(), preconditioner.view())?;
    let residual = &rhs - &operator.apply(outcome.solution.view());
    let residual_norm = residual.dot(&residual).sqrt();

    println!(
        "x = [{:.6}, {:.6}] after {} iterations ({:?}), |b - A x| = {:.3e}",
        outcome.solution[0],
        outcome.solution[1],
        outcome.iterations,
        outcome.state,
        residual_norm
    );
    if outcome.state != SolverState::Converged || residual_norm > 1e-8 {
        return Err("solver self-test did not reproduce x = [2, -2]".into());
    }
    println!("Self-test passed");
    Ok(())
}

fn print_version_info() {
    let version = env!("CARGO_PKG_VERSION");
    let build_timestamp: u64 = env!("DIFFMAP_BUILD_TIMESTAMP").parse().unwrap_or(0);

    println!("diffmap {version}");
    if build_timestamp > 0 {
        println!("Built at unix time {build_timestamp}");
    }
}
