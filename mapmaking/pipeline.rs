use crate::accumulate::{AccumulationError, Accumulator};
use crate::config::{ConfigFileError, ConfigurationError, MapmakingConfig};
use crate::io::{MapIoError, OutputPaths, write_map_tsv, write_trace_tsv};
use crate::operator::{MapOperator, NormalOperator, OperatorError};
use crate::progress::{SolveProgressObserver, SolveStage};
use crate::samples::{ProcessingMask, ShardError, ShardSource, ShardSummary};
use crate::skymap::SkyMap;
use crate::solver::{ConjugateGradient, SolveError, SolveOutcome};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    ConfigFile(#[from] ConfigFileError),
    #[error(transparent)]
    Accumulation(#[from] AccumulationError),
    #[error(transparent)]
    Operator(#[from] OperatorError),
    #[error(transparent)]
    Solve(#[from] SolveError),
    #[error("Failed to build the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    Io(#[from] MapIoError),
}

/// Everything a completed run produces.
#[derive(Debug)]
pub struct MapmakingRun {
    pub map: SkyMap,
    pub outcome: SolveOutcome,
    pub shards_used: usize,
    /// Shards skipped in lenient mode.
    pub failures: Vec<ShardError>,
    pub summaries: Vec<ShardSummary>,
}

impl MapmakingRun {
    pub fn write_outputs(&self, prefix: &Path) -> Result<OutputPaths, PipelineError> {
        let paths = OutputPaths::from_prefix(prefix);
        write_map_tsv(&paths.map, &self.map)?;
        write_trace_tsv(&paths.trace, &self.outcome)?;
        log::info!(
            "Wrote map to {} and convergence trace to {}",
            paths.map.display(),
            paths.trace.display()
        );
        Ok(paths)
    }
}

/// Accumulates `sources`, builds the configured operator and solves for the
/// map. `mask` defaults to every pixel usable.
pub fn run_mapmaking<S: ShardSource>(
    config: &MapmakingConfig,
    sources: &[S],
    mask: Option<ProcessingMask>,
    progress: &mut dyn SolveProgressObserver,
    abort: Option<Arc<AtomicBool>>,
) -> Result<MapmakingRun, PipelineError> {
    config.validate()?;
    let gain = config.gain()?;
    let n_pixels = config.pixelization.n_pixels();
    let mask = mask.unwrap_or_else(|| ProcessingMask::all_usable(n_pixels));
    mask.check_pixels(n_pixels)?;

    let model = config.solver.model;
    log::info!(
        "Map-making for band {} (xbar = {:.6}, dxbar = {:.6}): {} model, {} pixels, {} masked",
        config.band,
        gain.xbar,
        gain.dxbar,
        model,
        n_pixels,
        mask.masked_count()
    );

    let accumulator = Accumulator::new(&mask, &config.solver, gain)?;
    let accumulation = accumulator.accumulate(sources, progress)?;
    let mut equations = accumulation.equations;

    progress.on_stage_start(SolveStage::OperatorAssembly, 1);
    let operator = MapOperator::assemble(config.solver.strategy, &mut equations, accumulation.store)?;
    progress.on_stage_advance(SolveStage::OperatorAssembly, 1);
    progress.on_stage_finish(SolveStage::OperatorAssembly);

    let mut solver = ConjugateGradient::new(&config.solver)?;
    if let Some(flag) = abort {
        solver = solver.with_abort_flag(flag);
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.solver.worker_threads())
        .build()?;
    let outcome = pool.install(|| {
        solver.solve_with_progress(
            &operator,
            equations.rhs.view(),
            equations.preconditioner.view(),
            progress,
        )
    })?;
    log::info!(
        "Solve finished with state {:?} after {} iterations on a {:?} operator of dimension {}",
        outcome.state,
        outcome.iterations,
        operator.strategy(),
        operator.dim()
    );

    let map = SkyMap::new(
        model,
        n_pixels,
        outcome.solution.clone(),
        equations.preconditioner.view(),
    );
    let unobserved = n_pixels - map.observed_count();
    if unobserved > 0 {
        log::info!("{unobserved} of {n_pixels} pixels received no usable samples");
    }

    Ok(MapmakingRun {
        map,
        outcome,
        shards_used: accumulation.shards_used,
        failures: accumulation.failures,
        summaries: accumulation.summaries,
    })
}
