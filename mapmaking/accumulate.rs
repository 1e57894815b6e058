use crate::config::{ConfigurationError, OperatorStrategy, SolverConfig};
use crate::model::{
    GainImbalance, IntensityKernel, MeasurementModel, PointingKernel, PolarizationKernel,
};
use crate::progress::{SolveProgressObserver, SolveStage};
use crate::samples::{ProcessingMask, SampleStore, ShardError, ShardSource, ShardSummary};
use ndarray::Array1;
use rayon::prelude::*;
use sprs::{CsMat, TriMat};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccumulationError {
    #[error("Accumulation aborted in strict mode: {0}")]
    Shard(#[from] ShardError),
    #[error("None of the {0} shards produced usable samples.")]
    NoUsableShards(usize),
    #[error("Failed to build the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// Additive contribution of one shard to the normal equations.
#[derive(Debug, Clone)]
pub struct ShardContribution {
    pub samples: usize,
    /// Diagonal of this shard's `A^T N^-1 A`.
    pub preconditioner: Array1<f64>,
    /// This shard's `A^T N^-1 d`.
    pub rhs: Array1<f64>,
    /// This shard's full `A^T N^-1 A`, when the explicit strategy is selected.
    pub operator: Option<CsMat<f64>>,
}

/// Reduces one sample store into its contribution. The model is dispatched
/// here, once, and the per-sample loop runs against a fixed kernel.
pub fn accumulate_store(store: &SampleStore, assemble_explicit: bool) -> ShardContribution {
    match store.model() {
        MeasurementModel::Intensity => {
            accumulate_with(store, &IntensityKernel::new(store.gain()), assemble_explicit)
        }
        MeasurementModel::IntensityPolarization => accumulate_with(
            store,
            &PolarizationKernel::new(store.gain(), store.n_pixels()),
            assemble_explicit,
        ),
    }
}

fn accumulate_with<K: PointingKernel>(
    store: &SampleStore,
    kernel: &K,
    assemble_explicit: bool,
) -> ShardContribution {
    let dim = store.map_len();
    let mut preconditioner = Array1::<f64>::zeros(dim);
    let mut rhs = Array1::<f64>::zeros(dim);
    let mut triplets: Option<TriMat<f64>> = assemble_explicit.then(|| {
        let per_sample = store.model().channels() * 16;
        TriMat::with_capacity((dim, dim), store.len() * per_sample)
    });

    for t in 0..store.len() {
        let sample = store.sample(t);
        if sample.weight == 0.0 {
            continue;
        }
        let rows = kernel.rows(&sample);
        for row in rows.iter() {
            let entries = row.entries();
            let weighted_value = sample.weight * row.value();
            for &(index, coefficient) in entries {
                rhs[index] += coefficient * weighted_value;
                preconditioner[index] += coefficient * coefficient * sample.weight;
            }
            if let Some(tri) = triplets.as_mut() {
                for &(i, ci) in entries {
                    for &(j, cj) in entries {
                        tri.add_triplet(i, j, ci * cj * sample.weight);
                    }
                }
            }
        }
    }

    ShardContribution {
        samples: store.len(),
        preconditioner,
        rhs,
        operator: triplets.map(|tri| tri.to_csr()),
    }
}

/// The merged normal equations `(A^T N^-1 A) x = A^T N^-1 d`.
#[derive(Debug, Clone)]
pub struct NormalEquations {
    model: MeasurementModel,
    n_pixels: usize,
    pub preconditioner: Array1<f64>,
    pub rhs: Array1<f64>,
    pub explicit: Option<CsMat<f64>>,
    pub samples: usize,
}

impl NormalEquations {
    pub fn empty(model: MeasurementModel, n_pixels: usize, assemble_explicit: bool) -> Self {
        let dim = model.components() * n_pixels;
        Self {
            model,
            n_pixels,
            preconditioner: Array1::zeros(dim),
            rhs: Array1::zeros(dim),
            explicit: assemble_explicit.then(|| CsMat::zero((dim, dim))),
            samples: 0,
        }
    }

    /// Elementwise addition of a shard contribution.
    pub fn merge(&mut self, contribution: ShardContribution) {
        self.preconditioner += &contribution.preconditioner;
        self.rhs += &contribution.rhs;
        if let (Some(total), Some(part)) = (self.explicit.as_mut(), contribution.operator) {
            *total = &*total + &part;
        }
        self.samples += contribution.samples;
    }

    pub fn model(&self) -> MeasurementModel {
        self.model
    }

    pub fn n_pixels(&self) -> usize {
        self.n_pixels
    }

    pub fn dim(&self) -> usize {
        self.preconditioner.len()
    }

    /// Number of map entries with a zero preconditioner (never observed).
    pub fn unobserved_entries(&self) -> usize {
        self.preconditioner.iter().filter(|m| **m == 0.0).count()
    }
}

/// Result of reducing a set of shards.
#[derive(Debug)]
pub struct Accumulation {
    pub equations: NormalEquations,
    /// All retained samples, in shard order. Only kept for the implicit
    /// strategy; the explicit strategy drops them once the matrix exists.
    pub store: Option<SampleStore>,
    pub shards_used: usize,
    pub failures: Vec<ShardError>,
    /// Diagnostics of every accumulated shard, in input order.
    pub summaries: Vec<ShardSummary>,
}

/// Read-only context handed to every shard worker.
struct ShardContext<'a> {
    mask: &'a ProcessingMask,
    model: MeasurementModel,
    gain: GainImbalance,
    assemble_explicit: bool,
    retain_samples: bool,
}

struct ShardOutput {
    contribution: ShardContribution,
    summaries: Vec<ShardSummary>,
    store: Option<SampleStore>,
}

impl ShardContext<'_> {
    fn process<S: ShardSource>(&self, source: &S) -> Result<ShardOutput, ShardError> {
        let shard = source.load()?;
        let store = SampleStore::from_shard(&shard, self.mask, self.model, self.gain).map_err(
            |err| ShardError::Configuration {
                label: shard.label.clone(),
                source: err,
            },
        )?;
        let contribution = accumulate_store(&store, self.assemble_explicit);
        Ok(ShardOutput {
            contribution,
            summaries: store.summaries().to_vec(),
            store: self.retain_samples.then_some(store),
        })
    }
}

/// Reduces shards into normal equations on a fixed-size worker pool.
pub struct Accumulator<'a> {
    mask: &'a ProcessingMask,
    model: MeasurementModel,
    gain: GainImbalance,
    strategy: OperatorStrategy,
    strict: bool,
    threads: usize,
}

impl<'a> Accumulator<'a> {
    pub fn new(
        mask: &'a ProcessingMask,
        config: &SolverConfig,
        gain: GainImbalance,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            mask,
            model: config.model,
            gain,
            strategy: config.strategy,
            strict: config.strict,
            threads: config.worker_threads(),
        })
    }

    /// Each worker turns one shard into its contribution without touching
    /// shared state. After every shard is done, contributions are merged in
    /// input order.
    pub fn accumulate<S: ShardSource>(
        &self,
        sources: &[S],
        progress: &mut dyn SolveProgressObserver,
    ) -> Result<Accumulation, AccumulationError> {
        let n_pixels = self.mask.len();
        let assemble_explicit = self.strategy == OperatorStrategy::Explicit;
        let context = ShardContext {
            mask: self.mask,
            model: self.model,
            gain: self.gain,
            assemble_explicit,
            retain_samples: !assemble_explicit,
        };

        log::info!(
            "Accumulating {} shards ({} model, {:?} operator) on {} workers",
            sources.len(),
            self.model,
            self.strategy,
            self.threads
        );
        progress.on_stage_start(SolveStage::Accumulation, sources.len());

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()?;
        // In strict mode, shards after the earliest failure seen so far are
        // skipped. Every shard before it still runs, so the reported failure
        // is the first one in input order.
        let first_failure = AtomicUsize::new(usize::MAX);
        let results: Vec<Option<Result<ShardOutput, ShardError>>> = pool.install(|| {
            sources
                .par_iter()
                .enumerate()
                .map(|(index, source)| {
                    if self.strict && index > first_failure.load(Ordering::Relaxed) {
                        return None;
                    }
                    let result = context.process(source);
                    if self.strict && result.is_err() {
                        first_failure.fetch_min(index, Ordering::Relaxed);
                    }
                    Some(result)
                })
                .collect()
        });

        let mut equations = NormalEquations::empty(self.model, n_pixels, assemble_explicit);
        let mut stores = Vec::new();
        let mut summaries = Vec::new();
        let mut failures = Vec::new();
        let mut shards_used = 0;
        for (done, result) in results.into_iter().flatten().enumerate() {
            match result {
                Ok(output) => {
                    equations.merge(output.contribution);
                    summaries.extend(output.summaries);
                    stores.extend(output.store);
                    shards_used += 1;
                }
                Err(err) if self.strict => return Err(AccumulationError::Shard(err)),
                Err(err) => {
                    log::warn!("Skipping {err}");
                    failures.push(err);
                }
            }
            progress.on_stage_advance(SolveStage::Accumulation, done + 1);
        }
        progress.on_stage_finish(SolveStage::Accumulation);

        if shards_used == 0 {
            return Err(AccumulationError::NoUsableShards(sources.len()));
        }

        log::info!(
            "Accumulated {} samples from {} shards ({} skipped); {} of {} map entries unobserved",
            equations.samples,
            shards_used,
            failures.len(),
            equations.unobserved_entries(),
            equations.dim()
        );
        if let Some(matrix) = &equations.explicit {
            log::info!("Explicit operator holds {} non-zeros", matrix.nnz());
        }

        Ok(Accumulation {
            equations,
            store: SampleStore::concat(stores)?,
            shards_used,
            failures,
            summaries,
        })
    }
}
