#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(clippy::no_effect_underscore_binding)]

//! Jacobi-preconditioned conjugate-gradient map-making for differencing
//! radiometers.
//!
//! Pre-decoded shards become immutable [`samples::SampleStore`]s, the
//! [`accumulate`] stage reduces them into the normal equations, and the
//! [`solver`] iterates against one of the two [`operator`] strategies.

pub mod accumulate;
pub mod config;
pub mod io;
pub mod model;
pub mod operator;
pub mod pipeline;
pub mod progress;
pub mod samples;
pub mod skymap;
pub mod solver;

pub use accumulate::{Accumulation, Accumulator, NormalEquations, ShardContribution};
pub use config::{ConfigurationError, MapmakingConfig, OperatorStrategy, SolverConfig};
pub use model::{GainImbalance, GainTable, MeasurementModel, Pixelization};
pub use operator::{DenseOperator, ExplicitOperator, ImplicitOperator, MapOperator, NormalOperator};
pub use pipeline::{MapmakingRun, PipelineError, run_mapmaking};
pub use samples::{NoiseEstimate, ProcessingMask, SampleStore, Shard, ShardError, ShardSource};
pub use skymap::SkyMap;
pub use solver::{ConjugateGradient, SolveError, SolveOutcome, SolverState};
