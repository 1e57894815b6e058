use crate::accumulate::NormalEquations;
use crate::config::OperatorStrategy;
use crate::model::{IntensityKernel, MeasurementModel, PointingKernel, PolarizationKernel};
use crate::samples::SampleStore;
use ndarray::{Array1, Array2, ArrayView1};
use rayon::prelude::*;
use sprs::CsMat;
use std::borrow::Cow;
use thiserror::Error;

/// Application of the symmetric normal-equations matrix `A^T N^-1 A`.
pub trait NormalOperator: Sync {
    /// Length of the map vectors this operator acts on.
    fn dim(&self) -> usize;
    fn apply(&self, x: ArrayView1<f64>) -> Array1<f64>;
}

#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("The {0:?} operator strategy needs data the accumulation did not retain.")]
    MissingInput(OperatorStrategy),
    #[error("Operator matrix must be square, got {rows}x{cols}.")]
    NotSquare { rows: usize, cols: usize },
}

/// Dense matrix; only sensible for small systems.
#[derive(Debug, Clone)]
pub struct DenseOperator {
    matrix: Array2<f64>,
}

impl DenseOperator {
    pub fn new(matrix: Array2<f64>) -> Result<Self, OperatorError> {
        let (rows, cols) = matrix.dim();
        if rows != cols {
            return Err(OperatorError::NotSquare { rows, cols });
        }
        Ok(Self { matrix })
    }
}

impl NormalOperator for DenseOperator {
    fn dim(&self) -> usize {
        self.matrix.nrows()
    }

    fn apply(&self, x: ArrayView1<f64>) -> Array1<f64> {
        self.matrix.dot(&x)
    }
}

/// Pre-assembled sparse matrix. Rows are independent, so each one is
/// computed by exactly one task.
#[derive(Debug, Clone)]
pub struct ExplicitOperator {
    matrix: CsMat<f64>,
}

impl ExplicitOperator {
    pub fn new(matrix: CsMat<f64>) -> Result<Self, OperatorError> {
        let (rows, cols) = matrix.shape();
        if rows != cols {
            return Err(OperatorError::NotSquare { rows, cols });
        }
        Ok(Self {
            matrix: matrix.into_csr(),
        })
    }

    pub fn matrix(&self) -> &CsMat<f64> {
        &self.matrix
    }

    pub fn nnz(&self) -> usize {
        self.matrix.nnz()
    }
}

impl NormalOperator for ExplicitOperator {
    fn dim(&self) -> usize {
        self.matrix.rows()
    }

    fn apply(&self, x: ArrayView1<f64>) -> Array1<f64> {
        let values: Vec<f64> = (0..self.matrix.rows())
            .into_par_iter()
            .map(|row| {
                self.matrix.outer_view(row).map_or(0.0, |entries| {
                    entries.iter().map(|(col, value)| value * x[col]).sum()
                })
            })
            .collect();
        Array1::from(values)
    }
}

/// Borrowed inputs of one scatter pass over the samples.
struct ScatterContext<'a, K> {
    store: &'a SampleStore,
    kernel: &'a K,
    x: &'a [f64],
}

impl<K: PointingKernel> ScatterContext<'_, K> {
    /// `A^T N^-1 A x` restricted to samples `[start, end)`.
    fn scatter_range(&self, start: usize, end: usize) -> Vec<f64> {
        let mut out = vec![0.0; self.x.len()];
        for t in start..end {
            let sample = self.store.sample(t);
            if sample.weight == 0.0 {
                continue;
            }
            for row in self.kernel.rows(&sample).iter() {
                let predicted = sample.weight * row.project(self.x);
                for &(index, coefficient) in row.entries() {
                    out[index] += coefficient * predicted;
                }
            }
        }
        out
    }
}

/// Re-traverses the stored samples on every application.
///
/// Samples are split into one contiguous chunk per worker of the current
/// pool. Each chunk scatters into its own partial vector and the partials are
/// summed in chunk order, so results are reproducible for a given pool size.
#[derive(Debug, Clone)]
pub struct ImplicitOperator {
    store: SampleStore,
}

impl ImplicitOperator {
    pub fn new(store: SampleStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SampleStore {
        &self.store
    }

    fn apply_with<K: PointingKernel>(&self, kernel: &K, x: &[f64]) -> Array1<f64> {
        let n = self.store.len();
        let mut total = Array1::<f64>::zeros(x.len());
        if n == 0 {
            return total;
        }
        let n_chunks = rayon::current_num_threads().clamp(1, n);
        let chunk_len = n.div_ceil(n_chunks);
        let context = ScatterContext {
            store: &self.store,
            kernel,
            x,
        };

        let partials: Vec<Vec<f64>> = (0..n_chunks)
            .into_par_iter()
            .map(|chunk| {
                let start = (chunk * chunk_len).min(n);
                let end = (start + chunk_len).min(n);
                context.scatter_range(start, end)
            })
            .collect();

        for partial in partials {
            total
                .iter_mut()
                .zip(partial)
                .for_each(|(value, contribution)| *value += contribution);
        }
        total
    }
}

impl NormalOperator for ImplicitOperator {
    fn dim(&self) -> usize {
        self.store.map_len()
    }

    fn apply(&self, x: ArrayView1<f64>) -> Array1<f64> {
        let x: Cow<'_, [f64]> = match x.as_slice() {
            Some(slice) => Cow::Borrowed(slice),
            None => Cow::Owned(x.to_vec()),
        };
        match self.store.model() {
            MeasurementModel::Intensity => {
                self.apply_with(&IntensityKernel::new(self.store.gain()), &x)
            }
            MeasurementModel::IntensityPolarization => self.apply_with(
                &PolarizationKernel::new(self.store.gain(), self.store.n_pixels()),
                &x,
            ),
        }
    }
}

/// The operator chosen for a run. Selected once from [`OperatorStrategy`].
#[derive(Debug, Clone)]
pub enum MapOperator {
    Explicit(ExplicitOperator),
    Implicit(ImplicitOperator),
}

impl MapOperator {
    /// Takes the assembled matrix (explicit) or the retained samples
    /// (implicit) out of an accumulation.
    pub fn assemble(
        strategy: OperatorStrategy,
        equations: &mut NormalEquations,
        store: Option<SampleStore>,
    ) -> Result<Self, OperatorError> {
        match strategy {
            OperatorStrategy::Explicit => {
                let matrix = equations
                    .explicit
                    .take()
                    .ok_or(OperatorError::MissingInput(strategy))?;
                let operator = ExplicitOperator::new(matrix)?;
                log::info!(
                    "Explicit operator ready: dimension {}, {} non-zeros",
                    operator.dim(),
                    operator.nnz()
                );
                Ok(Self::Explicit(operator))
            }
            OperatorStrategy::Implicit => {
                let store = store.ok_or(OperatorError::MissingInput(strategy))?;
                log::info!(
                    "Implicit operator ready: dimension {}, {} samples",
                    store.map_len(),
                    store.len()
                );
                Ok(Self::Implicit(ImplicitOperator::new(store)))
            }
        }
    }

    pub fn strategy(&self) -> OperatorStrategy {
        match self {
            Self::Explicit(_) => OperatorStrategy::Explicit,
            Self::Implicit(_) => OperatorStrategy::Implicit,
        }
    }
}

impl NormalOperator for MapOperator {
    fn dim(&self) -> usize {
        match self {
            Self::Explicit(op) => op.dim(),
            Self::Implicit(op) => op.dim(),
        }
    }

    fn apply(&self, x: ArrayView1<f64>) -> Array1<f64> {
        match self {
            Self::Explicit(op) => op.apply(x),
            Self::Implicit(op) => op.apply(x),
        }
    }
}
