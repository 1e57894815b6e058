use crate::config::{ConfigurationError, SolverConfig};
use crate::operator::NormalOperator;
use crate::progress::{NoopProgress, SolveProgressObserver, SolveStage};
use ndarray::{Array1, ArrayView1, Zip};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Terminal state of a conjugate-gradient solve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolverState {
    /// `delta_new <= eps^2 * delta_0`.
    Converged,
    /// `delta_new` grew between two iterations; the iterate at that point is
    /// returned as is.
    Stalled,
    /// The iteration cap was reached.
    MaxIterations,
    /// The caller's abort flag was observed at an iteration boundary.
    Aborted,
}

/// `delta_new` after a completed iteration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IterationRecord {
    pub iteration: usize,
    pub delta_new: f64,
}

/// Drift between the incrementally updated residual and the exact
/// `b - A x`, relative to `|b|`, measured at a refresh iteration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResidualRefresh {
    pub iteration: usize,
    pub relative_drift: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DivergenceReason {
    /// `d^T A d` was zero or not finite.
    DegenerateDirection { curvature: f64 },
    /// The step length `alpha` was not finite.
    NonFiniteStep { alpha: f64 },
    /// The operator produced NaN or infinite entries.
    NonFiniteOperatorOutput,
}

#[derive(Error, Debug)]
pub enum SolveError {
    #[error(
        "Dimension mismatch: operator acts on {operator} entries, rhs has {rhs}, preconditioner has {preconditioner}."
    )]
    DimensionMismatch {
        operator: usize,
        rhs: usize,
        preconditioner: usize,
    },
    #[error("Conjugate gradient diverged at iteration {iteration}: {reason:?}")]
    Divergence {
        iteration: usize,
        reason: DivergenceReason,
        /// The iterate before the failing step.
        partial: Array1<f64>,
    },
}

/// Result of a solve that reached a terminal state.
#[derive(Clone, Debug)]
pub struct SolveOutcome {
    pub solution: Array1<f64>,
    pub state: SolverState,
    pub iterations: usize,
    pub delta_0: f64,
    pub trace: Vec<IterationRecord>,
    pub refreshes: Vec<ResidualRefresh>,
}

impl SolveOutcome {
    /// Last recorded `delta_new`, or `delta_0` when no iteration ran.
    pub fn final_delta(&self) -> f64 {
        self.trace.last().map_or(self.delta_0, |record| record.delta_new)
    }
}

/// Jacobi-preconditioned conjugate gradient for the normal equations.
///
/// Entries whose preconditioner is exactly zero are never observed. They are
/// excluded from `s = r / M`, so they keep the value zero throughout.
#[derive(Clone, Debug)]
pub struct ConjugateGradient {
    imax: usize,
    eps: f64,
    refresh_interval: usize,
    halt_on_stall: bool,
    abort: Option<Arc<AtomicBool>>,
}

impl ConjugateGradient {
    pub fn new(config: &SolverConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            imax: config.imax,
            eps: config.eps,
            refresh_interval: config.refresh_interval,
            halt_on_stall: config.halt_on_stall,
            abort: None,
        })
    }

    /// Checked at the start of every iteration; setting it ends the solve
    /// with [`SolverState::Aborted`].
    pub fn with_abort_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = Some(flag);
        self
    }

    pub fn solve<O: NormalOperator + ?Sized>(
        &self,
        operator: &O,
        rhs: ArrayView1<f64>,
        preconditioner: ArrayView1<f64>,
    ) -> Result<SolveOutcome, SolveError> {
        self.solve_with_progress(operator, rhs, preconditioner, &mut NoopProgress)
    }

    pub fn solve_with_progress<O: NormalOperator + ?Sized>(
        &self,
        operator: &O,
        rhs: ArrayView1<f64>,
        preconditioner: ArrayView1<f64>,
        progress: &mut dyn SolveProgressObserver,
    ) -> Result<SolveOutcome, SolveError> {
        let n = operator.dim();
        if rhs.len() != n || preconditioner.len() != n {
            return Err(SolveError::DimensionMismatch {
                operator: n,
                rhs: rhs.len(),
                preconditioner: preconditioner.len(),
            });
        }

        let threshold_factor = self.eps * self.eps;
        let rhs_norm = rhs.dot(&rhs).sqrt();

        let mut x = Array1::<f64>::zeros(n);
        let mut r = rhs.to_owned();
        let mut s = apply_jacobi(&r, preconditioner);
        let mut d = s.clone();
        let mut delta_new = r.dot(&s);
        let delta_0 = delta_new;
        let mut trace = Vec::new();
        let mut refreshes = Vec::new();

        log::info!(
            "Starting preconditioned CG: dimension {}, delta_0 = {:.6e}, imax = {}, eps = {:.1e}",
            n,
            delta_0,
            self.imax,
            self.eps
        );

        let finish = |solution, state, iterations, trace, refreshes| SolveOutcome {
            solution,
            state,
            iterations,
            delta_0,
            trace,
            refreshes,
        };

        if delta_0 <= threshold_factor * delta_0 {
            log::info!("Right-hand side vanishes on observed entries; nothing to solve");
            return Ok(finish(x, SolverState::Converged, 0, trace, refreshes));
        }

        progress.on_stage_start(SolveStage::Iteration, self.imax);
        let mut i = 0usize;
        let state = loop {
            if self
                .abort
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::Relaxed))
            {
                log::warn!("CG aborted by caller at iteration {i}");
                break SolverState::Aborted;
            }

            let q = operator.apply(d.view());
            if !q.iter().all(|v| v.is_finite()) {
                return Err(divergence(i, DivergenceReason::NonFiniteOperatorOutput, x));
            }
            let curvature = d.dot(&q);
            if curvature == 0.0 || !curvature.is_finite() {
                return Err(divergence(
                    i,
                    DivergenceReason::DegenerateDirection { curvature },
                    x,
                ));
            }
            let alpha = delta_new / curvature;
            if !alpha.is_finite() {
                return Err(divergence(i, DivergenceReason::NonFiniteStep { alpha }, x));
            }

            x.scaled_add(alpha, &d);

            if i % self.refresh_interval == 0 {
                let mut incremental = r;
                incremental.scaled_add(-alpha, &q);
                let ax = operator.apply(x.view());
                if !ax.iter().all(|v| v.is_finite()) {
                    return Err(divergence(i, DivergenceReason::NonFiniteOperatorOutput, x));
                }
                r = &rhs - &ax;
                let drift = (&r - &incremental).mapv(|v| v * v).sum().sqrt();
                let relative_drift = if rhs_norm > 0.0 {
                    drift / rhs_norm
                } else {
                    drift
                };
                log::debug!(
                    "Residual refresh at iteration {i}: relative drift {relative_drift:.3e}"
                );
                refreshes.push(ResidualRefresh {
                    iteration: i,
                    relative_drift,
                });
            } else {
                r.scaled_add(-alpha, &q);
            }

            s = apply_jacobi(&r, preconditioner);
            let delta_old = delta_new;
            delta_new = r.dot(&s);
            let beta = delta_new / delta_old;
            Zip::from(&mut d).and(&s).for_each(|d, &s| *d = s + beta * *d);
            i += 1;

            let record = IterationRecord {
                iteration: i,
                delta_new,
            };
            trace.push(record);
            progress.on_iteration(&record);
            progress.on_stage_advance(SolveStage::Iteration, i);

            if i % 10 == 0 {
                log::info!("CG iteration {i}: delta_new = {delta_new:.6e}");
            } else {
                log::debug!("CG iteration {i}: delta_new = {delta_new:.6e}, alpha = {alpha:.3e}");
            }

            if delta_new <= threshold_factor * delta_0 {
                log::info!("CG converged after {i} iterations (delta_new = {delta_new:.3e})");
                break SolverState::Converged;
            }
            if self.halt_on_stall && delta_new > delta_old {
                log::warn!(
                    "CG stalled at iteration {i}: delta_new {delta_new:.3e} exceeds previous {delta_old:.3e}"
                );
                break SolverState::Stalled;
            }
            if i >= self.imax {
                log::warn!("CG reached the iteration cap of {} without converging", self.imax);
                break SolverState::MaxIterations;
            }
        };
        progress.on_stage_finish(SolveStage::Iteration);

        Ok(finish(x, state, i, trace, refreshes))
    }
}

/// `s = r / M` on observed entries, zero elsewhere.
fn apply_jacobi(r: &Array1<f64>, preconditioner: ArrayView1<f64>) -> Array1<f64> {
    Zip::from(r)
        .and(&preconditioner)
        .map_collect(|&r, &m| if m != 0.0 { r / m } else { 0.0 })
}

fn divergence(iteration: usize, reason: DivergenceReason, partial: Array1<f64>) -> SolveError {
    log::error!("CG diverged at iteration {iteration}: {reason:?}");
    SolveError::Divergence {
        iteration,
        reason,
        partial,
    }
}
