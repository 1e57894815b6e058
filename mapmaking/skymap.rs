use crate::model::MeasurementModel;
use ndarray::{Array1, ArrayView1, s};

/// A solved map, with component-major storage `[T | Q | U | S]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SkyMap {
    model: MeasurementModel,
    n_pixels: usize,
    values: Array1<f64>,
    observed: Vec<bool>,
}

impl SkyMap {
    /// A pixel counts as observed when any of its components has a non-zero
    /// preconditioner entry.
    pub fn new(
        model: MeasurementModel,
        n_pixels: usize,
        values: Array1<f64>,
        preconditioner: ArrayView1<f64>,
    ) -> Self {
        let components = model.components();
        let observed = (0..n_pixels)
            .map(|pixel| (0..components).any(|c| preconditioner[c * n_pixels + pixel] != 0.0))
            .collect();
        Self {
            model,
            n_pixels,
            values,
            observed,
        }
    }

    pub fn model(&self) -> MeasurementModel {
        self.model
    }

    pub fn n_pixels(&self) -> usize {
        self.n_pixels
    }

    pub fn values(&self) -> ArrayView1<'_, f64> {
        self.values.view()
    }

    /// Component block `c` (0 = T, 1 = Q, 2 = U, 3 = S).
    pub fn component(&self, c: usize) -> Option<ArrayView1<'_, f64>> {
        (c < self.model.components()).then(|| {
            let start = c * self.n_pixels;
            self.values.slice(s![start..start + self.n_pixels])
        })
    }

    pub fn is_observed(&self, pixel: usize) -> bool {
        self.observed[pixel]
    }

    /// Pixels with no constraint from any usable sample. Their values are zero.
    pub fn unobserved(&self) -> impl Iterator<Item = usize> + '_ {
        self.observed
            .iter()
            .enumerate()
            .filter(|(_, observed)| !**observed)
            .map(|(pixel, _)| pixel)
    }

    pub fn observed_count(&self) -> usize {
        self.observed.iter().filter(|o| **o).count()
    }

    /// Subtracts the mean over observed pixels from the temperature block.
    /// A differential instrument leaves this offset unconstrained.
    pub fn remove_monopole(&mut self) -> f64 {
        let count = self.observed_count();
        if count == 0 {
            return 0.0;
        }
        let n_pixels = self.n_pixels;
        let mean = (0..n_pixels)
            .filter(|&pixel| self.observed[pixel])
            .map(|pixel| self.values[pixel])
            .sum::<f64>()
            / count as f64;
        for pixel in 0..n_pixels {
            if self.observed[pixel] {
                self.values[pixel] -= mean;
            }
        }
        mean
    }
}
