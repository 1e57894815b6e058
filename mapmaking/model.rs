use crate::config::ConfigurationError;
use crate::samples::SampleRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// --- Measurement models ---

/// The observation model of one solve. Chosen once and never mixed mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementModel {
    /// One component (temperature) per pixel.
    #[default]
    Intensity,
    /// Four components per pixel: T, Q, U and the spurious leakage term S.
    IntensityPolarization,
}

impl MeasurementModel {
    /// Number of map components stored per pixel.
    pub const fn components(self) -> usize {
        match self {
            Self::Intensity => 1,
            Self::IntensityPolarization => 4,
        }
    }

    /// Number of differenced channels (pointing rows) contributed by each sample.
    pub const fn channels(self) -> usize {
        match self {
            Self::Intensity => 1,
            Self::IntensityPolarization => 2,
        }
    }

    pub fn component_names(self) -> &'static [&'static str] {
        match self {
            Self::Intensity => &["T"],
            Self::IntensityPolarization => &["T", "Q", "U", "S"],
        }
    }

    pub const fn requires_polarization(self) -> bool {
        matches!(self, Self::IntensityPolarization)
    }
}

impl fmt::Display for MeasurementModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Intensity => f.write_str("intensity"),
            Self::IntensityPolarization => f.write_str("intensity+polarization"),
        }
    }
}

// --- Pixelization ---

/// Fixed enumeration of sky pixels, `P = 12 * nside^2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pixelization {
    pub nside: u32,
}

impl Pixelization {
    pub fn new(nside: u32) -> Result<Self, ConfigurationError> {
        let pixelization = Self { nside };
        pixelization.validate()?;
        Ok(pixelization)
    }

    pub fn n_pixels(self) -> usize {
        let nside = self.nside as usize;
        12 * nside * nside
    }

    pub fn validate(self) -> Result<(), ConfigurationError> {
        if self.nside == 0 {
            return Err(ConfigurationError::InvalidPixelization(self.nside));
        }
        Ok(())
    }
}

impl Default for Pixelization {
    fn default() -> Self {
        Self { nside: 256 }
    }
}

// --- Gain imbalance ---

/// Relative gain asymmetry between the two beams of a differencing radiometer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GainImbalance {
    pub xbar: f64,
    pub dxbar: f64,
}

impl GainImbalance {
    pub const NONE: Self = Self {
        xbar: 0.0,
        dxbar: 0.0,
    };

    /// Combines the loss-imbalance values of the two radiometers of a band.
    pub fn from_radiometer_pair(first: f64, second: f64) -> Self {
        Self {
            xbar: 0.5 * (first + second),
            dxbar: 0.5 * (first - second),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.xbar.is_finite() && self.dxbar.is_finite()
    }
}

impl Default for GainImbalance {
    fn default() -> Self {
        Self::NONE
    }
}

/// Loss-imbalance coefficients per radiometer (Bennett et al. 2013, Table 1).
const WMAP_IMBALANCE_PAIRS: [(&str, f64, f64); 10] = [
    ("K1", -0.00067, 0.00536),
    ("Ka1", 0.00353, 0.00154),
    ("Q1", -0.00013, 0.00414),
    ("Q2", 0.00756, 0.00986),
    ("V1", 0.00053, 0.00250),
    ("V2", 0.00352, 0.00245),
    ("W1", 0.01134, 0.00173),
    ("W2", 0.01017, 0.01142),
    ("W3", -0.00122, 0.00463),
    ("W4", 0.02311, 0.02054),
];

/// Lookup of gain-imbalance constants keyed by band identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GainTable {
    bands: BTreeMap<String, GainImbalance>,
}

impl GainTable {
    pub fn new() -> Self {
        Self {
            bands: BTreeMap::new(),
        }
    }

    /// The nine-year WMAP differencing-assembly table.
    pub fn wmap_nine_year() -> Self {
        let bands = WMAP_IMBALANCE_PAIRS
            .iter()
            .map(|&(band, first, second)| {
                (
                    band.to_string(),
                    GainImbalance::from_radiometer_pair(first, second),
                )
            })
            .collect();
        Self { bands }
    }

    pub fn insert(&mut self, band: impl Into<String>, gain: GainImbalance) {
        self.bands.insert(band.into(), gain);
    }

    pub fn lookup(&self, band: &str) -> Result<GainImbalance, ConfigurationError> {
        self.bands
            .get(band)
            .copied()
            .ok_or_else(|| ConfigurationError::UnknownBand(band.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &GainImbalance)> {
        self.bands.iter().map(|(band, gain)| (band.as_str(), gain))
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }
}

impl Default for GainTable {
    fn default() -> Self {
        Self::wmap_nine_year()
    }
}

// --- Pointing rows ---
//
// Each sample contributes one (intensity) or two (intensity + polarization)
// rows of the pointing matrix. Accumulation, the implicit operator and the
// explicit assembly all consume the same rows, so the preconditioner, the
// right-hand side and both operator strategies describe one matrix.

pub(crate) const MAX_ROW_ENTRIES: usize = 8;

/// One row of the pointing matrix together with the measured value it predicts.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PointingRow {
    entries: [(usize, f64); MAX_ROW_ENTRIES],
    len: usize,
    value: f64,
}

impl PointingRow {
    fn with_value(value: f64) -> Self {
        Self {
            entries: [(0, 0.0); MAX_ROW_ENTRIES],
            len: 0,
            value,
        }
    }

    /// Adds `coefficient` at `index`. A repeated index (both beams on one
    /// pixel) is folded into the existing entry, and an entry that cancels to
    /// zero is removed, so every index appears at most once.
    fn push(&mut self, index: usize, coefficient: f64) {
        if coefficient == 0.0 {
            return;
        }
        let occupied = &self.entries[..self.len];
        match occupied.iter().position(|&(existing, _)| existing == index) {
            Some(slot) => {
                let merged = self.entries[slot].1 + coefficient;
                if merged == 0.0 {
                    self.entries.copy_within(slot + 1..self.len, slot);
                    self.len -= 1;
                } else {
                    self.entries[slot].1 = merged;
                }
            }
            None => {
                self.entries[self.len] = (index, coefficient);
                self.len += 1;
            }
        }
    }

    pub(crate) fn entries(&self) -> &[(usize, f64)] {
        &self.entries[..self.len]
    }

    pub(crate) fn value(&self) -> f64 {
        self.value
    }

    /// Predicted differenced value `row · x`.
    pub(crate) fn project(&self, x: &[f64]) -> f64 {
        self.entries()
            .iter()
            .map(|&(index, coefficient)| coefficient * x[index])
            .sum()
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct SampleRows {
    rows: [PointingRow; 2],
    count: usize,
}

impl SampleRows {
    pub(crate) fn iter(&self) -> impl Iterator<Item = &PointingRow> {
        self.rows[..self.count].iter()
    }
}

/// Turns one stored sample into its pointing rows.
pub(crate) trait PointingKernel: Sync {
    fn rows(&self, sample: &SampleRef) -> SampleRows;
}

/// `d = (1+xbar) T_A - (1-xbar) T_B`.
pub(crate) struct IntensityKernel {
    xbar: f64,
}

impl IntensityKernel {
    pub(crate) fn new(gain: GainImbalance) -> Self {
        Self { xbar: gain.xbar }
    }
}

impl PointingKernel for IntensityKernel {
    fn rows(&self, sample: &SampleRef) -> SampleRows {
        let mut row = PointingRow::with_value(sample.signal);
        row.push(sample.pixel_a, sample.factor_a * (1.0 + self.xbar));
        row.push(sample.pixel_b, -sample.factor_b * (1.0 - self.xbar));
        SampleRows {
            rows: [row, PointingRow::with_value(0.0)],
            count: 1,
        }
    }
}

/// Intensity and polarization channels of a differencing assembly with gain
/// imbalance. Components are stored in blocks: `[T | Q | U | S]`.
///
/// The intensity channel reads
/// `d = (1+xbar) T_A - (1-xbar) T_B + dxbar (P_A + P_B)` and the polarization
/// channel `p = dxbar (T_A + T_B) + (1+xbar) P_A - (1-xbar) P_B`, where
/// `P = Q cos 2psi + U sin 2psi + S`.
pub(crate) struct PolarizationKernel {
    gain: GainImbalance,
    n_pixels: usize,
}

impl PolarizationKernel {
    pub(crate) fn new(gain: GainImbalance, n_pixels: usize) -> Self {
        Self { gain, n_pixels }
    }
}

impl PointingKernel for PolarizationKernel {
    fn rows(&self, sample: &SampleRef) -> SampleRows {
        let np = self.n_pixels;
        let GainImbalance { xbar, dxbar } = self.gain;
        let (a, b) = (sample.pixel_a, sample.pixel_b);
        let (fa, fb) = (sample.factor_a, sample.factor_b);
        let (oa, ob) = (sample.orientation_a, sample.orientation_b);

        let mut intensity = PointingRow::with_value(sample.signal);
        intensity.push(a, fa * (1.0 + xbar));
        intensity.push(np + a, fa * dxbar * oa.cos2);
        intensity.push(2 * np + a, fa * dxbar * oa.sin2);
        intensity.push(3 * np + a, fa * dxbar);
        intensity.push(b, -fb * (1.0 - xbar));
        intensity.push(np + b, fb * dxbar * ob.cos2);
        intensity.push(2 * np + b, fb * dxbar * ob.sin2);
        intensity.push(3 * np + b, fb * dxbar);

        let mut polarization = PointingRow::with_value(sample.polarization);
        polarization.push(a, fa * dxbar);
        polarization.push(np + a, fa * (1.0 + xbar) * oa.cos2);
        polarization.push(2 * np + a, fa * (1.0 + xbar) * oa.sin2);
        polarization.push(3 * np + a, fa * (1.0 + xbar));
        polarization.push(b, fb * dxbar);
        polarization.push(np + b, -fb * (1.0 - xbar) * ob.cos2);
        polarization.push(2 * np + b, -fb * (1.0 - xbar) * ob.sin2);
        polarization.push(3 * np + b, -fb * (1.0 - xbar));

        SampleRows {
            rows: [intensity, polarization],
            count: 2,
        }
    }
}
