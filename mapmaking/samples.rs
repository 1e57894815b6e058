use crate::config::ConfigurationError;
use crate::model::{GainImbalance, MeasurementModel};
use itertools::izip;
use std::borrow::Cow;
use thiserror::Error;

/// Index of a sky pixel in `[0, P)`.
pub type PixelId = u32;

/// Noise description supplied with a shard.
#[derive(Debug, Clone, PartialEq)]
pub enum NoiseEstimate {
    /// Per-sample noise-only combination. The region sigmas are the population
    /// standard deviations over the usable samples of each region.
    FromSamples(Vec<f64>),
    /// Sigmas already known to the caller.
    Known { sigma_lo: f64, sigma_hi: f64 },
}

/// Polarization-sensitive channel of a shard.
#[derive(Debug, Clone, PartialEq)]
pub struct PolarizationChannel {
    /// `p_t`, the polarization-sensitive differenced value.
    pub signal: Vec<f64>,
    /// Orientation of beam A in radians.
    pub psi_a: Vec<f64>,
    /// Orientation of beam B in radians.
    pub psi_b: Vec<f64>,
}

/// Pre-decoded samples of one input file, as handed over by the decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct Shard {
    pub label: String,
    pub pixel_a: Vec<PixelId>,
    pub pixel_b: Vec<PixelId>,
    /// Data-quality flag: `true` when the sample carries no flag bits.
    pub usable: Vec<bool>,
    /// `d_t`, the intensity differenced value.
    pub signal: Vec<f64>,
    pub noise: NoiseEstimate,
    pub polarization: Option<PolarizationChannel>,
}

impl Shard {
    pub fn len(&self) -> usize {
        self.pixel_a.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixel_a.is_empty()
    }
}

/// Failure of a single shard. Tagged with the shard label so lenient runs can
/// report it and carry on.
#[derive(Error, Debug)]
pub enum ShardError {
    #[error("shard '{label}': {source}")]
    Configuration {
        label: String,
        #[source]
        source: ConfigurationError,
    },
    #[error("shard '{label}': I/O error: {source}")]
    Io {
        label: String,
        #[source]
        source: std::io::Error,
    },
    #[error("shard '{label}': malformed record: {source}")]
    Csv {
        label: String,
        #[source]
        source: csv::Error,
    },
}

impl ShardError {
    pub fn label(&self) -> &str {
        match self {
            Self::Configuration { label, .. } | Self::Io { label, .. } | Self::Csv { label, .. } => {
                label
            }
        }
    }
}

/// Anything that can produce a shard. Loading runs on the accumulation
/// workers, so decoding of independent files happens in parallel.
pub trait ShardSource: Sync {
    fn label(&self) -> &str;
    fn load(&self) -> Result<Cow<'_, Shard>, ShardError>;
}

impl ShardSource for Shard {
    fn label(&self) -> &str {
        &self.label
    }

    fn load(&self) -> Result<Cow<'_, Shard>, ShardError> {
        Ok(Cow::Borrowed(self))
    }
}

// --- Processing mask ---

/// Per-pixel usability under the processing mask. `false` marks a
/// high-emission pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingMask {
    usable: Vec<bool>,
}

impl ProcessingMask {
    pub fn all_usable(n_pixels: usize) -> Self {
        Self {
            usable: vec![true; n_pixels],
        }
    }

    pub fn from_flags(usable: Vec<bool>) -> Self {
        Self { usable }
    }

    pub fn len(&self) -> usize {
        self.usable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.usable.is_empty()
    }

    pub fn is_usable(&self, pixel: usize) -> bool {
        self.usable[pixel]
    }

    pub fn masked_count(&self) -> usize {
        self.usable.iter().filter(|usable| !**usable).count()
    }

    pub(crate) fn check_pixels(&self, n_pixels: usize) -> Result<(), ConfigurationError> {
        if self.usable.len() != n_pixels {
            return Err(ConfigurationError::MaskLengthMismatch {
                expected: n_pixels,
                found: self.usable.len(),
            });
        }
        Ok(())
    }
}

/// Asymmetric masking factors `(f_A, f_B)`.
///
/// When one beam sits in a high-emission region and the other does not, only
/// the pixel in the high-emission region is updated. Pairs in the same regime
/// update both pixels, and unusable samples update nothing.
pub fn mask_factors(usable_a: bool, usable_b: bool, sample_usable: bool) -> (f64, f64) {
    if !sample_usable {
        return (0.0, 0.0);
    }
    let m_a = f64::from(u8::from(usable_a));
    let m_b = f64::from(u8::from(usable_b));
    (1.0 - m_a * (1.0 - m_b), 1.0 - m_b * (1.0 - m_a))
}

// --- Region noise ---

/// Noise level of the two masking regimes of a shard. `None` when the region
/// holds no usable samples.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RegionSigmas {
    pub sigma_lo: Option<f64>,
    pub sigma_hi: Option<f64>,
}

impl RegionSigmas {
    fn weight(&self, high_emission: bool) -> f64 {
        let sigma = if high_emission {
            self.sigma_hi
        } else {
            self.sigma_lo
        };
        sigma.map_or(0.0, |s| 1.0 / (s * s))
    }
}

/// Population (ddof = 0) standard deviation, single pass.
fn population_std(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut count = 0usize;
    let mut mean = 0.0;
    let mut m2 = 0.0;
    for value in values {
        count += 1;
        let delta = value - mean;
        mean += delta / count as f64;
        m2 += delta * (value - mean);
    }
    (count > 0).then(|| (m2 / count as f64).sqrt())
}

fn checked_sigma(sigma: Option<f64>, region: &'static str) -> Result<Option<f64>, ConfigurationError> {
    match sigma {
        Some(s) if !s.is_finite() || s <= 0.0 => {
            Err(ConfigurationError::DegenerateNoise { region, sigma: s })
        }
        other => Ok(other),
    }
}

/// Region sigmas estimated from the noise column. A region whose estimate is
/// zero (a single sample or a constant column) gets zero weight and only its
/// own samples drop out. The shard is rejected only when no region is left.
fn estimated_sigmas(
    label: &str,
    sigma_lo: Option<f64>,
    sigma_hi: Option<f64>,
) -> Result<RegionSigmas, ConfigurationError> {
    let usable = |sigma: Option<f64>| sigma.filter(|s| s.is_finite() && *s > 0.0);
    let sigmas = RegionSigmas {
        sigma_lo: usable(sigma_lo),
        sigma_hi: usable(sigma_hi),
    };
    let regions = [
        ("low-emission", sigma_lo, sigmas.sigma_lo),
        ("high-emission", sigma_hi, sigmas.sigma_hi),
    ];
    if sigmas.sigma_lo.is_none() && sigmas.sigma_hi.is_none() {
        let degenerate = regions
            .iter()
            .find_map(|&(region, estimate, _)| estimate.map(|sigma| (region, sigma)));
        if let Some((region, sigma)) = degenerate {
            return Err(ConfigurationError::DegenerateNoise { region, sigma });
        }
    }
    for (region, estimate, kept) in regions {
        if let (Some(sigma), None) = (estimate, kept) {
            log::warn!(
                "Shard '{label}': {region} noise estimate is degenerate (sigma = {sigma:e}); its samples get zero weight"
            );
        }
    }
    Ok(sigmas)
}

// --- Sample store ---

/// `cos 2psi` and `sin 2psi` of one beam.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Orientation {
    pub cos2: f64,
    pub sin2: f64,
}

impl Orientation {
    pub fn from_angle(psi: f64) -> Self {
        let (sin2, cos2) = (2.0 * psi).sin_cos();
        Self { cos2, sin2 }
    }
}

/// A single stored sample, by value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRef {
    pub pixel_a: usize,
    pub pixel_b: usize,
    pub factor_a: f64,
    pub factor_b: f64,
    /// Region weight `sigma^-2`.
    pub weight: f64,
    pub signal: f64,
    pub polarization: f64,
    pub orientation_a: Orientation,
    pub orientation_b: Orientation,
}

#[derive(Debug, Clone, Default)]
struct PolarizationSamples {
    signal: Vec<f64>,
    orientation_a: Vec<Orientation>,
    orientation_b: Vec<Orientation>,
}

/// Diagnostics recorded for each shard that went into a store.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardSummary {
    pub label: String,
    pub samples: usize,
    pub usable: usize,
    pub high_emission: usize,
    pub sigmas: RegionSigmas,
}

/// Immutable, ordered per-sample records in struct-of-arrays layout.
#[derive(Debug, Clone)]
pub struct SampleStore {
    model: MeasurementModel,
    gain: GainImbalance,
    n_pixels: usize,
    pixel_a: Vec<PixelId>,
    pixel_b: Vec<PixelId>,
    factor_a: Vec<f64>,
    factor_b: Vec<f64>,
    weight: Vec<f64>,
    signal: Vec<f64>,
    polarization: Option<PolarizationSamples>,
    summaries: Vec<ShardSummary>,
}

impl SampleStore {
    /// Validates a shard and derives the per-sample masking factors and
    /// region weights.
    pub fn from_shard(
        shard: &Shard,
        mask: &ProcessingMask,
        model: MeasurementModel,
        gain: GainImbalance,
    ) -> Result<Self, ConfigurationError> {
        let n_pixels = mask.len();
        let n = shard.len();
        check_len("pixel_b", n, shard.pixel_b.len())?;
        check_len("usable", n, shard.usable.len())?;
        check_len("signal", n, shard.signal.len())?;
        if let NoiseEstimate::FromSamples(noise) = &shard.noise {
            check_len("noise", n, noise.len())?;
        }

        let polarization = match (model.requires_polarization(), &shard.polarization) {
            (true, Some(channel)) => {
                check_len("polarization", n, channel.signal.len())?;
                check_len("psi_a", n, channel.psi_a.len())?;
                check_len("psi_b", n, channel.psi_b.len())?;
                Some(channel)
            }
            (true, None) => return Err(ConfigurationError::MissingPolarizationChannel),
            (false, _) => None,
        };

        for (t, (&a, &b)) in shard.pixel_a.iter().zip(&shard.pixel_b).enumerate() {
            for pixel in [a, b] {
                if pixel as usize >= n_pixels {
                    return Err(ConfigurationError::PixelOutOfRange {
                        sample: t,
                        pixel,
                        n_pixels,
                    });
                }
            }
        }

        for (t, &usable) in shard.usable.iter().enumerate() {
            if !usable {
                continue;
            }
            check_finite(t, "signal", shard.signal[t])?;
            if let NoiseEstimate::FromSamples(noise) = &shard.noise {
                check_finite(t, "noise", noise[t])?;
            }
            if let Some(channel) = polarization {
                check_finite(t, "polarization", channel.signal[t])?;
                check_finite(t, "psi_a", channel.psi_a[t])?;
                check_finite(t, "psi_b", channel.psi_b[t])?;
            }
        }

        let high_emission: Vec<bool> = shard
            .pixel_a
            .iter()
            .zip(&shard.pixel_b)
            .map(|(&a, &b)| !mask.is_usable(a as usize) || !mask.is_usable(b as usize))
            .collect();

        let sigmas = match &shard.noise {
            NoiseEstimate::FromSamples(noise) => {
                let region = |high: bool| {
                    izip!(noise, &high_emission, &shard.usable)
                        .filter(move |&(_, &h, &u)| u && h == high)
                        .map(|(&value, _, _)| value)
                };
                estimated_sigmas(
                    &shard.label,
                    population_std(region(false)),
                    population_std(region(true)),
                )?
            }
            NoiseEstimate::Known { sigma_lo, sigma_hi } => RegionSigmas {
                sigma_lo: checked_sigma(Some(*sigma_lo), "low-emission")?,
                sigma_hi: checked_sigma(Some(*sigma_hi), "high-emission")?,
            },
        };

        let mut factor_a = Vec::with_capacity(n);
        let mut factor_b = Vec::with_capacity(n);
        let mut weight = Vec::with_capacity(n);
        for (&a, &b, &usable, &high) in
            izip!(&shard.pixel_a, &shard.pixel_b, &shard.usable, &high_emission)
        {
            let (fa, fb) = mask_factors(mask.is_usable(a as usize), mask.is_usable(b as usize), usable);
            factor_a.push(fa);
            factor_b.push(fb);
            weight.push(if usable { sigmas.weight(high) } else { 0.0 });
        }

        let polarization = polarization.map(|channel| PolarizationSamples {
            signal: channel.signal.clone(),
            orientation_a: channel.psi_a.iter().map(|&psi| Orientation::from_angle(psi)).collect(),
            orientation_b: channel.psi_b.iter().map(|&psi| Orientation::from_angle(psi)).collect(),
        });

        let summary = ShardSummary {
            label: shard.label.clone(),
            samples: n,
            usable: shard.usable.iter().filter(|u| **u).count(),
            high_emission: high_emission.iter().filter(|h| **h).count(),
            sigmas,
        };
        log::debug!(
            "Shard '{}': {} samples ({} usable, {} touching masked pixels), sigma_lo = {:?}, sigma_hi = {:?}",
            summary.label,
            summary.samples,
            summary.usable,
            summary.high_emission,
            sigmas.sigma_lo,
            sigmas.sigma_hi
        );

        Ok(Self {
            model,
            gain,
            n_pixels,
            pixel_a: shard.pixel_a.clone(),
            pixel_b: shard.pixel_b.clone(),
            factor_a,
            factor_b,
            weight,
            signal: shard.signal.clone(),
            polarization,
            summaries: vec![summary],
        })
    }

    /// Joins the stores of several shards, preserving their order.
    pub fn concat(stores: Vec<SampleStore>) -> Result<Option<Self>, ConfigurationError> {
        let mut iter = stores.into_iter();
        let Some(mut merged) = iter.next() else {
            return Ok(None);
        };
        for store in iter {
            if store.model != merged.model {
                return Err(ConfigurationError::IncompatibleStores("measurement models"));
            }
            if store.n_pixels != merged.n_pixels {
                return Err(ConfigurationError::IncompatibleStores("pixel counts"));
            }
            if store.gain != merged.gain {
                return Err(ConfigurationError::IncompatibleStores("gain imbalances"));
            }
            merged.pixel_a.extend(store.pixel_a);
            merged.pixel_b.extend(store.pixel_b);
            merged.factor_a.extend(store.factor_a);
            merged.factor_b.extend(store.factor_b);
            merged.weight.extend(store.weight);
            merged.signal.extend(store.signal);
            if let (Some(target), Some(source)) = (merged.polarization.as_mut(), store.polarization) {
                target.signal.extend(source.signal);
                target.orientation_a.extend(source.orientation_a);
                target.orientation_b.extend(source.orientation_b);
            }
            merged.summaries.extend(store.summaries);
        }
        Ok(Some(merged))
    }

    pub fn model(&self) -> MeasurementModel {
        self.model
    }

    pub fn gain(&self) -> GainImbalance {
        self.gain
    }

    pub fn n_pixels(&self) -> usize {
        self.n_pixels
    }

    /// Length of a map vector under this store's model.
    pub fn map_len(&self) -> usize {
        self.model.components() * self.n_pixels
    }

    pub fn len(&self) -> usize {
        self.pixel_a.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixel_a.is_empty()
    }

    pub fn summaries(&self) -> &[ShardSummary] {
        &self.summaries
    }

    pub fn sample(&self, t: usize) -> SampleRef {
        let (polarization, orientation_a, orientation_b) = match &self.polarization {
            Some(pol) => (pol.signal[t], pol.orientation_a[t], pol.orientation_b[t]),
            None => (0.0, Orientation::default(), Orientation::default()),
        };
        SampleRef {
            pixel_a: self.pixel_a[t] as usize,
            pixel_b: self.pixel_b[t] as usize,
            factor_a: self.factor_a[t],
            factor_b: self.factor_b[t],
            weight: self.weight[t],
            signal: self.signal[t],
            polarization,
            orientation_a,
            orientation_b,
        }
    }
}

fn check_len(field: &'static str, expected: usize, found: usize) -> Result<(), ConfigurationError> {
    if expected != found {
        return Err(ConfigurationError::LengthMismatch {
            field,
            expected,
            found,
        });
    }
    Ok(())
}

fn check_finite(sample: usize, field: &'static str, value: f64) -> Result<(), ConfigurationError> {
    if !value.is_finite() {
        return Err(ConfigurationError::NonFiniteSample { sample, field });
    }
    Ok(())
}
