use crate::model::{GainImbalance, GainTable, MeasurementModel, Pixelization};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Invalid inputs detected before any numerical work starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("Convergence tolerance eps must be finite and in (0, 1), got {0}.")]
    InvalidTolerance(f64),
    #[error("Iteration cap imax must be at least 1.")]
    InvalidIterationCap,
    #[error("Residual refresh interval must be at least 1.")]
    InvalidRefreshInterval,
    #[error("Worker pool size must be at least 1.")]
    InvalidThreadCount,
    #[error("Pixelization nside must be positive, got {0}.")]
    InvalidPixelization(u32),
    #[error("Band '{0}' has no entry in the gain-imbalance table.")]
    UnknownBand(String),
    #[error("Gain imbalance for band '{0}' is not finite.")]
    NonFiniteGain(String),
    #[error("Array '{field}' has {found} entries, but the shard has {expected} samples.")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Sample {sample} references pixel {pixel}, outside [0, {n_pixels}).")]
    PixelOutOfRange {
        sample: usize,
        pixel: u32,
        n_pixels: usize,
    },
    #[error("Sample {sample} has a non-finite '{field}' value.")]
    NonFiniteSample { sample: usize, field: &'static str },
    #[error("The intensity+polarization model needs polarization and orientation arrays.")]
    MissingPolarizationChannel,
    #[error("Noise estimate for the {region} region is degenerate (sigma = {sigma}).")]
    DegenerateNoise { region: &'static str, sigma: f64 },
    #[error("Processing mask covers {found} pixels, but the pixelization has {expected}.")]
    MaskLengthMismatch { expected: usize, found: usize },
    #[error("Cannot combine sample stores with different {0}.")]
    IncompatibleStores(&'static str),
}

/// How the normal-equations operator is applied during the solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorStrategy {
    /// Assemble `A^T N^-1 A` once as a sparse matrix.
    Explicit,
    /// Re-traverse the samples on every application.
    #[default]
    Implicit,
}

fn default_imax() -> usize {
    3000
}

fn default_eps() -> f64 {
    1e-16
}

fn default_refresh_interval() -> usize {
    50
}

fn default_true() -> bool {
    true
}

/// Solver hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    #[serde(default)]
    pub model: MeasurementModel,
    #[serde(default)]
    pub strategy: OperatorStrategy,
    /// Iteration cap.
    #[serde(default = "default_imax")]
    pub imax: usize,
    /// Relative tolerance; the solve converges once `delta_new <= eps^2 * delta_0`.
    #[serde(default = "default_eps")]
    pub eps: f64,
    /// Every this many iterations the residual is recomputed exactly.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: usize,
    /// Stop as soon as `delta_new` grows.
    #[serde(default = "default_true")]
    pub halt_on_stall: bool,
    /// Abort the whole accumulation when any shard fails.
    #[serde(default)]
    pub strict: bool,
    /// Worker pool size; defaults to the number of logical CPUs.
    #[serde(default)]
    pub threads: Option<usize>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            model: MeasurementModel::default(),
            strategy: OperatorStrategy::default(),
            imax: default_imax(),
            eps: default_eps(),
            refresh_interval: default_refresh_interval(),
            halt_on_stall: true,
            strict: false,
            threads: None,
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.eps.is_finite() || self.eps <= 0.0 || self.eps >= 1.0 {
            return Err(ConfigurationError::InvalidTolerance(self.eps));
        }
        if self.imax == 0 {
            return Err(ConfigurationError::InvalidIterationCap);
        }
        if self.refresh_interval == 0 {
            return Err(ConfigurationError::InvalidRefreshInterval);
        }
        if self.threads == Some(0) {
            return Err(ConfigurationError::InvalidThreadCount);
        }
        Ok(())
    }

    pub fn worker_threads(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get).max(1)
    }
}

/// Errors reading or writing a configuration file.
#[derive(Error, Debug)]
pub enum ConfigFileError {
    #[error("Failed to read or write configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(#[from] ConfigurationError),
}

/// Everything needed to turn a band's shards into a map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapmakingConfig {
    pub band: String,
    /// When false, the band's gain imbalance is ignored (`xbar = dxbar = 0`).
    #[serde(default = "default_true")]
    pub imbalance: bool,
    #[serde(default)]
    pub pixelization: Pixelization,
    #[serde(default)]
    pub solver: SolverConfig,
    /// Overrides the built-in gain table.
    #[serde(default)]
    pub gain_table: Option<GainTable>,
}

impl MapmakingConfig {
    pub fn new(band: impl Into<String>) -> Self {
        Self {
            band: band.into(),
            imbalance: true,
            pixelization: Pixelization::default(),
            solver: SolverConfig::default(),
            gain_table: None,
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigFileError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigFileError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigFileError> {
        let text = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.pixelization.validate()?;
        self.solver.validate()?;
        self.gain().map(|_| ())
    }

    /// Resolves the gain-imbalance pair for the configured band.
    pub fn gain(&self) -> Result<GainImbalance, ConfigurationError> {
        if !self.imbalance {
            return Ok(GainImbalance::NONE);
        }
        let gain = match &self.gain_table {
            Some(table) => table.lookup(&self.band)?,
            None => GainTable::wmap_nine_year().lookup(&self.band)?,
        };
        if !gain.is_finite() {
            return Err(ConfigurationError::NonFiniteGain(self.band.clone()));
        }
        Ok(gain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SolverConfig::default();
        assert_eq!(config.imax, 3000);
        assert_eq!(config.eps, 1e-16);
        assert_eq!(config.refresh_interval, 50);
        assert!(config.halt_on_stall);
        assert!(!config.strict);
        assert_eq!(config.strategy, OperatorStrategy::Implicit);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_solver_parameters() {
        let mut config = SolverConfig::default();
        config.eps = 0.0;
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::InvalidTolerance(0.0))
        );

        let mut config = SolverConfig::default();
        config.eps = f64::NAN;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidTolerance(_))
        ));

        let mut config = SolverConfig::default();
        config.imax = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::InvalidIterationCap)
        );

        let mut config = SolverConfig::default();
        config.refresh_interval = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::InvalidRefreshInterval)
        );

        let mut config = SolverConfig::default();
        config.threads = Some(0);
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::InvalidThreadCount)
        );
    }

    #[test]
    fn parses_toml_with_defaults() {
        let text = r#"
band = "V1"

[pixelization]
nside = 16

[solver]
model = "intensity_polarization"
strategy = "explicit"
eps = 1e-8
"#;
        let config = MapmakingConfig::from_toml_str(text).unwrap();
        assert_eq!(config.band, "V1");
        assert!(config.imbalance);
        assert_eq!(config.pixelization.n_pixels(), 3072);
        assert_eq!(config.solver.model, MeasurementModel::IntensityPolarization);
        assert_eq!(config.solver.strategy, OperatorStrategy::Explicit);
        assert_eq!(config.solver.imax, 3000);
        assert_eq!(config.solver.refresh_interval, 50);
        let gain = config.gain().unwrap();
        assert!((gain.xbar - 0.001515).abs() < 1e-12);
    }

    #[test]
    fn gain_table_override_and_disabled_imbalance() {
        let text = r#"
band = "X9"

[gain_table]
X9 = { xbar = 0.5, dxbar = -0.25 }
"#;
        let config = MapmakingConfig::from_toml_str(text).unwrap();
        assert_eq!(
            config.gain().unwrap(),
            GainImbalance {
                xbar: 0.5,
                dxbar: -0.25
            }
        );

        let mut disabled = config.clone();
        disabled.imbalance = false;
        assert_eq!(disabled.gain().unwrap(), GainImbalance::NONE);
    }

    #[test]
    fn unknown_band_fails_validation() {
        let err = MapmakingConfig::from_toml_str("band = \"nope\"").unwrap_err();
        assert!(matches!(
            err,
            ConfigFileError::Invalid(ConfigurationError::UnknownBand(_))
        ));
    }

    #[test]
    fn save_then_load_preserves_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diffmap.toml");
        let mut config = MapmakingConfig::new("K1");
        config.pixelization = Pixelization { nside: 8 };
        config.solver.threads = Some(2);
        config.solver.strict = true;
        config.save(&path).unwrap();

        let loaded = MapmakingConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
