use crate::config::ConfigurationError;
use crate::samples::{
    NoiseEstimate, PixelId, PolarizationChannel, ProcessingMask, Shard, ShardError, ShardSource,
};
use crate::skymap::SkyMap;
use crate::solver::SolveOutcome;
use serde::Deserialize;
use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MapIoError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed mask entry in {path} at line {line}: '{value}'")]
    MalformedMask {
        path: String,
        line: usize,
        value: String,
    },
}

/// One line of a pre-decoded shard file.
#[derive(Debug, Deserialize)]
struct ShardRow {
    pixel_a: PixelId,
    pixel_b: PixelId,
    usable: u8,
    signal: f64,
    noise: f64,
    #[serde(default)]
    polarization: Option<f64>,
    #[serde(default)]
    psi_a: Option<f64>,
    #[serde(default)]
    psi_b: Option<f64>,
}

/// Delimited text file of already decoded samples with columns
/// `pixel_a,pixel_b,usable,signal,noise[,polarization,psi_a,psi_b]`.
///
/// Files are read lazily, on the accumulation worker that handles them.
#[derive(Debug, Clone)]
pub struct CsvShardSource {
    path: PathBuf,
    label: String,
}

impl CsvShardSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let label = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self { path, label }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn csv_error(&self, source: csv::Error) -> ShardError {
        ShardError::Csv {
            label: self.label.clone(),
            source,
        }
    }
}

impl ShardSource for CsvShardSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn load(&self) -> Result<Cow<'_, Shard>, ShardError> {
        let file = File::open(&self.path).map_err(|source| ShardError::Io {
            label: self.label.clone(),
            source,
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_reader(BufReader::new(file));

        let mut pixel_a = Vec::new();
        let mut pixel_b = Vec::new();
        let mut usable = Vec::new();
        let mut signal = Vec::new();
        let mut noise = Vec::new();
        let mut polarization = Vec::new();
        let mut psi_a = Vec::new();
        let mut psi_b = Vec::new();
        for record in reader.deserialize::<ShardRow>() {
            let row = record.map_err(|err| self.csv_error(err))?;
            pixel_a.push(row.pixel_a);
            pixel_b.push(row.pixel_b);
            usable.push(row.usable != 0);
            signal.push(row.signal);
            noise.push(row.noise);
            if let (Some(p), Some(a), Some(b)) = (row.polarization, row.psi_a, row.psi_b) {
                polarization.push(p);
                psi_a.push(a);
                psi_b.push(b);
            }
        }

        let polarization = match polarization.len() {
            0 => None,
            found if found == pixel_a.len() => Some(PolarizationChannel {
                signal: polarization,
                psi_a,
                psi_b,
            }),
            found => {
                return Err(ShardError::Configuration {
                    label: self.label.clone(),
                    source: ConfigurationError::LengthMismatch {
                        field: "polarization",
                        expected: pixel_a.len(),
                        found,
                    },
                });
            }
        };

        log::debug!("Read {} samples from {}", pixel_a.len(), self.path.display());
        Ok(Cow::Owned(Shard {
            label: self.label.clone(),
            pixel_a,
            pixel_b,
            usable,
            signal,
            noise: NoiseEstimate::FromSamples(noise),
            polarization,
        }))
    }
}

/// Reads a processing mask with one `0` (high emission) or `1` (usable) per
/// line. Blank lines and lines starting with `#` are skipped.
pub fn load_mask(path: &Path) -> Result<ProcessingMask, MapIoError> {
    let reader = BufReader::new(File::open(path)?);
    let mut flags = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let value = line.trim();
        if value.is_empty() || value.starts_with('#') {
            continue;
        }
        match value {
            "0" => flags.push(false),
            "1" => flags.push(true),
            other => {
                return Err(MapIoError::MalformedMask {
                    path: path.display().to_string(),
                    line: idx + 1,
                    value: other.to_string(),
                });
            }
        }
    }
    log::info!(
        "Loaded processing mask from {} ({} pixels, {} masked)",
        path.display(),
        flags.len(),
        flags.iter().filter(|usable| !**usable).count()
    );
    Ok(ProcessingMask::from_flags(flags))
}

/// Output files written for a run with the given prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub map: PathBuf,
    pub trace: PathBuf,
}

impl OutputPaths {
    pub fn from_prefix(prefix: &Path) -> Self {
        let with_suffix = |suffix: &str| {
            let mut name = prefix.as_os_str().to_owned();
            name.push(suffix);
            PathBuf::from(name)
        };
        Self {
            map: with_suffix(".map.tsv"),
            trace: with_suffix(".trace.tsv"),
        }
    }
}

/// Writes `pixel, T[, Q, U, S], observed`, one row per pixel.
pub fn write_map_tsv(path: &Path, map: &SkyMap) -> Result<(), MapIoError> {
    prepare_output_path(path)?;
    let mut writer = BufWriter::new(File::create(path)?);

    let names = map.model().component_names();
    write!(writer, "pixel")?;
    for name in names {
        write!(writer, "\t{name}")?;
    }
    writeln!(writer, "\tobserved")?;

    let values = map.values();
    let n_pixels = map.n_pixels();
    for pixel in 0..n_pixels {
        write!(writer, "{pixel}")?;
        for c in 0..names.len() {
            write!(writer, "\t{}", values[c * n_pixels + pixel])?;
        }
        writeln!(writer, "\t{}", u8::from(map.is_observed(pixel)))?;
    }

    writer.flush()?;
    Ok(())
}

/// Writes the convergence history: `delta_0` as iteration 0, then one row per
/// completed iteration.
pub fn write_trace_tsv(path: &Path, outcome: &SolveOutcome) -> Result<(), MapIoError> {
    prepare_output_path(path)?;
    let mut writer = BufWriter::new(File::create(path)?);

    writeln!(writer, "iteration\tdelta_new")?;
    writeln!(writer, "0\t{:e}", outcome.delta_0)?;
    for record in &outcome.trace {
        writeln!(writer, "{}\t{:e}", record.iteration, record.delta_new)?;
    }

    writer.flush()?;
    Ok(())
}

fn prepare_output_path(path: &Path) -> Result<(), io::Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
