use diffmap::accumulate::AccumulationError;
use diffmap::io::{CsvShardSource, load_mask};
use diffmap::progress::NoopProgress;
use diffmap::samples::PolarizationChannel;
use diffmap::{
    GainImbalance, GainTable, MapmakingConfig, MeasurementModel, NoiseEstimate, OperatorStrategy,
    PipelineError, Pixelization, ProcessingMask, Shard, SolverState, run_mapmaking,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::fmt::Write as FmtWrite;
use std::fs;
use std::path::Path;

const N_PIXELS: usize = 12;

fn config(model: MeasurementModel, strategy: OperatorStrategy) -> MapmakingConfig {
    let mut table = GainTable::new();
    table.insert("SIM", GainImbalance::NONE);
    let mut config = MapmakingConfig::new("SIM");
    config.gain_table = Some(table);
    config.pixelization = Pixelization { nside: 1 };
    config.solver.model = model;
    config.solver.strategy = strategy;
    config.solver.eps = 1e-10;
    config.solver.halt_on_stall = false;
    config.solver.threads = Some(3);
    config
}

struct SkyTruth {
    t: Vec<f64>,
    q: Vec<f64>,
    u: Vec<f64>,
    s: Vec<f64>,
}

impl SkyTruth {
    fn random(rng: &mut StdRng) -> Self {
        let mut draw = || -> Vec<f64> { (0..N_PIXELS).map(|_| rng.gen_range(-1.0..1.0)).collect() };
        Self {
            t: draw(),
            q: draw(),
            u: draw(),
            s: draw(),
        }
    }

    fn polarized(&self, pixel: usize, psi: f64) -> f64 {
        self.q[pixel] * (2.0 * psi).cos() + self.u[pixel] * (2.0 * psi).sin() + self.s[pixel]
    }
}

/// Noise-free differenced observations of `truth` for a balanced instrument.
fn observe(rng: &mut StdRng, truth: &SkyTruth, samples: usize, label: &str) -> Shard {
    let mut shard = Shard {
        label: label.to_string(),
        pixel_a: Vec::with_capacity(samples),
        pixel_b: Vec::with_capacity(samples),
        usable: vec![true; samples],
        signal: Vec::with_capacity(samples),
        noise: NoiseEstimate::Known {
            sigma_lo: 1.0,
            sigma_hi: 1.0,
        },
        polarization: None,
    };
    let mut channel = PolarizationChannel {
        signal: Vec::with_capacity(samples),
        psi_a: Vec::with_capacity(samples),
        psi_b: Vec::with_capacity(samples),
    };
    for _ in 0..samples {
        let a = rng.gen_range(0..N_PIXELS);
        let b = (a + rng.gen_range(1..N_PIXELS)) % N_PIXELS;
        let psi_a = rng.gen_range(0.0..PI);
        let psi_b = rng.gen_range(0.0..PI);
        shard.pixel_a.push(a as u32);
        shard.pixel_b.push(b as u32);
        shard.signal.push(truth.t[a] - truth.t[b]);
        channel.signal.push(truth.polarized(a, psi_a) - truth.polarized(b, psi_b));
        channel.psi_a.push(psi_a);
        channel.psi_b.push(psi_b);
    }
    shard.polarization = Some(channel);
    shard
}

fn centered(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let values: Vec<f64> = values.collect();
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.into_iter().map(|v| v - mean).collect()
}

fn assert_close(label: &str, actual: &[f64], expected: &[f64], tolerance: f64) {
    for (pixel, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() < tolerance,
            "{label} pixel {pixel}: got {a}, expected {e}"
        );
    }
}

#[test]
fn intensity_map_is_recovered_up_to_its_monopole() {
    let mut rng = StdRng::seed_from_u64(42);
    let truth = SkyTruth::random(&mut rng);
    let shards = vec![
        observe(&mut rng, &truth, 400, "first"),
        observe(&mut rng, &truth, 400, "second"),
    ];

    for strategy in [OperatorStrategy::Explicit, OperatorStrategy::Implicit] {
        let run = run_mapmaking(
            &config(MeasurementModel::Intensity, strategy),
            &shards,
            None,
            &mut NoopProgress,
            None,
        )
        .unwrap();
        assert_eq!(run.outcome.state, SolverState::Converged);
        assert_eq!(run.shards_used, 2);
        assert_eq!(run.summaries.len(), 2);
        let t = run.map.component(0).unwrap();
        assert_close(
            "T",
            &centered(t.iter().copied()),
            &centered(truth.t.iter().copied()),
            1e-6,
        );
    }
}

#[test]
fn polarization_components_are_recovered() {
    let mut rng = StdRng::seed_from_u64(7);
    let truth = SkyTruth::random(&mut rng);
    let shards = vec![observe(&mut rng, &truth, 4000, "pol")];

    let run = run_mapmaking(
        &config(MeasurementModel::IntensityPolarization, OperatorStrategy::Implicit),
        &shards,
        None,
        &mut NoopProgress,
        None,
    )
    .unwrap();
    assert_eq!(run.outcome.state, SolverState::Converged);

    let map = &run.map;
    let component = |c: usize| map.component(c).unwrap().to_vec();
    // Without gain imbalance the T and S offsets are invisible; Q and U are not.
    assert_close(
        "T",
        &centered(component(0).into_iter()),
        &centered(truth.t.iter().copied()),
        1e-5,
    );
    assert_close("Q", &component(1), &truth.q, 1e-5);
    assert_close("U", &component(2), &truth.u, 1e-5);
    assert_close(
        "S",
        &centered(component(3).into_iter()),
        &centered(truth.s.iter().copied()),
        1e-5,
    );
}

#[test]
fn explicit_and_implicit_runs_agree() {
    let mut rng = StdRng::seed_from_u64(99);
    let truth = SkyTruth::random(&mut rng);
    let shards = vec![
        observe(&mut rng, &truth, 1500, "a"),
        observe(&mut rng, &truth, 1500, "b"),
    ];
    let [explicit, implicit] =
        [OperatorStrategy::Explicit, OperatorStrategy::Implicit].map(|strategy| {
            let mut config = config(MeasurementModel::IntensityPolarization, strategy);
            config.solver.imax = 25;
            run_mapmaking(&config, &shards, None, &mut NoopProgress, None).unwrap()
        });
    assert_eq!(explicit.outcome.iterations, implicit.outcome.iterations);
    for (a, b) in explicit
        .map
        .values()
        .iter()
        .zip(implicit.map.values().iter())
    {
        assert!((a - b).abs() <= 1e-6 * a.abs().max(1.0), "{a} vs {b}");
    }
}

#[test]
fn masked_pixels_only_update_high_emission_side() {
    let mut rng = StdRng::seed_from_u64(5);
    let truth = SkyTruth::random(&mut rng);
    let shard = observe(&mut rng, &truth, 600, "masked");
    let mut flags = vec![true; N_PIXELS];
    flags[4] = false;
    flags[9] = false;
    let mask = ProcessingMask::from_flags(flags);

    let run = run_mapmaking(
        &config(MeasurementModel::Intensity, OperatorStrategy::Explicit),
        &[shard],
        Some(mask),
        &mut NoopProgress,
        None,
    )
    .unwrap();
    // Every pixel still appears as the high-emission side or in a clean pair.
    assert_eq!(run.map.observed_count(), N_PIXELS);
    assert!(matches!(
        run.outcome.state,
        SolverState::Converged | SolverState::MaxIterations
    ));
}

fn write_shard_csv(path: &Path, shard: &Shard, noise: &[f64]) {
    let mut text = String::from("pixel_a,pixel_b,usable,signal,noise\n");
    for t in 0..shard.len() {
        writeln!(
            text,
            "{},{},{},{},{}",
            shard.pixel_a[t],
            shard.pixel_b[t],
            u8::from(shard.usable[t]),
            shard.signal[t],
            noise[t]
        )
        .unwrap();
    }
    fs::write(path, text).unwrap();
}

#[test]
fn csv_shards_run_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    let truth = SkyTruth::random(&mut rng);

    let mut sources = Vec::new();
    for day in 0..3 {
        let shard = observe(&mut rng, &truth, 300, "unused");
        let noise: Vec<f64> = (0..shard.len()).map(|_| rng.gen_range(-0.5..0.5)).collect();
        let path = dir.path().join(format!("day{day:03}.csv"));
        write_shard_csv(&path, &shard, &noise);
        sources.push(CsvShardSource::new(path));
    }
    let mask_path = dir.path().join("mask.txt");
    fs::write(&mask_path, "1\n".repeat(N_PIXELS)).unwrap();
    let mask = load_mask(&mask_path).unwrap();

    let config = config(MeasurementModel::Intensity, OperatorStrategy::Implicit);
    let config_path = dir.path().join("diffmap.toml");
    config.save(&config_path).unwrap();
    let config = MapmakingConfig::load(&config_path).unwrap();

    let run = run_mapmaking(&config, &sources, Some(mask), &mut NoopProgress, None).unwrap();
    assert_eq!(run.shards_used, 3);
    assert!(run.summaries.iter().all(|s| s.sigmas.sigma_lo.is_some()));
    let t = run.map.component(0).unwrap();
    assert_close(
        "T",
        &centered(t.iter().copied()),
        &centered(truth.t.iter().copied()),
        1e-6,
    );

    let paths = run.write_outputs(&dir.path().join("out/sim")).unwrap();
    let map_text = fs::read_to_string(&paths.map).unwrap();
    assert_eq!(map_text.lines().count(), N_PIXELS + 1);
    assert!(map_text.starts_with("pixel\tT\tobserved\n"));
    let trace_text = fs::read_to_string(&paths.trace).unwrap();
    assert_eq!(trace_text.lines().count(), run.outcome.iterations + 2);
}

#[test]
fn failing_shards_are_skipped_or_fatal_depending_on_strictness() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(13);
    let truth = SkyTruth::random(&mut rng);
    let shard = observe(&mut rng, &truth, 200, "good");
    let noise: Vec<f64> = (0..shard.len()).map(|_| rng.gen_range(-0.5..0.5)).collect();
    let good = dir.path().join("good.csv");
    write_shard_csv(&good, &shard, &noise);
    let bad = dir.path().join("bad.csv");
    fs::write(&bad, "pixel_a,pixel_b,usable,signal,noise\n0,99,1,0.5,0.1\n1,2,1,0.5,0.2\n").unwrap();
    let sources = vec![CsvShardSource::new(&good), CsvShardSource::new(&bad)];

    let lenient = config(MeasurementModel::Intensity, OperatorStrategy::Implicit);
    let run = run_mapmaking(&lenient, &sources, None, &mut NoopProgress, None).unwrap();
    assert_eq!(run.shards_used, 1);
    assert_eq!(run.failures.len(), 1);
    assert_eq!(run.failures[0].label(), "bad.csv");

    let mut strict = lenient.clone();
    strict.solver.strict = true;
    let err = run_mapmaking(&strict, &sources, None, &mut NoopProgress, None).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Accumulation(AccumulationError::Shard(ref shard)) if shard.label() == "bad.csv"
    ));
}
