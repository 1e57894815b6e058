use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use diffmap::accumulate::accumulate_store;
use diffmap::{
    ExplicitOperator, GainImbalance, ImplicitOperator, MeasurementModel, NoiseEstimate,
    NormalOperator, ProcessingMask, SampleStore, Shard,
};
use diffmap::samples::PolarizationChannel;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const N_PIXELS: usize = 3072;

fn random_store(model: MeasurementModel, samples: usize) -> SampleStore {
    let mut rng = StdRng::seed_from_u64(0x5EED_0D1F + samples as u64);
    let n = N_PIXELS as u32;
    let pixel_a: Vec<u32> = (0..samples).map(|_| rng.gen_range(0..n)).collect();
    let pixel_b: Vec<u32> = pixel_a
        .iter()
        .map(|&a| (a + rng.gen_range(1..n)) % n)
        .collect();
    let mut values = |lo: f64, hi: f64| -> Vec<f64> {
        (0..samples).map(|_| rng.gen_range(lo..hi)).collect()
    };
    let signal = values(-1.0, 1.0);
    let noise = values(-0.1, 0.1);
    let polarization = model.requires_polarization().then(|| PolarizationChannel {
        signal: values(-1.0, 1.0),
        psi_a: values(0.0, std::f64::consts::PI),
        psi_b: values(0.0, std::f64::consts::PI),
    });
    let shard = Shard {
        label: "bench".to_string(),
        pixel_a,
        pixel_b,
        usable: vec![true; samples],
        signal,
        noise: NoiseEstimate::FromSamples(noise),
        polarization,
    };
    let gain = GainImbalance {
        xbar: 0.002345,
        dxbar: -0.003015,
    };
    SampleStore::from_shard(&shard, &ProcessingMask::all_usable(N_PIXELS), model, gain)
        .expect("benchmark shard is valid")
}

fn benchmark_operator_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("operator_apply");
    for model in [
        MeasurementModel::Intensity,
        MeasurementModel::IntensityPolarization,
    ] {
        for samples in [100_000usize, 1_000_000] {
            let store = random_store(model, samples);
            let explicit = ExplicitOperator::new(
                accumulate_store(&store, true)
                    .operator
                    .expect("explicit assembly requested"),
            )
            .expect("square operator");
            let implicit = ImplicitOperator::new(store);
            let x = Array1::from_shape_fn(implicit.dim(), |i| (i as f64 * 0.37).sin());
            let label = format!("{model}/{samples}");

            group.throughput(Throughput::Elements(samples as u64));
            group.bench_with_input(BenchmarkId::new("explicit", &label), &x, |b, input| {
                b.iter(|| black_box(explicit.apply(black_box(input.view()))));
            });
            group.bench_with_input(BenchmarkId::new("implicit", &label), &x, |b, input| {
                b.iter(|| black_box(implicit.apply(black_box(input.view()))));
            });
        }
    }
    group.finish();
}

criterion_group!(operator_apply, benchmark_operator_apply);
criterion_main!(operator_apply);
