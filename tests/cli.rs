use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

fn diffmap() -> Command {
    Command::new(env!("CARGO_BIN_EXE_diffmap"))
}

fn write_ring_shard(path: &Path, truth: &[f64]) {
    let n = truth.len();
    let mut text = String::from("# pixel_a,pixel_b,usable,signal,noise\npixel_a,pixel_b,usable,signal,noise\n");
    for a in 0..n {
        for (k, step) in [1usize, 2, 5].into_iter().enumerate() {
            let b = (a + step) % n;
            let noise = if (a + k) % 2 == 0 { 0.01 } else { -0.01 };
            text.push_str(&format!("{a},{b},1,{},{noise}\n", truth[a] - truth[b]));
        }
    }
    fs::write(path, text).unwrap();
}

#[test]
fn selftest_reproduces_reference_solution() {
    let output = diffmap().arg("selftest").output().unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("x = [2.000000, -2.000000]"), "{stdout}");
    assert!(stdout.contains("Self-test passed"));
}

#[test]
fn bands_lists_every_built_in_band() {
    let output = diffmap().arg("bands").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("band\txbar\tdxbar\n"));
    for band in ["K1", "Ka1", "Q1", "Q2", "V1", "V2", "W1", "W2", "W3", "W4"] {
        assert!(stdout.lines().any(|l| l.starts_with(&format!("{band}\t"))), "{band}");
    }
}

#[test]
fn solve_writes_map_and_trace() {
    let dir = tempdir().unwrap();
    let truth: Vec<f64> = (0..12).map(|p| (p as f64 * 0.4).cos()).collect();
    let shard = dir.path().join("day001.csv");
    write_ring_shard(&shard, &truth);
    let config = dir.path().join("diffmap.toml");
    fs::write(
        &config,
        "band = \"K1\"\nimbalance = false\n\n[pixelization]\nnside = 1\n\n[solver]\neps = 1e-10\nhalt_on_stall = false\n",
    )
    .unwrap();
    let prefix = dir.path().join("maps/k1");

    let output = diffmap()
        .args(["solve", "--config"])
        .arg(&config)
        .arg("--output")
        .arg(&prefix)
        .args(["--strategy", "explicit", "--threads", "2"])
        .arg(&shard)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Converged"), "{stdout}");
    assert!(stdout.contains("12 of 12 pixels observed"), "{stdout}");

    let map = fs::read_to_string(dir.path().join("maps/k1.map.tsv")).unwrap();
    let values: Vec<f64> = map
        .lines()
        .skip(1)
        .map(|line| line.split('\t').nth(1).unwrap().parse().unwrap())
        .collect();
    assert_eq!(values.len(), 12);
    let offset = values[0] - truth[0];
    for (value, expected) in values.iter().zip(&truth) {
        assert!((value - expected - offset).abs() < 1e-6);
    }
    assert!(dir.path().join("maps/k1.trace.tsv").exists());
}

#[test]
fn solve_rejects_unknown_strategy() {
    let output = diffmap()
        .args(["solve", "--config", "missing.toml", "--output", "out"])
        .args(["--strategy", "sparse", "shard.csv"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown strategy 'sparse'"), "{stderr}");
}

#[test]
fn solve_reports_missing_configuration() {
    let dir = tempdir().unwrap();
    let output = diffmap()
        .args(["solve", "--config"])
        .arg(dir.path().join("absent.toml"))
        .arg("--output")
        .arg(dir.path().join("out"))
        .arg(dir.path().join("shard.csv"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error:"));
}
