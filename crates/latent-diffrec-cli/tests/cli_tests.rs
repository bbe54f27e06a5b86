//! End-to-end runs of the `latent-diffrec` binary over a tiny dataset.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

const TRAIN: &str = "0\t0\n0\t1\n1\t2\n2\t3\n2\t5\n3\t4\n";
const VALID: &str = "0\t2\n1\t3\n";
const TEST: &str = "2\t0\n3\t1\n";
const AGE: &str = "18\n25\n18\n35\n";
const EMBEDDINGS: &str = "0 0\n0.1 0\n0 0.1\n5 5\n5.1 5\n5 5.1\n";

fn setup() -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let data = dir.path().join("data");
    fs::create_dir_all(&data).unwrap();
    fs::write(data.join("train_list.txt"), TRAIN).unwrap();
    fs::write(data.join("valid_list.txt"), VALID).unwrap();
    fs::write(data.join("test_list.txt"), TEST).unwrap();
    fs::write(data.join("age.txt"), AGE).unwrap();
    fs::write(dir.path().join("items.txt"), EMBEDDINGS).unwrap();

    let config = format!(
        r#"dataset = "toy"
data_path = "{data}"
seed = 3

[diffusion]
noise_schedule = "linear"
steps = 10
sampling_steps = 5

[autoencoder]
n_cate = 2
in_dims = [4]

[denoiser]
dims = [4]
emb_size = 4
n_classes = 3

[inference]
batch_size = 2
top_n = [1, 2]

[checkpoint]
dir = "{ckpt}"
stem = "toy"

[logging]
level = "warn"
"#,
        data = data.display(),
        ckpt = dir.path().join("ckpt").display()
    );
    fs::write(dir.path().join("run.toml"), config).unwrap();
    dir
}

fn run(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_latent-diffrec"))
        .args(args)
        .arg("--config")
        .arg(dir.join("run.toml"))
        .output()
        .expect("Failed to spawn latent-diffrec")
}

fn init(dir: &Path) {
    let embeddings = dir.join("items.txt");
    let out = run(dir, &["init", "--item-embeddings", embeddings.to_str().unwrap()]);
    assert!(
        out.status.success(),
        "init failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

fn infer(dir: &Path, extra: &[&str]) -> Value {
    let target = dir.join("ranked.json");
    let mut args = vec!["infer", "--output", target.to_str().unwrap()];
    args.extend_from_slice(extra);
    let out = run(dir, &args);
    assert!(
        out.status.success(),
        "infer failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    serde_json::from_str(&fs::read_to_string(target).unwrap()).unwrap()
}

fn lists(report: &Value, split: &str) -> Vec<Vec<u64>> {
    report[split]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l.as_array().unwrap().iter().map(|v| v.as_u64().unwrap()).collect())
        .collect()
}

#[test]
fn test_init_writes_bundle() {
    let dir = setup();
    init(dir.path());
    let ckpt = dir.path().join("ckpt");
    assert!(ckpt.join("toy.safetensors").exists());
    assert!(ckpt.join("toy_AE.safetensors").exists());
    assert!(ckpt.join("toy.toml").exists());
}

#[test]
fn test_init_without_embeddings_fails() {
    let dir = setup();
    let out = run(dir.path(), &["init"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("--item-embeddings"));
}

#[test]
fn test_infer_masks_known_interactions() {
    let dir = setup();
    init(dir.path());
    let report = infer(dir.path(), &[]);

    assert_eq!(report["stem"], "toy");
    assert_eq!(report["condition"], "age");
    let train: Vec<Vec<u64>> = vec![vec![0, 1], vec![2], vec![3, 5], vec![4]];
    let valid_items: Vec<Vec<u64>> = vec![vec![2], vec![3], vec![], vec![]];

    let valid = lists(&report, "valid");
    let test = lists(&report, "test");
    assert_eq!(valid.len(), 4);
    assert_eq!(test.len(), 4);
    for u in 0..4 {
        assert_eq!(valid[u].len(), 2);
        assert!(valid[u].iter().all(|i| !train[u].contains(i)));
        assert!(test[u]
            .iter()
            .all(|i| !train[u].contains(i) && !valid_items[u].contains(i)));
    }
}

#[test]
fn test_infer_is_repeatable() {
    let dir = setup();
    init(dir.path());
    let first = infer(dir.path(), &["--sampling-noise"]);
    let second = infer(dir.path(), &["--sampling-noise"]);
    assert_eq!(first, second);
}

#[test]
fn test_infer_ignores_attribute_rows_without_interactions() {
    let dir = setup();
    init(dir.path());
    fs::write(dir.path().join("data").join("age.txt"), format!("{}50\n", AGE)).unwrap();
    let report = infer(dir.path(), &[]);
    assert_eq!(lists(&report, "valid").len(), 4);
    assert_eq!(lists(&report, "test").len(), 4);
}

#[test]
fn test_infer_missing_bundle_fails() {
    let dir = setup();
    let out = run(dir.path(), &["infer"]);
    assert_eq!(out.status.code(), Some(1));
}
