//! バックエンドの乱数状態はプロセス全体で共有されるため、このファイルには
//! テストを1つだけ置く。

mod common;

use fingerprint_pattern_lib::ml::backend::{cpu_device, CpuTrainBackend};
use fingerprint_pattern_lib::ml::training::{adamw_optimizer, TrainingRun};

fn run_once(run_id: &str) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let root = tempfile::tempdir().unwrap();
    common::write_corpus(&root.path().join("data"), &["Arch", "Loop"], 4);

    let config = common::small_config(root.path(), 2, run_id);
    let optim = adamw_optimizer::<CpuTrainBackend>(config.training.weight_decay);
    let mut run = TrainingRun::open(config, cpu_device(), optim).unwrap();
    let metrics = run.fit().unwrap().clone();
    (metrics.train_acc, metrics.val_acc, metrics.train_loss)
}

#[test]
fn same_seed_gives_same_history() {
    let (train_a, val_a, loss_a) = run_once("first");
    let (train_b, val_b, loss_b) = run_once("second");

    assert_eq!(train_a, train_b);
    assert_eq!(val_a, val_b);
    for (a, b) in loss_a.iter().zip(&loss_b) {
        assert!((a - b).abs() < 1e-6, "{} vs {}", a, b);
    }
}
