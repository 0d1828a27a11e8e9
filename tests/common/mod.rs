#![allow(dead_code)]

use std::path::Path;

use fingerprint_pattern_lib::ml::training::TrainingConfig;
use fingerprint_pattern_lib::model::AppConfig;
use image::{GrayImage, Luma};

/// クラスごとに縞の向きが違う合成指紋を書き出す
pub fn write_split(root: &Path, split: &str, classes: &[&str], per_class: usize) {
    for (c, name) in classes.iter().enumerate() {
        let dir = root.join(split).join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..per_class {
            let img = GrayImage::from_fn(32, 32, |x, y| {
                let phase = match c % 3 {
                    0 => x as usize,
                    1 => y as usize,
                    _ => (x + y) as usize,
                };
                Luma([if (phase + i) % 6 < 3 { 255 } else { 0 }])
            });
            img.save(dir.join(format!("{}_{:02}.png", name, i))).unwrap();
        }
    }
}

pub fn write_corpus(data_root: &Path, classes: &[&str], train_per_class: usize) {
    write_split(data_root, "train_set", classes, train_per_class);
    write_split(data_root, "val_set", classes, 2);
    write_split(data_root, "test_set", classes, 2);
}

/// 小さなモデルで学習する設定
pub fn small_config(root: &Path, epochs: usize, run_id: &str) -> TrainingConfig {
    let mut config = TrainingConfig::from_app_config(&AppConfig::default());
    config.model.embed_dim = 2;
    config.model.hidden_dim = 8;
    config.model.attention_reduction = 4;
    config.training.num_epochs = epochs;
    config.training.batch_size = 2;
    config.training.learning_rate = 1e-3;
    config.training.decode_threads = 2;
    config.paths.data_root = root.join("data");
    config.paths.weights_dir = root.join("model_weights");
    config.paths.logs_dir = root.join("training_logs");
    config.run_id = Some(run_id.to_string());
    config
}
