//! ラベル付きディレクトリからのデータ読み込み
//!
//! `<root>/<split>/<class>/*.png` の構成を前提とします。サンプルはパスのみ
//! 保持し、画像はバッチ作成時にデコードします。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor},
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{ClassifierError, Result};
use crate::ml::transform::{load_model_input, IMAGE_SIZE, SAMPLE_LEN};
use crate::preprocess::corpus::is_image_file;
use crate::types::{ClassSet, Split};

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct FingerprintItem {
    pub path: PathBuf,
    pub label: usize,
}

/// 1分割分のデータセット
#[derive(Debug)]
pub struct FingerprintDataset {
    split: Split,
    dir: PathBuf,
    samples: Vec<FingerprintItem>,
    classes: ClassSet,
}

impl FingerprintDataset {
    /// `root/<split>` を読み込む
    ///
    /// 学習分割ではない場合、クラス集合が一致することを確認する。
    pub fn open(root: &Path, split: Split, classes: &ClassSet) -> Result<Self> {
        let dir = root.join(split.dir_name());
        if !dir.is_dir() {
            return Err(ClassifierError::DatasetEmpty { split, dir });
        }
        if split != Split::Train {
            classes.verify_split(split, &dir)?;
        }

        let mut samples = Vec::new();
        for (label, name) in classes.labels().iter().enumerate() {
            let class_dir = dir.join(name);
            if !class_dir.is_dir() {
                continue;
            }
            let mut files: Vec<PathBuf> = std::fs::read_dir(&class_dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_image_file(p))
                .collect();
            files.sort();
            samples.extend(files.into_iter().map(|path| FingerprintItem { path, label }));
        }

        if samples.is_empty() {
            return Err(ClassifierError::DatasetEmpty { split, dir });
        }

        info!(split = %split, samples = samples.len(), classes = classes.len(), "dataset loaded");
        for (i, name) in classes.labels().iter().enumerate() {
            let count = samples.iter().filter(|s| s.label == i).count();
            debug!(split = %split, class = %name, count, "class samples");
        }

        Ok(Self {
            split,
            dir,
            samples,
            classes: classes.clone(),
        })
    }

    /// 学習分割からクラス集合を導出して読み込む
    pub fn open_train(root: &Path) -> Result<Self> {
        let dir = root.join(Split::Train.dir_name());
        if !dir.is_dir() {
            return Err(ClassifierError::DatasetEmpty {
                split: Split::Train,
                dir,
            });
        }
        let classes = ClassSet::discover(&dir)?;
        Self::open(root, Split::Train, &classes)
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn classes(&self) -> &ClassSet {
        &self.classes
    }
}

impl Dataset<FingerprintItem> for FingerprintDataset {
    fn get(&self, index: usize) -> Option<FingerprintItem> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct FingerprintBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
    /// `targets` と同じ内容（ホスト側）
    pub labels: Vec<usize>,
    pub paths: Vec<PathBuf>,
}

impl<B: Backend> FingerprintBatch<B> {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// バッチャー
///
/// バッチ内のデコードは並列に行うが、結果は入力順に並べるため
/// バッチ構成はスレッド数に依存しない。
#[derive(Clone, Default)]
pub struct FingerprintBatcher {
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl FingerprintBatcher {
    /// `threads` が 0 なら rayon のグローバルプールを使う
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Ok(Self::default());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| ClassifierError::Config(format!("cannot build decode pool: {}", e)))?;
        Ok(Self {
            pool: Some(Arc::new(pool)),
        })
    }

    fn decode(&self, items: &[FingerprintItem]) -> Vec<Result<Vec<f32>>> {
        let run = || {
            items
                .par_iter()
                .map(|item| load_model_input(&item.path))
                .collect::<Vec<_>>()
        };
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }
}

impl<B: Backend> Batcher<B, FingerprintItem, Option<FingerprintBatch<B>>> for FingerprintBatcher {
    fn batch(&self, items: Vec<FingerprintItem>, device: &B::Device) -> Option<FingerprintBatch<B>> {
        let decoded = self.decode(&items);

        let mut pixels = Vec::with_capacity(items.len() * SAMPLE_LEN);
        let mut labels = Vec::with_capacity(items.len());
        let mut paths = Vec::with_capacity(items.len());
        for (item, result) in items.into_iter().zip(decoded) {
            match result {
                Ok(data) => {
                    pixels.extend_from_slice(&data);
                    labels.push(item.label);
                    paths.push(item.path);
                }
                Err(e) => {
                    warn!(path = %item.path.display(), error = %e, "skipping unreadable sample");
                }
            }
        }

        if labels.is_empty() {
            return None;
        }

        let batch_size = labels.len();
        let images = Tensor::<B, 1>::from_floats(pixels.as_slice(), device)
            .reshape([batch_size, 3, IMAGE_SIZE, IMAGE_SIZE]);
        let targets_vec: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), device);

        Some(FingerprintBatch {
            images,
            targets,
            labels,
            paths,
        })
    }
}

/// 分割ごとのバッチ反復
///
/// 学習分割は `seed` とエポック番号から並びを決めるため、同じシードなら
/// 再開後も同じ順序になる。検証・テスト分割は常にファイル順。
pub struct SplitLoader<B: Backend> {
    dataset: Arc<FingerprintDataset>,
    batcher: FingerprintBatcher,
    batch_size: usize,
    seed: u64,
    device: B::Device,
}

impl<B: Backend> SplitLoader<B> {
    pub fn new(
        dataset: Arc<FingerprintDataset>,
        batcher: FingerprintBatcher,
        batch_size: usize,
        seed: u64,
        device: B::Device,
    ) -> Self {
        Self {
            dataset,
            batcher,
            batch_size: batch_size.max(1),
            seed,
            device,
        }
    }

    pub fn dataset(&self) -> &FingerprintDataset {
        &self.dataset
    }

    /// バッチ数（デコード失敗による欠落は含まない）
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// エポックのサンプル順
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.dataset.split().is_shuffled() {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }
        indices
    }

    /// エポック `epoch` のバッチを順に返す
    pub fn iter(&self, epoch: usize) -> impl Iterator<Item = FingerprintBatch<B>> + '_ {
        let order = self.epoch_order(epoch);
        let chunks: Vec<Vec<usize>> = order.chunks(self.batch_size).map(|c| c.to_vec()).collect();
        chunks.into_iter().filter_map(move |chunk| {
            let items: Vec<FingerprintItem> =
                chunk.iter().filter_map(|&i| self.dataset.get(i)).collect();
            Batcher::<B, _, _>::batch(&self.batcher, items, &self.device)
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use image::{GrayImage, Luma};
    use std::path::Path;

    /// `root/<split>/<class>/` に小さな画像を書き出す
    pub fn write_split(root: &Path, split: &str, classes: &[&str], per_class: usize) {
        for (c, name) in classes.iter().enumerate() {
            let dir = root.join(split).join(name);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                let img = GrayImage::from_fn(24, 24, |x, y| {
                    let on = (x as usize + y as usize * (c + 1) + i) % 4 < 2;
                    Luma([if on { 255 } else { 0 }])
                });
                img.save(dir.join(format!("{}_{:02}.png", name, i))).unwrap();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::write_split;
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn loader(dataset: FingerprintDataset, batch_size: usize) -> SplitLoader<TestBackend> {
        SplitLoader::new(
            Arc::new(dataset),
            FingerprintBatcher::default(),
            batch_size,
            42,
            NdArrayDevice::Cpu,
        )
    }

    #[test]
    fn test_yields_every_file_with_valid_labels() {
        let root = tempfile::tempdir().unwrap();
        write_split(root.path(), "train_set", &["Arch", "Loop", "Whorl"], 3);

        let dataset = FingerprintDataset::open_train(root.path()).unwrap();
        assert_eq!(dataset.len(), 9);
        let loader = loader(dataset, 4);
        assert_eq!(loader.num_batches(), 3);

        let mut seen = 0;
        for batch in loader.iter(0) {
            let [n, c, h, w] = batch.images.dims();
            assert!(!batch.is_empty());
            assert_eq!((n, c, h, w), (batch.len(), 3, IMAGE_SIZE, IMAGE_SIZE));
            assert!(batch.labels.iter().all(|&l| l < 3));
            seen += batch.len();
        }
        assert_eq!(seen, 9);
    }

    #[test]
    fn test_truncated_image_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        write_split(root.path(), "train_set", &["Arch", "Loop"], 5);
        let victim = root.path().join("train_set/Loop/Loop_03.png");
        let bytes = std::fs::read(&victim).unwrap();
        std::fs::write(&victim, &bytes[..bytes.len() / 2]).unwrap();

        let loader = loader(FingerprintDataset::open_train(root.path()).unwrap(), 4);
        let seen: usize = loader.iter(0).map(|b| b.len()).sum();
        assert_eq!(seen, 9);
        assert!(loader
            .iter(1)
            .all(|b| b.paths.iter().all(|p| !p.ends_with("Loop_03.png"))));
    }

    #[test]
    fn test_train_order_depends_on_epoch_only() {
        let root = tempfile::tempdir().unwrap();
        write_split(root.path(), "train_set", &["Arch", "Loop"], 6);
        let a = loader(FingerprintDataset::open_train(root.path()).unwrap(), 4);
        let b = loader(FingerprintDataset::open_train(root.path()).unwrap(), 4);

        assert_eq!(a.epoch_order(3), b.epoch_order(3));
        assert_ne!(a.epoch_order(0), a.epoch_order(1));
        let mut sorted = a.epoch_order(2);
        sorted.sort();
        assert_eq!(sorted, (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn test_val_order_is_fixed() {
        let root = tempfile::tempdir().unwrap();
        write_split(root.path(), "train_set", &["Arch", "Loop"], 2);
        write_split(root.path(), "val_set", &["Arch", "Loop"], 3);
        let train = FingerprintDataset::open_train(root.path()).unwrap();
        let val = FingerprintDataset::open(root.path(), Split::Val, train.classes()).unwrap();

        let loader = loader(val, 2);
        assert_eq!(loader.epoch_order(0), (0..6).collect::<Vec<_>>());
        assert_eq!(loader.epoch_order(5), loader.epoch_order(0));
    }

    #[test]
    fn test_empty_split_is_error() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("train_set/Arch")).unwrap();
        let err = FingerprintDataset::open_train(root.path()).unwrap_err();
        assert!(matches!(err, ClassifierError::DatasetEmpty { split: Split::Train, .. }));
    }

    #[test]
    fn test_mismatched_val_classes() {
        let root = tempfile::tempdir().unwrap();
        write_split(root.path(), "train_set", &["Arch", "Loop"], 1);
        write_split(root.path(), "val_set", &["Arch", "Whorl"], 1);
        let train = FingerprintDataset::open_train(root.path()).unwrap();
        let err = FingerprintDataset::open(root.path(), Split::Val, train.classes()).unwrap_err();
        assert!(matches!(err, ClassifierError::ClassSetMismatch { .. }));
    }
}
