pub mod backend;
pub mod dataset;
pub mod inference;
pub mod ml_model;
pub mod training;
pub mod transform;

pub use backend::{cpu_device, CpuBackend, CpuTrainBackend};
#[cfg(feature = "wgpu")]
pub use backend::{gpu_device, GpuBackend, GpuTrainBackend};
pub use dataset::{FingerprintBatch, FingerprintBatcher, FingerprintDataset, FingerprintItem, SplitLoader};
pub use inference::{InferenceEngine, Prediction};
pub use ml_model::{ModelConfig, PatternClassifier};
pub use training::{adamw_optimizer, EpochSummary, RunState, TestReport, TrainingConfig, TrainingRun};
pub use transform::{image_to_input, load_model_input, IMAGE_SIZE};
