pub mod checkpoint_metadata;
pub mod checkpoint_storage;
pub mod config;
pub mod metrics_log;

pub use checkpoint_metadata::{CheckpointKind, CheckpointMetadata};
pub use checkpoint_storage::{load_checkpoint, load_metadata, print_metadata_info, save_checkpoint, CheckpointBundle};
pub use config::{AppConfig, DeviceType, ModelSettings, NormalizerSettings, PathSettings, TrainingSettings};
pub use metrics_log::{ClassAccuracy, EpochRecord, TrainingMetrics};
