//! 指紋の隆線パターン分類
//!
//! - [`preprocess`] 生スキャンの二値化
//! - [`ml`] データセット、モデル、学習、推論
//! - [`model`] 設定とチェックポイント、メトリクスの永続化
//! - [`capture`] スキャナからの取り込み

pub mod capture;
pub mod error;
pub mod ml;
pub mod model;
pub mod preprocess;
pub mod types;

pub use error::{ClassifierError, Result};
pub use types::{ClassSet, Split};
