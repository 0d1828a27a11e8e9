use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ClassifierError, Result};

/// データセットの分割種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    /// コーパスルート直下のディレクトリ名
    pub fn dir_name(self) -> &'static str {
        match self {
            Split::Train => "train_set",
            Split::Val => "val_set",
            Split::Test => "test_set",
        }
    }

    /// エポックごとに並びを変えるかどうか
    pub fn is_shuffled(self) -> bool {
        matches!(self, Split::Train)
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Val => write!(f, "val"),
            Split::Test => write!(f, "test"),
        }
    }
}

/// クラスラベルの順序付き集合
///
/// 位置がそのままクラスインデックスになる。学習分割から一度だけ導出し、
/// 検証・テスト分割では [`ClassSet::verify_split`] で一致を確認する。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSet {
    labels: Vec<String>,
}

impl ClassSet {
    /// ラベル列から作成（重複と空は拒否）
    pub fn new(labels: Vec<String>) -> Result<Self> {
        if labels.is_empty() {
            return Err(ClassifierError::Config("class set must not be empty".to_string()));
        }
        for (i, label) in labels.iter().enumerate() {
            if labels[..i].contains(label) {
                return Err(ClassifierError::Config(format!(
                    "duplicate class label '{}'",
                    label
                )));
            }
        }
        Ok(Self { labels })
    }

    /// ディレクトリ直下のサブディレクトリ名を列挙し、ソートしてクラス集合にする
    pub fn discover(dir: &Path) -> Result<Self> {
        let mut labels = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    labels.push(name.to_string());
                }
            }
        }
        labels.sort();
        Self::new(labels)
    }

    /// 別の分割ディレクトリが同じラベル集合を持つことを確認する
    pub fn verify_split(&self, split: Split, dir: &Path) -> Result<()> {
        let found = Self::discover(dir)?;
        if found.labels != self.labels {
            return Err(ClassifierError::ClassSetMismatch {
                split,
                expected: self.labels.clone(),
                found: found.labels,
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_sorts_labels() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["Whorl", "Arch", "Loop"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let classes = ClassSet::discover(dir.path()).unwrap();
        assert_eq!(classes.labels(), ["Arch", "Loop", "Whorl"]);
        assert_eq!(classes.index_of("Loop"), Some(1));
        assert_eq!(classes.label(2), Some("Whorl"));
    }

    #[test]
    fn test_verify_split_rejects_different_labels() {
        let train = tempfile::tempdir().unwrap();
        let val = tempfile::tempdir().unwrap();
        for name in ["Arch", "Loop"] {
            std::fs::create_dir(train.path().join(name)).unwrap();
        }
        std::fs::create_dir(val.path().join("Arch")).unwrap();
        std::fs::create_dir(val.path().join("Whorl")).unwrap();

        let classes = ClassSet::discover(train.path()).unwrap();
        let err = classes.verify_split(Split::Val, val.path()).unwrap_err();
        assert!(matches!(err, ClassifierError::ClassSetMismatch { split: Split::Val, .. }));
    }

    #[test]
    fn test_duplicate_labels_rejected() {
        let result = ClassSet::new(vec!["Arch".to_string(), "Arch".to_string()]);
        assert!(result.is_err());
    }

    #[test]
    fn test_split_dir_names() {
        assert_eq!(Split::Train.dir_name(), "train_set");
        assert_eq!(Split::Val.dir_name(), "val_set");
        assert_eq!(Split::Test.dir_name(), "test_set");
        assert!(Split::Train.is_shuffled());
        assert!(!Split::Test.is_shuffled());
    }
}
