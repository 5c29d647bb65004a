//! Prediction stage: ensemble inference over the locally synced models.
//!
//! Every call rescans the model cache directory, so artifacts written by the
//! model sync task are picked up without a restart.

pub mod model;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use ndarray::{Array2, ArrayView2};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::consumer::{Records, Transform};

pub use model::{DenseModelLoader, DenseNetwork};

pub trait Classifier: Send + Sync {
    fn classes(&self) -> usize;
    fn predict(&self, rows: ArrayView2<f64>) -> anyhow::Result<Vec<usize>>;
}

pub trait ModelLoader: Send + Sync {
    /// File extension (without the dot) this loader reads.
    fn extension(&self) -> &str;
    fn load(&self, bytes: &[u8]) -> anyhow::Result<Box<dyn Classifier>>;
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("no models available in {}", .0.display())]
    NoModels(PathBuf),
    #[error("failed to read models from {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load model {}: {reason}", .path.display())]
    Load { path: PathBuf, reason: String },
    #[error("model {} failed to predict: {reason}", .path.display())]
    Predict { path: PathBuf, reason: String },
    #[error("feature row {row} is not numeric")]
    Features { row: usize },
    #[error("feature row {row} has {found} columns, expected {expected}")]
    Width { row: usize, expected: usize, found: usize },
}

pub struct InferenceEngine {
    dir: PathBuf,
    loader: Arc<dyn ModelLoader>,
}

impl InferenceEngine {
    pub fn new(dir: impl Into<PathBuf>, loader: Arc<dyn ModelLoader>) -> Self {
        Self { dir: dir.into(), loader }
    }

    async fn model_paths(&self) -> Result<Vec<PathBuf>, InferenceError> {
        let io_err = |source| InferenceError::Io { path: self.dir.clone(), source };
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(e)),
        };
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(self.loader.extension()) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    pub async fn load_models(&self) -> Result<Vec<(PathBuf, Box<dyn Classifier>)>, InferenceError> {
        let mut models = Vec::new();
        for path in self.model_paths().await? {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|source| InferenceError::Io { path: path.clone(), source })?;
            let model = self
                .loader
                .load(&bytes)
                .map_err(|e| InferenceError::Load { path: path.clone(), reason: e.to_string() })?;
            debug!(path = %path.display(), "loaded model");
            models.push((path, model));
        }
        Ok(models)
    }

    /// Per-row ensemble signal in `{-1, 0, 1}`: the majority class across
    /// models (ties go to the lowest class) shifted down by one.
    pub async fn predict(&self, rows: ArrayView2<'_, f64>) -> Result<Vec<i64>, InferenceError> {
        let models = self.load_models().await?;
        if models.is_empty() {
            return Err(InferenceError::NoModels(self.dir.clone()));
        }
        let mut votes = Vec::with_capacity(models.len());
        for (path, model) in &models {
            let classes = model
                .predict(rows)
                .map_err(|e| InferenceError::Predict { path: path.clone(), reason: e.to_string() })?;
            votes.push(classes);
        }
        Ok((0..rows.nrows())
            .map(|row| majority(votes.iter().map(|v| v[row])) as i64 - 1)
            .collect())
    }
}

/// Most frequent class; ties resolve to the smallest.
pub fn majority(classes: impl Iterator<Item = usize>) -> usize {
    let mut counts: Vec<usize> = Vec::new();
    for class in classes {
        if class >= counts.len() {
            counts.resize(class + 1, 0);
        }
        counts[class] += 1;
    }
    let mut best = 0;
    for (class, count) in counts.iter().enumerate() {
        if *count > counts[best] {
            best = class;
        }
    }
    best
}

pub fn feature_matrix(records: &Records) -> Result<Array2<f64>, InferenceError> {
    let width = records.first().map_or(0, |r| r.len());
    let mut matrix = Array2::zeros((records.len(), width));
    for (row, (record, mut out)) in records.iter().zip(matrix.rows_mut()).enumerate() {
        if record.len() != width {
            return Err(InferenceError::Width { row, expected: width, found: record.len() });
        }
        for (slot, value) in out.iter_mut().zip(record.values()) {
            *slot = value.as_f64().ok_or(InferenceError::Features { row })?;
        }
    }
    Ok(matrix)
}

pub struct PredictionTransform {
    engine: InferenceEngine,
}

impl PredictionTransform {
    pub fn new(engine: InferenceEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Transform for PredictionTransform {
    fn name(&self) -> &str {
        "prediction"
    }

    async fn apply(&self, key: &str, records: Records) -> anyhow::Result<Vec<u8>> {
        let rows = feature_matrix(&records)?;
        let signals = self.engine.predict(rows.view()).await?;
        let Some(signal) = signals.first() else {
            anyhow::bail!("no feature rows to predict on");
        };
        info!(key, signal, "prediction");
        metrics::counter!("neural_trade_predictions_total").increment(1);
        Ok(signal.to_string().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::model::fixtures;
    use super::*;
    use crate::consumer::decode_records;
    use ndarray::array;
    use std::path::Path;

    async fn write_model(dir: &Path, name: &str, class: usize) {
        let bytes = fixtures::to_bytes(&fixtures::constant(2, class));
        tokio::fs::write(dir.join(name), bytes).await.unwrap();
    }

    fn engine(dir: &Path) -> InferenceEngine {
        InferenceEngine::new(dir, Arc::new(DenseModelLoader))
    }

    #[test]
    fn test_majority_vote() {
        assert_eq!(majority([2, 2, 0].into_iter()), 2);
        assert_eq!(majority([0, 1, 2].into_iter()), 0);
        assert_eq!(majority([2, 1, 1, 2].into_iter()), 1);
        assert_eq!(majority(std::iter::empty()), 0);
    }

    #[test]
    fn test_feature_matrix() {
        let records = decode_records(br#"[{"b":2,"a":1.5},{"a":0,"b":-1}]"#).unwrap();
        let rows = feature_matrix(&records).unwrap();
        assert_eq!(rows, array![[1.5, 2.0], [0.0, -1.0]]);

        let bad = decode_records(br#"[{"a":"x"}]"#).unwrap();
        assert!(matches!(feature_matrix(&bad), Err(InferenceError::Features { row: 0 })));

        let ragged = decode_records(br#"[{"a":1,"b":2},{"a":3}]"#).unwrap();
        assert!(matches!(
            feature_matrix(&ragged),
            Err(InferenceError::Width { row: 1, expected: 2, found: 1 })
        ));
        assert_eq!(feature_matrix(&Vec::new()).unwrap().dim(), (0, 0));
    }

    #[tokio::test]
    async fn test_ensemble_maps_classes_to_signals() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "a.json", 2).await;
        write_model(dir.path(), "b.json", 2).await;
        write_model(dir.path(), "c.json", 0).await;
        tokio::fs::write(dir.path().join("notes.txt"), b"ignored").await.unwrap();

        let signals = engine(dir.path()).predict(array![[0.0, 0.0]].view()).await.unwrap();
        assert_eq!(signals, vec![1]);
    }

    #[tokio::test]
    async fn test_new_models_are_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        write_model(dir.path(), "a.json", 1).await;
        assert_eq!(engine.predict(array![[0.0, 0.0]].view()).await.unwrap(), vec![0]);

        write_model(dir.path(), "b.json", 0).await;
        // Tie between class 0 and class 1 goes to the lower class.
        assert_eq!(engine.predict(array![[0.0, 0.0]].view()).await.unwrap(), vec![-1]);
    }

    #[tokio::test]
    async fn test_no_models_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = engine(dir.path()).predict(array![[0.0]].view()).await.unwrap_err();
        assert!(matches!(err, InferenceError::NoModels(_)));

        let missing = engine(&dir.path().join("missing"));
        assert!(matches!(missing.predict(array![[0.0]].view()).await, Err(InferenceError::NoModels(_))));
    }

    #[tokio::test]
    async fn test_corrupt_model_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("bad.json"), b"{").await.unwrap();
        let err = engine(dir.path()).predict(array![[0.0, 0.0]].view()).await.unwrap_err();
        assert!(matches!(err, InferenceError::Load { .. }));
    }

    #[tokio::test]
    async fn test_transform_publishes_first_signal() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "a.json", 0).await;
        let transform = PredictionTransform::new(engine(dir.path()));
        let records = decode_records(br#"[{"x":1,"y":2},{"x":3,"y":4}]"#).unwrap();
        let out = transform.apply("BTC-USD", records).await.unwrap();
        assert_eq!(out, b"-1".to_vec());
    }
}
