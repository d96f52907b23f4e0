//! Shared model store - the single writer of the global model.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use fedrun_core::{ErrorKind, ModelDelta, SharedModel, Tensors};

/// Default weight of an incoming delta.
pub const DEFAULT_ALPHA: f64 = 0.1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid smoothing factor {0}, expected 0 < alpha <= 1")]
    InvalidAlpha(f64),

    #[error("non-finite value in delta array '{0}'")]
    NonFinite(String),

    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Store
    }
}

/// Opaque durable storage for whole model snapshots.
#[async_trait]
pub trait ModelPersistence: Send + Sync {
    async fn get(&self) -> Result<Option<SharedModel>, StoreError>;

    async fn put(&self, model: &SharedModel) -> Result<(), StoreError>;
}

/// Keeps the latest snapshot in memory.
#[derive(Default)]
pub struct InMemoryPersistence {
    latest: Mutex<Option<SharedModel>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModelPersistence for InMemoryPersistence {
    async fn get(&self) -> Result<Option<SharedModel>, StoreError> {
        Ok(self.latest.lock().await.clone())
    }

    async fn put(&self, model: &SharedModel) -> Result<(), StoreError> {
        *self.latest.lock().await = Some(model.clone());
        Ok(())
    }
}

/// Holds the versioned shared model and applies EMA updates one at a time.
pub struct SharedModelStore {
    model: Mutex<SharedModel>,
    alpha: f64,
    persistence: Arc<dyn ModelPersistence>,
}

impl SharedModelStore {
    pub fn new(alpha: f64) -> Result<Self, StoreError> {
        Self::with_persistence(alpha, Arc::new(InMemoryPersistence::new()))
    }

    pub fn with_persistence(
        alpha: f64,
        persistence: Arc<dyn ModelPersistence>,
    ) -> Result<Self, StoreError> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(StoreError::InvalidAlpha(alpha));
        }
        Ok(Self {
            model: Mutex::new(SharedModel::default()),
            alpha,
            persistence,
        })
    }

    /// Restore the latest persisted snapshot, if any. Returns its version.
    pub async fn load(&self) -> Result<u64, StoreError> {
        let restored = self.persistence.get().await?;
        let mut model = self.model.lock().await;
        if let Some(restored) = restored {
            info!(version = restored.version, "Shared model restored");
            *model = restored;
        }
        Ok(model.version)
    }

    /// Blend `delta` into the model and bump the version by one.
    ///
    /// Callers are serialized. Nothing changes unless the new model was persisted.
    pub async fn apply_delta(&self, delta: &ModelDelta) -> Result<u64, StoreError> {
        if let Some((key, _)) = delta
            .weights
            .iter()
            .chain(delta.biases.iter())
            .find(|(_, values)| values.iter().any(|v| !v.is_finite()))
        {
            return Err(StoreError::NonFinite(key.clone()));
        }

        let mut model = self.model.lock().await;
        let mut next = model.clone();
        blend(&mut next.weights, &delta.weights, self.alpha);
        blend(&mut next.biases, &delta.biases, self.alpha);
        next.version = model.version + 1;
        next.updated_at = Some(Utc::now());

        self.persistence.put(&next).await?;
        *model = next;

        debug!(version = model.version, alpha = self.alpha, "Shared model updated");
        Ok(model.version)
    }

    pub async fn snapshot(&self) -> SharedModel {
        self.model.lock().await.clone()
    }

    pub async fn version(&self) -> u64 {
        self.model.lock().await.version
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

/// `current * (1 - alpha) + delta * alpha`, with missing elements starting at zero.
fn blend(current: &mut Tensors, delta: &Tensors, alpha: f64) {
    for (key, incoming) in delta {
        let values = current.entry(key.clone()).or_default();
        if values.len() < incoming.len() {
            values.resize(incoming.len(), 0.0);
        }
        for (value, d) in values.iter_mut().zip(incoming) {
            *value = *value * (1.0 - alpha) + d * alpha;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingPersistence;

    #[async_trait]
    impl ModelPersistence for FailingPersistence {
        async fn get(&self) -> Result<Option<SharedModel>, StoreError> {
            Ok(None)
        }

        async fn put(&self, _model: &SharedModel) -> Result<(), StoreError> {
            Err(StoreError::Persistence("disk full".into()))
        }
    }

    #[tokio::test]
    async fn test_ema_update() {
        let store = SharedModelStore::new(DEFAULT_ALPHA).unwrap();

        let version = store
            .apply_delta(&ModelDelta::default().with_weight("w", vec![2.0, 2.0]))
            .await
            .unwrap();
        assert_eq!(version, 1);

        let model = store.snapshot().await;
        let w = &model.weights["w"];
        assert!((w[0] - 0.2).abs() < 1e-12);
        assert!(model.updated_at.is_some());

        store
            .apply_delta(&ModelDelta::default().with_weight("w", vec![2.0, 2.0, 10.0]))
            .await
            .unwrap();
        let w = store.snapshot().await.weights["w"].clone();
        assert!((w[0] - (0.2 * 0.9 + 0.2)).abs() < 1e-12);
        assert!((w[2] - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_concurrent_applies_are_serialized() {
        let store = Arc::new(SharedModelStore::new(DEFAULT_ALPHA).unwrap());

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .apply_delta(&ModelDelta::default().with_weight("w", vec![1.0]))
                        .await
                })
            })
            .collect();

        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap().unwrap());
        }
        versions.sort_unstable();
        assert_eq!(versions, (1..=50).collect::<Vec<u64>>());
        assert_eq!(store.version().await, 50);
    }

    #[tokio::test]
    async fn test_failed_apply_changes_nothing() {
        let store = SharedModelStore::new(DEFAULT_ALPHA).unwrap();
        let err = store
            .apply_delta(&ModelDelta::default().with_bias("b", vec![f64::INFINITY]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Store);

        let failing =
            SharedModelStore::with_persistence(0.5, Arc::new(FailingPersistence)).unwrap();
        assert!(failing
            .apply_delta(&ModelDelta::default().with_weight("w", vec![1.0]))
            .await
            .is_err());
        assert_eq!(failing.snapshot().await, SharedModel::default());
    }

    #[tokio::test]
    async fn test_load_restores_snapshot() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let first = SharedModelStore::with_persistence(DEFAULT_ALPHA, persistence.clone()).unwrap();
        first
            .apply_delta(&ModelDelta::default().with_weight("w", vec![1.0]))
            .await
            .unwrap();

        let second = SharedModelStore::with_persistence(DEFAULT_ALPHA, persistence).unwrap();
        assert_eq!(second.load().await.unwrap(), 1);
        assert_eq!(second.snapshot().await, first.snapshot().await);
    }

    #[test]
    fn test_invalid_alpha() {
        assert!(SharedModelStore::new(0.0).is_err());
        assert!(SharedModelStore::new(f64::NAN).is_err());
    }
}
