use std::{num::NonZeroUsize, sync::Arc, time::Instant};

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{info, warn};
use tts_engine::{Device, TtsModel, TtsRuntime};

use crate::error::{ServiceError, ServiceResult};

/// Cache key for a model identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModelKey(String);

impl ModelKey {
    pub fn new(model_name: &str) -> Self {
        let digest = Sha256::digest(model_name.as_bytes());
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

type Slot = Arc<OnceCell<Arc<dyn TtsModel>>>;

/// Loaded models keyed by identifier. Each slot is a once-cell, so
/// concurrent requests for one model share a single load.
pub struct ModelCache {
    runtime: Arc<dyn TtsRuntime>,
    device: Device,
    slots: Mutex<LruCache<ModelKey, Slot>>,
}

impl ModelCache {
    pub fn new(runtime: Arc<dyn TtsRuntime>, device: Device, capacity: Option<usize>) -> Self {
        let slots = match capacity.and_then(NonZeroUsize::new) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self {
            runtime,
            device,
            slots: Mutex::new(slots),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn runtime_label(&self) -> &'static str {
        self.runtime.label()
    }

    pub async fn get_or_load(&self, model_name: &str) -> ServiceResult<Arc<dyn TtsModel>> {
        let key = ModelKey::new(model_name);
        let slot = self.slot(&key, model_name);

        let model = slot
            .get_or_try_init(|| async {
                let started = Instant::now();
                info!(
                    target = "tts_gateway::models",
                    model = %model_name,
                    key = key.as_str(),
                    device = %self.device,
                    "loading model"
                );
                let loaded = self
                    .runtime
                    .load(model_name, self.device)
                    .await
                    .map_err(|err| ServiceError::from_load(model_name, err))?;
                info!(
                    target = "tts_gateway::models",
                    model = %model_name,
                    capability = %loaded.profile().capability,
                    multilingual = loaded.profile().multilingual,
                    elapsed_ms = started.elapsed().as_millis(),
                    "model ready"
                );
                Ok::<_, ServiceError>(loaded)
            })
            .await;

        match model {
            Ok(model) => Ok(model.clone()),
            Err(err) => {
                warn!(target = "tts_gateway::models", model = %model_name, %err, "model load failed");
                Err(err)
            }
        }
    }

    pub fn loaded_count(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .count()
    }

    #[cfg(test)]
    pub fn is_loaded(&self, model_name: &str) -> bool {
        self.slots
            .lock()
            .peek(&ModelKey::new(model_name))
            .map(|slot| slot.initialized())
            .unwrap_or(false)
    }

    fn slot(&self, key: &ModelKey, model_name: &str) -> Slot {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(key) {
            return slot.clone();
        }
        let slot: Slot = Arc::new(OnceCell::new());
        if let Some((evicted, _)) = slots.push(key.clone(), slot.clone()) {
            if &evicted != key {
                info!(
                    target = "tts_gateway::models",
                    incoming = %model_name,
                    evicted = evicted.as_str(),
                    "resident model limit reached; evicted least recently used"
                );
            }
        }
        slot
    }
}
