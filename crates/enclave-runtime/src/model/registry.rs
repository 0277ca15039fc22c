use super::backend::ModelBackend;
use super::info::ModelInfo;
use crate::error::ModelError;
use crate::types::ModelId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

struct ModelEntry {
    info: ModelInfo,
    backend: Arc<dyn ModelBackend>,
    in_flight: AtomicUsize,
}

/// Maps model ids to loaded backends. Owns model lifetime.
#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<ModelId, Arc<ModelEntry>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        id: impl Into<ModelId>,
        backend: Arc<dyn ModelBackend>,
        info: ModelInfo,
    ) -> Result<(), ModelError> {
        let id = id.into();
        if info.id != id {
            return Err(ModelError::InvalidInfo(format!(
                "info describes model {} but was registered as {id}",
                info.id
            )));
        }
        info.validate()?;

        let mut models = self.models.write();
        if models.contains_key(&id) {
            return Err(ModelError::AlreadyRegistered(id));
        }
        log::info!(
            "Registering model {id} '{}' (context window {}, vocab {})",
            info.display_name,
            info.context_window,
            info.vocab_size
        );
        models.insert(
            id,
            Arc::new(ModelEntry {
                info,
                backend,
                in_flight: AtomicUsize::new(0),
            }),
        );
        Ok(())
    }

    pub fn resolve(
        &self,
        id: impl Into<ModelId>,
    ) -> Result<(Arc<dyn ModelBackend>, ModelInfo), ModelError> {
        let id = id.into();
        let models = self.models.read();
        let entry = models.get(&id).ok_or(ModelError::UnknownModel(id))?;
        Ok((entry.backend.clone(), entry.info.clone()))
    }

    /// Resolve `id` and count one inference in flight against it until the
    /// lease is dropped.
    pub fn lease(&self, id: impl Into<ModelId>) -> Result<ModelLease, ModelError> {
        let id = id.into();
        let models = self.models.read();
        let entry = models.get(&id).ok_or(ModelError::UnknownModel(id))?;
        // Incremented under the read lock so `unload` (write lock) sees it.
        entry.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(ModelLease {
            entry: entry.clone(),
        })
    }

    /// Remove the model and release its backend.
    ///
    /// Fails while any inference holds a lease on it.
    pub fn unload(&self, id: impl Into<ModelId>) -> Result<ModelInfo, ModelError> {
        let id = id.into();
        let entry = {
            let mut models = self.models.write();
            let entry = models.get(&id).ok_or(ModelError::UnknownModel(id))?;
            let in_flight = entry.in_flight.load(Ordering::SeqCst);
            if in_flight > 0 {
                return Err(ModelError::InUse { id, in_flight });
            }
            models.remove(&id).ok_or(ModelError::UnknownModel(id))?
        };
        entry.backend.release();
        log::info!("Unloaded model {id}");
        Ok(entry.info.clone())
    }

    /// Unload every model with no inference in flight. Returns the ids that
    /// could not be unloaded.
    pub fn unload_all(&self) -> Vec<ModelId> {
        let ids: Vec<ModelId> = self.models.read().keys().copied().collect();
        ids.into_iter()
            .filter(|id| match self.unload(*id) {
                Ok(_) | Err(ModelError::UnknownModel(_)) => false,
                Err(e) => {
                    log::warn!("Model {id} left loaded during teardown: {e}");
                    true
                }
            })
            .collect()
    }

    pub fn in_flight(&self, id: impl Into<ModelId>) -> Option<usize> {
        self.models
            .read()
            .get(&id.into())
            .map(|entry| entry.in_flight.load(Ordering::SeqCst))
    }

    pub fn contains(&self, id: impl Into<ModelId>) -> bool {
        self.models.read().contains_key(&id.into())
    }

    pub fn list(&self) -> Vec<ModelInfo> {
        let mut infos: Vec<ModelInfo> = self
            .models
            .read()
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn total_in_flight(&self) -> usize {
        self.models
            .read()
            .values()
            .map(|entry| entry.in_flight.load(Ordering::SeqCst))
            .sum()
    }
}

/// Borrow of a model's backend for the duration of one inference call.
pub struct ModelLease {
    entry: Arc<ModelEntry>,
}

impl ModelLease {
    pub fn backend(&self) -> &dyn ModelBackend {
        self.entry.backend.as_ref()
    }

    pub fn info(&self) -> &ModelInfo {
        &self.entry.info
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        self.entry.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;
    use std::sync::atomic::AtomicBool;

    fn info(id: u64) -> ModelInfo {
        ModelInfo::new(id, format!("model-{id}"), 2048, 32_000)
    }

    #[test]
    fn register_then_resolve_returns_the_same_info() {
        let registry = ModelRegistry::new();
        registry
            .register(1, Arc::new(ScriptedBackend::counting()), info(1))
            .unwrap();

        let (_, resolved) = registry.resolve(1).unwrap();
        assert_eq!(resolved, info(1));
    }

    #[test]
    fn unload_then_resolve_fails() {
        let registry = ModelRegistry::new();
        registry
            .register(1, Arc::new(ScriptedBackend::counting()), info(1))
            .unwrap();

        registry.unload(1).unwrap();
        assert!(matches!(
            registry.resolve(1),
            Err(ModelError::UnknownModel(ModelId(1)))
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ModelRegistry::new();
        registry
            .register(1, Arc::new(ScriptedBackend::counting()), info(1))
            .unwrap();
        let err = registry
            .register(1, Arc::new(ScriptedBackend::counting()), info(1))
            .unwrap_err();
        assert!(matches!(err, ModelError::AlreadyRegistered(ModelId(1))));
    }

    #[test]
    fn mismatched_or_degenerate_info_is_rejected() {
        let registry = ModelRegistry::new();
        let err = registry
            .register(2, Arc::new(ScriptedBackend::counting()), info(1))
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidInfo(_)));

        let err = registry
            .register(
                3,
                Arc::new(ScriptedBackend::counting()),
                ModelInfo::new(3, "empty", 0, 10),
            )
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidInfo(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn unload_is_refused_while_leased() {
        let registry = ModelRegistry::new();
        registry
            .register(1, Arc::new(ScriptedBackend::counting()), info(1))
            .unwrap();

        let lease = registry.lease(1).unwrap();
        assert_eq!(registry.in_flight(1), Some(1));
        assert!(matches!(
            registry.unload(1),
            Err(ModelError::InUse { in_flight: 1, .. })
        ));

        drop(lease);
        assert_eq!(registry.in_flight(1), Some(0));
        assert!(registry.unload(1).is_ok());
    }

    #[test]
    fn unload_releases_the_backend() {
        struct Releasing(Arc<AtomicBool>);
        impl ModelBackend for Releasing {
            fn next_token(
                &self,
                _ctx: &mut crate::model::DecodeContext<'_>,
            ) -> anyhow::Result<crate::model::Step> {
                Ok(crate::model::Step::EndOfSequence)
            }
            fn release(&self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let released = Arc::new(AtomicBool::new(false));
        let registry = ModelRegistry::new();
        registry
            .register(7, Arc::new(Releasing(released.clone())), info(7))
            .unwrap();
        registry.unload(7).unwrap();
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn unknown_ids_fail_with_model_error() {
        let registry = ModelRegistry::new();
        assert!(matches!(registry.resolve(99), Err(ModelError::UnknownModel(_))));
        assert!(matches!(registry.lease(99), Err(ModelError::UnknownModel(_))));
        assert!(matches!(registry.unload(99), Err(ModelError::UnknownModel(_))));
    }

    #[test]
    fn list_is_sorted_by_id() {
        let registry = ModelRegistry::new();
        for id in [3, 1, 2] {
            registry
                .register(id, Arc::new(ScriptedBackend::counting()), info(id))
                .unwrap();
        }
        let ids: Vec<u64> = registry.list().iter().map(|i| i.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(registry.len(), 3);
    }
}
