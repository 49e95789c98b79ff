use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{
    module::{FailureReason, ModuleKind, ModulePayload},
    patient::PatientSnapshot,
};

/// One analysis capability. Implementations must be safe to call
/// concurrently and should stop early once `cancel` fires.
#[async_trait]
pub trait ModuleAdapter: Send + Sync {
    async fn invoke(
        &self,
        snapshot: &PatientSnapshot,
        cancel: CancellationToken,
    ) -> std::result::Result<ModulePayload, FailureReason>;
}

/// Maps each module kind to the adapter that serves it.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    adapters: HashMap<ModuleKind, Arc<dyn ModuleAdapter>>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort();
        f.debug_struct("ModuleRegistry")
            .field("registered", &kinds)
            .finish()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: ModuleKind,
        adapter: Arc<dyn ModuleAdapter>,
    ) -> &mut Self {
        self.adapters.insert(kind, adapter);
        self
    }

    pub fn with(
        mut self,
        kind: ModuleKind,
        adapter: Arc<dyn ModuleAdapter>,
    ) -> Self {
        self.register(kind, adapter);
        self
    }

    pub fn get(&self, kind: ModuleKind) -> Option<Arc<dyn ModuleAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn contains(&self, kind: ModuleKind) -> bool {
        self.adapters.contains_key(&kind)
    }
}
