//! Backend Slot
//!
//! Holds one loaded backend handle for a component. Reads are lock-free via
//! ArcSwap; loading is serialized so concurrent callers share one attempt.

use super::runtime_trait::ModelBackend;
use crate::model_state::ModelKind;
use crate::single_flight::SingleFlight;
use crate::thread_pool::InferencePool;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::{error, info};

/// What a slot currently holds.
pub enum SlotState<B: ?Sized> {
    Uninitialized,
    Ready(Arc<B>),
    /// A failed load. Stays until `close` resets the slot.
    Unavailable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} backend unavailable: {reason}")]
pub struct BackendUnavailable {
    pub kind: ModelKind,
    pub reason: String,
}

pub struct BackendSlot<B: ?Sized> {
    kind: ModelKind,
    holder: ArcSwap<SlotState<B>>,
    loading: SingleFlight<Result<Arc<B>, BackendUnavailable>>,
}

impl<B> BackendSlot<B>
where
    B: ModelBackend + ?Sized + 'static,
{
    pub fn new(kind: ModelKind) -> Self {
        Self {
            kind,
            holder: ArcSwap::from_pointee(SlotState::Uninitialized),
            loading: SingleFlight::new(),
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    /// The loaded backend, if any (lock-free).
    pub fn get(&self) -> Option<Arc<B>> {
        match &**self.holder.load() {
            SlotState::Ready(backend) => Some(backend.clone()),
            _ => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.get().is_some()
    }

    /// Reason recorded by the last failed load, until the slot is closed.
    pub fn unavailable_reason(&self) -> Option<String> {
        match &**self.holder.load() {
            SlotState::Unavailable { reason } => Some(reason.clone()),
            _ => None,
        }
    }

    /// Returns the loaded backend, running `load` on the inference pool if the
    /// slot is empty. A failed load is remembered and returned to later
    /// callers without retrying; `close` clears it.
    pub async fn ensure_loaded<F>(
        &self,
        pool: &InferencePool,
        load: F,
    ) -> Result<Arc<B>, BackendUnavailable>
    where
        F: FnOnce() -> anyhow::Result<Arc<B>> + Send + 'static,
    {
        if let Some(outcome) = self.settled() {
            return outcome;
        }

        self.loading
            .run(move || async move {
                if let Some(outcome) = self.settled() {
                    return outcome;
                }

                info!(kind = %self.kind, "Loading backend");
                let reason = match pool.run(load).await {
                    Ok(Ok(backend)) => {
                        let metadata = backend.metadata();
                        info!(
                            kind = %self.kind,
                            backend = %metadata.backend_name,
                            format = metadata.format.name(),
                            "Backend loaded"
                        );
                        self.holder.store(Arc::new(SlotState::Ready(backend.clone())));
                        return Ok(backend);
                    }
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => e.to_string(),
                };

                error!(kind = %self.kind, "Failed to load backend: {}", reason);
                self.holder.store(Arc::new(SlotState::Unavailable {
                    reason: reason.clone(),
                }));
                Err(BackendUnavailable {
                    kind: self.kind,
                    reason,
                })
            })
            .await
    }

    /// Closes the held backend and resets the slot so the next
    /// `ensure_loaded` loads again. Returns whether a backend was closed.
    pub fn close(&self) -> bool {
        let previous = self.holder.swap(Arc::new(SlotState::Uninitialized));
        match &*previous {
            SlotState::Ready(backend) => {
                info!(kind = %self.kind, "Closing backend");
                backend.close();
                true
            }
            _ => false,
        }
    }

    fn settled(&self) -> Option<Result<Arc<B>, BackendUnavailable>> {
        match &**self.holder.load() {
            SlotState::Ready(backend) => Some(Ok(backend.clone())),
            SlotState::Unavailable { reason } => Some(Err(BackendUnavailable {
                kind: self.kind,
                reason: reason.clone(),
            })),
            SlotState::Uninitialized => None,
        }
    }
}
