use thiserror::Error;
use transport_bus::BusError;

/// Failure inside a local state-update step (optimistic apply or reconcile).
#[derive(Debug, Error)]
pub enum StepError {
    #[error("{0:#}")]
    Failed(anyhow::Error),
    #[error("panicked: {0}")]
    Panicked(String),
}

impl StepError {
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        StepError::Panicked(message)
    }
}

#[derive(Debug, Error)]
pub enum MutationError<E> {
    #[error("remote operation failed: {0}")]
    Remote(E),
    #[error("reconcile step for '{key}' failed: {source}")]
    Reconcile { key: String, source: StepError },
}

impl<E> MutationError<E> {
    pub fn remote(&self) -> Option<&E> {
        match self {
            MutationError::Remote(err) => Some(err),
            MutationError::Reconcile { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel transport: {0}")]
    Transport(#[from] BusError),
    #[error("payload encoding: {0}")]
    Encode(#[from] serde_json::Error),
}
