use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::CoreError;
use crate::instance::ModelInstance;

use super::request::InferenceRequest;

/// Continuation invoked exactly once, after the backend execution call for a
/// scheduled batch has returned control to the core.
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// One unit of work on a backend thread's queue.
///
/// Payloads are executed strictly in enqueue order across all instances
/// sharing the thread.
pub(crate) enum Payload {
    /// Run initialization and warmup for one assigned instance on the
    /// backend thread, reporting the first failure to the waiting loader.
    InitAndWarmUp {
        instance: Arc<ModelInstance>,
        done: oneshot::Sender<Result<(), CoreError>>,
    },

    /// Execute one scheduled batch on behalf of an instance.
    Execute {
        instance: Arc<ModelInstance>,
        requests: Vec<InferenceRequest>,
        on_completion: CompletionCallback,
    },

    /// Wake the thread loop so it can observe a stop request.
    Stop,
}
