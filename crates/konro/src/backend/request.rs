use tracing::warn;
use uuid::Uuid;

use crate::communication::{InferenceRequest, Tensor};
use crate::error::CoreError;

/// The backend-facing view of one in-flight request.
///
/// Created when a dequeued batch crosses the backend boundary. The backend
/// must release each handle exactly once; dropping a handle without releasing
/// it delivers a failure response so the requester is never left waiting.
pub struct BackendRequest {
    /// Name of the instance executing the request, for failure reporting
    instance: String,

    /// The wrapped request; taken on release so the drop guard stays quiet
    request: Option<InferenceRequest>,
}

impl BackendRequest {
    pub(crate) fn new(instance: &str, request: InferenceRequest) -> Self {
        Self {
            instance: instance.to_string(),
            request: Some(request),
        }
    }

    pub fn id(&self) -> Uuid {
        self.request.as_ref().map(|r| r.id()).unwrap_or_default()
    }

    pub fn inputs(&self) -> &[Tensor] {
        self.request.as_ref().map(|r| r.inputs()).unwrap_or(&[])
    }

    /// Releases the request with the outputs the backend produced.
    pub fn release_with_outputs(mut self, outputs: Vec<Tensor>) {
        if let Some(mut request) = self.request.take() {
            request.respond(Ok(outputs));
        }
    }

    /// Releases the request with a backend-reported failure.
    pub fn release_with_error(mut self, error: CoreError) {
        if let Some(mut request) = self.request.take() {
            request.respond(Err(error));
        }
    }
}

impl Drop for BackendRequest {
    fn drop(&mut self) {
        if let Some(mut request) = self.request.take() {
            warn!(
                instance = %self.instance,
                request = %request.id(),
                "request dropped without release; failing it"
            );
            request.respond(Err(CoreError::execution(
                &self.instance,
                "backend released the request without a response",
            )));
        }
    }
}
