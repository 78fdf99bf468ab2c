//! # Request and Response Types
//!
//! An [`InferenceRequest`] pairs a batch of input tensors with an unbounded
//! sender channel, creating a complete work item that can be handed to an
//! instance's execution thread. The sender is where the response for the
//! request is delivered once the backend releases it.
//!
//! Callers must not reuse or inspect a request after handing it to
//! [`ModelInstance::schedule`](crate::ModelInstance::schedule); ownership
//! moves with the call.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::DataType;
use crate::error::CoreError;

use super::item_stream::ResponseStream;

/// A named tensor backed by a shared raw buffer.
///
/// The buffer is reference-counted so synthesized warmup requests can share
/// one placeholder allocation across a whole replicated batch.
#[derive(Debug, Clone)]
pub struct Tensor {
    name: String,
    data_type: DataType,
    dims: Vec<i64>,
    data: Arc<Vec<u8>>,
}

impl Tensor {
    pub fn new(
        name: impl Into<String>,
        data_type: DataType,
        dims: Vec<i64>,
        data: Arc<Vec<u8>>,
    ) -> Self {
        Self {
            name: name.into(),
            data_type,
            dims,
            data,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Total size of the backing buffer in bytes.
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }
}

/// An in-flight request owned by the core.
///
/// Each request is delivered exactly one [`InferenceResponse`] on its
/// channel: either outputs produced by the backend or the error that stopped
/// it from producing them.
pub struct InferenceRequest {
    /// Unique identifier for this request
    id: Uuid,

    /// The input tensors to execute
    inputs: Vec<Tensor>,

    /// Channel for sending the response back to the requester; taken when
    /// the response is delivered so it can fire only once
    response_tx: Option<mpsc::UnboundedSender<InferenceResponse>>,
}

impl InferenceRequest {
    /// Creates a request together with the stream its response will arrive
    /// on.
    pub fn new(inputs: Vec<Tensor>) -> (Self, ResponseStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                inputs,
                response_tx: Some(tx),
            },
            ResponseStream::new(rx),
        )
    }

    /// Creates a request responding on an existing channel. Used by warmup,
    /// where every synthesized request of a sample reports to one receiver.
    pub(crate) fn with_response_to(
        inputs: Vec<Tensor>,
        response_tx: mpsc::UnboundedSender<InferenceResponse>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            inputs,
            response_tx: Some(response_tx),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }

    /// Delivers the response for this request. A second call is a no-op.
    pub(crate) fn respond(&mut self, outputs: Result<Vec<Tensor>, CoreError>) {
        if let Some(tx) = self.response_tx.take() {
            let _ = tx.send(InferenceResponse {
                id: self.id,
                outputs,
            });
        }
    }

    /// Consumes the request, delivering `error` as its response.
    pub(crate) fn into_failed(mut self, error: CoreError) {
        self.respond(Err(error));
    }
}

/// The terminal response for one request.
#[derive(Debug)]
pub struct InferenceResponse {
    id: Uuid,
    outputs: Result<Vec<Tensor>, CoreError>,
}

impl InferenceResponse {
    /// Id of the request this response answers.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn result(&self) -> Result<&[Tensor], &CoreError> {
        match &self.outputs {
            Ok(outputs) => Ok(outputs),
            Err(err) => Err(err),
        }
    }

    pub fn into_result(self) -> Result<Vec<Tensor>, CoreError> {
        self.outputs
    }
}
