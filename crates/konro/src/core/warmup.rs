//! # Warmup
//!
//! Before an instance is marked ready it is driven through synthetic request
//! batches so device-bound setup (kernel compilation, memory pools, lazy
//! graph capture) happens before live traffic arrives.
//!
//! Each declared sample synthesizes its configured number of requests,
//! backed by zero-filled, random-filled, or explicitly provided placeholder
//! buffers, grouped into batches matching the instance's expected batch
//! size. The synthesized data is transient: it is dropped as soon as the
//! sample has executed.

use std::sync::Arc;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::info;

use crate::communication::{InferenceRequest, InferenceResponse, Tensor};
use crate::config::{DataType, WarmupInputSource, WarmupSampleConfig};
use crate::error::CoreError;
use crate::instance::ModelInstance;

/// The synthesized requests for one warmup sample, plus the receiver their
/// responses arrive on.
pub(crate) struct WarmupData {
    pub(crate) sample_name: String,
    /// Total number of synthesized requests; the declared count clamped to a
    /// minimum of 1.
    pub(crate) count: usize,
    pub(crate) requests: Vec<InferenceRequest>,
    responses: mpsc::UnboundedReceiver<InferenceResponse>,
}

impl WarmupData {
    /// Synthesizes the requests for `spec`.
    ///
    /// One placeholder buffer is allocated per declared input and shared
    /// across every replicated request of the sample.
    pub(crate) fn generate(
        spec: &WarmupSampleConfig,
        instance_name: &str,
    ) -> Result<Self, CoreError> {
        let count = (spec.count as usize).max(1);
        let mut template = Vec::with_capacity(spec.inputs.len());

        for (input_name, input) in &spec.inputs {
            if input.dims.iter().any(|&d| d < 0) {
                return Err(CoreError::warmup(
                    instance_name,
                    &spec.name,
                    format!("input '{input_name}' declares a dynamic dimension"),
                ));
            }
            let elements: i64 = input.dims.iter().product();
            let byte_size = elements as usize * input.data_type.element_size();

            let data = match &input.source {
                WarmupInputSource::ZeroData => Arc::new(vec![0u8; byte_size]),
                WarmupInputSource::RandomData => {
                    let mut buf = vec![0u8; byte_size];
                    // Random bytes are not valid length-prefixed string
                    // elements; leave those zeroed (empty strings).
                    if input.data_type != DataType::Bytes {
                        rand::thread_rng().fill(&mut buf[..]);
                    }
                    Arc::new(buf)
                }
                WarmupInputSource::ProvidedData(bytes) => {
                    if input.data_type != DataType::Bytes && bytes.len() != byte_size {
                        return Err(CoreError::warmup(
                            instance_name,
                            &spec.name,
                            format!(
                                "input '{input_name}' provides {} bytes, expected {byte_size}",
                                bytes.len()
                            ),
                        ));
                    }
                    Arc::new(bytes.clone())
                }
            };

            template.push(Tensor::new(
                input_name.clone(),
                input.data_type,
                input.dims.clone(),
                data,
            ));
        }

        let (response_tx, responses) = mpsc::unbounded_channel();
        let requests = (0..count)
            .map(|_| InferenceRequest::with_response_to(template.clone(), response_tx.clone()))
            .collect();

        Ok(Self {
            sample_name: spec.name.clone(),
            count,
            requests,
            responses,
        })
    }

    /// Executes the sample's requests on `instance`, in aligned batches,
    /// through the same path live requests take. Returns the first
    /// per-request failure as a warmup error.
    ///
    /// Runs on the instance's backend thread, so batches are executed
    /// directly rather than re-enqueued.
    pub(crate) fn run(mut self, instance: &ModelInstance) -> Result<(), CoreError> {
        let batch_size = instance.model().max_batch_size();
        let total = self.count;
        info!(
            instance = %instance.name(),
            sample = %self.sample_name,
            count = total,
            batch_size,
            "running warmup sample"
        );

        for batch in split_into_batches(self.requests, batch_size) {
            instance.execute(batch);
        }

        // Every request is released (or failed by its drop guard) before
        // execute returns, so exactly `total` responses are pending.
        for _ in 0..total {
            match self.responses.blocking_recv() {
                Some(response) => {
                    if let Err(err) = response.result() {
                        return Err(CoreError::warmup(
                            instance.name(),
                            &self.sample_name,
                            err.to_string(),
                        ));
                    }
                }
                None => break,
            }
        }
        Ok(())
    }
}

/// Splits `requests` into consecutive batches of at most `batch_size`,
/// preserving order. The final batch may be partial.
pub(crate) fn split_into_batches(
    mut requests: Vec<InferenceRequest>,
    batch_size: usize,
) -> Vec<Vec<InferenceRequest>> {
    let mut batches = Vec::new();
    while !requests.is_empty() {
        let take = requests.len().min(batch_size);
        let rest = requests.split_off(take);
        batches.push(requests);
        requests = rest;
    }
    batches
}
